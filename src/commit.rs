use crate::error::EngineFault;
use crate::store::MultiStore;
use crate::types::{CommitStore, MVMemory};
use tracing::info;

/// Flushes every versioned store into its durable store, once each, in
/// registration order. Every store is checked before the first write so a
/// fault leaves all durable stores untouched.
pub fn commit_all<M: MVMemory, S: CommitStore>(
    mvs: &[M],
    multistore: &mut MultiStore<S>,
) -> Result<usize, EngineFault> {
    if mvs.len() != multistore.len() {
        return Err(EngineFault::Config(format!(
            "{} versioned stores for {} registered stores",
            mvs.len(),
            multistore.len()
        )));
    }
    for (mv, name) in mvs.iter().zip(multistore.names()) {
        if mv.name() != name {
            return Err(EngineFault::UnknownStore(mv.name().to_string()));
        }
        if let Some(index) = mv.first_estimate() {
            return Err(EngineFault::EstimateAtCommit {
                store: name.to_string(),
                index,
            });
        }
    }

    let mut total = 0;
    for (mv, (name, store)) in mvs.iter().zip(multistore.iter_mut()) {
        let written = mv.write_latest_to_store(store)?;
        info!(store = name, written, "committed");
        total += written;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvmemory::MVMemory;
    use crate::store::MemStore;
    use crate::types::{MVMemory as _, ParentStore, Version};

    fn setup() -> (Vec<MVMemory>, MultiStore<MemStore>) {
        let mut multistore = MultiStore::new();
        multistore.register("bank", MemStore::new()).unwrap();
        multistore.register("staking", MemStore::new()).unwrap();
        let mvs = vec![MVMemory::new("bank", 2), MVMemory::new("staking", 2)];
        (mvs, multistore)
    }

    #[test]
    fn commits_every_store() {
        let (mvs, mut multistore) = setup();
        mvs[0].set(b"a".to_vec(), 0, 0, Some(b"1".to_vec()));
        mvs[1].set(b"v".to_vec(), 1, 0, Some(b"2".to_vec()));

        assert_eq!(commit_all(&mvs, &mut multistore).unwrap(), 2);
        let bank = multistore.get("bank").unwrap();
        assert_eq!(ParentStore::get(bank, b"a"), Some(b"1".to_vec()));
        let staking = multistore.get("staking").unwrap();
        assert_eq!(ParentStore::get(staking, b"v"), Some(b"2".to_vec()));
    }

    #[test]
    fn estimate_in_any_store_blocks_all_writes() {
        let (mvs, mut multistore) = setup();
        mvs[0].set(b"a".to_vec(), 0, 0, Some(b"1".to_vec()));
        mvs[1].set_estimated_writeset(
            Version::new(1, 0),
            [(b"v".to_vec(), Some(b"2".to_vec()))].into_iter().collect(),
        );

        let err = commit_all(&mvs, &mut multistore).unwrap_err();
        assert!(matches!(err, EngineFault::EstimateAtCommit { index: 1, .. }));
        assert!(multistore.get("bank").unwrap().is_empty());
    }

    #[test]
    fn store_order_must_match_registration() {
        let (mut mvs, mut multistore) = setup();
        mvs.swap(0, 1);
        assert!(matches!(
            commit_all(&mvs, &mut multistore),
            Err(EngineFault::UnknownStore(_))
        ));
    }
}
