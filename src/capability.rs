use crate::error::{ExecError, StoreError};
use crate::types::KvStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Keys: `index` (next capability), `owners/{index}` (JSON owner list),
// `fwd/{module}/{index}` (name) and `rev/{module}/{name}` (index).
pub const STORE: &str = "capability";

const INDEX_KEY: &[u8] = b"index";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Capability {
    pub index: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Owner {
    pub module: String,
    pub name: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("capability name cannot be empty")]
    EmptyName,
    #[error("module {module} already has a capability named {name}")]
    Taken { module: String, name: String },
    #[error("module {module} does not own capability {index}")]
    NotOwned { module: String, index: u64 },
    #[error("module {module} already owns capability {index}")]
    AlreadyOwned { module: String, index: u64 },
    #[error("capability {0} does not exist")]
    Missing(u64),
    #[error("module {module} holds no capability named {name}")]
    NotFound { module: String, name: String },
    #[error("corrupt registry entry: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<CapabilityError> for ExecError {
    fn from(err: CapabilityError) -> Self {
        let code = match &err {
            CapabilityError::Store(store) => return ExecError::Store(store.clone()),
            CapabilityError::EmptyName => 21,
            CapabilityError::Taken { .. } => 22,
            CapabilityError::NotOwned { .. } => 23,
            CapabilityError::AlreadyOwned { .. } => 24,
            CapabilityError::Missing(_) => 25,
            CapabilityError::NotFound { .. } => 26,
            CapabilityError::Corrupt(_) => crate::types::CODE_INTERNAL,
        };
        ExecError::app(code, err.to_string())
    }
}

fn owners_key(index: u64) -> Vec<u8> {
    format!("owners/{index:020}").into_bytes()
}

fn fwd_key(module: &str, index: u64) -> Vec<u8> {
    format!("fwd/{module}/{index:020}").into_bytes()
}

fn rev_key(module: &str, name: &str) -> Vec<u8> {
    format!("rev/{module}/{name}").into_bytes()
}

fn decode_u64(raw: &[u8]) -> Result<u64, CapabilityError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CapabilityError::Corrupt(format!("bad index {raw:?}")))
}

#[derive(Clone, Debug)]
pub struct ScopedCapabilities {
    module: String,
}

impl ScopedCapabilities {
    pub fn new(module: impl Into<String>) -> Self {
        ScopedCapabilities {
            module: module.into(),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn new_capability<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        name: &str,
    ) -> Result<Capability, CapabilityError> {
        if name.is_empty() {
            return Err(CapabilityError::EmptyName);
        }
        if store.has(&rev_key(&self.module, name))? {
            return Err(CapabilityError::Taken {
                module: self.module.clone(),
                name: name.to_string(),
            });
        }
        let index = match store.get(INDEX_KEY)? {
            Some(raw) => decode_u64(&raw)?,
            None => 1,
        };
        store.set(INDEX_KEY, (index + 1).to_string().into_bytes())?;

        let owner = Owner {
            module: self.module.clone(),
            name: name.to_string(),
        };
        write_owners(store, index, &[owner])?;
        self.bind(store, index, name)?;
        Ok(Capability { index })
    }

    pub fn get_capability<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        name: &str,
    ) -> Result<Option<Capability>, CapabilityError> {
        if name.is_empty() {
            return Err(CapabilityError::EmptyName);
        }
        match store.get(&rev_key(&self.module, name))? {
            Some(raw) => Ok(Some(Capability {
                index: decode_u64(&raw)?,
            })),
            None => Ok(None),
        }
    }

    pub fn authenticate_capability<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        cap: Capability,
        name: &str,
    ) -> Result<bool, CapabilityError> {
        Ok(store.get(&fwd_key(&self.module, cap.index))?.as_deref() == Some(name.as_bytes()))
    }

    pub fn claim_capability<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        cap: Capability,
        name: &str,
    ) -> Result<(), CapabilityError> {
        if name.is_empty() {
            return Err(CapabilityError::EmptyName);
        }
        let mut owners = read_owners(store, cap.index)?;
        if owners.is_empty() {
            return Err(CapabilityError::Missing(cap.index));
        }
        if owners.iter().any(|o| o.module == self.module) {
            return Err(CapabilityError::AlreadyOwned {
                module: self.module.clone(),
                index: cap.index,
            });
        }
        if store.has(&rev_key(&self.module, name))? {
            return Err(CapabilityError::Taken {
                module: self.module.clone(),
                name: name.to_string(),
            });
        }
        owners.push(Owner {
            module: self.module.clone(),
            name: name.to_string(),
        });
        write_owners(store, cap.index, &owners)?;
        self.bind(store, cap.index, name)
    }

    /// Drops this module's ownership of `cap`. The owner list is deleted with
    /// its last owner.
    pub fn release_capability<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        cap: Capability,
    ) -> Result<(), CapabilityError> {
        let fwd = fwd_key(&self.module, cap.index);
        let Some(raw_name) = store.get(&fwd)? else {
            return Err(CapabilityError::NotOwned {
                module: self.module.clone(),
                index: cap.index,
            });
        };
        let name = String::from_utf8(raw_name)
            .map_err(|_| CapabilityError::Corrupt(format!("bad name for {}", cap.index)))?;
        store.delete(&fwd)?;
        store.delete(&rev_key(&self.module, &name))?;

        let mut owners = read_owners(store, cap.index)?;
        owners.retain(|o| !(o.module == self.module && o.name == name));
        if owners.is_empty() {
            store.delete(&owners_key(cap.index))?;
        } else {
            write_owners(store, cap.index, &owners)?;
        }
        Ok(())
    }

    fn bind<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        index: u64,
        name: &str,
    ) -> Result<(), CapabilityError> {
        store.set(&fwd_key(&self.module, index), name.as_bytes().to_vec())?;
        store.set(&rev_key(&self.module, name), index.to_string().into_bytes())?;
        Ok(())
    }

    pub fn lookup_modules<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        name: &str,
    ) -> Result<(Vec<String>, Capability), CapabilityError> {
        let cap = self
            .get_capability(store, name)?
            .ok_or_else(|| CapabilityError::NotFound {
                module: self.module.clone(),
                name: name.to_string(),
            })?;
        let owners = read_owners(store, cap.index)?;
        if owners.is_empty() {
            return Err(CapabilityError::Missing(cap.index));
        }
        Ok((owners.into_iter().map(|o| o.module).collect(), cap))
    }
}

/// Owners of `index`, sorted; empty when the capability does not exist.
pub fn get_owners<K: KvStore + ?Sized>(
    store: &mut K,
    index: u64,
) -> Result<Vec<Owner>, CapabilityError> {
    read_owners(store, index)
}

fn read_owners<K: KvStore + ?Sized>(store: &mut K, index: u64) -> Result<Vec<Owner>, CapabilityError> {
    match store.get(&owners_key(index))? {
        Some(raw) => {
            serde_json::from_slice(&raw).map_err(|e| CapabilityError::Corrupt(e.to_string()))
        }
        None => Ok(Vec::new()),
    }
}

fn write_owners<K: KvStore + ?Sized>(
    store: &mut K,
    index: u64,
    owners: &[Owner],
) -> Result<(), CapabilityError> {
    let mut sorted = owners.to_vec();
    sorted.sort();
    let raw = serde_json::to_vec(&sorted).map_err(|e| CapabilityError::Corrupt(e.to_string()))?;
    store.set(&owners_key(index), raw)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    #[test]
    fn new_capability_allocates_sequential_indices() {
        let mut store = MemStore::new();
        let ibc = ScopedCapabilities::new("ibc");
        let a = ibc.new_capability(&mut store, "ports/transfer").unwrap();
        let b = ibc.new_capability(&mut store, "ports/ica").unwrap();
        assert_eq!((a.index, b.index), (1, 2));
        assert_eq!(ibc.get_capability(&mut store, "ports/ica").unwrap(), Some(b));
        assert!(ibc.authenticate_capability(&mut store, a, "ports/transfer").unwrap());
        assert!(!ibc.authenticate_capability(&mut store, a, "ports/ica").unwrap());
    }

    #[test]
    fn names_are_unique_per_module() {
        let mut store = MemStore::new();
        let ibc = ScopedCapabilities::new("ibc");
        ibc.new_capability(&mut store, "port").unwrap();
        assert!(matches!(
            ibc.new_capability(&mut store, "port"),
            Err(CapabilityError::Taken { .. })
        ));
        assert_eq!(
            ibc.new_capability(&mut store, ""),
            Err(CapabilityError::EmptyName)
        );
        // another module may reuse the name
        ScopedCapabilities::new("transfer")
            .new_capability(&mut store, "port")
            .unwrap();
    }

    #[test]
    fn claim_and_lookup() {
        let mut store = MemStore::new();
        let ibc = ScopedCapabilities::new("ibc");
        let transfer = ScopedCapabilities::new("transfer");
        let cap = ibc.new_capability(&mut store, "port").unwrap();
        transfer.claim_capability(&mut store, cap, "bound-port").unwrap();

        let (modules, found) = ibc.lookup_modules(&mut store, "port").unwrap();
        assert_eq!(modules, vec!["ibc".to_string(), "transfer".to_string()]);
        assert_eq!(found, cap);
        assert!(matches!(
            transfer.lookup_modules(&mut store, "port"),
            Err(CapabilityError::NotFound { .. })
        ));
        assert!(matches!(
            transfer.claim_capability(&mut store, cap, "again"),
            Err(CapabilityError::AlreadyOwned { .. })
        ));
        assert_eq!(
            transfer.claim_capability(&mut store, Capability { index: 99 }, "x"),
            Err(CapabilityError::Missing(99))
        );
    }

    #[test]
    fn release_removes_all_mappings_with_last_owner() {
        let mut store = MemStore::new();
        let ibc = ScopedCapabilities::new("ibc");
        let transfer = ScopedCapabilities::new("transfer");
        let cap = ibc.new_capability(&mut store, "port").unwrap();
        transfer.claim_capability(&mut store, cap, "port").unwrap();

        ibc.release_capability(&mut store, cap).unwrap();
        assert_eq!(ibc.get_capability(&mut store, "port").unwrap(), None);
        assert_eq!(get_owners(&mut store, cap.index).unwrap().len(), 1);

        transfer.release_capability(&mut store, cap).unwrap();
        assert!(get_owners(&mut store, cap.index).unwrap().is_empty());
        assert_eq!(store.len(), 1, "only the index counter remains");

        assert!(matches!(
            transfer.release_capability(&mut store, cap),
            Err(CapabilityError::NotOwned { .. })
        ));
    }

    #[test]
    fn store_errors_keep_their_meaning() {
        let err: ExecError = CapabilityError::Store(StoreError::Estimate { blocking: 2 }).into();
        assert_eq!(err, ExecError::Store(StoreError::Estimate { blocking: 2 }));
        let err: ExecError = CapabilityError::Missing(3).into();
        assert_eq!(err.code(), 25);
    }
}
