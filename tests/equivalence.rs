use occ_rs::demo::{Op, ScriptTx, ScriptVm, BANK};
use occ_rs::gas::GasConfig;
use occ_rs::types::{CommitStore, MVMemory as _, Scheduler as _, TxResult, Version, VM};
use occ_rs::version_indexed::VersionIndexedStore;
use occ_rs::{ExecError, MVMemory, MemStore, MultiStore, Scheduler, SchedulerConfig, TxContext};
use proptest::prelude::*;
use std::time::Duration;

fn genesis_bank() -> MemStore {
    ["k0", "k2"]
        .into_iter()
        .map(|k| (k.as_bytes().to_vec(), b"5".to_vec()))
        .collect()
}

fn genesis() -> MultiStore<MemStore> {
    let mut stores = MultiStore::new();
    stores.register(BANK, genesis_bank()).unwrap();
    stores
}

fn run(vm: &ScriptVm, txs: &[ScriptTx], config: SchedulerConfig) -> (Vec<TxResult>, MultiStore<MemStore>) {
    let mut stores = genesis();
    let results = Scheduler::new(config)
        .unwrap()
        .process_all(vm, txs, &mut stores)
        .unwrap();
    (results, stores)
}

/// Runs each transaction alone, in index order, straight against the bank
/// store. Successful writes are applied before the next transaction starts.
fn one_at_a_time(txs: &[ScriptTx]) -> (Vec<TxResult>, MemStore) {
    let vm = ScriptVm::default();
    let gas = GasConfig::default();
    let mut bank = genesis_bank();
    let mut results = Vec::with_capacity(txs.len());
    for tx in txs {
        let version = Version::new(0, 0);
        let gas_limit = vm.gas_limit(tx);
        let empty = MVMemory::new(BANK, 1);
        let (outcome, mut meter, mut recorded) = {
            let overlay = VersionIndexedStore::new(version, &empty, &bank);
            let mut ctx = TxContext::new(version, &gas, gas_limit, vec![(BANK, overlay)]);
            let outcome = vm.execute(tx, &mut ctx);
            let (meter, recorded) = ctx.into_parts();
            (outcome, meter, recorded)
        };
        let recorded = recorded.remove(0);
        // the parallel engine reserves gas for replaying the reads
        let replay = gas.replay_cost(&recorded.readset, &recorded.iterateset);
        let reserved = meter.consume(replay, "ValidationReplay");
        let outcome = outcome.and_then(|events| reserved.map(|()| events).map_err(ExecError::from));

        let mut result = TxResult {
            gas_wanted: gas_limit,
            gas_used: meter.consumed(),
            ..Default::default()
        };
        match outcome {
            Ok(events) => {
                result.events = events;
                for (key, value) in recorded.writeset {
                    bank.write(key, value);
                }
            }
            Err(err) => {
                result.code = err.code();
                result.log = err.to_string();
            }
        }
        results.push(result);
    }
    (results, bank)
}

fn parallel(vm: &ScriptVm, txs: &[ScriptTx], workers: usize) -> (Vec<TxResult>, MultiStore<MemStore>) {
    run(
        vm,
        txs,
        SchedulerConfig {
            workers: Some(workers),
            ..Default::default()
        },
    )
}

fn key() -> impl Strategy<Value = String> {
    (0..4u8).prop_map(|i| format!("k{i}"))
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => key().prop_map(|k| Op::get(BANK, &k)),
        3 => (key(), 0..10u8).prop_map(|(k, v)| Op::set(BANK, &k, &v.to_string())),
        3 => (key(), 0..5u64).prop_map(|(k, amount)| Op::add(BANK, &k, amount)),
        2 => key().prop_map(|k| Op::delete(BANK, &k)),
        2 => (key(), key()).prop_map(|(from, to)| Op::copy(BANK, &from, &to)),
        2 => proptest::option::of(1..3usize)
            .prop_map(|limit| Op::scan(BANK, Some("k1"), Some("k3"), limit, "count")),
        1 => Just(Op::Fail { code: 9 }),
    ]
}

fn batch() -> impl Strategy<Value = Vec<ScriptTx>> {
    proptest::collection::vec(proptest::collection::vec(op(), 1..5).prop_map(ScriptTx::new), 1..24)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn parallel_matches_one_at_a_time(txs in batch(), workers in 2..6usize) {
        let (expected_results, expected_bank) = one_at_a_time(&txs);
        let (results, stores) = parallel(&ScriptVm::default(), &txs, workers);
        prop_assert_eq!(results, expected_results);
        prop_assert_eq!(stores.get(BANK), Some(&expected_bank));
    }

    #[test]
    fn sequential_fallback_matches_one_at_a_time(txs in batch()) {
        let (expected_results, expected_bank) = one_at_a_time(&txs);
        let fallback = SchedulerConfig {
            workers: Some(2),
            max_iterations: 0,
            ..Default::default()
        };
        let (results, stores) = run(&ScriptVm::default(), &txs, fallback);
        prop_assert_eq!(results, expected_results);
        prop_assert_eq!(stores.get(BANK), Some(&expected_bank));
    }

    #[test]
    fn worker_count_and_timing_do_not_change_the_outcome(txs in batch()) {
        let (expected_results, expected_bank) = one_at_a_time(&txs);
        let vm = ScriptVm::default().with_jitter(Duration::from_micros(200));
        for workers in [1, 3, 8] {
            let (results, stores) = parallel(&vm, &txs, workers);
            prop_assert_eq!(&results, &expected_results);
            prop_assert_eq!(stores.get(BANK), Some(&expected_bank));
        }
    }
}

#[test]
fn hot_counter_is_serialized() {
    let txs: Vec<ScriptTx> = (0..64)
        .map(|i| ScriptTx::new(vec![Op::add(BANK, "hot", 1), Op::set(BANK, &format!("seen{i:02}"), "1")]))
        .collect();
    let vm = ScriptVm::default().with_jitter(Duration::from_micros(50));
    let (results, stores) = parallel(&vm, &txs, 8);
    assert!(results.iter().all(TxResult::is_ok));
    let bank = stores.get(BANK).unwrap();
    assert_eq!(bank.entries().get(b"hot".as_slice()), Some(&b"64".to_vec()));
    assert_eq!(bank.len(), 2 + 1 + 64);

    let (expected_results, expected_bank) = one_at_a_time(&txs);
    assert_eq!(results, expected_results);
    assert_eq!(bank, &expected_bank);
}
