use clap::Parser;
use occ_rs::demo::{Op, ScriptTx, ScriptVm, BANK};
use occ_rs::types::{CommitStore, Scheduler as _};
use occ_rs::{capability, ledger, EngineFault, MemStore, MultiStore, Scheduler, SchedulerConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Runs a random transfer batch through the parallel scheduler.
#[derive(Parser, Debug)]
#[command(name = "occ-rs", version, about)]
struct Args {
    /// Worker threads; defaults to the smaller of CPU count and batch size
    #[arg(long)]
    workers: Option<usize>,

    /// Transactions in the batch
    #[arg(long, default_value_t = 1000)]
    txs: usize,

    /// Distinct accounts; fewer accounts means more conflicts
    #[arg(long, default_value_t = 100)]
    keys: usize,

    /// Make every n-th transaction fail after its transfer
    #[arg(long)]
    fail_every: Option<usize>,

    /// Seed for the batch generator
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Scheduler config as JSON
    #[arg(long)]
    config: Option<PathBuf>,
}

fn account(i: usize) -> String {
    format!("acct/{i:06}")
}

fn batch(args: &Args) -> Vec<ScriptTx> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let keys = args.keys.max(2);
    (0..args.txs)
        .map(|i| {
            let from = rng.gen_range(0..keys);
            let to = (from + rng.gen_range(1..keys)) % keys;
            let mut ops = vec![Op::transfer(&account(from), &account(to), rng.gen_range(1..10))];
            if args.fail_every.is_some_and(|n| n > 0 && i % n == n - 1) {
                ops.push(Op::Fail { code: 7 });
            }
            ScriptTx::new(ops)
        })
        .collect()
}

fn load_config(args: &Args) -> Result<SchedulerConfig, EngineFault> {
    let mut config = match &args.config {
        Some(path) => {
            let json = fs::read_to_string(path)
                .map_err(|e| EngineFault::Config(format!("{}: {e}", path.display())))?;
            SchedulerConfig::from_json(&json)?
        }
        None => SchedulerConfig::default(),
    };
    if args.workers.is_some() {
        config.workers = args.workers;
    }
    Ok(config)
}

fn run(args: &Args) -> Result<(), EngineFault> {
    let scheduler = Scheduler::new(load_config(args)?)?;

    let mut bank = MemStore::new();
    for i in 0..args.keys.max(2) {
        bank.write(account(i).into_bytes(), Some(b"1000".to_vec()));
    }
    let mut stores = MultiStore::new();
    stores.register(BANK, bank)?;
    stores.register(capability::STORE, MemStore::new())?;
    stores.register(ledger::STORE, MemStore::new())?;

    let txs = batch(args);
    let start = Instant::now();
    let results = scheduler.process_all(&ScriptVm::default(), &txs, &mut stores)?;
    let elapsed = start.elapsed();

    let failed = results.iter().filter(|r| !r.is_ok()).count();
    let gas: u64 = results.iter().map(|r| r.gas_used).sum();
    println!("execution took {elapsed:?}");
    println!(
        "{} transactions, {} failed, {} gas used",
        results.len(),
        failed,
        gas
    );
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "batch failed");
            ExitCode::FAILURE
        }
    }
}
