//! CLI for replaying generated workloads.

use alloy_primitives::U256;
use clap::Parser;
use eyre::{bail, Result};
use replay_node::{
    ExecutionResult, Executor, ParallelReplayExecutor, SequentialExecutor, Workload,
    WorkloadConfig,
};
use revm::Database;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "replay-node", about = "Replay blocks of ETH transfers in parallel")]
struct Args {
    /// Worker threads for the parallel replay (0 = available parallelism).
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Number of funded accounts.
    #[arg(long, default_value_t = 1000)]
    accounts: usize,

    /// Number of transactions per run.
    #[arg(long, default_value_t = 1000)]
    transactions: usize,

    /// Transactions per block.
    #[arg(long, default_value_t = 100)]
    block_size: usize,

    /// Conflict factors to run, comma separated (0.0 = none, 1.0 = all hot).
    #[arg(long, value_delimiter = ',', default_value = "0,0.25,0.5,0.75,1")]
    conflict_factor: Vec<f64>,

    /// Random seed for reproducibility.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Chain ID for transaction signing.
    #[arg(long, default_value_t = 1)]
    chain_id: u64,

    /// Recover and check every signature.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    verify_signatures: bool,

    /// Wei credited to the coinbase at the end of each block.
    #[arg(long, default_value_t = 0)]
    block_reward: u128,

    /// Print the dependency report of each parallel run.
    #[arg(long)]
    profile: bool,

    /// Also run the sequential revm replay and compare nonces.
    #[arg(long)]
    compare: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "replay_node=info,parallel_exec=info".into()),
        )
        .init();

    let args = Args::parse();
    let threads = if args.threads == 0 {
        std::thread::available_parallelism().map_or(4, |n| n.get())
    } else {
        args.threads
    };

    info!(
        accounts = args.accounts,
        transactions = args.transactions,
        block_size = args.block_size,
        threads,
        "starting replay"
    );

    let parallel = ParallelReplayExecutor::new(threads, args.verify_signatures)
        .with_block_reward(U256::from(args.block_reward))
        .with_profile(args.profile);
    let sequential = SequentialExecutor::new(args.verify_signatures);

    for &conflict_factor in &args.conflict_factor {
        let workload = Workload::generate(WorkloadConfig {
            num_accounts: args.accounts,
            num_transactions: args.transactions,
            transactions_per_block: args.block_size,
            conflict_factor,
            seed: args.seed,
            chain_id: args.chain_id,
        });
        let name = format!("{:.0}% conflicts", conflict_factor * 100.0);

        let (mut parallel_db, result) = parallel.execute(workload.create_db(), &workload)?;
        print_result(&name, parallel.name(), &result);
        for line in &result.report {
            println!("    {line}");
        }

        if args.compare {
            let (mut sequential_db, baseline) =
                sequential.execute(workload.create_db(), &workload)?;
            print_result(&name, sequential.name(), &baseline);

            for account in &workload.accounts {
                let got = parallel_db.basic(account.address)?.map_or(0, |a| a.nonce);
                let want = sequential_db.basic(account.address)?.map_or(0, |a| a.nonce);
                if got != want {
                    bail!(
                        "nonce mismatch for {}: parallel {got}, sequential {want}",
                        account.address
                    );
                }
            }
            info!(conflict_factor, "parallel replay matches sequential nonces");
        }
    }

    Ok(())
}

fn print_result(name: &str, executor: &str, result: &ExecutionResult) {
    println!(
        "{:16} | {:10} | {:5} ok | {:5} failed | {:6} execs | {:4} aborts | {:4} conflicts \
         | {:8.2} ms | {:8.0} tx/s",
        name,
        executor,
        result.successful,
        result.failed,
        result.executions,
        result.aborts,
        result.conflicts,
        result.duration.as_secs_f64() * 1000.0,
        result.throughput()
    );
}
