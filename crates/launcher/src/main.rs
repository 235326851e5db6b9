use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ddp_core::distributed::{vars::RANK, BackendKind, InitOptions, DEFAULT_PORT};
use ddp_launcher::spawn;
use ddp_launcher::worker::{main_worker, CollectiveSmokeApp, WorkerArgs};

#[derive(Parser)]
#[command(name = "ddp-launch", about = "Bootstrap a distributed run and start the application")]
struct Cli {
    /// YAML file with `folder`, `app` and any extra run settings
    #[arg(long, default_value = "configs.yaml")]
    fname: PathBuf,

    /// Run as a single process (rank 0 of 1) regardless of the scheduler
    #[arg(long)]
    debugmode: bool,

    /// Rendezvous port used when MASTER_PORT is unset
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Collective backend: auto, tcp or nccl
    #[arg(long, default_value = "auto")]
    backend: BackendKind,

    /// Ranks to start on this node when no launcher is present
    #[arg(long, default_value_t = 1)]
    nproc_per_node: usize,

    /// Seconds to wait for every rank at the rendezvous
    #[arg(long, default_value_t = 1800)]
    timeout_secs: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut workers = Vec::new();
    if cli.nproc_per_node > 1 && !cli.debugmode && !spawn::has_launcher_identity() {
        workers = spawn::spawn_local_workers(cli.nproc_per_node, cli.port)?;
        spawn::become_rank_zero(cli.nproc_per_node, cli.port);
    }

    let mut init = InitOptions::default()
        .with_port(cli.port)
        .with_backend(cli.backend)
        .with_timeout(Duration::from_secs(cli.timeout_secs));
    let rank_hint = if cli.debugmode {
        init = init.with_manual(0, 1);
        0
    } else {
        std::env::var(RANK)
            .ok()
            .and_then(|r| r.parse().ok())
            .unwrap_or(0)
    };

    let args = WorkerArgs {
        fname: cli.fname,
        rank_hint,
        init,
    };
    let result = main_worker(&args, &CollectiveSmokeApp);
    if result.is_err() {
        spawn::kill_workers(&mut workers);
    }
    let waited = spawn::wait_for_workers(workers);
    result?;
    waited
}
