//! Single-node process spawning.
//!
//! With `--nproc-per-node N` and no launcher environment, the invoked process
//! becomes rank 0 and re-executes the current binary N-1 times with the same
//! arguments, one child per remaining rank.
//!
//! | Variable      | Value        |
//! |---------------|--------------|
//! | `RANK`        | 0..N-1       |
//! | `WORLD_SIZE`  | N            |
//! | `LOCAL_RANK`  | same as rank |
//! | `MASTER_ADDR` | 127.0.0.1    |
//! | `MASTER_PORT` | `--port`     |

use std::ffi::OsString;
use std::io;
use std::process::{Child, Command};

use ddp_core::distributed::vars::{LOCAL_RANK, LOOPBACK, MASTER_ADDR, MASTER_PORT, RANK, WORLD_SIZE};

/// Environment for one rank of a single-node job.
pub fn rank_env(rank: usize, world_size: usize, master_port: u16) -> Vec<(&'static str, String)> {
    vec![
        (RANK, rank.to_string()),
        (WORLD_SIZE, world_size.to_string()),
        (LOCAL_RANK, rank.to_string()),
        (MASTER_ADDR, LOOPBACK.to_string()),
        (MASTER_PORT, master_port.to_string()),
    ]
}

/// Whether a launcher already assigned this process a rank.
pub fn has_launcher_identity() -> bool {
    std::env::var_os(RANK).is_some() && std::env::var_os(WORLD_SIZE).is_some()
}

/// Spawn ranks `1..world_size` as child processes.
///
/// # Panics
/// Panics if `world_size < 2`.
pub fn spawn_local_workers(world_size: usize, master_port: u16) -> anyhow::Result<Vec<Child>> {
    assert!(world_size > 1, "no workers to spawn for world_size=1");

    let current_exe = std::env::current_exe()
        .map_err(|e| anyhow::anyhow!("failed to determine current executable: {e}"))?;
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();

    spawn_ranks(world_size, |rank| {
        tracing::info!(rank, world_size, master_port, "spawning worker");
        Command::new(&current_exe)
            .args(&args)
            .envs(rank_env(rank, world_size, master_port))
            .spawn()
    })
}

/// Run `spawn_one` for ranks `1..world_size`. If any spawn fails, the
/// children started so far are killed and reaped before returning.
fn spawn_ranks<F>(world_size: usize, mut spawn_one: F) -> anyhow::Result<Vec<Child>>
where
    F: FnMut(usize) -> io::Result<Child>,
{
    let mut workers = Vec::with_capacity(world_size.saturating_sub(1));
    for rank in 1..world_size {
        match spawn_one(rank) {
            Ok(child) => workers.push(child),
            Err(e) => {
                kill_workers(&mut workers);
                for child in &mut workers {
                    let _ = child.wait();
                }
                anyhow::bail!("failed to spawn worker rank {rank}: {e}");
            }
        }
    }
    Ok(workers)
}

/// Kill every worker that is still running.
///
/// Used when rank 0 fails: the others would otherwise wait at the rendezvous
/// until it times out.
pub fn kill_workers(workers: &mut [Child]) {
    for (i, child) in workers.iter_mut().enumerate() {
        let rank = i + 1;
        if let Ok(Some(_)) = child.try_wait() {
            continue;
        }
        match child.kill() {
            Ok(()) => tracing::warn!(rank, pid = child.id(), "killed worker"),
            Err(e) => tracing::debug!(rank, error = %e, "worker already gone"),
        }
    }
}

/// Give the current process the rank 0 environment.
///
/// Must run before any other thread is started.
pub fn become_rank_zero(world_size: usize, master_port: u16) {
    for (key, value) in rank_env(0, world_size, master_port) {
        std::env::set_var(key, value);
    }
}

/// Wait for every worker and fail if any of them did.
pub fn wait_for_workers(mut workers: Vec<Child>) -> anyhow::Result<()> {
    let mut failed = Vec::new();
    for (i, child) in workers.iter_mut().enumerate() {
        let rank = i + 1;
        match child.wait() {
            Ok(status) if status.success() => {
                tracing::debug!(rank, "worker exited cleanly");
            }
            Ok(status) => {
                tracing::error!(rank, ?status, "worker exited with non-zero status");
                failed.push(rank);
            }
            Err(e) => {
                tracing::error!(rank, error = %e, "error waiting for worker");
                failed.push(rank);
            }
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("workers failed: ranks {failed:?}")
    }
}
