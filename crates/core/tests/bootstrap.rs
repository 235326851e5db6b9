//! End-to-end tests for `init_distributed_with`.
//!
//! Each simulated process gets its own environment snapshot and its own
//! group registry, so several ranks can bootstrap inside one test process.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use candle_core::Device;
use ddp_core::distributed::{
    all_reduce_sum, init_distributed_with, vars::*, BackendKind, DeviceSelector,
    DistributedError, GroupRegistry, IdentitySource, InitOptions, LaunchEnv, NodeListResolver,
};
use ddp_core::testing::free_port;

/// Node list resolver that must never be consulted.
struct NoScheduler;

impl NodeListResolver for NoScheduler {
    fn hostnames(&self, nodelist: &str) -> io::Result<Vec<String>> {
        panic!("unexpected node list lookup for {nodelist}");
    }
}

/// Node list resolver that always fails.
struct BrokenScontrol;

impl NodeListResolver for BrokenScontrol {
    fn hostnames(&self, _: &str) -> io::Result<Vec<String>> {
        Err(io::Error::new(io::ErrorKind::NotFound, "scontrol: not found"))
    }
}

#[derive(Default)]
struct CpuOnly;

impl DeviceSelector for CpuOnly {
    fn is_available(&self) -> bool {
        false
    }

    fn select(&self, ordinal: usize) -> Result<Device, String> {
        panic!("no accelerator to select ({ordinal})");
    }
}

/// Accelerator that refuses every ordinal.
struct BrokenGpu {
    calls: AtomicUsize,
}

impl DeviceSelector for BrokenGpu {
    fn is_available(&self) -> bool {
        true
    }

    fn device_count(&self) -> Option<usize> {
        Some(1)
    }

    fn select(&self, ordinal: usize) -> Result<Device, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(format!("invalid device ordinal {ordinal}"))
    }
}

fn opts() -> InitOptions {
    InitOptions::default()
        .with_backend(BackendKind::Tcp)
        .with_timeout(Duration::from_secs(30))
}

fn launcher_env(rank: usize, world_size: usize, port: u16) -> LaunchEnv {
    LaunchEnv::from_pairs([
        (RANK, rank.to_string()),
        (WORLD_SIZE, world_size.to_string()),
        (LOCAL_RANK, rank.to_string()),
        (MASTER_ADDR, LOOPBACK.to_string()),
        (MASTER_PORT, port.to_string()),
    ])
}

#[test]
fn no_signals_means_single_process() {
    let mut env = LaunchEnv::default();
    let registry = GroupRegistry::new();
    let ctx = init_distributed_with(&mut env, &opts(), &registry, &NoScheduler, &CpuOnly).unwrap();

    assert_eq!(ctx.as_tuple(), (1, 0, 0));
    assert_eq!(ctx.source(), IdentitySource::SingleProcess);
    assert!(!ctx.communicator().is_active());
    assert!(!registry.is_initialized());
    assert!(env.changes().is_empty());
}

#[test]
fn launcher_beats_scheduler_and_manual() {
    let mut env = LaunchEnv::from_pairs([
        (RANK, "0"),
        (WORLD_SIZE, "1"),
        (SLURM_PROCID, "9"),
        (SLURM_NTASKS, "16"),
        (SLURM_NODELIST, "node[01-16]"),
    ]);
    let registry = GroupRegistry::new();
    let opts = opts().with_manual(0, 4);
    let ctx = init_distributed_with(&mut env, &opts, &registry, &NoScheduler, &CpuOnly).unwrap();

    assert_eq!(ctx.source(), IdentitySource::Launcher);
    assert_eq!(ctx.as_tuple(), (1, 0, 0));
    // World of one: no group and no barrier.
    assert!(!registry.is_initialized());
    assert_eq!(env.get(MASTER_ADDR), Some(LOOPBACK));
}

#[test]
fn scheduler_lookup_failure_falls_back_to_hostname() {
    let mut env = LaunchEnv::from_pairs([
        (SLURM_PROCID, "0"),
        (SLURM_NTASKS, "1"),
        (SLURM_NODELIST, "gpu[001-004]"),
        (HOSTNAME, "login-7"),
    ]);
    let registry = GroupRegistry::new();
    let ctx =
        init_distributed_with(&mut env, &opts(), &registry, &BrokenScontrol, &CpuOnly).unwrap();

    assert_eq!(ctx.source(), IdentitySource::Scheduler);
    assert_eq!(ctx.endpoint().address, "login-7");
    assert_eq!(env.get(MASTER_ADDR), Some("login-7"));
    assert_eq!(env.get(MASTER_PORT), Some("29500"));
}

#[test]
fn explicit_endpoint_is_not_overwritten() {
    let mut env = LaunchEnv::from_pairs([(MASTER_ADDR, "10.1.2.3"), (MASTER_PORT, "31000")]);
    let registry = GroupRegistry::new();
    let opts = opts().with_manual(0, 1).with_port(12345);
    let ctx = init_distributed_with(&mut env, &opts, &registry, &NoScheduler, &CpuOnly).unwrap();

    assert_eq!(ctx.endpoint().address, "10.1.2.3");
    assert_eq!(ctx.endpoint().port, 31000);
    assert!(env.changes().is_empty());
}

#[test]
fn device_failure_is_fatal_and_creates_no_group() {
    let mut env = LaunchEnv::from_pairs([
        (RANK, "0"),
        (WORLD_SIZE, "2"),
        (LOCAL_RANK, "3"),
        (CUDA_VISIBLE_DEVICES, "0"),
    ]);
    let registry = GroupRegistry::new();
    let gpu = BrokenGpu {
        calls: AtomicUsize::new(0),
    };
    let err = init_distributed_with(&mut env, &opts(), &registry, &NoScheduler, &gpu).unwrap_err();

    match err {
        DistributedError::DeviceSelection {
            ordinal,
            visible_devices,
            ..
        } => {
            assert_eq!(ordinal, 3);
            assert_eq!(visible_devices.as_deref(), Some("0"));
        }
        other => panic!("expected DeviceSelection, got {other:?}"),
    }
    assert_eq!(gpu.calls.load(Ordering::SeqCst), 1);
    assert!(!registry.is_initialized());
}

#[test]
fn scratch_dir_is_remapped_when_present() {
    let scratch = tempfile::tempdir().unwrap();
    std::fs::create_dir(scratch.path().join("4242")).unwrap();

    let mut env = LaunchEnv::from_pairs([(SLURM_JOB_ID, "4242"), (TMPDIR, "/tmp")]);
    let registry = GroupRegistry::new();
    let opts = opts().with_scratch_root(scratch.path());
    init_distributed_with(&mut env, &opts, &registry, &NoScheduler, &CpuOnly).unwrap();

    let expected = scratch.path().join("4242");
    assert_eq!(env.get(TMPDIR), expected.to_str());

    // Missing job directory leaves TMPDIR alone.
    let mut env = LaunchEnv::from_pairs([(SLURM_JOB_ID, "777"), (TMPDIR, "/tmp")]);
    init_distributed_with(&mut env, &opts, &registry, &NoScheduler, &CpuOnly).unwrap();
    assert_eq!(env.get(TMPDIR), Some("/tmp"));
}

#[test]
fn two_ranks_form_a_group_once() {
    let port = free_port();
    let world_size = 2;

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                scope.spawn(move || {
                    let registry = GroupRegistry::new();
                    let mut env = launcher_env(rank, world_size, port);
                    let first =
                        init_distributed_with(&mut env, &opts(), &registry, &NoScheduler, &CpuOnly)
                            .unwrap();
                    assert!(registry.is_initialized());

                    let x = candle_core::Tensor::full(rank as f32 + 1.0, (2,), first.device())
                        .unwrap();
                    let sum = all_reduce_sum(first.communicator(), &x)
                        .unwrap()
                        .to_vec1::<f32>()
                        .unwrap();

                    // Second call: served from the registry, no rendezvous.
                    let mut env = launcher_env(rank, world_size, port);
                    let second =
                        init_distributed_with(&mut env, &opts(), &registry, &NoScheduler, &CpuOnly)
                            .unwrap();
                    assert!(env.changes().is_empty());
                    (first.as_tuple(), second.as_tuple(), sum)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (rank, (first, second, sum)) in results.into_iter().enumerate() {
        assert_eq!(first, (world_size, rank, rank));
        assert_eq!(second, first);
        assert_eq!(sum, vec![3.0, 3.0]);
    }
}

#[test]
fn world_size_disagreement_fails_both_sides() {
    let port = free_port();
    let short = Duration::from_secs(10);

    let (root, peer) = std::thread::scope(|scope| {
        let root = scope.spawn(move || {
            let registry = GroupRegistry::new();
            let mut env = launcher_env(0, 2, port);
            init_distributed_with(&mut env, &opts().with_timeout(short), &registry, &NoScheduler, &CpuOnly)
                .map(|ctx| ctx.as_tuple())
        });
        let peer = scope.spawn(move || {
            let registry = GroupRegistry::new();
            let mut env = launcher_env(1, 3, port);
            init_distributed_with(&mut env, &opts().with_timeout(short), &registry, &NoScheduler, &CpuOnly)
                .map(|ctx| ctx.as_tuple())
        });
        (root.join().unwrap(), peer.join().unwrap())
    });

    assert!(matches!(root, Err(DistributedError::Rendezvous { .. })));
    assert!(matches!(peer, Err(DistributedError::Rendezvous { .. })));
}
