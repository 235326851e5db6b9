//! Distributed process bootstrap and collectives.
//!
//! This module provides:
//! - [`init_distributed`] - Rank discovery, rendezvous and group creation
//! - [`ProcessGroup`] - Process group management (ranks, world size)
//! - [`DeviceCommunicator`] - Collective operations (all_reduce, all_gather, etc.)
//! - [`AllGather`], [`AllReduceSum`], [`AllReduce`] - Collectives with gradients
//!
//! # Architecture
//!
//! - Single process: every collective is the identity ([`LocalCommunicator`])
//! - Multi process, CPU or no NCCL: host-staged TCP star ([`TcpCommunicator`])
//! - Multi process, CUDA with the `cuda` feature: NCCL
//!
//! The choice is made once in [`init_distributed`] and carried by the
//! [`CommContext`] inside the returned [`DistributedContext`].
//!
//! # Usage
//!
//! ```ignore
//! use ddp_core::distributed::{all_reduce_mean, init_distributed, InitOptions};
//!
//! let dist = init_distributed(&InitOptions::default())?;
//! let loss = all_reduce_mean(dist.communicator(), &local_loss)?;
//! ```

mod autograd;
mod communicator;
mod device;
mod env;
mod error;
mod launcher;
#[cfg(feature = "cuda")]
mod nccl;
mod process_group;
mod tcp;

pub use autograd::{
    all_gather, all_reduce_mean, all_reduce_sum, AllGather, AllReduce, AllReduceSum, Collective,
};
pub use communicator::{
    create_communicator, BackendKind, CommContext, DeviceCommunicator, LocalCommunicator,
    ReduceOp,
};
pub use device::{select_local_device, CandleDeviceSelector, DeviceSelector};
pub use env::LaunchEnv;
pub use error::{DistributedError, Result};
pub use launcher::{
    init_distributed, init_distributed_with, DistributedContext, IdentitySource, InitOptions,
    LaunchContext, NodeListResolver, RendezvousEndpoint, ScontrolResolver, DEFAULT_PORT,
    DEFAULT_RENDEZVOUS_TIMEOUT, DEFAULT_SCRATCH_ROOT,
};
#[cfg(feature = "cuda")]
pub use nccl::{is_nccl_available, NcclDeviceCommunicator, NcclLibrary};
pub use process_group::{GroupRegistry, LocalProcessGroup, ProcessGroup, ProcessIdentity};
pub use tcp::TcpCommunicator;

/// Environment variable names read and written during bootstrap.
pub mod vars {
    pub use super::env::{
        CUDA_VISIBLE_DEVICES, HOSTNAME, LOCAL_RANK, LOOPBACK, MASTER_ADDR, MASTER_PORT, RANK,
        SLURM_JOB_ID, SLURM_LOCALID, SLURM_NODELIST, SLURM_NTASKS, SLURM_PROCID, TMPDIR,
        WORLD_SIZE,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_process_group_defaults() {
        let pg = LocalProcessGroup::new();
        assert_eq!(pg.rank(), 0);
        assert_eq!(pg.world_size(), 1);
        assert_eq!(pg.local_rank(), 0);
    }

    #[test]
    fn default_options() {
        let opts = InitOptions::default();
        assert_eq!(opts.preferred_port, DEFAULT_PORT);
        assert_eq!(opts.backend, BackendKind::Auto);
        assert_eq!(opts.manual, None);
        assert_eq!(opts.rendezvous_timeout, DEFAULT_RENDEZVOUS_TIMEOUT);
        assert_eq!(opts.scratch_root.to_str(), Some(DEFAULT_SCRATCH_ROOT));
    }

    #[test]
    fn options_builder() {
        let opts = InitOptions::default()
            .with_port(31000)
            .with_manual(1, 2)
            .with_backend(BackendKind::Tcp)
            .with_scratch_root("/tmp/scratch");
        assert_eq!(opts.preferred_port, 31000);
        assert_eq!(opts.manual, Some((1, 2)));
        assert_eq!(opts.backend, BackendKind::Tcp);
        assert_eq!(opts.scratch_root.to_str(), Some("/tmp/scratch"));
    }
}
