//! Process bootstrap: rank discovery, rendezvous and group creation.
//!
//! # Environment Variables
//!
//! Identity sources, in strict precedence order:
//! - `RANK`, `WORLD_SIZE`, `LOCAL_RANK`: set by `torchrun`-style launchers
//! - `SLURM_PROCID`, `SLURM_NTASKS`, `SLURM_LOCALID`: set by `srun`
//! - an explicit `(rank, world_size)` passed in [`InitOptions`]
//! - none of the above: single process `(1, 0, 0)`
//!
//! The rendezvous endpoint comes from `MASTER_ADDR` / `MASTER_PORT` when set.
//! Under SLURM without `MASTER_ADDR`, the first host of `SLURM_NODELIST` is
//! used. Both are written back (set-if-absent) before the group is created.
//!
//! # Usage
//!
//! ```ignore
//! use ddp_core::distributed::{init_distributed, InitOptions};
//!
//! let dist = init_distributed(&InitOptions::default())?;
//! let (world_size, rank, local_rank) = dist.as_tuple();
//! ```

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use candle_core::Device;

use super::communicator::{create_communicator, BackendKind, CommContext, LocalCommunicator};
use super::device::{select_local_device, CandleDeviceSelector, DeviceSelector};
use super::env::{
    LaunchEnv, HOSTNAME, LOCAL_RANK, LOOPBACK, MASTER_ADDR, MASTER_PORT, RANK, SLURM_JOB_ID,
    SLURM_LOCALID, SLURM_NODELIST, SLURM_NTASKS, SLURM_PROCID, TMPDIR, WORLD_SIZE,
};
use super::error::Result;
use super::process_group::{GroupRegistry, LocalProcessGroup, ProcessIdentity};

pub const DEFAULT_PORT: u16 = 29500;
pub const DEFAULT_SCRATCH_ROOT: &str = "/scratch/slurm_tmpdir";
pub const DEFAULT_RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(1800);

/// Address and port every rank meets at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RendezvousEndpoint {
    pub address: String,
    pub port: u16,
}

impl RendezvousEndpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    pub fn loopback(port: u16) -> Self {
        Self::new(LOOPBACK, port)
    }

    /// `address:port`, suitable for `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for RendezvousEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Where the identity of this process came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    Launcher,
    Scheduler,
    Manual,
    SingleProcess,
}

/// Expands a scheduler node list expression into host names.
pub trait NodeListResolver: Send + Sync {
    fn hostnames(&self, nodelist: &str) -> io::Result<Vec<String>>;
}

/// Resolves node lists with `scontrol show hostnames`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScontrolResolver;

impl NodeListResolver for ScontrolResolver {
    fn hostnames(&self, nodelist: &str) -> io::Result<Vec<String>> {
        let output = Command::new("scontrol")
            .args(["show", "hostnames", nodelist])
            .output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "scontrol exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .map(str::to_string)
            .collect())
    }
}

/// Identity and endpoint of this process, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchContext {
    pub identity: ProcessIdentity,
    pub endpoint: RendezvousEndpoint,
    pub source: IdentitySource,
}

impl LaunchContext {
    /// Resolve identity and endpoint from a snapshot of the environment.
    ///
    /// Launcher variables beat scheduler variables, which beat `manual`,
    /// which beats the single-process fallback. `MASTER_PORT` beats
    /// `preferred_port`; an explicit `MASTER_ADDR` is always kept.
    pub fn resolve(
        env: &LaunchEnv,
        preferred_port: u16,
        manual: Option<(usize, usize)>,
        nodes: &dyn NodeListResolver,
    ) -> Result<Self> {
        let port = env.parse::<u16>(MASTER_PORT)?.unwrap_or(preferred_port);
        let explicit_addr = env.get(MASTER_ADDR).map(str::to_string);

        let (identity, address, source) = if env.contains(RANK) && env.contains(WORLD_SIZE) {
            let identity = ProcessIdentity::new(
                env.require(RANK)?,
                env.require(WORLD_SIZE)?,
                env.parse(LOCAL_RANK)?.unwrap_or(0),
            )?;
            (identity, explicit_addr, IdentitySource::Launcher)
        } else if env.contains(SLURM_PROCID) {
            let identity = ProcessIdentity::new(
                env.require(SLURM_PROCID)?,
                env.require(SLURM_NTASKS)?,
                env.parse(SLURM_LOCALID)?.unwrap_or(0),
            )?;
            let address = explicit_addr.or_else(|| {
                env.get(SLURM_NODELIST)
                    .map(|nodelist| first_node(env, nodelist, nodes))
            });
            (identity, address, IdentitySource::Scheduler)
        } else if let Some((rank, world_size)) = manual {
            let identity = ProcessIdentity::new(rank, world_size, 0)?;
            (identity, explicit_addr, IdentitySource::Manual)
        } else {
            (ProcessIdentity::single(), None, IdentitySource::SingleProcess)
        };

        Ok(Self {
            identity,
            endpoint: RendezvousEndpoint::new(address.unwrap_or_else(|| LOOPBACK.to_string()), port),
            source,
        })
    }
}

/// First host of the scheduler allocation, or a local fallback.
fn first_node(env: &LaunchEnv, nodelist: &str, nodes: &dyn NodeListResolver) -> String {
    let failure = match nodes.hostnames(nodelist) {
        Ok(hosts) => match hosts.into_iter().next() {
            Some(first) => return first,
            None => "empty host list".to_string(),
        },
        Err(e) => e.to_string(),
    };

    let fallback = env
        .get(HOSTNAME)
        .filter(|h| !h.trim().is_empty())
        .unwrap_or(LOOPBACK);
    tracing::warn!(
        nodelist,
        error = %failure,
        fallback,
        "could not resolve scheduler node list"
    );
    fallback.to_string()
}

/// Options for [`init_distributed`].
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Rendezvous port used when `MASTER_PORT` is unset.
    pub preferred_port: u16,
    /// `(rank, world_size)` used when no launcher or scheduler is present.
    pub manual: Option<(usize, usize)>,
    pub backend: BackendKind,
    pub rendezvous_timeout: Duration,
    /// `TMPDIR` is moved to `<scratch_root>/<SLURM_JOB_ID>` when that exists.
    pub scratch_root: PathBuf,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            preferred_port: DEFAULT_PORT,
            manual: None,
            backend: BackendKind::Auto,
            rendezvous_timeout: DEFAULT_RENDEZVOUS_TIMEOUT,
            scratch_root: PathBuf::from(DEFAULT_SCRATCH_ROOT),
        }
    }
}

impl InitOptions {
    pub fn with_port(mut self, port: u16) -> Self {
        self.preferred_port = port;
        self
    }

    pub fn with_manual(mut self, rank: usize, world_size: usize) -> Self {
        self.manual = Some((rank, world_size));
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.rendezvous_timeout = timeout;
        self
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }
}

/// Everything the rest of the program needs to know about distribution.
#[derive(Clone)]
pub struct DistributedContext {
    launch: LaunchContext,
    device: Device,
    communicator: CommContext,
}

impl DistributedContext {
    pub fn new(launch: LaunchContext, device: Device, communicator: CommContext) -> Self {
        Self {
            launch,
            device,
            communicator,
        }
    }

    /// Context for `identity` on the CPU with a no-op communicator.
    pub fn detached(identity: ProcessIdentity) -> Self {
        let source = if identity.is_distributed() {
            IdentitySource::Manual
        } else {
            IdentitySource::SingleProcess
        };
        Self {
            launch: LaunchContext {
                identity,
                endpoint: RendezvousEndpoint::loopback(DEFAULT_PORT),
                source,
            },
            device: Device::Cpu,
            communicator: std::sync::Arc::new(LocalCommunicator::new(
                LocalProcessGroup::from_identity(identity),
            )),
        }
    }

    pub fn identity(&self) -> ProcessIdentity {
        self.launch.identity
    }

    pub fn endpoint(&self) -> &RendezvousEndpoint {
        &self.launch.endpoint
    }

    pub fn source(&self) -> IdentitySource {
        self.launch.source
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn communicator(&self) -> &CommContext {
        &self.communicator
    }

    pub fn world_size(&self) -> usize {
        self.launch.identity.world_size()
    }

    pub fn rank(&self) -> usize {
        self.launch.identity.rank()
    }

    pub fn local_rank(&self) -> usize {
        self.launch.identity.local_rank()
    }

    pub fn is_primary(&self) -> bool {
        self.launch.identity.is_primary()
    }

    /// `(world_size, rank, local_rank)`.
    pub fn as_tuple(&self) -> (usize, usize, usize) {
        self.launch.identity.as_tuple()
    }

    fn with_local_rank(&self, local_rank: usize) -> Self {
        let mut ctx = self.clone();
        ctx.launch.identity = ctx.launch.identity.with_local_rank(local_rank);
        ctx
    }
}

impl fmt::Debug for DistributedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedContext")
            .field("identity", &self.launch.identity)
            .field("endpoint", &self.launch.endpoint)
            .field("source", &self.launch.source)
            .field("device", &self.device.location())
            .field("active", &self.communicator.is_active())
            .finish()
    }
}

/// Initialize distribution for this process from the real environment.
///
/// Safe to call more than once: after a group has been created, later calls
/// return the existing identity without touching anything. Environment
/// writes (`TMPDIR`, `MASTER_ADDR`, `MASTER_PORT`) are applied before
/// returning, so call this before spawning threads.
pub fn init_distributed(opts: &InitOptions) -> Result<DistributedContext> {
    let mut env = LaunchEnv::from_process();
    let result = init_distributed_with(
        &mut env,
        opts,
        GroupRegistry::global(),
        &ScontrolResolver,
        &CandleDeviceSelector,
    );
    env.export();
    result
}

/// [`init_distributed`] with every collaborator supplied by the caller.
pub fn init_distributed_with(
    env: &mut LaunchEnv,
    opts: &InitOptions,
    registry: &GroupRegistry,
    nodes: &dyn NodeListResolver,
    devices: &dyn DeviceSelector,
) -> Result<DistributedContext> {
    if let Some(existing) = registry.active() {
        let local_rank = env.parse(LOCAL_RANK)?.unwrap_or(0);
        tracing::debug!(
            rank = existing.rank(),
            world_size = existing.world_size(),
            "process group already initialized"
        );
        return Ok(existing.with_local_rank(local_rank));
    }

    remap_scratch_dir(env, &opts.scratch_root);

    let launch = LaunchContext::resolve(env, opts.preferred_port, opts.manual, nodes)?;
    if launch.source == IdentitySource::SingleProcess {
        tracing::info!("no distributed environment detected, running single-process");
        return Ok(DistributedContext::new(
            launch,
            Device::Cpu,
            LocalCommunicator::context(),
        ));
    }

    env.set_default(MASTER_ADDR, launch.endpoint.address.as_str());
    env.set_default(MASTER_PORT, launch.endpoint.port.to_string());

    let identity = launch.identity;
    let device = select_local_device(devices, identity.local_rank(), env)?;

    if !identity.is_distributed() {
        tracing::info!("single process (world_size <= 1), skipping process group creation");
        return Ok(DistributedContext::new(
            launch,
            device,
            LocalCommunicator::context(),
        ));
    }

    let communicator = create_communicator(&launch, &device, opts.backend, opts.rendezvous_timeout)?;
    let ctx = DistributedContext::new(launch, device, communicator);
    registry.register(ctx.clone())?;

    tracing::info!(
        rank = identity.rank(),
        world_size = identity.world_size(),
        local_rank = identity.local_rank(),
        "initialized distributed process group"
    );
    Ok(ctx)
}

/// Point `TMPDIR` at the per-job scratch directory when the cluster has one.
fn remap_scratch_dir(env: &mut LaunchEnv, scratch_root: &Path) {
    let Some(job_id) = env.get(SLURM_JOB_ID) else {
        return;
    };
    let dir = scratch_root.join(job_id);
    if dir.exists() {
        tracing::debug!(dir = %dir.display(), "using job scratch directory as TMPDIR");
        env.set(TMPDIR, dir.to_string_lossy().into_owned());
    }
}
