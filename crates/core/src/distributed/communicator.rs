//! Device communicator for collective operations.
//!
//! A [`CommContext`] is chosen once at startup and passed explicitly to
//! everything that needs collectives: either the no-op [`LocalCommunicator`]
//! or a live backend ([`TcpCommunicator`](super::tcp::TcpCommunicator), or the
//! NCCL communicator with the `cuda` feature).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use candle_core::{Device, Tensor};

use super::error::{DistributedError, Result};
use super::launcher::{LaunchContext, RendezvousEndpoint};
use super::process_group::{LocalProcessGroup, ProcessGroup, ProcessIdentity};
use super::tcp::TcpCommunicator;

/// Reduction operations for collective primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
    /// Element-wise product.
    Product,
    /// Element-wise minimum.
    Min,
    /// Element-wise maximum.
    Max,
    /// Average (sum / world_size).
    Average,
}

impl ReduceOp {
    /// Fold `other` into `acc` element-wise. `Average` accumulates a sum;
    /// callers divide once every rank has been folded in.
    pub(crate) fn fold<T: HostScalar>(self, acc: &mut [T], other: &[T]) {
        for (a, &b) in acc.iter_mut().zip(other) {
            *a = a.combine(b, self);
        }
    }
}

/// Element type a host-staged reduction works on.
pub(crate) trait HostScalar: Copy {
    fn combine(self, other: Self, op: ReduceOp) -> Self;
}

impl HostScalar for f64 {
    fn combine(self, other: Self, op: ReduceOp) -> Self {
        match op {
            ReduceOp::Sum | ReduceOp::Average => self + other,
            ReduceOp::Product => self * other,
            ReduceOp::Min => self.min(other),
            ReduceOp::Max => self.max(other),
        }
    }
}

// Integer reductions wrap on overflow, as NCCL does.
impl HostScalar for i64 {
    fn combine(self, other: Self, op: ReduceOp) -> Self {
        match op {
            ReduceOp::Sum | ReduceOp::Average => self.wrapping_add(other),
            ReduceOp::Product => self.wrapping_mul(other),
            ReduceOp::Min => self.min(other),
            ReduceOp::Max => self.max(other),
        }
    }
}

/// Trait for process-to-process tensor communication.
///
/// Every call is a synchronization point: no rank returns before all ranks
/// have entered the matching call.
pub trait DeviceCommunicator: Send + Sync {
    /// Get the underlying process group.
    fn process_group(&self) -> &dyn ProcessGroup;

    /// Whether collectives actually communicate.
    fn is_active(&self) -> bool {
        !self.process_group().is_single()
    }

    /// All-reduce: apply reduction across all ranks, result on all ranks.
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor>;

    /// All-gather along the leading axis, in rank order.
    ///
    /// Input shape: [dim0, dim1, ...]
    /// Output shape: [dim0 * world_size, dim1, ...]
    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Broadcast: send tensor from source rank to all other ranks.
    fn broadcast(&self, tensor: &Tensor, src_rank: usize) -> Result<Tensor>;

    /// Barrier: synchronize all ranks.
    fn barrier(&self) -> Result<()>;
}

/// Communication capability shared by the training loop and the collectives.
pub type CommContext = Arc<dyn DeviceCommunicator>;

/// No-op communicator.
///
/// All collective operations are the identity. Used for single-process runs
/// and anywhere no process group is active.
#[derive(Debug, Clone, Default)]
pub struct LocalCommunicator<P: ProcessGroup = LocalProcessGroup> {
    process_group: P,
}

impl LocalCommunicator<LocalProcessGroup> {
    /// Communicator for a single-process job.
    pub fn single() -> Self {
        Self::new(LocalProcessGroup::new())
    }

    /// Shared handle to a single-process communicator.
    pub fn context() -> CommContext {
        Arc::new(Self::single())
    }
}

impl<P: ProcessGroup> LocalCommunicator<P> {
    /// Create a new local communicator with the given process group.
    pub fn new(process_group: P) -> Self {
        Self { process_group }
    }
}

impl<P: ProcessGroup> DeviceCommunicator for LocalCommunicator<P> {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn is_active(&self) -> bool {
        false
    }

    fn all_reduce(&self, tensor: &Tensor, _op: ReduceOp) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn broadcast(&self, tensor: &Tensor, _src_rank: usize) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

/// Collective backend requested for a multi-process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// NCCL for CUDA devices when available, TCP otherwise.
    #[default]
    Auto,
    /// Host-staged TCP star.
    Tcp,
    /// NCCL (requires the `cuda` feature).
    Nccl,
}

impl BackendKind {
    /// Concrete backend for tensors living on `device`.
    pub fn resolve(self, device: &Device) -> Result<BackendKind> {
        match self {
            BackendKind::Tcp => Ok(BackendKind::Tcp),
            BackendKind::Nccl if nccl_supported() => Ok(BackendKind::Nccl),
            BackendKind::Nccl => Err(DistributedError::BackendUnavailable("nccl".to_string())),
            BackendKind::Auto if device.is_cuda() && nccl_supported() => Ok(BackendKind::Nccl),
            BackendKind::Auto => Ok(BackendKind::Tcp),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Auto => "auto",
            BackendKind::Tcp => "tcp",
            BackendKind::Nccl => "nccl",
        })
    }
}

impl FromStr for BackendKind {
    type Err = DistributedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "tcp" | "gloo" => Ok(BackendKind::Tcp),
            "nccl" => Ok(BackendKind::Nccl),
            other => Err(DistributedError::BackendUnavailable(other.to_string())),
        }
    }
}

#[cfg(feature = "cuda")]
fn nccl_supported() -> bool {
    super::nccl::is_nccl_available()
}

#[cfg(not(feature = "cuda"))]
fn nccl_supported() -> bool {
    false
}

#[cfg(feature = "cuda")]
fn connect_nccl(
    identity: ProcessIdentity,
    device: &Device,
    endpoint: &RendezvousEndpoint,
    timeout: Duration,
) -> Result<CommContext> {
    let ordinal = match device.location() {
        candle_core::DeviceLocation::Cuda { gpu_id } => gpu_id,
        other => {
            return Err(DistributedError::DeviceMismatch {
                expected: "cuda".to_string(),
                actual: format!("{other:?}"),
            })
        }
    };
    Ok(Arc::new(super::nccl::NcclDeviceCommunicator::connect(
        identity, ordinal, endpoint, timeout,
    )?))
}

#[cfg(not(feature = "cuda"))]
fn connect_nccl(
    _identity: ProcessIdentity,
    _device: &Device,
    _endpoint: &RendezvousEndpoint,
    _timeout: Duration,
) -> Result<CommContext> {
    Err(DistributedError::BackendUnavailable(
        "nccl (built without the `cuda` feature)".to_string(),
    ))
}

/// Create the communication context for a resolved launch.
///
/// For `world_size > 1` this blocks until every rank has joined, then runs
/// one warmup barrier. A single-process launch gets a [`LocalCommunicator`].
pub fn create_communicator(
    launch: &LaunchContext,
    device: &Device,
    backend: BackendKind,
    timeout: Duration,
) -> Result<CommContext> {
    let identity = launch.identity;
    if !identity.is_distributed() {
        return Ok(Arc::new(LocalCommunicator::new(
            LocalProcessGroup::from_identity(identity),
        )));
    }

    let backend = backend.resolve(device)?;
    tracing::debug!(
        rank = identity.rank(),
        world_size = identity.world_size(),
        endpoint = %launch.endpoint,
        %backend,
        "creating process group"
    );

    let comm: CommContext = match backend {
        BackendKind::Nccl => connect_nccl(identity, device, &launch.endpoint, timeout)?,
        BackendKind::Tcp | BackendKind::Auto => Arc::new(TcpCommunicator::connect(
            identity,
            &launch.endpoint,
            timeout,
        )?),
    };

    comm.barrier()?;
    Ok(comm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn make_test_tensor(shape: &[usize]) -> Tensor {
        Tensor::ones(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn local_collectives_are_identity() {
        let comm = LocalCommunicator::single();
        let input = Tensor::arange(0f32, 6., &Device::Cpu)
            .unwrap()
            .reshape((2, 3))
            .unwrap();

        let reduced = comm.all_reduce(&input, ReduceOp::Sum).unwrap();
        let gathered = comm.all_gather(&input).unwrap();
        let broadcast = comm.broadcast(&input, 0).unwrap();

        for out in [reduced, gathered, broadcast] {
            assert_eq!(out.dims(), input.dims());
            assert_eq!(
                out.to_vec2::<f32>().unwrap(),
                input.to_vec2::<f32>().unwrap()
            );
        }
        comm.barrier().unwrap();
    }

    #[test]
    fn local_communicator_is_never_active() {
        let comm = LocalCommunicator::new(LocalProcessGroup::with_rank(1, 4));
        assert!(!comm.is_active());
        assert_eq!(comm.process_group().world_size(), 4);

        let out = comm.all_gather(&make_test_tensor(&[2, 3])).unwrap();
        assert_eq!(out.dims(), &[2, 3]);
    }

    #[test]
    fn backend_kind_parse_and_resolve() {
        assert_eq!("NCCL".parse::<BackendKind>().unwrap(), BackendKind::Nccl);
        assert_eq!("gloo".parse::<BackendKind>().unwrap(), BackendKind::Tcp);
        assert!("mpi".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Auto.to_string(), "auto");

        assert_eq!(
            BackendKind::Auto.resolve(&Device::Cpu).unwrap(),
            BackendKind::Tcp
        );
        assert_eq!(
            BackendKind::Tcp.resolve(&Device::Cpu).unwrap(),
            BackendKind::Tcp
        );
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn nccl_unavailable_without_cuda() {
        assert!(matches!(
            BackendKind::Nccl.resolve(&Device::Cpu),
            Err(DistributedError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn single_process_launch_gets_local_communicator() {
        let launch = LaunchContext {
            identity: ProcessIdentity::single(),
            endpoint: RendezvousEndpoint::loopback(0),
            source: super::super::launcher::IdentitySource::Manual,
        };
        let comm =
            create_communicator(&launch, &Device::Cpu, BackendKind::Tcp, Duration::from_secs(1))
                .unwrap();
        assert!(!comm.is_active());
    }

    #[test]
    fn reduce_op_fold() {
        let mut acc = vec![1.0, -2.0, 3.0];
        ReduceOp::Sum.fold(&mut acc, &[1.0, 1.0, 1.0]);
        assert_eq!(acc, vec![2.0, -1.0, 4.0]);

        ReduceOp::Max.fold(&mut acc, &[0.0, 0.0, 5.0]);
        assert_eq!(acc, vec![2.0, 0.0, 5.0]);

        ReduceOp::Min.fold(&mut acc, &[1.0, 1.0, 1.0]);
        assert_eq!(acc, vec![1.0, 0.0, 1.0]);

        ReduceOp::Product.fold(&mut acc, &[3.0, 3.0, 3.0]);
        assert_eq!(acc, vec![3.0, 0.0, 3.0]);
    }

    #[test]
    fn integer_fold_is_exact() {
        let mut acc: Vec<i64> = vec![(1 << 53) + 1, i64::MAX, -4];
        ReduceOp::Sum.fold(&mut acc, &[0, 1, 3]);
        assert_eq!(acc, vec![(1 << 53) + 1, i64::MIN, -1]);

        ReduceOp::Min.fold(&mut acc, &[7, 0, -9]);
        assert_eq!(acc, vec![7, i64::MIN, -9]);
    }
}
