//! NCCL (NVIDIA Collective Communications Library) backend.
//!
//! NCCL is loaded at runtime with libloading, so a binary built with the
//! `cuda` feature still starts on hosts without it and reports
//! [`DistributedError::BackendUnavailable`] instead.
//!
//! Communicator creation follows the usual NCCL bootstrap: rank 0 draws a
//! unique id, ships it to every other rank over the rendezvous TCP port, and
//! all ranks call `ncclCommInitRank` with it.

use std::ffi::{c_char, c_int, c_void};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use candle_core::cuda::cudarc::driver::DevicePtr;
use candle_core::cuda::CudaStorageSlice;
use candle_core::{DType, Device, DeviceLocation, Storage, Tensor};
use libloading::Library;

use super::communicator::{DeviceCommunicator, ReduceOp};
use super::error::{DistributedError, Result};
use super::launcher::RendezvousEndpoint;
use super::process_group::{LocalProcessGroup, ProcessGroup, ProcessIdentity};

type NcclResult = c_int;
type NcclComm = *mut c_void;
type CudaStream = *mut c_void;

const UNIQUE_ID_BYTES: usize = 128;

/// Opaque id that ties the ranks of one communicator together.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NcclUniqueId {
    internal: [c_char; UNIQUE_ID_BYTES],
}

impl Default for NcclUniqueId {
    fn default() -> Self {
        Self {
            internal: [0; UNIQUE_ID_BYTES],
        }
    }
}

impl NcclUniqueId {
    fn to_bytes(self) -> [u8; UNIQUE_ID_BYTES] {
        self.internal.map(|b| b as u8)
    }

    fn from_bytes(bytes: [u8; UNIQUE_ID_BYTES]) -> Self {
        Self {
            internal: bytes.map(|b| b as c_char),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcclDataType {
    Uint8 = 1,
    Uint32 = 3,
    Int64 = 4,
    Float16 = 6,
    Float32 = 7,
    Float64 = 8,
    Bfloat16 = 9,
}

impl NcclDataType {
    pub fn from_dtype(dtype: DType) -> Option<Self> {
        match dtype {
            DType::U8 => Some(Self::Uint8),
            DType::U32 => Some(Self::Uint32),
            DType::I64 => Some(Self::Int64),
            DType::F16 => Some(Self::Float16),
            DType::BF16 => Some(Self::Bfloat16),
            DType::F32 => Some(Self::Float32),
            DType::F64 => Some(Self::Float64),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcclRedOp {
    Sum = 0,
    Prod = 1,
    Max = 2,
    Min = 3,
    Avg = 4,
}

impl From<ReduceOp> for NcclRedOp {
    fn from(op: ReduceOp) -> Self {
        match op {
            ReduceOp::Sum => Self::Sum,
            ReduceOp::Product => Self::Prod,
            ReduceOp::Max => Self::Max,
            ReduceOp::Min => Self::Min,
            ReduceOp::Average => Self::Avg,
        }
    }
}

// ─── Dynamic Library ──────────────────────────────────────────────────────────

type GetVersionFn = unsafe extern "C" fn(*mut c_int) -> NcclResult;
type GetUniqueIdFn = unsafe extern "C" fn(*mut NcclUniqueId) -> NcclResult;
type CommInitRankFn =
    unsafe extern "C" fn(*mut NcclComm, c_int, NcclUniqueId, c_int) -> NcclResult;
type CommDestroyFn = unsafe extern "C" fn(NcclComm) -> NcclResult;
type GetErrorStringFn = unsafe extern "C" fn(NcclResult) -> *const c_char;
type AllReduceFn = unsafe extern "C" fn(
    *const c_void,
    *mut c_void,
    usize,
    NcclDataType,
    NcclRedOp,
    NcclComm,
    CudaStream,
) -> NcclResult;
type AllGatherFn = unsafe extern "C" fn(
    *const c_void,
    *mut c_void,
    usize,
    NcclDataType,
    NcclComm,
    CudaStream,
) -> NcclResult;
type BroadcastFn = unsafe extern "C" fn(
    *const c_void,
    *mut c_void,
    usize,
    NcclDataType,
    c_int,
    NcclComm,
    CudaStream,
) -> NcclResult;

type CudaSetDeviceFn = unsafe extern "C" fn(c_int) -> c_int;
type CudaDeviceSynchronizeFn = unsafe extern "C" fn() -> c_int;

/// Copy a function pointer out of `library`.
///
/// # Safety
/// `T` must match the C signature of `name`.
unsafe fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T> {
    library
        .get::<T>(name.as_bytes())
        .map(|sym| *sym)
        .map_err(|e| DistributedError::NcclError(format!("{name}: {e}")))
}

/// The parts of the CUDA runtime NCCL needs around communicator setup.
struct CudaRuntime {
    _library: Library,
    set_device: CudaSetDeviceFn,
    device_synchronize: CudaDeviceSynchronizeFn,
}

impl CudaRuntime {
    fn load() -> Result<Self> {
        let library = ["libcudart.so", "libcudart.so.12", "libcudart.so.11.0"]
            .iter()
            .find_map(|name| unsafe { Library::new(name) }.ok())
            .ok_or_else(|| DistributedError::NcclError("libcudart not found".to_string()))?;
        unsafe {
            Ok(Self {
                set_device: symbol(&library, "cudaSetDevice")?,
                device_synchronize: symbol(&library, "cudaDeviceSynchronize")?,
                _library: library,
            })
        }
    }

    fn set_device(&self, ordinal: usize) -> Result<()> {
        match unsafe { (self.set_device)(ordinal as c_int) } {
            0 => Ok(()),
            code => Err(DistributedError::NcclError(format!(
                "cudaSetDevice({ordinal}) failed with code {code}"
            ))),
        }
    }

    fn synchronize(&self) -> Result<()> {
        match unsafe { (self.device_synchronize)() } {
            0 => Ok(()),
            code => Err(DistributedError::NcclError(format!(
                "cudaDeviceSynchronize failed with code {code}"
            ))),
        }
    }
}

/// Dynamically loaded libnccl.
pub struct NcclLibrary {
    _library: Library,
    cuda: Option<CudaRuntime>,
    version: i32,
    get_unique_id: GetUniqueIdFn,
    comm_init_rank: CommInitRankFn,
    comm_destroy: CommDestroyFn,
    get_error_string: GetErrorStringFn,
    all_reduce: AllReduceFn,
    all_gather: AllGatherFn,
    broadcast: BroadcastFn,
}

// Only function pointers and the library handle.
unsafe impl Send for NcclLibrary {}
unsafe impl Sync for NcclLibrary {}

impl NcclLibrary {
    /// Load libnccl.so.2 from the system search path.
    pub fn new() -> Result<Self> {
        Self::from_path("libnccl.so.2")
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let library = unsafe { Library::new(path.as_ref()) }
            .map_err(|e| DistributedError::BackendUnavailable(format!("nccl ({e})")))?;

        let (get_version, lib) = unsafe {
            let get_version: GetVersionFn = symbol(&library, "ncclGetVersion")?;
            let lib = Self {
                get_unique_id: symbol(&library, "ncclGetUniqueId")?,
                comm_init_rank: symbol(&library, "ncclCommInitRank")?,
                comm_destroy: symbol(&library, "ncclCommDestroy")?,
                get_error_string: symbol(&library, "ncclGetErrorString")?,
                all_reduce: symbol(&library, "ncclAllReduce")?,
                all_gather: symbol(&library, "ncclAllGather")?,
                broadcast: symbol(&library, "ncclBroadcast")?,
                cuda: None,
                version: 0,
                _library: library,
            };
            (get_version, lib)
        };

        let mut version: c_int = 0;
        if unsafe { get_version(&mut version) } != 0 {
            return Err(DistributedError::NcclError(
                "failed to query NCCL version".to_string(),
            ));
        }

        let cuda = match CudaRuntime::load() {
            Ok(rt) => Some(rt),
            Err(e) => {
                tracing::warn!(error = %e, "CUDA runtime not loaded, relying on current device");
                None
            }
        };

        Ok(Self {
            cuda,
            version,
            ..lib
        })
    }

    /// `(major, minor, patch)`.
    pub fn version(&self) -> (i32, i32, i32) {
        (
            self.version / 10000,
            (self.version % 10000) / 100,
            self.version % 100,
        )
    }

    pub fn get_unique_id(&self) -> Result<NcclUniqueId> {
        let mut id = NcclUniqueId::default();
        self.check(unsafe { (self.get_unique_id)(&mut id) })?;
        Ok(id)
    }

    fn error_string(&self, code: NcclResult) -> String {
        let ptr = unsafe { (self.get_error_string)(code) };
        if ptr.is_null() {
            return format!("unknown NCCL error {code}");
        }
        unsafe { std::ffi::CStr::from_ptr(ptr) }
            .to_string_lossy()
            .into_owned()
    }

    fn check(&self, code: NcclResult) -> Result<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(DistributedError::NcclError(self.error_string(code)))
        }
    }
}

/// Whether libnccl can be loaded on this host.
pub fn is_nccl_available() -> bool {
    NcclLibrary::new().is_ok()
}

// ─── Unique Id Exchange ───────────────────────────────────────────────────────

fn share_unique_id(
    id: &NcclUniqueId,
    world_size: usize,
    endpoint: &RendezvousEndpoint,
) -> Result<()> {
    let bind_addr = format!("0.0.0.0:{}", endpoint.port);
    let listener = TcpListener::bind(&bind_addr).map_err(|e| DistributedError::Rendezvous {
        endpoint: endpoint.to_string(),
        reason: format!("failed to bind {bind_addr}: {e}"),
    })?;

    let bytes = id.to_bytes();
    for served in 1..world_size {
        let (mut stream, peer) = listener.accept()?;
        stream.write_all(&bytes)?;
        tracing::trace!(peer = %peer, served, "sent NCCL unique id");
    }
    Ok(())
}

fn fetch_unique_id(endpoint: &RendezvousEndpoint, timeout: Duration) -> Result<NcclUniqueId> {
    let addr = endpoint.socket_addr();
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect(&addr) {
            Ok(mut stream) => {
                let mut bytes = [0u8; UNIQUE_ID_BYTES];
                stream.read_exact(&mut bytes)?;
                return Ok(NcclUniqueId::from_bytes(bytes));
            }
            Err(e) if Instant::now() < deadline => {
                tracing::trace!(addr = %addr, error = %e, "retrying connection to rank 0");
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                return Err(DistributedError::Rendezvous {
                    endpoint: endpoint.to_string(),
                    reason: format!("failed to fetch NCCL unique id: {e}"),
                })
            }
        }
    }
}

// ─── Communicator ─────────────────────────────────────────────────────────────

/// Live NCCL communicator bound to one device.
pub struct NcclCommunicator {
    nccl: Arc<NcclLibrary>,
    comm: NcclComm,
    ordinal: usize,
}

// NCCL handles are used behind &self from one thread at a time per rank.
unsafe impl Send for NcclCommunicator {}
unsafe impl Sync for NcclCommunicator {}

impl NcclCommunicator {
    pub fn new(
        nccl: Arc<NcclLibrary>,
        unique_id: NcclUniqueId,
        identity: ProcessIdentity,
        ordinal: usize,
    ) -> Result<Self> {
        if let Some(cuda) = &nccl.cuda {
            cuda.set_device(ordinal)?;
        }

        let mut comm: NcclComm = std::ptr::null_mut();
        nccl.check(unsafe {
            (nccl.comm_init_rank)(
                &mut comm,
                identity.world_size() as c_int,
                unique_id,
                identity.rank() as c_int,
            )
        })?;

        if let Some(cuda) = &nccl.cuda {
            if let Err(e) = cuda.synchronize() {
                tracing::warn!(error = %e, "device synchronize after NCCL init failed");
            }
        }

        Ok(Self {
            nccl,
            comm,
            ordinal,
        })
    }
}

impl Drop for NcclCommunicator {
    fn drop(&mut self) {
        let _ = unsafe { (self.nccl.comm_destroy)(self.comm) };
    }
}

/// [`DeviceCommunicator`] over NCCL for CUDA tensors.
pub struct NcclDeviceCommunicator {
    comm: NcclCommunicator,
    process_group: LocalProcessGroup,
}

impl NcclDeviceCommunicator {
    /// Bootstrap a communicator for `identity` on CUDA device `ordinal`.
    pub fn connect(
        identity: ProcessIdentity,
        ordinal: usize,
        endpoint: &RendezvousEndpoint,
        timeout: Duration,
    ) -> Result<Self> {
        let nccl = Arc::new(NcclLibrary::new()?);
        let (major, minor, patch) = nccl.version();
        tracing::debug!(rank = identity.rank(), version = %format!("{major}.{minor}.{patch}"), "loaded NCCL");

        let unique_id = if identity.is_primary() {
            let id = nccl.get_unique_id()?;
            share_unique_id(&id, identity.world_size(), endpoint)?;
            id
        } else {
            fetch_unique_id(endpoint, timeout)?
        };

        let comm = NcclCommunicator::new(nccl, unique_id, identity, ordinal)?;
        Ok(Self {
            comm,
            process_group: LocalProcessGroup::from_identity(identity),
        })
    }

    fn check_device(&self, tensor: &Tensor) -> Result<()> {
        let expected = format!("cuda:{}", self.comm.ordinal);
        match tensor.device().location() {
            DeviceLocation::Cuda { gpu_id } if gpu_id == self.comm.ordinal => Ok(()),
            DeviceLocation::Cuda { gpu_id } => Err(DistributedError::DeviceMismatch {
                expected,
                actual: format!("cuda:{gpu_id}"),
            }),
            location => Err(DistributedError::DeviceMismatch {
                expected,
                actual: format!("{location:?}"),
            }),
        }
    }

    /// Device pointer, element count and NCCL dtype of a contiguous CUDA tensor.
    fn raw_parts(tensor: &Tensor) -> Result<(*mut c_void, usize, NcclDataType)> {
        let dtype = NcclDataType::from_dtype(tensor.dtype()).ok_or_else(|| {
            DistributedError::InvalidTensor(format!("unsupported dtype {:?}", tensor.dtype()))
        })?;
        let (storage, layout) = tensor.storage_and_layout();
        if !layout.is_contiguous() {
            return Err(DistributedError::InvalidTensor(
                "NCCL requires contiguous tensors".to_string(),
            ));
        }
        let Storage::Cuda(cuda) = &*storage else {
            return Err(DistributedError::InvalidTensor(
                "NCCL requires CUDA tensors".to_string(),
            ));
        };

        macro_rules! ptr {
            ($s:expr) => {{
                let view = $s.slice(layout.start_offset()..);
                let (ptr, _guard) = view.device_ptr($s.stream());
                ptr as *mut c_void
            }};
        }
        let ptr = match &cuda.slice {
            CudaStorageSlice::U8(s) => ptr!(s),
            CudaStorageSlice::U32(s) => ptr!(s),
            CudaStorageSlice::I64(s) => ptr!(s),
            CudaStorageSlice::BF16(s) => ptr!(s),
            CudaStorageSlice::F16(s) => ptr!(s),
            CudaStorageSlice::F32(s) => ptr!(s),
            CudaStorageSlice::F64(s) => ptr!(s),
            _ => {
                return Err(DistributedError::InvalidTensor(format!(
                    "unsupported dtype {:?}",
                    tensor.dtype()
                )))
            }
        };
        Ok((ptr, layout.shape().elem_count(), dtype))
    }

    fn prepare(&self, tensor: &Tensor) -> Result<Tensor> {
        self.check_device(tensor)?;
        Ok(tensor.contiguous()?)
    }
}

impl DeviceCommunicator for NcclDeviceCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        let input = self.prepare(tensor)?;
        let output = Tensor::zeros(input.dims(), input.dtype(), input.device())?;
        let (send, count, dtype) = Self::raw_parts(&input)?;
        let (recv, _, _) = Self::raw_parts(&output)?;

        let nccl = &self.comm.nccl;
        nccl.check(unsafe {
            (nccl.all_reduce)(
                send,
                recv,
                count,
                dtype,
                op.into(),
                self.comm.comm,
                std::ptr::null_mut(),
            )
        })?;
        Ok(output)
    }

    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor> {
        if tensor.rank() == 0 {
            return Err(DistributedError::ShapeMismatch {
                expected: vec![1],
                actual: vec![],
            });
        }
        let input = self.prepare(tensor)?;
        let mut dims = input.dims().to_vec();
        dims[0] *= self.process_group.world_size();
        let output = Tensor::zeros(dims, input.dtype(), input.device())?;
        let (send, count, dtype) = Self::raw_parts(&input)?;
        let (recv, _, _) = Self::raw_parts(&output)?;

        let nccl = &self.comm.nccl;
        nccl.check(unsafe {
            (nccl.all_gather)(
                send,
                recv,
                count,
                dtype,
                self.comm.comm,
                std::ptr::null_mut(),
            )
        })?;
        Ok(output)
    }

    fn broadcast(&self, tensor: &Tensor, src_rank: usize) -> Result<Tensor> {
        let world_size = self.process_group.world_size();
        if src_rank >= world_size {
            return Err(DistributedError::InvalidRank {
                rank: src_rank,
                world_size,
            });
        }
        let input = self.prepare(tensor)?;
        let output = Tensor::zeros(input.dims(), input.dtype(), input.device())?;
        let (send, count, dtype) = Self::raw_parts(&input)?;
        let (recv, _, _) = Self::raw_parts(&output)?;

        let nccl = &self.comm.nccl;
        nccl.check(unsafe {
            (nccl.broadcast)(
                send,
                recv,
                count,
                dtype,
                src_rank as c_int,
                self.comm.comm,
                std::ptr::null_mut(),
            )
        })?;
        Ok(output)
    }

    fn barrier(&self) -> Result<()> {
        let device = Device::new_cuda(self.comm.ordinal)?;
        let token = Tensor::zeros(1, DType::F32, &device)?;
        self.all_reduce(&token, ReduceOp::Sum)?;
        if let Some(cuda) = &self.comm.nccl.cuda {
            cuda.synchronize()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_mapping() {
        assert_eq!(
            NcclDataType::from_dtype(DType::F32),
            Some(NcclDataType::Float32)
        );
        assert_eq!(
            NcclDataType::from_dtype(DType::BF16),
            Some(NcclDataType::Bfloat16)
        );
        assert_eq!(
            NcclDataType::from_dtype(DType::I64),
            Some(NcclDataType::Int64)
        );
    }

    #[test]
    fn reduce_op_mapping() {
        assert_eq!(NcclRedOp::from(ReduceOp::Sum), NcclRedOp::Sum);
        assert_eq!(NcclRedOp::from(ReduceOp::Average), NcclRedOp::Avg);
        assert_eq!(NcclRedOp::from(ReduceOp::Product), NcclRedOp::Prod);
    }

    #[test]
    fn unique_id_byte_roundtrip() {
        let mut bytes = [0u8; UNIQUE_ID_BYTES];
        bytes[0] = 0xff;
        bytes[127] = 7;
        let id = NcclUniqueId::from_bytes(bytes);
        assert_eq!(id.to_bytes(), bytes);
    }

    #[test]
    fn availability_probe_does_not_panic() {
        let _ = is_nccl_available();
    }

    #[test]
    #[ignore = "requires NCCL"]
    fn library_reports_version() {
        let nccl = NcclLibrary::new().unwrap();
        assert!(nccl.version().0 >= 2);
    }
}
