//! TCP communicator for host-staged collectives.
//!
//! A star topology rooted at rank 0: rank 0 listens on the rendezvous port,
//! every other rank connects to it. Collectives move tensors to host memory
//! (`i64` for integer dtypes, `f64` otherwise), reduce/concatenate on rank 0
//! in rank order, and ship the result back, so all ranks observe
//! bit-identical outputs in the input dtype.
//!
//! # Wire Protocol
//!
//! Every message is a frame: `[tag: u8][len: u64 LE][payload: len bytes]`.
//!
//! | Tag     | Direction      | Payload |
//! |---------|----------------|---------|
//! | `HELLO` | peer -> root   | magic, rank, world_size (u32 LE each) |
//! | `ACK`   | root -> peer   | empty; releases the creation barrier |
//! | `DATA`  | both           | kind (u8: 0 = f64, 1 = i64), ndim (u32), dims (u64 each), values (8 bytes each) |
//! | `ERROR` | root -> peer   | utf-8 reason; the collective failed on every rank |

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use candle_core::{DType, Device, Tensor};

use super::communicator::{DeviceCommunicator, ReduceOp};
use super::error::{DistributedError, Result};
use super::launcher::RendezvousEndpoint;
use super::process_group::{LocalProcessGroup, ProcessGroup, ProcessIdentity};

const MAGIC: u32 = 0x4444_5031;

const TAG_HELLO: u8 = 1;
const TAG_ACK: u8 = 2;
const TAG_DATA: u8 = 3;
const TAG_ERROR: u8 = 4;

/// Frames above this size are treated as corruption.
const MAX_FRAME_BYTES: u64 = 1 << 40;

const ACCEPT_POLL: Duration = Duration::from_millis(10);
const CONNECT_RETRY: Duration = Duration::from_millis(100);

// ─── Framing ──────────────────────────────────────────────────────────────────

fn write_frame<W: Write>(w: &mut W, tag: u8, payload: &[u8]) -> io::Result<()> {
    let mut header = [0u8; 9];
    header[0] = tag;
    header[1..].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    w.write_all(&header)?;
    w.write_all(payload)?;
    w.flush()
}

fn read_frame<R: Read>(r: &mut R) -> Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 9];
    r.read_exact(&mut header)?;
    let mut len = [0u8; 8];
    len.copy_from_slice(&header[1..]);
    let len = u64::from_le_bytes(len);
    if len > MAX_FRAME_BYTES {
        return Err(DistributedError::Protocol(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    Ok((header[0], payload))
}

/// Element values of a staged tensor.
///
/// Integer dtypes travel as `i64` so sums stay exact; every float dtype
/// travels as `f64`.
#[derive(Debug, Clone, PartialEq)]
enum HostValues {
    Float(Vec<f64>),
    Int(Vec<i64>),
}

impl HostValues {
    const FLOAT: u8 = 0;
    const INT: u8 = 1;

    fn len(&self) -> usize {
        match self {
            HostValues::Float(v) => v.len(),
            HostValues::Int(v) => v.len(),
        }
    }

    fn kind(&self) -> u8 {
        match self {
            HostValues::Float(_) => Self::FLOAT,
            HostValues::Int(_) => Self::INT,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            HostValues::Float(_) => "float",
            HostValues::Int(_) => "integer",
        }
    }

    fn mismatch(&self, other: &HostValues) -> DistributedError {
        DistributedError::InvalidTensor(format!(
            "{} tensor combined with {} tensor from a peer",
            self.kind_name(),
            other.kind_name()
        ))
    }

    fn fold(&mut self, other: &HostValues, op: ReduceOp) -> Result<()> {
        match (self, other) {
            (HostValues::Float(acc), HostValues::Float(b)) => op.fold(acc, b),
            (HostValues::Int(acc), HostValues::Int(b)) => op.fold(acc, b),
            (acc, b) => return Err(acc.mismatch(b)),
        }
        Ok(())
    }

    fn extend(&mut self, other: &HostValues) -> Result<()> {
        match (self, other) {
            (HostValues::Float(acc), HostValues::Float(b)) => acc.extend_from_slice(b),
            (HostValues::Int(acc), HostValues::Int(b)) => acc.extend_from_slice(b),
            (acc, b) => return Err(acc.mismatch(b)),
        }
        Ok(())
    }

    /// Divide every element by `n`. Integers truncate toward zero.
    fn divide(&mut self, n: usize) {
        match self {
            HostValues::Float(v) => v.iter_mut().for_each(|x| *x /= n as f64),
            HostValues::Int(v) => v.iter_mut().for_each(|x| *x /= n as i64),
        }
    }
}

/// Tensor contents staged in host memory.
#[derive(Debug, Clone, PartialEq)]
struct HostTensor {
    dims: Vec<usize>,
    values: HostValues,
}

impl HostTensor {
    fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let flat = tensor.flatten_all()?;
        let values = if tensor.dtype().is_int() {
            HostValues::Int(flat.to_dtype(DType::I64)?.to_vec1::<i64>()?)
        } else {
            HostValues::Float(flat.to_dtype(DType::F64)?.to_vec1::<f64>()?)
        };
        Ok(Self {
            dims: tensor.dims().to_vec(),
            values,
        })
    }

    /// Rebuild a tensor with the dtype and device of `like`.
    fn into_tensor(self, like: &Tensor) -> Result<Tensor> {
        let host = match self.values {
            HostValues::Float(v) => Tensor::from_vec(v, self.dims, &Device::Cpu)?,
            HostValues::Int(v) => Tensor::from_vec(v, self.dims, &Device::Cpu)?,
        };
        Ok(host.to_dtype(like.dtype())?.to_device(like.device())?)
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.dims.len() * 8 + self.values.len() * 8);
        buf.push(self.values.kind());
        buf.extend_from_slice(&(self.dims.len() as u32).to_le_bytes());
        for &d in &self.dims {
            buf.extend_from_slice(&(d as u64).to_le_bytes());
        }
        match &self.values {
            HostValues::Float(v) => v.iter().for_each(|x| buf.extend_from_slice(&x.to_le_bytes())),
            HostValues::Int(v) => v.iter().for_each(|x| buf.extend_from_slice(&x.to_le_bytes())),
        }
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let truncated = || DistributedError::Protocol("truncated tensor payload".to_string());

        let (kind, ndim) = buf
            .get(..5)
            .map(|b| (b[0], u32::from_le_bytes([b[1], b[2], b[3], b[4]]) as usize))
            .ok_or_else(truncated)?;
        let body = &buf[5..];
        if body.len() < ndim * 8 || (body.len() - ndim * 8) % 8 != 0 {
            return Err(truncated());
        }
        let mut words = body.chunks_exact(8).map(|w| {
            let mut b = [0u8; 8];
            b.copy_from_slice(w);
            b
        });

        let dims = (&mut words)
            .take(ndim)
            .map(|b| u64::from_le_bytes(b) as usize)
            .collect::<Vec<_>>();
        let values = match kind {
            HostValues::FLOAT => HostValues::Float(words.map(f64::from_le_bytes).collect()),
            HostValues::INT => HostValues::Int(words.map(i64::from_le_bytes).collect()),
            other => {
                return Err(DistributedError::Protocol(format!(
                    "unknown element kind {other}"
                )))
            }
        };

        let expected = dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| {
                DistributedError::Protocol(format!("shape {dims:?} overflows the element count"))
            })?;
        if expected != values.len() {
            return Err(DistributedError::Protocol(format!(
                "payload has {} values for shape {dims:?}",
                values.len()
            )));
        }
        Ok(Self { dims, values })
    }
}

fn send_tensor(stream: &mut TcpStream, host: &HostTensor) -> Result<()> {
    write_frame(stream, TAG_DATA, &host.encode())?;
    Ok(())
}

fn recv_tensor(stream: &mut TcpStream) -> Result<HostTensor> {
    match read_frame(stream)? {
        (TAG_DATA, payload) => HostTensor::decode(&payload),
        (TAG_ERROR, payload) => Err(DistributedError::Protocol(format!(
            "collective failed on rank 0: {}",
            String::from_utf8_lossy(&payload)
        ))),
        (tag, _) => Err(DistributedError::Protocol(format!(
            "unexpected frame tag {tag}"
        ))),
    }
}

/// Tell every peer that the current collective failed, then return `err`.
fn fail_all(peers: &mut [TcpStream], err: DistributedError) -> DistributedError {
    let reason = err.to_string();
    for stream in peers.iter_mut() {
        let _ = write_frame(stream, TAG_ERROR, reason.as_bytes());
    }
    err
}

// ─── Rendezvous ───────────────────────────────────────────────────────────────

fn remaining(deadline: Instant) -> Duration {
    deadline
        .saturating_duration_since(Instant::now())
        .max(Duration::from_millis(1))
}

fn rendezvous_error(endpoint: &RendezvousEndpoint, reason: impl Into<String>) -> DistributedError {
    DistributedError::Rendezvous {
        endpoint: endpoint.to_string(),
        reason: reason.into(),
    }
}

/// Rank 0: accept `world_size - 1` peers and release them together.
fn accept_peers(
    identity: ProcessIdentity,
    endpoint: &RendezvousEndpoint,
    timeout: Duration,
) -> Result<Vec<TcpStream>> {
    let world_size = identity.world_size();
    let bind_addr = format!("0.0.0.0:{}", endpoint.port);
    let listener = TcpListener::bind(&bind_addr)
        .map_err(|e| rendezvous_error(endpoint, format!("failed to bind {bind_addr}: {e}")))?;
    listener.set_nonblocking(true)?;

    tracing::debug!(port = endpoint.port, world_size, "rank 0 waiting for peers");

    let deadline = Instant::now() + timeout;
    let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
    let mut joined = 0;

    while joined < world_size - 1 {
        let (mut stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(rendezvous_error(
                        endpoint,
                        format!(
                            "timed out after {timeout:?} with {joined} of {} peers joined",
                            world_size - 1
                        ),
                    ));
                }
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(e) => return Err(rendezvous_error(endpoint, format!("accept failed: {e}"))),
        };

        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(remaining(deadline)))?;

        let rank = match read_hello(&mut stream, world_size) {
            Ok(rank) if slots[rank - 1].is_some() => Err(format!("rank {rank} joined twice")),
            other => other,
        };
        let rank = match rank {
            Ok(rank) => rank,
            Err(reason) => {
                let _ = write_frame(&mut stream, TAG_ERROR, reason.as_bytes());
                return Err(rendezvous_error(endpoint, reason));
            }
        };

        tracing::trace!(peer = %peer, rank, "peer joined");
        slots[rank - 1] = Some(stream);
        joined += 1;
    }

    let mut peers: Vec<TcpStream> = slots.into_iter().flatten().collect();
    for stream in &mut peers {
        write_frame(stream, TAG_ACK, &[])?;
        stream.set_read_timeout(None)?;
    }

    tracing::debug!(peers = peers.len(), "all ranks joined");
    Ok(peers)
}

/// Validate a hello frame, returning the peer's rank.
fn read_hello(
    stream: &mut TcpStream,
    world_size: usize,
) -> std::result::Result<usize, String> {
    let (tag, payload) = read_frame(stream).map_err(|e| format!("no hello from peer: {e}"))?;
    if tag != TAG_HELLO || payload.len() != 12 {
        return Err(format!("malformed hello (tag {tag}, {} bytes)", payload.len()));
    }
    let word = |i: usize| {
        u32::from_le_bytes([
            payload[i * 4],
            payload[i * 4 + 1],
            payload[i * 4 + 2],
            payload[i * 4 + 3],
        ])
    };
    if word(0) != MAGIC {
        return Err("bad magic in hello".to_string());
    }
    let (rank, peer_world) = (word(1) as usize, word(2) as usize);
    if peer_world != world_size {
        return Err(format!(
            "rank {rank} expects world_size {peer_world}, rank 0 has {world_size}"
        ));
    }
    if rank == 0 || rank >= world_size {
        return Err(format!("rank {rank} out of range for world_size {world_size}"));
    }
    Ok(rank)
}

/// Rank > 0: connect to rank 0, announce ourselves and wait for the release.
fn join_root(
    identity: ProcessIdentity,
    endpoint: &RendezvousEndpoint,
    timeout: Duration,
) -> Result<TcpStream> {
    let addr = endpoint.socket_addr();
    let deadline = Instant::now() + timeout;

    let mut attempt = 0u32;
    let mut stream = loop {
        match TcpStream::connect(&addr) {
            Ok(stream) => break stream,
            Err(e) if Instant::now() + CONNECT_RETRY < deadline => {
                tracing::trace!(attempt, addr = %addr, error = %e, "retrying connection to rank 0");
                attempt += 1;
                std::thread::sleep(CONNECT_RETRY);
            }
            Err(e) => {
                return Err(rendezvous_error(
                    endpoint,
                    format!("failed to connect after {} attempts: {e}", attempt + 1),
                ))
            }
        }
    };
    stream.set_nodelay(true)?;

    let mut hello = Vec::with_capacity(12);
    hello.extend_from_slice(&MAGIC.to_le_bytes());
    hello.extend_from_slice(&(identity.rank() as u32).to_le_bytes());
    hello.extend_from_slice(&(identity.world_size() as u32).to_le_bytes());
    write_frame(&mut stream, TAG_HELLO, &hello)?;

    stream.set_read_timeout(Some(remaining(deadline)))?;
    match read_frame(&mut stream) {
        Ok((TAG_ACK, _)) => {}
        Ok((TAG_ERROR, reason)) => {
            return Err(rendezvous_error(
                endpoint,
                String::from_utf8_lossy(&reason).into_owned(),
            ))
        }
        Ok((tag, _)) => {
            return Err(DistributedError::Protocol(format!(
                "expected ACK, got frame tag {tag}"
            )))
        }
        Err(e) => {
            return Err(rendezvous_error(
                endpoint,
                format!("no release from rank 0: {e}"),
            ))
        }
    }
    stream.set_read_timeout(None)?;
    Ok(stream)
}

// ─── Communicator ─────────────────────────────────────────────────────────────

enum Link {
    /// Streams to ranks 1..world_size, in rank order.
    Root { peers: Vec<TcpStream> },
    Peer { root: TcpStream },
}

/// Host-staged communicator over TCP.
pub struct TcpCommunicator {
    process_group: LocalProcessGroup,
    link: Mutex<Link>,
}

impl TcpCommunicator {
    /// Join the group described by `identity` at `endpoint`.
    ///
    /// Blocks until every rank has connected or `timeout` elapses.
    ///
    /// # Panics
    /// Panics if `identity` describes a single-process job.
    pub fn connect(
        identity: ProcessIdentity,
        endpoint: &RendezvousEndpoint,
        timeout: Duration,
    ) -> Result<Self> {
        assert!(
            identity.is_distributed(),
            "use LocalCommunicator for world_size=1"
        );

        let link = if identity.is_primary() {
            Link::Root {
                peers: accept_peers(identity, endpoint, timeout)?,
            }
        } else {
            Link::Peer {
                root: join_root(identity, endpoint, timeout)?,
            }
        };

        tracing::debug!(
            rank = identity.rank(),
            world_size = identity.world_size(),
            endpoint = %endpoint,
            "TCP communicator connected"
        );

        Ok(Self {
            process_group: LocalProcessGroup::from_identity(identity),
            link: Mutex::new(link),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Link>> {
        self.link
            .lock()
            .map_err(|_| DistributedError::Protocol("communicator lock poisoned".to_string()))
    }

    fn reduce_on_root(
        peers: &mut [TcpStream],
        local: HostTensor,
        op: ReduceOp,
        world_size: usize,
    ) -> Result<HostTensor> {
        let mut acc = local;
        for stream in peers.iter_mut() {
            let other = recv_tensor(stream)?;
            if other.dims != acc.dims {
                return Err(DistributedError::ShapeMismatch {
                    expected: acc.dims.clone(),
                    actual: other.dims,
                });
            }
            acc.values.fold(&other.values, op)?;
        }
        if op == ReduceOp::Average {
            acc.values.divide(world_size);
        }
        Ok(acc)
    }

    fn gather_on_root(peers: &mut [TcpStream], local: HostTensor) -> Result<HostTensor> {
        let mut dims = local.dims.clone();
        let mut values = local.values.clone();
        for stream in peers.iter_mut() {
            let shard = recv_tensor(stream)?;
            if shard.dims != local.dims {
                return Err(DistributedError::ShapeMismatch {
                    expected: local.dims.clone(),
                    actual: shard.dims,
                });
            }
            values.extend(&shard.values)?;
        }
        dims[0] *= peers.len() + 1;
        Ok(HostTensor { dims, values })
    }
}

impl DeviceCommunicator for TcpCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        let local = HostTensor::from_tensor(tensor)?;
        let world_size = self.process_group.world_size();

        let reduced = match &mut *self.lock()? {
            Link::Root { peers } => {
                let reduced = Self::reduce_on_root(peers, local, op, world_size)
                    .map_err(|e| fail_all(peers, e))?;
                for stream in peers.iter_mut() {
                    send_tensor(stream, &reduced)?;
                }
                reduced
            }
            Link::Peer { root } => {
                send_tensor(root, &local)?;
                recv_tensor(root)?
            }
        };

        reduced.into_tensor(tensor)
    }

    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor> {
        if tensor.rank() == 0 {
            return Err(DistributedError::ShapeMismatch {
                expected: vec![1],
                actual: vec![],
            });
        }
        let local = HostTensor::from_tensor(tensor)?;

        let gathered = match &mut *self.lock()? {
            Link::Root { peers } => {
                let gathered =
                    Self::gather_on_root(peers, local).map_err(|e| fail_all(peers, e))?;
                for stream in peers.iter_mut() {
                    send_tensor(stream, &gathered)?;
                }
                gathered
            }
            Link::Peer { root } => {
                send_tensor(root, &local)?;
                recv_tensor(root)?
            }
        };

        gathered.into_tensor(tensor)
    }

    fn broadcast(&self, tensor: &Tensor, src_rank: usize) -> Result<Tensor> {
        let world_size = self.process_group.world_size();
        if src_rank >= world_size {
            return Err(DistributedError::InvalidRank {
                rank: src_rank,
                world_size,
            });
        }
        let rank = self.process_group.rank();

        let host = match &mut *self.lock()? {
            Link::Root { peers } => {
                let host = if src_rank == 0 {
                    HostTensor::from_tensor(tensor)?
                } else {
                    recv_tensor(&mut peers[src_rank - 1])?
                };
                for (i, stream) in peers.iter_mut().enumerate() {
                    if i + 1 != src_rank {
                        send_tensor(stream, &host)?;
                    }
                }
                host
            }
            Link::Peer { root } if rank == src_rank => {
                let host = HostTensor::from_tensor(tensor)?;
                send_tensor(root, &host)?;
                host
            }
            Link::Peer { root } => recv_tensor(root)?,
        };

        host.into_tensor(tensor)
    }

    fn barrier(&self) -> Result<()> {
        let token = Tensor::zeros(1, DType::F32, &Device::Cpu)?;
        self.all_reduce(&token, ReduceOp::Sum)?;
        Ok(())
    }
}
