use std::net::TcpListener;
use std::time::Duration;

use candle_core::Device;

use crate::distributed::{
    create_communicator, BackendKind, CommContext, IdentitySource, LaunchContext,
    ProcessIdentity, RendezvousEndpoint,
};

/// Rendezvous timeout used by [`run_ranks`].
pub const RANK_TIMEOUT: Duration = Duration::from_secs(30);

/// A loopback port that was free a moment ago.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("no free loopback port")
}

/// Run `f` once per rank of a `world_size` job and collect the results in
/// rank order. Panics if any rank panics.
pub fn run_ranks<T, F>(world_size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize, CommContext) -> T + Sync,
{
    let endpoint = RendezvousEndpoint::loopback(free_port());
    let f = &f;

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let launch = LaunchContext {
                    identity: ProcessIdentity::new(rank, world_size, rank)
                        .expect("rank < world_size"),
                    endpoint: endpoint.clone(),
                    source: IdentitySource::Manual,
                };
                scope.spawn(move || {
                    let comm =
                        create_communicator(&launch, &Device::Cpu, BackendKind::Tcp, RANK_TIMEOUT)
                            .unwrap_or_else(|e| panic!("rank {rank} failed to join: {e}"));
                    f(rank, comm)
                })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, h)| {
                h.join()
                    .unwrap_or_else(|_| panic!("rank {rank} panicked"))
            })
            .collect()
    })
}
