//! Process identity and process group abstractions.
//!
//! A process group represents the set of processes that participate in
//! collective operations. In data-parallel training each GPU is a process.

use std::sync::OnceLock;

use super::error::{DistributedError, Result};
use super::launcher::DistributedContext;

/// Rank, world size and local rank of this process.
///
/// Computed once at startup and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessIdentity {
    rank: usize,
    world_size: usize,
    local_rank: usize,
}

impl ProcessIdentity {
    pub fn new(rank: usize, world_size: usize, local_rank: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(DistributedError::InvalidWorldSize(world_size));
        }
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        Ok(Self {
            rank,
            world_size,
            local_rank,
        })
    }

    /// Identity of a job that runs as a single process.
    pub const fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    /// Rank 0 owns logging and other side-effectful I/O.
    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    /// `(world_size, rank, local_rank)`, the order `init_distributed` callers expect.
    pub fn as_tuple(&self) -> (usize, usize, usize) {
        (self.world_size, self.rank, self.local_rank)
    }

    /// Same process with a different local rank.
    pub(crate) fn with_local_rank(self, local_rank: usize) -> Self {
        Self { local_rank, ..self }
    }
}

impl Default for ProcessIdentity {
    fn default() -> Self {
        Self::single()
    }
}

/// Trait for process group operations.
///
/// A process group manages rank assignment and provides the foundation
/// for collective communications.
pub trait ProcessGroup: Send + Sync {
    /// Global rank of this process (0..world_size).
    fn rank(&self) -> usize;

    /// Total number of processes in the group.
    fn world_size(&self) -> usize;

    /// Local rank on this node (for multi-node setups).
    fn local_rank(&self) -> usize;

    /// Whether this is the coordinator (rank 0).
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Whether this is a single-process group.
    fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

/// Process group backed by a fixed identity.
///
/// With the default identity this is the single-process group, where all
/// collectives are identity/no-ops.
#[derive(Debug, Clone, Default)]
pub struct LocalProcessGroup {
    identity: ProcessIdentity,
}

impl LocalProcessGroup {
    /// Single-process group (rank 0 of 1).
    pub fn new() -> Self {
        Self::default()
    }

    /// Group with a specific rank/size, local rank equal to rank.
    ///
    /// # Panics
    /// Panics if `rank >= world_size`.
    pub fn with_rank(rank: usize, world_size: usize) -> Self {
        assert!(rank < world_size, "rank must be < world_size");
        Self {
            identity: ProcessIdentity {
                rank,
                world_size,
                local_rank: rank,
            },
        }
    }

    pub fn from_identity(identity: ProcessIdentity) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> ProcessIdentity {
        self.identity
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.identity.rank
    }

    fn world_size(&self) -> usize {
        self.identity.world_size
    }

    fn local_rank(&self) -> usize {
        self.identity.local_rank
    }
}

/// Holder for the process group of this process.
///
/// Filled at most once; read-only afterwards.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    slot: OnceLock<DistributedContext>,
}

static GLOBAL_REGISTRY: GroupRegistry = GroupRegistry::new();

impl GroupRegistry {
    pub const fn new() -> Self {
        Self {
            slot: OnceLock::new(),
        }
    }

    /// Registry shared by the whole process.
    pub fn global() -> &'static GroupRegistry {
        &GLOBAL_REGISTRY
    }

    /// The registered context, if a group has been created.
    pub fn active(&self) -> Option<&DistributedContext> {
        self.slot.get()
    }

    pub fn is_initialized(&self) -> bool {
        self.slot.get().is_some()
    }

    /// Record the context of a freshly created group.
    pub fn register(&self, ctx: DistributedContext) -> Result<()> {
        self.slot.set(ctx).map_err(|rejected| {
            let existing = self.slot.get().map(|c| c.identity()).unwrap_or_default();
            tracing::warn!(
                rank = rejected.rank(),
                existing_rank = existing.rank(),
                "process group already registered"
            );
            DistributedError::AlreadyInitialized {
                rank: existing.rank(),
                world_size: existing.world_size(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_validates_rank() {
        let id = ProcessIdentity::new(2, 4, 1).unwrap();
        assert_eq!(id.as_tuple(), (4, 2, 1));
        assert!(!id.is_primary());
        assert!(id.is_distributed());

        assert!(matches!(
            ProcessIdentity::new(4, 4, 0),
            Err(DistributedError::InvalidRank {
                rank: 4,
                world_size: 4
            })
        ));
        assert!(matches!(
            ProcessIdentity::new(0, 0, 0),
            Err(DistributedError::InvalidWorldSize(0))
        ));
    }

    #[test]
    fn single_identity() {
        let id = ProcessIdentity::single();
        assert_eq!(id.as_tuple(), (1, 0, 0));
        assert!(id.is_primary());
        assert!(!id.is_distributed());
    }

    #[test]
    fn local_pg_is_coordinator() {
        let pg = LocalProcessGroup::new();
        assert!(pg.is_coordinator());
        assert!(pg.is_single());
    }

    #[test]
    fn local_pg_with_rank() {
        let pg = LocalProcessGroup::with_rank(2, 4);
        assert_eq!(pg.rank(), 2);
        assert_eq!(pg.world_size(), 4);
        assert_eq!(pg.local_rank(), 2);
        assert!(!pg.is_coordinator());
        assert!(!pg.is_single());
    }

    #[test]
    #[should_panic(expected = "rank must be < world_size")]
    fn local_pg_invalid_rank_panics() {
        LocalProcessGroup::with_rank(5, 4);
    }

    #[test]
    fn registry_accepts_one_context() {
        let registry = GroupRegistry::new();
        assert!(registry.active().is_none());

        let identity = ProcessIdentity::new(1, 2, 1).unwrap();
        registry
            .register(DistributedContext::detached(identity))
            .unwrap();
        assert_eq!(registry.active().unwrap().identity(), identity);

        let err = registry
            .register(DistributedContext::detached(ProcessIdentity::single()))
            .unwrap_err();
        assert!(matches!(
            err,
            DistributedError::AlreadyInitialized {
                rank: 1,
                world_size: 2
            }
        ));
    }
}
