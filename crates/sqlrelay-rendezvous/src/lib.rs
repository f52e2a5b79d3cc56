//! Shared rendezvous between the listener, connection daemons, and scaler
//!
//! One POSIX shared-memory segment per instance holds the coordination
//! block: fleet counters, the announcement fields, aggregated statistics,
//! and one slot per daemon. A 13-slot set of process-shared semaphores
//! lives inside the segment and orders every access. No per-request IPC
//! happens outside this block: daemons self-announce when idle and the
//! listener consumes the announcement, which keeps the listener a trivial
//! dispatcher and makes back-pressure natural.
//!
//! Platform specifics (POSIX shm + unnamed semaphores) are confined to
//! this crate; the rest of the system sees only the operations on
//! [`Rendezvous`].

mod layout;
mod rendezvous;
mod sem;
mod shm;

pub use layout::{
    AggregateStats, CommandCounters, ConnSlot, ConnectionState, QpsClass, QpsRing,
    MAX_CONNECTION_ID_LEN, MAX_UNIX_SOCKET_LEN, SEM_COUNT, STAT_CLIENT_ADDR_LEN,
    STAT_CLIENT_INFO_LEN, STAT_MAX_CONNECTIONS, STAT_QPS_KEEP, STAT_SQL_TEXT_LEN,
};
pub use rendezvous::{Announcement, HandoffData, ReadGuard, Rendezvous};
pub use sem::Sem;

/// Errors from the rendezvous layer
#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    /// The segment does not exist; the owning listener is not running
    #[error("rendezvous segment '{0}' does not exist")]
    Missing(String),

    /// The segment exists but was not initialized by a compatible listener
    #[error("rendezvous segment '{0}' has an unrecognized layout")]
    BadMagic(String),

    /// All per-connection slots are taken
    #[error("no free connection slot (limit {0})")]
    NoFreeSlot(usize),

    /// Underlying system call failed
    #[error("system error during {op}: {errno}")]
    Sys {
        op: &'static str,
        errno: nix::errno::Errno,
    },
}

pub type Result<T> = std::result::Result<T, RendezvousError>;

impl RendezvousError {
    pub(crate) fn sys(op: &'static str, errno: nix::errno::Errno) -> Self {
        Self::Sys { op, errno }
    }
}
