//! Statistics sink
//!
//! The daemon mirrors its state transitions and command counts into its
//! rendezvous slot so monitors can watch the fleet. Unit tests and
//! bring-up runs work without a segment; every call is then a no-op.

use std::sync::Arc;

use sqlrelay_rendezvous::{ConnectionState, QpsClass, Rendezvous};
use tracing::warn;

/// Where per-daemon statistics go
#[derive(Clone, Default)]
pub enum StatsSink {
    /// No rendezvous attached; drop everything
    #[default]
    None,
    /// Mirror into the per-connection slot and the aggregate block
    Shm {
        rendezvous: Arc<Rendezvous>,
        slot: usize,
    },
}

impl StatsSink {
    pub fn rendezvous(&self) -> Option<&Arc<Rendezvous>> {
        match self {
            StatsSink::None => None,
            StatsSink::Shm { rendezvous, .. } => Some(rendezvous),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        if let StatsSink::Shm { rendezvous, slot } = self {
            rendezvous.set_slot_state(*slot, state);
        }
    }

    pub fn set_db_up(&self, up: bool) {
        if let StatsSink::Shm { rendezvous, slot } = self {
            rendezvous.update_slot(*slot, |s| s.db_up = up as u8);
        }
    }

    /// Bump one command counter on the slot
    pub fn count_command<F>(&self, f: F)
    where
        F: FnOnce(&mut sqlrelay_rendezvous::CommandCounters),
    {
        if let StatsSink::Shm { rendezvous, slot } = self {
            rendezvous.update_slot(*slot, |s| {
                f(&mut s.commands);
                s.last_activity_usec = now_usec();
            });
        }
    }

    /// Stamp the slot with the backend log-in time
    pub fn update_logged_in(&self) {
        if let StatsSink::Shm { rendezvous, slot } = self {
            rendezvous.update_slot(*slot, |s| s.logged_in_usec = now_usec());
        }
    }

    pub fn set_client_addr(&self, addr: &str) {
        if let StatsSink::Shm { rendezvous, slot } = self {
            rendezvous.update_slot(*slot, |s| s.set_client_addr(addr));
        }
    }

    pub fn set_client_info(&self, info: &[u8]) {
        if let StatsSink::Shm { rendezvous, slot } = self {
            rendezvous.update_slot(*slot, |s| s.set_client_info(info));
        }
    }

    pub fn set_sql_text(&self, sql: &[u8]) {
        if let StatsSink::Shm { rendezvous, slot } = self {
            rendezvous.update_slot(*slot, |s| s.set_sql_text(sql));
        }
    }

    /// Count one executed query in the aggregate block and the QPS ring
    pub fn record_query(&self, sql: &[u8]) {
        if let StatsSink::Shm { rendezvous, .. } = self {
            if let Err(e) = rendezvous.record_query(QpsClass::classify(sql)) {
                warn!(error = %e, "failed to record query stats");
            }
        }
    }

    pub fn record_error(&self) {
        if let StatsSink::Shm { rendezvous, .. } = self {
            if let Err(e) = rendezvous.record_error() {
                warn!(error = %e, "failed to record error stats");
            }
        }
    }

    pub fn with_aggregate<F>(&self, f: F)
    where
        F: FnOnce(&mut sqlrelay_rendezvous::AggregateStats),
    {
        if let StatsSink::Shm { rendezvous, .. } = self {
            if let Err(e) = rendezvous.with_stats(f) {
                warn!(error = %e, "failed to update aggregate stats");
            }
        }
    }
}

fn now_usec() -> i64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => d.as_micros() as i64,
        Err(_) => 0,
    }
}
