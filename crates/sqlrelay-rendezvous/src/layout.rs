//! In-segment data layout
//!
//! A `#[repr(C)]` struct laid over the mapping rather than offset
//! arithmetic, so every process agrees on alignment. Sizes here are part
//! of the cross-process contract: changing any of them requires restarting
//! the whole instance.

use std::sync::atomic::{AtomicI32, AtomicU8};

/// Longest announced connection id
pub const MAX_CONNECTION_ID_LEN: usize = 1024;
/// Longest UNIX socket path carried in the handoff fields
pub const MAX_UNIX_SOCKET_LEN: usize = 256;
/// Per-connection stat slots in the segment
pub const STAT_MAX_CONNECTIONS: usize = 100;
/// Seconds of per-second query counters kept in the ring
pub const STAT_QPS_KEEP: usize = 900;
/// Bytes of the last SQL text kept per slot
pub const STAT_SQL_TEXT_LEN: usize = 300;
/// Bytes of the last client info kept per slot
pub const STAT_CLIENT_INFO_LEN: usize = 256;
/// Bytes of the last client address kept per slot
pub const STAT_CLIENT_ADDR_LEN: usize = 46;
/// Semaphores in the set
pub const SEM_COUNT: usize = 13;

const SHM_MAGIC: u32 = 0x53_51_4c_52; // "SQLR"

/// Where a daemon is in its lifecycle, mirrored into its slot for monitors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConnectionState {
    NotAvailable = 0,
    Init = 1,
    WaitForAvailDb = 2,
    WaitClient = 3,
    SessionStart = 4,
    GetCommand = 5,
    ProcessSql = 6,
    ReturnResultSet = 7,
    SessionEnd = 8,
    AnnounceAvailability = 9,
    WaitSemaphore = 10,
}

impl ConnectionState {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Init,
            2 => Self::WaitForAvailDb,
            3 => Self::WaitClient,
            4 => Self::SessionStart,
            5 => Self::GetCommand,
            6 => Self::ProcessSql,
            7 => Self::ReturnResultSet,
            8 => Self::SessionEnd,
            9 => Self::AnnounceAvailability,
            10 => Self::WaitSemaphore,
            _ => Self::NotAvailable,
        }
    }
}

/// Query class for the per-second counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpsClass {
    Select = 0,
    Insert = 1,
    Update = 2,
    Delete = 3,
    Other = 4,
}

impl QpsClass {
    /// Classify a query by its first keyword; anything unrecognized is
    /// `Other`. Queries are otherwise opaque to the core.
    pub fn classify(query: &[u8]) -> Self {
        let text = query
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .map(|i| &query[i..])
            .unwrap_or(&[]);
        let keyword: Vec<u8> = text
            .iter()
            .take(6)
            .map(|b| b.to_ascii_lowercase())
            .collect();
        match keyword.as_slice() {
            b"select" => Self::Select,
            b"insert" => Self::Insert,
            b"update" => Self::Update,
            b"delete" => Self::Delete,
            _ => Self::Other,
        }
    }
}

/// Per-second sampled query counters over a sliding window
#[derive(Clone, Copy)]
#[repr(C)]
pub struct QpsRing {
    pub timestamp: [i64; STAT_QPS_KEEP],
    pub counts: [[u32; STAT_QPS_KEEP]; 5],
}

impl QpsRing {
    /// Record one query at `now` (epoch seconds). Stale ring entries are
    /// reset as the window wraps, which keeps each second's counter
    /// monotonic for readers sampling the same second.
    pub fn record(&mut self, class: QpsClass, now: i64) {
        let idx = (now.rem_euclid(STAT_QPS_KEEP as i64)) as usize;
        if self.timestamp[idx] != now {
            self.timestamp[idx] = now;
            for counts in self.counts.iter_mut() {
                counts[idx] = 0;
            }
        }
        self.counts[class as usize][idx] += 1;
    }

    /// Total queries of one class recorded in the last `window` seconds
    pub fn total(&self, class: QpsClass, now: i64, window: i64) -> u64 {
        let mut sum = 0u64;
        for i in 0..STAT_QPS_KEEP {
            if now - self.timestamp[i] < window {
                sum += self.counts[class as usize][i] as u64;
            }
        }
        sum
    }
}

/// Aggregate statistics, written by daemons and the listener under the
/// stats mutex, read by monitors under shared read access
#[derive(Clone, Copy)]
#[repr(C)]
pub struct AggregateStats {
    pub start_time: i64,

    pub open_server_connections: i64,
    pub opened_server_connections: i64,
    pub open_client_connections: i64,
    pub opened_client_connections: i64,
    pub open_cursors: i64,
    pub opened_cursors: i64,
    pub times_new_cursor_used: i64,
    pub times_cursor_reused: i64,

    pub total_queries: i64,
    pub total_errors: i64,

    pub max_listener_errors: u64,

    pub peak_listeners: u32,
    pub peak_sessions: u32,
    pub peak_listeners_1min: u32,
    pub peak_sessions_1min: u32,
    pub peak_listeners_1min_time: i64,
    pub peak_sessions_1min_time: i64,

    pub qps: QpsRing,
}

/// Per-command counters for one daemon slot
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CommandCounters {
    pub authenticate: u64,
    pub ping: u64,
    pub identify: u64,
    pub autocommit: u64,
    pub begin: u64,
    pub commit: u64,
    pub rollback: u64,
    pub new_query: u64,
    pub reexecute_query: u64,
    pub fetch_from_bind_cursor: u64,
    pub fetch_result_set: u64,
    pub abort_result_set: u64,
    pub suspend_result_set: u64,
    pub resume_result_set: u64,
    pub suspend_session: u64,
    pub end_session: u64,
    pub metadata: u64,
    pub relogin: u64,
}

/// One per-daemon slot; written only by the owning daemon, except for
/// lifecycle reset by the scaler when the daemon is dead
#[derive(Clone, Copy)]
#[repr(C)]
pub struct ConnSlot {
    /// Owning daemon pid; 0 marks the slot free
    pub pid: u32,
    pub state: u32,
    /// Whether the backend session is currently alive
    pub db_up: u8,
    _pad: [u8; 3],

    pub logged_in_usec: i64,
    pub state_start_usec: i64,
    pub command_start_usec: i64,
    pub last_activity_usec: i64,

    pub commands: CommandCounters,

    pub client_addr_len: u16,
    pub client_addr: [u8; STAT_CLIENT_ADDR_LEN],
    pub client_info_len: u16,
    pub client_info: [u8; STAT_CLIENT_INFO_LEN],
    pub sql_text_len: u16,
    pub sql_text: [u8; STAT_SQL_TEXT_LEN],
}

impl ConnSlot {
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u32(self.state)
    }

    pub fn set_client_addr(&mut self, addr: &str) {
        let n = addr.len().min(STAT_CLIENT_ADDR_LEN);
        self.client_addr[..n].copy_from_slice(&addr.as_bytes()[..n]);
        self.client_addr_len = n as u16;
    }

    pub fn set_client_info(&mut self, info: &[u8]) {
        let n = info.len().min(STAT_CLIENT_INFO_LEN);
        self.client_info[..n].copy_from_slice(&info[..n]);
        self.client_info_len = n as u16;
    }

    pub fn set_sql_text(&mut self, sql: &[u8]) {
        let n = sql.len().min(STAT_SQL_TEXT_LEN);
        self.sql_text[..n].copy_from_slice(&sql[..n]);
        self.sql_text_len = n as u16;
    }

    pub fn sql_text(&self) -> String {
        String::from_utf8_lossy(&self.sql_text[..self.sql_text_len as usize]).into_owned()
    }

    pub fn client_info(&self) -> String {
        String::from_utf8_lossy(&self.client_info[..self.client_info_len as usize]).into_owned()
    }

    pub fn client_addr(&self) -> String {
        String::from_utf8_lossy(&self.client_addr[..self.client_addr_len as usize]).into_owned()
    }
}

/// The announcement fields: which daemon is idle and how to reach it
#[derive(Clone, Copy)]
#[repr(C)]
pub struct HandoffInfo {
    pub mode: u8,
    _pad: [u8; 1],
    pub inet_port: u16,
    pub pid: u32,
    pub unix_socket_len: u16,
    pub unix_socket: [u8; MAX_UNIX_SOCKET_LEN],
}

/// The whole segment
#[repr(C)]
pub struct ShmBlock {
    pub magic: u32,
    _pad0: u32,

    /// The semaphore set; see [`crate::Sem`] for slot meanings
    pub sems: [libc::sem_t; SEM_COUNT],

    /// Readers currently holding shared access; guarded by
    /// `Sem::ShmReaderMutex`
    pub shm_readers: u32,
    _pad1: u32,

    pub total_connections: AtomicI32,
    pub connections_in_use: AtomicI32,
    pub forked_listeners: AtomicI32,
    pub busy_listeners: AtomicI32,
    /// Set by the listener when every daemon is busy; cleared by the scaler
    pub all_dbs_busy: AtomicU8,
    _pad2: [u8; 7],

    pub connection_id_len: u32,
    pub connection_id: [u8; MAX_CONNECTION_ID_LEN],
    pub handoff: HandoffInfo,

    pub stats: AggregateStats,
    pub slots: [ConnSlot; STAT_MAX_CONNECTIONS],
}

impl ShmBlock {
    pub const MAGIC: u32 = SHM_MAGIC;

    /// Bytes to allocate for the segment
    pub const fn segment_size() -> usize {
        std::mem::size_of::<ShmBlock>()
    }
}

/// Microseconds since the epoch
pub fn now_usec() -> i64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => d.as_micros() as i64,
        Err(_) => 0,
    }
}

/// Seconds since the epoch
pub fn now_sec() -> i64 {
    now_usec() / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_classification() {
        assert_eq!(QpsClass::classify(b"select * from t"), QpsClass::Select);
        assert_eq!(QpsClass::classify(b"  SELECT 1"), QpsClass::Select);
        assert_eq!(QpsClass::classify(b"insert into t values (1)"), QpsClass::Insert);
        assert_eq!(QpsClass::classify(b"UPDATE t set x=1"), QpsClass::Update);
        assert_eq!(QpsClass::classify(b"delete from t"), QpsClass::Delete);
        assert_eq!(QpsClass::classify(b"create table t (x int)"), QpsClass::Other);
        assert_eq!(QpsClass::classify(b""), QpsClass::Other);
    }

    #[test]
    fn qps_ring_wraps_and_resets() {
        let mut ring: QpsRing = unsafe { std::mem::zeroed() };
        ring.record(QpsClass::Select, 100);
        ring.record(QpsClass::Select, 100);
        assert_eq!(ring.total(QpsClass::Select, 100, 10), 2);

        // The same slot one full window later must reset, not accumulate
        ring.record(QpsClass::Select, 100 + STAT_QPS_KEEP as i64);
        assert_eq!(
            ring.total(QpsClass::Select, 100 + STAT_QPS_KEEP as i64, 10),
            1
        );
    }

    #[test]
    fn slot_text_fields_truncate() {
        let mut slot: ConnSlot = unsafe { std::mem::zeroed() };
        let long_sql = "x".repeat(STAT_SQL_TEXT_LEN + 50);
        slot.set_sql_text(long_sql.as_bytes());
        assert_eq!(slot.sql_text().len(), STAT_SQL_TEXT_LEN);

        slot.set_client_info(b"etl-job-17");
        assert_eq!(slot.client_info(), "etl-job-17");
    }

    #[test]
    fn segment_size_is_stable_enough() {
        // Sanity bound: the segment must stay well under a few megabytes
        let size = ShmBlock::segment_size();
        assert!(size > 100 * 1024, "suspiciously small: {}", size);
        assert!(size < 8 * 1024 * 1024, "suspiciously large: {}", size);
    }
}
