//! The rendezvous operation surface
//!
//! Everything the listener, daemons, and the scaler may do to the shared
//! block. The semaphore protocol:
//!
//! - A daemon holds `AnnounceMutex` for its whole announce sequence, so
//!   announcements form a FIFO across daemons.
//! - The announcing daemon writes its fields under the exclusive write
//!   gate, posts `ListenerReady`, and blocks on `ListenerDone` until the
//!   listener has copied the fields.
//! - Readers of the block take `ShmReaderMutex` to bump the reader count;
//!   the first reader in takes `ShmWriteGate`, the last one out releases
//!   it, so readers overlap and writers wait for all of them.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::layout::{
    now_sec, now_usec, AggregateStats, ConnSlot, ConnectionState, HandoffInfo, QpsClass,
    ShmBlock, MAX_CONNECTION_ID_LEN, MAX_UNIX_SOCKET_LEN, STAT_MAX_CONNECTIONS,
};
use crate::sem::{self, Sem};
use crate::shm::Segment;
use crate::{RendezvousError, Result};

/// How the listener reaches the announcing daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffData {
    /// Daemon pid; names its hand-off socket
    pub pid: u32,
    /// Direct-connect TCP port, when the daemon listens on one
    pub inet_port: u16,
    /// Direct-connect UNIX socket path, when the daemon listens on one
    pub unix_socket: String,
}

/// One consumed announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub connection_id: String,
    pub handoff: HandoffData,
}

/// Holds shared read access to the block; releases on drop
pub struct ReadGuard<'a> {
    rv: &'a Rendezvous,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        // Nothing sane to do on failure during unwind
        let _ = self.rv.release_shm_read_access();
    }
}

/// One process's attachment to the instance rendezvous
pub struct Rendezvous {
    seg: Segment,
}

impl Rendezvous {
    /// Create the segment; listener only
    pub fn create(name: &str) -> Result<Self> {
        Ok(Self {
            seg: Segment::create(name)?,
        })
    }

    /// Attach to an existing segment; daemons, scaler, monitors
    pub fn open(name: &str) -> Result<Self> {
        Ok(Self {
            seg: Segment::open(name)?,
        })
    }

    pub fn name(&self) -> &str {
        self.seg.name()
    }

    pub fn is_owner(&self) -> bool {
        self.seg.is_owner()
    }

    fn block(&self) -> *mut ShmBlock {
        self.seg.block()
    }

    fn sem_ptr(&self, s: Sem) -> *mut libc::sem_t {
        unsafe { std::ptr::addr_of_mut!((*self.block()).sems[s as usize]) }
    }

    fn sem_wait(&self, s: Sem) -> Result<()> {
        unsafe { sem::wait(self.sem_ptr(s)) }
    }

    fn sem_try_wait(&self, s: Sem) -> Result<bool> {
        unsafe { sem::try_wait(self.sem_ptr(s)) }
    }

    fn sem_timed_wait(&self, s: Sem, timeout: Duration) -> Result<bool> {
        unsafe { sem::timed_wait(self.sem_ptr(s), timeout) }
    }

    fn sem_post(&self, s: Sem) -> Result<()> {
        unsafe { sem::post(self.sem_ptr(s)) }
    }

    // -----------------------------------------------------------------
    // Shared/exclusive access to the block
    // -----------------------------------------------------------------

    /// Take shared read access; readers may overlap
    pub fn read_access(&self) -> Result<ReadGuard<'_>> {
        self.acquire_shm_read_access()?;
        Ok(ReadGuard { rv: self })
    }

    fn acquire_shm_read_access(&self) -> Result<()> {
        self.sem_wait(Sem::ShmReaderMutex)?;
        let block = self.block();
        unsafe {
            let readers = std::ptr::addr_of_mut!((*block).shm_readers);
            *readers += 1;
            if *readers == 1 {
                if let Err(e) = self.sem_wait(Sem::ShmWriteGate) {
                    *readers -= 1;
                    let _ = self.sem_post(Sem::ShmReaderMutex);
                    return Err(e);
                }
            }
        }
        self.sem_post(Sem::ShmReaderMutex)
    }

    fn release_shm_read_access(&self) -> Result<()> {
        self.sem_wait(Sem::ShmReaderMutex)?;
        let block = self.block();
        unsafe {
            let readers = std::ptr::addr_of_mut!((*block).shm_readers);
            *readers = readers.read().saturating_sub(1);
            if *readers == 0 {
                self.sem_post(Sem::ShmWriteGate)?;
            }
        }
        self.sem_post(Sem::ShmReaderMutex)
    }

    // -----------------------------------------------------------------
    // Announce sequence (daemon side)
    // -----------------------------------------------------------------

    /// Queue for the right to announce; `Ok(false)` on tick expiry so the
    /// caller can re-check its shutdown flag
    pub fn acquire_announce_mutex(&self, tick: Duration) -> Result<bool> {
        self.sem_timed_wait(Sem::AnnounceMutex, tick)
    }

    pub fn release_announce_mutex(&self) -> Result<()> {
        self.sem_post(Sem::AnnounceMutex)
    }

    /// Write this daemon's id and handoff fields; caller must hold the
    /// announce mutex
    pub fn write_announcement(&self, connection_id: &str, handoff: &HandoffData) -> Result<()> {
        self.sem_wait(Sem::ShmWriteGate)?;
        let block = self.block();
        unsafe {
            let id_len = connection_id.len().min(MAX_CONNECTION_ID_LEN);
            (&mut (*block).connection_id)[..id_len]
                .copy_from_slice(&connection_id.as_bytes()[..id_len]);
            (*block).connection_id_len = id_len as u32;

            let info: &mut HandoffInfo = &mut (*block).handoff;
            info.pid = handoff.pid;
            info.inet_port = handoff.inet_port;
            let sock_len = handoff.unix_socket.len().min(MAX_UNIX_SOCKET_LEN);
            info.unix_socket[..sock_len]
                .copy_from_slice(&handoff.unix_socket.as_bytes()[..sock_len]);
            info.unix_socket_len = sock_len as u16;
        }
        self.sem_post(Sem::ShmWriteGate)
    }

    /// Tell the listener an announcement is ready to be read
    pub fn signal_listener_ready(&self) -> Result<()> {
        self.sem_post(Sem::ListenerReady)
    }

    /// Block until the listener has copied the announcement; `Ok(false)`
    /// on tick expiry
    pub fn wait_listener_done(&self, tick: Duration) -> Result<bool> {
        self.sem_timed_wait(Sem::ListenerDone, tick)
    }

    // -----------------------------------------------------------------
    // Announce sequence (listener side)
    // -----------------------------------------------------------------

    /// Wait for a daemon to announce and copy its fields; `Ok(None)` on
    /// timeout. The caller must follow up with
    /// [`Rendezvous::signal_listener_done`] once it has claimed the
    /// daemon.
    pub fn wait_for_announcement(&self, timeout: Duration) -> Result<Option<Announcement>> {
        if !self.sem_timed_wait(Sem::ListenerReady, timeout)? {
            return Ok(None);
        }
        let ann = {
            let _guard = self.read_access()?;
            let block = self.block();
            unsafe {
                let id_len = ((*block).connection_id_len as usize).min(MAX_CONNECTION_ID_LEN);
                let connection_id =
                    String::from_utf8_lossy(&(&(*block).connection_id)[..id_len]).into_owned();
                let info: &HandoffInfo = &(*block).handoff;
                let sock_len = (info.unix_socket_len as usize).min(MAX_UNIX_SOCKET_LEN);
                Announcement {
                    connection_id,
                    handoff: HandoffData {
                        pid: info.pid,
                        inet_port: info.inet_port,
                        unix_socket: String::from_utf8_lossy(&info.unix_socket[..sock_len])
                            .into_owned(),
                    },
                }
            }
        };
        Ok(Some(ann))
    }

    /// Release the announcing daemon
    pub fn signal_listener_done(&self) -> Result<()> {
        self.sem_post(Sem::ListenerDone)
    }

    /// Retract an announcement: consume our own ready signal if the
    /// listener has not claimed it yet. `Ok(true)` means the retraction
    /// succeeded and the daemon may exit; `Ok(false)` means a listener is
    /// mid-claim and the handshake must be completed.
    pub fn try_retract_announcement(&self) -> Result<bool> {
        self.sem_try_wait(Sem::ListenerReady)
    }

    // -----------------------------------------------------------------
    // Fleet counters
    // -----------------------------------------------------------------

    pub fn increment_total_connections(&self) -> Result<i32> {
        self.sem_wait(Sem::ConnectionCountMutex)?;
        let v = unsafe { &(*self.block()).total_connections }.fetch_add(1, Ordering::SeqCst) + 1;
        self.sem_post(Sem::ConnectionCountMutex)?;
        Ok(v)
    }

    pub fn decrement_total_connections(&self) -> Result<i32> {
        self.sem_wait(Sem::ConnectionCountMutex)?;
        let v = unsafe { &(*self.block()).total_connections }.fetch_sub(1, Ordering::SeqCst) - 1;
        self.sem_post(Sem::ConnectionCountMutex)?;
        Ok(v)
    }

    pub fn increment_connections_in_use(&self) -> Result<i32> {
        self.sem_wait(Sem::ConnectionCountMutex)?;
        let v = unsafe { &(*self.block()).connections_in_use }.fetch_add(1, Ordering::SeqCst) + 1;
        self.sem_post(Sem::ConnectionCountMutex)?;
        self.record_session_peak(v);
        Ok(v)
    }

    /// Decrement in-use and wake the scaler's poll
    pub fn decrement_connections_in_use(&self) -> Result<i32> {
        self.sem_wait(Sem::ConnectionCountMutex)?;
        let v = unsafe { &(*self.block()).connections_in_use }.fetch_sub(1, Ordering::SeqCst) - 1;
        self.sem_post(Sem::ConnectionCountMutex)?;
        self.signal_scaler()?;
        Ok(v)
    }

    /// A consistent (total, in_use) pair
    pub fn connection_counts(&self) -> Result<(i32, i32)> {
        self.sem_wait(Sem::ConnectionCountMutex)?;
        let block = self.block();
        let total = unsafe { &(*block).total_connections }.load(Ordering::SeqCst);
        let in_use = unsafe { &(*block).connections_in_use }.load(Ordering::SeqCst);
        self.sem_post(Sem::ConnectionCountMutex)?;
        Ok((total, in_use))
    }

    pub fn set_all_dbs_busy(&self, busy: bool) {
        unsafe { &(*self.block()).all_dbs_busy }.store(busy as u8, Ordering::SeqCst);
    }

    pub fn all_dbs_busy(&self) -> bool {
        unsafe { &(*self.block()).all_dbs_busy }.load(Ordering::SeqCst) != 0
    }

    // -----------------------------------------------------------------
    // Scaler signalling
    // -----------------------------------------------------------------

    pub fn signal_scaler(&self) -> Result<()> {
        self.sem_post(Sem::ScalerWake)
    }

    /// Scaler's timed poll; `Ok(true)` when woken by a signal
    pub fn wait_scaler_tick(&self, interval: Duration) -> Result<bool> {
        self.sem_timed_wait(Sem::ScalerWake, interval)
    }

    pub fn signal_scaler_done(&self) -> Result<()> {
        self.sem_post(Sem::ScalerDone)
    }

    /// Listener-side wait for the scaler to act on an all-busy flag
    pub fn wait_scaler_done(&self, timeout: Duration) -> Result<bool> {
        self.sem_timed_wait(Sem::ScalerDone, timeout)
    }

    /// Free the announce mutex left held by a daemon that died
    /// mid-announce. The scaler calls this with a liveness probe; returns
    /// `true` if recovery happened.
    pub fn recover_dead_announcer<F: Fn(u32) -> bool>(&self, is_alive: F) -> Result<bool> {
        if self.sem_try_wait(Sem::AnnounceMutex)? {
            // Nobody was announcing; put it back.
            self.sem_post(Sem::AnnounceMutex)?;
            return Ok(false);
        }
        let pid = {
            let _guard = self.read_access()?;
            unsafe { (*self.block()).handoff.pid }
        };
        if pid != 0 && !is_alive(pid) {
            // Drain a ready signal the dead daemon may have left behind.
            let _ = self.sem_try_wait(Sem::ListenerReady)?;
            self.sem_post(Sem::AnnounceMutex)?;
            return Ok(true);
        }
        Ok(false)
    }

    // -----------------------------------------------------------------
    // Forked listener accounting
    // -----------------------------------------------------------------

    pub fn increment_forked_listeners(&self) -> Result<i32> {
        self.sem_wait(Sem::ListenerCountMutex)?;
        let v = unsafe { &(*self.block()).forked_listeners }.fetch_add(1, Ordering::SeqCst) + 1;
        self.sem_post(Sem::ListenerCountMutex)?;
        self.with_stats(|stats| {
            if v as u32 > stats.peak_listeners {
                stats.peak_listeners = v as u32;
            }
            if v as u32 > stats.peak_listeners_1min
                || now_sec() - stats.peak_listeners_1min_time >= 60
            {
                stats.peak_listeners_1min = v as u32;
                stats.peak_listeners_1min_time = now_sec();
            }
        })?;
        Ok(v)
    }

    pub fn decrement_forked_listeners(&self) -> Result<i32> {
        self.sem_wait(Sem::ListenerCountMutex)?;
        let v = unsafe { &(*self.block()).forked_listeners }.fetch_sub(1, Ordering::SeqCst) - 1;
        self.sem_post(Sem::ListenerCountMutex)?;
        Ok(v)
    }

    pub fn forked_listeners(&self) -> i32 {
        unsafe { &(*self.block()).forked_listeners }.load(Ordering::SeqCst)
    }

    pub fn increment_max_listener_errors(&self) -> Result<u64> {
        let mut after = 0;
        self.with_stats(|stats| {
            stats.max_listener_errors += 1;
            after = stats.max_listener_errors;
        })?;
        Ok(after)
    }

    // -----------------------------------------------------------------
    // Aggregate statistics
    // -----------------------------------------------------------------

    /// Mutate the aggregate stats under the stats mutex
    pub fn with_stats<F: FnOnce(&mut AggregateStats)>(&self, f: F) -> Result<()> {
        self.sem_wait(Sem::StatsMutex)?;
        unsafe {
            f(&mut (*self.block()).stats);
        }
        self.sem_post(Sem::StatsMutex)
    }

    /// Snapshot the aggregate stats under shared read access
    pub fn read_stats(&self) -> Result<AggregateStats> {
        let _guard = self.read_access()?;
        Ok(unsafe { (*self.block()).stats })
    }

    /// Count one query in the totals and the per-second ring
    pub fn record_query(&self, class: QpsClass) -> Result<()> {
        let now = now_sec();
        self.with_stats(|stats| {
            stats.total_queries += 1;
            stats.qps.record(class, now);
        })
    }

    pub fn record_error(&self) -> Result<()> {
        self.with_stats(|stats| stats.total_errors += 1)
    }

    fn record_session_peak(&self, in_use: i32) {
        let _ = self.with_stats(|stats| {
            if in_use as u32 > stats.peak_sessions {
                stats.peak_sessions = in_use as u32;
            }
            if in_use as u32 > stats.peak_sessions_1min
                || now_sec() - stats.peak_sessions_1min_time >= 60
            {
                stats.peak_sessions_1min = in_use as u32;
                stats.peak_sessions_1min_time = now_sec();
            }
        });
    }

    // -----------------------------------------------------------------
    // Per-connection slots
    // -----------------------------------------------------------------

    /// Claim a free slot for a daemon; linear scan under the registry
    /// mutex
    pub fn reserve_slot(&self, pid: u32) -> Result<usize> {
        self.sem_wait(Sem::SlotRegistryMutex)?;
        let block = self.block();
        let mut found = None;
        unsafe {
            for i in 0..STAT_MAX_CONNECTIONS {
                let slot = std::ptr::addr_of_mut!((*block).slots[i]);
                if (*slot).pid == 0 {
                    std::ptr::write_bytes(slot, 0, 1);
                    (*slot).pid = pid;
                    (*slot).state = ConnectionState::Init as u32;
                    (*slot).state_start_usec = now_usec();
                    (*slot).last_activity_usec = now_usec();
                    found = Some(i);
                    break;
                }
            }
        }
        self.sem_post(Sem::SlotRegistryMutex)?;
        found.ok_or(RendezvousError::NoFreeSlot(STAT_MAX_CONNECTIONS))
    }

    /// Free a slot at daemon exit (or by the scaler after a crash)
    pub fn release_slot(&self, index: usize) -> Result<()> {
        if index >= STAT_MAX_CONNECTIONS {
            return Ok(());
        }
        self.sem_wait(Sem::SlotRegistryMutex)?;
        unsafe {
            let slot = std::ptr::addr_of_mut!((*self.block()).slots[index]);
            std::ptr::write_bytes(slot, 0, 1);
        }
        self.sem_post(Sem::SlotRegistryMutex)
    }

    /// Mutate one slot; only the owning daemon should call this
    pub fn update_slot<F: FnOnce(&mut ConnSlot)>(&self, index: usize, f: F) {
        if index >= STAT_MAX_CONNECTIONS {
            return;
        }
        unsafe {
            f(&mut (*self.block()).slots[index]);
        }
    }

    /// Record a state transition with its timestamp
    pub fn set_slot_state(&self, index: usize, state: ConnectionState) {
        self.update_slot(index, |slot| {
            slot.state = state as u32;
            slot.state_start_usec = now_usec();
            slot.last_activity_usec = now_usec();
        });
    }

    /// Copy one slot out
    pub fn read_slot(&self, index: usize) -> Option<ConnSlot> {
        if index >= STAT_MAX_CONNECTIONS {
            return None;
        }
        Some(unsafe { (*self.block()).slots[index] })
    }

    /// Snapshot all occupied slots under shared read access
    pub fn slots_snapshot(&self) -> Result<Vec<(usize, ConnSlot)>> {
        let _guard = self.read_access()?;
        let block = self.block();
        let mut out = Vec::new();
        unsafe {
            for i in 0..STAT_MAX_CONNECTIONS {
                let slot = (*block).slots[i];
                if slot.pid != 0 {
                    out.push((i, slot));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn unique_name(tag: &str) -> String {
        format!("/sqlrelay-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn create_open_and_counters() {
        let name = unique_name("counters");
        let owner = Rendezvous::create(&name).unwrap();
        let peer = Rendezvous::open(&name).unwrap();

        assert_eq!(owner.increment_total_connections().unwrap(), 1);
        assert_eq!(peer.increment_total_connections().unwrap(), 2);
        assert_eq!(peer.increment_connections_in_use().unwrap(), 1);
        assert_eq!(owner.connection_counts().unwrap(), (2, 1));
        assert_eq!(owner.decrement_connections_in_use().unwrap(), 0);

        // The decrement must have signalled the scaler
        assert!(owner
            .wait_scaler_tick(Duration::from_millis(10))
            .unwrap());
    }

    #[test]
    fn open_missing_segment_fails() {
        match Rendezvous::open("/sqlrelay-test-definitely-missing") {
            Err(RendezvousError::Missing(_)) => {}
            other => panic!("expected Missing, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn slot_reserve_and_release() {
        let name = unique_name("slots");
        let rv = Rendezvous::create(&name).unwrap();

        let a = rv.reserve_slot(101).unwrap();
        let b = rv.reserve_slot(102).unwrap();
        assert_ne!(a, b);
        assert_eq!(rv.read_slot(a).unwrap().pid, 101);

        rv.set_slot_state(a, ConnectionState::SessionStart);
        assert_eq!(
            rv.read_slot(a).unwrap().state(),
            ConnectionState::SessionStart
        );

        rv.release_slot(a).unwrap();
        assert_eq!(rv.read_slot(a).unwrap().pid, 0);
        let c = rv.reserve_slot(103).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn announce_handshake() {
        let name = unique_name("announce");
        let rv = Arc::new(Rendezvous::create(&name).unwrap());

        let daemon = Arc::clone(&rv);
        let announcer = std::thread::spawn(move || {
            assert!(daemon
                .acquire_announce_mutex(Duration::from_secs(5))
                .unwrap());
            daemon
                .write_announcement(
                    "pool-a",
                    &HandoffData {
                        pid: 4242,
                        inet_port: 0,
                        unix_socket: "/tmp/sock".into(),
                    },
                )
                .unwrap();
            daemon.signal_listener_ready().unwrap();
            assert!(daemon.wait_listener_done(Duration::from_secs(5)).unwrap());
            daemon.release_announce_mutex().unwrap();
        });

        let ann = rv
            .wait_for_announcement(Duration::from_secs(5))
            .unwrap()
            .expect("announcement");
        assert_eq!(ann.connection_id, "pool-a");
        assert_eq!(ann.handoff.pid, 4242);
        assert_eq!(ann.handoff.unix_socket, "/tmp/sock");
        rv.increment_connections_in_use().unwrap();
        rv.signal_listener_done().unwrap();

        announcer.join().unwrap();
        assert_eq!(rv.connection_counts().unwrap().1, 1);
    }

    #[test]
    fn announcements_are_fifo() {
        let name = unique_name("fifo");
        let rv = Arc::new(Rendezvous::create(&name).unwrap());

        let mut handles = Vec::new();
        for pid in [1u32, 2, 3] {
            let daemon = Arc::clone(&rv);
            handles.push(std::thread::spawn(move || {
                assert!(daemon
                    .acquire_announce_mutex(Duration::from_secs(10))
                    .unwrap());
                daemon
                    .write_announcement(
                        "pool",
                        &HandoffData {
                            pid,
                            inet_port: 0,
                            unix_socket: String::new(),
                        },
                    )
                    .unwrap();
                daemon.signal_listener_ready().unwrap();
                assert!(daemon.wait_listener_done(Duration::from_secs(10)).unwrap());
                daemon.release_announce_mutex().unwrap();
            }));
            // Give each announcer time to queue in spawn order
            std::thread::sleep(Duration::from_millis(50));
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let ann = rv
                .wait_for_announcement(Duration::from_secs(10))
                .unwrap()
                .expect("announcement");
            seen.push(ann.handoff.pid);
            rv.signal_listener_done().unwrap();
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], 1, "first queued daemon must be served first");
    }

    #[test]
    fn stats_and_qps() {
        let name = unique_name("stats");
        let rv = Rendezvous::create(&name).unwrap();

        rv.record_query(QpsClass::Select).unwrap();
        rv.record_query(QpsClass::Select).unwrap();
        rv.record_query(QpsClass::Insert).unwrap();
        rv.record_error().unwrap();

        let stats = rv.read_stats().unwrap();
        assert_eq!(stats.total_queries, 3);
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.qps.total(QpsClass::Select, now_sec(), 10), 2);
    }

    #[test]
    fn dead_announcer_is_recovered() {
        let name = unique_name("recover");
        let rv = Rendezvous::create(&name).unwrap();

        // Simulate a daemon that died while holding the announce mutex
        assert!(rv.acquire_announce_mutex(Duration::from_secs(1)).unwrap());
        rv.write_announcement(
            "pool",
            &HandoffData {
                pid: 999_999,
                inet_port: 0,
                unix_socket: String::new(),
            },
        )
        .unwrap();
        rv.signal_listener_ready().unwrap();

        assert!(rv.recover_dead_announcer(|_pid| false).unwrap());
        // The mutex is usable again
        assert!(rv.acquire_announce_mutex(Duration::from_secs(1)).unwrap());
        rv.release_announce_mutex().unwrap();
    }
}
