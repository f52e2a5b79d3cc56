//! The dynamic-scaling control loop
//!
//! Wakes on the scaler semaphore (posted on every session release and on
//! the listener's all-busy flag) or on a periodic tick. Each pass: reap
//! exited children, free the slots of crashed daemons, recover a dead
//! announcer, grow the fleet when clients are queuing, and retire idle
//! daemons past their TTL.

use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use sqlrelay_common::{InstanceConfig, InstanceDirs, RelayError, Result};
use sqlrelay_rendezvous::{ConnectionState, Rendezvous};
use tracing::{debug, info, warn};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

pub fn install_signal_handlers() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet};
    let action = SigAction::new(
        SigHandler::Handler(handle_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGTERM, &action).map_err(RelayError::SystemError)?;
        sigaction(Signal::SIGINT, &action).map_err(RelayError::SystemError)?;
    }
    Ok(())
}

fn shutting_down() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// How many daemons to spawn right now; pure so it can be tested
pub fn grow_decision(
    total: i32,
    in_use: i32,
    all_busy: bool,
    max_queue_length: u32,
    max_connections: u32,
    grow_by: u32,
) -> u32 {
    let pressed = all_busy || in_use + max_queue_length as i32 > total;
    if !pressed || total >= max_connections as i32 {
        return 0;
    }
    let headroom = (max_connections as i32 - total).max(0) as u32;
    grow_by.min(headroom)
}

/// The scaler process
pub struct Scaler {
    cfg: InstanceConfig,
    dirs: InstanceDirs,
    rendezvous: Rendezvous,
    config_path: Option<PathBuf>,
    children: Vec<Child>,
}

impl Scaler {
    pub fn new(cfg: InstanceConfig, config_path: Option<PathBuf>) -> Result<Self> {
        let dirs = InstanceDirs::new(&cfg.run_dir, &cfg.id);
        let rendezvous = Rendezvous::open(&dirs.shm_name())
            .map_err(|e| RelayError::RendezvousError(e.to_string()))?;
        Ok(Self {
            cfg,
            dirs,
            rendezvous,
            config_path,
            children: Vec::new(),
        })
    }

    pub fn run(&mut self) -> Result<()> {
        let interval = Duration::from_secs(self.cfg.connections.scaler_interval_secs.max(1));
        info!(
            interval_secs = interval.as_secs(),
            max = self.cfg.connections.max_connections,
            "scaler running"
        );

        while !shutting_down() {
            let woken = self
                .rendezvous
                .wait_scaler_tick(interval)
                .map_err(|e| RelayError::RendezvousError(e.to_string()))?;
            if shutting_down() {
                break;
            }
            debug!(woken, "scaler pass");

            self.reap_children();
            self.sweep_dead_slots();
            let _ = self
                .rendezvous
                .recover_dead_announcer(|pid| process_alive(pid));

            self.maybe_grow()?;
            self.retire_idle();
        }

        info!("scaler shutting down");
        Ok(())
    }

    fn reap_children(&mut self) {
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = child.id(), %status, "daemon child exited");
                false
            }
            Ok(None) => true,
            Err(_) => false,
        });
    }

    /// Free slots whose daemon died without cleaning up
    fn sweep_dead_slots(&self) {
        let slots = match self.rendezvous.slots_snapshot() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "could not snapshot slots");
                return;
            }
        };
        for (index, slot) in slots {
            if !process_alive(slot.pid) {
                warn!(pid = slot.pid, index, "freeing slot of dead daemon");
                let _ = self.rendezvous.release_slot(index);
                let _ = self.rendezvous.decrement_total_connections();
                let _ = std::fs::remove_file(self.dirs.handoff_socket(slot.pid));
            }
        }
    }

    fn maybe_grow(&mut self) -> Result<()> {
        let (total, in_use) = self
            .rendezvous
            .connection_counts()
            .map_err(|e| RelayError::RendezvousError(e.to_string()))?;
        let all_busy = self.rendezvous.all_dbs_busy();

        let spawn = grow_decision(
            total,
            in_use,
            all_busy,
            self.cfg.connections.max_queue_length,
            self.cfg.connections.max_connections,
            self.cfg.connections.grow_by.max(1),
        );

        if spawn > 0 {
            info!(total, in_use, spawn, "growing the fleet");
            for _ in 0..spawn {
                match self.spawn_daemon() {
                    Ok(child) => self.children.push(child),
                    Err(e) => {
                        warn!(error = %e, "failed to spawn daemon");
                        break;
                    }
                }
            }
        }

        if all_busy {
            self.rendezvous.set_all_dbs_busy(false);
            let _ = self.rendezvous.signal_scaler_done();
        }
        Ok(())
    }

    /// Ask daemons idle past the TTL to finish up, but never below the
    /// configured floor
    fn retire_idle(&self) {
        let ttl = self.cfg.connections.ttl_secs;
        if ttl == 0 {
            return;
        }
        let (total, _) = match self.rendezvous.connection_counts() {
            Ok(c) => c,
            Err(_) => return,
        };
        let floor = self.cfg.connections.connections as i32;
        let mut excess = total - floor;
        if excess <= 0 {
            return;
        }

        let slots = match self.rendezvous.slots_snapshot() {
            Ok(s) => s,
            Err(_) => return,
        };
        let now = now_usec();
        for (_, slot) in slots {
            if excess == 0 {
                break;
            }
            let idle_state = matches!(
                slot.state(),
                ConnectionState::AnnounceAvailability
                    | ConnectionState::WaitClient
                    | ConnectionState::WaitSemaphore
            );
            let idle_secs = (now - slot.last_activity_usec) / 1_000_000;
            if idle_state && idle_secs > ttl as i64 {
                info!(pid = slot.pid, idle_secs, "retiring idle daemon");
                let _ = kill(Pid::from_raw(slot.pid as i32), Signal::SIGTERM);
                excess -= 1;
            }
        }
    }

    fn spawn_daemon(&self) -> Result<Child> {
        let program = sibling_binary("sqlr-connection");
        let mut command = Command::new(program);
        command
            .arg("--id")
            .arg(&self.cfg.id)
            .arg("--scaler-spawned");
        if let Some(path) = &self.config_path {
            command.arg("--config").arg(path);
        }
        let child = command.spawn()?;
        debug!(pid = child.id(), "spawned daemon");
        Ok(child)
    }
}

/// Resolve a companion binary next to the running one, falling back to
/// PATH lookup
pub fn sibling_binary(name: &str) -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(name))
}

fn process_alive(pid: u32) -> bool {
    pid != 0 && kill(Pid::from_raw(pid as i32), None).is_ok()
}

fn now_usec() -> i64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => d.as_micros() as i64,
        Err(_) => 0,
    }
}
