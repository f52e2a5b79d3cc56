//! Daemon process lifecycle
//!
//! Spawned → back-end log-in → slot registration → announce/serve loop →
//! exit on TTL or signal. Signal handlers only set a flag; every blocking
//! wait uses a timeout and the loops re-check the flag, so shutdown is
//! always an orderly fall-through of the main loop.

use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use sqlrelay_common::auth::StaticUserList;
use sqlrelay_common::config::{ConnectStringConfig, InstanceConfig};
use sqlrelay_common::{InstanceDirs, RelayError, Result};
use sqlrelay_driver::{open_driver, DriverConnection};
use sqlrelay_rendezvous::{ConnectionState, HandoffData, Rendezvous};
use tracing::{debug, error, info, warn};

use crate::handoff::{self, Handoff, HandoffReceiver};
use crate::session::{Controller, ControllerSettings, SessionOutcome};
use crate::stats::StatsSink;

/// Tick used by every interruptible wait
const WAIT_TICK: Duration = Duration::from_millis(500);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Install SIGTERM/SIGINT handlers that set the shutdown flag
pub fn install_signal_handlers() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
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

/// Options for one daemon process
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub config: InstanceConfig,
    /// Which connect string to serve; defaults to the first
    pub connection_id: Option<String>,
    /// Spawned by the scaler: the TTL applies and the daemon exits when
    /// idle too long
    pub scaler_spawned: bool,
}

/// One connection daemon
pub struct Daemon {
    cfg: InstanceConfig,
    connect_string: ConnectStringConfig,
    dirs: InstanceDirs,
    rendezvous: Arc<Rendezvous>,
    slot: usize,
    pid: u32,
    controller: Controller,
    handoff: HandoffReceiver,
    resume_listener: UnixListener,
    resume_path: PathBuf,
    stats: StatsSink,
    ttl: Option<Duration>,
}

impl Daemon {
    /// Log in to the backend, claim a slot, and wire up the hand-off and
    /// resume sockets
    pub fn new(opts: DaemonOptions) -> Result<Self> {
        let cfg = opts.config;
        let dirs = InstanceDirs::new(&cfg.run_dir, &cfg.id);
        dirs.ensure()?;
        let connect_string = cfg.connect_string(opts.connection_id.as_deref())?.clone();

        // The listener owns the segment; a daemon with nothing to attach
        // to cannot serve anyone.
        let rendezvous = Arc::new(
            Rendezvous::open(&dirs.shm_name())
                .map_err(|e| RelayError::RendezvousError(e.to_string()))?,
        );

        // Some backends (DB2 notably) take their locale from LANG
        if let Some(lang) = connect_string.parameters.get("lang") {
            std::env::set_var("LANG", lang);
        }

        let mut driver = open_driver(&connect_string.driver)
            .map_err(|e| RelayError::ConfigError(e.to_string()))?;

        if cfg.session.fake_transaction_blocks && driver.capabilities().transaction_blocks {
            return Err(RelayError::ConfigError(
                "fake_transaction_blocks is set but the driver supports native transaction \
                 blocks; pick one"
                    .into(),
            ));
        }

        // Initial log-in, with the same backoff re-log-in uses
        let mut delay = Duration::from_secs(cfg.connections.retry_time_secs.max(1));
        let mut attempt = 0;
        loop {
            attempt += 1;
            match driver.connect(&connect_string.parameters) {
                Ok(()) => break,
                Err(e) if attempt < cfg.connections.tries && !shutting_down() => {
                    warn!(attempt, error = %e, "backend log-in failed; retrying");
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                Err(e) => {
                    return Err(RelayError::ConnectionLost(e.to_string()));
                }
            }
        }
        info!(driver = %connect_string.driver, "logged in to backend");

        let pid = std::process::id();
        let slot = rendezvous
            .reserve_slot(pid)
            .map_err(|e| RelayError::RendezvousError(e.to_string()))?;
        rendezvous
            .increment_total_connections()
            .map_err(|e| RelayError::RendezvousError(e.to_string()))?;

        let stats = StatsSink::Shm {
            rendezvous: Arc::clone(&rendezvous),
            slot,
        };
        stats.set_db_up(true);
        stats.with_aggregate(|s| {
            s.opened_server_connections += 1;
            s.open_server_connections += 1;
            s.opened_cursors += cfg.connections.cursors as i64;
            s.open_cursors += cfg.connections.cursors as i64;
        });
        stats.update_logged_in();

        let handoff = HandoffReceiver::bind(&dirs.handoff_socket(pid))?;

        let seq = dirs.next_socket_sequence()?;
        let resume_path = dirs.resume_socket(seq);
        let _ = std::fs::remove_file(&resume_path);
        let resume_listener = UnixListener::bind(&resume_path)?;
        resume_listener.set_nonblocking(true)?;

        let settings = ControllerSettings {
            limits: cfg.limits.clone(),
            session: cfg.session.clone(),
        };
        let auth = StaticUserList::from_config(&cfg.users);
        let mut controller = Controller::new(
            settings,
            auth,
            driver,
            cfg.connections.cursors,
            stats.clone(),
        );
        controller.set_resume_endpoint(0, resume_path.to_string_lossy().as_ref());

        let ttl = if opts.scaler_spawned && cfg.connections.ttl_secs > 0 {
            Some(Duration::from_secs(cfg.connections.ttl_secs))
        } else {
            None
        };

        Ok(Self {
            cfg,
            connect_string,
            dirs,
            rendezvous,
            slot,
            pid,
            controller,
            handoff,
            resume_listener,
            resume_path,
            stats,
            ttl,
        })
    }

    /// The announce/serve loop
    pub fn run(&mut self) -> Result<()> {
        let mut idle_since = Instant::now();

        'main: while !shutting_down() {
            if let Some(ttl) = self.ttl {
                if idle_since.elapsed() > ttl && !self.controller.has_suspended_state() {
                    info!(ttl_secs = ttl.as_secs(), "idle past ttl; exiting");
                    break 'main;
                }
            }

            // Keep the backend session warm between clients
            if self.controller.driver_mut().ping().is_err() {
                if !self.relogin() {
                    error!("backend unreachable after retries; exiting");
                    break 'main;
                }
            }

            // Queue up to announce
            self.stats.set_state(ConnectionState::AnnounceAvailability);
            loop {
                if shutting_down() {
                    break 'main;
                }
                if let Some(ttl) = self.ttl {
                    if idle_since.elapsed() > ttl && !self.controller.has_suspended_state() {
                        break 'main;
                    }
                }
                if self.check_resume_arrival()? {
                    idle_since = Instant::now();
                }
                if self
                    .rendezvous
                    .acquire_announce_mutex(WAIT_TICK)
                    .map_err(|e| RelayError::RendezvousError(e.to_string()))?
                {
                    break;
                }
            }

            let announced = self.announce()?;
            if !announced {
                break 'main;
            }

            // The listener copied our fields and will deliver a client
            self.stats.set_state(ConnectionState::WaitClient);
            let client = match self.wait_for_client()? {
                Some(stream) => stream,
                None => {
                    // Claimed but never delivered; undo the listener's
                    // increment so the counters stay truthful.
                    let _ = self.rendezvous.decrement_connections_in_use();
                    continue;
                }
            };

            self.serve(client)?;
            idle_since = Instant::now();
        }

        self.clean_up();
        Ok(())
    }

    /// Write the announcement and hold until the listener takes it.
    /// `Ok(false)` means the announcement was retracted for shutdown.
    fn announce(&mut self) -> Result<bool> {
        let data = HandoffData {
            pid: self.pid,
            inet_port: 0,
            unix_socket: self.resume_path.to_string_lossy().into_owned(),
        };
        let rv = &self.rendezvous;
        rv.write_announcement(&self.connect_string.connection_id, &data)
            .map_err(|e| RelayError::RendezvousError(e.to_string()))?;
        rv.signal_listener_ready()
            .map_err(|e| RelayError::RendezvousError(e.to_string()))?;

        self.stats.set_state(ConnectionState::WaitSemaphore);
        let claimed = loop {
            if rv
                .wait_listener_done(WAIT_TICK)
                .map_err(|e| RelayError::RendezvousError(e.to_string()))?
            {
                break true;
            }
            if shutting_down() {
                if rv
                    .try_retract_announcement()
                    .map_err(|e| RelayError::RendezvousError(e.to_string()))?
                {
                    // Nobody claimed us; safe to leave
                    break false;
                }
                // A listener is mid-claim: finish the handshake and serve
                // this one last client.
            }
        };
        rv.release_announce_mutex()
            .map_err(|e| RelayError::RendezvousError(e.to_string()))?;
        Ok(claimed)
    }

    /// After a successful announce, wait for the hand-off datagram (or a
    /// direct connection on the resume socket)
    fn wait_for_client(&mut self) -> Result<Option<UnixStream>> {
        let deadline =
            Instant::now() + Duration::from_secs(self.cfg.listener.listener_timeout_secs.max(5));
        while Instant::now() < deadline {
            if let Some(handoff) = self.handoff.recv(WAIT_TICK)? {
                match handoff {
                    Handoff::Pass(fd) => return Ok(Some(UnixStream::from(fd))),
                    Handoff::Reconnect => {
                        // The client connects to our own socket instead
                        if let Some(stream) = self.accept_resume(deadline)? {
                            return Ok(Some(stream));
                        }
                        return Ok(None);
                    }
                }
            }
            if let Some(stream) = self.try_accept_resume()? {
                return Ok(Some(stream));
            }
            if shutting_down() {
                return Ok(None);
            }
        }
        warn!("listener claimed this daemon but no client arrived");
        Ok(None)
    }

    fn try_accept_resume(&self) -> Result<Option<UnixStream>> {
        match self.resume_listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                Ok(Some(stream))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn accept_resume(&self, deadline: Instant) -> Result<Option<UnixStream>> {
        use std::os::fd::AsFd;
        while Instant::now() < deadline && !shutting_down() {
            let mut fds = [PollFd::new(self.resume_listener.as_fd(), PollFlags::POLLIN)];
            let millis = WAIT_TICK.as_millis() as u16;
            poll(&mut fds, PollTimeout::from(millis)).map_err(RelayError::SystemError)?;
            if let Some(stream) = self.try_accept_resume()? {
                return Ok(Some(stream));
            }
        }
        Ok(None)
    }

    /// A client arrived while the daemon was idle: this is a reconnect
    /// for suspended state, served without touching the in-use counter
    fn check_resume_arrival(&mut self) -> Result<bool> {
        if !self.controller.has_suspended_state() {
            // Expired parked state is swept by the serve loop; anything
            // arriving here without suspended state is a stray connect.
            if let Some(stream) = self.try_accept_resume()? {
                drop(stream);
            }
            return Ok(false);
        }
        if let Some(stream) = self.try_accept_resume()? {
            debug!("direct reconnect for suspended state");
            let _ = self.rendezvous.increment_connections_in_use();
            self.serve(stream)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Run sessions on one delivered client, following suspends
    fn serve(&mut self, client: UnixStream) -> Result<()> {
        let mut stream = client;
        loop {
            if self.cfg.session.idle_client_timeout_secs > 0 {
                let t = Duration::from_secs(self.cfg.session.idle_client_timeout_secs);
                let _ = stream.set_read_timeout(Some(t));
            }
            let reader = stream.try_clone()?;
            let outcome = self.controller.run_session(reader, &stream, "client");

            match outcome {
                SessionOutcome::EndSession => {
                    let _ = self.rendezvous.decrement_connections_in_use();
                    return Ok(());
                }
                SessionOutcome::Disconnect => {
                    let _ = self.rendezvous.decrement_connections_in_use();
                    if !self.relogin() {
                        return Err(RelayError::ConnectionLost(
                            "backend unreachable after retries".into(),
                        ));
                    }
                    return Ok(());
                }
                SessionOutcome::Suspended => {
                    drop(stream);
                    let _ = self.rendezvous.decrement_connections_in_use();
                    let timeout =
                        Duration::from_secs(self.cfg.session.suspend_timeout_secs.max(1));
                    match self.accept_resume(Instant::now() + timeout)? {
                        Some(next) => {
                            let _ = self.rendezvous.increment_connections_in_use();
                            stream = next;
                        }
                        None => {
                            let discarded = self.controller.discard_suspended();
                            if discarded > 0 {
                                info!(discarded, "suspend timeout; discarded parked state");
                            }
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Re-log-in with exponential backoff; false when retries ran out
    fn relogin(&mut self) -> bool {
        self.stats.set_db_up(false);
        self.stats.set_state(ConnectionState::WaitForAvailDb);
        self.stats.count_command(|c| c.relogin += 1);

        let params = self.connect_string.parameters.clone();
        let tries = self.cfg.connections.tries.max(1);
        let mut delay = Duration::from_secs(self.cfg.connections.retry_time_secs.max(1));

        for attempt in 1..=tries {
            if shutting_down() {
                return false;
            }
            self.controller.driver_mut().log_out();
            match self.controller.driver_mut().connect(&params) {
                Ok(()) => {
                    info!(attempt, "re-logged-in to backend");
                    self.stats.set_db_up(true);
                    return true;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "re-log-in failed");
                    std::thread::sleep(delay);
                    delay *= 2;
                }
            }
        }
        false
    }

    fn clean_up(&mut self) {
        self.stats.set_state(ConnectionState::SessionEnd);
        self.stats.with_aggregate(|s| {
            s.open_server_connections -= 1;
            s.open_cursors -= self.cfg.connections.cursors as i64;
        });
        self.controller.driver_mut().log_out();
        handoff::deregister(&self.dirs.remove_handoff_socket(), self.pid);
        let _ = self.rendezvous.decrement_total_connections();
        let _ = self.rendezvous.release_slot(self.slot);
        let _ = std::fs::remove_file(&self.resume_path);
        info!(pid = self.pid, "daemon exited cleanly");
    }
}
