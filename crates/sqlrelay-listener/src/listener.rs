//! The accept/dispatch loop
//!
//! One poll loop over the client sockets, the deregistration socket, and
//! the fixup socket. Each accepted client is handled by a forked child
//! (bounded by `max_listeners`): the child claims the next announcing
//! daemon through the rendezvous and passes the client descriptor to it,
//! falling back to a byte relay when passing fails.

use std::io::Read;
use std::net::TcpListener;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{fork, ForkResult, Pid};
use socket2::{Domain, Protocol, Socket, Type};
use sqlrelay_common::{InstanceConfig, InstanceDirs, RelayError, Result};
use sqlrelay_connection::handoff;
use sqlrelay_protocol::codec::ProtocolWriter;
use sqlrelay_protocol::consts::ResponseStatus;
use sqlrelay_rendezvous::{Announcement, Rendezvous};
use tracing::{debug, error, info, warn};

use crate::ip_filter::IpFilter;
use crate::proxy;

const POLL_TICK_MS: u16 = 500;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

extern "C" fn handle_reload_signal(_signum: libc::c_int) {
    RELOAD.store(true, Ordering::SeqCst);
}

/// Install SIGTERM/SIGINT (shutdown) and SIGHUP (re-read config)
pub fn install_signal_handlers() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    let shutdown = SigAction::new(
        SigHandler::Handler(handle_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let reload = SigAction::new(
        SigHandler::Handler(handle_reload_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGTERM, &shutdown).map_err(RelayError::SystemError)?;
        sigaction(Signal::SIGINT, &shutdown).map_err(RelayError::SystemError)?;
        sigaction(Signal::SIGHUP, &reload).map_err(RelayError::SystemError)?;
    }
    Ok(())
}

fn shutting_down() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// One accepted client, over either transport
enum ClientConn {
    Unix(UnixStream),
    Tcp(std::net::TcpStream),
}

impl ClientConn {
    fn addr(&self) -> String {
        match self {
            ClientConn::Unix(_) => "unix".to_string(),
            ClientConn::Tcp(s) => s
                .peer_addr()
                .map(|a| a.ip().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
        }
    }

    fn raw_fd(&self) -> std::os::fd::RawFd {
        match self {
            ClientConn::Unix(s) => s.as_raw_fd(),
            ClientConn::Tcp(s) => s.as_raw_fd(),
        }
    }
}

impl Read for ClientConn {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ClientConn::Unix(s) => s.read(buf),
            ClientConn::Tcp(s) => s.read(buf),
        }
    }
}

impl std::io::Write for ClientConn {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            ClientConn::Unix(s) => std::io::Write::write(s, buf),
            ClientConn::Tcp(s) => std::io::Write::write(s, buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            ClientConn::Unix(s) => std::io::Write::flush(s),
            ClientConn::Tcp(s) => std::io::Write::flush(s),
        }
    }
}

impl AsFd for ClientConn {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        match self {
            ClientConn::Unix(s) => s.as_fd(),
            ClientConn::Tcp(s) => s.as_fd(),
        }
    }
}

/// The listener process
pub struct Listener {
    cfg: InstanceConfig,
    dirs: InstanceDirs,
    rendezvous: Arc<Rendezvous>,
    client_unix: UnixListener,
    client_tcp: Option<TcpListener>,
    remove_listener: UnixListener,
    fixup_listener: UnixListener,
    ip_filter: IpFilter,
}

impl Listener {
    /// Create the rendezvous segment, bind every socket, and write the
    /// pid file
    pub fn new(cfg: InstanceConfig) -> Result<Self> {
        let dirs = InstanceDirs::new(&cfg.run_dir, &cfg.id);
        dirs.ensure()?;
        dirs.write_pid_file(std::process::id())?;

        let rendezvous = Arc::new(
            Rendezvous::create(&dirs.shm_name())
                .map_err(|e| RelayError::RendezvousError(e.to_string()))?,
        );
        std::fs::write(dirs.shm_key_file(), dirs.shm_name())?;
        std::fs::write(dirs.sem_key_file(), dirs.shm_name())?;

        let client_unix = bind_unix(&dirs.client_socket())?;
        if let Some(extra) = &cfg.listener.unix_socket {
            // A second, site-chosen path for clients that expect one
            let _ = std::fs::remove_file(extra);
            std::os::unix::fs::symlink(dirs.client_socket(), extra).ok();
        }

        let client_tcp = if cfg.listener.inet_port > 0 {
            Some(bind_tcp(&cfg.listener.inet_address, cfg.listener.inet_port)?)
        } else {
            None
        };

        let remove_listener = bind_unix(&dirs.remove_handoff_socket())?;
        let fixup_listener = bind_unix(&dirs.fixup_socket())?;

        let ip_filter = IpFilter::new(
            cfg.listener.allowed_ips.as_deref(),
            cfg.listener.denied_ips.as_deref(),
        )?;

        info!(
            instance = %cfg.id,
            unix = %dirs.client_socket().display(),
            port = cfg.listener.inet_port,
            "listener ready"
        );

        Ok(Self {
            cfg,
            dirs,
            rendezvous,
            client_unix,
            client_tcp,
            remove_listener,
            fixup_listener,
            ip_filter,
        })
    }

    pub fn rendezvous(&self) -> &Arc<Rendezvous> {
        &self.rendezvous
    }

    /// The select/poll loop; returns on shutdown
    pub fn run(&mut self) -> Result<()> {
        while !shutting_down() {
            self.reap_children();
            if RELOAD.swap(false, Ordering::SeqCst) {
                self.reload_filters();
            }

            let mut fds = Vec::with_capacity(4);
            fds.push(PollFd::new(self.client_unix.as_fd(), PollFlags::POLLIN));
            fds.push(PollFd::new(self.remove_listener.as_fd(), PollFlags::POLLIN));
            fds.push(PollFd::new(self.fixup_listener.as_fd(), PollFlags::POLLIN));
            if let Some(tcp) = &self.client_tcp {
                fds.push(PollFd::new(tcp.as_fd(), PollFlags::POLLIN));
            }

            let n = poll(&mut fds, PollTimeout::from(POLL_TICK_MS))
                .map_err(RelayError::SystemError)?;
            if n == 0 {
                continue;
            }

            let ready: Vec<bool> = fds
                .iter()
                .map(|fd| {
                    fd.revents()
                        .map(|r| r.contains(PollFlags::POLLIN))
                        .unwrap_or(false)
                })
                .collect();

            if ready[1] {
                self.drain_deregistrations();
            }
            if ready[2] {
                self.drain_fixups();
            }
            if ready[0] {
                if let Ok((stream, _)) = self.client_unix.accept() {
                    self.handle_accept(ClientConn::Unix(stream));
                }
            }
            if ready.len() > 3 && ready[3] {
                if let Some(tcp) = &self.client_tcp {
                    if let Ok((stream, _)) = tcp.accept() {
                        self.handle_accept(ClientConn::Tcp(stream));
                    }
                }
            }
        }

        info!("listener shutting down");
        self.dirs.clean_up();
        Ok(())
    }

    fn reload_filters(&mut self) {
        info!("re-reading ip filters on SIGHUP");
        match IpFilter::new(
            self.cfg.listener.allowed_ips.as_deref(),
            self.cfg.listener.denied_ips.as_deref(),
        ) {
            Ok(filter) => self.ip_filter = filter,
            Err(e) => warn!(error = %e, "keeping previous ip filters"),
        }
    }

    /// Daemons report their pid here at exit; reap any socket file they
    /// left behind
    fn drain_deregistrations(&self) {
        while let Ok((mut stream, _)) = self.remove_listener.accept() {
            let mut pid_bytes = [0u8; 4];
            if stream.read_exact(&mut pid_bytes).is_ok() {
                let pid = u32::from_be_bytes(pid_bytes);
                debug!(pid, "daemon deregistered");
                let _ = std::fs::remove_file(self.dirs.handoff_socket(pid));
            }
            if shutting_down() {
                break;
            }
        }
    }

    /// Forked children report daemons whose hand-off socket is dead; the
    /// parent owns the cleanup
    fn drain_fixups(&self) {
        while let Ok((mut stream, _)) = self.fixup_listener.accept() {
            let mut pid_bytes = [0u8; 4];
            if stream.read_exact(&mut pid_bytes).is_ok() {
                let pid = u32::from_be_bytes(pid_bytes);
                warn!(pid, "cleaning up dead daemon hand-off socket");
                let _ = std::fs::remove_file(self.dirs.handoff_socket(pid));
            }
            if shutting_down() {
                break;
            }
        }
    }

    fn reap_children(&self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(nix::sys::wait::WaitStatus::StillAlive) => break,
                Ok(nix::sys::wait::WaitStatus::Exited(pid, code)) => {
                    debug!(pid = pid.as_raw(), code, "reaped hand-off child");
                    let _ = self.rendezvous.decrement_forked_listeners();
                }
                Ok(nix::sys::wait::WaitStatus::Signaled(pid, sig, _)) => {
                    warn!(pid = pid.as_raw(), signal = %sig, "hand-off child killed");
                    let _ = self.rendezvous.decrement_forked_listeners();
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }

    /// Bounded fork-per-client
    fn handle_accept(&self, mut client: ClientConn) {
        let addr = client.addr();
        if matches!(client, ClientConn::Tcp(_)) && !self.ip_filter.allows(&addr) {
            info!(client = %addr, "connection refused by ip filter");
            let _ = error_client(&mut client, "Connection refused.");
            return;
        }

        let forked = match self.rendezvous.increment_forked_listeners() {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "rendezvous failure on accept");
                let _ = error_client(&mut client, "Server error.");
                return;
            }
        };
        if forked > self.cfg.listener.max_listeners as i32 {
            let _ = self.rendezvous.decrement_forked_listeners();
            let _ = self.rendezvous.increment_max_listener_errors();
            warn!(client = %addr, forked, "max listeners exceeded");
            let _ = error_client(&mut client, "Too many listeners.");
            return;
        }

        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let status = match self.child_serve(client, &addr) {
                    Ok(()) => 0,
                    Err(e) => {
                        warn!(client = %addr, error = %e, "hand-off failed");
                        1
                    }
                };
                std::process::exit(status);
            }
            Ok(ForkResult::Parent { child }) => {
                debug!(child = child.as_raw(), client = %addr, "forked hand-off child");
                // The child owns the descriptor now
                drop(client);
            }
            Err(e) => {
                let _ = self.rendezvous.decrement_forked_listeners();
                error!(error = %e, "fork failed");
                let _ = error_client(&mut client, "Server error.");
            }
        }
    }

    /// The forked child: claim a daemon, hand the client over
    fn child_serve(&self, mut client: ClientConn, addr: &str) -> Result<()> {
        let rv = &self.rendezvous;

        // All daemons busy: flag it so the scaler spawns one
        if self.cfg.connections.dynamic_scaling {
            let (total, in_use) = rv
                .connection_counts()
                .map_err(|e| RelayError::RendezvousError(e.to_string()))?;
            if in_use >= total {
                rv.set_all_dbs_busy(true);
                let _ = rv.signal_scaler();
                let _ = rv.wait_scaler_done(Duration::from_secs(2));
            }
        }

        let timeout = Duration::from_secs(self.cfg.listener.listener_timeout_secs.max(1));
        let announcement = match rv
            .wait_for_announcement(timeout)
            .map_err(|e| RelayError::RendezvousError(e.to_string()))?
        {
            Some(ann) => ann,
            None => {
                let _ = error_client(&mut client, "No connection daemon became available.");
                return Err(RelayError::ListenerTimeout(
                    self.cfg.listener.listener_timeout_secs,
                ));
            }
        };

        rv.increment_connections_in_use()
            .map_err(|e| RelayError::RendezvousError(e.to_string()))?;
        rv.signal_listener_done()
            .map_err(|e| RelayError::RendezvousError(e.to_string()))?;

        debug!(
            client = %addr,
            daemon = announcement.handoff.pid,
            pool = %announcement.connection_id,
            "daemon claimed"
        );
        self.deliver(client, &announcement)
    }

    /// Pass the descriptor, or fall back to the byte relay
    fn deliver(&self, mut client: ClientConn, announcement: &Announcement) -> Result<()> {
        use sqlrelay_common::config::HandoffMode;

        let pid = announcement.handoff.pid;
        let handoff_path = self.dirs.handoff_socket(pid);

        if self.cfg.listener.handoff == HandoffMode::Pass {
            match handoff::send_pass(&handoff_path, client.raw_fd()) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(daemon = pid, error = %e, "descriptor pass failed; trying proxy");
                    self.report_fixup(pid);
                }
            }
        }

        // Proxy path: tell the daemon to accept us on its own socket,
        // then relay
        if announcement.handoff.unix_socket.is_empty() {
            let _ = error_client(&mut client, "Hand-off failed.");
            return Err(RelayError::HandoffFailed(format!(
                "daemon {} has no direct socket",
                pid
            )));
        }
        handoff::send_reconnect(&handoff_path)?;
        let mut daemon = UnixStream::connect(&announcement.handoff.unix_socket)?;
        let idle = Duration::from_secs(self.cfg.session.idle_client_timeout_secs);
        let (up, down) = proxy::relay(&mut client, &mut daemon, idle)?;
        debug!(daemon = pid, up, down, "proxy relay finished");
        Ok(())
    }

    fn report_fixup(&self, pid: u32) {
        if let Ok(mut stream) = UnixStream::connect(self.dirs.fixup_socket()) {
            use std::io::Write;
            let _ = stream.write_all(&pid.to_be_bytes());
        }
    }
}

/// Answer a client we cannot serve with an explicit disconnect record
fn error_client<W: std::io::Write>(client: &mut W, message: &str) -> Result<()> {
    let mut w = ProtocolWriter::new(client);
    w.write_u16(ResponseStatus::ErrorOccurredDisconnect.to_u16());
    w.write_u64(0);
    w.write_lstring("08001");
    w.write_lstring(message);
    w.flush().map_err(|e| RelayError::ProtocolError(e.to_string()))?;
    Ok(())
}

fn bind_unix(path: &std::path::Path) -> Result<UnixListener> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn bind_tcp(address: &str, port: u16) -> Result<TcpListener> {
    let addr: std::net::SocketAddr = format!("{}:{}", address, port)
        .parse()
        .map_err(|_| RelayError::ConfigError(format!("bad listen address {}:{}", address, port)))?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_record_shape() {
        let mut buf = Vec::new();
        error_client(&mut buf, "Too many listeners.").unwrap();
        // status(2) + code(8) + sqlstate(4+5) + message(4+19)
        assert_eq!(buf.len(), 2 + 8 + 4 + 5 + 4 + 19);
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), 2);
    }

    #[test]
    fn tcp_bind_rejects_garbage_address() {
        assert!(bind_tcp("not-an-address", 0).is_err());
    }
}
