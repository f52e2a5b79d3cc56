//! Hand-off socket: receiving clients from the listener
//!
//! Each daemon binds a datagram socket at `$RUN/<id>/handoff/<pid>`. The
//! listener sends one byte of mode plus, in pass mode, the client
//! descriptor as SCM_RIGHTS ancillary data.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};
use sqlrelay_common::{RelayError, Result};
use sqlrelay_protocol::consts::HandoffByte;
use tracing::debug;

/// One received hand-off
#[derive(Debug)]
pub enum Handoff {
    /// The client descriptor, passed by the listener
    Pass(OwnedFd),
    /// The client will arrive on the daemon's own sockets
    Reconnect,
}

/// The daemon side of the hand-off socket
pub struct HandoffReceiver {
    sock: UnixDatagram,
    path: PathBuf,
}

impl HandoffReceiver {
    /// Bind at the per-daemon path, replacing any stale socket file
    pub fn bind(path: &Path) -> Result<Self> {
        let _ = std::fs::remove_file(path);
        let sock = UnixDatagram::bind(path)?;
        Ok(Self {
            sock,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    /// Wait up to `timeout` for a hand-off; `Ok(None)` on expiry
    pub fn recv(&self, timeout: Duration) -> Result<Option<Handoff>> {
        let mut fds = [PollFd::new(
            self.sock.as_fd(),
            PollFlags::POLLIN,
        )];
        let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
        let n = poll(&mut fds, PollTimeout::from(millis)).map_err(RelayError::SystemError)?;
        if n == 0 {
            return Ok(None);
        }
        self.recv_now().map(Some)
    }

    fn recv_now(&self) -> Result<Handoff> {
        let mut mode_byte = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut mode_byte)];
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);

        let msg = recvmsg::<UnixAddr>(
            self.sock.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        )
        .map_err(RelayError::SystemError)?;

        let mut passed_fd = None;
        for cmsg in msg.cmsgs().map_err(RelayError::SystemError)? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(&fd) = fds.first() {
                    passed_fd = Some(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
        }

        match HandoffByte::from_u8(mode_byte[0]) {
            Some(HandoffByte::Pass) => {
                let fd = passed_fd.ok_or_else(|| {
                    RelayError::HandoffFailed("pass datagram carried no descriptor".into())
                })?;
                debug!(fd = fd.as_raw_fd(), "received client descriptor");
                Ok(Handoff::Pass(fd))
            }
            Some(HandoffByte::Reconnect) => Ok(Handoff::Reconnect),
            None => Err(RelayError::HandoffFailed(format!(
                "unknown hand-off mode {}",
                mode_byte[0]
            ))),
        }
    }
}

impl Drop for HandoffReceiver {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Listener side: send a pass datagram carrying the client descriptor
pub fn send_pass(handoff_path: &Path, client_fd: RawFd) -> Result<()> {
    let sock = UnixDatagram::unbound()?;
    let addr = UnixAddr::new(handoff_path).map_err(RelayError::SystemError)?;
    let mode = [HandoffByte::Pass.to_u8()];
    let iov = [IoSlice::new(&mode)];
    let fds = [client_fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg(
        sock.as_raw_fd(),
        &iov,
        &cmsg,
        MsgFlags::empty(),
        Some(&addr),
    )
    .map_err(RelayError::SystemError)?;
    Ok(())
}

/// Listener side: tell the daemon to accept its client directly
pub fn send_reconnect(handoff_path: &Path) -> Result<()> {
    let sock = UnixDatagram::unbound()?;
    let mode = [HandoffByte::Reconnect.to_u8()];
    sock.send_to(&mode, handoff_path)?;
    Ok(())
}

/// Daemon exit: deregister with the listener so it can reap our socket
/// file if we leave one behind
pub fn deregister(remove_handoff_path: &Path, pid: u32) {
    if let Ok(mut stream) = std::os::unix::net::UnixStream::connect(remove_handoff_path) {
        use std::io::Write;
        let _ = stream.write_all(&pid.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn pass_descriptor_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("handoff");
        let receiver = HandoffReceiver::bind(&path).unwrap();

        let (mut ours, theirs) = UnixStream::pair().unwrap();
        send_pass(&path, theirs.as_raw_fd()).unwrap();
        drop(theirs);

        let handoff = receiver
            .recv(Duration::from_secs(2))
            .unwrap()
            .expect("handoff arrives");
        match handoff {
            Handoff::Pass(fd) => {
                let mut client = UnixStream::from(fd);
                ours.write_all(b"ping").unwrap();
                let mut buf = [0u8; 4];
                client.read_exact(&mut buf).unwrap();
                assert_eq!(&buf, b"ping");
            }
            other => panic!("expected pass, got {:?}", other),
        }
    }

    #[test]
    fn reconnect_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("handoff");
        let receiver = HandoffReceiver::bind(&path).unwrap();

        send_reconnect(&path).unwrap();
        match receiver.recv(Duration::from_secs(2)).unwrap() {
            Some(Handoff::Reconnect) => {}
            other => panic!("expected reconnect, got {:?}", other),
        }
    }

    #[test]
    fn recv_times_out_quietly() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("handoff");
        let receiver = HandoffReceiver::bind(&path).unwrap();
        assert!(receiver.recv(Duration::from_millis(20)).unwrap().is_none());
    }
}
