//! Proxy-mode byte relay
//!
//! Fallback for platforms (or failures) where descriptor passing is
//! unavailable: the listener child connects to the daemon's direct
//! socket and shovels bytes both ways until either side closes.

use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use sqlrelay_common::{RelayError, Result};
use tracing::debug;

const RELAY_BUF: usize = 16384;
const RELAY_TICK_MS: u16 = 500;

/// Relay bytes between a client and a daemon until EOF on either side.
/// Returns the total bytes moved in each direction.
pub fn relay<C>(client: &mut C, daemon: &mut UnixStream, idle_timeout: Duration) -> Result<(u64, u64)>
where
    C: Read + Write + AsFd,
{
    daemon.set_nonblocking(true)?;
    let mut to_daemon = 0u64;
    let mut to_client = 0u64;
    let mut buf = [0u8; RELAY_BUF];
    let mut idle = Duration::ZERO;

    loop {
        let mut fds = [
            PollFd::new(client.as_fd(), PollFlags::POLLIN),
            PollFd::new(daemon.as_fd(), PollFlags::POLLIN),
        ];
        let n = poll(&mut fds, PollTimeout::from(RELAY_TICK_MS)).map_err(RelayError::SystemError)?;
        if n == 0 {
            idle += Duration::from_millis(RELAY_TICK_MS as u64);
            if !idle_timeout.is_zero() && idle >= idle_timeout {
                debug!("proxy relay idle timeout");
                break;
            }
            continue;
        }
        idle = Duration::ZERO;

        let client_ready = fds[0]
            .revents()
            .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
            .unwrap_or(false);
        let daemon_ready = fds[1]
            .revents()
            .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
            .unwrap_or(false);

        if client_ready {
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(len) => {
                    daemon.set_nonblocking(false)?;
                    daemon.write_all(&buf[..len])?;
                    daemon.set_nonblocking(true)?;
                    to_daemon += len as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
        if daemon_ready {
            match daemon.read(&mut buf) {
                Ok(0) => break,
                Ok(len) => {
                    client.write_all(&buf[..len])?;
                    to_client += len as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok((to_daemon, to_client))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn relays_both_directions_until_eof() {
        let (mut client_side, mut client_for_relay) = UnixStream::pair().unwrap();
        let (mut daemon_for_relay, mut daemon_side) = UnixStream::pair().unwrap();

        // The "daemon" echoes one message back then closes
        let daemon = thread::spawn(move || {
            let mut buf = [0u8; 5];
            daemon_side.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"query");
            daemon_side.write_all(b"rows!").unwrap();
        });

        let relay_thread = thread::spawn(move || {
            relay(
                &mut client_for_relay,
                &mut daemon_for_relay,
                Duration::from_secs(5),
            )
            .unwrap()
        });

        client_side.write_all(b"query").unwrap();
        let mut buf = [0u8; 5];
        client_side.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"rows!");
        drop(client_side);

        daemon.join().unwrap();
        let (to_daemon, to_client) = relay_thread.join().unwrap();
        assert_eq!(to_daemon, 5);
        assert_eq!(to_client, 5);
    }
}
