//! Filesystem layout for one SQL Relay instance
//!
//! Every on-disk artifact lives under `$RUN/<id>/`: pid file, hand-off
//! sockets, rendezvous key files, and the sequence file used to mint
//! unique socket names for suspended sessions.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::error::{RelayError, Result};

/// Paths for one instance, derived from the run directory and instance id
#[derive(Debug, Clone)]
pub struct InstanceDirs {
    base: PathBuf,
    id: String,
}

impl InstanceDirs {
    pub fn new(run_dir: &Path, id: &str) -> Self {
        Self {
            base: run_dir.join(id),
            id: id.to_string(),
        }
    }

    /// Create the directory tree; idempotent
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(self.handoff_dir())?;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Listener pid file
    pub fn pid_file(&self) -> PathBuf {
        self.base.join("pid")
    }

    /// Directory of per-daemon hand-off sockets
    pub fn handoff_dir(&self) -> PathBuf {
        self.base.join("handoff")
    }

    /// Hand-off datagram socket for one daemon
    pub fn handoff_socket(&self, pid: u32) -> PathBuf {
        self.handoff_dir().join(pid.to_string())
    }

    /// Daemon-to-listener deregistration socket
    pub fn remove_handoff_socket(&self) -> PathBuf {
        self.base.join("removehandoff")
    }

    /// Reconnect-mode fallback socket; carries proxied client bytes when
    /// descriptor passing is unavailable or fails
    pub fn fixup_socket(&self) -> PathBuf {
        self.base.join("fixup")
    }

    /// Client-facing UNIX socket of the listener
    pub fn client_socket(&self) -> PathBuf {
        self.base.join("client")
    }

    /// Sequence file for unique UNIX socket names
    pub fn sockseq_file(&self) -> PathBuf {
        self.base.join("sockseq")
    }

    /// UNIX socket a daemon opens for suspended-session reconnects
    pub fn resume_socket(&self, seq: u64) -> PathBuf {
        self.base.join(format!("resume-{}", seq))
    }

    /// File recording the rendezvous shm name
    pub fn shm_key_file(&self) -> PathBuf {
        self.base.join("shm.key")
    }

    /// File recording the rendezvous semaphore key
    pub fn sem_key_file(&self) -> PathBuf {
        self.base.join("sem.key")
    }

    /// POSIX shm object name for the rendezvous segment
    pub fn shm_name(&self) -> String {
        format!("/sqlrelay-{}", self.id)
    }

    /// Write the listener pid file
    pub fn write_pid_file(&self, pid: u32) -> Result<()> {
        std::fs::write(self.pid_file(), format!("{}\n", pid))?;
        Ok(())
    }

    /// Read the listener pid file, if present
    pub fn read_pid_file(&self) -> Result<u32> {
        let text = std::fs::read_to_string(self.pid_file())?;
        text.trim()
            .parse()
            .map_err(|_| RelayError::Internal(format!("malformed pid file for '{}'", self.id)))
    }

    /// Take the next value from the flock-guarded sequence file
    pub fn next_socket_sequence(&self) -> Result<u64> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.sockseq_file())?;
        let mut locked = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| RelayError::SystemError(errno))?;

        let mut text = String::new();
        locked.read_to_string(&mut text)?;
        let seq: u64 = text.trim().parse().unwrap_or(0);

        locked.seek(SeekFrom::Start(0))?;
        locked.set_len(0)?;
        write!(locked, "{}", seq.wrapping_add(1))?;
        Ok(seq)
    }

    /// Remove everything the instance wrote; used by the listener at exit
    pub fn clean_up(&self) {
        let _ = std::fs::remove_file(self.pid_file());
        let _ = std::fs::remove_file(self.remove_handoff_socket());
        let _ = std::fs::remove_file(self.fixup_socket());
        let _ = std::fs::remove_file(self.client_socket());
        let _ = std::fs::remove_file(self.sockseq_file());
        let _ = std::fs::remove_file(self.shm_key_file());
        let _ = std::fs::remove_file(self.sem_key_file());
        let _ = std::fs::remove_dir_all(self.handoff_dir());
    }
}
