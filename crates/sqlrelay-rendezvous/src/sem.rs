//! The semaphore set
//!
//! Thirteen process-shared POSIX semaphores embedded in the segment.
//! Each slot has exactly one purpose; nothing waits on a semaphore for
//! two different reasons.

use std::time::Duration;

use crate::{RendezvousError, Result};

/// Named semaphore slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Sem {
    /// Held by a daemon for the whole announce sequence; serializes
    /// announcements and makes them FIFO by queue order
    AnnounceMutex = 0,
    /// Posted by the announcing daemon once the fields are written
    ListenerReady = 1,
    /// Posted by the listener once it has copied the fields
    ListenerDone = 2,
    /// Guards non-atomic reads of the paired fleet counters
    ConnectionCountMutex = 3,
    /// Posted to wake the scaler out of its timed wait
    ScalerWake = 4,
    /// Guards the shared-reader count
    ShmReaderMutex = 5,
    /// Held exclusively by writers; the first reader takes it, the last
    /// reader releases it
    ShmWriteGate = 6,
    /// Guards slot reservation and release
    SlotRegistryMutex = 7,
    /// Guards the aggregate statistics
    StatsMutex = 8,
    /// Posted by the scaler after it acts on an all-daemons-busy flag
    ScalerDone = 9,
    /// Guards forked-listener accounting
    ListenerCountMutex = 10,
    /// Reserved for protocol plugins
    Reserved11 = 11,
    /// Reserved for the cache manager
    Reserved12 = 12,
}

impl Sem {
    /// Initial value at segment creation: mutexes start at 1, events at 0
    pub(crate) const fn initial_value(self) -> u32 {
        match self {
            Sem::AnnounceMutex
            | Sem::ConnectionCountMutex
            | Sem::ShmReaderMutex
            | Sem::ShmWriteGate
            | Sem::SlotRegistryMutex
            | Sem::StatsMutex
            | Sem::ListenerCountMutex => 1,
            Sem::ListenerReady
            | Sem::ListenerDone
            | Sem::ScalerWake
            | Sem::ScalerDone
            | Sem::Reserved11
            | Sem::Reserved12 => 0,
        }
    }

    pub(crate) const ALL: [Sem; crate::SEM_COUNT] = [
        Sem::AnnounceMutex,
        Sem::ListenerReady,
        Sem::ListenerDone,
        Sem::ConnectionCountMutex,
        Sem::ScalerWake,
        Sem::ShmReaderMutex,
        Sem::ShmWriteGate,
        Sem::SlotRegistryMutex,
        Sem::StatsMutex,
        Sem::ScalerDone,
        Sem::ListenerCountMutex,
        Sem::Reserved11,
        Sem::Reserved12,
    ];
}

/// Initialize one process-shared semaphore in place
pub(crate) unsafe fn init(sem: *mut libc::sem_t, value: u32) -> Result<()> {
    if libc::sem_init(sem, 1, value) != 0 {
        return Err(RendezvousError::sys("sem_init", nix::errno::Errno::last()));
    }
    Ok(())
}

pub(crate) unsafe fn destroy(sem: *mut libc::sem_t) {
    let _ = libc::sem_destroy(sem);
}

/// Block until the semaphore can be decremented; retries EINTR
pub(crate) unsafe fn wait(sem: *mut libc::sem_t) -> Result<()> {
    loop {
        if libc::sem_wait(sem) == 0 {
            return Ok(());
        }
        let errno = nix::errno::Errno::last();
        if errno != nix::errno::Errno::EINTR {
            return Err(RendezvousError::sys("sem_wait", errno));
        }
    }
}

/// Decrement without blocking; `Ok(false)` when the count was zero
pub(crate) unsafe fn try_wait(sem: *mut libc::sem_t) -> Result<bool> {
    if libc::sem_trywait(sem) == 0 {
        return Ok(true);
    }
    match nix::errno::Errno::last() {
        nix::errno::Errno::EAGAIN => Ok(false),
        nix::errno::Errno::EINTR => Ok(false),
        errno => Err(RendezvousError::sys("sem_trywait", errno)),
    }
}

/// Block with a deadline; `Ok(false)` on timeout. Timed waits are what
/// keep every blocking loop interruptible by the shutdown flag.
pub(crate) unsafe fn timed_wait(sem: *mut libc::sem_t, timeout: Duration) -> Result<bool> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) != 0 {
        return Err(RendezvousError::sys(
            "clock_gettime",
            nix::errno::Errno::last(),
        ));
    }
    let mut deadline = libc::timespec {
        tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t,
        tv_nsec: now.tv_nsec + timeout.subsec_nanos() as libc::c_long,
    };
    if deadline.tv_nsec >= 1_000_000_000 {
        deadline.tv_sec += 1;
        deadline.tv_nsec -= 1_000_000_000;
    }
    loop {
        if libc::sem_timedwait(sem, &deadline) == 0 {
            return Ok(true);
        }
        match nix::errno::Errno::last() {
            nix::errno::Errno::ETIMEDOUT => return Ok(false),
            nix::errno::Errno::EINTR => continue,
            errno => return Err(RendezvousError::sys("sem_timedwait", errno)),
        }
    }
}

/// Increment the semaphore
pub(crate) unsafe fn post(sem: *mut libc::sem_t) -> Result<()> {
    if libc::sem_post(sem) != 0 {
        return Err(RendezvousError::sys("sem_post", nix::errno::Errno::last()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_values() {
        assert_eq!(Sem::AnnounceMutex.initial_value(), 1);
        assert_eq!(Sem::ListenerReady.initial_value(), 0);
        assert_eq!(Sem::ALL.len(), crate::SEM_COUNT);
        for (i, sem) in Sem::ALL.iter().enumerate() {
            assert_eq!(*sem as usize, i);
        }
    }

    #[test]
    fn wait_post_and_timeout() {
        let mut raw: libc::sem_t = unsafe { std::mem::zeroed() };
        let sem = &mut raw as *mut libc::sem_t;
        unsafe {
            init(sem, 1).unwrap();
            assert!(try_wait(sem).unwrap());
            assert!(!try_wait(sem).unwrap());
            post(sem).unwrap();
            assert!(timed_wait(sem, Duration::from_millis(10)).unwrap());
            assert!(!timed_wait(sem, Duration::from_millis(10)).unwrap());
            destroy(sem);
        }
    }
}
