//! Segment creation and attachment
//!
//! The listener creates and owns the segment; daemons, the scaler, and
//! monitors attach to an existing one and refuse to start when it is
//! missing.

use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use tracing::debug;

use crate::layout::ShmBlock;
use crate::{sem, RendezvousError, Result, Sem};

pub(crate) struct Segment {
    ptr: NonNull<ShmBlock>,
    len: usize,
    name: String,
    owner: bool,
}

// Access to the block is ordered by the in-segment semaphores; the
// pointer itself is stable for the life of the mapping.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create the segment, replacing any stale one, and initialize the
    /// semaphore set
    pub(crate) fn create(name: &str) -> Result<Self> {
        let _ = shm_unlink(name);
        let fd = shm_open(
            name,
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
            Mode::from_bits_truncate(0o600),
        )
        .map_err(|e| RendezvousError::sys("shm_open", e))?;

        let len = ShmBlock::segment_size();
        nix::unistd::ftruncate(&fd, len as libc::off_t)
            .map_err(|e| RendezvousError::sys("ftruncate", e))?;

        let ptr = Self::map(&fd, len)?;
        let segment = Self {
            ptr,
            len,
            name: name.to_string(),
            owner: true,
        };

        // The mapping starts zero-filled; only the semaphores and the
        // magic need explicit initialization.
        unsafe {
            let block = segment.ptr.as_ptr();
            for s in Sem::ALL {
                sem::init(
                    std::ptr::addr_of_mut!((*block).sems[s as usize]),
                    s.initial_value(),
                )?;
            }
            (*block).stats.start_time = crate::layout::now_sec();
            std::ptr::addr_of_mut!((*block).magic).write_volatile(ShmBlock::MAGIC);
        }
        debug!(segment = name, len, "rendezvous segment created");
        Ok(segment)
    }

    /// Attach to an existing segment
    pub(crate) fn open(name: &str) -> Result<Self> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|e| match e {
            nix::errno::Errno::ENOENT => RendezvousError::Missing(name.to_string()),
            other => RendezvousError::sys("shm_open", other),
        })?;

        let len = ShmBlock::segment_size();
        let ptr = Self::map(&fd, len)?;
        let segment = Self {
            ptr,
            len,
            name: name.to_string(),
            owner: false,
        };
        let magic = unsafe {
            std::ptr::addr_of!((*segment.ptr.as_ptr()).magic).read_volatile()
        };
        if magic != ShmBlock::MAGIC {
            return Err(RendezvousError::BadMagic(name.to_string()));
        }
        Ok(segment)
    }

    fn map(fd: &std::os::fd::OwnedFd, len: usize) -> Result<NonNull<ShmBlock>> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| RendezvousError::sys("mmap", nix::errno::Errno::EINVAL))?;
        let raw = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(|e| RendezvousError::sys("mmap", e))?;
        Ok(raw.cast())
    }

    pub(crate) fn block(&self) -> *mut ShmBlock {
        self.ptr.as_ptr()
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            if self.owner {
                let block = self.ptr.as_ptr();
                for s in Sem::ALL {
                    sem::destroy(std::ptr::addr_of_mut!((*block).sems[s as usize]));
                }
            }
            let _ = munmap(self.ptr.cast(), self.len);
        }
        if self.owner {
            let _ = shm_unlink(self.name.as_str());
        }
    }
}
