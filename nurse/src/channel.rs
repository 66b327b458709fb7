//! Named shared-memory channel for the injection handoff.
//!
//! The channel exists to move exactly one pointer-sized value (the target's
//! original entry-point address) between the injector and the injected stub.
//! It is identified by a well-known name, is exactly [`CHANNEL_SIZE`] bytes,
//! and is single-use per injection attempt; it is not a queue.
//!
//! The backing memory provides no ordering across processes. A writer's
//! value is only guaranteed visible to the reader after an external
//! synchronization event (the injector observing the target stopped, or the
//! target observing a wakeup), which the callers of this module arrange.

use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd as _, OwnedFd};
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use thiserror::Error;

/// Well-known name of the handoff segment. Both the injector and the
/// target-side stub must use exactly this name (tests use throwaway names).
pub const CHANNEL_NAME: &str = "/seccompnurse";

/// Exact size of the backing region: one pointer-sized value plus reserved
/// padding. A hard capacity invariant; a future layout carrying more than
/// one value must be versioned, not grown.
pub const CHANNEL_SIZE: usize = 16;

/// Permission bits applied at creation, as an explicit octal mask: owner
/// read+write, nothing for group or other. Both sides must agree on these
/// bits or [`ChannelError::Mismatch`] is raised at open time.
pub const CHANNEL_MODE: u32 = 0o600;

/// How long an opener waits for a racing creator to size the region.
const CREATE_RACE_WAIT: Duration = Duration::from_millis(200);

/// Possible errors establishing or using the handoff channel.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ChannelError {
    /// The named region exists but with a different size or permission mode.
    /// Fatal to the injection attempt: a channel we cannot trust must not be
    /// used.
    #[error("channel {what} is {actual:#o}, expected {expected:#o}")]
    Mismatch {
        what: &'static str,
        expected: u64,
        actual: u64,
    },
    /// The pointer payload does not fit the fixed value area. Cannot happen
    /// on hosts with <= 8-byte pointers; guards exotic targets.
    #[error("pointer payload of {0} bytes exceeds the channel value area")]
    TooSmall(usize),
    #[error("shared memory operation failed: {0}")]
    Sys(#[from] Errno),
}

/// A handle to the shared handoff region.
///
/// Either party may create the region; under a concurrent race exactly one
/// creation wins and the other side transparently opens the winner's region.
/// The handle unmaps on drop; the name is only removed by [`destroy`].
///
/// [`destroy`]: HandoffChannel::destroy
#[derive(Debug)]
pub struct HandoffChannel {
    ptr: NonNull<libc::c_void>,
    name: String,
    /// Whether this handle's `create_or_open` call created the region.
    creator: bool,
}

impl HandoffChannel {
    /// Create the named region, or open it if it already exists.
    ///
    /// The creator sizes the region to exactly [`CHANNEL_SIZE`]; an opener
    /// verifies the existing region's size and permission bits and refuses
    /// anything that does not match. An opener that races the creator before
    /// the region has been sized waits briefly for it.
    pub fn create_or_open(name: &str) -> Result<Self, ChannelError> {
        let mode = Mode::from_bits_truncate(CHANNEL_MODE);
        let create = OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR;
        let (fd, creator) = match shm_open(name, create, mode) {
            Ok(fd) => (fd, true),
            Err(Errno::EEXIST) => (shm_open(name, OFlag::O_RDWR, Mode::empty())?, false),
            Err(e) => return Err(e.into()),
        };

        if creator {
            ftruncate(&fd, CHANNEL_SIZE as libc::off_t)?;
        } else {
            Self::verify_existing(&fd)?;
        }

        let ptr = unsafe {
            mmap(
                None,
                const { NonZeroUsize::new(CHANNEL_SIZE).unwrap() },
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )?
        };
        // The fd is only needed for mapping; the mapping survives the close.
        drop(fd);

        Ok(Self {
            ptr,
            name: name.to_owned(),
            creator,
        })
    }

    /// Check a pre-existing region's size and mode against the contract.
    fn verify_existing(fd: &OwnedFd) -> Result<(), ChannelError> {
        let deadline = Instant::now() + CREATE_RACE_WAIT;
        let stat = loop {
            let stat = nix::sys::stat::fstat(fd.as_raw_fd())?;
            // A zero-length region means the creator has not sized it yet.
            if stat.st_size != 0 || Instant::now() >= deadline {
                break stat;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        if stat.st_size != CHANNEL_SIZE as libc::off_t {
            return Err(ChannelError::Mismatch {
                what: "size",
                expected: CHANNEL_SIZE as u64,
                actual: stat.st_size as u64,
            });
        }
        let actual_mode = u64::from(stat.st_mode) & 0o777;
        if actual_mode != u64::from(CHANNEL_MODE) {
            return Err(ChannelError::Mismatch {
                what: "mode",
                expected: u64::from(CHANNEL_MODE),
                actual: actual_mode,
            });
        }
        Ok(())
    }

    /// Whether this handle created the region (and therefore owns unlinking).
    #[must_use]
    pub fn is_creator(&self) -> bool {
        self.creator
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write the single pointer-sized payload into the region.
    ///
    /// Visibility to the other side requires an external synchronization
    /// event; the region itself orders nothing.
    pub fn write_value(&mut self, value: u64) -> Result<(), ChannelError> {
        if size_of::<usize>() > size_of::<u64>() {
            return Err(ChannelError::TooSmall(size_of::<usize>()));
        }
        unsafe { self.ptr.cast::<u64>().as_ptr().write_volatile(value) };
        Ok(())
    }

    /// Read back the payload. The caller is responsible for ensuring a
    /// `write_value` happened-before this read; no freshness check is made.
    #[must_use]
    pub fn read_value(&self) -> u64 {
        unsafe { self.ptr.cast::<u64>().as_ptr().read_volatile() }
    }

    /// Unlink the named region. Idempotent: unlinking a name that was never
    /// created, or was already unlinked (say, by a crashed prior run), is a
    /// no-op. Existing mappings stay valid until unmapped.
    pub fn destroy(name: &str) -> Result<(), ChannelError> {
        match shm_unlink(name) {
            Ok(()) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for HandoffChannel {
    fn drop(&mut self) {
        // Unmap only; the name outlives the handle until destroyed.
        let _ = unsafe { munmap(self.ptr, CHANNEL_SIZE) };
    }
}

// The mapping is shared memory; the handle itself is just a pointer and may
// move across threads.
unsafe impl Send for HandoffChannel {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Channel names must be unique per test so parallel tests do not race
    /// each other's regions.
    fn test_name(tag: &str) -> String {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "/nurse-test-{}-{}-{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn round_trip_through_two_handles() {
        let name = test_name("roundtrip");
        let mut writer = HandoffChannel::create_or_open(&name).unwrap();
        let reader = HandoffChannel::create_or_open(&name).unwrap();
        assert!(writer.is_creator());
        assert!(!reader.is_creator());

        let value = 0x0000_5555_dead_beef_u64;
        writer.write_value(value).unwrap();
        assert_eq!(reader.read_value(), value);

        HandoffChannel::destroy(&name).unwrap();
    }

    #[test]
    fn size_mismatch_is_refused() {
        let name = test_name("badsize");
        // Hand-create a region of the wrong size.
        let fd = shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::from_bits_truncate(CHANNEL_MODE),
        )
        .unwrap();
        ftruncate(&fd, 4096).unwrap();
        drop(fd);

        let err = HandoffChannel::create_or_open(&name).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Mismatch { what: "size", actual: 4096, .. }
        ));
        // The stale region must not have been truncated or extended.
        let fd = shm_open(name.as_str(), OFlag::O_RDONLY, Mode::empty()).unwrap();
        let stat = nix::sys::stat::fstat(fd.as_raw_fd()).unwrap();
        assert_eq!(stat.st_size, 4096);
        drop(fd);

        HandoffChannel::destroy(&name).unwrap();
    }

    #[test]
    fn mode_mismatch_is_refused() {
        let name = test_name("badmode");
        let fd = shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o666),
        )
        .unwrap();
        ftruncate(&fd, CHANNEL_SIZE as libc::off_t).unwrap();
        drop(fd);

        let err = HandoffChannel::create_or_open(&name).unwrap_err();
        assert!(matches!(err, ChannelError::Mismatch { what: "mode", .. }));

        HandoffChannel::destroy(&name).unwrap();
    }

    #[test]
    fn destroy_is_idempotent() {
        let name = test_name("destroy");
        // Never created at all.
        HandoffChannel::destroy(&name).unwrap();

        let _handle = HandoffChannel::create_or_open(&name).unwrap();
        HandoffChannel::destroy(&name).unwrap();
        // Twice in a row.
        HandoffChannel::destroy(&name).unwrap();
    }

    #[test]
    fn well_known_name_round_trip() {
        // The production name, end to end: create, publish an 8-byte pointer
        // value, read it back through a second handle. Stale segments from a
        // crashed prior run are cleaned up first; destroy is idempotent.
        HandoffChannel::destroy(CHANNEL_NAME).unwrap();

        let mut stub_side = HandoffChannel::create_or_open(CHANNEL_NAME).unwrap();
        let supervisor_side = HandoffChannel::create_or_open(CHANNEL_NAME).unwrap();

        let entry = 0x0000_7f3a_9c40_1040_u64;
        stub_side.write_value(entry).unwrap();
        assert_eq!(supervisor_side.read_value(), entry);

        HandoffChannel::destroy(CHANNEL_NAME).unwrap();
    }

    #[test]
    fn value_survives_writer_handle_drop() {
        let name = test_name("survive");
        let value = 0x7f00_0000_1234_u64;
        {
            let mut writer = HandoffChannel::create_or_open(&name).unwrap();
            writer.write_value(value).unwrap();
        }
        let reader = HandoffChannel::create_or_open(&name).unwrap();
        assert_eq!(reader.read_value(), value);
        HandoffChannel::destroy(&name).unwrap();
    }
}
