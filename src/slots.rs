//! Per-worker coordination tables.
//!
//! [`WriteSlots`] guarantees that at most one worker writes to any given
//! descriptor at a time, so frames never interleave on a stream.
//! [`PhaseSlots`] keeps operations on the same descriptor consistent across
//! workers: a generic operation must not run while the user is still
//! signing up, and a disconnect or unregister must not run while any other
//! worker still works on that descriptor.

use std::os::unix::io::RawFd;

use parking_lot::Condvar;
use parking_lot::Mutex;

/// Placeholder for "no descriptor".
pub(crate) const VOID_FD: RawFd = -1;

/// Table of descriptors currently being written, one slot per worker.
pub(crate) struct WriteSlots {
    slots: Mutex<Box<[RawFd]>>,
    freed: Condvar,
}

impl WriteSlots {
    pub(crate) fn new(workers: usize) -> WriteSlots {
        WriteSlots {
            slots: Mutex::new(vec![VOID_FD; workers].into_boxed_slice()),
            freed: Condvar::new(),
        }
    }

    /// Blocks until no other worker is writing to `fd`, then claims it.
    /// The claim is released when the returned guard drops.
    pub(crate) fn lock(&self, fd: RawFd, me: usize) -> WriteClaim<'_> {
        let mut slots = self.slots.lock();
        // Rescan from the start after every wakeup; the slot that woke us
        // need not be the only one holding this descriptor.
        let mut i = 0;
        while i < slots.len() {
            if i != me && slots[i] == fd {
                self.freed.wait(&mut slots);
                i = 0;
                continue;
            }
            i += 1;
        }
        slots[me] = fd;
        WriteClaim { owner: self, me }
    }

    /// Wakes every worker parked on a claim; used at shutdown.
    pub(crate) fn wake_all(&self) {
        let _slots = self.slots.lock();
        self.freed.notify_all();
    }
}

/// Exclusive write access to one descriptor; released on drop.
pub(crate) struct WriteClaim<'a> {
    owner: &'a WriteSlots,
    me: usize,
}

impl Drop for WriteClaim<'_> {
    fn drop(&mut self) {
        let mut slots = self.owner.slots.lock();
        slots[self.me] = VOID_FD;
        self.owner.freed.notify_all();
    }
}

/// Kind of operation a worker is running on a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Registration of a new user.
    Signup,
    /// Any ordinary operation.
    Generic,
    /// Disconnect or unregister.
    Ending,
}

#[derive(Clone, Copy)]
struct PhaseEntry {
    fd: RawFd,
    phase: Phase,
}

/// Table of (descriptor, phase) pairs, one slot per worker.
pub(crate) struct PhaseSlots {
    slots: Mutex<Box<[PhaseEntry]>>,
}

impl PhaseSlots {
    pub(crate) fn new(workers: usize) -> PhaseSlots {
        let empty = PhaseEntry {
            fd: VOID_FD,
            phase: Phase::Generic,
        };
        PhaseSlots {
            slots: Mutex::new(vec![empty; workers].into_boxed_slice()),
        }
    }

    /// Records that worker `me` runs `phase` on `fd` if that is admissible
    /// right now. Returns `false` without recording anything otherwise; the
    /// caller is expected to requeue the job and move on rather than wait.
    pub(crate) fn try_claim(&self, fd: RawFd, phase: Phase, me: usize) -> bool {
        let mut slots = self.slots.lock();
        for (i, entry) in slots.iter().enumerate() {
            if i == me || entry.fd != fd {
                continue;
            }
            match phase {
                // The user may still be half-registered.
                Phase::Generic if entry.phase == Phase::Signup => return false,
                // Nobody may still be working on the descriptor.
                Phase::Ending => return false,
                _ => {}
            }
        }
        slots[me] = PhaseEntry { fd, phase };
        true
    }

    /// Clears worker `me`'s record.
    pub(crate) fn clear(&self, me: usize) {
        self.slots.lock()[me].fd = VOID_FD;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn write_claims_exclude_by_fd() {
        let slots = Arc::new(WriteSlots::new(4));
        let writing = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|me| {
                let slots = Arc::clone(&slots);
                let writing = Arc::clone(&writing);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _claim = slots.lock(9, me);
                        assert_eq!(writing.fetch_add(1, Ordering::SeqCst), 0);
                        thread::sleep(Duration::from_micros(50));
                        writing.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn write_claims_on_distinct_fds_do_not_block() {
        let slots = WriteSlots::new(2);
        let _a = slots.lock(3, 0);
        let _b = slots.lock(4, 1);
    }

    #[test]
    fn generic_waits_for_signup() {
        let slots = PhaseSlots::new(2);
        assert!(slots.try_claim(5, Phase::Signup, 0));
        assert!(!slots.try_claim(5, Phase::Generic, 1));
        slots.clear(0);
        assert!(slots.try_claim(5, Phase::Generic, 1));
    }

    #[test]
    fn ending_waits_for_everyone() {
        let slots = PhaseSlots::new(2);
        assert!(slots.try_claim(5, Phase::Generic, 0));
        assert!(!slots.try_claim(5, Phase::Ending, 1));
        slots.clear(0);
        assert!(slots.try_claim(5, Phase::Ending, 1));
    }

    #[test]
    fn signup_is_always_admissible() {
        let slots = PhaseSlots::new(2);
        assert!(slots.try_claim(5, Phase::Generic, 0));
        assert!(slots.try_claim(5, Phase::Signup, 1));
    }

    #[test]
    fn other_descriptors_do_not_interfere() {
        let slots = PhaseSlots::new(2);
        assert!(slots.try_claim(5, Phase::Signup, 0));
        assert!(slots.try_claim(6, Phase::Ending, 1));
    }
}
