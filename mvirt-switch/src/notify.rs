//! Eventfd-backed wakeups for ring consumers.
//!
//! Every virtual port rx ring owns a [`RingNotifier`]. The switch signals it
//! after publishing new slots; a consumer either polls the fd (epoll,
//! io_uring) or simply drains it before reading the ring.

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::eventfd::{EfdFlags, EventFd};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

pub struct RingNotifier {
    eventfd: EventFd,
}

impl RingNotifier {
    /// Create a non-blocking eventfd with a zero counter.
    pub fn new() -> std::io::Result<Self> {
        let eventfd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK)
            .map_err(std::io::Error::from)?;
        Ok(Self { eventfd })
    }

    /// Wake the consumer.
    pub fn signal(&self) {
        // Ignore errors - only fails when the counter would overflow,
        // in which case the consumer is already due to wake
        let _ = self.eventfd.write(1);
    }

    /// Reset the counter and return how many signals were pending.
    pub fn drain(&self) -> u64 {
        // EAGAIN means nothing was pending
        self.eventfd.read().unwrap_or(0)
    }

    /// Block up to `timeout_ms` for a signal. Returns true when one is
    /// pending; the counter is left untouched.
    pub fn wait(&self, timeout_ms: u16) -> bool {
        let poll_fd = PollFd::new(self.eventfd.as_fd(), PollFlags::POLLIN);
        matches!(poll(&mut [poll_fd], PollTimeout::from(timeout_ms)), Ok(n) if n > 0)
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.eventfd.as_fd()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.eventfd.as_fd().as_raw_fd()
    }
}

impl std::fmt::Debug for RingNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingNotifier")
            .field("fd", &self.raw_fd())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_signal_and_drain() {
        let notifier = RingNotifier::new().unwrap();
        assert_eq!(notifier.drain(), 0);

        notifier.signal();
        notifier.signal();
        assert_eq!(notifier.drain(), 2);
        assert_eq!(notifier.drain(), 0);
    }

    #[test]
    fn test_cross_thread() {
        let notifier = Arc::new(RingNotifier::new().unwrap());
        let remote = Arc::clone(&notifier);

        let handle = thread::spawn(move || {
            for _ in 0..5 {
                remote.signal();
            }
        });
        handle.join().unwrap();

        assert_eq!(notifier.drain(), 5);
    }

    #[test]
    fn test_wait() {
        let notifier = RingNotifier::new().unwrap();
        assert!(!notifier.wait(1));
        notifier.signal();
        assert!(notifier.wait(1));
        // Waiting does not consume the signal
        assert_eq!(notifier.drain(), 1);
    }

    #[test]
    fn test_eventfd_exists() {
        let notifier = RingNotifier::new().unwrap();
        assert!(notifier.raw_fd() >= 0);
    }
}
