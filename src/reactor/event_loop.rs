//! Tokio-backed reactor
//!
//! Descriptors are registered with the runtime's I/O driver through
//! [`AsyncFd`] and a single [`Sleep`] serves as the shared timer. Events are
//! gathered into a queue and handed out one at a time by [`EventLoop::next_event`].
//!
//! Must be used from within a tokio runtime with I/O and time enabled.

use std::collections::{HashMap, VecDeque};
use std::future::{Future, poll_fn};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tokio::io::unix::AsyncFd;
use tokio::time::{Instant, Sleep};
use tracing::{debug, trace};

use super::{Reactor, ReactorEvent};
use crate::engine::TimerMode;
use crate::multiplex::{Descriptor, Interest, Readiness};

/// Borrowed descriptor; ownership stays with the lower layer
struct WatchedFd(RawFd);

impl AsRawFd for WatchedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

struct Watched {
    io: AsyncFd<WatchedFd>,
    interest: Interest,
}

struct ArmedTimer {
    sleep: Pin<Box<Sleep>>,
    period: Duration,
    mode: TimerMode,
}

#[derive(Default)]
pub struct EventLoop {
    watched: HashMap<Descriptor, Watched>,
    timer: Option<ArmedTimer>,
    pending: VecDeque<ReactorEvent>,
    liveness: usize,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    /// Wait for the next readiness or timer event.
    ///
    /// Returns `None` when nothing is watched, no timer is armed and no event
    /// is queued: waiting would never finish.
    pub async fn next_event(&mut self) -> Option<ReactorEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        if self.watched.is_empty() && self.timer.is_none() {
            return None;
        }

        poll_fn(|cx| self.poll_events(cx)).await;
        self.pending.pop_front()
    }

    fn poll_events(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Self {
            watched,
            timer,
            pending,
            ..
        } = self;

        for (fd, entry) in watched.iter() {
            let mut readiness = Readiness::default();
            if entry.interest.is_readable() {
                readiness.readable = poll_level(&entry.io, Direction::Read, cx);
            }
            if entry.interest.is_writable() {
                readiness.writable = poll_level(&entry.io, Direction::Write, cx);
            }
            if !readiness.is_empty() {
                trace!(fd, ?readiness, "Descriptor ready");
                pending.push_back(ReactorEvent::Socket {
                    fd: *fd,
                    readiness,
                });
            }
        }

        if let Some(armed) = timer {
            if armed.sleep.as_mut().poll(cx).is_ready() {
                trace!("Timer fired");
                pending.push_back(ReactorEvent::Timer);
                let mode = armed.mode;
                match mode {
                    TimerMode::OneShot => *timer = None,
                    TimerMode::Repeating => {
                        let next = Instant::now() + armed.period;
                        armed.sleep.as_mut().reset(next);
                    }
                }
            }
        }

        if pending.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Read,
    Write,
}

impl Direction {
    fn flags(self) -> PollFlags {
        match self {
            Direction::Read => PollFlags::POLLIN,
            Direction::Write => PollFlags::POLLOUT,
        }
    }
}

/// Level-triggered readiness: reported on every poll while the descriptor
/// stays readable (or writable), the way `ev_io` watchers behave.
fn poll_level(io: &AsyncFd<WatchedFd>, direction: Direction, cx: &mut Context<'_>) -> bool {
    loop {
        let ready = match direction {
            Direction::Read => io.poll_read_ready(cx),
            Direction::Write => io.poll_write_ready(cx),
        };
        match ready {
            Poll::Ready(Ok(mut guard)) => {
                if ready_now(io.get_ref().0, direction.flags()) {
                    return true;
                }
                // no longer ready since the last edge; re-arm the waker
                guard.clear_ready();
            }
            // let the lower layer observe the error on its next call
            Poll::Ready(Err(_)) => return true,
            Poll::Pending => return false,
        }
    }
}

/// Zero-timeout `poll(2)` of the descriptor's current state. Hang-ups and
/// socket errors count as ready so the lower layer gets to observe them.
fn ready_now(fd: RawFd, events: PollFlags) -> bool {
    // SAFETY: `fd` stays open while watched; the borrow ends with this call
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(borrowed, events)];
    match poll(&mut fds, PollTimeout::ZERO) {
        Ok(0) => false,
        Ok(_) => fds[0].revents().is_some_and(|revents| {
            revents.intersects(events | PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL)
        }),
        Err(err) => {
            trace!(fd, error = %err, "Readiness check failed");
            true
        }
    }
}

fn tokio_interest() -> tokio::io::Interest {
    tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE
}

impl Reactor for EventLoop {
    fn watch(&mut self, fd: Descriptor, interest: Interest) -> io::Result<()> {
        let io = AsyncFd::with_interest(WatchedFd(fd), tokio_interest())?;
        debug!(fd, ?interest, "Descriptor registered with runtime");
        self.watched.insert(fd, Watched { io, interest });
        Ok(())
    }

    fn modify(&mut self, fd: Descriptor, interest: Interest) -> io::Result<()> {
        match self.watched.get_mut(&fd) {
            Some(entry) => {
                entry.interest = interest;
                Ok(())
            }
            None => self.watch(fd, interest),
        }
    }

    fn unwatch(&mut self, fd: Descriptor) {
        if self.watched.remove(&fd).is_some() {
            debug!(fd, "Descriptor deregistered from runtime");
        }
        self.pending
            .retain(|event| !matches!(event, ReactorEvent::Socket { fd: queued, .. } if *queued == fd));
    }

    fn set_timer(&mut self, delay: Duration, mode: TimerMode) {
        let deadline = Instant::now() + delay;
        match &mut self.timer {
            Some(armed) => {
                armed.sleep.as_mut().reset(deadline);
                armed.period = delay;
                armed.mode = mode;
            }
            None => {
                self.timer = Some(ArmedTimer {
                    sleep: Box::pin(tokio::time::sleep_until(deadline)),
                    period: delay,
                    mode,
                });
            }
        }
        self.pending
            .retain(|event| !matches!(event, ReactorEvent::Timer));
    }

    fn clear_timer(&mut self) {
        self.timer = None;
        self.pending
            .retain(|event| !matches!(event, ReactorEvent::Timer));
    }

    fn acquire_liveness(&mut self) {
        self.liveness += 1;
    }

    fn release_liveness(&mut self) {
        self.liveness = self.liveness.saturating_sub(1);
    }

    fn is_alive(&self) -> bool {
        self.liveness > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    fn socket_pair() -> (UnixStream, UnixStream) {
        let (left, right) = UnixStream::pair().unwrap();
        left.set_nonblocking(true).unwrap();
        right.set_nonblocking(true).unwrap();
        (left, right)
    }

    #[tokio::test]
    async fn test_idle_loop_has_no_events() {
        let mut reactor = EventLoop::new();
        assert_eq!(reactor.next_event().await, None);
    }

    #[tokio::test]
    async fn test_readable_descriptor_reported() {
        let (left, mut right) = socket_pair();
        let mut reactor = EventLoop::new();
        reactor.watch(left.as_raw_fd(), Interest::Read).unwrap();

        right.write_all(b"ping").unwrap();
        let event = reactor.next_event().await;

        assert_eq!(
            event,
            Some(ReactorEvent::Socket {
                fd: left.as_raw_fd(),
                readiness: Readiness::READABLE,
            })
        );
    }

    #[tokio::test]
    async fn test_write_interest_fires_immediately() {
        let (left, _right) = socket_pair();
        let mut reactor = EventLoop::new();
        reactor.watch(left.as_raw_fd(), Interest::Write).unwrap();

        let event = reactor.next_event().await;
        assert!(matches!(
            event,
            Some(ReactorEvent::Socket { readiness, .. }) if readiness.writable && !readiness.readable
        ));
    }

    #[tokio::test]
    async fn test_write_readiness_stays_level_triggered() {
        let (left, _right) = socket_pair();
        let mut reactor = EventLoop::new();
        reactor.watch(left.as_raw_fd(), Interest::Write).unwrap();

        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(1), reactor.next_event())
                .await
                .unwrap();
            assert_eq!(
                event,
                Some(ReactorEvent::Socket {
                    fd: left.as_raw_fd(),
                    readiness: Readiness::WRITABLE,
                })
            );
        }
    }

    #[tokio::test]
    async fn test_full_send_buffer_not_reported_writable() {
        let (left, _right) = socket_pair();
        let mut stream = &left;
        let chunk = [0u8; 4096];
        while stream.write(&chunk).is_ok() {}

        let mut reactor = EventLoop::new();
        reactor.watch(left.as_raw_fd(), Interest::Write).unwrap();
        reactor.set_timer(Duration::from_millis(20), TimerMode::OneShot);

        assert_eq!(reactor.next_event().await, Some(ReactorEvent::Timer));
    }

    #[tokio::test]
    async fn test_one_shot_timer_fires_once() {
        let mut reactor = EventLoop::new();
        reactor.set_timer(Duration::from_millis(5), TimerMode::OneShot);

        assert_eq!(reactor.next_event().await, Some(ReactorEvent::Timer));
        assert!(!reactor.has_timer());
        assert_eq!(reactor.next_event().await, None);
    }

    #[tokio::test]
    async fn test_repeating_timer_rearms() {
        let mut reactor = EventLoop::new();
        reactor.set_timer(Duration::from_millis(2), TimerMode::Repeating);

        assert_eq!(reactor.next_event().await, Some(ReactorEvent::Timer));
        assert_eq!(reactor.next_event().await, Some(ReactorEvent::Timer));
        assert!(reactor.has_timer());

        reactor.clear_timer();
        assert_eq!(reactor.next_event().await, None);
    }

    #[tokio::test]
    async fn test_unwatch_drops_queued_events() {
        let (left, _right) = socket_pair();
        let (other, _other_peer) = socket_pair();
        let mut reactor = EventLoop::new();
        reactor.watch(left.as_raw_fd(), Interest::Write).unwrap();
        reactor.watch(other.as_raw_fd(), Interest::Write).unwrap();

        // both are writable; the first wait may queue events for each
        let first = reactor.next_event().await.unwrap();
        let ReactorEvent::Socket { fd, .. } = first else {
            panic!("expected socket event, got {:?}", first);
        };
        let remaining = if fd == left.as_raw_fd() {
            other.as_raw_fd()
        } else {
            left.as_raw_fd()
        };

        reactor.unwatch(remaining);
        reactor.unwatch(fd);
        assert_eq!(reactor.watched_count(), 0);
        assert_eq!(reactor.next_event().await, None);
    }

    #[test]
    fn test_liveness_counter() {
        let mut reactor = EventLoop::new();
        reactor.acquire_liveness();
        assert!(reactor.is_alive());
        reactor.release_liveness();
        reactor.release_liveness();
        assert!(!reactor.is_alive());
    }
}
