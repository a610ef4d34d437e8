//! Host reactor interface
//!
//! The engine registers descriptors and a single timer with a [`Reactor`] and
//! holds a liveness token on it while transfers are pending. Readiness and
//! timer expiry flow back to the engine as [`ReactorEvent`]s.

mod event_loop;
mod manual;

pub use event_loop::EventLoop;
pub use manual::{ManualReactor, ReactorCall};

use std::io;
use std::time::Duration;

use crate::engine::TimerMode;
use crate::multiplex::{Descriptor, Interest, Readiness};

/// Event delivered by the host reactor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorEvent {
    Socket { fd: Descriptor, readiness: Readiness },
    Timer,
}

pub trait Reactor {
    /// Start watching `fd` for `interest`
    fn watch(&mut self, fd: Descriptor, interest: Interest) -> io::Result<()>;

    /// Change the interest of an already watched descriptor
    fn modify(&mut self, fd: Descriptor, interest: Interest) -> io::Result<()>;

    fn unwatch(&mut self, fd: Descriptor);

    /// Arm the shared timer, replacing any previous arming
    fn set_timer(&mut self, delay: Duration, mode: TimerMode);

    fn clear_timer(&mut self);

    /// Keep the host loop running until the matching release
    fn acquire_liveness(&mut self);

    fn release_liveness(&mut self);

    fn is_alive(&self) -> bool;
}
