//! Lower transfer layer interface
//!
//! A [`Multiplexer`] advances many transfers without blocking. It is driven by
//! repeated [`Multiplexer::advance`] calls and talks back to the engine through
//! [`MultiplexHooks`] to change socket interest and request timeouts.
//!
//! ## Implementations
//!
//! - [`scripted::ScriptedMultiplexer`] - deterministic in-memory layer
//! - `curl::CurlMultiplexer` - libcurl multi interface (feature `curl`)

#[cfg(feature = "curl")]
pub mod curl;
pub mod scripted;

use std::os::fd::RawFd;
use std::time::Duration;

use thiserror::Error;

use crate::engine::{ChunkSink, Outcome, TransferId};

pub type Descriptor = RawFd;

/// Readiness the lower layer wants to be notified about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interest {
    #[default]
    None,
    Read,
    Write,
    ReadWrite,
}

impl Interest {
    pub fn from_flags(readable: bool, writable: bool) -> Self {
        match (readable, writable) {
            (false, false) => Interest::None,
            (true, false) => Interest::Read,
            (false, true) => Interest::Write,
            (true, true) => Interest::ReadWrite,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Interest::None)
    }

    pub fn is_readable(&self) -> bool {
        matches!(self, Interest::Read | Interest::ReadWrite)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Interest::Write | Interest::ReadWrite)
    }
}

/// Readiness observed by the reactor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub const READABLE: Self = Self {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Self = Self {
        readable: false,
        writable: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }
}

/// What woke the engine up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Socket { fd: Descriptor, readiness: Readiness },
    /// The shared timer expired
    Timeout,
    /// No event; progress whatever can proceed without one
    Kick,
}

/// Result of one advance step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More immediate work is possible; call `advance` again right away
    CallAgain,
    /// Nothing more to do until the next event
    Idle { running: usize },
}

/// Terminal notice for one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: TransferId,
    pub outcome: Outcome,
}

/// A transfer handed back by [`Multiplexer::unregister`]
#[derive(Debug)]
pub struct Detached<T> {
    pub transfer: T,
    pub sink: ChunkSink,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultiplexError {
    #[error("{0}")]
    Backend(String),

    #[error("transfer {0} is already registered")]
    AlreadyRegistered(TransferId),

    #[error("transfer {0} is not registered")]
    NotRegistered(TransferId),
}

/// Engine capabilities handed to the lower layer during each call.
///
/// Implementations must not block and must not call back into the multiplexer.
pub trait MultiplexHooks {
    /// The lower layer's interest in `fd` changed; [`Interest::None`] drops it
    fn interest_changed(&mut self, fd: Descriptor, interest: Interest);

    /// Arm the shared timer, or disarm it when `timeout` is `None`
    fn timeout_requested(&mut self, timeout: Option<Duration>);
}

pub trait Multiplexer {
    /// Opaque, caller-configured transfer context
    type Transfer;

    fn register(
        &mut self,
        id: TransferId,
        transfer: Self::Transfer,
        sink: ChunkSink,
    ) -> Result<(), MultiplexError>;

    fn unregister(&mut self, id: TransferId) -> Result<Detached<Self::Transfer>, MultiplexError>;

    /// Perform one step of work for `target`
    fn advance(
        &mut self,
        target: Target,
        hooks: &mut dyn MultiplexHooks,
    ) -> Result<Progress, MultiplexError>;

    /// Take every completion notice queued so far
    fn poll_completions(&mut self) -> Vec<Completion>;

    /// Cancel a running transfer; its completion is reported as
    /// [`FailureReason::Aborted`](crate::engine::FailureReason::Aborted)
    /// by a later `advance`/`poll_completions`.
    fn abort(&mut self, id: TransferId) -> Result<(), MultiplexError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_flags() {
        assert_eq!(Interest::from_flags(true, true), Interest::ReadWrite);
        assert_eq!(Interest::from_flags(false, false), Interest::None);
        assert!(Interest::ReadWrite.is_readable());
        assert!(Interest::ReadWrite.is_writable());
        assert!(!Interest::Write.is_readable());
        assert!(Interest::None.is_none());
    }

    #[test]
    fn test_readiness_empty() {
        assert!(Readiness::default().is_empty());
        assert!(!Readiness::READABLE.is_empty());
    }
}
