use std::collections::{HashMap, HashSet};
use std::io;
use std::time::Duration;

use super::Reactor;
use crate::engine::TimerMode;
use crate::multiplex::{Descriptor, Interest};

/// One request the engine made of the reactor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactorCall {
    Watch(Descriptor, Interest),
    Modify(Descriptor, Interest),
    Unwatch(Descriptor),
    SetTimer(Duration, TimerMode),
    ClearTimer,
    AcquireLiveness,
    ReleaseLiveness,
}

/// Reactor driven by hand.
///
/// Records registrations instead of acting on them; the host feeds events
/// back through [`TransferEngine::on_socket_ready`](crate::engine::TransferEngine::on_socket_ready)
/// and [`TransferEngine::on_timer`](crate::engine::TransferEngine::on_timer).
#[derive(Debug, Default)]
pub struct ManualReactor {
    calls: Vec<ReactorCall>,
    watched: HashMap<Descriptor, Interest>,
    timer: Option<(Duration, TimerMode)>,
    liveness: usize,
    refused: HashSet<Descriptor>,
}

impl ManualReactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `watch` of `fd` fail
    pub fn refuse(&mut self, fd: Descriptor) {
        self.refused.insert(fd);
    }

    pub fn calls(&self) -> &[ReactorCall] {
        &self.calls
    }

    pub fn take_calls(&mut self) -> Vec<ReactorCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn watched(&self, fd: Descriptor) -> Option<Interest> {
        self.watched.get(&fd).copied()
    }

    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }

    /// Currently armed timer
    pub fn timer(&self) -> Option<(Duration, TimerMode)> {
        self.timer
    }

    /// Outstanding liveness tokens
    pub fn liveness(&self) -> usize {
        self.liveness
    }
}

impl Reactor for ManualReactor {
    fn watch(&mut self, fd: Descriptor, interest: Interest) -> io::Result<()> {
        self.calls.push(ReactorCall::Watch(fd, interest));
        if self.refused.contains(&fd) {
            return Err(io::Error::other(format!("descriptor {} refused", fd)));
        }
        self.watched.insert(fd, interest);
        Ok(())
    }

    fn modify(&mut self, fd: Descriptor, interest: Interest) -> io::Result<()> {
        self.calls.push(ReactorCall::Modify(fd, interest));
        match self.watched.get_mut(&fd) {
            Some(current) => {
                *current = interest;
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("descriptor {} is not watched", fd),
            )),
        }
    }

    fn unwatch(&mut self, fd: Descriptor) {
        self.calls.push(ReactorCall::Unwatch(fd));
        self.watched.remove(&fd);
    }

    fn set_timer(&mut self, delay: Duration, mode: TimerMode) {
        self.calls.push(ReactorCall::SetTimer(delay, mode));
        self.timer = Some((delay, mode));
    }

    fn clear_timer(&mut self) {
        self.calls.push(ReactorCall::ClearTimer);
        self.timer = None;
    }

    fn acquire_liveness(&mut self) {
        self.calls.push(ReactorCall::AcquireLiveness);
        self.liveness += 1;
    }

    fn release_liveness(&mut self) {
        self.calls.push(ReactorCall::ReleaseLiveness);
        self.liveness = self.liveness.saturating_sub(1);
    }

    fn is_alive(&self) -> bool {
        self.liveness > 0
    }
}
