//! Descriptor-to-watcher bookkeeping

use std::collections::HashMap;

use super::error::ConsistencyError;
use crate::multiplex::{Descriptor, Interest};

/// Readiness registration for one descriptor.
///
/// Events for the descriptor are routed back to the engine by the reactor,
/// keyed by `fd`; the watcher itself holds no reference to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketWatcher {
    fd: Descriptor,
    interest: Interest,
}

impl SocketWatcher {
    pub fn fd(&self) -> Descriptor {
        self.fd
    }

    /// Current readiness mask, never [`Interest::None`]
    pub fn interest(&self) -> Interest {
        self.interest
    }
}

/// What an interest report did to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchChange {
    Created(Interest),
    Updated(Interest),
    Unchanged,
    Removed,
}

#[derive(Debug, Default)]
pub(crate) struct WatcherTable {
    entries: HashMap<Descriptor, SocketWatcher>,
}

impl WatcherTable {
    /// Apply the lower layer's latest interest for `fd`
    pub(crate) fn apply(
        &mut self,
        fd: Descriptor,
        interest: Interest,
    ) -> Result<WatchChange, ConsistencyError> {
        match (self.entries.get_mut(&fd), interest) {
            (None, Interest::None) => Err(ConsistencyError::UnknownDescriptor { fd }),
            (None, interest) => {
                self.entries.insert(fd, SocketWatcher { fd, interest });
                Ok(WatchChange::Created(interest))
            }
            (Some(_), Interest::None) => {
                self.entries.remove(&fd);
                Ok(WatchChange::Removed)
            }
            (Some(watcher), interest) if watcher.interest == interest => Ok(WatchChange::Unchanged),
            (Some(watcher), interest) => {
                watcher.interest = interest;
                Ok(WatchChange::Updated(interest))
            }
        }
    }

    pub(crate) fn get(&self, fd: Descriptor) -> Option<&SocketWatcher> {
        self.entries.get(&fd)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &SocketWatcher> {
        self.entries.values()
    }
}
