use std::time::Duration;

use tracing::{debug, error};

use super::error::{ConsistencyError, EngineError, ErrorChannel};
use super::timer::Timer;
use super::watcher::{WatchChange, WatcherTable};
use crate::multiplex::{Descriptor, Interest, MultiplexHooks};
use crate::reactor::Reactor;

/// Engine state lent to the lower layer for the duration of one call
pub(super) struct Bridge<'a, R: Reactor> {
    watchers: &'a mut WatcherTable,
    timer: &'a mut Timer,
    reactor: &'a mut R,
    errors: &'a ErrorChannel,
    fault: Option<ConsistencyError>,
}

impl<'a, R: Reactor> Bridge<'a, R> {
    pub(super) fn new(
        watchers: &'a mut WatcherTable,
        timer: &'a mut Timer,
        reactor: &'a mut R,
        errors: &'a ErrorChannel,
    ) -> Self {
        Self {
            watchers,
            timer,
            reactor,
            errors,
            fault: None,
        }
    }

    /// First consistency violation seen during the call
    pub(super) fn into_fault(self) -> Option<ConsistencyError> {
        self.fault
    }
}

impl<R: Reactor> MultiplexHooks for Bridge<'_, R> {
    fn interest_changed(&mut self, fd: Descriptor, interest: Interest) {
        match self.watchers.apply(fd, interest) {
            Ok(WatchChange::Created(interest)) => {
                debug!(fd, ?interest, "Watching descriptor");
                // The entry stays so the lower layer's later removal is consistent.
                // No readiness arrives for `fd`; the transfer ends on the lower
                // layer's own timeout.
                if let Err(source) = self.reactor.watch(fd, interest) {
                    self.errors.report(EngineError::Reactor { fd, source });
                }
            }
            Ok(WatchChange::Updated(interest)) => {
                debug!(fd, ?interest, "Descriptor interest updated");
                if let Err(source) = self.reactor.modify(fd, interest) {
                    self.errors.report(EngineError::Reactor { fd, source });
                }
            }
            Ok(WatchChange::Unchanged) => {}
            Ok(WatchChange::Removed) => {
                debug!(fd, "Descriptor released");
                self.reactor.unwatch(fd);
            }
            Err(fault) => {
                error!(fd, error = %fault, "Lower layer and descriptor table diverged");
                self.fault.get_or_insert(fault);
            }
        }
    }

    fn timeout_requested(&mut self, timeout: Option<Duration>) {
        if self.timer.disarm() {
            self.reactor.clear_timer();
        }

        let Some(requested) = timeout else {
            debug!("Timer disarmed on request");
            return;
        };

        let delay = self.timer.arm(requested);
        debug!(
            requested_ms = requested.as_millis() as u64,
            delay_ms = delay.as_millis() as u64,
            "Timer armed"
        );
        self.reactor.set_timer(delay, self.timer.mode());
    }
}
