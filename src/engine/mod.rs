//! Transfer engine
//!
//! Bridges a pull-style [`Multiplexer`] (driven by repeated advance calls) to a
//! push-style [`Reactor`] (delivering readiness and timer events). The engine
//! owns the descriptor-to-watcher table, the single shared [`Timer`], the set
//! of in-flight transfers and the liveness token that keeps the host loop
//! running while work is pending.
//!
//! ## Flow
//!
//! 1. Caller configures a [`TransferHandle`] and [`submit`](TransferEngine::submit)s it
//! 2. The lower layer asks for socket interest / timeouts through the engine's hooks
//! 3. The reactor reports readiness; the engine runs the advance step until idle
//! 4. Completion notices are drained in the same pass and handed to the caller
//!
//! All entry points run on the thread driving the host loop. No locking is done.

mod bridge;
mod error;
mod handle;
mod timer;
mod watcher;

pub(crate) use error::ErrorChannel;
pub use error::{ConsistencyError, EngineError, HandleError, Result};
pub use handle::{
    ChunkSink, CompletionCallback, FailureReason, Outcome, TransferHandle, TransferId,
    TransferState, WriteCallback,
};
pub use timer::{Timer, TimerMode};
pub use watcher::SocketWatcher;

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::multiplex::{
    Completion, Descriptor, Detached, Multiplexer, Progress, Readiness, Target,
};
use crate::observability::EngineMetrics;
use crate::reactor::{EventLoop, Reactor, ReactorEvent};
use bridge::Bridge;
use watcher::WatcherTable;

/// Summary of one advance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdvanceReport {
    /// Completion callbacks delivered
    pub completed: usize,
    /// Advance steps that failed (reported on the error channel)
    pub advance_errors: usize,
}

struct InFlight<T> {
    on_complete: Option<CompletionCallback<T>>,
}

pub struct TransferEngine<M: Multiplexer, R: Reactor> {
    multi: M,
    reactor: R,
    watchers: WatcherTable,
    timer: Timer,
    in_flight: HashMap<TransferId, InFlight<M::Transfer>>,
    live: bool,
    next_id: u64,
    errors: ErrorChannel,
    error_rx: mpsc::UnboundedReceiver<EngineError>,
    halted: Option<ConsistencyError>,
    metrics: EngineMetrics,
}

impl<M: Multiplexer, R: Reactor> TransferEngine<M, R> {
    pub fn new(multi: M, reactor: R, config: &EngineConfig) -> Self {
        let (errors, error_rx) = ErrorChannel::new();
        info!(
            timer_ceiling_ms = config.max_timer_delay_ms,
            timer_mode = ?config.timer_mode,
            "Transfer engine initialized"
        );
        Self {
            multi,
            reactor,
            watchers: WatcherTable::default(),
            timer: Timer::new(config.timer_ceiling(), config.timer_mode),
            in_flight: HashMap::new(),
            live: false,
            next_id: 0,
            errors,
            error_rx,
            halted: None,
            metrics: EngineMetrics::new(),
        }
    }

    /// Register a configured transfer and run one advance pass.
    ///
    /// The pass may complete the transfer (and invoke its completion callback)
    /// before this returns.
    pub fn submit(&mut self, handle: TransferHandle<M::Transfer>) -> Result<TransferId> {
        self.ensure_running()?;
        if handle.state() != TransferState::Configured {
            return Err(EngineError::InvalidState(handle.state()));
        }

        self.next_id += 1;
        let id = TransferId::from(self.next_id);
        let (transfer, on_data, on_complete) = handle.into_parts();
        let sink = ChunkSink::new(id, on_data, self.errors.clone());

        if let Err(err) = self.multi.register(id, transfer, sink) {
            warn!(transfer = %id, error = %err, "Transfer registration rejected");
            return Err(EngineError::Registration(err));
        }

        self.in_flight.insert(id, InFlight { on_complete });
        self.metrics.transfer_submitted();
        if !self.live {
            self.reactor.acquire_liveness();
            self.live = true;
            debug!("Liveness token acquired");
        }
        debug!(transfer = %id, active = self.in_flight.len(), "Transfer submitted");

        self.drive(Target::Kick)?;
        Ok(id)
    }

    /// Run the advance step without a specific event.
    ///
    /// Transfers waiting on a descriptor or on the timer stay parked.
    pub fn advance(&mut self) -> Result<AdvanceReport> {
        self.drive(Target::Kick)
    }

    /// Reactor reported readiness on `fd`
    pub fn on_socket_ready(&mut self, fd: Descriptor, readiness: Readiness) -> Result<AdvanceReport> {
        self.drive(Target::Socket { fd, readiness })
    }

    /// Reactor fired the shared timer
    pub fn on_timer(&mut self) -> Result<AdvanceReport> {
        self.timer.expire();
        self.drive(Target::Timeout)
    }

    pub fn dispatch(&mut self, event: ReactorEvent) -> Result<AdvanceReport> {
        match event {
            ReactorEvent::Socket { fd, readiness } => self.on_socket_ready(fd, readiness),
            ReactorEvent::Timer => self.on_timer(),
        }
    }

    /// Cancel an in-flight transfer through the lower layer.
    ///
    /// The resulting [`FailureReason::Aborted`] completion is delivered by the
    /// advance pass run before this returns.
    pub fn abort(&mut self, id: TransferId) -> Result<AdvanceReport> {
        self.ensure_running()?;
        if !self.in_flight.contains_key(&id) {
            return Err(EngineError::UnknownTransfer(id));
        }
        self.multi.abort(id).map_err(EngineError::Advance)?;
        info!(transfer = %id, "Transfer abort requested");
        self.drive(Target::Kick)
    }

    /// Transfers registered with the lower layer and not yet completed
    pub fn active_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn holds_liveness(&self) -> bool {
        self.live
    }

    pub fn watcher(&self, fd: Descriptor) -> Option<&SocketWatcher> {
        self.watchers.get(fd)
    }

    pub fn watchers(&self) -> impl Iterator<Item = &SocketWatcher> {
        self.watchers.iter()
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn multiplexer(&self) -> &M {
        &self.multi
    }

    pub fn multiplexer_mut(&mut self) -> &mut M {
        &mut self.multi
    }

    pub fn reactor(&self) -> &R {
        &self.reactor
    }

    pub fn reactor_mut(&mut self) -> &mut R {
        &mut self.reactor
    }

    /// Consistency failure that halted this engine, if any
    pub fn halted(&self) -> Option<&ConsistencyError> {
        self.halted.as_ref()
    }

    /// Take every error reported since the last call
    pub fn drain_errors(&mut self) -> Vec<EngineError> {
        let mut drained = Vec::new();
        while let Ok(err) = self.error_rx.try_recv() {
            drained.push(err);
        }
        drained
    }

    fn ensure_running(&self) -> Result<()> {
        match &self.halted {
            Some(fault) => Err(EngineError::Consistency(fault.clone())),
            None => Ok(()),
        }
    }

    fn drive(&mut self, target: Target) -> Result<AdvanceReport> {
        self.ensure_running()?;
        let mut report = AdvanceReport::default();

        let mut bridge = Bridge::new(
            &mut self.watchers,
            &mut self.timer,
            &mut self.reactor,
            &self.errors,
        );
        let running = loop {
            match self.multi.advance(target, &mut bridge) {
                Ok(Progress::CallAgain) => continue,
                Ok(Progress::Idle { running }) => break Some(running),
                Err(err) => {
                    report.advance_errors += 1;
                    self.metrics.advance_failed();
                    self.errors.report(EngineError::Advance(err));
                    break None;
                }
            }
        };
        if let Some(fault) = bridge.into_fault() {
            return Err(self.halt(fault));
        }

        if running == Some(0) && self.timer.disarm() {
            self.reactor.clear_timer();
        }

        report.completed = self.drain_completions()?;
        if self.in_flight.is_empty() {
            self.settle_idle();
        }
        Ok(report)
    }

    fn drain_completions(&mut self) -> Result<usize> {
        let mut completed = 0;
        loop {
            let batch = self.multi.poll_completions();
            if batch.is_empty() {
                return Ok(completed);
            }
            for completion in batch {
                self.finish(completion)?;
                completed += 1;
            }
        }
    }

    fn finish(&mut self, completion: Completion) -> Result<()> {
        let Completion { id, outcome } = completion;
        let Some(entry) = self.in_flight.remove(&id) else {
            return Err(self.halt(ConsistencyError::UnknownCompletion { id }));
        };
        let Detached { transfer, sink } = match self.multi.unregister(id) {
            Ok(detached) => detached,
            Err(err) => {
                return Err(self.halt(ConsistencyError::Unregister {
                    id,
                    reason: err.to_string(),
                }));
            }
        };

        let outcome = match sink.fault() {
            Some(message) => {
                self.metrics.callback_fault();
                Outcome::Failure(FailureReason::Callback(message.to_string()))
            }
            None => outcome,
        };

        if self.in_flight.is_empty() {
            self.settle_idle();
        }

        match &outcome {
            Outcome::Success => {
                self.metrics.transfer_completed();
                debug!(transfer = %id, bytes = sink.delivered(), "Transfer completed");
            }
            Outcome::Failure(reason) => {
                self.metrics.transfer_failed();
                warn!(transfer = %id, %reason, "Transfer failed");
            }
        }

        let handle = TransferHandle::completed(transfer, sink.into_callback(), id);
        let Some(callback) = entry.on_complete else {
            return Ok(());
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(handle, outcome))) {
            let message = handle::panic_message(payload.as_ref());
            self.metrics.callback_fault();
            self.errors.report(EngineError::Callback { id, message });
        }
        Ok(())
    }

    /// No transfers left: drop the timer and let the host loop exit
    fn settle_idle(&mut self) {
        if self.timer.disarm() {
            self.reactor.clear_timer();
        }
        if self.live {
            self.reactor.release_liveness();
            self.live = false;
            debug!("Liveness token released");
        }
    }

    fn halt(&mut self, fault: ConsistencyError) -> EngineError {
        error!(error = %fault, "Transfer engine halted");
        self.errors.report(EngineError::Consistency(fault.clone()));
        self.halted = Some(fault.clone());
        EngineError::Consistency(fault)
    }
}

impl<M: Multiplexer> TransferEngine<M, EventLoop> {
    /// Drive transfers on the current tokio runtime until none are pending
    pub async fn run(&mut self) -> Result<()> {
        self.ensure_running()?;
        while self.reactor.is_alive() {
            match self.reactor.next_event().await {
                Some(event) => {
                    self.dispatch(event)?;
                }
                None => {
                    let active = self.active_count();
                    error!(active, "Transfers pending with nothing to wait on");
                    return Err(EngineError::Stalled { active });
                }
            }
        }
        info!(metrics = ?self.metrics.snapshot(), "All transfers settled");
        Ok(())
    }
}
