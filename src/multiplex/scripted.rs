//! Deterministic in-memory lower layer
//!
//! Every transfer follows a [`Script`]: a queue of steps executed in order on
//! each `advance`. A transfer parks at an await step and resumes only on a
//! later `advance` whose target matches. Useful for exercising the engine
//! without sockets or network access.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use tracing::trace;

use super::{
    Completion, Descriptor, Detached, Interest, MultiplexError, MultiplexHooks, Multiplexer,
    Progress, Target,
};
use crate::engine::{ChunkSink, FailureReason, Outcome, TransferId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Report new interest in a descriptor
    Interest(Descriptor, Interest),
    /// Request a timeout (`None` disarms)
    Timeout(Option<Duration>),
    /// Park until advanced for this descriptor
    AwaitSocket(Descriptor),
    /// Park until the shared timer expires
    AwaitTimeout,
    /// Hand a chunk to the transfer's sink
    Deliver(Bytes),
    /// Stop and report [`Progress::CallAgain`]
    CallAgain,
    /// Stop and fail the whole advance call
    FailAdvance(String),
    /// Queue the completion notice
    Complete(Outcome),
}

/// Step queue for one transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    steps: VecDeque<Step>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push_back(step);
        self
    }

    pub fn interest(self, fd: Descriptor, interest: Interest) -> Self {
        self.step(Step::Interest(fd, interest))
    }

    pub fn timeout(self, timeout: Option<Duration>) -> Self {
        self.step(Step::Timeout(timeout))
    }

    pub fn await_socket(self, fd: Descriptor) -> Self {
        self.step(Step::AwaitSocket(fd))
    }

    pub fn await_timeout(self) -> Self {
        self.step(Step::AwaitTimeout)
    }

    pub fn deliver(self, chunk: impl Into<Bytes>) -> Self {
        self.step(Step::Deliver(chunk.into()))
    }

    pub fn call_again(self) -> Self {
        self.step(Step::CallAgain)
    }

    pub fn fail_advance(self, message: impl Into<String>) -> Self {
        self.step(Step::FailAdvance(message.into()))
    }

    pub fn succeed(self) -> Self {
        self.step(Step::Complete(Outcome::Success))
    }

    pub fn fail(self, reason: impl Into<String>) -> Self {
        self.step(Step::Complete(Outcome::Failure(FailureReason::Transport(
            reason.into(),
        ))))
    }

    /// Steps not executed yet
    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

#[derive(Debug)]
struct Running {
    script: Script,
    sink: ChunkSink,
    parked: bool,
    done: bool,
    fds: BTreeSet<Descriptor>,
}

/// Where a transfer stopped during one advance call
enum Halt {
    Parked,
    Finished,
    CallAgain,
    Failed(String),
}

#[derive(Debug, Default)]
pub struct ScriptedMultiplexer {
    transfers: BTreeMap<TransferId, Running>,
    completions: Vec<Completion>,
    /// Interest removals queued outside an advance call
    deferred: Vec<Descriptor>,
    advance_calls: usize,
    refusal: Option<String>,
}

impl ScriptedMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `advance` invocations so far
    pub fn advance_calls(&self) -> usize {
        self.advance_calls
    }

    /// Make every later `register` fail with `reason`
    pub fn refuse_registrations(&mut self, reason: impl Into<String>) {
        self.refusal = Some(reason.into());
    }

    pub fn is_registered(&self, id: TransferId) -> bool {
        self.transfers.contains_key(&id)
    }

    fn running(&self) -> usize {
        self.transfers.values().filter(|t| !t.done).count()
    }
}

fn satisfies(step: Option<&Step>, target: Target) -> bool {
    match (step, target) {
        (Some(Step::AwaitSocket(fd)), Target::Socket { fd: ready, .. }) => *fd == ready,
        (Some(Step::AwaitTimeout), Target::Timeout) => true,
        _ => false,
    }
}

fn release_fds(running: &mut Running, hooks: &mut dyn MultiplexHooks) {
    for fd in std::mem::take(&mut running.fds) {
        hooks.interest_changed(fd, Interest::None);
    }
}

fn run_steps(
    id: TransferId,
    running: &mut Running,
    hooks: &mut dyn MultiplexHooks,
    completions: &mut Vec<Completion>,
) -> Halt {
    while let Some(step) = running.script.steps.pop_front() {
        match step {
            Step::Interest(fd, interest) => {
                if interest.is_none() {
                    running.fds.remove(&fd);
                } else {
                    running.fds.insert(fd);
                }
                hooks.interest_changed(fd, interest);
            }
            Step::Timeout(timeout) => hooks.timeout_requested(timeout),
            step @ (Step::AwaitSocket(_) | Step::AwaitTimeout) => {
                running.script.steps.push_front(step);
                running.parked = true;
                return Halt::Parked;
            }
            Step::Deliver(chunk) => {
                let accepted = running.sink.deliver(&chunk);
                if accepted < chunk.len() {
                    trace!(transfer = %id, accepted, offered = chunk.len(), "Chunk refused, aborting");
                    release_fds(running, hooks);
                    running.done = true;
                    completions.push(Completion {
                        id,
                        outcome: Outcome::Failure(FailureReason::Transport(format!(
                            "write callback accepted {} of {} bytes",
                            accepted,
                            chunk.len()
                        ))),
                    });
                    return Halt::Finished;
                }
            }
            Step::CallAgain => return Halt::CallAgain,
            Step::FailAdvance(message) => return Halt::Failed(message),
            Step::Complete(outcome) => {
                release_fds(running, hooks);
                running.done = true;
                completions.push(Completion { id, outcome });
                return Halt::Finished;
            }
        }
    }
    Halt::Parked
}

impl Multiplexer for ScriptedMultiplexer {
    type Transfer = Script;

    fn register(
        &mut self,
        id: TransferId,
        transfer: Script,
        sink: ChunkSink,
    ) -> Result<(), MultiplexError> {
        if let Some(reason) = &self.refusal {
            return Err(MultiplexError::Backend(reason.clone()));
        }
        if self.transfers.contains_key(&id) {
            return Err(MultiplexError::AlreadyRegistered(id));
        }
        self.transfers.insert(
            id,
            Running {
                script: transfer,
                sink,
                parked: false,
                done: false,
                fds: BTreeSet::new(),
            },
        );
        Ok(())
    }

    fn unregister(&mut self, id: TransferId) -> Result<Detached<Script>, MultiplexError> {
        let running = self
            .transfers
            .remove(&id)
            .ok_or(MultiplexError::NotRegistered(id))?;
        Ok(Detached {
            transfer: running.script,
            sink: running.sink,
        })
    }

    fn advance(
        &mut self,
        target: Target,
        hooks: &mut dyn MultiplexHooks,
    ) -> Result<Progress, MultiplexError> {
        self.advance_calls += 1;

        for fd in self.deferred.drain(..) {
            hooks.interest_changed(fd, Interest::None);
        }

        let mut call_again = false;
        let mut failure = None;

        for (id, running) in self.transfers.iter_mut() {
            if running.done {
                continue;
            }
            if running.parked {
                if !satisfies(running.script.steps.front(), target) {
                    continue;
                }
                running.script.steps.pop_front();
                running.parked = false;
            }

            match run_steps(*id, running, hooks, &mut self.completions) {
                Halt::Parked | Halt::Finished => {}
                Halt::CallAgain => call_again = true,
                Halt::Failed(message) => {
                    failure.get_or_insert(message);
                }
            }
        }

        if let Some(message) = failure {
            return Err(MultiplexError::Backend(message));
        }
        if call_again {
            return Ok(Progress::CallAgain);
        }
        Ok(Progress::Idle {
            running: self.running(),
        })
    }

    fn poll_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }

    fn abort(&mut self, id: TransferId) -> Result<(), MultiplexError> {
        let running = self
            .transfers
            .get_mut(&id)
            .ok_or(MultiplexError::NotRegistered(id))?;
        if running.done {
            return Ok(());
        }

        running.done = true;
        running.script.steps.clear();
        self.deferred.extend(std::mem::take(&mut running.fds));
        self.completions.push(Completion {
            id,
            outcome: Outcome::Failure(FailureReason::Aborted),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ErrorChannel;
    use crate::multiplex::Readiness;

    #[derive(Debug, Default)]
    struct Recorder {
        interest: Vec<(Descriptor, Interest)>,
        timeouts: Vec<Option<Duration>>,
    }

    impl MultiplexHooks for Recorder {
        fn interest_changed(&mut self, fd: Descriptor, interest: Interest) {
            self.interest.push((fd, interest));
        }

        fn timeout_requested(&mut self, timeout: Option<Duration>) {
            self.timeouts.push(timeout);
        }
    }

    fn sink(id: TransferId) -> ChunkSink {
        let (errors, _rx) = ErrorChannel::new();
        ChunkSink::new(id, None, errors)
    }

    fn register(multi: &mut ScriptedMultiplexer, id: u64, script: Script) -> TransferId {
        let id = TransferId::from(id);
        multi.register(id, script, sink(id)).unwrap();
        id
    }

    #[test]
    fn test_runs_until_first_await() {
        let mut multi = ScriptedMultiplexer::new();
        let mut hooks = Recorder::default();
        let id = register(
            &mut multi,
            1,
            Script::new()
                .interest(4, Interest::Read)
                .timeout(Some(Duration::from_millis(10)))
                .await_socket(4)
                .succeed(),
        );

        let progress = multi.advance(Target::Kick, &mut hooks).unwrap();
        assert_eq!(progress, Progress::Idle { running: 1 });
        assert_eq!(hooks.interest, vec![(4, Interest::Read)]);
        assert_eq!(hooks.timeouts, vec![Some(Duration::from_millis(10))]);
        assert!(multi.poll_completions().is_empty());

        // a timer event does not satisfy a socket wait
        multi.advance(Target::Timeout, &mut hooks).unwrap();
        assert!(multi.poll_completions().is_empty());

        let ready = Target::Socket {
            fd: 4,
            readiness: Readiness::READABLE,
        };
        let progress = multi.advance(ready, &mut hooks).unwrap();
        assert_eq!(progress, Progress::Idle { running: 0 });
        assert_eq!(
            multi.poll_completions(),
            vec![Completion {
                id,
                outcome: Outcome::Success
            }]
        );
    }

    #[test]
    fn test_call_again_then_idle() {
        let mut multi = ScriptedMultiplexer::new();
        let mut hooks = Recorder::default();
        register(&mut multi, 1, Script::new().call_again().call_again().succeed());

        assert_eq!(multi.advance(Target::Kick, &mut hooks), Ok(Progress::CallAgain));
        assert_eq!(multi.advance(Target::Kick, &mut hooks), Ok(Progress::CallAgain));
        assert_eq!(
            multi.advance(Target::Kick, &mut hooks),
            Ok(Progress::Idle { running: 0 })
        );
        assert_eq!(multi.advance_calls(), 3);
    }

    #[test]
    fn test_fail_advance_reports_backend_error() {
        let mut multi = ScriptedMultiplexer::new();
        let mut hooks = Recorder::default();
        register(&mut multi, 1, Script::new().fail_advance("multi handle broken").succeed());

        assert_eq!(
            multi.advance(Target::Kick, &mut hooks),
            Err(MultiplexError::Backend("multi handle broken".into()))
        );
        assert_eq!(
            multi.advance(Target::Kick, &mut hooks),
            Ok(Progress::Idle { running: 0 })
        );
    }

    #[test]
    fn test_abort_defers_interest_removal() {
        let mut multi = ScriptedMultiplexer::new();
        let mut hooks = Recorder::default();
        let id = register(
            &mut multi,
            1,
            Script::new().interest(6, Interest::Write).await_socket(6).succeed(),
        );
        multi.advance(Target::Kick, &mut hooks).unwrap();

        multi.abort(id).unwrap();
        let completions = multi.poll_completions();
        assert_eq!(completions[0].outcome, Outcome::Failure(FailureReason::Aborted));

        multi.advance(Target::Kick, &mut hooks).unwrap();
        assert_eq!(hooks.interest, vec![(6, Interest::Write), (6, Interest::None)]);
    }

    #[test]
    fn test_unregister_returns_remaining_script() {
        let mut multi = ScriptedMultiplexer::new();
        let id = register(&mut multi, 1, Script::new().await_timeout().succeed());
        multi.advance(Target::Kick, &mut Recorder::default()).unwrap();

        let detached = multi.unregister(id).unwrap();
        assert_eq!(detached.transfer.remaining(), 2);
        assert_eq!(detached.sink.id(), id);
        assert!(!multi.is_registered(id));
        assert_eq!(multi.unregister(id).err(), Some(MultiplexError::NotRegistered(id)));
    }

    #[test]
    fn test_timer_wait_needs_timer_expiry() {
        let mut multi = ScriptedMultiplexer::new();
        let mut hooks = Recorder::default();
        let id = register(
            &mut multi,
            1,
            Script::new()
                .timeout(Some(Duration::from_millis(500)))
                .await_timeout()
                .succeed(),
        );

        multi.advance(Target::Kick, &mut hooks).unwrap();
        multi.advance(Target::Kick, &mut hooks).unwrap();
        assert!(multi.poll_completions().is_empty());

        multi.advance(Target::Timeout, &mut hooks).unwrap();
        assert_eq!(
            multi.poll_completions(),
            vec![Completion {
                id,
                outcome: Outcome::Success
            }]
        );
    }

    #[test]
    fn test_completion_releases_descriptors() {
        let mut multi = ScriptedMultiplexer::new();
        let mut hooks = Recorder::default();
        register(
            &mut multi,
            1,
            Script::new()
                .interest(4, Interest::Read)
                .interest(5, Interest::Write)
                .await_socket(4)
                .succeed(),
        );
        multi.advance(Target::Kick, &mut hooks).unwrap();

        let ready = Target::Socket {
            fd: 4,
            readiness: Readiness::READABLE,
        };
        multi.advance(ready, &mut hooks).unwrap();
        assert_eq!(
            hooks.interest,
            vec![
                (4, Interest::Read),
                (5, Interest::Write),
                (4, Interest::None),
                (5, Interest::None),
            ]
        );
        assert_eq!(multi.poll_completions().len(), 1);
    }

    #[test]
    fn test_refused_registration() {
        let mut multi = ScriptedMultiplexer::new();
        multi.refuse_registrations("too many handles");
        let id = TransferId::from(1);
        assert_eq!(
            multi.register(id, Script::new(), sink(id)),
            Err(MultiplexError::Backend("too many handles".into()))
        );
        assert!(!multi.is_registered(id));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut multi = ScriptedMultiplexer::new();
        let id = register(&mut multi, 1, Script::new());
        assert_eq!(
            multi.register(id, Script::new(), sink(id)),
            Err(MultiplexError::AlreadyRegistered(id))
        );
    }
}
