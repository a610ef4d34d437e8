//! Transfer handles and the write-callback boundary

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use tracing::{error, trace};

use super::error::{EngineError, ErrorChannel, HandleError};

/// Streaming data callback: returns the number of bytes accepted.
///
/// Accepting fewer bytes than offered asks the lower layer to abort the transfer.
pub type WriteCallback = Box<dyn FnMut(TransferId, &[u8]) -> usize>;

/// Terminal callback, invoked once with the handle handed back to the caller.
pub type CompletionCallback<T> = Box<dyn FnOnce(TransferHandle<T>, Outcome)>;

/// Engine-assigned identifier of one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

impl TransferId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Lower layers that carry an opaque `usize` token use this pair.
    pub fn as_token(&self) -> usize {
        self.0 as usize
    }

    pub fn from_token(token: usize) -> Self {
        Self(token as u64)
    }
}

impl From<u64> for TransferId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Configured,
    Submitted,
    Completed,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferState::Configured => "configured",
            TransferState::Submitted => "submitted",
            TransferState::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Terminal result of one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(FailureReason),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Lower layer reported the transfer as failed
    Transport(String),
    /// Cancelled through [`TransferEngine::abort`](super::TransferEngine::abort)
    Aborted,
    /// The write callback panicked and the transfer was torn down
    Callback(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Transport(reason) => write!(f, "transport error: {}", reason),
            FailureReason::Aborted => f.write_str("aborted"),
            FailureReason::Callback(reason) => write!(f, "callback panicked: {}", reason),
        }
    }
}

/// One configured transfer plus its callbacks.
///
/// Owned by the caller until submitted; submission moves it into the engine,
/// which hands it back through the completion callback.
pub struct TransferHandle<T> {
    transfer: T,
    on_data: Option<WriteCallback>,
    on_complete: Option<CompletionCallback<T>>,
    state: TransferState,
    id: Option<TransferId>,
}

impl<T> TransferHandle<T> {
    pub fn new(transfer: T) -> Self {
        Self {
            transfer,
            on_data: None,
            on_complete: None,
            state: TransferState::Configured,
            id: None,
        }
    }

    /// Set or replace the streaming data callback
    pub fn set_write_callback<F>(&mut self, callback: F) -> Result<(), HandleError>
    where
        F: FnMut(TransferId, &[u8]) -> usize + 'static,
    {
        self.ensure_configured()?;
        self.on_data = Some(Box::new(callback));
        Ok(())
    }

    /// Set or replace the terminal callback
    pub fn set_completion_callback<F>(&mut self, callback: F) -> Result<(), HandleError>
    where
        F: FnOnce(TransferHandle<T>, Outcome) + 'static,
    {
        self.ensure_configured()?;
        self.on_complete = Some(Box::new(callback));
        Ok(())
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Id of the submission this handle went through, if any
    pub fn id(&self) -> Option<TransferId> {
        self.id
    }

    pub fn transfer(&self) -> &T {
        &self.transfer
    }

    pub fn transfer_mut(&mut self) -> &mut T {
        &mut self.transfer
    }

    pub fn into_transfer(self) -> T {
        self.transfer
    }

    fn ensure_configured(&self) -> Result<(), HandleError> {
        match self.state {
            TransferState::Configured => Ok(()),
            other => Err(HandleError::AlreadyStarted(other)),
        }
    }

    pub(crate) fn into_parts(self) -> (T, Option<WriteCallback>, Option<CompletionCallback<T>>) {
        (self.transfer, self.on_data, self.on_complete)
    }

    pub(crate) fn completed(transfer: T, on_data: Option<WriteCallback>, id: TransferId) -> Self {
        Self {
            transfer,
            on_data,
            on_complete: None,
            state: TransferState::Completed,
            id: Some(id),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for TransferHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferHandle")
            .field("transfer", &self.transfer)
            .field("state", &self.state)
            .field("id", &self.id)
            .field("has_write_callback", &self.on_data.is_some())
            .field("has_completion_callback", &self.on_complete.is_some())
            .finish()
    }
}

/// Delivery point the lower layer writes received data into.
///
/// Panics raised by the caller's write callback stop here: they are reported
/// on the engine's error channel and turned into "zero bytes accepted", which
/// the lower layer treats as an abort request.
pub struct ChunkSink {
    id: TransferId,
    callback: Option<WriteCallback>,
    errors: ErrorChannel,
    fault: Option<String>,
    delivered: u64,
}

impl ChunkSink {
    pub(crate) fn new(id: TransferId, callback: Option<WriteCallback>, errors: ErrorChannel) -> Self {
        Self {
            id,
            callback,
            errors,
            fault: None,
            delivered: 0,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Forward one chunk, returning how many bytes the caller accepted
    pub fn deliver(&mut self, chunk: &[u8]) -> usize {
        if self.fault.is_some() {
            return 0;
        }

        let id = self.id;
        let Some(callback) = self.callback.as_mut() else {
            trace!(transfer = %id, len = chunk.len(), "Discarding chunk, no write callback");
            self.delivered += chunk.len() as u64;
            return chunk.len();
        };

        match panic::catch_unwind(AssertUnwindSafe(|| callback(id, chunk))) {
            Ok(accepted) => {
                let accepted = accepted.min(chunk.len());
                self.delivered += accepted as u64;
                accepted
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(transfer = %id, %message, "Write callback panicked, aborting transfer");
                self.errors.report(EngineError::Callback {
                    id,
                    message: message.clone(),
                });
                self.fault = Some(message);
                0
            }
        }
    }

    /// Panic message if the write callback panicked
    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    /// Total bytes accepted so far
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub(crate) fn into_callback(self) -> Option<WriteCallback> {
        self.callback
    }
}

impl fmt::Debug for ChunkSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkSink")
            .field("id", &self.id)
            .field("fault", &self.fault)
            .field("delivered", &self.delivered)
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn sink_with(callback: Option<WriteCallback>) -> (ChunkSink, tokio::sync::mpsc::UnboundedReceiver<EngineError>) {
        let (errors, rx) = ErrorChannel::new();
        (ChunkSink::new(TransferId::from(1), callback, errors), rx)
    }

    #[test]
    fn test_new_handle_is_configured() {
        let handle = TransferHandle::new("job");
        assert_eq!(handle.state(), TransferState::Configured);
        assert_eq!(handle.id(), None);
        assert_eq!(*handle.transfer(), "job");
    }

    #[test]
    fn test_callbacks_replaceable_before_start() {
        let mut handle = TransferHandle::new(());
        handle.set_write_callback(|_, chunk| chunk.len()).unwrap();
        handle.set_write_callback(|_, _| 0).unwrap();
        handle.set_completion_callback(|_, _| {}).unwrap();
    }

    #[test]
    fn test_completed_handle_rejects_callbacks() {
        let mut handle = TransferHandle::completed((), None, TransferId::from(4));
        assert_eq!(handle.state(), TransferState::Completed);
        assert_eq!(handle.id(), Some(TransferId::from(4)));

        let err = handle.set_write_callback(|_, chunk| chunk.len()).unwrap_err();
        assert_eq!(err, HandleError::AlreadyStarted(TransferState::Completed));
        assert!(handle.set_completion_callback(|_, _| {}).is_err());
    }

    #[test]
    fn test_sink_without_callback_accepts_everything() {
        let (mut sink, _rx) = sink_with(None);
        assert_eq!(sink.deliver(b"hello"), 5);
        assert_eq!(sink.delivered(), 5);
    }

    #[test]
    fn test_sink_forwards_in_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_cb = Rc::clone(&seen);
        let (mut sink, _rx) = sink_with(Some(Box::new(move |id: TransferId, chunk: &[u8]| {
            assert_eq!(id, TransferId::from(1));
            seen_cb.borrow_mut().extend_from_slice(chunk);
            chunk.len()
        })));

        sink.deliver(b"abc");
        sink.deliver(b"def");
        assert_eq!(seen.borrow().as_slice(), b"abcdef");
        assert_eq!(sink.delivered(), 6);
    }

    #[test]
    fn test_sink_caps_overreported_acceptance() {
        let (mut sink, _rx) = sink_with(Some(Box::new(|_: TransferId, _: &[u8]| 1000)));
        assert_eq!(sink.deliver(b"abc"), 3);
    }

    #[test]
    fn test_sink_catches_panic() {
        let (mut sink, mut rx) = sink_with(Some(Box::new(|_: TransferId, _: &[u8]| -> usize {
            panic!("boom")
        })));

        assert_eq!(sink.deliver(b"abc"), 0);
        assert_eq!(sink.fault(), Some("boom"));

        let reported = rx.try_recv().unwrap();
        assert!(matches!(reported, EngineError::Callback { ref message, .. } if message == "boom"));

        // faulted sinks refuse further data without re-entering the callback
        assert_eq!(sink.deliver(b"more"), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_panic_message_variants() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
