use std::io;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::error;

use super::handle::{TransferId, TransferState};
use crate::multiplex::{Descriptor, MultiplexError};

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to register transfer: {0}")]
    Registration(#[source] MultiplexError),

    #[error("advance step failed: {0}")]
    Advance(#[source] MultiplexError),

    #[error("internal consistency violated: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("callback for transfer {id} panicked: {message}")]
    Callback { id: TransferId, message: String },

    #[error("transfer handle is {0}, expected configured")]
    InvalidState(TransferState),

    #[error("unknown transfer {0}")]
    UnknownTransfer(TransferId),

    #[error("reactor refused descriptor {fd}: {source}")]
    Reactor {
        fd: Descriptor,
        #[source]
        source: io::Error,
    },

    #[error("{active} transfer(s) pending but nothing is watched and no timer is armed")]
    Stalled { active: usize },
}

/// The descriptor table or in-flight set diverged from the lower layer.
///
/// These are bugs in the bridge; the engine halts once one is observed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    #[error("interest removed for unknown descriptor {fd}")]
    UnknownDescriptor { fd: Descriptor },

    #[error("completion reported for unregistered transfer {id}")]
    UnknownCompletion { id: TransferId },

    #[error("transfer {id} could not be unregistered: {reason}")]
    Unregister { id: TransferId, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("transfer already started (state: {0})")]
    AlreadyStarted(TransferState),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Host-visible error channel shared by the engine and its write sinks
#[derive(Debug, Clone)]
pub(crate) struct ErrorChannel {
    tx: mpsc::UnboundedSender<EngineError>,
}

impl ErrorChannel {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<EngineError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn report(&self, err: EngineError) {
        error!(error = %err, "transfer engine error");
        // receiver lives as long as the engine
        let _ = self.tx.send(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_delivers_to_receiver() {
        let (channel, mut rx) = ErrorChannel::new();
        channel.report(EngineError::Stalled { active: 2 });

        let received = rx.try_recv().unwrap();
        assert!(matches!(received, EngineError::Stalled { active: 2 }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_consistency_error_display() {
        let err = EngineError::from(ConsistencyError::UnknownDescriptor { fd: 7 });
        assert_eq!(
            err.to_string(),
            "internal consistency violated: interest removed for unknown descriptor 7"
        );
    }
}
