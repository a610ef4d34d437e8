//! libcurl multi interface as the lower transfer layer
//!
//! libcurl announces socket interest and timeouts through callbacks fired from
//! inside `curl_multi_*` calls. Those callbacks only queue requests; the queue
//! is replayed to the engine's hooks at the start and end of every
//! [`Multiplexer::advance`], in the order libcurl issued them.

use std::collections::HashMap;
use std::time::Duration;

use curl::easy::{Easy2, Handler, WriteError};
use curl::multi::{Easy2Handle, Events, Multi, Socket, SocketEvents};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{
    Completion, Descriptor, Detached, Interest, MultiplexError, MultiplexHooks, Multiplexer,
    Progress, Target,
};
use crate::config::TransferConfig;
use crate::engine::{ChunkSink, FailureReason, Outcome, TransferId};

/// Easy-handle state: the request URL and the engine's delivery point
#[derive(Debug)]
pub struct CurlTransfer {
    url: String,
    sink: Option<ChunkSink>,
}

impl CurlTransfer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sink: None,
        }
    }

    /// GET request for `url` with the configured limits applied
    pub fn request(url: &str, config: &TransferConfig) -> Result<Easy2<CurlTransfer>, curl::Error> {
        let mut easy = Easy2::new(CurlTransfer::new(url));
        easy.url(url)?;
        easy.useragent(&config.user_agent)?;
        easy.connect_timeout(config.connect_timeout())?;
        easy.timeout(config.request_timeout())?;
        easy.follow_location(config.follow_redirects)?;
        easy.max_redirections(config.max_redirects)?;
        easy.signal(false)?;
        Ok(easy)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Handler for CurlTransfer {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        // accepting fewer bytes than offered makes libcurl fail the transfer
        Ok(match self.sink.as_mut() {
            Some(sink) => sink.deliver(data),
            None => data.len(),
        })
    }
}

/// Callback request queued by libcurl
#[derive(Debug)]
enum Request {
    Socket(Descriptor, Interest),
    Timeout(Option<Duration>),
}

fn interest_of(events: &SocketEvents) -> Interest {
    if events.remove() {
        Interest::None
    } else if events.input_and_output() {
        Interest::ReadWrite
    } else {
        Interest::from_flags(events.input(), events.output())
    }
}

fn backend(err: impl std::fmt::Display) -> MultiplexError {
    MultiplexError::Backend(err.to_string())
}

pub struct CurlMultiplexer {
    multi: Multi,
    requests: mpsc::UnboundedReceiver<Request>,
    handles: HashMap<TransferId, Easy2Handle<CurlTransfer>>,
    /// Aborted transfers, already removed from the multi handle
    detached: HashMap<TransferId, Easy2<CurlTransfer>>,
    completions: Vec<Completion>,
}

impl CurlMultiplexer {
    pub fn new() -> Result<Self, MultiplexError> {
        curl::init();

        let mut multi = Multi::new();
        let (tx, requests) = mpsc::unbounded_channel();

        let socket_tx = tx.clone();
        multi
            .socket_function(move |socket: Socket, events: SocketEvents, _token: usize| {
                let _ = socket_tx.send(Request::Socket(socket, interest_of(&events)));
            })
            .map_err(backend)?;
        multi
            .timer_function(move |timeout: Option<Duration>| {
                let _ = tx.send(Request::Timeout(timeout));
                true
            })
            .map_err(backend)?;

        let version = curl::Version::get();
        debug!(version = version.version(), "libcurl multi handle ready");
        Ok(Self {
            multi,
            requests,
            handles: HashMap::new(),
            detached: HashMap::new(),
            completions: Vec::new(),
        })
    }

    fn replay(&mut self, hooks: &mut dyn MultiplexHooks) {
        while let Ok(request) = self.requests.try_recv() {
            trace!(?request, "Replaying libcurl request");
            match request {
                Request::Socket(fd, interest) => hooks.interest_changed(fd, interest),
                Request::Timeout(timeout) => hooks.timeout_requested(timeout),
            }
        }
    }

    fn collect_messages(&mut self) {
        let completions = &mut self.completions;
        self.multi.messages(|message| {
            let Some(result) = message.result() else {
                return;
            };
            let Ok(token) = message.token() else {
                return;
            };
            let outcome = match result {
                Ok(()) => Outcome::Success,
                Err(err) => Outcome::Failure(FailureReason::Transport(err.to_string())),
            };
            completions.push(Completion {
                id: TransferId::from_token(token),
                outcome,
            });
        });
    }
}

fn into_detached(mut easy: Easy2<CurlTransfer>, id: TransferId) -> Result<Detached<Easy2<CurlTransfer>>, MultiplexError> {
    let sink = easy
        .get_mut()
        .sink
        .take()
        .ok_or_else(|| MultiplexError::Backend(format!("transfer {} lost its sink", id)))?;
    Ok(Detached {
        transfer: easy,
        sink,
    })
}

impl Multiplexer for CurlMultiplexer {
    type Transfer = Easy2<CurlTransfer>;

    fn register(
        &mut self,
        id: TransferId,
        mut transfer: Easy2<CurlTransfer>,
        sink: ChunkSink,
    ) -> Result<(), MultiplexError> {
        if self.handles.contains_key(&id) || self.detached.contains_key(&id) {
            return Err(MultiplexError::AlreadyRegistered(id));
        }

        transfer.get_mut().sink = Some(sink);
        let mut handle = self.multi.add2(transfer).map_err(backend)?;
        if let Err(err) = handle.set_token(id.as_token()) {
            let _ = self.multi.remove2(handle);
            return Err(backend(err));
        }
        self.handles.insert(id, handle);
        Ok(())
    }

    fn unregister(&mut self, id: TransferId) -> Result<Detached<Easy2<CurlTransfer>>, MultiplexError> {
        if let Some(easy) = self.detached.remove(&id) {
            return into_detached(easy, id);
        }
        let handle = self
            .handles
            .remove(&id)
            .ok_or(MultiplexError::NotRegistered(id))?;
        let easy = self.multi.remove2(handle).map_err(backend)?;
        into_detached(easy, id)
    }

    fn advance(
        &mut self,
        target: Target,
        hooks: &mut dyn MultiplexHooks,
    ) -> Result<Progress, MultiplexError> {
        self.replay(hooks);

        let result = match target {
            Target::Socket { fd, readiness } => {
                let mut events = Events::new();
                events.input(readiness.readable).output(readiness.writable);
                self.multi.action(fd, &events)
            }
            Target::Timeout | Target::Kick => self.multi.timeout(),
        };

        self.replay(hooks);
        self.collect_messages();

        match result {
            Ok(running) => Ok(Progress::Idle {
                running: running as usize,
            }),
            Err(err) if err.is_call_perform() => Ok(Progress::CallAgain),
            Err(err) => Err(backend(err)),
        }
    }

    fn poll_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }

    fn abort(&mut self, id: TransferId) -> Result<(), MultiplexError> {
        if self.detached.contains_key(&id) {
            return Ok(());
        }
        let handle = self
            .handles
            .remove(&id)
            .ok_or(MultiplexError::NotRegistered(id))?;
        let easy = self.multi.remove2(handle).map_err(backend)?;
        self.detached.insert(id, easy);
        self.completions.push(Completion {
            id,
            outcome: Outcome::Failure(FailureReason::Aborted),
        });
        Ok(())
    }
}

impl Drop for CurlMultiplexer {
    fn drop(&mut self) {
        // easy handles must leave the multi handle before it is cleaned up
        for (_, handle) in self.handles.drain() {
            let _ = self.multi.remove2(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ErrorChannel;

    #[derive(Default)]
    struct Recorder {
        timeouts: Vec<Option<Duration>>,
    }

    impl MultiplexHooks for Recorder {
        fn interest_changed(&mut self, _fd: Descriptor, _interest: Interest) {}

        fn timeout_requested(&mut self, timeout: Option<Duration>) {
            self.timeouts.push(timeout);
        }
    }

    fn sink(id: TransferId) -> ChunkSink {
        let (errors, _rx) = ErrorChannel::new();
        ChunkSink::new(id, None, errors)
    }

    fn unroutable() -> Easy2<CurlTransfer> {
        // TEST-NET-1, never answered
        CurlTransfer::request("http://192.0.2.1/", &TransferConfig::default()).unwrap()
    }

    #[test]
    fn test_register_requests_timeout() {
        let mut multi = CurlMultiplexer::new().unwrap();
        let id = TransferId::from(1);
        multi.register(id, unroutable(), sink(id)).unwrap();

        let mut hooks = Recorder::default();
        multi.replay(&mut hooks);
        assert!(!hooks.timeouts.is_empty());
        assert_eq!(
            multi.register(id, unroutable(), sink(id)),
            Err(MultiplexError::AlreadyRegistered(id))
        );
    }

    #[test]
    fn test_abort_synthesizes_completion() {
        let mut multi = CurlMultiplexer::new().unwrap();
        let id = TransferId::from(7);
        multi.register(id, unroutable(), sink(id)).unwrap();

        multi.abort(id).unwrap();
        multi.abort(id).unwrap();
        assert_eq!(
            multi.poll_completions(),
            vec![Completion {
                id,
                outcome: Outcome::Failure(FailureReason::Aborted)
            }]
        );

        let detached = multi.unregister(id).unwrap();
        assert_eq!(detached.sink.id(), id);
        assert_eq!(detached.transfer.get_ref().url(), "http://192.0.2.1/");
        assert_eq!(multi.unregister(id).err(), Some(MultiplexError::NotRegistered(id)));
    }

    #[test]
    fn test_unknown_transfer_rejected() {
        let mut multi = CurlMultiplexer::new().unwrap();
        let id = TransferId::from(3);
        assert_eq!(multi.abort(id), Err(MultiplexError::NotRegistered(id)));
    }
}
