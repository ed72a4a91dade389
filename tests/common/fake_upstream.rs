//! Scripted in-process upstream.
//!
//! Each call to `subscribe` consumes the next scripted session. A session is
//! a list of [`Step`]s replayed by the returned stream. Once a session's
//! steps (or all sessions) run out, the stream blocks forever, like an idle
//! upstream.
//!
//! # Example
//! ```rust,ignore
//! let upstream = FakeUpstream::new();
//! upstream.push_session(vec![Step::Batch(put_batch(0, 1, 5)), Step::End]);
//! upstream.push_session(vec![Step::Batch(put_batch(0, 6, 10))]);
//!
//! // ... run relay ...
//!
//! assert_eq!(upstream.subscribe_starts(), vec![Offset::ORIGIN, Offset::new(0, 5)]);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use wal_relay::sink::BoxFuture;
use wal_relay::{BatchStream, Offset, RelayError, Result, UpstreamSource, WalBatch};

/// One scripted stream event.
pub enum Step {
    Batch(WalBatch),
    /// Move the advertised upstream tail.
    Tail(Offset),
    Fail(RelayError),
    /// Clean end of stream.
    End,
    /// Pause until the test notifies.
    Gate(Arc<Notify>),
}

pub struct FakeUpstream {
    sessions: Mutex<VecDeque<Vec<Step>>>,
    subscribe_errors: Mutex<VecDeque<RelayError>>,
    starts: Mutex<Vec<Offset>>,
    tail: Mutex<Option<Offset>>,
    hang_subscribe: AtomicBool,
    subscribes: AtomicUsize,
}

impl Default for FakeUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(VecDeque::new()),
            subscribe_errors: Mutex::new(VecDeque::new()),
            starts: Mutex::new(Vec::new()),
            tail: Mutex::new(None),
            hang_subscribe: AtomicBool::new(false),
            subscribes: AtomicUsize::new(0),
        }
    }

    pub fn push_session(&self, steps: Vec<Step>) {
        self.sessions.lock().unwrap().push_back(steps);
    }

    /// Fail the next subscribe calls, in order, with these errors.
    pub fn fail_subscribes(&self, errors: impl IntoIterator<Item = RelayError>) {
        self.subscribe_errors.lock().unwrap().extend(errors);
    }

    /// Fail the next `n` subscribes with a retryable connection error.
    pub fn refuse_connections(&self, n: usize) {
        self.fail_subscribes((0..n).map(|i| RelayError::connection("fake://upstream", format!("refused #{}", i + 1))));
    }

    /// Tail advertised by streams at subscribe time.
    pub fn set_tail(&self, tail: Offset) {
        *self.tail.lock().unwrap() = Some(tail);
    }

    /// Make every subscribe block until cancelled.
    pub fn hang_subscribes(&self) {
        self.hang_subscribe.store(true, Ordering::SeqCst);
    }

    /// Start offsets of every subscribe call (including failed ones).
    pub fn subscribe_starts(&self) -> Vec<Offset> {
        self.starts.lock().unwrap().clone()
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }
}

impl UpstreamSource for FakeUpstream {
    type Stream = FakeStream;

    fn subscribe<'a>(&'a self, start: Offset, _namespace: &'a str) -> BoxFuture<'a, Result<FakeStream>> {
        Box::pin(async move {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            self.starts.lock().unwrap().push(start);

            if self.hang_subscribe.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let error = self.subscribe_errors.lock().unwrap().pop_front();
            if let Some(e) = error {
                return Err(e);
            }

            let steps = self.sessions.lock().unwrap().pop_front().unwrap_or_default();
            Ok(FakeStream {
                steps: steps.into(),
                tail: *self.tail.lock().unwrap(),
            })
        })
    }

    fn describe(&self) -> String {
        "fake://upstream".to_string()
    }
}

pub struct FakeStream {
    steps: VecDeque<Step>,
    tail: Option<Offset>,
}

impl BatchStream for FakeStream {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<WalBatch>>> {
        Box::pin(async move {
            loop {
                match self.steps.pop_front() {
                    Some(Step::Batch(batch)) => {
                        if self.tail.map_or(true, |t| batch.position() > t) {
                            self.tail = Some(batch.position());
                        }
                        return Ok(Some(batch));
                    }
                    Some(Step::Tail(tail)) => self.tail = Some(tail),
                    Some(Step::Fail(e)) => return Err(e),
                    Some(Step::End) => return Ok(None),
                    Some(Step::Gate(gate)) => gate.notified().await,
                    None => std::future::pending::<()>().await,
                }
            }
        })
    }

    fn upstream_tail(&self) -> Option<Offset> {
        self.tail
    }
}
