//! Single-producer streams with independent, tee-able readers.
//!
//! A [`pipe`] returns one [`StreamWriter`] and one [`StreamReader`]. Further readers are made
//! with [`StreamReader::tee`]; each reader owns a private queue, so a slow reader never delays
//! another one and closing a reader only drops its own queue.
//!
//! ## Lifecycle
//!
//! - `recv` returns `Ok(Some(frame))` until the writer is finished, then `Ok(None)` on every
//!   further call.
//! - A producer failure ([`StreamWriter::fail`]) is delivered once per reader as
//!   `Err(StreamError::Fault)`, followed by end-of-stream.
//! - After `close`, `recv` returns `Err(StreamError::Closed)`. Closing is idempotent and also
//!   happens on drop.
//! - The producer side is released once, when the last reader closes. `send` then fails with
//!   [`SendError::Closed`].
//! - Cancelling the token passed to [`pipe`] ends every reader (`Ok(None)`) and no frame is
//!   handed out after the cancellation is observed.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{SendError, StreamError};

#[derive(Clone)]
enum Item<T> {
    Frame(T),
    Fault(String),
}

struct Slot<T> {
    queue: VecDeque<Item<T>>,
    notify: Arc<Notify>,
}

impl<T> Slot<T> {
    fn with_queue(queue: VecDeque<Item<T>>) -> Self {
        Self {
            queue,
            notify: Arc::new(Notify::new()),
        }
    }

    fn push(&mut self, item: Item<T>) {
        self.queue.push_back(item);
        self.notify.notify_one();
    }
}

struct State<T> {
    readers: HashMap<u64, Slot<T>>,
    next_id: u64,
    finished: bool,
    released: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    cancel: CancellationToken,
    released: Notify,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self) {
        let mut state = self.lock();
        if state.finished {
            return;
        }
        state.finished = true;
        for slot in state.readers.values() {
            slot.notify.notify_one();
        }
    }
}

trait CloseReader: Send + Sync {
    fn close_reader(&self, id: u64);
}

impl<T: Send> CloseReader for Shared<T> {
    fn close_reader(&self, id: u64) {
        let mut state = self.lock();
        let Some(slot) = state.readers.remove(&id) else {
            return;
        };
        slot.notify.notify_one();
        if state.readers.is_empty() && !state.released {
            state.released = true;
            debug!(
                event = "stream.released",
                domain = "stream",
                finished = state.finished
            );
            self.released.notify_one();
        }
    }
}

/// Create a stream bound to `cancel`.
pub fn pipe<T: Send + 'static>(cancel: CancellationToken) -> (StreamWriter<T>, StreamReader<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            readers: HashMap::from([(0, Slot::with_queue(VecDeque::new()))]),
            next_id: 1,
            finished: false,
            released: false,
        }),
        cancel,
        released: Notify::new(),
    });
    let writer = StreamWriter {
        shared: Arc::clone(&shared),
        done: false,
    };
    (writer, StreamReader { shared, id: 0 })
}

/// Producer half of a stream. Dropping it finishes the stream.
pub struct StreamWriter<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    done: bool,
}

impl<T: Clone + Send + 'static> StreamWriter<T> {
    /// Queue `item` for every live reader. Never waits.
    pub fn send(&self, item: T) -> Result<(), SendError> {
        if self.shared.cancel.is_cancelled() {
            return Err(SendError::Cancelled);
        }
        let mut state = self.shared.lock();
        let mut slots: Vec<&mut Slot<T>> = state.readers.values_mut().collect();
        let Some((last, rest)) = slots.split_last_mut() else {
            return Err(SendError::Closed);
        };
        for slot in rest {
            slot.push(Item::Frame(item.clone()));
        }
        last.push(Item::Frame(item));
        Ok(())
    }

    /// Deliver a fault to every live reader and finish the stream.
    pub fn fail(mut self, message: impl Into<String>) {
        let message = message.into();
        {
            let mut state = self.shared.lock();
            for slot in state.readers.values_mut() {
                slot.push(Item::Fault(message.clone()));
            }
        }
        self.shared.finish();
        self.done = true;
    }
}

impl<T: Send + 'static> StreamWriter<T> {
    /// Finish the stream; readers see end-of-stream after their queued frames.
    pub fn finish(mut self) {
        self.shared.finish();
        self.done = true;
    }

    /// True once every reader is gone or the stream was cancelled.
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled() || self.shared.lock().released
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Resolves once the owning invocation is cancelled.
    pub async fn cancelled(&self) {
        self.shared.cancel.cancelled().await
    }

    /// Resolves when every reader is gone or the stream was cancelled.
    pub async fn closed(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            tokio::select! {
                _ = self.shared.released.notified() => {}
                _ = self.shared.cancel.cancelled() => return,
            }
        }
    }
}

impl<T: Send + 'static> Drop for StreamWriter<T> {
    fn drop(&mut self) {
        if !self.done {
            self.shared.finish();
        }
    }
}

impl<T: Send + 'static> fmt::Debug for StreamWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWriter")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Reader half of a stream. Dropping it closes it.
pub struct StreamReader<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    id: u64,
}

impl<T: Send + 'static> StreamReader<T> {
    /// Wait for the next frame.
    ///
    /// `Ok(None)` means end-of-stream (natural exhaustion or cancellation) and is returned
    /// again on every later call.
    pub async fn recv(&mut self) -> Result<Option<T>, StreamError> {
        loop {
            let notify = {
                let mut state = self.shared.lock();
                let finished = state.finished;
                let Some(slot) = state.readers.get_mut(&self.id) else {
                    return Err(StreamError::Closed);
                };
                if self.shared.cancel.is_cancelled() {
                    slot.queue.clear();
                    return Ok(None);
                }
                match slot.queue.pop_front() {
                    Some(Item::Frame(frame)) => return Ok(Some(frame)),
                    Some(Item::Fault(message)) => return Err(StreamError::Fault(message)),
                    None if finished => return Ok(None),
                    None => Arc::clone(&slot.notify),
                }
            };
            tokio::select! {
                _ = notify.notified() => {}
                _ = self.shared.cancel.cancelled() => {}
            }
        }
    }

    /// Close this reader. Other readers are unaffected.
    pub fn close(&self) {
        self.shared.close_reader(self.id);
    }

    pub fn is_closed(&self) -> bool {
        !self.shared.lock().readers.contains_key(&self.id)
    }

    /// Handle that closes this reader from another task, waking a pending `recv`.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            shared: Arc::clone(&self.shared) as Arc<dyn CloseReader>,
            id: self.id,
        }
    }

    /// Drain the remaining frames.
    pub async fn collect(mut self) -> Result<Vec<T>, StreamError> {
        let mut out = Vec::new();
        while let Some(frame) = self.recv().await? {
            out.push(frame);
        }
        Ok(out)
    }

    /// Adapt into a [`futures::Stream`]; ends on end-of-stream or close.
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<T, StreamError>> + Send {
        futures::stream::unfold(self, |mut reader| async move {
            match reader.recv().await {
                Ok(Some(frame)) => Some((Ok(frame), reader)),
                Ok(None) | Err(StreamError::Closed) => None,
                Err(err) => Some((Err(err), reader)),
            }
        })
    }
}

impl<T: Clone + Send + 'static> StreamReader<T> {
    /// New independent reader positioned where this one is: it receives the frames still
    /// queued here and every later frame, in the same order. Teeing a closed reader yields a
    /// closed reader.
    pub fn tee(&self) -> StreamReader<T> {
        let mut state = self.shared.lock();
        let id = state.next_id;
        state.next_id += 1;
        if let Some(queue) = state.readers.get(&self.id).map(|s| s.queue.clone()) {
            state.readers.insert(id, Slot::with_queue(queue));
        }
        StreamReader {
            shared: Arc::clone(&self.shared),
            id,
        }
    }

    /// Split into `n` independent readers; `n == 0` closes this one.
    pub fn tee_n(self, n: usize) -> Vec<StreamReader<T>> {
        if n == 0 {
            return Vec::new();
        }
        let mut readers: Vec<StreamReader<T>> = (1..n).map(|_| self.tee()).collect();
        readers.push(self);
        readers
    }

    /// Finished stream holding a single frame.
    pub fn once(item: T) -> Self {
        std::iter::once(item).collect()
    }
}

impl<T: Clone + Send + 'static> FromIterator<T> for StreamReader<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let (writer, reader) = pipe(CancellationToken::new());
        for item in iter {
            let _ = writer.send(item);
        }
        writer.finish();
        reader
    }
}

impl<T: Send + 'static> Drop for StreamReader<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Send + 'static> fmt::Debug for StreamReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReader")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Closes one reader from anywhere; see [`StreamReader::close_handle`].
#[derive(Clone)]
pub struct CloseHandle {
    shared: Arc<dyn CloseReader>,
    id: u64,
}

impl CloseHandle {
    pub fn close(&self) {
        self.shared.close_reader(self.id);
    }
}

impl fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseHandle").field("id", &self.id).finish()
    }
}
