//! Event bus — per-task, sequence-numbered, replayable event stream.
//!
//! Replaces [`crate::server::event_queue::EventQueue`]'s plain broadcast
//! wrapper with a ring buffer sitting in front of the broadcast channel, so a
//! subscriber that reattaches after a dropped connection can resume from the
//! sequence number it last saw instead of losing everything published while
//! it was away.
//!
//! Each task owns exactly one [`TaskChannel`]: a monotonically increasing
//! sequence counter, a bounded ring of the most recent records, and a
//! `tokio::sync::broadcast` sender for live fan-out. `publish` and
//! `subscribe` for a given task both take that task's lock, so the replay
//! snapshot handed to a new subscriber and the point at which it starts
//! receiving live events never overlap or gap.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tracing::{debug, warn};

use crate::error::{A2AError, A2AResult};
use crate::types::{EventPayload, EventRecord};

/// Default number of records retained per task for replay.
const DEFAULT_REPLAY_CAPACITY: usize = 256;

/// Default broadcast channel capacity (live subscriber lag budget).
const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

struct TaskChannel {
    tx: broadcast::Sender<EventRecord>,
    ring: VecDeque<EventRecord>,
    next_seq: u64,
    finalized: bool,
}

impl TaskChannel {
    fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self {
            tx,
            ring: VecDeque::new(),
            next_seq: 0,
            finalized: false,
        }
    }
}

/// Seq-numbered, bounded, replayable event bus keyed by task id.
///
/// One `EventBus` instance is shared across the whole server; it multiplexes
/// every task's event stream behind a single `HashMap` lookup.
#[derive(Clone)]
pub struct EventBus {
    replay_capacity: usize,
    channels: Arc<Mutex<HashMap<String, Arc<Mutex<TaskChannel>>>>>,
}

impl EventBus {
    /// Create a new event bus retaining `replay_capacity` records per task.
    pub fn new(replay_capacity: usize) -> Self {
        assert!(replay_capacity > 0, "replay_capacity must be greater than 0");
        Self {
            replay_capacity,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a new event bus with the default replay capacity (256).
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }

    async fn channel_for(&self, task_id: &str) -> Arc<Mutex<TaskChannel>> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TaskChannel::new())))
            .clone()
    }

    /// Publish a new event for `task_id`, assigning it the next sequence
    /// number.
    ///
    /// Returns `Err(A2AError::TaskTerminal)` if the task has already
    /// published a final event — once a task's stream ends, it stays ended.
    pub async fn publish(
        &self,
        task_id: &str,
        payload: EventPayload,
        is_final: bool,
    ) -> A2AResult<EventRecord> {
        let channel = self.channel_for(task_id).await;
        let mut ch = channel.lock().await;

        if ch.finalized {
            return Err(A2AError::task_terminal(format!(
                "task {task_id} has already emitted a final event"
            )));
        }

        let seq = ch.next_seq;
        ch.next_seq += 1;

        let record = EventRecord {
            task_id: task_id.to_string(),
            seq,
            payload,
            r#final: is_final,
        };

        ch.ring.push_back(record.clone());
        while ch.ring.len() > self.replay_capacity {
            ch.ring.pop_front();
        }
        if is_final {
            ch.finalized = true;
        }

        match ch.tx.send(record.clone()) {
            Ok(n) => debug!(task_id, seq, subscribers = n, "published event"),
            Err(_) => debug!(task_id, seq, "published event (no live subscribers)"),
        }

        Ok(record)
    }

    /// Subscribe to `task_id`'s event stream starting at `from_seq`
    /// (inclusive).
    ///
    /// The returned stream first yields any retained records with
    /// `seq >= from_seq`, then continues with live events as they are
    /// published. If the task has already finalized and the replay already
    /// includes the final record, the stream ends after replay with no live
    /// tail.
    ///
    /// `from_seq` may reference records that have aged out of the retained
    /// window (older than `replay_capacity` records back); the stream simply
    /// starts from the oldest record still retained in that case.
    pub async fn subscribe(&self, task_id: &str, from_seq: u64) -> EventStream {
        let channel = self.channel_for(task_id).await;
        let ch = channel.lock().await;

        let replay: VecDeque<EventRecord> = ch
            .ring
            .iter()
            .filter(|e| e.seq >= from_seq)
            .cloned()
            .collect();
        let replay_has_final = replay.back().map(|e| e.r#final).unwrap_or(false);

        let live = if ch.finalized && replay_has_final {
            None
        } else {
            Some(BroadcastStream::new(ch.tx.subscribe()))
        };

        EventStream { replay, live }
    }

    /// Return a point-in-time copy of the records currently retained for
    /// `task_id`, without subscribing to live events.
    pub async fn snapshot(&self, task_id: &str) -> Vec<EventRecord> {
        let channel = self.channel_for(task_id).await;
        let ch = channel.lock().await;
        ch.ring.iter().cloned().collect()
    }

    /// Whether `task_id` has already published its final event.
    pub async fn is_finalized(&self, task_id: &str) -> bool {
        let channel = self.channel_for(task_id).await;
        let ch = channel.lock().await;
        ch.finalized
    }

    /// The seq number the *next* published event for `task_id` will be
    /// assigned (equivalently, one past the last published seq, or `0` if
    /// nothing has been published yet).
    ///
    /// Callers that already know about everything published so far and only
    /// want to observe what happens *next* — e.g. a caller re-entering
    /// `drive_to_stopping_point` after a workflow resume, which must not
    /// re-replay the `input-required` record that caused it to stop waiting
    /// the first time — should `subscribe` from this value rather than from
    /// `0`.
    pub async fn current_seq(&self, task_id: &str) -> u64 {
        let channel = self.channel_for(task_id).await;
        let ch = channel.lock().await;
        ch.next_seq
    }

    /// Drop a task's channel and retained records.
    ///
    /// Safe to call on a task with live subscribers; existing `EventStream`s
    /// keep their own clone of the broadcast receiver and simply stop
    /// receiving further events once the sender side is dropped here.
    pub async fn remove(&self, task_id: &str) {
        let mut channels = self.channels.lock().await;
        channels.remove(task_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Stream of [`EventRecord`]s produced by [`EventBus::subscribe`]: retained
/// records first, then live events.
pub struct EventStream {
    replay: VecDeque<EventRecord>,
    live: Option<BroadcastStream<EventRecord>>,
}

impl Stream for EventStream {
    type Item = EventRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(record) = self.replay.pop_front() {
            return Poll::Ready(Some(record));
        }

        match &mut self.live {
            None => Poll::Ready(None),
            Some(live) => loop {
                match Pin::new(&mut *live).poll_next(cx) {
                    Poll::Ready(Some(Ok(record))) => return Poll::Ready(Some(record)),
                    Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(n)))) => {
                        warn!(missed = n, "event stream subscriber lagged");
                        continue;
                    }
                    Poll::Ready(None) => return Poll::Ready(None),
                    Poll::Pending => return Poll::Pending,
                }
            },
        }
    }
}
