//! Delivery of query results and acknowledgements back to the requester.
//!
//! A reply crosses from whichever thread executed the command to the
//! requesting side through a [`ReplyTarget`]. The [`ReplyAddress`] pairs a
//! target with the caller's tag so the association survives the hop.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::debug;

use crate::model::TweetRow;

/// Caller-chosen value identifying what a reply answers.
pub type ReplyTag = u64;

/// Result of one batch, delivered when the batch carried an ack address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Inner messages that executed without error.
    pub executed: usize,
    /// Inner messages whose statement failed or was abandoned.
    pub failed: usize,
    /// Description of the first failure, if any.
    pub first_error: Option<String>,
}

impl BatchOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub(crate) fn record_failure(&mut self, error: impl fmt::Display) {
        self.failed += 1;
        if self.first_error.is_none() {
            self.first_error = Some(error.to_string());
        }
    }
}

/// Payload sent back to a requester. Ownership moves to the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Rows found for a tweet select, in no particular order.
    Tweets(Vec<TweetRow>),
    /// Row id assigned to a newly inserted account.
    AccountInserted { name: String, id: i64 },
    /// Acknowledgement for a batch.
    BatchAck(BatchOutcome),
}

/// Something that can receive replies from any thread.
pub trait ReplyTarget: Send + Sync {
    fn deliver(&self, tag: ReplyTag, reply: Reply);
}

/// Where a reply goes: a target plus the requester's tag.
#[derive(Clone)]
pub struct ReplyAddress {
    target: Arc<dyn ReplyTarget>,
    tag: ReplyTag,
}

impl ReplyAddress {
    pub fn new(target: Arc<dyn ReplyTarget>, tag: ReplyTag) -> Self {
        Self { target, tag }
    }

    #[must_use]
    pub const fn tag(&self) -> ReplyTag {
        self.tag
    }

    /// Hand `reply` to the target.
    pub fn send(&self, reply: Reply) {
        self.target.deliver(self.tag, reply);
    }
}

impl fmt::Debug for ReplyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyAddress").field("tag", &self.tag).finish_non_exhaustive()
    }
}

/// A reply together with the tag it was addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: ReplyTag,
    pub reply: Reply,
}

/// Event queue target: replies are posted from any thread and drained by
/// the thread that owns the matching [`ReplyInbox`].
pub struct ReplyQueue {
    tx: Sender<Delivery>,
}

impl ReplyQueue {
    /// Create a queue and the inbox that drains it.
    #[must_use]
    pub fn new() -> (Arc<Self>, ReplyInbox) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Arc::new(Self { tx }), ReplyInbox { rx })
    }

    /// Address on this queue for `tag`.
    #[must_use]
    pub fn address(self: &Arc<Self>, tag: ReplyTag) -> ReplyAddress {
        ReplyAddress::new(Arc::clone(self) as Arc<dyn ReplyTarget>, tag)
    }
}

impl ReplyTarget for ReplyQueue {
    fn deliver(&self, tag: ReplyTag, reply: Reply) {
        if self.tx.send(Delivery { tag, reply }).is_err() {
            debug!(tag, "reply inbox dropped; discarding reply");
        }
    }
}

/// Receiving side of a [`ReplyQueue`].
pub struct ReplyInbox {
    rx: Receiver<Delivery>,
}

impl ReplyInbox {
    /// Next delivery, if one is already waiting.
    #[must_use]
    pub fn try_recv(&self) -> Option<Delivery> {
        match self.rx.try_recv() {
            Ok(delivery) => Some(delivery),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for the next delivery.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Delivery> {
        match self.rx.recv_timeout(timeout) {
            Ok(delivery) => Some(delivery),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Everything currently queued.
    #[must_use]
    pub fn drain(&self) -> Vec<Delivery> {
        self.rx.try_iter().collect()
    }
}
