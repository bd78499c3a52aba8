//! Ordered transport from the producer to the store worker.
//!
//! The executor only sees the two traits, so the transport can change
//! without touching message handling.

use crossbeam_channel::{Receiver, Sender};

use crate::error::{Result, StoreError};
use crate::message::Message;

/// Producer side. Messages arrive in the order they were sent.
pub trait MessageSender: Send {
    /// # Errors
    ///
    /// Returns [`StoreError::ChannelClosed`] if the receiver is gone.
    fn send(&self, message: Message) -> Result<()>;
}

/// Consumer side. Blocks while the channel is empty.
pub trait MessageReceiver: Send {
    /// # Errors
    ///
    /// Returns [`StoreError::ChannelClosed`] once every sender is gone and
    /// the queue is drained.
    fn recv(&self) -> Result<Message>;
}

/// Unbounded FIFO sender.
#[derive(Debug, Clone)]
pub struct ChannelSender(Sender<Message>);

/// Unbounded FIFO receiver.
#[derive(Debug)]
pub struct ChannelReceiver(Receiver<Message>);

/// Create a connected sender/receiver pair.
#[must_use]
pub fn channel() -> (ChannelSender, ChannelReceiver) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (ChannelSender(tx), ChannelReceiver(rx))
}

impl ChannelSender {
    /// Messages waiting to be received.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.0.len()
    }
}

impl MessageSender for ChannelSender {
    fn send(&self, message: Message) -> Result<()> {
        self.0.send(message).map_err(|_| StoreError::ChannelClosed)
    }
}

impl MessageReceiver for ChannelReceiver {
    fn recv(&self) -> Result<Message> {
        self.0.recv().map_err(|_| StoreError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    #[test]
    fn test_fifo_order() {
        let (tx, rx) = channel();
        tx.send(Message::DeleteAccount { id: 1 }).unwrap();
        tx.send(Message::DeleteAccount { id: 2 }).unwrap();
        tx.send(Message::Quit).unwrap();
        assert_eq!(tx.pending(), 3);

        for expected in [1, 2] {
            match rx.recv().unwrap() {
                Message::DeleteAccount { id } => assert_eq!(id, expected),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(rx.recv().unwrap().kind(), MessageKind::Quit);
    }

    #[test]
    fn test_closed_when_senders_dropped() {
        let (tx, rx) = channel();
        tx.send(Message::Quit).unwrap();
        drop(tx);
        // Queued messages still drain before the close is reported.
        assert!(rx.recv().is_ok());
        assert!(matches!(rx.recv(), Err(StoreError::ChannelClosed)));
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (tx, rx) = channel();
        drop(rx);
        assert!(matches!(tx.send(Message::Quit), Err(StoreError::ChannelClosed)));
    }
}
