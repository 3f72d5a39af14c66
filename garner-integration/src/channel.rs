use derive_more::{Constructor, Display};
use serde::{Deserialize, Serialize};

/// Transmitter abstraction over different channel kinds.
///
/// Implementations must be cheap to clone - a `Tx` is handed to every component that
/// publishes into the channel.
pub trait Tx
where
    Self: Clone + Send,
{
    type Item;
    type Error;
    fn send(&self, item: Self::Item) -> Result<(), Self::Error>;
}

/// Error returned by a channel transmitter.
///
/// `Full` only occurs on bounded channels; `Closed` means the receiver has been dropped.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display)]
pub enum ChannelError {
    Full,
    Closed,
}

impl std::error::Error for ChannelError {}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ChannelError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ChannelError::Closed
    }
}

/// [`Tx`] backed by an unbounded tokio mpsc channel.
///
/// `send` never applies backpressure and only fails once the receiver has been dropped.
#[derive(Debug)]
pub struct UnboundedTx<T> {
    pub tx: tokio::sync::mpsc::UnboundedSender<T>,
}

impl<T> Clone for UnboundedTx<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Tx for UnboundedTx<T>
where
    T: Send,
{
    type Item = T;
    type Error = ChannelError;

    fn send(&self, item: Self::Item) -> Result<(), Self::Error> {
        self.tx.send(item).map_err(ChannelError::from)
    }
}

/// Receiver half of an unbounded channel constructed via [`mpsc_unbounded`].
#[derive(Debug, Constructor)]
pub struct UnboundedRx<T> {
    pub rx: tokio::sync::mpsc::UnboundedReceiver<T>,
}

impl<T> UnboundedRx<T> {
    /// Receive the next item, suspending until one arrives or all senders are dropped.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Drain any immediately available items without awaiting.
    pub fn drain(&mut self) -> Vec<T> {
        let mut drained = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            drained.push(item);
        }
        drained
    }
}

/// [`Tx`] backed by a bounded tokio mpsc channel.
///
/// `send` never blocks - a full buffer is surfaced as [`ChannelError::Full`] so callers can
/// apply their own backpressure policy.
#[derive(Debug)]
pub struct BoundedTx<T> {
    pub tx: tokio::sync::mpsc::Sender<T>,
}

impl<T> Clone for BoundedTx<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Tx for BoundedTx<T>
where
    T: Send,
{
    type Item = T;
    type Error = ChannelError;

    fn send(&self, item: Self::Item) -> Result<(), Self::Error> {
        self.tx.try_send(item).map_err(|error| match error {
            tokio::sync::mpsc::error::TrySendError::Full(_) => ChannelError::Full,
            tokio::sync::mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })
    }
}

/// Receiver half of a bounded channel constructed via [`mpsc_bounded`].
#[derive(Debug, Constructor)]
pub struct BoundedRx<T> {
    pub rx: tokio::sync::mpsc::Receiver<T>,
}

impl<T> BoundedRx<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

pub fn mpsc_unbounded<T>() -> (UnboundedTx<T>, UnboundedRx<T>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (UnboundedTx { tx }, UnboundedRx::new(rx))
}

pub fn mpsc_bounded<T>(capacity: usize) -> (BoundedTx<T>, BoundedRx<T>) {
    let (tx, rx) = tokio::sync::mpsc::channel(capacity);
    (BoundedTx { tx }, BoundedRx::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_tx_surfaces_full_buffer() {
        let (tx, mut rx) = mpsc_bounded::<u32>(2);
        assert!(tx.send(1).is_ok());
        assert!(tx.send(2).is_ok());
        assert_eq!(tx.send(3), Err(ChannelError::Full));

        assert_eq!(rx.rx.try_recv().ok(), Some(1));
        assert!(tx.send(3).is_ok());
    }

    #[test]
    fn test_bounded_tx_surfaces_closed_channel() {
        let (tx, rx) = mpsc_bounded::<u32>(1);
        drop(rx);
        assert_eq!(tx.send(1), Err(ChannelError::Closed));
    }

    #[test]
    fn test_unbounded_tx_fails_only_when_receiver_dropped() {
        let (tx, rx) = mpsc_unbounded::<u32>();
        for item in 0..100 {
            assert!(tx.send(item).is_ok());
        }

        drop(rx);
        assert_eq!(tx.send(100), Err(ChannelError::Closed));
    }

    #[test]
    fn test_unbounded_rx_drains_queued_items() {
        let (tx, mut rx) = mpsc_unbounded::<u32>();
        tx.send(1).unwrap();
        tx.send(2).unwrap();

        assert_eq!(rx.drain(), vec![1, 2]);
        assert!(rx.drain().is_empty());
    }
}
