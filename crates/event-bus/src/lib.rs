//! Minimal typed event bus.
//!
//! The coordinators publish closed event enums (one per component) rather
//! than stringly-named events; each subscriber observes events for a given
//! kind in publication order. This is deliberately not a generic pub/sub
//! framework; it wraps a tokio broadcast channel and nothing more.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

/// Payload types that can be carried on the bus.
pub trait Event: Clone + Send + Sync + std::fmt::Debug + 'static {}

impl<T> Event for T where T: Clone + Send + Sync + std::fmt::Debug + 'static {}

/// In-memory broadcast bus. Publishing never blocks; a send with no
/// subscribers is a no-op.
pub struct Bus<E>
where
    E: Event,
{
    sender: broadcast::Sender<E>,
}

impl<E> Bus<E>
where
    E: Event,
{
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self { sender })
    }

    pub fn publish(&self, event: E) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Materialise an mpsc receiver from a bus subscription so callers can await
/// events without handling broadcast lag semantics directly.
pub fn to_mpsc<E>(bus: Arc<Bus<E>>, capacity: usize) -> mpsc::Receiver<E>
where
    E: Event,
{
    let mut rx = bus.subscribe();
    let (tx, out_rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    if tx.send(ev).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    out_rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    enum Probe {
        A(u32),
        B,
    }

    #[tokio::test]
    async fn delivers_in_publication_order() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(Probe::A(1));
        bus.publish(Probe::B);
        bus.publish(Probe::A(2));
        assert_eq!(rx.recv().await.expect("first"), Probe::A(1));
        assert_eq!(rx.recv().await.expect("second"), Probe::B);
        assert_eq!(rx.recv().await.expect("third"), Probe::A(2));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let bus: Arc<Bus<Probe>> = Bus::new(4);
        bus.publish(Probe::B);
        let mut rx = bus.subscribe();
        bus.publish(Probe::A(7));
        assert_eq!(rx.recv().await.expect("only event"), Probe::A(7));
    }

    #[tokio::test]
    async fn mpsc_adapter_forwards() {
        let bus = Bus::new(8);
        let mut rx = to_mpsc(Arc::clone(&bus), 8);
        bus.publish(Probe::A(9));
        assert_eq!(rx.recv().await.expect("forwarded"), Probe::A(9));
    }
}
