//! Downstream subscription handle
//!
//! A [`Subscription`] is one consumer's registered interest in a single
//! [`SubscriptionKey`]. It is a live [`Stream`] of typed payloads that starts
//! at the moment it was opened and never ends on its own while the
//! multiplexer runs. Per-handle errors (an upstream rejection of this key, or
//! a gap after the handle fell behind) arrive in-band as `Err` items.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

use perpdash_core::{ChannelPayload, DashboardResult, SubscriptionKey, UpstreamMessage};

use super::subscription::{ConsumerId, Delivery, SubscriptionManager};

/// Handle for one downstream consumer.
///
/// Closing it (explicitly or by dropping it) unregisters the consumer. Once
/// [`close`](Subscription::close) returns nothing more is yielded, including
/// messages that were already queued.
pub struct Subscription<T = UpstreamMessage> {
    key: SubscriptionKey,
    id: ConsumerId,
    rx: Option<mpsc::Receiver<Delivery>>,
    manager: Arc<SubscriptionManager>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(
        key: SubscriptionKey,
        id: ConsumerId,
        rx: mpsc::Receiver<Delivery>,
        manager: Arc<SubscriptionManager>,
    ) -> Self {
        Self {
            key,
            id,
            rx: Some(rx),
            manager,
            _payload: PhantomData,
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_none()
    }

    /// Stop delivery and unregister. Calling it again is a no-op.
    pub fn close(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            drop(rx);
            self.manager.unregister(&self.key, self.id);
        }
    }
}

impl<T: ChannelPayload> Subscription<T> {
    /// Wait for the next payload. `None` once closed or after the
    /// multiplexer shut down.
    pub async fn recv(&mut self) -> Option<DashboardResult<T>> {
        self.next().await
    }

    /// Next payload if one is already queued
    pub fn try_recv(&mut self) -> Option<DashboardResult<T>> {
        let rx = self.rx.as_mut()?;
        while let Ok(delivery) = rx.try_recv() {
            if let Some(item) = extract(delivery) {
                return Some(item);
            }
        }
        None
    }
}

fn extract<T: ChannelPayload>(delivery: Delivery) -> Option<DashboardResult<T>> {
    match delivery {
        Delivery::Message(message) => T::from_message(&message).map(Ok),
        Delivery::Error(error) => Some(Err(error)),
    }
}

impl<T: ChannelPayload> Stream for Subscription<T> {
    type Item = DashboardResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(None);
        };

        loop {
            match ready!(rx.poll_recv(cx)) {
                Some(delivery) => {
                    if let Some(item) = extract(delivery) {
                        return Poll::Ready(Some(item));
                    }
                }
                None => return Poll::Ready(None),
            }
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
