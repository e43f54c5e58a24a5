//! Prewarming.
//!
//! A prewarm subscribes to a query ahead of use, so that a later real
//! subscription finds its result already cached. The client holds the
//! prewarm's subscription for the configured TTL and then lets go; if
//! nothing else subscribed by then, the query is torn down.

use crate::client::{Client, SubscriptionHandle};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tidal_core::{FunctionRef, QueryToken, Result, Value};
use tracing::debug;

/// A prewarmed query.
///
/// The client releases the subscription once the TTL elapses. Dropping this
/// value does not release it early; [`Prewarm::cancel`] does.
pub struct Prewarm {
    token: QueryToken,
    ttl: Duration,
    subscription: Rc<RefCell<Option<SubscriptionHandle>>>,
}

impl Client {
    /// Subscribes to a query for the configured prewarm TTL.
    ///
    /// The TTL runs as a Tokio timer among the client's background tasks,
    /// so it must be called inside a Tokio runtime with the time driver
    /// enabled, and expiry happens while the client is driven.
    pub fn prewarm(&self, function: impl Into<FunctionRef>, args: Value) -> Result<Prewarm> {
        let subscription = self.subscribe(function, args)?;
        let token = subscription.token().clone();
        let ttl = self.config().prewarm_ttl;
        debug!(token = %token, ttl_ms = ttl.as_millis() as u64, "prewarming");

        let slot = Rc::new(RefCell::new(Some(subscription)));
        let held = slot.clone();
        let timer = tokio::time::sleep(ttl);
        self.inner.spawn_timer(async move {
            timer.await;
            let expired = held.borrow_mut().take();
            if let Some(subscription) = expired {
                debug!(token = %subscription.token(), "prewarm expired");
            }
        });

        Ok(Prewarm {
            token,
            ttl,
            subscription: slot,
        })
    }
}

impl Prewarm {
    #[inline]
    pub fn token(&self) -> &QueryToken {
        &self.token
    }

    #[inline]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns true until the TTL elapses or the prewarm is cancelled.
    pub fn is_active(&self) -> bool {
        self.subscription.borrow().is_some()
    }

    /// Releases the subscription now.
    pub fn cancel(self) {
        let subscription = self.subscription.borrow_mut().take();
        drop(subscription);
    }
}
