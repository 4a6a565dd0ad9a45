//! Port trait for the notification trigger.
//!
//! Delivery mechanics (email, SMS, websocket broadcast) live behind
//! this port. The contract is fire-and-forget, at-least-once: the
//! coordinator and synchronizer may both fire for the same transition,
//! and downstream effects must be idempotent. Failures are logged by
//! the implementation, never propagated.

use async_trait::async_trait;
use tracing::info;

use crate::models::{Transaction, UserRef};

/// What happened, from the notified user's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// The user's outgoing payment confirmed on-chain.
    PaymentSent,
    /// The user received a payment.
    PaymentReceived,
    /// Someone asked the user to pay.
    PaymentRequested,
    /// A request the user made was fulfilled.
    RequestFulfilled,
    /// A request the user made was declined.
    RequestDeclined,
    /// A request expired before fulfillment.
    RequestExpired,
}

/// A notification to be delivered to one user.
#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: NotificationKind,
    pub transaction: Transaction,
    pub user: UserRef,
}

/// Port trait for notification delivery.
#[async_trait]
pub trait NotificationTrigger: Send + Sync {
    /// Deliver (or enqueue) one notification. Infallible by contract:
    /// implementations swallow and log their own failures.
    async fn notify(&self, notification: Notification);
}

/// Notifier that records transitions in the log only.
///
/// Stands in when no delivery channel is configured, the same way the
/// original deployment degrades when mail settings are absent.
pub struct LogNotifier;

#[async_trait]
impl NotificationTrigger for LogNotifier {
    async fn notify(&self, notification: Notification) {
        info!(
            kind = ?notification.kind,
            user = %notification.user.handle,
            reference = %notification.transaction.reference,
            amount = %notification.transaction.amount,
            "📣 Notification"
        );
    }
}
