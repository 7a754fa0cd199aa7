use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};
use ulid::Ulid;

const CHANNEL_CAPACITY: usize = 256;
const FEED_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Every invitee connected; organizer can pick a time.
    ReadyToSchedule,
    ParticipantReminder,
    /// Deadline passed without auto-select; organizer must choose.
    DeadlineReached,
    /// Deadline passed and a time was adopted automatically.
    AutoScheduled,
    RescheduleProposed,
    RescheduleObjection,
    RescheduleConfirmed,
}

impl NotificationKind {
    pub fn label(self) -> &'static str {
        match self {
            NotificationKind::ReadyToSchedule => "ready_to_schedule",
            NotificationKind::ParticipantReminder => "participant_reminder",
            NotificationKind::DeadlineReached => "deadline_reached",
            NotificationKind::AutoScheduled => "auto_scheduled",
            NotificationKind::RescheduleProposed => "reschedule_proposed",
            NotificationKind::RescheduleObjection => "reschedule_objection",
            NotificationKind::RescheduleConfirmed => "reschedule_confirmed",
        }
    }
}

/// A notification obligation: who gets which template, with what parameters.
/// Delivery belongs to a `NotificationSender`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: String,
    pub kind: NotificationKind,
    pub booking_id: Ulid,
    pub params: BTreeMap<String, String>,
}

impl Notification {
    pub fn new(recipient: impl Into<String>, kind: NotificationKind, booking_id: Ulid) -> Self {
        Self {
            recipient: recipient.into(),
            kind,
            booking_id,
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }
}

/// Broadcast hub for notification obligations: one feed of everything plus
/// optional per-booking channels.
pub struct NotifyHub {
    feed: broadcast::Sender<Notification>,
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            feed: broadcast::channel(FEED_CAPACITY).0,
            channels: DashMap::new(),
        }
    }

    /// Subscribe to every notification.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.feed.subscribe()
    }

    /// Subscribe to notifications for one booking. Creates the channel if needed.
    pub fn subscribe(&self, booking_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(booking_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish. No-op for channels nobody listens on.
    pub fn send(&self, notification: &Notification) {
        metrics::counter!(
            crate::observability::NOTIFICATIONS_EMITTED_TOTAL,
            "kind" => notification.kind.label()
        )
        .increment(1);
        let _ = self.feed.send(notification.clone());
        if let Some(sender) = self.channels.get(&notification.booking_id) {
            let _ = sender.send(notification.clone());
        }
    }

    /// Remove a booking's channel (e.g. when the booking is removed).
    pub fn remove(&self, booking_id: &Ulid) {
        self.channels.remove(booking_id);
    }
}

// ── Delivery ─────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery to {recipient} failed: {reason}")]
    Delivery { recipient: String, reason: String },
}

/// Outbound delivery collaborator (email, chat, ...).
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Sender that only logs. Used when no delivery backend is configured.
pub struct LogSender;

#[async_trait]
impl NotificationSender for LogSender {
    async fn send(&self, n: &Notification) -> Result<(), NotifyError> {
        info!(
            recipient = %n.recipient,
            kind = n.kind.label(),
            booking = %n.booking_id,
            "notification"
        );
        Ok(())
    }
}

/// Drain `rx` into `sender` until the hub is dropped. Delivery failures are
/// logged and counted; they never reach the state machine.
pub async fn run_dispatcher(
    mut rx: broadcast::Receiver<Notification>,
    sender: Arc<dyn NotificationSender>,
) {
    loop {
        match rx.recv().await {
            Ok(notification) => {
                if let Err(e) = sender.send(&notification).await {
                    warn!("notification {} failed: {e}", notification.kind.label());
                    metrics::counter!(
                        crate::observability::NOTIFICATION_FAILURES_TOTAL,
                        "kind" => notification.kind.label()
                    )
                    .increment(1);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("notification dispatcher lagged, {skipped} dropped");
                metrics::counter!(crate::observability::NOTIFICATIONS_DROPPED_TOTAL)
                    .increment(skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
