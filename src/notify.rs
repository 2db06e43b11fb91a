use std::collections::VecDeque;

use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::MAX_INBOX_LEN;
use crate::model::{Ms, Span, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    NewRequest,
    RequestApproved,
    RequestRejected,
    ItemAvailable,
    PickupProposed,
    PickupApproved,
    PickupConfirmed,
    PickupExpired,
    ReturnProposed,
    ReturnApproved,
    ReturnConfirmed,
    ReturnMissing,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::NewRequest => "new_request",
            NotificationKind::RequestApproved => "request_approved",
            NotificationKind::RequestRejected => "request_rejected",
            NotificationKind::ItemAvailable => "item_available",
            NotificationKind::PickupProposed => "pickup_proposed",
            NotificationKind::PickupApproved => "pickup_approved",
            NotificationKind::PickupConfirmed => "pickup_confirmed",
            NotificationKind::PickupExpired => "pickup_expired",
            NotificationKind::ReturnProposed => "return_proposed",
            NotificationKind::ReturnApproved => "return_approved",
            NotificationKind::ReturnConfirmed => "return_confirmed",
            NotificationKind::ReturnMissing => "return_missing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: Ulid,
    pub recipient_id: UserId,
    pub kind: NotificationKind,
    pub item_id: Ulid,
    pub claim_id: Option<Ulid>,
    pub window: Option<Span>,
    pub created_at: Ms,
}

/// Bounded per-recipient inboxes. Delivery cannot fail a committed transition.
pub struct NotifyHub {
    inboxes: DashMap<UserId, VecDeque<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            inboxes: DashMap::new(),
        }
    }

    pub fn deliver(&self, notification: Notification) {
        let mut inbox = self
            .inboxes
            .entry(notification.recipient_id.clone())
            .or_default();
        if inbox.len() >= MAX_INBOX_LEN {
            inbox.pop_front();
        }
        inbox.push_back(notification);
    }

    /// Newest first.
    pub fn inbox(&self, recipient: &str) -> Vec<Notification> {
        self.inboxes
            .get(recipient)
            .map(|q| q.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove one notification, or all of them when `id` is `None`.
    /// Returns how many were removed.
    pub fn dismiss(&self, recipient: &str, id: Option<Ulid>) -> usize {
        let Some(mut inbox) = self.inboxes.get_mut(recipient) else {
            return 0;
        };
        let before = inbox.len();
        match id {
            Some(id) => inbox.retain(|n| n.id != id),
            None => inbox.clear(),
        }
        before - inbox.len()
    }
}
