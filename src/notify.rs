use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::tenant::TenantId;

const CHANNEL_CAPACITY: usize = 256;

/// An affected occurrence from a recurrence update, with the people to tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictingEvent {
    pub event_id: Ulid,
    pub reason: String,
    pub member_names: Vec<String>,
}

/// What the engine tells the notification collaborator about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    WaitlistPromoted {
        event_id: Ulid,
        registration_id: Ulid,
        member_id: Ulid,
    },
    RegistrationCancelled {
        event_id: Ulid,
        registration_id: Ulid,
        member_id: Ulid,
    },
    OccurrencesGenerated {
        master_id: Ulid,
        count: usize,
    },
    RecurrenceConflicts {
        master_id: Ulid,
        conflicts: Vec<ConflictingEvent>,
    },
}

/// Broadcast hub for engine notices, one channel per tenant.
pub struct NotifyHub {
    channels: DashMap<TenantId, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a tenant's notices. Creates the channel if needed.
    pub fn subscribe(&self, tenant: &TenantId) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(tenant.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, tenant: &TenantId, notice: Notice) {
        if let Some(sender) = self.channels.get(tenant) {
            let _ = sender.send(notice);
        }
    }
}
