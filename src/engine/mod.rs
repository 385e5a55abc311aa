mod bookings;
mod conflict;
mod equipment;
mod error;
mod lock;
mod occurrences;
pub mod policy;
pub mod recurrence;
mod registration;

pub use bookings::BookingRequest;
pub use conflict::{BookingConflict, check_operating_hours, evaluate, is_available, next_available_slot};
pub use equipment::{AllocationReport, AssignmentRequest, BulkAssignOutcome, free_candidates};
pub use error::{EngineError, ErrorKind};
pub use lock::{KeyedLocks, LockKind};
pub use occurrences::{ExtendOutcome, SeriesOutcome, UpdateOutcome, UpdateStrategy};
pub use registration::{BulkCheckInResult, CancelOutcome, Ledger, RegisterOutcome};

use std::sync::{Arc, Mutex};

use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::store::Stores;
use crate::tenant::Ctx;

/// Source of "now" for every time-dependent decision.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now()
    }
}

/// Manually driven clock for tests and replays.
pub struct FixedClock(Mutex<Timestamp>);

impl FixedClock {
    pub fn new(at: Timestamp) -> Self {
        Self(Mutex::new(at))
    }

    pub fn set(&self, at: Timestamp) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The scheduling and resource-conflict engine.
///
/// Holds no entity state of its own: every read and write goes through the
/// collaborator stores, scoped by the tenant in the caller's `Ctx`. Mutations
/// on one event, facility, member, or hardware item are serialized by `locks`.
pub struct Engine {
    pub(super) stores: Stores,
    pub(super) config: EngineConfig,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) locks: KeyedLocks,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(stores: Stores, config: EngineConfig, notify: Arc<NotifyHub>) -> Self {
        Self {
            stores,
            config,
            clock: Arc::new(SystemClock),
            locks: KeyedLocks::new(),
            notify,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Drop lock-table entries nobody is using.
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    // ── Loaders: store read + cancellation + not-found mapping ───

    pub(super) async fn load_event(&self, ctx: &Ctx, id: Ulid) -> Result<Event, EngineError> {
        ctx.read(self.config.store_timeout, self.stores.events.get_event(&ctx.tenant, id))
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    pub(super) async fn load_master(&self, ctx: &Ctx, id: Ulid) -> Result<Event, EngineError> {
        let master = self.load_event(ctx, id).await?;
        if !master.is_recurring_master() {
            return Err(EngineError::validation(format!("{id} is not a recurring master")));
        }
        Ok(master)
    }

    pub(super) async fn load_registrations(
        &self,
        ctx: &Ctx,
        event_id: Ulid,
    ) -> Result<Vec<EventRegistration>, EngineError> {
        ctx.read(
            self.config.store_timeout,
            self.stores.registrations.registrations_for_event(&ctx.tenant, event_id),
        )
        .await
    }

    pub(super) async fn load_facility(&self, ctx: &Ctx, id: Ulid) -> Result<Facility, EngineError> {
        ctx.read(self.config.store_timeout, self.stores.bookings.get_facility(&ctx.tenant, id))
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    pub(super) async fn load_member(&self, ctx: &Ctx, id: Ulid) -> Result<Member, EngineError> {
        ctx.read(self.config.store_timeout, self.stores.members.get_member(&ctx.tenant, id))
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    pub(super) async fn facility_bookings(
        &self,
        ctx: &Ctx,
        facility_id: Ulid,
        range: TimeWindow,
    ) -> Result<Vec<FacilityBooking>, EngineError> {
        ctx.read(
            self.config.store_timeout,
            self.stores.bookings.bookings_for_facility(&ctx.tenant, facility_id, range),
        )
        .await
    }
}
