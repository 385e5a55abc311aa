//! Collaborator stores. The engine reads and writes entities only through these
//! traits; every method is scoped by an explicit tenant.

mod memory;

pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use ulid::Ulid;

use crate::fields::FieldSchema;
use crate::model::*;
use crate::tenant::TenantId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// Optimistic-concurrency check failed; re-read and re-validate.
    #[error("version conflict on {id}: expected {expected}, found {found}")]
    VersionConflict { id: Ulid, expected: u64, found: u64 },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn get_event(&self, tenant: &TenantId, id: Ulid) -> Result<Option<Event>, StoreError>;

    /// Insert all events or none.
    async fn create_events(&self, tenant: &TenantId, events: Vec<Event>) -> Result<(), StoreError>;

    /// `event.version` is the version the caller read. Returns the stored event
    /// with its bumped version.
    async fn update_event(&self, tenant: &TenantId, event: Event) -> Result<Event, StoreError>;

    /// Delete all events or none.
    async fn delete_events(&self, tenant: &TenantId, ids: &[Ulid]) -> Result<(), StoreError>;

    /// Occurrences of a master, sorted by start. `range` filters by overlap.
    async fn occurrences(
        &self,
        tenant: &TenantId,
        master_id: Ulid,
        range: Option<TimeWindow>,
    ) -> Result<Vec<Event>, StoreError>;

    /// Masters whose series is still generating.
    async fn active_masters(&self, tenant: &TenantId) -> Result<Vec<Ulid>, StoreError>;

    async fn field_schema(&self, tenant: &TenantId) -> Result<Vec<FieldSchema>, StoreError>;
}

#[async_trait]
pub trait RegistrationStore: Send + Sync {
    async fn registrations_for_event(
        &self,
        tenant: &TenantId,
        event_id: Ulid,
    ) -> Result<Vec<EventRegistration>, StoreError>;

    async fn get_registration(
        &self,
        tenant: &TenantId,
        id: Ulid,
    ) -> Result<Option<EventRegistration>, StoreError>;

    /// Write the event's enrollment counter (version-checked like `update_event`)
    /// together with the changed registration rows, atomically. Implementations
    /// back both with the same transaction.
    async fn commit_ledger(
        &self,
        tenant: &TenantId,
        event: Event,
        registrations: Vec<EventRegistration>,
    ) -> Result<Event, StoreError>;

    /// Rows whose change does not touch enrollment (e.g. check-in).
    async fn update_registrations(
        &self,
        tenant: &TenantId,
        registrations: Vec<EventRegistration>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn get_facility(&self, tenant: &TenantId, id: Ulid) -> Result<Option<Facility>, StoreError>;

    /// Bookings of any status overlapping `range`.
    async fn bookings_for_facility(
        &self,
        tenant: &TenantId,
        facility_id: Ulid,
        range: TimeWindow,
    ) -> Result<Vec<FacilityBooking>, StoreError>;

    /// Bookings of any status overlapping `range`.
    async fn bookings_for_member(
        &self,
        tenant: &TenantId,
        member_id: Ulid,
        range: TimeWindow,
    ) -> Result<Vec<FacilityBooking>, StoreError>;

    async fn get_booking(&self, tenant: &TenantId, id: Ulid) -> Result<Option<FacilityBooking>, StoreError>;

    async fn create_booking(&self, tenant: &TenantId, booking: FacilityBooking) -> Result<(), StoreError>;

    async fn update_booking(&self, tenant: &TenantId, booking: FacilityBooking) -> Result<(), StoreError>;
}

#[async_trait]
pub trait LimitStore: Send + Sync {
    /// Every policy that could apply to the member: their own, their tier's, and global ones.
    async fn policies_for(
        &self,
        tenant: &TenantId,
        member: &Member,
    ) -> Result<Vec<MemberBookingLimit>, StoreError>;

    async fn usage(&self, tenant: &TenantId, member_id: Ulid) -> Result<Option<MemberBookingUsage>, StoreError>;

    async fn save_usage(&self, tenant: &TenantId, usage: MemberBookingUsage) -> Result<(), StoreError>;
}

#[async_trait]
pub trait HardwareStore: Send + Sync {
    async fn get_hardware(&self, tenant: &TenantId, id: Ulid) -> Result<Option<Hardware>, StoreError>;

    async fn hardware_of_type(&self, tenant: &TenantId, hardware_type_id: Ulid) -> Result<Vec<Hardware>, StoreError>;

    /// Assignments of any status on these items overlapping `range`.
    async fn assignments_overlapping(
        &self,
        tenant: &TenantId,
        hardware_ids: &[Ulid],
        range: TimeWindow,
    ) -> Result<Vec<EventEquipmentAssignment>, StoreError>;

    async fn requirements_for_event(
        &self,
        tenant: &TenantId,
        event_id: Ulid,
    ) -> Result<Vec<EventEquipmentRequirement>, StoreError>;

    async fn assignments_for_requirement(
        &self,
        tenant: &TenantId,
        requirement_id: Ulid,
    ) -> Result<Vec<EventEquipmentAssignment>, StoreError>;

    async fn get_assignment(
        &self,
        tenant: &TenantId,
        id: Ulid,
    ) -> Result<Option<EventEquipmentAssignment>, StoreError>;

    /// Insert new assignments and update the requirement, atomically.
    async fn commit_assignments(
        &self,
        tenant: &TenantId,
        requirement: EventEquipmentRequirement,
        assignments: Vec<EventEquipmentAssignment>,
    ) -> Result<(), StoreError>;

    async fn update_assignment(
        &self,
        tenant: &TenantId,
        assignment: EventEquipmentAssignment,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn get_member(&self, tenant: &TenantId, id: Ulid) -> Result<Option<Member>, StoreError>;
}

/// The set of collaborators an engine runs against.
#[derive(Clone)]
pub struct Stores {
    pub events: Arc<dyn EventStore>,
    pub registrations: Arc<dyn RegistrationStore>,
    pub bookings: Arc<dyn BookingStore>,
    pub limits: Arc<dyn LimitStore>,
    pub hardware: Arc<dyn HardwareStore>,
    pub members: Arc<dyn MemberDirectory>,
}

impl Stores {
    /// Back every collaborator with one in-memory store.
    pub fn in_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            events: store.clone(),
            registrations: store.clone(),
            bookings: store.clone(),
            limits: store.clone(),
            hardware: store.clone(),
            members: store,
        }
    }
}
