use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::fields::FieldSchema;
use crate::model::*;
use crate::tenant::TenantId;

use super::*;

/// Everything one tenant owns. A tenant's partition is only reachable through
/// its own `TenantId`, so cross-tenant reads cannot be expressed.
#[derive(Default)]
struct Partition {
    events: HashMap<Ulid, Event>,
    registrations: HashMap<Ulid, EventRegistration>,
    facilities: HashMap<Ulid, Facility>,
    bookings: HashMap<Ulid, FacilityBooking>,
    policies: HashMap<Ulid, MemberBookingLimit>,
    usage: HashMap<Ulid, MemberBookingUsage>,
    members: HashMap<Ulid, Member>,
    hardware: HashMap<Ulid, Hardware>,
    requirements: HashMap<Ulid, EventEquipmentRequirement>,
    assignments: HashMap<Ulid, EventEquipmentAssignment>,
    field_schema: Vec<FieldSchema>,
}

impl Partition {
    fn check_version(&self, event: &Event) -> Result<(), StoreError> {
        let current = self
            .events
            .get(&event.id)
            .ok_or(StoreError::NotFound(event.id))?;
        if current.version != event.version {
            return Err(StoreError::VersionConflict {
                id: event.id,
                expected: event.version,
                found: current.version,
            });
        }
        Ok(())
    }

    fn write_event(&mut self, mut event: Event) -> Event {
        event.version += 1;
        self.events.insert(event.id, event.clone());
        event
    }
}

/// In-memory implementation of every collaborator store, partitioned by tenant.
pub struct MemoryStore {
    tenants: DashMap<TenantId, Arc<RwLock<Partition>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
        }
    }

    fn partition(&self, tenant: &TenantId) -> Arc<RwLock<Partition>> {
        self.tenants
            .entry(tenant.clone())
            .or_default()
            .value()
            .clone()
    }

    // ── Seeding (owned by other collaborators in production) ─────

    pub async fn put_facility(&self, tenant: &TenantId, facility: Facility) {
        self.partition(tenant).write().await.facilities.insert(facility.id, facility);
    }

    pub async fn put_member(&self, tenant: &TenantId, member: Member) {
        self.partition(tenant).write().await.members.insert(member.id, member);
    }

    pub async fn put_policy(&self, tenant: &TenantId, policy: MemberBookingLimit) {
        self.partition(tenant).write().await.policies.insert(policy.id, policy);
    }

    pub async fn put_hardware(&self, tenant: &TenantId, hardware: Hardware) {
        self.partition(tenant).write().await.hardware.insert(hardware.id, hardware);
    }

    pub async fn put_requirement(&self, tenant: &TenantId, requirement: EventEquipmentRequirement) {
        self.partition(tenant)
            .write()
            .await
            .requirements
            .insert(requirement.id, requirement);
    }

    pub async fn put_event(&self, tenant: &TenantId, event: Event) {
        self.partition(tenant).write().await.events.insert(event.id, event);
    }

    pub async fn put_booking(&self, tenant: &TenantId, booking: FacilityBooking) {
        self.partition(tenant).write().await.bookings.insert(booking.id, booking);
    }

    pub async fn set_field_schema(&self, tenant: &TenantId, schema: Vec<FieldSchema>) {
        self.partition(tenant).write().await.field_schema = schema;
    }

    pub async fn requirement(&self, tenant: &TenantId, id: Ulid) -> Option<EventEquipmentRequirement> {
        self.partition(tenant).read().await.requirements.get(&id).cloned()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn get_event(&self, tenant: &TenantId, id: Ulid) -> Result<Option<Event>, StoreError> {
        Ok(self.partition(tenant).read().await.events.get(&id).cloned())
    }

    async fn create_events(&self, tenant: &TenantId, events: Vec<Event>) -> Result<(), StoreError> {
        let part = self.partition(tenant);
        let mut guard = part.write().await;
        if let Some(dup) = events.iter().find(|e| guard.events.contains_key(&e.id)) {
            return Err(StoreError::AlreadyExists(dup.id));
        }
        for event in events {
            guard.events.insert(event.id, event);
        }
        Ok(())
    }

    async fn update_event(&self, tenant: &TenantId, event: Event) -> Result<Event, StoreError> {
        let part = self.partition(tenant);
        let mut guard = part.write().await;
        guard.check_version(&event)?;
        Ok(guard.write_event(event))
    }

    async fn delete_events(&self, tenant: &TenantId, ids: &[Ulid]) -> Result<(), StoreError> {
        let part = self.partition(tenant);
        let mut guard = part.write().await;
        if let Some(missing) = ids.iter().find(|id| !guard.events.contains_key(id)) {
            return Err(StoreError::NotFound(*missing));
        }
        for id in ids {
            guard.events.remove(id);
        }
        Ok(())
    }

    async fn occurrences(
        &self,
        tenant: &TenantId,
        master_id: Ulid,
        range: Option<TimeWindow>,
    ) -> Result<Vec<Event>, StoreError> {
        let part = self.partition(tenant);
        let guard = part.read().await;
        let mut out: Vec<Event> = guard
            .events
            .values()
            .filter(|e| e.master_event_id() == Some(master_id))
            .filter(|e| range.is_none_or(|r| r.overlaps(&e.window)))
            .cloned()
            .collect();
        out.sort_by_key(|e| (e.window.start, e.occurrence_number()));
        Ok(out)
    }

    async fn active_masters(&self, tenant: &TenantId) -> Result<Vec<Ulid>, StoreError> {
        let part = self.partition(tenant);
        let guard = part.read().await;
        let mut ids: Vec<Ulid> = guard
            .events
            .values()
            .filter(|e| {
                e.series_state()
                    .is_some_and(|s| s.status == RecurrenceStatus::Active)
            })
            .map(|e| e.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn field_schema(&self, tenant: &TenantId) -> Result<Vec<FieldSchema>, StoreError> {
        Ok(self.partition(tenant).read().await.field_schema.clone())
    }
}

#[async_trait]
impl RegistrationStore for MemoryStore {
    async fn registrations_for_event(
        &self,
        tenant: &TenantId,
        event_id: Ulid,
    ) -> Result<Vec<EventRegistration>, StoreError> {
        let part = self.partition(tenant);
        let guard = part.read().await;
        let mut out: Vec<EventRegistration> = guard
            .registrations
            .values()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect();
        // Ulids are time-ordered, so this is registration order.
        out.sort_by_key(|r| (r.registered_at, r.id));
        Ok(out)
    }

    async fn get_registration(
        &self,
        tenant: &TenantId,
        id: Ulid,
    ) -> Result<Option<EventRegistration>, StoreError> {
        Ok(self.partition(tenant).read().await.registrations.get(&id).cloned())
    }

    async fn commit_ledger(
        &self,
        tenant: &TenantId,
        event: Event,
        registrations: Vec<EventRegistration>,
    ) -> Result<Event, StoreError> {
        let part = self.partition(tenant);
        let mut guard = part.write().await;
        guard.check_version(&event)?;
        for r in registrations {
            guard.registrations.insert(r.id, r);
        }
        Ok(guard.write_event(event))
    }

    async fn update_registrations(
        &self,
        tenant: &TenantId,
        registrations: Vec<EventRegistration>,
    ) -> Result<(), StoreError> {
        let part = self.partition(tenant);
        let mut guard = part.write().await;
        if let Some(missing) = registrations
            .iter()
            .find(|r| !guard.registrations.contains_key(&r.id))
        {
            return Err(StoreError::NotFound(missing.id));
        }
        for r in registrations {
            guard.registrations.insert(r.id, r);
        }
        Ok(())
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn get_facility(&self, tenant: &TenantId, id: Ulid) -> Result<Option<Facility>, StoreError> {
        Ok(self.partition(tenant).read().await.facilities.get(&id).cloned())
    }

    async fn bookings_for_facility(
        &self,
        tenant: &TenantId,
        facility_id: Ulid,
        range: TimeWindow,
    ) -> Result<Vec<FacilityBooking>, StoreError> {
        let part = self.partition(tenant);
        let guard = part.read().await;
        let mut out: Vec<FacilityBooking> = guard
            .bookings
            .values()
            .filter(|b| b.facility_id == facility_id && b.window.overlaps(&range))
            .cloned()
            .collect();
        out.sort_by_key(|b| b.window.start);
        Ok(out)
    }

    async fn bookings_for_member(
        &self,
        tenant: &TenantId,
        member_id: Ulid,
        range: TimeWindow,
    ) -> Result<Vec<FacilityBooking>, StoreError> {
        let part = self.partition(tenant);
        let guard = part.read().await;
        let mut out: Vec<FacilityBooking> = guard
            .bookings
            .values()
            .filter(|b| b.member_id == member_id && b.window.overlaps(&range))
            .cloned()
            .collect();
        out.sort_by_key(|b| b.window.start);
        Ok(out)
    }

    async fn get_booking(&self, tenant: &TenantId, id: Ulid) -> Result<Option<FacilityBooking>, StoreError> {
        Ok(self.partition(tenant).read().await.bookings.get(&id).cloned())
    }

    async fn create_booking(&self, tenant: &TenantId, booking: FacilityBooking) -> Result<(), StoreError> {
        let part = self.partition(tenant);
        let mut guard = part.write().await;
        if guard.bookings.contains_key(&booking.id) {
            return Err(StoreError::AlreadyExists(booking.id));
        }
        guard.bookings.insert(booking.id, booking);
        Ok(())
    }

    async fn update_booking(&self, tenant: &TenantId, booking: FacilityBooking) -> Result<(), StoreError> {
        let part = self.partition(tenant);
        let mut guard = part.write().await;
        if !guard.bookings.contains_key(&booking.id) {
            return Err(StoreError::NotFound(booking.id));
        }
        guard.bookings.insert(booking.id, booking);
        Ok(())
    }
}

#[async_trait]
impl LimitStore for MemoryStore {
    async fn policies_for(
        &self,
        tenant: &TenantId,
        member: &Member,
    ) -> Result<Vec<MemberBookingLimit>, StoreError> {
        let part = self.partition(tenant);
        let guard = part.read().await;
        Ok(guard
            .policies
            .values()
            .filter(|p| match p.scope {
                LimitScope::MemberFacility { member_id, .. }
                | LimitScope::MemberFacilityType { member_id, .. } => member_id == member.id,
                LimitScope::Tier { tier_id } => member.tier_id == Some(tier_id),
                LimitScope::Global => true,
            })
            .cloned()
            .collect())
    }

    async fn usage(&self, tenant: &TenantId, member_id: Ulid) -> Result<Option<MemberBookingUsage>, StoreError> {
        Ok(self.partition(tenant).read().await.usage.get(&member_id).cloned())
    }

    async fn save_usage(&self, tenant: &TenantId, usage: MemberBookingUsage) -> Result<(), StoreError> {
        self.partition(tenant)
            .write()
            .await
            .usage
            .insert(usage.member_id, usage);
        Ok(())
    }
}

#[async_trait]
impl HardwareStore for MemoryStore {
    async fn get_hardware(&self, tenant: &TenantId, id: Ulid) -> Result<Option<Hardware>, StoreError> {
        Ok(self.partition(tenant).read().await.hardware.get(&id).cloned())
    }

    async fn hardware_of_type(&self, tenant: &TenantId, hardware_type_id: Ulid) -> Result<Vec<Hardware>, StoreError> {
        let part = self.partition(tenant);
        let guard = part.read().await;
        let mut out: Vec<Hardware> = guard
            .hardware
            .values()
            .filter(|h| h.hardware_type_id == hardware_type_id)
            .cloned()
            .collect();
        out.sort_by_key(|h| h.id);
        Ok(out)
    }

    async fn assignments_overlapping(
        &self,
        tenant: &TenantId,
        hardware_ids: &[Ulid],
        range: TimeWindow,
    ) -> Result<Vec<EventEquipmentAssignment>, StoreError> {
        let part = self.partition(tenant);
        let guard = part.read().await;
        Ok(guard
            .assignments
            .values()
            .filter(|a| hardware_ids.contains(&a.hardware_id) && a.window.overlaps(&range))
            .cloned()
            .collect())
    }

    async fn requirements_for_event(
        &self,
        tenant: &TenantId,
        event_id: Ulid,
    ) -> Result<Vec<EventEquipmentRequirement>, StoreError> {
        let part = self.partition(tenant);
        let guard = part.read().await;
        let mut out: Vec<EventEquipmentRequirement> = guard
            .requirements
            .values()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    async fn assignments_for_requirement(
        &self,
        tenant: &TenantId,
        requirement_id: Ulid,
    ) -> Result<Vec<EventEquipmentAssignment>, StoreError> {
        let part = self.partition(tenant);
        let guard = part.read().await;
        let mut out: Vec<EventEquipmentAssignment> = guard
            .assignments
            .values()
            .filter(|a| a.requirement_id == requirement_id)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.id);
        Ok(out)
    }

    async fn get_assignment(
        &self,
        tenant: &TenantId,
        id: Ulid,
    ) -> Result<Option<EventEquipmentAssignment>, StoreError> {
        Ok(self.partition(tenant).read().await.assignments.get(&id).cloned())
    }

    async fn commit_assignments(
        &self,
        tenant: &TenantId,
        requirement: EventEquipmentRequirement,
        assignments: Vec<EventEquipmentAssignment>,
    ) -> Result<(), StoreError> {
        let part = self.partition(tenant);
        let mut guard = part.write().await;
        if !guard.requirements.contains_key(&requirement.id) {
            return Err(StoreError::NotFound(requirement.id));
        }
        if let Some(dup) = assignments
            .iter()
            .find(|a| guard.assignments.contains_key(&a.id))
        {
            return Err(StoreError::AlreadyExists(dup.id));
        }
        for a in assignments {
            guard.assignments.insert(a.id, a);
        }
        guard.requirements.insert(requirement.id, requirement);
        Ok(())
    }

    async fn update_assignment(
        &self,
        tenant: &TenantId,
        assignment: EventEquipmentAssignment,
    ) -> Result<(), StoreError> {
        let part = self.partition(tenant);
        let mut guard = part.write().await;
        if !guard.assignments.contains_key(&assignment.id) {
            return Err(StoreError::NotFound(assignment.id));
        }
        guard.assignments.insert(assignment.id, assignment);
        Ok(())
    }
}

#[async_trait]
impl MemberDirectory for MemoryStore {
    async fn get_member(&self, tenant: &TenantId, id: Ulid) -> Result<Option<Member>, StoreError> {
        Ok(self.partition(tenant).read().await.members.get(&id).cloned())
    }
}
