use std::collections::{BTreeMap, HashSet};

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::EQUIPMENT_ASSIGNMENTS_TOTAL;
use crate::tenant::Ctx;

use super::{Engine, EngineError, LockKind};

/// Result of auto-allocating an event's requirements. Shortfalls are
/// reported, never raised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationReport {
    pub assigned: Vec<EventEquipmentAssignment>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

/// One item a caller wants bound to a requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignmentRequest {
    pub hardware_id: Ulid,
    pub responsible_member_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkAssignOutcome {
    pub assigned: Vec<EventEquipmentAssignment>,
    /// Requested items left out, with the reason.
    pub skipped: BTreeMap<Ulid, String>,
    /// Items taken in place of skipped ones.
    pub backfilled: Vec<Ulid>,
    pub requirement: EventEquipmentRequirement,
}

/// Why `item` cannot serve `requirement` over `window`, if it can't.
fn unusable_reason(
    item: &Hardware,
    requirement: &EventEquipmentRequirement,
    busy: &[EventEquipmentAssignment],
    window: &TimeWindow,
) -> Option<String> {
    if let Some(pinned) = requirement.hardware_id
        && pinned != item.id
    {
        return Some("not the item this requirement names".into());
    }
    if let Some(type_id) = requirement.hardware_type_id
        && requirement.hardware_id.is_none()
        && item.hardware_type_id != type_id
    {
        return Some("wrong hardware type".into());
    }
    if item.status != HardwareStatus::Available {
        return Some(format!("status is {:?}", item.status));
    }
    if busy
        .iter()
        .any(|a| a.hardware_id == item.id && a.status.holds_item() && a.window.overlaps(window))
    {
        return Some("already assigned in an overlapping window".into());
    }
    None
}

/// Items from `pool` free for `window`, in pool order.
pub fn free_candidates<'a>(
    pool: &'a [Hardware],
    requirement: &EventEquipmentRequirement,
    busy: &[EventEquipmentAssignment],
    window: &TimeWindow,
) -> Vec<&'a Hardware> {
    pool.iter()
        .filter(|h| unusable_reason(h, requirement, busy, window).is_none())
        .collect()
}

fn held_count(assignments: &[EventEquipmentAssignment]) -> u32 {
    assignments.iter().filter(|a| a.status.holds_item()).count() as u32
}

impl Engine {
    async fn requirement_pool(
        &self,
        ctx: &Ctx,
        requirement: &EventEquipmentRequirement,
    ) -> Result<Vec<Hardware>, EngineError> {
        if let Some(id) = requirement.hardware_id {
            let item = ctx
                .read(self.config.store_timeout, self.stores.hardware.get_hardware(&ctx.tenant, id))
                .await?;
            return Ok(item.into_iter().collect());
        }
        match requirement.hardware_type_id {
            Some(type_id) => {
                ctx.read(
                    self.config.store_timeout,
                    self.stores.hardware.hardware_of_type(&ctx.tenant, type_id),
                )
                .await
            }
            None => Ok(Vec::new()),
        }
    }

    async fn load_assignment(&self, ctx: &Ctx, id: Ulid) -> Result<EventEquipmentAssignment, EngineError> {
        ctx.read(
            self.config.store_timeout,
            self.stores.hardware.get_assignment(&ctx.tenant, id),
        )
        .await?
        .ok_or(EngineError::NotFound(id))
    }

    async fn busy_assignments(
        &self,
        ctx: &Ctx,
        ids: &[Ulid],
        window: TimeWindow,
    ) -> Result<Vec<EventEquipmentAssignment>, EngineError> {
        ctx.read(
            self.config.store_timeout,
            self.stores.hardware.assignments_overlapping(&ctx.tenant, ids, window),
        )
        .await
    }

    /// Greedily reserve hardware for every unfulfilled auto-assign requirement.
    pub async fn auto_allocate(&self, ctx: &Ctx, event_id: Ulid) -> Result<AllocationReport, EngineError> {
        let event = self.load_event(ctx, event_id).await?;
        let requirements = ctx
            .read(
                self.config.store_timeout,
                self.stores.hardware.requirements_for_event(&ctx.tenant, event_id),
            )
            .await?;

        let mut report = AllocationReport::default();
        for mut req in requirements.into_iter().filter(|r| r.auto_assign && !r.is_fulfilled) {
            let pool = self.requirement_pool(ctx, &req).await?;
            if pool.is_empty() {
                report
                    .warnings
                    .push(format!("requirement {}: no matching hardware", req.id));
                if req.is_mandatory {
                    report.recommendations.push(format!(
                        "requirement {}: add hardware of the required type",
                        req.id
                    ));
                }
                continue;
            }

            let ids: Vec<Ulid> = pool.iter().map(|h| h.id).collect();
            let _guards = self.locks.lock_many(ctx, LockKind::Hardware, &ids).await?;
            let existing = ctx
                .read(
                    self.config.store_timeout,
                    self.stores.hardware.assignments_for_requirement(&ctx.tenant, req.id),
                )
                .await?;
            let have = held_count(&existing);
            let need = req.quantity_required.saturating_sub(have);
            let busy = self.busy_assignments(ctx, &ids, event.window).await?;

            let new: Vec<EventEquipmentAssignment> = free_candidates(&pool, &req, &busy, &event.window)
                .into_iter()
                .take(need as usize)
                .map(|h| EventEquipmentAssignment {
                    id: Ulid::new(),
                    requirement_id: req.id,
                    event_id,
                    hardware_id: h.id,
                    responsible_member_id: None,
                    window: event.window,
                    status: AssignmentStatus::Reserved,
                })
                .collect();
            let got = have + new.len() as u32;
            req.is_fulfilled = got >= req.quantity_required;
            if !new.is_empty() || req.is_fulfilled {
                ctx.commit(
                    self.stores
                        .hardware
                        .commit_assignments(&ctx.tenant, req.clone(), new.clone()),
                )
                .await?;
            }
            metrics::counter!(EQUIPMENT_ASSIGNMENTS_TOTAL, "mode" => "auto").increment(new.len() as u64);

            if !req.is_fulfilled {
                let short = req.quantity_required - got;
                report.warnings.push(format!(
                    "requirement {}: {got} of {} assigned",
                    req.id, req.quantity_required
                ));
                if req.is_mandatory {
                    report.recommendations.push(format!(
                        "requirement {}: {short} more item(s) needed before the event",
                        req.id
                    ));
                }
            }
            report.assigned.extend(new);
        }

        if !report.warnings.is_empty() {
            warn!(%event_id, warnings = report.warnings.len(), "equipment partially allocated");
        }
        Ok(report)
    }

    /// Bind caller-chosen items to a requirement.
    ///
    /// With `auto_resolve_conflicts`, unusable items are skipped and the
    /// shortfall is backfilled from other free items of the type. Without it,
    /// the batch is all-or-nothing and any unusable item fails the whole call
    /// with a per-item error map.
    pub async fn assign_bulk(
        &self,
        ctx: &Ctx,
        event_id: Ulid,
        requirement_id: Ulid,
        items: &[AssignmentRequest],
        auto_resolve_conflicts: bool,
    ) -> Result<BulkAssignOutcome, EngineError> {
        if items.is_empty() {
            return Err(EngineError::validation("no items to assign"));
        }
        if items.len() > MAX_BULK_ASSIGNMENT {
            return Err(EngineError::validation(format!(
                "bulk assignment limited to {MAX_BULK_ASSIGNMENT} items"
            )));
        }
        let event = self.load_event(ctx, event_id).await?;
        let mut requirement = ctx
            .read(
                self.config.store_timeout,
                self.stores.hardware.requirements_for_event(&ctx.tenant, event_id),
            )
            .await?
            .into_iter()
            .find(|r| r.id == requirement_id)
            .ok_or(EngineError::NotFound(requirement_id))?;

        let pool = if auto_resolve_conflicts {
            self.requirement_pool(ctx, &requirement).await?
        } else {
            Vec::new()
        };
        let mut lock_ids: Vec<Ulid> = items.iter().map(|i| i.hardware_id).collect();
        lock_ids.extend(pool.iter().map(|h| h.id));
        let _guards = self.locks.lock_many(ctx, LockKind::Hardware, &lock_ids).await?;

        let existing = ctx
            .read(
                self.config.store_timeout,
                self.stores.hardware.assignments_for_requirement(&ctx.tenant, requirement_id),
            )
            .await?;
        let mut taken: HashSet<Ulid> = existing
            .iter()
            .filter(|a| a.status.holds_item())
            .map(|a| a.hardware_id)
            .collect();
        lock_ids.sort();
        lock_ids.dedup();
        let busy = self.busy_assignments(ctx, &lock_ids, event.window).await?;

        let mut accepted: Vec<AssignmentRequest> = Vec::new();
        let mut skipped = BTreeMap::new();
        for item in items {
            if taken.contains(&item.hardware_id) {
                skipped.insert(item.hardware_id, "already assigned to this requirement".to_string());
                continue;
            }
            let hw = ctx
                .read(
                    self.config.store_timeout,
                    self.stores.hardware.get_hardware(&ctx.tenant, item.hardware_id),
                )
                .await?;
            let reason = match hw {
                None => Some("hardware not found".to_string()),
                Some(ref h) => unusable_reason(h, &requirement, &busy, &event.window),
            };
            match reason {
                Some(r) => {
                    skipped.insert(item.hardware_id, r);
                }
                None => {
                    taken.insert(item.hardware_id);
                    accepted.push(*item);
                }
            }
        }

        if !auto_resolve_conflicts && !skipped.is_empty() {
            debug!(%requirement_id, conflicts = skipped.len(), "equipment batch rejected");
            return Err(EngineError::AssignmentConflicts(skipped));
        }

        let mut backfilled = Vec::new();
        if auto_resolve_conflicts {
            let shortfall = items.len() - accepted.len();
            for h in free_candidates(&pool, &requirement, &busy, &event.window) {
                if backfilled.len() == shortfall {
                    break;
                }
                if taken.insert(h.id) {
                    backfilled.push(h.id);
                    accepted.push(AssignmentRequest {
                        hardware_id: h.id,
                        responsible_member_id: None,
                    });
                }
            }
        }

        let assigned: Vec<EventEquipmentAssignment> = accepted
            .iter()
            .map(|a| EventEquipmentAssignment {
                id: Ulid::new(),
                requirement_id,
                event_id,
                hardware_id: a.hardware_id,
                responsible_member_id: a.responsible_member_id,
                window: event.window,
                status: AssignmentStatus::Reserved,
            })
            .collect();
        requirement.is_fulfilled =
            held_count(&existing) + assigned.len() as u32 >= requirement.quantity_required;
        ctx.commit(self.stores.hardware.commit_assignments(
            &ctx.tenant,
            requirement.clone(),
            assigned.clone(),
        ))
        .await?;

        metrics::counter!(EQUIPMENT_ASSIGNMENTS_TOTAL, "mode" => "bulk").increment(assigned.len() as u64);
        info!(
            %requirement_id,
            assigned = assigned.len(),
            skipped = skipped.len(),
            backfilled = backfilled.len(),
            "equipment batch committed"
        );
        Ok(BulkAssignOutcome {
            assigned,
            skipped,
            backfilled,
            requirement,
        })
    }

    pub async fn transition_assignment(
        &self,
        ctx: &Ctx,
        assignment_id: Ulid,
        next: AssignmentStatus,
    ) -> Result<EventEquipmentAssignment, EngineError> {
        let current = self.load_assignment(ctx, assignment_id).await?;
        let _guard = self
            .locks
            .lock(ctx, LockKind::Hardware, current.hardware_id)
            .await;
        let mut assignment = self.load_assignment(ctx, assignment_id).await?;
        if !assignment.status.can_transition_to(next) {
            return Err(EngineError::invalid_transition(assignment_id, assignment.status, next));
        }
        assignment.status = next;
        ctx.commit(
            self.stores
                .hardware
                .update_assignment(&ctx.tenant, assignment.clone()),
        )
        .await?;
        Ok(assignment)
    }
}
