use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

use crate::tenant::{Ctx, TenantId};

use super::EngineError;

/// What a lock key serializes. Keys of different kinds never contend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKind {
    /// Registration mutations on one event.
    Event,
    /// Rolling generation for one master.
    Generation,
    Facility,
    Member,
    Hardware,
}

type Key = (TenantId, LockKind, Ulid);

/// Async mutex table keyed by (tenant, kind, id).
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<Key, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: Key) -> Arc<Mutex<()>> {
        self.locks.entry(key).or_default().value().clone()
    }

    /// Wait for the lock unless the caller cancels or runs out of time first.
    pub async fn lock(&self, ctx: &Ctx, kind: LockKind, id: Ulid) -> Result<OwnedMutexGuard<()>, EngineError> {
        let slot = self.slot((ctx.tenant.clone(), kind, id));
        ctx.wait(slot.lock_owned()).await
    }

    /// `None` if someone else holds it.
    pub fn try_lock(&self, tenant: &TenantId, kind: LockKind, id: Ulid) -> Option<OwnedMutexGuard<()>> {
        self.slot((tenant.clone(), kind, id)).try_lock_owned().ok()
    }

    /// Acquire several locks of one kind in sorted order to prevent deadlocks.
    /// Guards taken before a cancellation are released on return.
    pub async fn lock_many(
        &self,
        ctx: &Ctx,
        kind: LockKind,
        ids: &[Ulid],
    ) -> Result<Vec<OwnedMutexGuard<()>>, EngineError> {
        let mut sorted = ids.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for id in sorted {
            guards.push(self.lock(ctx, kind, id).await?);
        }
        Ok(guards)
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, m| Arc::strong_count(m) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready_ok, task};
    use tokio_util::sync::CancellationToken;

    fn tenant() -> TenantId {
        TenantId::parse("club").unwrap()
    }

    fn ctx() -> Ctx {
        Ctx::new(tenant())
    }

    #[tokio::test]
    async fn try_lock_is_single_flight() {
        let locks = KeyedLocks::new();
        let id = Ulid::new();
        let held = locks.try_lock(&tenant(), LockKind::Generation, id);
        assert!(held.is_some());
        assert!(locks.try_lock(&tenant(), LockKind::Generation, id).is_none());
        // Different kind, same id: independent.
        assert!(locks.try_lock(&tenant(), LockKind::Event, id).is_some());
        drop(held);
        assert!(locks.try_lock(&tenant(), LockKind::Generation, id).is_some());
    }

    #[tokio::test]
    async fn tenants_do_not_contend() {
        let locks = KeyedLocks::new();
        let id = Ulid::new();
        let _a = locks.lock(&ctx(), LockKind::Event, id).await.unwrap();
        let other = TenantId::parse("other").unwrap();
        assert!(locks.try_lock(&other, LockKind::Event, id).is_some());
    }

    #[tokio::test]
    async fn prune_keeps_held_entries() {
        let locks = KeyedLocks::new();
        let held = locks.lock(&ctx(), LockKind::Facility, Ulid::new()).await.unwrap();
        let _ = locks.lock(&ctx(), LockKind::Facility, Ulid::new()).await.unwrap();
        assert_eq!(locks.len(), 2);
        assert_eq!(locks.prune(), 1);
        assert_eq!(locks.len(), 1);
        drop(held);
        assert_eq!(locks.prune(), 1);
        assert!(locks.is_empty());
    }

    #[test]
    fn batch_waits_for_held_member_then_dedups() {
        let locks = KeyedLocks::new();
        let ctx = ctx();
        let id = Ulid::new();
        let ids = [id, Ulid::new(), id];
        let held = locks.try_lock(&ctx.tenant, LockKind::Hardware, id).unwrap();

        let mut batch = task::spawn(locks.lock_many(&ctx, LockKind::Hardware, &ids));
        assert_pending!(batch.poll());
        drop(held);
        assert!(batch.is_woken());
        let guards = assert_ready_ok!(batch.poll());
        assert_eq!(guards.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_for_a_held_lock_respects_the_deadline() {
        let locks = KeyedLocks::new();
        let id = Ulid::new();
        let _held = locks.lock(&ctx(), LockKind::Event, id).await.unwrap();
        let impatient = ctx().with_timeout(Duration::from_millis(50));
        let res = locks.lock(&impatient, LockKind::Event, id).await;
        assert!(matches!(res, Err(EngineError::Timeout)));
    }

    #[test]
    fn cancelled_batch_releases_what_it_took() {
        let locks = KeyedLocks::new();
        let token = CancellationToken::new();
        let ctx = ctx().with_cancellation(token.clone());
        let (a, b) = {
            let (x, y) = (Ulid::new(), Ulid::new());
            if x < y { (x, y) } else { (y, x) }
        };
        // `a` sorts first and is free; `b` is held, so the batch parks on it.
        let held = locks.try_lock(&ctx.tenant, LockKind::Hardware, b).unwrap();
        let ids = [b, a];

        let mut batch = task::spawn(locks.lock_many(&ctx, LockKind::Hardware, &ids));
        assert_pending!(batch.poll());
        assert!(locks.try_lock(&ctx.tenant, LockKind::Hardware, a).is_none());
        token.cancel();
        assert!(batch.is_woken());
        let res = batch.poll();
        assert!(matches!(res, std::task::Poll::Ready(Err(EngineError::Cancelled))));
        drop(batch);
        assert!(locks.try_lock(&ctx.tenant, LockKind::Hardware, a).is_some());
        drop(held);
    }
}
