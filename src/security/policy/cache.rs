//! Per-tenant ruleset cache. Readers load the current map without locking;
//! every change publishes a new immutable map.
//!
//! A ruleset is only cached when no rule change is in flight for its scope
//! and none finished while it was being read, so a cached entry always
//! matches committed state.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::PolicyRule;

#[derive(Debug)]
pub struct CachedRuleset {
    pub rules: Arc<Vec<PolicyRule>>,
    pub loaded_at: Instant,
}

/// Which cached rulesets a rule change affects. Global rules are visible to
/// every tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleScope {
    Tenant(Uuid),
    Global,
}

impl RuleScope {
    pub fn of(organization_id: Option<Uuid>) -> Self {
        organization_id.map_or(Self::Global, Self::Tenant)
    }
}

pub struct RuleCache {
    ttl: Duration,
    entries: ArcSwap<HashMap<Uuid, Arc<CachedRuleset>>>,
    generation: AtomicU64,
    /// Uncommitted rule changes per scope. Guards every cache write.
    pending: Mutex<HashMap<RuleScope, usize>>,
}

impl RuleCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: ArcSwap::from_pointee(HashMap::new()),
            generation: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Read before loading rules from the store; pass it back to `store`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// The tenant's ruleset if it was loaded less than `ttl` ago.
    pub fn get(&self, org: Uuid) -> Option<Arc<Vec<PolicyRule>>> {
        let entries = self.entries.load();
        entries
            .get(&org)
            .filter(|entry| entry.loaded_at.elapsed() < self.ttl)
            .map(|entry| Arc::clone(&entry.rules))
    }

    /// Caches `rules` for `org` unless a rule change started or finished
    /// since `seen_generation`, or one is still open for the tenant or
    /// globally. The rules are returned either way.
    pub fn store(&self, org: Uuid, rules: Vec<PolicyRule>, seen_generation: u64) -> Arc<Vec<PolicyRule>> {
        let entry = Arc::new(CachedRuleset {
            rules: Arc::new(rules),
            loaded_at: Instant::now(),
        });
        let rules = Arc::clone(&entry.rules);

        let pending = self.lock_pending();
        let settled = self.generation() == seen_generation
            && !pending.contains_key(&RuleScope::Tenant(org))
            && !pending.contains_key(&RuleScope::Global);
        if settled {
            self.entries.rcu(|current| {
                let mut next = HashMap::clone(current);
                next.insert(org, Arc::clone(&entry));
                next
            });
        }
        rules
    }

    /// Marks a rule change in `scope` as open and drops what it affects.
    pub fn begin_change(&self, scope: RuleScope) {
        let mut pending = self.lock_pending();
        *pending.entry(scope).or_insert(0) += 1;
        self.evict(scope);
    }

    /// Closes a change opened by `begin_change`, committed or not.
    pub fn end_change(&self, scope: RuleScope) {
        let mut pending = self.lock_pending();
        if let Some(count) = pending.get_mut(&scope) {
            *count -= 1;
            if *count == 0 {
                pending.remove(&scope);
            }
        }
        self.evict(scope);
    }

    pub fn has_pending(&self, scope: RuleScope) -> bool {
        self.lock_pending().contains_key(&scope)
    }

    pub fn invalidate(&self, org: Uuid) {
        let _pending = self.lock_pending();
        self.evict(RuleScope::Tenant(org));
    }

    pub fn invalidate_all(&self) {
        let _pending = self.lock_pending();
        self.evict(RuleScope::Global);
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Caller holds the pending lock.
    fn evict(&self, scope: RuleScope) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        match scope {
            RuleScope::Tenant(org) => {
                self.entries.rcu(|current| {
                    let mut next = HashMap::clone(current);
                    next.remove(&org);
                    next
                });
            }
            RuleScope::Global => self.entries.store(Arc::new(HashMap::new())),
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<RuleScope, usize>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> RuleCache {
        RuleCache::new(Duration::from_secs(60))
    }

    #[test]
    fn test_store_and_get() {
        let cache = cache();
        let org = Uuid::new_v4();
        assert!(cache.get(org).is_none());

        cache.store(org, Vec::new(), cache.generation());
        assert!(cache.get(org).is_some());
        assert!(cache.get(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_expired_entries_are_misses() {
        let cache = RuleCache::new(Duration::ZERO);
        let org = Uuid::new_v4();
        cache.store(org, Vec::new(), cache.generation());
        assert!(cache.get(org).is_none());
    }

    #[test]
    fn test_invalidation() {
        let cache = cache();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        cache.store(a, Vec::new(), cache.generation());
        cache.store(b, Vec::new(), cache.generation());

        cache.invalidate(a);
        assert!(cache.get(a).is_none());
        assert!(cache.get(b).is_some());

        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_readers_keep_their_snapshot() {
        let cache = cache();
        let org = Uuid::new_v4();
        let held = cache.store(org, Vec::new(), cache.generation());
        cache.invalidate_all();
        assert!(held.is_empty());
        assert!(cache.get(org).is_none());
    }

    #[test]
    fn test_open_change_blocks_caching() {
        let cache = cache();
        let org = Uuid::new_v4();
        cache.begin_change(RuleScope::Tenant(org));
        assert!(cache.has_pending(RuleScope::Tenant(org)));

        cache.store(org, Vec::new(), cache.generation());
        assert!(cache.get(org).is_none());

        let other = Uuid::new_v4();
        cache.store(other, Vec::new(), cache.generation());
        assert!(cache.get(other).is_some());

        cache.end_change(RuleScope::Tenant(org));
        assert!(!cache.has_pending(RuleScope::Tenant(org)));
        cache.store(org, Vec::new(), cache.generation());
        assert!(cache.get(org).is_some());
    }

    #[test]
    fn test_open_global_change_blocks_every_tenant() {
        let cache = cache();
        let org = Uuid::new_v4();
        cache.store(org, Vec::new(), cache.generation());

        cache.begin_change(RuleScope::Global);
        assert!(cache.is_empty());
        cache.store(org, Vec::new(), cache.generation());
        assert!(cache.get(org).is_none());
        cache.end_change(RuleScope::Global);
    }

    #[test]
    fn test_read_overtaken_by_change_is_not_cached() {
        let cache = cache();
        let org = Uuid::new_v4();
        let seen = cache.generation();
        cache.begin_change(RuleScope::Tenant(org));
        cache.end_change(RuleScope::Tenant(org));

        cache.store(org, Vec::new(), seen);
        assert!(cache.get(org).is_none());
    }

    #[test]
    fn test_scope_of_rule_owner() {
        let org = Uuid::new_v4();
        assert_eq!(RuleScope::of(Some(org)), RuleScope::Tenant(org));
        assert_eq!(RuleScope::of(None), RuleScope::Global);
    }
}
