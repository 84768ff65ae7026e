//! Allocation cache.
//!
//! In-memory map from allocation key (node name, load-balancer id, ...) to
//! the ports held under that key and the pod holding each one. It is a
//! projection of cluster state, rebuilt with [`AllocationCache::rebuild`] at
//! plugin init and on every resync, and mutated by every allocate/release.
//!
//! Locking: one mutex per key, so work on different keys runs in parallel.
//! [`AllocationCache::allocate_first_fit`] spans several keys and is
//! serialized by a separate placement mutex, which is always taken before
//! any key mutex.
//!
//! Allocations made here are "pending" until an observation confirms them.
//! A rebuild keeps pending allocations younger than the grace period even
//! when the observation lacks them, so a resync racing an in-flight
//! admission cannot hand the same port out twice.

mod range;

pub use range::PortRange;

use k8s_openapi::api::core::v1::Pod;
use network_api::pod_key;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// How long an unconfirmed allocation survives a rebuild
pub const DEFAULT_RECONCILE_GRACE: Duration = Duration::from_secs(30);

/// Errors returned by the allocation cache
#[derive(Debug, Error)]
pub enum CacheError {
    /// Not enough free units, nothing was allocated
    #[error("not enough free ports under {key}: requested {requested}, available {available}")]
    Exhausted {
        /// Allocation key (or comma-joined candidate keys)
        key: String,
        /// Units asked for
        requested: usize,
        /// Units the owner could have had
        available: usize,
    },

    /// Request is malformed (zero count, no candidate keys)
    #[error("Invalid allocation request: {0}")]
    InvalidRequest(String),

    /// A unit claimed by one pod is held by another
    #[error("port {unit} under {key} is held by {holder}")]
    Taken {
        /// Allocation key
        key: String,
        /// Contested unit
        unit: u16,
        /// Current holder
        holder: Owner,
    },
}

/// Identity of the pod holding a unit
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner {
    /// `namespace/name`
    pub pod: String,
    /// Pod UID, unknown during create admission
    pub uid: Option<String>,
}

impl Owner {
    /// Owner from a pod key and optional uid.
    pub fn new(pod: impl Into<String>, uid: Option<String>) -> Self {
        Self {
            pod: pod.into(),
            uid: uid.filter(|u| !u.is_empty()),
        }
    }

    /// Owner identity of a pod.
    pub fn from_pod(pod: &Pod) -> Self {
        Self::new(pod_key(pod), pod.metadata.uid.clone())
    }

    /// Same pod name, any incarnation.
    pub fn same_pod(&self, other: &Owner) -> bool {
        self.pod == other.pod
    }

    /// Same pod name and no evidence of a different incarnation.
    ///
    /// Two owners of the same name only mismatch when both UIDs are known and differ.
    pub fn matches(&self, holder: &Owner) -> bool {
        self.same_pod(holder)
            && match (&self.uid, &holder.uid) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "{} ({})", self.pod, uid),
            None => f.write_str(&self.pod),
        }
    }
}

/// One unit attributed to one pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    /// Allocation key
    pub key: String,
    /// Port
    pub unit: u16,
    /// Holder
    pub owner: Owner,
}

/// Outcome of a reconcile/rebuild
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Observed records applied
    pub records: usize,
    /// Unconfirmed allocations kept because they are still within the grace period
    pub retained: usize,
    /// Observed records dropped because another pod already claimed the unit
    pub conflicts: Vec<AllocationRecord>,
}

impl ReconcileSummary {
    fn merge(&mut self, other: ReconcileSummary) {
        self.records += other.records;
        self.retained += other.retained;
        self.conflicts.extend(other.conflicts);
    }
}

#[derive(Debug, Clone)]
struct Held {
    owner: Owner,
    /// Set while the allocation has not been seen in an observation yet
    pending_since: Option<Instant>,
}

#[derive(Debug, Default)]
struct KeyState {
    units: BTreeMap<u16, Held>,
}

impl KeyState {
    fn held_by(&self, owner: &Owner) -> Vec<u16> {
        self.units
            .iter()
            .filter(|(_, h)| h.owner.same_pod(owner))
            .map(|(u, _)| *u)
            .collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Port allocation cache shared by the pods of one plugin
#[derive(Debug)]
pub struct AllocationCache {
    range: PortRange,
    grace: Duration,
    keys: Mutex<HashMap<String, Arc<Mutex<KeyState>>>>,
    placement: Mutex<()>,
}

impl AllocationCache {
    /// Empty cache handing out ports from `range` under every key.
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            grace: DEFAULT_RECONCILE_GRACE,
            keys: Mutex::new(HashMap::new()),
            placement: Mutex::new(()),
        }
    }

    /// Override how long unconfirmed allocations survive a rebuild.
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Port range of this cache
    pub fn range(&self) -> &PortRange {
        &self.range
    }

    fn slot(&self, key: &str) -> Arc<Mutex<KeyState>> {
        Arc::clone(
            lock(&self.keys)
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(KeyState::default()))),
        )
    }

    fn existing_slot(&self, key: &str) -> Option<Arc<Mutex<KeyState>>> {
        lock(&self.keys).get(key).map(Arc::clone)
    }

    fn slots(&self) -> Vec<(String, Arc<Mutex<KeyState>>)> {
        let mut slots: Vec<_> = lock(&self.keys)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
    }

    /// Make `owner` hold exactly `count` units under `key`.
    ///
    /// - Units the owner already holds are kept, so retries return the same set.
    /// - Missing units are taken lowest-first, skipping allocated and `excluded` ports.
    /// - Surplus units are released highest-first.
    /// - A shortage fails with [`CacheError::Exhausted`] and changes nothing.
    ///
    /// A holder with the same pod name is re-attributed to `owner`'s UID when
    /// it is known (pod recreated under the same name).
    pub fn allocate(
        &self,
        key: &str,
        owner: &Owner,
        count: usize,
        excluded: &[u16],
    ) -> Result<Vec<u16>, CacheError> {
        if count == 0 {
            return Err(CacheError::InvalidRequest(format!(
                "{} asked for zero ports under {}",
                owner, key
            )));
        }
        let slot = self.slot(key);
        let mut state = lock(&*slot);
        self.allocate_locked(key, &mut state, owner, count, excluded)
    }

    fn allocate_locked(
        &self,
        key: &str,
        state: &mut KeyState,
        owner: &Owner,
        count: usize,
        excluded: &[u16],
    ) -> Result<Vec<u16>, CacheError> {
        let mut held = state.held_by(owner);
        let is_free = |p: &u16| !state.units.contains_key(p) && !excluded.contains(p);

        if held.len() < count {
            let need = count - held.len();
            let free: Vec<u16> = self.range.iter().filter(is_free).take(need).collect();
            if free.len() < need {
                let available = held.len() + self.range.iter().filter(is_free).count();
                return Err(CacheError::Exhausted {
                    key: key.to_string(),
                    requested: count,
                    available,
                });
            }
            let now = Instant::now();
            for unit in &free {
                state.units.insert(
                    *unit,
                    Held {
                        owner: owner.clone(),
                        pending_since: Some(now),
                    },
                );
            }
            held.extend(free);
            held.sort_unstable();
        } else if held.len() > count {
            for unit in held.split_off(count) {
                state.units.remove(&unit);
            }
        }

        if owner.uid.is_some() {
            for unit in &held {
                if let Some(h) = state.units.get_mut(unit) {
                    h.owner = owner.clone();
                }
            }
        }
        Ok(held)
    }

    /// Allocate under the first of `keys` that can fit `count` units.
    ///
    /// If the owner already holds units under one of `keys` that key is tried
    /// first. Units held under a key no longer listed, or under a key the owner
    /// had to move away from, are released once the new placement succeeds.
    pub fn allocate_first_fit(
        &self,
        keys: &[String],
        owner: &Owner,
        count: usize,
        excluded: &[u16],
    ) -> Result<(String, Vec<u16>), CacheError> {
        if keys.is_empty() {
            return Err(CacheError::InvalidRequest(format!(
                "no allocation keys offered for {}",
                owner
            )));
        }
        let _placement = lock(&self.placement);

        let previous = self.held_by(owner);
        if let Some((current, _)) = &previous {
            if keys.contains(current) {
                match self.allocate(current, owner, count, excluded) {
                    Ok(units) => return Ok((current.clone(), units)),
                    Err(CacheError::Exhausted { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let mut best_available = 0;
        for key in keys {
            if previous.as_ref().is_some_and(|(k, _)| k == key) {
                continue;
            }
            match self.allocate(key, owner, count, excluded) {
                Ok(units) => {
                    if let Some((old_key, old_units)) = &previous {
                        self.release(old_key, owner, old_units, false);
                    }
                    return Ok((key.clone(), units));
                }
                Err(CacheError::Exhausted { available, .. }) => {
                    best_available = best_available.max(available);
                }
                Err(e) => return Err(e),
            }
        }

        Err(CacheError::Exhausted {
            key: keys.join(","),
            requested: count,
            available: best_available,
        })
    }

    /// Make `owner` hold exactly `units` under `key`.
    ///
    /// Used for allocations already recorded on a pod: the units are taken
    /// as they are, even outside the range, and count as observed. Other
    /// units the owner holds under `key` are released. Fails with
    /// [`CacheError::Taken`] and changes nothing when another pod holds one
    /// of them.
    pub fn claim(&self, key: &str, owner: &Owner, units: &[u16]) -> Result<(), CacheError> {
        if units.is_empty() {
            return Err(CacheError::InvalidRequest(format!(
                "{} claimed no ports under {}",
                owner, key
            )));
        }
        let slot = self.slot(key);
        let mut state = lock(&*slot);

        if let Some((unit, held)) = units
            .iter()
            .filter_map(|u| state.units.get(u).map(|h| (*u, h)))
            .find(|(_, h)| !owner.matches(&h.owner))
        {
            return Err(CacheError::Taken {
                key: key.to_string(),
                unit,
                holder: held.owner.clone(),
            });
        }

        state
            .units
            .retain(|unit, h| units.contains(unit) || !owner.matches(&h.owner));
        for unit in units {
            let holder = match state.units.get(unit) {
                Some(h) if owner.uid.is_none() => h.owner.clone(),
                _ => owner.clone(),
            };
            state.units.insert(
                *unit,
                Held {
                    owner: holder,
                    pending_since: None,
                },
            );
        }
        Ok(())
    }

    /// Release `units` under `key`.
    ///
    /// Free units and units held by a different owner are skipped unless
    /// `force` is set. Returns the units actually released.
    pub fn release(&self, key: &str, owner: &Owner, units: &[u16], force: bool) -> Vec<u16> {
        let Some(slot) = self.existing_slot(key) else {
            return Vec::new();
        };
        let mut state = lock(&*slot);
        let mut released = Vec::new();
        for unit in units {
            let releasable = state
                .units
                .get(unit)
                .is_some_and(|h| force || owner.matches(&h.owner));
            if releasable {
                state.units.remove(unit);
                released.push(*unit);
            }
        }
        released
    }

    /// Release everything held by the owner's pod name under any key.
    ///
    /// Without `force` a holder with a different known UID is left alone.
    pub fn release_owner(&self, owner: &Owner, force: bool) -> Vec<(String, Vec<u16>)> {
        let mut released = Vec::new();
        for (key, slot) in self.slots() {
            let mut state = lock(&*slot);
            let units: Vec<u16> = state
                .units
                .iter()
                .filter(|(_, h)| h.owner.same_pod(owner) && (force || owner.matches(&h.owner)))
                .map(|(u, _)| *u)
                .collect();
            if units.is_empty() {
                continue;
            }
            for unit in &units {
                state.units.remove(unit);
            }
            released.push((key, units));
        }
        released
    }

    /// First key (by name) under which the owner's pod name holds units.
    pub fn held_by(&self, owner: &Owner) -> Option<(String, Vec<u16>)> {
        self.slots().into_iter().find_map(|(key, slot)| {
            let units = lock(&*slot).held_by(owner);
            (!units.is_empty()).then_some((key, units))
        })
    }

    /// Snapshot of the units held under `key`.
    pub fn allocated(&self, key: &str) -> BTreeMap<u16, Owner> {
        self.existing_slot(key)
            .map(|slot| {
                lock(&*slot)
                    .units
                    .iter()
                    .map(|(u, h)| (*u, h.owner.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Free units under `key`.
    pub fn free_count(&self, key: &str) -> usize {
        let taken = self.allocated(key);
        self.range.iter().filter(|p| !taken.contains_key(p)).count()
    }

    /// Replace the state of one key with observed records.
    ///
    /// Observed records are confirmed. Unconfirmed allocations missing from
    /// the observation survive while younger than the grace period. When two
    /// pods are observed on the same unit the first one wins and the second
    /// is reported as a conflict.
    pub fn reconcile(
        &self,
        key: &str,
        observed: impl IntoIterator<Item = (u16, Owner)>,
    ) -> ReconcileSummary {
        let slot = self.slot(key);
        let mut state = lock(&*slot);
        let mut summary = ReconcileSummary::default();
        let mut next: BTreeMap<u16, Held> = BTreeMap::new();

        for (unit, owner) in observed {
            match next.get(&unit) {
                Some(existing) if !existing.owner.same_pod(&owner) => {
                    summary.conflicts.push(AllocationRecord {
                        key: key.to_string(),
                        unit,
                        owner,
                    });
                }
                Some(_) => {}
                None => {
                    summary.records += 1;
                    next.insert(
                        unit,
                        Held {
                            owner,
                            pending_since: None,
                        },
                    );
                }
            }
        }

        for (unit, held) in &state.units {
            let fresh = held
                .pending_since
                .is_some_and(|since| since.elapsed() < self.grace);
            if fresh && !next.contains_key(unit) {
                summary.retained += 1;
                next.insert(*unit, held.clone());
            }
        }

        state.units = next;
        summary
    }

    /// Rebuild every key from a full observation. Keys absent from it are emptied
    /// (apart from unconfirmed allocations still within the grace period).
    pub fn rebuild(&self, records: impl IntoIterator<Item = AllocationRecord>) -> ReconcileSummary {
        let mut grouped: BTreeMap<String, Vec<(u16, Owner)>> = BTreeMap::new();
        for record in records {
            grouped
                .entry(record.key)
                .or_default()
                .push((record.unit, record.owner));
        }
        for (key, _) in self.slots() {
            grouped.entry(key).or_default();
        }

        let mut summary = ReconcileSummary::default();
        for (key, observed) in grouped {
            summary.merge(self.reconcile(&key, observed));
        }
        summary
    }
}
