use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    acquired_at: DateTime<Utc>,
    token: Uuid,
}

/// Per-ride serialization tokens for accept and cancel critical sections.
#[derive(Default)]
pub struct LockTable {
    locks: DashMap<Uuid, LockEntry>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-and-set acquisition. `None` means another handler holds the ride.
    pub fn try_acquire(&self, ride_id: Uuid) -> Option<RideLockGuard<'_>> {
        match self.locks.entry(ride_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let token = Uuid::new_v4();
                vacant.insert(LockEntry {
                    acquired_at: Utc::now(),
                    token,
                });
                Some(RideLockGuard {
                    table: self,
                    ride_id,
                    token,
                })
            }
        }
    }

    pub fn is_locked(&self, ride_id: &Uuid) -> bool {
        self.locks.contains_key(ride_id)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Force-clears locks acquired before `cutoff` and returns their rides.
    pub fn release_stale(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        let stale: Vec<Uuid> = self
            .locks
            .iter()
            .filter(|entry| entry.acquired_at < cutoff)
            .map(|entry| *entry.key())
            .collect();

        stale
            .into_iter()
            .filter(|ride_id| {
                self.locks
                    .remove_if(ride_id, |_, entry| entry.acquired_at < cutoff)
                    .is_some()
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, ride_id: &Uuid, acquired_at: DateTime<Utc>) {
        if let Some(mut entry) = self.locks.get_mut(ride_id) {
            entry.acquired_at = acquired_at;
        }
    }
}

/// Held for the duration of a critical section; releases on drop.
///
/// Release is keyed by token so a guard whose lock was force-cleared never
/// removes a lock acquired afterwards by someone else.
pub struct RideLockGuard<'a> {
    table: &'a LockTable,
    ride_id: Uuid,
    token: Uuid,
}

impl RideLockGuard<'_> {
    pub fn ride_id(&self) -> Uuid {
        self.ride_id
    }
}

impl Drop for RideLockGuard<'_> {
    fn drop(&mut self) {
        self.table
            .locks
            .remove_if(&self.ride_id, |_, entry| entry.token == self.token);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::LockTable;

    #[test]
    fn second_acquire_fails_until_release() {
        let table = LockTable::new();
        let ride = Uuid::new_v4();

        let guard = table.try_acquire(ride).unwrap();
        assert!(table.try_acquire(ride).is_none());
        assert!(table.is_locked(&ride));

        drop(guard);
        assert!(!table.is_locked(&ride));
        assert!(table.try_acquire(ride).is_some());
    }

    #[test]
    fn release_stale_clears_only_old_locks() {
        let table = LockTable::new();
        let old = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        let _old_guard = table.try_acquire(old).unwrap();
        let _fresh_guard = table.try_acquire(fresh).unwrap();
        table.backdate(&old, Utc::now() - Duration::seconds(45));

        let released = table.release_stale(Utc::now() - Duration::seconds(30));
        assert_eq!(released, vec![old]);
        assert!(table.is_locked(&fresh));
    }

    #[test]
    fn force_cleared_guard_does_not_release_new_holder() {
        let table = LockTable::new();
        let ride = Uuid::new_v4();
        let stale_guard = table.try_acquire(ride).unwrap();
        table.backdate(&ride, Utc::now() - Duration::seconds(60));
        table.release_stale(Utc::now() - Duration::seconds(30));

        let _current = table.try_acquire(ride).unwrap();
        drop(stale_guard);
        assert!(table.is_locked(&ride));
    }
}
