use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::models::ride::Ride;

/// Authoritative table of in-flight rides plus the rider-active-ride index.
#[derive(Default)]
pub struct RideStore {
    rides: DashMap<Uuid, Ride>,
    rider_index: DashMap<String, Uuid>,
    cancelled: DashMap<Uuid, DateTime<Utc>>,
}

impl RideStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ride_id: &Uuid) -> Option<Ride> {
        self.rides.get(ride_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, ride_id: &Uuid) -> bool {
        self.rides.contains_key(ride_id)
    }

    pub fn len(&self) -> usize {
        self.rides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rides.is_empty()
    }

    /// Runs `f` against the stored ride while holding its shard lock.
    ///
    /// `f` must not block or call back into the store.
    pub fn update<T>(&self, ride_id: &Uuid, f: impl FnOnce(&mut Ride) -> T) -> Option<T> {
        self.rides.get_mut(ride_id).map(|mut entry| f(entry.value_mut()))
    }

    pub fn snapshot(&self) -> Vec<Ride> {
        self.rides.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn find(&self, predicate: impl Fn(&Ride) -> bool) -> Vec<Ride> {
        self.rides
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Open ride currently assigned to `driver_id`, if any.
    pub fn active_ride_for_driver(&self, driver_id: &str) -> Option<Ride> {
        self.rides
            .iter()
            .find(|entry| {
                let ride = entry.value();
                ride.state.is_assigned() && ride.is_assigned_to(driver_id)
            })
            .map(|entry| entry.value().clone())
    }

    pub fn driver_has_open_ride(&self, driver_id: &str, except: Option<Uuid>) -> bool {
        self.rides.iter().any(|entry| {
            let ride = entry.value();
            Some(ride.id) != except && ride.state.is_assigned() && ride.is_assigned_to(driver_id)
        })
    }

    /// Stores a new ride and binds it as the rider's single open ride.
    ///
    /// Fails with the existing ride when the rider already has an open one,
    /// in which case nothing is stored. Index entries pointing at a missing
    /// or terminal ride are replaced. The index entry stays locked while the
    /// ride is inserted (index before ride table, the same order the
    /// reaper uses), so two requests from one rider cannot both pass.
    pub fn insert_for_rider(&self, ride: Ride) -> Result<(), Ride> {
        let ride_id = ride.id;
        match self.rider_index.entry(ride.rider_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = self
                    .get(occupied.get())
                    .filter(|existing| !existing.state.is_terminal());
                if let Some(existing) = existing {
                    return Err(existing);
                }
                self.rides.insert(ride_id, ride);
                occupied.insert(ride_id);
            }
            Entry::Vacant(vacant) => {
                self.rides.insert(ride_id, ride);
                vacant.insert(ride_id);
            }
        }
        Ok(())
    }

    pub fn rider_ride(&self, rider_id: &str) -> Option<Uuid> {
        self.rider_index.get(rider_id).map(|entry| *entry.value())
    }

    pub fn release_rider(&self, rider_id: &str, ride_id: &Uuid) {
        self.rider_index
            .remove_if(rider_id, |_, indexed| indexed == ride_id);
    }

    /// Drops index entries whose ride is gone or already terminal.
    pub fn drop_dangling_rider_entries(&self) -> usize {
        let before = self.rider_index.len();
        self.rider_index.retain(|_, ride_id| {
            self.rides
                .get(ride_id)
                .is_some_and(|ride| !ride.state.is_terminal())
        });
        before.saturating_sub(self.rider_index.len())
    }

    /// Removes the ride and its rider index entry. Unknown ids are a no-op.
    pub fn purge(&self, ride_id: &Uuid) -> Option<Ride> {
        let (_, ride) = self.rides.remove(ride_id)?;
        self.release_rider(&ride.rider_id, ride_id);
        Some(ride)
    }

    pub fn remember_cancelled(&self, ride_id: Uuid, at: DateTime<Utc>) {
        self.cancelled.insert(ride_id, at);
    }

    pub fn was_cancelled(&self, ride_id: &Uuid) -> bool {
        self.cancelled.contains_key(ride_id)
    }

    /// Drops cancelled-ride records older than `cutoff`, returning how many went.
    pub fn forget_cancelled_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.cancelled.len();
        self.cancelled.retain(|_, at| *at >= cutoff);
        before.saturating_sub(self.cancelled.len())
    }
}
