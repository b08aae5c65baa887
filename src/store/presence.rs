use chrono::Utc;
use dashmap::DashMap;

use crate::models::presence::{Availability, DriverPresence, GeoPoint, RiderPresence};

/// Connected drivers and riders. An absent record means offline.
#[derive(Default)]
pub struct PresenceRegistry {
    drivers: DashMap<String, DriverPresence>,
    riders: DashMap<String, RiderPresence>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_driver(&self, driver_id: &str, connection_id: &str, availability: Availability) {
        let location = self
            .drivers
            .get(driver_id)
            .and_then(|existing| existing.location);

        self.drivers.insert(
            driver_id.to_string(),
            DriverPresence {
                driver_id: driver_id.to_string(),
                availability,
                last_seen: Utc::now(),
                location,
                connection_id: connection_id.to_string(),
            },
        );
    }

    /// Removes the record only if it still belongs to `connection_id`, so a
    /// late close from a replaced connection does not take a driver offline.
    pub fn disconnect_driver(&self, driver_id: &str, connection_id: &str) -> bool {
        self.drivers
            .remove_if(driver_id, |_, presence| presence.connection_id == connection_id)
            .is_some()
    }

    pub fn driver(&self, driver_id: &str) -> Option<DriverPresence> {
        self.drivers.get(driver_id).map(|entry| entry.value().clone())
    }

    pub fn driver_availability(&self, driver_id: &str) -> Option<Availability> {
        self.drivers.get(driver_id).map(|entry| entry.availability)
    }

    /// Returns false when the driver is not connected.
    pub fn set_driver_availability(&self, driver_id: &str, availability: Availability) -> bool {
        match self.drivers.get_mut(driver_id) {
            Some(mut presence) => {
                presence.availability = availability;
                presence.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn update_driver_location(&self, driver_id: &str, location: GeoPoint) -> bool {
        match self.drivers.get_mut(driver_id) {
            Some(mut presence) => {
                presence.location = Some(location);
                presence.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn drivers_with(&self, availability: Availability) -> Vec<String> {
        self.drivers
            .iter()
            .filter(|entry| entry.availability == availability)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn driver_count(&self) -> usize {
        self.drivers.len()
    }

    pub fn connect_rider(&self, rider_id: &str, connection_id: &str) {
        self.riders.insert(
            rider_id.to_string(),
            RiderPresence {
                rider_id: rider_id.to_string(),
                availability: Availability::Online,
                last_seen: Utc::now(),
                connection_id: connection_id.to_string(),
            },
        );
    }

    pub fn disconnect_rider(&self, rider_id: &str, connection_id: &str) -> bool {
        self.riders
            .remove_if(rider_id, |_, presence| presence.connection_id == connection_id)
            .is_some()
    }

    pub fn touch_rider(&self, rider_id: &str) {
        if let Some(mut presence) = self.riders.get_mut(rider_id) {
            presence.last_seen = Utc::now();
        }
    }

    pub fn rider_connected(&self, rider_id: &str) -> bool {
        self.riders.contains_key(rider_id)
    }

    pub fn rider_count(&self) -> usize {
        self.riders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::PresenceRegistry;
    use crate::models::presence::{Availability, GeoPoint};

    #[test]
    fn stale_disconnect_keeps_newer_connection() {
        let registry = PresenceRegistry::new();
        registry.connect_driver("d1", "conn-a", Availability::Online);
        registry.connect_driver("d1", "conn-b", Availability::Online);

        assert!(!registry.disconnect_driver("d1", "conn-a"));
        assert!(registry.driver("d1").is_some());
        assert!(registry.disconnect_driver("d1", "conn-b"));
        assert!(registry.driver("d1").is_none());
    }

    #[test]
    fn reconnect_preserves_last_location() {
        let registry = PresenceRegistry::new();
        registry.connect_driver("d1", "conn-a", Availability::Online);
        registry.update_driver_location(
            "d1",
            GeoPoint {
                latitude: 17.44,
                longitude: 78.35,
            },
        );
        registry.connect_driver("d1", "conn-b", Availability::Busy);

        let presence = registry.driver("d1").unwrap();
        assert_eq!(presence.availability, Availability::Busy);
        assert_eq!(presence.location.map(|p| p.latitude), Some(17.44));
    }

    #[test]
    fn drivers_with_filters_by_availability() {
        let registry = PresenceRegistry::new();
        registry.connect_driver("d1", "c1", Availability::Online);
        registry.connect_driver("d2", "c2", Availability::Busy);

        assert_eq!(registry.drivers_with(Availability::Online), vec!["d1".to_string()]);
        assert!(!registry.set_driver_availability("ghost", Availability::Busy));
    }
}
