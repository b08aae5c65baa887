use std::collections::HashSet;

use dashmap::DashMap;
use uuid::Uuid;

/// Per-ride dispatch bookkeeping for SEARCHING rides.
///
/// `recipients` holds drivers the ride was offered to; `responded` holds
/// drivers that rejected or tried to accept it. Neither is a ride state.
#[derive(Default)]
pub struct OfferBook {
    recipients: DashMap<Uuid, HashSet<String>>,
    responded: DashMap<Uuid, HashSet<String>>,
}

impl OfferBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_recipients(&self, ride_id: Uuid, drivers: &[String]) {
        self.recipients
            .entry(ride_id)
            .or_default()
            .extend(drivers.iter().cloned());
    }

    /// Adds `driver_id` to the ride's recipients. Returns false if the driver
    /// was already offered the ride or has already responded to it.
    pub fn offer_to(&self, ride_id: Uuid, driver_id: &str) -> bool {
        let already_responded = self
            .responded
            .get(&ride_id)
            .is_some_and(|drivers| drivers.contains(driver_id));
        if already_responded {
            return false;
        }
        self.recipients
            .entry(ride_id)
            .or_default()
            .insert(driver_id.to_string())
    }

    pub fn was_offered(&self, ride_id: &Uuid, driver_id: &str) -> bool {
        self.recipients
            .get(ride_id)
            .is_some_and(|drivers| drivers.contains(driver_id))
    }

    pub fn recipients(&self, ride_id: &Uuid) -> Vec<String> {
        self.recipients
            .get(ride_id)
            .map(|drivers| drivers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes a rejecting driver, dropping the entry once nobody is left.
    pub fn withdraw(&self, ride_id: Uuid, driver_id: &str) {
        if let Some(mut drivers) = self.recipients.get_mut(&ride_id) {
            drivers.remove(driver_id);
        }
        self.recipients.remove_if(&ride_id, |_, drivers| drivers.is_empty());
    }

    pub fn record_response(&self, ride_id: Uuid, driver_id: &str) {
        self.responded
            .entry(ride_id)
            .or_default()
            .insert(driver_id.to_string());
    }

    pub fn clear(&self, ride_id: &Uuid) {
        self.recipients.remove(ride_id);
        self.responded.remove(ride_id);
    }

    pub fn tracked_rides(&self) -> HashSet<Uuid> {
        self.recipients
            .iter()
            .map(|entry| *entry.key())
            .chain(self.responded.iter().map(|entry| *entry.key()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::OfferBook;

    #[test]
    fn offer_to_is_idempotent() {
        let book = OfferBook::new();
        let ride = Uuid::new_v4();

        assert!(book.offer_to(ride, "d1"));
        assert!(!book.offer_to(ride, "d1"));
        assert!(book.offer_to(ride, "d2"));
    }

    #[test]
    fn withdraw_drops_empty_entry() {
        let book = OfferBook::new();
        let ride = Uuid::new_v4();
        book.record_recipients(ride, &["d1".to_string()]);

        book.withdraw(ride, "d1");
        assert!(book.tracked_rides().is_empty());
    }

    #[test]
    fn responded_driver_is_not_offered_again() {
        let book = OfferBook::new();
        let ride = Uuid::new_v4();
        book.record_recipients(ride, &["d1".to_string()]);
        book.record_response(ride, "d1");
        book.withdraw(ride, "d1");

        assert!(!book.offer_to(ride, "d1"));
    }
}
