use std::sync::Arc;

use crate::api::ws::hub::ConnectionHub;
use crate::config::{Config, DispatchTimeouts, FeeSchedule};
use crate::engine::notify::Notifier;
use crate::observability::metrics::Metrics;
use crate::store::{LockTable, OfferBook, PresenceRegistry, RideStore};

pub struct AppState {
    pub rides: RideStore,
    pub presence: PresenceRegistry,
    pub offers: OfferBook,
    pub locks: LockTable,
    pub timeouts: DispatchTimeouts,
    pub fees: FeeSchedule,
    pub hub: Arc<ConnectionHub>,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        let hub = Arc::new(ConnectionHub::new());

        Self {
            rides: RideStore::new(),
            presence: PresenceRegistry::new(),
            offers: OfferBook::new(),
            locks: LockTable::new(),
            timeouts: config.timeouts,
            fees: config.fees,
            notifier: hub.clone(),
            hub,
            metrics: Metrics::new(),
        }
    }
}
