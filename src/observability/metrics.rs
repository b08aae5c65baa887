use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub rides_created_total: IntCounter,
    pub ride_transitions_total: IntCounterVec,
    pub accept_attempts_total: IntCounterVec,
    pub reaper_actions_total: IntCounterVec,
    pub active_rides: IntGauge,
    pub connected_drivers: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let rides_created_total =
            IntCounter::new("rides_created_total", "Total ride requests accepted for dispatch")
                .expect("valid rides_created_total metric");

        let ride_transitions_total = IntCounterVec::new(
            Opts::new("ride_transitions_total", "Applied ride state transitions by target state"),
            &["to"],
        )
        .expect("valid ride_transitions_total metric");

        let accept_attempts_total = IntCounterVec::new(
            Opts::new("accept_attempts_total", "Driver accept attempts by outcome"),
            &["outcome"],
        )
        .expect("valid accept_attempts_total metric");

        let reaper_actions_total = IntCounterVec::new(
            Opts::new("reaper_actions_total", "Repairs performed by the reaper"),
            &["action"],
        )
        .expect("valid reaper_actions_total metric");

        let active_rides = IntGauge::new("active_rides", "Rides currently held in memory")
            .expect("valid active_rides metric");

        let connected_drivers = IntGauge::new("connected_drivers", "Drivers with a live session")
            .expect("valid connected_drivers metric");

        registry
            .register(Box::new(rides_created_total.clone()))
            .expect("register rides_created_total");
        registry
            .register(Box::new(ride_transitions_total.clone()))
            .expect("register ride_transitions_total");
        registry
            .register(Box::new(accept_attempts_total.clone()))
            .expect("register accept_attempts_total");
        registry
            .register(Box::new(reaper_actions_total.clone()))
            .expect("register reaper_actions_total");
        registry
            .register(Box::new(active_rides.clone()))
            .expect("register active_rides");
        registry
            .register(Box::new(connected_drivers.clone()))
            .expect("register connected_drivers");

        Self {
            registry,
            rides_created_total,
            ride_transitions_total,
            accept_attempts_total,
            reaper_actions_total,
            active_rides,
            connected_drivers,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
