//! Periodic sweep that repairs drift left by timers or crashed handlers.
//!
//! Each sub-sweep is independent and a no-op when there is nothing to fix.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::cancellation::finish_cancelled;
use crate::engine::dispatch::expire_if_searching;
use crate::engine::lifecycle::finish_completed;
use crate::engine::state_machine::{self, TransitionPatch};
use crate::models::presence::Availability;
use crate::models::ride::{Cancellation, Ride, RideState, Role};
use crate::state::AppState;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub released_locks: usize,
    pub expired_rides: usize,
    pub force_completed: usize,
    pub abandoned_rides: usize,
    pub dropped_rider_entries: usize,
    pub reset_drivers: usize,
    pub dropped_offer_entries: usize,
    pub forgotten_cancellations: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn sweep(state: &AppState, now: DateTime<Utc>) -> SweepReport {
    let timeouts = state.timeouts;
    let mut report = SweepReport::default();

    for ride_id in state.locks.release_stale(cutoff(now, timeouts.lock_stale)) {
        warn!(ride_id = %ride_id, "released stale ride lock");
        report.released_locks += 1;
    }

    let stale_search = cutoff(now, timeouts.stale_search);
    for ride in state
        .rides
        .find(|ride| ride.state == RideState::Searching && ride.created_at < stale_search)
    {
        if expire_if_searching(state, ride.id) {
            report.expired_rides += 1;
        }
    }

    let stuck = cutoff(now, timeouts.stuck_accepted);
    for ride in state
        .rides
        .find(|ride| ride.state == RideState::Accepted && ride.updated_at < stuck)
    {
        // Skip rides a handler is working on right now.
        let Some(_guard) = state.locks.try_acquire(ride.id) else {
            continue;
        };
        let forced = state_machine::transition_if(
            state,
            ride.id,
            &[RideState::Accepted],
            RideState::Completed,
            TransitionPatch::default(),
        );
        if let Ok(done) = forced {
            warn!(ride_id = %ride.id, driver_id = ?done.ride.driver_id, "force-completed stuck ride");
            finish_completed(state, &done.ride, true);
            report.force_completed += 1;
        }
    }

    for ride in state.rides.find(|ride| {
        matches!(ride.state, RideState::Arrived | RideState::Started) && ride.updated_at < stuck
    }) {
        let driver_gone = ride
            .driver_id
            .as_deref()
            .is_none_or(|driver_id| state.presence.driver(driver_id).is_none());
        if !driver_gone {
            continue;
        }
        let Some(_guard) = state.locks.try_acquire(ride.id) else {
            continue;
        };
        if close_abandoned(state, &ride, now) {
            report.abandoned_rides += 1;
        }
    }

    report.dropped_rider_entries = state.rides.drop_dangling_rider_entries();

    for driver_id in state.presence.drivers_with(Availability::Busy) {
        if state.rides.driver_has_open_ride(&driver_id, None) {
            continue;
        }
        state
            .presence
            .set_driver_availability(&driver_id, Availability::Online);
        // An accept may have landed between the check and the reset.
        if state.rides.driver_has_open_ride(&driver_id, None) {
            state
                .presence
                .set_driver_availability(&driver_id, Availability::Busy);
            continue;
        }
        info!(driver_id, "reset busy driver with no open ride");
        report.reset_drivers += 1;
    }

    for ride_id in state.offers.tracked_rides() {
        let searching = state
            .rides
            .get(&ride_id)
            .is_some_and(|ride| ride.state == RideState::Searching);
        if !searching {
            state.offers.clear(&ride_id);
            report.dropped_offer_entries += 1;
        }
    }

    report.forgotten_cancellations = state
        .rides
        .forget_cancelled_before(cutoff(now, timeouts.cancelled_retention));

    record(state, &report);
    report
}

/// Closes an ARRIVED or STARTED ride whose driver has dropped off. A trip
/// in progress is completed; a pickup that never happened is cancelled
/// without a fee.
fn close_abandoned(state: &AppState, ride: &Ride, now: DateTime<Utc>) -> bool {
    match ride.state {
        RideState::Started => {
            let Ok(done) = state_machine::transition_if(
                state,
                ride.id,
                &[RideState::Started],
                RideState::Completed,
                TransitionPatch::default(),
            ) else {
                return false;
            };
            warn!(ride_id = %ride.id, driver_id = ?ride.driver_id, "completed ride abandoned by driver");
            finish_completed(state, &done.ride, true);
            true
        }
        RideState::Arrived => {
            let cancellation = Cancellation {
                cancelled_by: Role::Driver,
                reason: Some("driver disconnected".to_string()),
                fee: 0.0,
                cancelled_at: now,
            };
            let Ok(done) = state_machine::transition_if(
                state,
                ride.id,
                &[RideState::Arrived],
                RideState::Cancelled,
                TransitionPatch {
                    cancellation: Some(cancellation.clone()),
                    ..Default::default()
                },
            ) else {
                return false;
            };
            warn!(ride_id = %ride.id, driver_id = ?ride.driver_id, "cancelled pickup abandoned by driver");
            finish_cancelled(state, &done.ride, RideState::Arrived, &cancellation, Vec::new());
            true
        }
        _ => false,
    }
}

fn record(state: &AppState, report: &SweepReport) {
    let counts = [
        ("release_lock", report.released_locks),
        ("expire_ride", report.expired_rides),
        ("force_complete", report.force_completed),
        ("close_abandoned", report.abandoned_rides),
        ("drop_rider_entry", report.dropped_rider_entries),
        ("reset_driver", report.reset_drivers),
        ("drop_offer_entry", report.dropped_offer_entries),
        ("forget_cancellation", report.forgotten_cancellations),
    ];
    for (action, count) in counts {
        if count > 0 {
            state
                .metrics
                .reaper_actions_total
                .with_label_values(&[action])
                .inc_by(count as u64);
        }
    }
}

/// Runs [`sweep`] on the configured interval until `cancel` fires.
pub async fn run_reaper(state: Arc<AppState>, cancel: CancellationToken) {
    let period = state.timeouts.reaper_interval;
    info!(interval_secs = period.as_secs(), "reaper started");

    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("reaper stopping");
                break;
            }
            _ = interval.tick() => {
                let report = sweep(&state, Utc::now());
                if report.is_empty() {
                    debug!("reaper sweep: nothing to repair");
                } else {
                    info!(?report, "reaper sweep repaired state");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::sweep;
    use crate::engine::testing::{
        accepted_ride, connect_driver, connect_rider, move_to, searching_ride, test_state,
    };
    use crate::models::presence::Availability;
    use crate::models::ride::RideState;

    #[test]
    fn quiet_state_needs_no_repairs() {
        let state = test_state();
        searching_ride(&state, "rider-1");
        assert!(sweep(&state, Utc::now()).is_empty());
    }

    #[test]
    fn expires_rides_searching_too_long() {
        let state = test_state();
        let ride = searching_ride(&state, "rider-1");
        let mut rider = connect_rider(&state, "rider-1");

        let report = sweep(&state, Utc::now() + Duration::minutes(6));
        assert_eq!(report.expired_rides, 1);
        assert!(state.rides.get(&ride.id).is_none());
        assert_eq!(rider.payloads("ride_expired").len(), 1);
    }

    #[test]
    fn force_completes_stuck_accepted_rides() {
        let state = test_state();
        let ride = accepted_ride(&state, "rider-1", "d1");
        let mut driver = connect_driver(&state, "d1");

        let report = sweep(&state, Utc::now() + Duration::minutes(11));
        assert_eq!(report.force_completed, 1);
        assert!(state.rides.get(&ride.id).is_none());
        assert_eq!(state.presence.driver_availability("d1"), Some(Availability::Online));
        assert_eq!(driver.payloads("ride_completed")[0]["forced"], true);
    }

    #[test]
    fn closes_rides_abandoned_after_pickup() {
        let state = test_state();
        let waiting = accepted_ride(&state, "rider-1", "d1");
        move_to(&state, waiting.id, RideState::Arrived);
        let riding = accepted_ride(&state, "rider-2", "d2");
        move_to(&state, riding.id, RideState::Started);
        let mut first = connect_rider(&state, "rider-1");
        let mut second = connect_rider(&state, "rider-2");

        let report = sweep(&state, Utc::now() + Duration::minutes(11));
        assert_eq!(report.abandoned_rides, 2);
        assert!(state.rides.get(&waiting.id).is_none());
        assert!(state.rides.get(&riding.id).is_none());
        assert!(state.rides.rider_ride("rider-1").is_none());
        assert!(state.rides.was_cancelled(&waiting.id));

        let cancelled = first.payloads("ride_cancelled");
        assert_eq!(cancelled[0]["fee"], 0.0);
        assert_eq!(cancelled[0]["previousStatus"], "arrived");
        assert_eq!(second.payloads("ride_completed")[0]["forced"], true);
    }

    #[test]
    fn keeps_started_ride_while_driver_is_connected() {
        let state = test_state();
        let ride = accepted_ride(&state, "rider-1", "d1");
        move_to(&state, ride.id, RideState::Started);
        let _driver = connect_driver(&state, "d1");

        let report = sweep(&state, Utc::now() + Duration::minutes(11));
        assert_eq!(report.abandoned_rides, 0);
        assert_eq!(state.rides.get(&ride.id).unwrap().state, RideState::Started);
    }

    #[test]
    fn releases_stale_locks() {
        let state = test_state();
        let ride = searching_ride(&state, "rider-1");
        let leaked = state.locks.try_acquire(ride.id).unwrap();
        std::mem::forget(leaked);

        let report = sweep(&state, Utc::now() + Duration::seconds(31));
        assert_eq!(report.released_locks, 1);
        assert!(!state.locks.is_locked(&ride.id));
    }

    #[test]
    fn resets_busy_driver_without_ride() {
        let state = test_state();
        let _driver = connect_driver(&state, "d1");
        state.presence.set_driver_availability("d1", Availability::Busy);

        let report = sweep(&state, Utc::now());
        assert_eq!(report.reset_drivers, 1);
        assert_eq!(state.presence.driver_availability("d1"), Some(Availability::Online));
    }

    #[test]
    fn keeps_busy_driver_with_open_ride() {
        let state = test_state();
        accepted_ride(&state, "rider-1", "d1");
        let _driver = connect_driver(&state, "d1");

        let report = sweep(&state, Utc::now());
        assert_eq!(report.reset_drivers, 0);
        assert_eq!(state.presence.driver_availability("d1"), Some(Availability::Busy));
    }

    #[test]
    fn drops_orphaned_tracking() {
        let state = test_state();
        let ride = searching_ride(&state, "rider-1");
        state.rides.update(&ride.id, |r| r.state = RideState::Expired);
        state.offers.record_recipients(Uuid::new_v4(), &["d1".to_string()]);
        state.offers.record_recipients(ride.id, &["d1".to_string()]);

        let report = sweep(&state, Utc::now());
        assert_eq!(report.dropped_rider_entries, 1);
        assert_eq!(report.dropped_offer_entries, 2);
        assert!(state.offers.tracked_rides().is_empty());
    }

    #[test]
    fn forgets_old_cancellations() {
        let state = test_state();
        state
            .rides
            .remember_cancelled(Uuid::new_v4(), Utc::now() - Duration::minutes(10));

        assert_eq!(sweep(&state, Utc::now()).forgotten_cancellations, 1);
    }
}
