pub mod arbiter;
pub mod cancellation;
pub mod dispatch;
pub mod lifecycle;
pub mod notify;
pub mod presence;
pub mod reaper;
pub mod state_machine;

#[cfg(test)]
pub(crate) mod testing;
