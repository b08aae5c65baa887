//! In-memory tables shared by every handler.
//!
//! Each table is a `DashMap`, so single-key reads and writes are atomic.
//! Multi-step decisions that span keys go through the per-ride lock in
//! [`locks::LockTable`] and are re-validated once it is held.

pub mod locks;
pub mod offers;
pub mod presence;
pub mod rides;

pub use locks::{LockTable, RideLockGuard};
pub use offers::OfferBook;
pub use presence::PresenceRegistry;
pub use rides::RideStore;
