pub mod handler;
pub mod hub;
pub mod router;

pub use handler::ws_handler;
pub use hub::{ClientIdentity, ClientKind, ConnectionHub};
pub use router::Session;
