pub mod presence;
pub mod ride;
