pub mod clock;
pub mod events;
pub mod lease;
pub mod rate;
pub mod recent;
pub mod registry;
