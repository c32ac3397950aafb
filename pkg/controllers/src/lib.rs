pub mod eviction;
pub mod preservation;
