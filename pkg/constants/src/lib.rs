//! Centralized constants for the regis project.
//!
//! All project-wide default values live here.
//! Change a value in one place and it applies everywhere.

pub mod cache;
pub mod lease;
pub mod network;
pub mod registry;
pub mod replication;
