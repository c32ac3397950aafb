//! Shared data model for the registry: instance records, application views,
//! replication wire types and the server configuration file.

pub mod application;
pub mod config;
pub mod instance;
pub mod replication;
pub mod validate;
