pub mod apps;
pub mod peer;
pub mod query;
pub mod status;
pub mod watch;
