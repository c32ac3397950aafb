pub mod client;
pub mod discovery;
pub mod dispatcher;
pub mod queue;
pub mod receiver;
