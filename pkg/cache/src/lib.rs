pub mod encoding;
pub mod response;
