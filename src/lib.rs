pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod session;
pub mod test_util;
pub mod wire;
