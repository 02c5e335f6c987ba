//! MQTT transport for the log and status channels

pub mod client;
pub mod topics;
