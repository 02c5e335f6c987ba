//! Publishing build logs and deployment status to subscribers

pub mod channel;
pub mod memory;
pub mod publisher;
