//! Deploy Worker Library
//!
//! Builds a project's source checkout, streams the build output to
//! subscribers and uploads the build artifacts to object storage.

pub mod app;
pub mod artifacts;
pub mod deploy;
pub mod errors;
pub mod logs;
pub mod models;
pub mod mqtt;
pub mod publish;
pub mod utils;
