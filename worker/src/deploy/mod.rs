//! Deployment module

pub mod fsm;
pub mod pipeline;
pub mod runner;
