//! Fleetmon Agent - fleet monitoring agent for managed lab machines
//!
//! The agent runs unattended on every machine of the fleet:
//! - Hardware and software inventory registered at startup
//! - Periodic telemetry reporting (CPU, RAM, disk, temperature, idle time)
//! - Remote directives carried back on report replies
//! - Curfew shutdown for machines left on and idle after hours
//! - Self-update from the fleet server

pub mod config;
pub mod context;
pub mod discovery;
pub mod execution;
pub mod identity;
pub mod inventory;
pub mod maintenance;
pub mod metrics;
pub mod netwatch;
pub mod power;
pub mod process;
pub mod reporting;
pub mod tasks;
pub mod updater;
