//! Inspection tool for keystone databases.
//!
//! Opens a database location through [`keystone_db::DatabaseContext`],
//! reports the engine version, the statement limits that drive key batching,
//! and pool occupancy, and optionally runs a batched lookup described in the
//! configuration file.

pub mod config;
pub mod report;

pub use config::{config_path, load_config, Config, ConfigError, ConfigSource};
pub use report::{inspect, InspectError, Report};
