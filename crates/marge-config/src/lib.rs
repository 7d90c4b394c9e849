//! Configuration for the marge merge-bot
//!
//! Defaults, the TOML config-file layer, and the merge with CLI/env
//! overrides. The binary owns the clap surface; this crate owns the
//! semantics.

pub mod app_config;
pub mod duration;

pub use app_config::{BotConfig, CandidateOrder, ConfigFile, Overrides};
pub use duration::{format_duration, parse_duration};
