//! Command-line interface for queue-director.
//!
//! Provides commands for running a director against Redis, seeding demo
//! items and inspecting the store.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, run_action, seed_items, ActionPayload};
