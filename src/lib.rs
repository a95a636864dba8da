// ABOUTME: Library module for clickhouse-seren-migrator
// ABOUTME: Exports all core functionality for use in binary and tests

pub mod checkpoint;
pub mod clickhouse;
pub mod commands;
pub mod config;
pub mod endpoint;
pub mod filters;
pub mod migration;
pub mod switchover;
pub mod transport;
pub mod unit;
pub mod utils;
