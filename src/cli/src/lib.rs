//! A3S Relay CLI - copy and back up OCI artifacts between registries and layouts.

pub mod commands;
pub mod errors;
pub mod output;
