//! A3S Relay Core - Foundational Types and Abstractions
//!
//! This module provides the content-addressable data model, error taxonomy,
//! configuration and lifecycle events shared by the A3S Relay crates.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod event;

// Re-export commonly used types
pub use config::{LogLevel, RelayConfig, DEFAULT_CONCURRENCY};
pub use descriptor::{Descriptor, ImageIndex, ImageManifest, Platform};
pub use error::{CopyOrigin, RelayError, Result};
pub use event::{EventEmitter, RelayEvent};

/// A3S Relay version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
