//! A3S Relay Runtime - artifact replication between OCI stores.
//!
//! This module provides the content stores (memory, OCI layout, remote
//! registry), the graph replication engine, and the copy and backup
//! orchestrators built on top of them.

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod backup;
pub mod closure;
pub mod copy;
pub mod graph;
pub mod oci;
pub mod status;
pub mod store;
pub mod target;

// Re-export common types
pub use backup::{
    parse_artifacts_to_backup, run_backup, BackupOptions, BackupSummary, OutputFormat,
    TaggedArtifact,
};
pub use closure::{prepare_closure, ReferrerClosure};
pub use copy::{copy_artifact, mount_hint, select_mode, CopyMode, CopyOptions};
pub use graph::{copy_graph, extended_copy_graph, CopyGraphOptions, CopyObserver, PredecessorFinder};
pub use oci::{ArtifactReference, CredentialStore, RegistryAuth, RemoteRepository};
pub use status::{BackupObserver, EventStatus, SilentStatus, StatusTracker, TextStatus};
pub use store::{ContentStore, MemoryStore, OciLayout, StoreKind};
pub use target::{split_destination_tags, Target, TargetOptions};

/// A3S Relay Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
