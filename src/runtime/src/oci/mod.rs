//! Remote registry support.
//!
//! - [`ArtifactReference`]: `registry/repository[:tag][@digest]` parsing
//! - [`CredentialStore`] / [`RegistryAuth`]: per-registry credentials
//! - [`RemoteRepository`]: a registry repository as a [`crate::store::ContentStore`]
//! - `referrers`: referrers API queries and the tag schema fallback index

pub mod credentials;
pub mod reference;
mod referrers;
pub mod registry;

pub use credentials::{CredentialStore, RegistryAuth};
pub use reference::{is_valid_tag, ArtifactReference};
pub use registry::{RegistryOptions, RemoteRepository};
