//! Strata - daemon-less container image builder for JVM applications.
//!
//! Strata assembles an OCI / Docker v2 image from an application's class
//! files, resources, and dependencies, and publishes it straight to a
//! container registry (or a local daemon, or a tar file) without invoking
//! `docker build`.
//!
//! # Architecture
//!
//! ```text
//! BuildPlan ──► build engine (step DAG, bounded parallelism)
//!                 ├─ registry client   (auth, manifests, blobs, mounts)
//!                 ├─ layer cache       (content-addressed, on disk)
//!                 ├─ layer builder     (reproducible tar + dual digest)
//!                 ├─ credential chain  (helpers, Docker config, keychain)
//!                 └─ image model       (config + manifest serialization)
//! ```
//!
//! The entry point is [`build::build`] with a frozen [`build::BuildPlan`];
//! everything upstream of the plan (CLI parsing, project discovery,
//! framework packaging) lives in front-end crates.

pub mod blob;
pub mod build;
pub mod cache;
pub mod credentials;
pub mod export;
pub mod image;
pub mod reference;
pub mod registry;

// Re-export commonly used types
pub use blob::{BlobDescriptor, Digest};
pub use build::{build, BuildOutcome, BuildPlan, FileEntry, LayerSpec, OutputTarget};
pub use credentials::{Credential, CredentialResolver};
pub use image::{Platform, TargetFormat};
pub use reference::ImageReference;
pub use strata_core::error::{Result, StrataError};
