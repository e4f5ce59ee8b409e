//! Error taxonomy for builds, launches, and probes.
//!
//! Build errors abort image construction with nothing published. Launch errors
//! are fatal to the instance being started. Failed probe checks are outcomes
//! handled by the health monitor, not errors; `ProbeError` only covers failures
//! to construct the probing client itself.

use std::io;
use std::path::PathBuf;

/// A build step failed. The build aborts and no image is published.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("OS package installation failed: {0}")]
    PackageInstall(String),

    #[error("Dependency installation failed: {0}")]
    DependencyInstall(String),

    #[error("Dependency manifest not found: {0}")]
    MissingManifest(PathBuf),

    #[error("Build context not found: {0}")]
    MissingContext(PathBuf),

    #[error("Runtime identity creation failed: {0}")]
    Identity(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Image store error: {0}")]
    Store(#[from] crate::image::StoreError),
}

/// Starting an instance failed before or immediately after process launch.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Refusing to launch as the privileged identity (uid 0)")]
    PrivilegedIdentity,

    #[error("Image manifest declares no startup command")]
    EmptyCommand,

    #[error("Failed to spawn service process: {0}")]
    Spawn(io::Error),

    #[error("Service process exited during startup with {0}")]
    ExitedEarly(std::process::ExitStatus),

    #[error("Image store error: {0}")]
    Store(#[from] crate::image::StoreError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// The probing client could not be constructed. Distinct from a failed
/// check, which is a `ProbeOutcome` observed by the health monitor.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Invalid probe target {url}: {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("Failed to build probe client: {0}")]
    Client(#[from] reqwest::Error),
}
