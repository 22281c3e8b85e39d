//! Build plan types and the build entry point.
//!
//! The plan is a frozen record produced by whatever front-end resolved the
//! project (plugin, CLI, API caller). The engine consumes it verbatim; no
//! discovery or heuristics happen past this point.

pub mod engine;
pub mod layer;
pub mod progress;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::credentials::Credential;
use crate::image::config::Port;
use crate::image::{Platform, TargetFormat};
use crate::reference::ImageReference;

pub use engine::{build, build_with_cancel, cancellation, BuildOutcome, CancelHandle, CancelSignal};

/// Default file permissions when the plan does not specify them.
pub const DEFAULT_FILE_PERMISSIONS: u32 = 0o644;
/// Default directory permissions when the plan does not specify them.
pub const DEFAULT_DIRECTORY_PERMISSIONS: u32 = 0o755;
/// Default layer-entry modification time: one second after the epoch.
/// (Some tooling treats an exact zero mtime as "missing".)
pub const DEFAULT_MODIFIED_TIME: i64 = 1;

/// One source file or directory to place into the container filesystem.
///
/// A directory entry adds only the directory itself; contents must arrive as
/// separate entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path on the host.
    pub source: PathBuf,
    /// Absolute POSIX path in the container.
    pub extraction_path: String,
    /// Mode bits; `None` uses 0644 for files, 0755 for directories.
    pub permissions: Option<u32>,
    /// Seconds since the epoch; `None` uses epoch + 1 s.
    pub modified_time: Option<i64>,
}

impl FileEntry {
    pub fn new(source: impl Into<PathBuf>, extraction_path: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            extraction_path: extraction_path.into(),
            permissions: None,
            modified_time: None,
        }
    }

    pub fn with_permissions(mut self, permissions: u32) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn with_modified_time(mut self, seconds_since_epoch: i64) -> Self {
        self.modified_time = Some(seconds_since_epoch);
        self
    }

    pub fn effective_modified_time(&self) -> i64 {
        self.modified_time.unwrap_or(DEFAULT_MODIFIED_TIME)
    }

    pub fn effective_permissions(&self, is_directory: bool) -> u32 {
        self.permissions.unwrap_or(if is_directory {
            DEFAULT_DIRECTORY_PERMISSIONS
        } else {
            DEFAULT_FILE_PERMISSIONS
        })
    }
}

/// An ordered group of entries that becomes one application layer.
#[derive(Debug, Clone, Default)]
pub struct LayerSpec {
    /// Human-readable name ("dependencies", "classes", ...); log-only.
    pub name: String,
    pub entries: Vec<FileEntry>,
}

impl LayerSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn add(mut self, entry: FileEntry) -> Self {
        self.entries.push(entry);
        self
    }
}

/// Container configuration carried by the plan.
///
/// Fields left unset inherit from the base image config.
#[derive(Debug, Clone, Default)]
pub struct ContainerSettings {
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    /// Ordered `KEY=value` pairs appended after the base image's.
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub exposed_ports: Vec<Port>,
    pub volumes: Vec<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    /// Image creation time. `None` means the Unix epoch, which keeps builds
    /// reproducible.
    pub creation_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// Where the built image goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Push to the target registry.
    Registry,
    /// Stream a `docker save`-style tar into `docker load`.
    DockerDaemon,
    /// Write the same tar to a file.
    TarFile(PathBuf),
}

/// The frozen input to a build.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub base_image: ImageReference,
    pub target_image: ImageReference,
    /// Extra tags pushed after the primary one; layer/config pushes are not
    /// repeated for them.
    pub additional_tags: Vec<String>,
    pub layers: Vec<LayerSpec>,
    pub container: ContainerSettings,
    pub platform: Platform,
    pub format: TargetFormat,
    pub output: OutputTarget,

    /// Resolve everything from cache; any network need fails the build.
    pub offline: bool,
    /// Permit plain-HTTP / invalid-certificate registries.
    pub allow_insecure: bool,
    /// Maximum steps running at once.
    pub concurrency: usize,
    /// Per-HTTP-call timeout.
    pub http_timeout: Duration,
    /// Overall wall-clock budget for the build, including retries.
    pub deadline: Option<Duration>,
    /// Layer cache root; `None` uses the shared user cache directory.
    /// Front-ends that want a per-project cache pass a path under the
    /// project's build directory.
    pub cache_dir: Option<PathBuf>,

    pub base_credential: Option<Credential>,
    pub target_credential: Option<Credential>,
    /// Name suffix of a `docker-credential-<name>` helper to consult.
    pub credential_helper: Option<String>,
}

impl BuildPlan {
    pub fn new(base_image: ImageReference, target_image: ImageReference) -> Self {
        Self {
            base_image,
            target_image,
            additional_tags: Vec::new(),
            layers: Vec::new(),
            container: ContainerSettings::default(),
            platform: Platform::linux_amd64(),
            format: TargetFormat::Docker,
            output: OutputTarget::Registry,
            offline: false,
            allow_insecure: false,
            concurrency: 4,
            http_timeout: Duration::from_secs(20),
            deadline: None,
            cache_dir: None,
            base_credential: None,
            target_credential: None,
            credential_helper: None,
        }
    }
}
