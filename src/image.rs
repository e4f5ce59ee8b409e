//! Image manifests and the on-disk image store.
//!
//! An image is a rootfs directory plus a `manifest.json` describing how to run
//! it: base reference, working directory, exposed port, runtime identity,
//! startup command, and health-check timing. Images are addressed by a sha-256
//! content digest. Builds assemble an image under `staging/` and publication is
//! a single directory rename, so a failed build never leaves a partial image
//! in `images/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::{AppConfig, HealthcheckConfig, RuntimeConfig};

/// Number of digest hex characters used for store directory names
const DIGEST_DIR_LEN: usize = 12;

/// The non-privileged identity the service process runs as.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentitySpec {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
}

impl From<&RuntimeConfig> for IdentitySpec {
    fn from(runtime: &RuntimeConfig) -> Self {
        Self {
            user: runtime.user.clone(),
            uid: runtime.uid,
            gid: runtime.gid,
        }
    }
}

/// Health-check timing recorded in the image for the supervisor to use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthcheckSpec {
    pub path: String,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    pub grace_period_seconds: u64,
    pub failure_threshold: u32,
}

impl From<&HealthcheckConfig> for HealthcheckSpec {
    fn from(hc: &HealthcheckConfig) -> Self {
        Self {
            path: hc.path.clone(),
            interval_seconds: hc.interval_seconds,
            timeout_seconds: hc.timeout_seconds,
            grace_period_seconds: hc.grace_period_seconds,
            failure_threshold: hc.failure_threshold,
        }
    }
}

/// Metadata describing a built image: how it was constructed and how derived
/// instances start, which identity they run as, and how they are probed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    pub id: Uuid,
    /// Content digest, `sha256:<hex>`. Empty until publication.
    #[serde(default)]
    pub digest: String,
    pub base: String,
    pub created: DateTime<Utc>,
    pub workdir: String,
    pub exposed_port: u16,
    pub identity: IdentitySpec,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub healthcheck: HealthcheckSpec,
}

impl ImageManifest {
    /// Build a manifest from the loaded configuration. The digest is assigned
    /// by the store at publication.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            digest: String::new(),
            base: config.image.base.clone(),
            created: Utc::now(),
            workdir: config.runtime.workdir.clone(),
            exposed_port: config.runtime.port,
            identity: IdentitySpec::from(&config.runtime),
            command: config.runtime.command.clone(),
            env: config.runtime.env.clone(),
            healthcheck: HealthcheckSpec::from(&config.healthcheck),
        }
    }

    /// Short digest form used for store paths and log lines.
    pub fn short_digest(&self) -> &str {
        let hex = self.digest.strip_prefix("sha256:").unwrap_or(&self.digest);
        &hex[..hex.len().min(DIGEST_DIR_LEN)]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode image manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("Image not found: {0}")]
    NotFound(String),
    #[error("Image store is empty")]
    Empty,
}

/// An in-progress build area under `staging/`. Holds the rootfs the build
/// pipeline fills in before publication.
#[derive(Debug)]
pub struct StagedImage {
    pub id: Uuid,
    dir: PathBuf,
    rootfs: PathBuf,
}

impl StagedImage {
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Absolute path inside the staged rootfs for an image-absolute path
    /// such as the configured workdir.
    pub fn path_for(&self, image_path: &str) -> PathBuf {
        self.rootfs.join(image_path.trim_start_matches('/'))
    }
}

/// Digest-addressed image store with a staging area for in-progress builds.
pub struct ImageStore {
    images_dir: PathBuf,
    staging_dir: PathBuf,
}

impl ImageStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let root = root.as_ref();
        let images_dir = root.join("images");
        let staging_dir = root.join("staging");
        fs::create_dir_all(&images_dir)?;
        fs::create_dir_all(&staging_dir)?;
        Ok(Self {
            images_dir,
            staging_dir,
        })
    }

    /// Create a fresh staging area for a build.
    pub fn stage(&self) -> Result<StagedImage, StoreError> {
        let id = Uuid::new_v4();
        let dir = self.staging_dir.join(id.to_string());
        let rootfs = dir.join("rootfs");
        fs::create_dir_all(&rootfs)?;
        Ok(StagedImage { id, dir, rootfs })
    }

    /// Remove a staging area after a failed build. Best effort; the staging
    /// directory is outside `images/` so a leftover never reads as an image.
    pub fn discard(&self, staged: StagedImage) {
        if let Err(e) = fs::remove_dir_all(&staged.dir) {
            tracing::warn!(dir = %staged.dir.display(), error = %e, "Failed to remove staging dir");
        }
    }

    /// Publish a staged build: assign the content digest, write the manifest,
    /// and atomically rename the staging directory into `images/`.
    pub fn publish(
        &self,
        staged: StagedImage,
        mut manifest: ImageManifest,
    ) -> Result<ImageManifest, StoreError> {
        manifest.digest = compute_digest(&manifest, &staged.rootfs)?;

        let manifest_json = serde_json::to_vec_pretty(&manifest)?;
        fs::write(staged.dir.join("manifest.json"), manifest_json)?;

        let target = self.images_dir.join(manifest.short_digest());
        if target.exists() {
            // Identical content already published; the staging copy is redundant
            tracing::debug!(digest = %manifest.digest, "Image already in store");
            self.discard(staged);
            return Ok(manifest);
        }

        fs::rename(&staged.dir, &target)?;
        Ok(manifest)
    }

    /// Load a manifest by digest or unique digest prefix.
    pub fn load(&self, digest: &str) -> Result<ImageManifest, StoreError> {
        let needle = digest.strip_prefix("sha256:").unwrap_or(digest);
        for manifest in self.list()? {
            let hex = manifest.digest.strip_prefix("sha256:").unwrap_or("");
            if hex.starts_with(needle) {
                return Ok(manifest);
            }
        }
        Err(StoreError::NotFound(digest.to_string()))
    }

    /// Most recently created image in the store.
    pub fn latest(&self) -> Result<ImageManifest, StoreError> {
        self.list()?
            .into_iter()
            .max_by_key(|m| m.created)
            .ok_or(StoreError::Empty)
    }

    /// All published manifests, unordered.
    pub fn list(&self) -> Result<Vec<ImageManifest>, StoreError> {
        let mut manifests = Vec::new();
        for entry in fs::read_dir(&self.images_dir)? {
            let entry = entry?;
            let manifest_path = entry.path().join("manifest.json");
            if !manifest_path.is_file() {
                continue;
            }
            let contents = fs::read(&manifest_path)?;
            manifests.push(serde_json::from_slice(&contents)?);
        }
        Ok(manifests)
    }

    /// Rootfs directory of a published image.
    pub fn rootfs_path(&self, manifest: &ImageManifest) -> PathBuf {
        self.images_dir.join(manifest.short_digest()).join("rootfs")
    }

    /// Whether any image has been published.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.list()?.is_empty())
    }
}

/// Content digest over the manifest and the rootfs tree: relative paths and
/// file bytes, in sorted order. Per-build fields (id, digest, creation time)
/// are excluded so identical content always digests identically.
fn compute_digest(manifest: &ImageManifest, rootfs: &Path) -> Result<String, StoreError> {
    let mut hasher = Sha256::new();

    let mut unsigned = manifest.clone();
    unsigned.id = Uuid::nil();
    unsigned.digest = String::new();
    unsigned.created = DateTime::<Utc>::MIN_UTC;
    hasher.update(serde_json::to_vec(&unsigned)?);

    let mut files = Vec::new();
    collect_files(rootfs, rootfs, &mut files)?;
    files.sort();

    for rel in files {
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update(fs::read(rootfs.join(&rel))?);
    }

    Ok(format!("sha256:{:x}", hasher.finalize()))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_path_buf());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthcheckConfig, RuntimeConfig};

    fn test_manifest() -> ImageManifest {
        ImageManifest {
            id: Uuid::new_v4(),
            digest: String::new(),
            base: "python:3.11-slim".to_string(),
            created: Utc::now(),
            workdir: "/app".to_string(),
            exposed_port: 8080,
            identity: IdentitySpec::from(&RuntimeConfig::default()),
            command: vec!["python".to_string(), "main.py".to_string()],
            env: BTreeMap::new(),
            healthcheck: HealthcheckSpec::from(&HealthcheckConfig::default()),
        }
    }

    #[test]
    fn test_publish_and_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ImageStore::open(dir.path()).expect("open store");

        let staged = store.stage().expect("stage");
        fs::create_dir_all(staged.path_for("/app")).unwrap();
        fs::write(staged.path_for("/app").join("main.py"), b"print('hi')\n").unwrap();

        let published = store.publish(staged, test_manifest()).expect("publish");
        assert!(published.digest.starts_with("sha256:"));

        let loaded = store.load(published.short_digest()).expect("load");
        assert_eq!(loaded.digest, published.digest);
        assert_eq!(loaded.identity.uid, 1000);
        assert!(store.rootfs_path(&loaded).join("app/main.py").is_file());
    }

    #[test]
    fn test_latest_returns_newest_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ImageStore::open(dir.path()).expect("open store");

        let mut first = test_manifest();
        first.created = Utc::now() - chrono::Duration::hours(1);
        let staged = store.stage().unwrap();
        fs::write(staged.rootfs().join("a"), b"first").unwrap();
        store.publish(staged, first).unwrap();

        let second = test_manifest();
        let staged = store.stage().unwrap();
        fs::write(staged.rootfs().join("b"), b"second").unwrap();
        let second = store.publish(staged, second).unwrap();

        let latest = store.latest().expect("latest");
        assert_eq!(latest.digest, second.digest);
    }

    #[test]
    fn test_load_unknown_digest_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ImageStore::open(dir.path()).expect("open store");
        assert!(matches!(
            store.load("deadbeef"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_discard_removes_staging_without_publishing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ImageStore::open(dir.path()).expect("open store");

        let staged = store.stage().expect("stage");
        fs::write(staged.rootfs().join("junk"), b"junk").unwrap();
        store.discard(staged);

        assert!(store.is_empty().unwrap());
        assert_eq!(fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
    }

    #[test]
    fn test_digest_changes_with_rootfs_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ImageStore::open(dir.path()).expect("open store");

        let staged = store.stage().unwrap();
        fs::write(staged.rootfs().join("f"), b"one").unwrap();
        let a = store.publish(staged, test_manifest()).unwrap();

        let staged = store.stage().unwrap();
        fs::write(staged.rootfs().join("f"), b"two").unwrap();
        let b = store.publish(staged, test_manifest()).unwrap();

        assert_ne!(a.digest, b.digest);
    }
}
