//! Image build pipeline.
//!
//! Transforms a declared dependency manifest and project tree into a published
//! image. Steps run strictly in order, each consuming the previous step's
//! output: OS build packages, Python dependencies, project tree copy, runtime
//! identity. The first failing step aborts the build; the staging area is
//! discarded and nothing reaches the store, so a failed build never publishes
//! a partial image.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::AppConfig;
use crate::error::BuildError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::image::{ImageManifest, ImageStore, StagedImage};

/// Runs the build pipeline against an image store.
pub struct Builder<'a, R: CommandRunner> {
    config: &'a AppConfig,
    store: &'a ImageStore,
    runner: &'a R,
}

impl<'a, R: CommandRunner> Builder<'a, R> {
    pub fn new(config: &'a AppConfig, store: &'a ImageStore, runner: &'a R) -> Self {
        Self {
            config,
            store,
            runner,
        }
    }

    /// Run the full pipeline and publish the result. Any step failure aborts
    /// the build with the staging area removed.
    pub fn build(&self) -> Result<ImageManifest, BuildError> {
        let context = PathBuf::from(&self.config.build.context);
        if !context.is_dir() {
            return Err(BuildError::MissingContext(context));
        }

        let start = Instant::now();
        let staged = self.store.stage()?;
        tracing::info!(
            base = %self.config.image.base,
            build_id = %staged.id,
            "Starting image build"
        );

        if let Err(e) = self.run_pipeline(&staged, &context) {
            self.store.discard(staged);
            return Err(e);
        }

        let manifest = ImageManifest::from_config(self.config);
        let manifest = self.store.publish(staged, manifest)?;

        tracing::info!(
            digest = %manifest.digest,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Image published"
        );
        Ok(manifest)
    }

    fn run_pipeline(&self, staged: &StagedImage, context: &Path) -> Result<(), BuildError> {
        self.install_os_packages()?;
        self.install_dependencies(staged, context)?;
        self.copy_context(staged, context)?;
        self.create_identity(staged)?;
        Ok(())
    }

    /// Install OS packages required for compiling native extensions, then
    /// drop the package-index caches to keep the image small.
    fn install_os_packages(&self) -> Result<(), BuildError> {
        let packages = &self.config.build.os_packages;
        if packages.is_empty() {
            tracing::debug!("No OS packages configured, skipping install");
            return Ok(());
        }

        tracing::info!(packages = ?packages, "Installing OS packages");

        let mut install_args = vec![
            "install".to_string(),
            "-y".to_string(),
            "--no-install-recommends".to_string(),
        ];
        install_args.extend(packages.iter().cloned());

        for spec in [
            CommandSpec::new("apt-get", ["update"]),
            CommandSpec::new("apt-get", install_args),
            CommandSpec::new("sh", ["-c", "rm -rf /var/lib/apt/lists/*"]),
        ] {
            self.runner
                .run(&spec)
                .map_err(|e| BuildError::PackageInstall(e.to_string()))?;
        }

        Ok(())
    }

    /// Upgrade the installer, then install the manifest-declared dependencies
    /// without retaining a download cache.
    fn install_dependencies(
        &self,
        staged: &StagedImage,
        context: &Path,
    ) -> Result<(), BuildError> {
        let manifest_src = context.join(&self.config.build.dependency_manifest);
        if !manifest_src.is_file() {
            return Err(BuildError::MissingManifest(manifest_src));
        }

        // The manifest lands in the workdir ahead of the full tree copy
        let workdir = staged.path_for(&self.config.runtime.workdir);
        fs::create_dir_all(&workdir)?;
        let manifest_dst = workdir.join(&self.config.build.dependency_manifest);
        fs::copy(&manifest_src, &manifest_dst)?;

        tracing::info!(manifest = %manifest_src.display(), "Installing dependencies");

        for spec in [
            CommandSpec::new("pip", ["install", "--upgrade", "pip"]),
            CommandSpec::new(
                "pip",
                vec![
                    "install".to_string(),
                    "--no-cache-dir".to_string(),
                    "-r".to_string(),
                    manifest_dst.to_string_lossy().into_owned(),
                ],
            ),
        ] {
            self.runner
                .run(&spec)
                .map_err(|e| BuildError::DependencyInstall(e.to_string()))?;
        }

        Ok(())
    }

    /// Copy the project tree into the image workdir. The image store itself is
    /// excluded in case it lives inside the context.
    fn copy_context(&self, staged: &StagedImage, context: &Path) -> Result<(), BuildError> {
        let workdir = staged.path_for(&self.config.runtime.workdir);
        fs::create_dir_all(&workdir)?;

        let exclude = fs::canonicalize(&self.config.image.store).ok();
        let copied = copy_tree(context, &workdir, exclude.as_deref())?;

        tracing::info!(
            files = copied,
            workdir = %self.config.runtime.workdir,
            "Copied project tree"
        );
        Ok(())
    }

    /// Create the non-privileged runtime identity and hand it ownership of
    /// the workdir. Ownership assignment is recursive and always the final
    /// pipeline step.
    fn create_identity(&self, staged: &StagedImage) -> Result<(), BuildError> {
        let runtime = &self.config.runtime;
        let workdir = staged.path_for(&runtime.workdir);

        tracing::info!(user = %runtime.user, uid = runtime.uid, "Creating runtime identity");

        for spec in [
            CommandSpec::new(
                "groupadd",
                ["--gid".to_string(), runtime.gid.to_string(), runtime.user.clone()],
            ),
            CommandSpec::new(
                "useradd",
                [
                    "--uid".to_string(),
                    runtime.uid.to_string(),
                    "--gid".to_string(),
                    runtime.gid.to_string(),
                    "--no-create-home".to_string(),
                    runtime.user.clone(),
                ],
            ),
            CommandSpec::new(
                "chown",
                [
                    "-R".to_string(),
                    format!("{}:{}", runtime.uid, runtime.gid),
                    workdir.to_string_lossy().into_owned(),
                ],
            ),
        ] {
            self.runner
                .run(&spec)
                .map_err(|e| BuildError::Identity(e.to_string()))?;
        }

        Ok(())
    }
}

/// Recursively copy `src` into `dst`, returning the number of files copied.
fn copy_tree(src: &Path, dst: &Path, exclude: Option<&Path>) -> std::io::Result<u64> {
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();

        if let Some(excluded) = exclude {
            if let Ok(canonical) = fs::canonicalize(&path) {
                if canonical.starts_with(excluded) {
                    continue;
                }
            }
        }

        let target = dst.join(entry.file_name());
        if path.is_dir() {
            fs::create_dir_all(&target)?;
            copied += copy_tree(&path, &target, exclude)?;
        } else {
            fs::copy(&path, &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}
