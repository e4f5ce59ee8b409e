//! Instance launching.
//!
//! Starts the service process from a published image: the child's identity is
//! switched to the image's non-privileged uid/gid before exec (irreversible
//! for the lifetime of the instance), the working directory and environment
//! come from the manifest, and the command is invoked with no additional
//! arguments. A process that exits within the startup window is a failed
//! launch, not a running instance.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::config::STARTUP_EXIT_WINDOW_MS;
use crate::error::LaunchError;
use crate::image::{ImageManifest, ImageStore};

/// One running service process started from an image.
#[derive(Debug)]
pub struct Instance {
    pub id: Uuid,
    pub digest: String,
    /// Declared exposure; the service process is responsible for binding it
    pub port: u16,
    child: Child,
}

impl Instance {
    /// OS process id, if the child is still running.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the service process to exit. Cancel-safe.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Terminate the service process.
    pub async fn stop(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

/// Starts instances from images in a store.
pub struct Launcher<'a> {
    store: &'a ImageStore,
}

impl<'a> Launcher<'a> {
    pub fn new(store: &'a ImageStore) -> Self {
        Self { store }
    }

    /// Launch an instance of the given image.
    pub async fn launch(&self, manifest: &ImageManifest) -> Result<Instance, LaunchError> {
        // The privileged identity is refused even if a manifest was edited by
        // hand; every derived instance runs non-root.
        if manifest.identity.uid == 0 || manifest.identity.gid == 0 {
            return Err(LaunchError::PrivilegedIdentity);
        }

        let (program, args) = manifest
            .command
            .split_first()
            .ok_or(LaunchError::EmptyCommand)?;

        let rootfs = self.store.rootfs_path(manifest);
        let workdir = rootfs.join(manifest.workdir.trim_start_matches('/'));
        if !workdir.is_dir() {
            return Err(LaunchError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("image workdir missing: {}", workdir.display()),
            )));
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&workdir)
            .envs(&manifest.env)
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            command.uid(manifest.identity.uid).gid(manifest.identity.gid);
        }

        let mut child = command.spawn().map_err(LaunchError::Spawn)?;

        let id = Uuid::new_v4();
        tracing::info!(
            instance_id = %id,
            digest = %manifest.digest,
            pid = child.id(),
            port = manifest.exposed_port,
            user = %manifest.identity.user,
            "Instance started"
        );

        // An exit inside the startup window means the service never came up
        tokio::time::sleep(Duration::from_millis(STARTUP_EXIT_WINDOW_MS)).await;
        if let Some(status) = child.try_wait()? {
            tracing::error!(instance_id = %id, %status, "Service process exited during startup");
            return Err(LaunchError::ExitedEarly(status));
        }

        Ok(Instance {
            id,
            digest: manifest.digest.clone(),
            port: manifest.exposed_port,
            child,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{AppConfig, BuildConfig, ImageConfig, LoggingConfig, RuntimeConfig};
    use std::collections::BTreeMap;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    /// Store with one published image whose rootfs is world-traversable so the
    /// non-root child can use it as a working directory.
    fn store_with_image(command: Vec<String>) -> (tempfile::TempDir, ImageStore, ImageManifest) {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755)).unwrap();

        let store = ImageStore::open(dir.path()).expect("open store");
        let staged = store.stage().expect("stage");
        let workdir = staged.path_for("/app");
        fs::create_dir_all(&workdir).unwrap();
        fs::write(workdir.join("main.py"), b"# stub\n").unwrap();

        let config = AppConfig {
            image: ImageConfig {
                base: "python:3.11-slim".to_string(),
                store: dir.path().to_string_lossy().into_owned(),
            },
            build: BuildConfig::default(),
            runtime: RuntimeConfig {
                command,
                env: BTreeMap::new(),
                ..RuntimeConfig::default()
            },
            healthcheck: Default::default(),
            logging: LoggingConfig::default(),
        };
        let manifest = ImageManifest::from_config(&config);
        let manifest = store.publish(staged, manifest).expect("publish");

        // rename preserved staging permissions; open up the path for the child
        for sub in [
            store.rootfs_path(&manifest),
            store.rootfs_path(&manifest).join("app"),
            dir.path().join("images"),
            dir.path().join("images").join(manifest.short_digest()),
        ] {
            let _ = fs::set_permissions(&sub, fs::Permissions::from_mode(0o755));
        }

        (dir, store, manifest)
    }

    #[tokio::test]
    async fn test_privileged_manifest_is_refused() {
        let (_dir, store, mut manifest) = store_with_image(vec!["sleep".into(), "5".into()]);
        manifest.identity.uid = 0;

        let err = Launcher::new(&store).launch(&manifest).await.unwrap_err();
        assert!(matches!(err, LaunchError::PrivilegedIdentity));
    }

    #[tokio::test]
    async fn test_empty_command_is_refused() {
        let (_dir, store, mut manifest) = store_with_image(vec!["sleep".into(), "5".into()]);
        manifest.command.clear();

        let err = Launcher::new(&store).launch(&manifest).await.unwrap_err();
        assert!(matches!(err, LaunchError::EmptyCommand));
    }

    #[tokio::test]
    async fn test_immediate_exit_is_a_failed_launch() {
        let (_dir, store, manifest) = store_with_image(vec!["false".into()]);

        let err = Launcher::new(&store).launch(&manifest).await.unwrap_err();
        match err {
            LaunchError::ExitedEarly(status) => assert!(!status.success()),
            // Without privileges to switch identity the spawn itself fails,
            // which is equally a refused startup
            LaunchError::Spawn(_) => {}
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_launch_starts_long_running_process() {
        let (_dir, store, manifest) = store_with_image(vec!["sleep".into(), "30".into()]);

        let mut instance = match Launcher::new(&store).launch(&manifest).await {
            Ok(instance) => instance,
            // Identity switch requires privileges this test runner lacks
            Err(LaunchError::Spawn(_)) => return,
            Err(other) => panic!("unexpected error: {:?}", other),
        };
        assert!(instance.pid().is_some());
        assert_eq!(instance.port, 8080);
        instance.stop().await.expect("stop");
    }
}
