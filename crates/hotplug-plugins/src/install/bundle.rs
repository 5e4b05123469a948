//! Local-bundle strategy.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{CommandSpec, InstallPhase, Installer, Progress, replace_with_copy};
use crate::error::{PluginError, PluginResult};
use crate::metadata;

/// Copy a directory bundle into the canonical target for its declared name.
/// Returns the target.
pub(super) async fn install(
    installer: &Installer,
    source: &Path,
    progress: &Progress,
) -> PluginResult<PathBuf> {
    let meta = match tokio::fs::metadata(source).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PluginError::BundleNotFound(source.to_path_buf()));
        },
        Err(e) => return Err(e.into()),
    };
    if !meta.is_dir() {
        return Err(PluginError::UnsupportedBundleFormat(source.to_path_buf()));
    }

    progress.report(InstallPhase::Extracting, 20, "Reading bundle manifest");
    let manifest = metadata::read_manifest(source).await?;
    let target = installer.target_dir_for(&manifest.name);

    if same_dir(source, &target).await {
        debug!(path = %target.display(), "Bundle is already in place");
    } else {
        replace_with_copy(source, &target).await?;
    }

    if tokio::fs::try_exists(target.join("node_modules")).await? {
        progress.report(InstallPhase::Installing, 60, "Bundle ships its dependencies");
    } else {
        progress.report(InstallPhase::Installing, 60, "Installing dependencies");
        let deps =
            CommandSpec::new(installer.package_manager.as_str(), ["install"]).in_dir(&target);
        installer.runner.run(&deps).await?;
    }

    progress.report(InstallPhase::Validating, 90, format!("Validating {}", manifest.name));
    Ok(target)
}

async fn same_dir(a: &Path, b: &Path) -> bool {
    match (tokio::fs::canonicalize(a).await, tokio::fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::install::CommandRunner;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<CommandSpec>>);

    #[async_trait]
    impl CommandRunner for Recorder {
        async fn run(&self, command: &CommandSpec) -> PluginResult<()> {
            self.0.lock().unwrap().push(command.clone());
            Ok(())
        }
    }

    fn bundle(dir: &Path, name: &str, with_deps: bool) {
        std::fs::write(
            dir.join("package.json"),
            format!(r#"{{"name": "{name}", "version": "3.1.0"}}"#),
        )
        .unwrap();
        if with_deps {
            std::fs::create_dir_all(dir.join("node_modules/left-pad")).unwrap();
        }
    }

    #[tokio::test]
    async fn missing_path_is_bundle_not_found() {
        let root = tempfile::tempdir().unwrap();
        let installer = Installer::new(root.path(), Arc::new(Recorder::default()));
        let err = install(&installer, &root.path().join("nope"), &Progress::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::BundleNotFound(_)));
    }

    #[tokio::test]
    async fn archive_is_unsupported() {
        let root = tempfile::tempdir().unwrap();
        let archive = root.path().join("plugin.tar.gz");
        std::fs::write(&archive, b"\x1f\x8b").unwrap();
        let installer = Installer::new(root.path(), Arc::new(Recorder::default()));
        let err = install(&installer, &archive, &Progress::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::UnsupportedBundleFormat(p) if p == archive));
    }

    #[tokio::test]
    async fn copies_to_sanitized_target_and_installs_deps() {
        let root = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        bundle(src.path(), "@acme/notes", false);
        let runner = Arc::new(Recorder::default());
        let installer = Installer::new(root.path(), runner.clone());

        let target = install(&installer, src.path(), &Progress::default())
            .await
            .unwrap();

        assert_eq!(target, root.path().join("_acme_notes"));
        assert!(target.join("package.json").is_file());
        let calls = runner.0.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].cwd.as_deref(), Some(target.as_path()));
    }

    #[tokio::test]
    async fn prebuilt_bundle_skips_install_step() {
        let root = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        bundle(src.path(), "notes", true);
        let runner = Arc::new(Recorder::default());
        let installer = Installer::new(root.path(), runner.clone());

        let target = install(&installer, src.path(), &Progress::default())
            .await
            .unwrap();
        assert!(target.join("node_modules/left-pad").is_dir());
        assert!(runner.0.lock().unwrap().is_empty());
    }
}
