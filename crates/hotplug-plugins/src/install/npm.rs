//! Managed-package strategy.

use std::path::{Path, PathBuf};

use super::{CommandRunner, CommandSpec, InstallPhase, Progress};
use crate::error::{PluginError, PluginResult};

/// Install `package` into `target` and return `target/node_modules/<package>`.
pub(super) async fn install(
    runner: &dyn CommandRunner,
    package_manager: &str,
    package: &str,
    version: Option<&str>,
    target: &Path,
    progress: &Progress,
) -> PluginResult<PathBuf> {
    tokio::fs::create_dir_all(target).await?;

    let spec = match version {
        Some(v) => format!("{package}@{v}"),
        None => package.to_owned(),
    };
    progress.report(InstallPhase::Downloading, 10, format!("Downloading {spec}"));

    let command = CommandSpec::new(
        package_manager,
        [
            "install".to_owned(),
            spec.clone(),
            "--prefix".to_owned(),
            target.display().to_string(),
        ],
    )
    .in_dir(target);
    runner.run(&command).await?;
    progress.report(InstallPhase::Installing, 50, format!("Installed {spec}"));

    let artifact = target.join("node_modules").join(package);
    if !tokio::fs::try_exists(&artifact).await? {
        return Err(PluginError::InstallFailed(format!(
            "{package} was not found at {} after install",
            artifact.display()
        )));
    }
    progress.report(InstallPhase::Validating, 90, format!("Validating {package}"));
    Ok(artifact)
}
