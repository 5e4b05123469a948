//! Source-repository strategy.
//!
//! The clone lives in a [`tempfile::TempDir`]; it is removed when this
//! function returns or its future is dropped, on success and failure alike.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{CommandRunner, CommandSpec, InstallPhase, Progress, replace_with_copy};
use crate::error::{PluginError, PluginResult};

/// Refs that need no explicit checkout after cloning.
const DEFAULT_BRANCHES: &[&str] = &["main", "master"];

/// Clone `repo`, check out `git_ref`, install dependencies and copy the
/// result to `target`. Returns `target`.
pub(super) async fn install(
    runner: &dyn CommandRunner,
    git: &str,
    package_manager: &str,
    repo: &str,
    git_ref: Option<&str>,
    target: &Path,
    progress: &Progress,
) -> PluginResult<PathBuf> {
    validate_repo_url(repo)?;
    if let Some(r) = git_ref {
        validate_ref(r)?;
    }

    let tmp = tempfile::tempdir()?;
    let clone_path = tmp.path().join("repo");

    progress.report(InstallPhase::Downloading, 10, format!("Cloning {repo}"));
    let clone = CommandSpec::new(
        git,
        [
            "clone".to_owned(),
            "--".to_owned(),
            repo.to_owned(),
            clone_path.display().to_string(),
        ],
    )
    .hardened();
    runner.run(&clone).await?;

    if let Some(r) = git_ref.filter(|r| !DEFAULT_BRANCHES.contains(r)) {
        let checkout = CommandSpec::new(git, ["checkout", r])
            .in_dir(&clone_path)
            .hardened();
        runner.run(&checkout).await?;
    }
    progress.report(
        InstallPhase::Extracting,
        30,
        format!("Checked out {}", git_ref.unwrap_or("default branch")),
    );

    progress.report(InstallPhase::Installing, 60, "Installing dependencies");
    let deps = CommandSpec::new(package_manager, ["install"]).in_dir(&clone_path);
    runner.run(&deps).await?;

    replace_with_copy(&clone_path, target).await?;
    progress.report(InstallPhase::Validating, 90, "Validating build");

    debug!(tmp = %tmp.path().display(), "Removing clone directory");
    drop(tmp);
    Ok(target.to_path_buf())
}

/// Only `https://`, `ssh://` and scp-style `git@host:path` remotes.
fn validate_repo_url(url: &str) -> PluginResult<()> {
    let allowed = ["https://", "ssh://", "git@"];
    if allowed.iter().any(|scheme| url.starts_with(scheme)) {
        return Ok(());
    }
    Err(PluginError::InstallFailed(format!(
        "blocked repository URL '{url}': only https://, ssh:// and git@ remotes are allowed"
    )))
}

fn validate_ref(git_ref: &str) -> PluginResult<()> {
    let bad = git_ref.is_empty()
        || git_ref.starts_with('-')
        || git_ref.contains("..")
        || git_ref.bytes().any(|b| b.is_ascii_control() || b == b' ');
    if bad {
        return Err(PluginError::InstallFailed(format!(
            "invalid git ref '{git_ref}'"
        )));
    }
    Ok(())
}
