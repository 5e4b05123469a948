//! Artifact installation.
//!
//! Three strategies place a plugin on disk under the install root:
//!
//! - **npm**: `<pm> install <pkg>@<version> --prefix <target>`
//! - **git**: clone into a temp dir, check out the ref, install deps, copy
//! - **bundle**: copy a local directory bundle into place
//!
//! Every external step goes through a [`CommandRunner`], and every strategy
//! is bounded by the installer's timeout. Temp dirs are [`tempfile::TempDir`]s
//! and child processes are `kill_on_drop`, so abandoning a timed-out install
//! cleans both up.

mod bundle;
mod git;
mod npm;

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::catalog::RegistryEntry;
use crate::error::{PluginError, PluginResult};
use crate::metadata;

/// Default bound on a single install.
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Phase of an install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallPhase {
    /// Fetching the package or cloning the repository.
    Downloading,
    /// Unpacking or checking out sources.
    Extracting,
    /// Installing dependencies.
    Installing,
    /// Verifying the installed artifact.
    Validating,
    /// Done.
    Complete,
}

impl fmt::Display for InstallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Downloading => "downloading",
            Self::Extracting => "extracting",
            Self::Installing => "installing",
            Self::Validating => "validating",
            Self::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// One progress report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallProgress {
    /// Current phase.
    pub phase: InstallPhase,
    /// Percent complete, 0 to 100.
    pub percent: u8,
    /// Short human-readable message.
    pub message: String,
}

/// Receives progress reports synchronously on the install path.
pub type ProgressCallback = Arc<dyn Fn(InstallProgress) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct Progress(Option<ProgressCallback>);

impl Progress {
    pub(crate) fn new(callback: Option<ProgressCallback>) -> Self {
        Self(callback)
    }

    pub(crate) fn report(&self, phase: InstallPhase, percent: u8, message: impl Into<String>) {
        let message = message.into();
        debug!(%phase, percent, message = %message, "Install progress");
        if let Some(callback) = &self.0 {
            callback(InstallProgress {
                phase,
                percent: percent.min(100),
                message,
            });
        }
    }
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
///
/// The result is always a single, non-empty path component.
#[must_use]
pub fn sanitize_plugin_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "_".to_owned()
    } else {
        sanitized
    }
}

/// An external command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program name or path.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Run with a scrubbed environment (used for git).
    pub hardened: bool,
}

impl CommandSpec {
    /// A command with arguments.
    #[must_use]
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            hardened: false,
        }
    }

    /// Run in `dir`.
    #[must_use]
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Run with a scrubbed environment.
    #[must_use]
    pub fn hardened(mut self) -> Self {
        self.hardened = true;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Runs external install steps.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InstallFailed`] carrying the command's stderr
    /// if it exits unsuccessfully or cannot be spawned.
    async fn run(&self, command: &CommandSpec) -> PluginResult<()>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, command: &CommandSpec) -> PluginResult<()> {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }
        if command.hardened {
            // Drop inherited GIT_* and friends; keep what git needs to find
            // itself and SSH keys.
            cmd.env_clear();
            if let Ok(path) = std::env::var("PATH") {
                cmd.env("PATH", path);
            }
            if let Ok(home) = std::env::var("HOME") {
                cmd.env("HOME", home);
            }
            cmd.env("GIT_CONFIG_NOSYSTEM", "1");
            cmd.env("GIT_CONFIG_GLOBAL", "/dev/null");
            cmd.env("GIT_TERMINAL_PROMPT", "0");
            cmd.env("GIT_SSH_COMMAND", "ssh -o BatchMode=yes");
        }
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        debug!(command = %command, "Running install step");
        let output = cmd.output().await.map_err(|e| {
            PluginError::InstallFailed(format!("failed to run {}: {e}", command.program))
        })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        if stderr.is_empty() {
            Err(PluginError::InstallFailed(format!(
                "`{command}` exited with {}",
                output.status
            )))
        } else {
            Err(PluginError::InstallFailed(stderr))
        }
    }
}

/// Places plugin artifacts under an install root.
#[derive(Clone)]
pub struct Installer {
    root: PathBuf,
    package_manager: String,
    git_command: String,
    timeout: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl Installer {
    /// An installer using `npm`, `git` and the default timeout.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            root: root.into(),
            package_manager: "npm".to_owned(),
            git_command: "git".to_owned(),
            timeout: DEFAULT_INSTALL_TIMEOUT,
            runner,
        }
    }

    /// Use a different package manager binary.
    #[must_use]
    pub fn with_package_manager(mut self, package_manager: impl Into<String>) -> Self {
        self.package_manager = package_manager.into();
        self
    }

    /// Use a different git binary.
    #[must_use]
    pub fn with_git_command(mut self, git_command: impl Into<String>) -> Self {
        self.git_command = git_command.into();
        self
    }

    /// Bound each install by `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The install root.
    #[must_use]
    pub fn install_root(&self) -> &Path {
        &self.root
    }

    /// The install timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Canonical install directory for a plugin name.
    #[must_use]
    pub fn target_dir_for(&self, name: &str) -> PathBuf {
        self.root.join(sanitize_plugin_name(name))
    }

    /// Install a registry entry and return the artifact root (the directory
    /// holding its `package.json`).
    ///
    /// The package reference wins over the repository reference. `version`
    /// overrides the entry's own version hint.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NoInstallMethod`] when the entry declares
    /// neither, and [`PluginError::InstallFailed`] when a step fails or the
    /// timeout elapses.
    pub async fn install(
        &self,
        entry: &RegistryEntry,
        version: Option<&str>,
        progress: Option<ProgressCallback>,
    ) -> PluginResult<PathBuf> {
        let progress = Progress::new(progress);
        let target = self.target_dir_for(&entry.name);
        info!(plugin = %entry.name, target = %target.display(), "Installing plugin");

        let artifact = if let Some(npm) = &entry.npm {
            let version = version.or(npm.version.as_deref());
            self.bounded(npm::install(
                self.runner.as_ref(),
                &self.package_manager,
                &npm.repo,
                version,
                &target,
                &progress,
            ))
            .await?
        } else if let Some(git) = &entry.git {
            let checkout = version.or(git.checkout_ref());
            self.bounded(git::install(
                self.runner.as_ref(),
                &self.git_command,
                &self.package_manager,
                &git.repo,
                checkout,
                &target,
                &progress,
            ))
            .await?
        } else {
            return Err(PluginError::NoInstallMethod(entry.name.clone()));
        };

        self.finish(&artifact, &progress).await?;
        Ok(artifact)
    }

    /// Install from a local directory bundle and return the artifact root.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::BundleNotFound`] when `source` does not exist,
    /// [`PluginError::UnsupportedBundleFormat`] when it is not a directory,
    /// and [`PluginError::InstallFailed`] when a step fails or times out.
    pub async fn install_bundle(
        &self,
        source: &Path,
        progress: Option<ProgressCallback>,
    ) -> PluginResult<PathBuf> {
        let progress = Progress::new(progress);
        info!(source = %source.display(), "Installing plugin from local bundle");
        let artifact = self.bounded(bundle::install(self, source, &progress)).await?;
        self.finish(&artifact, &progress).await?;
        Ok(artifact)
    }

    async fn bounded<T>(&self, step: impl Future<Output = PluginResult<T>>) -> PluginResult<T> {
        tokio::time::timeout(self.timeout, step)
            .await
            .map_err(|_| {
                PluginError::InstallFailed(format!(
                    "installation timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
    }

    async fn finish(&self, artifact: &Path, progress: &Progress) -> PluginResult<()> {
        let manifest = metadata::read_manifest(artifact).await?;
        progress.report(
            InstallPhase::Complete,
            100,
            format!("Installed {}@{}", manifest.name, manifest.version),
        );
        Ok(())
    }
}

/// Replace `dst` with a copy of `src`, skipping `.git`. A failed copy
/// removes the partial destination.
pub(crate) async fn replace_with_copy(src: &Path, dst: &Path) -> PluginResult<u64> {
    match tokio::fs::remove_dir_all(dst).await {
        Ok(()) => debug!(path = %dst.display(), "Removed previous install"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => return Err(e.into()),
    }

    let (src_owned, dst_owned) = (src.to_path_buf(), dst.to_path_buf());
    let copied = tokio::task::spawn_blocking(move || copy_tree(&src_owned, &dst_owned))
        .await
        .map_err(|e| PluginError::InstallFailed(format!("copy task failed: {e}")))?;

    match copied {
        Ok(files) => {
            debug!(from = %src.display(), to = %dst.display(), files, "Copied plugin files");
            Ok(files)
        },
        Err(e) => {
            let _ = tokio::fs::remove_dir_all(dst).await;
            Err(e)
        },
    }
}

fn copy_tree(src: &Path, dst: &Path) -> PluginResult<u64> {
    std::fs::create_dir_all(dst)?;
    let mut files = 0u64;
    let walker = WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(|e| {
            PluginError::InstallFailed(format!("failed to read {}: {e}", src.display()))
        })?;
        let relative = entry.path().strip_prefix(src).map_err(|e| {
            PluginError::InstallFailed(format!("unexpected path {}: {e}", entry.path().display()))
        })?;
        let target = dst.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
            files = files.saturating_add(1);
        } else {
            debug!(path = %entry.path().display(), "Skipping non-regular file");
        }
    }
    Ok(files)
}
