//! Git revision source backed by the git CLI

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::DeployError;
use crate::models::revision::Revision;
use crate::source::RevisionSource;
use crate::storage::settings::RepositoryConfig;

/// A remote git repository and its local working copy
pub struct GitRepository {
    /// Remote URL as configured, safe to log
    url: String,
    /// Remote URL including credentials
    auth_url: String,
    local_path: PathBuf,
    /// Branch requested before the first clone
    pending_branch: Mutex<Option<String>>,
}

impl GitRepository {
    pub fn new(config: &RepositoryConfig, local_path: PathBuf) -> Result<Self, DeployError> {
        Ok(Self {
            url: config.url.clone(),
            auth_url: authenticated_url(config)?,
            local_path,
            pending_branch: Mutex::new(None),
        })
    }

    /// Run git and return stdout. `cwd` defaults to the working copy.
    async fn git(&self, args: &[&str], cwd: Option<&Path>) -> Result<String, DeployError> {
        let cwd = match cwd {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                dir
            }
            None => self.local_path.as_path(),
        };
        let mut cmd = Command::new("git");
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .current_dir(cwd);

        debug!("Running git {}", self.redact(&args.join(" ")));
        let output = cmd
            .output()
            .await
            .map_err(|e| DeployError::GitError(format!("Failed to run git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeployError::GitError(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                self.redact(stderr.trim())
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn redact(&self, text: &str) -> String {
        if self.auth_url == self.url {
            text.to_string()
        } else {
            text.replace(&self.auth_url, &self.url)
        }
    }

    fn parent_dir(&self) -> &Path {
        self.local_path.parent().unwrap_or_else(|| Path::new("."))
    }
}

#[async_trait]
impl RevisionSource for GitRepository {
    async fn check_git(&self) -> Result<(), DeployError> {
        self.git(&["--version"], Some(self.parent_dir()))
            .await
            .map(|_| ())
            .map_err(|e| DeployError::ConnectivityError(format!("Git executable not usable: {}", e)))
    }

    async fn check_connectivity(&self) -> Result<(), DeployError> {
        self.git(&["ls-remote", "--heads", self.auth_url.as_str()], Some(self.parent_dir()))
            .await
            .map(|_| ())
            .map_err(|e| DeployError::ConnectivityError(e.to_string()))
    }

    async fn exists(&self) -> bool {
        tokio::fs::metadata(self.local_path.join(".git"))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn clone_repository(&self) -> Result<(), DeployError> {
        let target = self.local_path.to_string_lossy().into_owned();
        let pending = self.pending_branch.lock().await.take();

        info!("Cloning {} into {}", self.url, target);
        let mut args = vec!["clone"];
        if let Some(branch) = pending.as_deref() {
            args.extend(["--branch", branch]);
        }
        args.extend([self.auth_url.as_str(), target.as_str()]);
        self.git(&args, Some(self.parent_dir())).await.map(|_| ())
    }

    async fn pull(&self) -> Result<(), DeployError> {
        self.git(&["pull"], None).await.map(|_| ())
    }

    async fn prune(&self) -> Result<(), DeployError> {
        self.git(&["remote", "prune", "origin"], None).await.map(|_| ())
    }

    async fn switch_branch(&self, branch: &str) -> Result<(), DeployError> {
        let branch = short_branch(branch);
        if !self.exists().await {
            // Checked out by the clone
            *self.pending_branch.lock().await = Some(branch.to_string());
            return Ok(());
        }
        if let Err(e) = self.git(&["fetch", "origin"], None).await {
            warn!("Fetch before checkout failed: {}", e);
        }
        self.git(&["checkout", branch], None).await.map(|_| ())
    }

    async fn remote_revision(&self, branch: &str) -> Result<Revision, DeployError> {
        let head = format!("refs/heads/{}", short_branch(branch));
        let output = self
            .git(&["ls-remote", self.auth_url.as_str(), head.as_str()], Some(self.parent_dir()))
            .await?;
        // ls-remote matches by suffix, so refs/heads/feature/master also matches master
        let revision = output.lines().find_map(|line| {
            let (hash, name) = line.split_once('\t')?;
            (name.trim() == head).then(|| Revision::parse(hash)).flatten()
        });
        revision.ok_or_else(|| {
            DeployError::RevisionError(format!("Branch {} not found at {}", branch, self.url))
        })
    }

    async fn list_files(&self) -> Result<Vec<String>, DeployError> {
        let output = self.git(&["ls-files", "-z"], None).await?;
        Ok(split_nul(&output).map(str::to_string).collect())
    }

    async fn get_diff(&self, local: &Revision, remote: &Revision) -> Result<Vec<String>, DeployError> {
        // Renames/copies as delete + add keep every record a single path
        let output = self
            .git(
                &["diff", "-z", "--no-renames", "--name-status", remote.as_str(), local.as_str()],
                None,
            )
            .await?;
        Ok(name_status_lines(&output))
    }

    async fn file_diff(&self, path: &str, local: &Revision, remote: &Revision) -> Result<String, DeployError> {
        if !local.is_commit() || !remote.is_commit() {
            return Err(DeployError::RevisionError(
                "File diff requires two commit revisions".to_string(),
            ));
        }
        self.git(&["diff", remote.as_str(), local.as_str(), "--", path], None)
            .await
    }

    fn local_path(&self) -> &Path {
        &self.local_path
    }
}

/// `refs/heads/main` -> `main`
pub fn short_branch(branch: &str) -> &str {
    branch.strip_prefix("refs/heads/").unwrap_or(branch)
}

/// NUL separated records, unquoted
fn split_nul(output: &str) -> impl Iterator<Item = &str> {
    output.split('\0').filter(|record| !record.is_empty())
}

/// Rebuild `<status>\t<path>` lines from `diff -z --name-status` records
fn name_status_lines(output: &str) -> Vec<String> {
    let mut records = split_nul(output);
    let mut lines = Vec::new();
    while let (Some(status), Some(path)) = (records.next(), records.next()) {
        lines.push(format!("{}\t{}", status, path));
    }
    lines
}

/// Embed username/password into http(s) URLs. Other schemes are returned as is.
fn authenticated_url(config: &RepositoryConfig) -> Result<String, DeployError> {
    let (Some(username), Some(password)) = (&config.username, &config.password) else {
        return Ok(config.url.clone());
    };
    let mut url = match Url::parse(&config.url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        _ => return Ok(config.url.clone()),
    };
    url.set_username(username)
        .map_err(|_| DeployError::ConfigError(format!("Cannot set username on {}", config.url)))?;
    url.set_password(Some(password.expose_secret()))
        .map_err(|_| DeployError::ConfigError(format!("Cannot set password on {}", config.url)))?;
    Ok(url.to_string())
}
