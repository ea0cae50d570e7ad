//! In-memory capabilities recording every call

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use deployd::deploy::{Pipeline, PipelineBuilder};
use deployd::errors::DeployError;
use deployd::models::deployment::{DeploymentSpec, Initiator};
use deployd::models::progress::{ClientId, ProgressEvent, Severity};
use deployd::models::revision::Revision;
use deployd::progress::{ProgressChannel, ProgressReceiver};
use deployd::source::RevisionSource;
use deployd::target::TransportTarget;

pub const OLD: &str = "1111111111111111111111111111111111111111";
pub const NEW: &str = "2222222222222222222222222222222222222222";

pub fn spec() -> DeploymentSpec {
    DeploymentSpec {
        deployment_id: "prod".to_string(),
        repository_id: "app".to_string(),
        server_id: "web".to_string(),
        branch: "master".to_string(),
        target_path: "/app/".to_string(),
        initiator: Initiator::Api,
        list_only: false,
        selected_tasks: vec![],
        tasks: vec![],
    }
}

pub type Calls = Arc<Mutex<Vec<String>>>;

fn record(calls: &Calls, call: impl Into<String>) {
    calls.lock().unwrap().push(call.into());
}

/// Revision source with canned answers
pub struct FakeSource {
    pub local_path: PathBuf,
    pub revision: String,
    pub files: Vec<String>,
    pub diff: Vec<String>,
    pub git_ok: bool,
    pub connectivity_ok: bool,
    pub exists: bool,
    pub prune_ok: bool,
    pub calls: Calls,
}

impl Default for FakeSource {
    fn default() -> Self {
        Self {
            local_path: PathBuf::from("/work/app"),
            revision: NEW.to_string(),
            files: vec![],
            diff: vec![],
            git_ok: true,
            connectivity_ok: true,
            exists: true,
            prune_ok: true,
            calls: Calls::default(),
        }
    }
}

#[async_trait]
impl RevisionSource for FakeSource {
    async fn check_git(&self) -> Result<(), DeployError> {
        record(&self.calls, "check_git");
        if self.git_ok {
            Ok(())
        } else {
            Err(DeployError::GitError("git not found".to_string()))
        }
    }

    async fn check_connectivity(&self) -> Result<(), DeployError> {
        record(&self.calls, "check_repository");
        if self.connectivity_ok {
            Ok(())
        } else {
            Err(DeployError::ConnectivityError("repository unreachable".to_string()))
        }
    }

    async fn exists(&self) -> bool {
        self.exists
    }

    async fn clone_repository(&self) -> Result<(), DeployError> {
        record(&self.calls, "clone");
        Ok(())
    }

    async fn pull(&self) -> Result<(), DeployError> {
        record(&self.calls, "pull");
        Ok(())
    }

    async fn prune(&self) -> Result<(), DeployError> {
        record(&self.calls, "prune");
        if self.prune_ok {
            Ok(())
        } else {
            Err(DeployError::GitError("prune failed".to_string()))
        }
    }

    async fn switch_branch(&self, branch: &str) -> Result<(), DeployError> {
        record(&self.calls, format!("switch:{}", branch));
        Ok(())
    }

    async fn remote_revision(&self, _branch: &str) -> Result<Revision, DeployError> {
        Ok(Revision::parse(&self.revision).unwrap_or_else(Revision::unresolved))
    }

    async fn list_files(&self) -> Result<Vec<String>, DeployError> {
        record(&self.calls, "list_files");
        Ok(self.files.clone())
    }

    async fn get_diff(&self, local: &Revision, remote: &Revision) -> Result<Vec<String>, DeployError> {
        record(&self.calls, format!("diff:{}..{}", remote, local));
        Ok(self.diff.clone())
    }

    async fn file_diff(&self, path: &str, _local: &Revision, _remote: &Revision) -> Result<String, DeployError> {
        Ok(format!("--- a/{}\n+++ b/{}\n", path, path))
    }

    fn local_path(&self) -> &Path {
        &self.local_path
    }
}

/// Transport target keeping remote files in a map
pub struct FakeTarget {
    pub root: String,
    pub files: Mutex<BTreeMap<String, String>>,
    pub connectivity_ok: bool,
    pub list_ok: bool,
    pub marker_write_ok: bool,
    pub failing_uploads: HashSet<String>,
    pub calls: Calls,
}

impl Default for FakeTarget {
    fn default() -> Self {
        Self {
            root: "/var/www/".to_string(),
            files: Mutex::new(BTreeMap::new()),
            connectivity_ok: true,
            list_ok: true,
            marker_write_ok: true,
            failing_uploads: HashSet::new(),
            calls: Calls::default(),
        }
    }
}

impl FakeTarget {
    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        self
    }

    pub fn content(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TransportTarget for FakeTarget {
    async fn check_connectivity(&self) -> Result<(), DeployError> {
        record(&self.calls, "check_server");
        if self.connectivity_ok {
            Ok(())
        } else {
            Err(DeployError::ConnectivityError("server unreachable".to_string()))
        }
    }

    async fn read_file(&self, path: &str) -> Result<String, DeployError> {
        record(&self.calls, format!("read:{}", path));
        self.content(path)
            .ok_or_else(|| DeployError::NotFound(path.to_string()))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>, DeployError> {
        record(&self.calls, format!("list:{}", path));
        if !self.list_ok {
            return Err(DeployError::RemoteError("permission denied".to_string()));
        }
        let files = self.files.lock().unwrap();
        Ok(files
            .keys()
            .filter_map(|key| key.strip_prefix(path))
            .filter_map(|rest| rest.split('/').next())
            .map(str::to_string)
            .collect())
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<(), DeployError> {
        record(&self.calls, format!("upload:{}", remote_path));
        if self.failing_uploads.contains(remote_path) {
            return Err(DeployError::TransferError(format!("{}: disk full", remote_path)));
        }
        self.files
            .lock()
            .unwrap()
            .insert(remote_path.to_string(), local_path.display().to_string());
        Ok(())
    }

    async fn delete(&self, remote_path: &str) -> Result<(), DeployError> {
        record(&self.calls, format!("delete:{}", remote_path));
        self.files.lock().unwrap().remove(remote_path);
        Ok(())
    }

    async fn put_content(&self, content: &str, remote_path: &str) -> Result<(), DeployError> {
        record(&self.calls, format!("put:{}", remote_path));
        if !self.marker_write_ok {
            return Err(DeployError::RemoteError("read-only filesystem".to_string()));
        }
        self.files
            .lock()
            .unwrap()
            .insert(remote_path.to_string(), content.to_string());
        Ok(())
    }

    async fn execute(&self, command: &str, cwd: &str) -> Result<String, DeployError> {
        record(&self.calls, format!("exec:{}:{}", cwd, command));
        if command.starts_with("false") {
            return Err(DeployError::RemoteError("exit 1".to_string()));
        }
        Ok(String::new())
    }

    fn root_path(&self) -> &str {
        &self.root
    }
}

/// Pipeline over the given fakes plus the receiving end of its progress
pub fn pipeline(source: Arc<FakeSource>, target: Arc<FakeTarget>) -> (Pipeline, ProgressReceiver) {
    let (pipeline, rx) = builder(source, target);
    (pipeline.build().unwrap(), rx)
}

pub fn builder(source: Arc<FakeSource>, target: Arc<FakeTarget>) -> (PipelineBuilder, ProgressReceiver) {
    let (channel, rx) = ProgressChannel::new();
    let builder = Pipeline::builder()
        .source(source)
        .target(target)
        .progress(channel.reporter(ClientId::new("test-client")));
    (builder, rx)
}

/// Every progress event queued so far
pub fn drain(rx: &mut ProgressReceiver) -> Vec<ProgressEvent> {
    std::iter::from_fn(|| rx.try_recv().ok())
        .map(|envelope| envelope.event)
        .collect()
}

pub fn count(events: &[ProgressEvent], severity: Severity) -> usize {
    events.iter().filter(|e| e.severity == severity).count()
}
