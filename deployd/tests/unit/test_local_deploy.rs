//! Deployments onto a directory through the local transport target

use std::sync::Arc;

use tokio_test::assert_ok;

use deployd::deploy::{Pipeline, RunOutcome};
use deployd::models::progress::ClientId;
use deployd::models::revision::Revision;
use deployd::progress::ProgressChannel;
use deployd::target::{LocalTarget, TransportTarget};

use crate::fakes::{spec, FakeSource, NEW, OLD};

fn local_pipeline(source: FakeSource, root: &str) -> Pipeline {
    let (channel, _rx) = ProgressChannel::new();
    Pipeline::builder()
        .source(Arc::new(source))
        .target(Arc::new(LocalTarget::new(root)))
        .progress(channel.reporter(ClientId::new("local")))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_marker_round_trip() {
    let remote = tempfile::tempdir().unwrap();
    let root = remote.path().to_string_lossy().into_owned();
    let pipeline = local_pipeline(FakeSource::default(), &root);

    let revision = Revision::parse(OLD).unwrap();
    assert_ok!(pipeline.update_remote_revision_file(&spec(), &revision).await);
    let resolved = assert_ok!(pipeline.resolve_remote_revision(&spec()).await);
    assert_eq!(resolved, revision);

    let marker = remote.path().join("app").join("REVISION");
    assert_eq!(std::fs::read_to_string(marker).unwrap(), OLD);
}

#[tokio::test]
async fn test_first_deploy_to_empty_directory() {
    let work = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(work.path().join("src")).unwrap();
    std::fs::write(work.path().join("index.php"), "<?php echo 1;").unwrap();
    std::fs::write(work.path().join("src/app.php"), "<?php echo 2;").unwrap();

    let remote = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(remote.path().join("app")).unwrap();
    let root = remote.path().to_string_lossy().into_owned();

    let source = FakeSource {
        local_path: work.path().to_path_buf(),
        files: vec!["index.php".to_string(), "src/app.php".to_string()],
        ..Default::default()
    };
    let pipeline = local_pipeline(source, &root);

    let outcome = assert_ok!(pipeline.run(&spec(), None).await);
    assert!(matches!(outcome, RunOutcome::Deployed(ref changes) if changes.to_upload.len() == 2));

    let deployed = remote.path().join("app");
    assert_eq!(
        std::fs::read_to_string(deployed.join("src/app.php")).unwrap(),
        "<?php echo 2;"
    );
    assert_eq!(std::fs::read_to_string(deployed.join("REVISION")).unwrap(), NEW);

    // A second run finds the marker and has nothing to do
    let again = assert_ok!(pipeline.run(&spec(), None).await);
    assert_eq!(again, RunOutcome::UpToDate);
}

#[tokio::test]
async fn test_deleting_missing_file_succeeds() {
    let remote = tempfile::tempdir().unwrap();
    let target = LocalTarget::new(remote.path().to_string_lossy());
    let missing = format!("{}/gone.txt", remote.path().display());
    assert_ok!(target.delete(&missing).await);
}
