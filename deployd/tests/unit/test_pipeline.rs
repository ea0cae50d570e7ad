//! Pipeline behavior against in-memory capabilities

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_test::{assert_err, assert_ok};

use deployd::deploy::{Pipeline, RunOutcome, Stage};
use deployd::errors::DeployError;
use deployd::events::{EventBus, LifecycleContext, LifecycleEvent, Listener};
use deployd::models::deployment::{Initiator, TaskDefinition, TaskTiming};
use deployd::models::progress::Severity;
use deployd::models::revision::{ChangeSet, Revision};

use crate::fakes::{builder, count, drain, pipeline, spec, FakeSource, FakeTarget, NEW, OLD};

const MARKER: &str = "/var/www/app/REVISION";

fn deployed_target() -> FakeTarget {
    FakeTarget::default()
        .with_file(MARKER, OLD)
        .with_file("/var/www/app/index.php", "old")
}

#[tokio::test]
async fn test_equal_revisions_are_up_to_date() {
    let source = Arc::new(FakeSource {
        revision: OLD.to_string(),
        ..Default::default()
    });
    let target = Arc::new(deployed_target());
    let (pipeline, mut rx) = pipeline(source.clone(), target.clone());

    let outcome = assert_ok!(pipeline.run(&spec(), None).await);
    assert_eq!(outcome, RunOutcome::UpToDate);

    assert!(target.calls_starting_with("upload:").is_empty());
    assert!(target.calls_starting_with("delete:").is_empty());
    assert!(target.calls_starting_with("put:").is_empty());
    assert!(!source.calls.lock().unwrap().iter().any(|c| c.starts_with("diff:")));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| e.message == "Remote server is already up to date."));
}

#[tokio::test]
async fn test_up_to_date_in_list_mode_is_silent() {
    let source = Arc::new(FakeSource {
        revision: OLD.to_string(),
        ..Default::default()
    });
    let (pipeline, mut rx) = pipeline(source, Arc::new(deployed_target()));

    let outcome = assert_ok!(pipeline.run(&spec(), Some(true)).await);
    assert_eq!(outcome, RunOutcome::UpToDate);
    assert!(!drain(&mut rx)
        .iter()
        .any(|e| e.message.contains("already up to date")));
}

#[tokio::test]
async fn test_first_deploy_uploads_every_tracked_file() {
    let source = Arc::new(FakeSource {
        files: vec!["index.php".to_string(), "src/app.php".to_string()],
        ..Default::default()
    });
    let target = Arc::new(FakeTarget::default());
    let (pipeline, _rx) = pipeline(source.clone(), target.clone());

    let outcome = assert_ok!(pipeline.run(&spec(), None).await);
    assert_eq!(
        outcome,
        RunOutcome::Deployed(ChangeSet {
            to_upload: vec!["index.php".to_string(), "src/app.php".to_string()],
            to_delete: vec![],
        })
    );

    assert_eq!(
        target.calls_starting_with("upload:"),
        vec![
            "upload:/var/www/app/index.php".to_string(),
            "upload:/var/www/app/src/app.php".to_string(),
        ]
    );
    assert_eq!(target.content("/var/www/app/src/app.php").unwrap(), "/work/app/src/app.php");
    assert_eq!(target.content(MARKER).unwrap(), NEW);
    assert!(source.calls.lock().unwrap().contains(&"list_files".to_string()));
}

#[tokio::test]
async fn test_diff_is_partitioned_into_uploads_and_deletes() {
    let source = Arc::new(FakeSource {
        diff: vec![
            "M\tsrc/a.php".to_string(),
            "D\told.txt".to_string(),
            "A\tnew.txt".to_string(),
            String::new(),
        ],
        ..Default::default()
    });
    let target = Arc::new(deployed_target());
    let (pipeline, _rx) = pipeline(source.clone(), target.clone());

    let outcome = assert_ok!(pipeline.run(&spec(), None).await);
    let changes = match outcome {
        RunOutcome::Deployed(changes) => changes,
        other => panic!("expected a deployment, got {:?}", other),
    };
    assert_eq!(changes.to_upload, vec!["src/a.php", "new.txt"]);
    assert_eq!(changes.to_delete, vec!["old.txt"]);

    assert_eq!(
        target.calls_starting_with("delete:"),
        vec!["delete:/var/www/app/old.txt".to_string()]
    );
    assert!(source
        .calls
        .lock()
        .unwrap()
        .contains(&format!("diff:{}..{}", OLD, NEW)));
    assert_eq!(target.content(MARKER).unwrap(), NEW);
}

#[tokio::test]
async fn test_prerequisites_run_every_check_and_report_the_first_failure() {
    let source = Arc::new(FakeSource {
        git_ok: false,
        ..Default::default()
    });
    let target = Arc::new(FakeTarget {
        connectivity_ok: false,
        ..deployed_target()
    });
    let (pipeline, mut rx) = pipeline(source.clone(), target.clone());

    let failure = assert_err!(pipeline.run(&spec(), None).await);
    assert_eq!(failure.stage, Stage::CheckPrerequisites);
    assert!(matches!(failure.cause, DeployError::GitError(_)));

    let source_calls = source.calls.lock().unwrap().clone();
    assert_eq!(source_calls, vec!["check_git", "check_repository"]);
    assert_eq!(target.calls_starting_with("check_server").len(), 1);

    let events = drain(&mut rx);
    assert_eq!(count(&events, Severity::Danger), 2);
    assert_eq!(count(&events, Severity::Error), 1);
    assert_eq!(
        events.last().unwrap().message,
        "Prerequisites check failed. Aborting job."
    );
}

#[tokio::test]
async fn test_failed_upload_does_not_abort_and_marker_is_written() {
    let source = Arc::new(FakeSource {
        diff: vec![
            "M\ta.txt".to_string(),
            "M\tb.txt".to_string(),
            "M\tc.txt".to_string(),
        ],
        ..Default::default()
    });
    let target = Arc::new(FakeTarget {
        failing_uploads: ["/var/www/app/b.txt".to_string()].into_iter().collect(),
        ..deployed_target()
    });
    let (pipeline, mut rx) = pipeline(source, target.clone());

    assert_ok!(pipeline.run(&spec(), None).await);
    assert_eq!(
        target.calls_starting_with("upload:"),
        vec![
            "upload:/var/www/app/a.txt".to_string(),
            "upload:/var/www/app/b.txt".to_string(),
            "upload:/var/www/app/c.txt".to_string(),
        ]
    );
    assert!(target.content("/var/www/app/c.txt").is_some());
    assert_eq!(target.content(MARKER).unwrap(), NEW);

    let events = drain(&mut rx);
    assert_eq!(count(&events, Severity::Danger), 1);
    assert_eq!(count(&events, Severity::Error), 0);
    assert!(events.iter().any(|e| e.message == "Uploading b.txt: failed"));
    for path in ["a.txt", "c.txt"] {
        let prefix = format!("Uploading {}: success (", path);
        assert!(events
            .iter()
            .any(|e| e.message.starts_with(&prefix) && e.message.ends_with("s)")));
    }
}

#[tokio::test]
async fn test_list_mode_does_not_touch_the_target() {
    let source = Arc::new(FakeSource {
        diff: vec!["M\ta.txt".to_string(), "D\tb.txt".to_string()],
        ..Default::default()
    });
    let target = Arc::new(deployed_target());
    let (pipeline, _rx) = pipeline(source, target.clone());

    let outcome = assert_ok!(pipeline.run(&spec(), Some(true)).await);
    assert_eq!(
        outcome,
        RunOutcome::ChangesListed(ChangeSet {
            to_upload: vec!["a.txt".to_string()],
            to_delete: vec!["b.txt".to_string()],
        })
    );
    assert!(target.calls_starting_with("upload:").is_empty());
    assert!(target.calls_starting_with("delete:").is_empty());
    assert!(target.calls_starting_with("put:").is_empty());
    assert_eq!(target.content(MARKER).unwrap(), OLD);
}

#[tokio::test]
async fn test_non_empty_target_without_marker_aborts() {
    let target = Arc::new(FakeTarget::default().with_file("/var/www/app/index.html", "hi"));
    let (pipeline, mut rx) = pipeline(Arc::new(FakeSource::default()), target.clone());

    let failure = assert_err!(pipeline.run(&spec(), None).await);
    assert_eq!(failure.stage, Stage::ResolveRemoteRevision);
    assert!(matches!(failure.cause, DeployError::RevisionError(_)));
    assert!(target.calls_starting_with("upload:").is_empty());

    let events = drain(&mut rx);
    let aborts: Vec<_> = events.iter().filter(|e| e.severity.is_abort()).collect();
    assert_eq!(aborts.len(), 1);
    assert_eq!(aborts[0].message, "Could not estimate remote revision. Aborting job.");
}

#[tokio::test]
async fn test_empty_target_is_never_deployed() {
    let (pipeline, _rx) = pipeline(Arc::new(FakeSource::default()), Arc::new(FakeTarget::default()));

    let revision = assert_ok!(pipeline.resolve_remote_revision(&spec()).await);
    assert!(revision.is_never_deployed());
}

#[tokio::test]
async fn test_unreadable_target_is_unresolved() {
    let target = Arc::new(FakeTarget {
        list_ok: false,
        ..Default::default()
    });
    let (pipeline, _rx) = pipeline(Arc::new(FakeSource::default()), target);

    let err = assert_err!(pipeline.resolve_remote_revision(&spec()).await);
    assert!(matches!(err, DeployError::RevisionError(_)));
}

#[tokio::test]
async fn test_unknown_local_revision_aborts() {
    let source = Arc::new(FakeSource {
        revision: String::new(),
        ..Default::default()
    });
    let (pipeline, _rx) = pipeline(source, Arc::new(deployed_target()));

    let failure = assert_err!(pipeline.run(&spec(), None).await);
    assert_eq!(failure.stage, Stage::ResolveLocalRevision);
}

#[tokio::test]
async fn test_empty_diff_aborts_collection() {
    let source = Arc::new(FakeSource {
        diff: vec!["".to_string(), "X\tweird".to_string()],
        ..Default::default()
    });
    let target = Arc::new(deployed_target());
    let (pipeline, _rx) = pipeline(source, target.clone());

    let failure = assert_err!(pipeline.run(&spec(), None).await);
    assert_eq!(failure.stage, Stage::CollectChangedFiles);
    assert!(target.calls_starting_with("put:").is_empty());
}

#[tokio::test]
async fn test_marker_write_failure_aborts() {
    let source = Arc::new(FakeSource {
        diff: vec!["M\ta.txt".to_string()],
        ..Default::default()
    });
    let target = Arc::new(FakeTarget {
        marker_write_ok: false,
        ..deployed_target()
    });
    let (pipeline, _rx) = pipeline(source, target);

    let failure = assert_err!(pipeline.run(&spec(), None).await);
    assert_eq!(failure.stage, Stage::UpdateRemoteRevisionMarker);
    assert!(matches!(failure.cause, DeployError::MarkerWriteError(_)));
    assert!(failure.is_retryable());
}

#[tokio::test]
async fn test_prune_failure_is_not_escalated() {
    let source = Arc::new(FakeSource {
        prune_ok: false,
        revision: OLD.to_string(),
        ..Default::default()
    });
    let (pipeline, mut rx) = pipeline(source.clone(), Arc::new(deployed_target()));

    assert_ok!(pipeline.run(&spec(), None).await);
    assert!(source.calls.lock().unwrap().contains(&"prune".to_string()));
    assert!(drain(&mut rx)
        .iter()
        .any(|e| e.severity == Severity::Warning && e.message.contains("prune")));
}

#[tokio::test]
async fn test_missing_working_copy_is_cloned() {
    let source = Arc::new(FakeSource {
        exists: false,
        revision: OLD.to_string(),
        ..Default::default()
    });
    let (pipeline, _rx) = pipeline(source.clone(), Arc::new(deployed_target()));

    assert_ok!(pipeline.run(&spec(), None).await);
    let calls = source.calls.lock().unwrap().clone();
    assert!(calls.contains(&"clone".to_string()));
    assert!(!calls.contains(&"pull".to_string()));
    assert!(calls.contains(&"switch:master".to_string()));
}

#[tokio::test]
async fn test_invalid_spec_fails_validation_fatally() {
    let source = Arc::new(FakeSource::default());
    let (pipeline, mut rx) = pipeline(source.clone(), Arc::new(deployed_target()));
    let mut spec = spec();
    spec.branch = " ".to_string();

    let failure = assert_err!(pipeline.run(&spec, None).await);
    assert_eq!(failure.stage, Stage::Validate);
    assert!(matches!(failure.cause, DeployError::ConfigError(_)));
    assert!(!failure.is_retryable());
    assert!(source.calls.lock().unwrap().is_empty());

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].severity, Severity::Fatal);
}

#[tokio::test]
async fn test_cancel_before_prerequisites() {
    let source = Arc::new(FakeSource::default());
    let (pipeline, _rx) = pipeline(source.clone(), Arc::new(deployed_target()));
    pipeline.cancel_handle().cancel();

    let failure = assert_err!(pipeline.run(&spec(), None).await);
    assert!(matches!(failure.cause, DeployError::Cancelled));
    assert!(source.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_builder_requires_capabilities() {
    let result = Pipeline::builder()
        .source(Arc::new(FakeSource::default()))
        .build();
    assert!(matches!(result, Err(DeployError::ConfigError(_))));
}

#[tokio::test]
async fn test_lifecycle_events_fire_once_and_listener_errors_are_isolated() {
    let source = Arc::new(FakeSource {
        diff: vec!["M\ta.txt".to_string()],
        ..Default::default()
    });
    let (pipeline, _rx) = pipeline(source, Arc::new(deployed_target()));

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let counting: Listener = Arc::new(move |_ctx: &LifecycleContext<'_>| -> Result<(), String> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let failing: Listener =
        Arc::new(|_ctx: &LifecycleContext<'_>| -> Result<(), String> { Err("listener exploded".to_string()) });
    for event in LifecycleEvent::ALL {
        pipeline.events().on(event, failing.clone());
        pipeline.events().on(event, counting.clone());
        pipeline.events().on(event, counting.clone());
    }

    assert_ok!(pipeline.run(&spec(), None).await);
    assert_eq!(fired.load(Ordering::SeqCst), LifecycleEvent::ALL.len());
}

#[tokio::test]
async fn test_panicking_listener_does_not_skip_marker_write() {
    let source = Arc::new(FakeSource {
        diff: vec!["M\ta.txt".to_string()],
        ..Default::default()
    });
    let target = Arc::new(deployed_target());
    let (pipeline, _rx) = pipeline(source, target.clone());

    let panicking: Listener =
        Arc::new(|_ctx: &LifecycleContext<'_>| -> Result<(), String> { panic!("observer bug") });
    pipeline.events().on(LifecycleEvent::ChangedFilesProcessed, panicking);

    let outcome = assert_ok!(pipeline.run(&spec(), None).await);
    assert!(matches!(outcome, RunOutcome::Deployed(_)));
    assert_eq!(target.content(MARKER).unwrap(), NEW);
}

#[tokio::test]
async fn test_up_to_date_run_stops_after_preparation_events() {
    let source = Arc::new(FakeSource {
        revision: OLD.to_string(),
        ..Default::default()
    });
    let (pipeline, _rx) = pipeline(source, Arc::new(deployed_target()));

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    for event in LifecycleEvent::ALL {
        let seen = seen.clone();
        let listener: Listener = Arc::new(move |ctx: &LifecycleContext<'_>| -> Result<(), String> {
            assert!(ctx.local_revision.is_some() || event == LifecycleEvent::Started);
            seen.lock().unwrap().push(event);
            Ok(())
        });
        pipeline.events().on(event, listener);
    }

    assert_ok!(pipeline.run(&spec(), None).await);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![LifecycleEvent::Started, LifecycleEvent::PreparationCompleted]
    );
}

#[tokio::test]
async fn test_tasks_run_around_the_transfer() {
    let source = Arc::new(FakeSource {
        diff: vec!["M\ta.txt".to_string()],
        ..Default::default()
    });
    let target = Arc::new(deployed_target());
    let (pipeline, mut rx) = pipeline(source, target.clone());

    let mut spec = spec();
    spec.initiator = Initiator::Gui;
    spec.selected_tasks = vec!["maintenance".to_string(), "broken".to_string()];
    spec.tasks = vec![
        TaskDefinition {
            id: "maintenance".to_string(),
            name: "Maintenance mode".to_string(),
            command: "touch .maintenance".to_string(),
            run_on: TaskTiming::Before,
            enabled: false,
        },
        TaskDefinition {
            id: "broken".to_string(),
            name: "Broken".to_string(),
            command: "false".to_string(),
            run_on: TaskTiming::After,
            enabled: true,
        },
        TaskDefinition {
            id: "unselected".to_string(),
            name: "Unselected".to_string(),
            command: "rm -rf cache".to_string(),
            run_on: TaskTiming::After,
            enabled: true,
        },
    ];

    assert_ok!(pipeline.run(&spec, None).await);

    let calls = target.calls.lock().unwrap().clone();
    let position = |prefix: &str| calls.iter().position(|c| c.starts_with(prefix)).unwrap();
    assert_eq!(calls[position("exec:")], "exec:/var/www/app/:touch .maintenance");
    assert!(position("exec:/var/www/app/:touch") < position("upload:"));
    assert!(position("exec:/var/www/app/:false") > position("put:"));
    assert!(!calls.iter().any(|c| c.contains("rm -rf cache")));

    assert_eq!(count(&drain(&mut rx), Severity::Danger), 1);
}

#[tokio::test]
async fn test_file_diff_requires_commits() {
    let (pipeline, _rx) = pipeline(Arc::new(FakeSource::default()), Arc::new(deployed_target()));
    let old = Revision::parse(OLD).unwrap();
    let new = Revision::parse(NEW).unwrap();

    let diff = assert_ok!(pipeline.file_diff("a.txt", &new, &old).await);
    assert!(diff.contains("a/a.txt"));
    assert_err!(pipeline.file_diff("a.txt", &new, &Revision::never_deployed()).await);
}

#[tokio::test]
async fn test_shared_event_bus_via_builder() {
    let events = Arc::new(EventBus::new());
    let (builder, _rx) = builder(Arc::new(FakeSource::default()), Arc::new(deployed_target()));
    let pipeline = builder.events(events.clone()).build().unwrap();
    assert!(Arc::ptr_eq(pipeline.events(), &events));
}
