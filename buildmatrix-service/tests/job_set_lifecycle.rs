// End-to-end: matrix file -> scheduled job set -> reopened summary

use buildmatrix_service::{
    render, summarize, JobStatus, MatrixDefinition, MatrixExpander, ProcessExecutor,
    RepositoryIdentity, ReportFormat, Scheduler, SchedulerConfig, SourceRef, StateError,
    StateStore,
};

use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const MATRIX: &str = r#"
language: ruby
runtime:
  - "2.1"
  - "1.9"
env:
  - SUITE=unit
  - SUITE=broken
"#;

fn repository() -> RepositoryIdentity {
    RepositoryIdentity {
        url: "https://example.com/app.git".to_string(),
        commit: "abc1234".to_string(),
        sha: "abc1234def5678".to_string(),
        subject: "Add widgets".to_string(),
        ..Default::default()
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_run_reopen_and_summarize() {
    let checkout = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    fs::write(checkout.path().join(".travis.yml"), MATRIX).unwrap();

    let axes = vec!["runtime".to_string(), "env".to_string()];
    let definition = MatrixDefinition::from_file(checkout.path().join(".travis.yml"), &axes).unwrap();
    let environments = MatrixExpander::with_axes(axes).expand(&definition);
    assert_eq!(environments.len(), 4);

    let store = StateStore::new(output.path());
    let set = store.create_job_set(repository()).unwrap();
    let source = SourceRef {
        checkout: checkout.path().to_path_buf(),
        repository: repository(),
    };

    // Jobs fail when their env axis selects the broken suite
    let executor = ProcessExecutor::new(
        "echo \"commit $BUILDMATRIX_COMMIT runtime $runtime\"; test \"$env\" != SUITE=broken",
    );
    let scheduler = Scheduler::new(
        Arc::new(executor),
        SchedulerConfig {
            max_concurrency: 2,
            job_timeout: Duration::from_secs(30),
        },
    );
    let outcome = scheduler.run(&set, environments, &source).await.unwrap();

    assert!(outcome.sealed);
    assert_eq!((outcome.passed, outcome.failed), (2, 2));
    assert_eq!(store.list_job_sets().unwrap(), vec![set.path().to_path_buf()]);

    // A fresh process would only have the path
    let view = store.open_sealed_job_set(set.path()).unwrap();
    assert_eq!(view.manifest().repository.commit, "abc1234");

    let summary = summarize(&view).unwrap();
    assert!(!summary.passed);
    let jobs: Vec<(u32, &str, JobStatus)> = summary
        .jobs
        .iter()
        .map(|j| (j.ordinal, j.environment.as_str(), j.status))
        .collect();
    assert_eq!(
        jobs,
        vec![
            (1, "runtime=1.9; env=SUITE=broken", JobStatus::Failed),
            (2, "runtime=1.9; env=SUITE=unit", JobStatus::Passed),
            (3, "runtime=2.1; env=SUITE=broken", JobStatus::Failed),
            (4, "runtime=2.1; env=SUITE=unit", JobStatus::Passed),
        ]
    );

    let log = view.jobs()[3].read_log().unwrap();
    assert_eq!(
        String::from_utf8(log).unwrap(),
        "commit abc1234def5678 runtime 2.1\n"
    );

    let tap = render(&summary, ReportFormat::Tap);
    assert!(tap.contains("not ok 1 - runtime=1.9; env=SUITE=broken"));
    assert!(tap.contains("ok 4 - runtime=2.1; env=SUITE=unit"));
}

#[tokio::test]
async fn test_interrupted_run_cannot_be_finalized() {
    let output = TempDir::new().unwrap();
    let store = StateStore::new(output.path());
    let set = store.create_job_set(repository()).unwrap();

    let environments = MatrixExpander::new()
        .expand(&MatrixDefinition::new().with_values("env", ["A", "B"]));
    for (i, environment) in environments.iter().enumerate() {
        set.add_job(environment, i as u32 + 1).unwrap();
    }

    let view = store.open_job_set(set.path()).unwrap();
    assert_eq!(view.pending(), vec![1, 2]);
    assert!(!view.is_sealed());

    let err = store.open_sealed_job_set(set.path()).unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, StateError::IncompleteJobSet { .. }));
}
