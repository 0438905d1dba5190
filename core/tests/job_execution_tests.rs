// tests/job_execution_tests.rs
mod common; // Reference the common module

use common::*;
use contest::core::event::{
  EVENT_RUN_FINISHED, EVENT_RUN_STARTED, EVENT_TARGETS_ACQUIRED, EVENT_TARGETS_RELEASED, EVENT_TARGET_ERR,
  EVENT_TARGET_IN, EVENT_TARGET_OUT, EVENT_TARGET_RELEASE_LEAK, EVENT_TARGET_SUSPENDED,
};
use contest::reporter::ReportPhase;
use contest::{ContestError, EngineConfig, JobHandle, JobState, MemoryEventSink, Orchestrator, TestStep};
use serial_test::serial;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn orchestrator(tm: Arc<FakeTargetManager>, sink: Arc<MemoryEventSink>) -> Orchestrator {
  Orchestrator::new(EngineConfig::default(), tm).with_event_sink(sink)
}

#[tokio::test]
#[serial]
async fn test_two_runs_all_targets_pass() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(3));
  let sink = Arc::new(MemoryEventSink::new());
  let reporter = Arc::new(RecordingReporter::default());
  let first = Arc::new(PassStep::default());
  let second = Arc::new(PassStep::default());
  let job = job_with(
    vec![("first", first.clone() as Arc<dyn TestStep>), ("second", second.clone() as Arc<dyn TestStep>)],
    2,
    reporter.clone(),
  );

  let summary = orchestrator(tm.clone(), sink.clone()).run(job).await.unwrap();

  assert_eq!(summary.state, JobState::Completed);
  assert_eq!((summary.succeeded, summary.failed, summary.aborted), (6, 0, 0));
  assert_eq!(summary.runs.len(), 2);
  assert!(!summary.degraded);
  assert!(summary.resume.is_none());
  assert_eq!(first.calls.load(Ordering::SeqCst), 6);
  assert_eq!(second.calls.load(Ordering::SeqCst), 6);

  assert_eq!(tm.acquired(), 6);
  assert_eq!(tm.released(), 6);
  assert_eq!(tm.held(), 0);

  assert_eq!(sink.job_state_names(), vec!["JobStateStarted", "JobStateCompleted"]);
  assert_eq!(sink.count(EVENT_RUN_STARTED), 2);
  assert_eq!(sink.count(EVENT_TARGETS_ACQUIRED), 2);
  assert_eq!(sink.count(EVENT_TARGETS_RELEASED), 2);
  assert_eq!(sink.count(EVENT_TARGET_IN), 12);
  assert_eq!(sink.count(EVENT_TARGET_OUT), 12);
  assert_eq!(
    reporter.phases(),
    vec![ReportPhase::Run(1), ReportPhase::Run(2), ReportPhase::Final]
  );
}

#[tokio::test]
#[serial]
async fn test_failing_target_leaves_pipeline_others_continue() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(3));
  let sink = Arc::new(MemoryEventSink::new());
  let after = Arc::new(PassStep::default());
  let job = job_with(
    vec![
      ("before", Arc::new(PassStep::default()) as Arc<dyn TestStep>),
      ("probe", Arc::new(FailTargetStep { failing: "target-2" }) as Arc<dyn TestStep>),
      ("after", after.clone() as Arc<dyn TestStep>),
    ],
    1,
    Arc::new(RecordingReporter::default()),
  );

  let summary = orchestrator(tm.clone(), sink.clone()).run(job).await.unwrap();

  assert_eq!(summary.state, JobState::Completed);
  assert_eq!((summary.succeeded, summary.failed), (2, 1));
  let failure = &summary.runs[0].failed[0];
  assert_eq!(failure.target.as_str(), "target-2");
  assert_eq!(failure.step, "probe");
  assert!(failure.error.contains("non-zero"));
  assert_eq!(after.calls.load(Ordering::SeqCst), 2);
  assert_eq!(target_ids(&summary.runs[0].passed), vec!["target-1", "target-3"]);
  assert_eq!(sink.count(EVENT_TARGET_ERR), 1);
  assert_eq!(tm.released(), 3);
}

#[tokio::test]
#[serial]
async fn test_fatal_step_error_fails_job() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(3));
  let sink = Arc::new(MemoryEventSink::new());
  let reporter = Arc::new(RecordingReporter::default());
  let job = job_with(
    vec![("flash", Arc::new(FatalStep) as Arc<dyn TestStep>)],
    3,
    reporter.clone(),
  );

  let summary = orchestrator(tm.clone(), sink.clone()).run(job).await.unwrap();

  assert_eq!(summary.state, JobState::Failed);
  let error = summary.error.unwrap_or_default();
  assert!(error.contains("flash"), "{}", error);
  assert!(error.contains("firmware image missing"), "{}", error);
  assert_eq!(summary.runs.len(), 1, "no further runs after a fatal error");
  assert!(summary.failed >= 1);
  assert_eq!(summary.succeeded, 0);
  assert_eq!(tm.acquired(), tm.released());
  assert_eq!(sink.job_state_names().last().map(String::as_str), Some("JobStateFailed"));
  assert_eq!(reporter.phases().last(), Some(&ReportPhase::Final));
}

#[tokio::test]
#[serial]
async fn test_transport_errors_are_retried() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(3));
  let flaky = Arc::new(FlakyStep::new(2));
  let config = EngineConfig {
    transport_retry_backoff: Duration::from_millis(1),
    ..EngineConfig::default()
  };
  let job = job_with(
    vec![("flaky", flaky.clone() as Arc<dyn TestStep>)],
    1,
    Arc::new(RecordingReporter::default()),
  );

  let summary = Orchestrator::new(config, tm).run(job).await.unwrap();

  assert_eq!(summary.state, JobState::Completed);
  assert_eq!(summary.succeeded, 3);
  assert_eq!(flaky.attempts("target-1"), 3);
}

#[tokio::test]
#[serial]
async fn test_transport_retries_are_bounded() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(2));
  let flaky = Arc::new(FlakyStep::new(10));
  let config = EngineConfig {
    max_transport_retries: 3,
    transport_retry_backoff: Duration::from_millis(1),
    ..EngineConfig::default()
  };
  let job = job_with(
    vec![("flaky", flaky.clone() as Arc<dyn TestStep>)],
    1,
    Arc::new(RecordingReporter::default()),
  );

  let summary = Orchestrator::new(config, tm).run(job).await.unwrap();

  assert_eq!(summary.state, JobState::Completed);
  assert_eq!((summary.succeeded, summary.failed), (0, 2));
  assert!(summary.runs[0].failed[0].error.starts_with("transport"));
  assert_eq!(flaky.attempts("target-2"), 4);
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_acquire_timeout_skips_run() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(3).slow_first(1, Duration::from_secs(10)));
  let sink = Arc::new(MemoryEventSink::new());
  let mut job = job_with(
    vec![("only", Arc::new(PassStep::default()) as Arc<dyn TestStep>)],
    2,
    Arc::new(RecordingReporter::default()),
  );
  job.target_manager_acquire_timeout = Duration::from_secs(1);

  let summary = orchestrator(tm.clone(), sink.clone()).run(job).await.unwrap();

  assert_eq!(summary.state, JobState::Completed);
  assert!(summary.runs[0].acquisition_error.is_some());
  assert!(summary.runs[0].passed.is_empty());
  assert_eq!(summary.runs[1].passed.len(), 3);
  assert_eq!(sink.count("TargetAcquireFailed"), 1);
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_acquire_timeout_on_last_run_fails_job() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(3).slow_first(1, Duration::from_secs(10)));
  let mut job = job_with(
    vec![("only", Arc::new(PassStep::default()) as Arc<dyn TestStep>)],
    1,
    Arc::new(RecordingReporter::default()),
  );
  job.target_manager_acquire_timeout = Duration::from_secs(1);

  let summary = Orchestrator::new(EngineConfig::default(), tm.clone()).run(job).await.unwrap();

  assert_eq!(summary.state, JobState::Failed);
  assert!(summary.error.unwrap_or_default().contains("could not acquire"));
  assert_eq!(tm.acquired(), tm.released());
}

#[tokio::test]
#[serial]
async fn test_release_failure_is_a_leak_not_a_failure() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(3).failing_release());
  let sink = Arc::new(MemoryEventSink::new());
  let job = job_with(
    vec![("only", Arc::new(PassStep::default()) as Arc<dyn TestStep>)],
    1,
    Arc::new(RecordingReporter::default()),
  );

  let summary = orchestrator(tm, sink.clone()).run(job).await.unwrap();

  assert_eq!(summary.state, JobState::Completed);
  assert_eq!(summary.succeeded, 3);
  assert_eq!(summary.leaked, 3);
  assert!(summary.degraded);
  assert_eq!(sink.count(EVENT_TARGET_RELEASE_LEAK), 1);
}

#[tokio::test]
#[serial]
async fn test_unrecoverable_reporter_stops_job() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(2));
  let reporter = Arc::new(RecordingReporter::unrecoverable());
  let job = job_with(
    vec![("only", Arc::new(PassStep::default()) as Arc<dyn TestStep>)],
    3,
    reporter.clone(),
  );

  let summary = Orchestrator::new(EngineConfig::default(), tm).run(job).await.unwrap();

  assert_eq!(summary.state, JobState::Failed);
  assert_eq!(summary.runs.len(), 1);
  assert!(summary.error.unwrap_or_default().contains("device bricked"));
  assert_eq!(reporter.phases(), vec![ReportPhase::Run(1), ReportPhase::Final]);
}

#[tokio::test]
#[serial]
async fn test_cancel_releases_every_target() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(3));
  let sink = Arc::new(MemoryEventSink::new());
  let reporter = Arc::new(RecordingReporter::default());
  let wait = Arc::new(WaitStep::default());
  let job = job_with(
    vec![
      ("wait", wait.clone() as Arc<dyn TestStep>),
      ("never", Arc::new(PassStep::default()) as Arc<dyn TestStep>),
    ],
    1,
    reporter.clone(),
  );
  let orchestrator = orchestrator(tm.clone(), sink.clone());
  let handle = JobHandle::new();

  let (summary, _) = tokio::join!(orchestrator.run_controlled(job, &handle), async {
    wait.wait_entered(3).await;
    handle.cancel();
  });
  let summary = summary.unwrap();

  assert_eq!(summary.state, JobState::Cancelled);
  assert_eq!(handle.state(), JobState::Cancelled);
  assert_eq!(summary.aborted, 3);
  assert_eq!(tm.acquired(), 3);
  assert_eq!(tm.released(), 3);
  assert_eq!(
    sink.job_state_names(),
    vec!["JobStateStarted", "JobStateCancelling", "JobStateCancelled"]
  );
  // run reporters are skipped for a cancelled run
  assert_eq!(reporter.phases(), vec![ReportPhase::Final]);
}

#[tokio::test]
#[serial]
async fn test_pause_checkpoints_and_resume_continues() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(3));
  let sink = Arc::new(MemoryEventSink::new());
  let wait = Arc::new(WaitStep::default());
  let tail = Arc::new(PassStep::default());
  let job = job_with(
    vec![("wait", wait.clone() as Arc<dyn TestStep>), ("tail", tail.clone() as Arc<dyn TestStep>)],
    1,
    Arc::new(RecordingReporter::default()),
  );
  let orchestrator = orchestrator(tm.clone(), sink.clone());

  let handle = JobHandle::new();
  let (paused, _) = tokio::join!(orchestrator.run_controlled(job.clone(), &handle), async {
    wait.wait_entered(3).await;
    handle.pause();
  });
  let paused = paused.unwrap();

  assert_eq!(paused.state, JobState::Paused);
  assert_eq!(tm.held(), 0, "a paused job holds no targets");
  assert_eq!(sink.count(EVENT_TARGET_SUSPENDED), 3);
  let state = paused.resume.expect("paused job carries its resume state");
  assert_eq!(state.run, 1);
  assert_eq!(state.targets.len(), 3);
  for cp in &state.targets {
    assert_eq!((cp.step_index, cp.step_label.as_str()), (0, "wait"));
    assert_eq!(
      cp.state.as_ref().map(|c| c.as_bytes().to_vec()),
      Some(format!("cp-{}", cp.target.id).into_bytes())
    );
  }

  let handle = JobHandle::new();
  let resumed = orchestrator.resume(job, &handle, state).await.unwrap();

  assert_eq!(resumed.state, JobState::Completed);
  assert_eq!(resumed.succeeded, 3);
  assert_eq!(resumed.runs.len(), 1);
  assert_eq!(
    wait.resumed(),
    vec![
      ("target-1".to_string(), b"cp-target-1".to_vec()),
      ("target-2".to_string(), b"cp-target-2".to_vec()),
      ("target-3".to_string(), b"cp-target-3".to_vec()),
    ]
  );
  assert_eq!(tail.calls.load(Ordering::SeqCst), 3);
  assert_eq!(tm.acquired(), 6);
  assert_eq!(tm.released(), 6);
  assert_eq!(
    sink.job_state_names(),
    vec!["JobStateStarted", "JobStatePaused", "JobStateStarted", "JobStateCompleted"]
  );
}

#[tokio::test]
#[serial]
async fn test_cancel_paused_job() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(2));
  let wait = Arc::new(WaitStep::default());
  let reporter = Arc::new(RecordingReporter::default());
  let job = job_with(vec![("wait", wait.clone() as Arc<dyn TestStep>)], 1, reporter.clone());
  let orchestrator = Orchestrator::new(EngineConfig::default(), tm.clone());

  let handle = JobHandle::new();
  let (paused, _) = tokio::join!(orchestrator.run_controlled(job.clone(), &handle), async {
    wait.wait_entered(2).await;
    handle.pause();
  });
  let state = paused.unwrap().resume.unwrap();

  let cancelled = orchestrator.cancel_paused(job, state).await.unwrap();
  assert_eq!(cancelled.state, JobState::Cancelled);
  assert_eq!(cancelled.aborted, 2);
  assert_eq!(tm.acquired(), 2, "cancelling a paused job acquires nothing");
  assert_eq!(reporter.phases(), vec![ReportPhase::Final]);
}

#[tokio::test]
#[serial]
async fn test_resume_state_of_another_job_is_rejected() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(1));
  let wait = Arc::new(WaitStep::default());
  let job = job_with(
    vec![("wait", wait.clone() as Arc<dyn TestStep>)],
    1,
    Arc::new(RecordingReporter::default()),
  );
  let orchestrator = Orchestrator::new(EngineConfig::default(), tm);

  let handle = JobHandle::new();
  let (paused, _) = tokio::join!(orchestrator.run_controlled(job.clone(), &handle), async {
    wait.wait_entered(1).await;
    handle.pause();
  });
  let mut state = paused.unwrap().resume.unwrap();
  state.job_id = contest::JobId(7);

  let err = orchestrator.resume(job, &JobHandle::new(), state).await.unwrap_err();
  assert!(matches!(err, ContestError::InvalidJob(_)));
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_pause_that_does_not_drain_in_time() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(2));
  let config = EngineConfig {
    pause_timeout: Duration::from_secs(1),
    step_grace_period: Duration::from_secs(600),
    ..EngineConfig::default()
  };
  let job = job_with(
    vec![("stubborn", Arc::new(StubbornStep) as Arc<dyn TestStep>)],
    1,
    Arc::new(RecordingReporter::default()),
  );
  let orchestrator = Orchestrator::new(config, tm.clone());
  let handle = JobHandle::new();

  let (summary, _) = tokio::join!(orchestrator.run_controlled(job, &handle), async {
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.pause();
  });
  let summary = summary.unwrap();

  assert_eq!(summary.state, JobState::PauseFailed);
  assert_eq!(summary.logical_state, JobState::Started);
  assert!(summary.error.unwrap_or_default().contains("Pause did not complete"));
  let state = summary.resume.expect("a failed pause still leaves resumable checkpoints");
  assert_eq!(state.targets.len(), 2);
  assert_eq!(tm.acquired(), tm.released());
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_cancel_that_does_not_drain_in_time() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(2));
  let sink = Arc::new(MemoryEventSink::new());
  let config = EngineConfig {
    cancel_timeout: Duration::from_secs(1),
    step_grace_period: Duration::from_secs(600),
    ..EngineConfig::default()
  };
  let job = job_with(
    vec![("stubborn", Arc::new(StubbornStep) as Arc<dyn TestStep>)],
    1,
    Arc::new(RecordingReporter::default()),
  );
  let orchestrator = Orchestrator::new(config, tm.clone()).with_event_sink(sink.clone());
  let handle = JobHandle::new();

  let (summary, _) = tokio::join!(orchestrator.run_controlled(job, &handle), async {
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();
  });
  let summary = summary.unwrap();

  assert_eq!(summary.state, JobState::CancellationFailed);
  assert_eq!(summary.aborted, 2);
  assert!(summary.resume.is_none());
  assert_eq!(tm.acquired(), tm.released());
  assert_eq!(
    sink.job_state_names(),
    vec!["JobStateStarted", "JobStateCancelling", "JobStateCancellationFailed"]
  );
}

#[tokio::test]
#[serial]
async fn test_invalid_job_is_rejected_before_acquiring() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(1));
  let mut job = job_with(
    vec![
      ("same", Arc::new(PassStep::default()) as Arc<dyn TestStep>),
      ("same", Arc::new(PassStep::default()) as Arc<dyn TestStep>),
    ],
    1,
    Arc::new(RecordingReporter::default()),
  );
  let orchestrator = Orchestrator::new(EngineConfig::default(), tm.clone());
  assert!(matches!(
    orchestrator.run(job.clone()).await,
    Err(ContestError::InvalidJob(_))
  ));

  job.steps.clear();
  assert!(orchestrator.run(job).await.is_err());
  assert_eq!(tm.acquire_calls(), 0);
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_pause_during_acquisition_keeps_the_run() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(3).slow_first(1, Duration::from_secs(2)));
  let sink = Arc::new(MemoryEventSink::new());
  let reporter = Arc::new(RecordingReporter::default());
  let pass = Arc::new(PassStep::default());
  let job = job_with(vec![("only", pass.clone() as Arc<dyn TestStep>)], 1, reporter.clone());
  let orchestrator = orchestrator(tm.clone(), sink.clone());

  let handle = JobHandle::new();
  let (paused, _) = tokio::join!(orchestrator.run_controlled(job.clone(), &handle), async {
    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.pause();
  });
  let paused = paused.unwrap();

  assert_eq!(paused.state, JobState::Paused);
  assert_eq!(paused.succeeded, 0);
  assert!(paused.runs.is_empty());
  assert_eq!(pass.calls.load(Ordering::SeqCst), 0);
  assert_eq!(tm.held(), 0, "targets acquired during the pause are handed back");
  assert_eq!(tm.acquired(), tm.released());
  assert!(reporter.phases().is_empty(), "an unstarted run is not reported");
  assert_eq!(sink.count(EVENT_RUN_FINISHED), 0);
  let state = paused.resume.expect("a run paused before it started is resumable");
  assert_eq!(state.run, 1);
  assert!(state.targets.is_empty());
  assert!(state.partial_run.is_none());

  let resumed = orchestrator.resume(job, &JobHandle::new(), state).await.unwrap();

  assert_eq!(resumed.state, JobState::Completed);
  assert_eq!(resumed.succeeded, 3);
  assert_eq!(resumed.runs.len(), 1);
  assert_eq!(resumed.runs[0].acquired, 3);
  assert_eq!(pass.calls.load(Ordering::SeqCst), 3);
  assert_eq!(reporter.phases(), vec![ReportPhase::Run(1), ReportPhase::Final]);
  assert_eq!(
    sink.job_state_names(),
    vec!["JobStateStarted", "JobStatePaused", "JobStateStarted", "JobStateCompleted"]
  );
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_cancel_during_acquisition() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(3).slow_first(1, Duration::from_secs(2)));
  let sink = Arc::new(MemoryEventSink::new());
  let pass = Arc::new(PassStep::default());
  let job = job_with(
    vec![("only", pass.clone() as Arc<dyn TestStep>)],
    1,
    Arc::new(RecordingReporter::default()),
  );
  let orchestrator = orchestrator(tm.clone(), sink.clone());

  let handle = JobHandle::new();
  let (summary, _) = tokio::join!(orchestrator.run_controlled(job, &handle), async {
    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.cancel();
  });
  let summary = summary.unwrap();

  assert_eq!(summary.state, JobState::Cancelled);
  assert_eq!(summary.succeeded, 0);
  assert!(summary.resume.is_none());
  assert_eq!(pass.calls.load(Ordering::SeqCst), 0);
  assert_eq!(tm.held(), 0);
  assert_eq!(
    sink.job_state_names(),
    vec!["JobStateStarted", "JobStateCancelling", "JobStateCancelled"]
  );
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_pause_between_runs_resumes_at_the_next_run() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(3));
  let pass = Arc::new(PassStep::default());
  let mut job = job_with(
    vec![("only", pass.clone() as Arc<dyn TestStep>)],
    2,
    Arc::new(RecordingReporter::default()),
  );
  job.run_interval = Duration::from_secs(10);
  let orchestrator = Orchestrator::new(EngineConfig::default(), tm.clone());

  let handle = JobHandle::new();
  let (paused, _) = tokio::join!(orchestrator.run_controlled(job.clone(), &handle), async {
    tokio::time::sleep(Duration::from_secs(1)).await;
    handle.pause();
  });
  let paused = paused.unwrap();

  assert_eq!(paused.state, JobState::Paused);
  assert_eq!(paused.succeeded, 3);
  assert_eq!(paused.runs.len(), 1);
  let state = paused.resume.unwrap();
  assert_eq!(state.run, 2);
  assert!(state.targets.is_empty());

  let resumed = orchestrator.resume(job, &JobHandle::new(), state).await.unwrap();

  assert_eq!(resumed.state, JobState::Completed);
  assert_eq!(resumed.runs.len(), 2);
  assert_eq!(resumed.succeeded, 6);
  assert_eq!(pass.calls.load(Ordering::SeqCst), 6);
  assert_eq!(tm.acquired(), tm.released());
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_cancel_between_runs() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(3));
  let sink = Arc::new(MemoryEventSink::new());
  let mut job = job_with(
    vec![("only", Arc::new(PassStep::default()) as Arc<dyn TestStep>)],
    2,
    Arc::new(RecordingReporter::default()),
  );
  job.run_interval = Duration::from_secs(10);
  let orchestrator = orchestrator(tm.clone(), sink.clone());

  let handle = JobHandle::new();
  let (summary, _) = tokio::join!(orchestrator.run_controlled(job, &handle), async {
    tokio::time::sleep(Duration::from_secs(1)).await;
    handle.cancel();
  });
  let summary = summary.unwrap();

  assert_eq!(summary.state, JobState::Cancelled);
  assert_eq!(summary.runs.len(), 1);
  assert_eq!(summary.succeeded, 3);
  assert_eq!(tm.acquire_calls(), 1);
  assert_eq!(tm.held(), 0);
  assert_eq!(sink.count(EVENT_RUN_STARTED), 1);
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_resume_that_cannot_reacquire_aborts_suspended_targets() {
  setup_tracing();
  let tm = Arc::new(FakeTargetManager::new(3));
  let wait = Arc::new(WaitStep::default());
  let mut job = job_with(
    vec![("wait", wait.clone() as Arc<dyn TestStep>)],
    1,
    Arc::new(RecordingReporter::default()),
  );
  job.target_manager_acquire_timeout = Duration::from_secs(1);
  let orchestrator = Orchestrator::new(EngineConfig::default(), tm.clone());

  let handle = JobHandle::new();
  let (paused, _) = tokio::join!(orchestrator.run_controlled(job.clone(), &handle), async {
    wait.wait_entered(3).await;
    handle.pause();
  });
  let state = paused.unwrap().resume.unwrap();
  assert_eq!(state.targets.len(), 3);

  tm.stall_acquires(Duration::from_secs(10));
  let resumed = orchestrator.resume(job, &JobHandle::new(), state).await.unwrap();

  assert_eq!(resumed.state, JobState::Failed);
  assert_eq!(resumed.runs.len(), 1);
  let run = &resumed.runs[0];
  assert_eq!(run.acquired, 3);
  assert!(run.acquisition_error.is_some());
  assert_eq!(run.passed.len() + run.failed.len() + run.aborted.len(), run.acquired);
  assert_eq!(target_ids(&run.aborted), vec!["target-1", "target-2", "target-3"]);
  assert_eq!(resumed.aborted, 3);
  assert!(wait.resumed().is_empty());
  assert_eq!(tm.held(), 0);
}
