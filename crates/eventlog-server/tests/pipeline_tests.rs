//! Ingestion pipeline tests over scripted sources

mod common;

use common::*;
use eventlog_common::{Category, SyncState};
use eventlog_server::ingest::{Destination, RunOutcome, RunProgress, StatusStore};

#[tokio::test]
async fn test_callout_run_counts_metrics_and_clears_checkpoint() {
    let harness = Harness::new();
    harness
        .source
        .add_file(Category::ApexCallout, day(16), vec![Script::ok(callout_csv(5))]);

    let progress = RunProgress::new();
    let outcome = harness
        .state
        .pipeline
        .run(day(16), Category::ApexCallout, 1, &progress)
        .await;

    let RunOutcome::Success(status) = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(
        status.message,
        "Processed 5 events of type ApexCallout for 2025-03-16"
    );
    assert_eq!(
        harness
            .metrics
            .counter_value(Category::ApexCallout, &callout_labels()),
        Some(5)
    );
    assert!(harness.sink.rows().is_empty());
    assert_eq!(progress.snapshot(), (5, 5));

    // Counting pass plus processing pass
    assert_eq!(harness.source.open_count(), 2);

    // Row 0 marks the run as started
    let history = harness.store.checkpoint_history();
    assert_eq!(history.iter().map(|cp| cp.row).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5]);
    assert!(history.iter().all(|cp| cp.rows_total == 5));
    assert!(harness.store.load_checkpoints().await.unwrap().is_empty());

    let persisted = harness
        .state
        .statuses
        .get(day(16), Category::ApexCallout)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(persisted.state, SyncState::Success);
}

#[tokio::test]
async fn test_exception_rows_go_to_both_destinations() {
    let harness = Harness::new();
    harness.source.add_file(
        Category::ApexUnexpectedException,
        day(16),
        vec![Script::ok(exception_csv(3))],
    );

    let outcome = harness
        .state
        .pipeline
        .run(day(16), Category::ApexUnexpectedException, 1, &RunProgress::new())
        .await;
    assert!(matches!(outcome, RunOutcome::Success(_)));

    assert_eq!(
        harness.sink.messages(Destination::Public),
        vec!["boom 1", "boom 2", "boom 3"]
    );
    assert_eq!(
        harness.sink.messages(Destination::Secure),
        vec!["boom 1", "boom 2", "boom 3"]
    );

    for (destination, _, context) in harness.sink.rows() {
        assert_eq!(context["event_type"], "ApexUnexpectedException");
        assert_eq!(context["log_rows_total"], "3");
        assert_eq!(context["ORGANIZATION_ID"], "00DORG");
        match destination {
            Destination::Public => {
                assert!(!context.contains_key("STACK_TRACE"));
                assert!(!context.contains_key("USER_ID"));
            },
            Destination::Secure => {
                assert!(context["STACK_TRACE"].starts_with("Class.Foo.bar"));
                assert_eq!(context["USER_ID_DERIVED"], "005USERDERIVED");
            },
        }
    }
}

#[tokio::test]
async fn test_interrupted_run_resumes_after_last_checkpoint() {
    let harness = Harness::new();
    let csv = callout_csv(200);
    harness.source.add_file(
        Category::ApexCallout,
        day(16),
        vec![
            Script::ok(csv.clone()),
            Script::failing(csv.clone(), 140),
            Script::ok(csv),
        ],
    );

    let first = harness
        .state
        .pipeline
        .run(day(16), Category::ApexCallout, 1, &RunProgress::new())
        .await;
    let RunOutcome::Failure(failure) = first else {
        panic!("expected failure, got {first:?}");
    };
    assert!(
        failure.message.starts_with("TransportError"),
        "unexpected message {}",
        failure.message
    );

    let checkpoints = harness.store.load_checkpoints().await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].row, 140);
    assert_eq!(checkpoints[0].rows_total, 200);

    harness.store.clear_history();
    let second = harness
        .state
        .pipeline
        .run(
            day(16),
            Category::ApexCallout,
            checkpoints[0].resume_from(),
            &RunProgress::new(),
        )
        .await;
    let RunOutcome::Success(status) = second else {
        panic!("expected success, got {second:?}");
    };
    assert_eq!(
        status.message,
        "Processed 200 events of type ApexCallout for 2025-03-16 \
         (pickup from 141 in current run, skipped 140)"
    );

    let history = harness.store.checkpoint_history();
    assert_eq!(history.first().map(|cp| cp.row), Some(141));
    assert_eq!(history.last().map(|cp| cp.row), Some(200));
    assert_eq!(history.len(), 60);
    assert!(harness.store.load_checkpoints().await.unwrap().is_empty());

    // Rows before the resume point are not recounted
    assert_eq!(
        harness
            .metrics
            .counter_value(Category::ApexCallout, &callout_labels()),
        Some(200)
    );
}

#[tokio::test]
async fn test_run_interrupted_before_first_row_leaves_checkpoint() {
    let harness = Harness::new();
    let csv = callout_csv(5);
    harness.source.add_file(
        Category::ApexCallout,
        day(16),
        vec![Script::ok(csv.clone()), Script::failing(csv, 0)],
    );

    let outcome = harness
        .state
        .pipeline
        .run(day(16), Category::ApexCallout, 1, &RunProgress::new())
        .await;
    assert!(matches!(outcome, RunOutcome::Failure(_)));

    let checkpoints = harness.store.load_checkpoints().await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].row, 0);
    assert_eq!(checkpoints[0].rows_total, 5);
    assert!(!checkpoints[0].is_complete());
    assert_eq!(checkpoints[0].resume_from(), 1);
}

#[tokio::test]
async fn test_invalid_utf8_is_replaced_not_fatal() {
    let harness = Harness::new();
    let csv = exception_csv(3).replace("boom 2", "boom @2").into_bytes();
    let csv: Vec<u8> = csv
        .into_iter()
        .map(|byte| if byte == b'@' { 0xFF } else { byte })
        .collect();
    harness.source.add_file(
        Category::ApexUnexpectedException,
        day(16),
        vec![Script::bytes(csv)],
    );

    let progress = RunProgress::new();
    let outcome = harness
        .state
        .pipeline
        .run(day(16), Category::ApexUnexpectedException, 1, &progress)
        .await;

    let RunOutcome::Success(status) = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(
        status.message,
        "Processed 3 events of type ApexUnexpectedException for 2025-03-16"
    );
    assert_eq!(progress.snapshot(), (3, 3));
    assert_eq!(
        harness.sink.messages(Destination::Public),
        vec!["boom 1", "boom \u{FFFD}2", "boom 3"]
    );
}

#[tokio::test]
async fn test_messages_keep_surrounding_whitespace() {
    let harness = Harness::new();
    let csv = exception_csv(1).replace(",boom 1,", ",  boom 1  ,");
    harness.source.add_file(
        Category::ApexUnexpectedException,
        day(16),
        vec![Script::ok(csv)],
    );

    harness
        .state
        .pipeline
        .run(day(16), Category::ApexUnexpectedException, 1, &RunProgress::new())
        .await;

    assert_eq!(
        harness.sink.messages(Destination::Secure),
        vec!["  boom 1  "]
    );
}

#[tokio::test]
async fn test_passes_are_not_reconciled() {
    let harness = Harness::new();
    harness.source.add_file(
        Category::ApexCallout,
        day(16),
        vec![Script::ok(callout_csv(3)), Script::ok(callout_csv(5))],
    );

    let outcome = harness
        .state
        .pipeline
        .run(day(16), Category::ApexCallout, 1, &RunProgress::new())
        .await;

    let RunOutcome::Success(status) = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(
        status.message,
        "Processed 3 events of type ApexCallout for 2025-03-16"
    );
    let history = harness.store.checkpoint_history();
    let last = history.last().unwrap();
    assert_eq!(last.row, 5);
    assert_eq!(last.rows_total, 3);
}

#[tokio::test]
async fn test_bad_metric_rows_do_not_fail_the_run() {
    let harness = Harness::new();
    let csv = format!(
        "{CALLOUT_HEADER}\n\
         ApexCallout,2025,REQ1,005USER,REST,GET,1,200,https://api.example.com/v1,42,10,2048\n\
         ApexCallout,2025-03-16T10:00:00.000Z,REQ2,005USER,REST,GET,1,200,https://api.example.com/v1/orders/1000?page=2,42,10,2048\n"
    );
    harness
        .source
        .add_file(Category::ApexCallout, day(16), vec![Script::ok(csv)]);

    let outcome = harness
        .state
        .pipeline
        .run(day(16), Category::ApexCallout, 1, &RunProgress::new())
        .await;
    assert!(matches!(outcome, RunOutcome::Success(_)));
    assert_eq!(
        harness
            .metrics
            .counter_value(Category::ApexCallout, &callout_labels()),
        Some(1)
    );
}

#[tokio::test]
async fn test_missing_file_persists_nothing() {
    let harness = Harness::new();

    let outcome = harness
        .state
        .pipeline
        .run(day(16), Category::ApexCallout, 1, &RunProgress::new())
        .await;

    let RunOutcome::NoFile(status) = outcome else {
        panic!("expected no file, got {outcome:?}");
    };
    assert_eq!(status.state, SyncState::NoFile);
    assert_eq!(status.message, "No log file exists for date 2025-03-16");
    assert!(harness.store.load_statuses().await.unwrap().is_empty());
    assert_eq!(harness.source.open_count(), 0);
}

#[tokio::test]
async fn test_duplicate_files_fail_as_inventory_inconsistency() {
    let harness = Harness::new();
    harness
        .source
        .add_file(Category::ApexCallout, day(16), vec![Script::ok(callout_csv(1))]);
    harness
        .source
        .add_file(Category::ApexCallout, day(16), vec![Script::ok(callout_csv(1))]);

    let outcome = harness
        .state
        .pipeline
        .run(day(16), Category::ApexCallout, 1, &RunProgress::new())
        .await;

    let RunOutcome::Failure(status) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(status.message.starts_with("InventoryInconsistency"));
    assert_eq!(harness.source.open_count(), 0);
}

#[tokio::test]
async fn test_unreadable_file_fails_with_status_kind() {
    let harness = Harness::new();
    harness
        .source
        .add_file(Category::ApexCallout, day(16), Vec::new());

    let outcome = harness
        .state
        .pipeline
        .run(day(16), Category::ApexCallout, 1, &RunProgress::new())
        .await;

    let RunOutcome::Failure(status) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(status.message.starts_with("HttpStatusError"));
    let persisted = harness
        .state
        .statuses
        .get(day(16), Category::ApexCallout)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(persisted.state, SyncState::Failure);
}

#[tokio::test]
async fn test_inspection_rows_only_emitted_in_local_mode() {
    let csv = "EVENT_TYPE,FLOW_NAME\nFlowExecution,Nightly_Cleanup\n".to_string();

    let quiet = Harness::new();
    quiet
        .source
        .add_file(Category::FlowExecution, day(16), vec![Script::ok(csv.clone())]);
    quiet
        .state
        .pipeline
        .run(day(16), Category::FlowExecution, 1, &RunProgress::new())
        .await;
    assert!(quiet.sink.rows().is_empty());

    let local = Harness::with_config(eventlog_server::config::SyncConfig {
        local: true,
        ..fast_sync_config()
    });
    local
        .source
        .add_file(Category::FlowExecution, day(16), vec![Script::ok(csv)]);
    local
        .state
        .pipeline
        .run(day(16), Category::FlowExecution, 1, &RunProgress::new())
        .await;
    assert_eq!(
        local.sink.messages(Destination::Public),
        vec![r#"{"EVENT_TYPE":"FlowExecution","FLOW_NAME":"Nightly_Cleanup"}"#]
    );
}

#[tokio::test]
async fn test_examine_counts_without_processing() {
    let harness = Harness::new();
    harness
        .source
        .add_file(Category::ApexCallout, day(16), vec![Script::ok(callout_csv(7))]);

    let rows = harness
        .state
        .pipeline
        .examine(day(16), Category::ApexCallout)
        .await
        .unwrap();
    assert_eq!(rows, Some(7));
    assert_eq!(harness.source.open_count(), 1);
    assert!(harness.store.checkpoint_history().is_empty());

    let missing = harness
        .state
        .pipeline
        .examine(day(15), Category::ApexCallout)
        .await
        .unwrap();
    assert_eq!(missing, None);
}
