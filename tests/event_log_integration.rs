use std::sync::{Arc, Mutex};

use serde_json::json;
use taskforge::domain::models::config::TaskLogConfig;
use taskforge::domain::models::event::{
    apply_event, EventFilter, TaskEvent, TaskEventPayload, TaskState, TaskStatus,
};
use taskforge::services::TaskLog;

fn lifecycle_events(task: &str) -> Vec<TaskEvent> {
    vec![
        TaskEvent::new(task, TaskEventPayload::TaskCreated { description: None }),
        TaskEvent::new(
            task,
            TaskEventPayload::TaskStarted {
                strategy: Some("atomic".into()),
            },
        ),
        TaskEvent::new(
            task,
            TaskEventPayload::TaskProgress {
                percent: 50,
                message: None,
            },
        ),
        TaskEvent::new(task, TaskEventPayload::TaskCompleted { result: json!("ok") }),
    ]
}

#[test]
fn sequence_ids_are_strictly_increasing_and_unique() {
    let log = TaskLog::default();
    for task in ["a", "b", "c"] {
        for event in lifecycle_events(task) {
            log.append(event);
        }
    }

    let all = log.get_event_history(&EventFilter::new());
    assert_eq!(all.len(), 12);
    for pair in all.windows(2) {
        assert!(pair[0].sequence_id < pair[1].sequence_id);
    }

    // Per-task histories stay strictly increasing too.
    let for_b = log.get_event_history(&EventFilter::new().task("b"));
    for pair in for_b.windows(2) {
        assert!(pair[0].sequence_id < pair[1].sequence_id);
    }
}

#[test]
fn projection_equals_fold_from_snapshot() {
    // Snapshot every 2 appends so the projection must combine a snapshot
    // with a fold over the tail.
    let log = TaskLog::new(TaskLogConfig {
        snapshot_interval: 2,
    });
    for event in lifecycle_events("t") {
        log.append(event);
    }

    let projected = log.get_projection("t");

    let manual = log
        .get_event_history(&EventFilter::new().task("t"))
        .iter()
        .fold(TaskState::pending("t"), |state, event| {
            apply_event(state, event)
        });

    assert_eq!(projected.status, manual.status);
    assert_eq!(projected.progress, manual.progress);
    assert_eq!(projected.result, manual.result);
    assert_eq!(projected.success, manual.success);
}

#[test]
fn export_import_round_trip_preserves_projections() {
    let log = TaskLog::default();
    for task in ["a", "b"] {
        for event in lifecycle_events(task) {
            log.append(event);
        }
    }
    log.append(TaskEvent::new(
        "c",
        TaskEventPayload::TaskFailed {
            error: "boom".into(),
            stack: None,
            reason: None,
        },
    ));

    let export = log.export();
    assert_eq!(export.metadata.total_events, 9);

    let fresh = TaskLog::default();
    fresh.import(export).unwrap();

    for task in ["a", "b", "c"] {
        let original = log.get_projection(task);
        let imported = fresh.get_projection(task);
        assert_eq!(imported.status, original.status, "task {task}");
        assert_eq!(imported.result, original.result, "task {task}");
        assert_eq!(imported.error, original.error, "task {task}");
    }
}

#[test]
fn replay_produces_final_states_without_mutation() {
    let log = TaskLog::default();
    for event in lifecycle_events("p") {
        log.append(event);
    }

    let before = log.len();
    let replay = log.replay(0, 1).unwrap();
    assert_eq!(replay.events.len(), 2);
    // Only created + started were replayed.
    assert_eq!(replay.final_states["p"].status, TaskStatus::Executing);
    assert_eq!(log.len(), before);
}

#[test]
fn subscribers_see_events_in_order_exactly_once() {
    let log = Arc::new(TaskLog::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        log.subscribe(
            EventFilter::new(),
            Arc::new(move |event| {
                seen.lock().unwrap().push(event.sequence_id);
            }),
        );
    }

    for event in lifecycle_events("t") {
        log.append(event);
    }

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![0, 1, 2, 3]);
}

#[test]
fn scenario_projection_after_decomposition() {
    let log = TaskLog::default();
    log.append(TaskEvent::new(
        "P",
        TaskEventPayload::TaskCreated { description: None },
    ));
    log.append(TaskEvent::new(
        "P",
        TaskEventPayload::TaskDecomposed {
            subtasks: vec!["s1".into(), "s2".into(), "s3".into()],
        },
    ));
    log.append(TaskEvent::new(
        "P",
        TaskEventPayload::SubtaskStarted {
            subtask_id: "s1".into(),
        },
    ));
    log.append(TaskEvent::new(
        "P",
        TaskEventPayload::SubtaskCompleted {
            subtask_id: "s1".into(),
            result: json!({"ok": true}),
        },
    ));

    let state = log.get_projection("P");
    assert_eq!(state.status, TaskStatus::Decomposed);
    assert_eq!(state.subtasks, vec!["s1", "s2", "s3"]);
    assert_eq!(state.completed_subtasks, vec!["s1"]);
    assert_eq!(state.subtask_results["s1"], json!({"ok": true}));
}
