use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use stagehand_host::DeploymentProvider;
use stagehand_host::error::OrchestratorError;
use stagehand_host::queue::SessionEvent;
use stagehand_host::store::{MoveDirection, ProjectVariable, SessionStore, TicketStatus};
use stagehand_host::testkit::{MockProvider, test_user};

#[path = "helpers.rs"]
mod helpers;

#[tokio::test]
async fn failing_ticket_does_not_disturb_earlier_ones() {
    let (orchestrator, store) = helpers::orchestrator(Arc::new(MockProvider::new()));
    let queue = orchestrator.sessions.get_or_create("s1", None);
    let mut events = queue.subscribe();

    let a = queue.submit("A", json!({}), None, || async { Ok(()) });
    let b = queue.submit("B", json!({}), None, || async { Ok(()) });
    let c = queue.submit("C", json!({}), None, || async {
        Err::<(), _>(OrchestratorError::Validation("bad input".into()))
    });

    a.wait().await.unwrap();
    b.wait().await.unwrap();
    assert!(matches!(c.wait().await, Err(OrchestratorError::Validation(_))));

    let terminal = helpers::collect_terminal(&mut events, 3).await;
    assert_eq!(
        terminal,
        vec![
            ("A".to_string(), "task-finished"),
            ("B".to_string(), "task-finished"),
            ("C".to_string(), "task-failed"),
        ]
    );

    let history = store.history("s1").await.unwrap();
    let statuses: Vec<_> = history.iter().map(|e| (e.name.as_str(), e.status)).collect();
    assert_eq!(
        statuses,
        vec![
            ("A", TicketStatus::Finished),
            ("B", TicketStatus::Finished),
            ("C", TicketStatus::Failed),
        ]
    );
    assert!(history[2].error.is_some());
    assert!(history[0].finished_at_ns.unwrap() <= history[2].finished_at_ns.unwrap());

    let value = queue
        .enqueue("D", json!({}), None, || async { Ok(42) })
        .await
        .unwrap();
    assert_eq!(value, 42);
}

#[tokio::test]
async fn tickets_run_one_at_a_time_in_submission_order() {
    let (orchestrator, _) = helpers::orchestrator(Arc::new(MockProvider::new()));
    let queue = orchestrator.sessions.get_or_create("s1", None);
    let order = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..5u64)
        .map(|i| {
            let order = order.clone();
            queue.submit(&format!("t{i}"), json!({}), None, move || async move {
                order.lock().unwrap().push(format!("start {i}"));
                tokio::time::sleep(Duration::from_millis(20 - i * 4)).await;
                order.lock().unwrap().push(format!("end {i}"));
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.wait().await.unwrap();
    }

    let expected: Vec<String> = (0..5)
        .flat_map(|i| [format!("start {i}"), format!("end {i}")])
        .collect();
    assert_eq!(*order.lock().unwrap(), expected);
}

#[tokio::test]
async fn shutdown_fails_queued_tickets() {
    let (orchestrator, store) = helpers::orchestrator(Arc::new(MockProvider::new()));
    let queue = orchestrator.sessions.get_or_create("s1", None);

    let running = queue.submit("slow", json!({}), None, || async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    });
    let queued = queue.submit("queued", json!({}), None, || async { Ok(()) });
    tokio::time::sleep(Duration::from_millis(50)).await;

    queue.shutdown().await;
    running.wait().await.unwrap();
    assert!(matches!(queued.wait().await, Err(OrchestratorError::QueueClosed)));

    let late = queue.submit("late", json!({}), None, || async { Ok(()) });
    assert!(matches!(late.wait().await, Err(OrchestratorError::QueueClosed)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let history = store.history("s1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].status, TicketStatus::Failed);
}

#[tokio::test]
async fn history_failure_is_reported_but_ticket_runs() {
    let (orchestrator, store) = helpers::orchestrator(Arc::new(MockProvider::new()));
    store.fail_history_creation(true);
    let queue = orchestrator.sessions.get_or_create("s1", None);
    let mut events = queue.subscribe();

    let value = queue
        .enqueue("A", json!({}), Some(test_user()), || async { Ok("ran") })
        .await
        .unwrap();
    assert_eq!(value, "ran");

    let event = helpers::wait_for_event(&mut events, |e| matches!(e, SessionEvent::Error { .. })).await;
    let SessionEvent::Error { report } = event else { unreachable!() };
    assert_eq!(report.message, "Error on creating a history entry");
    assert!(store.history("s1").await.unwrap().is_empty());
}

#[tokio::test]
async fn eval_attaches_and_streams_console_output() {
    let provider = Arc::new(MockProvider::new());
    let (orchestrator, store) = helpers::orchestrator(provider.clone());
    let queue = orchestrator.sessions.get_or_create("s1", Some(&test_user()));
    let mut events = queue.subscribe();

    let result = queue.eval_code("Python", "print(1)", Some(test_user())).await.unwrap();
    assert_eq!(result.output[0]["data"]["text/plain"], "print(1)");
    assert_eq!(provider.started(), 1);

    helpers::wait_for_event(&mut events, |e| matches!(e, SessionEvent::Console { .. })).await;
    let names: Vec<_> = store
        .history("s1")
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert_eq!(names, vec!["attachKernel", "evalCode"]);

    let infos = queue.kernel_infos(false);
    assert!(infos.contains_key("Python"));

    // A second evaluation reuses the attached kernel.
    queue.eval_code("Python", "2", None).await.unwrap();
    assert_eq!(provider.started(), 1);
}

#[tokio::test]
async fn clear_history_empties_the_store() {
    let (orchestrator, store) = helpers::orchestrator(Arc::new(MockProvider::new()));
    let queue = orchestrator.sessions.get_or_create("s1", None);
    let mut events = queue.subscribe();

    queue.enqueue("A", json!({}), None, || async { Ok(()) }).await.unwrap();
    queue.clear_history(None).await.unwrap();
    helpers::wait_for_event(&mut events, |e| matches!(e, SessionEvent::HistoryCleared)).await;

    // The clear ticket's own completion lands on an entry that is gone.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.history("s1").await.unwrap().is_empty());
    queue.enqueue("B", json!({}), None, || async { Ok(()) }).await.unwrap();
}

#[tokio::test]
async fn cells_are_evaluated_through_the_queue() {
    let (orchestrator, store) = helpers::orchestrator(Arc::new(MockProvider::new()));
    let queue = orchestrator.sessions.get_or_create("s1", None);
    let mut events = queue.subscribe();

    let cell = queue.create_cell("Python", None, None).await.unwrap();
    let evaluated = queue.eval_cell(&cell.id, "x = 1", None).await.unwrap();
    assert!(evaluated.evaluated);
    assert_eq!(evaluated.code, "x = 1");
    assert_eq!(evaluated.output[0]["data"]["text/plain"], "x = 1");
    assert!(queue.evaluating_cells().is_empty());

    helpers::wait_for_event(&mut events, |e| matches!(e, SessionEvent::CellOutput { .. })).await;
    let stored = store.cell("s1", &cell.id).await.unwrap();
    assert_eq!(stored, evaluated);

    queue.delete_cell(&cell.id, None).await.unwrap();
    assert!(store.cells("s1").await.unwrap().is_empty());
}

#[tokio::test]
async fn slow_history_store_keeps_task_events_in_order() {
    let (orchestrator, store) = helpers::orchestrator(Arc::new(MockProvider::new()));
    store.delay_history_creation(Some(Duration::from_millis(100)));
    let queue = orchestrator.sessions.get_or_create("s1", None);
    let mut events = queue.subscribe();

    let handle = queue.submit("fast", json!({}), None, || async { Ok(()) });
    let ticket = handle.id();
    handle.wait().await.unwrap();

    let mut seen = Vec::new();
    while seen.last() != Some(&"task-finished") {
        let event = helpers::wait_for_event(&mut events, |e| e.ticket_id() == Some(ticket)).await;
        seen.push(event.name());
    }
    assert_eq!(seen, vec!["task-queued", "task-started", "task-finished"]);

    let history = store.history("s1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, TicketStatus::Finished);
    assert!(history[0].started_at_ns.is_some());
}

#[tokio::test]
async fn cell_layout_changes_go_through_the_queue() {
    let (orchestrator, store) = helpers::orchestrator(Arc::new(MockProvider::new()));
    let queue = orchestrator.sessions.get_or_create("s1", None);
    let a = queue.create_cell("Python", None, None).await.unwrap();
    let b = queue.create_cell("R", None, None).await.unwrap();
    let c = queue.create_cell("Markdown", None, None).await.unwrap();

    let serde_json::Value::Object(props) = json!({ "title": "intro" }) else {
        unreachable!()
    };
    let updated = queue.set_cell_props(&c.id, props, None).await.unwrap();
    assert_eq!(updated.props["title"], "intro");

    queue.move_cell(&a.id, MoveDirection::Down, None).await.unwrap();
    queue.move_cell_to(&c.id, 1, None).await.unwrap();
    let order: Vec<_> = store.cells("s1").await.unwrap().into_iter().map(|c| c.id).collect();
    assert_eq!(order, vec![c.id.clone(), b.id.clone(), a.id.clone()]);

    let names: Vec<_> = store
        .history("s1")
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert_eq!(
        &names[3..],
        &["setCellProps", "moveCell", "moveCellTo"].map(String::from)
    );
}

#[tokio::test]
async fn cell_evaluation_exports_variables_and_merges_globals() {
    let provider = Arc::new(MockProvider::new());
    let (orchestrator, store) = helpers::orchestrator(provider.clone());
    store.set_project_variables(
        "s1",
        vec![ProjectVariable {
            name: "API_URL".into(),
            value: "http://db".into(),
        }],
    );
    let queue = orchestrator.sessions.get_or_create("s1", None);
    let mut events = queue.subscribe();

    let py = queue.create_cell("Python", None, None).await.unwrap();
    let r = queue.create_cell("R", None, None).await.unwrap();
    let evaluated = queue
        .eval_cell(&py.id, "import numpy\nx = 1", None)
        .await
        .unwrap();
    assert_eq!(evaluated.dependencies, vec!["numpy".to_string()]);

    let codes: Vec<_> = provider.status()[0]
        .history
        .iter()
        .filter(|e| e.event == "CODE")
        .filter_map(|e| e.data.clone())
        .collect();
    assert_eq!(
        codes,
        vec![
            json!("import os\nos.environ[\"API_URL\"] = \"http://db\""),
            json!("import numpy\nx = 1"),
        ]
    );

    let event = helpers::wait_for_event(&mut events, |e| matches!(e, SessionEvent::SetGlobals { .. })).await;
    let SessionEvent::SetGlobals { globals } = event else { unreachable!() };
    assert_eq!(globals, vec![json!({ "name": "x", "content": "1", "language": "Python" })]);

    queue.eval_cell(&r.id, "y = 2", None).await.unwrap();
    queue.eval_cell(&py.id, "z = 3", None).await.unwrap();
    let mut names: Vec<_> = store
        .globals("s1")
        .await
        .unwrap()
        .iter()
        .map(|g| format!("{}:{}", g["language"].as_str().unwrap(), g["name"].as_str().unwrap()))
        .collect();
    names.sort();
    assert_eq!(names, vec!["Python:z", "R:y"]);
}
