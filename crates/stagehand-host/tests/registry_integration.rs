use std::sync::Arc;
use std::time::Duration;

use stagehand_host::config::OrchestratorConfig;
use stagehand_host::error::{ErrorKind, OrchestratorError};
use stagehand_host::kernel::KernelStatus;
use stagehand_host::queue::SessionEvent;
use stagehand_host::testkit::{MockProvider, test_user};

#[path = "helpers.rs"]
mod helpers;

#[tokio::test]
async fn sessions_in_one_scope_share_a_kernel() {
    let provider = Arc::new(MockProvider::new().with_start_delay(Duration::from_millis(30)));
    let (orchestrator, store) = helpers::orchestrator(provider.clone());
    store.set_scope("s1", "project");
    store.set_scope("s2", "project");
    store.set_scope("s3", "other");

    let q1 = orchestrator.sessions.get_or_create("s1", None);
    let q2 = orchestrator.sessions.get_or_create("s2", None);
    let q3 = orchestrator.sessions.get_or_create("s3", None);
    let (k1, k2, k3) = tokio::join!(
        q1.attach_kernel("Python", Some(test_user())),
        q2.attach_kernel("Python", None),
        q3.attach_kernel("Python", None),
    );
    let (k1, k2, k3) = (k1.unwrap(), k2.unwrap(), k3.unwrap());

    assert!(Arc::ptr_eq(&k1, &k2));
    assert!(!Arc::ptr_eq(&k1, &k3));
    assert_eq!(provider.started(), 2);
    assert_eq!(orchestrator.registry.scopes(), vec!["other", "project"]);
    assert_eq!(orchestrator.registry.attached_types("project"), vec!["Python"]);
}

#[tokio::test]
async fn unknown_kernel_type_is_a_validation_error() {
    let (orchestrator, _) = helpers::orchestrator(Arc::new(MockProvider::new()));
    let queue = orchestrator.sessions.get_or_create("s1", None);
    let err = queue.attach_kernel("Cobol", None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownKernel(_)));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(orchestrator.registry.scopes().is_empty());
}

#[tokio::test]
async fn failed_creation_evicts_the_kernel() {
    let provider = Arc::new(MockProvider::failing("no capacity"));
    let (orchestrator, _) = helpers::orchestrator(provider);
    let queue = orchestrator.sessions.get_or_create("s1", None);
    let mut events = queue.subscribe();

    let err = queue.attach_kernel("R", None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Backend(_)));
    assert!(orchestrator.registry.get("R", "s1").is_none());
    assert!(queue.kernel("R").is_none());

    let failed =
        helpers::wait_for_event(&mut events, |e| matches!(e, SessionEvent::TaskFailed { .. })).await;
    let SessionEvent::TaskFailed { entry } = failed else { unreachable!() };
    assert_eq!(entry.name, "attachKernel");
    assert!(entry.error.unwrap().message.contains("no capacity"));

    // The next attach starts over with a fresh kernel.
    assert!(queue.attach_kernel("R", None).await.is_err());
    assert!(orchestrator.registry.get("R", "s1").is_none());
}

#[tokio::test(start_paused = true)]
async fn detached_kernel_survives_the_grace_period_only() {
    let provider = Arc::new(MockProvider::new());
    let config = OrchestratorConfig {
        detach_grace: Duration::from_secs(60),
        ..OrchestratorConfig::default()
    };
    let (orchestrator, store) = helpers::orchestrator_with(config, provider.clone());
    store.set_scope("s1", "project");
    store.set_scope("s2", "project");
    let registry = orchestrator.registry.clone();

    let q1 = orchestrator.sessions.get_or_create("s1", None);
    let kernel = q1.attach_kernel("Python", None).await.unwrap();
    assert!(q1.shutdown_kernel("Python"));
    assert!(registry.is_detaching("Python", "project"));

    // Re-attaching inside the grace period cancels the teardown.
    tokio::time::sleep(Duration::from_secs(30)).await;
    let q2 = orchestrator.sessions.get_or_create("s2", None);
    let again = q2.attach_kernel("Python", None).await.unwrap();
    assert!(Arc::ptr_eq(&kernel, &again));
    assert!(!registry.is_detaching("Python", "project"));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(registry.get("Python", "project").is_some());
    assert_eq!(provider.stopped(), 0);

    // A later detach restarts the full grace period.
    q2.shutdown_kernel("Python");
    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(registry.get("Python", "project").is_some());
    tokio::time::sleep(Duration::from_secs(2)).await;
    for _ in 0..50 {
        if kernel.status() == KernelStatus::Dead {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(registry.get("Python", "project").is_none());
    assert!(registry.scopes().is_empty());
    assert_eq!(provider.stopped(), 1);
    assert_eq!(kernel.status(), KernelStatus::Dead);
}

#[tokio::test]
async fn detaching_a_pinned_session_is_refused() {
    let (orchestrator, _) = helpers::orchestrator(Arc::new(MockProvider::new()));
    let sessions = orchestrator.sessions.clone();
    let mut lifecycle = sessions.subscribe();
    sessions.get_or_create("s1", None);
    assert!(sessions.keep_alive("s1"));
    assert!(!sessions.detach("s1").await);
    assert!(sessions.is_attached("s1"));

    sessions.stop_keeping_alive("s1");
    assert!(sessions.detach("s1").await);
    assert!(!sessions.is_attached("s1"));
    assert!(sessions.sessions().is_empty());

    let first = lifecycle.recv().await.unwrap();
    let second = lifecycle.recv().await.unwrap();
    assert_eq!(
        serde_json::to_value(&first).unwrap(),
        serde_json::json!({ "event": "attached", "session": "s1" })
    );
    assert_eq!(
        serde_json::to_value(&second).unwrap(),
        serde_json::json!({ "event": "detached", "session": "s1" })
    );
}
