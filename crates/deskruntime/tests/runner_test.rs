mod common;

use common::*;
use deskcore::{DeleteResult, ErrorInfo, ErrorKind, TaskEvent, WorkflowState};
use deskruntime::{DeskRuntime, RuntimeConfig};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[derive(Default)]
struct Seen {
    prompts: RefCell<Vec<(u64, bool)>>,
    results: RefCell<Vec<DeleteResult>>,
    errors: RefCell<Vec<ErrorInfo>>,
}

fn runtime(store: &ScriptedStore) -> (DeskRuntime, deskruntime::Presenter) {
    DeskRuntime::new(store.shared(), RuntimeConfig::default()).unwrap()
}

#[tokio::test]
async fn test_confirmed_cascade_commits_then_audits() {
    init_tracing();
    let store = client_store(2);
    let (runtime, mut presenter) = runtime(&store);
    let seen = Rc::new(Seen::default());

    let (p, s, e) = (seen.clone(), seen.clone(), seen.clone());
    runtime.run_guarded_delete(
        delete_request(42, "admin"),
        move |prompt| {
            p.prompts.borrow_mut().push((prompt.dependents, prompt.cascade));
            true
        },
        move |result| s.results.borrow_mut().push(result),
        move |err| e.errors.borrow_mut().push(err),
    );

    // assess, apply, audit
    let dispatched = presenter.run_until_idle().await;
    assert_eq!(dispatched.len(), 3);

    assert_eq!(*seen.prompts.borrow(), vec![(2, true)]);
    assert!(seen.errors.borrow().is_empty());
    let results = seen.results.borrow();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].dependents_closed, 2);

    let log = store.log();
    let commit = log.iter().position(|entry| entry == "COMMIT").unwrap();
    let audit = log.iter().position(|entry| entry.contains("audit_log")).unwrap();
    assert!(commit < audit);
}

#[tokio::test]
async fn test_declined_confirmation_fires_nothing() {
    let store = client_store(2);
    let (runtime, mut presenter) = runtime(&store);
    let fired = Rc::new(Cell::new(false));

    let (s, e) = (fired.clone(), fired.clone());
    runtime.run_guarded_delete(
        delete_request(42, "admin"),
        |_| false,
        move |_| s.set(true),
        move |_| e.set(true),
    );

    let dispatched = presenter.run_until_idle().await;
    assert_eq!(dispatched.len(), 1);
    assert!(!fired.get());
    assert_eq!(store.count_of("BEGIN"), 0);
    assert_eq!(store.count_of("audit_log"), 0);
    assert!(!runtime.executor().is_busy());
}

#[tokio::test]
async fn test_forbidden_never_asks_for_confirmation() {
    let store = client_store(2);
    let (runtime, mut presenter) = runtime(&store);
    let seen = Rc::new(Seen::default());

    let e = seen.clone();
    runtime.run_guarded_delete(
        delete_request(42, "clerk"),
        |_| panic!("a denied run must not prompt"),
        |_| panic!("a denied run must not succeed"),
        move |err| e.errors.borrow_mut().push(err),
    );

    presenter.run_until_idle().await;
    let errors = seen.errors.borrow();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].is_kind(ErrorKind::Forbidden));
    assert!(!errors[0].is_retryable());
    assert_eq!(store.count_of("UPDATE"), 0);
}

#[tokio::test]
async fn test_transient_conflict_reaches_error_handler() {
    let store = client_store(0).on(
        "UPDATE clients",
        [Reply::Fail(deskcore::StoreError::with_code(
            deskcore::StoreErrorCode::DuplicateKey,
            "UNIQUE constraint failed: client_status_log.id",
        ))],
    );
    let (runtime, mut presenter) = runtime(&store);
    let error = Rc::new(RefCell::new(None));

    let e = error.clone();
    runtime.run_guarded_delete(
        delete_request(42, "clerk"),
        |prompt| !prompt.cascade,
        |_| panic!("conflict must not succeed"),
        move |err| *e.borrow_mut() = Some(err),
    );

    presenter.run_until_idle().await;
    let error = error.borrow_mut().take().unwrap();
    assert!(error.is_retryable());
    assert_eq!(store.count_of("UPDATE id_sequences"), 1);
    assert_eq!(store.count_of("audit_log"), 0);
}

#[tokio::test]
async fn test_cancelled_run_delivers_nothing() {
    let store = client_store(0);
    let (runtime, mut presenter) = runtime(&store);

    let handle = runtime.run_guarded_delete(
        delete_request(42, "admin"),
        |_| panic!("withdrawn run must not prompt"),
        |_| panic!("withdrawn run must not succeed"),
        |_| panic!("withdrawn run must not fail"),
    );
    assert!(handle.is_pending());
    assert!(handle.cancel());
    assert!(!handle.is_pending());

    presenter.dispatch_next().await;
    assert_eq!(store.count_of("BEGIN"), 0);
    assert!(!runtime.executor().is_busy());
}

#[tokio::test]
async fn test_transitions_are_published() {
    let store = client_store(0);
    let (runtime, mut presenter) = runtime(&store);
    let mut events = runtime.subscribe_events();

    let handle = runtime.run_guarded_delete(delete_request(42, "admin"), |_| true, |_| {}, |_| {});
    presenter.run_until_idle().await;

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let TaskEvent::WorkflowTransition { run_id, state, .. } = event {
            assert_eq!(run_id, handle.run_id());
            states.push(state);
        }
    }
    assert_eq!(states.first(), Some(&WorkflowState::CheckDependents));
    assert_eq!(states.last(), Some(&WorkflowState::End));
    assert!(states.contains(&WorkflowState::Commit));
}

#[tokio::test]
async fn test_configured_override_roles() {
    let store = client_store(1);
    let config = RuntimeConfig::from_json(r#"{ "override_roles": ["manager"], "audit_enabled": false }"#).unwrap();
    let (runtime, mut presenter) = DeskRuntime::new(store.shared(), config).unwrap();
    let committed = Rc::new(Cell::new(false));

    let c = committed.clone();
    runtime.run_guarded_delete(
        delete_request(42, "manager"),
        |_| true,
        move |result| c.set(result.cascaded),
        |err| panic!("unexpected failure: {}", err),
    );

    presenter.run_until_idle().await;
    assert!(committed.get());
    assert_eq!(store.count_of("audit_log"), 0);
}

#[tokio::test]
async fn test_slow_mutation_is_reported_as_timeout() {
    let store = client_store(0).on(
        "UPDATE clients",
        [Reply::Slow(
            std::time::Duration::from_millis(500),
            Box::new(Reply::Affected(1)),
        )],
    );
    let config = RuntimeConfig::from_json(r#"{ "query_timeout_ms": 100 }"#).unwrap();
    let (runtime, mut presenter) = DeskRuntime::new(store.shared(), config).unwrap();
    let error = Rc::new(RefCell::new(None));

    let e = error.clone();
    runtime.run_guarded_delete(
        delete_request(42, "clerk"),
        |_| true,
        |result| panic!("late mutation must not commit: {:?}", result),
        move |err| *e.borrow_mut() = Some(err),
    );

    presenter.run_until_idle().await;
    let error = error.borrow_mut().take().unwrap();
    assert!(error.is_kind(ErrorKind::Timeout));
    assert!(!error.is_retryable());
    assert_eq!(store.count_of("COMMIT"), 0);
    assert_eq!(store.count_of("ROLLBACK"), 1);
    assert_eq!(store.count_of("audit_log"), 0);
}
