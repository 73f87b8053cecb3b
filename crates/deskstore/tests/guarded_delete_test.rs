use deskcore::{Actor, DataStore, DeleteResult, ErrorInfo, ErrorKind, GuardedDeleteRequest, WorkflowContext};
use deskruntime::{DeskRuntime, GuardedDelete, OverridePolicy, Presenter, RuntimeConfig};
use deskstore::statements::{self, deactivate_client_request};
use deskstore::{SqliteStore, SqliteStoreConfig};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tempfile::TempDir;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

struct Fixture {
    _dir: TempDir,
    store: Arc<SqliteStore>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_busy_timeout(5_000)
    }

    fn with_busy_timeout(busy_timeout_ms: u64) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let config = SqliteStoreConfig {
            path: dir.path().join("desk.db"),
            busy_timeout_ms,
        };
        let store = SqliteStore::open(config).unwrap();
        store.seed_demo().unwrap();
        Self {
            _dir: dir,
            store: Arc::new(store),
        }
    }

    fn shared(&self) -> Arc<dyn DataStore> {
        self.store.clone()
    }

    fn raw(&self) -> rusqlite::Connection {
        rusqlite::Connection::open(self.store.path()).unwrap()
    }

    fn scalar(&self, sql: &str) -> i64 {
        self.raw().query_row(sql, [], |row| row.get(0)).unwrap()
    }

    fn client_active(&self, id: i64) -> bool {
        self.scalar(&format!("SELECT active FROM clients WHERE id = {}", id)) == 1
    }

    fn open_invoices(&self, client_id: i64) -> i64 {
        self.scalar(&format!(
            "SELECT COUNT(*) FROM invoices WHERE client_id = {} AND status IN ('pending', 'overdue')",
            client_id
        ))
    }

    fn runtime(&self) -> (DeskRuntime, Presenter) {
        DeskRuntime::new(self.shared(), RuntimeConfig::default()).unwrap()
    }
}

async fn delete(
    runtime: &DeskRuntime,
    presenter: &mut Presenter,
    request: GuardedDeleteRequest,
) -> Result<DeleteResult, ErrorInfo> {
    let slot = Rc::new(RefCell::new(None));
    let (s, e) = (slot.clone(), slot.clone());
    runtime.run_guarded_delete(
        request,
        |_| true,
        move |result| *s.borrow_mut() = Some(Ok(result)),
        move |err| *e.borrow_mut() = Some(Err(err)),
    );
    presenter.run_until_idle().await;
    let outcome = slot.borrow_mut().take();
    outcome.expect("the run delivered no outcome")
}

#[tokio::test]
async fn test_client_42_end_to_end() {
    let fixture = Fixture::new();
    let (runtime, mut presenter) = fixture.runtime();

    let denied = delete(
        &runtime,
        &mut presenter,
        deactivate_client_request(42, Actor::new(5, "clerk")),
    )
    .await
    .unwrap_err();
    assert!(denied.is_kind(ErrorKind::Forbidden));
    assert!(fixture.client_active(42));
    assert_eq!(fixture.open_invoices(42), 2);
    assert_eq!(fixture.scalar("SELECT COUNT(*) FROM client_status_log"), 0);
    assert_eq!(fixture.scalar("SELECT COUNT(*) FROM audit_log"), 0);

    let result = delete(
        &runtime,
        &mut presenter,
        deactivate_client_request(42, Actor::new(1, "admin")),
    )
    .await
    .unwrap();
    assert_eq!(
        result,
        DeleteResult {
            deleted_subject_id: 42,
            cascaded: true,
            dependents_closed: 2,
        }
    );
    assert!(!fixture.client_active(42));
    assert_eq!(fixture.open_invoices(42), 0);
    assert_eq!(
        fixture.scalar("SELECT COUNT(*) FROM invoices WHERE client_id = 42 AND status = 'closed_by_override'"),
        2
    );
    assert_eq!(
        fixture.scalar("SELECT COUNT(*) FROM audit_log WHERE actor_id = 1 AND action = 'subject.deactivate'"),
        1
    );

    // Already inactive
    let again = delete(
        &runtime,
        &mut presenter,
        deactivate_client_request(42, Actor::new(1, "admin")),
    )
    .await
    .unwrap_err();
    assert!(again.is_kind(ErrorKind::NotFound));
    assert_eq!(fixture.scalar("SELECT COUNT(*) FROM client_status_log"), 1);
}

#[tokio::test]
async fn test_client_without_dependents_needs_no_override() {
    let fixture = Fixture::new();
    let (runtime, mut presenter) = fixture.runtime();

    let result = delete(
        &runtime,
        &mut presenter,
        deactivate_client_request(13, Actor::new(5, "clerk")),
    )
    .await
    .unwrap();
    assert!(!result.cascaded);
    assert!(!fixture.client_active(13));
    // The paid invoice of another client is untouched
    assert_eq!(fixture.scalar("SELECT COUNT(*) FROM invoices WHERE status = 'paid'"), 1);
}

#[tokio::test]
async fn test_failed_cascade_leaves_nothing_behind() {
    let fixture = Fixture::new();
    fixture
        .raw()
        .execute_batch(
            "CREATE TRIGGER block_cascade BEFORE UPDATE OF status ON invoices
             WHEN NEW.status = 'closed_by_override'
             BEGIN SELECT RAISE(ABORT, 'cascade blocked'); END;",
        )
        .unwrap();
    let (runtime, mut presenter) = fixture.runtime();

    let err = delete(
        &runtime,
        &mut presenter,
        deactivate_client_request(42, Actor::new(1, "admin")),
    )
    .await
    .unwrap_err();
    assert!(err.is_kind(ErrorKind::Storage));
    assert!(err.message.contains("cascade blocked"));

    // The primary mutation and its status log row were rolled back too
    assert!(fixture.client_active(42));
    assert_eq!(fixture.open_invoices(42), 2);
    assert_eq!(fixture.scalar("SELECT COUNT(*) FROM client_status_log"), 0);
    assert_eq!(fixture.scalar("SELECT value FROM id_sequences"), 0);
    assert_eq!(fixture.scalar("SELECT COUNT(*) FROM audit_log"), 0);
}

#[tokio::test]
async fn test_drifted_sequence_is_repaired_and_retry_succeeds() {
    let fixture = Fixture::new();
    // History imported without advancing the generator
    fixture
        .raw()
        .execute_batch(
            "INSERT INTO client_status_log (id, client_id, active) VALUES (1, 13, 0), (2, 13, 1);",
        )
        .unwrap();
    let (runtime, mut presenter) = fixture.runtime();

    let err = delete(
        &runtime,
        &mut presenter,
        deactivate_client_request(42, Actor::new(1, "admin")),
    )
    .await
    .unwrap_err();
    assert!(err.is_kind(ErrorKind::TransientConflict));
    assert!(err.is_retryable());
    assert!(fixture.client_active(42));
    assert_eq!(fixture.open_invoices(42), 2);
    assert_eq!(fixture.scalar("SELECT value FROM id_sequences"), 2);

    let result = delete(
        &runtime,
        &mut presenter,
        deactivate_client_request(42, Actor::new(1, "admin")),
    )
    .await
    .unwrap();
    assert!(result.cascaded);
    assert_eq!(
        fixture.scalar("SELECT MAX(id) FROM client_status_log WHERE client_id = 42"),
        3
    );
}

#[test]
fn test_held_lock_surfaces_as_timeout() {
    let fixture = Fixture::with_busy_timeout(50);
    let holder = fixture.raw();
    holder.execute_batch("BEGIN IMMEDIATE").unwrap();

    let engine = GuardedDelete::new(fixture.shared(), OverridePolicy::default());
    let request = deactivate_client_request(13, Actor::new(1, "admin"));
    let mut ctx = WorkflowContext::new(&request);
    let err = engine.apply(&mut ctx, &request, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    holder.execute_batch("ROLLBACK").unwrap();
    assert!(fixture.client_active(13));
}

#[tokio::test]
async fn test_dashboard_queries() {
    let fixture = Fixture::new();
    let (runtime, mut presenter) = fixture.runtime();
    let seen = Rc::new(RefCell::new(Vec::new()));

    let (a, b, c) = (seen.clone(), seen.clone(), seen.clone());
    let queries = runtime.queries();
    queries.count_of(
        statements::active_client_count(),
        move |n| a.borrow_mut().push(format!("active {}", n)),
        |err| panic!("{}", err),
    );
    queries.sum_of(
        statements::outstanding_total(),
        move |total| b.borrow_mut().push(format!("outstanding {:.2}", total)),
        |err| panic!("{}", err),
    );
    queries.rows_of(
        statements::client_listing(),
        |rows| {
            Ok(rows
                .filter(|row| row.get(3).and_then(|v| v.as_i64()) > Some(0))
                .filter_map(|row| row.get(1).and_then(|v| v.as_str()).map(str::to_string))
                .collect::<Vec<_>>())
        },
        move |names| c.borrow_mut().push(format!("blocked {}", names.join(","))),
        |err| panic!("{}", err),
    );
    presenter.run_until_idle().await;

    let mut seen = seen.borrow().clone();
    seen.sort();
    assert_eq!(
        seen,
        vec!["active 3", "blocked Northwind Traders", "outstanding 1520.50"]
    );
}

#[tokio::test]
async fn test_invoice_status_update() {
    let fixture = Fixture::new();
    let (runtime, mut presenter) = fixture.runtime();
    let affected = Rc::new(RefCell::new(None));

    let a = affected.clone();
    runtime.queries().update_with(
        statements::set_invoice_status(1, "paid"),
        move |n| *a.borrow_mut() = Some(n),
        |err| panic!("{}", err),
    );
    presenter.run_until_idle().await;

    assert_eq!(*affected.borrow(), Some(1));
    assert_eq!(fixture.open_invoices(42), 1);
}
