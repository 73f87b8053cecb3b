//! Canned statements for the client and invoice screens

use crate::schema::STATUS_LOG_SEQUENCE;
use deskcore::{Actor, GuardedDeleteRequest, Query};

/// Invoice statuses that keep a client from being deactivated
const BLOCKING: &str = "('pending', 'overdue')";

pub fn dependents_check(client_id: i64) -> Query {
    Query::new(format!(
        "SELECT COUNT(*) FROM invoices WHERE client_id = ?1 AND status IN {}",
        BLOCKING
    ))
    .bind(client_id)
}

pub fn deactivate_client(client_id: i64) -> Query {
    Query::new("UPDATE clients SET active = 0 WHERE id = ?1 AND active = 1").bind(client_id)
}

pub fn close_by_override(client_id: i64) -> Query {
    Query::new(format!(
        "UPDATE invoices SET status = 'closed_by_override' WHERE client_id = ?1 AND status IN {}",
        BLOCKING
    ))
    .bind(client_id)
}

/// Point the status log generator at the highest id in use
pub fn sequence_repair() -> Query {
    Query::new(
        "UPDATE id_sequences \
         SET value = (SELECT COALESCE(MAX(id), 0) FROM client_status_log) \
         WHERE name = ?1",
    )
    .bind(STATUS_LOG_SEQUENCE)
}

/// Soft-delete of a client, cascading into its blocking invoices
pub fn deactivate_client_request(client_id: i64, actor: Actor) -> GuardedDeleteRequest {
    GuardedDeleteRequest::new(
        client_id,
        actor,
        dependents_check(client_id),
        deactivate_client(client_id),
        close_by_override(client_id),
    )
    .with_sequence_repair(sequence_repair())
}

pub fn active_client_count() -> Query {
    Query::new("SELECT COUNT(*) FROM clients WHERE active = 1")
}

pub fn outstanding_total() -> Query {
    Query::new(format!(
        "SELECT SUM(amount) FROM invoices WHERE status IN {}",
        BLOCKING
    ))
}

/// id, name, active, number of blocking invoices
pub fn client_listing() -> Query {
    Query::new(format!(
        "SELECT c.id, c.name, c.active, \
                (SELECT COUNT(*) FROM invoices i WHERE i.client_id = c.id AND i.status IN {}) \
         FROM clients c ORDER BY c.id",
        BLOCKING
    ))
}

pub fn set_invoice_status(invoice_id: i64, status: &str) -> Query {
    Query::new("UPDATE invoices SET status = ?2 WHERE id = ?1")
        .bind(invoice_id)
        .bind(status)
}

/// actor_id, action, details, created_at; newest first
pub fn recent_audit(limit: i64) -> Query {
    Query::new(
        "SELECT actor_id, action, details, created_at FROM audit_log ORDER BY id DESC LIMIT ?1",
    )
    .bind(limit)
}
