//! Work Entry Store for Stitchpay.
//!
//! One row per completed unit of piece-work. Rows are created when
//! production is recorded, flipped to paid exactly once by the settlement
//! engine, and never deleted. Mutation helpers take the caller's open
//! transaction and never begin or commit one themselves.

use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, Transaction};
use serde_json::Value;
use uuid::Uuid;

use crate::db::DbState;
use crate::staff;
use crate::{value_f64, value_i64, value_str};

/// Build a `?, ?, ...` placeholder list for a dynamic IN clause.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

// ---------------------------------------------------------------------------
// Record production
// ---------------------------------------------------------------------------

/// Record a completed piece-work entry.
///
/// Collaborator-facing intake: the production floor records what was cut or
/// sewn; the entry then waits unpaid until a settlement references it.
pub fn record_entry(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let staff_name =
        value_str(payload, &["staffName", "operatorName"]).ok_or("Missing staffName")?;
    let branch_id = value_str(payload, &["branchId", "branch_id"]).ok_or("Missing branchId")?;
    let operation = value_str(payload, &["operation"]);
    let pieces = value_i64(payload, &["pieces"]).unwrap_or(0);
    let weight = value_f64(payload, &["weight"]).unwrap_or(0.0);
    let amount = value_f64(payload, &["amount", "grossAmount"]).unwrap_or(0.0);
    if amount < 0.0 {
        return Err("Entry amount must be non-negative".into());
    }

    let worker = staff::resolve_worker(&conn, &staff_name, &branch_id)?
        .ok_or_else(|| format!("No staff match for '{staff_name}' in branch {branch_id}"))?;

    let entry_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO work_entries (
            id, branch_id, staff_id, staff_name, operation,
            pieces, weight, amount, paid, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)",
        params![
            entry_id,
            branch_id,
            worker.id,
            worker.name,
            operation,
            pieces,
            weight,
            amount,
            now,
        ],
    )
    .map_err(|e| format!("insert work entry: {e}"))?;

    Ok(serde_json::json!({
        "success": true,
        "entryId": entry_id,
        "staffId": worker.id,
    }))
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// List unpaid entries for a worker, oldest first.
///
/// The UI calls this to build the entry-id list before requesting a
/// settlement. An unknown worker yields an empty list, not an error.
pub fn list_unpaid_by_worker(
    db: &DbState,
    staff_name: &str,
    branch_id: &str,
) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let worker = match staff::resolve_worker(&conn, staff_name, branch_id)? {
        Some(w) => w,
        None => return Ok(serde_json::json!([])),
    };

    let mut stmt = conn
        .prepare(
            "SELECT id, operation, pieces, weight, amount, created_at
             FROM work_entries
             WHERE staff_id = ?1 AND branch_id = ?2 AND paid = 0
             ORDER BY created_at ASC, rowid ASC",
        )
        .map_err(|e| format!("prepare unpaid list: {e}"))?;

    let rows: Vec<Value> = stmt
        .query_map(params![worker.id, branch_id], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "operation": row.get::<_, Option<String>>(1)?,
                "pieces": row.get::<_, i64>(2)?,
                "weight": row.get::<_, f64>(3)?,
                "amount": row.get::<_, f64>(4)?,
                "createdAt": row.get::<_, String>(5)?,
            }))
        })
        .map_err(|e| format!("list unpaid: {e}"))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(Value::Array(rows))
}

/// Count how many of the given ids exist in the branch, and how many of
/// those are still unpaid. Used by the settlement engine's re-settlement
/// guard and mismatch reporting.
pub fn entry_status_counts(
    conn: &Connection,
    ids: &[String],
    branch_id: &str,
) -> Result<(usize, usize), String> {
    if ids.is_empty() {
        return Ok((0, 0));
    }
    let sql = format!(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN paid = 0 THEN 1 ELSE 0 END), 0)
         FROM work_entries
         WHERE branch_id = ? AND id IN ({})",
        placeholders(ids.len())
    );
    let params_iter = std::iter::once(branch_id).chain(ids.iter().map(|s| s.as_str()));
    conn.query_row(&sql, params_from_iter(params_iter), |row| {
        Ok((row.get::<_, i64>(0)? as usize, row.get::<_, i64>(1)? as usize))
    })
    .map_err(|e| format!("entry status counts: {e}"))
}

/// Aggregate pieces and weight over an id list, regardless of paid state.
///
/// The receipt must reflect the entries actually referenced, so this runs
/// over the same id list the caller submitted rather than the set that
/// step-level updates touched; ids matching nothing sum to zero.
pub fn aggregate_totals(
    conn: &Connection,
    ids: &[String],
    branch_id: &str,
) -> Result<(i64, f64), String> {
    if ids.is_empty() {
        return Ok((0, 0.0));
    }
    let sql = format!(
        "SELECT COALESCE(SUM(pieces), 0), COALESCE(SUM(weight), 0.0)
         FROM work_entries
         WHERE branch_id = ? AND id IN ({})",
        placeholders(ids.len())
    );
    let params_iter = std::iter::once(branch_id).chain(ids.iter().map(|s| s.as_str()));
    conn.query_row(&sql, params_from_iter(params_iter), |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
    })
    .map_err(|e| format!("aggregate totals: {e}"))
}

// ---------------------------------------------------------------------------
// Settlement mutation
// ---------------------------------------------------------------------------

/// Mark the listed entries paid inside the caller's transaction.
///
/// Restricted to rows in the given branch that are still unpaid, so
/// cross-branch ids and already-paid entries are skipped silently; returns
/// the number of rows actually flipped.
pub fn mark_paid(
    tx: &Transaction,
    ids: &[String],
    branch_id: &str,
    now: &str,
) -> Result<usize, String> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "UPDATE work_entries
         SET paid = 1, paid_at = ?, updated_at = ?
         WHERE branch_id = ? AND paid = 0 AND id IN ({})",
        placeholders(ids.len())
    );
    let params_iter = [now, now, branch_id]
        .into_iter()
        .chain(ids.iter().map(|s| s.as_str()));
    tx.execute(&sql, params_from_iter(params_iter))
        .map_err(|e| format!("mark entries paid: {e}"))
}

// ===========================================================================
// Tests
// ===========================================================================
