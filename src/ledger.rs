//! Advance ledger for Stitchpay.
//!
//! Each row is money a worker owes back to the business: a cash advance
//! granted up front, or a bonus deposit created by a settlement that paid
//! out more than wages. Rows are consumed oldest-first by the settlement
//! engine, reduced or cleared but never deleted, and a cleared row is never
//! revisited.
//!
//! **Rules:**
//! - `amount >= 0` always (enforced by a schema CHECK as well)
//! - FIFO order is `created_at ASC`, ties broken by rowid
//! - mutation helpers run inside the caller's transaction only

use chrono::Utc;
use rusqlite::{params, Connection, Transaction};
use serde_json::Value;
use uuid::Uuid;

use crate::db::DbState;
use crate::staff;
use crate::{value_f64, value_str};

/// Ledger kind tag for rows created by an up-front cash grant.
pub const KIND_ADVANCE: &str = "advance";
/// Ledger kind tag for rows created by an over-wages settlement payout.
pub const KIND_BONUS_DEPOSIT: &str = "bonus_deposit";

/// One outstanding ledger row, as seen by the FIFO consumption walk.
#[derive(Debug, Clone)]
pub struct OutstandingRow {
    pub id: String,
    pub amount: f64,
}

// ---------------------------------------------------------------------------
// Intake
// ---------------------------------------------------------------------------

/// Grant a cash advance to a worker.
///
/// Inserts one outstanding ledger row; a later settlement's deduction will
/// consume it oldest-first.
pub fn grant_advance(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let staff_name =
        value_str(payload, &["staffName", "operatorName"]).ok_or("Missing staffName")?;
    let branch_id = value_str(payload, &["branchId", "branch_id"]).ok_or("Missing branchId")?;
    let amount = value_f64(payload, &["amount"]).ok_or("Missing amount")?;
    if amount <= 0.0 {
        return Err("Advance amount must be positive".into());
    }
    let note = value_str(payload, &["note", "reason"]);

    let worker = staff::resolve_worker(&conn, &staff_name, &branch_id)?
        .ok_or_else(|| format!("No staff match for '{staff_name}' in branch {branch_id}"))?;

    let advance_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO advance_ledger (
            id, branch_id, staff_id, staff_name, amount, kind,
            outstanding, note, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?8)",
        params![
            advance_id,
            branch_id,
            worker.id,
            worker.name,
            amount,
            KIND_ADVANCE,
            note,
            now,
        ],
    )
    .map_err(|e| format!("insert advance: {e}"))?;

    let balance = outstanding_balance(&conn, &worker.id, &branch_id)?;

    Ok(serde_json::json!({
        "success": true,
        "advanceId": advance_id,
        "amount": amount,
        "pendingBalance": balance,
    }))
}

/// Insert a ledger row inside the caller's transaction.
///
/// Used by the settlement engine for bonus deposits; `grant_advance` covers
/// the external intake path.
pub fn insert_ledger_row(
    tx: &Transaction,
    staff_id: &str,
    staff_name: &str,
    branch_id: &str,
    amount: f64,
    kind: &str,
    now: &str,
) -> Result<String, String> {
    let row_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO advance_ledger (
            id, branch_id, staff_id, staff_name, amount, kind,
            outstanding, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)",
        params![row_id, branch_id, staff_id, staff_name, amount, kind, now],
    )
    .map_err(|e| format!("insert ledger row: {e}"))?;
    Ok(row_id)
}

// ---------------------------------------------------------------------------
// FIFO consumption
// ---------------------------------------------------------------------------

/// Fetch all outstanding rows for a worker, oldest first.
///
/// The order here *is* the repayment policy: the earliest advance is repaid
/// first, so this must never change to LIFO or largest-first.
pub fn list_outstanding_ordered_by_age(
    conn: &Connection,
    staff_id: &str,
    branch_id: &str,
) -> Result<Vec<OutstandingRow>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT id, amount FROM advance_ledger
             WHERE staff_id = ?1 AND branch_id = ?2 AND outstanding = 1
             ORDER BY created_at ASC, rowid ASC",
        )
        .map_err(|e| format!("prepare outstanding scan: {e}"))?;

    let rows: Vec<OutstandingRow> = stmt
        .query_map(params![staff_id, branch_id], |row| {
            Ok(OutstandingRow {
                id: row.get(0)?,
                amount: row.get(1)?,
            })
        })
        .map_err(|e| format!("outstanding scan: {e}"))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(rows)
}

/// Fully consume a ledger row: amount to zero, outstanding off, frozen.
pub fn clear_row(tx: &Transaction, row_id: &str, now: &str) -> Result<(), String> {
    tx.execute(
        "UPDATE advance_ledger
         SET amount = 0, outstanding = 0, cleared_at = ?1, updated_at = ?1
         WHERE id = ?2 AND outstanding = 1",
        params![now, row_id],
    )
    .map_err(|e| format!("clear ledger row: {e}"))?;
    Ok(())
}

/// Partially consume a ledger row, leaving it outstanding at the reduced
/// amount. `new_amount` must already be the post-deduction remainder.
pub fn reduce_row(
    tx: &Transaction,
    row_id: &str,
    new_amount: f64,
    now: &str,
) -> Result<(), String> {
    if new_amount < 0.0 {
        return Err(format!(
            "refusing to reduce ledger row {row_id} below zero ({new_amount})"
        ));
    }
    tx.execute(
        "UPDATE advance_ledger
         SET amount = ?1, updated_at = ?2
         WHERE id = ?3 AND outstanding = 1",
        params![new_amount, now, row_id],
    )
    .map_err(|e| format!("reduce ledger row: {e}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Balance query service
// ---------------------------------------------------------------------------

/// Sum of outstanding amounts for a worker. Zero rows reads as 0.0.
pub fn outstanding_balance(
    conn: &Connection,
    staff_id: &str,
    branch_id: &str,
) -> Result<f64, String> {
    conn.query_row(
        "SELECT COALESCE(SUM(amount), 0.0) FROM advance_ledger
         WHERE staff_id = ?1 AND branch_id = ?2 AND outstanding = 1",
        params![staff_id, branch_id],
        |row| row.get(0),
    )
    .map_err(|e| format!("outstanding balance: {e}"))
}

/// Boundary read for the UI: `{ staffName, branchId }` → `{ pendingBalance }`.
///
/// A worker with no ledger rows — or no staff record at all — reports 0;
/// this is a plain pre-settlement read and never an error.
pub fn pending_balance(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let staff_name =
        value_str(payload, &["staffName", "operatorName"]).ok_or("Missing staffName")?;
    let branch_id = value_str(payload, &["branchId", "branch_id"]).ok_or("Missing branchId")?;

    let balance = match staff::resolve_worker(&conn, &staff_name, &branch_id)? {
        Some(worker) => outstanding_balance(&conn, &worker.id, &branch_id)?,
        None => 0.0,
    };

    Ok(serde_json::json!({ "pendingBalance": balance }))
}

/// Full ledger history for a worker, oldest first, cleared rows included.
///
/// Reporting read: together with row timestamps this is how a past
/// settlement's ledger effect is reconstructed.
pub fn ledger_history(db: &DbState, staff_name: &str, branch_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let worker = match staff::resolve_worker(&conn, staff_name, branch_id)? {
        Some(w) => w,
        None => return Ok(serde_json::json!([])),
    };

    let mut stmt = conn
        .prepare(
            "SELECT id, amount, kind, outstanding, cleared_at, note, created_at
             FROM advance_ledger
             WHERE staff_id = ?1 AND branch_id = ?2
             ORDER BY created_at ASC, rowid ASC",
        )
        .map_err(|e| format!("prepare ledger history: {e}"))?;

    let rows: Vec<Value> = stmt
        .query_map(params![worker.id, branch_id], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "amount": row.get::<_, f64>(1)?,
                "kind": row.get::<_, String>(2)?,
                "outstanding": row.get::<_, i64>(3)? == 1,
                "clearedAt": row.get::<_, Option<String>>(4)?,
                "note": row.get::<_, Option<String>>(5)?,
                "createdAt": row.get::<_, String>(6)?,
            }))
        })
        .map_err(|e| format!("ledger history: {e}"))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(Value::Array(rows))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    fn seed_staff(db: &DbState, name: &str, branch: &str) -> String {
        let created = staff::create_staff(
            db,
            &serde_json::json!({ "name": name, "branchId": branch }),
        )
        .expect("create_staff");
        created["staffId"].as_str().unwrap().to_string()
    }

    /// Insert a ledger row with an explicit timestamp (fixture helper).
    fn seed_row(db: &DbState, staff_id: &str, amount: f64, created_at: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO advance_ledger (id, branch_id, staff_id, amount, kind, outstanding, created_at, updated_at)
             VALUES (?1, 'br-1', ?2, ?3, 'advance', 1, ?4, ?4)",
            params![id, staff_id, amount, created_at],
        )
        .expect("seed ledger row");
        id
    }

    #[test]
    fn test_outstanding_scan_is_oldest_first() {
        let db = test_db();
        let staff_id = seed_staff(&db, "Amara", "br-1");

        // Inserted out of order on purpose
        seed_row(&db, &staff_id, 30.0, "2026-02-01T00:00:00Z");
        seed_row(&db, &staff_id, 50.0, "2026-01-01T00:00:00Z");
        seed_row(&db, &staff_id, 20.0, "2026-03-01T00:00:00Z");

        let conn = db.conn.lock().unwrap();
        let rows = list_outstanding_ordered_by_age(&conn, &staff_id, "br-1").expect("scan");
        let amounts: Vec<f64> = rows.iter().map(|r| r.amount).collect();
        assert_eq!(amounts, vec![50.0, 30.0, 20.0]);
    }

    #[test]
    fn test_cleared_rows_leave_the_scan() {
        let db = test_db();
        let staff_id = seed_staff(&db, "Amara", "br-1");
        let row_id = seed_row(&db, &staff_id, 40.0, "2026-01-01T00:00:00Z");

        let mut conn = db.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let tx = conn.transaction().unwrap();
        clear_row(&tx, &row_id, &now).expect("clear");
        tx.commit().unwrap();

        let rows = list_outstanding_ordered_by_age(&conn, &staff_id, "br-1").expect("scan");
        assert!(rows.is_empty());

        let (amount, cleared_at): (f64, Option<String>) = conn
            .query_row(
                "SELECT amount, cleared_at FROM advance_ledger WHERE id = ?1",
                params![row_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(amount, 0.0);
        assert!(cleared_at.is_some());
    }

    #[test]
    fn test_reduce_row_refuses_negative() {
        let db = test_db();
        let staff_id = seed_staff(&db, "Amara", "br-1");
        let row_id = seed_row(&db, &staff_id, 40.0, "2026-01-01T00:00:00Z");

        let mut conn = db.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let tx = conn.transaction().unwrap();
        assert!(reduce_row(&tx, &row_id, -1.0, &now).is_err());
        tx.commit().unwrap();
    }

    #[test]
    fn test_grant_advance_and_pending_balance() {
        let db = test_db();
        seed_staff(&db, "Amara", "br-1");

        let granted = grant_advance(
            &db,
            &serde_json::json!({ "staffName": "Amara", "branchId": "br-1", "amount": 75.0 }),
        )
        .expect("grant_advance");
        assert_eq!(granted["pendingBalance"], 75.0);

        let balance = pending_balance(
            &db,
            &serde_json::json!({ "staffName": "Amara", "branchId": "br-1" }),
        )
        .expect("pending_balance");
        assert_eq!(balance["pendingBalance"], 75.0);
    }

    #[test]
    fn test_pending_balance_zero_for_unknown_worker() {
        let db = test_db();
        let balance = pending_balance(
            &db,
            &serde_json::json!({ "staffName": "Nobody", "branchId": "br-1" }),
        )
        .expect("pending_balance");
        assert_eq!(balance["pendingBalance"], 0.0);
    }

    #[test]
    fn test_grant_advance_rejects_non_positive_amount() {
        let db = test_db();
        seed_staff(&db, "Amara", "br-1");

        for bad in [0.0, -10.0] {
            let result = grant_advance(
                &db,
                &serde_json::json!({ "staffName": "Amara", "branchId": "br-1", "amount": bad }),
            );
            assert!(result.is_err(), "amount {bad} must be rejected");
        }
    }

    #[test]
    fn test_ledger_history_includes_cleared_rows() {
        let db = test_db();
        let staff_id = seed_staff(&db, "Amara", "br-1");
        let row_id = seed_row(&db, &staff_id, 40.0, "2026-01-01T00:00:00Z");
        seed_row(&db, &staff_id, 25.0, "2026-02-01T00:00:00Z");

        {
            let mut conn = db.conn.lock().unwrap();
            let now = Utc::now().to_rfc3339();
            let tx = conn.transaction().unwrap();
            clear_row(&tx, &row_id, &now).unwrap();
            tx.commit().unwrap();
        }

        let history = ledger_history(&db, "Amara", "br-1").expect("history");
        let rows = history.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["outstanding"], false);
        assert_eq!(rows[1]["outstanding"], true);
    }
}
