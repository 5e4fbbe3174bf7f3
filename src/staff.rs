//! Worker identity for Stitchpay.
//!
//! Workers are keyed by an immutable uuid; the display name is denormalized
//! onto ledger rows, work entries, and receipts but is never authoritative.
//! Settlement resolves a submitted name to exactly one active staff row.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::db::DbState;
use crate::value_str;

/// One resolved staff row.
#[derive(Debug, Clone)]
pub struct StaffRecord {
    pub id: String,
    pub name: String,
}

/// Resolve a worker name to exactly one active staff row in the branch.
///
/// Returns `Ok(None)` when the name matches zero rows or more than one —
/// an ambiguous name must never be settled against, since the payout and
/// ledger consumption would land on an arbitrary worker.
pub fn resolve_worker(
    conn: &Connection,
    name: &str,
    branch_id: &str,
) -> Result<Option<StaffRecord>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name FROM staff
             WHERE name = ?1 AND branch_id = ?2 AND is_active = 1",
        )
        .map_err(|e| format!("prepare staff lookup: {e}"))?;

    let mut matches: Vec<StaffRecord> = stmt
        .query_map(params![name, branch_id], |row| {
            Ok(StaffRecord {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })
        .map_err(|e| format!("staff lookup: {e}"))?
        .filter_map(|r| r.ok())
        .collect();

    match matches.len() {
        1 => Ok(matches.pop()),
        0 => Ok(None),
        n => {
            warn!("Worker name '{name}' is ambiguous in branch {branch_id} ({n} matches)");
            Ok(None)
        }
    }
}

/// Create a staff record.
///
/// Collaborator-facing intake; the settlement engine only ever reads staff.
pub fn create_staff(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let name = value_str(payload, &["name", "staffName"]).ok_or("Missing name")?;
    let branch_id = value_str(payload, &["branchId", "branch_id"]).ok_or("Missing branchId")?;
    let role = value_str(payload, &["role"]).unwrap_or_else(|| "operator".to_string());

    let staff_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO staff (id, name, branch_id, role, is_active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
        params![staff_id, name, branch_id, role, now],
    )
    .map_err(|e| format!("insert staff: {e}"))?;

    Ok(serde_json::json!({
        "success": true,
        "staffId": staff_id,
        "name": name,
        "branchId": branch_id,
    }))
}

// ===========================================================================
// Tests
// ===========================================================================
