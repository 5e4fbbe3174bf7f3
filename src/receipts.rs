//! Settlement receipts for Stitchpay.
//!
//! Append-only audit trail: one row per successful settlement, written
//! inside the settlement transaction and never mutated or deleted
//! afterwards. The referenced work-entry ids are serialized as a JSON
//! array in the `entry_ids` column.

use rusqlite::{params, Connection, Transaction};
use serde_json::Value;
use uuid::Uuid;

use crate::db::DbState;
use crate::staff;

/// Receipt fields computed by the settlement engine.
#[derive(Debug)]
pub struct NewReceipt<'a> {
    pub branch_id: &'a str,
    pub staff_id: &'a str,
    pub staff_name: &'a str,
    pub operation: Option<&'a str>,
    pub total_pieces: i64,
    pub total_weight: f64,
    pub gross_amount: f64,
    /// Signed: positive = deducted from wages, negative = bonus deposited.
    pub advance_deducted: f64,
    pub payable_amount: f64,
    pub payment_method: &'a str,
    pub entry_ids: &'a [String],
}

/// Insert one receipt row inside the caller's transaction.
pub fn insert_receipt(tx: &Transaction, receipt: &NewReceipt, now: &str) -> Result<String, String> {
    let receipt_id = Uuid::new_v4().to_string();
    let entry_ids_json = serde_json::to_string(receipt.entry_ids)
        .map_err(|e| format!("serialize entry ids: {e}"))?;

    tx.execute(
        "INSERT INTO settlement_receipts (
            id, branch_id, staff_id, staff_name, operation,
            total_pieces, total_weight, gross_amount,
            advance_deducted, payable_amount, payment_method,
            entry_ids, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            receipt_id,
            receipt.branch_id,
            receipt.staff_id,
            receipt.staff_name,
            receipt.operation,
            receipt.total_pieces,
            receipt.total_weight,
            receipt.gross_amount,
            receipt.advance_deducted,
            receipt.payable_amount,
            receipt.payment_method,
            entry_ids_json,
            now,
        ],
    )
    .map_err(|e| format!("insert receipt: {e}"))?;

    Ok(receipt_id)
}

fn row_to_json(row: &rusqlite::Row) -> rusqlite::Result<Value> {
    let entry_ids_json: String = row.get(11)?;
    let entry_ids: Value =
        serde_json::from_str(&entry_ids_json).unwrap_or_else(|_| serde_json::json!([]));
    Ok(serde_json::json!({
        "id": row.get::<_, String>(0)?,
        "branchId": row.get::<_, String>(1)?,
        "staffId": row.get::<_, String>(2)?,
        "staffName": row.get::<_, Option<String>>(3)?,
        "operation": row.get::<_, Option<String>>(4)?,
        "totalPieces": row.get::<_, i64>(5)?,
        "totalWeight": row.get::<_, f64>(6)?,
        "grossAmount": row.get::<_, f64>(7)?,
        "advanceDeducted": row.get::<_, f64>(8)?,
        "payableAmount": row.get::<_, f64>(9)?,
        "paymentMethod": row.get::<_, String>(10)?,
        "entryIds": entry_ids,
        "createdAt": row.get::<_, String>(12)?,
    }))
}

const RECEIPT_COLUMNS: &str = "id, branch_id, staff_id, staff_name, operation,
    total_pieces, total_weight, gross_amount, advance_deducted,
    payable_amount, payment_method, entry_ids, created_at";

/// Fetch one receipt by id.
pub fn get_receipt(db: &DbState, receipt_id: &str) -> Result<Option<Value>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    get_receipt_inner(&conn, receipt_id)
}

fn get_receipt_inner(conn: &Connection, receipt_id: &str) -> Result<Option<Value>, String> {
    let sql = format!("SELECT {RECEIPT_COLUMNS} FROM settlement_receipts WHERE id = ?1");
    match conn.query_row(&sql, params![receipt_id], row_to_json) {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(format!("get receipt: {e}")),
    }
}

/// List a worker's receipts, newest first.
pub fn list_receipts(
    db: &DbState,
    staff_name: &str,
    branch_id: &str,
    limit: i64,
) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let worker = match staff::resolve_worker(&conn, staff_name, branch_id)? {
        Some(w) => w,
        None => return Ok(serde_json::json!([])),
    };

    let sql = format!(
        "SELECT {RECEIPT_COLUMNS} FROM settlement_receipts
         WHERE staff_id = ?1 AND branch_id = ?2
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?3"
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| format!("prepare receipt list: {e}"))?;

    let rows: Vec<Value> = stmt
        .query_map(params![worker.id, branch_id, limit], row_to_json)
        .map_err(|e| format!("list receipts: {e}"))?
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

    fn sample_receipt<'a>(entry_ids: &'a [String]) -> NewReceipt<'a> {
        NewReceipt {
            branch_id: "br-1",
            staff_id: "stf-1",
            staff_name: "Amara",
            operation: Some("sewing"),
            total_pieces: 120,
            total_weight: 14.5,
            gross_amount: 96.0,
            advance_deducted: 30.0,
            payable_amount: 66.0,
            payment_method: "cash",
            entry_ids,
        }
    }

    #[test]
    fn test_insert_and_get_receipt() {
        let db = test_db();
        let entry_ids = vec!["e-1".to_string(), "e-2".to_string()];

        let receipt_id = {
            let mut conn = db.conn.lock().unwrap();
            let tx = conn.transaction().unwrap();
            let id = insert_receipt(&tx, &sample_receipt(&entry_ids), "2026-04-01T10:00:00Z")
                .expect("insert_receipt");
            tx.commit().unwrap();
            id
        };

        let fetched = get_receipt(&db, &receipt_id)
            .expect("get_receipt")
            .expect("receipt exists");
        assert_eq!(fetched["grossAmount"], 96.0);
        assert_eq!(fetched["advanceDeducted"], 30.0);
        assert_eq!(fetched["payableAmount"], 66.0);
        assert_eq!(fetched["entryIds"], serde_json::json!(["e-1", "e-2"]));
        assert_eq!(fetched["operation"], "sewing");
    }

    #[test]
    fn test_get_missing_receipt_is_none() {
        let db = test_db();
        assert!(get_receipt(&db, "no-such-id").expect("get_receipt").is_none());
    }

    #[test]
    fn test_rolled_back_receipt_does_not_persist() {
        let db = test_db();
        let entry_ids = vec!["e-1".to_string()];

        let receipt_id = {
            let mut conn = db.conn.lock().unwrap();
            let tx = conn.transaction().unwrap();
            let id = insert_receipt(&tx, &sample_receipt(&entry_ids), "2026-04-01T10:00:00Z")
                .expect("insert_receipt");
            // tx dropped without commit
            drop(tx);
            id
        };

        assert!(get_receipt(&db, &receipt_id).expect("get_receipt").is_none());
    }

    #[test]
    fn test_list_receipts_newest_first() {
        let db = test_db();
        let created = staff::create_staff(
            &db,
            &serde_json::json!({ "name": "Amara", "branchId": "br-1" }),
        )
        .expect("create_staff");
        let staff_id = created["staffId"].as_str().unwrap().to_string();

        {
            let mut conn = db.conn.lock().unwrap();
            for (i, ts) in ["2026-04-01T10:00:00Z", "2026-04-02T10:00:00Z"]
                .into_iter()
                .enumerate()
            {
                let entry_ids = vec![format!("e-{i}")];
                let mut receipt = sample_receipt(&entry_ids);
                receipt.staff_id = &staff_id;
                let tx = conn.transaction().unwrap();
                insert_receipt(&tx, &receipt, ts).expect("insert_receipt");
                tx.commit().unwrap();
            }
        }

        let listed = list_receipts(&db, "Amara", "br-1", 10).expect("list_receipts");
        let rows = listed.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["createdAt"], "2026-04-02T10:00:00Z");
        assert_eq!(rows[1]["createdAt"], "2026-04-01T10:00:00Z");
    }
}
