//! Wage settlement engine for Stitchpay.
//!
//! The single write path of the system: pays a worker for a batch of
//! completed piece-work entries, reconciles the payment against the
//! advance ledger (FIFO, oldest debt first), marks the entries paid, and
//! emits one immutable receipt — all inside one `BEGIN IMMEDIATE`
//! transaction. Any failure rolls the whole batch back: a receipt never
//! exists without its paid entries, and vice versa.

use chrono::Utc;
use rusqlite::TransactionBehavior;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::DbState;
use crate::ledger;
use crate::receipts::{self, NewReceipt};
use crate::staff::{self, StaffRecord};
use crate::work_entries;
use crate::{money_field, value_str};

/// Comparison tolerance for currency arithmetic (REAL columns).
const MONEY_EPSILON: f64 = 0.001;

/// Settlement failure taxonomy.
///
/// `StorageConflict` is the only transient kind; callers retry the whole
/// request. Everything else is returned to the caller as-is.
#[derive(Debug, Error)]
pub enum SettleError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("all referenced entries are already settled")]
    AlreadySettled,

    #[error("storage conflict, retry the request: {0}")]
    StorageConflict(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl SettleError {
    /// Stable machine-readable tag for transport layers.
    pub fn kind(&self) -> &'static str {
        match self {
            SettleError::InvalidRequest(_) => "invalid_request",
            SettleError::WorkerNotFound(_) => "worker_not_found",
            SettleError::AlreadySettled => "already_settled",
            SettleError::StorageConflict(_) => "storage_conflict",
            SettleError::Storage(_) => "storage",
        }
    }

    /// Structured error body for the boundary response.
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "success": false,
            "error": self.kind(),
            "message": self.to_string(),
        })
    }
}

fn invalid(msg: impl Into<String>) -> SettleError {
    SettleError::InvalidRequest(msg.into())
}

/// Classify a begin/commit failure: busy or locked means the caller should
/// retry the whole settlement, anything else is a plain storage failure.
fn map_tx_err(stage: &str, e: rusqlite::Error) -> SettleError {
    match e.sqlite_error_code() {
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
            SettleError::StorageConflict(format!("{stage}: {e}"))
        }
        _ => SettleError::Storage(format!("{stage}: {e}")),
    }
}

/// Success payload returned to the caller.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementOutcome {
    pub success: bool,
    pub paid_amount: f64,
    /// Signed: positive = deducted from wages, negative = bonus deposited.
    pub advance_deducted: f64,
    pub bonus_added: f64,
    pub receipt_id: String,
    pub entries_requested: usize,
    pub entries_marked: usize,
    pub entry_mismatch: usize,
}

/// Validated settlement request.
struct SettleRequest {
    worker_name: String,
    branch_id: String,
    operation: Option<String>,
    entry_ids: Vec<String>,
    gross_amount: f64,
    deduct_advance: f64,
    payable_amount: f64,
    payment_type: String,
}

/// Parse and validate the request payload. No storage is touched here, so
/// a rejected request has zero effects.
fn parse_request(payload: &Value) -> Result<SettleRequest, SettleError> {
    let worker_name = value_str(payload, &["operatorName", "staffName"])
        .ok_or_else(|| invalid("Missing operatorName"))?;
    let branch_id = value_str(payload, &["branchId", "branch_id"])
        .ok_or_else(|| invalid("Missing branchId"))?;
    let operation = value_str(payload, &["operation"]);

    let entry_ids: Vec<String> = payload
        .get("entryIds")
        .and_then(|v| v.as_array())
        .ok_or_else(|| invalid("entryIds must be an array"))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .ok_or_else(|| invalid("entryIds must contain non-empty strings"))
        })
        .collect::<Result<_, _>>()?;
    if entry_ids.is_empty() {
        return Err(invalid("entryIds must not be empty"));
    }

    let gross_amount = money_field(payload, &["grossAmount", "gross_amount"])
        .ok_or_else(|| invalid("grossAmount must be a number"))?;
    if !gross_amount.is_finite() || gross_amount < 0.0 {
        return Err(invalid("grossAmount must be non-negative"));
    }

    let deduct_advance = match payload.get("deductAdvance") {
        None | Some(Value::Null) => 0.0,
        Some(_) => money_field(payload, &["deductAdvance"])
            .filter(|d| d.is_finite())
            .ok_or_else(|| invalid("deductAdvance must be a number"))?,
    };

    let payable_amount = money_field(payload, &["payableAmount", "payable_amount"])
        .filter(|p| p.is_finite())
        .ok_or_else(|| invalid("payableAmount must be a number"))?;

    let payment_type =
        value_str(payload, &["paymentType", "payment_type"]).unwrap_or_else(|| "cash".to_string());

    Ok(SettleRequest {
        worker_name,
        branch_id,
        operation,
        entry_ids,
        gross_amount,
        deduct_advance,
        payable_amount,
        payment_type,
    })
}

/// Settle a batch of piece-work entries for one worker.
///
/// Request body: `{ operatorName, operation, entryIds[], grossAmount,
/// deductAdvance, payableAmount, paymentType, branchId }`. Amount fields
/// accept a number or a numeric string.
///
/// On success returns `{ paidAmount, advanceDeducted, bonusAdded,
/// receiptId, entriesRequested, entriesMarked, entryMismatch }`.
pub fn settle(db: &DbState, payload: &Value) -> Result<Value, SettleError> {
    let request = parse_request(payload)?;

    let mut conn = db
        .conn
        .lock()
        .map_err(|e| SettleError::Storage(e.to_string()))?;

    let worker = staff::resolve_worker(&conn, &request.worker_name, &request.branch_id)
        .map_err(SettleError::Storage)?
        .ok_or_else(|| {
            SettleError::WorkerNotFound(format!(
                "No staff match for '{}' in branch {}",
                request.worker_name, request.branch_id
            ))
        })?;

    let now = Utc::now().to_rfc3339();

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| map_tx_err("begin settlement", e))?;

    // Errors below this point drop the transaction, rolling everything back.

    // Re-settlement guard, inside the write lock so a racing settle on a
    // second connection to the same file cannot slip past it: a batch whose
    // every in-branch entry is already paid must not produce a second,
    // zero-value receipt.
    let (matching, unpaid) =
        work_entries::entry_status_counts(&tx, &request.entry_ids, &request.branch_id)
            .map_err(SettleError::Storage)?;
    if matching > 0 && unpaid == 0 {
        return Err(SettleError::AlreadySettled);
    }

    let (receipt_id, entries_marked) =
        apply_settlement(&tx, &request, &worker, matching, &now)?;

    tx.commit().map_err(|e| map_tx_err("commit settlement", e))?;

    let entry_mismatch = request.entry_ids.len().saturating_sub(matching);
    info!(
        "Settled {entries_marked} entries for {} ({}) in branch {}: payable {:.2}, advance {:+.2}, receipt {receipt_id}",
        worker.name, worker.id, request.branch_id, request.payable_amount, request.deduct_advance
    );

    let outcome = SettlementOutcome {
        success: true,
        paid_amount: request.payable_amount,
        advance_deducted: request.deduct_advance,
        bonus_added: (-request.deduct_advance).max(0.0),
        receipt_id,
        entries_requested: request.entry_ids.len(),
        entries_marked,
        entry_mismatch,
    };
    serde_json::to_value(&outcome).map_err(|e| SettleError::Storage(format!("serialize outcome: {e}")))
}

/// Steps 1–6 of the reconciliation, inside the caller's transaction.
fn apply_settlement(
    tx: &rusqlite::Transaction,
    request: &SettleRequest,
    worker: &StaffRecord,
    matching: usize,
    now: &str,
) -> Result<(String, usize), SettleError> {
    let deduct = request.deduct_advance;

    if deduct > MONEY_EPSILON {
        // FIFO consumption: oldest outstanding row first, partial reduction
        // on the first row the remainder does not cover.
        let rows = ledger::list_outstanding_ordered_by_age(tx, &worker.id, &request.branch_id)
            .map_err(SettleError::Storage)?;
        let mut remaining = deduct;
        for row in rows {
            if remaining <= MONEY_EPSILON {
                remaining = 0.0;
                break;
            }
            if remaining >= row.amount - MONEY_EPSILON {
                ledger::clear_row(tx, &row.id, now).map_err(SettleError::Storage)?;
                remaining -= row.amount;
            } else {
                ledger::reduce_row(tx, &row.id, row.amount - remaining, now)
                    .map_err(SettleError::Storage)?;
                remaining = 0.0;
            }
        }
        if remaining > MONEY_EPSILON {
            // Known accounting drift: the excess is absorbed, not rejected.
            warn!(
                "Deduction for {} exceeds outstanding debt, absorbing {:.2}",
                worker.id, remaining
            );
        }
    } else if deduct < -MONEY_EPSILON {
        // Over-wages payout becomes new debt the worker owes back; a future
        // positive deduction consumes it like any other advance.
        ledger::insert_ledger_row(
            tx,
            &worker.id,
            &worker.name,
            &request.branch_id,
            -deduct,
            ledger::KIND_BONUS_DEPOSIT,
            now,
        )
        .map_err(SettleError::Storage)?;
    }

    let entries_marked = work_entries::mark_paid(tx, &request.entry_ids, &request.branch_id, now)
        .map_err(SettleError::Storage)?;
    if matching < request.entry_ids.len() {
        warn!(
            "Partial entry mismatch for {}: {} of {} ids matched branch {}",
            worker.id,
            matching,
            request.entry_ids.len(),
            request.branch_id
        );
    }

    // Aggregates run over the submitted id list, not the marked set, so the
    // receipt reflects the entries actually referenced (zero for misses).
    let (total_pieces, total_weight) =
        work_entries::aggregate_totals(tx, &request.entry_ids, &request.branch_id)
            .map_err(SettleError::Storage)?;

    let receipt_id = receipts::insert_receipt(
        tx,
        &NewReceipt {
            branch_id: &request.branch_id,
            staff_id: &worker.id,
            staff_name: &worker.name,
            operation: request.operation.as_deref(),
            total_pieces,
            total_weight,
            gross_amount: request.gross_amount,
            advance_deducted: deduct,
            payable_amount: request.payable_amount,
            payment_method: &request.payment_type,
            entry_ids: &request.entry_ids,
        },
        now,
    )
    .map_err(SettleError::Storage)?;

    Ok((receipt_id, entries_marked))
}

// ===========================================================================
// Tests
// ===========================================================================
