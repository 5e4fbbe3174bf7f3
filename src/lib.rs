//! Stitchpay - factory back-office engine for piece-work wages.
//!
//! Tracks completed piece-work (cutting, sewing), pays workers for batches
//! of entries, and reconciles payouts against a cash-advance ledger with
//! FIFO consumption. The transport layer (HTTP, desktop shell) lives in
//! collaborating components; this crate owns the contracts: JSON payloads
//! in, JSON payloads out, every settlement in one atomic transaction.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod db;
pub mod ledger;
pub mod receipts;
pub mod settlement;
pub mod staff;
pub mod work_entries;

pub use db::{init, DbState};
pub use settlement::{settle, SettleError};

/// First non-empty string value among the given payload keys.
pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub(crate) fn value_f64(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_f64()) {
            return Some(n);
        }
    }
    None
}

pub(crate) fn value_i64(v: &serde_json::Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_i64()) {
            return Some(n);
        }
    }
    None
}

/// Money field: accepts a JSON number or a numeric string ("96.50").
///
/// The first key present in the payload decides; a present-but-unparseable
/// value yields `None` so callers can reject it.
pub(crate) fn money_field(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match v.get(*key) {
            Some(serde_json::Value::Number(n)) => return n.as_f64(),
            Some(serde_json::Value::String(s)) => return s.trim().parse::<f64>().ok(),
            Some(_) | None => {}
        }
    }
    None
}

/// Initialize structured logging (console + daily rolling file).
///
/// Called once by the hosting process before any engine work.
pub fn init_logging(log_dir: &std::path::Path) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,stitchpay_lib=debug"));

    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, "stitchpay");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Keep the guard alive for the lifetime of the process — dropping it
    // flushes logs. Leaked intentionally since the host runs to exit.
    std::mem::forget(guard);
}

// ===========================================================================
// Tests
// ===========================================================================
