//! Append-only cash ledger.
//!
//! Every cash-affecting event is one immutable row scoped to the shift that
//! was open when it happened. `append` is the only write and composes into
//! the caller's transaction; there is no update or delete path. Aggregates
//! are pure functions over query results, never stored, so a balance can
//! never drift from the entries that produced it.

use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{EngineError, EngineResult};
use crate::money::Money;

// ---------------------------------------------------------------------------
// Entry types
// ---------------------------------------------------------------------------

/// Kind of cash-affecting event. Direction is implied by the type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Cash placed into the drawer (opening float, petty cash in).
    CashIn,
    /// Cash taken out of the drawer (closing count, expense out).
    CashOut,
    /// Confirmed cash sale.
    SaleCash,
    /// Cash refunded to a payer.
    RefundCash,
    /// Confirmed inbound bank transfer (QR payment request). Tracked in the
    /// ledger but not part of the physical drawer balance.
    QrIn,
    /// Cash lifted from the drawer mid-shift (safe drop, courier payout).
    ShiftPayout,
}

impl EntryType {
    pub const ALL: [EntryType; 6] = [
        EntryType::CashIn,
        EntryType::CashOut,
        EntryType::SaleCash,
        EntryType::RefundCash,
        EntryType::QrIn,
        EntryType::ShiftPayout,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntryType::CashIn => "cash_in",
            EntryType::CashOut => "cash_out",
            EntryType::SaleCash => "sale_cash",
            EntryType::RefundCash => "refund_cash",
            EntryType::QrIn => "qr_in",
            EntryType::ShiftPayout => "shift_payout",
        }
    }

    pub fn parse(s: &str) -> EngineResult<EntryType> {
        EntryType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EngineError::Internal(format!("unknown ledger entry type: {s}")))
    }

    /// Money coming in (true) or going out (false).
    pub fn is_inflow(self) -> bool {
        matches!(self, EntryType::CashIn | EntryType::SaleCash | EntryType::QrIn)
    }

    /// Whether the entry moves physical drawer cash. `qr_in` is bank money
    /// and is reported beside the drawer, never inside it.
    pub fn affects_drawer(self) -> bool {
        !matches!(self, EntryType::QrIn)
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// One immutable ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: String,
    pub shift_id: String,
    pub entry_type: EntryType,
    pub amount: Money,
    pub description: String,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub created_at: String,
}

impl LedgerEntry {
    /// Signed drawer contribution: positive inflow, negative outflow,
    /// zero for entries that do not touch the drawer.
    pub fn signed_drawer_amount(&self) -> Money {
        if !self.entry_type.affects_drawer() {
            Money::ZERO
        } else if self.entry_type.is_inflow() {
            self.amount
        } else {
            -self.amount
        }
    }
}

/// Row image before the entry type string is parsed.
struct RawEntry {
    id: String,
    shift_id: String,
    entry_type: String,
    amount: Money,
    description: String,
    reference_type: Option<String>,
    reference_id: Option<String>,
    created_at: String,
}

impl RawEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
        Ok(RawEntry {
            id: row.get(0)?,
            shift_id: row.get(1)?,
            entry_type: row.get(2)?,
            amount: row.get(3)?,
            description: row.get(4)?,
            reference_type: row.get(5)?,
            reference_id: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_entry(self) -> EngineResult<LedgerEntry> {
        Ok(LedgerEntry {
            entry_type: EntryType::parse(&self.entry_type)?,
            id: self.id,
            shift_id: self.shift_id,
            amount: self.amount,
            description: self.description,
            reference_type: self.reference_type,
            reference_id: self.reference_id,
            created_at: self.created_at,
        })
    }
}

/// Input for `append`. `shift_id` is left `None` by everything except the
/// shift open/close bootstrap, which references the shift it is creating
/// or closing.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub entry_type: EntryType,
    pub amount: Money,
    pub description: String,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub shift_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Write path
// ---------------------------------------------------------------------------

/// Id of the currently open shift, if any.
pub(crate) fn open_shift_id(conn: &Connection) -> EngineResult<Option<String>> {
    match conn.query_row(
        "SELECT id FROM shifts WHERE status = 'open'",
        [],
        |row| row.get::<_, String>(0),
    ) {
        Ok(id) => Ok(Some(id)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Append one entry. The only write operation on the ledger; runs on the
/// caller's connection so it commits or rolls back with the operation that
/// caused the cash movement.
pub fn append(conn: &Connection, new: NewLedgerEntry) -> EngineResult<LedgerEntry> {
    if !new.amount.is_positive() {
        return Err(EngineError::validation(format!(
            "ledger amount must be positive, got {}",
            new.amount.format_major()
        )));
    }
    if new.description.trim().is_empty() {
        return Err(EngineError::validation("ledger description must not be empty"));
    }

    let shift_id = match new.shift_id {
        Some(id) => id,
        None => open_shift_id(conn)?
            .ok_or_else(|| EngineError::conflict("no open shift to record cash movement against"))?,
    };

    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO ledger_entries (
            id, shift_id, entry_type, amount, description,
            reference_type, reference_id, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            shift_id,
            new.entry_type.as_str(),
            new.amount,
            new.description,
            new.reference_type,
            new.reference_id,
            now,
        ],
    )?;

    Ok(LedgerEntry {
        id,
        shift_id,
        entry_type: new.entry_type,
        amount: new.amount,
        description: new.description,
        reference_type: new.reference_type,
        reference_id: new.reference_id,
        created_at: now,
    })
}

// ---------------------------------------------------------------------------
// Read path
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Oldest first, for reconciliation walks.
    Asc,
    /// Newest first, for display feeds.
    Desc,
}

/// Query filters. Empty filters return the whole ledger.
#[derive(Debug, Clone, Default)]
pub struct LedgerQuery {
    pub shift_id: Option<String>,
    pub entry_types: Vec<EntryType>,
    /// Inclusive RFC3339 lower bound on created_at.
    pub from: Option<String>,
    /// Inclusive RFC3339 upper bound on created_at.
    pub to: Option<String>,
    pub order: Option<SortOrder>,
}

/// Read entries matching the query, ordered by creation time.
pub fn query(db: &DbState, q: &LedgerQuery) -> EngineResult<Vec<LedgerEntry>> {
    let conn = db.lock()?;
    query_with_conn(&conn, q)
}

pub(crate) fn query_with_conn(conn: &Connection, q: &LedgerQuery) -> EngineResult<Vec<LedgerEntry>> {
    let mut sql = String::from(
        "SELECT id, shift_id, entry_type, amount, description,
                reference_type, reference_id, created_at
         FROM ledger_entries",
    );
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<String> = Vec::new();

    if let Some(shift_id) = &q.shift_id {
        args.push(shift_id.clone());
        clauses.push(format!("shift_id = ?{}", args.len()));
    }
    if !q.entry_types.is_empty() {
        let mut placeholders = Vec::new();
        for t in &q.entry_types {
            args.push(t.as_str().to_string());
            placeholders.push(format!("?{}", args.len()));
        }
        clauses.push(format!("entry_type IN ({})", placeholders.join(", ")));
    }
    if let Some(from) = &q.from {
        args.push(from.clone());
        clauses.push(format!("created_at >= ?{}", args.len()));
    }
    if let Some(to) = &q.to {
        args.push(to.clone());
        clauses.push(format!("created_at <= ?{}", args.len()));
    }

    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    let dir = match q.order.unwrap_or(SortOrder::Desc) {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    sql.push_str(&format!(" ORDER BY created_at {dir}, id {dir}"));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), RawEntry::from_row)?;

    let mut entries = Vec::new();
    for raw in rows {
        entries.push(raw?.into_entry()?);
    }
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Pure aggregates
// ---------------------------------------------------------------------------

/// Total per entry type.
pub fn sum_by_type(entries: &[LedgerEntry]) -> BTreeMap<EntryType, Money> {
    let mut sums = BTreeMap::new();
    for e in entries {
        *sums.entry(e.entry_type).or_insert(Money::ZERO) += e.amount;
    }
    sums
}

/// Signed drawer balance over the entries (inflow minus outflow, drawer
/// cash only).
pub fn balance(entries: &[LedgerEntry]) -> Money {
    entries.iter().map(LedgerEntry::signed_drawer_amount).sum()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    fn seed_open_shift(db: &DbState, id: &str) {
        let conn = db.lock().unwrap();
        conn.execute(
            "INSERT INTO shifts (id, staff_id, opening_balance, status, opened_at)
             VALUES (?1, 'anna', 500000, 'open', datetime('now'))",
            params![id],
        )
        .expect("seed shift");
    }

    fn entry(entry_type: EntryType, amount: i64, description: &str) -> NewLedgerEntry {
        NewLedgerEntry {
            entry_type,
            amount: Money::from_minor(amount),
            description: description.to_string(),
            reference_type: None,
            reference_id: None,
            shift_id: None,
        }
    }

    #[test]
    fn test_append_stamps_open_shift() {
        let db = test_db();
        seed_open_shift(&db, "shift-1");

        let conn = db.lock().unwrap();
        let e = append(&conn, entry(EntryType::SaleCash, 75000, "Court 1, 90 min")).unwrap();
        assert_eq!(e.shift_id, "shift-1");
        assert_eq!(e.amount, Money::from_minor(75000));

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM ledger_entries", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_append_without_shift_conflicts() {
        let db = test_db();
        let conn = db.lock().unwrap();
        let err = append(&conn, entry(EntryType::SaleCash, 100, "orphan")).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[test]
    fn test_append_validates_amount_and_description() {
        let db = test_db();
        seed_open_shift(&db, "shift-1");
        let conn = db.lock().unwrap();

        let zero = append(&conn, entry(EntryType::CashIn, 0, "zero")).unwrap_err();
        assert!(matches!(zero, EngineError::Validation(_)));

        let negative = append(&conn, entry(EntryType::CashIn, -500, "negative")).unwrap_err();
        assert!(matches!(negative, EngineError::Validation(_)));

        let blank = append(&conn, entry(EntryType::CashIn, 500, "   ")).unwrap_err();
        assert!(matches!(blank, EngineError::Validation(_)));
    }

    #[test]
    fn test_query_orders_and_filters() {
        let db = test_db();
        seed_open_shift(&db, "shift-1");

        {
            let conn = db.lock().unwrap();
            // Deterministic timestamps, inserted out of order on purpose
            for (id, ts, ty, amount) in [
                ("l2", "2026-08-25T10:05:00+00:00", "sale_cash", 75000),
                ("l1", "2026-08-25T10:00:00+00:00", "cash_in", 500000),
                ("l3", "2026-08-25T10:10:00+00:00", "qr_in", 28000),
            ] {
                conn.execute(
                    "INSERT INTO ledger_entries (id, shift_id, entry_type, amount, description, created_at)
                     VALUES (?1, 'shift-1', ?2, ?3, 'seeded', ?4)",
                    params![id, ty, amount, ts],
                )
                .unwrap();
            }
        }

        let asc = query(
            &db,
            &LedgerQuery {
                order: Some(SortOrder::Asc),
                ..Default::default()
            },
        )
        .unwrap();
        let ids: Vec<&str> = asc.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["l1", "l2", "l3"]);

        let desc = query(&db, &LedgerQuery::default()).unwrap();
        let ids: Vec<&str> = desc.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["l3", "l2", "l1"]);

        let sales_only = query(
            &db,
            &LedgerQuery {
                entry_types: vec![EntryType::SaleCash],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(sales_only.len(), 1);
        assert_eq!(sales_only[0].id, "l2");

        let windowed = query(
            &db,
            &LedgerQuery {
                from: Some("2026-08-25T10:01:00+00:00".to_string()),
                to: Some("2026-08-25T10:06:00+00:00".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].id, "l2");
    }

    #[test]
    fn test_aggregates_are_pure_and_drawer_scoped() {
        let db = test_db();
        seed_open_shift(&db, "shift-1");

        {
            let conn = db.lock().unwrap();
            append(&conn, entry(EntryType::CashIn, 500000, "Opening float")).unwrap();
            append(&conn, entry(EntryType::SaleCash, 75000, "Court 1")).unwrap();
            append(&conn, entry(EntryType::RefundCash, 5000, "Returned racket fee")).unwrap();
            append(&conn, entry(EntryType::ShiftPayout, 100000, "Safe drop")).unwrap();
            append(&conn, entry(EntryType::QrIn, 28000, "QR transfer")).unwrap();
        }

        let entries = query(&db, &LedgerQuery::default()).unwrap();
        let sums = sum_by_type(&entries);
        assert_eq!(sums[&EntryType::SaleCash], Money::from_minor(75000));
        assert_eq!(sums[&EntryType::QrIn], Money::from_minor(28000));

        // 500000 + 75000 - 5000 - 100000; qr_in excluded from the drawer
        assert_eq!(balance(&entries), Money::from_minor(470000));
    }

    #[test]
    fn test_reference_fields_round_trip() {
        let db = test_db();
        seed_open_shift(&db, "shift-1");

        {
            let conn = db.lock().unwrap();
            append(
                &conn,
                NewLedgerEntry {
                    entry_type: EntryType::SaleCash,
                    amount: Money::from_minor(75000),
                    description: "Court 1, 90 min".to_string(),
                    reference_type: Some("payer_account".to_string()),
                    reference_id: Some("acct-9".to_string()),
                    shift_id: None,
                },
            )
            .unwrap();
        }

        let entries = query(&db, &LedgerQuery::default()).unwrap();
        assert_eq!(entries[0].reference_type.as_deref(), Some("payer_account"));
        assert_eq!(entries[0].reference_id.as_deref(), Some("acct-9"));
    }
}
