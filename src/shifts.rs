//! Shift management for Courtside POS.
//!
//! Implements the cash-drawer shift lifecycle: open with a float, accrue
//! ledger entries, close against an operator-counted balance with variance
//! reporting. At most one shift is open system-wide; the database enforces
//! this with a partial unique index and every open/close runs inside an
//! immediate transaction.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{EngineError, EngineResult};
use crate::ledger::{self, EntryType, LedgerEntry, LedgerQuery, NewLedgerEntry, SortOrder};
use crate::money::Money;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftStatus {
    Open,
    Closed,
}

impl ShiftStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ShiftStatus::Open => "open",
            ShiftStatus::Closed => "closed",
        }
    }

    fn parse(s: &str) -> EngineResult<ShiftStatus> {
        match s {
            "open" => Ok(ShiftStatus::Open),
            "closed" => Ok(ShiftStatus::Closed),
            other => Err(EngineError::Internal(format!(
                "unknown shift status: {other}"
            ))),
        }
    }
}

/// A cash-drawer working period.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shift {
    pub id: String,
    pub staff_id: String,
    pub opening_balance: Money,
    pub closing_balance: Option<Money>,
    pub expected_closing: Option<Money>,
    pub variance: Option<Money>,
    pub status: ShiftStatus,
    pub notes: Option<String>,
    pub opened_at: String,
    pub closed_at: Option<String>,
}

/// Shift-scoped drawer overview. All zeros with no open shift.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CashSummary {
    /// Physical drawer cash: inflow minus outflow including the float.
    pub current_balance: Money,
    pub total_inflow: Money,
    pub total_outflow: Money,
    /// Confirmed QR transfers; bank money, kept out of the drawer numbers.
    pub transfer_in: Money,
    pub open_shift: Option<Shift>,
}

/// Manual drawer movement kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CashMovementKind {
    /// Petty cash added to the drawer.
    PaidIn,
    /// Cash taken out for an expense.
    PaidOut,
    /// Cash lifted to the safe or handed to a courier.
    Payout,
}

impl CashMovementKind {
    fn entry_type(self) -> EntryType {
        match self {
            CashMovementKind::PaidIn => EntryType::CashIn,
            CashMovementKind::PaidOut => EntryType::CashOut,
            CashMovementKind::Payout => EntryType::ShiftPayout,
        }
    }
}

// ---------------------------------------------------------------------------
// Open shift
// ---------------------------------------------------------------------------

/// Open a new shift with an operator-counted opening float.
///
/// Fails with `ConflictError` while another shift is open. The float is
/// posted as a `cash_in` ledger entry referencing the new shift, so the
/// ledger stays self-describing without a separate balance table.
pub fn open_shift(
    db: &DbState,
    staff_id: &str,
    opening_balance: Money,
    notes: Option<&str>,
) -> EngineResult<Shift> {
    if staff_id.trim().is_empty() {
        return Err(EngineError::validation("staff id must not be empty"));
    }
    if opening_balance.is_negative() {
        return Err(EngineError::validation(format!(
            "opening balance must not be negative, got {}",
            opening_balance.format_major()
        )));
    }

    let conn = db.lock()?;

    if let Some(existing) = ledger::open_shift_id(&conn)? {
        return Err(EngineError::conflict(format!(
            "a shift is already open ({existing})"
        )));
    }

    let shift_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> EngineResult<()> {
        let insert = conn.execute(
            "INSERT INTO shifts (
                id, staff_id, opening_balance, status, notes,
                opened_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, 'open', ?4, ?5, ?5, ?5)",
            params![shift_id, staff_id, opening_balance, notes, now],
        );
        if let Err(e) = insert {
            // The partial unique index catches a concurrent open that the
            // check above could not see.
            if is_unique_violation(&e) {
                return Err(EngineError::conflict("a shift is already open"));
            }
            return Err(e.into());
        }

        if opening_balance.is_positive() {
            ledger::append(
                &conn,
                NewLedgerEntry {
                    entry_type: EntryType::CashIn,
                    amount: opening_balance,
                    description: "Opening float".to_string(),
                    reference_type: Some("shift".to_string()),
                    reference_id: Some(shift_id.clone()),
                    shift_id: Some(shift_id.clone()),
                },
            )?;
        }

        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    }

    info!(
        shift_id = %shift_id,
        staff_id = %staff_id,
        opening = %opening_balance,
        "Shift opened"
    );

    Ok(Shift {
        id: shift_id,
        staff_id: staff_id.to_string(),
        opening_balance,
        closing_balance: None,
        expected_closing: None,
        variance: None,
        status: ShiftStatus::Open,
        notes: notes.map(str::to_string),
        opened_at: now,
        closed_at: None,
    })
}

// ---------------------------------------------------------------------------
// Close shift
// ---------------------------------------------------------------------------

/// Close the open shift against the operator's physical cash count.
///
/// Expected closing is derived purely from the shift's ledger entries (the
/// opening float is one of them). Variance is reported, never corrected,
/// and a nonzero variance does not block the close.
pub fn close_shift(
    db: &DbState,
    closing_balance: Money,
    notes: Option<&str>,
) -> EngineResult<Shift> {
    if closing_balance.is_negative() {
        return Err(EngineError::validation(format!(
            "closing balance must not be negative, got {}",
            closing_balance.format_major()
        )));
    }

    let conn = db.lock()?;

    let mut shift = match get_open_shift(&conn)? {
        Some(s) => s,
        None => {
            return Err(EngineError::not_found("Shift", "no shift is currently open"));
        }
    };

    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> EngineResult<(Money, Money)> {
        let entries = ledger::query_with_conn(
            &conn,
            &LedgerQuery {
                shift_id: Some(shift.id.clone()),
                order: Some(SortOrder::Asc),
                ..Default::default()
            },
        )?;
        let expected = ledger::balance(&entries);
        let variance = closing_balance - expected;

        if closing_balance.is_positive() {
            ledger::append(
                &conn,
                NewLedgerEntry {
                    entry_type: EntryType::CashOut,
                    amount: closing_balance,
                    description: "Closing count".to_string(),
                    reference_type: Some("shift".to_string()),
                    reference_id: Some(shift.id.clone()),
                    shift_id: Some(shift.id.clone()),
                },
            )?;
        }

        conn.execute(
            "UPDATE shifts SET
                closing_balance = ?1,
                expected_closing = ?2,
                variance = ?3,
                status = 'closed',
                notes = COALESCE(?4, notes),
                closed_at = ?5,
                updated_at = ?5
             WHERE id = ?6",
            params![closing_balance, expected, variance, notes, now, shift.id],
        )?;

        Ok((expected, variance))
    })();

    let (expected, variance) = match result {
        Ok(v) => {
            conn.execute_batch("COMMIT")?;
            v
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    };

    if variance == Money::ZERO {
        info!(
            shift_id = %shift.id,
            expected = %expected,
            counted = %closing_balance,
            "Shift closed"
        );
    } else {
        warn!(
            shift_id = %shift.id,
            expected = %expected,
            counted = %closing_balance,
            variance = %variance,
            "Shift closed with nonzero variance"
        );
    }

    shift.closing_balance = Some(closing_balance);
    shift.expected_closing = Some(expected);
    shift.variance = Some(variance);
    shift.status = ShiftStatus::Closed;
    if let Some(n) = notes {
        shift.notes = Some(n.to_string());
    }
    shift.closed_at = Some(now);
    Ok(shift)
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// The currently open shift, if any.
pub fn current_shift(db: &DbState) -> EngineResult<Option<Shift>> {
    let conn = db.lock()?;
    get_open_shift(&conn)
}

/// Shift-scoped drawer summary. Degrades to zeros when nothing is open.
pub fn cash_summary(db: &DbState) -> EngineResult<CashSummary> {
    let conn = db.lock()?;

    let shift = match get_open_shift(&conn)? {
        Some(s) => s,
        None => {
            return Ok(CashSummary {
                current_balance: Money::ZERO,
                total_inflow: Money::ZERO,
                total_outflow: Money::ZERO,
                transfer_in: Money::ZERO,
                open_shift: None,
            });
        }
    };

    let entries = ledger::query_with_conn(
        &conn,
        &LedgerQuery {
            shift_id: Some(shift.id.clone()),
            order: Some(SortOrder::Asc),
            ..Default::default()
        },
    )?;

    let mut inflow = Money::ZERO;
    let mut outflow = Money::ZERO;
    let mut transfer_in = Money::ZERO;
    for e in &entries {
        if !e.entry_type.affects_drawer() {
            transfer_in += e.amount;
        } else if e.entry_type.is_inflow() {
            inflow += e.amount;
        } else {
            outflow += e.amount;
        }
    }

    Ok(CashSummary {
        current_balance: inflow - outflow,
        total_inflow: inflow,
        total_outflow: outflow,
        transfer_in,
        open_shift: Some(shift),
    })
}

// ---------------------------------------------------------------------------
// Manual drawer movements
// ---------------------------------------------------------------------------

/// Record a manual drawer movement (petty cash in, expense out, payout).
///
/// Requires an open shift; the movement is one ledger entry, optionally
/// tagged with the acting staff member.
pub fn record_cash_movement(
    db: &DbState,
    kind: CashMovementKind,
    amount: Money,
    description: &str,
    staff_id: Option<&str>,
) -> EngineResult<LedgerEntry> {
    let conn = db.lock()?;

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = ledger::append(
        &conn,
        NewLedgerEntry {
            entry_type: kind.entry_type(),
            amount,
            description: description.to_string(),
            reference_type: staff_id.map(|_| "staff".to_string()),
            reference_id: staff_id.map(str::to_string),
            shift_id: None,
        },
    );

    match result {
        Ok(entry) => {
            conn.execute_batch("COMMIT")?;
            info!(
                entry_id = %entry.id,
                kind = %entry.entry_type.as_str(),
                amount = %entry.amount,
                "Cash movement recorded"
            );
            Ok(entry)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct RawShift {
    id: String,
    staff_id: String,
    opening_balance: Money,
    closing_balance: Option<Money>,
    expected_closing: Option<Money>,
    variance: Option<Money>,
    status: String,
    notes: Option<String>,
    opened_at: String,
    closed_at: Option<String>,
}

impl RawShift {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawShift> {
        Ok(RawShift {
            id: row.get(0)?,
            staff_id: row.get(1)?,
            opening_balance: row.get(2)?,
            closing_balance: row.get(3)?,
            expected_closing: row.get(4)?,
            variance: row.get(5)?,
            status: row.get(6)?,
            notes: row.get(7)?,
            opened_at: row.get(8)?,
            closed_at: row.get(9)?,
        })
    }

    fn into_shift(self) -> EngineResult<Shift> {
        Ok(Shift {
            status: ShiftStatus::parse(&self.status)?,
            id: self.id,
            staff_id: self.staff_id,
            opening_balance: self.opening_balance,
            closing_balance: self.closing_balance,
            expected_closing: self.expected_closing,
            variance: self.variance,
            notes: self.notes,
            opened_at: self.opened_at,
            closed_at: self.closed_at,
        })
    }
}

const SHIFT_COLUMNS: &str = "id, staff_id, opening_balance, closing_balance, expected_closing,
                             variance, status, notes, opened_at, closed_at";

fn get_open_shift(conn: &Connection) -> EngineResult<Option<Shift>> {
    let raw = conn
        .query_row(
            &format!("SELECT {SHIFT_COLUMNS} FROM shifts WHERE status = 'open'"),
            [],
            RawShift::from_row,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    raw.map(RawShift::into_shift).transpose()
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ===========================================================================
// Tests
// ===========================================================================
