//! Payment processing against payer accounts.
//!
//! Two instruments: cash, taken at the counter and confirmed immediately,
//! and payment requests, where the customer scans a QR code and transfers
//! the money themselves. A request stays pending until an operator checks
//! the club's bank account and confirms it. Only confirmed payments touch
//! the ledger and the account's paid amount, and each confirmation writes
//! the payment, its ledger entry, and the account update in one
//! transaction.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};
use uuid::Uuid;

use crate::checkout::{self, CheckoutStatus, PayerAccount};
use crate::db::{self, DbState};
use crate::error::{EngineError, EngineResult};
use crate::ledger::{self, EntryType, NewLedgerEntry};
use crate::money::Money;
use crate::spayd::{self, AmountLimits};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    PaymentRequest,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::PaymentRequest => "payment_request",
        }
    }

    fn parse(s: &str) -> EngineResult<PaymentMethod> {
        match s {
            "cash" => Ok(PaymentMethod::Cash),
            "payment_request" => Ok(PaymentMethod::PaymentRequest),
            other => Err(EngineError::Internal(format!(
                "unknown payment method: {other}"
            ))),
        }
    }
}

/// One payment against one account. Cash rows are confirmed from birth;
/// request rows gain `confirmed_at` when the operator verifies the
/// transfer. A refund never deletes the row, it stamps `refunded_at`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub account_id: String,
    pub method: PaymentMethod,
    pub amount: Money,
    pub cash_received: Option<Money>,
    pub cash_change: Option<Money>,
    pub request_reference: Option<String>,
    pub confirmed_at: Option<String>,
    pub refunded_at: Option<String>,
    pub refund_reason: Option<String>,
    pub refund_staff_id: Option<String>,
    pub ledger_entry_id: Option<String>,
    pub staff_id: Option<String>,
    pub created_at: String,
}

/// Result of issuing a payment request: the pending payment row, the
/// encoded string, and its QR rendering for display.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedPaymentRequest {
    pub payment: Payment,
    pub encoded: String,
    pub qr_data_uri: String,
}

// ---------------------------------------------------------------------------
// Cash
// ---------------------------------------------------------------------------

/// Take a cash payment for an account.
///
/// `amount` is what gets applied to the account; change is computed from
/// `cash_received` and handed back, never absorbed. Overpaying the
/// account's remaining balance is rejected rather than clamped. Requires
/// an open shift, because the sale has to land in its ledger.
pub fn process_cash_payment(
    db: &DbState,
    account_id: &str,
    amount: Money,
    cash_received: Money,
    staff_id: Option<&str>,
) -> EngineResult<Payment> {
    if !amount.is_positive() {
        return Err(EngineError::validation("payment amount must be positive"));
    }
    if cash_received < amount {
        return Err(EngineError::validation(format!(
            "cash received {} is less than the amount due {}",
            cash_received.format_major(),
            amount.format_major()
        )));
    }

    let conn = db.lock()?;
    let payment_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> EngineResult<Money> {
        let account = checkout::get_account_with_conn(&conn, account_id)?;
        ensure_checkout_accepts_payments(&conn, &account.checkout_id)?;
        ensure_within_remaining(&account, amount)?;

        let entry = ledger::append(
            &conn,
            NewLedgerEntry {
                entry_type: EntryType::SaleCash,
                amount,
                description: format!("Cash sale, account {}", account.name),
                reference_type: Some("payment".to_string()),
                reference_id: Some(payment_id.clone()),
                shift_id: None,
            },
        )?;

        let change = cash_received - amount;
        conn.execute(
            "INSERT INTO payments (
                id, account_id, method, amount, cash_received, cash_change,
                confirmed_at, ledger_entry_id, staff_id, created_at, updated_at
            ) VALUES (?1, ?2, 'cash', ?3, ?4, ?5, ?6, ?7, ?8, ?6, ?6)",
            params![
                payment_id,
                account_id,
                amount,
                cash_received,
                change,
                now,
                entry.id,
                staff_id
            ],
        )?;

        conn.execute(
            "UPDATE payer_accounts SET paid_amount = paid_amount + ?1, updated_at = ?2 WHERE id = ?3",
            params![amount, now, account_id],
        )?;
        checkout::recalculate_with_conn(&conn, &account.checkout_id)?;
        Ok(change)
    })();

    match result {
        Ok(change) => {
            conn.execute_batch("COMMIT")?;
            info!(
                payment_id = %payment_id,
                account_id = %account_id,
                amount = %amount,
                change = %change,
                "Cash payment taken"
            );
            get_payment_with_conn(&conn, &payment_id)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Payment requests
// ---------------------------------------------------------------------------

/// Issue a payment request for an account.
///
/// Builds the encoded string and its QR code from the configured recipient
/// account, with a variable symbol derived from the account id so the
/// inbound transfer can be matched back without a bank callback. Inserts a
/// pending payment row; the ledger and the account are untouched until
/// `confirm_payment_request`.
pub fn generate_payment_request(
    db: &DbState,
    account_id: &str,
    amount: Money,
    staff_id: Option<&str>,
) -> EngineResult<IssuedPaymentRequest> {
    if !amount.is_positive() {
        return Err(EngineError::validation("payment amount must be positive"));
    }

    let conn = db.lock()?;
    let payment_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> EngineResult<(String, String)> {
        let account = checkout::get_account_with_conn(&conn, account_id)?;
        ensure_checkout_accepts_payments(&conn, &account.checkout_id)?;
        ensure_within_remaining(&account, amount)?;

        let recipient_account = db::get_setting(&conn, "payment_request", "recipient_account")
            .ok_or_else(|| {
                EngineError::conflict("payment request recipient account is not configured")
            })?;
        let recipient_name = db::get_setting(&conn, "payment_request", "recipient_name");
        let currency = db::get_setting(&conn, "payment_request", "currency")
            .unwrap_or_else(|| "CZK".to_string());

        let reference = variable_symbol(account_id);
        let encoded = spayd::encode(
            &spayd::PaymentRequest {
                account: &recipient_account,
                amount,
                currency: &currency,
                recipient_name: recipient_name.as_deref(),
                message: Some(&account.name),
                variable_symbol: Some(&reference),
            },
            &configured_limits(&conn),
        )?;
        let qr_data_uri = spayd::qr_data_uri(&encoded)?;

        conn.execute(
            "INSERT INTO payments (
                id, account_id, method, amount, request_reference,
                staff_id, created_at, updated_at
            ) VALUES (?1, ?2, 'payment_request', ?3, ?4, ?5, ?6, ?6)",
            params![payment_id, account_id, amount, reference, staff_id, now],
        )?;

        Ok((encoded, qr_data_uri))
    })();

    match result {
        Ok((encoded, qr_data_uri)) => {
            conn.execute_batch("COMMIT")?;
            info!(
                payment_id = %payment_id,
                account_id = %account_id,
                amount = %amount,
                "Payment request issued"
            );
            Ok(IssuedPaymentRequest {
                payment: get_payment_with_conn(&conn, &payment_id)?,
                encoded,
                qr_data_uri,
            })
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Confirm a pending payment request after the operator has verified the
/// transfer arrived.
///
/// Idempotent: confirming an already-confirmed payment changes nothing and
/// returns it as-is, so a double click cannot post twice. First
/// confirmation re-checks the account (its total may have moved since the
/// request was issued), posts the `qr_in` ledger entry, applies the
/// amount, and records the confirming operator when given.
pub fn confirm_payment_request(
    db: &DbState,
    payment_id: &str,
    staff_id: Option<&str>,
) -> EngineResult<Payment> {
    let conn = db.lock()?;
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> EngineResult<bool> {
        let payment = get_payment_with_conn(&conn, payment_id)?;
        if payment.confirmed_at.is_some() {
            return Ok(false);
        }
        if payment.method != PaymentMethod::PaymentRequest {
            return Err(EngineError::Internal(
                "cash payments are confirmed at creation".to_string(),
            ));
        }

        let account = checkout::get_account_with_conn(&conn, &payment.account_id)?;
        ensure_checkout_accepts_payments(&conn, &account.checkout_id)?;
        if ensure_within_remaining(&account, payment.amount).is_err() {
            return Err(EngineError::conflict(format!(
                "account {} changed since the request was issued; {} no longer fits its remaining balance",
                account.name,
                payment.amount.format_major()
            )));
        }

        let entry = ledger::append(
            &conn,
            NewLedgerEntry {
                entry_type: EntryType::QrIn,
                amount: payment.amount,
                description: format!("Payment request settled, account {}", account.name),
                reference_type: Some("payment".to_string()),
                reference_id: Some(payment_id.to_string()),
                shift_id: None,
            },
        )?;

        conn.execute(
            "UPDATE payments SET confirmed_at = ?1, ledger_entry_id = ?2,
                    staff_id = COALESCE(?3, staff_id), updated_at = ?1
             WHERE id = ?4",
            params![now, entry.id, staff_id, payment_id],
        )?;
        conn.execute(
            "UPDATE payer_accounts SET paid_amount = paid_amount + ?1, updated_at = ?2 WHERE id = ?3",
            params![payment.amount, now, payment.account_id],
        )?;
        checkout::recalculate_with_conn(&conn, &account.checkout_id)?;
        Ok(true)
    })();

    match result {
        Ok(newly_confirmed) => {
            conn.execute_batch("COMMIT")?;
            if newly_confirmed {
                info!(payment_id = %payment_id, "Payment request confirmed");
            }
            get_payment_with_conn(&conn, payment_id)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Refunds
// ---------------------------------------------------------------------------

/// Refund a confirmed payment in full, in cash over the counter.
///
/// Posts a `refund_cash` ledger entry, stamps the payment with the reason
/// and the refunding operator, and rolls the amount off the account, which
/// also unfreezes it for item edits. The original sale entry stays in the
/// ledger untouched.
pub fn refund_payment(
    db: &DbState,
    payment_id: &str,
    reason: &str,
    staff_id: Option<&str>,
) -> EngineResult<Payment> {
    if reason.trim().is_empty() {
        return Err(EngineError::validation("refund reason must not be empty"));
    }

    let conn = db.lock()?;
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> EngineResult<Money> {
        let payment = get_payment_with_conn(&conn, payment_id)?;
        if payment.confirmed_at.is_none() {
            return Err(EngineError::conflict(
                "only confirmed payments can be refunded",
            ));
        }
        if payment.refunded_at.is_some() {
            return Err(EngineError::conflict(format!(
                "payment {payment_id} is already refunded"
            )));
        }

        let account = checkout::get_account_with_conn(&conn, &payment.account_id)?;

        ledger::append(
            &conn,
            NewLedgerEntry {
                entry_type: EntryType::RefundCash,
                amount: payment.amount,
                description: format!("Refund, account {}", account.name),
                reference_type: Some("payment".to_string()),
                reference_id: Some(payment_id.to_string()),
                shift_id: None,
            },
        )?;

        conn.execute(
            "UPDATE payments SET refunded_at = ?1, refund_reason = ?2,
                    refund_staff_id = ?3, updated_at = ?1
             WHERE id = ?4",
            params![now, reason.trim(), staff_id, payment_id],
        )?;
        conn.execute(
            "UPDATE payer_accounts SET paid_amount = paid_amount - ?1, updated_at = ?2 WHERE id = ?3",
            params![payment.amount, now, payment.account_id],
        )?;
        checkout::recalculate_with_conn(&conn, &account.checkout_id)?;
        Ok(payment.amount)
    })();

    match result {
        Ok(amount) => {
            conn.execute_batch("COMMIT")?;
            info!(
                payment_id = %payment_id,
                amount = %amount,
                reason = %reason.trim(),
                "Payment refunded"
            );
            get_payment_with_conn(&conn, payment_id)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// All payments for an account, newest first.
pub fn list_account_payments(db: &DbState, account_id: &str) -> EngineResult<Vec<Payment>> {
    let conn = db.lock()?;
    checkout::get_account_with_conn(&conn, account_id)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments WHERE account_id = ?1 ORDER BY created_at DESC, id DESC"
    ))?;
    let rows = stmt.query_map(params![account_id], RawPayment::from_row)?;
    let mut payments = Vec::new();
    for raw in rows {
        payments.push(raw?.into_payment()?);
    }
    Ok(payments)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ensure_checkout_accepts_payments(conn: &Connection, checkout_id: &str) -> EngineResult<()> {
    if checkout::checkout_status_with_conn(conn, checkout_id)? == CheckoutStatus::Cancelled {
        return Err(EngineError::conflict(format!(
            "checkout {checkout_id} is cancelled"
        )));
    }
    Ok(())
}

fn ensure_within_remaining(account: &PayerAccount, amount: Money) -> EngineResult<()> {
    let remaining = account.total_amount - account.paid_amount;
    if amount > remaining {
        return Err(EngineError::validation(format!(
            "amount {} would overpay account {}; {} of {} remains due",
            amount.format_major(),
            account.name,
            remaining.format_major(),
            account.total_amount.format_major()
        )));
    }
    Ok(())
}

/// Deterministic 10-digit variable symbol from the account id, so an
/// operator can match an inbound transfer to its account by eye.
fn variable_symbol(account_id: &str) -> String {
    let value = match Uuid::parse_str(account_id) {
        Ok(id) => id.as_u128(),
        Err(_) => account_id
            .bytes()
            .fold(0u128, |acc, b| acc.wrapping_mul(31).wrapping_add(u128::from(b))),
    };
    format!("{:010}", value % 10_000_000_000)
}

fn configured_limits(conn: &Connection) -> AmountLimits {
    let mut limits = AmountLimits::default();
    if let Some(raw) = db::get_setting(conn, "payment_request", "min_amount") {
        match Money::parse(&raw) {
            Ok(v) => limits.min = v,
            Err(_) => warn!("ignoring malformed payment_request.min_amount: {raw}"),
        }
    }
    if let Some(raw) = db::get_setting(conn, "payment_request", "max_amount") {
        match Money::parse(&raw) {
            Ok(v) => limits.max = v,
            Err(_) => warn!("ignoring malformed payment_request.max_amount: {raw}"),
        }
    }
    limits
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const PAYMENT_COLUMNS: &str = "id, account_id, method, amount, cash_received, cash_change,
                               request_reference, confirmed_at, refunded_at, refund_reason,
                               refund_staff_id, ledger_entry_id, staff_id, created_at";

struct RawPayment {
    id: String,
    account_id: String,
    method: String,
    amount: Money,
    cash_received: Option<Money>,
    cash_change: Option<Money>,
    request_reference: Option<String>,
    confirmed_at: Option<String>,
    refunded_at: Option<String>,
    refund_reason: Option<String>,
    refund_staff_id: Option<String>,
    ledger_entry_id: Option<String>,
    staff_id: Option<String>,
    created_at: String,
}

impl RawPayment {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawPayment> {
        Ok(RawPayment {
            id: row.get(0)?,
            account_id: row.get(1)?,
            method: row.get(2)?,
            amount: row.get(3)?,
            cash_received: row.get(4)?,
            cash_change: row.get(5)?,
            request_reference: row.get(6)?,
            confirmed_at: row.get(7)?,
            refunded_at: row.get(8)?,
            refund_reason: row.get(9)?,
            refund_staff_id: row.get(10)?,
            ledger_entry_id: row.get(11)?,
            staff_id: row.get(12)?,
            created_at: row.get(13)?,
        })
    }

    fn into_payment(self) -> EngineResult<Payment> {
        Ok(Payment {
            method: PaymentMethod::parse(&self.method)?,
            id: self.id,
            account_id: self.account_id,
            amount: self.amount,
            cash_received: self.cash_received,
            cash_change: self.cash_change,
            request_reference: self.request_reference,
            confirmed_at: self.confirmed_at,
            refunded_at: self.refunded_at,
            refund_reason: self.refund_reason,
            refund_staff_id: self.refund_staff_id,
            ledger_entry_id: self.ledger_entry_id,
            staff_id: self.staff_id,
            created_at: self.created_at,
        })
    }
}

fn get_payment_with_conn(conn: &Connection, id: &str) -> EngineResult<Payment> {
    let raw = conn
        .query_row(
            &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?1"),
            params![id],
            RawPayment::from_row,
        )
        .optional()?
        .ok_or_else(|| EngineError::not_found("Payment", id))?;
    raw.into_payment()
}

// ===========================================================================
// Tests
// ===========================================================================
