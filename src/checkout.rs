//! Checkout aggregate: line items, payer accounts, derived statuses.
//!
//! A checkout is the billing document for one transaction episode. Items
//! are added and optionally pinned to a payer account or to players; the
//! split calculator turns items plus each account's rule into account
//! totals. Statuses are computed projections: only `recalculate` and the
//! payment path write them, callers never hand-set a status.
//!
//! Every mutation runs in one immediate transaction together with its
//! recalculation, so concurrent mutations of the same checkout serialize
//! and a failed recalculation rolls the mutation back.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::error::{EngineError, EngineResult};
use crate::money::Money;
use crate::split::{self, AccountShare, ItemCharge, SplitRule};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Court,
    Merchandise,
    Equipment,
    Surcharge,
    Discount,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Court => "court",
            ItemKind::Merchandise => "merchandise",
            ItemKind::Equipment => "equipment",
            ItemKind::Surcharge => "surcharge",
            ItemKind::Discount => "discount",
        }
    }

    fn parse(s: &str) -> EngineResult<ItemKind> {
        match s {
            "court" => Ok(ItemKind::Court),
            "merchandise" => Ok(ItemKind::Merchandise),
            "equipment" => Ok(ItemKind::Equipment),
            "surcharge" => Ok(ItemKind::Surcharge),
            "discount" => Ok(ItemKind::Discount),
            other => Err(EngineError::Internal(format!("unknown item kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Unpaid,
    Partial,
    Paid,
}

impl AccountStatus {
    /// Pure function of paid and total. Nothing paid means `unpaid` even
    /// when the total is zero; anything at or above the total means
    /// `paid`.
    pub fn derive(paid: Money, total: Money) -> AccountStatus {
        if !paid.is_positive() {
            AccountStatus::Unpaid
        } else if paid < total {
            AccountStatus::Partial
        } else {
            AccountStatus::Paid
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Unpaid => "unpaid",
            AccountStatus::Partial => "partial",
            AccountStatus::Paid => "paid",
        }
    }

    fn parse(s: &str) -> EngineResult<AccountStatus> {
        match s {
            "unpaid" => Ok(AccountStatus::Unpaid),
            "partial" => Ok(AccountStatus::Partial),
            "paid" => Ok(AccountStatus::Paid),
            other => Err(EngineError::Internal(format!(
                "unknown account status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus {
    Open,
    Partial,
    Completed,
    Cancelled,
}

impl CheckoutStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckoutStatus::Open => "open",
            CheckoutStatus::Partial => "partial",
            CheckoutStatus::Completed => "completed",
            CheckoutStatus::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> EngineResult<CheckoutStatus> {
        match s {
            "open" => Ok(CheckoutStatus::Open),
            "partial" => Ok(CheckoutStatus::Partial),
            "completed" => Ok(CheckoutStatus::Completed),
            "cancelled" => Ok(CheckoutStatus::Cancelled),
            other => Err(EngineError::Internal(format!(
                "unknown checkout status: {other}"
            ))),
        }
    }

    /// Completed iff at least one account exists and all are paid;
    /// partial as soon as any money arrived; open otherwise. `cancelled`
    /// never comes out of here, it is an explicit transition.
    fn derive(accounts: &[PayerAccount]) -> CheckoutStatus {
        if !accounts.is_empty() && accounts.iter().all(|a| a.status == AccountStatus::Paid) {
            CheckoutStatus::Completed
        } else if accounts.iter().any(|a| a.paid_amount.is_positive()) {
            CheckoutStatus::Partial
        } else {
            CheckoutStatus::Open
        }
    }
}

/// One billed line on a checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub id: String,
    pub checkout_id: String,
    pub kind: ItemKind,
    pub name: String,
    pub quantity: i64,
    pub unit_price: Money,
    pub discount: Money,
    pub total_price: Money,
    pub account_id: Option<String>,
    pub player_ids: Vec<String>,
    pub created_at: String,
}

/// A sub-bill within a checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayerAccount {
    pub id: String,
    pub checkout_id: String,
    pub name: String,
    pub players: Vec<String>,
    pub split_rule: SplitRule,
    pub position: i64,
    pub total_amount: Money,
    pub paid_amount: Money,
    pub status: AccountStatus,
    pub created_at: String,
}

/// The billing document head.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkout {
    pub id: String,
    pub status: CheckoutStatus,
    pub source_reservation_id: Option<String>,
    pub created_by: Option<String>,
    pub total_amount: Money,
    pub created_at: String,
}

/// Read-only summary view of a checkout with its items and accounts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutView {
    pub checkout: Checkout,
    pub items: Vec<LineItem>,
    pub accounts: Vec<PayerAccount>,
}

/// Reservation data the booking collaborator resolves for us; the engine
/// never fetches reservations itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationSnapshot {
    pub reservation_id: String,
    pub court_name: String,
    pub starts_at: String,
    pub ends_at: String,
    /// Court/time charge computed by the external pricing collaborator.
    pub price: Money,
    pub participants: Vec<String>,
}

/// Input for `add_item`.
#[derive(Debug, Clone)]
pub struct NewLineItem {
    pub kind: ItemKind,
    pub name: String,
    pub quantity: i64,
    pub unit_price: Money,
    pub discount: Money,
    pub account_id: Option<String>,
    pub player_ids: Vec<String>,
}

impl NewLineItem {
    pub fn new(kind: ItemKind, name: impl Into<String>, quantity: i64, unit_price: Money) -> Self {
        NewLineItem {
            kind,
            name: name.into(),
            quantity,
            unit_price,
            discount: Money::ZERO,
            account_id: None,
            player_ids: Vec::new(),
        }
    }

    /// A pure-discount line: quantity 1, no unit price, negative total.
    pub fn discount_line(name: impl Into<String>, amount: Money) -> Self {
        NewLineItem {
            kind: ItemKind::Discount,
            name: name.into(),
            quantity: 1,
            unit_price: Money::ZERO,
            discount: amount,
            account_id: None,
            player_ids: Vec::new(),
        }
    }

    pub fn assigned_to(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_discount(mut self, discount: Money) -> Self {
        self.discount = discount;
        self
    }

    pub fn with_players(mut self, players: Vec<String>) -> Self {
        self.player_ids = players;
        self
    }
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

/// Create a checkout, optionally seeded from a reservation snapshot.
///
/// A seeded checkout gets one default account holding all known
/// participants and, when the `checkout.include_court_price` setting is
/// not disabled, one court line item at the snapshot price assigned to
/// that account.
pub fn create_checkout(
    db: &DbState,
    staff_id: Option<&str>,
    source: Option<&ReservationSnapshot>,
) -> EngineResult<CheckoutView> {
    let conn = db.lock()?;

    let checkout_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> EngineResult<()> {
        conn.execute(
            "INSERT INTO checkouts (id, status, source_reservation_id, created_by, created_at, updated_at)
             VALUES (?1, 'open', ?2, ?3, ?4, ?4)",
            params![
                checkout_id,
                source.map(|s| s.reservation_id.as_str()),
                staff_id,
                now
            ],
        )?;

        if let Some(snapshot) = source {
            let account_id = insert_account(
                &conn,
                &checkout_id,
                &format!("{} booking", snapshot.court_name),
                &snapshot.participants,
                &now,
            )?;

            let include_court_price = db::get_setting(&conn, "checkout", "include_court_price")
                .map(|v| v != "false")
                .unwrap_or(true);
            if include_court_price {
                let item = NewLineItem::new(
                    ItemKind::Court,
                    format!(
                        "{} ({} - {})",
                        snapshot.court_name, snapshot.starts_at, snapshot.ends_at
                    ),
                    1,
                    snapshot.price,
                )
                .assigned_to(account_id)
                .with_players(snapshot.participants.clone());
                insert_line_item(&conn, &checkout_id, &item, &now)?;
            }

            recalculate_with_conn(&conn, &checkout_id)?;
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
        checkout_id = %checkout_id,
        from_reservation = source.is_some(),
        "Checkout created"
    );

    load_view(&conn, &checkout_id)
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// Add a line item, optionally pinned to an account, and recalculate.
///
/// Adding to an account with confirmed payments stays allowed: that is the
/// compensating-item path for post-payment corrections. A recalculation
/// failure (bad split config, negative account total) rolls the item back.
pub fn add_item(db: &DbState, checkout_id: &str, item: &NewLineItem) -> EngineResult<LineItem> {
    let conn = db.lock()?;
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> EngineResult<LineItem> {
        let status = checkout_status_with_conn(&conn, checkout_id)?;
        if status == CheckoutStatus::Cancelled {
            return Err(EngineError::conflict(format!(
                "checkout {checkout_id} is cancelled"
            )));
        }

        if let Some(account_id) = &item.account_id {
            let account = get_account_with_conn(&conn, account_id)?;
            if account.checkout_id != checkout_id {
                return Err(EngineError::validation(format!(
                    "account {account_id} belongs to a different checkout"
                )));
            }
        }

        let created = insert_line_item(&conn, checkout_id, item, &now)?;
        recalculate_with_conn(&conn, checkout_id)?;
        Ok(created)
    })();

    match result {
        Ok(created) => {
            conn.execute_batch("COMMIT")?;
            info!(
                item_id = %created.id,
                checkout_id = %checkout_id,
                kind = %created.kind.as_str(),
                total = %created.total_price,
                "Item added"
            );
            Ok(created)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Move an item to another account, or unassign it with `None`.
///
/// Rejected with `ConflictError` when the source or destination account
/// already has a confirmed payment; paid accounts are frozen against item
/// churn to keep the audit trail honest.
pub fn move_item_to_account(
    db: &DbState,
    item_id: &str,
    account_id: Option<&str>,
) -> EngineResult<LineItem> {
    let conn = db.lock()?;
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> EngineResult<String> {
        let item = get_item_with_conn(&conn, item_id)?;
        let status = checkout_status_with_conn(&conn, &item.checkout_id)?;
        if status == CheckoutStatus::Cancelled {
            return Err(EngineError::conflict(format!(
                "checkout {} is cancelled",
                item.checkout_id
            )));
        }

        if let Some(source) = &item.account_id {
            ensure_account_not_frozen(&conn, source)?;
        }
        if let Some(dest) = account_id {
            let dest_account = get_account_with_conn(&conn, dest)?;
            if dest_account.checkout_id != item.checkout_id {
                return Err(EngineError::validation(format!(
                    "account {dest} belongs to a different checkout"
                )));
            }
            ensure_account_not_frozen(&conn, dest)?;
        }

        conn.execute(
            "UPDATE line_items SET account_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![account_id, now, item_id],
        )?;
        recalculate_with_conn(&conn, &item.checkout_id)?;
        Ok(item.checkout_id)
    })();

    match result {
        Ok(checkout_id) => {
            conn.execute_batch("COMMIT")?;
            info!(
                item_id = %item_id,
                checkout_id = %checkout_id,
                account_id = account_id.unwrap_or("(unassigned)"),
                "Item moved"
            );
            get_item_with_conn(&conn, item_id)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Remove an item that has not been paid for. Post-payment corrections go
/// through compensating items instead.
pub fn remove_item(db: &DbState, item_id: &str) -> EngineResult<()> {
    let conn = db.lock()?;

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> EngineResult<String> {
        let item = get_item_with_conn(&conn, item_id)?;
        let status = checkout_status_with_conn(&conn, &item.checkout_id)?;
        if status == CheckoutStatus::Cancelled {
            return Err(EngineError::conflict(format!(
                "checkout {} is cancelled",
                item.checkout_id
            )));
        }
        if let Some(account_id) = &item.account_id {
            ensure_account_not_frozen(&conn, account_id)?;
        }

        conn.execute("DELETE FROM line_items WHERE id = ?1", params![item_id])?;
        recalculate_with_conn(&conn, &item.checkout_id)?;
        Ok(item.checkout_id)
    })();

    match result {
        Ok(checkout_id) => {
            conn.execute_batch("COMMIT")?;
            info!(item_id = %item_id, checkout_id = %checkout_id, "Item removed");
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// Create a payer account on a checkout. Accounts start unpaid with a zero
/// total and the by-item rule.
pub fn create_account(
    db: &DbState,
    checkout_id: &str,
    name: &str,
    players: &[String],
) -> EngineResult<PayerAccount> {
    if name.trim().is_empty() {
        return Err(EngineError::validation("account name must not be empty"));
    }

    let conn = db.lock()?;
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> EngineResult<String> {
        let status = checkout_status_with_conn(&conn, checkout_id)?;
        if status == CheckoutStatus::Cancelled {
            return Err(EngineError::conflict(format!(
                "checkout {checkout_id} is cancelled"
            )));
        }

        let account_id = insert_account(&conn, checkout_id, name, players, &now)?;
        recalculate_with_conn(&conn, checkout_id)?;
        Ok(account_id)
    })();

    match result {
        Ok(account_id) => {
            conn.execute_batch("COMMIT")?;
            info!(
                account_id = %account_id,
                checkout_id = %checkout_id,
                name = %name,
                "Payer account created"
            );
            get_account_with_conn(&conn, &account_id)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Change an account's split rule and recalculate.
pub fn set_split_rule(db: &DbState, account_id: &str, rule: &SplitRule) -> EngineResult<PayerAccount> {
    rule.validate()?;

    let conn = db.lock()?;
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> EngineResult<String> {
        let account = get_account_with_conn(&conn, account_id)?;
        let status = checkout_status_with_conn(&conn, &account.checkout_id)?;
        if status == CheckoutStatus::Cancelled {
            return Err(EngineError::conflict(format!(
                "checkout {} is cancelled",
                account.checkout_id
            )));
        }
        ensure_account_not_frozen(&conn, account_id)?;

        conn.execute(
            "UPDATE payer_accounts SET split_rule = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(rule)?, now, account_id],
        )?;
        recalculate_with_conn(&conn, &account.checkout_id)?;
        Ok(account.checkout_id)
    })();

    match result {
        Ok(checkout_id) => {
            conn.execute_batch("COMMIT")?;
            info!(
                account_id = %account_id,
                checkout_id = %checkout_id,
                rule = %rule.kind_name(),
                "Split rule changed"
            );
            get_account_with_conn(&conn, account_id)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Recalculation
// ---------------------------------------------------------------------------

/// Recompute account totals, the checkout total, and all derived statuses.
/// Idempotent; safe to call at any time.
pub fn recalculate(db: &DbState, checkout_id: &str) -> EngineResult<Checkout> {
    let conn = db.lock()?;

    conn.execute_batch("BEGIN IMMEDIATE")?;
    match recalculate_with_conn(&conn, checkout_id) {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    }

    get_checkout_with_conn(&conn, checkout_id)
}

/// Recalculation core, composed into the caller's transaction.
///
/// Cancelled checkouts are left untouched. Fails when the split
/// configuration is invalid, an account total would go negative, or a
/// recomputed total would drop below money already paid.
pub(crate) fn recalculate_with_conn(conn: &Connection, checkout_id: &str) -> EngineResult<()> {
    let checkout = get_checkout_with_conn(conn, checkout_id)?;
    if checkout.status == CheckoutStatus::Cancelled {
        return Ok(());
    }

    let mut accounts = list_accounts_with_conn(conn, checkout_id)?;
    let items = list_items_with_conn(conn, checkout_id)?;

    let shares: Vec<AccountShare> = accounts
        .iter()
        .map(|a| AccountShare {
            id: a.id.clone(),
            position: a.position,
            rule: a.split_rule.clone(),
        })
        .collect();
    let charges: Vec<ItemCharge> = items
        .iter()
        .map(|i| ItemCharge {
            account_id: i.account_id.clone(),
            total: i.total_price,
        })
        .collect();

    let totals = split::compute_account_totals(&shares, &charges)?;

    let now = Utc::now().to_rfc3339();
    for (account_id, total) in &totals {
        let account = accounts
            .iter_mut()
            .find(|a| &a.id == account_id)
            .ok_or_else(|| EngineError::Internal("calculator returned unknown account".into()))?;

        if total.is_negative() {
            return Err(EngineError::validation(format!(
                "account {} total would be negative ({})",
                account.name,
                total.format_major()
            )));
        }
        if *total < account.paid_amount {
            return Err(EngineError::conflict(format!(
                "account {} has confirmed payments of {} exceeding its recomputed total {}",
                account.name,
                account.paid_amount.format_major(),
                total.format_major()
            )));
        }

        account.total_amount = *total;
        account.status = AccountStatus::derive(account.paid_amount, *total);
        conn.execute(
            "UPDATE payer_accounts SET total_amount = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
            params![account.total_amount, account.status.as_str(), now, account.id],
        )?;
    }

    let checkout_total: Money = accounts.iter().map(|a| a.total_amount).sum();
    let status = CheckoutStatus::derive(&accounts);
    conn.execute(
        "UPDATE checkouts SET total_amount = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
        params![checkout_total, status.as_str(), now, checkout_id],
    )?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// Explicitly cancel a checkout. Terminal; only allowed while no account
/// holds paid money (refund first).
pub fn cancel_checkout(db: &DbState, checkout_id: &str) -> EngineResult<Checkout> {
    let conn = db.lock()?;
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> EngineResult<()> {
        let checkout = get_checkout_with_conn(&conn, checkout_id)?;
        match checkout.status {
            CheckoutStatus::Cancelled => {
                return Err(EngineError::conflict(format!(
                    "checkout {checkout_id} is already cancelled"
                )));
            }
            CheckoutStatus::Completed => {
                return Err(EngineError::conflict(
                    "a completed checkout cannot be cancelled",
                ));
            }
            CheckoutStatus::Open | CheckoutStatus::Partial => {}
        }

        let paid: Money = conn.query_row(
            "SELECT COALESCE(SUM(paid_amount), 0) FROM payer_accounts WHERE checkout_id = ?1",
            params![checkout_id],
            |row| row.get(0),
        )?;
        if paid.is_positive() {
            return Err(EngineError::conflict(format!(
                "checkout {checkout_id} has {} in confirmed payments; refund before cancelling",
                paid.format_major()
            )));
        }

        conn.execute(
            "UPDATE checkouts SET status = 'cancelled', updated_at = ?1 WHERE id = ?2",
            params![now, checkout_id],
        )?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            info!(checkout_id = %checkout_id, "Checkout cancelled");
            get_checkout_with_conn(&conn, checkout_id)
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

/// Full checkout view: head, items, accounts.
pub fn get_checkout(db: &DbState, checkout_id: &str) -> EngineResult<CheckoutView> {
    let conn = db.lock()?;
    load_view(&conn, checkout_id)
}

fn load_view(conn: &Connection, checkout_id: &str) -> EngineResult<CheckoutView> {
    Ok(CheckoutView {
        checkout: get_checkout_with_conn(conn, checkout_id)?,
        items: list_items_with_conn(conn, checkout_id)?,
        accounts: list_accounts_with_conn(conn, checkout_id)?,
    })
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn insert_account(
    conn: &Connection,
    checkout_id: &str,
    name: &str,
    players: &[String],
    now: &str,
) -> EngineResult<String> {
    if name.trim().is_empty() {
        return Err(EngineError::validation("account name must not be empty"));
    }

    let position: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position) + 1, 0) FROM payer_accounts WHERE checkout_id = ?1",
        params![checkout_id],
        |row| row.get(0),
    )?;

    let account_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO payer_accounts (
            id, checkout_id, name, players, split_rule, position,
            total_amount, paid_amount, status, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, 'unpaid', ?7, ?7)",
        params![
            account_id,
            checkout_id,
            name,
            serde_json::to_string(players)?,
            serde_json::to_string(&SplitRule::ByItem)?,
            position,
            now,
        ],
    )?;
    Ok(account_id)
}

fn insert_line_item(
    conn: &Connection,
    checkout_id: &str,
    item: &NewLineItem,
    now: &str,
) -> EngineResult<LineItem> {
    if item.name.trim().is_empty() {
        return Err(EngineError::validation("item name must not be empty"));
    }

    let total_price = match item.kind {
        ItemKind::Discount => {
            if item.quantity != 1 {
                return Err(EngineError::validation(
                    "discount lines must have quantity 1",
                ));
            }
            if item.unit_price != Money::ZERO {
                return Err(EngineError::validation(
                    "discount lines carry no unit price",
                ));
            }
            if !item.discount.is_positive() {
                return Err(EngineError::validation(
                    "discount lines need a positive discount amount",
                ));
            }
            -item.discount
        }
        _ => {
            if item.quantity < 1 {
                return Err(EngineError::validation(format!(
                    "quantity must be at least 1, got {}",
                    item.quantity
                )));
            }
            if item.unit_price.is_negative() {
                return Err(EngineError::validation("unit price must not be negative"));
            }
            if item.discount.is_negative() {
                return Err(EngineError::validation("discount must not be negative"));
            }
            let gross = item.unit_price * item.quantity;
            if item.discount > gross {
                return Err(EngineError::validation(format!(
                    "discount {} exceeds the line total {}",
                    item.discount.format_major(),
                    gross.format_major()
                )));
            }
            gross - item.discount
        }
    };

    let item_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO line_items (
            id, checkout_id, kind, name, quantity, unit_price, discount,
            total_price, account_id, player_ids, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
        params![
            item_id,
            checkout_id,
            item.kind.as_str(),
            item.name,
            item.quantity,
            item.unit_price,
            item.discount,
            total_price,
            item.account_id,
            serde_json::to_string(&item.player_ids)?,
            now,
        ],
    )?;

    Ok(LineItem {
        id: item_id,
        checkout_id: checkout_id.to_string(),
        kind: item.kind,
        name: item.name.clone(),
        quantity: item.quantity,
        unit_price: item.unit_price,
        discount: item.discount,
        total_price,
        account_id: item.account_id.clone(),
        player_ids: item.player_ids.clone(),
        created_at: now.to_string(),
    })
}

/// An account is frozen while it has a confirmed, unrefunded payment.
fn account_is_frozen(conn: &Connection, account_id: &str) -> EngineResult<bool> {
    let frozen: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM payments
            WHERE account_id = ?1 AND confirmed_at IS NOT NULL AND refunded_at IS NULL
         )",
        params![account_id],
        |row| row.get(0),
    )?;
    Ok(frozen != 0)
}

fn ensure_account_not_frozen(conn: &Connection, account_id: &str) -> EngineResult<()> {
    if account_is_frozen(conn, account_id)? {
        return Err(EngineError::conflict(format!(
            "account {account_id} has confirmed payments; items on it are frozen"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct RawCheckout {
    id: String,
    status: String,
    source_reservation_id: Option<String>,
    created_by: Option<String>,
    total_amount: Money,
    created_at: String,
}

impl RawCheckout {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCheckout> {
        Ok(RawCheckout {
            id: row.get(0)?,
            status: row.get(1)?,
            source_reservation_id: row.get(2)?,
            created_by: row.get(3)?,
            total_amount: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_checkout(self) -> EngineResult<Checkout> {
        Ok(Checkout {
            status: CheckoutStatus::parse(&self.status)?,
            id: self.id,
            source_reservation_id: self.source_reservation_id,
            created_by: self.created_by,
            total_amount: self.total_amount,
            created_at: self.created_at,
        })
    }
}

struct RawAccount {
    id: String,
    checkout_id: String,
    name: String,
    players: String,
    split_rule: String,
    position: i64,
    total_amount: Money,
    paid_amount: Money,
    status: String,
    created_at: String,
}

impl RawAccount {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAccount> {
        Ok(RawAccount {
            id: row.get(0)?,
            checkout_id: row.get(1)?,
            name: row.get(2)?,
            players: row.get(3)?,
            split_rule: row.get(4)?,
            position: row.get(5)?,
            total_amount: row.get(6)?,
            paid_amount: row.get(7)?,
            status: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_account(self) -> EngineResult<PayerAccount> {
        Ok(PayerAccount {
            status: AccountStatus::parse(&self.status)?,
            split_rule: serde_json::from_str(&self.split_rule)?,
            players: serde_json::from_str(&self.players)?,
            id: self.id,
            checkout_id: self.checkout_id,
            name: self.name,
            position: self.position,
            total_amount: self.total_amount,
            paid_amount: self.paid_amount,
            created_at: self.created_at,
        })
    }
}

struct RawItem {
    id: String,
    checkout_id: String,
    kind: String,
    name: String,
    quantity: i64,
    unit_price: Money,
    discount: Money,
    total_price: Money,
    account_id: Option<String>,
    player_ids: String,
    created_at: String,
}

impl RawItem {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawItem> {
        Ok(RawItem {
            id: row.get(0)?,
            checkout_id: row.get(1)?,
            kind: row.get(2)?,
            name: row.get(3)?,
            quantity: row.get(4)?,
            unit_price: row.get(5)?,
            discount: row.get(6)?,
            total_price: row.get(7)?,
            account_id: row.get(8)?,
            player_ids: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_item(self) -> EngineResult<LineItem> {
        Ok(LineItem {
            kind: ItemKind::parse(&self.kind)?,
            player_ids: serde_json::from_str(&self.player_ids)?,
            id: self.id,
            checkout_id: self.checkout_id,
            name: self.name,
            quantity: self.quantity,
            unit_price: self.unit_price,
            discount: self.discount,
            total_price: self.total_price,
            account_id: self.account_id,
            created_at: self.created_at,
        })
    }
}

const CHECKOUT_COLUMNS: &str =
    "id, status, source_reservation_id, created_by, total_amount, created_at";
const ACCOUNT_COLUMNS: &str = "id, checkout_id, name, players, split_rule, position,
                               total_amount, paid_amount, status, created_at";
const ITEM_COLUMNS: &str = "id, checkout_id, kind, name, quantity, unit_price, discount,
                            total_price, account_id, player_ids, created_at";

fn get_checkout_with_conn(conn: &Connection, id: &str) -> EngineResult<Checkout> {
    let raw = conn
        .query_row(
            &format!("SELECT {CHECKOUT_COLUMNS} FROM checkouts WHERE id = ?1"),
            params![id],
            RawCheckout::from_row,
        )
        .optional()?
        .ok_or_else(|| EngineError::not_found("Checkout", id))?;
    raw.into_checkout()
}

pub(crate) fn checkout_status_with_conn(
    conn: &Connection,
    id: &str,
) -> EngineResult<CheckoutStatus> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM checkouts WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    match status {
        Some(s) => CheckoutStatus::parse(&s),
        None => Err(EngineError::not_found("Checkout", id)),
    }
}

pub(crate) fn get_account_with_conn(conn: &Connection, id: &str) -> EngineResult<PayerAccount> {
    let raw = conn
        .query_row(
            &format!("SELECT {ACCOUNT_COLUMNS} FROM payer_accounts WHERE id = ?1"),
            params![id],
            RawAccount::from_row,
        )
        .optional()?
        .ok_or_else(|| EngineError::not_found("Account", id))?;
    raw.into_account()
}

fn get_item_with_conn(conn: &Connection, id: &str) -> EngineResult<LineItem> {
    let raw = conn
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM line_items WHERE id = ?1"),
            params![id],
            RawItem::from_row,
        )
        .optional()?
        .ok_or_else(|| EngineError::not_found("LineItem", id))?;
    raw.into_item()
}

fn list_accounts_with_conn(conn: &Connection, checkout_id: &str) -> EngineResult<Vec<PayerAccount>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM payer_accounts WHERE checkout_id = ?1 ORDER BY position"
    ))?;
    let rows = stmt.query_map(params![checkout_id], RawAccount::from_row)?;
    let mut accounts = Vec::new();
    for raw in rows {
        accounts.push(raw?.into_account()?);
    }
    Ok(accounts)
}

fn list_items_with_conn(conn: &Connection, checkout_id: &str) -> EngineResult<Vec<LineItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ITEM_COLUMNS} FROM line_items WHERE checkout_id = ?1 ORDER BY created_at, id"
    ))?;
    let rows = stmt.query_map(params![checkout_id], RawItem::from_row)?;
    let mut items = Vec::new();
    for raw in rows {
        items.push(raw?.into_item()?);
    }
    Ok(items)
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

    fn snapshot() -> ReservationSnapshot {
        ReservationSnapshot {
            reservation_id: "res-42".to_string(),
            court_name: "Court 1".to_string(),
            starts_at: "2026-08-25T18:00:00+00:00".to_string(),
            ends_at: "2026-08-25T19:30:00+00:00".to_string(),
            price: Money::from_minor(75000),
            participants: vec!["petra".to_string(), "jan".to_string()],
        }
    }

    /// Simulate a confirmed payment without going through the payments
    /// module (unit-level freeze/paid bookkeeping).
    fn seed_confirmed_payment(db: &DbState, account_id: &str, amount: i64) {
        let conn = db.lock().unwrap();
        conn.execute(
            "INSERT INTO payments (id, account_id, method, amount, confirmed_at, created_at, updated_at)
             VALUES (?1, ?2, 'cash', ?3, datetime('now'), datetime('now'), datetime('now'))",
            params![Uuid::new_v4().to_string(), account_id, amount],
        )
        .expect("seed payment");
        conn.execute(
            "UPDATE payer_accounts SET paid_amount = paid_amount + ?1 WHERE id = ?2",
            params![amount, account_id],
        )
        .expect("bump paid");
        let checkout_id: String = conn
            .query_row(
                "SELECT checkout_id FROM payer_accounts WHERE id = ?1",
                params![account_id],
                |r| r.get(0),
            )
            .expect("account exists");
        recalculate_with_conn(&conn, &checkout_id).expect("recalc after seed");
    }

    #[test]
    fn test_create_empty_checkout() {
        let db = test_db();
        let view = create_checkout(&db, Some("anna"), None).unwrap();
        assert_eq!(view.checkout.status, CheckoutStatus::Open);
        assert_eq!(view.checkout.total_amount, Money::ZERO);
        assert_eq!(view.checkout.created_by.as_deref(), Some("anna"));
        assert!(view.items.is_empty());
        assert!(view.accounts.is_empty());
    }

    #[test]
    fn test_create_from_reservation_seeds_account_and_court_item() {
        let db = test_db();
        let view = create_checkout(&db, None, Some(&snapshot())).unwrap();

        assert_eq!(
            view.checkout.source_reservation_id.as_deref(),
            Some("res-42")
        );
        assert_eq!(view.accounts.len(), 1);
        let account = &view.accounts[0];
        assert_eq!(account.name, "Court 1 booking");
        assert_eq!(account.players, vec!["petra", "jan"]);
        assert_eq!(account.total_amount, Money::from_minor(75000));

        assert_eq!(view.items.len(), 1);
        let item = &view.items[0];
        assert_eq!(item.kind, ItemKind::Court);
        assert_eq!(item.account_id.as_deref(), Some(account.id.as_str()));
        assert_eq!(item.total_price, Money::from_minor(75000));

        assert_eq!(view.checkout.total_amount, Money::from_minor(75000));
    }

    #[test]
    fn test_include_court_price_policy_off() {
        let db = test_db();
        {
            let conn = db.lock().unwrap();
            db::set_setting(&conn, "checkout", "include_court_price", "false").unwrap();
        }
        let view = create_checkout(&db, None, Some(&snapshot())).unwrap();
        assert_eq!(view.accounts.len(), 1);
        assert!(view.items.is_empty());
        assert_eq!(view.checkout.total_amount, Money::ZERO);
    }

    #[test]
    fn test_add_item_validations() {
        let db = test_db();
        let view = create_checkout(&db, None, None).unwrap();
        let id = view.checkout.id.as_str();

        let blank = NewLineItem::new(ItemKind::Merchandise, "   ", 1, Money::from_minor(100));
        assert!(matches!(
            add_item(&db, id, &blank).unwrap_err(),
            EngineError::Validation(_)
        ));

        let zero_qty = NewLineItem::new(ItemKind::Merchandise, "Balls", 0, Money::from_minor(100));
        assert!(matches!(
            add_item(&db, id, &zero_qty).unwrap_err(),
            EngineError::Validation(_)
        ));

        let negative_price =
            NewLineItem::new(ItemKind::Merchandise, "Balls", 1, Money::from_minor(-100));
        assert!(matches!(
            add_item(&db, id, &negative_price).unwrap_err(),
            EngineError::Validation(_)
        ));

        let oversized_discount =
            NewLineItem::new(ItemKind::Merchandise, "Balls", 2, Money::from_minor(100))
                .with_discount(Money::from_minor(300));
        assert!(matches!(
            add_item(&db, id, &oversized_discount).unwrap_err(),
            EngineError::Validation(_)
        ));

        // Discount-line shape rules
        let bad_qty = NewLineItem {
            quantity: 2,
            ..NewLineItem::discount_line("Member discount", Money::from_minor(500))
        };
        assert!(matches!(
            add_item(&db, id, &bad_qty).unwrap_err(),
            EngineError::Validation(_)
        ));
        let zero_discount = NewLineItem::discount_line("Member discount", Money::ZERO);
        assert!(matches!(
            add_item(&db, id, &zero_discount).unwrap_err(),
            EngineError::Validation(_)
        ));

        let unknown = add_item(
            &db,
            "nope",
            &NewLineItem::new(ItemKind::Merchandise, "Balls", 1, Money::from_minor(100)),
        );
        assert!(matches!(unknown.unwrap_err(), EngineError::NotFound { .. }));
    }

    #[test]
    fn test_item_discount_math() {
        let db = test_db();
        let view = create_checkout(&db, None, None).unwrap();
        let id = view.checkout.id.as_str();

        let discounted = add_item(
            &db,
            id,
            &NewLineItem::new(ItemKind::Equipment, "Racket rental", 2, Money::from_minor(15000))
                .with_discount(Money::from_minor(5000)),
        )
        .unwrap();
        assert_eq!(discounted.total_price, Money::from_minor(25000));

        let pure = add_item(
            &db,
            id,
            &NewLineItem::discount_line("Member discount", Money::from_minor(2000)),
        )
        .unwrap();
        assert_eq!(pure.total_price, Money::from_minor(-2000));
    }

    #[test]
    fn test_create_account_requires_name() {
        let db = test_db();
        let view = create_checkout(&db, None, None).unwrap();
        let err = create_account(&db, &view.checkout.id, "  ", &[]).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_account_positions_follow_creation_order() {
        let db = test_db();
        let view = create_checkout(&db, None, None).unwrap();
        let a = create_account(&db, &view.checkout.id, "Petra", &[]).unwrap();
        let b = create_account(&db, &view.checkout.id, "Jan", &[]).unwrap();
        assert_eq!(a.position, 0);
        assert_eq!(b.position, 1);
    }

    #[test]
    fn test_by_item_billing_and_unassigned_pool_exclusion() {
        let db = test_db();
        let view = create_checkout(&db, None, None).unwrap();
        let id = view.checkout.id.as_str();
        let account = create_account(&db, id, "Petra", &[]).unwrap();

        add_item(
            &db,
            id,
            &NewLineItem::new(ItemKind::Court, "Court 1, 90 min", 1, Money::from_minor(75000))
                .assigned_to(account.id.clone()),
        )
        .unwrap();
        // Unassigned merchandise stays out of every total
        add_item(
            &db,
            id,
            &NewLineItem::new(ItemKind::Merchandise, "Towel", 1, Money::from_minor(12000)),
        )
        .unwrap();

        let view = get_checkout(&db, id).unwrap();
        assert_eq!(view.accounts[0].total_amount, Money::from_minor(75000));
        assert_eq!(view.checkout.total_amount, Money::from_minor(75000));
        assert_eq!(view.checkout.status, CheckoutStatus::Open);
    }

    #[test]
    fn test_equal_split_totals() {
        let db = test_db();
        let view = create_checkout(&db, None, None).unwrap();
        let id = view.checkout.id.as_str();
        let a = create_account(&db, id, "Petra", &[]).unwrap();
        let b = create_account(&db, id, "Jan", &[]).unwrap();
        set_split_rule(&db, &a.id, &SplitRule::Equal).unwrap();
        set_split_rule(&db, &b.id, &SplitRule::Equal).unwrap();

        add_item(
            &db,
            id,
            &NewLineItem::new(ItemKind::Court, "Court 2", 1, Money::from_minor(30000)),
        )
        .unwrap();
        let view = get_checkout(&db, id).unwrap();
        assert_eq!(view.accounts[0].total_amount, Money::from_minor(15000));
        assert_eq!(view.accounts[1].total_amount, Money::from_minor(15000));

        // Odd total: remainder lands on the first account by creation order
        add_item(
            &db,
            id,
            &NewLineItem::new(ItemKind::Surcharge, "Late fee", 1, Money::from_minor(1)),
        )
        .unwrap();
        let view = get_checkout(&db, id).unwrap();
        assert_eq!(view.accounts[0].total_amount, Money::from_minor(15001));
        assert_eq!(view.accounts[1].total_amount, Money::from_minor(15000));
        assert_eq!(view.checkout.total_amount, Money::from_minor(30001));
    }

    #[test]
    fn test_invalid_percentages_roll_back_the_item() {
        let db = test_db();
        let view = create_checkout(&db, None, None).unwrap();
        let id = view.checkout.id.as_str();
        let a = create_account(&db, id, "Petra", &[]).unwrap();
        let b = create_account(&db, id, "Jan", &[]).unwrap();
        // Dormant while the pool is empty, even though 50 + 30 != 100
        set_split_rule(&db, &a.id, &SplitRule::Percentage { percent: 50.0 }).unwrap();
        set_split_rule(&db, &b.id, &SplitRule::Percentage { percent: 30.0 }).unwrap();

        // Percentages off 100 reject the item that triggered recalculation
        let err = add_item(
            &db,
            id,
            &NewLineItem::new(ItemKind::Court, "Court 2", 1, Money::from_minor(10000)),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(err.to_string().contains("80.00%"));
        let view = get_checkout(&db, id).unwrap();
        assert!(view.items.is_empty(), "rolled-back item must not persist");

        // Fixing the rules lets the same item through
        set_split_rule(&db, &b.id, &SplitRule::Percentage { percent: 50.0 }).unwrap();
        add_item(
            &db,
            id,
            &NewLineItem::new(ItemKind::Court, "Court 2", 1, Money::from_minor(10000)),
        )
        .unwrap();
        let view = get_checkout(&db, id).unwrap();
        assert_eq!(view.accounts[0].total_amount, Money::from_minor(5000));
        assert_eq!(view.accounts[1].total_amount, Money::from_minor(5000));
    }

    #[test]
    fn test_percentage_split_accounts() {
        let db = test_db();
        let view = create_checkout(&db, None, None).unwrap();
        let id = view.checkout.id.as_str();
        let a = create_account(&db, id, "Petra", &[]).unwrap();
        let b = create_account(&db, id, "Jan", &[]).unwrap();
        set_split_rule(&db, &a.id, &SplitRule::Percentage { percent: 60.0 }).unwrap();
        set_split_rule(&db, &b.id, &SplitRule::Percentage { percent: 40.0 }).unwrap();

        add_item(
            &db,
            id,
            &NewLineItem::new(ItemKind::Court, "Court 2", 1, Money::from_minor(25000)),
        )
        .unwrap();
        let view = get_checkout(&db, id).unwrap();
        assert_eq!(view.accounts[0].total_amount, Money::from_minor(15000));
        assert_eq!(view.accounts[1].total_amount, Money::from_minor(10000));
    }

    #[test]
    fn test_move_item_between_accounts() {
        let db = test_db();
        let view = create_checkout(&db, None, None).unwrap();
        let id = view.checkout.id.as_str();
        let a = create_account(&db, id, "Petra", &[]).unwrap();
        let b = create_account(&db, id, "Jan", &[]).unwrap();

        let item = add_item(
            &db,
            id,
            &NewLineItem::new(ItemKind::Equipment, "Racket", 1, Money::from_minor(15000))
                .assigned_to(a.id.clone()),
        )
        .unwrap();

        let moved = move_item_to_account(&db, &item.id, Some(&b.id)).unwrap();
        assert_eq!(moved.account_id.as_deref(), Some(b.id.as_str()));

        let view = get_checkout(&db, id).unwrap();
        assert_eq!(view.accounts[0].total_amount, Money::ZERO);
        assert_eq!(view.accounts[1].total_amount, Money::from_minor(15000));

        // Unassign drops it from all totals
        move_item_to_account(&db, &item.id, None).unwrap();
        let view = get_checkout(&db, id).unwrap();
        assert_eq!(view.checkout.total_amount, Money::ZERO);
    }

    #[test]
    fn test_frozen_account_rejects_item_churn() {
        let db = test_db();
        let view = create_checkout(&db, None, None).unwrap();
        let id = view.checkout.id.as_str();
        let a = create_account(&db, id, "Petra", &[]).unwrap();
        let b = create_account(&db, id, "Jan", &[]).unwrap();

        let item = add_item(
            &db,
            id,
            &NewLineItem::new(ItemKind::Court, "Court 1", 1, Money::from_minor(75000))
                .assigned_to(a.id.clone()),
        )
        .unwrap();

        seed_confirmed_payment(&db, &a.id, 75000);

        // Source frozen
        assert!(matches!(
            move_item_to_account(&db, &item.id, Some(&b.id)).unwrap_err(),
            EngineError::Conflict(_)
        ));
        // Destination frozen
        let loose = add_item(
            &db,
            id,
            &NewLineItem::new(ItemKind::Merchandise, "Towel", 1, Money::from_minor(12000)),
        )
        .unwrap();
        assert!(matches!(
            move_item_to_account(&db, &loose.id, Some(&a.id)).unwrap_err(),
            EngineError::Conflict(_)
        ));
        // Removal frozen too
        assert!(matches!(
            remove_item(&db, &item.id).unwrap_err(),
            EngineError::Conflict(_)
        ));

        // Compensating item on the frozen account is the allowed correction
        let comp = add_item(
            &db,
            id,
            &NewLineItem::new(ItemKind::Surcharge, "Extra 15 min", 1, Money::from_minor(12500))
                .assigned_to(a.id.clone()),
        )
        .unwrap();
        assert_eq!(comp.total_price, Money::from_minor(12500));
        let view = get_checkout(&db, id).unwrap();
        assert_eq!(view.accounts[0].total_amount, Money::from_minor(87500));
        assert_eq!(view.accounts[0].status, AccountStatus::Partial);
    }

    #[test]
    fn test_refunded_payment_unfreezes_account() {
        let db = test_db();
        let view = create_checkout(&db, None, None).unwrap();
        let id = view.checkout.id.as_str();
        let a = create_account(&db, id, "Petra", &[]).unwrap();
        let item = add_item(
            &db,
            id,
            &NewLineItem::new(ItemKind::Court, "Court 1", 1, Money::from_minor(75000))
                .assigned_to(a.id.clone()),
        )
        .unwrap();
        seed_confirmed_payment(&db, &a.id, 75000);

        {
            let conn = db.lock().unwrap();
            conn.execute(
                "UPDATE payments SET refunded_at = datetime('now') WHERE account_id = ?1",
                params![a.id],
            )
            .unwrap();
            conn.execute(
                "UPDATE payer_accounts SET paid_amount = 0 WHERE id = ?1",
                params![a.id],
            )
            .unwrap();
        }

        move_item_to_account(&db, &item.id, None).unwrap();
        let view = get_checkout(&db, id).unwrap();
        assert_eq!(view.accounts[0].total_amount, Money::ZERO);
    }

    #[test]
    fn test_recalc_refuses_totals_below_paid() {
        let db = test_db();
        let view = create_checkout(&db, None, None).unwrap();
        let id = view.checkout.id.as_str();
        let a = create_account(&db, id, "Petra", &[]).unwrap();
        add_item(
            &db,
            id,
            &NewLineItem::new(ItemKind::Court, "Court 1", 1, Money::from_minor(75000))
                .assigned_to(a.id.clone()),
        )
        .unwrap();
        seed_confirmed_payment(&db, &a.id, 75000);

        // A discount cannot drag the account total under the money taken
        let err = add_item(
            &db,
            id,
            &NewLineItem::discount_line("Goodwill", Money::from_minor(5000)).assigned_to(a.id.clone()),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[test]
    fn test_negative_account_total_rejected() {
        let db = test_db();
        let view = create_checkout(&db, None, None).unwrap();
        let id = view.checkout.id.as_str();
        let a = create_account(&db, id, "Petra", &[]).unwrap();

        let err = add_item(
            &db,
            id,
            &NewLineItem::discount_line("Too generous", Money::from_minor(5000))
                .assigned_to(a.id.clone()),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_status_derivation_through_payments() {
        let db = test_db();
        let view = create_checkout(&db, None, None).unwrap();
        let id = view.checkout.id.as_str();
        let a = create_account(&db, id, "Petra", &[]).unwrap();
        let b = create_account(&db, id, "Jan", &[]).unwrap();
        add_item(
            &db,
            id,
            &NewLineItem::new(ItemKind::Court, "Court 1", 1, Money::from_minor(40000))
                .assigned_to(a.id.clone()),
        )
        .unwrap();
        add_item(
            &db,
            id,
            &NewLineItem::new(ItemKind::Court, "Court 1", 1, Money::from_minor(35000))
                .assigned_to(b.id.clone()),
        )
        .unwrap();

        seed_confirmed_payment(&db, &a.id, 40000);
        let view = get_checkout(&db, id).unwrap();
        assert_eq!(view.accounts[0].status, AccountStatus::Paid);
        assert_eq!(view.accounts[1].status, AccountStatus::Unpaid);
        assert_eq!(view.checkout.status, CheckoutStatus::Partial);

        seed_confirmed_payment(&db, &b.id, 35000);
        let view = get_checkout(&db, id).unwrap();
        assert_eq!(view.checkout.status, CheckoutStatus::Completed);
    }

    #[test]
    fn test_recalculate_is_idempotent() {
        let db = test_db();
        let view = create_checkout(&db, None, Some(&snapshot())).unwrap();
        let id = view.checkout.id.as_str();

        let first = recalculate(&db, id).unwrap();
        let second = recalculate(&db, id).unwrap();
        assert_eq!(first.total_amount, second.total_amount);
        assert_eq!(first.status, second.status);
    }

    #[test]
    fn test_cancel_checkout_rules() {
        let db = test_db();

        // Plain cancel
        let view = create_checkout(&db, None, None).unwrap();
        let cancelled = cancel_checkout(&db, &view.checkout.id).unwrap();
        assert_eq!(cancelled.status, CheckoutStatus::Cancelled);

        // Cancel twice conflicts
        assert!(matches!(
            cancel_checkout(&db, &view.checkout.id).unwrap_err(),
            EngineError::Conflict(_)
        ));

        // Mutations on a cancelled checkout conflict
        assert!(matches!(
            add_item(
                &db,
                &view.checkout.id,
                &NewLineItem::new(ItemKind::Merchandise, "Towel", 1, Money::from_minor(100)),
            )
            .unwrap_err(),
            EngineError::Conflict(_)
        ));
        assert!(matches!(
            create_account(&db, &view.checkout.id, "Petra", &[]).unwrap_err(),
            EngineError::Conflict(_)
        ));

        // Recalculate never resurrects a cancelled checkout
        let after = recalculate(&db, &view.checkout.id).unwrap();
        assert_eq!(after.status, CheckoutStatus::Cancelled);
    }

    #[test]
    fn test_cancel_with_paid_money_conflicts() {
        let db = test_db();
        let view = create_checkout(&db, None, None).unwrap();
        let id = view.checkout.id.as_str();
        let a = create_account(&db, id, "Petra", &[]).unwrap();
        add_item(
            &db,
            id,
            &NewLineItem::new(ItemKind::Court, "Court 1", 1, Money::from_minor(75000))
                .assigned_to(a.id.clone()),
        )
        .unwrap();
        seed_confirmed_payment(&db, &a.id, 50000);

        let err = cancel_checkout(&db, id).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }
}
