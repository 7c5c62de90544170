//! Split-billing calculator.
//!
//! Pure functions turning a checkout's items plus each payer account's
//! split rule into per-account totals. Directly-assigned items always bill
//! to their own account; the remaining unassigned items form a pool that is
//! distributed across the pool-sharing accounts. Every path preserves
//! `sum(shares) == pool` exactly in minor units.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::money::Money;

/// How a payer account participates in the split. Stored as tagged JSON in
/// `payer_accounts.split_rule` and validated at every boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SplitRule {
    /// Only directly-assigned items bill to this account.
    ByItem,
    /// Even share of the unassigned pool.
    Equal,
    /// Percentage share of the unassigned pool.
    Percentage { percent: f64 },
    /// Fixed share of the unassigned pool.
    FixedAmount { amount: Money },
}

impl SplitRule {
    /// Boundary validation for operator-supplied rules.
    pub fn validate(&self) -> EngineResult<()> {
        match self {
            SplitRule::ByItem | SplitRule::Equal => Ok(()),
            SplitRule::Percentage { percent } => {
                if !percent.is_finite() || *percent <= 0.0 || *percent > 100.0 {
                    return Err(EngineError::validation(format!(
                        "percentage must be between 0 and 100, got {percent}"
                    )));
                }
                Ok(())
            }
            SplitRule::FixedAmount { amount } => {
                if !amount.is_positive() {
                    return Err(EngineError::validation(
                        "fixed split amount must be positive",
                    ));
                }
                Ok(())
            }
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            SplitRule::ByItem => "by_item",
            SplitRule::Equal => "equal",
            SplitRule::Percentage { .. } => "percentage",
            SplitRule::FixedAmount { .. } => "fixed_amount",
        }
    }

    fn shares_pool(&self) -> bool {
        !matches!(self, SplitRule::ByItem)
    }
}

/// Account input to the calculator: identity, creation order, rule.
#[derive(Debug, Clone)]
pub struct AccountShare {
    pub id: String,
    pub position: i64,
    pub rule: SplitRule,
}

/// Item input to the calculator: its (possibly negative) line total and the
/// account it is pinned to, if any.
#[derive(Debug, Clone)]
pub struct ItemCharge {
    pub account_id: Option<String>,
    pub total: Money,
}

/// Percentage tolerance: rules may drift from 100% by one basis point
/// (0.01 percentage points) before being rejected.
const PERCENT_SUM_TOLERANCE_BPS: i64 = 1;

/// Compute every account's total from the items and split rules.
///
/// Returns `(account_id, total)` pairs in account creation order. Fails
/// with `ValidationError` when the pool-sharing accounts mix rule kinds,
/// percentages do not sum to 100, or fixed amounts do not sum to the pool.
/// Those checks bind only while unassigned money exists, so rules can be
/// reconfigured account by account on a checkout whose items are all
/// assigned.
pub fn compute_account_totals(
    accounts: &[AccountShare],
    items: &[ItemCharge],
) -> EngineResult<Vec<(String, Money)>> {
    let mut ordered: Vec<&AccountShare> = accounts.iter().collect();
    ordered.sort_by_key(|a| a.position);

    // Directly-assigned totals always bill to their account.
    let mut totals: Vec<Money> = ordered
        .iter()
        .map(|a| {
            items
                .iter()
                .filter(|i| i.account_id.as_deref() == Some(a.id.as_str()))
                .map(|i| i.total)
                .sum()
        })
        .collect();

    let pool: Money = items
        .iter()
        .filter(|i| i.account_id.is_none())
        .map(|i| i.total)
        .sum();

    let sharer_idx: Vec<usize> = ordered
        .iter()
        .enumerate()
        .filter(|(_, a)| a.rule.shares_pool())
        .map(|(i, _)| i)
        .collect();

    // With no pool-sharing accounts the unassigned pool stays unbilled
    // until its items are assigned. An empty pool needs no distribution
    // and leaves dormant rule configurations unjudged.
    if !sharer_idx.is_empty() && pool != Money::ZERO {
        let first_kind = ordered[sharer_idx[0]].rule.kind_name();
        if sharer_idx
            .iter()
            .any(|&i| ordered[i].rule.kind_name() != first_kind)
        {
            return Err(EngineError::validation(format!(
                "accounts mix pool split kinds ({} vs others); one checkout supports one pool rule",
                first_kind
            )));
        }

        let shares = match &ordered[sharer_idx[0]].rule {
            SplitRule::Equal => pool.split_even(sharer_idx.len()),
            SplitRule::Percentage { .. } => {
                let bps: Vec<i64> = sharer_idx
                    .iter()
                    .map(|&i| match &ordered[i].rule {
                        SplitRule::Percentage { percent } => (percent * 100.0).round() as i64,
                        _ => unreachable!("sharer kinds verified above"),
                    })
                    .collect();
                percentage_shares(pool, &bps)?
            }
            SplitRule::FixedAmount { .. } => {
                let amounts: Vec<Money> = sharer_idx
                    .iter()
                    .map(|&i| match &ordered[i].rule {
                        SplitRule::FixedAmount { amount } => *amount,
                        _ => unreachable!("sharer kinds verified above"),
                    })
                    .collect();
                let sum: Money = amounts.iter().sum();
                if sum != pool {
                    return Err(EngineError::validation(format!(
                        "fixed split amounts sum to {}, the unassigned pool totals {}",
                        sum.format_major(),
                        pool.format_major()
                    )));
                }
                amounts
            }
            SplitRule::ByItem => unreachable!("by_item does not share the pool"),
        };

        for (slot, share) in sharer_idx.iter().zip(shares) {
            totals[*slot] += share;
        }
    }

    Ok(ordered
        .iter()
        .zip(totals)
        .map(|(a, t)| (a.id.clone(), t))
        .collect())
}

/// Percentage shares in basis points with half-up rounding, then the
/// rounding residue settled one minor unit at a time in account order so
/// the shares sum to `pool` exactly.
fn percentage_shares(pool: Money, bps: &[i64]) -> EngineResult<Vec<Money>> {
    let sum_bps: i64 = bps.iter().sum();
    if (sum_bps - 10_000).abs() > PERCENT_SUM_TOLERANCE_BPS {
        return Err(EngineError::validation(format!(
            "split percentages sum to {:.2}%, expected 100%",
            sum_bps as f64 / 100.0
        )));
    }

    let mut shares: Vec<Money> = bps.iter().map(|&b| pool.percent_bps(b)).collect();
    let mut residue = pool - shares.iter().sum::<Money>();
    let step = Money::from_minor(if residue.is_negative() { -1 } else { 1 });
    let mut idx = 0usize;
    let n = shares.len();
    while residue != Money::ZERO {
        shares[idx % n] += step;
        residue -= step;
        idx += 1;
    }
    Ok(shares)
}
