//! Per-payer spending limits.
//!
//! Two limits apply to every payment: a ceiling on a single amount and a
//! daily budget. The day is the UTC calendar day; spend recorded on an
//! earlier day reads as zero and is replaced on the next record.

use dashmap::DashMap;
use r402::UnixTimestamp;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Default decimals assumed for an asset that does not advertise its own.
pub const DEFAULT_ASSET_DECIMALS: u32 = 6;

/// Budget limits, in whole-token units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Maximum cumulative spend per payer per UTC day.
    pub daily_budget: Decimal,
    /// Maximum amount of a single payment.
    pub max_payment_amount: Decimal,
    /// Decimals used to convert atomic amounts when the requirements carry
    /// no `extra.decimals`.
    pub asset_decimals: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_budget: Decimal::from(100),
            max_payment_amount: Decimal::from(10),
            asset_decimals: DEFAULT_ASSET_DECIMALS,
        }
    }
}

/// Machine-readable budget rejection code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BudgetViolation {
    /// The single payment is above `max_payment_amount`.
    AmountExceedsMax,
    /// The payment would push today's spend above `daily_budget`.
    DailyBudgetExceeded,
}

impl BudgetViolation {
    /// Wire code, e.g. `AMOUNT_EXCEEDS_MAX`.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::AmountExceedsMax => "AMOUNT_EXCEEDS_MAX",
            Self::DailyBudgetExceeded => "DAILY_BUDGET_EXCEEDED",
        }
    }
}

/// Outcome of [`BudgetGuard::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetCheck {
    /// Whether the payment fits.
    pub valid: bool,
    /// Human-readable reason when rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Rejection code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<BudgetViolation>,
}

impl BudgetCheck {
    /// A passing check.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
            code: None,
        }
    }

    /// A failing check.
    #[must_use]
    pub const fn rejected(code: BudgetViolation, reason: String) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            code: Some(code),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DailySpend {
    day: u64,
    spent: Decimal,
}

/// Tracks per-payer spend against [`BudgetConfig`].
///
/// Validation is advisory: two concurrent flows for one payer can both pass
/// `validate` before either records. `record_spend` itself is atomic per
/// payer.
#[derive(Debug, Default)]
pub struct BudgetGuard {
    config: BudgetConfig,
    ledger: DashMap<String, DailySpend>,
}

impl BudgetGuard {
    /// Creates a guard with an empty ledger.
    #[must_use]
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            ledger: DashMap::new(),
        }
    }

    /// Returns the configured limits.
    #[must_use]
    pub const fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Checks `amount` against both limits without recording anything.
    #[must_use]
    pub fn validate(&self, payer: &str, amount: Decimal) -> BudgetCheck {
        self.validate_on(payer, amount, UnixTimestamp::now().utc_day())
    }

    fn validate_on(&self, payer: &str, amount: Decimal, day: u64) -> BudgetCheck {
        if amount > self.config.max_payment_amount {
            debug!(payer, %amount, max = %self.config.max_payment_amount, "Payment above ceiling");
            return BudgetCheck::rejected(
                BudgetViolation::AmountExceedsMax,
                format!(
                    "Payment amount {amount} exceeds maximum {}",
                    self.config.max_payment_amount
                ),
            );
        }
        let spent = self.spent_on(payer, day);
        if spent + amount > self.config.daily_budget {
            debug!(
                payer,
                %amount,
                %spent,
                budget = %self.config.daily_budget,
                "Daily budget exhausted"
            );
            return BudgetCheck::rejected(
                BudgetViolation::DailyBudgetExceeded,
                format!(
                    "Daily budget {} exceeded: spent {spent}, requested {amount}",
                    self.config.daily_budget
                ),
            );
        }
        BudgetCheck::ok()
    }

    /// Adds `amount` to the payer's spend for today.
    pub fn record_spend(&self, payer: &str, amount: Decimal) {
        self.record_spend_on(payer, amount, UnixTimestamp::now().utc_day());
    }

    fn record_spend_on(&self, payer: &str, amount: Decimal, day: u64) {
        let mut entry = self
            .ledger
            .entry(payer.to_owned())
            .or_insert(DailySpend {
                day,
                spent: Decimal::ZERO,
            });
        if entry.day != day {
            entry.day = day;
            entry.spent = Decimal::ZERO;
        }
        entry.spent += amount;
        info!(payer, %amount, spent_today = %entry.spent, "Spend recorded");
    }

    /// Today's spend for `payer`; zero for unseen payers.
    #[must_use]
    pub fn daily_spend(&self, payer: &str) -> Decimal {
        self.spent_on(payer, UnixTimestamp::now().utc_day())
    }

    fn spent_on(&self, payer: &str, day: u64) -> Decimal {
        self.ledger
            .get(payer)
            .filter(|entry| entry.day == day)
            .map_or(Decimal::ZERO, |entry| entry.spent)
    }

    /// Decimals to use for `requirements`: `extra.decimals` when present,
    /// otherwise the configured default.
    #[must_use]
    pub fn decimals_for(&self, requirements: &r402::PaymentRequirements) -> u32 {
        requirements
            .decimals()
            .unwrap_or(self.config.asset_decimals)
    }
}

/// Converts an atomic amount to whole-token units.
///
/// Returns `None` if the amount or scale is out of `Decimal` range.
#[must_use]
pub fn atomic_to_decimal(amount: u128, decimals: u32) -> Option<Decimal> {
    let mantissa = i128::try_from(amount).ok()?;
    Decimal::try_from_i128_with_scale(mantissa, decimals)
        .ok()
        .map(|d| d.normalize())
}
