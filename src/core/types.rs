use std::sync::Arc;

use serde::Serialize;

use crate::error::{Error, Result};

pub const MIN_START_AGE: u32 = 40;
pub const MAX_START_AGE: u32 = 100;
pub const MAX_HORIZON_YEARS: u32 = 100;
/// Upper bound for money inputs; with `MAX_ABS_RATE` it keeps balances finite.
pub const MAX_AMOUNT: f64 = 1e15;
/// Largest accepted annual return magnitude as a fraction (1000%).
pub const MAX_ABS_RATE: f64 = 10.0;
pub const MAX_PERCENT_WITHDRAWAL: f64 = 0.20;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccrualOrder {
    /// Interest accrues on the opening balance, before the withdrawal is taken.
    #[default]
    InterestOnOpening,
    /// The withdrawal is taken first and interest accrues on what remains.
    InterestAfterWithdrawal,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoundingMode {
    /// Round every monetary quantity to a whole unit as soon as it is computed.
    #[default]
    EachStep,
    /// Keep full precision internally and round recorded values to cents.
    AtOutput,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub accrual_order: AccrualOrder,
    pub rounding_mode: RoundingMode,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WithdrawalPolicy {
    FixedAmount,
    FixedPercent,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    Active,
    Depleted,
}

/// Annual fractional return rates in chronological order. Never empty.
#[derive(Clone, Debug, PartialEq)]
pub struct RateSeries {
    rates: Arc<[f64]>,
}

impl RateSeries {
    pub fn new(rates: Vec<f64>) -> Result<Self> {
        if rates.is_empty() {
            return Err(Error::invalid("rates", "rate series must not be empty"));
        }
        if let Some(idx) = rates.iter().position(|r| !r.is_finite()) {
            return Err(Error::invalid(
                "rates",
                format!("rate at position {idx} is not finite"),
            ));
        }
        if let Some(idx) = rates.iter().position(|r| r.abs() > MAX_ABS_RATE) {
            return Err(Error::invalid(
                "rates",
                format!("rate at position {idx} is outside -{MAX_ABS_RATE}..={MAX_ABS_RATE}"),
            ));
        }
        Ok(Self {
            rates: rates.into(),
        })
    }

    /// Builds a series from percentages (3.2 for 3.2%). Missing values count as 0.
    pub fn from_percentages<I>(percentages: I) -> Result<Self>
    where
        I: IntoIterator<Item = Option<f64>>,
    {
        let rates = percentages
            .into_iter()
            .map(|p| p.unwrap_or(0.0) / 100.0)
            .collect();
        Self::new(rates)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.rates
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationParameters {
    pub start_age: u32,
    pub initial_assets: f64,
    pub horizon_years: u32,
    pub fixed_withdrawal: f64,
    /// Fraction of the opening balance withdrawn each year (0.04 for 4%).
    pub percent_withdrawal: f64,
}

impl SimulationParameters {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_START_AGE..=MAX_START_AGE).contains(&self.start_age) {
            return Err(Error::invalid(
                "start_age",
                format!("must be between {MIN_START_AGE} and {MAX_START_AGE}"),
            ));
        }
        if !(0.0..=MAX_AMOUNT).contains(&self.initial_assets) {
            return Err(Error::invalid(
                "initial_assets",
                format!("must be between 0 and {MAX_AMOUNT}"),
            ));
        }
        if !(1..=MAX_HORIZON_YEARS).contains(&self.horizon_years) {
            return Err(Error::invalid(
                "horizon_years",
                format!("must be between 1 and {MAX_HORIZON_YEARS}"),
            ));
        }
        if !(0.0..=MAX_AMOUNT).contains(&self.fixed_withdrawal) {
            return Err(Error::invalid(
                "fixed_withdrawal",
                format!("must be between 0 and {MAX_AMOUNT}"),
            ));
        }
        if !(0.0..=MAX_PERCENT_WITHDRAWAL).contains(&self.percent_withdrawal) {
            return Err(Error::invalid(
                "percent_withdrawal",
                format!("must be between 0 and {MAX_PERCENT_WITHDRAWAL}"),
            ));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearRecord {
    pub period: u32,
    pub age: u32,
    pub rate: f64,
    pub opening_balance: f64,
    pub interest: f64,
    pub withdrawal: f64,
    pub closing_balance: f64,
    pub state: PoolState,
}

impl YearRecord {
    /// True when the period closed with nothing left in the pool.
    pub fn is_depleted(&self) -> bool {
        self.closing_balance <= 0.0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trajectory {
    pub policy: WithdrawalPolicy,
    pub records: Vec<YearRecord>,
}

impl Trajectory {
    /// Age of the period in which the pool entered the depleted state.
    pub fn depletion_age(&self) -> Option<u32> {
        self.records
            .iter()
            .find(|r| r.state == PoolState::Depleted)
            .map(|r| r.age)
    }

    pub fn total_withdrawn(&self) -> f64 {
        self.records.iter().map(|r| r.withdrawal).sum()
    }

    pub fn final_balance(&self) -> f64 {
        self.records.last().map_or(0.0, |r| r.closing_balance)
    }

    pub fn summary(&self) -> TrajectorySummary {
        TrajectorySummary {
            policy: self.policy,
            depletion_age: self.depletion_age(),
            total_withdrawn: self.total_withdrawn(),
            final_balance: self.final_balance(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrajectorySummary {
    pub policy: WithdrawalPolicy,
    pub depletion_age: Option<u32>,
    pub total_withdrawn: f64,
    pub final_balance: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub fixed_amount: Trajectory,
    pub fixed_percent: Trajectory,
}

/// One presentation row: both policies side by side for a single period.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRow {
    pub age: u32,
    pub rate_percent: f64,
    pub fixed_amount_balance: f64,
    pub fixed_amount_withdrawal: f64,
    pub fixed_amount_depleted: bool,
    pub fixed_percent_balance: f64,
    pub fixed_percent_withdrawal: f64,
    pub fixed_percent_depleted: bool,
}
