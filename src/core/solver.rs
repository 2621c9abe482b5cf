use serde::Serialize;
use tracing::debug;

use super::cycler::RateCycler;
use super::engine::simulate_policy;
use super::types::{
    EngineConfig, MAX_PERCENT_WITHDRAWAL, RateSeries, SimulationParameters, WithdrawalPolicy,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct SustainableSolveConfig {
    pub policy: WithdrawalPolicy,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
}

impl SustainableSolveConfig {
    /// Search bounds covering every value the policy accepts for `params`.
    ///
    /// A fixed amount above the first year's opening balance plus its
    /// (rounded) interest depletes the pool immediately, so that is the
    /// upper bound.
    pub fn for_policy(
        policy: WithdrawalPolicy,
        params: &SimulationParameters,
        series: &RateSeries,
    ) -> Self {
        match policy {
            WithdrawalPolicy::FixedAmount => Self {
                policy,
                search_min: 0.0,
                search_max: first_year_ceiling(params, series),
                tolerance: 0.5,
                max_iterations: 64,
            },
            WithdrawalPolicy::FixedPercent => Self {
                policy,
                search_min: 0.0,
                search_max: MAX_PERCENT_WITHDRAWAL,
                tolerance: 1e-5,
                max_iterations: 64,
            },
        }
    }
}

fn first_year_ceiling(params: &SimulationParameters, series: &RateSeries) -> f64 {
    let first_rate = series.as_slice().first().copied().unwrap_or(0.0);
    params.initial_assets * (1.0 + first_rate.max(0.0)) + 1.0
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate_value: f64,
    pub survives: bool,
    pub depletion_age: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SustainableSolveResult {
    pub policy: WithdrawalPolicy,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
    pub solved_value: Option<f64>,
    pub final_balance: Option<f64>,
    pub iterations: Vec<SolveIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

/// Finds the largest withdrawal setting that keeps the pool from depleting
/// over the whole horizon, by bisection on the policy's withdrawal input.
pub fn solve_sustainable_withdrawal(
    series: &RateSeries,
    params: &SimulationParameters,
    engine: EngineConfig,
    config: SustainableSolveConfig,
) -> Result<SustainableSolveResult> {
    params.validate()?;
    validate_config(config)?;
    let cycler = RateCycler::new(series.as_slice(), params.horizon_years as usize)?;

    let mut iterations = Vec::with_capacity(config.max_iterations as usize);
    let low_eval = evaluate_candidate(params, engine, &cycler, config.policy, config.search_min);
    let high_eval = evaluate_candidate(params, engine, &cycler, config.policy, config.search_max);

    let mut solved_value = None;
    let mut converged = false;
    let feasible;
    let message;

    if !low_eval.survives {
        feasible = false;
        message = "Pool depletes even at the lower search bound.".to_string();
    } else if high_eval.survives {
        solved_value = Some(config.search_max);
        converged = true;
        feasible = true;
        message = "Withdrawal at the upper search bound is sustainable.".to_string();
    } else {
        let mut lo = config.search_min;
        let mut hi = config.search_max;
        let mut it = 0;
        while it < config.max_iterations {
            it += 1;
            let mid = (lo + hi) * 0.5;
            let eval = evaluate_candidate(params, engine, &cycler, config.policy, mid);
            iterations.push(SolveIteration {
                iteration: it,
                lower_bound: lo,
                upper_bound: hi,
                candidate_value: mid,
                survives: eval.survives,
                depletion_age: eval.depletion_age,
            });

            if eval.survives {
                lo = mid;
            } else {
                hi = mid;
            }

            if (hi - lo).abs() <= config.tolerance {
                converged = true;
                break;
            }
        }
        solved_value = Some(lo);
        feasible = true;
        message = if converged {
            "Solved maximum sustainable withdrawal.".to_string()
        } else {
            "Reached max iterations before tolerance was met; returning best estimate.".to_string()
        };
    }

    let final_balance = solved_value.map(|value| {
        evaluate_candidate(params, engine, &cycler, config.policy, value).final_balance
    });
    debug!(
        policy = ?config.policy,
        ?solved_value,
        iterations = iterations.len(),
        converged,
        "sustainable withdrawal search finished"
    );

    Ok(SustainableSolveResult {
        policy: config.policy,
        search_min: config.search_min,
        search_max: config.search_max,
        tolerance: config.tolerance,
        max_iterations: config.max_iterations,
        solved_value,
        final_balance,
        iterations,
        converged,
        feasible,
        message,
    })
}

#[derive(Debug, Clone, Copy)]
struct CandidateEval {
    survives: bool,
    depletion_age: Option<u32>,
    final_balance: f64,
}

fn evaluate_candidate(
    base_params: &SimulationParameters,
    engine: EngineConfig,
    cycler: &RateCycler<'_>,
    policy: WithdrawalPolicy,
    candidate_value: f64,
) -> CandidateEval {
    let mut params = *base_params;
    match policy {
        WithdrawalPolicy::FixedAmount => params.fixed_withdrawal = candidate_value.max(0.0),
        WithdrawalPolicy::FixedPercent => {
            params.percent_withdrawal = candidate_value.clamp(0.0, MAX_PERCENT_WITHDRAWAL)
        }
    }

    let trajectory = simulate_policy(policy, &params, engine, cycler);
    let depletion_age = trajectory.depletion_age();
    CandidateEval {
        survives: depletion_age.is_none(),
        depletion_age,
        final_balance: trajectory.final_balance(),
    }
}

fn validate_config(config: SustainableSolveConfig) -> Result<()> {
    if !config.search_min.is_finite() || !config.search_max.is_finite() {
        return Err(Error::invalid("search_bounds", "must be finite"));
    }
    if config.search_min < 0.0 {
        return Err(Error::invalid("search_min", "must be >= 0"));
    }
    if config.search_max <= config.search_min {
        return Err(Error::invalid(
            "search_max",
            "must be greater than search_min",
        ));
    }
    if config.policy == WithdrawalPolicy::FixedPercent && config.search_max > MAX_PERCENT_WITHDRAWAL
    {
        return Err(Error::invalid(
            "search_max",
            format!("must be <= {MAX_PERCENT_WITHDRAWAL} for a percentage withdrawal"),
        ));
    }
    if !config.tolerance.is_finite() || config.tolerance <= 0.0 {
        return Err(Error::invalid("tolerance", "must be > 0"));
    }
    if config.max_iterations == 0 {
        return Err(Error::invalid("max_iterations", "must be > 0"));
    }
    Ok(())
}
