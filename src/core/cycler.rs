use crate::error::{Error, Result};

/// Replays a finite rate history circularly over an arbitrary horizon.
///
/// Lookups are modulo-indexed, so nothing proportional to the horizon is
/// allocated unless [`RateCycler::to_vec`] is called.
#[derive(Copy, Clone, Debug)]
pub struct RateCycler<'a> {
    rates: &'a [f64],
    horizon: usize,
}

impl<'a> RateCycler<'a> {
    pub fn new(rates: &'a [f64], horizon: usize) -> Result<Self> {
        if rates.is_empty() {
            return Err(Error::invalid("rates", "cannot cycle an empty rate series"));
        }
        Ok(Self { rates, horizon })
    }

    /// Rate for a zero-based period index. Indexes past the horizon keep cycling.
    pub fn rate_for(&self, period_index: usize) -> f64 {
        self.rates[period_index % self.rates.len()]
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.horizon).map(|idx| self.rate_for(idx))
    }

    pub fn len(&self) -> usize {
        self.horizon
    }

    pub fn is_empty(&self) -> bool {
        self.horizon == 0
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.iter().collect()
    }
}

pub fn cycle_rates(rates: &[f64], horizon: usize) -> Result<Vec<f64>> {
    Ok(RateCycler::new(rates, horizon)?.to_vec())
}
