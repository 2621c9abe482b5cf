use std::io::Write;

use super::types::{SimulationResult, TableRow};
use crate::error::Result;

const CSV_HEADERS: [&str; 8] = [
    "age",
    "rate_percent",
    "fixed_amount_balance",
    "fixed_amount_withdrawal",
    "fixed_amount_depleted",
    "fixed_percent_balance",
    "fixed_percent_withdrawal",
    "fixed_percent_depleted",
];

/// Zips both trajectories into one row per period.
pub fn assemble_table(result: &SimulationResult) -> Vec<TableRow> {
    result
        .fixed_amount
        .records
        .iter()
        .zip(&result.fixed_percent.records)
        .map(|(fixed, percent)| TableRow {
            age: fixed.age,
            rate_percent: rate_as_percent(fixed.rate),
            fixed_amount_balance: fixed.closing_balance,
            fixed_amount_withdrawal: fixed.withdrawal,
            fixed_amount_depleted: fixed.is_depleted(),
            fixed_percent_balance: percent.closing_balance,
            fixed_percent_withdrawal: percent.withdrawal,
            fixed_percent_depleted: percent.is_depleted(),
        })
        .collect()
}

fn rate_as_percent(rate: f64) -> f64 {
    (rate * 1_000.0).round() / 10.0
}

pub fn write_table_csv<W: Write>(rows: &[TableRow], writer: W) -> Result<()> {
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(CSV_HEADERS)?;
    for row in rows {
        out.write_record([
            row.age.to_string(),
            format!("{:.1}", row.rate_percent),
            row.fixed_amount_balance.to_string(),
            row.fixed_amount_withdrawal.to_string(),
            row.fixed_amount_depleted.to_string(),
            row.fixed_percent_balance.to_string(),
            row.fixed_percent_withdrawal.to_string(),
            row.fixed_percent_depleted.to_string(),
        ])?;
    }
    out.flush()?;
    Ok(())
}
