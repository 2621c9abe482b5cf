mod cycler;
mod engine;
mod solver;
mod table;
mod types;

pub use cycler::{RateCycler, cycle_rates};
pub use engine::{run_simulation, simulate_policy};
pub use solver::{
    SolveIteration, SustainableSolveConfig, SustainableSolveResult, solve_sustainable_withdrawal,
};
pub use table::{assemble_table, write_table_csv};
pub use types::{
    AccrualOrder, EngineConfig, MAX_ABS_RATE, MAX_AMOUNT, MAX_HORIZON_YEARS,
    MAX_PERCENT_WITHDRAWAL, MAX_START_AGE, MIN_START_AGE, PoolState, RateSeries, RoundingMode,
    SimulationParameters, SimulationResult, TableRow, Trajectory, TrajectorySummary,
    WithdrawalPolicy, YearRecord,
};
