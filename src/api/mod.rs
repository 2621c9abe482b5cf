use axum::{
    Router,
    extract::{Json, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::core::{
    AccrualOrder, EngineConfig, RateSeries, RoundingMode, SimulationParameters, SimulationResult,
    SustainableSolveConfig, SustainableSolveResult, TableRow, TrajectorySummary,
    WithdrawalPolicy, assemble_table, run_simulation, solve_sustainable_withdrawal,
    write_table_csv,
};
use crate::error::{Error, Result};
use crate::rates::{CachedRateSource, CsvRateSource, DEFAULT_RATE_COLUMN, RateSeriesProvider};

pub type SharedRateSource = Arc<dyn RateSeriesProvider + Send + Sync>;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliAccrualOrder {
    InterestOnOpening,
    InterestAfterWithdrawal,
}

impl From<CliAccrualOrder> for AccrualOrder {
    fn from(value: CliAccrualOrder) -> Self {
        match value {
            CliAccrualOrder::InterestOnOpening => AccrualOrder::InterestOnOpening,
            CliAccrualOrder::InterestAfterWithdrawal => AccrualOrder::InterestAfterWithdrawal,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliRoundingMode {
    EachStep,
    AtOutput,
}

impl From<CliRoundingMode> for RoundingMode {
    fn from(value: CliRoundingMode) -> Self {
        match value {
            CliRoundingMode::EachStep => RoundingMode::EachStep,
            CliRoundingMode::AtOutput => RoundingMode::AtOutput,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliPolicy {
    FixedAmount,
    FixedPercent,
}

impl From<CliPolicy> for WithdrawalPolicy {
    fn from(value: CliPolicy) -> Self {
        match value {
            CliPolicy::FixedAmount => WithdrawalPolicy::FixedAmount,
            CliPolicy::FixedPercent => WithdrawalPolicy::FixedPercent,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Csv,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiAccrualOrder {
    #[serde(alias = "interestOnOpening", alias = "interest_on_opening", alias = "before")]
    InterestOnOpening,
    #[serde(
        alias = "interestAfterWithdrawal",
        alias = "interest_after_withdrawal",
        alias = "after"
    )]
    InterestAfterWithdrawal,
}

impl From<ApiAccrualOrder> for CliAccrualOrder {
    fn from(value: ApiAccrualOrder) -> Self {
        match value {
            ApiAccrualOrder::InterestOnOpening => CliAccrualOrder::InterestOnOpening,
            ApiAccrualOrder::InterestAfterWithdrawal => CliAccrualOrder::InterestAfterWithdrawal,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiRoundingMode {
    #[serde(alias = "eachStep", alias = "each_step")]
    EachStep,
    #[serde(alias = "atOutput", alias = "at_output")]
    AtOutput,
}

impl From<ApiRoundingMode> for CliRoundingMode {
    fn from(value: ApiRoundingMode) -> Self {
        match value {
            ApiRoundingMode::EachStep => CliRoundingMode::EachStep,
            ApiRoundingMode::AtOutput => CliRoundingMode::AtOutput,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiPolicy {
    #[serde(alias = "fixedAmount", alias = "fixed_amount", alias = "amount")]
    FixedAmount,
    #[serde(alias = "fixedPercent", alias = "fixed_percent", alias = "percent")]
    FixedPercent,
}

impl From<ApiPolicy> for CliPolicy {
    fn from(value: ApiPolicy) -> Self {
        match value {
            ApiPolicy::FixedAmount => CliPolicy::FixedAmount,
            ApiPolicy::FixedPercent => CliPolicy::FixedPercent,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    start_age: Option<u32>,
    initial_assets: Option<f64>,
    fixed_withdrawal: Option<f64>,
    percent_withdrawal: Option<f64>,
    horizon_years: Option<u32>,
    accrual_order: Option<ApiAccrualOrder>,
    rounding_mode: Option<ApiRoundingMode>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SolvePayload {
    #[serde(flatten)]
    simulate: SimulatePayload,
    policy: Option<ApiPolicy>,
}

#[derive(Parser, Debug)]
#[command(
    name = "drawdown",
    about = "Retirement draw-down simulator replaying historical returns (fixed amount vs fixed percentage)"
)]
pub struct Cli {
    #[arg(long, global = true, default_value = "info", help = "Log level for drawdown targets")]
    pub log_level: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the JSON API
    Serve(ServeArgs),
    /// Run one simulation and print the result
    Simulate(SimulateCommand),
    /// Search for the largest withdrawal that survives the horizon
    Solve(SolveCommand),
}

#[derive(Args, Debug, Clone)]
pub struct RateArgs {
    #[arg(long, help = "CSV rate table, one row per historical year")]
    pub rates: PathBuf,
    #[arg(
        long,
        default_value = DEFAULT_RATE_COLUMN,
        help = "Column holding annual returns in percent"
    )]
    pub rate_column: String,
}

impl RateArgs {
    pub fn source(&self) -> CachedRateSource<CsvRateSource> {
        CachedRateSource::new(CsvRateSource::new(&self.rates, &self.rate_column))
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub rates: RateArgs,
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
}

#[derive(Args, Debug, Clone)]
pub struct SimulateCommand {
    #[command(flatten)]
    pub rates: RateArgs,
    #[command(flatten)]
    pub params: SimulateArgs,
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,
}

#[derive(Args, Debug, Clone)]
pub struct SolveCommand {
    #[command(flatten)]
    pub rates: RateArgs,
    #[command(flatten)]
    pub params: SimulateArgs,
    #[arg(long, value_enum, default_value_t = CliPolicy::FixedAmount)]
    pub policy: CliPolicy,
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    #[arg(long, default_value_t = 65, help = "Age when draw-down starts (40-100)")]
    pub start_age: u32,
    #[arg(long, default_value_t = 2000.0, help = "Assets at the start of draw-down")]
    pub initial_assets: f64,
    #[arg(
        long,
        default_value_t = 120.0,
        help = "Annual amount withdrawn under the fixed-amount policy"
    )]
    pub fixed_withdrawal: f64,
    #[arg(
        long,
        default_value_t = 4.0,
        help = "Annual withdrawal rate under the fixed-percentage policy, in percent (0-20)"
    )]
    pub percent_withdrawal: f64,
    #[arg(long, default_value_t = 35, help = "Number of simulated years (1-100)")]
    pub horizon_years: u32,
    #[arg(long, value_enum, default_value_t = CliAccrualOrder::InterestOnOpening)]
    pub accrual_order: CliAccrualOrder,
    #[arg(long, value_enum, default_value_t = CliRoundingMode::EachStep)]
    pub rounding_mode: CliRoundingMode,
}

#[derive(Debug)]
struct ApiRequest {
    params: SimulationParameters,
    engine: EngineConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateResponse {
    parameters: SimulationParameters,
    engine: EngineConfig,
    fixed_amount_summary: TrajectorySummary,
    fixed_percent_summary: TrajectorySummary,
    rows: Vec<TableRow>,
    trajectories: SimulationResult,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RatesResponse {
    years: usize,
    rates: Vec<f64>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn build_parameters(args: &SimulateArgs) -> Result<(SimulationParameters, EngineConfig)> {
    if !args.percent_withdrawal.is_finite() || !(0.0..=20.0).contains(&args.percent_withdrawal) {
        return Err(Error::invalid(
            "percent_withdrawal",
            "--percent-withdrawal must be between 0 and 20 (percent)",
        ));
    }

    let params = SimulationParameters {
        start_age: args.start_age,
        initial_assets: args.initial_assets,
        horizon_years: args.horizon_years,
        fixed_withdrawal: args.fixed_withdrawal,
        percent_withdrawal: args.percent_withdrawal / 100.0,
    };
    params.validate()?;

    let engine = EngineConfig {
        accrual_order: args.accrual_order.into(),
        rounding_mode: args.rounding_mode.into(),
    };
    Ok((params, engine))
}

pub fn build_simulate_response(
    series: &RateSeries,
    params: &SimulationParameters,
    engine: EngineConfig,
) -> Result<SimulateResponse> {
    let trajectories = run_simulation(series, params, engine)?;
    Ok(SimulateResponse {
        parameters: *params,
        engine,
        fixed_amount_summary: trajectories.fixed_amount.summary(),
        fixed_percent_summary: trajectories.fixed_percent.summary(),
        rows: assemble_table(&trajectories),
        trajectories,
    })
}

/// Runs one simulation and renders it for stdout.
pub fn render_simulation(
    series: &RateSeries,
    args: &SimulateArgs,
    format: OutputFormat,
) -> Result<String> {
    let (params, engine) = build_parameters(args)?;
    let response = build_simulate_response(series, &params, engine)?;
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&response)?),
        OutputFormat::Csv => {
            let mut buffer = Vec::new();
            write_table_csv(&response.rows, &mut buffer)?;
            String::from_utf8(buffer)
                .map_err(|e| Error::Serialization(format!("csv output is not utf-8: {e}")))
        }
    }
}

pub fn render_solve(series: &RateSeries, args: &SimulateArgs, policy: CliPolicy) -> Result<String> {
    let result = solve_for(series, args, policy)?;
    Ok(serde_json::to_string_pretty(&result)?)
}

fn solve_for(
    series: &RateSeries,
    args: &SimulateArgs,
    policy: CliPolicy,
) -> Result<SustainableSolveResult> {
    let (params, engine) = build_parameters(args)?;
    let config = SustainableSolveConfig::for_policy(policy.into(), &params, series);
    solve_sustainable_withdrawal(series, &params, engine, config)
}

#[derive(Clone)]
struct AppState {
    rates: SharedRateSource,
}

fn router(rates: SharedRateSource) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/rates", get(rates_handler))
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .route("/api/solve", post(solve_handler))
        .fallback(not_found_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { rates })
}

pub async fn run_http_server(port: u16, rates: SharedRateSource) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(rates);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "drawdown HTTP API listening");
    info!("Local access: http://127.0.0.1:{port}/api/simulate");

    axum::serve(listener, app).await
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, serde_json::json!({ "status": "ok" }))
}

async fn rates_handler(State(state): State<AppState>) -> Response {
    match state.rates.load() {
        Ok(series) => json_response(
            StatusCode::OK,
            RatesResponse {
                years: series.len(),
                rates: series.as_slice().to_vec(),
            },
        ),
        Err(err) => err.into_response(),
    }
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(
    State(state): State<AppState>,
    Query(payload): Query<SimulatePayload>,
) -> Response {
    simulate_handler_impl(&state, payload)
}

async fn simulate_post_handler(
    State(state): State<AppState>,
    Json(payload): Json<SimulatePayload>,
) -> Response {
    simulate_handler_impl(&state, payload)
}

async fn solve_handler(State(state): State<AppState>, Json(payload): Json<SolvePayload>) -> Response {
    solve_handler_impl(&state, payload)
}

fn simulate_handler_impl(state: &AppState, payload: SimulatePayload) -> Response {
    let outcome = api_request_from_payload(payload).and_then(|request| {
        let series = state.rates.load()?;
        build_simulate_response(&series, &request.params, request.engine)
    });
    match outcome {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(err) => err.into_response(),
    }
}

fn solve_handler_impl(state: &AppState, payload: SolvePayload) -> Response {
    let policy = payload
        .policy
        .map(CliPolicy::from)
        .unwrap_or(CliPolicy::FixedAmount);
    let mut args = default_args_for_api();
    apply_payload(&mut args, payload.simulate);

    let outcome = state
        .rates
        .load()
        .and_then(|series| solve_for(&series, &args, policy));
    match outcome {
        Ok(result) => json_response(StatusCode::OK, result),
        Err(err) => err.into_response(),
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            Error::DataSource(_) => {
                error!(error = %self, "rate data source failed");
                StatusCode::BAD_GATEWAY
            }
            Error::Serialization(_) => {
                error!(error = %self, "failed to serialize response");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        error_response(status, &self.to_string())
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
fn api_request_from_json(json: &str) -> Result<ApiRequest> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| Error::invalid("payload", format!("invalid API JSON payload: {e}")))?;
    api_request_from_payload(payload)
}

fn api_request_from_payload(payload: SimulatePayload) -> Result<ApiRequest> {
    let mut args = default_args_for_api();
    apply_payload(&mut args, payload);
    let (params, engine) = build_parameters(&args)?;
    Ok(ApiRequest { params, engine })
}

fn apply_payload(args: &mut SimulateArgs, payload: SimulatePayload) {
    if let Some(v) = payload.start_age {
        args.start_age = v;
    }
    if let Some(v) = payload.initial_assets {
        args.initial_assets = v;
    }
    if let Some(v) = payload.fixed_withdrawal {
        args.fixed_withdrawal = v;
    }
    if let Some(v) = payload.percent_withdrawal {
        args.percent_withdrawal = v;
    }
    if let Some(v) = payload.horizon_years {
        args.horizon_years = v;
    }
    if let Some(v) = payload.accrual_order {
        args.accrual_order = v.into();
    }
    if let Some(v) = payload.rounding_mode {
        args.rounding_mode = v.into();
    }
}

fn default_args_for_api() -> SimulateArgs {
    SimulateArgs {
        start_age: 65,
        initial_assets: 2_000.0,
        fixed_withdrawal: 120.0,
        percent_withdrawal: 4.0,
        horizon_years: 35,
        accrual_order: CliAccrualOrder::InterestOnOpening,
        rounding_mode: CliRoundingMode::EachStep,
    }
}
