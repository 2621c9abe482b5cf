use std::sync::Arc;

use clap::Parser;
use drawdown::api::{Cli, Command, render_simulation, render_solve, run_http_server};
use drawdown::logging::init_logging;
use drawdown::rates::RateSeriesProvider;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("Failed to initialize logging: {e}");
    }

    match cli.command {
        Command::Serve(args) => {
            let source = args.rates.source();
            // Fail at startup rather than on the first request.
            if let Err(e) = source.load() {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
            if let Err(e) = run_http_server(args.port, Arc::new(source)).await {
                eprintln!("Server error: {e}");
                std::process::exit(1);
            }
        }
        Command::Simulate(cmd) => {
            let output = cmd
                .rates
                .source()
                .load()
                .and_then(|series| render_simulation(&series, &cmd.params, cmd.format));
            emit(output);
        }
        Command::Solve(cmd) => {
            let output = cmd
                .rates
                .source()
                .load()
                .and_then(|series| render_solve(&series, &cmd.params, cmd.policy));
            emit(output);
        }
    }
}

fn emit(output: drawdown::Result<String>) {
    match output {
        Ok(text) => println!("{}", text.trim_end()),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
