// ===============================
// src/main.rs
// ===============================
//
// Wiring: command line, user configuration, logging and metrics, then the
// selected strategy against a session transport. A clean logout tears the
// session down and a fresh one is built after a cool-off; a fatal strategy
// error exits the process so nothing keeps trading on bad state.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::{error, info};

use gamma_scalper::config::Config;
use gamma_scalper::gateway::{GatewayConfig, PaperGateway};
use gamma_scalper::metrics;
use gamma_scalper::recorder;
use gamma_scalper::strategy::{GammaScalper, Settings};
use gamma_scalper::testing;
use gamma_scalper::transport::TransportEvent;

const RECONNECT_PAUSE: Duration = Duration::from_secs(5 * 60);
const DEFAULT_METRICS_PORT: u16 = 9898;

#[derive(Debug, Parser)]
#[command(name = "gamma_scalper", about = "Delta-hedging agent for an option straddle")]
struct Cli {
    /// User configuration file (key:value lines).
    #[arg(short = 'u', long = "user_config")]
    user_config: std::path::PathBuf,

    /// Strategy to run.
    #[arg(short = 's', long = "strategy", value_enum, default_value = "testing")]
    strategy: StrategyKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StrategyKind {
    #[value(name = "gamma_scalper")]
    GammaScalper,
    #[value(name = "testing")]
    Testing,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.user_config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: impossible to process the configuration file: {e}");
            return ExitCode::FAILURE;
        }
    };

    metrics::init();
    match config.get_u16("MetricsPort") {
        Ok(port) => metrics::serve_metrics(port.unwrap_or(DEFAULT_METRICS_PORT)),
        Err(e) => {
            eprintln!("ERROR: {e}");
            return ExitCode::FAILURE;
        }
    }

    match cli.strategy {
        StrategyKind::GammaScalper => run_gamma_scalper(&config).await,
        StrategyKind::Testing => run_testing().await,
    }
}

async fn run_gamma_scalper(config: &Config) -> ExitCode {
    let settings = match Settings::from_config(config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return ExitCode::FAILURE;
        }
    };

    loop {
        let (gateway, events) = PaperGateway::spawn(GatewayConfig::default());
        let events = record_events(config, events);
        let scalper = GammaScalper::new(&settings, gateway, events);

        match scalper.run().await {
            Ok(()) => {
                info!(pause = ?RECONNECT_PAUSE, "session over, reconnecting after the pause");
                tokio::time::sleep(RECONNECT_PAUSE).await;
            }
            Err(e) => {
                error!(%e, "strategy stopped");
                return ExitCode::FAILURE;
            }
        }
    }
}

async fn run_testing() -> ExitCode {
    let (gateway, events) = PaperGateway::spawn(GatewayConfig::default());
    testing::run(gateway, events).await;
    ExitCode::SUCCESS
}

/// When a record file is configured, tees every inbound event into the
/// JSONL recorder on its way to the strategy.
fn record_events(
    config: &Config,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) -> mpsc::UnboundedReceiver<TransportEvent> {
    let Some(path) = config.get("RecordFile") else {
        return events;
    };

    let (strategy_tx, strategy_rx) = mpsc::unbounded_channel();
    let (recorder_tx, recorder_rx) = mpsc::unbounded_channel();
    tokio::spawn(recorder::run(recorder_rx, path.to_string()));
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let _ = recorder_tx.send(event.clone());
            if strategy_tx.send(event).is_err() {
                break;
            }
        }
    });
    strategy_rx
}
