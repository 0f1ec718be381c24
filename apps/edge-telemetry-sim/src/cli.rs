use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "edge-telemetry-sim",
    version,
    about = "Edge IoT device simulator with instrumented LLM inference"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay the dataset over MQTT using environment configuration (default).
    Run,
    /// Summarize and compare saved inference metrics.
    Report(ReportArgs),
    /// Subscribe to every device's telemetry and print each message.
    Consume(ConsumeArgs),
}

#[derive(Args, Debug)]
pub struct ReportArgs {
    #[arg(long, default_value = "metrics")]
    pub metrics_dir: PathBuf,
    #[arg(long)]
    pub device: Option<String>,
    #[arg(long)]
    pub export_csv: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ConsumeArgs {
    /// Broker host; defaults to MQTT_URL / MQTT_BROKER.
    #[arg(long)]
    pub broker: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
}
