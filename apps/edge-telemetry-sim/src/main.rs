mod cli;

use crate::cli::{Cli, Commands, ConsumeArgs, ReportArgs};
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use edge_telemetry_sim::config::Config;
use edge_telemetry_sim::consumer::{self, ConsumerSettings};
use edge_telemetry_sim::dataset::DatasetCursor;
use edge_telemetry_sim::http::{self, HttpState};
use edge_telemetry_sim::inference::InferenceEngine;
use edge_telemetry_sim::model::HttpTextModel;
use edge_telemetry_sim::mqtt::MqttTransport;
use edge_telemetry_sim::persist::MetricsPersister;
use edge_telemetry_sim::publisher::{PublishLoop, PublishSettings};
use edge_telemetry_sim::report;
use edge_telemetry_sim::sampler::SysinfoProbe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,edge_telemetry_sim=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run().await,
        Commands::Report(args) => {
            init_tracing()?;
            run_report(args)
        }
        Commands::Consume(args) => run_consume(args).await,
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;
    tracing::info!(
        device_id = %config.device_id,
        device_name = %config.device_name,
        broker = %format!("{}:{}", config.mqtt_host, config.mqtt_port),
        "edge device simulator starting"
    );

    let cursor = DatasetCursor::from_csv(&config.dataset_path, &config.device_id)?;
    tracing::info!(readings = cursor.len(), "dataset loaded");

    let persister = MetricsPersister::new(&config.metrics_dir);
    let engine = if config.inference_enabled {
        load_engine(&config, &persister).await
    } else {
        None
    };

    let mut publish_loop = PublishLoop::new(
        MqttTransport::new(&config),
        cursor,
        engine,
        persister,
        PublishSettings::from_config(&config),
    );

    let shutdown = CancellationToken::new();
    let http_handle = match &config.status_http_bind {
        Some(bind) => {
            let app = http::router(HttpState {
                status: publish_loop.subscribe(),
            });
            let listener = tokio::net::TcpListener::bind(bind)
                .await
                .with_context(|| format!("failed to bind status HTTP on {bind}"))?;
            tracing::info!(bind = %bind, "status HTTP listening");
            let cancel = shutdown.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { cancel.cancelled().await })
                    .await
                    .ok();
            }))
        }
        None => None,
    };

    let signal_cancel = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        signal_cancel.cancel();
    });

    publish_loop.run(shutdown.clone()).await;
    shutdown.cancel();
    if let Some(handle) = http_handle {
        handle.await.ok();
    }
    tracing::info!("edge device simulator stopped");
    Ok(())
}

async fn run_consume(args: ConsumeArgs) -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;
    let mut settings = ConsumerSettings::from_config(&config);
    if let Some(host) = args.broker {
        settings.host = host;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    tracing::info!(
        broker = %format!("{}:{}", settings.host, settings.port),
        topic = %settings.topic_filter,
        "telemetry consumer starting"
    );

    let shutdown = CancellationToken::new();
    let signal_cancel = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        signal_cancel.cancel();
    });

    consumer::run_consumer(settings, shutdown).await?;
    Ok(())
}

/// Model problems are not fatal; the device keeps publishing telemetry without inference.
async fn load_engine(config: &Config, persister: &MetricsPersister) -> Option<InferenceEngine> {
    let endpoint = config.model_endpoint.clone()?;
    let model = HttpTextModel::new(
        config.model_name.clone(),
        endpoint,
        config.model_timeout,
        config.compute_device,
    );
    let probe = match SysinfoProbe::current_process() {
        Ok(probe) => probe,
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "resource probe unavailable, inference disabled");
            return None;
        }
    };

    let engine = InferenceEngine::new(Arc::new(model), Arc::new(probe), config.inference_settings());
    match engine.load().await {
        Ok(metric) => {
            if let Err(err) = persister.save_load_metric(&metric) {
                tracing::warn!(error = %err, "failed to save load metrics");
            }
            Some(engine)
        }
        Err(err) => {
            tracing::warn!(error = %err, "model load failed, inference disabled");
            None
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(err) => tracing::warn!(error = %err, "SIGTERM handler unavailable"),
        }
    }
    tokio::signal::ctrl_c().await.ok();
}

fn run_report(args: ReportArgs) -> Result<()> {
    let artifacts = report::load_artifacts(&args.metrics_dir, args.device.as_deref())?;
    if artifacts.is_empty() {
        return Err(anyhow!(
            "no metrics artifacts found in {}",
            args.metrics_dir.display()
        ));
    }

    println!("{}", report::render_summaries(&artifacts));
    if artifacts.len() >= 2 {
        println!("{}", report::render_comparison(&artifacts));
    } else {
        tracing::info!("need at least 2 models to compare");
    }
    if let Some(path) = &args.export_csv {
        report::export_csv(&artifacts, path)?;
        println!("Metrics exported to: {}", path.display());
    }
    Ok(())
}
