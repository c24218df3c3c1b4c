//! CLI for reportbus
//!
//! Subcommands:
//! - `provision`: declare both topics and exit
//! - `enqueue`: request a report for a user
//! - `worker`: build reports
//! - `notifier`: route notifications to websocket sessions
//! - `replay`: move dead letters back onto their topic

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use reportbus::broker::amqp::AmqpConnector;
use reportbus::config::load_config;
use reportbus::pipeline::{ReplayOptions, Runtime};
use reportbus::report::ReportProducer;
use reportbus::storage::S3ObjectStore;
use reportbus::transport::{self, HubHandle};
use reportbus::utils::error::PipelineError;
use reportbus::utils::{logging, propagation};

#[derive(Parser)]
#[command(name = "reportbus", version, about = "Asynchronous report pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Declare the report and notification topics
    Provision,
    /// Enqueue a report job
    Enqueue {
        #[arg(long)]
        user_id: Uuid,
    },
    /// Consume report jobs
    Worker,
    /// Consume notifications and push them to websocket clients
    Notifier,
    /// Republish dead-lettered messages onto their topic
    Replay {
        #[arg(long, value_enum)]
        topic: TopicKind,
        /// Stop after this many messages
        #[arg(long)]
        limit: Option<u64>,
        /// Stop after this many seconds without a dead letter
        #[arg(long, default_value_t = 5)]
        idle_secs: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TopicKind {
    Report,
    Notification,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info", false);
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.logging.level, settings.logging.json);
    propagation::install_tracer_provider();

    let connector = Arc::new(AmqpConnector::new(
        settings.broker.url.clone(),
        format!("reportbus-{}", Uuid::new_v4()),
    ));
    let runtime = Runtime::new(settings, connector);

    match run(cli.command, runtime).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "reportbus failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, runtime: Runtime) -> Result<(), PipelineError> {
    match command {
        Command::Provision => {
            runtime.provision().await?;
            info!("topics provisioned");
        }
        Command::Enqueue { user_id } => runtime.enqueue(user_id).await?,
        Command::Worker => {
            let storage = runtime.settings().storage()?;
            let store = S3ObjectStore::new(storage)?;
            let producer = ReportProducer::new(Arc::new(store), storage.bucket.clone())
                .with_ttl(storage.presign_ttl());
            let shutdown = shutdown_on_ctrl_c();
            runtime.run_report_worker(producer, shutdown).await?;
        }
        Command::Notifier => {
            let hub = HubHandle::new();
            let listener = transport::bind(&runtime.settings().server).await?;
            let shutdown = shutdown_on_ctrl_c();
            let server = tokio::spawn(transport::serve(listener, hub.clone(), shutdown.clone()));
            let routed = runtime
                .run_notification_router(Arc::new(hub), shutdown.clone())
                .await;
            shutdown.cancel();
            let _ = server.await;
            routed?;
        }
        Command::Replay {
            topic,
            limit,
            idle_secs,
        } => {
            let topic = match topic {
                TopicKind::Report => runtime.report_topic(),
                TopicKind::Notification => runtime.notification_topic(),
            };
            let options = ReplayOptions {
                limit,
                idle: Duration::from_secs(idle_secs),
            };
            let summary = runtime.replay(topic, options).await?;
            info!(replayed = summary.replayed, "replay done");
        }
    }
    Ok(())
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                trigger.cancel();
            }
            Err(e) => error!(error = %e, "could not listen for shutdown signal"),
        }
    });
    token
}
