//! relayd - authenticated outbound mail relay entry point

use anyhow::Result;
use relayd_common::config::Config;
use relayd_core::pipeline::QueueWorker;
use relayd_core::smtp::ConfigAuthProvider;
use relayd_core::{
    ConfigDkimProvider, DeliveryAgent, LettreTransportFactory, Pipeline, SmtpServer,
    SystemMxResolver,
};
use relayd_storage::{DatabasePool, JobStore, Spool};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting relayd...");

    let config = Arc::new(Config::load()?);

    let db_pool = DatabasePool::new(&config.database).await?;
    info!("Database connection established");

    db_pool.migrate().await?;
    info!("Database migrations completed");

    let store = JobStore::new(db_pool);
    let spool = Spool::new(&config.spool)?;

    let agent = DeliveryAgent::new(
        Arc::new(SystemMxResolver::new()),
        Arc::new(ConfigDkimProvider::new(config.clone())),
        Arc::new(LettreTransportFactory::new(&config.server.hostname)),
        Duration::from_secs(config.smtp.delivery_timeout_secs),
    );

    let pipeline = Arc::new(Pipeline::new(
        store,
        spool.clone(),
        agent,
        config.queue.max_attempts,
    ));

    // Jobs left running by an unclean shutdown go back to pending
    // before the worker starts polling
    let worker = QueueWorker::new(pipeline.clone(), &config.queue);
    let worker_handle = tokio::spawn(async move {
        worker.run().await;
    });

    let auth = Arc::new(ConfigAuthProvider::new(config.clone()));
    let smtp_server = Arc::new(SmtpServer::new(
        config.clone(),
        auth,
        pipeline,
        spool,
    )?);

    let smtp_handle = {
        let smtp_server = smtp_server.clone();
        tokio::spawn(async move {
            if let Err(e) = smtp_server.run().await {
                tracing::error!("SMTP server error: {}", e);
            }
        })
    };

    info!("relayd started, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    smtp_handle.abort();
    worker_handle.abort();

    info!("relayd shutdown complete");

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,relayd=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .init();
}
