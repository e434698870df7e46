//! Consume refund requests from Kafka and post them to the payments API.
use envconfig::Envconfig;
use refund_common::health::HealthRegistry;
use refund_common::metrics::{serve, setup_metrics_recorder};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use refund_consumer::config::Config;
use refund_consumer::error::ServiceError;
use refund_consumer::handlers::app;
use refund_consumer::service::KafkaLoopFactory;
use refund_consumer::signals::ShutdownSignals;
use refund_consumer::supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::init_from_env().map_err(|error| {
        error!(error = %error, "invalid configuration");
        ServiceError::Config(error)
    })?;
    info!(config = ?config, "starting refund request consumer");
    if let Some(zookeeper) = &config.zookeeper_addr {
        info!(
            zookeeper = %zookeeper,
            chroot = %config.zookeeper_chroot,
            "zookeeper settings are accepted but not used"
        );
    }

    let signals = ShutdownSignals::install()?;
    let liveness = HealthRegistry::new("liveness");
    let recorder_handle = setup_metrics_recorder()?;

    let bind = config.bind();
    let router = app(liveness.clone(), Some(recorder_handle));
    tokio::task::spawn(async move {
        if let Err(error) = serve(router, &bind).await {
            error!(bind = %bind, error = %error, "failed to serve health and metrics endpoints");
        }
    });

    let error_queue_mode = config.is_error_queue_consumer;
    let factory = KafkaLoopFactory::new(config, liveness)?;
    let supervisor = Supervisor::start(&factory, error_queue_mode)
        .await
        .inspect_err(|error| error!(error = %error, "failed to start consumer loops"))?;
    info!(loops = ?supervisor.loop_names(), "consumer loops started");

    supervisor.wait_for_shutdown(signals.recv()).await?;
    info!("refund request consumer stopped");

    Ok(())
}
