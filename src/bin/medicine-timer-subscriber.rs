use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use medicine_timer_subscriber::{
    connect_until_shutdown, JetStreamBroker, LocalClock, MedicationProcessor, MessageConsumer,
    MonitorSink, NatsNotificationSink, NotificationSink, NotificationSinkKind, ScheduleMatcher,
    SubscriberConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("medicine_timer_subscriber=info")),
        )
        .init();

    info!("🚀 Starting Medicine Timer Subscriber");

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    // Load configuration
    let config = SubscriberConfig::from_env().context("Failed to load configuration")?;
    info!("📋 Configuration loaded: {}", config.service_name);

    let schedule = Arc::new(
        config
            .load_schedule()
            .context("Failed to load dosing schedule")?,
    );
    let matcher = ScheduleMatcher::new(config.match_policy()?);
    info!(
        medicines = schedule.len(),
        tolerance_minutes = matcher.policy().tolerance_minutes(),
        "💊 Dosing schedule ready"
    );

    let Some(client) = connect_until_shutdown(&config, &shutdown)
        .await
        .context("Failed to connect to NATS")?
    else {
        info!("👋 Medicine Timer Subscriber stopped before connecting");
        return Ok(());
    };

    let sink: Arc<dyn NotificationSink> = match config.notification_sink {
        NotificationSinkKind::Monitor => Arc::new(MonitorSink::new()),
        NotificationSinkKind::Nats => {
            info!(
                "📤 Publishing reminders on subject: {}",
                config.notification_subject
            );
            Arc::new(NatsNotificationSink::new(
                client.clone(),
                config.notification_subject.clone(),
            ))
        }
    };

    let processor = MedicationProcessor::new(schedule, matcher, sink, Arc::new(LocalClock));
    let broker = JetStreamBroker::new(client, config.clone());
    let consumer = MessageConsumer::new(broker, &config, processor);

    info!("✅ Service started successfully");
    consumer
        .run(shutdown)
        .await
        .context("Medication consumer failed")?;

    info!("👋 Medicine Timer Subscriber stopped");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for ctrl-c: {}", e);
                }
            }
        }
    }

    #[cfg(not(unix))]
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
    }

    info!("🛑 Received shutdown signal");
    shutdown.cancel();
}
