use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sensor_client::{
    actors::{
        collector::DataCollector,
        evaluator::SensorEvaluator,
        watchdog::{ConnectionWatchdog, Startup, connect_with_retry},
    },
    alerts::{AlertManager, NotificationSink},
    config::{ClientSettings, read_config_file},
    connection::{
        ConnectionSettings, ServerConnection,
        protocol::SensorRegistration,
        transport::{ClientIdentity, TlsDialer},
    },
    util::get_hostname,
    weather::HttpWeatherSource,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Delay between two start-up connection attempts
const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Parser)]
#[command(version, about = "Weather sensor client for the alert server")]
struct Args {
    /// Config file
    #[arg(short, long, default_value = "config/config.json")]
    file: PathBuf,
}

fn init(level: LevelFilter, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = filter::Targets::new().with_targets(vec![
        ("sensor_client", level),
        ("client", level),
    ]);
    let layer = tracing_subscriber::fmt::layer().compact().with_ansi(false);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("unable to open log file {}", path.display()))?;

            tracing_subscriber::registry()
                .with(layer.with_writer(Mutex::new(file)))
                .with(filter)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(layer.with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }

    Ok(())
}

fn load_settings(path: &Path) -> anyhow::Result<ClientSettings> {
    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let settings = read_config_file(path)?.into_settings(&base_dir)?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let settings = load_settings(&args.file)
        .with_context(|| format!("invalid configuration in {}", args.file.display()))?;
    init(settings.log_level, settings.log_file.as_deref())?;
    trace!("started with args: {args:?}");

    let cancel = CancellationToken::new();
    let hostname = get_hostname();

    let source = HttpWeatherSource::new(
        settings.base_url.as_str(),
        settings.api_key.as_str(),
        settings.http_timeout,
    )?;
    let mut collector = DataCollector::new(
        Arc::new(source),
        settings.collector_interval,
        settings.max_failures,
    );
    for sensor in &settings.sensors {
        collector.add_location(sensor.location.clone());
    }
    let collector = collector.start(cancel.child_token());

    let identity = settings
        .client_certificate
        .as_ref()
        .map(|(cert_file, key_file)| ClientIdentity {
            cert_file,
            key_file,
        });
    let dialer = TlsDialer::new(&settings.host, settings.port, &settings.ca_file, identity)?;

    let connection = Arc::new(ServerConnection::new(
        Arc::new(dialer),
        ConnectionSettings {
            username: settings.username.clone(),
            password: settings.password.clone(),
            hostname: hostname.clone(),
            connect_timeout: settings.connect_timeout,
            request_timeout: settings.request_timeout,
            send_timeout: settings.send_timeout,
        },
        settings
            .sensors
            .iter()
            .map(SensorRegistration::from)
            .collect(),
    ));

    let notifier: Option<Arc<dyn NotificationSink>> = settings.notification.clone().map(|alert| {
        Arc::new(AlertManager::new(alert, hostname.clone(), settings.http_timeout))
            as Arc<dyn NotificationSink>
    });

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("received Ctrl-C, shutting down"),
                Err(e) => {
                    error!("unable to listen for Ctrl-C: {e}");
                    return;
                }
            }
            cancel.cancel();
        }
    });

    info!("connecting to {}:{}", settings.host, settings.port);
    match connect_with_retry(
        &*connection,
        notifier.as_deref(),
        STARTUP_RETRY_DELAY,
        &cancel,
    )
    .await
    {
        Ok(Startup::Connected) => {}
        Ok(Startup::Cancelled) => {
            debug!("sensor client stopped before connecting");
            return Ok(());
        }
        Err(e) => {
            cancel.cancel();
            return Err(e).context("unable to connect to the alert server");
        }
    }

    let watchdog = ConnectionWatchdog::new(connection.clone(), notifier, settings.ping_interval);
    let watchdog = tokio::spawn(watchdog.run(cancel.child_token()));

    let evaluator = SensorEvaluator::new(
        settings.sensors,
        Arc::new(collector),
        connection,
        settings.poll_interval,
    );
    evaluator.run(cancel.clone()).await;

    cancel.cancel();
    if let Err(e) = watchdog.await {
        error!("watchdog task failed: {e}");
    }
    debug!("sensor client stopped");

    Ok(())
}
