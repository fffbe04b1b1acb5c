use actix::Actor;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_appender::rolling;
use tracing_log::LogTracer;
use tracing_subscriber::FmtSubscriber;

use wxctl_homie::{ConnectionConfig, HomieClient, RumqttTransport, SystemInterfaces};
use wxctl_radio::{RadioClient, UdpTransceiver};
use wxctld::{
    gateway::{Gateway, GatewayHandle, SensorReport},
    GatewayError,
};
use wxctldb::ConfigStore;

#[derive(Parser, Debug)]
#[command(version, about = "Bridges RFM69 weather sensors to an MQTT broker as a Homie device")]
struct Args {
    /// Configuration store (sqlite file)
    #[arg(long, default_value = "./weathercontroller.db")]
    db: String,
    /// Directory receiving the daily rolling log files
    #[arg(long, default_value = "./logs")]
    logs: PathBuf,
    #[arg(long, default_value = "debug")]
    log_level: tracing::Level,
}

async fn wait_for_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                log::error!("Unable to listen for SIGTERM: {e:}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    log::info!("received interrupt, aborting operations");
    token.cancel();
}

#[actix::main]
async fn main() -> Result<(), GatewayError> {
    let args = Args::parse();

    LogTracer::init().expect("Unable to set up log tracer");
    let log = rolling::daily(&args.logs, "weather-controller");
    let (nb, _guard) = tracing_appender::non_blocking(log);
    let sub = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_writer(nb)
        .finish();
    tracing::subscriber::set_global_default(sub).expect("Unable to set up tracing subscriber");

    let mut store = ConfigStore::open(&args.db)?;
    let config = store.load();

    let mut homie = HomieClient::new(
        ConnectionConfig::from(&config),
        RumqttTransport::new(),
        SystemInterfaces,
    );
    let token = homie.shutdown_token();
    tokio::spawn(wait_for_signal(token.clone()));

    homie.start().await?;
    log::info!("connected to mqtt broker {}", homie.url());

    let mut gateway = Gateway::new(homie, store, config.clone());
    let handle = GatewayHandle::new(gateway.sender()).start();
    gateway.install_config_callback(handle.clone());

    let radio_config = &config.radio;
    let mut radio = RadioClient::new(
        radio_config.network_id,
        radio_config.node_id,
        UdpTransceiver::new(radio_config.bind, radio_config.bridge),
        move |sensor, metric| handle.do_send(SensorReport { sensor, metric }),
    );
    if let Err(e) = radio
        .start(&radio_config.encryption_key, &radio_config.frequency)
        .await
    {
        log::error!("Unable to start radio: {e:}");
        gateway.device_mut().stop().await?;
        return Err(e.into());
    }

    gateway.run(token.cancelled_owned()).await?;
    radio.stop().await?;
    log::info!("main process finished");
    Ok(())
}
