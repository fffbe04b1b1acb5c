//! Stands in for the radio bridge and a handful of weather sensors: sends a
//! telemetry packet per sensor to the gateway every period and checks that
//! each one is acknowledged. Settings pushed by the gateway are logged.
use clap::Parser;
use std::net::SocketAddr;
use tokio::{
    net::UdpSocket,
    time::{timeout, Duration},
};
use wxctlp_frame::{BridgeSettings, Metric, RadioPacket, HEADER_LEN, MAX_PAYLOAD_LEN};

#[derive(Parser, Debug)]
struct Args {
    /// Address the simulated bridge listens on (the gateway's `bridge`)
    #[arg(long, default_value = "127.0.0.1:7471")]
    bind: SocketAddr,
    /// Gateway radio address (the gateway's `bind`)
    #[arg(long, default_value = "127.0.0.1:7470")]
    gateway: SocketAddr,
    /// Gateway radio node id
    #[arg(long, default_value_t = 1)]
    gateway_node: u8,
    /// Simulated sensor node ids
    #[arg(long, value_delimiter = ',', default_value = "7")]
    sensors: Vec<u8>,
    #[arg(long, default_value_t = 10)]
    period_secs: u64,
    /// Stop after this many rounds, 0 runs forever
    #[arg(long, default_value_t = 0)]
    rounds: u32,
}

fn reading(sensor: u8, round: u32) -> Metric {
    let drift = (round % 20) as f32 * 0.1;
    Metric {
        battery: 3.7 - drift / 10.0,
        temperature: 21.5 + drift + sensor as f32,
        humidity: 55.0 - drift,
        pressure: 1013.0 + drift,
        rssi: -42 - sensor as i32,
        uptime: (round as i32) * 10,
    }
}

async fn send_report(
    socket: &UdpSocket,
    args: &Args,
    sensor: u8,
    metric: &Metric,
) -> Result<(), Box<dyn std::error::Error>> {
    let packet = RadioPacket::new(args.gateway_node, sensor, &metric.encode())?.with_ack_request();
    let mut buffer = [0u8; HEADER_LEN + MAX_PAYLOAD_LEN];
    let len = packet.encode(&mut buffer);
    socket.send_to(&buffer[..len], args.gateway).await?;
    log::info!("sensor {sensor} sent {metric}");

    let ack = timeout(Duration::from_secs(2), next_packet(socket)).await??;
    if ack.is_ack && ack.to == sensor && ack.from == args.gateway_node {
        log::info!("sensor {sensor} acknowledged");
    } else {
        log::warn!("sensor {sensor} got unexpected reply {ack:?}");
    }
    Ok(())
}

fn log_settings(settings: &BridgeSettings) {
    log::info!(
        "gateway set network {} node {} at {}MHz, receive {}, encryption {}",
        settings.network_id,
        settings.node_id,
        settings.frequency_mhz,
        settings.receive,
        settings.key.is_some()
    );
}

/// Next radio packet from the gateway, logging settings datagrams on the way
async fn next_packet(socket: &UdpSocket) -> Result<RadioPacket, Box<dyn std::error::Error>> {
    let mut buffer = [0u8; HEADER_LEN + MAX_PAYLOAD_LEN];
    loop {
        let (len, _) = socket.recv_from(&mut buffer).await?;
        if BridgeSettings::is_settings(&buffer[..len]) {
            log_settings(&BridgeSettings::decode(&buffer[..len])?);
            continue;
        }
        return Ok(RadioPacket::decode(&buffer[..len])?);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    log::info!("Simulated bridge on {}, gateway at {}", args.bind, args.gateway);
    let socket = UdpSocket::bind(args.bind).await?;
    let mut interval = tokio::time::interval(Duration::from_secs(args.period_secs));

    let mut round = 0;
    loop {
        interval.tick().await;
        for &sensor in &args.sensors {
            if let Err(e) = send_report(&socket, &args, sensor, &reading(sensor, round)).await {
                log::error!("sensor {sensor}: {e:}");
            }
        }
        round += 1;
        if args.rounds != 0 && round >= args.rounds {
            break;
        }
    }
    Ok(())
}
