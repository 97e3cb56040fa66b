use std::net::{IpAddr, SocketAddr};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::Parser;
use log::{debug, info, warn};

use mx::{
    Channel, DEFAULT_REALTIME_PORT, DEFAULT_RELIABLE_PORT, Dispatcher, DualEndpoint, MxConfig,
    PacketLossSimulation, PeerEvent, PeerEventKind, PeerState,
};

#[derive(Parser)]
#[command(name = "mx-node")]
#[command(about = "Headless Mx transport peer")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(long, default_value_t = DEFAULT_REALTIME_PORT)]
    realtime_port: u16,

    #[arg(long, default_value_t = DEFAULT_RELIABLE_PORT)]
    reliable_port: u16,

    #[arg(short, long, help = "Peer to connect to, as ip:realtime_port:reliable_port")]
    connect: Option<String>,

    #[arg(long, help = "Send a reliable message of this many bytes once connected")]
    send_bytes: Option<usize>,

    #[arg(long, help = "Send an unreliable ping to every connected peer each second")]
    ping: bool,

    #[arg(short, long, default_value_t = 60)]
    tick_rate: u32,

    #[arg(long, default_value_t = 0.0, help = "Outbound packet loss percentage (0-100)")]
    loss_percent: f32,
}

fn parse_endpoint(value: &str) -> Result<DualEndpoint> {
    let mut parts = value.rsplitn(3, ':');
    let (Some(reliable), Some(realtime), Some(ip)) = (parts.next(), parts.next(), parts.next())
    else {
        bail!("expected ip:realtime_port:reliable_port, got {value:?}");
    };

    let ip: IpAddr = ip
        .trim_matches(|c| c == '[' || c == ']')
        .parse()
        .with_context(|| format!("invalid address {ip:?}"))?;
    let realtime: u16 = realtime
        .parse()
        .with_context(|| format!("invalid realtime port {realtime:?}"))?;
    let reliable: u16 = reliable
        .parse()
        .with_context(|| format!("invalid reliable port {reliable:?}"))?;

    Ok(DualEndpoint::new(
        SocketAddr::new(ip, realtime),
        SocketAddr::new(ip, reliable),
    ))
}

fn log_event(event: &PeerEvent) {
    let PeerEvent {
        peer,
        endpoint,
        kind,
    } = event;
    match kind {
        PeerEventKind::ClientConnected => info!("{} connected at {}", peer, endpoint),
        PeerEventKind::ClientDisconnected { reason } => {
            info!("{} at {} {}", peer, endpoint, reason.as_str())
        }
        PeerEventKind::ClientDisconnectWarning {
            channel,
            accumulator,
            disconnected,
        } => {
            if *disconnected || accumulator % 60 == 0 {
                warn!(
                    "{} silent on {} for {} ticks",
                    peer,
                    channel.as_str(),
                    accumulator
                );
            }
        }
        PeerEventKind::MessageReceived { channel, data } => {
            info!("{} {} message received ({} bytes)", peer, channel.as_str(), data.len())
        }
        PeerEventKind::MessageAcknowledged { channel, data } => {
            info!("{} {} message acknowledged ({} bytes)", peer, channel.as_str(), data.len())
        }
        PeerEventKind::MessageLost { channel, data } => {
            debug!("{} {} message lost ({} bytes)", peer, channel.as_str(), data.len())
        }
        PeerEventKind::MessageSent { .. } => {}
        PeerEventKind::FlowControlChanged {
            channel,
            good,
            penalty,
        } => info!(
            "{} {} flow control {} (penalty {:.1}s)",
            peer,
            channel.as_str(),
            if *good { "good" } else { "bad" },
            penalty.as_secs_f64()
        ),
        PeerEventKind::ReliableSendProgress(progress) => debug!(
            "{} sent {}/{} fragments of {} bytes",
            peer,
            progress.current,
            progress.total,
            progress.total_bytes
        ),
        PeerEventKind::ReliableReceiveProgress(progress) => debug!(
            "{} received {}/{} fragments ({} bytes)",
            peer,
            progress.current,
            progress.total,
            progress.total_bytes
        ),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.tick_rate == 0 {
        bail!("tick rate must be positive");
    }

    let config = MxConfig {
        bind: args.bind,
        realtime_port: args.realtime_port,
        reliable_port: args.reliable_port,
        packet_loss: PacketLossSimulation::with_loss(args.loss_percent),
        ..Default::default()
    };

    let mut dispatcher = Dispatcher::bind(config).context("failed to bind sockets")?;
    info!("listening on {}", dispatcher.local_endpoint()?);

    let target = args.connect.as_deref().map(parse_endpoint).transpose()?;
    if let Some(endpoint) = target {
        dispatcher.connect(endpoint)?;
        if let Some(len) = args.send_bytes {
            let message: Bytes = (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into();
            dispatcher.send(&endpoint, message, true)?;
            info!("queued {} byte reliable message for {}", len, endpoint);
        }
    }

    let tick = Duration::from_secs_f64(1.0 / args.tick_rate as f64);
    let mut last_ping = Instant::now();
    let mut ping_counter: u32 = 0;

    loop {
        let started = Instant::now();
        dispatcher.update()?;

        let mut delivered = false;
        for event in dispatcher.drain_events() {
            log_event(&event);
            if matches!(
                event.kind,
                PeerEventKind::MessageAcknowledged {
                    channel: Channel::Reliable,
                    ..
                }
            ) {
                delivered = true;
            }
        }

        if delivered && !args.ping && args.send_bytes.is_some() {
            info!("reliable message delivered, exiting");
            dispatcher.close()?;
            return Ok(());
        }

        if args.ping && last_ping.elapsed() >= Duration::from_secs(1) {
            last_ping = Instant::now();
            let connected: Vec<DualEndpoint> = dispatcher
                .peers()
                .filter(|peer| peer.state == PeerState::Connected)
                .map(|peer| peer.endpoint)
                .collect();
            if !connected.is_empty() {
                ping_counter = ping_counter.wrapping_add(1);
                let payload = Bytes::from(format!("ping {}", ping_counter));
                dispatcher.send_to_group(&connected, payload, false)?;
            }
        }

        if let Some(remaining) = tick.checked_sub(started.elapsed()) {
            thread::sleep(remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_ipv4_endpoint() {
        let endpoint = parse_endpoint("127.0.0.1:27020:27021").unwrap();
        assert_eq!(endpoint.realtime, Some("127.0.0.1:27020".parse().unwrap()));
        assert_eq!(endpoint.reliable, Some("127.0.0.1:27021".parse().unwrap()));
    }

    #[test]
    fn test_parses_ipv6_endpoint() {
        let endpoint = parse_endpoint("[::1]:5000:5001").unwrap();
        assert_eq!(endpoint.realtime, Some("[::1]:5000".parse().unwrap()));
    }

    #[test]
    fn test_rejects_malformed_endpoint() {
        assert!(parse_endpoint("127.0.0.1:27020").is_err());
        assert!(parse_endpoint("127.0.0.1:x:27021").is_err());
    }
}
