use anyhow::{Context, bail};
use bytes::{BufMut, Bytes, BytesMut};
use clap::Parser;
use peerly_service::{
    MAGIC_COOKIE,
    config::RelayConfig,
    events::{ClientEvent, PacketInfo, PortRange, RemoteHint, SocketType},
    manager::SocketManager,
    stun,
};
use props_util::Properties;
use std::{net::SocketAddr, time::Duration};
use tokio::{sync::mpsc, time::timeout};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub fn setup_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::filter::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Opens a relay socket, runs a STUN binding exchange with `server` and then sends it plain data.
#[derive(Parser, Debug)]
struct ProbeArgs {
    #[arg(long)]
    server: SocketAddr,
    #[arg(long, default_value = "0.0.0.0:0")]
    local: SocketAddr,
    #[arg(long, default_value_t = 0)]
    min_port: u16,
    #[arg(long, default_value_t = 0)]
    max_port: u16,
    #[arg(long)]
    config: Option<String>,
    #[arg(long, default_value_t = 5)]
    wait_secs: u64,
}

fn binding_request() -> Bytes {
    let mut msg = BytesMut::with_capacity(20);
    msg.put_u16(0x0001);
    msg.put_u16(0);
    msg.put_u32(MAGIC_COOKIE);
    msg.put_slice(&rand::random::<[u8; 12]>());
    msg.freeze()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();

    let args = ProbeArgs::parse();
    let config = match &args.config {
        Some(path) => RelayConfig::from_file(path).with_context(|| format!("Unable to load config : {path}"))?,
        None => RelayConfig::default()?,
    };
    tracing::info!("Relay Config : {:?}", config);

    let wait = Duration::from_secs(args.wait_secs);
    let manager = SocketManager::udp(config);
    let (client, mut events) = mpsc::unbounded_channel();
    let remote = RemoteHint {
        hostname: None,
        addr: Some(args.server),
    };

    let socket = manager
        .create_socket(SocketType::Udp, args.local, PortRange::new(args.min_port, args.max_port), remote, client)
        .context("Unable to create socket")?;

    let mut next_packet_id = 0;
    let mut info = || {
        next_packet_id += 1;
        PacketInfo {
            destination: args.server,
            packet_options: Default::default(),
            packet_id: next_packet_id,
        }
    };

    socket.send(binding_request(), info())?;

    let mut sent_data = false;
    loop {
        let event = match timeout(wait, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => bail!("socket closed"),
            Err(_) => bail!("no answer from {} after {:?}", args.server, wait),
        };

        match event {
            ClientEvent::SocketCreated { local, remote } => tracing::info!(%local, ?remote, "socket created"),
            ClientEvent::SendComplete(metrics) => {
                tracing::info!(packet_id = metrics.packet_id, "send complete");
                if sent_data {
                    break;
                }
            }
            ClientEvent::DataReceived { from, data, .. } => {
                tracing::info!(%from, len = data.len(), msg_type = ?stun::sniff(&data), "data received");
                if !sent_data {
                    // The server answered the binding request, plain data may flow now.
                    socket.send(Bytes::from_static(b"peerly probe"), info())?;
                    sent_data = true;
                }
            }
            ClientEvent::ConnectionError => bail!("connection error"),
        }
    }

    socket.close();
    manager.shutdown();
    Ok(())
}
