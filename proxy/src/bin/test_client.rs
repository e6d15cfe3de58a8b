//! Scripted RakNet client for exercising a running proxy by hand.

use bytes::Bytes;
use clap::Parser;
use protocol::{frame, Packet, Reliability, RAKNET_PROTOCOL_VERSION};
use proxy::reliability::ReliabilityLayer;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Proxy address
    #[clap(short, long, default_value = "127.0.0.1:19132")]
    server: SocketAddr,
    /// MTU to request during the handshake
    #[clap(short, long, default_value = "1400")]
    mtu: u16,
}

const CLIENT_GUID: u64 = 0x0123_4567_89ab_cdef;

async fn request(
    socket: &UdpSocket,
    server: SocketAddr,
    packet: &Packet,
) -> Result<Packet, Box<dyn std::error::Error>> {
    socket.send_to(&packet.encode()?, server).await?;
    let mut buffer = [0u8; 2048];
    let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buffer)).await??;
    Ok(Packet::decode(&buffer[..len])?)
}

/// Flushes queued frames, then collects whatever arrives within `wait`.
async fn exchange(
    socket: &UdpSocket,
    server: SocketAddr,
    layer: &mut ReliabilityLayer,
    wait: Duration,
) -> Result<Vec<Packet>, Box<dyn std::error::Error>> {
    layer.flush(Instant::now());
    for datagram in layer.drain_outgoing() {
        socket.send_to(&datagram, server).await?;
    }

    let mut received = Vec::new();
    let mut buffer = [0u8; 2048];
    let deadline = tokio::time::Instant::now() + wait;
    while let Ok(result) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buffer)).await {
        let (len, _) = result?;
        let datagram = &buffer[..len];
        match datagram.first().copied() {
            Some(id) if frame::is_frame_set(id) => {
                for payload in layer.handle_frame_set(datagram, Instant::now())? {
                    received.push(Packet::decode(&payload)?);
                }
            }
            Some(id) if frame::is_ack(id) => layer.handle_ack(datagram)?,
            Some(id) if frame::is_nack(id) => layer.handle_nack(datagram)?,
            Some(_) => received.push(Packet::decode(datagram)?),
            None => {}
        }
    }

    // Acknowledge what arrived.
    layer.flush(Instant::now());
    for datagram in layer.drain_outgoing() {
        socket.send_to(&datagram, server).await?;
    }
    Ok(received)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    let pong = request(
        &socket,
        args.server,
        &Packet::UnconnectedPing {
            send_ping_time: 0,
            client_guid: CLIENT_GUID,
            open_connections_only: false,
        },
    )
    .await?;
    println!("Discovery: {:?}", pong);

    let reply_1 = request(
        &socket,
        args.server,
        &Packet::OpenConnectionRequest1 {
            protocol_version: RAKNET_PROTOCOL_VERSION,
            mtu_size: args.mtu,
        },
    )
    .await?;
    println!("Reply 1: {:?}", reply_1);

    let reply_2 = request(
        &socket,
        args.server,
        &Packet::OpenConnectionRequest2 {
            server_address: args.server,
            mtu_size: args.mtu,
            client_guid: CLIENT_GUID,
        },
    )
    .await?;
    println!("Reply 2: {:?}", reply_2);

    let mtu = match reply_2 {
        Packet::OpenConnectionReply2 { mtu_size, .. } => mtu_size,
        other => return Err(format!("unexpected reply {:?}", other).into()),
    };
    let mut layer = ReliabilityLayer::new(mtu);
    let started = Instant::now();
    let elapsed = || started.elapsed().as_millis() as u64;

    let connection_request = Packet::ConnectionRequest {
        client_guid: CLIENT_GUID,
        send_ping_time: elapsed(),
        use_security: false,
    };
    layer.send(connection_request.encode()?, Reliability::ReliableOrdered);
    for packet in exchange(&socket, args.server, &mut layer, Duration::from_millis(500)).await? {
        println!("Received: {:?}", packet);
    }

    let new_incoming = Packet::NewIncomingConnection {
        server_address: args.server,
        send_ping_time: elapsed(),
        send_pong_time: elapsed(),
    };
    layer.send(new_incoming.encode()?, Reliability::ReliableOrdered);
    layer.send(
        Packet::ConnectedPing {
            send_ping_time: elapsed(),
        }
        .encode()?,
        Reliability::Unreliable,
    );
    layer.send(
        Bytes::from_static(b"\xfehello from test client"),
        Reliability::ReliableOrdered,
    );
    for packet in exchange(&socket, args.server, &mut layer, Duration::from_secs(1)).await? {
        println!("Received: {:?}", packet);
    }

    layer.send(
        Packet::DisconnectionNotification.encode()?,
        Reliability::ReliableOrdered,
    );
    exchange(&socket, args.server, &mut layer, Duration::from_millis(200)).await?;
    println!("Disconnected");

    Ok(())
}
