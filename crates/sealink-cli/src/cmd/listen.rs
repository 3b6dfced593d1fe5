//! `sealink listen`: accept connections, log packets, answer pings.

use sealink_wire::{
    AppPacket, ChannelHandler, ConnectionEventKind, Event, Listener, PacketEventKind, WireConfig,
};
use tracing::{info, warn};

pub fn cmd_listen(config: WireConfig) {
    let rt = super::runtime();
    rt.block_on(async move {
        let (handler, mut events) = ChannelHandler::<AppPacket>::new();
        let listener = Listener::bind(&config, handler).unwrap_or_else(|e| {
            eprintln!("Failed to listen on {}: {e}", config.listen_addr);
            std::process::exit(1);
        });

        println!(
            "Listening on {} ({}). Press Ctrl+C to stop.",
            listener.local_addr(),
            config.security
        );

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        loop {
            tokio::select! {
                _ = &mut ctrl_c => break,
                event = events.recv() => match event {
                    Some(event) => on_event(event),
                    None => break,
                },
            }
        }

        listener.shutdown();
        println!("Stopped.");
    });
}

fn on_event(event: Event<AppPacket>) {
    match event {
        Event::Connection(e) => {
            let conn = e.connection();
            match e.kind() {
                ConnectionEventKind::Connected => {
                    info!(conn = %conn.id(), peer = %conn.peer_addr(), "Peer connected")
                }
                ConnectionEventKind::Disconnected => {
                    info!(conn = %conn.id(), peer = %conn.peer_addr(), "Peer disconnected")
                }
            }
        }
        Event::Packet(e) if e.kind() == PacketEventKind::Received => {
            let packet = e.message();
            println!("{} {} {}", e.connection().peer_addr(), packet.kind, packet.body);
            if packet.kind == "ping" {
                let pong = AppPacket::new("pong").with_body(packet.body.clone()).sign();
                if let Err(err) = e.connection().send(pong) {
                    warn!(peer = %e.connection().peer_addr(), error = %err, "Failed to answer ping");
                }
            }
        }
        Event::Packet(_) => {}
    }
}
