//! `sealink connect`: open a connection, send packets, print replies.

use sealink_wire::{
    AppPacket, ChannelHandler, Connection, ConnectionEventKind, Event, PacketEventKind, WireConfig,
    WireError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::warn;

pub struct ConnectArgs {
    pub addr: SocketAddr,
    pub kind: String,
    pub body: Option<String>,
    pub count: u32,
    pub wait: Duration,
}

pub fn cmd_connect(config: WireConfig, args: ConnectArgs) {
    let body = parse_body(args.body.as_deref()).unwrap_or_else(|e| {
        eprintln!("Invalid --body JSON: {e}");
        std::process::exit(1);
    });

    // Dialing and key generation block; keep them off the runtime thread.
    let (conn, mut events) = open_connection(args.addr, &config).unwrap_or_else(|e| {
        eprintln!("Failed to connect to {}: {e}", args.addr);
        std::process::exit(1);
    });

    let rt = super::runtime();
    rt.block_on(async move {
        if !wait_connected(&mut events, args.wait).await {
            eprintln!(
                "Handshake with {} did not complete within {:?}",
                args.addr, args.wait
            );
            conn.disconnect();
            std::process::exit(1);
        }

        for _ in 0..args.count {
            let packet = AppPacket::new(args.kind.as_str())
                .with_body(body.clone())
                .sign();
            if let Err(e) = conn.send(packet) {
                eprintln!("Send failed: {e}");
                conn.disconnect();
                std::process::exit(1);
            }
        }

        let mut replies = 0;
        while replies < args.count {
            match tokio::time::timeout(args.wait, events.recv()).await {
                Ok(Some(Event::Packet(e))) if e.kind() == PacketEventKind::Received => {
                    replies += 1;
                    match serde_json::to_string(e.message()) {
                        Ok(line) => println!("{line}"),
                        Err(err) => warn!(error = %err, "Unprintable reply"),
                    }
                }
                Ok(Some(Event::Connection(e))) if e.kind() == ConnectionEventKind::Disconnected => {
                    eprintln!("Peer closed the connection");
                    break;
                }
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
        if replies < args.count {
            warn!(sent = args.count, received = replies, "Fewer replies than packets sent");
        }

        conn.disconnect();
    });
}

type Events = UnboundedReceiver<Event<AppPacket>>;

fn open_connection(
    addr: SocketAddr,
    config: &WireConfig,
) -> Result<(Arc<Connection<AppPacket>>, Events), WireError> {
    let (handler, events) = ChannelHandler::<AppPacket>::new();
    let conn = Connection::open(addr, config, handler)?;
    Ok((conn, events))
}

fn parse_body(raw: Option<&str>) -> Result<serde_json::Value, serde_json::Error> {
    match raw {
        Some(raw) => serde_json::from_str(raw),
        None => Ok(serde_json::Value::Null),
    }
}

/// Wait for `Connected`. False on `Disconnected`, a closed channel or timeout.
async fn wait_connected(events: &mut Events, wait: Duration) -> bool {
    let outcome = tokio::time::timeout(wait, async {
        while let Some(event) = events.recv().await {
            if let Event::Connection(e) = event {
                return e.kind() == ConnectionEventKind::Connected;
            }
        }
        false
    })
    .await;
    outcome.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealink_wire::SecurityMode;
    use serde_json::json;

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body(None).unwrap(), serde_json::Value::Null);
        assert_eq!(parse_body(Some(r#"{"n": 1}"#)).unwrap(), json!({"n": 1}));
        assert!(parse_body(Some("{broken")).is_err());
    }

    #[test]
    fn test_open_outside_runtime() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = WireConfig {
            security: SecurityMode::Plaintext,
            ..WireConfig::default()
        };
        let (conn, mut events) = open_connection(listener.local_addr().unwrap(), &config).unwrap();
        assert!(conn.is_ready());
        assert!(matches!(
            events.try_recv(),
            Ok(Event::Connection(e)) if e.kind() == ConnectionEventKind::Connected
        ));
        conn.disconnect();
    }

    #[test]
    fn test_open_refused_is_an_error() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        assert!(open_connection(addr, &WireConfig::default()).is_err());
    }
}
