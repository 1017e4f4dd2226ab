//! Version/VerAck exchange that turns a raw connection into a peer link.
//!
//! Client: send Version, read Version, send VerAck.
//! Server: read Version, send Version, read VerAck.
//!
//! `HandshakeFaults` lets probe scenarios stop either side part way through,
//! send the wrong opening message, or stall before the first send.

use crate::error::HandshakeError;
use crate::network::message::{Message, PeerInfo};
use crate::network::transport::Connection;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopLevel {
    #[default]
    Normal,
    StopClientAfterSendVersion,
    StopClientAfterReceiveVersion,
    StopClientAfterSendAck,
    StopServerAfterSendVersion,
    StopServerAfterReceiveVersion,
    StopServerAfterReadAck,
}

impl StopLevel {
    fn as_str(&self) -> &'static str {
        match self {
            StopLevel::Normal => "normal",
            StopLevel::StopClientAfterSendVersion => "client after send version",
            StopLevel::StopClientAfterReceiveVersion => "client after receive version",
            StopLevel::StopClientAfterSendAck => "client after send ack",
            StopLevel::StopServerAfterSendVersion => "server after send version",
            StopLevel::StopServerAfterReceiveVersion => "server after receive version",
            StopLevel::StopServerAfterReadAck => "server after read ack",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeFaults {
    pub stop_level: StopLevel,
    /// Client opens with a Ping instead of Version.
    pub wrong_msg: bool,
    pub client_delay: Duration,
    pub server_delay: Duration,
}

impl HandshakeFaults {
    fn check(&self, level: StopLevel) -> Result<(), HandshakeError> {
        if self.stop_level == level {
            debug!("handshake stopped at {}", level.as_str());
            return Err(HandshakeError::Injected(level.as_str()));
        }
        Ok(())
    }
}

pub async fn handshake_client(
    local: &PeerInfo,
    conn: &mut Connection,
    faults: &HandshakeFaults,
    timeout: Duration,
) -> Result<PeerInfo, HandshakeError> {
    tokio::time::timeout(timeout, client_exchange(local, conn, faults))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

pub async fn handshake_server(
    local: &PeerInfo,
    conn: &mut Connection,
    faults: &HandshakeFaults,
    timeout: Duration,
) -> Result<PeerInfo, HandshakeError> {
    tokio::time::timeout(timeout, server_exchange(local, conn, faults))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

async fn client_exchange(
    local: &PeerInfo,
    conn: &mut Connection,
    faults: &HandshakeFaults,
) -> Result<PeerInfo, HandshakeError> {
    if !faults.client_delay.is_zero() {
        tokio::time::sleep(faults.client_delay).await;
    }

    let opening = if faults.wrong_msg {
        Message::Ping {
            height: local.height(),
        }
    } else {
        Message::Version(local.to_version())
    };
    conn.send(&opening).await?;
    faults.check(StopLevel::StopClientAfterSendVersion)?;

    let version = match recv(conn).await? {
        Message::Version(payload) => payload,
        other => {
            return Err(HandshakeError::UnexpectedMessage {
                expected: "version",
                got: other.message_type(),
            })
        }
    };
    faults.check(StopLevel::StopClientAfterReceiveVersion)?;

    conn.send(&Message::VerAck).await?;
    faults.check(StopLevel::StopClientAfterSendAck)?;

    Ok(PeerInfo::from_version(&version, &conn.remote_addr))
}

async fn server_exchange(
    local: &PeerInfo,
    conn: &mut Connection,
    faults: &HandshakeFaults,
) -> Result<PeerInfo, HandshakeError> {
    let version = match recv(conn).await? {
        Message::Version(payload) => payload,
        other => {
            return Err(HandshakeError::UnexpectedMessage {
                expected: "version",
                got: other.message_type(),
            })
        }
    };
    faults.check(StopLevel::StopServerAfterReceiveVersion)?;

    if !faults.server_delay.is_zero() {
        tokio::time::sleep(faults.server_delay).await;
    }
    conn.send(&Message::Version(local.to_version())).await?;
    faults.check(StopLevel::StopServerAfterSendVersion)?;

    match recv(conn).await? {
        Message::VerAck => {}
        other => {
            return Err(HandshakeError::UnexpectedMessage {
                expected: "verack",
                got: other.message_type(),
            })
        }
    }
    faults.check(StopLevel::StopServerAfterReadAck)?;

    Ok(PeerInfo::from_version(&version, &conn.remote_addr))
}

async fn recv(conn: &mut Connection) -> Result<Message, HandshakeError> {
    conn.recv().await?.ok_or(HandshakeError::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer_id::PeerId;
    use crate::network::transport::{Dialer, Listener};
    use crate::network::virtual_net::VirtualNetwork;

    fn local_info(port: u16) -> PeerInfo {
        PeerInfo::new(PeerId::random(), String::new(), port, 0, 9, "test".into())
    }

    async fn pair() -> (Connection, Connection) {
        let net = VirtualNetwork::new();
        let (addr, listener) = net.new_listener(PeerId::random());
        let client = net.new_dialer(PeerId::random()).dial(&addr).await.unwrap();
        let server = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_handshake_exchanges_infos() {
        let (mut client, mut server) = pair().await;
        let client_info = local_info(1000);
        let server_info = local_info(2000);
        let timeout = Duration::from_secs(5);
        let faults = HandshakeFaults::default();
        let client_addr = server.remote_addr.clone();

        let server_task = {
            let faults = faults.clone();
            tokio::spawn(async move {
                let info = handshake_server(&server_info, &mut server, &faults, timeout).await;
                (info, server_info.id)
            })
        };
        let seen_by_client = handshake_client(&client_info, &mut client, &faults, timeout)
            .await
            .unwrap();
        let (seen_by_server, server_id) = server_task.await.unwrap();
        let seen_by_server = seen_by_server.unwrap();

        assert_eq!(seen_by_client.id, server_id);
        assert_eq!(seen_by_client.port, 2000);
        assert_eq!(seen_by_server.id, client_info.id);
        assert_eq!(seen_by_server.height(), 9);
        assert_eq!(seen_by_server.addr, client_addr);
    }

    #[tokio::test]
    async fn test_wrong_opening_message_rejected() {
        let (mut client, mut server) = pair().await;
        let timeout = Duration::from_secs(5);
        let faults = HandshakeFaults {
            wrong_msg: true,
            ..Default::default()
        };

        let info = local_info(1);
        let client_task = tokio::spawn(async move {
            let _ = handshake_client(&info, &mut client, &faults, timeout).await;
        });
        let result =
            handshake_server(&local_info(2), &mut server, &HandshakeFaults::default(), timeout)
                .await;
        assert!(matches!(
            result,
            Err(HandshakeError::UnexpectedMessage { got: "ping", .. })
        ));
        client_task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_times_out() {
        let (mut client, _server) = pair().await;
        let result = handshake_client(
            &local_info(1),
            &mut client,
            &HandshakeFaults::default(),
            Duration::from_secs(3),
        )
        .await;
        assert!(matches!(result, Err(HandshakeError::Timeout)));
    }

    #[tokio::test]
    async fn test_client_stop_level() {
        let (mut client, _server) = pair().await;
        let faults = HandshakeFaults {
            stop_level: StopLevel::StopClientAfterSendVersion,
            ..Default::default()
        };
        let result =
            handshake_client(&local_info(1), &mut client, &faults, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(HandshakeError::Injected(_))));
    }
}
