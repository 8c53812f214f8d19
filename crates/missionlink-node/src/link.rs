//! UDP ソケットの薄いラッパー
//!
//! 送信時にヘッダーのタイムスタンプを打ち、受信時に不正なデータグラムを捨てる。
//! 送信失敗はパケットロスと同じ扱いで、再送は状態機械のタイマーに任せる。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use missionlink_proto::Message;
use missionlink_transport::Packet;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::clock;
use crate::error::Result;

#[derive(Clone)]
pub struct Link {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
}

impl Link {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local = socket.local_addr()?;
        debug!(%local, "socket bound");
        Ok(Link {
            socket: Arc::new(socket),
            local,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// 1 メッセージを送る
    ///
    /// # 戻り値
    /// 送信できたか
    pub async fn send(&self, mut message: Message, peer: SocketAddr) -> bool {
        message.header.timestamp_ms = clock::now_ms() as i64;
        let kind = message.kind();
        let seq = message.seq();
        let bytes = match Packet::new(peer, message).to_datagram() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%peer, ?kind, seq, error = %e, "message not sendable");
                return false;
            }
        };
        match self.socket.send_to(&bytes, peer).await {
            Ok(_) => true,
            Err(e) => {
                warn!(%peer, ?kind, seq, error = %e, "send failed");
                false
            }
        }
    }

    /// 順に送る。`gap` があれば各送信の間に挟む
    pub async fn send_all(&self, messages: Vec<Message>, peer: SocketAddr, gap: Option<Duration>) {
        let count = messages.len();
        for (i, message) in messages.into_iter().enumerate() {
            self.send(message, peer).await;
            if let Some(gap) = gap {
                if i + 1 < count {
                    tokio::time::sleep(gap).await;
                }
            }
        }
    }

    /// 1 データグラムを受け取る
    ///
    /// # 戻り値
    /// 不正なデータグラムは `Ok(None)`
    pub async fn recv(&self, buf: &mut [u8]) -> Result<Option<Packet>> {
        let (len, peer) = self.socket.recv_from(buf).await?;
        match Packet::from_datagram(&buf[..len], peer) {
            Ok(packet) => Ok(Some(packet)),
            Err(e) => {
                debug!(%peer, len, error = %e, "malformed datagram dropped");
                Ok(None)
            }
        }
    }
}
