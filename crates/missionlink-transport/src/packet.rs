//! UDP パケット構造
//!
//! 送受信されるデータグラムと、その相手アドレスの組。
//!
//! ## Wire Format
//! ```text
//! [Message (missionlink-proto)]
//! ```
//! 1 データグラムに 1 メッセージ。結合や分割は行わない。

use std::net::SocketAddr;

use missionlink_proto::Message;

use crate::error::TransportError;

/// IPv4 UDP ペイロードの最大長
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// 相手アドレス付きのメッセージ
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// 受信時は送信元、送信時は宛先
    pub peer: SocketAddr,
    pub message: Message,
}

impl Packet {
    pub fn new(peer: SocketAddr, message: Message) -> Self {
        Packet { peer, message }
    }

    /// 受信したデータグラムをパースする
    ///
    /// # エラー
    /// - `TransportError::Proto`: メッセージとして不正
    pub fn from_datagram(bytes: &[u8], peer: SocketAddr) -> Result<Self, TransportError> {
        Ok(Packet {
            peer,
            message: Message::decode(bytes)?,
        })
    }

    /// UDP に送信する生バイト列を返す
    ///
    /// # エラー
    /// - `TransportError::DatagramTooLarge`: データグラムの上限を超える
    pub fn to_datagram(&self) -> Result<Vec<u8>, TransportError> {
        let bytes = self.message.encode();
        if bytes.len() > MAX_DATAGRAM_LEN {
            return Err(TransportError::DatagramTooLarge {
                len: bytes.len(),
                max: MAX_DATAGRAM_LEN,
            });
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use missionlink_proto::{Header, MessageKind, Payload, ProtoError};

    fn peer() -> SocketAddr {
        "127.0.0.1:9011".parse().unwrap()
    }

    #[test]
    fn test_packet_roundtrip() {
        let packet = Packet::new(
            peer(),
            Message::new(Header::new(MessageKind::Hello, 0, 1, 4).with_seq(1), Payload::Empty),
        );
        let bytes = packet.to_datagram().unwrap();
        assert_eq!(Packet::from_datagram(&bytes, peer()).unwrap(), packet);
    }

    #[test]
    fn test_garbage_datagram_rejected() {
        let result = Packet::from_datagram(&[0xff; 4], peer());
        assert!(matches!(
            result,
            Err(TransportError::Proto(ProtoError::TooShort { .. }))
        ));
    }

    #[test]
    fn test_oversized_datagram_rejected() {
        let packet = Packet::new(
            peer(),
            Message::new(
                Header::new(MessageKind::Mission, 0, 1, 4).with_seq(2),
                Payload::Fragment(vec![0; MAX_DATAGRAM_LEN]),
            ),
        );
        assert!(matches!(
            packet.to_datagram(),
            Err(TransportError::DatagramTooLarge { .. })
        ));
    }
}
