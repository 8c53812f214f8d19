//! ワイヤメッセージ
//!
//! ## Datagram の Wire Format
//! ```text
//! [version: u8][kind: u8][sender: i32][receiver: i32][mission: i32]
//! [seq: i32][total_fragments: i32][success: u8][timestamp_ms: i64]
//! [payload_tag: u8][payload body...]
//! ```
//!
//! payload body はタグに応じて以下のいずれか：
//! - Empty: なし
//! - Mission / Progress / Ack / Error: 分割されていない Field 列
//! - Fragment: ミッションの部分 Field 列（受信側で再組み立て）

use bytes::{Buf, BufMut};

use crate::error::ProtoError;
use crate::field::{decode_fields, encode_fields, FieldMap};
use crate::payload::{AckPayload, ErrorPayload, FieldSchema, MissionPayload, ProgressPayload};
use crate::MISSIONLINK_PROTOCOL_VERSION;

/// メッセージ種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Hello = 1,
    Response = 2,
    Mission = 3,
    Ack = 4,
    Progress = 5,
    Completed = 6,
    /// 別チャネル用（データグラムでは受け付けない）
    Telemetry = 7,
    Error = 8,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Result<Self, ProtoError> {
        Ok(match value {
            1 => MessageKind::Hello,
            2 => MessageKind::Response,
            3 => MessageKind::Mission,
            4 => MessageKind::Ack,
            5 => MessageKind::Progress,
            6 => MessageKind::Completed,
            7 => MessageKind::Telemetry,
            8 => MessageKind::Error,
            other => return Err(ProtoError::UnknownKind(other)),
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// ローバーが確実配送する報告か
    pub fn is_report(self) -> bool {
        matches!(self, MessageKind::Progress | MessageKind::Completed | MessageKind::Error)
    }

    /// ミッションを終わらせる報告か
    pub fn is_terminal_report(self) -> bool {
        matches!(self, MessageKind::Completed | MessageKind::Error)
    }

    fn accepts(self, payload: &Payload) -> bool {
        match self {
            MessageKind::Hello | MessageKind::Response | MessageKind::Completed => {
                matches!(payload, Payload::Empty)
            }
            MessageKind::Mission => matches!(payload, Payload::Mission(_) | Payload::Fragment(_)),
            MessageKind::Ack => matches!(payload, Payload::Ack(_) | Payload::Empty),
            MessageKind::Progress => matches!(payload, Payload::Progress(_)),
            MessageKind::Error => matches!(payload, Payload::Error(_)),
            MessageKind::Telemetry => false,
        }
    }
}

/// メッセージヘッダー（固定長）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageKind,
    pub sender: i32,
    pub receiver: i32,
    pub mission_id: i32,
    pub seq: i32,
    /// ミッション転送時のフラグメント総数（それ以外は 1）
    pub total_fragments: i32,
    pub success: bool,
    /// 送信時刻（UNIX ミリ秒、リンク層が送信直前に設定する）
    pub timestamp_ms: i64,
}

impl Header {
    /// version から payload_tag までの長さ
    pub const LEN: usize = 1 + 1 + 4 * 5 + 1 + 8 + 1;

    pub fn new(kind: MessageKind, sender: i32, receiver: i32, mission_id: i32) -> Self {
        Header {
            kind,
            sender,
            receiver,
            mission_id,
            seq: 0,
            total_fragments: 1,
            success: false,
            timestamp_ms: 0,
        }
    }

    pub fn with_seq(mut self, seq: i32) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_total_fragments(mut self, total: i32) -> Self {
        self.total_fragments = total;
        self
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }
}

/// メッセージ本体
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    Mission(MissionPayload),
    Progress(ProgressPayload),
    Ack(AckPayload),
    Error(ErrorPayload),
    /// 分割されたミッションの Field 列（エンコード済み）
    Fragment(Vec<u8>),
}

impl Payload {
    const TAG_EMPTY: u8 = 0;
    const TAG_MISSION: u8 = 1;
    const TAG_PROGRESS: u8 = 2;
    const TAG_ACK: u8 = 3;
    const TAG_ERROR: u8 = 4;
    const TAG_FRAGMENT: u8 = 5;

    pub fn name(&self) -> &'static str {
        match self {
            Payload::Empty => "empty",
            Payload::Mission(_) => MissionPayload::NAME,
            Payload::Progress(_) => ProgressPayload::NAME,
            Payload::Ack(_) => AckPayload::NAME,
            Payload::Error(_) => ErrorPayload::NAME,
            Payload::Fragment(_) => "fragment",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Payload::Empty => Self::TAG_EMPTY,
            Payload::Mission(_) => Self::TAG_MISSION,
            Payload::Progress(_) => Self::TAG_PROGRESS,
            Payload::Ack(_) => Self::TAG_ACK,
            Payload::Error(_) => Self::TAG_ERROR,
            Payload::Fragment(_) => Self::TAG_FRAGMENT,
        }
    }

    fn encode_body(&self, buf: &mut Vec<u8>) {
        match self {
            Payload::Empty => {}
            Payload::Mission(p) => buf.extend_from_slice(&encode_fields(&p.to_fields())),
            Payload::Progress(p) => buf.extend_from_slice(&encode_fields(&p.to_fields())),
            Payload::Ack(p) => buf.extend_from_slice(&encode_fields(&p.to_fields())),
            Payload::Error(p) => buf.extend_from_slice(&encode_fields(&p.to_fields())),
            Payload::Fragment(bytes) => buf.extend_from_slice(bytes),
        }
    }

    fn decode_body(tag: u8, body: &[u8]) -> Result<Self, ProtoError> {
        Ok(match tag {
            Self::TAG_EMPTY => Payload::Empty,
            Self::TAG_MISSION => Payload::Mission(decode_schema(body)?),
            Self::TAG_PROGRESS => Payload::Progress(decode_schema(body)?),
            Self::TAG_ACK => Payload::Ack(decode_schema(body)?),
            Self::TAG_ERROR => Payload::Error(decode_schema(body)?),
            Self::TAG_FRAGMENT => Payload::Fragment(body.to_vec()),
            other => return Err(ProtoError::UnknownPayloadTag(other)),
        })
    }
}

fn decode_schema<T: FieldSchema>(body: &[u8]) -> Result<T, ProtoError> {
    let fields = FieldMap::from_whole_fields(decode_fields(body)?)?;
    T::from_fields(&fields)
}

/// 1 データグラム = 1 メッセージ
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub payload: Payload,
}

impl Message {
    pub fn new(header: Header, payload: Payload) -> Self {
        Message { header, payload }
    }

    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    pub fn seq(&self) -> i32 {
        self.header.seq
    }

    /// データグラムのバイト列にエンコードする
    pub fn encode(&self) -> Vec<u8> {
        let h = &self.header;
        let mut buf = Vec::with_capacity(Header::LEN + 64);
        buf.put_u8(MISSIONLINK_PROTOCOL_VERSION);
        buf.put_u8(h.kind.as_u8());
        buf.put_i32(h.sender);
        buf.put_i32(h.receiver);
        buf.put_i32(h.mission_id);
        buf.put_i32(h.seq);
        buf.put_i32(h.total_fragments);
        buf.put_u8(u8::from(h.success));
        buf.put_i64(h.timestamp_ms);
        buf.put_u8(self.payload.tag());
        self.payload.encode_body(&mut buf);
        buf
    }

    /// データグラムのバイト列からデコードする
    ///
    /// # エラー
    /// - `TooShort`: ヘッダーに満たない
    /// - `UnsupportedVersion`: バージョン不一致
    /// - `UnknownKind` / `UnknownPayloadTag`: 未知の識別子
    /// - `PayloadMismatch`: 種別とペイロードの組み合わせが不正
    /// - `MalformedField`: ペイロードの Field が壊れている
    pub fn decode(mut bytes: &[u8]) -> Result<Self, ProtoError> {
        if bytes.len() < Header::LEN {
            return Err(ProtoError::TooShort {
                needed: Header::LEN,
                remaining: bytes.len(),
            });
        }

        let version = bytes.get_u8();
        if version != MISSIONLINK_PROTOCOL_VERSION {
            return Err(ProtoError::UnsupportedVersion(version));
        }

        let kind = MessageKind::from_u8(bytes.get_u8())?;
        let header = Header {
            kind,
            sender: bytes.get_i32(),
            receiver: bytes.get_i32(),
            mission_id: bytes.get_i32(),
            seq: bytes.get_i32(),
            total_fragments: bytes.get_i32(),
            success: bytes.get_u8() != 0,
            timestamp_ms: bytes.get_i64(),
        };
        let tag = bytes.get_u8();
        let payload = Payload::decode_body(tag, bytes)?;

        if !kind.accepts(&payload) {
            return Err(ProtoError::PayloadMismatch {
                kind,
                payload: payload.name(),
            });
        }

        Ok(Message { header, payload })
    }
}
