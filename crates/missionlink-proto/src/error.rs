//! missionlink-proto エラー型

use crate::message::MessageKind;

/// ワイヤメッセージ・フィールドのデコードエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtoError {
    /// データグラムまたはフィールドが途中で切れている
    #[error("Buffer too short: needed {needed} bytes, {remaining} remaining")]
    TooShort { needed: usize, remaining: usize },

    /// プロトコルバージョンの不一致
    #[error("Unsupported protocol version: {0} (expected {expected})", expected = crate::MISSIONLINK_PROTOCOL_VERSION)]
    UnsupportedVersion(u8),

    #[error("Unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("Unknown payload tag: {0}")]
    UnknownPayloadTag(u8),

    /// メッセージ種別とペイロードの組み合わせが不正
    #[error("Payload '{payload}' is not valid for message kind {kind:?}")]
    PayloadMismatch {
        kind: MessageKind,
        payload: &'static str,
    },

    /// フィールドの欠落・長さ不一致・不正な値
    #[error("Malformed field '{name}': {reason}")]
    MalformedField { name: String, reason: &'static str },

    /// 分割されたフィールドのパートが揃っていない
    #[error("Incomplete field '{name}': {received}/{expected} parts")]
    IncompleteField {
        name: String,
        received: usize,
        expected: usize,
    },
}

impl ProtoError {
    pub(crate) fn malformed(name: &str, reason: &'static str) -> Self {
        ProtoError::MalformedField {
            name: name.to_string(),
            reason,
        }
    }
}
