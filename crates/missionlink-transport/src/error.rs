//! missionlink-transport エラー型

use missionlink_proto::ProtoError;

/// 分割・再組み立て・データグラム変換のエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// フラグメントサイズがフィールドのメタデータすら収められない
    #[error("Fragment size {max} cannot hold field '{field}' ({overhead} bytes of metadata)")]
    FragmentSizeTooSmall {
        field: String,
        max: usize,
        overhead: usize,
    },

    /// パート数が u16 に収まらない
    #[error("Field '{field}' would need {parts} parts")]
    TooManyParts { field: String, parts: usize },

    /// パートの欠落、またはパート総数の不一致
    #[error("Incomplete field '{name}': {received}/{expected} parts")]
    IncompleteField {
        name: String,
        received: usize,
        expected: usize,
    },

    #[error("Datagram of {len} bytes exceeds the {max} byte limit")]
    DatagramTooLarge { len: usize, max: usize },

    #[error(transparent)]
    Proto(#[from] ProtoError),
}
