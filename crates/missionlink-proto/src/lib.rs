//! # missionlink-proto
//!
//! MissionLink のワイヤメッセージとフィールドコーデック。
//!
//! ## メッセージの役割
//!
//! 1 データグラムは 1 メッセージ。固定長ヘッダーに以下を持つ：
//! - `kind`: Hello / Response / Mission / Ack / Progress / Completed / Error
//! - `sender` / `receiver`: ノード ID（コーディネーターは 0）
//! - `mission_id`: 対象ミッション
//! - `seq`: メッセージ番号（Hello は 1、ミッションフラグメントは 2 から）
//! - `total_fragments`: ミッション転送時のフラグメント総数
//!
//! ペイロードは「名前付きフィールド」の列として表現される。
//! 大きなミッションはフィールド単位で分割され（`missionlink-transport`）、
//! 受信側で名前をキーに再組み立てされる。
//!
//! ## プロトコルバージョン
//!
//! 現行バージョンは 1 (MISSIONLINK_PROTOCOL_VERSION)。

pub mod error;
pub mod field;
pub mod message;
pub mod payload;

pub use error::ProtoError;
pub use field::{decode_fields, encode_fields, fields_encoded_len, Field, FieldMap, FieldWriter};
pub use message::{Header, Message, MessageKind, Payload};
pub use payload::{AckPayload, ErrorCode, ErrorPayload, FieldSchema, MissionPayload, ProgressPayload};

/// MissionLink プロトコルバージョン
pub const MISSIONLINK_PROTOCOL_VERSION: u8 = 1;

/// コーディネーターのノード ID
pub const COORDINATOR_ID: i32 = 0;
