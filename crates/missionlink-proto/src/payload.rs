//! ペイロードスキーマ
//!
//! 各ペイロードは固定のフィールド名集合を持つ。名前はワイヤ上の識別子であり、
//! 送受信双方で一致していなければならない。

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;
use crate::field::{Field, FieldMap, FieldWriter};

/// フィールド列との相互変換を持つペイロード
pub trait FieldSchema: Sized {
    /// ログ・エラー表示用の種別名
    const NAME: &'static str;
    /// 完全なペイロードに必要なフィールド名
    const FIELD_NAMES: &'static [&'static str];

    fn to_fields(&self) -> Vec<Field>;

    /// # エラー
    /// 必須フィールドの欠落・幅の不一致は `MalformedField`
    fn from_fields(fields: &FieldMap) -> Result<Self, ProtoError>;
}

/// ミッション仕様
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionPayload {
    pub mission_id: i32,
    /// 作業エリアの対角 2 点
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    /// タスク記述（任意長）
    pub task: String,
    pub duration_secs: i64,
    pub update_interval_secs: i64,
    /// 開始時刻（UNIX 秒）
    pub start_time: i64,
    /// 優先度 1..=5（5 が最優先）
    pub priority: i32,
}

impl MissionPayload {
    /// エリア中心座標
    pub fn area_center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

impl FieldSchema for MissionPayload {
    const NAME: &'static str = "mission";
    const FIELD_NAMES: &'static [&'static str] = &[
        "idMissao",
        "x1",
        "y1",
        "x2",
        "y2",
        "tarefa",
        "duracaoMissao",
        "intervaloAtualizacao",
        "inicioMissao",
        "prioridade",
    ];

    fn to_fields(&self) -> Vec<Field> {
        FieldWriter::new()
            .i32("idMissao", self.mission_id)
            .f32("x1", self.x1)
            .f32("y1", self.y1)
            .f32("x2", self.x2)
            .f32("y2", self.y2)
            .string("tarefa", &self.task)
            .i64("duracaoMissao", self.duration_secs)
            .i64("intervaloAtualizacao", self.update_interval_secs)
            .i64("inicioMissao", self.start_time)
            .i32("prioridade", self.priority)
            .finish()
    }

    fn from_fields(fields: &FieldMap) -> Result<Self, ProtoError> {
        Ok(MissionPayload {
            mission_id: fields.read_i32("idMissao")?,
            x1: fields.read_f32("x1")?,
            y1: fields.read_f32("y1")?,
            x2: fields.read_f32("x2")?,
            y2: fields.read_f32("y2")?,
            task: fields.read_string("tarefa")?,
            duration_secs: fields.read_i64("duracaoMissao")?,
            update_interval_secs: fields.read_i64("intervaloAtualizacao")?,
            start_time: fields.read_i64("inicioMissao")?,
            priority: fields.read_i32("prioridade")?,
        })
    }
}

/// 進捗報告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub mission_id: i32,
    pub elapsed_secs: i64,
    /// 0.0..=100.0
    pub percent: f32,
}

impl FieldSchema for ProgressPayload {
    const NAME: &'static str = "progress";
    const FIELD_NAMES: &'static [&'static str] = &["idMissao", "tempoDecorrido", "progressoPercentagem"];

    fn to_fields(&self) -> Vec<Field> {
        FieldWriter::new()
            .i32("idMissao", self.mission_id)
            .i64("tempoDecorrido", self.elapsed_secs)
            .f32("progressoPercentagem", self.percent)
            .finish()
    }

    fn from_fields(fields: &FieldMap) -> Result<Self, ProtoError> {
        Ok(ProgressPayload {
            mission_id: fields.read_i32("idMissao")?,
            elapsed_secs: fields.read_i64("tempoDecorrido")?,
            percent: fields.read_f32("progressoPercentagem")?,
        })
    }
}

/// 確認応答
///
/// `missing` が空なら対象 seq の全受信を意味する。
/// ミッション転送中はフラグメント seq、進捗報告中は欠落した報告 seq を列挙する。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub missing: Vec<i32>,
    /// 終端報告への最終確認
    pub final_ack: bool,
}

impl AckPayload {
    pub fn complete() -> Self {
        Self::default()
    }

    pub fn missing(missing: Vec<i32>) -> Self {
        AckPayload {
            missing,
            final_ack: false,
        }
    }
}

impl FieldSchema for AckPayload {
    const NAME: &'static str = "ack";
    const FIELD_NAMES: &'static [&'static str] = &["missingCount", "missing", "finalAck"];

    fn to_fields(&self) -> Vec<Field> {
        FieldWriter::new()
            .i32("missingCount", self.missing.len() as i32)
            .i32_list("missing", &self.missing)
            .bool("finalAck", self.final_ack)
            .finish()
    }

    fn from_fields(fields: &FieldMap) -> Result<Self, ProtoError> {
        let count = fields.read_i32("missingCount")?;
        let missing = fields.read_i32_list("missing")?;
        if usize::try_from(count).ok() != Some(missing.len()) {
            return Err(ProtoError::MalformedField {
                name: "missingCount".into(),
                reason: "count does not match list length",
            });
        }
        Ok(AckPayload {
            missing,
            final_ack: fields.read_bool("finalAck")?,
        })
    }
}

/// ミッション実行エラーの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    BatteryCritical,
    BatteryLow,
    Obstacle,
    Communication,
    Hardware,
    MissionTimeout,
    Unknown,
    /// 上記以外のコード。受信した値をそのまま保持する
    Other(i32),
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::BatteryCritical => 1,
            ErrorCode::BatteryLow => 2,
            ErrorCode::Obstacle => 3,
            ErrorCode::Communication => 4,
            ErrorCode::Hardware => 5,
            ErrorCode::MissionTimeout => 6,
            ErrorCode::Unknown => 99,
            ErrorCode::Other(code) => code,
        }
    }

    /// 未定義のコードは `Other` として値を残す
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => ErrorCode::BatteryCritical,
            2 => ErrorCode::BatteryLow,
            3 => ErrorCode::Obstacle,
            4 => ErrorCode::Communication,
            5 => ErrorCode::Hardware,
            6 => ErrorCode::MissionTimeout,
            99 => ErrorCode::Unknown,
            other => ErrorCode::Other(other),
        }
    }

    pub fn default_description(self) -> &'static str {
        match self {
            ErrorCode::BatteryCritical => "Critical battery (<10%)",
            ErrorCode::BatteryLow => "Low battery",
            ErrorCode::Obstacle => "Obstacle detected",
            ErrorCode::Communication => "Communication failure",
            ErrorCode::Hardware => "Hardware failure",
            ErrorCode::MissionTimeout => "Mission timed out",
            ErrorCode::Unknown | ErrorCode::Other(_) => "Unknown error",
        }
    }

    /// 既定の説明文に詳細を付け加える
    pub fn describe(self, detail: Option<&str>) -> String {
        match detail {
            Some(detail) if !detail.is_empty() => {
                format!("{} - {}", self.default_description(), detail)
            }
            _ => self.default_description().to_string(),
        }
    }
}

/// ミッション実行エラー報告（発生時点の状態スナップショット付き）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub mission_id: i32,
    pub code: ErrorCode,
    pub description: String,
    pub progress: f32,
    pub battery: f32,
    pub x: f32,
    pub y: f32,
    /// UNIX 秒
    pub timestamp: i64,
}

impl FieldSchema for ErrorPayload {
    const NAME: &'static str = "error";
    const FIELD_NAMES: &'static [&'static str] = &[
        "idMissao",
        "codigoErro",
        "descricao",
        "progressoAtual",
        "bateria",
        "posicaoX",
        "posicaoY",
        "timestamp",
    ];

    fn to_fields(&self) -> Vec<Field> {
        FieldWriter::new()
            .i32("idMissao", self.mission_id)
            .i32("codigoErro", self.code.code())
            .string("descricao", &self.description)
            .f32("progressoAtual", self.progress)
            .f32("bateria", self.battery)
            .f32("posicaoX", self.x)
            .f32("posicaoY", self.y)
            .i64("timestamp", self.timestamp)
            .finish()
    }

    fn from_fields(fields: &FieldMap) -> Result<Self, ProtoError> {
        Ok(ErrorPayload {
            mission_id: fields.read_i32("idMissao")?,
            code: ErrorCode::from_code(fields.read_i32("codigoErro")?),
            description: fields.read_string("descricao")?,
            progress: fields.read_f32("progressoAtual")?,
            battery: fields.read_f32("bateria")?,
            x: fields.read_f32("posicaoX")?,
            y: fields.read_f32("posicaoY")?,
            timestamp: fields.read_i64("timestamp")?,
        })
    }
}
