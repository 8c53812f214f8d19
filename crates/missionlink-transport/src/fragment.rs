//! フィールド単位の分割と再組み立て
//!
//! ## Fragment の中身
//! ```text
//! [Field][Field]...   (各 Field は missionlink-proto の Wire Format)
//! ```
//!
//! 1 つの Field がフラグメントサイズ F を超える場合だけ、その Field のデータを
//! `F - overhead` バイトずつのパートに分ける。その後、Field とパートを先頭から
//! 順に詰め、次の要素が入らなくなった時点で次の Fragment を始める。
//! Fragment が空になることはない。

use std::collections::BTreeMap;

use missionlink_proto::{decode_fields, encode_fields, fields_encoded_len, Field, FieldMap, FieldSchema};

use crate::error::TransportError;

/// ミッション転送の 1 データグラム分の Field 列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub fields: Vec<Field>,
}

impl Fragment {
    pub fn encoded_len(&self) -> usize {
        fields_encoded_len(&self.fields)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode_fields(&self.fields)
    }

    /// # エラー
    /// Field 列として読めなければ `TransportError::Proto`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        Ok(Fragment {
            fields: decode_fields(bytes)?,
        })
    }
}

/// Field 列を Fragment 列に分割する
///
/// デフォルトのフラグメントサイズは 512 バイト。
#[derive(Debug, Clone)]
pub struct Fragmenter {
    /// Fragment 1 つあたりの Field シリアライズ長の上限
    max_fragment_size: usize,
}

impl Fragmenter {
    pub fn new(max_fragment_size: usize) -> Self {
        Fragmenter { max_fragment_size }
    }

    pub fn max_fragment_size(&self) -> usize {
        self.max_fragment_size
    }

    /// 1 Fragment に収まらないか
    pub fn needs_fragmentation(&self, fields: &[Field]) -> bool {
        fields_encoded_len(fields) > self.max_fragment_size
    }

    /// 1 つの Field を必要に応じてパートに分ける
    ///
    /// # エラー
    /// - `FragmentSizeTooSmall`: `F <= overhead` で 1 バイトもデータを載せられない
    /// - `TooManyParts`: パート数が u16 を超える
    pub fn split_field(&self, field: &Field) -> Result<Vec<Field>, TransportError> {
        if field.encoded_len() <= self.max_fragment_size {
            return Ok(vec![field.clone()]);
        }

        let overhead = field.overhead();
        let usable = self.max_fragment_size.saturating_sub(overhead);
        if usable == 0 {
            return Err(TransportError::FragmentSizeTooSmall {
                field: field.name.clone(),
                max: self.max_fragment_size,
                overhead,
            });
        }

        let parts = field.data.len().div_ceil(usable);
        let total = u16::try_from(parts).map_err(|_| TransportError::TooManyParts {
            field: field.name.clone(),
            parts,
        })?;

        Ok(field
            .data
            .chunks(usable)
            .enumerate()
            .map(|(i, chunk)| Field::part(field.name.clone(), chunk.to_vec(), i as u16, total))
            .collect())
    }

    /// Field 列を Fragment 列に分割する
    ///
    /// # 戻り値
    /// 1 つに収まる場合でも常に Vec で返す。空の Field 列なら空の Vec。
    pub fn make_fragments(&self, fields: &[Field]) -> Result<Vec<Fragment>, TransportError> {
        let mut fragments = Vec::new();
        let mut current: Vec<Field> = Vec::new();
        let mut current_len = 0;

        for field in fields {
            for item in self.split_field(field)? {
                let len = item.encoded_len();
                if !current.is_empty() && current_len + len > self.max_fragment_size {
                    fragments.push(Fragment {
                        fields: std::mem::take(&mut current),
                    });
                    current_len = 0;
                }
                current_len += len;
                current.push(item);
            }
        }

        if !current.is_empty() {
            fragments.push(Fragment { fields: current });
        }
        Ok(fragments)
    }
}

/// 1 フィールド分の受信済みパート
#[derive(Debug, Clone)]
struct PartSet {
    /// 最初に受け取ったパートが宣言した総数
    total_parts: u16,
    /// 総数の宣言が食い違うパートを受け取った
    inconsistent: bool,
    parts: BTreeMap<u16, Vec<u8>>,
}

impl PartSet {
    fn is_complete(&self) -> bool {
        !self.inconsistent && self.parts.len() == self.total_parts as usize
    }
}

/// Field / パートを名前ごとに集め、元のペイロードに再組み立てする
///
/// Fragment の到着順は問わず、同じパートの重複は上書きされるだけ。
#[derive(Debug, Clone, Default)]
pub struct FieldAssembly {
    fields: BTreeMap<String, PartSet>,
}

impl FieldAssembly {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_fragment(&mut self, fragment: &Fragment) {
        for field in &fragment.fields {
            self.add_field(field);
        }
    }

    pub fn add_field(&mut self, field: &Field) {
        let set = self.fields.entry(field.name.clone()).or_insert_with(|| PartSet {
            total_parts: field.total_parts,
            inconsistent: false,
            parts: BTreeMap::new(),
        });
        if set.total_parts != field.total_parts {
            set.inconsistent = true;
        }
        set.parts.insert(field.part_index, field.data.clone());
    }

    pub fn is_field_complete(&self, name: &str) -> bool {
        self.fields.get(name).is_some_and(PartSet::is_complete)
    }

    /// スキーマの全フィールドが揃っているか
    pub fn is_complete<T: FieldSchema>(&self) -> bool {
        T::FIELD_NAMES.iter().all(|name| self.is_field_complete(name))
    }

    /// まだ揃っていないスキーマのフィールド名
    pub fn missing_fields<T: FieldSchema>(&self) -> Vec<&'static str> {
        T::FIELD_NAMES
            .iter()
            .copied()
            .filter(|name| !self.is_field_complete(name))
            .collect()
    }

    /// 1 フィールドのデータをパート順に連結して返す
    ///
    /// # エラー
    /// パートの欠落・総数の不一致は `IncompleteField`
    pub fn reconstruct_field(&self, name: &str) -> Result<Vec<u8>, TransportError> {
        let set = self.fields.get(name).ok_or_else(|| TransportError::IncompleteField {
            name: name.to_string(),
            received: 0,
            expected: 1,
        })?;
        if !set.is_complete() {
            return Err(TransportError::IncompleteField {
                name: name.to_string(),
                received: set.parts.len(),
                expected: set.total_parts as usize,
            });
        }
        Ok(set.parts.values().flatten().copied().collect())
    }

    /// スキーマのフィールドをすべて再組み立てしてペイロードを復元する
    pub fn reconstruct<T: FieldSchema>(&self) -> Result<T, TransportError> {
        let mut map = FieldMap::new();
        for name in T::FIELD_NAMES {
            map.insert(*name, self.reconstruct_field(name)?);
        }
        Ok(T::from_fields(&map)?)
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}
