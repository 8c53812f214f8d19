//! フィールドコーデック
//!
//! ペイロードの各属性を「名前付きバイトブロック」(Field) として表現する。
//! Field は分割の最小単位であり、受信側では名前をキーに再組み立てされる。
//!
//! ## Field の Wire Format
//! ```text
//! [name_len: u16 BE][name: UTF-8][data_len: u32 BE][data...][part_index: u16 BE][total_parts: u16 BE]
//! ```
//!
//! ## 値のエンコード
//! - i32 / f32: 4 バイト big-endian
//! - i64: 8 バイト big-endian
//! - bool: 1 バイト (0 / 1)
//! - 文字列: `[len: i32 BE][UTF-8 bytes]`
//! - i32 配列: `[count: i32 BE][i32 BE × count]`

use std::collections::BTreeMap;

use bytes::{Buf, BufMut};

use crate::error::ProtoError;

/// 名前付きバイトブロック
///
/// `total_parts == 1` なら分割されていない完全なフィールド、
/// それ以外は `part_index` 番目のパート。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub data: Vec<u8>,
    /// パート番号（0 始まり）
    pub part_index: u16,
    /// パート総数（1 以上）
    pub total_parts: u16,
}

impl Field {
    /// 名前以外のメタデータ長（name_len: 2 + data_len: 4 + part_index: 2 + total_parts: 2）
    pub const FIXED_OVERHEAD: usize = 10;

    /// 分割されていないフィールドを生成する
    pub fn whole(name: impl Into<String>, data: Vec<u8>) -> Self {
        Field {
            name: name.into(),
            data,
            part_index: 0,
            total_parts: 1,
        }
    }

    /// 分割されたフィールドの 1 パートを生成する
    pub fn part(name: impl Into<String>, data: Vec<u8>, part_index: u16, total_parts: u16) -> Self {
        Field {
            name: name.into(),
            data,
            part_index,
            total_parts,
        }
    }

    pub fn is_split(&self) -> bool {
        self.total_parts > 1
    }

    /// データ以外のシリアライズ長
    pub fn overhead(&self) -> usize {
        Self::FIXED_OVERHEAD + self.name.len()
    }

    /// シリアライズ後のバイト数
    pub fn encoded_len(&self) -> usize {
        self.overhead() + self.data.len()
    }

    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.name.len() as u16);
        buf.put_slice(self.name.as_bytes());
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.put_u16(self.part_index);
        buf.put_u16(self.total_parts);
    }

    /// バッファ先頭から 1 フィールドを読み出し、読んだ分だけ進める
    ///
    /// # エラー
    /// - `TooShort`: 長さ宣言に対してバイトが足りない
    /// - `MalformedField`: 名前が UTF-8 でない、またはパート番号が不正
    pub fn decode_from(buf: &mut &[u8]) -> Result<Self, ProtoError> {
        ensure(buf, 2)?;
        let name_len = buf.get_u16() as usize;
        ensure(buf, name_len)?;
        let name = String::from_utf8(buf[..name_len].to_vec())
            .map_err(|_| ProtoError::malformed("<name>", "field name is not valid UTF-8"))?;
        buf.advance(name_len);

        ensure(buf, 4)?;
        let data_len = buf.get_u32() as usize;
        ensure(buf, data_len)?;
        let data = buf[..data_len].to_vec();
        buf.advance(data_len);

        ensure(buf, 4)?;
        let part_index = buf.get_u16();
        let total_parts = buf.get_u16();
        if total_parts == 0 || part_index >= total_parts {
            return Err(ProtoError::malformed(&name, "part index out of range"));
        }

        Ok(Field {
            name,
            data,
            part_index,
            total_parts,
        })
    }
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), ProtoError> {
    if buf.remaining() < needed {
        return Err(ProtoError::TooShort {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

/// フィールド列のシリアライズ長合計
pub fn fields_encoded_len(fields: &[Field]) -> usize {
    fields.iter().map(Field::encoded_len).sum()
}

/// フィールド列を連結してシリアライズする
pub fn encode_fields(fields: &[Field]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(fields_encoded_len(fields));
    for field in fields {
        field.encode_into(&mut buf);
    }
    buf
}

/// 連結されたフィールド列をすべてデコードする
pub fn decode_fields(mut bytes: &[u8]) -> Result<Vec<Field>, ProtoError> {
    let mut fields = Vec::new();
    while bytes.has_remaining() {
        fields.push(Field::decode_from(&mut bytes)?);
    }
    Ok(fields)
}

/// 型付き値を Field 列に書き出すビルダー
#[derive(Debug, Default)]
pub struct FieldWriter {
    fields: Vec<Field>,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn i32(self, name: &str, value: i32) -> Self {
        self.push(name, value.to_be_bytes().to_vec())
    }

    pub fn f32(self, name: &str, value: f32) -> Self {
        self.push(name, value.to_be_bytes().to_vec())
    }

    pub fn i64(self, name: &str, value: i64) -> Self {
        self.push(name, value.to_be_bytes().to_vec())
    }

    pub fn bool(self, name: &str, value: bool) -> Self {
        self.push(name, vec![u8::from(value)])
    }

    pub fn string(self, name: &str, value: &str) -> Self {
        let mut data = Vec::with_capacity(4 + value.len());
        data.put_i32(value.len() as i32);
        data.put_slice(value.as_bytes());
        self.push(name, data)
    }

    pub fn i32_list(self, name: &str, values: &[i32]) -> Self {
        let mut data = Vec::with_capacity(4 + values.len() * 4);
        data.put_i32(values.len() as i32);
        for v in values {
            data.put_i32(*v);
        }
        self.push(name, data)
    }

    pub fn finish(self) -> Vec<Field> {
        self.fields
    }

    fn push(mut self, name: &str, data: Vec<u8>) -> Self {
        self.fields.push(Field::whole(name, data));
        self
    }
}

/// 名前 → 完全なフィールドデータ の対応表（デコード側）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    fields: BTreeMap<String, Vec<u8>>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分割されていないフィールド列から対応表を作る
    ///
    /// # エラー
    /// 分割パートが含まれている場合は `IncompleteField`
    pub fn from_whole_fields(fields: Vec<Field>) -> Result<Self, ProtoError> {
        let mut map = FieldMap::new();
        for field in fields {
            if field.is_split() {
                return Err(ProtoError::IncompleteField {
                    name: field.name,
                    received: 1,
                    expected: field.total_parts as usize,
                });
            }
            map.insert(field.name, field.data);
        }
        Ok(map)
    }

    pub fn insert(&mut self, name: impl Into<String>, data: Vec<u8>) {
        self.fields.insert(name.into(), data);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn raw(&self, name: &str) -> Result<&[u8], ProtoError> {
        self.fields
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| ProtoError::malformed(name, "field is missing"))
    }

    pub fn read_i32(&self, name: &str) -> Result<i32, ProtoError> {
        Ok(i32::from_be_bytes(self.fixed::<4>(name)?))
    }

    pub fn read_f32(&self, name: &str) -> Result<f32, ProtoError> {
        Ok(f32::from_be_bytes(self.fixed::<4>(name)?))
    }

    pub fn read_i64(&self, name: &str) -> Result<i64, ProtoError> {
        Ok(i64::from_be_bytes(self.fixed::<8>(name)?))
    }

    pub fn read_bool(&self, name: &str) -> Result<bool, ProtoError> {
        match self.fixed::<1>(name)? {
            [0] => Ok(false),
            [1] => Ok(true),
            _ => Err(ProtoError::malformed(name, "boolean must be 0 or 1")),
        }
    }

    pub fn read_string(&self, name: &str) -> Result<String, ProtoError> {
        let mut data = self.raw(name)?;
        let len = read_count(&mut data, name)?;
        if data.len() != len {
            return Err(ProtoError::malformed(name, "string length prefix mismatch"));
        }
        String::from_utf8(data.to_vec())
            .map_err(|_| ProtoError::malformed(name, "string is not valid UTF-8"))
    }

    pub fn read_i32_list(&self, name: &str) -> Result<Vec<i32>, ProtoError> {
        let mut data = self.raw(name)?;
        let count = read_count(&mut data, name)?;
        if data.len() != count * 4 {
            return Err(ProtoError::malformed(name, "list count prefix mismatch"));
        }
        let mut values = Vec::with_capacity(count);
        while data.has_remaining() {
            values.push(data.get_i32());
        }
        Ok(values)
    }

    fn fixed<const N: usize>(&self, name: &str) -> Result<[u8; N], ProtoError> {
        self.raw(name)?
            .try_into()
            .map_err(|_| ProtoError::malformed(name, "unexpected value width"))
    }
}

fn read_count(data: &mut &[u8], name: &str) -> Result<usize, ProtoError> {
    if data.remaining() < 4 {
        return Err(ProtoError::malformed(name, "missing length prefix"));
    }
    let count = data.get_i32();
    usize::try_from(count).map_err(|_| ProtoError::malformed(name, "negative length prefix"))
}
