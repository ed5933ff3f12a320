//! 编码器
//!
//! 把实体、`Expando` 或字符串键映射写成 BSON 文档。嵌套文档的长度前缀
//! 先写占位符，闭合时回填。

use crate::codec::BsonCodec;
use crate::convert::ToBson;
use crate::expando::{eq_folded, fold_key, Expando};
use crate::frame::WriteFrames;
use crate::reflect::BsonEntity;
use crate::spec::{binary_subtype, DISCRIMINATOR_FIELD};
use crate::value::BsonValue;
use crate::{BsonError, BsonResult};
use bytes::{BufMut, BytesMut};
use std::collections::HashSet;

/// 长度前缀：载荷字节数加上 `extra` 后必须放得进 int32
fn length_prefix(len: usize, extra: usize, what: &str) -> BsonResult<i32> {
    len.checked_add(extra)
        .and_then(|total| i32::try_from(total).ok())
        .ok_or_else(|| BsonError::ValueOutOfRange(format!("{} of {} bytes", what, len)))
}

/// 编码模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodeMode {
    /// 完整文档
    #[default]
    Insert,
    /// 更新载荷：跳过不可变字段
    Update,
}

/// BSON 编码器
///
/// 载荷写入方法只写标签与字段名之后的部分；`write_element` 负责完整元素。
pub struct BsonEncoder<'a> {
    buf: &'a mut BytesMut,
    frames: WriteFrames,
    codec: &'a BsonCodec,
    mode: EncodeMode,
}

impl<'a> BsonEncoder<'a> {
    pub(crate) fn new(buf: &'a mut BytesMut, codec: &'a BsonCodec, mode: EncodeMode) -> Self {
        Self {
            buf,
            frames: WriteFrames::new(codec.config().max_nesting_depth),
            codec,
            mode,
        }
    }

    pub fn codec(&self) -> &'a BsonCodec {
        self.codec
    }

    pub fn mode(&self) -> EncodeMode {
        self.mode
    }

    /// 当前未闭合的文档层数
    pub fn depth(&self) -> usize {
        self.frames.depth()
    }

    pub fn begin_document(&mut self) -> BsonResult<()> {
        self.frames.begin(self.buf)
    }

    pub fn end_document(&mut self) -> BsonResult<()> {
        self.frames.end(self.buf, true)
    }

    /// 写出完整元素：标签、字段名、载荷
    pub fn write_element<V: ToBson + ?Sized>(&mut self, name: &str, value: &V) -> BsonResult<()> {
        self.buf.put_u8(value.element_type() as u8);
        self.write_cstring(name)?;
        value.write_payload(self)
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64_le(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// 以 NUL 结尾的字符串；内容本身不能包含 NUL
    pub fn write_cstring(&mut self, value: &str) -> BsonResult<()> {
        if value.as_bytes().contains(&0) {
            return Err(BsonError::Structural(format!("Key or pattern contains NUL: {:?}", value)));
        }
        self.buf.put_slice(value.as_bytes());
        self.buf.put_u8(0);
        Ok(())
    }

    /// 长度前缀字符串：int32 长度(含结尾 NUL) + UTF-8 字节 + NUL
    pub fn write_string(&mut self, value: &str) -> BsonResult<()> {
        let len = length_prefix(value.len(), 1, "String")?;
        self.buf.put_i32_le(len);
        self.buf.put_slice(value.as_bytes());
        self.buf.put_u8(0);
        Ok(())
    }

    /// 二进制载荷
    ///
    /// 子类型 2 在载荷内部再写一次长度。
    pub fn write_binary(&mut self, subtype: u8, bytes: &[u8]) -> BsonResult<()> {
        let inner = length_prefix(bytes.len(), 0, "Binary")?;
        if subtype == binary_subtype::OLD_BINARY {
            self.buf.put_i32_le(length_prefix(bytes.len(), 4, "Binary")?);
            self.buf.put_u8(subtype);
            self.buf.put_i32_le(inner);
        } else {
            self.buf.put_i32_le(inner);
            self.buf.put_u8(subtype);
        }
        self.buf.put_slice(bytes);
        Ok(())
    }

    /// 数组：以 "0"、"1"… 为键的文档
    pub fn write_array<I>(&mut self, items: I) -> BsonResult<()>
    where
        I: IntoIterator,
        I::Item: ToBson,
    {
        self.begin_document()?;
        for (index, item) in items.into_iter().enumerate() {
            self.write_element(&index.to_string(), &item)?;
        }
        self.end_document()
    }

    pub fn write_map<K, V, I>(&mut self, entries: I) -> BsonResult<()>
    where
        K: AsRef<str>,
        V: ToBson,
        I: IntoIterator<Item = (K, V)>,
    {
        self.begin_document()?;
        for (key, value) in entries {
            self.write_element(key.as_ref(), &value)?;
        }
        self.end_document()
    }

    /// 按容器顺序写出动态属性；`__type` 只能是第一个键
    pub fn write_expando(&mut self, expando: &Expando) -> BsonResult<()> {
        self.begin_document()?;
        for (index, (key, value)) in expando.iter().enumerate() {
            if index > 0 && eq_folded(key, DISCRIMINATOR_FIELD) {
                return Err(BsonError::DiscriminatorOutOfOrder);
            }
            self.write_element(key, value)?;
        }
        self.end_document()
    }

    /// 带作用域代码：外层块长度 + 代码字符串 + 作用域文档，外层块没有结束符
    pub fn write_scoped_code(&mut self, code: &str, scope: &Expando) -> BsonResult<()> {
        self.frames.begin(self.buf)?;
        self.write_string(code)?;
        self.write_expando(scope)?;
        self.frames.end(self.buf, false)
    }

    /// 写出动态值的载荷
    pub fn write_value(&mut self, value: &BsonValue) -> BsonResult<()> {
        match value {
            BsonValue::Null => {}
            BsonValue::Boolean(b) => self.write_bool(*b),
            BsonValue::Int32(n) => self.write_i32(*n),
            BsonValue::Int64(n) => self.write_i64(*n),
            BsonValue::Double(n) => self.write_f64(*n),
            BsonValue::String(s) | BsonValue::Code(s) | BsonValue::Symbol(s) => self.write_string(s)?,
            BsonValue::Binary(b) => self.write_binary(b.subtype, &b.bytes)?,
            BsonValue::Uuid(u) => u.write_payload(self)?,
            BsonValue::ObjectId(id) => self.write_raw(id.as_bytes()),
            BsonValue::DateTime(dt) => self.write_i64(dt.timestamp_millis()),
            BsonValue::Regex(r) => r.write_payload(self)?,
            BsonValue::ScopedCode(c) => self.write_scoped_code(&c.code, &c.scope)?,
            BsonValue::Pointer(p) => {
                self.write_string(&p.namespace)?;
                self.write_raw(p.id.as_bytes());
            }
            BsonValue::Timestamp(ts) => self.buf.put_u64_le(*ts),
            BsonValue::Array(items) => self.write_array(items.iter())?,
            BsonValue::Document(doc) => self.write_expando(doc)?,
        }
        Ok(())
    }

    /// 写出实体
    ///
    /// # 顺序
    /// 1. 带判别字段的类型先写 `__type`
    /// 2. 按声明顺序写映射字段(跳过 null / 默认值 / 更新模式下的不可变字段)
    /// 3. 动态属性中尚未写出的键(忽略大小写比较)
    pub fn write_entity<T: BsonEntity>(&mut self, entity: &T) -> BsonResult<()> {
        let map = self.codec.type_map::<T>()?;
        self.begin_document()?;

        // 已写出的键，按 Expando 的规则折叠大小写
        let mut emitted: HashSet<String> = HashSet::with_capacity(map.properties().len() + 1);
        if let Some(key) = map.discriminator() {
            self.write_element(DISCRIMINATOR_FIELD, key)?;
            emitted.insert(fold_key(DISCRIMINATOR_FIELD));
        }

        for property in map.properties() {
            if property.write(entity, self)? {
                emitted.insert(fold_key(property.wire_name()));
            }
        }

        if let Some(expando) = map.expando_of(entity) {
            for (key, value) in expando.iter() {
                let folded = fold_key(key);
                if emitted.contains(&folded) {
                    continue;
                }
                if eq_folded(key, DISCRIMINATOR_FIELD) && !emitted.is_empty() {
                    return Err(BsonError::DiscriminatorOutOfOrder);
                }
                self.write_element(key, value)?;
                emitted.insert(folded);
            }
        }

        self.end_document()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::TypeMapBuilder;
    use crate::spec::ElementType;
    use crate::value::{Binary, RegexOptions, RegexValue, ScopedCode};
    use crate::{bson_entity, expando};
    use chrono::{TimeZone, Utc};
    use norm_common::ObjectId;
    use uuid::Uuid;

    fn oracle(doc: &bson::Document) -> Vec<u8> {
        let mut bytes = Vec::new();
        doc.to_writer(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_empty_document() {
        let codec = BsonCodec::new();
        assert_eq!(codec.encode(&Expando::new()).unwrap(), vec![5, 0, 0, 0, 0]);
    }

    #[test]
    fn test_scalars_match_reference_encoding() {
        let codec = BsonCodec::new();
        let props = expando! {
            "double" => 1.5,
            "string" => "héllo",
            "int32" => -7,
            "int64" => i64::MAX,
            "bool" => true,
            "null" => BsonValue::Null,
        };
        let expected = bson::doc! {
            "double": 1.5,
            "string": "héllo",
            "int32": -7i32,
            "int64": i64::MAX,
            "bool": true,
            "null": bson::Bson::Null,
        };
        assert_eq!(codec.encode(&props).unwrap(), oracle(&expected));
    }

    #[test]
    fn test_special_types_match_reference_encoding() {
        let codec = BsonCodec::new();
        let oid = ObjectId::new();
        let when = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let uuid = Uuid::new_v4();

        let props = expando! {
            "oid" => oid,
            "when" => when,
            "uuid" => uuid,
            "bin" => Binary::new(vec![1u8, 2, 3]),
            "re" => RegexValue::new("[0-9]{5}", RegexOptions::MULTILINE),
            "list" => vec![1, 2],
            "nested" => expando! { "x" => 1 },
            "ts" => BsonValue::Timestamp((7u64 << 32) | 3),
            "js" => BsonValue::ScopedCode(ScopedCode::new("x + 1", expando! { "x" => 2 })),
        };
        let expected = bson::doc! {
            "oid": bson::oid::ObjectId::from_bytes(*oid.as_bytes()),
            "when": bson::DateTime::from_millis(1_700_000_000_123),
            "uuid": bson::Binary {
                subtype: bson::spec::BinarySubtype::UuidOld,
                bytes: uuid.to_bytes_le().to_vec(),
            },
            "bin": bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes: vec![1, 2, 3],
            },
            "re": bson::Regex {
                pattern: "[0-9]{5}".to_string(),
                options: "m".to_string(),
            },
            "list": [1i32, 2i32],
            "nested": { "x": 1i32 },
            "ts": bson::Timestamp { time: 7, increment: 3 },
            "js": bson::Bson::JavaScriptCodeWithScope(bson::JavaScriptCodeWithScope {
                code: "x + 1".to_string(),
                scope: bson::doc! { "x": 2i32 },
            }),
        };
        assert_eq!(codec.encode(&props).unwrap(), oracle(&expected));
    }

    #[test]
    fn test_old_binary_carries_inner_length() {
        let codec = BsonCodec::new();
        let props = expando! { "b" => Binary::with_subtype(binary_subtype::OLD_BINARY, vec![9u8, 9]) };
        let bytes = codec.encode(&props).unwrap();
        // 元素: 05 'b' 00 | 总长 6 | 子类型 2 | 内部长度 2 | 9 9
        assert_eq!(&bytes[4..7], &[0x05, b'b', 0]);
        assert_eq!(&bytes[7..11], &6i32.to_le_bytes());
        assert_eq!(bytes[11], 0x02);
        assert_eq!(&bytes[12..16], &2i32.to_le_bytes());
        assert_eq!(&bytes[16..18], &[9, 9]);
    }

    #[test]
    fn test_top_level_must_be_document() {
        let codec = BsonCodec::new();
        let err = codec.encode(&42i32).unwrap_err();
        assert!(matches!(err, BsonError::UnsupportedType { .. }));
        let err = codec.encode(&vec![1, 2]).unwrap_err();
        assert!(matches!(err, BsonError::UnsupportedType { .. }));
    }

    #[test]
    fn test_key_with_nul_is_rejected() {
        let codec = BsonCodec::new();
        let mut buf = BytesMut::from(&b"keep"[..]);
        let err = codec.encode_into(&expando! { "a\0b" => 1 }, &mut buf).unwrap_err();
        assert!(matches!(err, BsonError::Structural(_)));
        assert_eq!(&buf[..], b"keep");
    }

    #[test]
    fn test_expando_discriminator_must_lead() {
        let codec = BsonCodec::new();
        let ok = expando! { "__type" => "zoo.Dog", "name" => "Rex" };
        assert!(codec.encode(&ok).is_ok());
        let bad = expando! { "name" => "Rex", "__type" => "zoo.Dog" };
        assert!(matches!(codec.encode(&bad), Err(BsonError::DiscriminatorOutOfOrder)));
    }

    #[test]
    fn test_expando_encoding_is_stable() {
        let codec = BsonCodec::new();
        let mut props = expando! { "a" => 1, "b" => "two", "c" => 3.0 };
        let first = codec.encode(&props).unwrap();
        assert_eq!(first, codec.encode(&props).unwrap());

        props.reverse();
        let reversed = codec.encode(&props).unwrap();
        assert_ne!(first, reversed);
        assert_eq!(first.len(), reversed.len());
    }

    #[test]
    fn test_nesting_limit() {
        let codec = BsonCodec::new();
        let mut value = BsonValue::Int32(1);
        for _ in 0..120 {
            value = BsonValue::Array(vec![value]);
        }
        let err = codec.encode(&expando! { "deep" => value }).unwrap_err();
        assert!(matches!(err, BsonError::NestingTooDeep(100)));
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Profile {
        id: i32,
        name: String,
        nickname: Option<String>,
        score: i32,
        created_by: String,
        extra: Expando,
    }

    impl BsonEntity for Profile {
        fn describe(map: &mut TypeMapBuilder<Self>) {
            map.field("Id", |p| &p.id, |p, v| p.id = v);
            map.field("Name", |p| &p.name, |p, v| p.name = v);
            map.field("Nickname", |p| &p.nickname, |p, v| p.nickname = v).ignore_if_null();
            map.field("Score", |p| &p.score, |p, v| p.score = v).default_value(0);
            map.field("CreatedBy", |p| &p.created_by, |p, v| p.created_by = v).immutable();
            map.derived("NameLength", |p| p.name.len() as i32);
            map.expando(|p| &p.extra, |p| &mut p.extra);
        }
    }

    bson_entity!(Profile);

    #[test]
    fn test_entity_skip_rules() {
        let codec = BsonCodec::new();
        let mut profile = Profile {
            id: 7,
            name: "miku".to_string(),
            nickname: None,
            score: 0,
            created_by: "admin".to_string(),
            extra: expando! { "name" => "shadowed", "Color" => "teal" },
        };

        let bytes = codec.encode(&profile).unwrap();
        let expected = bson::doc! {
            "_id": 7i32,
            "Name": "miku",
            "CreatedBy": "admin",
            "NameLength": 4i32,
            "Color": "teal",
        };
        assert_eq!(bytes, oracle(&expected));

        profile.score = 3;
        profile.nickname = Some("m".to_string());
        let update = codec.encode_update(&profile).unwrap();
        let expected = bson::doc! {
            "_id": 7i32,
            "Name": "miku",
            "Nickname": "m",
            "Score": 3i32,
            "NameLength": 4i32,
            "Color": "teal",
        };
        assert_eq!(update, oracle(&expected));
    }

    #[test]
    fn test_write_element_tags() {
        let codec = BsonCodec::new();
        let mut buf = BytesMut::new();
        let mut enc = BsonEncoder::new(&mut buf, &codec, EncodeMode::Insert);
        enc.begin_document().unwrap();
        enc.write_element("n", &Option::<i32>::None).unwrap();
        enc.write_element("u", &5u64).unwrap();
        enc.write_element("f", &0.5f32).unwrap();
        enc.end_document().unwrap();
        assert_eq!(enc.depth(), 0);

        assert_eq!(buf[4], ElementType::Null as u8);
        assert_eq!(buf[7], ElementType::Int64 as u8);
        assert_eq!(buf[18], ElementType::Double as u8);
        assert_eq!(&buf[21..29], &0.5f64.to_le_bytes());
    }

    #[test]
    fn test_u64_out_of_range() {
        let codec = BsonCodec::new();
        let mut map = std::collections::BTreeMap::new();
        map.insert("big".to_string(), u64::MAX);
        assert!(matches!(codec.encode(&map), Err(BsonError::ValueOutOfRange(_))));
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Ticket {
        etat: String,
        extra: Expando,
    }

    impl BsonEntity for Ticket {
        fn describe(map: &mut TypeMapBuilder<Self>) {
            map.field("État", |t| &t.etat, |t, v| t.etat = v);
            map.expando(|t| &t.extra, |t| &mut t.extra);
        }
    }

    bson_entity!(Ticket);

    #[test]
    fn test_expando_shadowing_folds_non_ascii_keys() {
        let codec = BsonCodec::new();
        let ticket = Ticket {
            etat: "ouvert".to_string(),
            extra: expando! { "état" => "fermé", "Priorité" => 2 },
        };

        let bytes = codec.encode(&ticket).unwrap();
        let expected = bson::doc! { "État": "ouvert", "Priorité": 2i32 };
        assert_eq!(bytes, oracle(&expected));

        let decoded: Ticket = codec.decode(&oracle(&bson::doc! { "ÉTAT": "fermé" })).unwrap();
        assert_eq!(decoded.etat, "fermé");
        assert!(decoded.extra.is_empty());
    }

    #[test]
    fn test_length_prefix_bounds() {
        assert_eq!(length_prefix(10, 1, "String").unwrap(), 11);
        assert_eq!(length_prefix(i32::MAX as usize, 0, "Binary").unwrap(), i32::MAX);
        assert!(matches!(
            length_prefix(i32::MAX as usize, 1, "String"),
            Err(BsonError::ValueOutOfRange(_))
        ));
        assert!(matches!(
            length_prefix(usize::MAX, 4, "Binary"),
            Err(BsonError::ValueOutOfRange(_))
        ));
    }
}
