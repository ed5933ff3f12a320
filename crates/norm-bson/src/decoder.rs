//! 解码器
//!
//! 按帧读取 (标签, 字段名, 载荷)，把字段分派到实体的映射字段、动态属性
//! 或溢出容器。任何错误都会先跳过当前文档剩余的声明字节再返回，
//! 同一缓冲区里的后续文档仍然对齐。

use crate::codec::BsonCodec;
use crate::convert::FromBson;
use crate::expando::{eq_folded, Expando};
use crate::frame::ReadFrames;
use crate::reflect::{BsonEntity, TypeMap};
use crate::registry::AnyEntity;
use crate::spec::{
    binary_subtype, ElementType, DISCRIMINATOR_FIELD, REFERENCE_ID_FIELD, SERVER_ERROR_FIELDS,
};
use crate::value::{Binary, BsonValue, DbPointer, RegexOptions, RegexValue, ScopedCode};
use crate::{BsonError, BsonResult};
use chrono::{DateTime, TimeZone, Utc};
use norm_common::ObjectId;
use std::marker::PhantomData;
use tracing::{trace, warn};

/// 解码结果：主值与未映射字段的溢出容器
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    pub value: T,
    pub overflow: Expando,
}

/// BSON 解码器
///
/// 借用输入切片；字段名与字符串载荷直接指向输入，不复制。
pub struct BsonDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    frames: ReadFrames,
    codec: &'a BsonCodec,
    capture_unmapped: bool,
    entity_depth: usize,
    overflow: Expando,
}

impl<'a> BsonDecoder<'a> {
    pub(crate) fn new(data: &'a [u8], codec: &'a BsonCodec) -> Self {
        Self {
            data,
            pos: 0,
            frames: ReadFrames::new(codec.config().max_nesting_depth),
            codec,
            capture_unmapped: codec.config().capture_unmapped,
            entity_depth: 0,
            overflow: Expando::new(),
        }
    }

    /// 顶层实体上无映射的字段进入溢出容器
    pub(crate) fn capture_unmapped(mut self, enabled: bool) -> Self {
        self.capture_unmapped = enabled;
        self
    }

    pub fn codec(&self) -> &'a BsonCodec {
        self.codec
    }

    /// 已消费的字节数
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn depth(&self) -> usize {
        self.frames.depth()
    }

    pub(crate) fn take_overflow(&mut self) -> Expando {
        std::mem::take(&mut self.overflow)
    }

    /// 解码顶层文档；失败时先跳过剩余字节
    pub(crate) fn decode_root<T: FromBson>(&mut self) -> BsonResult<T> {
        match T::read_payload(ElementType::Document, self) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.drain();
                Err(err)
            }
        }
    }

    /// 跳到最外层未闭合文档的声明结尾
    fn drain(&mut self) {
        if let Some(end) = self.frames.outermost_end() {
            warn!(
                "Discarding {} unread bytes of a failed document",
                end.saturating_sub(self.pos)
            );
            self.pos = end;
            self.frames.clear();
        }
    }

    // ========================================================================
    // 原始读取
    // ========================================================================

    fn take(&mut self, n: usize) -> BsonResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(BsonError::UnexpectedEof)?;
        if end > self.data.len() {
            return Err(BsonError::UnexpectedEof);
        }
        self.frames.consume(n)?;
        let data = self.data;
        let bytes = &data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> BsonResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_u8(&mut self) -> BsonResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_i32(&mut self) -> BsonResult<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    fn read_i64(&mut self) -> BsonResult<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    fn read_f64(&mut self) -> BsonResult<f64> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    fn read_length(&mut self) -> BsonResult<usize> {
        let len = self.read_i32()?;
        usize::try_from(len).map_err(|_| BsonError::Structural(format!("Negative length {}", len)))
    }

    fn read_cstring(&mut self) -> BsonResult<&'a str> {
        let data = self.data;
        let rest = data.get(self.pos..).unwrap_or_default();
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(BsonError::UnexpectedEof)?;
        let bytes = self.take(nul + 1)?;
        Ok(std::str::from_utf8(&bytes[..nul])?)
    }

    /// 长度前缀字符串，长度含结尾 NUL
    fn read_string(&mut self) -> BsonResult<&'a str> {
        let len = self.read_length()?;
        if len == 0 {
            return Err(BsonError::Structural("String length must include terminator".to_string()));
        }
        let bytes = self.take(len)?;
        if bytes[len - 1] != 0 {
            return Err(BsonError::Structural("String is not NUL-terminated".to_string()));
        }
        Ok(std::str::from_utf8(&bytes[..len - 1])?)
    }

    // ========================================================================
    // 文档结构
    // ========================================================================

    pub fn begin_document(&mut self) -> BsonResult<()> {
        self.frames.begin(self.data, self.pos, true)?;
        self.pos += 4;
        Ok(())
    }

    /// 读取下一个元素头；当前文档结束时消费结束符并返回 `None`
    pub fn next_element(&mut self) -> BsonResult<Option<(ElementType, &'a str)>> {
        if self.frames.is_done() {
            match self.data.get(self.pos) {
                Some(0) => {}
                Some(other) => {
                    return Err(BsonError::Structural(format!(
                        "Expected document terminator, found {:#04x}",
                        other
                    )))
                }
                None => return Err(BsonError::UnexpectedEof),
            }
            self.pos += 1;
            self.frames.end()?;
            return Ok(None);
        }

        let tag = self.read_u8()?;
        if tag == 0 {
            return Err(BsonError::Structural(
                "Terminator found before the declared end of document".to_string(),
            ));
        }
        let element = ElementType::from_u8(tag).ok_or(BsonError::UnknownElementType(tag))?;
        let name = self.read_cstring()?;
        Ok(Some((element, name)))
    }

    /// 元素标签必须是 `expected`
    pub fn expect<T: ?Sized>(&self, element: ElementType, expected: ElementType) -> BsonResult<()> {
        if element == expected {
            Ok(())
        } else {
            Err(BsonError::unsupported::<T>(element.name()))
        }
    }

    /// 逐个读取数组元素，元素名被忽略
    pub fn read_array_with<F>(&mut self, mut f: F) -> BsonResult<()>
    where
        F: FnMut(&mut Self, ElementType) -> BsonResult<()>,
    {
        self.begin_document()?;
        while let Some((element, _)) = self.next_element()? {
            f(self, element)?;
        }
        Ok(())
    }

    /// 逐个读取文档字段
    ///
    /// 遇到 `$err` / `errmsg` 字段时立即以 `ServerReported` 结束。
    pub fn read_document_with<F>(&mut self, mut f: F) -> BsonResult<()>
    where
        F: FnMut(&mut Self, ElementType, &'a str) -> BsonResult<()>,
    {
        self.begin_document()?;
        while let Some((element, name)) = self.next_element()? {
            if SERVER_ERROR_FIELDS.contains(&name) {
                return Err(self.server_error(element)?);
            }
            f(self, element, name)?;
        }
        Ok(())
    }

    fn server_error(&mut self, element: ElementType) -> BsonResult<BsonError> {
        let message = match self.read_value(element)? {
            BsonValue::String(s) => s,
            other => other.to_string(),
        };
        Ok(BsonError::ServerReported(message))
    }

    // ========================================================================
    // 标量载荷
    // ========================================================================

    pub fn read_bool(&mut self) -> BsonResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// int32 / int64 载荷，统一为 i64
    pub fn read_integer<T: ?Sized>(&mut self, element: ElementType) -> BsonResult<i64> {
        match element {
            ElementType::Int32 => Ok(i64::from(self.read_i32()?)),
            ElementType::Int64 => self.read_i64(),
            other => Err(BsonError::unsupported::<T>(other.name())),
        }
    }

    /// 数值载荷，整数按 f64 返回
    pub fn read_number<T: ?Sized>(&mut self, element: ElementType) -> BsonResult<f64> {
        match element {
            ElementType::Double => self.read_f64(),
            ElementType::Int32 => Ok(f64::from(self.read_i32()?)),
            ElementType::Int64 => Ok(self.read_i64()? as f64),
            other => Err(BsonError::unsupported::<T>(other.name())),
        }
    }

    /// 枚举的底层整数；旧数据中的 double 截断为整数
    pub fn read_enum_integer<T: ?Sized>(&mut self, element: ElementType) -> BsonResult<i64> {
        match element {
            ElementType::Double => Ok(self.read_f64()?.trunc() as i64),
            other => self.read_integer::<T>(other),
        }
    }

    /// string / symbol / code 载荷
    pub fn read_text<T: ?Sized>(&mut self, element: ElementType) -> BsonResult<&'a str> {
        match element {
            ElementType::String | ElementType::Symbol | ElementType::Code => self.read_string(),
            other => Err(BsonError::unsupported::<T>(other.name())),
        }
    }

    /// 二进制载荷；子类型 2 去掉内部长度
    pub fn read_binary(&mut self) -> BsonResult<Binary> {
        let total = self.read_length()?;
        let subtype = self.read_u8()?;
        if subtype == binary_subtype::OLD_BINARY {
            let inner = self.read_length()?;
            if inner + 4 != total {
                return Err(BsonError::Structural(format!(
                    "Old binary inner length {} does not match {}",
                    inner, total
                )));
            }
            let bytes = self.take(inner)?;
            return Ok(Binary::with_subtype(subtype, bytes));
        }
        let bytes = self.take(total)?;
        Ok(Binary::with_subtype(subtype, bytes))
    }

    pub fn read_object_id(&mut self) -> BsonResult<ObjectId> {
        Ok(ObjectId::from_bytes(self.take_array()?))
    }

    pub fn read_datetime(&mut self) -> BsonResult<DateTime<Utc>> {
        let millis = self.read_i64()?;
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| BsonError::ValueOutOfRange(format!("{} ms since epoch", millis)))
    }

    pub fn read_regex(&mut self) -> BsonResult<RegexValue> {
        let pattern = self.read_cstring()?;
        let options = self.read_cstring()?;
        Ok(RegexValue::new(pattern, RegexOptions::from_option_str(options)))
    }

    /// 带作用域代码：外层块没有结束符
    pub fn read_scoped_code(&mut self) -> BsonResult<ScopedCode> {
        self.frames.begin(self.data, self.pos, false)?;
        self.pos += 4;
        let code = self.read_string()?;
        let scope = self.read_expando()?;
        self.frames.end()?;
        Ok(ScopedCode::new(code, scope))
    }

    /// 按标签解码为动态值
    pub fn read_value(&mut self, element: ElementType) -> BsonResult<BsonValue> {
        let value = match element {
            ElementType::Double => BsonValue::Double(self.read_f64()?),
            ElementType::String => BsonValue::String(self.read_string()?.to_string()),
            ElementType::Document => BsonValue::Document(self.read_expando()?),
            ElementType::Array => {
                let mut items = Vec::new();
                self.read_array_with(|dec, item| {
                    items.push(dec.read_value(item)?);
                    Ok(())
                })?;
                BsonValue::Array(items)
            }
            ElementType::Binary => BsonValue::from_binary(self.read_binary()?),
            ElementType::Undefined | ElementType::Null => BsonValue::Null,
            ElementType::ObjectId => BsonValue::ObjectId(self.read_object_id()?),
            ElementType::Boolean => BsonValue::Boolean(self.read_bool()?),
            ElementType::DateTime => BsonValue::DateTime(self.read_datetime()?),
            ElementType::Regex => BsonValue::Regex(self.read_regex()?),
            ElementType::Reference => {
                let namespace = self.read_string()?.to_string();
                let id = self.read_object_id()?;
                BsonValue::Pointer(DbPointer { namespace, id })
            }
            ElementType::Code => BsonValue::Code(self.read_string()?.to_string()),
            ElementType::Symbol => BsonValue::Symbol(self.read_string()?.to_string()),
            ElementType::ScopedCode => BsonValue::ScopedCode(self.read_scoped_code()?),
            ElementType::Int32 => BsonValue::Int32(self.read_i32()?),
            ElementType::Timestamp => BsonValue::Timestamp(u64::from_le_bytes(self.take_array()?)),
            ElementType::Int64 => BsonValue::Int64(self.read_i64()?),
        };
        Ok(value)
    }

    /// 读取并丢弃一个载荷
    pub fn skip_value(&mut self, element: ElementType) -> BsonResult<()> {
        self.read_value(element).map(drop)
    }

    pub fn read_expando(&mut self) -> BsonResult<Expando> {
        let mut doc = Expando::new();
        self.read_document_with(|dec, element, name| {
            let value = dec.read_value(element)?;
            doc.set(name, value);
            Ok(())
        })?;
        Ok(doc)
    }

    // ========================================================================
    // 实体
    // ========================================================================

    /// 解码具体类型的实体
    pub fn read_entity<T: BsonEntity>(&mut self, element: ElementType) -> BsonResult<T> {
        self.expect::<T>(element, ElementType::Document)?;
        let mut entity = T::default();
        self.begin_document()?;
        self.read_entity_body(&mut entity, 0)?;
        Ok(entity)
    }

    /// 读取文档剩余字段到实体
    ///
    /// # Arguments
    /// * `entity` - 目标实体
    /// * `fields_seen` - 已经处理过的字段数；非零时不再接受 `__type`
    pub(crate) fn read_entity_body<T: BsonEntity>(
        &mut self,
        entity: &mut T,
        fields_seen: usize,
    ) -> BsonResult<()> {
        let map = self.codec.type_map::<T>()?;
        self.entity_depth += 1;
        let result = self.read_entity_fields(&map, entity, fields_seen);
        self.entity_depth -= 1;
        result
    }

    fn read_entity_fields<T: BsonEntity>(
        &mut self,
        map: &TypeMap<T>,
        entity: &mut T,
        mut seen: usize,
    ) -> BsonResult<()> {
        while let Some((element, name)) = self.next_element()? {
            if eq_folded(name, DISCRIMINATOR_FIELD) {
                if seen > 0 {
                    return Err(BsonError::DiscriminatorOutOfOrder);
                }
                let key = self.read_text::<T>(element)?;
                let expected = map.discriminator().unwrap_or_else(|| map.type_key());
                if key != expected {
                    return Err(BsonError::UnknownDiscriminator(key.to_string()));
                }
            } else if SERVER_ERROR_FIELDS.contains(&name) {
                return Err(self.server_error(element)?);
            } else if let Some(property) = map.property(name).or_else(|| {
                if name == REFERENCE_ID_FIELD {
                    map.identifier()
                } else {
                    None
                }
            }) {
                property.read(entity, element, self)?;
            } else if map.is_dynamic() {
                let value = self.read_value(element)?;
                if let Some(expando) = map.expando_mut(entity) {
                    expando.set(name, value);
                }
            } else if self.capture_unmapped && self.entity_depth == 1 {
                let value = self.read_value(element)?;
                trace!("Captured unmapped field {} on {}", name, map.type_key());
                self.overflow.set(name, value);
            } else {
                return Err(BsonError::UnmappedField {
                    field: name.to_string(),
                    type_name: map.type_name().to_string(),
                });
            }
            seen += 1;
        }
        Ok(())
    }

    /// 多态槽位：首字段必须是 `__type`，据此从注册表选择具体类型
    pub fn read_polymorphic(&mut self) -> BsonResult<Box<dyn AnyEntity>> {
        self.begin_document()?;
        let Some((element, name)) = self.next_element()? else {
            return Err(BsonError::Structural(
                "Polymorphic document has no discriminator".to_string(),
            ));
        };
        if SERVER_ERROR_FIELDS.contains(&name) {
            return Err(self.server_error(element)?);
        }
        if !eq_folded(name, DISCRIMINATOR_FIELD) {
            return Err(BsonError::DiscriminatorOutOfOrder);
        }
        let key = self.read_text::<Box<dyn AnyEntity>>(element)?;
        let factory = self
            .codec
            .registry()
            .factory(key)
            .ok_or_else(|| BsonError::UnknownDiscriminator(key.to_string()))?;
        factory(self)
    }
}

/// 连续文档流的迭代器
///
/// 一个文档解码失败时返回错误并跳到它的声明结尾，后续文档照常读取；
/// 长度前缀本身无法读取时迭代结束。
pub struct DocumentReader<'a, T> {
    data: &'a [u8],
    pos: usize,
    codec: &'a BsonCodec,
    stopped: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T> DocumentReader<'a, T> {
    pub(crate) fn new(data: &'a [u8], codec: &'a BsonCodec) -> Self {
        Self {
            data,
            pos: 0,
            codec,
            stopped: false,
            _marker: PhantomData,
        }
    }

    /// 已消费的字节数
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl<T: FromBson> Iterator for DocumentReader<'_, T> {
    type Item = BsonResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped || self.pos >= self.data.len() {
            return None;
        }
        let mut dec = BsonDecoder::new(&self.data[self.pos..], self.codec);
        let result = dec.decode_root::<T>();
        match dec.position() {
            0 => self.stopped = true,
            consumed => self.pos += consumed,
        }
        Some(result)
    }
}
