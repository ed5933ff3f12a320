//! 类型与线格式的对应关系
//!
//! `ToBson` 决定一个值写成哪种元素、载荷如何编码；`FromBson` 根据元素标签
//! 把载荷读回目标类型。实体类型通过 `bson_entity!` 接入，整型枚举通过 `bson_enum!`。

use crate::decoder::BsonDecoder;
use crate::encoder::BsonEncoder;
use crate::expando::Expando;
use crate::registry::AnyEntity;
use crate::spec::{binary_subtype, ElementType};
use crate::value::{Binary, BsonValue, RegexValue, ScopedCode};
use crate::{BsonError, BsonResult};
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use indexmap::IndexMap;
use norm_common::ObjectId;
use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;
use uuid::Uuid;

/// 可编码为 BSON 元素的类型
pub trait ToBson {
    /// 写出时使用的元素标签；`Option::None` 等情况取决于值本身
    fn element_type(&self) -> ElementType;

    /// 写出标签和字段名之后的载荷
    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()>;
}

/// 可从 BSON 元素解码的类型
pub trait FromBson: Sized {
    /// 为 true 时 null 元素会交给 `read_payload`；否则映射字段遇到 null 保持原值
    const NULLABLE: bool = false;

    fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self>;

    /// 解码到已有值上；集合类型在原集合上追加
    fn read_into(&mut self, element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<()> {
        *self = Self::read_payload(element, dec)?;
        Ok(())
    }
}

fn out_of_range<T: ?Sized>(value: impl std::fmt::Display) -> BsonError {
    BsonError::ValueOutOfRange(format!("{} does not fit in {}", value, std::any::type_name::<T>()))
}

impl<T: ToBson + ?Sized> ToBson for &T {
    fn element_type(&self) -> ElementType {
        (**self).element_type()
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        (**self).write_payload(enc)
    }
}

impl<T: ToBson + ?Sized> ToBson for Box<T> {
    fn element_type(&self) -> ElementType {
        (**self).element_type()
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        (**self).write_payload(enc)
    }
}

// ============================================================================
// 标量
// ============================================================================

impl ToBson for bool {
    fn element_type(&self) -> ElementType {
        ElementType::Boolean
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        enc.write_bool(*self);
        Ok(())
    }
}

impl FromBson for bool {
    fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
        dec.expect::<Self>(element, ElementType::Boolean)?;
        dec.read_bool()
    }
}

macro_rules! int32_types {
    ($($t:ty),*) => {$(
        impl ToBson for $t {
            fn element_type(&self) -> ElementType {
                ElementType::Int32
            }

            fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
                enc.write_i32(*self as i32);
                Ok(())
            }
        }

        impl FromBson for $t {
            fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
                let n = dec.read_integer::<Self>(element)?;
                <$t>::try_from(n).map_err(|_| out_of_range::<Self>(n))
            }
        }
    )*};
}

macro_rules! int64_types {
    ($($t:ty),*) => {$(
        impl ToBson for $t {
            fn element_type(&self) -> ElementType {
                ElementType::Int64
            }

            fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
                enc.write_i64(*self as i64);
                Ok(())
            }
        }

        impl FromBson for $t {
            fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
                let n = dec.read_integer::<Self>(element)?;
                <$t>::try_from(n).map_err(|_| out_of_range::<Self>(n))
            }
        }
    )*};
}

int32_types!(i8, i16, i32, u8, u16);
int64_types!(i64, u32);

impl ToBson for u64 {
    fn element_type(&self) -> ElementType {
        ElementType::Int64
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        let n = i64::try_from(*self).map_err(|_| out_of_range::<i64>(*self))?;
        enc.write_i64(n);
        Ok(())
    }
}

impl FromBson for u64 {
    fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
        let n = dec.read_integer::<Self>(element)?;
        u64::try_from(n).map_err(|_| out_of_range::<Self>(n))
    }
}

impl ToBson for f64 {
    fn element_type(&self) -> ElementType {
        ElementType::Double
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        enc.write_f64(*self);
        Ok(())
    }
}

impl FromBson for f64 {
    fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
        dec.read_number::<Self>(element)
    }
}

/// f32 提升为 f64 写出
impl ToBson for f32 {
    fn element_type(&self) -> ElementType {
        ElementType::Double
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        enc.write_f64(f64::from(*self));
        Ok(())
    }
}

impl FromBson for f32 {
    fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
        Ok(dec.read_number::<Self>(element)? as f32)
    }
}

impl ToBson for str {
    fn element_type(&self) -> ElementType {
        ElementType::String
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        enc.write_string(self)
    }
}

impl ToBson for String {
    fn element_type(&self) -> ElementType {
        ElementType::String
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        enc.write_string(self)
    }
}

impl FromBson for String {
    fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
        dec.read_text::<Self>(element).map(str::to_string)
    }
}

impl ToBson for CompactString {
    fn element_type(&self) -> ElementType {
        ElementType::String
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        enc.write_string(self)
    }
}

impl FromBson for CompactString {
    fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
        dec.read_text::<Self>(element).map(CompactString::new)
    }
}

// ============================================================================
// 二进制、标识、时间
// ============================================================================

impl ToBson for Binary {
    fn element_type(&self) -> ElementType {
        ElementType::Binary
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        enc.write_binary(self.subtype, &self.bytes)
    }
}

impl FromBson for Binary {
    fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
        dec.expect::<Self>(element, ElementType::Binary)?;
        dec.read_binary()
    }
}

impl ToBson for bytes::Bytes {
    fn element_type(&self) -> ElementType {
        ElementType::Binary
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        enc.write_binary(binary_subtype::GENERAL, self)
    }
}

impl FromBson for bytes::Bytes {
    fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
        dec.expect::<Self>(element, ElementType::Binary)?;
        Ok(bytes::Bytes::from(dec.read_binary()?.bytes))
    }
}

/// UUID 按旧式 GUID 小端布局写成子类型 3
impl ToBson for Uuid {
    fn element_type(&self) -> ElementType {
        ElementType::Binary
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        enc.write_binary(binary_subtype::UUID_LEGACY, &self.to_bytes_le())
    }
}

impl FromBson for Uuid {
    fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
        dec.expect::<Self>(element, ElementType::Binary)?;
        match BsonValue::from_binary(dec.read_binary()?) {
            BsonValue::Uuid(uuid) => Ok(uuid),
            _ => Err(BsonError::Structural("Binary payload is not a UUID".to_string())),
        }
    }
}

impl ToBson for ObjectId {
    fn element_type(&self) -> ElementType {
        ElementType::ObjectId
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        enc.write_raw(self.as_bytes());
        Ok(())
    }
}

impl FromBson for ObjectId {
    fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
        dec.expect::<Self>(element, ElementType::ObjectId)?;
        dec.read_object_id()
    }
}

/// 毫秒精度，亚毫秒部分截断
impl ToBson for DateTime<Utc> {
    fn element_type(&self) -> ElementType {
        ElementType::DateTime
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        enc.write_i64(self.timestamp_millis());
        Ok(())
    }
}

impl FromBson for DateTime<Utc> {
    fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
        dec.expect::<Self>(element, ElementType::DateTime)?;
        dec.read_datetime()
    }
}

impl ToBson for RegexValue {
    fn element_type(&self) -> ElementType {
        ElementType::Regex
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        enc.write_cstring(&self.pattern)?;
        enc.write_cstring(&self.options.to_option_string())
    }
}

impl FromBson for RegexValue {
    fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
        dec.expect::<Self>(element, ElementType::Regex)?;
        dec.read_regex()
    }
}

impl ToBson for ScopedCode {
    fn element_type(&self) -> ElementType {
        ElementType::ScopedCode
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        enc.write_scoped_code(&self.code, &self.scope)
    }
}

impl FromBson for ScopedCode {
    fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
        dec.expect::<Self>(element, ElementType::ScopedCode)?;
        dec.read_scoped_code()
    }
}

// ============================================================================
// 动态值与容器
// ============================================================================

impl ToBson for BsonValue {
    fn element_type(&self) -> ElementType {
        BsonValue::element_type(self)
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        enc.write_value(self)
    }
}

impl FromBson for BsonValue {
    const NULLABLE: bool = true;

    fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
        dec.read_value(element)
    }
}

impl ToBson for Expando {
    fn element_type(&self) -> ElementType {
        ElementType::Document
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        enc.write_expando(self)
    }
}

impl FromBson for Expando {
    fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
        dec.expect::<Self>(element, ElementType::Document)?;
        dec.read_expando()
    }

    /// 合并到已有容器
    fn read_into(&mut self, element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<()> {
        let incoming = Self::read_payload(element, dec)?;
        self.merge(incoming);
        Ok(())
    }
}

impl<T: ToBson> ToBson for Option<T> {
    fn element_type(&self) -> ElementType {
        match self {
            Some(value) => value.element_type(),
            None => ElementType::Null,
        }
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        match self {
            Some(value) => value.write_payload(enc),
            None => Ok(()),
        }
    }
}

impl<T: FromBson> FromBson for Option<T> {
    const NULLABLE: bool = true;

    fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
        if element.is_null() {
            Ok(None)
        } else {
            T::read_payload(element, dec).map(Some)
        }
    }
}

impl<T: ToBson> ToBson for Vec<T> {
    fn element_type(&self) -> ElementType {
        ElementType::Array
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        enc.write_array(self.iter())
    }
}

impl<T: ToBson> ToBson for [T] {
    fn element_type(&self) -> ElementType {
        ElementType::Array
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        enc.write_array(self.iter())
    }
}

impl<T: FromBson> FromBson for Vec<T> {
    fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
        let mut items = Vec::new();
        items.read_into(element, dec)?;
        Ok(items)
    }

    /// 追加到已有元素之后
    fn read_into(&mut self, element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<()> {
        dec.expect::<Self>(element, ElementType::Array)?;
        dec.read_array_with(|dec, item| {
            self.push(T::read_payload(item, dec)?);
            Ok(())
        })
    }
}

macro_rules! string_map_types {
    ($($map:ident $(, $hasher:ident)?);*) => {$(
        impl<V: ToBson $(, $hasher: BuildHasher)?> ToBson for $map<String, V $(, $hasher)?> {
            fn element_type(&self) -> ElementType {
                ElementType::Document
            }

            fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
                enc.write_map(self.iter())
            }
        }

        impl<V: FromBson $(, $hasher: BuildHasher + Default)?> FromBson for $map<String, V $(, $hasher)?> {
            fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
                let mut map = Self::default();
                map.read_into(element, dec)?;
                Ok(map)
            }

            /// 插入到已有映射中，同名键被覆盖
            fn read_into(&mut self, element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<()> {
                dec.expect::<Self>(element, ElementType::Document)?;
                dec.read_document_with(|dec, item, name| {
                    let value = V::read_payload(item, dec)?;
                    self.insert(name.to_string(), value);
                    Ok(())
                })
            }
        }
    )*};
}

string_map_types!(HashMap, S; IndexMap, S; BTreeMap);

// ============================================================================
// 多态实体
// ============================================================================

/// 多态槽位：具体类型必须带判别字段
impl ToBson for dyn AnyEntity {
    fn element_type(&self) -> ElementType {
        ElementType::Document
    }

    fn write_payload(&self, enc: &mut BsonEncoder<'_>) -> BsonResult<()> {
        self.write_discriminated(enc)
    }
}

impl FromBson for Box<dyn AnyEntity> {
    fn read_payload(element: ElementType, dec: &mut BsonDecoder<'_>) -> BsonResult<Self> {
        dec.expect::<Self>(element, ElementType::Document)?;
        dec.read_polymorphic()
    }
}

/// 为实现了 `BsonEntity` 的类型生成 `ToBson` / `FromBson`
///
/// ```rust,ignore
/// impl BsonEntity for Post { /* describe */ }
/// norm_bson::bson_entity!(Post, Comment);
/// ```
#[macro_export]
macro_rules! bson_entity {
    ($($ty:ty),+ $(,)?) => {$(
        impl $crate::ToBson for $ty {
            fn element_type(&self) -> $crate::ElementType {
                $crate::ElementType::Document
            }

            fn write_payload(&self, enc: &mut $crate::BsonEncoder<'_>) -> $crate::BsonResult<()> {
                enc.write_entity(self)
            }
        }

        impl $crate::FromBson for $ty {
            fn read_payload(
                element: $crate::ElementType,
                dec: &mut $crate::BsonDecoder<'_>,
            ) -> $crate::BsonResult<Self> {
                dec.read_entity::<Self>(element)
            }
        }
    )+};
}

/// 为无字段枚举生成整型编码
///
/// 枚举需要 `Copy`。解码接受 int32、int64 以及截断后的 double；
/// 不对应任何成员的整数返回 `ValueOutOfRange`。
///
/// ```rust,ignore
/// #[derive(Debug, Clone, Copy, PartialEq)]
/// enum Color { Red, Green }
/// norm_bson::bson_enum!(Color as i32 { Red, Green });
/// ```
#[macro_export]
macro_rules! bson_enum {
    ($ty:ident as i32 { $($variant:ident),+ $(,)? }) => {
        $crate::bson_enum!(@impl $ty, i32, Int32, $($variant),+);
    };
    ($ty:ident as i64 { $($variant:ident),+ $(,)? }) => {
        $crate::bson_enum!(@impl $ty, i64, Int64, $($variant),+);
    };
    (@impl $ty:ident, $repr:ty, $tag:ident, $($variant:ident),+) => {
        impl $crate::ToBson for $ty {
            fn element_type(&self) -> $crate::ElementType {
                $crate::ElementType::$tag
            }

            fn write_payload(&self, enc: &mut $crate::BsonEncoder<'_>) -> $crate::BsonResult<()> {
                $crate::ToBson::write_payload(&(*self as $repr), enc)
            }
        }

        impl $crate::FromBson for $ty {
            fn read_payload(
                element: $crate::ElementType,
                dec: &mut $crate::BsonDecoder<'_>,
            ) -> $crate::BsonResult<Self> {
                let raw = dec.read_enum_integer::<Self>(element)?;
                $(
                    if raw == $ty::$variant as i64 {
                        return Ok($ty::$variant);
                    }
                )+
                Err($crate::BsonError::ValueOutOfRange(format!(
                    "{} is not a member of {}",
                    raw,
                    stringify!($ty)
                )))
            }
        }
    };
}
