//! 值类型定义模块
//!
//! 定义线格式支持的所有动态值类型。静态类型的字段直接走
//! `ToBson`/`FromBson` 编解码，不经过这里；`BsonValue` 用于无类型目标、
//! 溢出容器(`Expando`)以及“按标签推断默认类型”的解码路径。

use crate::expando::Expando;
use crate::spec::{binary_subtype, ElementType};
use crate::{BsonError, BsonResult};
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use norm_common::ObjectId;
use std::fmt;
use uuid::Uuid;

/// 动态值
///
/// # 支持的类型
///
/// - **基础类型**: Null, Boolean, Int32, Int64, Double, String, Binary
/// - **标识类型**: ObjectId, Uuid
/// - **时间类型**: DateTime, Timestamp
/// - **复合类型**: Array, Document
/// - **特殊类型**: Regex, Code, Symbol, ScopedCode, Pointer
#[derive(Debug, Clone, PartialEq)]
pub enum BsonValue {
    /// 空值(undefined 也解码为 Null)
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    /// IEEE754 双精度；f32 在编码时提升为 f64
    Double(f64),
    String(String),
    /// 通用或未识别子类型的二进制数据
    Binary(Binary),
    /// 二进制子类型 3
    Uuid(Uuid),
    ObjectId(ObjectId),
    /// UTC 日期时间，毫秒精度
    DateTime(DateTime<Utc>),
    Regex(RegexValue),
    Code(String),
    Symbol(String),
    ScopedCode(ScopedCode),
    /// 旧式 DBPointer
    Pointer(DbPointer),
    /// 服务端内部时间戳
    Timestamp(u64),
    Array(Vec<BsonValue>),
    Document(Expando),
}

/// 二进制载荷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    pub subtype: u8,
    pub bytes: Vec<u8>,
}

impl Binary {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            subtype: binary_subtype::GENERAL,
            bytes: bytes.into(),
        }
    }

    pub fn with_subtype(subtype: u8, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            subtype,
            bytes: bytes.into(),
        }
    }
}

/// 旧式数据库指针(元素类型 0x0C)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbPointer {
    pub namespace: String,
    pub id: ObjectId,
}

/// 带作用域的代码块
///
/// 线格式: 4 字节块长度 + 代码字符串 + 作用域文档
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScopedCode {
    pub code: String,
    pub scope: Expando,
}

impl ScopedCode {
    pub fn new(code: impl Into<String>, scope: Expando) -> Self {
        Self {
            code: code.into(),
            scope,
        }
    }
}

bitflags! {
    /// 正则表达式选项
    ///
    /// 线格式上每个标志对应一个固定字符，按 `i m x s l u` 的规范顺序输出。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegexOptions: u8 {
        const IGNORE_CASE = 1 << 0;
        const MULTILINE = 1 << 1;
        /// 忽略模式中的空白(free-spacing)
        const EXTENDED = 1 << 2;
        /// `.` 匹配换行
        const SINGLELINE = 1 << 3;
        const CULTURE_INVARIANT = 1 << 4;
        const ECMA_SCRIPT = 1 << 5;
    }
}

const OPTION_CODES: [(RegexOptions, char); 6] = [
    (RegexOptions::IGNORE_CASE, 'i'),
    (RegexOptions::MULTILINE, 'm'),
    (RegexOptions::EXTENDED, 'x'),
    (RegexOptions::SINGLELINE, 's'),
    (RegexOptions::CULTURE_INVARIANT, 'l'),
    (RegexOptions::ECMA_SCRIPT, 'u'),
];

impl RegexOptions {
    pub fn to_option_string(self) -> String {
        OPTION_CODES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, code)| *code)
            .collect()
    }

    /// 未识别的字符被忽略，以兼容其他驱动写入的选项
    pub fn from_option_str(options: &str) -> Self {
        options.chars().fold(Self::empty(), |acc, c| {
            match OPTION_CODES.iter().find(|(_, code)| *code == c) {
                Some((flag, _)) => acc | *flag,
                None => acc,
            }
        })
    }
}

impl Default for RegexOptions {
    fn default() -> Self {
        Self::empty()
    }
}

/// 正则表达式值
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegexValue {
    pub pattern: String,
    pub options: RegexOptions,
}

impl RegexValue {
    pub fn new(pattern: impl Into<String>, options: RegexOptions) -> Self {
        Self {
            pattern: pattern.into(),
            options,
        }
    }

    /// 编译为本地正则
    ///
    /// `CULTURE_INVARIANT` 与 `ECMA_SCRIPT` 在 `regex` 中没有对应语义，编译时忽略。
    pub fn to_regex(&self) -> BsonResult<regex::Regex> {
        regex::RegexBuilder::new(&self.pattern)
            .case_insensitive(self.options.contains(RegexOptions::IGNORE_CASE))
            .multi_line(self.options.contains(RegexOptions::MULTILINE))
            .ignore_whitespace(self.options.contains(RegexOptions::EXTENDED))
            .dot_matches_new_line(self.options.contains(RegexOptions::SINGLELINE))
            .build()
            .map_err(|e| BsonError::Conversion(format!("Invalid regex /{}/: {}", self.pattern, e)))
    }
}

impl fmt::Display for RegexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.pattern, self.options.to_option_string())
    }
}

impl BsonValue {
    pub fn type_name(&self) -> &'static str {
        self.element_type().name()
    }

    /// 值在线格式上对应的元素类型
    pub fn element_type(&self) -> ElementType {
        match self {
            BsonValue::Null => ElementType::Null,
            BsonValue::Boolean(_) => ElementType::Boolean,
            BsonValue::Int32(_) => ElementType::Int32,
            BsonValue::Int64(_) => ElementType::Int64,
            BsonValue::Double(_) => ElementType::Double,
            BsonValue::String(_) => ElementType::String,
            BsonValue::Binary(_) | BsonValue::Uuid(_) => ElementType::Binary,
            BsonValue::ObjectId(_) => ElementType::ObjectId,
            BsonValue::DateTime(_) => ElementType::DateTime,
            BsonValue::Regex(_) => ElementType::Regex,
            BsonValue::Code(_) => ElementType::Code,
            BsonValue::Symbol(_) => ElementType::Symbol,
            BsonValue::ScopedCode(_) => ElementType::ScopedCode,
            BsonValue::Pointer(_) => ElementType::Reference,
            BsonValue::Timestamp(_) => ElementType::Timestamp,
            BsonValue::Array(_) => ElementType::Array,
            BsonValue::Document(_) => ElementType::Document,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, BsonValue::Null)
    }

    /// 按子类型还原二进制载荷：16 字节的子类型 3/4 视为 UUID
    pub fn from_binary(binary: Binary) -> Self {
        let uuid_bytes = <[u8; 16]>::try_from(binary.bytes.as_slice()).ok();
        match (binary.subtype, uuid_bytes) {
            (binary_subtype::UUID_LEGACY, Some(raw)) => BsonValue::Uuid(Uuid::from_bytes_le(raw)),
            (binary_subtype::UUID, Some(raw)) => BsonValue::Uuid(Uuid::from_bytes(raw)),
            _ => BsonValue::Binary(binary),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            BsonValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            BsonValue::Int32(n) => Some(*n),
            BsonValue::Int64(n) => i32::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            BsonValue::Int32(n) => Some(*n as i64),
            BsonValue::Int64(n) => Some(*n),
            _ => None,
        }
    }

    /// 数值类型统一转为 f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            BsonValue::Double(n) => Some(*n),
            BsonValue::Int32(n) => Some(*n as f64),
            BsonValue::Int64(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            BsonValue::String(s) | BsonValue::Symbol(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            BsonValue::ObjectId(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            BsonValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<BsonValue>> {
        match self {
            BsonValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Expando> {
        match self {
            BsonValue::Document(doc) => Some(doc),
            _ => None,
        }
    }

    /// 从文档中按键(大小写不敏感)取值，或从数组中按下标取值
    pub fn get(&self, key: &str) -> Option<&BsonValue> {
        match self {
            BsonValue::Document(doc) => doc.get_value(key),
            BsonValue::Array(arr) => key.parse::<usize>().ok().and_then(|i| arr.get(i)),
            _ => None,
        }
    }

    /// 按点分隔路径获取嵌套值，如 "author.address.city"
    pub fn get_path(&self, path: &str) -> Option<&BsonValue> {
        path.split('.').try_fold(self, |current, part| current.get(part))
    }
}

impl Default for BsonValue {
    fn default() -> Self {
        BsonValue::Null
    }
}

impl fmt::Display for BsonValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BsonValue::Null => write!(f, "null"),
            BsonValue::Boolean(b) => write!(f, "{}", b),
            BsonValue::Int32(n) => write!(f, "{}", n),
            BsonValue::Int64(n) => write!(f, "NumberLong({})", n),
            BsonValue::Double(n) => write!(f, "{}", n),
            BsonValue::String(s) => write!(f, "\"{}\"", s),
            BsonValue::Binary(b) => write!(f, "<binary:{:#04x}:{} bytes>", b.subtype, b.bytes.len()),
            BsonValue::Uuid(u) => write!(f, "UUID(\"{}\")", u),
            BsonValue::ObjectId(id) => write!(f, "ObjectId(\"{}\")", id),
            BsonValue::DateTime(dt) => write!(f, "ISODate(\"{}\")", dt.to_rfc3339()),
            BsonValue::Regex(r) => write!(f, "{}", r),
            BsonValue::Code(code) => write!(f, "Code({})", code),
            BsonValue::Symbol(s) => write!(f, "Symbol({})", s),
            BsonValue::ScopedCode(c) => write!(f, "Code({}, {})", c.code, c.scope),
            BsonValue::Pointer(p) => write!(f, "DBPointer(\"{}\", {})", p.namespace, p.id),
            BsonValue::Timestamp(ts) => write!(f, "Timestamp({}, {})", ts >> 32, ts & 0xFFFF_FFFF),
            BsonValue::Array(arr) => {
                write!(f, "[")?;
                for (i, v) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            BsonValue::Document(doc) => write!(f, "{}", doc),
        }
    }
}

// ============================================================================
// From 特征实现 - 支持从各种 Rust 类型转换为 BsonValue
// ============================================================================

impl From<bool> for BsonValue {
    fn from(v: bool) -> Self {
        BsonValue::Boolean(v)
    }
}

impl From<i32> for BsonValue {
    fn from(v: i32) -> Self {
        BsonValue::Int32(v)
    }
}

impl From<i64> for BsonValue {
    fn from(v: i64) -> Self {
        BsonValue::Int64(v)
    }
}

impl From<f32> for BsonValue {
    fn from(v: f32) -> Self {
        BsonValue::Double(v as f64)
    }
}

impl From<f64> for BsonValue {
    fn from(v: f64) -> Self {
        BsonValue::Double(v)
    }
}

impl From<&str> for BsonValue {
    fn from(v: &str) -> Self {
        BsonValue::String(v.to_string())
    }
}

impl From<String> for BsonValue {
    fn from(v: String) -> Self {
        BsonValue::String(v)
    }
}

impl From<Binary> for BsonValue {
    fn from(v: Binary) -> Self {
        BsonValue::Binary(v)
    }
}

impl From<bytes::Bytes> for BsonValue {
    fn from(v: bytes::Bytes) -> Self {
        BsonValue::Binary(Binary::new(v.to_vec()))
    }
}

impl From<ObjectId> for BsonValue {
    fn from(v: ObjectId) -> Self {
        BsonValue::ObjectId(v)
    }
}

impl From<Uuid> for BsonValue {
    fn from(v: Uuid) -> Self {
        BsonValue::Uuid(v)
    }
}

impl From<DateTime<Utc>> for BsonValue {
    fn from(v: DateTime<Utc>) -> Self {
        BsonValue::DateTime(v)
    }
}

impl From<RegexValue> for BsonValue {
    fn from(v: RegexValue) -> Self {
        BsonValue::Regex(v)
    }
}

impl From<ScopedCode> for BsonValue {
    fn from(v: ScopedCode) -> Self {
        BsonValue::ScopedCode(v)
    }
}

impl From<Expando> for BsonValue {
    fn from(v: Expando) -> Self {
        BsonValue::Document(v)
    }
}

impl<T: Into<BsonValue>> From<Vec<T>> for BsonValue {
    fn from(v: Vec<T>) -> Self {
        BsonValue::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<BsonValue>> From<Option<T>> for BsonValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(BsonValue::Null)
    }
}

// ============================================================================
// FromBsonValue - 从动态值中取出具体类型(Expando::get 使用)
// ============================================================================

/// 从 `BsonValue` 借用视图构造具体类型
///
/// 类型不匹配时返回 `None`，由调用方决定报错方式。
pub trait FromBsonValue: Sized {
    fn from_bson_value(value: &BsonValue) -> Option<Self>;
}

impl FromBsonValue for BsonValue {
    fn from_bson_value(value: &BsonValue) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromBsonValue for bool {
    fn from_bson_value(value: &BsonValue) -> Option<Self> {
        value.as_bool()
    }
}

impl FromBsonValue for i32 {
    fn from_bson_value(value: &BsonValue) -> Option<Self> {
        value.as_i32()
    }
}

impl FromBsonValue for i64 {
    fn from_bson_value(value: &BsonValue) -> Option<Self> {
        value.as_i64()
    }
}

impl FromBsonValue for f64 {
    fn from_bson_value(value: &BsonValue) -> Option<Self> {
        value.as_f64()
    }
}

impl FromBsonValue for String {
    fn from_bson_value(value: &BsonValue) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl FromBsonValue for ObjectId {
    fn from_bson_value(value: &BsonValue) -> Option<Self> {
        value.as_object_id()
    }
}

impl FromBsonValue for Uuid {
    fn from_bson_value(value: &BsonValue) -> Option<Self> {
        match value {
            BsonValue::Uuid(u) => Some(*u),
            _ => None,
        }
    }
}

impl FromBsonValue for DateTime<Utc> {
    fn from_bson_value(value: &BsonValue) -> Option<Self> {
        value.as_datetime()
    }
}

impl FromBsonValue for RegexValue {
    fn from_bson_value(value: &BsonValue) -> Option<Self> {
        match value {
            BsonValue::Regex(r) => Some(r.clone()),
            _ => None,
        }
    }
}

impl FromBsonValue for Binary {
    fn from_bson_value(value: &BsonValue) -> Option<Self> {
        match value {
            BsonValue::Binary(b) => Some(b.clone()),
            _ => None,
        }
    }
}

impl FromBsonValue for Expando {
    fn from_bson_value(value: &BsonValue) -> Option<Self> {
        value.as_document().cloned()
    }
}

impl FromBsonValue for Vec<BsonValue> {
    fn from_bson_value(value: &BsonValue) -> Option<Self> {
        value.as_array().cloned()
    }
}

impl<T: FromBsonValue> FromBsonValue for Option<T> {
    fn from_bson_value(value: &BsonValue) -> Option<Self> {
        match value {
            BsonValue::Null => Some(None),
            other => T::from_bson_value(other).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regex_option_string_is_canonical() {
        let options = RegexOptions::SINGLELINE | RegexOptions::IGNORE_CASE | RegexOptions::MULTILINE;
        assert_eq!(options.to_option_string(), "ims");
        assert_eq!(RegexOptions::all().to_option_string(), "imxslu");
        assert_eq!(RegexOptions::empty().to_option_string(), "");
    }

    #[test]
    fn test_regex_option_parse_ignores_unknown() {
        let options = RegexOptions::from_option_str("gmi");
        assert_eq!(options, RegexOptions::IGNORE_CASE | RegexOptions::MULTILINE);
    }

    #[test]
    fn test_regex_compiles_with_flags() {
        let value = RegexValue::new("^abc$", RegexOptions::IGNORE_CASE | RegexOptions::MULTILINE);
        let re = value.to_regex().unwrap();
        assert!(re.is_match("xyz\nABC\n"));
        assert!(RegexValue::new("(", RegexOptions::empty()).to_regex().is_err());
    }

    #[test]
    fn test_numeric_accessors() {
        assert_eq!(BsonValue::Int64(7).as_i32(), Some(7));
        assert_eq!(BsonValue::Int64(i64::MAX).as_i32(), None);
        assert_eq!(BsonValue::Int32(3).as_f64(), Some(3.0));
        assert_eq!(BsonValue::from(1.5f32), BsonValue::Double(1.5));
    }

    #[test]
    fn test_get_path() {
        let mut inner = Expando::new();
        inner.set("City", "Osaka");
        let mut outer = Expando::new();
        outer.set("address", inner);
        outer.set("tags", vec!["a", "b"]);
        let value = BsonValue::Document(outer);

        assert_eq!(value.get_path("address.city").and_then(|v| v.as_str()), Some("Osaka"));
        assert_eq!(value.get_path("tags.1").and_then(|v| v.as_str()), Some("b"));
        assert!(value.get_path("address.zip").is_none());
    }

    #[test]
    fn test_from_bson_value_option() {
        assert_eq!(Option::<i32>::from_bson_value(&BsonValue::Null), Some(None));
        assert_eq!(Option::<i32>::from_bson_value(&BsonValue::Int32(4)), Some(Some(4)));
        assert_eq!(Option::<i32>::from_bson_value(&BsonValue::Boolean(true)), None);
    }
}
