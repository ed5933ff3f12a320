//! # norm-bson - 带动态属性的 BSON 文档编解码器
//!
//! 在强类型实体与 BSON 字节之间做双向映射：
//!
//! - **实体映射**：类型通过 `BsonEntity::describe` 声明字段表，首次使用时构建并缓存
//! - **动态属性**：`Expando` 是大小写不敏感的有序字典，承接没有静态字段对应的线上字段
//! - **判别字段**：`__type` 作为首字段写出，解码时据此选择具体类型
//! - **流对齐**：解码失败时跳过当前文档剩余字节，同一缓冲区里的后续文档仍可读取
//!
//! ## 快速开始
//!
//! ```rust,ignore
//! use norm_bson::{bson_entity, BsonCodec, BsonEntity, TypeMapBuilder};
//!
//! #[derive(Debug, Default, PartialEq)]
//! struct Post {
//!     title: String,
//!     views: i32,
//! }
//!
//! impl BsonEntity for Post {
//!     fn describe(map: &mut TypeMapBuilder<Self>) {
//!         map.field("Title", |p| &p.title, |p, v| p.title = v);
//!         map.field("Views", |p| &p.views, |p, v| p.views = v);
//!     }
//! }
//! bson_entity!(Post);
//!
//! let codec = BsonCodec::new();
//! let bytes = codec.encode(&Post { title: "Hello".into(), views: 3 }).unwrap();
//! let post: Post = codec.decode(&bytes).unwrap();
//! ```

pub mod codec;
pub mod convert;
pub mod converter;
pub mod decoder;
pub mod encoder;
pub mod expando;
mod frame;
pub mod json;
pub mod mapping;
pub mod reference;
pub mod reflect;
pub mod registry;
pub mod spec;
pub mod value;

pub use codec::BsonCodec;
pub use convert::{FromBson, ToBson};
pub use converter::{DecimalAsString, DisplayFromStr, DurationAsMillis, ValueConverter};
pub use decoder::{BsonDecoder, Decoded, DocumentReader};
pub use encoder::{BsonEncoder, EncodeMode};
pub use expando::Expando;
pub use mapping::{AliasResolver, MappingConfig, TypeMapping};
pub use norm_common::ObjectId;
pub use reference::DbReference;
pub use reflect::{BsonEntity, PropertyMap, PropertyOptions, TypeMap, TypeMapBuilder, TypeMapCache};
pub use registry::{AnyEntity, TypeRegistry};
pub use spec::ElementType;
pub use value::{Binary, BsonValue, DbPointer, FromBsonValue, RegexOptions, RegexValue, ScopedCode};

use thiserror::Error;

/// 编解码错误
#[derive(Error, Debug)]
pub enum BsonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 意外的输入结束
    #[error("Unexpected end of input")]
    UnexpectedEof,

    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// 无法识别的元素类型字节
    #[error("Unknown element type: {0:#04x}")]
    UnknownElementType(u8),

    /// 字节布局错误：长度前缀与内容不符、缺少结束符、帧越界等
    #[error("Invalid document: {0}")]
    Structural(String),

    /// 非动态类型上出现了没有映射的字段
    #[error("Field '{field}' has no mapping on {type_name}")]
    UnmappedField { field: String, type_name: String },

    #[error("Discriminator '__type' must be the first field of a document")]
    DiscriminatorOutOfOrder,

    #[error("Unknown discriminator: {0}")]
    UnknownDiscriminator(String),

    /// 值的运行时类型没有对应的编码规则
    #[error("Unsupported type {rust_type} as {element}")]
    UnsupportedType { rust_type: String, element: String },

    /// 类型映射的构建规则互相矛盾，在缓存构建时立即报告
    #[error("Configuration conflict on {type_name}: {message}")]
    ConfigurationConflict { type_name: String, message: String },

    /// 文档本身携带 `$err` / `errmsg`，消息原样保留
    #[error("Server error: {0}")]
    ServerReported(String),

    #[error("Nesting too deep: max {0}")]
    NestingTooDeep(usize),

    #[error("Value out of range: {0}")]
    ValueOutOfRange(String),

    /// 值转换器或字符串解析失败
    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("Invalid ObjectId: {0}")]
    InvalidObjectId(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Type mismatch for '{key}': expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// 错误分类
///
/// 与上层约定的四类错误，外加值级别的取值/转换失败。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnsupportedType,
    StructuralDecode,
    ConfigurationConflict,
    ServerReported,
    Value,
}

impl BsonError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BsonError::UnsupportedType { .. } => ErrorKind::UnsupportedType,
            BsonError::Io(_)
            | BsonError::UnexpectedEof
            | BsonError::InvalidUtf8(_)
            | BsonError::UnknownElementType(_)
            | BsonError::Structural(_)
            | BsonError::UnmappedField { .. }
            | BsonError::DiscriminatorOutOfOrder
            | BsonError::UnknownDiscriminator(_)
            | BsonError::NestingTooDeep(_) => ErrorKind::StructuralDecode,
            BsonError::ConfigurationConflict { .. } => ErrorKind::ConfigurationConflict,
            BsonError::ServerReported(_) => ErrorKind::ServerReported,
            BsonError::ValueOutOfRange(_)
            | BsonError::Conversion(_)
            | BsonError::InvalidObjectId(_)
            | BsonError::KeyNotFound(_)
            | BsonError::TypeMismatch { .. } => ErrorKind::Value,
        }
    }

    pub(crate) fn unsupported<T: ?Sized>(element: &str) -> Self {
        BsonError::UnsupportedType {
            rust_type: std::any::type_name::<T>().to_string(),
            element: element.to_string(),
        }
    }

    pub(crate) fn conflict(type_name: &str, message: impl Into<String>) -> Self {
        BsonError::ConfigurationConflict {
            type_name: type_name.to_string(),
            message: message.into(),
        }
    }
}

impl From<norm_common::NormError> for BsonError {
    fn from(err: norm_common::NormError) -> Self {
        match err {
            norm_common::NormError::Io(e) => BsonError::Io(e),
            norm_common::NormError::InvalidObjectId(s) => BsonError::InvalidObjectId(s),
            other => BsonError::Conversion(other.to_string()),
        }
    }
}

pub type BsonResult<T> = Result<T, BsonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(BsonError::DiscriminatorOutOfOrder.kind(), ErrorKind::StructuralDecode);
        assert_eq!(
            BsonError::UnmappedField {
                field: "x".into(),
                type_name: "T".into()
            }
            .kind(),
            ErrorKind::StructuralDecode
        );
        assert_eq!(BsonError::conflict("T", "two ids").kind(), ErrorKind::ConfigurationConflict);
        assert_eq!(BsonError::ServerReported("boom".into()).kind(), ErrorKind::ServerReported);
        assert_eq!(BsonError::unsupported::<i32>("string").kind(), ErrorKind::UnsupportedType);
    }

    #[test]
    fn test_common_error_conversion() {
        let err: BsonError = norm_common::ObjectId::from_hex("zz").unwrap_err().into();
        assert!(matches!(err, BsonError::InvalidObjectId(_)));
    }
}
