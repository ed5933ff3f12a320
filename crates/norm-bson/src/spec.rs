/// 自描述类型字段名，必须是文档的第一个字段
pub const DISCRIMINATOR_FIELD: &str = "__type";
pub const ID_FIELD: &str = "_id";
/// 引用包装类型(`DbReference`)的标识符字段名
pub const REFERENCE_ID_FIELD: &str = "$id";
pub const SERVER_ERROR_FIELDS: [&str; 2] = ["$err", "errmsg"];

/// 最短文档: 4 字节长度 + 结束符
pub const MIN_DOCUMENT_SIZE: usize = 5;
pub const MAX_NESTING_DEPTH: usize = 100;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Double = 0x01,
    String = 0x02,
    Document = 0x03,
    Array = 0x04,
    Binary = 0x05,
    Undefined = 0x06,
    ObjectId = 0x07,
    Boolean = 0x08,
    DateTime = 0x09,
    Null = 0x0A,
    Regex = 0x0B,
    Reference = 0x0C,
    Code = 0x0D,
    Symbol = 0x0E,
    ScopedCode = 0x0F,
    Int32 = 0x10,
    Timestamp = 0x11,
    Int64 = 0x12,
}

impl ElementType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Double),
            0x02 => Some(Self::String),
            0x03 => Some(Self::Document),
            0x04 => Some(Self::Array),
            0x05 => Some(Self::Binary),
            0x06 => Some(Self::Undefined),
            0x07 => Some(Self::ObjectId),
            0x08 => Some(Self::Boolean),
            0x09 => Some(Self::DateTime),
            0x0A => Some(Self::Null),
            0x0B => Some(Self::Regex),
            0x0C => Some(Self::Reference),
            0x0D => Some(Self::Code),
            0x0E => Some(Self::Symbol),
            0x0F => Some(Self::ScopedCode),
            0x10 => Some(Self::Int32),
            0x11 => Some(Self::Timestamp),
            0x12 => Some(Self::Int64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Double => "double",
            Self::String => "string",
            Self::Document => "document",
            Self::Array => "array",
            Self::Binary => "binary",
            Self::Undefined => "undefined",
            Self::ObjectId => "objectId",
            Self::Boolean => "boolean",
            Self::DateTime => "dateTime",
            Self::Null => "null",
            Self::Regex => "regex",
            Self::Reference => "dbPointer",
            Self::Code => "code",
            Self::Symbol => "symbol",
            Self::ScopedCode => "codeWithScope",
            Self::Int32 => "int32",
            Self::Timestamp => "timestamp",
            Self::Int64 => "int64",
        }
    }

    /// null 与 undefined 都没有载荷，解码时同样视为空值
    pub fn is_null(self) -> bool {
        matches!(self, Self::Null | Self::Undefined)
    }
}

/// 二进制子类型
pub mod binary_subtype {
    pub const GENERAL: u8 = 0x00;
    pub const FUNCTION: u8 = 0x01;
    /// 旧式二进制：载荷内部再带一个 4 字节长度
    pub const OLD_BINARY: u8 = 0x02;
    /// 旧式 UUID(小端 GUID 布局)
    pub const UUID_LEGACY: u8 = 0x03;
    pub const UUID: u8 = 0x04;
    pub const MD5: u8 = 0x05;
    pub const USER_DEFINED: u8 = 0x80;
}
