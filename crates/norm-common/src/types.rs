//! 公共类型定义模块
//!
//! 定义 norm 的核心类型:
//! - ObjectId: 12 字节数据库分配标识符
//! - DatabaseName: 数据库名称(带验证)
//! - Namespace: `database.collection` 形式的完整集合名称

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{NormError, NormResult};

static PROCESS_UNIQUE: Lazy<[u8; 5]> = Lazy::new(rand::random);
static OID_COUNTER: Lazy<AtomicU32> =
    Lazy::new(|| AtomicU32::new(rand::random::<u32>() & 0x00FF_FFFF));

/// ObjectId - 12 字节唯一标识符
///
/// 格式:
/// - 前 4 字节: 时间戳(秒,大端)
/// - 中间 5 字节: 进程级随机值
/// - 后 3 字节: 自增计数器(大端)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    pub fn new() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let counter = OID_COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&timestamp.to_be_bytes());
        bytes[4..9].copy_from_slice(&*PROCESS_UNIQUE);
        bytes[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// 生成时刻(Unix 秒)
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> NormResult<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| NormError::InvalidObjectId(format!("Invalid hex: {}", e)))?;
        let arr: [u8; 12] = bytes
            .try_into()
            .map_err(|_| NormError::InvalidObjectId("ObjectId must be 12 bytes".to_string()))?;
        Ok(Self(arr))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for ObjectId {
    type Err = NormError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// 数据库名称
///
/// 带验证的数据库名称,限制:
/// - 不能为空
/// - 最大 64 字符
/// - 不能包含 `.`、空格、路径分隔符或 null 字符
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseName(String);

impl DatabaseName {
    pub fn new(name: impl Into<String>) -> NormResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(NormError::Validation(
                "Database name cannot be empty".to_string(),
            ));
        }
        if name.len() > 64 {
            return Err(NormError::Validation(
                "Database name cannot exceed 64 characters".to_string(),
            ));
        }
        if name.contains(['.', ' ', '/', '\\', '\0']) {
            return Err(NormError::Validation(format!(
                "Database name '{}' contains an illegal character",
                name
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 集合命名空间
///
/// 线协议中集合以 `database.collection` 的完整名称出现。
/// 集合名禁止:
/// - 空名称
/// - 包含 null 字符
/// - 以 `$` 开头(命令伪集合 `$cmd` 除外)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    database: DatabaseName,
    collection: String,
}

impl Namespace {
    pub const COMMAND_COLLECTION: &'static str = "$cmd";

    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> NormResult<Self> {
        let database = DatabaseName::new(database)?;
        let collection = collection.into();
        if collection.is_empty() {
            return Err(NormError::Validation(
                "Collection name cannot be empty".to_string(),
            ));
        }
        if collection.contains('\0') {
            return Err(NormError::Validation(
                "Collection name cannot contain null character".to_string(),
            ));
        }
        if collection.starts_with('$') && collection != Self::COMMAND_COLLECTION {
            return Err(NormError::Validation(format!(
                "Collection name '{}' cannot start with '$'",
                collection
            )));
        }
        Ok(Self {
            database,
            collection,
        })
    }

    /// 数据库命令所用的 `<db>.$cmd` 命名空间
    pub fn command(database: impl Into<String>) -> NormResult<Self> {
        Self::new(database, Self::COMMAND_COLLECTION)
    }

    pub fn database(&self) -> &str {
        self.database.as_str()
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

impl FromStr for Namespace {
    type Err = NormError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (db, coll) = s.split_once('.').ok_or_else(|| {
            NormError::Validation(format!("Namespace '{}' must be 'database.collection'", s))
        })?;
        Self::new(db, coll)
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}
