//! 错误类型定义模块
//!
//! 定义 norm 公共层的错误类型 NormError 和 Result 别名。
//! 编解码错误见 `norm_bson::BsonError`，协议层错误见 `norm_protocol::ProtocolError`。

use thiserror::Error;

/// norm 公共错误类型
#[derive(Error, Debug)]
pub enum NormError {
    /// I/O 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// ObjectId 无效
    #[error("Invalid ObjectId: {0}")]
    InvalidObjectId(String),

    /// 名称等输入校验失败
    #[error("Validation error: {0}")]
    Validation(String),

    /// 配置文件解析失败
    #[error("Config error: {0}")]
    Config(String),
}

/// norm Result 类型别名
pub type NormResult<T> = Result<T, NormError>;
