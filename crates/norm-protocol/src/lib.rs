//! # norm-protocol - 旧版线协议消息层
//!
//! 把编解码器产出的文档装进线协议消息：
//!
//! - **消息**：16 字节小端消息头 + 各操作码的消息体
//! - **批量插入**：按文档体积和条数上限切分为多条 `OP_INSERT`
//! - **应答**：解析 `OP_REPLY`，服务端错误以 `ServerReported` 报告
//! - **流**：基于 tokio 的消息读写，以及同步读取单个文档

pub mod batch;
pub mod message;
pub mod reply;
pub mod stream;

pub use batch::InsertBatcher;
pub use message::{
    next_request_id, GetMoreMessage, InsertFlags, InsertMessage, KillCursorsMessage, Message,
    MessageHeader, OpCode, QueryFlags, QueryMessage, RequestMessage,
};
pub use reply::{Reply, ResponseFlags};
pub use stream::{read_document, read_message, write_message};

use norm_bson::BsonError;
use norm_common::NormError;
use thiserror::Error;

/// 协议层错误
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("BSON error: {0}")]
    Bson(#[from] BsonError),

    #[error("{0}")]
    Common(#[from] NormError),

    /// 单个文档超过服务端允许的体积
    #[error("Document of {size} bytes exceeds the limit of {max} bytes")]
    DocumentTooLarge { size: usize, max: usize },

    #[error("Message of {size} bytes exceeds the limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// 消息头或消息体的布局错误
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Unexpected op code: {0}")]
    UnexpectedOpCode(i32),

    #[error("Cursor {0} not found on server")]
    CursorNotFound(i64),
}

impl ProtocolError {
    /// 服务端返回的错误消息(`$err` / `errmsg` / QueryFailure)
    pub fn server_message(&self) -> Option<&str> {
        match self {
            ProtocolError::Bson(BsonError::ServerReported(msg)) => Some(msg),
            _ => None,
        }
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
