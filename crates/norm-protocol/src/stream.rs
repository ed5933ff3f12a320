//! 消息与文档的流式读写
//!
//! 异步部分基于 tokio 的 `AsyncRead` / `AsyncWrite`；`read_document`
//! 面向同步的 `std::io::Read`，用于读取首尾相接的文档文件。

use crate::message::{Message, MessageHeader};
use crate::{ProtocolError, ProtocolResult};
use bytes::{Bytes, BytesMut};
use norm_common::WireConfig;
use std::io::{self, Read};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// 最小文档：长度前缀 + 结束符
const MIN_DOCUMENT_SIZE: usize = 5;

/// # Brief
/// 读取一条完整消息
///
/// # Arguments
/// * `reader` - 异步输入流
/// * `config` - 提供 `max_message_size`
///
/// # Returns
/// 消息头声明的长度超过上限时在读取消息体之前返回 `MessageTooLarge`
pub async fn read_message<R>(reader: &mut R, config: &WireConfig) -> ProtocolResult<Message>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; MessageHeader::SIZE];
    reader.read_exact(&mut head).await?;
    let header = MessageHeader::parse(&head, config.max_message_size)?;

    let mut body = BytesMut::zeroed(header.body_len());
    reader.read_exact(&mut body).await?;
    trace!(
        "Read {:?} message {} ({} bytes)",
        header.op_code,
        header.request_id,
        header.message_length
    );
    Ok(Message {
        header,
        body: body.freeze(),
    })
}

/// 写出一条消息并刷新
pub async fn write_message<W>(writer: &mut W, message: &Message, config: &WireConfig) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    let size = message.encoded_len();
    if size > config.max_message_size {
        return Err(ProtocolError::MessageTooLarge {
            size,
            max: config.max_message_size,
        });
    }
    writer.write_all(&message.encode()).await?;
    writer.flush().await?;
    trace!(
        "Wrote {:?} message {} ({} bytes)",
        message.header.op_code,
        message.header.request_id,
        size
    );
    Ok(())
}

/// # Brief
/// 从同步输入中读取下一个文档的完整字节
///
/// # Returns
/// 在文档边界上遇到输入结束时返回 `Ok(None)`；文档中途结束返回 `Io(UnexpectedEof)`
pub fn read_document<R: Read>(reader: &mut R, max_document_size: usize) -> ProtocolResult<Option<Bytes>> {
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let declared = i32::from_le_bytes(prefix);
    let size = usize::try_from(declared)
        .ok()
        .filter(|len| *len >= MIN_DOCUMENT_SIZE)
        .ok_or_else(|| ProtocolError::InvalidMessage(format!("Invalid document length {}", declared)))?;
    if size > max_document_size {
        return Err(ProtocolError::DocumentTooLarge {
            size,
            max: max_document_size,
        });
    }

    let mut doc = BytesMut::zeroed(size);
    doc[..4].copy_from_slice(&prefix);
    reader.read_exact(&mut doc[4..])?;
    if doc[size - 1] != 0 {
        return Err(ProtocolError::InvalidMessage(
            "Document is not terminated with 0x00".to_string(),
        ));
    }
    Ok(Some(doc.freeze()))
}
