//! 线协议消息
//!
//! 所有整数均为小端。消息头布局：
//!
//! ```text
//! message_length(i32) request_id(i32) response_to(i32) op_code(i32)
//! ```
//!
//! `message_length` 包含消息头本身的 16 字节。

use crate::{ProtocolError, ProtocolResult};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use norm_bson::{BsonCodec, ToBson};
use norm_common::Namespace;
use std::sync::atomic::{AtomicI32, Ordering};

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// 进程内递增的请求 ID
pub fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
}

impl TryFrom<i32> for OpCode {
    type Error = ProtocolError;

    fn try_from(value: i32) -> ProtocolResult<Self> {
        match value {
            1 => Ok(OpCode::Reply),
            2001 => Ok(OpCode::Update),
            2002 => Ok(OpCode::Insert),
            2004 => Ok(OpCode::Query),
            2005 => Ok(OpCode::GetMore),
            2006 => Ok(OpCode::Delete),
            2007 => Ok(OpCode::KillCursors),
            other => Err(ProtocolError::UnexpectedOpCode(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MessageHeader {
    pub const SIZE: usize = 16;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.message_length);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(self.op_code as i32);
    }

    /// # Brief
    /// 解析 16 字节消息头并校验长度
    ///
    /// # Arguments
    /// * `bytes` - 消息头字节
    /// * `max_message_size` - 允许的最大消息长度(含消息头)
    ///
    /// # Returns
    /// 长度小于消息头、超过上限或操作码未知时返回错误
    pub fn parse(bytes: &[u8; Self::SIZE], max_message_size: usize) -> ProtocolResult<Self> {
        let mut buf = &bytes[..];
        let message_length = buf.get_i32_le();
        let request_id = buf.get_i32_le();
        let response_to = buf.get_i32_le();
        let op_code = buf.get_i32_le();

        let size = usize::try_from(message_length)
            .ok()
            .filter(|len| *len >= Self::SIZE)
            .ok_or_else(|| {
                ProtocolError::InvalidMessage(format!("Message length {} is too small", message_length))
            })?;
        if size > max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: max_message_size,
            });
        }

        Ok(Self {
            message_length,
            request_id,
            response_to,
            op_code: OpCode::try_from(op_code)?,
        })
    }

    /// 消息体长度
    pub fn body_len(&self) -> usize {
        usize::try_from(self.message_length).unwrap_or(0).saturating_sub(Self::SIZE)
    }
}

/// 已分帧的完整消息
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub body: Bytes,
}

impl Message {
    pub fn new(op_code: OpCode, request_id: i32, response_to: i32, body: Bytes) -> ProtocolResult<Self> {
        let size = MessageHeader::SIZE + body.len();
        let message_length = i32::try_from(size).map_err(|_| ProtocolError::MessageTooLarge {
            size,
            max: i32::MAX as usize,
        })?;
        Ok(Self {
            header: MessageHeader {
                message_length,
                request_id,
                response_to,
                op_code,
            },
            body,
        })
    }

    pub fn op_code(&self) -> OpCode {
        self.header.op_code
    }

    pub fn encoded_len(&self) -> usize {
        MessageHeader::SIZE + self.body.len()
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.body);
        buf
    }

    /// 从缓冲区头部取出一条完整消息
    ///
    /// 数据不足一条消息时返回 `None`，缓冲区不变。
    pub fn decode(buf: &mut BytesMut, max_message_size: usize) -> ProtocolResult<Option<Self>> {
        let Some(head) = buf.get(..MessageHeader::SIZE) else {
            return Ok(None);
        };
        let mut bytes = [0u8; MessageHeader::SIZE];
        bytes.copy_from_slice(head);
        let header = MessageHeader::parse(&bytes, max_message_size)?;
        if buf.len() < MessageHeader::SIZE + header.body_len() {
            return Ok(None);
        }

        buf.advance(MessageHeader::SIZE);
        let body = buf.split_to(header.body_len()).freeze();
        Ok(Some(Self { header, body }))
    }
}

/// 客户端发出的请求消息
pub trait RequestMessage {
    const OP_CODE: OpCode;

    fn write_body(&self, buf: &mut BytesMut);

    fn to_message(&self, request_id: i32) -> ProtocolResult<Message> {
        let mut body = BytesMut::new();
        self.write_body(&mut body);
        Message::new(Self::OP_CODE, request_id, 0, body.freeze())
    }
}

/// 命名空间写成 cstring；`Namespace` 已保证不含 NUL
fn put_namespace(buf: &mut BytesMut, namespace: &Namespace) {
    buf.put_slice(namespace.full_name().as_bytes());
    buf.put_u8(0);
}

fn encode_document<V: ToBson + ?Sized>(codec: &BsonCodec, value: &V) -> ProtocolResult<Bytes> {
    let mut buf = BytesMut::new();
    codec.encode_into(value, &mut buf)?;
    Ok(buf.freeze())
}

bitflags! {
    /// `OP_QUERY` 标志位
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueryFlags: u32 {
        const TAILABLE_CURSOR = 1 << 1;
        const SLAVE_OK = 1 << 2;
        const OPLOG_REPLAY = 1 << 3;
        const NO_CURSOR_TIMEOUT = 1 << 4;
        const AWAIT_DATA = 1 << 5;
        const EXHAUST = 1 << 6;
        const PARTIAL = 1 << 7;
    }
}

bitflags! {
    /// `OP_INSERT` 标志位
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InsertFlags: u32 {
        /// 某个文档插入失败后继续插入后面的文档
        const CONTINUE_ON_ERROR = 1;
    }
}

/// `OP_QUERY`
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMessage {
    pub flags: QueryFlags,
    pub namespace: Namespace,
    pub skip: i32,
    pub number_to_return: i32,
    pub query: Bytes,
    pub field_selector: Option<Bytes>,
}

impl QueryMessage {
    /// # Brief
    /// 编码查询文档并构造查询消息
    ///
    /// # Arguments
    /// * `codec` - 编码使用的编解码器
    /// * `namespace` - 目标集合
    /// * `query` - 查询条件，必须编码为文档
    pub fn new<Q: ToBson + ?Sized>(codec: &BsonCodec, namespace: Namespace, query: &Q) -> ProtocolResult<Self> {
        Ok(Self {
            flags: QueryFlags::empty(),
            namespace,
            skip: 0,
            number_to_return: 0,
            query: encode_document(codec, query)?,
            field_selector: None,
        })
    }

    /// 发往 `<db>.$cmd` 的数据库命令，只取一个应答文档
    pub fn command<C: ToBson + ?Sized>(codec: &BsonCodec, database: &str, command: &C) -> ProtocolResult<Self> {
        let mut message = Self::new(codec, Namespace::command(database)?, command)?;
        message.number_to_return = -1;
        Ok(message)
    }

    pub fn with_field_selector<F: ToBson + ?Sized>(mut self, codec: &BsonCodec, selector: &F) -> ProtocolResult<Self> {
        self.field_selector = Some(encode_document(codec, selector)?);
        Ok(self)
    }

    pub fn with_flags(mut self, flags: QueryFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_skip(mut self, skip: i32) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_limit(mut self, number_to_return: i32) -> Self {
        self.number_to_return = number_to_return;
        self
    }
}

impl RequestMessage for QueryMessage {
    const OP_CODE: OpCode = OpCode::Query;

    fn write_body(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.flags.bits());
        put_namespace(buf, &self.namespace);
        buf.put_i32_le(self.skip);
        buf.put_i32_le(self.number_to_return);
        buf.put_slice(&self.query);
        if let Some(selector) = &self.field_selector {
            buf.put_slice(selector);
        }
    }
}

/// `OP_GET_MORE`
#[derive(Debug, Clone, PartialEq)]
pub struct GetMoreMessage {
    pub namespace: Namespace,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

impl GetMoreMessage {
    pub fn new(namespace: Namespace, cursor_id: i64, number_to_return: i32) -> Self {
        Self {
            namespace,
            number_to_return,
            cursor_id,
        }
    }
}

impl RequestMessage for GetMoreMessage {
    const OP_CODE: OpCode = OpCode::GetMore;

    fn write_body(&self, buf: &mut BytesMut) {
        buf.put_i32_le(0);
        put_namespace(buf, &self.namespace);
        buf.put_i32_le(self.number_to_return);
        buf.put_i64_le(self.cursor_id);
    }
}

/// `OP_INSERT`，文档已编码
#[derive(Debug, Clone, PartialEq)]
pub struct InsertMessage {
    pub flags: InsertFlags,
    pub namespace: Namespace,
    pub documents: Vec<Bytes>,
}

impl InsertMessage {
    pub fn new(namespace: Namespace, flags: InsertFlags) -> Self {
        Self {
            flags,
            namespace,
            documents: Vec::new(),
        }
    }

    /// 所有文档的字节总和
    pub fn documents_len(&self) -> usize {
        self.documents.iter().map(Bytes::len).sum()
    }
}

impl RequestMessage for InsertMessage {
    const OP_CODE: OpCode = OpCode::Insert;

    fn write_body(&self, buf: &mut BytesMut) {
        buf.reserve(4 + self.namespace.full_name().len() + 1 + self.documents_len());
        buf.put_u32_le(self.flags.bits());
        put_namespace(buf, &self.namespace);
        for doc in &self.documents {
            buf.put_slice(doc);
        }
    }
}

/// `OP_KILL_CURSORS`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillCursorsMessage {
    pub cursor_ids: Vec<i64>,
}

impl RequestMessage for KillCursorsMessage {
    const OP_CODE: OpCode = OpCode::KillCursors;

    fn write_body(&self, buf: &mut BytesMut) {
        buf.put_i32_le(0);
        buf.put_i32_le(self.cursor_ids.len() as i32);
        for id in &self.cursor_ids {
            buf.put_i64_le(*id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use norm_bson::expando;

    const MAX: usize = 48 * 1024 * 1024;

    fn users() -> Namespace {
        Namespace::new("app", "users").unwrap()
    }

    #[test]
    fn test_header_round_trip() {
        let header = MessageHeader {
            message_length: 42,
            request_id: 7,
            response_to: 3,
            op_code: OpCode::GetMore,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), MessageHeader::SIZE);
        assert_eq!(&buf[12..16], &2005i32.to_le_bytes());

        let mut bytes = [0u8; MessageHeader::SIZE];
        bytes.copy_from_slice(&buf);
        assert_eq!(MessageHeader::parse(&bytes, MAX).unwrap(), header);
        assert_eq!(header.body_len(), 26);
    }

    #[test]
    fn test_header_validation() {
        let mut bytes = [0u8; MessageHeader::SIZE];
        bytes[..4].copy_from_slice(&8i32.to_le_bytes());
        bytes[12..].copy_from_slice(&1i32.to_le_bytes());
        assert!(matches!(
            MessageHeader::parse(&bytes, MAX),
            Err(ProtocolError::InvalidMessage(_))
        ));

        bytes[..4].copy_from_slice(&1024i32.to_le_bytes());
        assert!(matches!(
            MessageHeader::parse(&bytes, 512),
            Err(ProtocolError::MessageTooLarge { size: 1024, max: 512 })
        ));

        bytes[12..].copy_from_slice(&9999i32.to_le_bytes());
        assert!(matches!(
            MessageHeader::parse(&bytes, MAX),
            Err(ProtocolError::UnexpectedOpCode(9999))
        ));
    }

    #[test]
    fn test_query_layout() {
        let codec = BsonCodec::new();
        let message = QueryMessage::new(&codec, users(), &expando! {})
            .unwrap()
            .with_flags(QueryFlags::SLAVE_OK)
            .with_skip(2)
            .with_limit(10)
            .to_message(5)
            .unwrap();

        assert_eq!(message.op_code(), OpCode::Query);
        assert_eq!(message.header.message_length, 16 + 4 + 10 + 4 + 4 + 5);
        let body = &message.body[..];
        assert_eq!(&body[0..4], &4u32.to_le_bytes());
        assert_eq!(&body[4..14], b"app.users\0");
        assert_eq!(&body[14..18], &2i32.to_le_bytes());
        assert_eq!(&body[18..22], &10i32.to_le_bytes());
        assert_eq!(&body[22..], &[5, 0, 0, 0, 0]);
    }

    #[test]
    fn test_query_with_selector() {
        let codec = BsonCodec::new();
        let query = QueryMessage::new(&codec, users(), &expando! { "age" => 16 })
            .unwrap()
            .with_field_selector(&codec, &expando! { "name" => 1 })
            .unwrap();
        let message = query.to_message(1).unwrap();
        let selector = query.field_selector.as_ref().unwrap();
        assert!(message.body.ends_with(selector));
        assert_eq!(message.body.len(), 4 + 10 + 8 + query.query.len() + selector.len());
    }

    #[test]
    fn test_command_namespace() {
        let codec = BsonCodec::new();
        let message = QueryMessage::command(&codec, "admin", &expando! { "ping" => 1 }).unwrap();
        assert_eq!(message.namespace.full_name(), "admin.$cmd");
        assert_eq!(message.number_to_return, -1);
        assert!(QueryMessage::command(&codec, "", &expando! {}).is_err());
    }

    #[test]
    fn test_get_more_and_kill_cursors() {
        let message = GetMoreMessage::new(users(), 0x0102_0304_0506_0708, 50)
            .to_message(9)
            .unwrap();
        assert_eq!(message.body.len(), 4 + 10 + 4 + 8);
        assert_eq!(&message.body[18..], &0x0102_0304_0506_0708i64.to_le_bytes());

        let kill = KillCursorsMessage {
            cursor_ids: vec![1, 2],
        }
        .to_message(10)
        .unwrap();
        assert_eq!(kill.op_code(), OpCode::KillCursors);
        assert_eq!(&kill.body[4..8], &2i32.to_le_bytes());
        assert_eq!(kill.body.len(), 8 + 16);
    }

    #[test]
    fn test_message_decode_waits_for_full_frame() {
        let message = Message::new(OpCode::Reply, 1, 2, Bytes::from_static(b"abcdef")).unwrap();
        let encoded = message.encode();

        let mut partial = BytesMut::from(&encoded[..10]);
        assert!(Message::decode(&mut partial, MAX).unwrap().is_none());
        assert_eq!(partial.len(), 10);

        let mut partial = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(Message::decode(&mut partial, MAX).unwrap().is_none());

        let mut full = encoded.clone();
        full.extend_from_slice(&[0xFF]);
        let decoded = Message::decode(&mut full, MAX).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert_eq!(&full[..], &[0xFF]);
    }

    #[test]
    fn test_request_ids_increase() {
        let first = next_request_id();
        let second = next_request_id();
        assert!(second > first);
    }
}
