//! `OP_REPLY` 应答解析
//!
//! 消息体布局：
//!
//! ```text
//! response_flags(i32) cursor_id(i64) starting_from(i32) number_returned(i32) documents...
//! ```

use crate::message::{Message, MessageHeader, OpCode};
use crate::{ProtocolError, ProtocolResult};
use bitflags::bitflags;
use bytes::{Buf, Bytes};
use norm_bson::{BsonCodec, BsonError, Expando, FromBson};

bitflags! {
    /// `OP_REPLY` 标志位
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResponseFlags: u32 {
        const CURSOR_NOT_FOUND = 1;
        const QUERY_FAILURE = 1 << 1;
        const SHARD_CONFIG_STALE = 1 << 2;
        const AWAIT_CAPABLE = 1 << 3;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub header: MessageHeader,
    pub flags: ResponseFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    /// 首尾相接的原始文档
    pub documents: Bytes,
}

impl Reply {
    const PREFIX_SIZE: usize = 20;

    /// 解析应答消息
    ///
    /// # Returns
    /// 操作码不是 `Reply` 时返回 `UnexpectedOpCode`，消息体不足 20 字节时返回 `InvalidMessage`
    pub fn parse(message: &Message) -> ProtocolResult<Self> {
        if message.op_code() != OpCode::Reply {
            return Err(ProtocolError::UnexpectedOpCode(message.op_code() as i32));
        }
        if message.body.len() < Self::PREFIX_SIZE {
            return Err(ProtocolError::InvalidMessage(format!(
                "Reply body of {} bytes is shorter than {}",
                message.body.len(),
                Self::PREFIX_SIZE
            )));
        }

        let mut body = message.body.clone();
        let flags = ResponseFlags::from_bits_retain(body.get_u32_le());
        let cursor_id = body.get_i64_le();
        let starting_from = body.get_i32_le();
        let number_returned = body.get_i32_le();
        if number_returned < 0 {
            return Err(ProtocolError::InvalidMessage(format!(
                "Negative number_returned {}",
                number_returned
            )));
        }

        Ok(Self {
            header: message.header,
            flags,
            cursor_id,
            starting_from,
            number_returned,
            documents: body,
        })
    }

    /// 服务端是否还保留游标
    pub fn has_more(&self) -> bool {
        self.cursor_id != 0
    }

    /// # Brief
    /// 检查应答是否表示失败
    ///
    /// `QUERY_FAILURE` 时第一个文档携带 `$err`，以 `ServerReported` 报告；
    /// `CURSOR_NOT_FOUND` 时返回 `CursorNotFound`。
    pub fn check(&self, codec: &BsonCodec) -> ProtocolResult<()> {
        if self.flags.contains(ResponseFlags::CURSOR_NOT_FOUND) {
            return Err(ProtocolError::CursorNotFound(self.cursor_id));
        }
        if self.flags.contains(ResponseFlags::QUERY_FAILURE) {
            // 第一个文档本身带 `$err` 时解码即报告 ServerReported
            let detail = codec.decode::<Expando>(&self.documents)?;
            return Err(BsonError::ServerReported(detail.to_string()).into());
        }
        Ok(())
    }

    /// 逐个解码应答中的文档
    ///
    /// # Returns
    /// 任一文档带 `$err` / `errmsg` 时返回 `ServerReported`；
    /// 解出的文档数与 `number_returned` 不一致时返回 `InvalidMessage`
    pub fn documents<T: FromBson>(&self, codec: &BsonCodec) -> ProtocolResult<Vec<T>> {
        self.check(codec)?;
        let values = codec.reader::<T>(&self.documents).collect::<Result<Vec<_>, _>>()?;
        if values.len() != self.number_returned as usize {
            return Err(ProtocolError::InvalidMessage(format!(
                "Reply announced {} documents but carried {}",
                self.number_returned,
                values.len()
            )));
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use norm_bson::{bson_entity, expando, BsonEntity, TypeMapBuilder};

    #[derive(Debug, Default, PartialEq)]
    struct User {
        name: String,
        age: i32,
    }

    impl BsonEntity for User {
        fn describe(map: &mut TypeMapBuilder<Self>) {
            map.field("Name", |u| &u.name, |u, v| u.name = v);
            map.field("Age", |u| &u.age, |u, v| u.age = v);
        }
    }

    bson_entity!(User);

    fn reply(flags: ResponseFlags, cursor_id: i64, docs: &[Expando]) -> Message {
        let codec = BsonCodec::new();
        let mut body = BytesMut::new();
        body.put_u32_le(flags.bits());
        body.put_i64_le(cursor_id);
        body.put_i32_le(0);
        body.put_i32_le(docs.len() as i32);
        for doc in docs {
            codec.encode_into(doc, &mut body).unwrap();
        }
        Message::new(OpCode::Reply, 2, 1, body.freeze()).unwrap()
    }

    #[test]
    fn test_documents_decode() {
        let codec = BsonCodec::new();
        let message = reply(
            ResponseFlags::AWAIT_CAPABLE,
            77,
            &[
                expando! { "Name" => "Miku", "Age" => 16 },
                expando! { "Name" => "Rin", "Age" => 14 },
            ],
        );
        let reply = Reply::parse(&message).unwrap();
        assert_eq!(reply.header.response_to, 1);
        assert!(reply.has_more());
        assert_eq!(reply.number_returned, 2);

        let users: Vec<User> = reply.documents(&codec).unwrap();
        assert_eq!(
            users,
            vec![
                User {
                    name: "Miku".to_string(),
                    age: 16
                },
                User {
                    name: "Rin".to_string(),
                    age: 14
                },
            ]
        );
    }

    #[test]
    fn test_query_failure() {
        let codec = BsonCodec::new();
        let message = reply(
            ResponseFlags::QUERY_FAILURE,
            0,
            &[expando! { "$err" => "unauthorized", "code" => 13 }],
        );
        let err = Reply::parse(&message).unwrap().check(&codec).unwrap_err();
        assert_eq!(err.server_message(), Some("unauthorized"));
    }

    #[test]
    fn test_err_document_without_flag() {
        let codec = BsonCodec::new();
        let message = reply(
            ResponseFlags::empty(),
            0,
            &[expando! { "ok" => 0, "errmsg" => "no such command" }],
        );
        let err = Reply::parse(&message)
            .unwrap()
            .documents::<Expando>(&codec)
            .unwrap_err();
        assert_eq!(err.server_message(), Some("no such command"));
    }

    #[test]
    fn test_cursor_not_found() {
        let codec = BsonCodec::new();
        let message = reply(ResponseFlags::CURSOR_NOT_FOUND, 5, &[]);
        let err = Reply::parse(&message).unwrap().documents::<Expando>(&codec).unwrap_err();
        assert!(matches!(err, ProtocolError::CursorNotFound(5)));
    }

    #[test]
    fn test_count_mismatch() {
        let codec = BsonCodec::new();
        let message = reply(ResponseFlags::empty(), 0, &[expando! { "a" => 1 }]);
        let mut reply = Reply::parse(&message).unwrap();
        reply.number_returned = 2;
        assert!(matches!(
            reply.documents::<Expando>(&codec),
            Err(ProtocolError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_rejects_other_messages() {
        let message = Message::new(OpCode::Query, 1, 0, Bytes::new()).unwrap();
        assert!(matches!(
            Reply::parse(&message),
            Err(ProtocolError::UnexpectedOpCode(2004))
        ));

        let short = Message::new(OpCode::Reply, 1, 0, Bytes::from_static(&[0; 8])).unwrap();
        assert!(matches!(Reply::parse(&short), Err(ProtocolError::InvalidMessage(_))));
    }
}
