//! 批量插入
//!
//! 把一组文档切分为若干条 `OP_INSERT`：每条消息中文档字节总和不超过
//! `max_batch_size`，文档条数不超过 `max_batch_count`。

use crate::message::{InsertFlags, InsertMessage};
use crate::{ProtocolError, ProtocolResult};
use bytes::BytesMut;
use norm_bson::{BsonCodec, ToBson};
use norm_common::{Namespace, WireConfig};
use tracing::debug;

/// 插入批次构建器
///
/// # Examples
///
/// ```rust,ignore
/// let mut batcher = InsertBatcher::new(&codec, namespace, &config.wire);
/// for user in &users {
///     if let Some(full) = batcher.push(user)? {
///         send(full).await?;
///     }
/// }
/// if let Some(last) = batcher.finish() {
///     send(last).await?;
/// }
/// ```
#[derive(Debug)]
pub struct InsertBatcher {
    codec: BsonCodec,
    namespace: Namespace,
    flags: InsertFlags,
    max_document_size: usize,
    max_batch_size: usize,
    max_batch_count: usize,
    pending: InsertMessage,
    pending_size: usize,
    batches: usize,
}

impl InsertBatcher {
    pub fn new(codec: &BsonCodec, namespace: Namespace, config: &WireConfig) -> Self {
        Self {
            codec: codec.clone(),
            pending: InsertMessage::new(namespace.clone(), InsertFlags::empty()),
            namespace,
            flags: InsertFlags::empty(),
            max_document_size: config.max_document_size,
            max_batch_size: config.max_batch_size,
            max_batch_count: config.max_batch_count.max(1),
            pending_size: 0,
            batches: 0,
        }
    }

    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.flags.set(InsertFlags::CONTINUE_ON_ERROR, enabled);
        self.pending.flags = self.flags;
        self
    }

    /// # Brief
    /// 编码一个文档并加入当前批次
    ///
    /// 加入后会超出体积或条数上限时，先把当前批次作为完整消息返回，
    /// 新文档成为下一批次的第一个文档。
    ///
    /// # Arguments
    /// * `document` - 待插入的值，必须编码为文档
    ///
    /// # Returns
    /// 被挤出的完整批次；文档超过 `max_document_size` 时返回 `DocumentTooLarge`
    pub fn push<V: ToBson + ?Sized>(&mut self, document: &V) -> ProtocolResult<Option<InsertMessage>> {
        let mut buf = BytesMut::new();
        self.codec.encode_into(document, &mut buf)?;
        let size = buf.len();
        if size > self.max_document_size {
            return Err(ProtocolError::DocumentTooLarge {
                size,
                max: self.max_document_size,
            });
        }

        let full = !self.pending.documents.is_empty()
            && (self.pending_size + size > self.max_batch_size
                || self.pending.documents.len() >= self.max_batch_count);
        let flushed = if full { self.take_pending() } else { None };

        self.pending.documents.push(buf.freeze());
        self.pending_size += size;
        Ok(flushed)
    }

    /// 当前批次中的文档数
    pub fn pending_len(&self) -> usize {
        self.pending.documents.len()
    }

    /// 取出最后一个未满的批次
    pub fn finish(mut self) -> Option<InsertMessage> {
        self.take_pending()
    }

    fn take_pending(&mut self) -> Option<InsertMessage> {
        if self.pending.documents.is_empty() {
            return None;
        }
        let next = InsertMessage::new(self.namespace.clone(), self.flags);
        let batch = std::mem::replace(&mut self.pending, next);
        self.batches += 1;
        debug!(
            "Insert batch {} for {}: {} documents, {} bytes",
            self.batches,
            self.namespace,
            batch.documents.len(),
            self.pending_size
        );
        self.pending_size = 0;
        Some(batch)
    }

    /// 一次性切分所有文档
    pub fn batch_all<'v, V, I>(
        codec: &BsonCodec,
        namespace: Namespace,
        config: &WireConfig,
        documents: I,
    ) -> ProtocolResult<Vec<InsertMessage>>
    where
        V: ToBson + ?Sized + 'v,
        I: IntoIterator<Item = &'v V>,
    {
        let mut batcher = Self::new(codec, namespace, config);
        let mut batches = Vec::new();
        for document in documents {
            batches.extend(batcher.push(document)?);
        }
        batches.extend(batcher.finish());
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RequestMessage;
    use norm_bson::{expando, Expando};

    fn users() -> Namespace {
        Namespace::new("app", "users").unwrap()
    }

    fn padded(len: usize) -> Expando {
        expando! { "pad" => "x".repeat(len) }
    }

    #[test]
    fn test_single_batch() {
        let codec = BsonCodec::new();
        let docs: Vec<Expando> = (0..3).map(|i| expando! { "n" => i }).collect();
        let batches = InsertBatcher::batch_all(&codec, users(), &WireConfig::default(), &docs).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].documents.len(), 3);

        let message = batches[0].to_message(1).unwrap();
        let decoded: Vec<Expando> = codec
            .reader(&message.body[4 + 10..])
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(decoded, docs);
    }

    #[test]
    fn test_split_at_size_limit() {
        let codec = BsonCodec::new();
        let doc = padded(3 * 1024 * 1024);
        let docs = vec![doc.clone(), doc.clone(), doc];
        let batches = InsertBatcher::batch_all(&codec, users(), &WireConfig::default(), &docs).unwrap();
        assert_eq!(batches.len(), 3);
        for batch in &batches {
            assert!(batch.documents_len() <= WireConfig::default().max_batch_size);
        }
    }

    #[test]
    fn test_split_at_count_limit() {
        let codec = BsonCodec::new();
        let config = WireConfig {
            max_batch_count: 2,
            ..WireConfig::default()
        };
        let docs: Vec<Expando> = (0..5).map(|i| expando! { "n" => i }).collect();
        let batches = InsertBatcher::batch_all(&codec, users(), &config, &docs).unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.documents.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_oversize_document_rejected() {
        let codec = BsonCodec::new();
        let mut batcher = InsertBatcher::new(&codec, users(), &WireConfig::default());
        batcher.push(&expando! { "n" => 1 }).unwrap();

        let err = batcher.push(&padded(4 * 1024 * 1024)).unwrap_err();
        assert!(matches!(err, ProtocolError::DocumentTooLarge { max, .. } if max == 4 * 1024 * 1024));
        assert_eq!(batcher.pending_len(), 1);
    }

    #[test]
    fn test_continue_on_error_flag() {
        let codec = BsonCodec::new();
        let mut batcher = InsertBatcher::new(&codec, users(), &WireConfig::default()).continue_on_error(true);
        batcher.push(&expando! { "n" => 1 }).unwrap();
        let batch = batcher.finish().unwrap();
        assert!(batch.flags.contains(InsertFlags::CONTINUE_ON_ERROR));
        assert_eq!(&batch.to_message(1).unwrap().body[..4], &1u32.to_le_bytes());
    }

    #[test]
    fn test_non_document_rejected() {
        let codec = BsonCodec::new();
        let mut batcher = InsertBatcher::new(&codec, users(), &WireConfig::default());
        assert!(matches!(batcher.push(&5i32), Err(ProtocolError::Bson(_))));
        assert!(batcher.finish().is_none());
    }
}
