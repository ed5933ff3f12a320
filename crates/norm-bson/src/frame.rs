//! 文档帧
//!
//! 编码端记录每个未闭合文档的起始偏移，结束时回填 4 字节长度前缀；
//! 解码端记录声明长度与已消费字节数，用来发现嵌套文档的结束符并检测越界。

use crate::{BsonError, BsonResult};
use bytes::{BufMut, BytesMut};

/// 编码端帧栈
#[derive(Debug)]
pub(crate) struct WriteFrames {
    starts: Vec<usize>,
    max_depth: usize,
}

impl WriteFrames {
    pub fn new(max_depth: usize) -> Self {
        Self {
            starts: Vec::new(),
            max_depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.starts.len()
    }

    /// 压入新帧并写入长度占位符
    pub fn begin(&mut self, buf: &mut BytesMut) -> BsonResult<()> {
        if self.starts.len() >= self.max_depth {
            return Err(BsonError::NestingTooDeep(self.max_depth));
        }
        self.starts.push(buf.len());
        buf.put_i32_le(0);
        Ok(())
    }

    /// 闭合当前帧
    ///
    /// # Arguments
    /// * `buf` - 目标缓冲区
    /// * `include_terminator` - 是否写出 `0x00` 结束符；带作用域代码的外层块没有结束符
    pub fn end(&mut self, buf: &mut BytesMut, include_terminator: bool) -> BsonResult<()> {
        let start = self
            .starts
            .pop()
            .ok_or_else(|| BsonError::Structural("No open frame to close".to_string()))?;
        if include_terminator {
            buf.put_u8(0);
        }
        let length = i32::try_from(buf.len() - start).map_err(|_| {
            BsonError::ValueOutOfRange(format!("Document of {} bytes", buf.len() - start))
        })?;
        buf[start..start + 4].copy_from_slice(&length.to_le_bytes());
        Ok(())
    }
}

/// 解码中的单个帧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Frame {
    /// 长度前缀在输入中的偏移
    pub start: usize,
    /// 声明的总长度，含前缀与结束符
    pub length: usize,
    /// 已消费字节数，含前缀
    pub digested: usize,
    /// 文档以 `0x00` 结束；带作用域代码的外层块没有结束符
    pub terminated: bool,
}

impl Frame {
    fn reserved(&self) -> usize {
        usize::from(self.terminated)
    }

    fn remaining(&self) -> usize {
        self.length - self.reserved() - self.digested
    }

    pub fn end_offset(&self) -> usize {
        self.start + self.length
    }
}

/// 解码端帧栈
#[derive(Debug)]
pub(crate) struct ReadFrames {
    stack: Vec<Frame>,
    max_depth: usize,
}

impl ReadFrames {
    pub fn new(max_depth: usize) -> Self {
        Self {
            stack: Vec::new(),
            max_depth,
        }
    }

    /// 从 `pos` 处读取长度前缀并压入新帧
    ///
    /// 声明长度必须至少容纳前缀，且不能超出输入或父帧的剩余空间。
    pub fn begin(&mut self, data: &[u8], pos: usize, terminated: bool) -> BsonResult<()> {
        if self.stack.len() >= self.max_depth {
            return Err(BsonError::NestingTooDeep(self.max_depth));
        }
        let prefix = data.get(pos..pos + 4).ok_or(BsonError::UnexpectedEof)?;
        let declared = i32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        let minimum = 4 + usize::from(terminated);
        let length = usize::try_from(declared)
            .ok()
            .filter(|len| *len >= minimum)
            .ok_or_else(|| BsonError::Structural(format!("Invalid length prefix {}", declared)))?;

        if pos + length > data.len() {
            return Err(BsonError::UnexpectedEof);
        }
        if let Some(parent) = self.stack.last() {
            if length > parent.remaining() {
                return Err(BsonError::Structural(format!(
                    "Nested length {} overruns parent ({} bytes left)",
                    length,
                    parent.remaining()
                )));
            }
        }

        self.stack.push(Frame {
            start: pos,
            length,
            digested: 4,
            terminated,
        });
        Ok(())
    }

    /// 记录当前帧消费了 `n` 个字节
    pub fn consume(&mut self, n: usize) -> BsonResult<()> {
        if let Some(frame) = self.stack.last_mut() {
            if n > frame.remaining() {
                return Err(BsonError::Structural(format!(
                    "Read of {} bytes overruns document ({} bytes left)",
                    n,
                    frame.remaining()
                )));
            }
            frame.digested += n;
        }
        Ok(())
    }

    /// 当前帧只剩结束符(或块已读完)
    pub fn is_done(&self) -> bool {
        self.stack
            .last()
            .map_or(false, |frame| frame.digested + frame.reserved() == frame.length)
    }

    /// 弹出当前帧，并把它的总长度计入父帧
    pub fn end(&mut self) -> BsonResult<Frame> {
        let frame = self
            .stack
            .pop()
            .ok_or_else(|| BsonError::Structural("No open frame to close".to_string()))?;
        if frame.digested + frame.reserved() != frame.length {
            return Err(BsonError::Structural(format!(
                "Document closed after {} of {} bytes",
                frame.digested + frame.reserved(),
                frame.length
            )));
        }
        if let Some(parent) = self.stack.last_mut() {
            parent.digested += frame.length;
        }
        Ok(frame)
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// 最外层未闭合帧的结束偏移
    pub fn outermost_end(&self) -> Option<usize> {
        self.stack.first().map(Frame::end_offset)
    }

    pub fn clear(&mut self) {
        self.stack.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_backpatches_length() {
        let mut buf = BytesMut::new();
        let mut frames = WriteFrames::new(10);
        frames.begin(&mut buf).unwrap();
        buf.put_u8(0x0A);
        buf.put_slice(b"a\0");
        frames.end(&mut buf, true).unwrap();

        assert_eq!(&buf[..], &[8, 0, 0, 0, 0x0A, b'a', 0, 0]);
        assert_eq!(frames.depth(), 0);
    }

    #[test]
    fn test_write_depth_limit() {
        let mut buf = BytesMut::new();
        let mut frames = WriteFrames::new(2);
        frames.begin(&mut buf).unwrap();
        frames.begin(&mut buf).unwrap();
        assert!(matches!(frames.begin(&mut buf), Err(BsonError::NestingTooDeep(2))));
    }

    #[test]
    fn test_read_accounting() {
        // {"a": {}}
        let data = [13, 0, 0, 0, 0x03, b'a', 0, 5, 0, 0, 0, 0, 0];
        let mut frames = ReadFrames::new(10);
        frames.begin(&data, 0, true).unwrap();
        frames.consume(3).unwrap();
        frames.begin(&data, 7, true).unwrap();
        assert!(frames.is_done());
        frames.end().unwrap();
        assert!(frames.is_done());
        let outer = frames.end().unwrap();
        assert_eq!(outer.end_offset(), 13);
    }

    #[test]
    fn test_read_rejects_overrun() {
        let data = [6, 0, 0, 0, 0x0A, 0];
        let mut frames = ReadFrames::new(10);
        frames.begin(&data, 0, true).unwrap();
        frames.consume(1).unwrap();
        assert!(matches!(frames.consume(1), Err(BsonError::Structural(_))));
    }

    #[test]
    fn test_read_rejects_bad_lengths() {
        let mut frames = ReadFrames::new(10);
        assert!(matches!(
            frames.begin(&[4, 0, 0, 0, 0], 0, true),
            Err(BsonError::Structural(_))
        ));
        assert!(matches!(
            frames.begin(&[9, 0, 0, 0, 0], 0, true),
            Err(BsonError::UnexpectedEof)
        ));

        // 子文档声明的长度超出父文档
        let data = [10, 0, 0, 0, 0x03, 0, 9, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        frames.begin(&data, 0, true).unwrap();
        frames.consume(2).unwrap();
        assert!(matches!(frames.begin(&data, 6, true), Err(BsonError::Structural(_))));
    }
}
