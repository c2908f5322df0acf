use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

/// 有序的字节片段链。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 下层按“分段、限长”的方式递交数据，TLS 层需要把这些片段增量地喂给加密引擎，
///   消费一部分后把剩余部分留在原处；
/// - 每个适配器每个方向只拥有一条链，链本身不可在连接之间共享。
///
/// ## 逻辑 (How)
/// - 内部是 `VecDeque<Bytes>`：追加在尾部，消费从头部开始；
/// - 部分消费通过 `Bytes::advance` 完成，只移动引用计数视图，不复制剩余字节；
/// - `len` 被缓存，避免每次查询都遍历片段。
///
/// ## 契约 (What)
/// - 片段顺序严格等于 `push` 顺序；
/// - 空片段在入链时被丢弃，因此 `segment_count() > 0` 等价于 `!is_empty()`。
///
/// ## 注意事项 (Trade-offs)
/// - `to_bytes` 在多片段时需要一次拷贝拼接；单片段时零拷贝返回。
#[derive(Clone, Debug, Default)]
pub struct SegmentChain {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl SegmentChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在链尾追加一个片段。
    pub fn push(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.len += segment.len();
        self.segments.push_back(segment);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// 从链首复制最多 `dst.len()` 字节，不消费数据。
    pub fn peek_into(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for segment in &self.segments {
            if copied == dst.len() {
                break;
            }
            let take = segment.len().min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(&segment[..take]);
            copied += take;
        }
        copied
    }

    /// 从链首复制并消费最多 `dst.len()` 字节。
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let copied = self.peek_into(dst);
        self.advance(copied);
        copied
    }

    /// 丢弃链首的 `count` 字节；超过总长时清空整条链。
    pub fn advance(&mut self, count: usize) {
        let mut remaining = count.min(self.len);
        self.len -= remaining;
        while remaining > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.segments.pop_front();
            } else {
                front.advance(remaining);
                remaining = 0;
            }
        }
    }

    /// 把整条链视作一个连续缓冲返回，不消费数据。
    pub fn to_bytes(&self) -> Bytes {
        match self.segments.len() {
            0 => Bytes::new(),
            1 => self.segments[0].clone(),
            _ => {
                let mut joined = BytesMut::with_capacity(self.len);
                for segment in &self.segments {
                    joined.extend_from_slice(segment);
                }
                joined.freeze()
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.segments.iter()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(parts: &[&'static [u8]]) -> SegmentChain {
        let mut chain = SegmentChain::new();
        for part in parts {
            chain.push(Bytes::from_static(part));
        }
        chain
    }

    #[test]
    fn empty_segments_are_dropped() {
        let chain = chain(&[b"", b"ab", b""]);
        assert_eq!(chain.segment_count(), 1);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn read_spans_segments_and_keeps_leftover() {
        let mut chain = chain(&[b"abc", b"de", b"fgh"]);
        let mut buf = [0u8; 4];
        assert_eq!(chain.read_into(&mut buf), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(chain.len(), 4);
        assert_eq!(chain.segment_count(), 2);
        assert_eq!(chain.to_bytes(), Bytes::from_static(b"efgh"));
    }

    #[test]
    fn peek_does_not_consume() {
        let chain = chain(&[b"\x17\x03", b"\x03\x00\x10rest"]);
        let mut header = [0u8; 5];
        assert_eq!(chain.peek_into(&mut header), 5);
        assert_eq!(header, [0x17, 0x03, 0x03, 0x00, 0x10]);
        assert_eq!(chain.len(), 9);
    }

    #[test]
    fn advance_past_end_clears() {
        let mut chain = chain(&[b"abc"]);
        chain.advance(10);
        assert!(chain.is_empty());
        assert_eq!(chain.segment_count(), 0);
    }

    #[test]
    fn single_segment_to_bytes_is_zero_copy() {
        let original = Bytes::from_static(b"payload");
        let mut chain = SegmentChain::new();
        chain.push(original.clone());
        let view = chain.to_bytes();
        assert_eq!(view.as_ptr(), original.as_ptr());
    }
}
