//! 通用工具：将文件范围按 chunk 进行拆分。

use super::chunk::ChunkLayout;

/// 文件范围在某个 chunk 内的一段：chunk 内的 `[start, end)`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub chunk_index: u64,
    pub start: usize,
    pub end: usize,
}

impl ChunkSpan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// 将文件的 [file_offset, file_offset+len) 拆分为若干 chunk 局部范围。
///
/// The spans are ordered by chunk index and tile the requested range exactly.
pub fn split_file_range_into_chunks(layout: ChunkLayout, file_offset: u64, len: u64) -> Vec<ChunkSpan> {
    let Some(range) = layout.chunk_range(file_offset, len) else {
        return Vec::new();
    };
    let m = layout.max_chunk_size;
    let (first, last) = (*range.start(), *range.end());
    range
        .map(|chunk_index| {
            let start = if chunk_index == first {
                layout.within_chunk_offset(file_offset)
            } else {
                0
            };
            let end = if chunk_index == last {
                (file_offset + len - 1) % m + 1
            } else {
                m
            };
            ChunkSpan {
                chunk_index,
                start: start as usize,
                end: end as usize,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_within_single_chunk() {
        let layout = ChunkLayout::default();
        let spans = split_file_range_into_chunks(layout, 123, 4096);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].chunk_index, 0);
        assert_eq!(spans[0].start, 123);
        assert_eq!(spans[0].len(), 4096);
    }

    #[test]
    fn test_split_across_two_chunks() {
        let layout = ChunkLayout::default();
        let m = layout.max_chunk_size;
        let spans = split_file_range_into_chunks(layout, m - 10, 100);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].chunk_index, 0);
        assert_eq!(spans[0].start as u64, m - 10);
        assert_eq!(spans[0].len(), 10);
        assert_eq!(spans[1].chunk_index, 1);
        assert_eq!(spans[1].start, 0);
        assert_eq!(spans[1].len(), 90);
    }

    #[test]
    fn test_zero_len() {
        let layout = ChunkLayout::default();
        assert!(split_file_range_into_chunks(layout, 0, 0).is_empty());
        assert!(split_file_range_into_chunks(layout, 1234, 0).is_empty());
    }

    #[test]
    fn test_small_chunk_examples() {
        let layout = ChunkLayout::new(10);

        let spans = split_file_range_into_chunks(layout, 5, 10);
        assert_eq!(
            spans,
            vec![
                ChunkSpan { chunk_index: 0, start: 5, end: 10 },
                ChunkSpan { chunk_index: 1, start: 0, end: 5 },
            ]
        );

        let spans = split_file_range_into_chunks(layout, 10, 10);
        assert_eq!(spans, vec![ChunkSpan { chunk_index: 1, start: 0, end: 10 }]);

        let spans = split_file_range_into_chunks(layout, 9, 12);
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[1], ChunkSpan { chunk_index: 1, start: 0, end: 10 });
        assert_eq!(spans[2], ChunkSpan { chunk_index: 2, start: 0, end: 1 });
    }

    #[test]
    fn test_spans_tile_the_range() {
        for m in [1u64, 3, 7, 10] {
            let layout = ChunkLayout::new(m);
            for offset in 0..25u64 {
                for len in 1..25u64 {
                    let spans = split_file_range_into_chunks(layout, offset, len);
                    let mut pos = offset;
                    for span in &spans {
                        assert!(!span.is_empty());
                        assert!(span.end as u64 <= m);
                        assert_eq!(span.chunk_index * m + span.start as u64, pos);
                        pos += span.len() as u64;
                    }
                    assert_eq!(pos, offset + len, "m={m} offset={offset} len={len}");
                }
            }
        }
    }
}
