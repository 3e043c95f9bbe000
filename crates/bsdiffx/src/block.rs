//! Control-block body: decoding into positioned blocks and encoding back

use crate::error::DeltaError;
use crate::offt::{read_offt, read_full, write_offt};
use crate::Result;

/// One add-region plus insert-region unit of a binary delta
///
/// `new_pos` is where the block's output starts in the new sequence and
/// `old_pos` is where its add bytes are summed against the old sequence.
/// The add bytes always come first; insert bytes follow them directly.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiffBlock {
    pub old_pos: i64,
    pub new_pos: u64,
    pub add_bytes: Vec<u8>,
    pub insert_bytes: Vec<u8>,
}

impl DiffBlock {
    pub fn new(old_pos: i64, new_pos: u64) -> Self {
        Self {
            old_pos,
            new_pos,
            add_bytes: Vec::new(),
            insert_bytes: Vec::new(),
        }
    }

    /// Number of output bytes this block produces
    pub fn len(&self) -> u64 {
        (self.add_bytes.len() + self.insert_bytes.len()) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.add_bytes.is_empty() && self.insert_bytes.is_empty()
    }

    /// Offset in the new sequence where the insert region begins
    pub fn insert_pos(&self) -> u64 {
        self.new_pos + self.add_bytes.len() as u64
    }

    /// Offset in the new sequence one past the block's last byte
    pub fn end(&self) -> u64 {
        self.new_pos + self.len()
    }

    /// Rebuild this block's output from the old sequence
    ///
    /// Old bytes outside the old sequence count as zero.
    pub fn apply(&self, old: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() as usize);
        for (i, add) in self.add_bytes.iter().enumerate() {
            out.push(add.wrapping_add(old_byte(old, self.old_pos + i as i64)));
        }
        out.extend_from_slice(&self.insert_bytes);
        out
    }
}

/// Old-sequence byte at `pos`, or zero when out of range
pub(crate) fn old_byte(old: &[u8], pos: i64) -> u8 {
    if pos >= 0 && (pos as u64) < old.len() as u64 {
        old[pos as usize]
    } else {
        0
    }
}

/// Check that blocks are in strictly increasing `new_pos` order
pub fn check_sorted(blocks: &[DiffBlock]) -> Result<()> {
    for (index, pair) in blocks.windows(2).enumerate() {
        if pair[0].new_pos >= pair[1].new_pos {
            return Err(DeltaError::UnsortedBlocks {
                index: index + 1,
                prev: pair[0].new_pos,
                next: pair[1].new_pos,
            });
        }
    }
    Ok(())
}

/// Fail before allocating when the body cannot hold `len` more bytes
fn check_remaining(reader: &[u8], len: u64) -> Result<()> {
    if len > reader.len() as u64 {
        return Err(DeltaError::TruncatedStream {
            expected: len,
            actual: reader.len() as u64,
        });
    }
    Ok(())
}

fn advance(old_pos: i64, by: i64, new_pos: u64) -> Result<i64> {
    old_pos.checked_add(by).ok_or_else(|| {
        DeltaError::Format(format!("old offset overflows at new_pos {}", new_pos))
    })
}

/// Decode an uncompressed control-block body into blocks
///
/// Empty blocks (pure seeks) are dropped. The result is sorted by `new_pos`
/// and covers `[0, new_len)` without gaps.
pub fn decode_blocks(new_len: u64, body: &[u8]) -> Result<Vec<DiffBlock>> {
    let mut reader = body;
    let mut new_pos = 0u64;
    let mut old_pos = 0i64;
    let mut blocks = Vec::new();

    while new_pos < new_len {
        let add_len = read_offt(&mut reader)?;
        let insert_len = read_offt(&mut reader)?;
        let seek = read_offt(&mut reader)?;

        if add_len < 0 {
            return Err(DeltaError::Format(format!(
                "negative add length {} at new_pos {}",
                add_len, new_pos
            )));
        }
        if insert_len < 0 {
            return Err(DeltaError::Format(format!(
                "negative insert length {} at new_pos {}",
                insert_len, new_pos
            )));
        }
        let (add_len, insert_len) = (add_len as u64, insert_len as u64);

        if new_pos.checked_add(add_len).map_or(true, |end| end > new_len) {
            return Err(DeltaError::Bounds {
                pos: new_pos,
                len: add_len,
                new_len,
            });
        }
        check_remaining(reader, add_len)?;
        let mut block = DiffBlock::new(old_pos, new_pos);
        block.add_bytes = vec![0u8; add_len as usize];
        read_full(&mut reader, &mut block.add_bytes)?;
        new_pos += add_len;
        old_pos = advance(old_pos, add_len as i64, new_pos)?;

        if new_pos.checked_add(insert_len).map_or(true, |end| end > new_len) {
            return Err(DeltaError::Bounds {
                pos: new_pos,
                len: insert_len,
                new_len,
            });
        }
        check_remaining(reader, insert_len)?;
        block.insert_bytes = vec![0u8; insert_len as usize];
        read_full(&mut reader, &mut block.insert_bytes)?;
        new_pos += insert_len;
        old_pos = advance(old_pos, seek, new_pos)?;

        if !block.is_empty() {
            blocks.push(block);
        }
    }

    Ok(blocks)
}

/// Encode blocks into an uncompressed control-block body
///
/// A leading seek triple is emitted when the first block does not start at
/// old offset zero; each block's seek moves the old cursor to the next
/// block's `old_pos`.
pub fn encode_blocks(blocks: &[DiffBlock]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let Some(first) = blocks.first() else {
        return Ok(out);
    };

    if first.old_pos != 0 {
        write_offt(&mut out, 0)?;
        write_offt(&mut out, 0)?;
        write_offt(&mut out, first.old_pos)?;
    }

    for (i, block) in blocks.iter().enumerate() {
        let add_len = block.add_bytes.len() as i64;
        let seek = match blocks.get(i + 1) {
            Some(next) => next.old_pos - block.old_pos - add_len,
            None => 0,
        };
        write_offt(&mut out, add_len)?;
        write_offt(&mut out, block.insert_bytes.len() as i64)?;
        write_offt(&mut out, seek)?;
        out.extend_from_slice(&block.add_bytes);
        out.extend_from_slice(&block.insert_bytes);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offt::encode;

    fn triple(add: i64, insert: i64, seek: i64) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&encode(add));
        v.extend_from_slice(&encode(insert));
        v.extend_from_slice(&encode(seek));
        v
    }

    #[test]
    fn test_decode_tracks_positions() {
        let mut body = triple(2, 1, 5);
        body.extend_from_slice(&[1, 2, 9]);
        body.extend(triple(1, 0, 0));
        body.extend_from_slice(&[4]);

        let blocks = decode_blocks(4, &body).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].old_pos, 0);
        assert_eq!(blocks[0].new_pos, 0);
        assert_eq!(blocks[0].add_bytes, vec![1, 2]);
        assert_eq!(blocks[0].insert_bytes, vec![9]);
        // old cursor: 0 + 2 (add) + 5 (seek)
        assert_eq!(blocks[1].old_pos, 7);
        assert_eq!(blocks[1].new_pos, 3);
    }

    #[test]
    fn test_decode_drops_pure_seeks() {
        let mut body = triple(0, 0, 10);
        body.extend(triple(1, 0, 0));
        body.push(0);
        let blocks = decode_blocks(1, &body).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].old_pos, 10);
    }

    #[test]
    fn test_decode_rejects_overrun() {
        let mut body = triple(5, 0, 0);
        body.extend_from_slice(&[0; 5]);
        assert!(matches!(
            decode_blocks(3, &body),
            Err(DeltaError::Bounds { pos: 0, len: 5, new_len: 3 })
        ));

        let mut body = triple(1, 5, 0);
        body.extend_from_slice(&[0; 6]);
        assert!(matches!(
            decode_blocks(3, &body),
            Err(DeltaError::Bounds { pos: 1, len: 5, new_len: 3 })
        ));
    }

    #[test]
    fn test_decode_rejects_negative_lengths() {
        let body = triple(-1, 0, 0);
        assert!(matches!(decode_blocks(3, &body), Err(DeltaError::Format(_))));
        let body = triple(0, -1, 0);
        assert!(matches!(decode_blocks(3, &body), Err(DeltaError::Format(_))));
    }

    #[test]
    fn test_decode_short_body_is_truncated() {
        let mut body = triple(4, 0, 0);
        body.extend_from_slice(&[1, 2]);
        assert!(matches!(
            decode_blocks(4, &body),
            Err(DeltaError::TruncatedStream { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_decode_huge_length_is_truncated() {
        let mut body = triple(i64::MAX / 2, 0, 0);
        body.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            decode_blocks(u64::MAX / 2, &body),
            Err(DeltaError::TruncatedStream { actual: 3, .. })
        ));

        let mut body = triple(1, i64::MAX / 2, 0);
        body.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            decode_blocks(u64::MAX / 2, &body),
            Err(DeltaError::TruncatedStream { actual: 2, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_seek_overflow() {
        let mut body = triple(0, 0, i64::MAX);
        body.extend(triple(0, 0, i64::MAX));
        body.extend(triple(1, 0, 0));
        body.push(0);
        assert!(matches!(decode_blocks(1, &body), Err(DeltaError::Format(_))));
    }

    #[test]
    fn test_encode_emits_leading_seek() {
        let mut block = DiffBlock::new(3, 0);
        block.add_bytes = vec![0, 0];
        let body = encode_blocks(&[block.clone()]).unwrap();
        let decoded = decode_blocks(2, &body).unwrap();
        assert_eq!(decoded, vec![block]);
    }

    #[test]
    fn test_encode_decode_keeps_old_positions() {
        let blocks = vec![
            DiffBlock {
                old_pos: 4,
                new_pos: 0,
                add_bytes: vec![1, 1],
                insert_bytes: vec![7],
            },
            DiffBlock {
                old_pos: 0,
                new_pos: 3,
                add_bytes: vec![],
                insert_bytes: vec![8, 8],
            },
            DiffBlock {
                old_pos: 1,
                new_pos: 5,
                add_bytes: vec![2],
                insert_bytes: vec![],
            },
        ];
        let body = encode_blocks(&blocks).unwrap();
        assert_eq!(decode_blocks(6, &body).unwrap(), blocks);
    }

    #[test]
    fn test_check_sorted() {
        let a = DiffBlock::new(0, 0);
        let b = DiffBlock::new(0, 4);
        assert!(check_sorted(&[a.clone(), b.clone()]).is_ok());
        assert!(matches!(
            check_sorted(&[b, a]),
            Err(DeltaError::UnsortedBlocks { index: 1, prev: 4, next: 0 })
        ));
    }

    #[test]
    fn test_apply_treats_out_of_range_old_as_zero() {
        let block = DiffBlock {
            old_pos: 2,
            new_pos: 0,
            add_bytes: vec![1, 1],
            insert_bytes: vec![b'!'],
        };
        assert_eq!(block.apply(&[10, 20, 30]), vec![31, 1, b'!']);
    }
}
