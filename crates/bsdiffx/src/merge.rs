//! Delta block merging
//!
//! Given a lower delta (A -> B) and an upper delta (B -> C), build a single
//! delta (A -> C) without ever materializing A, B or C.
//!
//! Every byte the upper delta produces is classified by two facts:
//!
//! - whether the B byte it reads (`upper.old_pos + cur`) came from the add
//!   region or the insert region of the lower block that produced it
//! - whether the upper byte itself is an add byte or an insert byte
//!
//! Only lower ADD + upper ADD keeps an anchor into A; its bytes are the sum
//! of both add bytes. Every other combination becomes a literal insert.

use crate::block::{check_sorted, DiffBlock};
use crate::codec::DeltaStream;
use crate::error::DeltaError;
use crate::Result;
use tracing::{debug, trace};

/// Byte-level checker for merged blocks
///
/// Holds the original base (A) and final (C) sequences. Each merged block
/// must rebuild exactly the C bytes at its `new_pos`.
#[derive(Debug, Clone, Copy)]
pub struct Verifier<'a> {
    base: &'a [u8],
    updated: &'a [u8],
}

impl<'a> Verifier<'a> {
    pub fn new(base: &'a [u8], updated: &'a [u8]) -> Self {
        Self { base, updated }
    }

    /// Check one merged block against the real sequences
    pub fn check(&self, block: &DiffBlock) -> Result<()> {
        let start = block.new_pos as usize;
        let end = block.end() as usize;
        let fail = |reason: String| DeltaError::Verification {
            old_pos: block.old_pos,
            new_pos: block.new_pos,
            len: block.len(),
            reason,
        };

        if end > self.updated.len() {
            return Err(fail(format!(
                "block ends at {} but updated sequence has {} bytes",
                end,
                self.updated.len()
            )));
        }

        let rebuilt = block.apply(self.base);
        let expected = &self.updated[start..end];
        if let Some(offset) = rebuilt.iter().zip(expected).position(|(a, b)| a != b) {
            return Err(fail(format!(
                "byte {} differs: rebuilt {:#04x}, expected {:#04x}",
                offset, rebuilt[offset], expected[offset]
            )));
        }
        trace!("verified block new_pos={} len={}", block.new_pos, block.len());
        Ok(())
    }
}

/// Which region the block under construction is currently filling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    None,
    Add,
    Insert,
}

/// Accumulates merged blocks, verifying each as it is flushed
struct Output<'v, 'a> {
    merged: Vec<DiffBlock>,
    current: DiffBlock,
    state: State,
    verifier: Option<&'v Verifier<'a>>,
}

impl<'v, 'a> Output<'v, 'a> {
    fn new(verifier: Option<&'v Verifier<'a>>) -> Self {
        Self {
            merged: Vec::new(),
            current: DiffBlock::default(),
            state: State::None,
            verifier,
        }
    }

    /// Start a fresh block for the next upper block
    fn reset(&mut self, new_pos: u64) {
        self.current = DiffBlock::new(0, new_pos);
        self.state = State::None;
    }

    fn flush(&mut self) -> Result<()> {
        if self.state == State::None {
            return Ok(());
        }
        let block = std::mem::take(&mut self.current);
        if let Some(verifier) = self.verifier {
            verifier.check(&block)?;
        }
        trace!(
            "merged block old_pos={} new_pos={} add={} insert={}",
            block.old_pos,
            block.new_pos,
            block.add_bytes.len(),
            block.insert_bytes.len()
        );
        self.merged.push(block);
        self.state = State::None;
        Ok(())
    }

    /// Append add bytes anchored at `old_pos` in A
    fn add(&mut self, old_pos: i64, new_pos: u64, bytes: impl Iterator<Item = u8>) -> Result<()> {
        if self.state == State::Insert {
            self.flush()?;
        }
        if self.state == State::None {
            self.current.old_pos = old_pos;
            self.current.new_pos = new_pos;
        }
        self.current.add_bytes.extend(bytes);
        self.state = State::Add;
        Ok(())
    }

    /// Append literal bytes
    fn insert(&mut self, new_pos: u64, bytes: impl Iterator<Item = u8>) {
        if self.state == State::None {
            self.current.new_pos = new_pos;
        }
        self.current.insert_bytes.extend(bytes);
        self.state = State::Insert;
    }
}

/// Find the lower block whose output range covers B offset `pos`
fn find_block(blocks: &[DiffBlock], pos: i64) -> Option<&DiffBlock> {
    if pos < 0 {
        return None;
    }
    let pos = pos as u64;
    let idx = blocks.partition_point(|b| b.new_pos <= pos);
    let block = blocks.get(idx.checked_sub(1)?)?;
    (pos < block.end()).then_some(block)
}

/// Merge lower (A -> B) and upper (B -> C) blocks into A -> C blocks
///
/// Both lists must be sorted by `new_pos`. When a verifier is supplied every
/// emitted block is checked against the real A and C bytes.
pub fn merge_blocks(
    lower: &[DiffBlock],
    upper: &[DiffBlock],
    verifier: Option<&Verifier<'_>>,
) -> Result<Vec<DiffBlock>> {
    check_sorted(lower)?;
    check_sorted(upper)?;

    let lower_size = lower.last().map(|b| b.end()).unwrap_or(0) as i64;
    trace!("lower_size={}", lower_size);

    let mut out = Output::new(verifier);

    for ub in upper {
        let total = ub.len();
        let upper_add_len = ub.add_bytes.len() as u64;
        let mut cur = 0u64;
        out.reset(ub.new_pos);

        while cur < total {
            let b_pos = ub.old_pos + cur as i64;

            if b_pos >= lower_size {
                // B has nothing here, so only literal upper bytes can follow
                if cur < upper_add_len {
                    return Err(DeltaError::Overlap {
                        old_pos: b_pos,
                        new_pos: ub.new_pos + cur,
                        lower_size: lower_size as u64,
                    });
                }
                let rest = &ub.insert_bytes[(cur - upper_add_len) as usize..];
                out.insert(ub.new_pos + cur, rest.iter().copied());
                cur += rest.len() as u64;
                continue;
            }

            let lb = find_block(lower, b_pos).ok_or(DeltaError::InvalidLowerBlocks(b_pos))?;
            // Add runs cannot span lower blocks: the A anchor changes
            if out.state == State::Add {
                out.flush()?;
            }

            let lower_insert_pos = lb.insert_pos() as i64;
            let lower_end = lb.end() as i64;

            while cur < total && ub.old_pos + (cur as i64) < lower_end {
                let b_pos = ub.old_pos + cur as i64;
                let new_pos = ub.new_pos + cur;
                let upper_is_add = cur < upper_add_len;

                let n = if b_pos < lower_insert_pos {
                    let begin = (b_pos - lb.new_pos as i64) as usize;
                    let lower_rest = &lb.add_bytes[begin..];

                    if upper_is_add {
                        let upper_rest = &ub.add_bytes[cur as usize..];
                        let n = lower_rest.len().min(upper_rest.len());
                        trace!("lower=ADD upper=ADD len={}", n);
                        let summed = lower_rest[..n]
                            .iter()
                            .zip(&upper_rest[..n])
                            .map(|(l, u)| l.wrapping_add(*u));
                        out.add(lb.old_pos + begin as i64, new_pos, summed)?;
                        n
                    } else {
                        let upper_rest = &ub.insert_bytes[(cur - upper_add_len) as usize..];
                        let n = lower_rest.len().min(upper_rest.len());
                        trace!("lower=ADD upper=INSERT len={}", n);
                        out.insert(new_pos, upper_rest[..n].iter().copied());
                        n
                    }
                } else {
                    let begin = (b_pos - lower_insert_pos) as usize;
                    let lower_rest = &lb.insert_bytes[begin..];

                    if upper_is_add {
                        let upper_rest = &ub.add_bytes[cur as usize..];
                        let n = lower_rest.len().min(upper_rest.len());
                        trace!("lower=INSERT upper=ADD len={}", n);
                        let summed = lower_rest[..n]
                            .iter()
                            .zip(&upper_rest[..n])
                            .map(|(l, u)| l.wrapping_add(*u));
                        out.insert(new_pos, summed);
                        n
                    } else {
                        let upper_rest = &ub.insert_bytes[(cur - upper_add_len) as usize..];
                        let n = lower_rest.len().min(upper_rest.len());
                        trace!("lower=INSERT upper=INSERT len={}", n);
                        out.insert(new_pos, upper_rest[..n].iter().copied());
                        n
                    }
                };
                cur += n as u64;
            }
        }

        out.flush()?;
    }

    debug!(
        "merged {} lower and {} upper blocks into {}",
        lower.len(),
        upper.len(),
        out.merged.len()
    );
    Ok(out.merged)
}

/// Merge two complete delta streams
///
/// The result carries the upper stream's length and compression mode.
pub fn merge_patches(lower: &[u8], upper: &[u8]) -> Result<Vec<u8>> {
    let lower = DeltaStream::decode(lower)?;
    let upper = DeltaStream::decode(upper)?;
    let blocks = merge_blocks(&lower.blocks, &upper.blocks, None)?;
    DeltaStream {
        header: upper.header,
        blocks,
    }
    .encode()
}

/// Merge two delta streams and check the encoded result decodes back to
/// exactly the merged blocks
///
/// With a verifier each merged block is also checked against the real base
/// and updated bytes.
pub fn merge_patches_verified(
    lower: &[u8],
    upper: &[u8],
    verifier: Option<&Verifier<'_>>,
) -> Result<Vec<u8>> {
    let lower = DeltaStream::decode(lower)?;
    let upper = DeltaStream::decode(upper)?;
    let blocks = merge_blocks(&lower.blocks, &upper.blocks, verifier)?;

    let merged = DeltaStream {
        header: upper.header,
        blocks,
    };
    let encoded = merged.encode()?;
    let reread = DeltaStream::decode(&encoded)?;

    if reread.blocks.len() != merged.blocks.len() {
        return Err(DeltaError::Verification {
            old_pos: 0,
            new_pos: 0,
            len: merged.header.new_len,
            reason: format!(
                "encoded stream has {} blocks, expected {}",
                reread.blocks.len(),
                merged.blocks.len()
            ),
        });
    }
    for (i, (want, got)) in merged.blocks.iter().zip(&reread.blocks).enumerate() {
        if want != got {
            return Err(DeltaError::Verification {
                old_pos: want.old_pos,
                new_pos: want.new_pos,
                len: want.len(),
                reason: format!(
                    "block {} re-decoded as old_pos={} new_pos={} add={} insert={}",
                    i,
                    got.old_pos,
                    got.new_pos,
                    got.add_bytes.len(),
                    got.insert_bytes.len()
                ),
            });
        }
    }

    Ok(encoded)
}
