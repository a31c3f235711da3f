//! Stripe layout
//!
//! A storage group of N members stores a file as a sequence of stripes. Each
//! stripe holds N-1 data blocks of up to `block_size` bytes and one parity
//! block. The parity role rotates: stripe `s` keeps its parity on member
//! `s mod N`, and the data blocks fill the remaining members in member order.

use crate::erasure::{ErasureScheme, XorParity};
use crate::{Error, Result};
use std::io::{self, Read, Write};

/// Geometry of a storage group: member count and stripe-block size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeLayout {
    members: usize,
    block_size: usize,
}

impl StripeLayout {
    /// Create a layout, rejecting geometries that cannot carry parity
    pub fn new(members: usize, block_size: usize) -> Result<Self> {
        if members < 2 {
            return Err(Error::InvalidGroupParams(format!(
                "a stripe needs at least 2 members, got {}",
                members
            )));
        }
        if block_size == 0 {
            return Err(Error::InvalidGroupParams("block size must be positive".into()));
        }
        Ok(Self {
            members,
            block_size,
        })
    }

    pub fn members(&self) -> usize {
        self.members
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of data blocks per stripe
    pub fn data_members(&self) -> usize {
        self.members - 1
    }

    /// Bytes of file content carried by one full stripe
    pub fn stripe_bytes(&self) -> u64 {
        (self.data_members() * self.block_size) as u64
    }

    /// Member holding the parity block of `stripe`
    pub fn parity_member(&self, stripe: u64) -> usize {
        (stripe % self.members as u64) as usize
    }

    /// Data slot stored on `member` in `stripe`, or `None` for the parity member
    pub fn data_slot(&self, stripe: u64, member: usize) -> Option<usize> {
        let parity = self.parity_member(stripe);
        match member.cmp(&parity) {
            std::cmp::Ordering::Less => Some(member),
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Greater => Some(member - 1),
        }
    }

    /// Member storing data slot `slot` of `stripe`
    pub fn member_for_slot(&self, stripe: u64, slot: usize) -> usize {
        if slot < self.parity_member(stripe) {
            slot
        } else {
            slot + 1
        }
    }

    /// Number of stripes a file of `size` bytes occupies
    pub fn stripe_count(&self, size: u64) -> u64 {
        size.div_ceil(self.stripe_bytes())
    }

    /// Length of data slot `slot` of `stripe` for a file of `size` bytes
    pub fn slot_len(&self, stripe: u64, slot: usize, size: u64) -> usize {
        let start = stripe * self.stripe_bytes() + (slot * self.block_size) as u64;
        size.saturating_sub(start).min(self.block_size as u64) as usize
    }

    /// Length of the block `member` holds in `stripe` for a file of `size` bytes
    ///
    /// The parity block is as long as the longest data block, which is
    /// always the first slot.
    pub fn block_len(&self, stripe: u64, member: usize, size: u64) -> usize {
        match self.data_slot(stripe, member) {
            Some(slot) => self.slot_len(stripe, slot, size),
            None => self.slot_len(stripe, 0, size),
        }
    }

    /// Rebuild the block of `member` in `stripe` from the other members' blocks
    ///
    /// The result is cut to the block's true length so a rebuilt short block
    /// is byte-identical to the one that was lost.
    pub fn rebuild(&self, stripe: u64, member: usize, survivors: &[&[u8]], size: u64) -> Vec<u8> {
        let mut block = XorParity.reconstruct(survivors);
        block.resize(self.block_len(stripe, member, size), 0);
        block
    }
}

/// One stripe's blocks, indexed by member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stripe {
    pub index: u64,
    pub parity_member: usize,
    pub blocks: Vec<Vec<u8>>,
}

impl Stripe {
    pub fn is_parity(&self, member: usize) -> bool {
        member == self.parity_member
    }

    /// Data blocks in slot order, skipping the parity member
    pub fn data_blocks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter(move |(member, _)| *member != self.parity_member)
            .map(|(_, block)| block.as_slice())
    }
}

/// Splits a byte source into parity-protected stripes
///
/// Each round reads up to `(N-1) * block_size` bytes. The final partial
/// stripe carries only the bytes actually read; slots past the end of the
/// source get zero-length blocks rather than being left out.
pub struct StripeEncoder<R> {
    layout: StripeLayout,
    reader: R,
    next_stripe: u64,
    exhausted: bool,
}

impl<R: Read> StripeEncoder<R> {
    pub fn new(layout: StripeLayout, reader: R) -> Self {
        Self {
            layout,
            reader,
            next_stripe: 0,
            exhausted: false,
        }
    }

    /// Fill `buf` as far as the source allows, returning the bytes read
    fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn next_stripe(&mut self) -> io::Result<Option<Stripe>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut data = Vec::with_capacity(self.layout.data_members());
        for _ in 0..self.layout.data_members() {
            if self.exhausted {
                data.push(Vec::new());
                continue;
            }
            let mut block = vec![0u8; self.layout.block_size()];
            let read = self.read_block(&mut block)?;
            block.truncate(read);
            if read < self.layout.block_size() {
                self.exhausted = true;
            }
            data.push(block);
        }

        if data[0].is_empty() {
            self.exhausted = true;
            return Ok(None);
        }

        let index = self.next_stripe;
        self.next_stripe += 1;
        Ok(Some(assemble(&self.layout, index, data)))
    }
}

impl<R: Read> Iterator for StripeEncoder<R> {
    type Item = io::Result<Stripe>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_stripe().transpose()
    }
}

/// Place data blocks and their parity on members for stripe `index`
fn assemble(layout: &StripeLayout, index: u64, data: Vec<Vec<u8>>) -> Stripe {
    let refs: Vec<&[u8]> = data.iter().map(|d| d.as_slice()).collect();
    let parity = XorParity.encode(&refs).remove(0);

    let parity_member = layout.parity_member(index);
    let mut blocks = Vec::with_capacity(layout.members());
    let mut data = data.into_iter();
    let mut parity = Some(parity);
    for member in 0..layout.members() {
        if member == parity_member {
            blocks.push(parity.take().unwrap_or_default());
        } else {
            blocks.push(data.next().unwrap_or_default());
        }
    }

    Stripe {
        index,
        parity_member,
        blocks,
    }
}

/// Reassembles a file from its stripes, in stripe order
///
/// Data blocks are appended in member order, skipping each stripe's parity
/// member, until the declared total size has been written.
pub struct StripeDecoder<W> {
    layout: StripeLayout,
    writer: W,
    total: u64,
    written: u64,
    next_stripe: u64,
}

impl<W: Write> StripeDecoder<W> {
    pub fn new(layout: StripeLayout, total: u64, writer: W) -> Self {
        Self {
            layout,
            writer,
            total,
            written: 0,
            next_stripe: 0,
        }
    }

    /// Append the data of the next stripe
    pub fn push(&mut self, stripe: &Stripe) -> Result<()> {
        if stripe.index != self.next_stripe {
            return Err(Error::Protocol(format!(
                "stripe {} arrived, expected {}",
                stripe.index, self.next_stripe
            )));
        }
        if stripe.blocks.len() != self.layout.members() {
            return Err(Error::Protocol(format!(
                "stripe {} has {} blocks, group has {} members",
                stripe.index,
                stripe.blocks.len(),
                self.layout.members()
            )));
        }
        self.next_stripe += 1;

        for block in stripe.data_blocks() {
            let remaining = self.total - self.written;
            if remaining == 0 {
                break;
            }
            let take = (block.len() as u64).min(remaining) as usize;
            self.writer.write_all(&block[..take])?;
            self.written += take as u64;
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.written >= self.total
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and hand back the writer; fails if stripes were missing
    pub fn finish(mut self) -> Result<W> {
        if !self.is_complete() {
            return Err(Error::Protocol(format!(
                "file ended after {} of {} bytes",
                self.written, self.total
            )));
        }
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Encode an in-memory buffer into stripes
pub fn encode_bytes(layout: StripeLayout, data: &[u8]) -> Vec<Stripe> {
    StripeEncoder::new(layout, data)
        .collect::<io::Result<Vec<_>>>()
        .unwrap_or_default()
}

/// Decode stripes back into `total` bytes
pub fn decode_stripes(layout: StripeLayout, stripes: &[Stripe], total: u64) -> Result<Vec<u8>> {
    let mut decoder = StripeDecoder::new(layout, total, Vec::with_capacity(total as usize));
    for stripe in stripes {
        decoder.push(stripe)?;
    }
    decoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_missing_stripes_fail_decode() {
        let layout = StripeLayout::new(3, 128).unwrap();
        let data = sample(600);
        let stripes = encode_bytes(layout, &data);
        assert_eq!(stripes.len(), 3);
        assert!(decode_stripes(layout, &stripes[..2], 600).is_err());
        assert_eq!(decode_stripes(layout, &stripes, 600).unwrap(), data);
    }

    #[test]
    fn test_parity_rotates_across_members() {
        let layout = StripeLayout::new(4, 128).unwrap();
        let parity: Vec<usize> = (0..6).map(|s| layout.parity_member(s)).collect();
        assert_eq!(parity, vec![0, 1, 2, 3, 0, 1]);
    }

    #[test]
    fn test_slots_skip_parity_member() {
        let layout = StripeLayout::new(4, 128).unwrap();
        // stripe 1: parity on member 1
        assert_eq!(layout.data_slot(1, 0), Some(0));
        assert_eq!(layout.data_slot(1, 1), None);
        assert_eq!(layout.data_slot(1, 2), Some(1));
        assert_eq!(layout.data_slot(1, 3), Some(2));
        for slot in 0..3 {
            let member = layout.member_for_slot(1, slot);
            assert_eq!(layout.data_slot(1, member), Some(slot));
        }
    }

    #[test]
    fn test_round_trip_at_boundary_sizes() {
        for (members, block) in [(3usize, 128usize), (4, 512), (5, 256)] {
            let layout = StripeLayout::new(members, block).unwrap();
            let stripe = (members - 1) * block;
            for size in [0, 1, block - 1, block, block + 1, stripe, stripe + 1] {
                let data = sample(size);
                let stripes = encode_bytes(layout, &data);
                assert_eq!(
                    stripes.len() as u64,
                    layout.stripe_count(size as u64),
                    "stripe count for n={} b={} size={}",
                    members,
                    block,
                    size
                );
                let back = decode_stripes(layout, &stripes, size as u64).unwrap();
                assert_eq!(back, data, "n={} b={} size={}", members, block, size);
            }
        }
    }

    #[test]
    fn test_partial_stripe_sends_empty_blocks() {
        let layout = StripeLayout::new(4, 128).unwrap();
        let stripes = encode_bytes(layout, &sample(130));
        assert_eq!(stripes.len(), 1);

        let stripe = &stripes[0];
        assert_eq!(stripe.parity_member, 0);
        assert_eq!(stripe.blocks.len(), 4);
        assert_eq!(stripe.blocks[1].len(), 128);
        assert_eq!(stripe.blocks[2].len(), 2);
        assert!(stripe.blocks[3].is_empty());
        assert_eq!(stripe.blocks[0].len(), 128);
    }

    #[test]
    fn test_stripe_xor_is_zero() {
        let layout = StripeLayout::new(5, 128).unwrap();
        for stripe in encode_bytes(layout, &sample(1500)) {
            let mut acc = Vec::new();
            for block in &stripe.blocks {
                crate::erasure::xor_into(&mut acc, block);
            }
            assert!(acc.iter().all(|&b| b == 0), "stripe {}", stripe.index);
        }
    }

    #[test]
    fn test_rebuild_restores_exact_block() {
        let layout = StripeLayout::new(4, 128).unwrap();
        let size = 3 * 128 * 2 + 200;
        let stripes = encode_bytes(layout, &sample(size));

        for stripe in &stripes {
            for lost in 0..layout.members() {
                let survivors: Vec<&[u8]> = stripe
                    .blocks
                    .iter()
                    .enumerate()
                    .filter(|(m, _)| *m != lost)
                    .map(|(_, b)| b.as_slice())
                    .collect();
                let rebuilt = layout.rebuild(stripe.index, lost, &survivors, size as u64);
                assert_eq!(rebuilt, stripe.blocks[lost], "stripe {} member {}", stripe.index, lost);
            }
        }
    }

    #[test]
    fn test_block_len_matches_encoder() {
        let layout = StripeLayout::new(3, 128).unwrap();
        let size = 700u64;
        for stripe in encode_bytes(layout, &sample(size as usize)) {
            for (member, block) in stripe.blocks.iter().enumerate() {
                assert_eq!(layout.block_len(stripe.index, member, size), block.len());
            }
        }
    }

    #[test]
    fn test_decoder_rejects_out_of_order_stripes() {
        let layout = StripeLayout::new(3, 128).unwrap();
        let stripes = encode_bytes(layout, &sample(600));
        let mut decoder = StripeDecoder::new(layout, 600, Vec::new());
        assert!(decoder.push(&stripes[1]).is_err());
    }

    #[test]
    fn test_rejects_degenerate_layouts() {
        assert!(StripeLayout::new(1, 128).is_err());
        assert!(StripeLayout::new(3, 0).is_err());
    }
}
