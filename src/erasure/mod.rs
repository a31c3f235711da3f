//! Striping and parity
//!
//! This module splits files into stripes of fixed-size blocks, computes the
//! single XOR parity block of each stripe, and rebuilds a lost block from the
//! surviving members of its stripe.

pub mod layout;
pub mod simple_parity;

pub use layout::{Stripe, StripeDecoder, StripeEncoder, StripeLayout};
pub use simple_parity::XorParity;

/// Trait for redundancy schemes applied to one stripe at a time
pub trait ErasureScheme {
    /// Compute the redundancy blocks for a stripe's data blocks
    ///
    /// Blocks of unequal length are treated as zero padded to the longest one.
    fn encode(&self, data: &[&[u8]]) -> Vec<Vec<u8>>;

    /// Rebuild the single missing block of a stripe from all the others
    ///
    /// `survivors` holds every other block of the stripe, data and parity.
    fn reconstruct(&self, survivors: &[&[u8]]) -> Vec<u8>;

    /// Check if a stripe missing `missing` blocks can still be rebuilt
    fn can_recover(&self, missing: usize) -> bool {
        missing <= self.parity_blocks()
    }

    /// Number of redundancy blocks per stripe
    fn parity_blocks(&self) -> usize;
}

/// XOR `src` into `acc`, growing `acc` with zeros when `src` is longer
pub fn xor_into(acc: &mut Vec<u8>, src: &[u8]) {
    if src.len() > acc.len() {
        acc.resize(src.len(), 0);
    }
    for (a, b) in acc.iter_mut().zip(src) {
        *a ^= b;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_into_pads_shorter_accumulator() {
        let mut acc = vec![0b1010];
        xor_into(&mut acc, &[0b0110, 0xff]);
        assert_eq!(acc, vec![0b1100, 0xff]);
    }

    #[test]
    fn test_xor_into_leaves_tail_when_source_is_shorter() {
        let mut acc = vec![1, 2, 3];
        xor_into(&mut acc, &[1]);
        assert_eq!(acc, vec![0, 2, 3]);
    }
}
