//! Single XOR parity
//!
//! One parity block per stripe, equal to the XOR of its data blocks. Any one
//! block of the stripe, data or parity, is the XOR of all the others.

use crate::erasure::{xor_into, ErasureScheme};

/// Single-parity scheme used by every storage group
#[derive(Debug, Clone, Copy, Default)]
pub struct XorParity;

impl XorParity {
    /// XOR every block together, zero padding the shorter ones
    fn fold(blocks: &[&[u8]]) -> Vec<u8> {
        let longest = blocks.iter().map(|b| b.len()).max().unwrap_or(0);
        let mut acc = Vec::with_capacity(longest);
        for block in blocks {
            xor_into(&mut acc, block);
        }
        acc
    }
}

impl ErasureScheme for XorParity {
    fn encode(&self, data: &[&[u8]]) -> Vec<Vec<u8>> {
        vec![Self::fold(data)]
    }

    fn reconstruct(&self, survivors: &[&[u8]]) -> Vec<u8> {
        Self::fold(survivors)
    }

    fn parity_blocks(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parity_is_xor_of_data() {
        let parity = XorParity.encode(&[&[1, 2, 3], &[4, 5, 6], &[7, 8, 9]]);
        assert_eq!(parity, vec![vec![1 ^ 4 ^ 7, 2 ^ 5 ^ 8, 3 ^ 6 ^ 9]]);
    }

    #[test]
    fn test_short_blocks_are_zero_padded() {
        let parity = XorParity.encode(&[&[0xaa, 0xbb], &[0x0f], &[]]);
        assert_eq!(parity[0], vec![0xaa ^ 0x0f, 0xbb]);
    }

    #[test]
    fn test_recover_any_single_block() {
        let data: [&[u8]; 3] = [b"stripe-a", b"stripe-b", b"strip"];
        let parity = XorParity.encode(&data).remove(0);

        let mut all: Vec<Vec<u8>> = data.iter().map(|d| d.to_vec()).collect();
        all.push(parity);

        for missing in 0..all.len() {
            let survivors: Vec<&[u8]> = all
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != missing)
                .map(|(_, b)| b.as_slice())
                .collect();
            let mut rebuilt = XorParity.reconstruct(&survivors);
            rebuilt.truncate(all[missing].len());
            assert_eq!(rebuilt, all[missing], "member {} not rebuilt", missing);
        }
    }

    #[test]
    fn test_cannot_recover_two_losses() {
        assert!(XorParity.can_recover(1));
        assert!(!XorParity.can_recover(2));
    }
}
