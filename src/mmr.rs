//! Commitment accumulator over outgoing message hashes.
//!
//! Merkle mountain range with sorted-pair keccak nodes. Every completed
//! subtree node is kept per level, so the peaks of any historical prefix can be
//! read back directly: `append` costs amortized O(1) hashes, `root` and
//! `proof_at` cost O(log n).
//!
//! Leaf order is append order. Two processes that fold the same event
//! sequence produce the same root.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::commutative_keccak256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccumulatorError {
    #[error("accumulator is empty")]
    Empty,

    #[error("leaf must be 32 bytes, got {0}")]
    InvalidLeafLength(usize),

    #[error("leaf index {index} out of range for {count} leaves")]
    LeafOutOfRange { index: u64, count: u64 },

    #[error("invalid proof: {0}")]
    InvalidProof(&'static str),
}

/// Membership proof for one leaf against the root of `total_leaf_count` leaves.
///
/// `path` holds the intra-mountain siblings bottom-up followed by the other
/// mountain peaks right-to-left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub path: Vec<[u8; 32]>,
    pub leaf_index: u64,
    pub total_leaf_count: u64,
}

/// Append-only accumulator state.
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    /// `levels[0]` are the leaves; `levels[h][i]` covers leaves `[i << h, (i + 1) << h)`.
    levels: Vec<Vec<[u8; 32]>>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaves appended so far
    pub fn leaf_count(&self) -> u64 {
        self.levels.first().map_or(0, |l| l.len() as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_count() == 0
    }

    pub fn leaf(&self, index: u64) -> Option<[u8; 32]> {
        self.levels.first()?.get(index as usize).copied()
    }

    /// Append a 32-byte leaf hash. Returns the new leaf's index.
    pub fn append(&mut self, leaf: &[u8]) -> Result<u64, AccumulatorError> {
        let leaf: [u8; 32] = leaf
            .try_into()
            .map_err(|_| AccumulatorError::InvalidLeafLength(leaf.len()))?;

        if self.levels.is_empty() {
            self.levels.push(Vec::new());
        }
        self.levels[0].push(leaf);
        let index = self.levels[0].len() as u64 - 1;

        // Complete every parent whose right child was just filled in.
        let mut height = 0;
        let mut node = leaf;
        let mut pos = index;
        while pos & 1 == 1 {
            let left = self.levels[height][(pos - 1) as usize];
            node = commutative_keccak256(&left, &node);
            height += 1;
            pos >>= 1;
            if self.levels.len() <= height {
                self.levels.push(Vec::new());
            }
            self.levels[height].push(node);
        }

        Ok(index)
    }

    /// Root over all appended leaves.
    pub fn root(&self) -> Result<[u8; 32], AccumulatorError> {
        self.root_at(self.leaf_count())
    }

    /// Root over the first `leaf_count` leaves.
    pub fn root_at(&self, leaf_count: u64) -> Result<[u8; 32], AccumulatorError> {
        if leaf_count == 0 {
            return Err(AccumulatorError::Empty);
        }
        if leaf_count > self.leaf_count() {
            return Err(AccumulatorError::LeafOutOfRange {
                index: leaf_count - 1,
                count: self.leaf_count(),
            });
        }

        let peaks: Vec<[u8; 32]> = mountains(leaf_count)
            .into_iter()
            .map(|m| self.node(m.height, m.offset))
            .collect();
        Ok(bag_peaks(peaks.iter().rev().copied()))
    }

    /// Proof for `leaf_index` against the current root.
    pub fn proof(&self, leaf_index: u64) -> Result<Proof, AccumulatorError> {
        self.proof_at(leaf_index, self.leaf_count())
    }

    /// Proof for `leaf_index` against the root of the first `leaf_count` leaves.
    pub fn proof_at(&self, leaf_index: u64, leaf_count: u64) -> Result<Proof, AccumulatorError> {
        if leaf_count > self.leaf_count() || leaf_index >= leaf_count {
            return Err(AccumulatorError::LeafOutOfRange {
                index: leaf_index,
                count: leaf_count.min(self.leaf_count()),
            });
        }

        let mountains = mountains(leaf_count);
        let own = mountains
            .iter()
            .find(|m| m.contains(leaf_index))
            .ok_or(AccumulatorError::InvalidProof("leaf mountain not found"))?;

        let mut path = Vec::with_capacity(own.height as usize + mountains.len());
        let mut pos = leaf_index;
        for height in 0..own.height {
            path.push(self.levels[height as usize][(pos ^ 1) as usize]);
            pos >>= 1;
        }
        for m in mountains.iter().rev() {
            if m.offset != own.offset {
                path.push(self.node(m.height, m.offset));
            }
        }

        Ok(Proof {
            path,
            leaf_index,
            total_leaf_count: leaf_count,
        })
    }

    fn node(&self, height: u32, offset: u64) -> [u8; 32] {
        self.levels[height as usize][(offset >> height) as usize]
    }
}

/// Recompute the root from a leaf and its proof.
pub fn root_from_proof(leaf: &[u8; 32], proof: &Proof) -> Result<[u8; 32], AccumulatorError> {
    let Proof {
        path,
        leaf_index,
        total_leaf_count,
    } = proof;

    if *total_leaf_count == 0 {
        return Err(AccumulatorError::Empty);
    }
    if leaf_index >= total_leaf_count {
        return Err(AccumulatorError::LeafOutOfRange {
            index: *leaf_index,
            count: *total_leaf_count,
        });
    }

    let mountains = mountains(*total_leaf_count);
    let own = mountains
        .iter()
        .find(|m| m.contains(*leaf_index))
        .ok_or(AccumulatorError::InvalidProof("leaf mountain not found"))?;

    let expected_len = own.height as usize + mountains.len() - 1;
    if path.len() != expected_len {
        return Err(AccumulatorError::InvalidProof("unexpected path length"));
    }

    let (siblings, other_peaks) = path.split_at(own.height as usize);
    let own_peak = siblings
        .iter()
        .fold(*leaf, |acc, sibling| commutative_keccak256(&acc, sibling));

    let mut others = other_peaks.iter();
    let mut peaks = Vec::with_capacity(mountains.len());
    for m in mountains.iter().rev() {
        if m.offset == own.offset {
            peaks.push(own_peak);
        } else {
            // Length was checked above, so every other mountain has an entry.
            peaks.push(*others.next().ok_or(AccumulatorError::InvalidProof("missing peak"))?);
        }
    }

    Ok(bag_peaks(peaks.into_iter()))
}

/// Verify `proof` for `leaf` against `root`.
pub fn verify(root: &[u8; 32], leaf: &[u8; 32], proof: &Proof) -> bool {
    matches!(root_from_proof(leaf, proof), Ok(computed) if computed == *root)
}

#[derive(Debug, Clone, Copy)]
struct Mountain {
    height: u32,
    offset: u64,
}

impl Mountain {
    fn contains(&self, index: u64) -> bool {
        index >= self.offset && index < self.offset + (1u64 << self.height)
    }
}

/// Mountains of an MMR with `leaf_count` leaves, left to right.
fn mountains(leaf_count: u64) -> Vec<Mountain> {
    let mut out = Vec::new();
    let mut offset = 0u64;
    for height in (0..64u32).rev() {
        if (leaf_count >> height) & 1 == 1 {
            out.push(Mountain { height, offset });
            offset += 1u64 << height;
        }
    }
    out
}

/// Fold peaks given right-to-left: `H(left, H(middle, right))`.
fn bag_peaks(mut right_to_left: impl Iterator<Item = [u8; 32]>) -> [u8; 32] {
    let first = right_to_left.next().unwrap_or([0u8; 32]);
    right_to_left.fold(first, |acc, peak| commutative_keccak256(&peak, &acc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::keccak256;

    fn leaf(i: u64) -> [u8; 32] {
        keccak256(&i.to_le_bytes())
    }

    fn build(n: u64) -> Accumulator {
        let mut acc = Accumulator::new();
        for i in 0..n {
            acc.append(&leaf(i)).unwrap();
        }
        acc
    }

    #[test]
    fn test_empty_root_is_error() {
        let acc = Accumulator::new();
        assert_eq!(acc.root(), Err(AccumulatorError::Empty));
    }

    #[test]
    fn test_rejects_malformed_leaf() {
        let mut acc = Accumulator::new();
        assert_eq!(
            acc.append(&[0u8; 31]),
            Err(AccumulatorError::InvalidLeafLength(31))
        );
        assert!(acc.is_empty());
    }

    #[test]
    fn test_single_leaf_root_is_leaf() {
        let acc = build(1);
        assert_eq!(acc.root().unwrap(), leaf(0));
    }

    #[test]
    fn test_two_leaf_root() {
        let acc = build(2);
        assert_eq!(
            acc.root().unwrap(),
            commutative_keccak256(&leaf(0), &leaf(1))
        );
    }

    #[test]
    fn test_three_leaf_root_bags_peaks() {
        let acc = build(3);
        let left = commutative_keccak256(&leaf(0), &leaf(1));
        assert_eq!(acc.root().unwrap(), commutative_keccak256(&left, &leaf(2)));
    }

    #[test]
    fn test_root_is_deterministic() {
        for n in 1..40 {
            assert_eq!(build(n).root().unwrap(), build(n).root().unwrap());
        }
    }

    #[test]
    fn test_historical_root_matches_prefix() {
        let acc = build(23);
        for n in 1..=23 {
            assert_eq!(acc.root_at(n).unwrap(), build(n).root().unwrap());
        }
    }

    #[test]
    fn test_every_proof_verifies() {
        for n in 1..34u64 {
            let acc = build(n);
            let root = acc.root().unwrap();
            for i in 0..n {
                let proof = acc.proof(i).unwrap();
                assert!(verify(&root, &leaf(i), &proof), "n={} i={}", n, i);
            }
        }
    }

    #[test]
    fn test_historical_proofs_verify_against_historical_root() {
        let acc = build(19);
        for count in 1..=19u64 {
            let root = acc.root_at(count).unwrap();
            for i in 0..count {
                let proof = acc.proof_at(i, count).unwrap();
                assert!(verify(&root, &leaf(i), &proof));
            }
        }
    }

    #[test]
    fn test_scenario_three_leaves() {
        let mut acc = Accumulator::new();
        let (h1, h2, h3) = (leaf(1), leaf(2), leaf(3));
        acc.append(&h1).unwrap();
        acc.append(&h2).unwrap();
        let two_leaf_root = acc.root().unwrap();
        acc.append(&h3).unwrap();
        let three_leaf_root = acc.root().unwrap();

        assert_ne!(two_leaf_root, three_leaf_root);

        let proof = acc.proof(2).unwrap();
        assert!(verify(&three_leaf_root, &h3, &proof));
        assert!(!verify(&two_leaf_root, &h3, &proof));
    }

    #[test]
    fn test_single_bit_mutations_fail() {
        let acc = build(11);
        let root = acc.root().unwrap();
        let proof = acc.proof(6).unwrap();
        let good_leaf = leaf(6);
        assert!(verify(&root, &good_leaf, &proof));

        for byte in [0usize, 15, 31] {
            for bit in [0u8, 3, 7] {
                let mut bad_leaf = good_leaf;
                bad_leaf[byte] ^= 1 << bit;
                assert!(!verify(&root, &bad_leaf, &proof));

                let mut bad_root = root;
                bad_root[byte] ^= 1 << bit;
                assert!(!verify(&bad_root, &good_leaf, &proof));

                for j in 0..proof.path.len() {
                    let mut bad_proof = proof.clone();
                    bad_proof.path[j][byte] ^= 1 << bit;
                    assert!(!verify(&root, &good_leaf, &bad_proof));
                }
            }
        }
    }

    #[test]
    fn test_malformed_proofs_rejected() {
        let acc = build(5);
        let root = acc.root().unwrap();
        let mut proof = acc.proof(1).unwrap();

        proof.path.push([0u8; 32]);
        assert!(!verify(&root, &leaf(1), &proof));
        proof.path.pop();

        proof.leaf_index = 5;
        assert!(matches!(
            root_from_proof(&leaf(1), &proof),
            Err(AccumulatorError::LeafOutOfRange { .. })
        ));

        proof.total_leaf_count = 0;
        assert_eq!(root_from_proof(&leaf(1), &proof), Err(AccumulatorError::Empty));
    }

    #[test]
    fn test_proof_out_of_range() {
        let acc = build(4);
        assert!(acc.proof(4).is_err());
        assert!(acc.proof_at(0, 5).is_err());
        assert!(acc.root_at(5).is_err());
    }
}
