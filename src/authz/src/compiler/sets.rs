//! Typed bit-set and sorted-list helpers for operation sets

use crate::types::StandardOp;
use serde::{Deserialize, Serialize};

/// Mask of every bit assigned to a standard operation
const ASSIGNED_BITS: u32 = (1u32 << StandardOp::ALL.len() as u32) - 1;

/// 32-bit set of standard operations. Serialised as the raw `uint32`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpSet(u32);

impl OpSet {
    pub const EMPTY: OpSet = OpSet(0);

    pub const fn from_bits(bits: u32) -> Self {
        OpSet(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Set containing exactly `ops`
    pub fn of(ops: &[StandardOp]) -> Self {
        ops.iter().fold(OpSet::EMPTY, |set, op| set.with(*op))
    }

    pub fn with(self, op: StandardOp) -> Self {
        OpSet(self.0 | op.bit())
    }

    pub fn insert(&mut self, op: StandardOp) {
        self.0 |= op.bit();
    }

    pub fn contains(self, op: StandardOp) -> bool {
        self.0 & op.bit() != 0
    }

    pub fn union(self, other: OpSet) -> Self {
        OpSet(self.0 | other.0)
    }

    pub fn intersection(self, other: OpSet) -> Self {
        OpSet(self.0 & other.0)
    }

    /// Bits of `self` that are not in `other`
    pub fn difference(self, other: OpSet) -> Self {
        OpSet(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_subset_of(self, other: OpSet) -> bool {
        self.difference(other).is_empty()
    }

    /// Bits that do not name any standard operation
    pub fn unassigned_bits(self) -> u32 {
        self.0 & !ASSIGNED_BITS
    }

    /// Operations in bit order
    pub fn iter(self) -> impl Iterator<Item = StandardOp> {
        StandardOp::ALL.into_iter().filter(move |op| self.contains(*op))
    }

    pub fn len(self) -> usize {
        (self.0 & ASSIGNED_BITS).count_ones() as usize
    }
}

impl FromIterator<StandardOp> for OpSet {
    fn from_iter<I: IntoIterator<Item = StandardOp>>(iter: I) -> Self {
        iter.into_iter().fold(OpSet::EMPTY, |set, op| set.with(op))
    }
}

/// Sorted, de-duplicated list of extended operation names
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct SortedOps(Vec<String>);

impl SortedOps {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert keeping order; returns false when already present
    pub fn insert(&mut self, op: impl Into<String>) -> bool {
        let op = op.into();
        match self.0.binary_search(&op) {
            Ok(_) => false,
            Err(pos) => {
                self.0.insert(pos, op);
                true
            }
        }
    }

    /// Remove; returns false when absent
    pub fn remove(&mut self, op: &str) -> bool {
        match self.0.binary_search_by(|entry| entry.as_str().cmp(op)) {
            Ok(pos) => {
                self.0.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, op: &str) -> bool {
        self.0
            .binary_search_by(|entry| entry.as_str().cmp(op))
            .is_ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for SortedOps {
    fn from(mut ops: Vec<String>) -> Self {
        ops.sort();
        ops.dedup();
        SortedOps(ops)
    }
}

impl From<SortedOps> for Vec<String> {
    fn from(ops: SortedOps) -> Self {
        ops.0
    }
}

impl<S: Into<String>> FromIterator<S> for SortedOps {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        SortedOps::from(iter.into_iter().map(Into::into).collect::<Vec<String>>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_set_algebra() {
        let crud = OpSet::of(&[
            StandardOp::Create,
            StandardOp::Read,
            StandardOp::Update,
            StandardOp::Delete,
        ]);
        assert_eq!(crud.bits(), 0x0f);
        assert_eq!(crud.len(), 4);

        let without_delete = crud.difference(OpSet::of(&[StandardOp::Delete]));
        assert!(!without_delete.contains(StandardOp::Delete));
        assert!(without_delete.is_subset_of(crud));
        assert!(!crud.is_subset_of(without_delete));

        let ops: Vec<_> = without_delete.iter().collect();
        assert_eq!(ops, vec![StandardOp::Create, StandardOp::Read, StandardOp::Update]);
    }

    #[test]
    fn test_unassigned_bits() {
        assert_eq!(OpSet::from_bits(0x0f).unassigned_bits(), 0);
        assert_eq!(OpSet::from_bits(0x8000_0001).unassigned_bits(), 0x8000_0000);
    }

    #[test]
    fn test_sorted_ops_keeps_order() {
        let mut ops: SortedOps = vec!["zeta", "alpha", "mid", "alpha"].into_iter().collect();
        assert_eq!(ops.as_slice(), &["alpha", "mid", "zeta"]);

        assert!(ops.insert("beta"));
        assert!(!ops.insert("beta"));
        assert!(ops.contains("beta"));
        assert!(ops.remove("mid"));
        assert!(!ops.remove("mid"));
        assert_eq!(ops.as_slice(), &["alpha", "beta", "zeta"]);
    }

    #[test]
    fn test_wire_format() {
        assert_eq!(serde_json::to_string(&OpSet::from_bits(0x22)).unwrap(), "34");

        let ops: SortedOps = serde_json::from_str(r#"["b","a"]"#).unwrap();
        assert_eq!(serde_json::to_string(&ops).unwrap(), r#"["a","b"]"#);
    }
}
