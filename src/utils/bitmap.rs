//! Compact replica-ID set helper.

use std::fmt;

use crate::server::ReplicaId;
use crate::utils::MetasyncError;

use fixedbitset::FixedBitSet;

/// Fixed-size bitmap over replica IDs `0..population`, used wherever a set of
/// peers is tracked (reachability overrides, per-round acknowledgements).
#[derive(Clone, PartialEq, Eq)]
pub struct ReplicaMap(FixedBitSet);

impl ReplicaMap {
    /// Creates a new map of given size. If `ones` is true, all slots are
    /// marked true initially; otherwise, all slots are initially false.
    pub fn new(size: u8, ones: bool) -> Result<Self, MetasyncError> {
        if size == 0 {
            return Err(MetasyncError::msg(format!(
                "invalid replica map size {}",
                size
            )));
        }
        let mut bitset = FixedBitSet::with_capacity(size as usize);
        if ones {
            bitset.set_range(.., true);
        }
        Ok(ReplicaMap(bitset))
    }

    /// Sets bit at index to given flag.
    #[inline]
    pub fn set(
        &mut self,
        idx: ReplicaId,
        flag: bool,
    ) -> Result<(), MetasyncError> {
        if idx as usize >= self.0.len() {
            return Err(MetasyncError::msg(format!(
                "index {} out of bound",
                idx
            )));
        }
        self.0.set(idx as usize, flag);
        Ok(())
    }

    /// Gets the bit flag at index. Out-of-bound indices read as false.
    #[inline]
    pub fn get(&self, idx: ReplicaId) -> bool {
        (idx as usize) < self.0.len() && self.0[idx as usize]
    }

    /// Clears all bits.
    #[inline]
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Returns the size of the map.
    #[inline]
    pub fn size(&self) -> u8 {
        self.0.len() as u8
    }

    /// Returns the number of trues in the map.
    #[inline]
    pub fn count(&self) -> u8 {
        self.0.count_ones(..) as u8
    }

    /// Returns the IDs whose bit is set, in ascending order.
    pub fn ones(&self) -> Vec<ReplicaId> {
        self.0.ones().map(|i| i as ReplicaId).collect()
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for ReplicaMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; {:?}}}", self.size(), self.ones())
    }
}

#[cfg(test)]
mod bitmap_tests {
    use super::*;

    #[test]
    fn map_new_zero() {
        assert!(ReplicaMap::new(0, true).is_err());
    }

    #[test]
    fn map_set_get() -> Result<(), MetasyncError> {
        let mut map = ReplicaMap::new(7, false)?;
        map.set(0, true)?;
        map.set(1, false)?;
        map.set(2, true)?;
        assert!(map.set(7, true).is_err());
        assert!(map.get(0));
        assert!(!map.get(1));
        assert!(map.get(2));
        assert!(!map.get(3));
        assert!(!map.get(7));
        Ok(())
    }

    #[test]
    fn map_count_clear() -> Result<(), MetasyncError> {
        let mut map = ReplicaMap::new(5, false)?;
        assert_eq!(map.count(), 0);
        map.set(0, true)?;
        map.set(2, true)?;
        map.set(3, true)?;
        assert_eq!(map.count(), 3);
        assert_eq!(map.ones(), vec![0, 2, 3]);
        map.clear();
        assert_eq!(map.count(), 0);
        assert_eq!(map.size(), 5);
        Ok(())
    }

    #[test]
    fn map_debug() -> Result<(), MetasyncError> {
        let mut map = ReplicaMap::new(5, true)?;
        map.set(2, false)?;
        assert_eq!(map.count(), 4);
        assert_eq!(format!("{:?}", map), "{5; [0, 1, 3, 4]}");
        Ok(())
    }
}
