//! Space allocation strategies.
//!
//! A strategy decides how much capacity a record gets for a payload of a
//! given length. Reserving a little more than needed lets small updates
//! rewrite a record in place instead of relocating it.

use std::fmt;

use super::constants::record;
use crate::errors::{StorageError, StorageResult};

/// Decides the capacity of a new (or relocated) record.
///
/// Implementations are pure: the same length always maps to the same
/// capacity, the result is never smaller than the length, never larger than
/// [`max_capacity`](Self::max_capacity), and is non-decreasing in the length.
pub trait SpaceAllocationStrategy: Send + Sync + fmt::Debug {
    /// Capacity to reserve for a payload of `payload_len` bytes.
    ///
    /// Fails with [`StorageError::CapacityExceeded`] when the payload can't
    /// fit into any record.
    fn capacity(&self, payload_len: usize) -> StorageResult<u32>;

    /// Upper bound of every capacity this strategy returns
    fn max_capacity(&self) -> u32;

    fn check_length(&self, payload_len: usize) -> StorageResult<()> {
        let max = self.max_capacity() as usize;
        if payload_len > max {
            return Err(StorageError::CapacityExceeded {
                size: payload_len,
                max_size: max,
            });
        }
        Ok(())
    }
}

/// Capacity = `max(min_capacity, len + fixed_bonus, ceil(len * (1 + percent_on_top / 100)))`,
/// capped at `max_capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLengthPlusFixedPercentStrategy {
    min_capacity: u32,
    fixed_bonus: u32,
    percent_on_top: u32,
    max_capacity: u32,
}

impl DataLengthPlusFixedPercentStrategy {
    pub fn new(
        min_capacity: u32,
        fixed_bonus: u32,
        percent_on_top: u32,
        max_capacity: u32,
    ) -> StorageResult<Self> {
        if min_capacity == 0 {
            return Err(StorageError::invalid_config("min_capacity must be positive"));
        }
        if min_capacity > max_capacity {
            return Err(StorageError::invalid_config(format!(
                "min_capacity {} exceeds max_capacity {}",
                min_capacity, max_capacity
            )));
        }
        if max_capacity > record::MAX_CAPACITY {
            return Err(StorageError::invalid_config(format!(
                "max_capacity {} exceeds the record limit {}",
                max_capacity,
                record::MAX_CAPACITY
            )));
        }
        Ok(Self {
            min_capacity,
            fixed_bonus,
            percent_on_top,
            max_capacity,
        })
    }

    pub fn min_capacity(&self) -> u32 {
        self.min_capacity
    }

    pub fn fixed_bonus(&self) -> u32 {
        self.fixed_bonus
    }

    pub fn percent_on_top(&self) -> u32 {
        self.percent_on_top
    }
}

impl Default for DataLengthPlusFixedPercentStrategy {
    fn default() -> Self {
        Self {
            min_capacity: 64,
            fixed_bonus: 0,
            percent_on_top: 30,
            max_capacity: record::MAX_CAPACITY,
        }
    }
}

impl SpaceAllocationStrategy for DataLengthPlusFixedPercentStrategy {
    fn capacity(&self, payload_len: usize) -> StorageResult<u32> {
        self.check_length(payload_len)?;

        let len = payload_len as u64;
        let with_bonus = len + self.fixed_bonus as u64;
        let with_percent = (len * (100 + self.percent_on_top as u64)).div_ceil(100);
        let advised = with_bonus.max(with_percent).max(self.min_capacity as u64);

        Ok(advised.min(self.max_capacity as u64) as u32)
    }

    fn max_capacity(&self) -> u32 {
        self.max_capacity
    }
}

/// Capacity = length. Every growing update relocates the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExactFitStrategy {
    max_capacity: u32,
}

impl ExactFitStrategy {
    pub fn new(max_capacity: u32) -> StorageResult<Self> {
        if max_capacity == 0 || max_capacity > record::MAX_CAPACITY {
            return Err(StorageError::invalid_config(format!(
                "max_capacity must be in 1..={}, got {}",
                record::MAX_CAPACITY,
                max_capacity
            )));
        }
        Ok(Self { max_capacity })
    }
}

impl SpaceAllocationStrategy for ExactFitStrategy {
    fn capacity(&self, payload_len: usize) -> StorageResult<u32> {
        self.check_length(payload_len)?;
        Ok(payload_len as u32)
    }

    fn max_capacity(&self) -> u32 {
        self.max_capacity
    }
}
