//! Checked slot arena for index-based buffer pools.
//!
//! Hardware codecs expose their buffer pools as plain integer indices. The
//! arena tags every slot as free or checked out so that double checkout and
//! double restore become explicit errors instead of silent memory reuse.

use std::fmt;

/// Opaque index into a codec's fixed buffer pool (input or output side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferSlot(pub usize);

impl fmt::Display for BufferSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Slot bookkeeping violations. These are programming errors on the caller's
/// side, not recoverable hardware conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    /// The slot index exceeds the pool size.
    OutOfRange(usize),
    /// The slot is already checked out to software.
    AlreadyCheckedOut(usize),
    /// The slot is not currently checked out.
    NotCheckedOut(usize),
}

impl fmt::Display for SlotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotError::OutOfRange(i) => write!(f, "slot {i} out of range"),
            SlotError::AlreadyCheckedOut(i) => write!(f, "slot {i} is already checked out"),
            SlotError::NotCheckedOut(i) => write!(f, "slot {i} is not checked out"),
        }
    }
}

impl std::error::Error for SlotError {}

/// Fixed-size pool of slots, each either free or checked out.
#[derive(Debug)]
pub struct SlotArena {
    checked_out: Vec<bool>,
}

impl SlotArena {
    pub fn new(len: usize) -> Self {
        Self {
            checked_out: vec![false; len],
        }
    }

    pub fn len(&self) -> usize {
        self.checked_out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checked_out.is_empty()
    }

    /// Number of slots currently owned by software. Must return to zero by
    /// the time the codec instance is released.
    pub fn outstanding(&self) -> usize {
        self.checked_out.iter().filter(|&&c| c).count()
    }

    /// Checks out the first free slot, if any.
    pub fn checkout_free(&mut self) -> Option<BufferSlot> {
        let idx = self.checked_out.iter().position(|&c| !c)?;
        self.checked_out[idx] = true;
        Some(BufferSlot(idx))
    }

    /// Checks out a specific slot.
    pub fn checkout(&mut self, slot: BufferSlot) -> Result<(), SlotError> {
        let tag = self
            .checked_out
            .get_mut(slot.0)
            .ok_or(SlotError::OutOfRange(slot.0))?;
        if *tag {
            return Err(SlotError::AlreadyCheckedOut(slot.0));
        }
        *tag = true;
        Ok(())
    }

    /// Returns a checked-out slot to the pool.
    pub fn restore(&mut self, slot: BufferSlot) -> Result<(), SlotError> {
        let tag = self
            .checked_out
            .get_mut(slot.0)
            .ok_or(SlotError::OutOfRange(slot.0))?;
        if !*tag {
            return Err(SlotError::NotCheckedOut(slot.0));
        }
        *tag = false;
        Ok(())
    }

    /// Marks every slot free. Used when the codec reclaims its pool on flush.
    pub fn restore_all(&mut self) {
        self.checked_out.fill(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_and_restore_round_trip() {
        let mut arena = SlotArena::new(2);
        let a = arena.checkout_free().unwrap();
        let b = arena.checkout_free().unwrap();
        assert_ne!(a, b);
        assert_eq!(arena.outstanding(), 2);
        assert!(arena.checkout_free().is_none());

        arena.restore(a).unwrap();
        assert_eq!(arena.outstanding(), 1);
        arena.restore(b).unwrap();
        assert_eq!(arena.outstanding(), 0);
    }

    #[test]
    fn double_checkout_is_an_error() {
        let mut arena = SlotArena::new(1);
        arena.checkout(BufferSlot(0)).unwrap();
        assert_eq!(
            arena.checkout(BufferSlot(0)),
            Err(SlotError::AlreadyCheckedOut(0))
        );
    }

    #[test]
    fn double_restore_is_an_error() {
        let mut arena = SlotArena::new(1);
        arena.checkout(BufferSlot(0)).unwrap();
        arena.restore(BufferSlot(0)).unwrap();
        assert_eq!(arena.restore(BufferSlot(0)), Err(SlotError::NotCheckedOut(0)));
    }

    #[test]
    fn out_of_range_is_an_error() {
        let mut arena = SlotArena::new(1);
        assert_eq!(arena.checkout(BufferSlot(5)), Err(SlotError::OutOfRange(5)));
        assert_eq!(arena.restore(BufferSlot(5)), Err(SlotError::OutOfRange(5)));
    }
}
