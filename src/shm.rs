//! Shared-memory side channel of a main database file.
//!
//! The host engine maps fixed-size regions and interprets their bytes as its
//! WAL index; the backend only guarantees stable, zero-initialized memory
//! shared by every handle of the same file. The first 8 bytes of lock space
//! are modeled as an explicit table of (shared count, exclusive flag) slots.

use std::ops::Range;
use std::ptr::NonNull;

use sqlite_vfs::{error::Error, ShmLockMode};

use crate::error::Error as BackendError;

type Result<T> = std::result::Result<T, Error<BackendError>>;

/// Number of slots in the lock table.
pub const LOCK_SLOT_COUNT: usize = 8;

/// One handle's view of its content's shared memory: whether it currently
/// holds a mapping, and which lock slots it holds in each mode.
#[derive(Default)]
pub struct ShmHandle {
    pub mapped: bool,
    pub shared: u8,
    pub exclusive: u8,
}

#[derive(Default)]
pub struct Shm {
    regions: Vec<Box<[u8]>>,
    shared: [u16; LOCK_SLOT_COUNT],
    exclusive: [bool; LOCK_SLOT_COUNT],
    /// Handles currently holding a mapping; the shared memory is destroyed
    /// when the last one unmaps with the delete flag set.
    refs: usize,
}

impl Shm {
    /// Resolve the address of region `index`, allocating any missing regions
    /// of `size` bytes when `extend` is set. Without `extend`, a missing
    /// region is reported as `None`.
    pub fn map_region(
        &mut self,
        index: u32,
        size: usize,
        extend: bool,
    ) -> Result<Option<NonNull<u8>>> {
        let index = index as usize;

        if index >= self.regions.len() {
            if !extend {
                return Ok(None);
            }

            self.regions
                .try_reserve(index + 1 - self.regions.len())
                .map_err(|_| Error::<BackendError>::NoMem)?;
            while self.regions.len() <= index {
                let mut region = Vec::new();
                region
                    .try_reserve_exact(size)
                    .map_err(|_| Error::<BackendError>::NoMem)?;
                region.resize(size, 0);
                self.regions.push(region.into_boxed_slice());
            }
        }

        // The boxed buffer never moves, so the pointer stays valid for as
        // long as the region exists.
        Ok(NonNull::new(self.regions[index].as_mut_ptr()))
    }

    pub fn add_ref(&mut self) {
        self.refs += 1;
    }

    pub fn drop_ref(&mut self) -> usize {
        self.refs = self.refs.saturating_sub(1);
        self.refs
    }

    /// Try to acquire `slots` in `mode` for the handle owning the given
    /// bitmaps. All slots are checked before any is taken, so a denied
    /// request leaves the table untouched.
    pub fn lock(
        &mut self,
        slots: Range<u8>,
        mode: ShmLockMode,
        held_shared: &mut u8,
        held_exclusive: &mut u8,
    ) -> bool {
        for slot in slots.clone() {
            let conflict = match mode {
                ShmLockMode::Shared => self.exclusive[slot as usize],
                ShmLockMode::Exclusive => {
                    self.exclusive[slot as usize] || self.shared[slot as usize] > 0
                }
            };
            if conflict {
                return false;
            }
        }

        for slot in slots {
            let bit = 1 << slot;
            match mode {
                ShmLockMode::Shared => {
                    if *held_shared & bit == 0 {
                        self.shared[slot as usize] += 1;
                        *held_shared |= bit;
                    }
                }
                ShmLockMode::Exclusive => {
                    self.exclusive[slot as usize] = true;
                    *held_exclusive |= bit;
                }
            }
        }
        true
    }

    /// Release the subset of `slots` the owning handle actually holds in
    /// `mode`; releasing an unheld slot is a no-op (the engine does that
    /// during its open sequence).
    pub fn unlock(
        &mut self,
        slots: Range<u8>,
        mode: ShmLockMode,
        held_shared: &mut u8,
        held_exclusive: &mut u8,
    ) {
        for slot in slots {
            let bit = 1 << slot;
            match mode {
                ShmLockMode::Shared => {
                    if *held_shared & bit != 0 {
                        self.shared[slot as usize] = self.shared[slot as usize].saturating_sub(1);
                        *held_shared &= !bit;
                    }
                }
                ShmLockMode::Exclusive => {
                    if *held_exclusive & bit != 0 {
                        self.exclusive[slot as usize] = false;
                        *held_exclusive &= !bit;
                    }
                }
            }
        }
    }

    /// Drop every slot the owning handle still holds, in both modes.
    pub fn release_all(&mut self, held_shared: &mut u8, held_exclusive: &mut u8) {
        self.unlock(
            0..LOCK_SLOT_COUNT as u8,
            ShmLockMode::Shared,
            held_shared,
            held_exclusive,
        );
        self.unlock(
            0..LOCK_SLOT_COUNT as u8,
            ShmLockMode::Exclusive,
            held_shared,
            held_exclusive,
        );
    }

    #[cfg(test)]
    fn shared_count(&self, slot: usize) -> u16 {
        self.shared[slot]
    }
}
