use alloc::vec::Vec;

/// Generation-checked reference to a value stored in an [`Arena`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

/// The arena could not grow its slot storage.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("arena storage exhausted")]
pub struct ArenaFull;

enum Entry<T> {
    Occupied(T),
    Vacant { next_free: Option<u32> },
}

struct Slot<T> {
    generation: u32,
    entry: Entry<T>,
}

/// Slot storage with an intrusive free list.
///
/// Freed slots are recycled LIFO. Every free bumps the slot's generation, so
/// a [`Handle`] issued before the free never resolves to the new occupant.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store `value` and return its handle.
    ///
    /// # Errors
    /// [`ArenaFull`] if a new slot is needed and the backing vector cannot grow.
    pub fn insert(&mut self, value: T) -> Result<Handle, ArenaFull> {
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            let Entry::Vacant { next_free } = slot.entry else {
                unreachable!("arena free list points at occupied slot {index}");
            };
            self.free_head = next_free;
            slot.entry = Entry::Occupied(value);
            self.len += 1;
            return Ok(Handle {
                index,
                generation: slot.generation,
            });
        }

        let index = u32::try_from(self.slots.len()).map_err(|_| ArenaFull)?;
        self.slots.try_reserve(1).map_err(|_| ArenaFull)?;
        self.slots.push(Slot {
            generation: 0,
            entry: Entry::Occupied(value),
        });
        self.len += 1;
        Ok(Handle {
            index,
            generation: 0,
        })
    }

    /// Remove the value behind `handle`; `None` if the handle is stale.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        if !self.contains(handle) {
            return None;
        }
        Some(self.remove_at(handle.index))
    }

    #[must_use]
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    #[must_use]
    pub fn get(&self, handle: Handle) -> Option<&T> {
        match self.slots.get(handle.index as usize) {
            Some(Slot {
                generation,
                entry: Entry::Occupied(value),
            }) if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize) {
            Some(Slot {
                generation,
                entry: Entry::Occupied(value),
            }) if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    /// Drop every value; outstanding handles become stale.
    pub fn clear(&mut self) {
        for index in 0..self.slots.len() {
            if matches!(self.slots[index].entry, Entry::Occupied(_)) {
                #[allow(clippy::cast_possible_truncation)]
                self.remove_at(index as u32);
            }
        }
    }

    /// Value in an occupied slot, addressed without a generation check.
    pub(crate) fn at(&self, index: u32) -> &T {
        match &self.slots[index as usize].entry {
            Entry::Occupied(value) => value,
            Entry::Vacant { .. } => unreachable!("arena slot {index} is vacant"),
        }
    }

    pub(crate) fn at_mut(&mut self, index: u32) -> &mut T {
        match &mut self.slots[index as usize].entry {
            Entry::Occupied(value) => value,
            Entry::Vacant { .. } => unreachable!("arena slot {index} is vacant"),
        }
    }

    pub(crate) fn handle_at(&self, index: u32) -> Handle {
        Handle {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    /// Invalidate outstanding handles to an occupied slot whose content was replaced.
    pub(crate) fn retag(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
    }

    pub(crate) fn remove_at(&mut self, index: u32) -> T {
        let slot = &mut self.slots[index as usize];
        let entry = core::mem::replace(
            &mut slot.entry,
            Entry::Vacant {
                next_free: self.free_head,
            },
        );
        let Entry::Occupied(value) = entry else {
            unreachable!("double free of arena slot {index}");
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free_head = Some(index);
        self.len -= 1;
        value
    }
}
