//! Generation-checked handle tables.
//!
//! Statements and cursors are owned by their session and referenced from the
//! outside through small `Copy` handles. A handle names its session, a slot
//! and the slot's generation at allocation time; releasing a slot bumps the
//! generation so old handles are rejected instead of aliasing a new entry.

use uuid::Uuid;

use super::error::{RelayError, RelayResult};

/// Untyped handle payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RawHandle {
    session: Uuid,
    index: u32,
    generation: u32,
}

/// Handle to a statement owned by a [`Connection`](super::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementHandle(pub(crate) RawHandle);

/// Handle to a cursor owned by a [`Connection`](super::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorHandle(pub(crate) RawHandle);

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena of entries addressed by [`RawHandle`].
pub(crate) struct HandleTable<T> {
    session: Uuid,
    what: &'static str,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> HandleTable<T> {
    pub(crate) fn new(session: Uuid, what: &'static str) -> Self {
        Self {
            session,
            what,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> RawHandle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return RawHandle {
                session: self.session,
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        RawHandle {
            session: self.session,
            index,
            generation: 0,
        }
    }

    fn slot(&self, handle: &RawHandle) -> Option<&Slot<T>> {
        if handle.session != self.session {
            return None;
        }
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
    }

    pub(crate) fn get(&self, handle: &RawHandle) -> RelayResult<&T> {
        self.slot(handle)
            .and_then(|slot| slot.value.as_ref())
            .ok_or(RelayError::StaleHandle(self.what))
    }

    pub(crate) fn get_mut(&mut self, handle: &RawHandle) -> RelayResult<&mut T> {
        let what = self.what;
        if handle.session != self.session {
            return Err(RelayError::StaleHandle(what));
        }
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
            .ok_or(RelayError::StaleHandle(what))
    }

    #[inline]
    pub(crate) fn contains(&self, handle: &RawHandle) -> bool {
        self.get(handle).is_ok()
    }

    /// Release the slot. Returns `None` for handles that are already stale.
    pub(crate) fn remove(&mut self, handle: &RawHandle) -> Option<T> {
        if self.slot(handle).is_none() {
            return None;
        }
        let slot = &mut self.slots[handle.index as usize];
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Some(value)
    }

    /// Release every slot, invalidating all outstanding handles.
    pub(crate) fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.live = 0;
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.value.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_released_slot_rejects_old_handle() {
        let mut table = HandleTable::new(Uuid::new_v4(), "statement");
        let first = table.insert("a");
        assert_eq!(*table.get(&first).unwrap(), "a");

        assert_eq!(table.remove(&first), Some("a"));
        assert!(matches!(
            table.get(&first),
            Err(RelayError::StaleHandle("statement"))
        ));

        // The slot is reused with a new generation
        let second = table.insert("b");
        assert_eq!(second.index, first.index);
        assert!(table.get(&first).is_err());
        assert_eq!(*table.get(&second).unwrap(), "b");
    }

    #[test]
    fn test_foreign_session_rejected() {
        let mut mine = HandleTable::new(Uuid::new_v4(), "cursor");
        let mut theirs = HandleTable::new(Uuid::new_v4(), "cursor");
        mine.insert(1);
        let foreign = theirs.insert(2);
        assert!(mine.get(&foreign).is_err());
        assert_eq!(mine.remove(&foreign), None);
        assert_eq!(mine.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut table = HandleTable::new(Uuid::new_v4(), "cursor");
        let h = table.insert(1);
        assert_eq!(table.remove(&h), Some(1));
        assert_eq!(table.remove(&h), None);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_clear_invalidates_everything() {
        let mut table = HandleTable::new(Uuid::new_v4(), "statement");
        let handles: Vec<_> = (0..4).map(|i| table.insert(i)).collect();
        table.clear();
        assert_eq!(table.len(), 0);
        assert!(handles.iter().all(|h| !table.contains(h)));
        assert_eq!(table.iter().count(), 0);
    }
}
