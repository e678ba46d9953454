//! Doubly-linked list implementation (NT LIST_ENTRY style)
//!
//! NT threads its queues through `LIST_ENTRY` fields embedded in the
//! queued objects. Here the links live in an arena owned by the list
//! itself: every entry occupies a slot addressed by a [`ListHandle`],
//! and the forward/backward links are slot indices rather than raw
//! pointers. Unlinking goes through the handle, and each slot carries a
//! generation that is bumped on removal, so a stale handle (double
//! remove, remove after the entry was popped by someone else) resolves
//! to nothing instead of corrupting the list.
//!
//! The operations keep their NT names: `insert_head`, `insert_tail`,
//! `remove_head`, `remove_tail`, `remove_entry`.

use alloc::collections::TryReserveError;
use alloc::vec::Vec;
use core::fmt;

/// Link value meaning "no entry"
const NIL: u32 = u32::MAX;

/// Stable reference to one entry of a [`KList`]
///
/// Handles stay valid until the entry is removed. After that they never
/// match again, even if the slot is reused for a new entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListHandle {
    index: u32,
    generation: u32,
}

/// One arena slot
///
/// Free slots are chained through `flink`.
struct ListEntry<T> {
    value: Option<T>,
    generation: u32,
    /// Forward link (next entry)
    flink: u32,
    /// Backward link (previous entry)
    blink: u32,
}

/// Doubly-linked list over a slot arena
pub struct KList<T> {
    entries: Vec<ListEntry<T>>,
    head: u32,
    tail: u32,
    free: u32,
    len: usize,
}

impl<T> KList<T> {
    /// Create an empty list
    ///
    /// Equivalent to InitializeListHead()
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            head: NIL,
            tail: NIL,
            free: NIL,
            len: 0,
        }
    }

    /// Number of linked entries
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the list is empty
    ///
    /// Equivalent to IsListEmpty()
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Make sure `additional` more entries can be linked without
    /// allocating
    ///
    /// Callers that must not abort on allocation failure reserve first and
    /// report the error themselves.
    pub fn try_reserve(&mut self, additional: usize) -> Result<(), TryReserveError> {
        let spare = self.entries.len() - self.len;
        if spare >= additional {
            return Ok(());
        }
        self.entries.try_reserve(additional - spare)
    }

    /// Insert entry at the head of the list
    ///
    /// Equivalent to InsertHeadList()
    pub fn insert_head(&mut self, value: T) -> ListHandle {
        let index = self.allocate(value);
        let head = self.head;
        self.link(index, NIL, head);
        self.handle(index)
    }

    /// Insert entry at the tail of the list
    ///
    /// Equivalent to InsertTailList()
    pub fn insert_tail(&mut self, value: T) -> ListHandle {
        let index = self.allocate(value);
        let tail = self.tail;
        self.link(index, tail, NIL);
        self.handle(index)
    }

    /// Insert `value` in front of the first entry matching `pred`, or at
    /// the tail if none does
    ///
    /// Entries that do not match keep their position relative to the new
    /// one, so using "strictly greater than" as the predicate gives a
    /// stable sorted insert.
    pub fn insert_before_first<F>(&mut self, value: T, mut pred: F) -> ListHandle
    where
        F: FnMut(&T) -> bool,
    {
        let mut cursor = self.head;
        while cursor != NIL {
            let entry = &self.entries[cursor as usize];
            if entry.value.as_ref().is_some_and(&mut pred) {
                break;
            }
            cursor = entry.flink;
        }

        let index = self.allocate(value);
        let blink = if cursor == NIL {
            self.tail
        } else {
            self.entries[cursor as usize].blink
        };
        self.link(index, blink, cursor);
        self.handle(index)
    }

    /// Remove and return the first entry from the list
    ///
    /// Equivalent to RemoveHeadList()
    pub fn remove_head(&mut self) -> Option<T> {
        if self.head == NIL {
            return None;
        }
        Some(self.unlink(self.head))
    }

    /// Remove and return the last entry from the list
    ///
    /// Equivalent to RemoveTailList()
    pub fn remove_tail(&mut self) -> Option<T> {
        if self.tail == NIL {
            return None;
        }
        Some(self.unlink(self.tail))
    }

    /// Remove the entry behind `handle`
    ///
    /// Equivalent to RemoveEntryList(). Returns `None` if the handle is
    /// stale, which makes a second removal a harmless no-op.
    pub fn remove_entry(&mut self, handle: ListHandle) -> Option<T> {
        let index = self.resolve(handle)?;
        Some(self.unlink(index))
    }

    /// Remove the first entry (from the head) matching `pred`
    pub fn remove_first<F>(&mut self, mut pred: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut cursor = self.head;
        while cursor != NIL {
            let entry = &self.entries[cursor as usize];
            let next = entry.flink;
            if entry.value.as_ref().is_some_and(&mut pred) {
                return Some(self.unlink(cursor));
            }
            cursor = next;
        }
        None
    }

    /// Whether `handle` still refers to a linked entry
    #[inline]
    pub fn contains(&self, handle: ListHandle) -> bool {
        self.resolve(handle).is_some()
    }

    /// Borrow the entry behind `handle`
    pub fn get(&self, handle: ListHandle) -> Option<&T> {
        let index = self.resolve(handle)?;
        self.entries[index as usize].value.as_ref()
    }

    /// First entry, if any
    pub fn head(&self) -> Option<&T> {
        self.entries.get(self.head as usize)?.value.as_ref()
    }

    /// Last entry, if any
    pub fn tail(&self) -> Option<&T> {
        self.entries.get(self.tail as usize)?.value.as_ref()
    }

    /// Walk the list from head to tail
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
            remaining: self.len,
        }
    }

    fn handle(&self, index: u32) -> ListHandle {
        ListHandle {
            index,
            generation: self.entries[index as usize].generation,
        }
    }

    fn resolve(&self, handle: ListHandle) -> Option<u32> {
        let entry = self.entries.get(handle.index as usize)?;
        (entry.generation == handle.generation && entry.value.is_some()).then_some(handle.index)
    }

    fn allocate(&mut self, value: T) -> u32 {
        if self.free != NIL {
            let index = self.free;
            let entry = &mut self.entries[index as usize];
            self.free = entry.flink;
            entry.value = Some(value);
            entry.flink = NIL;
            entry.blink = NIL;
            return index;
        }

        assert!(self.entries.len() < NIL as usize, "list arena exhausted");
        let index = self.entries.len() as u32;
        self.entries.push(ListEntry {
            value: Some(value),
            generation: 0,
            flink: NIL,
            blink: NIL,
        });
        index
    }

    /// Link a freshly allocated slot between `blink` and `flink`
    fn link(&mut self, index: u32, blink: u32, flink: u32) {
        {
            let entry = &mut self.entries[index as usize];
            entry.blink = blink;
            entry.flink = flink;
        }
        if blink == NIL {
            self.head = index;
        } else {
            self.entries[blink as usize].flink = index;
        }
        if flink == NIL {
            self.tail = index;
        } else {
            self.entries[flink as usize].blink = index;
        }
        self.len += 1;
    }

    fn unlink(&mut self, index: u32) -> T {
        let (blink, flink) = {
            let entry = &self.entries[index as usize];
            (entry.blink, entry.flink)
        };
        if blink == NIL {
            self.head = flink;
        } else {
            self.entries[blink as usize].flink = flink;
        }
        if flink == NIL {
            self.tail = blink;
        } else {
            self.entries[flink as usize].blink = blink;
        }

        let free = self.free;
        let entry = &mut self.entries[index as usize];
        entry.generation = entry.generation.wrapping_add(1);
        entry.flink = free;
        entry.blink = NIL;
        self.free = index;
        self.len -= 1;

        match entry.value.take() {
            Some(value) => value,
            None => unreachable!("linked list slot {} has no value", index),
        }
    }
}

impl<T> Default for KList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for KList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Head-to-tail iterator over a [`KList`]
pub struct Iter<'a, T> {
    list: &'a KList<T>,
    cursor: u32,
    remaining: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if self.cursor == NIL {
            return None;
        }
        let entry = &self.list.entries[self.cursor as usize];
        self.cursor = entry.flink;
        self.remaining -= 1;
        entry.value.as_ref()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, T> IntoIterator for &'a KList<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}
