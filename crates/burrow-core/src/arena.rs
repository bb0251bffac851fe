//! Slot map with small, reusable integer handles.
//!
//! Holepunch messages address an in-flight server attempt by id, so ids
//! must stay small and stable while the attempt lives. Freed slots are
//! handed out again, lowest first.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Vector of optional slots plus a free list.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Option<T>>,
    free: BinaryHeap<Reverse<usize>>,
    len: usize,
}

impl<T> Arena<T> {
    /// Empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: BinaryHeap::new(),
            len: 0,
        }
    }

    /// Store `value`, returning its id.
    pub fn insert(&mut self, value: T) -> u64 {
        self.len += 1;
        if let Some(Reverse(index)) = self.free.pop() {
            self.slots[index] = Some(value);
            return index as u64;
        }
        self.slots.push(Some(value));
        (self.slots.len() - 1) as u64
    }

    /// Value at `id`.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<&T> {
        let index = usize::try_from(id).ok()?;
        self.slots.get(index)?.as_ref()
    }

    /// Mutable value at `id`.
    pub fn get_mut(&mut self, id: u64) -> Option<&mut T> {
        let index = usize::try_from(id).ok()?;
        self.slots.get_mut(index)?.as_mut()
    }

    /// Take the value at `id`, freeing the slot.
    pub fn remove(&mut self, id: u64) -> Option<T> {
        let index = usize::try_from(id).ok()?;
        let value = self.slots.get_mut(index)?.take()?;
        self.len -= 1;
        self.free.push(Reverse(index));
        self.trim();
        Some(value)
    }

    /// Remove and return every value matching `predicate`.
    pub fn remove_where<F>(&mut self, mut predicate: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let ids: Vec<u64> = self
            .iter()
            .filter(|(_, value)| predicate(value))
            .map(|(id, _)| id)
            .collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Remove everything.
    pub fn drain(&mut self) -> Vec<T> {
        self.free.clear();
        self.len = 0;
        std::mem::take(&mut self.slots).into_iter().flatten().collect()
    }

    /// Occupied slots with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|value| (index as u64, value)))
    }

    /// Occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no slot is occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drop trailing free slots so the vector shrinks back after bursts.
    fn trim(&mut self) {
        let mut trimmed = false;
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
            trimmed = true;
        }
        if trimmed {
            let end = self.slots.len();
            self.free.retain(|Reverse(index)| *index < end);
        }
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}
