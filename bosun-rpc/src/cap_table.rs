// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Id-keyed tables for the four per-connection entity kinds.
//!
//! Ids we allocate (questions, exports, embargoes) come from a slot table
//! that reuses freed ids densely, starting at 0. Ids the remote peer
//! allocates (answers, imports) live in a plain map.

use std::collections::HashMap;

/// A table whose ids are allocated by this side, densely, with reuse.
pub struct SlotTable<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SlotTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn push(&mut self, value: T) -> u32 {
        match self.free.pop() {
            Some(id) => {
                debug_assert!(self.slots[id as usize].is_none());
                self.slots[id as usize] = Some(value);
                id
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() as u32 - 1
            }
        }
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.slots.get(id as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(id as usize).and_then(|s| s.as_mut())
    }

    pub fn erase(&mut self, id: u32) -> Option<T> {
        let taken = self.slots.get_mut(id as usize).and_then(|s| s.take());
        if taken.is_some() {
            self.free.push(id);
        }
        taken
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_mut().map(|v| (id as u32, v)))
    }

    /// Removes every live entry, yielding `(id, value)` pairs.
    pub fn drain(&mut self) -> Vec<(u32, T)> {
        let mut out = Vec::new();
        for (id, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.take() {
                self.free.push(id as u32);
                out.push((id as u32, value));
            }
        }
        out
    }
}

/// A table whose ids are assigned by the remote peer.
pub struct PeerKeyedTable<T> {
    map: HashMap<u32, T>,
}

impl<T> Default for PeerKeyedTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PeerKeyedTable<T> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn insert(&mut self, id: u32, value: T) -> Option<T> {
        self.map.insert(id, value)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.map.contains_key(&id)
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.map.get_mut(&id)
    }

    pub fn entry(&mut self, id: u32) -> std::collections::hash_map::Entry<'_, u32, T> {
        self.map.entry(id)
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        self.map.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = u32> + '_ {
        self.map.keys().copied()
    }

    pub fn drain(&mut self) -> Vec<(u32, T)> {
        self.map.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_ids_are_dense_and_reused() {
        let mut table = SlotTable::new();
        assert_eq!(table.push("a"), 0);
        assert_eq!(table.push("b"), 1);
        assert_eq!(table.push("c"), 2);
        assert_eq!(table.erase(1), Some("b"));
        // Freed id comes back before a fresh one.
        assert_eq!(table.push("d"), 1);
        assert_eq!(table.push("e"), 3);
        assert_eq!(table.get(1), Some(&"d"));
    }

    #[test]
    fn erase_is_idempotent() {
        let mut table = SlotTable::new();
        let id = table.push(5);
        assert_eq!(table.erase(id), Some(5));
        assert_eq!(table.erase(id), None);
        assert!(table.is_empty());
    }
}
