//! Piece arena and the intrusive LRU lists threaded through it.
//!
//! Pieces live in a slot vector with a free list, so a piece's slot
//! index is stable for its whole lifetime and the LRU lists can link
//! entries by index. `push_back`, `unlink` and `bump` are O(1); the MRU
//! end is the tail, the LRU end is the head.

use crate::piece::{CacheState, NUM_LRUS, PieceEntry};

/// Stable-slot arena owning every piece entry in the cache.
#[derive(Debug, Default)]
pub(crate) struct PieceArena {
    slots: Vec<Option<PieceEntry>>,
    free: Vec<u32>,
    len: usize,
}

impl PieceArena {
    pub(crate) fn insert(&mut self, entry: PieceEntry) -> u32 {
        self.len += 1;
        if let Some(idx) = self.free.pop() {
            debug_assert!(self.slots[idx as usize].is_none());
            self.slots[idx as usize] = Some(entry);
            idx
        } else {
            let idx = u32::try_from(self.slots.len()).expect("arena slot fits in u32");
            self.slots.push(Some(entry));
            idx
        }
    }

    pub(crate) fn remove(&mut self, idx: u32) -> PieceEntry {
        let entry = self.slots[idx as usize]
            .take()
            .expect("removing a live slot");
        self.free.push(idx);
        self.len -= 1;
        entry
    }

    pub(crate) fn get(&self, idx: u32) -> &PieceEntry {
        self.slots[idx as usize].as_ref().expect("live slot")
    }

    pub(crate) fn get_mut(&mut self, idx: u32) -> &mut PieceEntry {
        self.slots[idx as usize].as_mut().expect("live slot")
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// All live slots, in slot order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (u32, &PieceEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|e| (i as u32, e)))
    }
}

/// One doubly-linked list over arena slots.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct LruList {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl LruList {
    /// Link `idx` at the MRU end.
    pub(crate) fn push_back(&mut self, arena: &mut PieceArena, idx: u32) {
        let old_tail = self.tail;
        {
            let entry = arena.get_mut(idx);
            debug_assert!(entry.prev.is_none() && entry.next.is_none());
            entry.prev = old_tail;
            entry.next = None;
        }
        match old_tail {
            Some(tail) => arena.get_mut(tail).next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    /// Detach `idx` from wherever it sits in this list.
    pub(crate) fn unlink(&mut self, arena: &mut PieceArena, idx: u32) {
        let (prev, next) = {
            let entry = arena.get_mut(idx);
            let links = (entry.prev, entry.next);
            entry.prev = None;
            entry.next = None;
            links
        };
        match prev {
            Some(prev) => arena.get_mut(prev).next = next,
            None => {
                debug_assert_eq!(self.head, Some(idx));
                self.head = next;
            }
        }
        match next {
            Some(next) => arena.get_mut(next).prev = prev,
            None => {
                debug_assert_eq!(self.tail, Some(idx));
                self.tail = prev;
            }
        }
        self.len -= 1;
    }

    /// Move `idx` to the MRU end.
    pub(crate) fn bump(&mut self, arena: &mut PieceArena, idx: u32) {
        if self.tail == Some(idx) {
            return;
        }
        self.unlink(arena, idx);
        self.push_back(arena, idx);
    }

    /// The LRU end.
    pub(crate) fn front(&self) -> Option<u32> {
        self.head
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Slot indices from LRU to MRU.
    pub(crate) fn iter<'a>(&self, arena: &'a PieceArena) -> LruIter<'a> {
        LruIter {
            arena,
            cur: self.head,
        }
    }
}

pub(crate) struct LruIter<'a> {
    arena: &'a PieceArena,
    cur: Option<u32>,
}

impl Iterator for LruIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let idx = self.cur?;
        self.cur = self.arena.get(idx).next;
        Some(idx)
    }
}

/// The full set of LRU lists, one per linked cache state.
#[derive(Debug, Default)]
pub(crate) struct LruSet {
    lists: [LruList; NUM_LRUS],
}

impl LruSet {
    pub(crate) fn list(&self, state: CacheState) -> &LruList {
        &self.lists[state.lru_index().expect("linked state")]
    }

    fn list_mut(&mut self, state: CacheState) -> &mut LruList {
        &mut self.lists[state.lru_index().expect("linked state")]
    }

    /// Unlink from the current state's list (if any), set the new state,
    /// and link at the MRU end of its list (if any).
    pub(crate) fn relink(&mut self, arena: &mut PieceArena, idx: u32, new_state: CacheState) {
        let old_state = arena.get(idx).cache_state;
        if let Some(slot) = old_state.lru_index() {
            self.lists[slot].unlink(arena, idx);
        }
        arena.get_mut(idx).cache_state = new_state;
        if new_state.lru_index().is_some() {
            self.list_mut(new_state).push_back(arena, idx);
        }
    }

    /// Link a freshly inserted entry into the list its state names.
    pub(crate) fn link_current(&mut self, arena: &mut PieceArena, idx: u32) {
        let state = arena.get(idx).cache_state;
        if state.lru_index().is_some() {
            self.list_mut(state).push_back(arena, idx);
        }
    }

    /// Move to the MRU end of the piece's current list.
    pub(crate) fn bump(&mut self, arena: &mut PieceArena, idx: u32) {
        let state = arena.get(idx).cache_state;
        self.list_mut(state).bump(arena, idx);
    }

    /// Sum of all list lengths.
    pub(crate) fn total_len(&self) -> usize {
        self.lists.iter().map(LruList::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_types::{PieceIndex, StorageId};

    fn entry(piece: u32, state: CacheState) -> PieceEntry {
        PieceEntry::new(StorageId(1), PieceIndex(piece), 4, state)
    }

    fn order(list: &LruList, arena: &PieceArena) -> Vec<u32> {
        list.iter(arena).map(|i| arena.get(i).piece.0).collect()
    }

    #[test]
    fn push_back_is_mru_order() {
        let mut arena = PieceArena::default();
        let mut list = LruList::default();
        for piece in 0..3 {
            let idx = arena.insert(entry(piece, CacheState::ReadLru1));
            list.push_back(&mut arena, idx);
        }
        assert_eq!(order(&list, &arena), vec![0, 1, 2]);
        assert_eq!(list.front().map(|i| arena.get(i).piece.0), Some(0));
        assert_eq!(list.iter(&arena).last().map(|i| arena.get(i).piece.0), Some(2));
    }

    #[test]
    fn unlink_middle_and_ends() {
        let mut arena = PieceArena::default();
        let mut list = LruList::default();
        let idxs: Vec<u32> = (0..4)
            .map(|piece| {
                let idx = arena.insert(entry(piece, CacheState::ReadLru1));
                list.push_back(&mut arena, idx);
                idx
            })
            .collect();

        list.unlink(&mut arena, idxs[1]);
        assert_eq!(order(&list, &arena), vec![0, 2, 3]);
        list.unlink(&mut arena, idxs[0]);
        assert_eq!(order(&list, &arena), vec![2, 3]);
        list.unlink(&mut arena, idxs[3]);
        assert_eq!(order(&list, &arena), vec![2]);
        list.unlink(&mut arena, idxs[2]);
        assert_eq!(list.len(), 0);
        assert!(list.front().is_none());
        assert!(list.iter(&arena).next().is_none());
    }

    #[test]
    fn bump_moves_to_mru() {
        let mut arena = PieceArena::default();
        let mut list = LruList::default();
        let idxs: Vec<u32> = (0..3)
            .map(|piece| {
                let idx = arena.insert(entry(piece, CacheState::ReadLru1));
                list.push_back(&mut arena, idx);
                idx
            })
            .collect();
        list.bump(&mut arena, idxs[0]);
        assert_eq!(order(&list, &arena), vec![1, 2, 0]);
        // bumping the MRU entry is a no-op
        list.bump(&mut arena, idxs[0]);
        assert_eq!(order(&list, &arena), vec![1, 2, 0]);
    }

    #[test]
    fn relink_moves_between_lists() {
        let mut arena = PieceArena::default();
        let mut set = LruSet::default();
        let idx = arena.insert(entry(7, CacheState::Detached));
        set.relink(&mut arena, idx, CacheState::ReadLru1);
        assert_eq!(set.list(CacheState::ReadLru1).len(), 1);

        set.relink(&mut arena, idx, CacheState::ReadLru2);
        assert_eq!(set.list(CacheState::ReadLru1).len(), 0);
        assert_eq!(set.list(CacheState::ReadLru2).len(), 1);
        assert_eq!(arena.get(idx).cache_state, CacheState::ReadLru2);
        assert_eq!(set.total_len(), 1);
    }

    #[test]
    fn arena_reuses_freed_slots() {
        let mut arena = PieceArena::default();
        let a = arena.insert(entry(0, CacheState::Detached));
        let b = arena.insert(entry(1, CacheState::Detached));
        assert_eq!(arena.len(), 2);
        let removed = arena.remove(a);
        assert_eq!(removed.piece, PieceIndex(0));
        let c = arena.insert(entry(2, CacheState::Detached));
        assert_eq!(c, a, "slot is recycled");
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(b).piece, PieceIndex(1));
        assert_eq!(arena.iter().count(), 2);
    }
}
