//! First-fit, coalescing free-list allocator over a single pinned,
//! pre-registered buffer. Blocks live in a typed arena addressed by
//! `u32` indices rather than raw pointer links, with the free and used
//! chains threaded through that arena in strictly ascending-address
//! order.

use crate::error::{RdmaError, RdmaResult};
use crate::verbs::{MrRegistrar, ProtectionDomain, RegisteredMr};
use crate::wr::{RecvWr, SendWr};
use slog::Logger;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type SlotId = u32;

#[derive(Debug, Clone, Copy)]
struct Slot {
    addr: usize,
    size: usize,
    prev: Option<SlotId>,
    next: Option<SlotId>,
}

struct Active {
    buffer: Vec<u8>,
    mr: RegisteredMr,
    slots: Vec<Slot>,
    free_pool: Vec<SlotId>,
    free_head: Option<SlotId>,
    used_head: Option<SlotId>,
    alloc_map: HashMap<u64, SlotId>,
}

enum State {
    Empty,
    Active(Active),
}

pub struct MrAllocator {
    registrar: Arc<dyn MrRegistrar>,
    log: Logger,
    state: Mutex<State>,
}

impl MrAllocator {
    pub fn new(registrar: Arc<dyn MrRegistrar>, log: Logger) -> MrAllocator {
        MrAllocator {
            registrar,
            log,
            state: Mutex::new(State::Empty),
        }
    }

    pub fn register(&self, pd: ProtectionDomain, size: usize) -> RdmaResult<()> {
        let mut state = self.state.lock().unwrap();
        if matches!(&*state, State::Active(_)) {
            return Err(RdmaError::setup("memory region already registered"));
        }

        let mut buffer = vec![0u8; size];
        let mr = self.registrar.reg_mr(pd, buffer.as_mut_ptr(), size)?;

        let root = Slot { addr: 0, size, prev: None, next: None };
        let slots = vec![root];

        *state = State::Active(Active {
            buffer,
            mr,
            slots,
            free_pool: Vec::new(),
            free_head: Some(0),
            used_head: None,
            alloc_map: HashMap::new(),
        });
        Ok(())
    }

    pub fn allocate_send(&self, wr_id: u64, payload: &[u8]) -> RdmaResult<SendWr> {
        let needed = payload.len() + 1;
        let mut state = self.state.lock().unwrap();
        let active = Self::active_mut(&mut state)?;
        let offset = active.reserve(wr_id, needed).ok_or(RdmaError::AllocatorExhausted { requested: needed })?;

        active.buffer[offset..offset + payload.len()].copy_from_slice(payload);
        active.buffer[offset + payload.len()] = 0;

        let addr = unsafe { active.buffer.as_mut_ptr().add(offset) };
        Ok(SendWr {
            wr_id,
            addr,
            len: needed as u32,
            lkey: active.mr.lkey,
        })
    }

    pub fn allocate_recv(&self, wr_id: u64, sz: usize) -> RdmaResult<RecvWr> {
        let mut state = self.state.lock().unwrap();
        let active = Self::active_mut(&mut state)?;
        let offset = active.reserve(wr_id, sz).ok_or(RdmaError::AllocatorExhausted { requested: sz })?;

        let addr = unsafe { active.buffer.as_mut_ptr().add(offset) };
        Ok(RecvWr {
            wr_id,
            addr,
            len: sz as u32,
            lkey: active.mr.lkey,
        })
    }

    pub fn release(&self, wr_id: u64) {
        let mut state = self.state.lock().unwrap();
        let active = match Self::active_mut(&mut state) {
            Ok(a) => a,
            Err(_) => return,
        };
        if !active.release(wr_id) {
            slog::warn!(self.log, "release of unknown wr_id"; "wr_id" => wr_id);
        }
    }

    pub fn deregister(&self) -> RdmaResult<()> {
        let mut state = self.state.lock().unwrap();
        let active = match std::mem::replace(&mut *state, State::Empty) {
            State::Active(a) => a,
            State::Empty => return Ok(()),
        };
        self.registrar.dereg_mr(active.mr)
    }

    /// Snapshot of the free list as `(offset, size)` pairs in ascending
    /// address order, used by the allocator's own tests.
    #[cfg(test)]
    fn free_blocks(&self) -> Vec<(usize, usize)> {
        let state = self.state.lock().unwrap();
        match &*state {
            State::Active(a) => a.chain(a.free_head),
            State::Empty => Vec::new(),
        }
    }

    #[cfg(test)]
    fn used_blocks(&self) -> Vec<(usize, usize)> {
        let state = self.state.lock().unwrap();
        match &*state {
            State::Active(a) => a.chain(a.used_head),
            State::Empty => Vec::new(),
        }
    }

    fn active_mut(state: &mut State) -> RdmaResult<&mut Active> {
        match state {
            State::Active(a) => Ok(a),
            State::Empty => Err(RdmaError::setup("memory region not registered")),
        }
    }
}

impl Drop for MrAllocator {
    fn drop(&mut self) {
        let _ = self.deregister();
    }
}

impl Active {
    #[cfg(test)]
    fn chain(&self, mut head: Option<SlotId>) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        while let Some(id) = head {
            let slot = self.slots[id as usize];
            out.push((slot.addr, slot.size));
            head = slot.next;
        }
        out
    }

    fn new_slot(&mut self, addr: usize, size: usize) -> SlotId {
        let slot = Slot { addr, size, prev: None, next: None };
        if let Some(id) = self.free_pool.pop() {
            self.slots[id as usize] = slot;
            id
        } else {
            self.slots.push(slot);
            (self.slots.len() - 1) as SlotId
        }
    }

    fn recycle_slot(&mut self, id: SlotId) {
        self.free_pool.push(id);
    }

    /// First-fit reservation of `needed` bytes from the free list,
    /// narrowing or consuming the block found. Returns the offset of the
    /// reserved extent.
    fn reserve(&mut self, wr_id: u64, needed: usize) -> Option<usize> {
        let mut cursor = self.free_head;
        while let Some(id) = cursor {
            let slot = self.slots[id as usize];
            if slot.size >= needed {
                let used_addr = slot.addr;
                if slot.size > needed {
                    self.slots[id as usize].addr += needed;
                    self.slots[id as usize].size -= needed;
                } else {
                    self.unlink(id, true);
                    self.recycle_slot(id);
                }
                let used_id = self.new_slot(used_addr, needed);
                self.insert_sorted(used_id, false);
                self.alloc_map.insert(wr_id, used_id);
                return Some(used_addr);
            }
            cursor = slot.next;
        }
        None
    }

    /// Returns the extent bound to `wr_id` to the free list, coalescing
    /// with its neighbours. Returns `false` if `wr_id` is unknown.
    fn release(&mut self, wr_id: u64) -> bool {
        let used_id = match self.alloc_map.remove(&wr_id) {
            Some(id) => id,
            None => return false,
        };
        self.unlink(used_id, false);
        self.insert_sorted(used_id, true);
        true
    }

    /// Unlinks `id` from the free (`is_free = true`) or used list.
    fn unlink(&mut self, id: SlotId, is_free: bool) {
        let slot = self.slots[id as usize];
        match slot.prev {
            Some(p) => self.slots[p as usize].next = slot.next,
            None => {
                if is_free {
                    self.free_head = slot.next;
                } else {
                    self.used_head = slot.next;
                }
            }
        }
        if let Some(n) = slot.next {
            self.slots[n as usize].prev = slot.prev;
        }
    }

    /// Inserts `id` into the free (`merge = true`) or used (`merge =
    /// false`) list at its address position. When `merge`, coalesces with
    /// the immediately-adjacent predecessor/successor.
    fn insert_sorted(&mut self, id: SlotId, merge: bool) {
        let head = if merge { self.free_head } else { self.used_head };

        let mut prev: Option<SlotId> = None;
        let mut next = head;
        while let Some(n) = next {
            if self.slots[id as usize].addr < self.slots[n as usize].addr {
                break;
            }
            prev = Some(n);
            next = self.slots[n as usize].next;
        }

        if merge {
            // Coalesce leftward: prev directly abuts the new block.
            if let Some(p) = prev {
                let pslot = self.slots[p as usize];
                if pslot.addr + pslot.size == self.slots[id as usize].addr {
                    self.slots[id as usize].addr = pslot.addr;
                    self.slots[id as usize].size += pslot.size;
                    let grandparent = pslot.prev;
                    self.unlink(p, true);
                    self.recycle_slot(p);
                    prev = grandparent;
                }
            }
            // Coalesce rightward: new block directly abuts next.
            if let Some(n) = next {
                let nslot = self.slots[n as usize];
                let id_slot = self.slots[id as usize];
                if id_slot.addr + id_slot.size == nslot.addr {
                    self.slots[id as usize].size += nslot.size;
                    let successor = nslot.next;
                    self.unlink(n, true);
                    self.recycle_slot(n);
                    next = successor;
                }
            }
        }

        self.slots[id as usize].prev = prev;
        self.slots[id as usize].next = next;
        match prev {
            Some(p) => self.slots[p as usize].next = Some(id),
            None => {
                if merge {
                    self.free_head = Some(id);
                } else {
                    self.used_head = Some(id);
                }
            }
        }
        if let Some(n) = next {
            self.slots[n as usize].prev = Some(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::NullRegistrar;

    fn fresh(size: usize) -> MrAllocator {
        let alloc = MrAllocator::new(Arc::new(NullRegistrar::new()), flux::logging::discard());
        alloc.register(ProtectionDomain(std::ptr::null_mut()), size).unwrap();
        alloc
    }

    #[test]
    fn a1_sequential_fill() {
        let alloc = fresh(1024);
        for i in 0..10u64 {
            alloc.allocate_send(i, b"aaaaaaaaa").unwrap();
        }
        let used = alloc.used_blocks();
        assert_eq!(used.len(), 10);
        for (i, (addr, size)) in used.iter().enumerate() {
            assert_eq!(*addr, i * 10);
            assert_eq!(*size, 10);
        }
        let free = alloc.free_blocks();
        assert_eq!(free, vec![(100, 924)]);
    }

    #[test]
    fn a2_full_cycle() {
        let alloc = fresh(1024);
        for i in 0..10u64 {
            alloc.allocate_send(i, b"aaaaaaaaa").unwrap();
        }
        for i in 0..10u64 {
            alloc.release(i);
        }
        assert_eq!(alloc.free_blocks(), vec![(0, 1024)]);
        assert!(alloc.used_blocks().is_empty());
    }

    #[test]
    fn a3_fragmentation_regression() {
        let alloc = fresh(1024);
        alloc.allocate_recv(0, 100).unwrap();
        alloc.allocate_recv(1, 100).unwrap();
        alloc.allocate_recv(2, 100).unwrap();
        alloc.release(1);
        alloc.allocate_recv(3, 50).unwrap();

        let used = alloc.used_blocks();
        assert!(used.contains(&(100, 50)));
        let free = alloc.free_blocks();
        assert!(free.contains(&(150, 50)));
    }

    #[test]
    fn coverage_and_ordering_invariants() {
        let alloc = fresh(1024);
        let ids: Vec<u64> = (0..8).collect();
        for &i in &ids {
            alloc.allocate_recv(i, 37).unwrap();
        }
        for &i in ids.iter().step_by(2) {
            alloc.release(i);
        }
        for i in 20..24u64 {
            alloc.allocate_recv(i, 10).unwrap();
        }

        let free = alloc.free_blocks();
        let used = alloc.used_blocks();

        // Ordering: both lists strictly ascending by address.
        assert!(free.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(used.windows(2).all(|w| w[0].0 < w[1].0));

        // Coalescing: no two adjacent free blocks abut.
        assert!(free.windows(2).all(|w| w[0].0 + w[0].1 < w[1].0));

        // Coverage: free + used partitions [0, 1024) with no overlap.
        let mut intervals: Vec<(usize, usize)> = free.iter().chain(used.iter()).copied().collect();
        intervals.sort_by_key(|&(addr, _)| addr);
        let mut cursor = 0usize;
        for (addr, size) in intervals {
            assert_eq!(addr, cursor);
            cursor += size;
        }
        assert_eq!(cursor, 1024);
    }

    #[test]
    fn allocate_fails_when_exhausted() {
        let alloc = fresh(16);
        alloc.allocate_recv(0, 16).unwrap();
        let err = alloc.allocate_recv(1, 1).unwrap_err();
        assert!(matches!(err, RdmaError::AllocatorExhausted { requested: 1 }));
    }

    #[test]
    fn double_register_is_refused() {
        let alloc = fresh(16);
        let err = alloc.register(ProtectionDomain(std::ptr::null_mut()), 16).unwrap_err();
        assert!(matches!(err, RdmaError::Setup(_)));
    }
}
