//! Parent-owned blocks and the `Mpr` memory manager (§3, §4.A).
//!
//! Design Notes §9 calls for replacing the source's raw parent pointer /
//! sibling list / destructor function pointer / magic number with either a
//! `Block` type owning a `Vec<Child>`, or, for performance parity, "an
//! arena+index scheme where a block is a stable index into a vector and the
//! tree structure lives in auxiliary tables". This module takes the second
//! path: every block is a [`SlabKey`] into one shared [`Slab`], and
//! parent/child/sibling links are `Option<BlockId>` fields instead of
//! pointers — the slab's generation check is what the C source used the
//! magic word for.

use crate::error::{ErrorKind, MprError, Result};
use crate::memory::heap::{HeapConfig, HeapKindSpec, HeapState};
use crate::slab::{Slab, SlabKey};
use crate::sync::MprMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub type BlockId = SlabKey;

/// What a destructor decides when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestructorOutcome {
    /// Allow the free to proceed.
    Free,
    /// Veto the free: the block is reparented to the root instead (§3).
    Veto,
}

type Destructor = Box<dyn FnMut() -> DestructorOutcome + Send>;

struct BlockSlot {
    parent: Option<BlockId>,
    first_child: Option<BlockId>,
    prev_sibling: Option<BlockId>,
    next_sibling: Option<BlockId>,
    size: usize,
    data: Vec<u8>,
    destructor: Option<Destructor>,
    /// Set the first time `run_destructor` actually calls the destructor,
    /// whatever it decides. A vetoed block keeps its `destructor` around
    /// (reparenting doesn't free it), but this flag stops a later
    /// `ignore_veto` sweep from invoking it a second time (§4.A: "each
    /// descendant's destructor runs exactly once").
    destructor_ran: bool,
    has_error: bool,
    /// Which heap this block's bytes are accounted against.
    heap: BlockId,
    /// Present if this block has been promoted to a heap.
    heap_state: Option<HeapState>,
    #[allow(dead_code)]
    seq: u64,
}

/// The hierarchical memory manager. One `Mpr` instance owns the whole block
/// tree, rooted at a `Page` heap created by [`Mpr::new`].
pub struct Mpr {
    blocks: MprMutex<Slab<BlockSlot>>,
    root: BlockId,
    next_seq: AtomicU64,
    notifier: MprMutex<Option<Box<dyn FnMut(ErrorKind) + Send>>>,
    notifying: AtomicBool,
}

impl Mpr {
    pub fn new(root_config: HeapConfig) -> Self {
        let mut blocks = Slab::new();
        let root = blocks.insert(BlockSlot {
            parent: None,
            first_child: None,
            prev_sibling: None,
            next_sibling: None,
            size: 0,
            data: Vec::new(),
            destructor: None,
            destructor_ran: false,
            has_error: false,
            // Patched to `root` itself immediately below, once its key is known.
            heap: SlabKey::dangling(),
            heap_state: Some(HeapState::new(HeapKindSpec::Page, root_config)),
            seq: 0,
        });
        if let Some(slot) = blocks.get_mut(root) {
            slot.heap = root;
        }
        Mpr {
            blocks: MprMutex::new(blocks),
            root,
            next_seq: AtomicU64::new(1),
            notifier: MprMutex::new(None),
            notifying: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> BlockId {
        self.root
    }

    pub fn set_memory_notifier(&self, cb: impl FnMut(ErrorKind) + Send + 'static) {
        self.notifier.lock().map(|slot| *slot = Some(Box::new(cb)));
    }

    fn notify(&self, kind: ErrorKind) {
        if self.notifying.swap(true, Ordering::AcqRel) {
            return; // re-entrance guard: exactly once per excursion
        }
        self.notifier.lock().map(|slot| {
            if let Some(cb) = slot {
                cb(kind);
            }
        });
        self.notifying.store(false, Ordering::Release);
    }

    /// Marks `block` and every ancestor with the sticky error flag (§7).
    fn set_error_chain(&self, block: BlockId) {
        let mut cursor = Some(block);
        self.blocks.lock().map(|slab| {
            while let Some(id) = cursor {
                let Some(slot) = slab.get_mut(id) else { break };
                slot.has_error = true;
                cursor = slot.parent;
            }
        });
    }

    pub fn has_error(&self, block: BlockId) -> bool {
        self.blocks.lock().map(|slab| slab.get(block).map(|s| s.has_error).unwrap_or(false))
    }

    /// Creates a new heap as a child block of `parent`.
    pub fn create_heap(&self, parent: BlockId, kind: HeapKindSpec, config: HeapConfig) -> Result<BlockId> {
        let id = self.insert_block(parent, 0, None)?;
        self.blocks.lock().map(|slab| {
            if let Some(slot) = slab.get_mut(id) {
                slot.heap = id;
                slot.heap_state = Some(HeapState::new(kind, config));
            }
        });
        Ok(id)
    }

    fn owning_heap_of(&self, parent: BlockId) -> Result<BlockId> {
        self.blocks.lock().map(|slab| {
            slab.get(parent).map(|s| s.heap).ok_or_else(|| bad_handle())
        })
    }

    fn insert_block(&self, parent: BlockId, size: usize, destructor: Option<Destructor>) -> Result<BlockId> {
        let heap_id = self.owning_heap_of(parent)?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let id = self.blocks.lock().map(|slab| {
            slab.insert(BlockSlot {
                parent: Some(parent),
                first_child: None,
                prev_sibling: None,
                next_sibling: None,
                size,
                data: Vec::new(),
                destructor,
                destructor_ran: false,
                has_error: false,
                heap: heap_id,
                heap_state: None,
                seq,
            })
        });
        self.link_child(parent, id)?;
        Ok(id)
    }

    fn link_child(&self, parent: BlockId, child: BlockId) -> Result<()> {
        self.blocks.lock().map(|slab| {
            let old_first = slab.get(parent).and_then(|p| p.first_child);
            if let Some(old_first) = old_first {
                if let Some(old_first_slot) = slab.get_mut(old_first) {
                    old_first_slot.prev_sibling = Some(child);
                }
            }
            if let Some(child_slot) = slab.get_mut(child) {
                child_slot.next_sibling = old_first;
            }
            if let Some(parent_slot) = slab.get_mut(parent) {
                parent_slot.first_child = Some(child);
            } else {
                return Err(bad_handle());
            }
            Ok(())
        })
    }

    fn unlink_child(&self, child: BlockId) {
        self.blocks.lock().map(|slab| {
            let (parent, prev, next) = match slab.get(child) {
                Some(s) => (s.parent, s.prev_sibling, s.next_sibling),
                None => return,
            };
            if let Some(prev) = prev {
                if let Some(s) = slab.get_mut(prev) {
                    s.next_sibling = next;
                }
            } else if let Some(parent) = parent {
                if let Some(s) = slab.get_mut(parent) {
                    s.first_child = next;
                }
            }
            if let Some(next) = next {
                if let Some(s) = slab.get_mut(next) {
                    s.prev_sibling = prev;
                }
            }
            if let Some(s) = slab.get_mut(child) {
                s.prev_sibling = None;
                s.next_sibling = None;
            }
        });
    }

    /// Allocates `size` zeroed bytes owned by `parent`.
    pub fn alloc(&self, parent: BlockId, size: usize) -> Result<BlockId> {
        self.alloc_inner(parent, size, None)
    }

    /// Allocates `size` bytes with a destructor that runs before children are
    /// freed; returning [`DestructorOutcome::Veto`] reparents the block to
    /// the root and cancels the free (§3, §4.A).
    pub fn alloc_with_destructor(
        &self,
        parent: BlockId,
        size: usize,
        destructor: impl FnMut() -> DestructorOutcome + Send + 'static,
    ) -> Result<BlockId> {
        self.alloc_inner(parent, size, Some(Box::new(destructor)))
    }

    fn alloc_inner(&self, parent: BlockId, size: usize, destructor: Option<Destructor>) -> Result<BlockId> {
        let heap_id = self.owning_heap_of(parent)?;
        let allocation = self.blocks.lock().map(|slab| -> Result<(Vec<u8>, bool)> {
            let heap_slot = slab.get_mut(heap_id).ok_or_else(bad_handle)?;
            let heap_state = heap_slot.heap_state.as_mut().ok_or_else(bad_handle)?;
            heap_state.allocate(size)
        });
        let (data, crossed_red_line) = match allocation {
            Ok(pair) => pair,
            Err(err) => {
                self.set_error_chain(parent);
                self.notify(err.kind());
                return Err(err);
            }
        };
        if crossed_red_line {
            self.notify(ErrorKind::QuotaExceeded);
        }
        let id = self.insert_block(parent, size, destructor)?;
        self.blocks.lock().map(|slab| {
            if let Some(slot) = slab.get_mut(id) {
                slot.data = data;
            }
        });
        Ok(id)
    }

    /// Runs `f` with read/write access to a block's bytes.
    pub fn with_data<R>(&self, block: BlockId, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.blocks.lock().map(|slab| {
            let slot = slab.get_mut(block).ok_or_else(bad_handle)?;
            Ok(f(&mut slot.data))
        })
    }

    pub fn size(&self, block: BlockId) -> Result<usize> {
        self.blocks.lock().map(|slab| slab.get(block).map(|s| s.size).ok_or_else(bad_handle))
    }

    pub fn bytes_allocated(&self, heap: BlockId) -> Result<usize> {
        self.blocks.lock().map(|slab| {
            slab.get(heap)
                .and_then(|s| s.heap_state.as_ref())
                .map(|h| h.bytes_allocated())
                .ok_or_else(bad_handle)
        })
    }

    /// Recursively frees `block` and all descendants, LIFO, running
    /// destructors first. A destructor returning [`DestructorOutcome::Veto`]
    /// reparents that subtree's root to the global root and stops the free
    /// for that branch. No-op if `block` is the manager's root.
    pub fn free(&self, block: BlockId) {
        if block == self.root {
            // Freeing the root tears down everything unconditionally; no
            // veto is honored since there is nowhere left to reparent to.
            let children = self.children_of(block);
            for child in children {
                self.free_subtree(child, true);
            }
            return;
        }
        self.free_subtree(block, false);
    }

    fn children_of(&self, block: BlockId) -> Vec<BlockId> {
        let mut out = Vec::new();
        self.blocks.lock().map(|slab| {
            let mut cursor = slab.get(block).and_then(|s| s.first_child);
            while let Some(id) = cursor {
                out.push(id);
                cursor = slab.get(id).and_then(|s| s.next_sibling);
            }
        });
        out
    }

    fn free_subtree(&self, block: BlockId, ignore_veto: bool) {
        // LIFO over children: free the most-recently-inserted child first.
        // `first_child` always points at the most recent insert (see
        // `link_child`), so walking the sibling chain from there is already
        // LIFO order.
        for child in self.children_of(block) {
            self.free_subtree(child, ignore_veto);
        }
        let veto = self.run_destructor(block);
        if veto && !ignore_veto {
            self.unlink_child(block);
            let _ = self.link_child(self.root, block);
            self.blocks.lock().map(|slab| {
                if let Some(slot) = slab.get_mut(block) {
                    slot.parent = Some(self.root);
                }
            });
            return;
        }
        self.reclaim_and_remove(block);
    }

    /// Runs `block`'s destructor at most once, guarded by `destructor_ran`
    /// rather than just by `destructor`'s presence: a veto keeps the closure
    /// around so the caller can still read its state, but a later
    /// `ignore_veto` pass over a reparented block must not invoke it again.
    /// So §4.A's "each descendant's destructor runs exactly once" holds
    /// across the reparent-to-root path, not just the plain free path.
    fn run_destructor(&self, block: BlockId) -> bool {
        let already_ran = self.blocks.lock().map(|slab| {
            slab.get(block).map(|s| s.destructor_ran).unwrap_or(true)
        });
        if already_ran {
            return false;
        }
        let destructor = self.blocks.lock().map(|slab| {
            slab.get_mut(block).and_then(|s| s.destructor.take())
        });
        match destructor {
            Some(mut d) => {
                let outcome = d();
                self.blocks.lock().map(|slab| {
                    if let Some(slot) = slab.get_mut(block) {
                        slot.destructor_ran = true;
                        if outcome == DestructorOutcome::Veto {
                            slot.destructor = Some(d);
                        }
                    }
                });
                outcome == DestructorOutcome::Veto
            }
            None => false,
        }
    }

    fn reclaim_and_remove(&self, block: BlockId) {
        self.unlink_child(block);
        self.blocks.lock().map(|slab| {
            if let Some(removed) = slab.remove(block) {
                if let Some(heap_slot) = slab.get_mut(removed.heap) {
                    if let Some(heap_state) = heap_slot.heap_state.as_mut() {
                        heap_state.reclaim(removed.size);
                    }
                }
            }
        });
    }

    /// Detaches `block` and reattaches it under `new_parent`. A cross-heap
    /// steal debits the old heap and credits the new one (§4.A).
    pub fn steal(&self, new_parent: BlockId, block: BlockId) -> Result<()> {
        let (old_heap, new_heap, size) = self.blocks.lock().map(|slab| -> Result<(BlockId, BlockId, usize)> {
            let old_heap = slab.get(block).map(|s| s.heap).ok_or_else(bad_handle)?;
            let new_heap = slab.get(new_parent).map(|s| s.heap).ok_or_else(bad_handle)?;
            let size = slab.get(block).map(|s| s.size).ok_or_else(bad_handle)?;
            Ok((old_heap, new_heap, size))
        })?;
        self.unlink_child(block);
        self.link_child(new_parent, block)?;
        self.blocks.lock().map(|slab| {
            if let Some(slot) = slab.get_mut(block) {
                slot.parent = Some(new_parent);
                slot.heap = new_heap;
            }
        });
        if old_heap != new_heap {
            self.blocks.lock().map(|slab| {
                if let Some(s) = slab.get_mut(old_heap).and_then(|s| s.heap_state.as_mut()) {
                    s.reclaim(size);
                }
            });
            let allocation = self.blocks.lock().map(|slab| {
                slab.get_mut(new_heap)
                    .and_then(|s| s.heap_state.as_mut())
                    .ok_or_else(bad_handle)
                    .and_then(|h| h.allocate(size))
            })?;
            let _ = allocation;
        }
        Ok(())
    }

    /// Allocates a new block of `new_size`, transplants `block`'s children
    /// onto it, and frees the old block.
    pub fn realloc(&self, parent: BlockId, block: BlockId, new_size: usize) -> Result<BlockId> {
        let new_block = self.alloc(parent, new_size)?;
        let old_len = self.size(block)?;
        let copy_len = old_len.min(new_size);
        let bytes = self.with_data(block, |d| d[..copy_len].to_vec())?;
        self.with_data(new_block, |d| d[..copy_len].copy_from_slice(&bytes))?;
        for child in self.children_of(block) {
            self.steal(new_block, child)?;
        }
        self.free(block);
        Ok(new_block)
    }
}

fn bad_handle() -> MprError {
    MprError::new(ErrorKind::BadHandle, "invalid block handle")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn parent_owned_free_runs_all_destructors() {
        let mpr = Mpr::new(HeapConfig::default());
        let root = mpr.root();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..1000 {
            let c = counter.clone();
            mpr.alloc_with_destructor(root, 8, move || {
                c.fetch_add(1, Ordering::SeqCst);
                DestructorOutcome::Free
            })
            .unwrap();
        }
        mpr.free(root);
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
        assert_eq!(mpr.bytes_allocated(root).unwrap(), 0);
    }

    #[test]
    fn destructor_veto_reparents_to_root() {
        let mpr = Mpr::new(HeapConfig::default());
        let root = mpr.root();
        let parent = mpr.alloc(root, 0).unwrap();
        let vetoed = mpr.alloc_with_destructor(parent, 4, || DestructorOutcome::Veto).unwrap();
        mpr.free(parent);
        // The vetoed block survives, reparented to root.
        assert!(mpr.size(vetoed).is_ok());
        // A subsequent free of root succeeds and cleans it up.
        mpr.free(root);
    }

    #[test]
    fn vetoed_destructor_runs_exactly_once_even_after_root_is_freed() {
        let mpr = Mpr::new(HeapConfig::default());
        let root = mpr.root();
        let parent = mpr.alloc(root, 0).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let vetoed = mpr
            .alloc_with_destructor(parent, 4, move || {
                r.fetch_add(1, Ordering::SeqCst);
                DestructorOutcome::Veto
            })
            .unwrap();
        mpr.free(parent);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(mpr.size(vetoed).is_ok());

        // free(root) sweeps every descendant with ignore_veto=true; the
        // reparented block must be reclaimed without its destructor firing
        // a second time.
        mpr.free(root);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn quota_invariant_matches_live_bytes() {
        let mpr = Mpr::new(HeapConfig { max_memory: 1024, red_line: 900 });
        let root = mpr.root();
        let a = mpr.alloc(root, 100).unwrap();
        let _b = mpr.alloc(root, 200).unwrap();
        assert_eq!(mpr.bytes_allocated(root).unwrap(), 300);
        mpr.free(a);
        assert_eq!(mpr.bytes_allocated(root).unwrap(), 200);
    }

    #[test]
    fn steal_moves_bytes_between_heaps() {
        let mpr = Mpr::new(HeapConfig::default());
        let root = mpr.root();
        let heap_a = mpr.create_heap(root, HeapKindSpec::Malloc, HeapConfig::default()).unwrap();
        let heap_b = mpr.create_heap(root, HeapKindSpec::Malloc, HeapConfig::default()).unwrap();
        let block = mpr.alloc(heap_a, 64).unwrap();
        assert_eq!(mpr.bytes_allocated(heap_a).unwrap(), 64);
        mpr.steal(heap_b, block).unwrap();
        assert_eq!(mpr.bytes_allocated(heap_a).unwrap(), 0);
        assert_eq!(mpr.bytes_allocated(heap_b).unwrap(), 64);
    }
}
