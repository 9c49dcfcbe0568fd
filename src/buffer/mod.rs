/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! The in-memory frame pool that mediates all access to pages: pinning,
//! LRU eviction, dirty-flush-on-eviction, and single-flight loads so
//! concurrent misses on the same page id only hit the page store once.
//! See spec.md §4.6.

pub mod lru;

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, trace};

use crate::directory::PageDirectory;
use crate::error::BufferError;
use crate::page::{PageId, RawPage};
use crate::store::PageStore;
use lru::LruList;

/// Default frame pool capacity, overridable via [`BufferManager::with_capacity`].
pub const DEFAULT_CAPACITY: usize = 1024;

struct LoadSlot {
    done: Mutex<bool>,
    cv: Condvar,
}

impl LoadSlot {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.cv.wait(done).unwrap();
        }
    }

    fn signal(&self) {
        let mut done = self.done.lock().unwrap();
        *done = true;
        self.cv.notify_all();
    }
}

struct Pool {
    resident: HashMap<PageId, usize>,
    frame_page: Vec<Option<PageId>>,
    pin_counts: Vec<u32>,
    dirty: Vec<bool>,
    permanently_pinned: Vec<bool>,
    /// Frames reserved as an eviction victim whose dirty flush is
    /// in flight with the pool mutex dropped. Excluded from victim
    /// selection so two concurrent loaders can never be handed the
    /// same freed frame.
    evicting: Vec<bool>,
    lru: LruList,
    empty_frames: Vec<usize>,
    loading: HashMap<PageId, Arc<LoadSlot>>,
}

/// The frame pool. The pool mutex guards `Pool` (map lookup, pin
/// arithmetic, LRU bookkeeping) and is never held across disk I/O; each
/// frame's own `RwLock` guards its content independently.
pub struct BufferManager {
    store: Arc<PageStore>,
    directory: Arc<PageDirectory>,
    frames: Vec<RwLock<Option<RawPage>>>,
    pool: Mutex<Pool>,
}

impl BufferManager {
    pub fn new(store: Arc<PageStore>, directory: Arc<PageDirectory>) -> Self {
        Self::with_capacity(store, directory, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(
        store: Arc<PageStore>,
        directory: Arc<PageDirectory>,
        capacity: usize,
    ) -> Self {
        let frames = (0..capacity).map(|_| RwLock::new(None)).collect();
        let pool = Pool {
            resident: HashMap::with_capacity(capacity),
            frame_page: vec![None; capacity],
            pin_counts: vec![0; capacity],
            dirty: vec![false; capacity],
            permanently_pinned: vec![false; capacity],
            evicting: vec![false; capacity],
            lru: LruList::new(capacity),
            empty_frames: (0..capacity).rev().collect(),
            loading: HashMap::new(),
        };
        Self {
            store,
            directory,
            frames,
            pool: Mutex::new(pool),
        }
    }

    /// Look up `page_id` in the resident set, pin it, and return a
    /// handle. On a miss, loads the page from the page store (via the
    /// directory) into a free or evicted frame. Concurrent misses for
    /// the same page id only perform one load; the rest wait on it and
    /// retry the lookup.
    pub fn get_page(&self, page_id: &PageId) -> Result<PinnedFrame<'_>, BufferError> {
        loop {
            {
                let mut pool = self.pool.lock().unwrap();
                if let Some(&frame_id) = pool.resident.get(page_id) {
                    pool.pin_counts[frame_id] = pool.pin_counts[frame_id]
                        .checked_add(1)
                        .expect("pin count overflow");
                    pool.lru.touch(frame_id);
                    trace!(%page_id, frame_id, "buffer hit");
                    return Ok(PinnedFrame {
                        manager: self,
                        frame_id,
                        page_id: page_id.clone(),
                    });
                }
                if let Some(slot) = pool.loading.get(page_id) {
                    let slot = slot.clone();
                    drop(pool);
                    slot.wait();
                    continue;
                }
                pool.loading.insert(page_id.clone(), Arc::new(LoadSlot::new()));
            }

            let result = self.load_page(page_id);

            {
                let mut pool = self.pool.lock().unwrap();
                let slot = pool.loading.remove(page_id);
                drop(pool);
                if let Some(slot) = slot {
                    slot.signal();
                }
            }

            result?;
            // Another thread may have beaten us back to the resident
            // check (impossible here since we were the sole loader, but
            // looping keeps the pin/touch bookkeeping in one place).
            continue;
        }
    }

    fn load_page(&self, page_id: &PageId) -> Result<(), BufferError> {
        let loc = self.directory.get_page_loc(page_id)?;
        let raw = self.store.get_page(page_id.clone(), &loc)?;
        let frame_id = self.acquire_frame_slot()?;

        *self.frames[frame_id].write().unwrap() = Some(raw);

        let mut pool = self.pool.lock().unwrap();
        pool.resident.insert(page_id.clone(), frame_id);
        pool.frame_page[frame_id] = Some(page_id.clone());
        pool.dirty[frame_id] = false;
        debug!(%page_id, frame_id, "loaded page into buffer");
        Ok(())
    }

    /// Reserve a frame for a new page: a never-used frame if one
    /// exists, otherwise the least-recently-used unpinned, non-permanent
    /// frame, flushing it first if dirty.
    fn acquire_frame_slot(&self) -> Result<usize, BufferError> {
        let mut pool = self.pool.lock().unwrap();
        if let Some(frame_id) = pool.empty_frames.pop() {
            return Ok(frame_id);
        }

        let frame_id = pool
            .lru
            .iter_least_recent_first()
            .find(|&fid| {
                pool.pin_counts[fid] == 0 && !pool.permanently_pinned[fid] && !pool.evicting[fid]
            })
            .ok_or(BufferError::NoFrameAvailable)?;

        let victim_page_id = pool.frame_page[frame_id]
            .clone()
            .expect("a frame linked into the LRU list is always resident");
        let was_dirty = pool.dirty[frame_id];
        // Reserve the victim before dropping the pool mutex for the
        // flush: excluding it from selection here, rather than only
        // removing it from `resident`/`lru` after the flush lands, is
        // what stops a second concurrent `acquire_frame_slot` (loading a
        // *different* page id) from picking the same frame, flushing it
        // again, and handing both loaders the same freed slot.
        pool.evicting[frame_id] = true;
        drop(pool);

        // Flush before tearing down any bookkeeping: if the write fails,
        // the victim must still be found as resident, in the LRU list,
        // and pinnable/evictable again by a later attempt.
        let flush_result = if was_dirty {
            let guard = self.frames[frame_id].write().unwrap();
            match guard.as_ref() {
                Some(page) => {
                    debug!(page_id = %victim_page_id, frame_id, "flushing dirty victim before eviction");
                    self.store.write_page(page)
                }
                None => Ok(()),
            }
        } else {
            Ok(())
        };

        let mut pool = self.pool.lock().unwrap();
        pool.evicting[frame_id] = false;
        flush_result?;

        pool.resident.remove(&victim_page_id);
        pool.lru.remove(frame_id);
        pool.frame_page[frame_id] = None;
        pool.dirty[frame_id] = false;

        Ok(frame_id)
    }

    fn release_pin(&self, frame_id: usize) {
        let mut pool = self.pool.lock().unwrap();
        assert!(
            pool.pin_counts[frame_id] > 0,
            "pin count underflow on frame {frame_id}"
        );
        pool.pin_counts[frame_id] -= 1;
    }

    fn set_dirty(&self, frame_id: usize) {
        let mut pool = self.pool.lock().unwrap();
        pool.dirty[frame_id] = true;
    }

    /// Exempt `frame`'s page from eviction until [`unpin_permanently`] is
    /// called. Intended for schema/root metadata pages that must stay
    /// resident for the process lifetime.
    ///
    /// [`unpin_permanently`]: BufferManager::unpin_permanently
    pub fn pin_permanently(&self, frame: &PinnedFrame<'_>) {
        let mut pool = self.pool.lock().unwrap();
        pool.permanently_pinned[frame.frame_id] = true;
    }

    pub fn unpin_permanently(&self, frame: &PinnedFrame<'_>) {
        let mut pool = self.pool.lock().unwrap();
        pool.permanently_pinned[frame.frame_id] = false;
    }
}

/// A leased frame. `GetPage`'s return value: the pin is released when
/// this value is dropped (or explicitly via [`PinnedFrame::release`]).
pub struct PinnedFrame<'a> {
    manager: &'a BufferManager,
    frame_id: usize,
    page_id: PageId,
}

impl<'a> PinnedFrame<'a> {
    pub fn page_id(&self) -> &PageId {
        &self.page_id
    }

    /// Acquire the frame's content latch for reading.
    pub fn read_latch(&self) -> RwLockReadGuard<'_, Option<RawPage>> {
        self.manager.frames[self.frame_id].read().unwrap()
    }

    /// Acquire the frame's content latch for writing.
    pub fn write_latch(&self) -> RwLockWriteGuard<'_, Option<RawPage>> {
        self.manager.frames[self.frame_id].write().unwrap()
    }

    /// Flag the contained page as modified, to be flushed on eviction.
    /// The caller is assumed to already hold the frame's write latch (or
    /// otherwise be the exclusive writer) while calling this.
    pub fn mark_dirty(&self) {
        self.manager.set_dirty(self.frame_id);
    }

    /// Release the pin. Equivalent to dropping this handle; spelled out
    /// for call sites that want it explicit.
    pub fn release(self) {}
}

impl Drop for PinnedFrame<'_> {
    fn drop(&mut self) {
        self.manager.release_pin(self.frame_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{PageType, PhysLoc};

    fn harness() -> (Arc<PageStore>, Arc<PageDirectory>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PageStore::new());
        let directory = Arc::new(PageDirectory::new(dir.path()));
        (store, directory, dir)
    }

    fn put_page(
        store: &PageStore,
        directory: &PageDirectory,
        id: &PageId,
        fill: u8,
    ) -> PhysLoc {
        let path = directory.file_path(&id.relation).unwrap_or_else(|| {
            directory.register_file(&id.relation, &id.relation).unwrap()
        });
        if directory.get_page_loc(id).is_err() {
            if !path.exists() {
                store.create_file(&path).unwrap();
            }
            let offset = directory.next_page_offset(&id.relation);
            directory.register_page(id.clone(), offset).unwrap();
        }
        let loc = directory.get_page_loc(id).unwrap();
        let mut page = RawPage::new(id.clone(), loc.clone(), PageType::LEAF);
        page.as_bytes_mut()[20] = fill;
        store.write_page(&page).unwrap();
        loc
    }

    #[test]
    fn get_page_twice_reuses_the_same_frame_and_pins_twice() {
        let (store, directory, _tmp) = harness();
        let id = PageId::new("accounts", 0);
        put_page(&store, &directory, &id, 0xAB);

        let manager = BufferManager::with_capacity(store, directory, 4);
        let first = manager.get_page(&id).unwrap();
        let second = manager.get_page(&id).unwrap();
        assert_eq!(first.frame_id, second.frame_id);

        let bytes = first.read_latch();
        assert_eq!(bytes.as_ref().unwrap().as_bytes()[20], 0xAB);
    }

    #[test]
    fn pin_stability_across_pool_exhaustion() {
        let (store, directory, _tmp) = harness();
        let pinned_id = PageId::new("accounts", 0);
        put_page(&store, &directory, &pinned_id, 0x11);

        let manager = BufferManager::with_capacity(store.clone(), directory.clone(), 2);
        let pinned = manager.get_page(&pinned_id).unwrap();

        // Fill the rest of the pool (capacity 2) and beyond; the pinned
        // frame must never be chosen as a victim.
        for i in 1..6 {
            let id = PageId::new("accounts", i);
            put_page(&store, &directory, &id, i as u8);
            let frame = manager.get_page(&id).unwrap();
            drop(frame);
        }

        assert_eq!(
            pinned.read_latch().as_ref().unwrap().as_bytes()[20],
            0x11
        );
    }

    #[test]
    fn eviction_flushes_dirty_victim_before_reuse() {
        let (store, directory, tmp) = harness();
        let victim_id = PageId::new("accounts", 0);
        put_page(&store, &directory, &victim_id, 0x00);

        {
            let manager = BufferManager::with_capacity(store.clone(), directory.clone(), 1);
            let frame = manager.get_page(&victim_id).unwrap();
            {
                let mut guard = frame.write_latch();
                guard.as_mut().unwrap().as_bytes_mut()[20] = 0x99;
            }
            frame.mark_dirty();
            drop(frame);

            // Force eviction of the only frame by requesting another page.
            let other_id = PageId::new("accounts", 1);
            put_page(&store, &directory, &other_id, 0x01);
            let _other = manager.get_page(&other_id).unwrap();
        }

        // Reopen via a fresh store/directory pair rooted at the same path.
        let fresh_store = PageStore::new();
        let loc = PhysLoc::new(
            directory.file_path("accounts").unwrap().to_string_lossy().into_owned(),
            0,
        );
        let reread = fresh_store.get_page(victim_id, &loc).unwrap();
        assert_eq!(reread.as_bytes()[20], 0x99);
        drop(tmp);
    }

    #[test]
    fn concurrent_misses_on_the_same_page_converge_on_one_frame() {
        let (store, directory, _tmp) = harness();
        let id = PageId::new("accounts", 0);
        put_page(&store, &directory, &id, 0x77);

        let manager = Arc::new(BufferManager::with_capacity(store, directory, 8));
        let frame_ids: Vec<usize> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let manager = manager.clone();
                    let id = id.clone();
                    scope.spawn(move || {
                        let frame = manager.get_page(&id).unwrap();
                        let frame_id = frame.frame_id;
                        drop(frame);
                        frame_id
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(frame_ids.iter().all(|&fid| fid == frame_ids[0]));
    }

    #[test]
    fn concurrent_eviction_of_distinct_pages_never_shares_a_freed_frame() {
        let (store, directory, _tmp) = harness();
        const PAGES: u32 = 40;
        for i in 0..PAGES {
            put_page(&store, &directory, &PageId::new("accounts", i), i as u8);
        }

        // A small pool forces every load past the first two to evict.
        let manager = Arc::new(BufferManager::with_capacity(store, directory, 2));

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..PAGES)
                .map(|i| {
                    let manager = manager.clone();
                    scope.spawn(move || {
                        let id = PageId::new("accounts", i);
                        let frame = manager.get_page(&id).unwrap();
                        let bytes = frame.read_latch();
                        let observed = bytes.as_ref().unwrap().as_bytes()[20];
                        // If two loaders were ever handed the same freed
                        // frame, one of them would observe the other's
                        // page's fill byte instead of its own.
                        assert_eq!(observed, i as u8, "frame for page {i} holds another page's bytes");
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
        });
    }

    #[test]
    fn no_frame_available_when_pool_is_full_of_pinned_pages() {
        let (store, directory, _tmp) = harness();
        let manager = BufferManager::with_capacity(store.clone(), directory.clone(), 1);

        let id0 = PageId::new("accounts", 0);
        put_page(&store, &directory, &id0, 0);
        let _pinned = manager.get_page(&id0).unwrap();

        let id1 = PageId::new("accounts", 1);
        put_page(&store, &directory, &id1, 1);
        assert!(matches!(
            manager.get_page(&id1),
            Err(BufferError::NoFrameAvailable)
        ));
    }
}
