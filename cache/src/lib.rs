//! Write-back page cache between the filesystem adapter and the remote
//! device.
//!
//! # Overview
//!
//! The cache holds fixed-size pages of remote files in memory so that
//! sequential and random access does not pay a round-trip per byte. Reads
//! pull whole pages from the device through the [Backing::fill] callback;
//! writes mutate pages in place and mark them dirty; [Cache::flush] pushes
//! dirty pages back through [Backing::flush].
//!
//! Residency is bounded by a page budget with LRU replacement. A clean
//! page evicted from the tail is dropped; a dirty one is parked on the
//! orphan list, the durability backstop: every byte ever written stays
//! reachable through the LRU, the orphan list, or a completed flush, until
//! the adapter drains the orphans with [Cache::take_orphans].
//!
//! # Concurrency
//!
//! The cache is cooperative: methods suspend only on fills, flushes, and
//! waits for fills started by other callers. State lives behind a mutex
//! that is never held across a suspension point. Fills are single-flight
//! per page: concurrent misses on the same key share one fill future, every
//! waiter drives it, and all of them observe the same outcome. A fill
//! abandoned by every waiter is resumed and completed by the next caller
//! that touches its key.

mod list;
mod metrics;
mod page;

pub use metrics::Metrics;
pub use page::{FileId, Page, PageKey};
// The cache's error currency is the RPC error: remote statuses pass
// through unchanged and transport faults stay distinguishable.
pub use tetherfs_rpc::Error;

use futures::future::{BoxFuture, FutureExt as _, Shared};
use list::List;
use prometheus_client::registry::Registry;
use std::{
    collections::HashMap,
    future::Future,
    mem,
    sync::{Arc, Mutex},
};
use tetherfs_rpc::Status;
use tracing::{debug, info, trace, warn};

/// Remote I/O supplied by the adapter: how pages are filled from the
/// device and how dirty bytes get back to it.
///
/// Handles are cloned into single-flight fill futures, so implementations
/// should be cheap to clone (the RPC-backed handle is an `Arc` around a
/// serialized client).
pub trait Backing: Clone + Send + Sync + 'static {
    /// Read from the remote into `buf` at `offset`, returning the bytes
    /// filled. A short fill is end of file, not an error.
    fn fill(
        &self,
        id: FileId,
        buf: &mut [u8],
        offset: u64,
    ) -> impl Future<Output = Result<usize, Error>> + Send;

    /// Write `buf` to the remote at `offset`, returning the bytes written.
    fn flush(
        &self,
        id: FileId,
        buf: &[u8],
        offset: u64,
    ) -> impl Future<Output = Result<usize, Error>> + Send;
}

/// Cache configuration.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Page size in bytes; rounded up to the next power of two.
    pub page_size: usize,
    /// Resident pages allowed before the LRU tail is evicted.
    pub max_pages: usize,
}

/// Single-flight fill future: resolves once the page is resident (or the
/// fill failed), and removes its own inflight entry on the way out.
type FillHandle = Shared<BoxFuture<'static, Result<(), Error>>>;

struct Inner {
    /// Resident pages, most recently used at the front.
    lru: List,
    /// PageKey to LRU slot; cardinality always equals the LRU length.
    index: HashMap<PageKey, usize>,
    /// One entry per fill in progress.
    inflight: HashMap<PageKey, FillHandle>,
    /// Dirty pages evicted from residency, awaiting an explicit drain.
    orphans: Vec<Page>,
    page_size: usize,
    max_pages: usize,
    /// Bumped by reconfiguration and invalidation; a fill completing under
    /// a different generation discards its page instead of inserting stale
    /// geometry.
    generation: u64,
}

/// The per-mount page cache. See the crate documentation.
pub struct Cache {
    inner: Arc<Mutex<Inner>>,
    metrics: Arc<Metrics>,
}

impl Cache {
    /// Create a cache and register its metrics.
    ///
    /// The page size is rounded up to the next power of two.
    ///
    /// # Panics
    ///
    /// Panics if `cfg.page_size` is zero.
    pub fn new(cfg: Config, registry: &mut Registry) -> Self {
        assert!(cfg.page_size > 0, "page size must be nonzero");
        Self {
            inner: Arc::new(Mutex::new(Inner {
                lru: List::new(),
                index: HashMap::new(),
                inflight: HashMap::new(),
                orphans: Vec::new(),
                page_size: cfg.page_size.next_power_of_two(),
                max_pages: cfg.max_pages,
                generation: 0,
            })),
            metrics: Arc::new(Metrics::init(registry)),
        }
    }

    pub fn page_size(&self) -> usize {
        self.inner.lock().unwrap().page_size
    }

    pub fn max_pages(&self) -> usize {
        self.inner.lock().unwrap().max_pages
    }

    /// Pages currently resident in the LRU.
    pub fn resident_pages(&self) -> usize {
        self.inner.lock().unwrap().lru.len()
    }

    /// Read `out.len()` bytes at `offset`, filling missing pages from
    /// `backing`.
    ///
    /// Returns the bytes copied out, which is less than `out.len()` only
    /// when the range runs past end of file.
    pub async fn read<B: Backing>(
        &self,
        backing: &B,
        id: FileId,
        out: &mut [u8],
        offset: u64,
    ) -> Result<usize, Error> {
        if out.is_empty() {
            return Ok(0);
        }
        let page_size = self.page_size() as u64;
        let start = offset / page_size;
        let last = (offset + out.len() as u64 - 1) / page_size;

        let mut total = 0;
        for index in start..=last {
            let key = PageKey { id, index };
            trace!(id = %id, index, "read");

            let mut waited = false;
            loop {
                let fill = {
                    let mut inner = self.inner.lock().unwrap();
                    if let Some(fill) = inner.inflight.get(&key) {
                        fill.clone()
                    } else if let Some(&slot) = inner.index.get(&key) {
                        if !waited {
                            self.metrics.hits.inc();
                        }
                        inner.lru.move_to_front(slot);
                        let local = if index == start {
                            (offset % page_size) as usize
                        } else {
                            0
                        };
                        total += inner.lru.get(slot).copy_to(&mut out[total..], local);
                        Self::enforce_capacity(&mut inner, &self.metrics);
                        break;
                    } else {
                        if !waited {
                            self.metrics.misses.inc();
                        }
                        self.install_fill(&mut inner, backing, key)
                    }
                };
                fill.await?;
                waited = true;
            }
        }
        Ok(total)
    }

    /// Write `input` at `offset`, allocating pages as needed.
    ///
    /// Writes never trigger fills, even for partial pages: a fresh page's
    /// length reflects only the highest written byte, and bytes below the
    /// write are undefined until a fill. An adapter that needs
    /// read-modify-write semantics reads the range first.
    pub async fn write(&self, id: FileId, input: &[u8], offset: u64) -> Result<usize, Error> {
        if input.is_empty() {
            return Ok(0);
        }
        let page_size = self.page_size() as u64;
        let start = offset / page_size;
        let last = (offset + input.len() as u64 - 1) / page_size;

        let mut total = 0;
        for index in start..=last {
            let key = PageKey { id, index };
            trace!(id = %id, index, "write");

            loop {
                let fill = {
                    let mut inner = self.inner.lock().unwrap();
                    if let Some(fill) = inner.inflight.get(&key) {
                        fill.clone()
                    } else {
                        let slot = match inner.index.get(&key) {
                            Some(&slot) => slot,
                            None => {
                                let page =
                                    Page::new(key, Self::alloc(page_size as usize)?, 0);
                                let slot = inner.lru.push_front(page);
                                inner.index.insert(key, slot);
                                slot
                            }
                        };
                        let local = if index == start {
                            (offset % page_size) as usize
                        } else {
                            0
                        };
                        let n = (page_size as usize - local).min(input.len() - total);
                        let page = inner.lru.get_mut(slot);
                        page.copy_from(&input[total..total + n], local);
                        page.set_dirty(true);
                        inner.lru.move_to_front(slot);
                        total += n;
                        Self::enforce_capacity(&mut inner, &self.metrics);
                        break;
                    }
                };
                fill.await?;
            }
        }
        Ok(total)
    }

    /// Push every dirty resident page of the first `ceil(size / page_size)`
    /// page indexes through `backing`, clearing their dirty bits.
    ///
    /// Pages that are not resident are skipped. The dirty bit is cleared
    /// before the callback runs and is not restored if it fails.
    pub async fn flush<B: Backing>(&self, backing: &B, id: FileId, size: u64) -> Result<(), Error> {
        let page_size = self.page_size() as u64;
        let pages = size.div_ceil(page_size);

        let mut scratch = Vec::new();
        for index in 0..pages {
            let key = PageKey { id, index };

            // Wait out any fill in progress for this page.
            loop {
                let fill = { self.inner.lock().unwrap().inflight.get(&key).cloned() };
                match fill {
                    Some(fill) => fill.await?,
                    None => break,
                }
            }

            let offset = {
                let mut inner = self.inner.lock().unwrap();
                let Some(&slot) = inner.index.get(&key) else {
                    trace!(id = %id, index, "page not resident, skipping flush");
                    continue;
                };
                let page = inner.lru.get_mut(slot);
                if !page.is_dirty() {
                    continue;
                }
                scratch.clear();
                scratch.extend_from_slice(page.contents());
                page.set_dirty(false);
                index * page_size
            };

            debug!(id = %id, index, len = scratch.len(), "flushing page");
            self.metrics.flushes.inc();
            let wrote = backing.flush(id, &scratch, offset).await?;
            if wrote < scratch.len() {
                return Err(Error::ShortWrite {
                    expected: scratch.len(),
                    wrote,
                });
            }
        }
        Ok(())
    }

    /// Move the orphan list out of the cache.
    ///
    /// The caller owns the returned pages and is expected to flush their
    /// [Page::contents] at [Page::offset] and discard them; the cache never
    /// flushes orphans itself.
    pub fn take_orphans(&self) -> Vec<Page> {
        mem::take(&mut self.inner.lock().unwrap().orphans)
    }

    pub fn has_orphans(&self) -> bool {
        !self.inner.lock().unwrap().orphans.is_empty()
    }

    /// Drop resident state. Dirty pages move to the orphan list rather
    /// than being lost; orphans themselves are untouched.
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock().unwrap();
        Self::clear_resident(&mut inner, &self.metrics);
        info!("cache invalidated");
    }

    /// Change the page size (rounded up to a power of two), clearing
    /// resident state. Orphans keep their old geometry.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is zero.
    pub fn set_page_size(&self, page_size: usize) {
        assert!(page_size > 0, "page size must be nonzero");
        let mut inner = self.inner.lock().unwrap();
        inner.page_size = page_size.next_power_of_two();
        Self::clear_resident(&mut inner, &self.metrics);
        info!(page_size = inner.page_size, "page size changed");
    }

    /// Change the page budget, clearing resident state.
    pub fn set_max_pages(&self, max_pages: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.max_pages = max_pages;
        Self::clear_resident(&mut inner, &self.metrics);
        info!(max_pages, "page budget changed");
    }

    /// Allocate a zeroed page buffer, reporting failure as the generic
    /// status (the cache has no richer kind for local resource errors).
    fn alloc(page_size: usize) -> Result<Box<[u8]>, Error> {
        let mut buf = Vec::new();
        if buf.try_reserve_exact(page_size).is_err() {
            return Err(Error::Remote(Status::InvalidArgument));
        }
        buf.resize(page_size, 0);
        Ok(buf.into_boxed_slice())
    }

    /// Register a single-flight fill for `key`.
    ///
    /// The returned future is shared: the work happens inside it, so any
    /// waiter can drive it, and it removes its own inflight entry before
    /// resolving. On success the filled page is at the LRU front; the
    /// caller re-checks residency after awaiting.
    fn install_fill<B: Backing>(
        &self,
        inner: &mut Inner,
        backing: &B,
        key: PageKey,
    ) -> FillHandle {
        let page_size = inner.page_size;
        let generation = inner.generation;
        let backing = backing.clone();
        let state = Arc::clone(&self.inner);
        let fills = self.metrics.fills.clone();

        let fill = async move {
            let buf = match Self::alloc(page_size) {
                Ok(buf) => buf,
                Err(e) => {
                    state.lock().unwrap().inflight.remove(&key);
                    return Err(e);
                }
            };
            let mut buf = buf.into_vec();
            let offset = key.index * page_size as u64;
            debug!(id = %key.id, index = key.index, "cache miss, filling from device");
            let filled = backing.fill(key.id, &mut buf, offset).await;

            let mut inner = state.lock().unwrap();
            inner.inflight.remove(&key);
            let filled = match filled {
                Ok(filled) => filled.min(page_size),
                Err(e) => {
                    debug!(id = %key.id, index = key.index, error = %e, "fill failed");
                    return Err(e);
                }
            };
            fills.inc();
            if inner.generation != generation {
                debug!(id = %key.id, index = key.index, "cache reconfigured during fill, discarding");
                return Ok(());
            }
            debug_assert!(!inner.index.contains_key(&key));
            let slot = inner.lru.push_front(Page::new(key, buf.into_boxed_slice(), filled));
            inner.index.insert(key, slot);
            Ok(())
        };

        let handle: FillHandle = fill.boxed().shared();
        inner.inflight.insert(key, handle.clone());
        handle
    }

    /// Evict from the LRU tail until the budget holds. Dirty victims are
    /// parked on the orphan list, clean ones are dropped.
    fn enforce_capacity(inner: &mut Inner, metrics: &Metrics) {
        while inner.lru.len() > inner.max_pages {
            let Some(page) = inner.lru.pop_back() else {
                break;
            };
            inner.index.remove(&page.key());
            metrics.evictions.inc();
            if page.is_dirty() {
                warn!(
                    id = %page.key().id,
                    index = page.key().index,
                    "evicting dirty page to the orphan list"
                );
                metrics.orphaned.inc();
                inner.orphans.push(page);
            }
        }
    }

    fn clear_resident(inner: &mut Inner, metrics: &Metrics) {
        inner.index.clear();
        inner.generation += 1;
        for page in inner.lru.take_all() {
            if page.is_dirty() {
                metrics.orphaned.inc();
                inner.orphans.push(page);
            }
        }
    }
}
