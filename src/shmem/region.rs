//! The shared mapped region (spec §3 "Shared region layout", §6 "Shared
//! memory layout"): `EngineData` at offset 0, the slab pool immediately
//! after.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;

use memmap2::MmapMut;

use crate::error::{ReactorError, Result};

/// Process-wide atomic counters (spec §3, supplemented with the
/// original engine's heartbeat counters per SPEC_FULL.md §3). No lock
/// guards this struct — every field is a plain atomic (spec §5
/// "Shared-resource policy").
#[repr(C)]
pub struct EngineData {
    pub open_handles: AtomicU64,
    pub closed_handles: AtomicU64,
    pub inflight_requests: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub packets_in: AtomicU64,
    pub packets_out: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub heartbeats_recv: AtomicU64,
    /// Guards the slab pool that immediately follows this header.
    pub(crate) slab_lock: AtomicU32,
}

impl EngineData {
    #[cfg(test)]
    pub(crate) fn default_for_test() -> EngineData {
        EngineData::zeroed()
    }

    fn zeroed() -> EngineData {
        EngineData {
            open_handles: AtomicU64::new(0),
            closed_handles: AtomicU64::new(0),
            inflight_requests: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            packets_in: AtomicU64::new(0),
            packets_out: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
            heartbeats_recv: AtomicU64::new(0),
            slab_lock: AtomicU32::new(0),
        }
    }
}

/// A file-backed mapped region of configured size, shared across the
/// supervisor and every worker process it spawns.
pub struct SharedRegion {
    mmap: MmapMut,
}

impl SharedRegion {
    /// Create (or truncate) the backing file at `path` to `size` bytes
    /// and map it, placing a freshly-zeroed `EngineData` at offset 0.
    pub fn create(path: &Path, size: usize) -> Result<SharedRegion> {
        assert!(size > std::mem::size_of::<EngineData>(), "region too small for EngineData");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(ReactorError::MmapInit)?;
        file.set_len(size as u64).map_err(ReactorError::MmapInit)?;

        // SAFETY: `file` was just opened by this process and sized
        // above; no other mapping of it is assumed to change its length
        // concurrently.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(ReactorError::MmapInit)?;
        let mut region = SharedRegion { mmap };
        region.reinit_header();
        Ok(region)
    }

    /// Map an already-initialized region (a worker process attaching to
    /// a region its supervisor created).
    pub fn open(path: &Path) -> Result<SharedRegion> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(ReactorError::MmapInit)?;
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(ReactorError::MmapInit)?;
        Ok(SharedRegion { mmap })
    }

    fn reinit_header(&mut self) {
        let header = EngineData::zeroed();
        // SAFETY: `mmap` is at least `size_of::<EngineData>()` bytes
        // (checked in `create`) and suitably aligned: mmap'd pages are
        // page-aligned, far stricter than `EngineData`'s alignment.
        unsafe {
            std::ptr::write(self.mmap.as_mut_ptr() as *mut EngineData, header);
        }
    }

    pub fn engine_data(&self) -> &EngineData {
        // SAFETY: see `reinit_header`.
        unsafe { &*(self.mmap.as_ptr() as *const EngineData) }
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// The byte range past `EngineData`, handed to `shmem::slab::SlabPool`.
    pub fn slab_bytes(&mut self) -> &mut [u8] {
        let offset = std::mem::size_of::<EngineData>();
        &mut self.mmap[offset..]
    }

    /// `engine_data()` and `slab_bytes()` together, in one borrow. Every
    /// `SlabPool` method that mutates the pool also wants `EngineData` to
    /// lock/unlock `slab_lock`, so callers need both at once; taking them
    /// separately would require two overlapping borrows of `self`.
    pub fn split_mut(&mut self) -> (&EngineData, &mut [u8]) {
        let offset = std::mem::size_of::<EngineData>();
        let ptr = self.mmap.as_mut_ptr();
        // SAFETY: `engine` and `slab` point at disjoint byte ranges of
        // the same mapping (header vs. everything past it), so a shared
        // reference to one and a mutable reference to the other cannot
        // alias.
        let engine = unsafe { &*(ptr as *const EngineData) };
        let slab = unsafe { std::slice::from_raw_parts_mut(ptr.add(offset), self.mmap.len() - offset) };
        (engine, slab)
    }
}
