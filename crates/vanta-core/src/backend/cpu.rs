//! Host-memory emulation of a device allocator.
//!
//! "Device" allocations are backed by boxed host memory addressed through a
//! synthetic address space, so a dangling [`DevicePtr`] can never alias a
//! live Rust allocation. The backend tracks enough bookkeeping — allocation
//! map, pinned host regions, sync and free counters — for tests to observe
//! the allocator-facing behavior of the core: free counts, the pinning
//! policy, and legacy-stream synchronization points.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::backend::{DeviceBackend, DeviceBuffer, DevicePtr, MemoryClass, PointerInfo};
use crate::context::{ContextId, Stream};
use crate::error::VantaError;
use crate::Result;

/// Fresh allocations are filled with this pattern: device memory gives no
/// zero-init guarantee, and a recognizable byte makes missing-memset bugs
/// visible.
const FRESH_FILL: u8 = 0xA5;

#[derive(Debug, Default)]
struct State {
    /// base address -> backing bytes
    slabs: BTreeMap<u64, Box<[u8]>>,
    /// registered page-locked host regions: (address, length)
    pinned: Vec<(u64, usize)>,
}

/// Emulated device backend over host memory.
#[derive(Debug)]
pub struct CpuBackend {
    state: Mutex<State>,
    next_addr: AtomicU64,
    syncs: AtomicU64,
    frees: AtomicU64,
    owner: Mutex<Option<ContextId>>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            next_addr: AtomicU64::new(0x1000),
            syncs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            owner: Mutex::new(None),
        }
    }

    /// Number of synchronize points observed (explicit calls plus
    /// legacy-stream frees).
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Acquire)
    }

    /// Number of completed frees.
    pub fn free_count(&self) -> u64 {
        self.frees.load(Ordering::Acquire)
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().slabs.len()
    }

    /// Register a host region as page-locked for classification purposes.
    pub fn pin_host(&self, ptr: *const u8, len: usize) {
        self.state.lock().pinned.push((ptr as u64, len));
    }

    /// Drop a previous [`pin_host`](CpuBackend::pin_host) registration.
    pub fn unpin_host(&self, ptr: *const u8) {
        self.state.lock().pinned.retain(|&(p, _)| p != ptr as u64);
    }

    fn region_mut<'a>(
        state: &'a mut State,
        ptr: DevicePtr,
        len: usize,
        what: &str,
    ) -> Result<&'a mut [u8]> {
        let addr = ptr.raw();
        let (base, slab) = match state.slabs.range_mut(..=addr).next_back() {
            Some((base, slab))
                if addr < base + slab.len() as u64 || (slab.is_empty() && addr == *base) =>
            {
                (*base, slab)
            }
            _ => {
                return Err(VantaError::Backend(format!(
                    "{what}: unknown device address {addr:#x}"
                )))
            }
        };
        let off = (addr - base) as usize;
        if off + len > slab.len() {
            return Err(VantaError::Backend(format!(
                "{what}: range {addr:#x}+{len} escapes its allocation"
            )));
        }
        Ok(&mut slab[off..off + len])
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for CpuBackend {
    fn alloc(&self, nbytes: usize) -> Result<DeviceBuffer> {
        // 256-byte aligned synthetic addresses, like real device allocators.
        let span = (nbytes.max(1) as u64 + 255) & !255;
        let base = self.next_addr.fetch_add(span, Ordering::Relaxed);
        let mem = vec![FRESH_FILL; nbytes].into_boxed_slice();
        self.state.lock().slabs.insert(base, mem);
        Ok(DeviceBuffer::new(DevicePtr::from_raw(base), nbytes))
    }

    fn free(&self, buf: DeviceBuffer, stream: Stream) -> Result<()> {
        if stream.is_legacy() {
            // Legacy-stream frees are synchronize-all points.
            self.syncs.fetch_add(1, Ordering::AcqRel);
        }
        let removed = self.state.lock().slabs.remove(&buf.ptr().raw());
        match removed {
            Some(_) => {
                self.frees.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            None => Err(VantaError::Backend(format!(
                "free: unknown device address {:#x}",
                buf.ptr().raw()
            ))),
        }
    }

    fn memset(
        &self,
        dst: DevicePtr,
        value: u32,
        width: usize,
        count: usize,
        _stream: Stream,
    ) -> Result<()> {
        if !matches!(width, 1 | 2 | 4) {
            return Err(VantaError::Backend(format!(
                "memset: unsupported element width {width}"
            )));
        }
        let mut state = self.state.lock();
        let region = Self::region_mut(&mut state, dst, width * count, "memset")?;
        let pattern = value.to_ne_bytes();
        for chunk in region.chunks_exact_mut(width) {
            chunk.copy_from_slice(&pattern[..width]);
        }
        Ok(())
    }

    fn copy_h2d(&self, src: &[u8], dst: DevicePtr, _stream: Stream) -> Result<()> {
        let mut state = self.state.lock();
        let region = Self::region_mut(&mut state, dst, src.len(), "copy_h2d")?;
        region.copy_from_slice(src);
        Ok(())
    }

    fn copy_d2h(&self, src: DevicePtr, dst: &mut [u8], _stream: Stream) -> Result<()> {
        let mut state = self.state.lock();
        let region = Self::region_mut(&mut state, src, dst.len(), "copy_d2h")?;
        dst.copy_from_slice(region);
        Ok(())
    }

    fn copy_d2d(
        &self,
        src: DevicePtr,
        dst: DevicePtr,
        nbytes: usize,
        _stream: Stream,
    ) -> Result<()> {
        let mut state = self.state.lock();
        // Stage through a scratch buffer: source and destination may live in
        // the same slab.
        let staged = Self::region_mut(&mut state, src, nbytes, "copy_d2d")?.to_vec();
        let region = Self::region_mut(&mut state, dst, nbytes, "copy_d2d")?;
        region.copy_from_slice(&staged);
        Ok(())
    }

    fn synchronize(&self, _stream: Stream) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn classify(&self, addr: u64) -> Option<PointerInfo> {
        if addr == 0 {
            return None;
        }
        let state = self.state.lock();
        let device_hit = state
            .slabs
            .range(..=addr)
            .next_back()
            .map(|(base, slab)| addr < base + slab.len() as u64 || slab.is_empty() && addr == *base)
            .unwrap_or(false);
        if device_hit {
            return Some(PointerInfo {
                class: MemoryClass::Device,
                owner: *self.owner.lock(),
            });
        }
        let pinned = state
            .pinned
            .iter()
            .any(|&(p, len)| addr >= p && addr < p + len as u64);
        Some(PointerInfo {
            class: if pinned {
                MemoryClass::HostPinned
            } else {
                MemoryClass::HostPageable
            },
            owner: None,
        })
    }

    fn bind_context(&self, id: ContextId) {
        *self.owner.lock() = Some(id);
    }
}
