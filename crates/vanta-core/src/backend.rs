//! The narrow allocator interface the array core consumes.
//!
//! Real driver bindings implement [`DeviceBackend`] outside this crate;
//! [`cpu::CpuBackend`] emulates a device allocator over host memory so the
//! core is exercisable without a GPU.

use std::fmt;

use crate::context::{ContextId, Stream};
use crate::Result;

pub mod cpu;

/// Address in the device address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub const fn from_raw(addr: u64) -> Self {
        DevicePtr(addr)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Advance the address by `bytes`.
    pub fn offset(self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }
}

/// One allocation as handed out by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBuffer {
    ptr: DevicePtr,
    len: usize,
}

impl DeviceBuffer {
    pub const fn new(ptr: DevicePtr, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Size of the allocation in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Classification of an arbitrary address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryClass {
    /// Device-resident memory.
    Device,
    /// Page-locked host memory; safe for asynchronous transfers.
    HostPinned,
    /// Ordinary pageable host memory.
    HostPageable,
    /// Unified memory accessible from both sides.
    Unified,
}

/// Result of classifying an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerInfo {
    pub class: MemoryClass,
    /// Context that owns the allocation, when the backend can tell.
    pub owner: Option<ContextId>,
}

/// Device allocator interface: allocate, free, memset, copy, synchronize,
/// classify. Everything device-side is asynchronous with respect to the
/// calling thread unless a synchronize call (explicit or policy-inserted)
/// orders it.
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    /// Allocate `nbytes` of device memory.
    fn alloc(&self, nbytes: usize) -> Result<DeviceBuffer>;

    /// Release an allocation on `stream`. Freeing on the legacy stream is a
    /// synchronize-all point: no in-flight work on any stream may still read
    /// the buffer when it is reclaimed.
    fn free(&self, buf: DeviceBuffer, stream: Stream) -> Result<()>;

    /// Set `count` elements of `width` bytes (1, 2 or 4) to `value`.
    fn memset(
        &self,
        dst: DevicePtr,
        value: u32,
        width: usize,
        count: usize,
        stream: Stream,
    ) -> Result<()>;

    /// Copy host bytes to device memory.
    fn copy_h2d(&self, src: &[u8], dst: DevicePtr, stream: Stream) -> Result<()>;

    /// Copy device memory to host bytes; `dst.len()` bytes are transferred.
    fn copy_d2h(&self, src: DevicePtr, dst: &mut [u8], stream: Stream) -> Result<()>;

    /// Copy between two device regions.
    fn copy_d2d(&self, src: DevicePtr, dst: DevicePtr, nbytes: usize, stream: Stream)
        -> Result<()>;

    /// Wait until all work submitted to `stream` has completed. For the
    /// legacy stream this drains every stream.
    fn synchronize(&self, stream: Stream) -> Result<()>;

    /// Classify an address; `None` when the class cannot be determined.
    fn classify(&self, addr: u64) -> Option<PointerInfo>;

    /// Invoked once when a [`crate::context::Context`] adopts this backend.
    fn bind_context(&self, _id: ContextId) {}
}
