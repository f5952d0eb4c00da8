//! The dense device array handle.

use std::fmt;
use std::sync::Arc;

use crate::backend::{DeviceBuffer, DevicePtr, MemoryClass};
use crate::context::{Context, Stream};
use crate::dtype::ElemType;
use crate::error::VantaError;
use crate::shape::Shape;
use crate::storage::{ArrayStorage, ReleaseFn};
use crate::Result;

/// A dense device array.
///
/// Handles are value-like: each exclusively owns its {element type, shape,
/// offset, maxsize} metadata while sharing the underlying [`ArrayStorage`]
/// with every view derived from the same allocation. Dropping a handle
/// releases its share on the legacy stream; explicit
/// [`free`](DeviceArray::free) does the same eagerly and is idempotent.
///
/// A handle whose storage has been detached is "dead": everything except
/// `free` and drop reports [`VantaError::UseAfterFree`].
pub struct DeviceArray {
    storage: Option<Arc<ArrayStorage>>,
    elem: ElemType,
    shape: Shape,
    /// Byte offset into the allocation.
    offset: usize,
    /// Data-region capacity in bytes, excluding the tag buffer. Inherited
    /// unchanged by derived views so that `buffer + maxsize` addresses one
    /// shared tag region for every alias of an allocation.
    maxsize: usize,
}

impl DeviceArray {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Allocate an uninitialized array in `ctx`.
    ///
    /// Tagged element types get a selector byte per element in a side buffer
    /// past the data region; indirect types cannot live in device memory.
    pub fn alloc(elem: ElemType, shape: impl Into<Shape>, ctx: &Context) -> Result<DeviceArray> {
        let shape = shape.into();
        if elem.is_indirect() {
            return Err(VantaError::TypeLayout {
                op: "allocate",
                ty: elem.to_string(),
            });
        }
        let numel = shape.checked_numel().ok_or(VantaError::SizeOverflow)?;
        let data = elem.data_bytes(numel).ok_or(VantaError::SizeOverflow)?;
        let total = data
            .checked_add(elem.tag_bytes(numel))
            .ok_or(VantaError::SizeOverflow)?;
        let buffer = ctx
            .guard(|b| b.alloc(total))
            .ok_or(VantaError::ContextDestroyed)??;
        Ok(DeviceArray {
            storage: Some(ArrayStorage::managed(buffer, ctx.clone())),
            elem,
            shape,
            offset: 0,
            maxsize: data,
        })
    }

    /// Allocate in the calling thread's current context.
    pub fn alloc_current(elem: ElemType, shape: impl Into<Shape>) -> Result<DeviceArray> {
        let ctx = Context::current().ok_or(VantaError::NoContext)?;
        Self::alloc(elem, shape, &ctx)
    }

    /// Allocate and zero both the data and tag regions.
    pub fn zeros(
        elem: ElemType,
        shape: impl Into<Shape>,
        ctx: &Context,
        stream: Stream,
    ) -> Result<DeviceArray> {
        let arr = Self::alloc(elem, shape, ctx)?;
        let buffer = arr.storage()?.buffer();
        if !buffer.is_empty() {
            ctx.guard(|b| b.memset(buffer.ptr(), 0, 1, buffer.len(), stream))
                .ok_or(VantaError::ContextDestroyed)??;
        }
        Ok(arr)
    }

    /// Wrap a device pointer owned elsewhere.
    ///
    /// `ctx` is the probe used for classification and the fallback owner
    /// when the backend cannot name one. With `owning == false` the buffer
    /// is never freed by this crate; with `owning == true` it is freed
    /// exactly once when the last aliasing handle disappears, through a
    /// release path that bypasses the managed count entirely.
    pub fn wrap_foreign(
        ptr: DevicePtr,
        elem: ElemType,
        shape: impl Into<Shape>,
        owning: bool,
        ctx: &Context,
    ) -> Result<DeviceArray> {
        let shape = shape.into();
        if !elem.is_inline() {
            return Err(VantaError::TypeLayout {
                op: "wrap",
                ty: elem.to_string(),
            });
        }
        let info = ctx
            .guard(|b| b.classify(ptr.raw()))
            .ok_or(VantaError::ContextDestroyed)?
            .ok_or(VantaError::UnidentifiedMemory {
                addr: ptr.raw(),
                reason: "memory class could not be determined",
            })?;
        match info.class {
            MemoryClass::Device | MemoryClass::Unified => {}
            MemoryClass::HostPinned | MemoryClass::HostPageable => {
                return Err(VantaError::UnidentifiedMemory {
                    addr: ptr.raw(),
                    reason: "host memory is not supported",
                })
            }
        }
        let owner = info
            .owner
            .and_then(Context::lookup)
            .unwrap_or_else(|| ctx.clone());

        let numel = shape.checked_numel().ok_or(VantaError::SizeOverflow)?;
        let len = elem.data_bytes(numel).ok_or(VantaError::SizeOverflow)?;
        let buffer = DeviceBuffer::new(ptr, len);
        let storage = if owning {
            let backend = Arc::clone(owner.backend());
            let hook: ReleaseFn = Box::new(move |buf| {
                if let Err(err) = backend.free(buf, Stream::LEGACY) {
                    log::error!("release of wrapped device buffer failed: {err}");
                }
            });
            ArrayStorage::foreign(buffer, owner, hook)
        } else {
            ArrayStorage::unmanaged(buffer, owner)
        };
        Ok(DeviceArray {
            storage: Some(storage),
            elem,
            shape,
            offset: 0,
            maxsize: len,
        })
    }

    pub(crate) fn from_parts(
        storage: Arc<ArrayStorage>,
        elem: ElemType,
        shape: Shape,
        offset: usize,
        maxsize: usize,
    ) -> DeviceArray {
        DeviceArray {
            storage: Some(storage),
            elem,
            shape,
            offset,
            maxsize,
        }
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn elem(&self) -> ElemType {
        self.elem
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.numel()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    /// Byte offset into the shared allocation.
    pub fn offset_bytes(&self) -> usize {
        self.offset
    }

    /// Data-region capacity in bytes, excluding the tag buffer.
    pub fn maxsize(&self) -> usize {
        self.maxsize
    }

    /// Whether this handle still references storage.
    pub fn is_alive(&self) -> bool {
        self.storage.is_some()
    }

    /// Whether the storage lifetime is governed by the refcount protocol.
    /// Dead handles report `false`.
    pub fn is_managed(&self) -> bool {
        self.storage.as_ref().is_some_and(|s| s.is_managed())
    }

    /// Live-handle count of the shared storage (managed storage only).
    pub fn refcount(&self) -> Option<isize> {
        self.storage.as_ref().and_then(|s| s.refcount())
    }

    /// The owning execution context.
    pub fn context(&self) -> Result<Context> {
        Ok(self.storage()?.context().clone())
    }

    /// Raw device pointer of the first element.
    pub fn device_ptr(&self) -> Result<DevicePtr> {
        let storage = self.storage()?;
        Ok(storage.buffer().ptr().offset(self.offset))
    }

    pub(crate) fn storage(&self) -> Result<&Arc<ArrayStorage>> {
        self.storage.as_ref().ok_or(VantaError::UseAfterFree)
    }

    /// Element index of this handle's first element within the shared tag
    /// region.
    pub(crate) fn tag_index(&self) -> usize {
        if self.elem.size() == 0 {
            0
        } else {
            self.offset / self.elem.size()
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Detach this handle and release its share of the storage.
    ///
    /// Idempotent: freeing a dead handle is silently accepted. The handle is
    /// detached even when the release itself fails (unmanaged or
    /// foreign-owned storage), so a failed free never leaves a half-dead
    /// handle behind.
    pub fn free(&mut self, stream: Stream) -> Result<()> {
        match self.storage.take() {
            None => Ok(()),
            Some(storage) => storage.release(stream).map(|_| ()),
        }
    }

    /// Fill every element with `value` through the allocator's memset path.
    pub fn fill(&self, value: u32, stream: Stream) -> Result<()> {
        if !self.elem.is_inline() {
            return Err(VantaError::TypeLayout {
                op: "fill",
                ty: self.elem.to_string(),
            });
        }
        let width = self.elem.size();
        if !matches!(width, 1 | 2 | 4) {
            return Err(VantaError::FillWidth { size: width });
        }
        if width < 4 && u64::from(value) >= 1u64 << (8 * width) {
            return Err(VantaError::FillValue {
                value,
                size: width,
            });
        }
        let storage = self.storage()?;
        let numel = self.len();
        if numel == 0 {
            return Ok(());
        }
        let dst = storage.buffer().ptr().offset(self.offset);
        storage
            .context()
            .guard(|b| b.memset(dst, value, width, numel, stream))
            .ok_or(VantaError::ContextDestroyed)??;
        Ok(())
    }

    /// Grow or shrink a one-dimensional array, preserving the common prefix.
    ///
    /// Allocates a fresh managed buffer in the same context, device-copies
    /// `min(old, new)` elements (selector bytes included), installs the new
    /// storage with offset 0, then releases the old share. Only managed
    /// storage can be resized.
    pub fn resize(&mut self, new_len: usize, stream: Stream) -> Result<()> {
        if self.shape.ndim() != 1 {
            return Err(VantaError::ResizeRank {
                ndim: self.shape.ndim(),
            });
        }
        let storage = self.storage.as_ref().ok_or(VantaError::UseAfterFree)?;
        if !storage.is_managed() {
            return Err(VantaError::Ownership {
                op: "resize",
                kind: storage.ownership_kind(),
            });
        }
        let ctx = storage.context().clone();
        let size = self.elem.size();
        let old_len = self.len();

        let data = self.elem.data_bytes(new_len).ok_or(VantaError::SizeOverflow)?;
        let total = data
            .checked_add(self.elem.tag_bytes(new_len))
            .ok_or(VantaError::SizeOverflow)?;
        let buffer = ctx
            .guard(|b| b.alloc(total))
            .ok_or(VantaError::ContextDestroyed)??;
        let new_storage = ArrayStorage::managed(buffer, ctx.clone());

        let keep = old_len.min(new_len);
        if keep > 0 {
            let src = storage.buffer().ptr().offset(self.offset);
            let src_tag = storage
                .buffer()
                .ptr()
                .offset(self.maxsize + self.tag_index());
            let tagged = self.elem.is_tagged();
            ctx.guard(|b| -> Result<()> {
                b.copy_d2d(src, buffer.ptr(), keep * size, stream)?;
                if tagged {
                    b.copy_d2d(src_tag, buffer.ptr().offset(data), keep, stream)?;
                }
                Ok(())
            })
            .ok_or(VantaError::ContextDestroyed)??;
        }

        let old = self.storage.replace(new_storage);
        self.shape = Shape::new(&[new_len]);
        self.offset = 0;
        self.maxsize = data;
        if let Some(old) = old {
            old.release(stream)?;
        }
        Ok(())
    }
}

impl Drop for DeviceArray {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            if storage.is_managed() {
                // Task-local streams may already be torn down here, so the
                // release goes to the always-valid legacy stream, whose
                // synchronize-all semantics guarantee no in-flight work still
                // reads the buffer. Deliberately conservative.
                if let Err(err) = storage.release(Stream::LEGACY) {
                    log::error!("deferred device array release failed: {err}");
                }
            }
            // Unmanaged and foreign-owned shares just drop their Arc; the
            // foreign release hook fires when the last one goes.
        }
    }
}

impl fmt::Debug for DeviceArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DeviceArray(shape={}, elem={}, offset={}, alive={})",
            self.shape,
            self.elem,
            self.offset,
            self.is_alive(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuBackend;
    use crate::backend::DeviceBackend;

    fn fixture() -> (Arc<CpuBackend>, Context) {
        let backend = Arc::new(CpuBackend::new());
        let ctx = Context::new(backend.clone());
        (backend, ctx)
    }

    #[test]
    fn test_alloc() {
        let (backend, ctx) = fixture();
        let arr = DeviceArray::alloc(ElemType::of::<i32>(), [2, 5], &ctx).unwrap();
        assert_eq!(arr.len(), 10);
        assert_eq!(arr.ndim(), 2);
        assert_eq!(arr.maxsize(), 40);
        assert_eq!(arr.offset_bytes(), 0);
        assert_eq!(arr.refcount(), Some(1));
        assert!(arr.is_managed());
        assert_eq!(backend.live_allocations(), 1);
    }

    #[test]
    fn test_alloc_tagged_adds_selector_buffer() {
        let (backend, ctx) = fixture();
        let arr = DeviceArray::alloc(ElemType::tagged(8), [10], &ctx).unwrap();
        assert_eq!(arr.maxsize(), 80);
        let buffer = arr.storage().unwrap().buffer();
        assert_eq!(buffer.len(), 90);
        drop(arr);
        assert_eq!(backend.free_count(), 1);
    }

    #[test]
    fn test_alloc_indirect_rejected() {
        let (_backend, ctx) = fixture();
        assert!(matches!(
            DeviceArray::alloc(ElemType::indirect(), [4], &ctx),
            Err(VantaError::TypeLayout { op: "allocate", .. })
        ));
    }

    #[test]
    fn test_alloc_overflow() {
        let (_backend, ctx) = fixture();
        assert!(matches!(
            DeviceArray::alloc(ElemType::of::<u64>(), [usize::MAX / 2], &ctx),
            Err(VantaError::SizeOverflow)
        ));
    }

    #[test]
    fn test_alloc_in_destroyed_context() {
        let (_backend, ctx) = fixture();
        ctx.destroy();
        assert!(matches!(
            DeviceArray::alloc(ElemType::of::<u8>(), [4], &ctx),
            Err(VantaError::ContextDestroyed)
        ));
    }

    #[test]
    fn test_alloc_current() {
        let (_backend, ctx) = fixture();
        ctx.make_current();
        let arr = DeviceArray::alloc_current(ElemType::of::<u8>(), [4]).unwrap();
        assert_eq!(arr.context().unwrap(), ctx);
    }

    #[test]
    fn test_free_idempotent() {
        let (backend, ctx) = fixture();
        let mut arr = DeviceArray::alloc(ElemType::of::<u8>(), [16], &ctx).unwrap();
        arr.free(Stream::of(1)).unwrap();
        assert!(!arr.is_alive());
        assert_eq!(backend.free_count(), 1);

        // Freeing a dead handle is accepted silently, any number of times.
        arr.free(Stream::of(1)).unwrap();
        arr.free(Stream::LEGACY).unwrap();
        assert_eq!(backend.free_count(), 1);

        assert!(matches!(arr.device_ptr(), Err(VantaError::UseAfterFree)));
    }

    #[test]
    fn test_drop_releases_on_legacy_stream() {
        let (backend, ctx) = fixture();
        let arr = DeviceArray::alloc(ElemType::of::<u8>(), [16], &ctx).unwrap();
        let syncs_before = backend.sync_count();
        drop(arr);
        assert_eq!(backend.free_count(), 1);
        // The legacy-stream free is a synchronize-all point.
        assert_eq!(backend.sync_count(), syncs_before + 1);
    }

    #[test]
    fn test_drop_after_context_destroyed_is_silent() {
        let (backend, ctx) = fixture();
        let arr = DeviceArray::alloc(ElemType::of::<u8>(), [16], &ctx).unwrap();
        ctx.destroy();
        drop(arr);
        assert_eq!(backend.free_count(), 0);
    }

    #[test]
    fn test_resize_managed_only() {
        let (backend, ctx) = fixture();
        let raw = backend.alloc(16).unwrap();
        let mut arr =
            DeviceArray::wrap_foreign(raw.ptr(), ElemType::of::<u8>(), [16], false, &ctx).unwrap();
        assert!(matches!(
            arr.resize(32, Stream::of(1)),
            Err(VantaError::Ownership { op: "resize", .. })
        ));
    }

    #[test]
    fn test_resize_rank() {
        let (_backend, ctx) = fixture();
        let mut arr = DeviceArray::alloc(ElemType::of::<u8>(), [4, 4], &ctx).unwrap();
        assert!(matches!(
            arr.resize(8, Stream::of(1)),
            Err(VantaError::ResizeRank { ndim: 2 })
        ));
    }

    #[test]
    fn test_wrap_foreign_unmanaged() {
        let (backend, ctx) = fixture();
        let raw = backend.alloc(64).unwrap();
        let mut arr =
            DeviceArray::wrap_foreign(raw.ptr(), ElemType::of::<u8>(), [64], false, &ctx).unwrap();
        assert!(!arr.is_managed());
        assert_eq!(arr.refcount(), None);
        assert_eq!(arr.device_ptr().unwrap(), raw.ptr());

        // The managed-free path refuses foreign memory, but detaches anyway.
        assert!(matches!(
            arr.free(Stream::of(1)),
            Err(VantaError::Ownership { op: "free", .. })
        ));
        assert!(!arr.is_alive());
        drop(arr);
        assert_eq!(backend.free_count(), 0);
        assert_eq!(backend.live_allocations(), 1);
    }

    #[test]
    fn test_wrap_foreign_owning_frees_once() {
        let (backend, ctx) = fixture();
        let raw = backend.alloc(64).unwrap();
        let arr =
            DeviceArray::wrap_foreign(raw.ptr(), ElemType::of::<u8>(), [64], true, &ctx).unwrap();
        drop(arr);
        assert_eq!(backend.free_count(), 1);
        assert_eq!(backend.live_allocations(), 0);
    }

    #[test]
    fn test_wrap_rejects_non_inline() {
        let (_backend, ctx) = fixture();
        assert!(matches!(
            DeviceArray::wrap_foreign(
                DevicePtr::from_raw(0x2000),
                ElemType::tagged(4),
                [4],
                false,
                &ctx,
            ),
            Err(VantaError::TypeLayout { op: "wrap", .. })
        ));
    }

    #[test]
    fn test_wrap_rejects_unidentified_and_host_memory() {
        let (_backend, ctx) = fixture();
        // Null address: the backend cannot classify it.
        assert!(matches!(
            DeviceArray::wrap_foreign(
                DevicePtr::from_raw(0),
                ElemType::of::<u8>(),
                [4],
                false,
                &ctx,
            ),
            Err(VantaError::UnidentifiedMemory { .. })
        ));
        // A host allocation classifies as pageable host memory.
        let host = [0u8; 32];
        assert!(matches!(
            DeviceArray::wrap_foreign(
                DevicePtr::from_raw(host.as_ptr() as u64),
                ElemType::of::<u8>(),
                [32],
                false,
                &ctx,
            ),
            Err(VantaError::UnidentifiedMemory { .. })
        ));
    }

    #[test]
    fn test_fill_validation() {
        let (_backend, ctx) = fixture();
        let arr = DeviceArray::alloc(ElemType::of::<u8>(), [4], &ctx).unwrap();
        assert!(matches!(
            arr.fill(256, Stream::of(1)),
            Err(VantaError::FillValue { .. })
        ));

        let arr = DeviceArray::alloc(ElemType::of::<u64>(), [4], &ctx).unwrap();
        assert!(matches!(
            arr.fill(7, Stream::of(1)),
            Err(VantaError::FillWidth { size: 8 })
        ));

        let arr = DeviceArray::alloc(ElemType::tagged(4), [4], &ctx).unwrap();
        assert!(matches!(
            arr.fill(7, Stream::of(1)),
            Err(VantaError::TypeLayout { op: "fill", .. })
        ));
    }

    #[test]
    fn test_debug_format() {
        let (_backend, ctx) = fixture();
        let arr = DeviceArray::alloc(ElemType::of::<i32>(), [2, 3], &ctx).unwrap();
        let dbg = format!("{arr:?}");
        assert!(dbg.contains("DeviceArray"));
        assert!(dbg.contains("[2, 3]"));
        assert!(dbg.contains("inline[4]"));
    }
}
