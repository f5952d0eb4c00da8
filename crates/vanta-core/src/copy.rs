//! Host/device transfer.
//!
//! All copies are element-granular and bounds-checked against both extents.
//! Transfers are submitted asynchronously on the caller's stream, except
//! where the pinning policy inserts synchronization: a host buffer that is
//! not page-locked cannot safely overlap an asynchronous transfer, so the
//! whole operation is preceded by a full synchronization; and a
//! device-to-host copy is always followed by a synchronization of the
//! submitting stream, because callers expect the data visible on return.
//! Device-to-device and pinned host-to-device copies stay asynchronous.

use bytemuck::{Pod, Zeroable};

use crate::array::DeviceArray;
use crate::backend::MemoryClass;
use crate::context::{Context, Stream};
use crate::dtype::{ElemRepr, ElemType};
use crate::error::VantaError;
use crate::Result;

/// Borrowed host staging region with device-compatible layout:
/// `[data: cap*size][tags: cap]` for tagged element types, plain data for
/// inline ones.
pub struct HostSpan<'a> {
    bytes: &'a [u8],
    elem: ElemType,
    cap: usize,
}

impl<'a> HostSpan<'a> {
    pub fn new(bytes: &'a [u8], elem: ElemType) -> Result<Self> {
        let cap = host_capacity(bytes.len(), elem)?;
        Ok(Self { bytes, elem, cap })
    }

    pub fn from_slice<T: Pod>(data: &'a [T]) -> HostSpan<'a> {
        HostSpan {
            bytes: bytemuck::cast_slice(data),
            elem: ElemType::of::<T>(),
            cap: data.len(),
        }
    }

    /// Element capacity.
    pub fn len(&self) -> usize {
        self.cap
    }

    pub fn is_empty(&self) -> bool {
        self.cap == 0
    }
}

/// Mutable counterpart of [`HostSpan`].
pub struct HostSpanMut<'a> {
    bytes: &'a mut [u8],
    elem: ElemType,
    cap: usize,
}

impl<'a> HostSpanMut<'a> {
    pub fn new(bytes: &'a mut [u8], elem: ElemType) -> Result<Self> {
        let cap = host_capacity(bytes.len(), elem)?;
        Ok(Self { bytes, elem, cap })
    }

    pub fn from_slice_mut<T: Pod>(data: &'a mut [T]) -> HostSpanMut<'a> {
        let cap = data.len();
        HostSpanMut {
            bytes: bytemuck::cast_slice_mut(data),
            elem: ElemType::of::<T>(),
            cap,
        }
    }

    /// Element capacity.
    pub fn len(&self) -> usize {
        self.cap
    }

    pub fn is_empty(&self) -> bool {
        self.cap == 0
    }
}

fn host_capacity(len_bytes: usize, elem: ElemType) -> Result<usize> {
    let stride = match elem.repr() {
        ElemRepr::Inline => elem.size(),
        ElemRepr::Tagged => elem.size() + 1,
        ElemRepr::Indirect => {
            return Err(VantaError::TypeLayout {
                op: "stage",
                ty: elem.to_string(),
            })
        }
    };
    if stride == 0 || len_bytes % stride != 0 {
        return Err(VantaError::TypeLayout {
            op: "stage",
            ty: elem.to_string(),
        });
    }
    Ok(len_bytes / stride)
}

fn check_range(side: &'static str, offset: usize, count: usize, len: usize) -> Result<()> {
    match offset.checked_add(count) {
        Some(end) if end <= len => Ok(()),
        _ => Err(VantaError::Bounds {
            side,
            offset,
            count,
            len,
        }),
    }
}

fn check_elem(src: ElemType, dst: ElemType) -> Result<()> {
    if src == dst {
        Ok(())
    } else {
        Err(VantaError::ElemMismatch {
            src: src.to_string(),
            dst: dst.to_string(),
        })
    }
}

/// Whether `bytes` lives in page-locked host memory, per the backend's
/// pointer classification. Unknown classes count as pageable: the
/// conservative answer forces synchronization.
fn host_pinned(ctx: &Context, bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return true;
    }
    ctx.guard(|b| {
        matches!(
            b.classify(bytes.as_ptr() as u64).map(|i| i.class),
            Some(MemoryClass::HostPinned)
        )
    })
    .unwrap_or(false)
}

impl DeviceArray {
    /// Copy `count` elements from a host buffer into this array.
    pub fn copy_from_host(
        &self,
        dst_off: usize,
        src: HostSpan<'_>,
        src_off: usize,
        count: usize,
        stream: Stream,
    ) -> Result<()> {
        check_elem(src.elem, self.elem())?;
        check_range("source", src_off, count, src.cap)?;
        check_range("destination", dst_off, count, self.len())?;
        if count == 0 {
            return Ok(());
        }
        let storage = self.storage()?;
        let ctx = storage.context();
        let size = self.elem().size();
        let pinned = host_pinned(ctx, src.bytes);
        let base = storage.buffer().ptr();

        ctx.guard(|b| -> Result<()> {
            if !pinned {
                b.synchronize(Stream::LEGACY)?;
            }
            let dst = base.offset(self.offset_bytes() + dst_off * size);
            b.copy_h2d(
                &src.bytes[src_off * size..(src_off + count) * size],
                dst,
                stream,
            )?;
            if self.elem().is_tagged() {
                let tag_region = src.cap * size;
                let dst_tag = base.offset(self.maxsize() + self.tag_index() + dst_off);
                b.copy_h2d(
                    &src.bytes[tag_region + src_off..tag_region + src_off + count],
                    dst_tag,
                    stream,
                )?;
            }
            Ok(())
        })
        .ok_or(VantaError::ContextDestroyed)??;
        Ok(())
    }

    /// Copy `count` elements from this array into a host buffer.
    pub fn copy_to_host(
        &self,
        src_off: usize,
        dst: HostSpanMut<'_>,
        dst_off: usize,
        count: usize,
        stream: Stream,
    ) -> Result<()> {
        check_elem(self.elem(), dst.elem)?;
        check_range("source", src_off, count, self.len())?;
        check_range("destination", dst_off, count, dst.cap)?;
        if count == 0 {
            return Ok(());
        }
        let storage = self.storage()?;
        let ctx = storage.context();
        let size = self.elem().size();
        let pinned = host_pinned(ctx, dst.bytes);
        let base = storage.buffer().ptr();
        let tag_region = dst.cap * size;
        let (data_bytes, tag_bytes) = dst.bytes.split_at_mut(tag_region);

        ctx.guard(|b| -> Result<()> {
            if !pinned {
                b.synchronize(Stream::LEGACY)?;
            }
            let src = base.offset(self.offset_bytes() + src_off * size);
            b.copy_d2h(
                src,
                &mut data_bytes[dst_off * size..(dst_off + count) * size],
                stream,
            )?;
            if self.elem().is_tagged() {
                let src_tag = base.offset(self.maxsize() + self.tag_index() + src_off);
                b.copy_d2h(src_tag, &mut tag_bytes[dst_off..dst_off + count], stream)?;
            }
            // Data must be visible to the caller on return.
            b.synchronize(stream)?;
            Ok(())
        })
        .ok_or(VantaError::ContextDestroyed)??;
        Ok(())
    }

    /// Copy `count` elements from another device array into this one.
    /// Both arrays must live in the same execution context.
    pub fn copy_from_device(
        &self,
        dst_off: usize,
        src: &DeviceArray,
        src_off: usize,
        count: usize,
        stream: Stream,
    ) -> Result<()> {
        check_elem(src.elem(), self.elem())?;
        check_range("source", src_off, count, src.len())?;
        check_range("destination", dst_off, count, self.len())?;
        if count == 0 {
            return Ok(());
        }
        let dst_storage = self.storage()?;
        let src_storage = src.storage()?;
        let ctx = dst_storage.context();
        if src_storage.context() != ctx {
            return Err(VantaError::Backend(
                "cross-context device copy is not supported".into(),
            ));
        }
        let size = self.elem().size();
        let src_base = src_storage.buffer().ptr();
        let dst_base = dst_storage.buffer().ptr();

        ctx.guard(|b| -> Result<()> {
            b.copy_d2d(
                src_base.offset(src.offset_bytes() + src_off * size),
                dst_base.offset(self.offset_bytes() + dst_off * size),
                count * size,
                stream,
            )?;
            if self.elem().is_tagged() {
                b.copy_d2d(
                    src_base.offset(src.maxsize() + src.tag_index() + src_off),
                    dst_base.offset(self.maxsize() + self.tag_index() + dst_off),
                    count,
                    stream,
                )?;
            }
            Ok(())
        })
        .ok_or(VantaError::ContextDestroyed)??;
        Ok(())
    }

    /// Upload a whole slice; its length must match the array's.
    pub fn write_slice<T: Pod>(&self, data: &[T], stream: Stream) -> Result<()> {
        if data.len() != self.len() {
            return Err(VantaError::Bounds {
                side: "source",
                offset: 0,
                count: self.len(),
                len: data.len(),
            });
        }
        self.copy_from_host(0, HostSpan::from_slice(data), 0, data.len(), stream)
    }

    /// Download the whole array into a fresh `Vec`.
    pub fn read_vec<T: Pod>(&self, stream: Stream) -> Result<Vec<T>> {
        check_elem(self.elem(), ElemType::of::<T>())?;
        let mut out = vec![T::zeroed(); self.len()];
        let n = out.len();
        self.copy_to_host(0, HostSpanMut::from_slice_mut(&mut out), 0, n, stream)?;
        Ok(out)
    }
}
