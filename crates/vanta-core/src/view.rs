//! Zero-copy derivation: view, reshape, reinterpret.
//!
//! All three share one pattern: compute a new {offset, shape, element type}
//! triple and produce a handle aliasing the *same* storage. The shared
//! storage is retained through the CAS loop in [`crate::storage`], so a
//! derivation racing the final release fails with `UseAfterFree` instead of
//! resurrecting freed memory. Unmanaged and foreign-owned storage is aliased
//! without counting.

use std::sync::Arc;

use crate::array::DeviceArray;
use crate::dtype::ElemType;
use crate::error::VantaError;
use crate::index::{contiguous_span, AxisIndex};
use crate::shape::Shape;
use crate::Result;

impl DeviceArray {
    fn derive(&self, elem: ElemType, offset: usize, shape: Shape) -> Result<DeviceArray> {
        let storage = self.storage()?;
        storage.retain()?;
        Ok(DeviceArray::from_parts(
            Arc::clone(storage),
            elem,
            shape,
            offset,
            self.maxsize(),
        ))
    }

    /// Zero-copy view of a contiguous index span.
    ///
    /// Row-major contiguity: leading scalar indices, at most one range, then
    /// only full axes; missing trailing axes count as full. Anything else is
    /// a strided selection and is rejected — strided views are outside this
    /// core.
    pub fn view(&self, index: &[AxisIndex]) -> Result<DeviceArray> {
        let span = contiguous_span(self.shape(), index)?;
        let offset = self.offset_bytes() + span.start * self.elem().size();
        self.derive(self.elem(), offset, span.shape)
    }

    /// Zero-copy reshape; one dimension may be `-1` (inferred).
    ///
    /// Reshaping to the identical shape still yields an alias that shares
    /// storage and takes a normal retain, so the managed count always equals
    /// the number of live handles.
    pub fn reshape(&self, dims: &[isize]) -> Result<DeviceArray> {
        let resolved =
            self.shape()
                .resolve_reshape(dims)
                .ok_or_else(|| VantaError::InvalidReshape {
                    numel: self.shape().numel(),
                    requested: dims.to_vec(),
                })?;
        self.derive(self.elem(), self.offset_bytes(), resolved)
    }

    /// Reinterpret the element type over the same bytes.
    ///
    /// Equal sizes keep the shape. Unequal sizes rescale the minor
    /// (fastest-varying) axis: its byte extent must divide evenly by the new
    /// element size, and the handle's byte offset must already be aligned
    /// for the new type. Both element types must be fixed-layout.
    pub fn reinterpret(&self, new_elem: ElemType) -> Result<DeviceArray> {
        if !self.elem().is_inline() {
            return Err(VantaError::TypeLayout {
                op: "reinterpret",
                ty: self.elem().to_string(),
            });
        }
        if !new_elem.is_inline() {
            return Err(VantaError::TypeLayout {
                op: "reinterpret",
                ty: new_elem.to_string(),
            });
        }
        let (s, t) = (self.elem().size(), new_elem.size());
        if s == 0 || t == 0 {
            return Err(VantaError::TypeLayout {
                op: "reinterpret",
                ty: new_elem.to_string(),
            });
        }
        if t == s {
            return self.derive(new_elem, self.offset_bytes(), self.shape().clone());
        }
        if self.shape().is_scalar() {
            return Err(VantaError::ReinterpretZeroDim { from: s, to: t });
        }

        let ndim = self.ndim();
        let minor = self.shape().dims()[ndim - 1];
        let extent = minor.checked_mul(s).ok_or(VantaError::SizeOverflow)?;
        if extent % t != 0 {
            return Err(VantaError::ReinterpretSize {
                from: s,
                to: t,
                extent,
            });
        }
        if self.offset_bytes() % t != 0 {
            return Err(VantaError::ReinterpretOffset { to: t });
        }
        let mut dims = self.shape().dims().to_vec();
        dims[ndim - 1] = extent / t;
        self.derive(new_elem, self.offset_bytes(), Shape::from(dims))
    }
}
