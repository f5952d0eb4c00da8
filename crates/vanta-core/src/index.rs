use smallvec::SmallVec;

use crate::error::VantaError;
use crate::shape::Shape;
use crate::Result;

/// One indexing expression along a single axis of a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxisIndex {
    /// A single position; the axis is dropped from the view.
    At(usize),
    /// The half-open range `[start, end)`; the axis keeps the range's length.
    Range(usize, usize),
    /// The whole axis.
    Full,
}

/// A classified contiguous span: linear element start plus the view's shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Span {
    pub start: usize,
    pub shape: Shape,
}

/// Classify an index tuple against `shape` as a contiguous span.
///
/// Row-major contiguity: any number of leading `At` indices, then at most one
/// `Range`, then only `Full` axes. Everything else selects a strided region
/// and is rejected — strided views fall outside this core. Missing trailing
/// axes count as `Full`.
pub(crate) fn contiguous_span(shape: &Shape, index: &[AxisIndex]) -> Result<Span> {
    let ndim = shape.ndim();
    if index.len() > ndim {
        return Err(VantaError::ViewRank {
            given: index.len(),
            ndim,
        });
    }

    let strides = shape.contiguous_strides();
    let mut start = 0usize;
    let mut dims: SmallVec<[usize; 4]> = SmallVec::new();
    // Once a range (or full axis) has been seen, only full axes may follow.
    let mut ranged = false;

    for (axis, idx) in index.iter().enumerate() {
        let extent = shape.dims()[axis];
        match idx {
            AxisIndex::At(i) => {
                if ranged {
                    return Err(VantaError::NonContiguousView);
                }
                if *i >= extent {
                    return Err(VantaError::Bounds {
                        side: "view",
                        offset: *i,
                        count: 1,
                        len: extent,
                    });
                }
                start += i * strides[axis];
            }
            AxisIndex::Range(s, e) => {
                if ranged {
                    return Err(VantaError::NonContiguousView);
                }
                if s > e || *e > extent {
                    return Err(VantaError::Bounds {
                        side: "view",
                        offset: *s,
                        count: e.saturating_sub(*s),
                        len: extent,
                    });
                }
                start += s * strides[axis];
                dims.push(e - s);
                ranged = true;
            }
            AxisIndex::Full => {
                dims.push(extent);
                ranged = true;
            }
        }
    }

    for axis in index.len()..ndim {
        dims.push(shape.dims()[axis]);
    }

    Ok(Span {
        start,
        shape: Shape::new(&dims),
    })
}
