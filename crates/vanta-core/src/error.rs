use thiserror::Error;

/// Errors surfaced by the array memory core.
///
/// All variants are synchronous, locally detected and never retried
/// internally. The deferred (drop-time) release path swallows and logs
/// failures instead of surfacing them here.
#[derive(Debug, Error)]
pub enum VantaError {
    /// An ownership-requiring operation was attempted on storage this crate
    /// does not own.
    #[error("cannot {op} {kind} buffer")]
    Ownership { op: &'static str, kind: &'static str },

    /// The handle's storage reference has been released.
    #[error("array storage has already been released")]
    UseAfterFree,

    /// A copy or index range falls outside a buffer's declared extent.
    #[error("{side} range out of bounds: offset {offset} + count {count} exceeds {len} elements")]
    Bounds {
        side: &'static str,
        offset: usize,
        count: usize,
        len: usize,
    },

    /// The operation requires a fixed-layout ("inline") element type.
    #[error("{op} requires a fixed-layout element type, got {ty}")]
    TypeLayout { op: &'static str, ty: String },

    /// Reshape target does not cover the same number of elements.
    #[error("cannot reshape array of {numel} elements into {requested:?}")]
    InvalidReshape { numel: usize, requested: Vec<isize> },

    /// The index expression selects a strided region; only contiguous spans
    /// can share storage zero-copy.
    #[error("index expression does not select a contiguous span")]
    NonContiguousView,

    /// More axis indices than the array has dimensions.
    #[error("view takes at most {ndim} axis indices, got {given}")]
    ViewRank { given: usize, ndim: usize },

    /// Reinterpret cannot split the minor axis evenly into the new element
    /// size.
    #[error("cannot reinterpret {from}-byte elements as {to}-byte elements: the minor axis spans {extent} bytes, which does not divide evenly")]
    ReinterpretSize { from: usize, to: usize, extent: usize },

    /// The view's byte offset is not aligned for the new element size.
    #[error("cannot reinterpret a view whose byte offset is not a multiple of {to} bytes; reshape to a canonical start first")]
    ReinterpretOffset { to: usize },

    /// Zero-dimensional arrays can only be reinterpreted between equal-size
    /// element types.
    #[error("cannot reinterpret a zero-dimensional array from {from}-byte to {to}-byte elements")]
    ReinterpretZeroDim { from: usize, to: usize },

    /// Resize is defined for vectors only.
    #[error("resize requires a one-dimensional array, got {ndim} dimensions")]
    ResizeRank { ndim: usize },

    /// Source and destination element types of a copy differ.
    #[error("element type mismatch: source {src}, destination {dst}")]
    ElemMismatch { src: String, dst: String },

    /// A wrapped pointer's memory class could not be established, or is a
    /// class this crate does not support.
    #[error("cannot identify memory at {addr:#x}: {reason}")]
    UnidentifiedMemory { addr: u64, reason: &'static str },

    /// The owning execution context has been torn down.
    #[error("execution context has been destroyed")]
    ContextDestroyed,

    /// No context is current on the calling thread.
    #[error("no current execution context")]
    NoContext,

    /// Requested byte size overflows the address space.
    #[error("allocation size overflows the address space")]
    SizeOverflow,

    /// The memset path only supports power-of-two widths up to 4 bytes.
    #[error("fill supports 1-, 2- and 4-byte elements, got {size}-byte")]
    FillWidth { size: usize },

    /// Fill value does not fit the element width.
    #[error("fill value {value:#x} does not fit a {size}-byte element")]
    FillValue { value: u32, size: usize },

    /// Failure reported by the device backend.
    #[error("device backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = VantaError::Ownership {
            op: "free",
            kind: "unmanaged",
        };
        assert_eq!(err.to_string(), "cannot free unmanaged buffer");

        let err = VantaError::Bounds {
            side: "source",
            offset: 90,
            count: 20,
            len: 100,
        };
        assert!(err.to_string().contains("out of bounds"));
        assert!(err.to_string().contains("source"));

        let err = VantaError::ReinterpretSize {
            from: 4,
            to: 8,
            extent: 12,
        };
        assert!(err.to_string().contains("12 bytes"));
    }
}
