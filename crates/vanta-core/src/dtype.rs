use std::fmt;

/// Layout class of an element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemRepr {
    /// Fixed inline representation with no indirection. The only class
    /// eligible for `wrap_foreign` and `reinterpret`.
    Inline,
    /// Union-style payload plus one selector byte per element. The selector
    /// bytes live in a side buffer immediately past the data region.
    Tagged,
    /// Carries pointers or other indirection; cannot live in device memory.
    Indirect,
}

/// Runtime descriptor for an array element type.
///
/// The core is untyped at the Rust level: an array carries an `ElemType`
/// describing the per-element byte size and layout class, and typed access
/// goes through `bytemuck::Pod` staging on the host side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElemType {
    size: usize,
    repr: ElemRepr,
}

impl ElemType {
    /// Descriptor for a plain-old-data Rust type.
    pub fn of<T: bytemuck::Pod>() -> Self {
        Self {
            size: std::mem::size_of::<T>(),
            repr: ElemRepr::Inline,
        }
    }

    /// A fixed-layout type of `size` bytes.
    pub const fn inline(size: usize) -> Self {
        Self {
            size,
            repr: ElemRepr::Inline,
        }
    }

    /// A tagged-union type whose payload occupies `size` bytes, plus one
    /// selector byte per element in the tag buffer.
    pub const fn tagged(size: usize) -> Self {
        Self {
            size,
            repr: ElemRepr::Tagged,
        }
    }

    /// A type with embedded indirection. Rejected by every allocation path.
    pub const fn indirect() -> Self {
        Self {
            size: 0,
            repr: ElemRepr::Indirect,
        }
    }

    /// Payload size in bytes (excluding any selector byte).
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn repr(&self) -> ElemRepr {
        self.repr
    }

    pub fn is_inline(&self) -> bool {
        self.repr == ElemRepr::Inline
    }

    pub fn is_tagged(&self) -> bool {
        self.repr == ElemRepr::Tagged
    }

    pub fn is_indirect(&self) -> bool {
        self.repr == ElemRepr::Indirect
    }

    /// Data-region bytes needed for `numel` elements, or `None` on overflow.
    pub fn data_bytes(&self, numel: usize) -> Option<usize> {
        numel.checked_mul(self.size)
    }

    /// Selector-buffer bytes needed for `numel` elements.
    pub fn tag_bytes(&self, numel: usize) -> usize {
        if self.is_tagged() {
            numel
        } else {
            0
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.repr {
            ElemRepr::Inline => write!(f, "inline[{}]", self.size),
            ElemRepr::Tagged => write!(f, "tagged[{}+1]", self.size),
            ElemRepr::Indirect => write!(f, "indirect"),
        }
    }
}
