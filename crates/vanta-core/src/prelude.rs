//! Convenience re-exports for typical use.

pub use crate::array::DeviceArray;
pub use crate::backend::cpu::CpuBackend;
pub use crate::backend::{DeviceBackend, DevicePtr};
pub use crate::context::{Context, Stream};
pub use crate::copy::{HostSpan, HostSpanMut};
pub use crate::dtype::ElemType;
pub use crate::error::VantaError;
pub use crate::index::AxisIndex;
pub use crate::shape::Shape;
pub use crate::Result;
