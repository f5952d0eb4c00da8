//! # vanta-core
//!
//! Reference-counted, context-aware device memory management for dense GPU
//! arrays.
//!
//! Provides:
//! - Shared ownership of device buffers across logical views — `view`,
//!   `reshape` and `reinterpret` alias storage zero-copy, tracked by an
//!   atomic handle count
//! - Safe deferred deallocation: idempotent explicit `free` plus a drop path
//!   that releases on the always-valid legacy stream
//! - Bounds-checked host/device transfer with a pinning-aware
//!   synchronization policy and tagged-element selector buffers
//! - A narrow [`DeviceBackend`] trait for the device allocator, with a
//!   host-memory emulation ([`CpuBackend`]) for development and tests

pub mod array;
pub mod backend;
pub mod context;
pub mod copy;
pub mod dtype;
pub mod error;
pub mod index;
pub mod shape;
pub mod storage;
pub mod view;

pub mod prelude;

pub use array::DeviceArray;
pub use backend::cpu::CpuBackend;
pub use backend::{DeviceBackend, DeviceBuffer, DevicePtr, MemoryClass, PointerInfo};
pub use context::{Context, ContextId, Stream};
pub use copy::{HostSpan, HostSpanMut};
pub use dtype::{ElemRepr, ElemType};
pub use error::VantaError;
pub use index::AxisIndex;
pub use shape::Shape;
pub use storage::{ArrayStorage, Ownership};

pub type Result<T> = std::result::Result<T, VantaError>;
