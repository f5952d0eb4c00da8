//! Shared storage behind array handles.
//!
//! One [`ArrayStorage`] owns exactly one device allocation. Many handles may
//! alias it; the [`Ownership`] state decides who frees the buffer and when.

use std::fmt;
use std::sync::atomic::{fence, AtomicIsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::DeviceBuffer;
use crate::context::{Context, Stream};
use crate::error::VantaError;
use crate::Result;

/// Release hook for foreign-owned storage, run exactly once.
pub type ReleaseFn = Box<dyn FnOnce(DeviceBuffer) + Send>;

/// Ownership discipline of one device allocation.
pub enum Ownership {
    /// Lifetime governed by the handle count: seeded to 1 on allocation,
    /// +1 per derived view, −1 per release; the buffer is freed on the
    /// 1 → 0 transition and the storage becomes inert.
    Managed(AtomicIsize),
    /// Foreign memory this crate must never free.
    Unmanaged,
    /// Foreign memory released exactly once, by the hook, when the last
    /// aliasing handle disappears. Never participates in the managed count.
    ForeignOwned(Mutex<Option<ReleaseFn>>),
}

impl fmt::Debug for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ownership::Managed(count) => {
                write!(f, "Managed({})", count.load(Ordering::Acquire))
            }
            Ownership::Unmanaged => write!(f, "Unmanaged"),
            Ownership::ForeignOwned(_) => write!(f, "ForeignOwned"),
        }
    }
}

/// One device allocation, its owning context and its ownership state.
#[derive(Debug)]
pub struct ArrayStorage {
    buffer: DeviceBuffer,
    ctx: Context,
    ownership: Ownership,
}

impl ArrayStorage {
    /// Wrap a fresh allocation whose lifetime the refcount protocol governs.
    pub fn managed(buffer: DeviceBuffer, ctx: Context) -> Arc<Self> {
        Arc::new(Self {
            buffer,
            ctx,
            ownership: Ownership::Managed(AtomicIsize::new(1)),
        })
    }

    /// Wrap foreign memory that must never be freed here.
    pub fn unmanaged(buffer: DeviceBuffer, ctx: Context) -> Arc<Self> {
        Arc::new(Self {
            buffer,
            ctx,
            ownership: Ownership::Unmanaged,
        })
    }

    /// Wrap foreign memory with a one-shot release hook, fired when the last
    /// aliasing handle is gone.
    pub fn foreign(buffer: DeviceBuffer, ctx: Context, release: ReleaseFn) -> Arc<Self> {
        Arc::new(Self {
            buffer,
            ctx,
            ownership: Ownership::ForeignOwned(Mutex::new(Some(release))),
        })
    }

    pub fn buffer(&self) -> DeviceBuffer {
        self.buffer
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn is_managed(&self) -> bool {
        matches!(self.ownership, Ownership::Managed(_))
    }

    pub(crate) fn ownership_kind(&self) -> &'static str {
        match self.ownership {
            Ownership::Managed(_) => "managed",
            Ownership::Unmanaged => "unmanaged",
            Ownership::ForeignOwned(_) => "foreign-owned",
        }
    }

    /// Live-handle count; `None` for unmanaged and foreign-owned storage.
    pub fn refcount(&self) -> Option<isize> {
        match &self.ownership {
            Ownership::Managed(count) => Some(count.load(Ordering::Acquire)),
            _ => None,
        }
    }

    /// Take one more share for a derived handle.
    ///
    /// Managed storage increments through a CAS loop that only succeeds
    /// while the observed count is strictly positive, so a derivation racing
    /// the final release fails instead of resurrecting freed storage.
    /// Unmanaged and foreign-owned storage alias without counting.
    pub(crate) fn retain(&self) -> Result<()> {
        match &self.ownership {
            Ownership::Managed(count) => {
                let mut cur = count.load(Ordering::Relaxed);
                loop {
                    if cur <= 0 {
                        return Err(VantaError::UseAfterFree);
                    }
                    match count.compare_exchange_weak(
                        cur,
                        cur + 1,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => return Ok(()),
                        Err(observed) => cur = observed,
                    }
                }
            }
            _ => Ok(()),
        }
    }

    /// Drop one share. Returns whether this call retired the storage.
    ///
    /// The decrement that observes the 1 → 0 transition frees the buffer on
    /// `stream` within the owning context; if the context has since been
    /// destroyed the free is silently skipped — the allocator is already
    /// gone. A count already at zero is a no-op (double-release protection
    /// lives upstream in the handle, which detaches on first free).
    pub(crate) fn release(&self, stream: Stream) -> Result<bool> {
        match &self.ownership {
            Ownership::Managed(count) => {
                let mut cur = count.load(Ordering::Relaxed);
                loop {
                    if cur <= 0 {
                        return Ok(false);
                    }
                    match count.compare_exchange_weak(
                        cur,
                        cur - 1,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(observed) => cur = observed,
                    }
                }
                if cur != 1 {
                    return Ok(false);
                }
                // Last share: order every prior access before the free.
                fence(Ordering::Acquire);
                match self.ctx.guard(|b| b.free(self.buffer, stream)) {
                    Some(res) => res.map(|_| true),
                    None => Ok(true),
                }
            }
            Ownership::Unmanaged => Err(VantaError::Ownership {
                op: "free",
                kind: "unmanaged",
            }),
            Ownership::ForeignOwned(_) => Err(VantaError::Ownership {
                op: "free",
                kind: "foreign-owned",
            }),
        }
    }
}

impl Drop for ArrayStorage {
    fn drop(&mut self) {
        if let Ownership::ForeignOwned(hook) = &self.ownership {
            if let Some(hook) = hook.lock().take() {
                let buffer = self.buffer;
                // If the context is gone, so is the allocator the hook
                // would hand the buffer back to.
                self.ctx.guard(move |_| hook(buffer));
            }
        }
    }
}
