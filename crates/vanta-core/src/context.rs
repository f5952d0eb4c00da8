//! Execution contexts and streams.
//!
//! A [`Context`] pairs one device backend with a liveness flag and an entry
//! in a global registry, so storage can outlive the code path that created
//! it and still find (or skip) its allocator at release time. Streams are
//! opaque ordering lanes; stream 0 is the legacy default stream, which
//! synchronizes every other stream when used.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::backend::DeviceBackend;

/// Identifier of one execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    pub fn raw(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn raw_for_tests(raw: u64) -> Self {
        ContextId(raw)
    }
}

/// An execution stream.
///
/// The core never creates or destroys streams — it only threads them through
/// to the backend. `Stream::LEGACY` is always valid, which is what the
/// deferred release path relies on when task-local streams may already be
/// gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Stream(u64);

impl Stream {
    /// The legacy default stream: work submitted here synchronizes with all
    /// other streams.
    pub const LEGACY: Stream = Stream(0);

    pub const fn of(raw: u64) -> Stream {
        Stream(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_legacy(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug)]
struct ContextInner {
    id: ContextId,
    backend: Arc<dyn DeviceBackend>,
    alive: AtomicBool,
}

/// An execution context owning one device allocator.
///
/// Cloning is cheap (shared inner state). Destroying a context marks its
/// allocator as gone: pending releases against it become silent no-ops.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

static REGISTRY: OnceLock<Mutex<HashMap<u64, Weak<ContextInner>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<u64, Weak<ContextInner>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

thread_local! {
    static CURRENT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

impl Context {
    /// Register a new context around a device backend.
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Context {
        let id = ContextId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        backend.bind_context(id);
        let inner = Arc::new(ContextInner {
            id,
            backend,
            alive: AtomicBool::new(true),
        });
        registry().lock().insert(id.raw(), Arc::downgrade(&inner));
        Context { inner }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.inner.backend
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Mark the context destroyed. The underlying allocator is considered
    /// gone; releases guarded through [`Context::guard`] turn into no-ops.
    pub fn destroy(&self) {
        self.inner.alive.store(false, Ordering::Release);
        registry().lock().remove(&self.inner.id.raw());
    }

    /// Run `f` against the backend only while the context is alive.
    pub fn guard<R>(&self, f: impl FnOnce(&dyn DeviceBackend) -> R) -> Option<R> {
        if self.is_alive() {
            Some(f(self.inner.backend.as_ref()))
        } else {
            None
        }
    }

    /// Look up a live context by id.
    pub fn lookup(id: ContextId) -> Option<Context> {
        registry()
            .lock()
            .get(&id.raw())
            .and_then(Weak::upgrade)
            .map(|inner| Context { inner })
    }

    /// The calling thread's current context.
    pub fn current() -> Option<Context> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Install this context as the calling thread's current one.
    pub fn make_current(&self) {
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Context(id={}, alive={})",
            self.inner.id.raw(),
            self.is_alive()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuBackend;

    #[test]
    fn test_registry_lookup() {
        let ctx = Context::new(Arc::new(CpuBackend::new()));
        let found = Context::lookup(ctx.id()).unwrap();
        assert_eq!(found, ctx);
    }

    #[test]
    fn test_destroy() {
        let ctx = Context::new(Arc::new(CpuBackend::new()));
        assert!(ctx.is_alive());
        assert_eq!(ctx.guard(|_| 42), Some(42));

        ctx.destroy();
        assert!(!ctx.is_alive());
        assert_eq!(ctx.guard(|_| 42), None);
        assert!(Context::lookup(ctx.id()).is_none());
    }

    #[test]
    fn test_current() {
        let ctx = Context::new(Arc::new(CpuBackend::new()));
        ctx.make_current();
        assert_eq!(Context::current().unwrap(), ctx);
    }

    #[test]
    fn test_streams() {
        assert!(Stream::LEGACY.is_legacy());
        assert!(!Stream::of(3).is_legacy());
        assert_eq!(Stream::default(), Stream::LEGACY);
    }
}
