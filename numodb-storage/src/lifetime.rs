use std::cell::RefCell;

/// Utility trait for singletons whose lifetime spans the whole process.
///
/// The engine and its subsystems are shared by every worker thread; leaking
/// them to `'static` removes reference-counter maintenance from hot paths.
///
/// # Safety
///
/// After `drop_static`, no thread may access the leaked reference. When
/// multiple leaked objects depend on each other, drop order matters.
pub unsafe trait StaticLifetime: Sized {
    /// Create a leaked static reference from the given instance.
    fn new_static(this: Self) -> &'static Self {
        Box::leak(Box::new(this))
    }

    /// Reclaim a leaked reference.
    ///
    /// # Safety
    ///
    /// Caller must guarantee no thread accesses the reference afterwards.
    unsafe fn drop_static(this: &'static Self) {
        unsafe {
            drop(Box::from_raw(this as *const Self as *mut Self));
        }
    }
}

/// Scoped teardown of leaked statics, for tests.
///
/// Registered references are dropped in reverse registration order when the
/// scope is dropped. The safety contract of [`StaticLifetime::drop_static`]
/// still applies.
#[derive(Default)]
pub struct StaticLifetimeScope {
    entries: RefCell<Vec<(*const (), unsafe fn(*const ()))>>,
}

impl StaticLifetimeScope {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn adopt<T: StaticLifetime + 'static>(&self, r: &'static T) -> &'static T {
        self.entries
            .borrow_mut()
            .push((r as *const T as *const (), drop_entry::<T>));
        r
    }
}

impl Drop for StaticLifetimeScope {
    fn drop(&mut self) {
        let entries = self.entries.get_mut();
        while let Some((ptr, drop_fn)) = entries.pop() {
            // SAFETY: each entry was registered via `adopt` with the matching
            // concrete drop function.
            unsafe {
                drop_fn(ptr);
            }
        }
    }
}

unsafe fn drop_entry<T: StaticLifetime + 'static>(ptr: *const ()) {
    // SAFETY: `ptr` originates from a valid `&'static T` registered in
    // `adopt`, paired with `drop_entry::<T>` of the same `T`.
    let r = unsafe { &*(ptr as *const T) };
    unsafe {
        StaticLifetime::drop_static(r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Probe;

    impl Drop for Probe {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    unsafe impl StaticLifetime for Probe {}

    #[test]
    fn test_scope_drops_adopted_statics() {
        let before = DROPS.load(Ordering::SeqCst);
        {
            let scope = StaticLifetimeScope::new();
            scope.adopt(StaticLifetime::new_static(Probe));
            scope.adopt(StaticLifetime::new_static(Probe));
        }
        assert_eq!(DROPS.load(Ordering::SeqCst) - before, 2);
    }
}
