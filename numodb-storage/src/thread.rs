use std::thread::{self, JoinHandle};

#[inline]
pub fn spawn_named<S, F>(name: S, f: F) -> JoinHandle<()>
where
    String: From<S>,
    F: FnOnce() + Send + 'static,
{
    let thread_name = String::from(name);
    thread::Builder::new()
        .name(thread_name)
        .spawn(|| {
            let thd = thread::current();
            tracing::debug!(name = thd.name().unwrap_or("unknown"), "thread started");
            f();
            let thd = thread::current();
            tracing::debug!(name = thd.name().unwrap_or("unknown"), "thread finished");
        })
        .unwrap()
}
