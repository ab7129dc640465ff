//! Single-slot background work.
use std::io;
use std::thread::{self, JoinHandle};

/// One unit of work running on its own thread.
///
/// The only way to get at the result, and at whatever resources were moved
/// into the closure, is [`Pending::join`], which consumes the handle. A
/// caller that keeps one `Pending` per role therefore cannot start new work
/// for that role before the previous work has been collected.
pub(crate) struct Pending<T> {
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> Pending<T> {
    pub(crate) fn spawn<F>(name: &str, work: F) -> io::Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let handle = thread::Builder::new().name(name.to_string()).spawn(work)?;
        Ok(Self { handle })
    }

    /// Blocks until the work finishes. A panic in the work becomes an error.
    pub(crate) fn join(self) -> io::Result<T> {
        self.handle
            .join()
            .map_err(|_| io::Error::other("background disk task panicked"))
    }
}
