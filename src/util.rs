//! Small helpers shared across modules.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;

/// Lock `mutex`, recovering the data if a previous holder panicked.
///
/// A panicking component must not wedge the manager or an engine, so every
/// internal table is locked through here.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drive `future` on `runtime` from synchronous code.
///
/// Safe on plain threads, blocking-pool threads and runtime workers; a
/// worker hands its queue to another thread while it waits.
pub(crate) fn block_on<F: Future>(runtime: &Handle, future: F) -> F::Output {
    tokio::task::block_in_place(|| runtime.block_on(future))
}

/// A fresh stanza id.
pub fn new_packet_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
