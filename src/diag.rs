//! Per-thread diagnostic state for server threads.
//!
//! Most of this is informational, used for log tags on the server side.
//! The error override is different: a backend may record a specific errno
//! for the request in flight, and that value takes precedence when the
//! server picks the error code for the reply.
//!
//! Threads that never call [`new_server_thread`] (e.g. the accept thread)
//! have no record; setters are no-ops there and [`set_error`] falls back to
//! the ambient errno.
#![deny(missing_docs)]

use std::cell::RefCell;
use std::net::SocketAddr;
use std::sync::Mutex;

use nix::errno::Errno;

#[derive(Default)]
struct ThreadContext {
    name: Option<String>,
    instance_num: usize,
    peer_addr: Option<SocketAddr>,
    err: i32,
}

struct Slot(Option<ThreadContext>);

impl Drop for Slot {
    fn drop(&mut self) {
        if self.0.is_some() {
            decr_running_threads();
        }
    }
}

thread_local! {
    static SLOT: RefCell<Slot> = const { RefCell::new(Slot(None)) };
}

/// Register the current thread as a server thread: install a zeroed
/// diagnostic record and count it towards [`running_threads`]. The count
/// drops again when the thread exits.
pub fn new_server_thread() {
    incr_running_threads();
    SLOT.with(|s| s.borrow_mut().0 = Some(ThreadContext::default()));
}

/// Set the display name used in this thread's log tags.
pub fn set_name<S: Into<String>>(name: S) {
    SLOT.with(|s| {
        if let Some(ctx) = s.borrow_mut().0.as_mut() {
            ctx.name = Some(name.into());
        }
    });
}

/// The display name of this thread, if one was set.
pub fn name() -> Option<String> {
    SLOT.with(|s| s.borrow().0.as_ref().and_then(|ctx| ctx.name.clone()))
}

/// Set the connection instance number of this thread.
pub fn set_instance_num(instance_num: usize) {
    SLOT.with(|s| {
        if let Some(ctx) = s.borrow_mut().0.as_mut() {
            ctx.instance_num = instance_num;
        }
    });
}

/// The connection instance number of this thread (0 if unset).
pub fn instance_num() -> usize {
    SLOT.with(|s| s.borrow().0.as_ref().map_or(0, |ctx| ctx.instance_num))
}

/// Record the peer address served by this thread.
pub fn set_peer_addr(addr: SocketAddr) {
    SLOT.with(|s| {
        if let Some(ctx) = s.borrow_mut().0.as_mut() {
            ctx.peer_addr = Some(addr);
        }
    });
}

/// The peer address served by this thread, if known.
pub fn peer_addr() -> Option<SocketAddr> {
    SLOT.with(|s| s.borrow().0.as_ref().and_then(|ctx| ctx.peer_addr))
}

/// A short tag identifying this thread in log lines, e.g. `memory[3]`.
pub fn thread_tag() -> String {
    SLOT.with(|s| match s.borrow().0.as_ref() {
        Some(ctx) => format!(
            "{}[{}]",
            ctx.name.as_deref().unwrap_or("conn"),
            ctx.instance_num
        ),
        None => "server".to_string(),
    })
}

/// Record `err` as the error for the request in flight. On a thread with no
/// diagnostic record the value goes to the ambient errno instead.
pub fn set_error(err: i32) {
    let stored = SLOT.with(|s| match s.borrow_mut().0.as_mut() {
        Some(ctx) => {
            ctx.err = err;
            true
        }
        None => false,
    });
    if !stored {
        Errno::set_raw(err);
    }
}

/// The recorded error for the request in flight, or 0 if none (or if this
/// thread has no record). Leaves the ambient errno untouched.
pub fn get_error() -> i32 {
    let saved = Errno::last_raw();
    let err = SLOT.with(|s| s.borrow().0.as_ref().map_or(0, |ctx| ctx.err));
    Errno::set_raw(saved);
    err
}

// These functions keep track of the number of running server threads, for
// shutdown coordination with the accept loop.
static RUNNING_THREADS: Mutex<usize> = Mutex::new(0);

/// Number of server threads currently running.
pub fn running_threads() -> usize {
    *RUNNING_THREADS.lock().unwrap()
}

fn incr_running_threads() {
    *RUNNING_THREADS.lock().unwrap() += 1;
}

fn decr_running_threads() {
    *RUNNING_THREADS.lock().unwrap() -= 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::thread;

    #[test]
    fn setters_are_noops_without_record() {
        set_name("orphan");
        assert_eq!(name(), None);
        assert_eq!(instance_num(), 0);
        assert_eq!(thread_tag(), "server");
    }

    #[test]
    #[serial]
    fn record_tracks_name_instance_and_error() {
        thread::spawn(|| {
            new_server_thread();
            set_name("memory");
            set_instance_num(7);
            assert_eq!(name().as_deref(), Some("memory"));
            assert_eq!(thread_tag(), "memory[7]");

            assert_eq!(get_error(), 0);
            set_error(5);
            assert_eq!(get_error(), 5);
            set_error(0);
            assert_eq!(get_error(), 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    #[serial]
    fn running_threads_counts_server_threads() {
        let before = running_threads();
        let t = thread::spawn(move || {
            new_server_thread();
            assert!(running_threads() > before);
        });
        t.join().unwrap();
        // record dropped on thread exit
        assert_eq!(running_threads(), before);
    }
}
