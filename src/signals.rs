//! Process signal wiring for the client side.
//!
//! The client owns interrupt handling: Ctrl-C becomes an interrupt token the
//! request proxy absorbs mid-wait, and the worker thread never observes it.
//! SIGTERM triggers graceful shutdown through the connection. Neither
//! handler runs teardown in signal context; the SIGTERM flag is observed
//! from a watcher thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::ServerConnection;

static SIGTERM_FLAG: AtomicBool = AtomicBool::new(false);

const WATCH_INTERVAL: Duration = Duration::from_millis(100);

#[cfg(unix)]
extern "C" fn on_sigterm(_signal: libc::c_int) {
    SIGTERM_FLAG.store(true, Ordering::SeqCst);
}

/// Install the Ctrl-C forwarder. Failure (for instance a handler already
/// installed by the embedder) is logged and ignored: the proxy works without
/// interrupt forwarding, it just cannot absorb Ctrl-C mid-wait.
pub(crate) fn install_interrupt_forwarder(interrupt_tx: flume::Sender<()>) {
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    }) {
        log::warn!("Could not install the interrupt handler: {err}");
    }
}

/// Install the SIGTERM handler and spawn the watcher that turns the flag
/// into a graceful `sigterm_terminate`. The watcher exits once the
/// connection is terminated by any path.
pub(crate) fn install_sigterm_watcher(connection: Arc<ServerConnection>) {
    #[cfg(unix)]
    unsafe {
        let handler = on_sigterm as extern "C" fn(libc::c_int);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
    let spawned = std::thread::Builder::new()
        .name("kiln-signals".into())
        .spawn(move || loop {
            if SIGTERM_FLAG.swap(false, Ordering::SeqCst) {
                connection.sigterm_terminate();
                return;
            }
            if connection.is_terminated() {
                return;
            }
            std::thread::sleep(WATCH_INTERVAL);
        });
    if let Err(err) = spawned {
        log::warn!("Could not start the signal watcher: {err}");
    }
}
