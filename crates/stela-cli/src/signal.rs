use std::sync::atomic::{AtomicBool, Ordering};

/// Global shutdown flag. Set to `true` on the first SIGINT/SIGTERM.
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Install handlers for cooperative shutdown. The first signal sets
/// [`SHUTDOWN`] and restores the default handler, so a second signal
/// terminates the process immediately.
pub fn install_signal_handlers() {
    #[cfg(unix)]
    // Safety: the handler only stores into an atomic and re-arms the
    // default disposition, both async-signal-safe.
    unsafe {
        libc::signal(
            libc::SIGTERM,
            handle_signal as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            handle_signal as *const () as libc::sighandler_t,
        );
    }
}

#[cfg(unix)]
extern "C" fn handle_signal(sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}
