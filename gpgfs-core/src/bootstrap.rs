/// Process-level hardening applied at daemon startup.
///
/// Call before any secrets are read.  Both operations are best-effort: a
/// warning is logged on failure and the daemon continues.
///
/// 1. `PR_SET_DUMPABLE 0` — blocks `/proc/<pid>/mem` reads by non-root
///    processes and disables core dumps.
/// 2. `mlockall(MCL_CURRENT | MCL_FUTURE)` — pins all pages into RAM so
///    transient copies of secrets can never be swapped out.  Requires
///    `CAP_IPC_LOCK` (or a generous `RLIMIT_MEMLOCK`); the per-buffer
///    `mlock` in [`crate::buffer`] still covers the sensitive regions when
///    this fails.
#[cfg(unix)]
pub fn secure_bootstrap() {
    set_not_dumpable();
    lock_all_memory();
}

/// No-op on non-unix platforms.
#[cfg(not(unix))]
pub fn secure_bootstrap() {}

#[cfg(unix)]
fn set_not_dumpable() {
    // SAFETY: prctl with PR_SET_DUMPABLE and plain integer args.
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0i64, 0i64, 0i64, 0i64) };
    if ret == 0 {
        tracing::debug!("PR_SET_DUMPABLE=0: core dumps disabled");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("PR_SET_DUMPABLE=0 failed (non-fatal): {err}");
    }
}

#[cfg(unix)]
fn lock_all_memory() {
    // SAFETY: mlockall takes flags only; failure is non-fatal.
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret == 0 {
        tracing::debug!("mlockall: all memory pages locked in RAM");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("mlockall failed (non-fatal, per-buffer locking still applies): {err}");
    }
}
