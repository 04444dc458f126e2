//! Lazy PTY backend loader.
//!
//! Opening a pseudo-terminal can fail on hosts without one available (e.g. a
//! container with no `/dev/ptmx`). The first attempt to use PTY mode probes
//! the backend and caches the outcome -- success or failure -- for the
//! lifetime of the process, so a host without PTY support doesn't pay a
//! syscall-and-fail cost on every session.

use std::sync::OnceLock;

static BACKEND: OnceLock<Result<(), String>> = OnceLock::new();

/// Fixed initial PTY geometry: 120 columns x 30 rows.
pub const INITIAL_COLS: u16 = 120;
pub const INITIAL_ROWS: u16 = 30;

/// Ensure the PTY backend is available, probing it at most once per process.
///
/// Returns a clone of the cached outcome. A cached failure is never retried.
fn ensure_loaded() -> Result<(), String> {
    BACKEND
        .get_or_init(|| {
            if std::env::var_os("BASHD_FORCE_PTY_UNAVAILABLE").is_some() {
                return Err(
                    "PTY backend unavailable: forced off by BASHD_FORCE_PTY_UNAVAILABLE"
                        .to_string(),
                );
            }
            if cfg!(unix) && std::path::Path::new("/dev/ptmx").exists() {
                Ok(())
            } else {
                Err("PTY backend unavailable: /dev/ptmx not found on this host".to_string())
            }
        })
        .clone()
}

/// A freshly opened PTY pair, sized to the fixed initial geometry.
pub struct OpenedPty {
    pub pty: pty_process::Pty,
    pub pts: pty_process::Pts,
}

/// Open a new PTY pair for a session, after confirming the backend loads.
///
/// On backend-load failure this returns the cached error without attempting
/// another syscall; on backend success it still opens a fresh pair (the
/// cache only remembers *whether PTYs work here*, not a reusable handle).
pub fn open() -> Result<OpenedPty, String> {
    ensure_loaded()?;

    let (pty, pts) = pty_process::open().map_err(|e| format!("failed to open PTY: {e}"))?;
    pty.resize(pty_process::Size::new(INITIAL_ROWS, INITIAL_COLS))
        .map_err(|e| format!("failed to resize PTY: {e}"))?;
    Ok(OpenedPty { pty, pts })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_reports_fixed_geometry_or_a_structured_error() {
        // We can't assert PTYs are available in every test environment, but
        // we can assert the call never panics and, on success, a pair comes
        // back ready to spawn into.
        match open() {
            Ok(_opened) => {}
            Err(msg) => assert!(!msg.is_empty()),
        }
    }
}
