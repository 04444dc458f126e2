//! Per-OS shell resolution.
//!
//! Picks the interpreter binary and the flag that makes it execute a single
//! command string, so the executor can spawn `shell -c "command"` (or the
//! Windows equivalent) without hardcoding a platform assumption in callers.

/// The resolved shell binary and the flag used to pass a command string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShellConfig {
    pub program: &'static str,
    pub command_flag: &'static str,
}

/// Default terminal type advertised to children spawned in PTY mode.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Resolve the shell to use for the current host OS.
#[must_use]
pub fn resolve() -> ShellConfig {
    if cfg!(target_os = "windows") {
        ShellConfig {
            program: "cmd.exe",
            command_flag: "/C",
        }
    } else {
        ShellConfig {
            program: "/bin/sh",
            command_flag: "-c",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_a_shell_for_this_host() {
        let cfg = resolve();
        assert!(!cfg.program.is_empty());
        assert!(!cfg.command_flag.is_empty());
    }
}
