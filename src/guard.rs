//! Dangerous-command guard.
//!
//! Ported from the same check a persistent-session shell needs before it
//! hands a command to a live `/bin/sh`: block a fixed set of catastrophic
//! patterns (fork bombs, filesystem formatting, raw block-device writes,
//! system shutdown) and recursive destructive operations aimed at protected
//! system paths. A blocked command never spawns; it produces a structured
//! failure the same way any other invalid-argument case does.

use regex::Regex;
use std::sync::LazyLock;

const PROTECTED_PATHS: &[&str] = &[
    "/", "/bin", "/sbin", "/usr", "/etc", "/var", "/home", "/root", "/lib", "/lib64", "/opt",
    "/boot", "/dev", "/sys", "/proc", "/System", "/Library", "/Applications", "/Users",
    "/private", "/private/var", "/private/etc",
];

struct DangerousPattern {
    regex: Regex,
    description: &'static str,
}

static DANGEROUS_PATTERNS: LazyLock<Vec<DangerousPattern>> = LazyLock::new(|| {
    vec![
        DangerousPattern {
            regex: Regex::new(r":\(\)\s*\{.*\|.*&\s*\}\s*;").unwrap(),
            description: "fork bomb",
        },
        DangerousPattern {
            regex: Regex::new(r"\bmkfs\b").unwrap(),
            description: "filesystem format (mkfs)",
        },
        DangerousPattern {
            regex: Regex::new(r"\bdd\b.*\bof=/dev/").unwrap(),
            description: "raw write to block device (dd of=/dev/...)",
        },
        DangerousPattern {
            regex: Regex::new(r">\s*/dev/(sd|nvme|hd|vd|xvd|disk|mapper/)").unwrap(),
            description: "redirect to block device",
        },
        DangerousPattern {
            regex: Regex::new(r"\b(shutdown|reboot|halt|poweroff)\b").unwrap(),
            description: "system shutdown/reboot",
        },
        DangerousPattern {
            regex: Regex::new(r"\binit\s+[06]\b").unwrap(),
            description: "system halt/reboot via init",
        },
    ]
});

/// Validate a command against dangerous patterns. `Ok(())` if safe, or
/// `Err(description)` naming the match for a structured failure message.
pub fn validate(command: &str) -> Result<(), String> {
    for pattern in DANGEROUS_PATTERNS.iter() {
        if pattern.regex.is_match(command) {
            return Err(format!(
                "blocked: command matches dangerous pattern ({}): {command}",
                pattern.description
            ));
        }
    }
    check_destructive_on_protected_paths(command)
}

fn check_destructive_on_protected_paths(command: &str) -> Result<(), String> {
    for subcmd in split_subcommands(command.trim()) {
        let subcmd = subcmd.trim();
        if subcmd.is_empty() {
            continue;
        }
        if is_dangerous_recursive(subcmd, "rm", &["-r", "-R", "--recursive"], true) {
            return Err(format!(
                "blocked: recursive delete targeting a protected system path: {subcmd}"
            ));
        }
        if is_dangerous_recursive(subcmd, "chmod", &["-R", "--recursive"], false) {
            return Err(format!(
                "blocked: recursive chmod on a protected system path: {subcmd}"
            ));
        }
        if is_dangerous_recursive(subcmd, "chown", &["-R", "--recursive"], false) {
            return Err(format!(
                "blocked: recursive chown on a protected system path: {subcmd}"
            ));
        }
    }
    Ok(())
}

fn split_subcommands(cmd: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut remaining = cmd;
    while !remaining.is_empty() {
        if let Some(pos) = remaining
            .find("&&")
            .into_iter()
            .chain(remaining.find("||"))
            .chain(remaining.find(';'))
            .min()
        {
            parts.push(&remaining[..pos]);
            let sep_len =
                if remaining[pos..].starts_with("&&") || remaining[pos..].starts_with("||") {
                    2
                } else {
                    1
                };
            remaining = &remaining[pos + sep_len..];
        } else {
            parts.push(remaining);
            break;
        }
    }
    parts
}

/// True if `subcmd` invokes `cmd_name` with a recursive flag against one of
/// the protected paths. `short_bundle` allows single-letter bundled flags
/// like `rm -rf` (where `r` appears among other short flags); chmod/chown
/// only look for the exact `-R`/`--recursive` spellings.
fn is_dangerous_recursive(
    subcmd: &str,
    cmd_name: &str,
    recursive_flags: &[&str],
    short_bundle: bool,
) -> bool {
    let words: Vec<&str> = subcmd.split_whitespace().collect();
    let Some(cmd_pos) = words.iter().position(|w| *w == cmd_name) else {
        return false;
    };
    let args = &words[cmd_pos + 1..];

    let has_recursive = args.iter().any(|a| {
        recursive_flags.contains(a)
            || (short_bundle
                && a.starts_with('-')
                && !a.starts_with("--")
                && (a.contains('r') || a.contains('R')))
    });
    if !has_recursive {
        return false;
    }

    args.iter()
        .filter(|a| !a.starts_with('-'))
        .any(|arg| targets_protected_path(arg))
}

fn targets_protected_path(arg: &str) -> bool {
    if arg == "/*" {
        return true;
    }
    let path = arg.trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };
    PROTECTED_PATHS.iter().any(|p| {
        let p = p.trim_end_matches('/');
        let p = if p.is_empty() { "/" } else { p };
        path == p
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_ordinary_commands() {
        assert!(validate("echo hello").is_ok());
        assert!(validate("rm -rf ./build").is_ok());
    }

    #[test]
    fn blocks_fork_bomb() {
        assert!(validate(":(){ :|:& };:").is_err());
    }

    #[test]
    fn blocks_mkfs() {
        assert!(validate("mkfs.ext4 /dev/sda1").is_err());
    }

    #[test]
    fn blocks_rm_rf_root() {
        assert!(validate("rm -rf /").is_err());
    }

    #[test]
    fn blocks_chmod_recursive_on_etc() {
        assert!(validate("chmod -R 777 /etc").is_err());
    }

    #[test]
    fn blocks_dd_to_block_device() {
        assert!(validate("dd if=/dev/zero of=/dev/sda").is_err());
    }
}
