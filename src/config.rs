//! Process-wide configuration read from the environment once at startup.
//!
//! Mirrors the teacher's `AGENTSH_STRIP_ENV` pattern: a `LazyLock`-cached
//! value read lazily on first use, so tests that set the var before calling
//! in still observe it, while production only pays the parse cost once.

use std::collections::HashSet;
use std::sync::LazyLock;

/// Default max aggregated output retained per session, in characters.
const DEFAULT_MAX_OUTPUT_CHARS: usize = 30_000;
const MAX_OUTPUT_CHARS_MIN: usize = 1_000;
const MAX_OUTPUT_CHARS_MAX: usize = 150_000;

/// Default yield window in milliseconds, used when a caller doesn't specify one.
pub const DEFAULT_YIELD_MS: u64 = 20_000;
const YIELD_MS_MIN: u64 = 10;
const YIELD_MS_MAX: u64 = 120_000;

/// Default retention window for finished sessions before the TTL sweeper
/// drops them, matching the teacher's `COMPLETED_TTL`.
pub const DEFAULT_JOB_TTL_MS: u64 = 30 * 60 * 1000;

/// Maximum aggregated output characters retained per session.
///
/// Configurable via `PI_BASH_MAX_OUTPUT_CHARS`, clamped to [1000, 150000];
/// falls back to a sane default on an unset or unparsable value.
#[must_use]
pub fn max_output_chars() -> usize {
    static VALUE: LazyLock<usize> = LazyLock::new(|| {
        std::env::var("PI_BASH_MAX_OUTPUT_CHARS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&v| v > 0)
            .map(|v: usize| v.clamp(MAX_OUTPUT_CHARS_MIN, MAX_OUTPUT_CHARS_MAX))
            .unwrap_or(DEFAULT_MAX_OUTPUT_CHARS)
    });
    *VALUE
}

/// Default yield window, overridable via `PI_BASH_YIELD_MS`, clamped to
/// [10, 120000]. Per-call `yield_ms` parameters still take precedence.
#[must_use]
pub fn default_yield_ms() -> u64 {
    static VALUE: LazyLock<u64> = LazyLock::new(|| {
        std::env::var("PI_BASH_YIELD_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&v| v > 0)
            .map(|v: u64| v.clamp(YIELD_MS_MIN, YIELD_MS_MAX))
            .unwrap_or(DEFAULT_YIELD_MS)
    });
    *VALUE
}

/// Returns the set of env var names to strip from spawned children.
///
/// By default children inherit the full environment bashd itself runs
/// with. Set `BASHD_STRIP_ENV` to a comma-separated list of names to strip
/// explicitly, e.g. `BASHD_STRIP_ENV=OPENAI_API_KEY,DATABASE_URL`.
fn stripped_env_vars() -> &'static HashSet<String> {
    static STRIPPED: LazyLock<HashSet<String>> = LazyLock::new(|| {
        std::env::var("BASHD_STRIP_ENV")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect()
    });
    &STRIPPED
}

/// True if an environment variable should be stripped from child processes.
#[must_use]
pub fn is_stripped(name: &str) -> bool {
    let stripped = stripped_env_vars();
    if stripped.is_empty() {
        return false;
    }
    stripped.contains(&name.to_uppercase())
}

/// Build the environment map for a spawned child: the current process's
/// environment, minus any names listed in `BASHD_STRIP_ENV`, overlaid with
/// caller-supplied overrides.
#[must_use]
pub fn build_child_env(
    overlay: Option<&std::collections::HashMap<String, String>>,
) -> std::collections::HashMap<String, String> {
    let mut env: std::collections::HashMap<String, String> = std::env::vars()
        .filter(|(k, _)| !is_stripped(k))
        .collect();
    if let Some(overlay) = overlay {
        for (k, v) in overlay {
            env.insert(k.clone(), v.clone());
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_stripped_is_false_when_unset() {
        assert!(!is_stripped("SOME_RANDOM_VAR_NOT_IN_THE_LIST"));
    }

    #[test]
    fn build_child_env_applies_overlay() {
        let mut overlay = std::collections::HashMap::new();
        overlay.insert("TERM".to_string(), "dumb".to_string());
        let env = build_child_env(Some(&overlay));
        assert_eq!(env.get("TERM"), Some(&"dumb".to_string()));
    }
}
