//! Configuration surface the engine recognizes (§6 "Configuration
//! surface"): `api.*`/auth for a registry+lock backend, workspace scope,
//! and target-root URI prefixes. Values are read from environment
//! variables, following the `--flag` / env-var fallback idiom the server
//! binary already used for its database URL.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub api_url: Option<String>,
    pub api_timeout_ms: Option<u64>,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub workspace_id: Option<String>,
    /// target-root-key -> URI prefix.
    pub target_roots: HashMap<String, String>,
}

impl EngineConfig {
    /// Build from the process environment:
    /// `STARDAG_API_URL`, `STARDAG_API_TIMEOUT_MS`, `STARDAG_API_KEY`,
    /// `STARDAG_ACCESS_TOKEN`, `STARDAG_WORKSPACE_ID`, and
    /// `STARDAG_TARGET_ROOT_<KEY>=<uri-prefix>` for each target root.
    pub fn from_env() -> Self {
        let mut target_roots = HashMap::new();
        for (key, value) in std::env::vars() {
            if let Some(root_key) = key.strip_prefix("STARDAG_TARGET_ROOT_") {
                target_roots.insert(root_key.to_lowercase(), value);
            }
        }

        Self {
            api_url: std::env::var("STARDAG_API_URL").ok(),
            api_timeout_ms: std::env::var("STARDAG_API_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok()),
            api_key: std::env::var("STARDAG_API_KEY").ok(),
            access_token: std::env::var("STARDAG_ACCESS_TOKEN").ok(),
            workspace_id: std::env::var("STARDAG_WORKSPACE_ID").ok(),
            target_roots,
        }
    }

    /// Resolve a target-root key to its configured URI prefix.
    pub fn resolve_root(&self, key: &str) -> Option<&str> {
        self.target_roots.get(key).map(String::as_str)
    }
}

/// The current git commit's short SHA, used to tag registered tasks for
/// provenance (ported from `original_source`'s `get_git_commit_hash`).
/// Checks `SHORT_SHA` then `COMMIT_HASH` before falling back to
/// `git rev-parse --short HEAD`, with a `-dirty` suffix appended when
/// `git status --porcelain` reports uncommitted changes. Falls back to
/// `"unknown"` rather than failing a build when the process isn't running
/// from within a git checkout (e.g. a built binary deployed without
/// `.git`, or a sandboxed CI step with a shallow/absent clone) — the
/// original raises in that case, but stardag's build shouldn't hard-fail
/// on missing provenance.
pub fn current_commit_hash() -> String {
    std::env::var("SHORT_SHA")
        .ok()
        .or_else(|| std::env::var("COMMIT_HASH").ok())
        .filter(|s| !s.is_empty())
        .or_else(git_short_sha)
        .unwrap_or_else(|| "unknown".to_string())
}

fn git_short_sha() -> Option<String> {
    let short_sha = std::process::Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())?;

    let dirty = std::process::Command::new("git")
        .args(["status", "--porcelain"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| !o.stdout.is_empty())
        .unwrap_or(false);

    Some(if dirty { format!("{short_sha}-dirty") } else { short_sha })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_sha_env_var_takes_priority_over_commit_hash_env_var() {
        std::env::set_var("SHORT_SHA", "abc1234");
        std::env::set_var("COMMIT_HASH", "should-be-ignored");
        assert_eq!(current_commit_hash(), "abc1234");
        std::env::remove_var("SHORT_SHA");
        std::env::remove_var("COMMIT_HASH");
    }

    #[test]
    fn commit_hash_env_var_is_used_when_short_sha_is_unset() {
        std::env::remove_var("SHORT_SHA");
        std::env::set_var("COMMIT_HASH", "deadbee");
        assert_eq!(current_commit_hash(), "deadbee");
        std::env::remove_var("COMMIT_HASH");
    }
}
