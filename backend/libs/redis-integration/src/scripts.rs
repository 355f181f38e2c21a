//! Content-addressed Lua script cache
//!
//! Scripts are uploaded with `SCRIPT LOAD` and remembered by the path they were
//! read from. The store answers with the SHA-1 of the body, which is what
//! `EVALSHA` takes afterwards.

use crate::connection::ConnectionManager;
use crate::error::ScriptError;
use redis::{FromRedisValue, Value};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Length of a hex-encoded SHA-1 handle
pub const SCRIPT_SHA_LEN: usize = 40;

/// SHA-1 of a script body, as the store computes it
pub fn script_sha1(body: impl AsRef<[u8]>) -> String {
    hex::encode(Sha1::digest(body.as_ref()))
}

/// Identity -> SHA-1 handle for every script uploaded by this instance
#[derive(Debug, Default, Clone)]
pub struct ScriptCache {
    scripts: BTreeMap<String, String>,
}

impl ScriptCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a handle, replacing any previous one for the same identity
    pub fn insert(&mut self, identity: impl Into<String>, sha: impl Into<String>) {
        self.scripts.insert(identity.into(), sha.into());
    }

    pub fn get(&self, identity: &str) -> Option<&str> {
        self.scripts.get(identity).map(String::as_str)
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.scripts.clone()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

/// Upload one script body. `None` when not connected or the reply is not a
/// bulk string; the reason is kept as the manager's last error.
pub fn load_script(manager: &mut ConnectionManager, body: &[u8]) -> Option<String> {
    if !manager.is_connected() {
        manager.set_last_error("Not connected, call connect first");
        return None;
    }
    let conn = manager.connection()?;

    let reply: Value = match redis::cmd("SCRIPT").arg("LOAD").arg(body).query(conn) {
        Ok(reply) => reply,
        Err(err) => {
            manager.set_last_error(format!("SCRIPT LOAD failed: {}", err));
            return None;
        }
    };

    match reply {
        Value::Data(bytes) => match String::from_utf8(bytes) {
            Ok(sha) => Some(sha),
            Err(_) => {
                manager.set_last_error("SCRIPT LOAD returned a non UTF-8 reply");
                None
            }
        },
        other => {
            manager.set_last_error(format!("SCRIPT LOAD returned unexpected reply: {:?}", other));
            None
        }
    }
}

/// Regular files under `path` matching the shell glob `pattern`, in glob order.
///
/// `*`, `?` and `[..]` never match a leading `.` or a `/`, and a leading `~`
/// in `path` is the home directory (`~user` is not resolved).
pub fn script_files(path: &str, pattern: &str) -> Vec<PathBuf> {
    let full_pattern = format!("{}/{}", expand_tilde(path), pattern);
    let options = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };

    let entries = match glob::glob_with(&full_pattern, options) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(pattern = %full_pattern, error = %err, "Invalid script glob pattern");
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| match entry {
            Ok(file) => Some(file),
            Err(err) => {
                debug!(error = %err, "Skipping unreadable glob entry");
                None
            }
        })
        .filter(|file| file.is_file())
        .collect()
}

/// Upload every regular file under `path` matching `pattern` and cache the
/// handles that come back well-formed. Returns how many were cached.
pub fn load_script_dir(
    manager: &mut ConnectionManager,
    cache: &mut ScriptCache,
    path: &str,
    pattern: &str,
) -> usize {
    let mut loaded = 0;
    for file in script_files(path, pattern) {
        let identity = file.to_string_lossy().into_owned();
        let body = match std::fs::read(&file) {
            Ok(body) => body,
            Err(err) => {
                warn!(script = %identity, error = %err, "Failed to read script file");
                continue;
            }
        };

        match load_script(manager, &body) {
            Some(sha) if sha.len() == SCRIPT_SHA_LEN => {
                debug!(script = %identity, sha = %sha, "Script loaded");
                cache.insert(identity, sha);
                loaded += 1;
            }
            other => {
                debug!(script = %identity, reply = ?other, "Script not loaded");
            }
        }
    }

    info!(path = %path, pattern = %pattern, loaded, "Script directory loaded");
    loaded
}

/// Run a cached script with `EVALSHA`
pub fn invoke_script<T: FromRedisValue>(
    manager: &mut ConnectionManager,
    cache: &ScriptCache,
    identity: &str,
    keys: &[&str],
    args: &[&str],
) -> Result<T, ScriptError> {
    let sha = cache
        .get(identity)
        .ok_or_else(|| ScriptError::UnknownScript(identity.to_string()))?;
    let conn = manager.connection().ok_or(ScriptError::NotConnected)?;

    let mut cmd = redis::cmd("EVALSHA");
    cmd.arg(sha).arg(keys.len()).arg(keys).arg(args);
    Ok(cmd.query(conn)?)
}

/// Expand a leading `~` to the home directory
fn expand_tilde(path: &str) -> String {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => return path.to_string(),
    };

    match dirs::home_dir() {
        Some(home) => {
            let mut expanded: PathBuf = home;
            let rest = rest.trim_start_matches('/');
            if !rest.is_empty() {
                expanded.push(Path::new(rest));
            }
            expanded.to_string_lossy().into_owned()
        }
        None => path.to_string(),
    }
}
