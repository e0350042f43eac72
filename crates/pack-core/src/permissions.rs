//! Declared capability grants and the pure checks the workflow engine runs
//! before any network- or filesystem-affecting step.
//!
//! Network grants are either URL prefixes (`https://api.example.com/v1`) or
//! bare hostnames (`api.example.com`). A hostname grant matches that exact
//! host on any port over http/https; a prefix grant matches on a path
//! boundary, so `https://a.example.com` never admits `https://a.example.com.evil`.
//! Wildcards are not interpreted.

use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub filesystem: FilesystemGrants,
    pub network: NetworkGrants,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemGrants {
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkGrants {
    #[serde(default)]
    pub connect: Vec<String>,
    #[serde(default)]
    pub listen_localhost: bool,
}

/// Resource budget declared by a pack. Carried as data; only the WASM
/// boundary applies `memory_mb` to its store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub memory_mb: u64,
    pub cpu_ms_per_sec: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsMode {
    Read,
    Write,
}

impl fmt::Display for FsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsMode::Read => f.write_str("read"),
            FsMode::Write => f.write_str("write"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

pub struct PermissionEnforcer;

impl PermissionEnforcer {
    pub fn check_network(url: &str, grants: &NetworkGrants) -> Decision {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(err) => return Decision::Denied(format!("`{url}` is not a valid URL: {err}")),
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return Decision::Denied(format!(
                "scheme `{}` is not permitted; only http and https",
                parsed.scheme()
            ));
        }
        let Some(host) = parsed.host_str() else {
            return Decision::Denied(format!("`{url}` has no host"));
        };
        if grants
            .connect
            .iter()
            .any(|grant| network_grant_matches(grant, &parsed, host))
        {
            Decision::Allowed
        } else {
            Decision::Denied(format!("network access to `{host}` is not declared"))
        }
    }

    pub fn check_filesystem(path: &str, mode: FsMode, grants: &FilesystemGrants) -> Decision {
        if let Err(reason) = check_relative_path(path) {
            return Decision::Denied(reason);
        }
        let normalized = path.trim_start_matches("./");
        // A write grant implies read access to the same paths.
        let patterns: Vec<&String> = match mode {
            FsMode::Read => grants.read.iter().chain(grants.write.iter()).collect(),
            FsMode::Write => grants.write.iter().collect(),
        };
        if patterns
            .iter()
            .any(|pattern| glob_matches(pattern.trim_start_matches("./"), normalized))
        {
            Decision::Allowed
        } else {
            Decision::Denied(format!("{mode} access to `{path}` is not declared"))
        }
    }

    pub fn check_listen_localhost(grants: &NetworkGrants) -> Decision {
        if grants.listen_localhost {
            Decision::Allowed
        } else {
            Decision::Denied("listening on localhost is not declared".into())
        }
    }
}

/// Relative, `..`-free path check shared by manifest validation and the enforcer.
pub fn check_relative_path(path: &str) -> Result<(), String> {
    if path.trim().is_empty() {
        return Err("path must not be empty".into());
    }
    if path.starts_with('/') || path.starts_with('\\') || has_drive_prefix(path) {
        return Err(format!("`{path}` must be relative"));
    }
    for component in Path::new(path).components() {
        match component {
            Component::ParentDir => return Err(format!("`{path}` must not contain `..`")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("`{path}` must be relative"));
            }
            _ => {}
        }
    }
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(format!("`{path}` must not contain `..`"));
    }
    Ok(())
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Accepts `http(s)://` URL prefixes and explicit hostnames.
pub fn is_valid_network_grant(grant: &str) -> bool {
    if grant.starts_with("http://") || grant.starts_with("https://") {
        return Url::parse(grant).is_ok_and(|url| url.host_str().is_some());
    }
    is_hostname(grant)
}

fn is_hostname(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 253
        && value.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || ch == '-')
        })
}

fn network_grant_matches(grant: &str, url: &Url, host: &str) -> bool {
    if grant.starts_with("http://") || grant.starts_with("https://") {
        let Ok(prefix) = Url::parse(grant) else {
            return false;
        };
        if prefix.scheme() != url.scheme()
            || prefix.host_str() != Some(host)
            || prefix.port_or_known_default() != url.port_or_known_default()
        {
            return false;
        }
        let prefix_path = prefix.path().trim_end_matches('/');
        let path = url.path();
        return prefix_path.is_empty()
            || path == prefix_path
            || path
                .strip_prefix(prefix_path)
                .is_some_and(|rest| rest.starts_with('/'));
    }
    grant.eq_ignore_ascii_case(host)
}

/// Segment-aware glob: `*` stays inside one segment, `**` spans any number.
fn glob_matches(pattern: &str, path: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match_segments(&pattern, &path)
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| match_segments(rest, &path[skip..])),
        Some((head, rest)) => match path.split_first() {
            Some((segment, tail)) => segment_matches(head, segment) && match_segments(rest, tail),
            None => false,
        },
    }
}

fn segment_matches(pattern: &str, value: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();
    let (mut pi, mut vi) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while vi < v.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == v[vi]) {
            pi += 1;
            vi += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, vi));
            pi += 1;
        } else if let Some((star_pi, star_vi)) = star {
            pi = star_pi + 1;
            vi = star_vi + 1;
            star = Some((star_pi, star_vi + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
