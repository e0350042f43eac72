use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Parsed `checksums.sha256`: filename to lowercase hex digest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumSet {
    entries: BTreeMap<String, String>,
}

impl ChecksumSet {
    pub fn get(&self, filename: &str) -> Option<&str> {
        self.entries.get(filename).map(String::as_str)
    }

    pub fn insert(&mut self, filename: impl Into<String>, hex: &str) {
        self.entries.insert(filename.into(), hex.to_ascii_lowercase());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.entries
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash a stream without buffering it whole.
pub fn sha256_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    sha256_reader(File::open(path)?)
}

pub fn verify_bytes(bytes: &[u8], expected_hex: &str) -> bool {
    digests_match(&sha256_hex(bytes), expected_hex)
}

pub fn verify(path: &Path, expected_hex: &str) -> io::Result<bool> {
    Ok(digests_match(&sha256_file(path)?, expected_hex))
}

pub fn digests_match(actual: &str, expected: &str) -> bool {
    actual.trim().eq_ignore_ascii_case(expected.trim())
}

/// Parse `sha256sum`-style output.
///
/// Lines are `<hex><whitespace>+<filename>`; a leading `*` on the filename
/// (binary-mode marker) is dropped. Blank lines and `#` comments are skipped.
pub fn parse_checksum_file(text: &str) -> ChecksumSet {
    let mut set = ChecksumSet::default();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((digest, rest)) = line.split_once(char::is_whitespace) else {
            warn!(line = lineno + 1, "checksum line has no filename; skipping");
            continue;
        };
        let filename = rest.trim_start();
        let filename = filename.strip_prefix('*').unwrap_or(filename);
        if filename.is_empty() || !digest.chars().all(|ch| ch.is_ascii_hexdigit()) {
            warn!(line = lineno + 1, "malformed checksum line; skipping");
            continue;
        }
        set.insert(filename, digest);
    }
    set
}
