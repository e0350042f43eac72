//! The mandatory `pack-<variant>-<target>-<version>.zip` filename grammar.
//!
//! Variant and target are hyphen-separated runs of `[a-z0-9]`; the version is
//! everything between the target and `.zip`. Because both names may contain
//! hyphens, the split is made deterministic:
//!
//! * the version starts at the first segment (third or later) that begins with
//!   a digit, or with `v` followed by a digit;
//! * the target starts at the first later segment naming a platform family
//!   (`android`, `ios`, `linux`, `macos`, `windows`, `universal`), otherwise it
//!   is the last segment before the version.
//!
//! [`construct`] refuses any triple that would not parse back unchanged, so
//! the two functions are inverse over everything `construct` accepts.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PackError, PackResult};

const PREFIX: &str = "pack-";
const SUFFIX: &str = ".zip";
const PLATFORM_FAMILIES: &[&str] = &["android", "ios", "linux", "macos", "windows", "universal"];

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackFileName {
    pub variant: String,
    pub target: String,
    pub version: String,
}

impl PackFileName {
    pub fn file_name(&self) -> String {
        format!(
            "{PREFIX}{}-{}-{}{SUFFIX}",
            self.variant, self.target, self.version
        )
    }
}

impl fmt::Display for PackFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Split a pack filename into its parts, or `None` when it violates the grammar.
pub fn parse(filename: &str) -> Option<PackFileName> {
    let stem = filename.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    let segments: Vec<&str> = stem.split('-').collect();
    let version_at = (2..segments.len()).find(|&idx| is_version_start(segments[idx]))?;
    let head = &segments[..version_at];
    if !head.iter().all(|segment| is_name_segment(segment)) {
        return None;
    }
    let version = segments[version_at..].join("-");
    if !is_version(&version) {
        return None;
    }
    let target_at = (1..head.len())
        .find(|&idx| PLATFORM_FAMILIES.contains(&head[idx]))
        .unwrap_or(head.len() - 1);
    Some(PackFileName {
        variant: head[..target_at].join("-"),
        target: head[target_at..].join("-"),
        version,
    })
}

pub fn is_valid(filename: &str) -> bool {
    parse(filename).is_some()
}

/// Build the canonical filename for a variant, target and version.
pub fn construct(variant: &str, target: &str, version: &str) -> PackResult<String> {
    check_name("variant", variant)?;
    check_name("target", target)?;
    if version.trim().is_empty() {
        return Err(PackError::NamingConvention("version must not be blank".into()));
    }
    if !is_version(version) {
        return Err(PackError::NamingConvention(format!(
            "version `{version}` may only contain lowercase letters, digits, `.`, `+`, `_` and `-`"
        )));
    }
    let expected = PackFileName {
        variant: variant.to_string(),
        target: target.to_string(),
        version: version.to_string(),
    };
    let filename = expected.file_name();
    match parse(&filename) {
        Some(parsed) if parsed == expected => Ok(filename),
        _ => Err(PackError::NamingConvention(format!(
            "`{filename}` would not parse back to variant `{variant}`, target `{target}`, version `{version}`"
        ))),
    }
}

fn check_name(label: &str, value: &str) -> PackResult<()> {
    if value.is_empty() {
        return Err(PackError::NamingConvention(format!("{label} must not be empty")));
    }
    if let Some(bad) = value
        .chars()
        .find(|ch| !(ch.is_ascii_lowercase() || ch.is_ascii_digit() || *ch == '-'))
    {
        return Err(PackError::NamingConvention(format!(
            "{label} `{value}` contains `{bad}`; only [a-z0-9-] is allowed"
        )));
    }
    Ok(())
}

fn is_name_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit())
}

fn is_version_start(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(ch) if ch.is_ascii_digit() => true,
        Some('v') => chars.next().is_some_and(|ch| ch.is_ascii_digit()),
        _ => false,
    }
}

fn is_version(version: &str) -> bool {
    !version.is_empty()
        && version.chars().all(|ch| {
            ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '.' | '+' | '_' | '-')
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_multi_segment_variant_and_target() {
        let parsed = parse("pack-wasm-hello-android-arm64-1.2.0.zip").expect("valid name");
        assert_eq!(parsed.variant, "wasm-hello");
        assert_eq!(parsed.target, "android-arm64");
        assert_eq!(parsed.version, "1.2.0");
    }

    #[test]
    fn version_keeps_hyphens_and_build_metadata() {
        let parsed = parse("pack-demo-universal-0.3.1-rc.1+build7.zip").expect("valid name");
        assert_eq!(parsed.target, "universal");
        assert_eq!(parsed.version, "0.3.1-rc.1+build7");
    }

    #[test]
    fn unknown_platform_takes_last_segment_as_target() {
        let parsed = parse("pack-my-tool-riscv-v2.0.zip").expect("valid name");
        assert_eq!(parsed.variant, "my-tool");
        assert_eq!(parsed.target, "riscv");
        assert_eq!(parsed.version, "v2.0");
    }

    #[test]
    fn rejects_malformed_names() {
        for name in [
            "pack-Demo-universal-1.0.0.zip",
            "pack-demo-universal-1.0.0-RC1.zip",
            "demo-universal-1.0.0.zip",
            "pack-demo-universal-1.0.0.tar.gz",
            "pack-demo-universal-1.0.0.ZIP",
            "pack-demo-1.0.0.zip",
            "pack--universal-1.0.0.zip",
            "pack-demo-universal.zip",
            "",
        ] {
            assert!(!is_valid(name), "{name} should be rejected");
        }
    }

    #[test]
    fn construct_rejects_bad_alphabet_and_blank_version() {
        assert!(matches!(
            construct("Demo", "universal", "1.0"),
            Err(PackError::NamingConvention(_))
        ));
        assert!(matches!(
            construct("demo", "android_arm64", "1.0"),
            Err(PackError::NamingConvention(_))
        ));
        assert!(matches!(
            construct("demo", "universal", "   "),
            Err(PackError::NamingConvention(_))
        ));
    }

    #[test]
    fn construct_rejects_ambiguous_split() {
        // `android` inside the variant would be read back as the target start.
        assert!(construct("my-android-app", "universal", "1.0.0").is_err());
    }

    #[test]
    fn construct_builds_canonical_name() {
        assert_eq!(
            construct("wasm-hello", "android-arm64", "1.0.0").unwrap(),
            "pack-wasm-hello-android-arm64-1.0.0.zip"
        );
    }

    proptest! {
        #[test]
        fn construct_then_parse_is_identity(
            variant in "[b-h][a-z0-9]{0,5}(-[b-h][a-z0-9]{0,5})?",
            target in "(android|linux|universal)(-[a-u][a-z0-9]{0,5})?",
            version in "[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}(-[a-z0-9.]{1,6})?(\\+[a-z0-9]{1,6})?",
        ) {
            let filename = construct(&variant, &target, &version).expect("accepted input");
            let parsed = parse(&filename).expect("constructed name parses");
            prop_assert_eq!(parsed.variant, variant);
            prop_assert_eq!(parsed.target, target);
            prop_assert_eq!(parsed.version, version);
        }

        #[test]
        fn accepted_triples_always_round_trip(
            variant in "[a-z0-9-]{1,12}",
            target in "[a-z0-9-]{1,12}",
            version in "[a-z0-9.+-]{1,10}",
        ) {
            if let Ok(filename) = construct(&variant, &target, &version) {
                let parsed = parse(&filename).expect("constructed name parses");
                prop_assert_eq!((parsed.variant, parsed.target, parsed.version), (variant, target, version));
            }
        }
    }
}
