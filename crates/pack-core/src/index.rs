//! `packs.index.json`: the production index mapping (variant, target) to the
//! release asset that must be downloaded. Resolution never guesses: a pair the
//! index does not list is an error, not a fallback to some other asset.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PackError, PackResult};

pub const INDEX_FILE: &str = "packs.index.json";
const VERSION_PLACEHOLDER: &str = "{version}";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackIndex {
    pub default_variant: String,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetPreference>,
    #[serde(default)]
    pub variants: BTreeMap<String, VariantEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPreference {
    #[serde(default)]
    pub preferred: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantEntry {
    #[serde(default)]
    pub targets: BTreeMap<String, AssetEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEntry {
    pub asset: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub variant: String,
    pub target: String,
    pub asset: String,
}

/// Device capability probe used to walk a platform's preference list.
pub trait TargetProbe {
    fn supports(&self, target: &str) -> bool;
}

/// Probe backed by the ABI list a device reports (e.g. `arm64-v8a`).
#[derive(Clone, Debug, Default)]
pub struct DeviceProfile {
    pub platform: String,
    pub abis: Vec<String>,
}

impl DeviceProfile {
    pub fn new(platform: impl Into<String>, abis: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            platform: platform.into(),
            abis: abis.into_iter().map(Into::into).collect(),
        }
    }

    fn arch_tokens(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.abis.iter().filter_map(|abi| match abi.as_str() {
            "arm64-v8a" | "arm64" | "aarch64" => Some("arm64"),
            "armeabi-v7a" | "armv7" => Some("armv7"),
            "x86_64" | "x86-64" | "amd64" => Some("x64"),
            "x86" | "i686" => Some("x86"),
            _ => None,
        })
    }
}

impl TargetProbe for DeviceProfile {
    fn supports(&self, target: &str) -> bool {
        if is_universal(target) {
            return true;
        }
        let Some(arch) = target
            .strip_prefix(self.platform.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
        else {
            return false;
        };
        self.arch_tokens().any(|token| token == arch)
    }
}

fn is_universal(target: &str) -> bool {
    target == "universal" || target.ends_with("-universal")
}

impl PackIndex {
    pub fn from_json_str(raw: &str) -> PackResult<Self> {
        serde_json::from_str(raw)
            .map_err(|err| PackError::IndexResolution(format!("{INDEX_FILE} is malformed: {err}")))
    }

    /// `variants[variant].targets[target].asset` with `{version}` substituted.
    pub fn resolve_asset(&self, variant: &str, target: &str, version: &str) -> PackResult<String> {
        let variant_entry = self.variants.get(variant).ok_or_else(|| {
            PackError::IndexResolution(format!("variant `{variant}` is not listed"))
        })?;
        let asset = variant_entry.targets.get(target).ok_or_else(|| {
            PackError::IndexResolution(format!(
                "variant `{variant}` has no asset for target `{target}`"
            ))
        })?;
        if !asset.asset.contains(VERSION_PLACEHOLDER) {
            return Err(PackError::IndexResolution(format!(
                "asset template `{}` for {variant}/{target} lacks {VERSION_PLACEHOLDER}",
                asset.asset
            )));
        }
        if version.trim().is_empty() {
            return Err(PackError::IndexResolution("version must not be blank".into()));
        }
        Ok(asset.asset.replace(VERSION_PLACEHOLDER, version))
    }

    /// First entry of the platform's preference list the probe supports.
    pub fn select_target(&self, platform: &str, probe: &dyn TargetProbe) -> PackResult<String> {
        let preference = self.targets.get(platform).ok_or_else(|| {
            PackError::IndexResolution(format!("platform `{platform}` has no target preferences"))
        })?;
        preference
            .preferred
            .iter()
            .find(|target| probe.supports(target))
            .cloned()
            .ok_or_else(|| {
                PackError::IndexResolution(format!(
                    "no preferred target for `{platform}` is supported by this device"
                ))
            })
    }

    /// Select a target for the device and resolve the asset name. `variant`
    /// defaults to the index's `default_variant`.
    pub fn resolve(
        &self,
        variant: Option<&str>,
        platform: &str,
        probe: &dyn TargetProbe,
        version: &str,
    ) -> PackResult<ResolvedAsset> {
        let variant = variant.unwrap_or(&self.default_variant).to_string();
        let target = self.select_target(platform, probe)?;
        let asset = self.resolve_asset(&variant, &target, version)?;
        Ok(ResolvedAsset {
            variant,
            target,
            asset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> PackIndex {
        PackIndex::from_json_str(
            r#"{
                "default_variant": "wasm-hello",
                "targets": {
                    "android": { "preferred": ["android-arm64", "universal"] }
                },
                "variants": {
                    "wasm-hello": {
                        "targets": {
                            "android-arm64": { "asset": "pack-wasm-hello-android-arm64-{version}.zip" },
                            "universal": { "asset": "pack-wasm-hello-universal-{version}.zip" }
                        }
                    },
                    "broken": {
                        "targets": { "universal": { "asset": "pack-broken-universal.zip" } }
                    }
                }
            }"#,
        )
        .expect("index parses")
    }

    #[test]
    fn arm64_device_prefers_native_target() {
        let device = DeviceProfile::new("android", ["arm64-v8a", "armeabi-v7a"]);
        let resolved = index().resolve(None, "android", &device, "1.2.0").unwrap();
        assert_eq!(resolved.variant, "wasm-hello");
        assert_eq!(resolved.target, "android-arm64");
        assert_eq!(resolved.asset, "pack-wasm-hello-android-arm64-1.2.0.zip");
    }

    #[test]
    fn other_abi_falls_to_universal_entry() {
        let device = DeviceProfile::new("android", ["x86_64"]);
        let target = index().select_target("android", &device).unwrap();
        assert_eq!(target, "universal");
    }

    #[test]
    fn unknown_pairs_are_hard_errors() {
        let index = index();
        assert!(matches!(
            index.resolve_asset("missing", "universal", "1.0.0"),
            Err(PackError::IndexResolution(_))
        ));
        assert!(matches!(
            index.resolve_asset("wasm-hello", "ios-arm64", "1.0.0"),
            Err(PackError::IndexResolution(_))
        ));
        assert!(matches!(
            index.select_target("ios", &DeviceProfile::new("ios", ["arm64"])),
            Err(PackError::IndexResolution(_))
        ));
    }

    #[test]
    fn template_without_placeholder_is_rejected() {
        assert!(index().resolve_asset("broken", "universal", "1.0.0").is_err());
    }
}
