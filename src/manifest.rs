//! Flatpak manifest loading and in-place mutation.
//!
//! The manifest is a YAML (or JSON — `serde_yaml` parses both) document.
//! This module treats it as an opaque mapping: recognised keys are surfaced
//! as typed accessors, everything else round-trips verbatim. Parsing the
//! document structure and preserving comments/formatting on write is the
//! concern of an external dumper in the real system; here we keep key
//! insertion order via `serde_yaml::Mapping` but don't attempt comment
//! preservation.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde_yaml::Value;

/// One `name/arch/branch` triple, e.g. an SDK reference or an `ExtensionOf` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefTriple {
    pub name: String,
    pub arch: String,
    pub branch: String,
}

impl RefTriple {
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 3 {
            return None;
        }
        Some(RefTriple {
            name: parts[0].to_owned(),
            arch: parts[1].to_owned(),
            branch: parts[2].to_owned(),
        })
    }
}

/// An `add-extensions` / `add-build-extensions` entry: `{version?, versions?}`.
#[derive(Debug, Clone, Default)]
pub struct ExtensionPointSpec {
    pub version: Option<String>,
    pub versions: Option<String>,
}

impl ExtensionPointSpec {
    /// `version` (if set) plus the `;`-split contents of `versions`.
    pub fn all_versions(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(v) = &self.version {
            out.push(v.clone());
        }
        if let Some(vs) = &self.versions {
            out.extend(vs.split(';').filter(|s| !s.is_empty()).map(str::to_owned));
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    raw: Value,

    pub app_id: Option<String>,
    pub runtime: Option<String>,
    pub runtime_version: Option<String>,
    pub base: Option<String>,
    pub base_version: Option<String>,
    /// Raw `sdk` value: bare name, or `name/arch/branch` triple.
    pub sdk: Option<String>,
    pub branch: Option<String>,
    pub default_branch: Option<String>,

    pub add_extensions: BTreeMap<String, ExtensionPointSpec>,
    pub add_build_extensions: BTreeMap<String, ExtensionPointSpec>,

    pub sdk_extensions: Vec<String>,
    pub platform_extensions: Vec<String>,
    pub inherit_extensions: Vec<String>,
    pub inherit_sdk_extensions: Vec<String>,
    pub base_extensions: Vec<String>,
}

impl Manifest {
    pub fn parse_str(contents: &str) -> Result<Self> {
        let raw: Value = serde_yaml::from_str(contents).context("failed to parse manifest")?;
        Self::from_value(raw)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        Self::parse_str(&contents)
    }

    fn from_value(raw: Value) -> Result<Self> {
        let mapping = raw
            .as_mapping()
            .ok_or_else(|| anyhow!("manifest root is not a mapping"))?;

        let get_str = |key: &str| -> Option<String> {
            mapping
                .get(Value::String(key.to_owned()))
                .and_then(|v| v.as_str())
                .map(str::to_owned)
        };

        let get_list = |key: &str| -> Vec<String> {
            mapping
                .get(Value::String(key.to_owned()))
                .and_then(|v| v.as_sequence())
                .map(|seq| {
                    seq.iter()
                        .filter_map(|item| item.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default()
        };

        let get_extension_dict = |key: &str| -> BTreeMap<String, ExtensionPointSpec> {
            let mut out = BTreeMap::new();
            if let Some(Value::Mapping(m)) = mapping.get(Value::String(key.to_owned())) {
                for (k, v) in m {
                    let name = match k.as_str() {
                        Some(s) => s.to_owned(),
                        None => continue,
                    };
                    let spec = if let Value::Mapping(inner) = v {
                        ExtensionPointSpec {
                            version: inner
                                .get(Value::String("version".to_owned()))
                                .and_then(|v| v.as_str())
                                .map(str::to_owned),
                            versions: inner
                                .get(Value::String("versions".to_owned()))
                                .and_then(|v| v.as_str())
                                .map(str::to_owned),
                        }
                    } else {
                        ExtensionPointSpec::default()
                    };
                    out.insert(name, spec);
                }
            }
            out
        };

        let app_id = get_str("id").or_else(|| get_str("app-id"));

        Ok(Manifest {
            raw,
            app_id,
            runtime: get_str("runtime"),
            runtime_version: get_str("runtime-version"),
            base: get_str("base"),
            base_version: get_str("base-version"),
            sdk: get_str("sdk"),
            branch: get_str("branch"),
            default_branch: get_str("default-branch"),
            add_extensions: get_extension_dict("add-extensions"),
            add_build_extensions: get_extension_dict("add-build-extensions"),
            sdk_extensions: get_list("sdk-extensions"),
            platform_extensions: get_list("platform-extensions"),
            inherit_extensions: get_list("inherit-extensions"),
            inherit_sdk_extensions: get_list("inherit-sdk-extensions"),
            base_extensions: get_list("base-extensions"),
        })
    }

    /// The SDK as a parsed triple, only when explicitly given as `name/arch/branch`.
    pub fn sdk_triple(&self) -> Option<RefTriple> {
        self.sdk.as_deref().and_then(RefTriple::parse)
    }

    /// Apply a set of top-level string key/value changes and write the
    /// manifest back to `path`. Mirrors the source's `update()`, which only
    /// ever mutates `runtime-version` and `base-version` despite computing
    /// many more proposals (see DESIGN.md Open Question 2).
    pub fn apply_and_write(&mut self, changes: &BTreeMap<String, String>, path: &Path) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mapping = self
            .raw
            .as_mapping_mut()
            .ok_or_else(|| anyhow!("manifest root is not a mapping"))?;
        for (key, value) in changes {
            mapping.insert(Value::String(key.clone()), Value::String(value.clone()));
        }
        let serialized = serde_yaml::to_string(&self.raw).context("failed to serialize manifest")?;
        std::fs::write(path, serialized)
            .with_context(|| format!("failed to write manifest {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
id: org.example.App
runtime: org.freedesktop.Platform
runtime-version: "20.08"
sdk: org.freedesktop.Sdk
base: org.chromium.Chromium.BaseApp
base-version: "20.08"
branch: "20.08"
add-extensions:
  org.example.App.Plugin:
    version: "1.0"
    versions: "1.0;1.1"
sdk-extensions:
  - org.freedesktop.Sdk.Extension.rust-stable
"#;

    #[test]
    fn parses_recognised_keys() {
        let m = Manifest::parse_str(SAMPLE).unwrap();
        assert_eq!(m.app_id.as_deref(), Some("org.example.App"));
        assert_eq!(m.runtime.as_deref(), Some("org.freedesktop.Platform"));
        assert_eq!(m.runtime_version.as_deref(), Some("20.08"));
        assert_eq!(m.base.as_deref(), Some("org.chromium.Chromium.BaseApp"));
        assert_eq!(m.sdk_extensions, vec!["org.freedesktop.Sdk.Extension.rust-stable"]);
        let ext = m.add_extensions.get("org.example.App.Plugin").unwrap();
        assert_eq!(ext.all_versions(), vec!["1.0", "1.0", "1.1"]);
    }

    #[test]
    fn apply_and_write_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let mut m = Manifest::load(&path).unwrap();
        let mut changes = BTreeMap::new();
        changes.insert("runtime-version".to_owned(), "21.08".to_owned());
        m.apply_and_write(&changes, &path).unwrap();

        let reloaded = Manifest::load(&path).unwrap();
        assert_eq!(reloaded.runtime_version.as_deref(), Some("21.08"));
        // Unrelated keys survive the round trip.
        assert_eq!(reloaded.base.as_deref(), Some("org.chromium.Chromium.BaseApp"));
    }

    #[test]
    fn ref_triple_parses_three_parts() {
        let t = RefTriple::parse("org.freedesktop.Sdk/x86_64/21.08").unwrap();
        assert_eq!(t.name, "org.freedesktop.Sdk");
        assert_eq!(t.arch, "x86_64");
        assert_eq!(t.branch, "21.08");
        assert!(RefTriple::parse("org.freedesktop.Sdk").is_none());
    }
}
