//! Remote catalog reader: wraps `flatpak remote-add` / `remote-ls` /
//! `remote-info --show-metadata`.

use std::path::Path;

use crate::errors::CatalogError;
use crate::manifest::RefTriple;
use crate::process::ProcessRunner;

/// One row of `flatpak remote-ls --columns=application,branch,runtime`.
///
/// A runtime has no target (2 tab-separated fields); a base application or
/// extension carries the `runtime/arch/branch` it targets (3 fields).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub branch: String,
    pub target: Option<RefTriple>,
}

/// The line-oriented metadata block for one `name//version` ref.
#[derive(Debug, Clone, Default)]
pub struct RefMetadata(pub Vec<String>);

impl RefMetadata {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

pub struct RemoteCatalog {
    runner: ProcessRunner,
    remote_name: String,
}

impl RemoteCatalog {
    pub fn new(remote_name: impl Into<String>) -> Self {
        RemoteCatalog {
            runner: ProcessRunner::new(),
            remote_name: remote_name.into(),
        }
    }

    /// `flatpak remote-add --if-not-exists <name> <url>`. Idempotent:
    /// re-invocation must not fail.
    pub async fn ensure_remote(&self, url: &str) -> Result<(), CatalogError> {
        self.runner
            .run(
                "flatpak",
                ["remote-add", "--if-not-exists", &self.remote_name, url],
                None,
            )
            .await?;
        Ok(())
    }

    /// `flatpak remote-ls <name> --all --system --columns=application,branch,runtime`.
    pub async fn list_refs(&self) -> Result<Vec<RemoteEntry>, CatalogError> {
        let output = self
            .runner
            .run(
                "flatpak",
                [
                    "remote-ls",
                    &self.remote_name,
                    "--all",
                    "--system",
                    "--columns=application,branch,runtime",
                ],
                None,
            )
            .await?;
        Self::parse_refs(&output.stdout_lines())
    }

    fn parse_refs(lines: &[String]) -> Result<Vec<RemoteEntry>, CatalogError> {
        let mut out = Vec::with_capacity(lines.len());
        for line in lines {
            let fields: Vec<&str> = line.split('\t').collect();
            match fields.len() {
                2 => out.push(RemoteEntry {
                    name: fields[0].to_owned(),
                    branch: fields[1].to_owned(),
                    target: None,
                }),
                3 => {
                    let target = if fields[2].is_empty() {
                        None
                    } else {
                        RefTriple::parse(fields[2])
                    };
                    out.push(RemoteEntry {
                        name: fields[0].to_owned(),
                        branch: fields[1].to_owned(),
                        target,
                    });
                }
                n => {
                    return Err(CatalogError::MalformedRow(
                        n,
                        fields.into_iter().map(str::to_owned).collect(),
                    ))
                }
            }
        }
        Ok(out)
    }

    /// `flatpak remote-info <name> --system <name>//<version> --show-metadata`.
    /// On tool failure, returns empty metadata rather than an error: the
    /// caller treats "no metadata" as "ref unknown or self-defined".
    pub async fn get_ref_metadata(&self, name: &str, version: &str) -> RefMetadata {
        let ref_spec = format!("{name}//{version}");
        match self
            .runner
            .run(
                "flatpak",
                [
                    "remote-info",
                    &self.remote_name,
                    "--system",
                    &ref_spec,
                    "--show-metadata",
                ],
                None,
            )
            .await
        {
            Ok(output) => RefMetadata(output.stdout_lines()),
            Err(err) => {
                log::warn!("could not find {ref_spec} in {}: {err}", self.remote_name);
                RefMetadata::default()
            }
        }
    }
}

/// Parse the metadata cache-file test fixture format used in
/// `examples/original_source` (`tests/test_runtimechecker_cache`): the
/// printable representation of a mapping from `"<name>//<version>"` to a
/// list of metadata lines.
pub fn load_cache_fixture(path: &Path) -> anyhow::Result<Vec<(String, Vec<String>)>> {
    let contents = std::fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&contents)?;
    let map = parsed
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("cache fixture is not an object"))?;
    let mut out = Vec::with_capacity(map.len());
    for (key, value) in map {
        let lines = value
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        out.push((key.clone(), lines));
    }
    Ok(out)
}
