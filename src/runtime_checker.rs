//! RuntimeChecker: computes a consistent proposal for bumping the
//! runtime / base / SDK / extension-point versions declared in a manifest,
//! or records why no consistent bump exists.
//!
//! Ported from `examples/original_source/src/specialcheckers/runtimechecker.py`.
//! See DESIGN.md for the handful of places this port's behavior was chosen
//! over a literal (but invariant-violating, or simply unwritten) reading of
//! that source.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use crate::catalog::RemoteCatalog;
use crate::errors::CatalogError;
use crate::manifest::{ExtensionPointSpec, Manifest, RefTriple};
use crate::metadata_cache::MetadataCache;
use crate::process::ProcessRunner;
use crate::rules;

/// An opaque, always-non-empty reason a bump could not be computed.
/// The Python source assigns both bare strings and tuples to this field;
/// both collapse to a formatted string here (DESIGN.md Open Question 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectionReason(pub String);

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy)]
enum ExtTarget {
    Add,
    AddBuild,
}

#[derive(Default, Clone)]
struct VersionLookup {
    latest: Option<String>,
    older: BTreeMap<String, String>,
    latest_target: Option<RefTriple>,
}

struct ExtVersions {
    latest: Option<String>,
    extension_core: (String, String),
    older: BTreeMap<String, String>,
    is_self_defined: bool,
}

pub struct RuntimeChecker {
    runner: ProcessRunner,
    catalog: RemoteCatalog,
    cache: MetadataCache,
    refs: Vec<crate::catalog::RemoteEntry>,
    app_id: Option<String>,
    found_extension_points: HashMap<String, String>,

    pub cannot_update_reason: Option<RejectionReason>,
    pub latest_runtime_version: Option<String>,
    pub latest_base_version: Option<String>,
    pub latest_sdk: Option<String>,
    pub add_extensions: BTreeMap<String, String>,
    pub add_build_extensions: BTreeMap<String, String>,
    pub sdk_extensions: BTreeMap<String, String>,
    pub platform_extensions: BTreeMap<String, String>,
    pub inherit_extensions: BTreeMap<String, String>,
    pub inherit_sdk_extensions: BTreeMap<String, String>,
    pub base_extensions: BTreeMap<String, String>,
    pub branch: Option<String>,
    pub default_branch: Option<String>,
    remote_url: String,
}

const FLATHUB_URL: &str = "https://flathub.org/repo/flathub.flatpakrepo";

impl RuntimeChecker {
    pub fn new(remote_name: impl Into<String>) -> Self {
        RuntimeChecker {
            runner: ProcessRunner::new(),
            catalog: RemoteCatalog::new(remote_name),
            cache: MetadataCache::new(),
            refs: Vec::new(),
            remote_url: FLATHUB_URL.to_owned(),
            app_id: None,
            found_extension_points: HashMap::new(),
            cannot_update_reason: None,
            latest_runtime_version: None,
            latest_base_version: None,
            latest_sdk: None,
            add_extensions: BTreeMap::new(),
            add_build_extensions: BTreeMap::new(),
            sdk_extensions: BTreeMap::new(),
            platform_extensions: BTreeMap::new(),
            inherit_extensions: BTreeMap::new(),
            inherit_sdk_extensions: BTreeMap::new(),
            base_extensions: BTreeMap::new(),
            branch: None,
            default_branch: None,
        }
    }

    /// Pre-fill the metadata cache, e.g. from a test fixture
    /// (`crate::catalog::load_cache_fixture`).
    pub fn with_metadata_cache(mut self, cache: MetadataCache) -> Self {
        self.cache = cache;
        self
    }

    /// Override the repo file URL registered for the remote name given to
    /// [`RuntimeChecker::new`] (defaults to Flathub's).
    pub fn with_remote_url(mut self, url: impl Into<String>) -> Self {
        self.remote_url = url.into();
        self
    }

    fn reset(&mut self) {
        self.app_id = None;
        self.found_extension_points.clear();
        self.cannot_update_reason = None;
        self.latest_runtime_version = None;
        self.latest_base_version = None;
        self.latest_sdk = None;
        self.add_extensions.clear();
        self.add_build_extensions.clear();
        self.sdk_extensions.clear();
        self.platform_extensions.clear();
        self.inherit_extensions.clear();
        self.inherit_sdk_extensions.clear();
        self.base_extensions.clear();
        self.branch = None;
        self.default_branch = None;
    }

    /// Runs the full check. `manifest_dir` is where `git branch
    /// --show-current` is evaluated (spec.md §4.4.3). `refs`, when
    /// supplied, bypasses the live catalog entirely (used by tests and by
    /// callers that already loaded the catalog for the submodule check).
    ///
    /// The only error this can return is a fatal catalog-arity fault
    /// (spec.md §7); every other rejection is recorded in
    /// `cannot_update_reason`, never raised.
    pub async fn check(
        &mut self,
        manifest: &Manifest,
        is_app: bool,
        manifest_dir: &Path,
        refs: Option<Vec<crate::catalog::RemoteEntry>>,
    ) -> Result<(), CatalogError> {
        self.reset();
        if !is_app {
            return Ok(());
        }

        self.app_id = manifest.app_id.clone();

        let runtime = manifest.runtime.clone();
        let runtime_version = manifest.runtime_version.clone();
        let base = manifest.base.clone();
        let base_version = manifest.base_version.clone();

        if runtime.is_some() != runtime_version.is_some() {
            log::error!("manifest has `runtime` without `runtime-version`, or vice versa");
            return Ok(());
        }
        if base.is_some() != base_version.is_some() {
            log::error!("manifest has `base` without `base-version`, or vice versa");
            return Ok(());
        }
        if runtime.is_none() && base.is_none() {
            log::info!("No runtime versions to check");
            return Ok(());
        }

        if let Some(locked_branch) = self.check_branch_lock(manifest_dir).await {
            let reason = format!(
                "Will not check for runtime updates since on a Flathub defined, runtime version locked branch: {locked_branch}"
            );
            log::info!("{reason}");
            self.cannot_update_reason = Some(RejectionReason(reason));
            return Ok(());
        }

        self.refs = match refs {
            Some(r) => r,
            None => {
                if let Err(err) = self.catalog.ensure_remote(&self.remote_url).await {
                    log::warn!("could not add remote: {err}");
                }
                self.catalog.list_refs().await?
            }
        };

        let runtime_lookup = match (&runtime, &runtime_version) {
            (Some(r), Some(v)) => get_versions(&self.refs, r, Some(v)),
            _ => VersionLookup::default(),
        };
        let base_lookup = match (&base, &base_version) {
            (Some(b), Some(v)) => get_versions(&self.refs, b, Some(v)),
            _ => VersionLookup::default(),
        };

        let runtime_update_available =
            version_is_newer(runtime_lookup.latest.as_deref(), runtime_version.as_deref());
        let base_update_available =
            version_is_newer(base_lookup.latest.as_deref(), base_version.as_deref());

        if base.is_some() {
            let runtime_fdo = match (&runtime, &runtime_lookup.latest) {
                (Some(r), Some(v)) => self.freedesktop_target(r, v).await,
                _ => String::new(),
            };
            let base_fdo = match &base_lookup.latest_target {
                Some(t) => self.freedesktop_target(&t.name, &t.branch).await,
                None => String::new(),
            };

            if !base_fdo.is_empty() && !runtime_fdo.is_empty() && runtime_fdo == base_fdo {
                self.latest_runtime_version = runtime_lookup.latest.clone();
                self.latest_base_version = if base_update_available {
                    base_lookup.latest.clone()
                } else {
                    None
                };
            } else {
                self.set_rejection(
                    "could not find matching base for latest runtime version".to_owned(),
                );
            }
        } else if runtime_update_available {
            self.latest_runtime_version = runtime_lookup.latest.clone();
        } else {
            // Terminal: nothing to propose, and nothing further to validate
            // against (DESIGN.md Open Question 6).
            self.set_rejection("No new runtime available".to_owned());
            return Ok(());
        }

        // SDK side-check: independently resolve an explicitly pinned SDK version.
        if let Some(triple) = manifest.sdk_triple() {
            if !triple.branch.is_empty() {
                let sdk_lookup = get_versions(&self.refs, &triple.name, Some(&triple.branch));
                if let (Some(sdk_latest), Some(r), Some(rv_latest)) =
                    (&sdk_lookup.latest, &runtime, &runtime_lookup.latest)
                {
                    let sdk_fdo = self.freedesktop_target(&triple.name, sdk_latest).await;
                    let runtime_fdo = self.freedesktop_target(r, rv_latest).await;
                    if sdk_fdo == runtime_fdo {
                        self.latest_sdk = Some(sdk_latest.clone());
                        self.cannot_update_reason = None;
                    }
                }
            }
        }

        let (sdk_ref, sdk_ref_version, sdk_latest) = if let Some(latest_sdk) = self.latest_sdk.clone() {
            let triple = manifest.sdk_triple().expect("latest_sdk only set when sdk_triple is Some");
            (triple.name, triple.branch, Some(latest_sdk))
        } else {
            (
                runtime.clone().unwrap_or_default(),
                runtime_version.clone().unwrap_or_default(),
                runtime_lookup.latest.clone(),
            )
        };

        // Invariant 1 (spec.md §3, §8): once a rejection is recorded, both
        // extension-point maps must stay empty. The Python source achieves
        // this for free by iterating the already-blanked `self.*` dicts; the
        // equivalent here is to not run these passes at all once rejected.
        if self.cannot_update_reason.is_none() {
            self.check_add_extensions(&manifest.add_extensions, ExtTarget::Add, &sdk_ref, sdk_latest.as_deref())
                .await;
            self.check_add_extensions(
                &manifest.add_build_extensions,
                ExtTarget::AddBuild,
                &sdk_ref,
                sdk_latest.as_deref(),
            )
            .await;
        }

        self.sdk_extensions = self
            .check_extensions(
                &manifest.sdk_extensions,
                &sdk_ref,
                &sdk_ref_version,
                sdk_latest.as_deref(),
                None,
                None,
                false,
            )
            .await;
        self.platform_extensions = self
            .check_extensions(
                &manifest.platform_extensions,
                &sdk_ref,
                &sdk_ref_version,
                sdk_latest.as_deref(),
                None,
                None,
                false,
            )
            .await;
        self.inherit_extensions = self
            .check_extensions(
                &manifest.inherit_extensions,
                &sdk_ref,
                &sdk_ref_version,
                sdk_latest.as_deref(),
                base.as_deref(),
                base_lookup.latest.as_deref(),
                false,
            )
            .await;
        self.inherit_sdk_extensions = self
            .check_extensions(
                &manifest.inherit_sdk_extensions,
                &sdk_ref,
                &sdk_ref_version,
                sdk_latest.as_deref(),
                base.as_deref(),
                base_lookup.latest.as_deref(),
                false,
            )
            .await;
        self.base_extensions = self
            .check_extensions(
                &manifest.base_extensions,
                &runtime.clone().unwrap_or_default(),
                &runtime_version.clone().unwrap_or_default(),
                runtime_lookup.latest.as_deref(),
                base.as_deref(),
                base_lookup.latest.as_deref(),
                true,
            )
            .await;

        self.check_branch_bump(manifest, runtime_version.as_deref(), runtime_lookup.latest.as_deref());

        Ok(())
    }

    /// Writes the proposed bumps to the manifest file. Mirrors the source:
    /// only `runtime-version` and `base-version` are ever physically
    /// persisted, even though more is computed (DESIGN.md Open Question 2).
    pub fn update(&self, manifest: &mut Manifest, manifest_path: &Path) -> anyhow::Result<()> {
        let mut changes = BTreeMap::new();
        if let Some(v) = &self.latest_runtime_version {
            changes.insert("runtime-version".to_owned(), v.clone());
        }
        if let Some(v) = &self.latest_base_version {
            changes.insert("base-version".to_owned(), v.clone());
        }
        manifest.apply_and_write(&changes, manifest_path)
    }

    fn set_rejection(&mut self, reason: String) {
        log::error!("{reason}");
        self.cannot_update_reason = Some(RejectionReason(reason));
        self.latest_runtime_version = None;
        self.latest_base_version = None;
        self.add_extensions.clear();
        self.add_build_extensions.clear();
    }

    async fn check_branch_lock(&self, manifest_dir: &Path) -> Option<String> {
        let output = self
            .runner
            .git(manifest_dir, ["branch", "--show-current"])
            .await
            .ok()?;
        let branch = output.stdout_string().trim().to_owned();
        if branch.starts_with("branch/") {
            Some(branch)
        } else {
            None
        }
    }

    fn check_branch_bump(
        &mut self,
        manifest: &Manifest,
        runtime_version: Option<&str>,
        latest_runtime_version: Option<&str>,
    ) {
        if let (Some(default_branch), Some(rv), Some(latest)) =
            (&manifest.default_branch, runtime_version, latest_runtime_version)
        {
            if default_branch == rv {
                self.default_branch = Some(latest.to_owned());
            }
        }
        if let (Some(branch), Some(rv), Some(latest)) =
            (&manifest.branch, runtime_version, latest_runtime_version)
        {
            if branch == rv {
                self.branch = Some(latest.to_owned());
            }
        }
    }

    async fn metadata(&mut self, name: &str, version: &str) -> crate::catalog::RefMetadata {
        self.cache.get(&self.catalog, name, version).await
    }

    /// `[ExtensionOf] ref=<kind>/<name>/<arch>/<branch>` — note the leading
    /// kind segment (`app`/`runtime`) that a full flatpak ref string carries,
    /// distinct from the plain `name/arch/branch` triple used elsewhere.
    async fn ref_is_extension_of(&mut self, name: &str, version: &str) -> (String, String) {
        let metadata = self.metadata(name, version).await;
        let mut candidate = false;
        for raw_line in metadata.lines() {
            let line: String = raw_line.chars().filter(|c| !c.is_whitespace()).collect();
            if line == "[ExtensionOf]" {
                candidate = true;
            } else if candidate && line.starts_with("ref=") {
                let parts: Vec<&str> = line[4..].split('/').collect();
                if parts.len() == 4 {
                    return (parts[1].to_owned(), parts[3].to_owned());
                }
            }
        }
        (name.to_owned(), version.to_owned())
    }

    async fn baseapp_target(&mut self, name: &str, version: &str) -> (String, String) {
        let metadata = self.metadata(name, version).await;
        let mut candidate = false;
        for line in metadata.lines() {
            if line == "[Application]" {
                candidate = true;
            } else if candidate && line.starts_with("sdk=") {
                let parts: Vec<&str> = line[4..].split('/').collect();
                if parts.len() == 3 {
                    return (parts[0].to_owned(), parts[2].to_owned());
                }
            }
        }
        (name.to_owned(), version.to_owned())
    }

    async fn is_extension_of_ref(&mut self, name: &str, version: &str, extension: &str) -> bool {
        let metadata = self.metadata(name, version).await;
        let target_line = format!("[Extension {extension}]");
        metadata.lines().any(|l| l == target_line)
    }

    async fn timezones_version(&mut self, name: &str, version: &str) -> String {
        let metadata = self.metadata(name, version).await;
        let mut candidate = false;
        for raw_line in metadata.lines() {
            let line: String = raw_line.chars().filter(|c| !c.is_whitespace()).collect();
            if line == "[Extensionorg.freedesktop.Platform.Timezones]" {
                candidate = true;
            } else if candidate && line.starts_with("version=") {
                return line[8..].to_owned();
            } else if line.is_empty() {
                candidate = false;
            }
        }
        String::new()
    }

    /// Finds the freedesktop-platform version a ref transitively depends
    /// on, following catalog targets first, then `[ExtensionOf]`/
    /// `[Application]` metadata chains, then the `Timezones` extension probe
    /// (spec.md §4.4.1).
    async fn freedesktop_target(&mut self, name: &str, version: &str) -> String {
        let mut cur_name = name.to_owned();
        let mut cur_version = version.to_owned();

        for _ in 0..8 {
            if cur_name.starts_with("org.freedesktop.") {
                return cur_version;
            }
            let target = self
                .refs
                .iter()
                .find(|r| r.name == cur_name && r.branch == cur_version)
                .and_then(|r| r.target.clone());
            match target {
                Some(t) => {
                    cur_name = t.name;
                    cur_version = t.branch;
                }
                None => break,
            }
        }

        let (n2, v2) = self.ref_is_extension_of(&cur_name, &cur_version).await;
        let (n3, v3) = self.baseapp_target(&n2, &v2).await;
        if n3.starts_with("org.freedesktop.") {
            return v3;
        }
        self.timezones_version(&n3, &v3).await
    }

    /// Resolves the latest version of an extension, handling the
    /// self-defined-extension fixpoint (spec.md §4.4.5, bounded to one
    /// level of recursion per spec.md §9).
    async fn get_extension_versions(&mut self, name: &str, version: &str) -> ExtVersions {
        let cleaned_name = rules::canonical_catalog_name(name).to_owned();
        let mut lookup = get_versions(&self.refs, &cleaned_name, Some(version));
        let mut is_self_defined = false;

        if lookup.older.is_empty() {
            let (core_name, _core_version) = self.ref_is_extension_of(&cleaned_name, version).await;
            if Some(core_name.as_str()) == self.app_id.as_deref() {
                lookup = get_versions(&self.refs, &core_name, Some(version));
            } else {
                let mut parts: Vec<&str> = name.split('.').collect();
                parts.pop();
                let guessed_core_name = parts.join(".");

                let already_found = self.found_extension_points.contains_key(name);
                let is_ext_of = self.is_extension_of_ref(&guessed_core_name, "", name).await;

                if already_found || is_ext_of {
                    is_self_defined = true;
                    self.found_extension_points
                        .insert(name.to_owned(), format!("{guessed_core_name}//{version}"));
                    lookup = get_versions(&self.refs, &guessed_core_name, Some(version));
                }
            }
        }

        let latest = lookup.latest.clone();
        let extension_core = self
            .ref_is_extension_of(&cleaned_name, latest.as_deref().unwrap_or(version))
            .await;

        ExtVersions {
            latest,
            extension_core,
            older: lookup.older,
            is_self_defined,
        }
    }

    /// spec.md §4.4.5's `check_extension_versions`: both the "resolves to
    /// something we trust" clause and the freedesktop-target-match clause
    /// (unless self-defined) must hold.
    async fn check_extension_versions(
        &mut self,
        ext: &str,
        ext_version: &str,
        target: &str,
        target_version: Option<&str>,
        is_self_defined: bool,
    ) -> bool {
        let target_version = target_version.unwrap_or("");
        let (extof_name, extof_branch) = self.ref_is_extension_of(ext, ext_version).await;

        let resolves_to_trusted = extof_name.starts_with("org.freedesktop.")
            || (extof_name == target && extof_branch == target_version)
            || self.add_extensions.contains_key(&extof_name)
            || self.add_build_extensions.contains_key(&extof_name)
            || is_self_defined
            || normalize_to_sdk(&extof_name) == normalize_to_sdk(target);

        if !resolves_to_trusted {
            log::error!("Could not find updated version of extension {ext}, will not update this extension");
            return false;
        }

        if is_self_defined {
            return true;
        }

        let ext_fdo = self.freedesktop_target(ext, ext_version).await;
        let target_fdo = self.freedesktop_target(target, target_version).await;
        if ext_fdo != target_fdo {
            log::error!("Could not find updated version of extension {ext}, will not update this extension");
            return false;
        }
        true
    }

    /// `add-extensions`/`add-build-extensions`: resolve every declared
    /// version first (pass 1), then validate every declared version against
    /// the resolved latest (pass 2) — SPEC_FULL.md §9.5 point 2.
    async fn check_add_extensions(
        &mut self,
        declared: &BTreeMap<String, ExtensionPointSpec>,
        target_field: ExtTarget,
        sdk_ref: &str,
        sdk_latest: Option<&str>,
    ) {
        if declared.is_empty() {
            return;
        }

        let mut latest_map: BTreeMap<String, Option<String>> = BTreeMap::new();
        let mut self_defined_map: BTreeMap<String, bool> = BTreeMap::new();

        for (name, spec) in declared {
            let mut latest: Option<String> = None;
            let mut is_self_defined = false;
            for version in spec.all_versions() {
                let ev = self.get_extension_versions(name, &version).await;
                if ev.latest.is_some() {
                    latest = ev.latest;
                }
                is_self_defined = ev.is_self_defined;
            }
            latest_map.insert(name.clone(), latest);
            self_defined_map.insert(name.clone(), is_self_defined);
        }

        let mut result = BTreeMap::new();
        for (name, spec) in declared {
            let latest = latest_map.get(name).cloned().flatten();
            let is_self_defined = *self_defined_map.get(name).unwrap_or(&false);

            for _version in spec.all_versions() {
                let ok = self
                    .check_extension_versions(name, latest.as_deref().unwrap_or(""), sdk_ref, sdk_latest, is_self_defined)
                    .await;
                if !ok {
                    self.set_rejection(format!(
                        "Cannot update {name} {} against {sdk_ref} {}",
                        latest.as_deref().unwrap_or(""),
                        sdk_latest.unwrap_or("")
                    ));
                    return;
                }
            }
            if let Some(l) = latest {
                result.insert(name.clone(), l);
            }
        }

        match target_field {
            ExtTarget::Add => self.add_extensions = result,
            ExtTarget::AddBuild => self.add_build_extensions = result,
        }
    }

    /// `sdk-extensions`/`platform-extensions`/`inherit-extensions`/
    /// `inherit-sdk-extensions`/`base-extensions` (spec.md §4.4.5).
    async fn check_extensions(
        &mut self,
        names: &[String],
        ref_name: &str,
        ref_version: &str,
        latest_ref_version: Option<&str>,
        base: Option<&str>,
        latest_base_version: Option<&str>,
        only_base: bool,
    ) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        if names.is_empty() {
            return out;
        }

        for extension in names {
            let ev = self.get_extension_versions(extension, ref_version).await;
            let (core_name, core_version) = ev.extension_core.clone();

            if base.is_some() && core_name == *base.unwrap() {
                let ok = self
                    .check_extension_versions(
                        extension,
                        ev.latest.as_deref().unwrap_or(""),
                        base.unwrap(),
                        latest_base_version,
                        ev.is_self_defined,
                    )
                    .await;
                if ok {
                    if let Some(l) = &ev.latest {
                        out.insert(extension.clone(), l.clone());
                    }
                } else {
                    self.set_rejection(format!(
                        "Extension {extension} is not available for base {} not offering runtime updates",
                        base.unwrap()
                    ));
                }
            } else if !only_base {
                let (potential_base, potential_base_version) =
                    self.baseapp_target(&core_name, &core_version).await;
                let fixed_point = potential_base == core_name && potential_base_version == core_version;

                let ok = fixed_point
                    && self
                        .check_extension_versions(
                            extension,
                            ev.latest.as_deref().unwrap_or(""),
                            ref_name,
                            latest_ref_version,
                            ev.is_self_defined,
                        )
                        .await;
                if ok {
                    if let Some(l) = &ev.latest {
                        out.insert(extension.clone(), l.clone());
                    }
                } else {
                    self.set_rejection(format!(
                        "Extension {extension} is not available for runtime/sdk {} not offering runtime updates",
                        latest_ref_version.unwrap_or("")
                    ));
                }
            } else {
                self.set_rejection(format!(
                    "Unable to find recent version of extension {extension}, not offering runtime updates"
                ));
            }
        }

        out
    }
}

fn version_is_newer(latest: Option<&str>, current: Option<&str>) -> bool {
    match (latest, current) {
        (Some(l), Some(c)) => l > c,
        _ => false,
    }
}

fn normalize_to_sdk(name: &str) -> String {
    match name.strip_suffix(".Platform") {
        Some(prefix) => format!("{prefix}.Sdk"),
        None => name.to_owned(),
    }
}

/// spec.md §4.4.1: the latest version available for `ref_name`, the subset
/// of versions no newer than `current_version`, and the target triple of
/// whichever row the latest version came from.
fn get_versions(
    refs: &[crate::catalog::RemoteEntry],
    ref_name: &str,
    current_version: Option<&str>,
) -> VersionLookup {
    let mut versions: BTreeMap<String, String> = BTreeMap::new();
    let mut current_target_name: Option<String> = None;

    for row in refs.iter().filter(|r| r.name == ref_name) {
        let key = if let Some(pinned) = rules::pinned_freedesktop_target(ref_name) {
            pinned.to_owned()
        } else if let Some(target) = &row.target {
            format!("{}/{}/{}", target.name, target.arch, target.branch)
        } else {
            row.branch.clone()
        };

        if Some(row.branch.as_str()) == current_version {
            current_target_name = row.target.as_ref().map(|t| t.name.clone());
        }

        versions.insert(key, row.branch.clone());
    }

    let trigger_kde_filter = rules::needs_kde_major_filter(ref_name)
        || current_target_name
            .as_deref()
            .map(rules::needs_kde_major_filter)
            .unwrap_or(false);

    if trigger_kde_filter {
        if let Some(cur) = current_version {
            versions.retain(|_, v| rules::same_major(cur, v));
        }
    }

    if versions.is_empty() {
        // Unknown ref: treat as "no bump available" rather than an error
        // (SPEC_FULL.md §9.5 point 1).
        return VersionLookup {
            latest: current_version.map(str::to_owned),
            older: BTreeMap::new(),
            latest_target: None,
        };
    }

    let max_key = versions.keys().next_back().unwrap().clone();
    let latest = versions.get(&max_key).cloned();
    let latest_target = RefTriple::parse(&max_key);

    let older = match current_version
        .and_then(|cur| versions.iter().find(|(_, v)| v.as_str() == cur).map(|(k, _)| k.clone()))
    {
        Some(cur_key) => versions
            .iter()
            .filter(|(k, _)| **k <= cur_key)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        None => versions.clone(),
    };

    VersionLookup {
        latest,
        older,
        latest_target,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RemoteEntry;

    fn entry(name: &str, branch: &str, target: Option<(&str, &str, &str)>) -> RemoteEntry {
        RemoteEntry {
            name: name.to_owned(),
            branch: branch.to_owned(),
            target: target.map(|(n, a, b)| RefTriple {
                name: n.to_owned(),
                arch: a.to_owned(),
                branch: b.to_owned(),
            }),
        }
    }

    fn manifest_with(yaml: &str) -> Manifest {
        Manifest::parse_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn scenario_1_plain_runtime_bump() {
        let refs = vec![
            entry("org.freedesktop.Platform", "20.08", None),
            entry("org.freedesktop.Platform", "21.08", None),
        ];
        let manifest = manifest_with(
            "id: org.example.App\nruntime: org.freedesktop.Platform\nruntime-version: \"20.08\"\n",
        );
        let dir = tempfile::tempdir().unwrap();
        let mut checker = RuntimeChecker::new("flathub");
        checker
            .check(&manifest, true, dir.path(), Some(refs))
            .await
            .unwrap();

        assert_eq!(checker.latest_runtime_version.as_deref(), Some("21.08"));
        assert!(checker.cannot_update_reason.is_none());
        assert!(checker.add_extensions.is_empty());
        assert!(checker.add_build_extensions.is_empty());
    }

    #[tokio::test]
    async fn scenario_2_kde_major_filter() {
        let refs = vec![
            entry("org.kde.Platform", "5.15", None),
            entry("org.kde.Platform", "5.27", None),
            entry("org.kde.Platform", "6.7", None),
        ];
        let manifest = manifest_with(
            "id: org.example.App\nruntime: org.kde.Platform\nruntime-version: \"5.15\"\n",
        );
        let dir = tempfile::tempdir().unwrap();
        let mut checker = RuntimeChecker::new("flathub");
        checker
            .check(&manifest, true, dir.path(), Some(refs))
            .await
            .unwrap();

        let proposed = checker.latest_runtime_version.unwrap();
        assert_eq!(&proposed[..1], "5");
    }

    #[tokio::test]
    async fn scenario_3_runtime_and_base_bump_together() {
        let refs = vec![
            entry("org.freedesktop.Platform", "20.08", None),
            entry("org.freedesktop.Platform", "21.08", None),
            entry(
                "org.chromium.Chromium.BaseApp",
                "20.08",
                Some(("org.freedesktop.Platform", "x86_64", "20.08")),
            ),
            entry(
                "org.chromium.Chromium.BaseApp",
                "21.08",
                Some(("org.freedesktop.Platform", "x86_64", "21.08")),
            ),
        ];
        let manifest = manifest_with(
            "id: org.example.App\nruntime: org.freedesktop.Platform\nruntime-version: \"20.08\"\nbase: org.chromium.Chromium.BaseApp\nbase-version: \"20.08\"\n",
        );
        let dir = tempfile::tempdir().unwrap();
        let mut checker = RuntimeChecker::new("flathub");
        checker
            .check(&manifest, true, dir.path(), Some(refs))
            .await
            .unwrap();

        assert_eq!(checker.latest_runtime_version.as_deref(), Some("21.08"));
        assert_eq!(checker.latest_base_version.as_deref(), Some("21.08"));
        assert!(checker.cannot_update_reason.is_none());
    }

    #[tokio::test]
    async fn scenario_4_runtime_and_base_bump_different_namespaces() {
        let refs = vec![
            entry(
                "org.gnome.Platform",
                "3.38",
                Some(("org.freedesktop.Platform", "x86_64", "21.08")),
            ),
            entry(
                "org.gnome.Platform",
                "45",
                Some(("org.freedesktop.Platform", "x86_64", "24.08")),
            ),
            entry(
                "io.qt.qtwebengine.BaseApp",
                "5.15",
                Some(("org.freedesktop.Platform", "x86_64", "21.08")),
            ),
            entry(
                "io.qt.qtwebengine.BaseApp",
                "6.8",
                Some(("org.freedesktop.Platform", "x86_64", "24.08")),
            ),
        ];
        let manifest = manifest_with(
            "id: org.example.App\nruntime: org.gnome.Platform\nruntime-version: \"3.38\"\nbase: io.qt.qtwebengine.BaseApp\nbase-version: \"5.15\"\n",
        );
        let dir = tempfile::tempdir().unwrap();
        let mut checker = RuntimeChecker::new("flathub");
        checker
            .check(&manifest, true, dir.path(), Some(refs))
            .await
            .unwrap();

        assert!(checker.cannot_update_reason.is_none());
        assert_eq!(checker.latest_runtime_version.as_deref(), Some("45"));
        assert_eq!(checker.latest_base_version.as_deref(), Some("6.8"));
        assert_ne!(checker.latest_runtime_version, checker.latest_base_version);
    }

    #[tokio::test]
    async fn scenario_5_branch_lock() {
        let dir = tempfile::tempdir().unwrap();
        let status = std::process::Command::new("git")
            .arg("-C")
            .arg(dir.path())
            .args(["init", "-q", "-b", "branch/20.08"])
            .status()
            .unwrap();
        assert!(status.success());
        std::process::Command::new("git")
            .arg("-C")
            .arg(dir.path())
            .args(["config", "user.email", "test@example.com"])
            .status()
            .unwrap();
        std::process::Command::new("git")
            .arg("-C")
            .arg(dir.path())
            .args(["config", "user.name", "Test"])
            .status()
            .unwrap();
        std::fs::write(dir.path().join("x"), "x").unwrap();
        std::process::Command::new("git")
            .arg("-C")
            .arg(dir.path())
            .args(["add", "."])
            .status()
            .unwrap();
        std::process::Command::new("git")
            .arg("-C")
            .arg(dir.path())
            .args(["commit", "-q", "-m", "init"])
            .status()
            .unwrap();

        let manifest = manifest_with(
            "id: org.example.App\nruntime: org.freedesktop.Platform\nruntime-version: \"20.08\"\n",
        );
        let mut checker = RuntimeChecker::new("flathub");
        checker
            .check(&manifest, true, dir.path(), Some(vec![]))
            .await
            .unwrap();

        assert!(checker.latest_runtime_version.is_none());
        let reason = checker.cannot_update_reason.unwrap();
        assert!(reason.0.contains("branch/20.08"));
    }

    #[tokio::test]
    async fn invariant_1_rejection_clears_bumps_and_add_extensions() {
        // No matching freedesktop target between runtime and base.
        let refs = vec![
            entry("org.freedesktop.Platform", "20.08", None),
            entry("org.freedesktop.Platform", "21.08", None),
            entry(
                "org.example.Base.BaseApp",
                "20.08",
                Some(("org.freedesktop.Platform", "x86_64", "20.08")),
            ),
            // The only newer base version targets a *different* freedesktop branch.
            entry(
                "org.example.Base.BaseApp",
                "21.08",
                Some(("org.freedesktop.Platform", "x86_64", "19.08")),
            ),
        ];
        let manifest = manifest_with(
            "id: org.example.App\nruntime: org.freedesktop.Platform\nruntime-version: \"20.08\"\nbase: org.example.Base.BaseApp\nbase-version: \"20.08\"\nadd-extensions:\n  org.example.App.Plugin:\n    version: \"1.0\"\n",
        );
        let dir = tempfile::tempdir().unwrap();
        let mut checker = RuntimeChecker::new("flathub");
        checker
            .check(&manifest, true, dir.path(), Some(refs))
            .await
            .unwrap();

        assert!(checker.cannot_update_reason.is_some());
        assert!(checker.latest_runtime_version.is_none());
        assert!(checker.latest_base_version.is_none());
        assert!(checker.add_extensions.is_empty());
        assert!(checker.add_build_extensions.is_empty());
    }

    #[tokio::test]
    async fn idempotent_when_already_latest() {
        let refs = vec![
            entry("org.freedesktop.Platform", "20.08", None),
            entry("org.freedesktop.Platform", "21.08", None),
        ];
        let manifest = manifest_with(
            "id: org.example.App\nruntime: org.freedesktop.Platform\nruntime-version: \"21.08\"\n",
        );
        let dir = tempfile::tempdir().unwrap();
        let mut checker = RuntimeChecker::new("flathub");
        checker
            .check(&manifest, true, dir.path(), Some(refs))
            .await
            .unwrap();

        // Already at the max catalog version: no bump, and (per Open
        // Question 6) that's a terminal, not-blocked rejection.
        assert!(checker.latest_runtime_version.is_none());
        assert_eq!(
            checker.cannot_update_reason.as_ref().map(|r| r.0.as_str()),
            Some("No new runtime available")
        );
    }

    #[tokio::test]
    async fn rejection_blocks_a_validating_add_build_extension() {
        // Same base-mismatch rejection as invariant_1, but this time the
        // declared add-build-extensions entry *would* validate successfully
        // (its name resolves straight to a trusted freedesktop target), so a
        // port that keeps running the add-extension passes after rejection
        // would repopulate `add_build_extensions` despite the rejection.
        let refs = vec![
            entry("org.freedesktop.Platform", "20.08", None),
            entry("org.freedesktop.Platform", "21.08", None),
            entry(
                "org.example.Base.BaseApp",
                "20.08",
                Some(("org.freedesktop.Platform", "x86_64", "20.08")),
            ),
            entry(
                "org.example.Base.BaseApp",
                "21.08",
                Some(("org.freedesktop.Platform", "x86_64", "19.08")),
            ),
        ];
        let manifest = manifest_with(
            "id: org.example.App\nruntime: org.freedesktop.Platform\nruntime-version: \"20.08\"\nbase: org.example.Base.BaseApp\nbase-version: \"20.08\"\nadd-build-extensions:\n  org.freedesktop.Platform.VaapiIntel:\n    version: \"21.08\"\n",
        );
        let dir = tempfile::tempdir().unwrap();
        let mut checker = RuntimeChecker::new("flathub");
        checker
            .check(&manifest, true, dir.path(), Some(refs))
            .await
            .unwrap();

        assert!(checker.cannot_update_reason.is_some());
        assert!(checker.latest_runtime_version.is_none());
        assert!(checker.latest_base_version.is_none());
        assert!(checker.add_extensions.is_empty());
        assert!(
            checker.add_build_extensions.is_empty(),
            "add_build_extensions must stay empty once cannot_update_reason is set"
        );
    }

    #[tokio::test]
    async fn self_defined_extension_resolved_via_metadata_fixture() {
        // Drives RuntimeChecker through the on-disk metadata-cache fixture
        // format: `load_cache_fixture` reads the file, `MetadataCache::from_entries`
        // pre-fills the cache, and `with_metadata_cache` wires it in, so the
        // self-defined-extension detection in `get_extension_versions` is
        // answered from the fixture instead of a live `flatpak` call.
        let fixture_dir = tempfile::tempdir().unwrap();
        let fixture_path = fixture_dir.path().join("metadata_cache.json");
        std::fs::write(
            &fixture_path,
            r#"{"com.example.Extra//": ["[Extension com.example.Extra.MyExt]"]}"#,
        )
        .unwrap();

        let cache_entries = crate::catalog::load_cache_fixture(&fixture_path).unwrap();
        let cache = MetadataCache::from_entries(cache_entries);

        let refs = vec![
            entry("org.freedesktop.Platform", "20.08", None),
            entry("org.freedesktop.Platform", "21.08", None),
        ];
        let manifest = manifest_with(
            "id: org.example.App\nruntime: org.freedesktop.Platform\nruntime-version: \"20.08\"\nadd-extensions:\n  com.example.Extra.MyExt:\n    version: \"1.0\"\n",
        );
        let dir = tempfile::tempdir().unwrap();
        let mut checker = RuntimeChecker::new("flathub").with_metadata_cache(cache);
        checker
            .check(&manifest, true, dir.path(), Some(refs))
            .await
            .unwrap();

        assert_eq!(
            checker.add_extensions.get("com.example.Extra.MyExt").map(String::as_str),
            Some("1.0")
        );
    }

    #[test]
    fn get_versions_unknown_ref_returns_current_unchanged() {
        let lookup = get_versions(&[], "org.unknown.Thing", Some("1.0"));
        assert_eq!(lookup.latest.as_deref(), Some("1.0"));
        assert!(lookup.older.is_empty());
    }

    #[test]
    fn normalize_to_sdk_rewrites_platform_suffix() {
        assert_eq!(normalize_to_sdk("org.gnome.Platform"), "org.gnome.Sdk");
        assert_eq!(normalize_to_sdk("org.gnome.Sdk"), "org.gnome.Sdk");
    }
}
