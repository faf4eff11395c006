//! SpecialChecker: the facade that runs the submodule and runtime checks
//! over one manifest and reports a combined outdated/update view.
//!
//! Ported from `examples/original_source/src/lib/specialcheckers.py`.

use std::path::Path;

use crate::errors::CatalogError;
use crate::manifest::Manifest;
use crate::runtime_checker::RuntimeChecker;
use crate::submodule::SubmoduleChecker;

pub struct SpecialChecker {
    submodule_checker: SubmoduleChecker,
    runtime_checker: RuntimeChecker,
}

/// What `check()` found, summarised for a caller that just wants to know
/// whether anything changed and why not if not.
pub struct Outdated {
    pub outdated_submodules: Vec<String>,
    pub runtime_bump: Option<String>,
    pub base_bump: Option<String>,
    pub cannot_update_reason: Option<String>,
}

impl SpecialChecker {
    pub fn new(remote_name: impl Into<String>, remote_url: impl Into<String>) -> Self {
        SpecialChecker {
            submodule_checker: SubmoduleChecker::new(),
            runtime_checker: RuntimeChecker::new(remote_name).with_remote_url(remote_url),
        }
    }

    /// Runs both checkers. `module_paths` are manifest-relative paths to
    /// build-module files that may live in a git submodule; `is_app` gates
    /// the runtime check the same way it does in the manifest generator
    /// this mirrors (only application manifests declare a runtime).
    pub async fn check(
        &mut self,
        manifest: &Manifest,
        is_app: bool,
        manifest_path: &Path,
        module_paths: &[String],
    ) -> Result<(), CatalogError> {
        self.submodule_checker.check(module_paths, manifest_path).await;

        let manifest_dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));
        self.runtime_checker
            .check(manifest, is_app, manifest_dir, None)
            .await
    }

    pub fn get_outdated(&self) -> Outdated {
        Outdated {
            outdated_submodules: self
                .submodule_checker
                .get_outdated_submodules()
                .iter()
                .map(|s| s.relative_path.clone())
                .collect(),
            runtime_bump: self.runtime_checker.latest_runtime_version.clone(),
            base_bump: self.runtime_checker.latest_base_version.clone(),
            cannot_update_reason: self
                .runtime_checker
                .cannot_update_reason
                .as_ref()
                .map(ToString::to_string),
        }
    }

    pub fn print_outdated(&self) {
        let outdated = self.get_outdated();
        for path in &outdated.outdated_submodules {
            log::info!("Submodule {path} has updated module content available");
        }
        if let Some(v) = &outdated.runtime_bump {
            log::info!("Runtime update available: {v}");
        }
        if let Some(v) = &outdated.base_bump {
            log::info!("Base update available: {v}");
        }
        if let Some(reason) = &outdated.cannot_update_reason {
            log::info!("Runtime/base not updated: {reason}");
        }
        if outdated.outdated_submodules.is_empty()
            && outdated.runtime_bump.is_none()
            && outdated.base_bump.is_none()
        {
            log::info!("Nothing to update");
        }
    }

    /// Applies every computed update: advances outdated non-nested
    /// submodules in the working checkout, and writes `runtime-version`/
    /// `base-version` to the manifest. Returns `(changes, warnings)`.
    pub async fn update(
        &mut self,
        manifest: &mut Manifest,
        manifest_path: &Path,
    ) -> anyhow::Result<(Vec<String>, Vec<String>)> {
        let (mut changes, warnings) = self.submodule_checker.update().await;

        let before = (
            self.runtime_checker.latest_runtime_version.clone(),
            self.runtime_checker.latest_base_version.clone(),
        );
        self.runtime_checker.update(manifest, manifest_path)?;
        if let Some(v) = before.0 {
            changes.push(format!("Update runtime-version to {v}"));
        }
        if let Some(v) = before.1 {
            changes.push(format!("Update base-version to {v}"));
        }

        Ok((changes, warnings))
    }

    pub fn get_errors(&self) -> Vec<String> {
        self.submodule_checker
            .get_errors()
            .iter()
            .map(ToString::to_string)
            .collect()
    }
}
