//! SubmoduleChecker: a content-hashed, two-worktree differ that determines
//! which referenced build-module files would change if their containing
//! submodule were advanced to its upstream tip.
//!
//! Ported from `examples/original_source/src/specialcheckers/submodulechecker.py`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::errors::SubmoduleError;
use crate::process::ProcessRunner;

/// Current/updated hash pair for one referenced module file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleHashes {
    pub current: String,
    pub updated: String,
}

/// One git submodule discovered under the repository, and what (if
/// anything) changed in it for the module files we were asked about.
#[derive(Debug, Clone)]
pub struct Submodule {
    /// Path relative to the repository root.
    pub path: String,
    /// Path from the manifest directory, used for human-facing messages.
    pub relative_path: String,
    /// True if this submodule lives inside another submodule.
    pub nested: bool,
    /// The resolved upstream commit to bump to; empty until resolved.
    pub commit: String,
    /// manifest-relative module-file path -> (current_hash, updated_hash).
    pub modules: BTreeMap<String, ModuleHashes>,
}

impl Submodule {
    fn new(path: impl Into<String>, nested: bool, relative_path: impl Into<String>) -> Self {
        Submodule {
            path: path.into(),
            nested,
            relative_path: relative_path.into(),
            commit: String::new(),
            modules: BTreeMap::new(),
        }
    }

    /// A submodule with a resolved commit and at least one changed module is
    /// "outdated" (spec.md §3 invariant).
    fn is_outdated(&self) -> bool {
        !self.commit.is_empty() && !self.modules.is_empty()
    }
}

pub struct SubmoduleChecker {
    runner: ProcessRunner,
    submodules: Vec<Submodule>,
    errors: Vec<SubmoduleError>,

    working_manifest_dir: PathBuf,
    working_git_top_level_dir: PathBuf,
    git_dir: PathBuf,

    _checking_dir: Option<TempDir>,
    current_dir: PathBuf,
    updated_dir: PathBuf,
    cached_latest_repo: bool,
}

impl Default for SubmoduleChecker {
    fn default() -> Self {
        SubmoduleChecker {
            runner: ProcessRunner::new(),
            submodules: Vec::new(),
            errors: Vec::new(),
            working_manifest_dir: PathBuf::new(),
            working_git_top_level_dir: PathBuf::new(),
            git_dir: PathBuf::new(),
            _checking_dir: None,
            current_dir: PathBuf::new(),
            updated_dir: PathBuf::new(),
            cached_latest_repo: false,
        }
    }
}

impl SubmoduleChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_errors(&self) -> &[SubmoduleError] {
        &self.errors
    }

    pub fn get_outdated_submodules(&self) -> Vec<&Submodule> {
        self.submodules.iter().filter(|s| s.is_outdated()).collect()
    }

    /// Checks the provided manifest-relative module paths to see if they
    /// live in a git submodule, and if so whether the upstream tip of that
    /// submodule would change their contents.
    pub async fn check(&mut self, relative_module_paths: &[String], manifest_path: &Path) {
        self.working_manifest_dir = manifest_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        if relative_module_paths.is_empty() {
            log::info!("No external module files referenced in manifest; not checking for submodule updates");
            return;
        }

        let status = match self
            .runner
            .git(&self.working_manifest_dir, ["submodule", "status", "--recursive"])
            .await
        {
            Ok(out) => out,
            Err(_) => {
                log::info!("Not a valid git repository; cannot check git submodules for updates");
                return;
            }
        };

        if status.stdout_string().trim().is_empty() {
            log::info!(
                "No git submodules found to check {} referenced modules",
                relative_module_paths.len()
            );
            return;
        }

        self.working_git_top_level_dir = match self
            .runner
            .git(&self.working_manifest_dir, ["rev-parse", "--show-toplevel"])
            .await
        {
            Ok(out) => PathBuf::from(out.stdout_string().trim().to_owned()),
            Err(_) => return,
        };

        self.git_dir = match self
            .runner
            .git(&self.working_git_top_level_dir, ["rev-parse", "--git-dir"])
            .await
        {
            Ok(out) => PathBuf::from(out.stdout_string().trim().to_owned()),
            Err(_) => return,
        };

        let checking_dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(_) => return,
        };

        self.current_dir = checking_dir.path().join("current");
        self.updated_dir = checking_dir.path().join("updated");
        let _ = std::fs::create_dir(&self.current_dir);
        let _ = std::fs::create_dir(&self.updated_dir);
        self._checking_dir = Some(checking_dir);

        let src = self.working_git_top_level_dir.join(&self.git_dir);
        let dst = self.current_dir.join(&self.git_dir);
        if copy_dir_all_blocking(&src, &dst).await.is_err() {
            return;
        }

        if self.prepare_submodules().await.is_none() {
            return;
        }

        let manifest_rel_path = manifest_path
            .strip_prefix(&self.working_manifest_dir)
            .unwrap_or(manifest_path)
            .display()
            .to_string();

        self.cached_latest_repo = false;

        let total = relative_module_paths.len();
        for (idx, module_path) in relative_module_paths.iter().enumerate() {
            match self.module_in_submodule(module_path) {
                Some(submodule_path) => {
                    log::info!(
                        "Started check [{}/{}] {} (from {})",
                        idx + 1,
                        total,
                        module_path,
                        manifest_rel_path
                    );
                    self.check_module_hash(module_path, &submodule_path).await;
                    log::info!(
                        "Finished check [{}/{}] {} (from {})",
                        idx + 1,
                        total,
                        module_path,
                        manifest_rel_path
                    );
                }
                None => {
                    log::info!(
                        "Skipped check [{}/{}] {} (from {})",
                        idx + 1,
                        total,
                        module_path,
                        manifest_rel_path
                    );
                }
            }
        }
    }

    async fn prepare_submodules(&mut self) -> Option<()> {
        self.runner
            .git(
                &self.current_dir,
                ["submodule", "update", "--quiet", "--init", "--recursive"],
            )
            .await
            .ok()?;

        let all = self
            .runner
            .git(
                &self.current_dir,
                ["submodule", "foreach", "--recursive", "--quiet", "echo $displaypath"],
            )
            .await
            .ok()?;
        let all_paths = all.stdout_lines();
        if all_paths.is_empty() {
            return None;
        }

        let direct = self
            .runner
            .git(
                &self.current_dir,
                ["submodule", "foreach", "--quiet", "echo $displaypath"],
            )
            .await
            .ok()?;
        let direct_paths: Vec<String> = direct.stdout_lines();

        for submodule_path in &all_paths {
            let absolute_submodule_dir = self.working_git_top_level_dir.join(submodule_path);
            let relative_submodule_path =
                relative_path(&absolute_submodule_dir, &self.working_manifest_dir);
            let nested = !direct_paths.contains(submodule_path);
            self.submodules.push(Submodule::new(
                submodule_path.clone(),
                nested,
                relative_submodule_path,
            ));
        }

        if self.submodules.is_empty() {
            None
        } else {
            Some(())
        }
    }

    /// Finds the deepest (most specific) submodule whose path is an
    /// ancestor of `module_path`.
    fn module_in_submodule(&self, module_path: &str) -> Option<String> {
        let absolute_module_path = normalize(&self.working_manifest_dir.join(module_path));

        let mut found: Option<&Submodule> = None;
        for submodule in &self.submodules {
            let submodule_dir = self.working_git_top_level_dir.join(&submodule.path);
            if absolute_module_path.starts_with(&submodule_dir) {
                log::debug!("Found {} to be in submodule {}", module_path, submodule.path);
                match &found {
                    Some(current) if current.path.len() >= submodule.path.len() => {}
                    _ => found = Some(submodule),
                }
            } else {
                log::debug!("Found {} to not be in submodule {}", module_path, submodule.path);
            }
        }
        found.map(|s| s.path.clone())
    }

    async fn check_module_hash(&mut self, module_path: &str, submodule_path: &str) {
        let from_top_level = strip_prefix_path(
            &normalize(&self.working_manifest_dir.join(module_path)),
            &self.working_git_top_level_dir,
        );

        let current_module_path = self.current_dir.join(&from_top_level);
        let current_hash = self.hash_module_file(&current_module_path, module_path, submodule_path, false);

        self.get_latest_submodule(submodule_path).await;

        let updated_module_path = self.updated_dir.join(&from_top_level);
        let updated_hash = self.hash_module_file(&updated_module_path, module_path, submodule_path, true);

        if current_hash.is_empty() || updated_hash.is_empty() {
            log::info!(
                "Not checking referenced module {} since either the current or updated version could not be found",
                module_path
            );
            return;
        }

        log::debug!(
            "Comparing checksums {} (current) and {} (updated) of {}",
            current_hash,
            updated_hash,
            module_path
        );

        if current_hash != updated_hash {
            if let Some(submodule) = self.submodules.iter_mut().find(|s| s.path == submodule_path) {
                submodule.modules.insert(
                    module_path.to_owned(),
                    ModuleHashes {
                        current: current_hash,
                        updated: updated_hash,
                    },
                );
            }
        }
    }

    fn hash_module_file(
        &mut self,
        path: &Path,
        relative_module_path: &str,
        submodule_path: &str,
        is_updated: bool,
    ) -> String {
        match std::fs::read(path) {
            Ok(bytes) => {
                let mut hasher = Sha256::new();
                hasher.update(&bytes);
                format!("{:x}", hasher.finalize())
            }
            Err(err) => {
                if is_updated {
                    log::error!(
                        "Failed to open given module {} in the updated commit of submodule {}: {}",
                        relative_module_path,
                        submodule_path,
                        err
                    );
                    log::info!("The module likely is no longer present in the updated submodule commit");
                } else {
                    log::error!(
                        "Failed to open given module {} in the current commit of submodule {}: {}",
                        relative_module_path,
                        submodule_path,
                        err
                    );
                }
                self.errors.push(SubmoduleError::Io {
                    path: path.to_path_buf(),
                    source: err,
                });
                String::new()
            }
        }
    }

    /// Lazily materialises `updated/` for one submodule, advancing it (or
    /// its non-nested enclosing submodule, for nested submodules) to its
    /// upstream tip, and records the resulting commit on the submodule
    /// itself.
    async fn get_latest_submodule(&mut self, submodule_path: &str) {
        let already_resolved = self
            .submodules
            .iter()
            .find(|s| s.path == submodule_path)
            .map(|s| !s.commit.is_empty())
            .unwrap_or(true);
        if already_resolved {
            return;
        }

        if !self.cached_latest_repo {
            let src = self.current_dir.join(&self.git_dir);
            let dst = self.updated_dir.join(&self.git_dir);
            if copy_dir_all_blocking(&src, &dst).await.is_ok() {
                self.cached_latest_repo = true;
            }
        }

        self.update_submodule(submodule_path).await;

        let submodule_dir = self.updated_dir.join(submodule_path);
        if let Ok(out) = self.runner.git(&submodule_dir, ["rev-parse", "HEAD"]).await {
            let commit = out.stdout_string().trim().to_owned();
            if let Some(submodule) = self.submodules.iter_mut().find(|s| s.path == submodule_path) {
                submodule.commit = commit;
            }
        }
    }

    /// Advances `submodule_path` to its remote tip inside `updated/`,
    /// pivoting to the non-nested enclosing submodule if `submodule_path`
    /// is itself nested (the nested one follows along via `--recursive`).
    async fn update_submodule(&mut self, submodule_path: &str) {
        let is_nested = self
            .submodules
            .iter()
            .find(|s| s.path == submodule_path)
            .map(|s| s.nested)
            .unwrap_or(false);

        let target_path = if is_nested {
            self.submodules
                .iter()
                .filter(|s| !s.nested && submodule_path.starts_with(s.path.as_str()))
                .max_by_key(|s| s.path.len())
                .map(|s| s.path.clone())
                .unwrap_or_else(|| submodule_path.to_owned())
        } else {
            submodule_path.to_owned()
        };

        if let Err(err) = self
            .runner
            .git(
                &self.updated_dir,
                ["submodule", "update", "--init", "--remote", "--recursive", &target_path],
            )
            .await
        {
            log::error!(
                "Failed to obtain updated version of submodule {}: {}",
                target_path,
                err
            );
            self.errors.push(SubmoduleError::Git {
                submodule: target_path,
                source: err,
            });
        }
    }

    /// For every outdated, non-nested submodule: advances the *working*
    /// checkout's submodule pointer to the recorded commit and emits one
    /// change line per updated file. Nested submodules produce warnings
    /// instead.
    pub async fn update(&mut self) -> (Vec<String>, Vec<String>) {
        let mut changes = Vec::new();
        let mut warnings = Vec::new();

        let outdated: Vec<Submodule> = self
            .submodules
            .iter()
            .filter(|s| s.is_outdated())
            .cloned()
            .collect();

        for submodule in outdated {
            if !submodule.nested {
                if let Err(err) = self.update_submodule_commit(&submodule).await {
                    log::error!(
                        "Failed to update submodule {}: {}",
                        submodule.relative_path,
                        err
                    );
                    self.errors.push(SubmoduleError::Git {
                        submodule: submodule.path.clone(),
                        source: err,
                    });
                    continue;
                }
                for (module, hashes) in &submodule.modules {
                    if !hashes.updated.is_empty() {
                        changes.push(format!(
                            "Update {} in submodule {}",
                            module, submodule.relative_path
                        ));
                    }
                }
            } else {
                log::info!(
                    "Cannot update outdated submodule \"{}\" in this repository since it is a nested submodule. To update the submodule, its superproject must update its submodules.",
                    submodule.relative_path
                );
                for module in submodule.modules.keys() {
                    warnings.push(format!(
                        "Cannot update {} in nested submodule {}",
                        module, submodule.relative_path
                    ));
                    warnings.push("To update it, its superproject must update its submodules".to_owned());
                }
            }
        }

        (changes, warnings)
    }

    async fn update_submodule_commit(
        &self,
        submodule: &Submodule,
    ) -> Result<(), crate::errors::ProcessError> {
        self.runner
            .git(
                &self.working_git_top_level_dir,
                ["submodule", "update", "--init", "--remote", &submodule.path],
            )
            .await?;

        // The remote tip may have advanced since the check; pin to the
        // commit we actually tested.
        let submodule_dir = self.working_git_top_level_dir.join(&submodule.path);
        self.runner
            .git(&submodule_dir, ["checkout", &submodule.commit])
            .await?;
        Ok(())
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        use std::path::Component;
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn strip_prefix_path(path: &Path, prefix: &Path) -> PathBuf {
    path.strip_prefix(prefix).map(Path::to_path_buf).unwrap_or_else(|_| path.to_path_buf())
}

/// A minimal relative-path computation (no crate in the pack provides this
/// for the non-TOML part of the stack): walk up from `from` to the common
/// ancestor with `to`, then back down.
fn relative_path(to: &Path, from: &Path) -> String {
    let to_components: Vec<_> = to.components().collect();
    let from_components: Vec<_> = from.components().collect();

    let common_len = to_components
        .iter()
        .zip(from_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result = PathBuf::new();
    for _ in common_len..from_components.len() {
        result.push("..");
    }
    for component in &to_components[common_len..] {
        result.push(component.as_os_str());
    }
    result.to_string_lossy().into_owned()
}

async fn copy_dir_all_blocking(src: &Path, dst: &Path) -> std::io::Result<()> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    tokio::task::spawn_blocking(move || copy_dir_all(&src, &dst))
        .await
        .unwrap_or_else(|e| Err(std::io::Error::new(std::io::ErrorKind::Other, e)))
}

fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dst_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_all(&entry.path(), &dst_path)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &dst_path)?;
        } else {
            std::fs::copy(entry.path(), &dst_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn run(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .status()
            .expect("git invocation failed");
        assert!(status.success(), "git {:?} failed in {:?}", args, dir);
    }

    fn init_repo(dir: &Path) {
        run(dir, &["init", "-q", "-b", "main"]);
        run(dir, &["config", "user.email", "test@example.com"]);
        run(dir, &["config", "user.name", "Test"]);
        run(dir, &["config", "protocol.file.allow", "always"]);
    }

    /// Builds: upstream submodule repo with `module.json`, a main repo
    /// referencing it as a submodule, then a second commit in the upstream
    /// repo that changes `module.json`. Checks that the checker detects the
    /// change without mutating the working checkout.
    #[tokio::test]
    async fn detects_changed_module_file_in_submodule() {
        let root = tempfile::tempdir().unwrap();

        let upstream = root.path().join("upstream");
        std::fs::create_dir(&upstream).unwrap();
        init_repo(&upstream);
        std::fs::write(upstream.join("module.json"), "{\"version\": 1}").unwrap();
        run(&upstream, &["add", "."]);
        run(&upstream, &["commit", "-q", "-m", "initial"]);

        let main_repo = root.path().join("main");
        std::fs::create_dir(&main_repo).unwrap();
        init_repo(&main_repo);
        std::fs::write(main_repo.join("app.yaml"), "id: org.example.App\n").unwrap();
        run(&main_repo, &["add", "."]);
        run(&main_repo, &["commit", "-q", "-m", "initial"]);
        run(
            &main_repo,
            &[
                "submodule",
                "add",
                "-q",
                upstream.to_str().unwrap(),
                "shared-modules",
            ],
        );
        run(&main_repo, &["commit", "-q", "-m", "add submodule"]);

        // advance upstream after the submodule was pinned
        std::fs::write(upstream.join("module.json"), "{\"version\": 2}").unwrap();
        run(&upstream, &["add", "."]);
        run(&upstream, &["commit", "-q", "-m", "bump"]);

        let manifest_path = main_repo.join("app.yaml");
        let mut checker = SubmoduleChecker::new();
        checker
            .check(
                &["shared-modules/module.json".to_owned()],
                &manifest_path,
            )
            .await;

        let outdated = checker.get_outdated_submodules();
        assert_eq!(outdated.len(), 1, "errors: {:?}", checker.get_errors());
        assert_eq!(outdated[0].path, "shared-modules");
        assert!(outdated[0].modules.contains_key("shared-modules/module.json"));
        assert!(!outdated[0].commit.is_empty());

        // the working checkout must not have been mutated by check()
        let pre_update_head = Command::new("git")
            .arg("-C")
            .arg(main_repo.join("shared-modules"))
            .args(["rev-parse", "HEAD"])
            .output()
            .unwrap();
        let pre_update_head = String::from_utf8_lossy(&pre_update_head.stdout).trim().to_owned();

        let (changes, warnings) = checker.update().await;
        assert_eq!(changes.len(), 1);
        assert!(changes[0].contains("shared-modules/module.json"));
        assert!(warnings.is_empty());

        let post_update_head = Command::new("git")
            .arg("-C")
            .arg(main_repo.join("shared-modules"))
            .args(["rev-parse", "HEAD"])
            .output()
            .unwrap();
        let post_update_head = String::from_utf8_lossy(&post_update_head.stdout).trim().to_owned();
        assert_ne!(pre_update_head, post_update_head);
    }

    #[tokio::test]
    async fn no_referenced_modules_short_circuits() {
        let mut checker = SubmoduleChecker::new();
        checker.check(&[], Path::new("/tmp/does-not-matter/manifest.yaml")).await;
        assert!(checker.get_outdated_submodules().is_empty());
    }

    #[tokio::test]
    async fn non_git_directory_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("app.yaml");
        std::fs::write(&manifest_path, "id: org.example.App\n").unwrap();
        let mut checker = SubmoduleChecker::new();
        checker
            .check(&["some/module.json".to_owned()], &manifest_path)
            .await;
        assert!(checker.get_outdated_submodules().is_empty());
    }

    #[test]
    fn relative_path_handles_common_ancestor() {
        let to = Path::new("/a/b/shared-modules");
        let from = Path::new("/a/b/c");
        assert_eq!(relative_path(to, from), "../shared-modules");
    }
}
