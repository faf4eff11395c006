//! Domain-quirk rewrites that the Flathub ecosystem's remote catalog
//! requires callers to know about by hand. These aren't abstractions over
//! some general pattern — they're one-off naming quirks, so they live in
//! their own small table rather than being folded into `RuntimeChecker`'s
//! control flow (spec.md §9: "encode as a small named rule table").

/// `flatpak remote-ls` lists the GL32 extension under a name distinct from
/// the one apps declare in `add-extensions`/`sdk-extensions`.
const GL32_SHORT: &str = "org.freedesktop.Platform.GL32";
const GL32_CATALOG: &str = "org.freedesktop.Platform.GL32.default";

/// The `LinuxAudio.Plugins` extension point's version is actually defined by
/// a differently-named baseapp-shaped entry.
const LINUX_AUDIO_PLUGINS: &str = "org.freedesktop.LinuxAudio.Plugins";
const LINUX_AUDIO_BASE_EXTENSION: &str = "org.freedesktop.LinuxAudio.BaseExtension";

/// Upstream's "stable" branch for `LinuxAudio.BaseExtension` is older than
/// its numbered branches; pin its freedesktop target to this instead of
/// trusting the catalog's nominal `stable` row.
const LINUX_AUDIO_BASE_EXTENSION_TARGET: &str = "21.08";

/// Rewrite a ref name to the one the remote catalog actually lists entries
/// under (spec.md §4.4.2).
pub fn canonical_catalog_name(name: &str) -> &str {
    match name {
        GL32_SHORT => GL32_CATALOG,
        LINUX_AUDIO_PLUGINS => LINUX_AUDIO_BASE_EXTENSION,
        other => other,
    }
}

/// True when `name` is subject to the hardcoded freedesktop-target pin
/// (spec.md §4.4.2's "hack forces the candidate mapping to treat `21.08` as
/// its own freedesktop target").
pub fn pinned_freedesktop_target(name: &str) -> Option<&'static str> {
    if name == LINUX_AUDIO_BASE_EXTENSION {
        Some(LINUX_AUDIO_BASE_EXTENSION_TARGET)
    } else {
        None
    }
}

/// True when `name` (or a base target it resolves through) needs the
/// KDE major-version filter applied to its candidate version mapping
/// (spec.md §4.4.2): a ref whose name contains `org.kde.` is never proposed
/// a version whose first character (major version) differs from the
/// current branch's first character.
pub fn needs_kde_major_filter(name: &str) -> bool {
    name.contains("org.kde.")
}

/// True if `current` and `candidate` share the same major version (first
/// character of the branch string), the KDE filter's actual predicate.
pub fn same_major(current: &str, candidate: &str) -> bool {
    match (current.chars().next(), candidate.chars().next()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
