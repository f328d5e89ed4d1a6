//! Directory access policy.
//!
//! Every filesystem access made by the indexer goes through a
//! [`DirectoryPolicy`]: a path is allowed only if its canonical form lies
//! under one of the allowed roots and under none of the excluded roots.
//! Exclusion always wins.
//!
//! The active policy lives in a [`DirectoryValidator`] as an immutable
//! `Arc` snapshot. Long-running operations call
//! [`DirectoryValidator::snapshot`] once at their start and keep using
//! that snapshot, so replacing the policy mid-scan never changes the rules
//! for work already in flight.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Maximum total path length in bytes.
pub const MAX_PATH_BYTES: usize = 4096;
/// Maximum length of one path component in bytes.
pub const MAX_COMPONENT_BYTES: usize = 255;

const CASE_INSENSITIVE_FS: bool = cfg!(any(target_os = "macos", target_os = "windows"));

/// Result of validating a path against a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Carries the canonical path that all later I/O must use.
    Allowed(PathBuf),
    Denied(String),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed(_))
    }
}

/// Canonical allow/exclude roots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryPolicy {
    allowed_roots: Vec<PathBuf>,
    excluded_roots: Vec<PathBuf>,
}

impl DirectoryPolicy {
    /// Build a policy, canonicalizing every root.
    ///
    /// Roots that do not exist yet are normalized lexically so they still
    /// match once created.
    pub fn new(allowed: &[PathBuf], excluded: &[PathBuf]) -> io::Result<Self> {
        let mut allowed_roots = Vec::with_capacity(allowed.len());
        for root in allowed {
            check_sanitized(root).map_err(|r| io::Error::new(io::ErrorKind::InvalidInput, r))?;
            push_unique(&mut allowed_roots, canonicalize(root)?);
        }
        let mut excluded_roots = Vec::with_capacity(excluded.len());
        for root in excluded {
            check_sanitized(root).map_err(|r| io::Error::new(io::ErrorKind::InvalidInput, r))?;
            push_unique(&mut excluded_roots, canonicalize(root)?);
        }
        Ok(Self {
            allowed_roots,
            excluded_roots,
        })
    }

    pub fn allowed_roots(&self) -> &[PathBuf] {
        &self.allowed_roots
    }

    pub fn excluded_roots(&self) -> &[PathBuf] {
        &self.excluded_roots
    }

    /// Validate a path. Denied paths get a human-readable reason.
    pub fn validate(&self, path: &Path) -> Verdict {
        if let Err(reason) = check_sanitized(path) {
            return Verdict::Denied(reason);
        }

        let canonical = match canonicalize(path) {
            Ok(p) => p,
            Err(e) => return Verdict::Denied(format!("cannot resolve path: {}", e)),
        };

        if let Some(root) = self
            .excluded_roots
            .iter()
            .find(|root| is_under(&canonical, root))
        {
            return Verdict::Denied(format!("inside excluded directory {}", root.display()));
        }

        if self.allowed_roots.is_empty() {
            return Verdict::Denied("no allowed directories configured".to_string());
        }

        if self
            .allowed_roots
            .iter()
            .any(|root| is_under(&canonical, root))
        {
            Verdict::Allowed(canonical)
        } else {
            Verdict::Denied("outside every allowed directory".to_string())
        }
    }

    pub fn is_allowed(&self, path: &Path) -> bool {
        self.validate(path).is_allowed()
    }

    /// Filter a list of paths, returning the canonical form of the allowed ones.
    pub fn allowed_files<'a, I>(&self, paths: I) -> Vec<PathBuf>
    where
        I: IntoIterator<Item = &'a Path>,
    {
        paths
            .into_iter()
            .filter_map(|p| match self.validate(p) {
                Verdict::Allowed(c) => Some(c),
                Verdict::Denied(_) => None,
            })
            .collect()
    }
}

/// Holds the active policy snapshot.
#[derive(Debug, Default)]
pub struct DirectoryValidator {
    current: RwLock<Arc<DirectoryPolicy>>,
}

impl DirectoryValidator {
    pub fn new(policy: DirectoryPolicy) -> Self {
        Self {
            current: RwLock::new(Arc::new(policy)),
        }
    }

    /// The policy in force right now. Callers keep the `Arc` for the
    /// duration of their operation.
    pub fn snapshot(&self) -> Arc<DirectoryPolicy> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the active policy. Snapshots already handed out are unaffected.
    pub fn set_policy(
        &self,
        allowed: &[PathBuf],
        excluded: &[PathBuf],
    ) -> io::Result<Arc<DirectoryPolicy>> {
        let policy = Arc::new(DirectoryPolicy::new(allowed, excluded)?);
        self.replace(Arc::clone(&policy));
        Ok(policy)
    }

    pub fn replace(&self, policy: Arc<DirectoryPolicy>) {
        let mut guard = match self.current.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = policy;
    }

    /// Validate against the current snapshot and log the decision.
    pub fn validate(&self, path: &Path) -> Verdict {
        let verdict = self.snapshot().validate(path);
        log_access(path, &verdict);
        verdict
    }
}

/// Access audit line for a validation decision.
pub fn log_access(path: &Path, verdict: &Verdict) {
    match verdict {
        Verdict::Allowed(_) => debug!(path = %path.display(), "access allowed"),
        Verdict::Denied(reason) => warn!(path = %path.display(), %reason, "access denied"),
    }
}

/// Reject paths that are empty, overlong, or contain NUL/control characters.
fn check_sanitized(path: &Path) -> Result<(), String> {
    let raw = path.to_string_lossy();
    if raw.is_empty() {
        return Err("empty path".to_string());
    }
    if raw.len() > MAX_PATH_BYTES {
        return Err(format!("path exceeds {} bytes", MAX_PATH_BYTES));
    }
    if raw.contains('\0') {
        return Err("path contains a null byte".to_string());
    }
    if raw.chars().any(|c| c.is_control()) {
        return Err("path contains control characters".to_string());
    }
    if path
        .components()
        .any(|c| c.as_os_str().len() > MAX_COMPONENT_BYTES)
    {
        return Err(format!(
            "path component exceeds {} bytes",
            MAX_COMPONENT_BYTES
        ));
    }
    Ok(())
}

/// Resolve symlinks, `.` and `..`.
///
/// For paths that do not exist, the deepest existing ancestor is resolved
/// on disk and the remainder is appended after lexical normalization.
pub fn canonicalize(path: &Path) -> io::Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(p) => Ok(p),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let absolute = if path.is_absolute() {
                path.to_path_buf()
            } else {
                std::env::current_dir()?.join(path)
            };
            let normalized = normalize_lexically(&absolute);

            let mut existing = normalized.as_path();
            let mut tail = Vec::new();
            while !existing.exists() {
                match (existing.file_name(), existing.parent()) {
                    (Some(name), Some(parent)) => {
                        tail.push(name.to_os_string());
                        existing = parent;
                    }
                    _ => return Err(e),
                }
            }
            let mut resolved = std::fs::canonicalize(existing)?;
            for name in tail.into_iter().rev() {
                resolved.push(name);
            }
            Ok(resolved)
        }
        Err(e) => Err(e),
    }
}

/// Remove `.` and resolve `..` without touching the filesystem.
/// `..` at the root stays at the root.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let at_root = matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                );
                if !at_root {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn is_under(path: &Path, root: &Path) -> bool {
    if CASE_INSENSITIVE_FS {
        fold_case(path).starts_with(fold_case(root))
    } else {
        path.starts_with(root)
    }
}

fn fold_case(path: &Path) -> PathBuf {
    PathBuf::from(path.to_string_lossy().to_lowercase())
}

fn push_unique(roots: &mut Vec<PathBuf>, root: PathBuf) {
    if !roots.iter().any(|r| r == &root) {
        roots.push(root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        allowed: PathBuf,
        excluded: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let root = fs::canonicalize(tmp.path()).unwrap();
        let allowed = root.join("allowed");
        let excluded = allowed.join("private");
        fs::create_dir_all(&excluded).unwrap();
        fs::write(allowed.join("notes.txt"), "hello").unwrap();
        fs::write(excluded.join("secret.txt"), "nope").unwrap();
        fs::create_dir_all(root.join("outside")).unwrap();
        fs::write(root.join("outside").join("x.txt"), "x").unwrap();
        Fixture {
            _tmp: tmp,
            root,
            allowed,
            excluded,
        }
    }

    fn policy(f: &Fixture) -> DirectoryPolicy {
        DirectoryPolicy::new(&[f.allowed.clone()], &[f.excluded.clone()]).unwrap()
    }

    #[test]
    fn allows_file_under_allowed_root() {
        let f = fixture();
        let verdict = policy(&f).validate(&f.allowed.join("notes.txt"));
        assert_eq!(verdict, Verdict::Allowed(f.allowed.join("notes.txt")));
    }

    #[test]
    fn exclusion_wins_over_inclusion() {
        let f = fixture();
        let verdict = policy(&f).validate(&f.excluded.join("secret.txt"));
        assert!(matches!(verdict, Verdict::Denied(r) if r.contains("excluded")));
    }

    #[test]
    fn denies_outside_allowed_roots() {
        let f = fixture();
        assert!(!policy(&f).is_allowed(&f.root.join("outside").join("x.txt")));
    }

    #[test]
    fn dot_dot_traversal_is_resolved_before_comparison() {
        let f = fixture();
        let sneaky = f.allowed.join("..").join("outside").join("x.txt");
        assert!(!policy(&f).is_allowed(&sneaky));

        let harmless = f.allowed.join("private").join("..").join("notes.txt");
        assert!(policy(&f).is_allowed(&harmless));
    }

    #[test]
    fn relative_traversal_attempts_are_denied() {
        let f = fixture();
        let p = policy(&f);
        for attempt in ["../../../etc/passwd", "..\\..\\Windows\\System32", "~/../../etc"] {
            assert!(!p.is_allowed(Path::new(attempt)), "{} allowed", attempt);
        }
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_the_root_is_denied() {
        let f = fixture();
        let link = f.allowed.join("escape");
        std::os::unix::fs::symlink(f.root.join("outside"), &link).unwrap();
        assert!(!policy(&f).is_allowed(&link.join("x.txt")));
    }

    #[test]
    fn rejects_null_bytes_and_control_characters() {
        let f = fixture();
        let p = policy(&f);
        let nul = PathBuf::from(format!("{}/a\0b", f.allowed.display()));
        assert!(matches!(p.validate(&nul), Verdict::Denied(r) if r.contains("null")));
        let ctl = PathBuf::from(format!("{}/a\u{7}b", f.allowed.display()));
        assert!(matches!(p.validate(&ctl), Verdict::Denied(r) if r.contains("control")));
    }

    #[test]
    fn rejects_overlong_paths() {
        let f = fixture();
        let long = f.allowed.join("a".repeat(MAX_COMPONENT_BYTES + 1));
        assert!(!policy(&f).is_allowed(&long));
        let very_long = f.allowed.join("b/".repeat(MAX_PATH_BYTES));
        assert!(!policy(&f).is_allowed(&very_long));
    }

    #[test]
    fn empty_allow_list_denies_everything() {
        let f = fixture();
        let p = DirectoryPolicy::new(&[], &[]).unwrap();
        assert!(!p.is_allowed(&f.allowed.join("notes.txt")));
    }

    #[test]
    fn snapshot_survives_policy_replacement() {
        let f = fixture();
        let validator = DirectoryValidator::new(policy(&f));
        let before = validator.snapshot();
        validator.set_policy(&[], &[]).unwrap();

        let file = f.allowed.join("notes.txt");
        assert!(before.is_allowed(&file));
        assert!(!validator.validate(&file).is_allowed());
    }

    #[test]
    fn allowed_files_filters_and_canonicalizes() {
        let f = fixture();
        let inputs = [
            f.allowed.join("notes.txt"),
            f.excluded.join("secret.txt"),
            f.root.join("outside").join("x.txt"),
        ];
        let kept = policy(&f).allowed_files(inputs.iter().map(|p| p.as_path()));
        assert_eq!(kept, vec![f.allowed.join("notes.txt")]);
    }

    #[test]
    fn normalize_lexically_handles_dots() {
        assert_eq!(
            normalize_lexically(Path::new("/a/./b/../c")),
            PathBuf::from("/a/c")
        );
        assert_eq!(normalize_lexically(Path::new("/../x")), PathBuf::from("/x"));
    }

    proptest! {
        #[test]
        fn denied_iff_outside_allowed_or_inside_excluded(
            segments in prop::collection::vec(
                prop::sample::select(vec!["a", "b", "private", "..", "."]),
                0..8,
            )
        ) {
            let f = fixture();
            let p = policy(&f);
            let mut candidate = f.allowed.clone();
            for s in &segments {
                candidate.push(s);
            }
            let resolved = normalize_lexically(&candidate);
            let expected = resolved.starts_with(&f.allowed) && !resolved.starts_with(&f.excluded);
            prop_assert_eq!(p.is_allowed(&candidate), expected);
        }
    }
}
