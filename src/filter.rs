//! Scope filtering for monitored paths
//!
//! A [`PathFilter`] decides whether an absolute path inside the monitored
//! root is tracked. Matching is a pure function of the path, so it is safe to
//! call from the watcher task as well as the processing loop.

use crate::error::{Error, Result};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

/// Which files within the monitored root are tracked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeFilter {
    /// Every file is in scope
    Unrestricted,
    /// Only files whose basename or root-relative path is listed.
    /// Both sets empty matches nothing.
    Only {
        /// Lowercased basenames
        basenames: HashSet<String>,
        /// Normalized paths relative to the monitored root
        relative_paths: HashSet<PathBuf>,
    },
}

impl ScopeFilter {
    /// Parse filter tokens as given on the command line or in the config file.
    ///
    /// Each entry may itself be a comma-separated list. A token containing a
    /// path separator is a relative path, anything else is a basename. No
    /// tokens at all yields [`ScopeFilter::Unrestricted`].
    pub fn parse<S: AsRef<str>>(tokens: &[S]) -> Result<Self> {
        let mut basenames = HashSet::new();
        let mut relative_paths = HashSet::new();

        for raw in tokens
            .iter()
            .flat_map(|t| t.as_ref().split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            let token = raw.replace('\\', "/");
            if token.contains('/') {
                let candidate = Path::new(&token);
                if candidate.is_absolute() {
                    return Err(Error::FilterParse {
                        token: raw.to_string(),
                        reason: "paths must be relative to the monitored root".into(),
                    });
                }
                let normalized = normalize_relative(candidate).ok_or_else(|| Error::FilterParse {
                    token: raw.to_string(),
                    reason: "path escapes the monitored root".into(),
                })?;
                relative_paths.insert(normalized);
            } else {
                basenames.insert(token.to_lowercase());
            }
        }

        if basenames.is_empty() && relative_paths.is_empty() {
            Ok(ScopeFilter::Unrestricted)
        } else {
            Ok(ScopeFilter::Only {
                basenames,
                relative_paths,
            })
        }
    }

    /// Whether the filter is unrestricted
    pub fn is_unrestricted(&self) -> bool {
        matches!(self, ScopeFilter::Unrestricted)
    }
}

/// Scope filter bound to a monitored root
#[derive(Debug, Clone)]
pub struct PathFilter {
    root: PathBuf,
    scope: ScopeFilter,
    /// Tool-owned locations (snapshot dir, duplicates dir, audit log)
    internal: Vec<PathBuf>,
}

impl PathFilter {
    /// Create a filter for `root`
    pub fn new(root: impl Into<PathBuf>, scope: ScopeFilter) -> Self {
        Self {
            root: root.into(),
            scope,
            internal: Vec::new(),
        }
    }

    /// Exclude a tool-owned file or directory, even under an unrestricted scope
    pub fn with_internal(mut self, path: impl Into<PathBuf>) -> Self {
        self.internal.push(path.into());
        self
    }

    /// Monitored root this filter is relative to
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The configured scope
    pub fn scope(&self) -> &ScopeFilter {
        &self.scope
    }

    /// Whether `path` lies inside a tool-owned location
    pub fn is_internal(&self, path: &Path) -> bool {
        self.internal.iter().any(|p| path.starts_with(p))
    }

    /// Resolve `.` and `..` in a path under the root. `None` if it is not
    /// under the root or climbs out of it.
    pub fn resolve(&self, path: &Path) -> Option<PathBuf> {
        let rel = normalize_relative(path.strip_prefix(&self.root).ok()?)?;
        Some(self.root.join(rel))
    }

    /// Whether an absolute path is in scope
    pub fn matches(&self, path: &Path) -> bool {
        if self.is_internal(path) {
            return false;
        }

        let (basenames, relative_paths) = match &self.scope {
            ScopeFilter::Unrestricted => return true,
            ScopeFilter::Only {
                basenames,
                relative_paths,
            } => (basenames, relative_paths),
        };

        let basename_hit = path
            .file_name()
            .map(|n| basenames.contains(&n.to_string_lossy().to_lowercase()))
            .unwrap_or(false);
        if basename_hit {
            return true;
        }

        // Outside the root only the basename can match
        match path.strip_prefix(&self.root) {
            Ok(rel) => normalize_relative(rel)
                .map(|rel| relative_paths.contains(&rel))
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Lexically normalize a relative path. Returns `None` if it is absolute or
/// climbs above its starting point.
pub fn normalize_relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}
