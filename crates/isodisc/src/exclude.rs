//! Path and leaf-name exclusion, shared by the add and compare walks.
//!
//! Two sets: absolute path prefixes (matched whole-path or as subtree
//! roots) and bourne-style leaf globs compiled to anchored regular
//! expressions and matched against the basename only.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::{Error, Result};

/// Named mode switches of an exclusion set.
#[derive(Debug, Clone, Copy)]
pub struct ExcludeMode {
    /// Whether the set is consulted at all.
    pub enabled: bool,
    /// Whether top-level command parameters are checked too.
    pub param_enabled: bool,
    /// Whether a matching path prefix excludes the whole subtree.
    pub subtree: bool,
    /// Soft-ignore a match instead of failing the operation.
    pub soft: bool,
}

impl Default for ExcludeMode {
    fn default() -> Self {
        Self {
            enabled: true,
            param_enabled: false,
            subtree: true,
            soft: true,
        }
    }
}

/// Why a path was excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcludeMatch {
    No,
    /// A path prefix matched.
    Path,
    /// A leaf glob matched the basename.
    Leaf,
}

#[derive(Debug, Default)]
pub struct Exclusions {
    paths: Vec<PathBuf>,
    leaf_sources: Vec<String>,
    leaf_patterns: Vec<Regex>,
    pub mode: ExcludeMode,
}

impl Exclusions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_path(&mut self, path: &Path) {
        self.paths.push(path.to_path_buf());
    }

    /// Compiles and adds a leaf glob.
    pub fn add_leaf(&mut self, glob: &str) -> Result<()> {
        let pattern = glob_to_regex(glob);
        let regex = Regex::new(&pattern)
            .map_err(|e| Error::BadPattern(format!("{glob}: {e}")))?;
        self.leaf_sources.push(glob.to_string());
        self.leaf_patterns.push(regex);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.leaf_patterns.is_empty()
    }

    /// Checks a disk path against both sets.
    pub fn matches(&self, path: &Path) -> ExcludeMatch {
        if !self.mode.enabled {
            return ExcludeMatch::No;
        }
        for prefix in &self.paths {
            if path == prefix || (self.mode.subtree && path.starts_with(prefix)) {
                return ExcludeMatch::Path;
            }
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            for pattern in &self.leaf_patterns {
                if pattern.is_match(name) {
                    return ExcludeMatch::Leaf;
                }
            }
        }
        ExcludeMatch::No
    }
}

/// Translates a bourne glob to regex form, anchored at both ends.
/// `*` and `?` become `.*` and `.`; character classes pass through with
/// their leading `!` rewritten to `^`.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if regex_syntax_char(inner) && inner != '-' {
                        out.push('\\');
                    }
                    out.push(inner);
                }
                out.push(']');
            }
            c if regex_syntax_char(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    out
}

fn regex_syntax_char(c: char) -> bool {
    matches!(
        c,
        '.' | '+' | '(' | ')' | '{' | '}' | '^' | '$' | '|' | '\\' | '[' | ']' | '*' | '?' | '-'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_globs_match_basenames_only() {
        let mut excl = Exclusions::new();
        excl.add_leaf("*.o").unwrap();
        excl.add_leaf("core?").unwrap();
        assert_eq!(excl.matches(Path::new("/src/main.o")), ExcludeMatch::Leaf);
        assert_eq!(excl.matches(Path::new("/src/core1")), ExcludeMatch::Leaf);
        assert_eq!(excl.matches(Path::new("/src/main.obj")), ExcludeMatch::No);
        assert_eq!(excl.matches(Path::new("/o/file.rs")), ExcludeMatch::No);
    }

    #[test]
    fn glob_matching_is_anchored() {
        let mut excl = Exclusions::new();
        excl.add_leaf("tmp").unwrap();
        assert_eq!(excl.matches(Path::new("/x/tmp")), ExcludeMatch::Leaf);
        assert_eq!(excl.matches(Path::new("/x/tmpfile")), ExcludeMatch::No);
        assert_eq!(excl.matches(Path::new("/x/atmp")), ExcludeMatch::No);
    }

    #[test]
    fn character_classes_translate() {
        let mut excl = Exclusions::new();
        excl.add_leaf("file[0-9]").unwrap();
        excl.add_leaf("x[!ab]").unwrap();
        assert_eq!(excl.matches(Path::new("/file7")), ExcludeMatch::Leaf);
        assert_eq!(excl.matches(Path::new("/filex")), ExcludeMatch::No);
        assert_eq!(excl.matches(Path::new("/xc")), ExcludeMatch::Leaf);
        assert_eq!(excl.matches(Path::new("/xa")), ExcludeMatch::No);
    }

    #[test]
    fn path_prefixes_exclude_subtrees() {
        let mut excl = Exclusions::new();
        excl.add_path(Path::new("/skip/me"));
        assert_eq!(excl.matches(Path::new("/skip/me")), ExcludeMatch::Path);
        assert_eq!(
            excl.matches(Path::new("/skip/me/deeper/file")),
            ExcludeMatch::Path
        );
        assert_eq!(excl.matches(Path::new("/skip/metoo")), ExcludeMatch::No);

        excl.mode.subtree = false;
        assert_eq!(excl.matches(Path::new("/skip/me/deeper")), ExcludeMatch::No);
        assert_eq!(excl.matches(Path::new("/skip/me")), ExcludeMatch::Path);
    }

    #[test]
    fn disabled_set_matches_nothing() {
        let mut excl = Exclusions::new();
        excl.add_path(Path::new("/skip"));
        excl.mode.enabled = false;
        assert_eq!(excl.matches(Path::new("/skip")), ExcludeMatch::No);
    }
}
