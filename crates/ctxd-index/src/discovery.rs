//! File discovery under layered ignore rules.
//!
//! Candidate files are every regular file under the root that is neither
//! matched by a `.gitignore` anywhere in the tree (each scoped to its own
//! directory) nor by a configured exclude glob. Size and text checks run
//! per file at index time via [`FileDiscovery::check_file`].

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Name of the per-directory ignore file.
pub const IGNORE_FILE: &str = ".gitignore";

/// Bytes inspected when deciding whether a file is text.
const SNIFF_BYTES: usize = 8192;

/// Errors raised while enumerating files.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Path does not exist: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid ignore pattern: {0}")]
    Pattern(#[from] ignore::Error),
}

/// Configuration for file discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Glob patterns excluded regardless of ignore files (gitignore syntax)
    pub exclude: Vec<String>,
    /// Files larger than this are skipped
    pub max_file_size: u64,
    /// Honour `.gitignore` files below the root, not only the root's own
    pub nested_gitignore: bool,
    /// Maximum directory depth walked below the root
    pub max_depth: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            exclude: default_excludes(),
            max_file_size: 1_048_576,
            nested_gitignore: true,
            max_depth: 64,
        }
    }
}

/// Exclude globs applied when no configuration overrides them.
pub fn default_excludes() -> Vec<String> {
    [
        "node_modules",
        "*.min.js",
        "dist",
        "build",
        ".venv",
        "venv",
        "__pycache__",
        "*.pyc",
        ".git",
        ".ctxd",
        ".ctxcache",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Outcome of the per-file runtime checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileCheck {
    Indexable,
    TooLarge(u64),
    NotText,
    Unreadable(String),
}

/// Rewrite one line of a nested ignore file so it is relative to the root.
///
/// `dir` is the ignore file's directory relative to the root, using `/`.
/// Returns `None` for blank lines and comments.
pub fn scope_pattern(dir: &str, line: &str) -> Option<String> {
    let line = line.trim_end();
    if line.trim().is_empty() || line.starts_with('#') {
        return None;
    }
    if dir.is_empty() {
        return Some(line.to_string());
    }

    let (negation, pattern) = match line.strip_prefix('!') {
        Some(rest) => ("!", rest),
        None => ("", line),
    };

    // A slash anywhere but the end anchors the pattern to its directory;
    // otherwise it matches at any depth below it.
    let body = pattern.trim_end_matches('/');
    let scoped = if let Some(anchored) = pattern.strip_prefix('/') {
        format!("{}/{}", dir, anchored)
    } else if body.contains('/') {
        format!("{}/{}", dir, pattern)
    } else {
        format!("{}/**/{}", dir, pattern)
    };

    Some(format!("{}{}", negation, scoped))
}

/// Merged ignore matchers for one root.
pub struct IgnoreRules {
    gitignore: Option<Gitignore>,
    excludes: Gitignore,
}

impl IgnoreRules {
    /// Load every ignore file under `root` and compile the exclude globs.
    ///
    /// No ignore files at all means no restrictions beyond the excludes.
    pub fn load(root: &Path, config: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let ignore_files = find_ignore_files(root, config)?;

        let gitignore = if ignore_files.is_empty() {
            debug!("No .gitignore files found under {:?}", root);
            None
        } else {
            let mut builder = GitignoreBuilder::new(root);
            let mut pattern_count = 0;

            for file in &ignore_files {
                let dir = file
                    .parent()
                    .and_then(|p| p.strip_prefix(root).ok())
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_default();

                let content = match fs::read(file) {
                    Ok(bytes) => decode_dropping_invalid(&bytes),
                    Err(e) => {
                        warn!("Failed to read {:?}: {}", file, e);
                        continue;
                    }
                };

                for line in content.lines() {
                    let Some(pattern) = scope_pattern(&dir, line) else {
                        continue;
                    };
                    match builder.add_line(Some(file.clone()), &pattern) {
                        Ok(_) => pattern_count += 1,
                        Err(e) => warn!("Skipping invalid pattern {:?} in {:?}: {}", line, file, e),
                    }
                }
            }

            info!(
                "Loaded {} ignore patterns from {} .gitignore files",
                pattern_count,
                ignore_files.len()
            );
            Some(builder.build()?)
        };

        let mut builder = GitignoreBuilder::new(root);
        for pattern in &config.exclude {
            if let Err(e) = builder.add_line(None, pattern) {
                warn!("Skipping invalid exclude pattern {:?}: {}", pattern, e);
            }
        }
        let excludes = builder.build()?;

        Ok(Self {
            gitignore,
            excludes,
        })
    }

    /// Whether `path` (under the root) is excluded.
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        if self.excludes.matched(path, is_dir).is_ignore() {
            return true;
        }
        self.gitignore
            .as_ref()
            .map(|g| g.matched(path, is_dir).is_ignore())
            .unwrap_or(false)
    }
}

fn find_ignore_files(root: &Path, config: &DiscoveryConfig) -> Result<Vec<PathBuf>, DiscoveryError> {
    let root_file = root.join(IGNORE_FILE);
    if !config.nested_gitignore {
        return Ok(if root_file.is_file() { vec![root_file] } else { Vec::new() });
    }

    // Exclude globs still prune the search so vendored trees are not read.
    let mut excludes = GitignoreBuilder::new(root);
    for pattern in &config.exclude {
        excludes.add_line(None, pattern).ok();
    }
    let excludes = excludes.build()?;

    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .max_depth(config.max_depth)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !excludes.matched(e.path(), e.file_type().is_dir()).is_ignore())
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == IGNORE_FILE)
        .map(|e| e.into_path())
        .collect();

    // Parents before children so deeper files take precedence.
    files.sort_by_key(|p| p.components().count());
    Ok(files)
}

/// Enumerates indexable files below a root.
#[derive(Debug, Clone, Default)]
pub struct FileDiscovery {
    config: DiscoveryConfig,
}

impl FileDiscovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Return every candidate file under `root`, sorted by path.
    ///
    /// Directories matched by a rule are not descended into. Symlinked
    /// directories are not followed and depth is bounded by `max_depth`.
    pub fn discover(&self, root: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
        if !root.exists() {
            return Err(DiscoveryError::NotFound(root.to_path_buf()));
        }

        let rules = IgnoreRules::load(root, &self.config)?;
        let mut files = Vec::new();

        let walker = WalkDir::new(root)
            .max_depth(self.config.max_depth)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !rules.is_ignored(e.path(), e.file_type().is_dir()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };

            // Symlinks to files count; symlinks to directories were not followed.
            if entry.file_type().is_dir() || !entry.path().is_file() {
                continue;
            }
            files.push(entry.into_path());
        }

        files.sort();
        debug!("Discovered {} candidate files under {:?}", files.len(), root);
        Ok(files)
    }

    /// Size and text checks applied to each discovered file before indexing.
    pub fn check_file(&self, path: &Path) -> FileCheck {
        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) => return FileCheck::Unreadable(e.to_string()),
        };

        if size > self.config.max_file_size {
            warn!(
                "Skipping large file: {:?} ({:.1}MB > {:.1}MB limit)",
                path,
                size as f64 / 1024.0 / 1024.0,
                self.config.max_file_size as f64 / 1024.0 / 1024.0
            );
            return FileCheck::TooLarge(size);
        }

        let mut head = Vec::with_capacity(SNIFF_BYTES);
        let read = fs::File::open(path).and_then(|f| f.take(SNIFF_BYTES as u64).read_to_end(&mut head));
        match read {
            Ok(_) if head.contains(&0) => FileCheck::NotText,
            Ok(_) => FileCheck::Indexable,
            Err(e) => FileCheck::Unreadable(e.to_string()),
        }
    }
}

/// Decode bytes as UTF-8, dropping invalid sequences instead of failing.
pub fn decode_dropping_invalid(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        out.push_str(chunk.valid());
    }
    out
}

/// Read a file as text, dropping invalid UTF-8 sequences.
pub fn read_text_lossy(path: &Path) -> io::Result<String> {
    fs::read(path).map(|bytes| decode_dropping_invalid(&bytes))
}

/// Path of `file` relative to `base`, always with `/` separators.
pub fn relative_path(file: &Path, base: &Path) -> String {
    let rel = file.strip_prefix(base).unwrap_or(file);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rel_names(root: &Path, files: &[PathBuf]) -> Vec<String> {
        files.iter().map(|f| relative_path(f, root)).collect()
    }

    #[test]
    fn test_scope_pattern() {
        assert_eq!(scope_pattern("", "*.log").as_deref(), Some("*.log"));
        assert_eq!(scope_pattern("sub", "*.log").as_deref(), Some("sub/**/*.log"));
        assert_eq!(scope_pattern("sub", "/out").as_deref(), Some("sub/out"));
        assert_eq!(scope_pattern("sub", "gen/*.rs").as_deref(), Some("sub/gen/*.rs"));
        assert_eq!(scope_pattern("sub", "!keep.log").as_deref(), Some("!sub/**/keep.log"));
        assert_eq!(scope_pattern("sub", "cache/").as_deref(), Some("sub/**/cache/"));
        assert_eq!(scope_pattern("sub", "# comment"), None);
        assert_eq!(scope_pattern("sub", "   "), None);
    }

    #[test]
    fn test_root_gitignore_respected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".gitignore"), "b.py\n").unwrap();
        fs::write(dir.path().join("a.py"), "def foo():\n    pass\n").unwrap();
        fs::write(dir.path().join("b.py"), "def bar():\n    pass\n").unwrap();

        let files = FileDiscovery::default().discover(dir.path()).unwrap();
        let names = rel_names(dir.path(), &files);

        assert!(names.contains(&"a.py".to_string()));
        assert!(!names.contains(&"b.py".to_string()));
    }

    #[test]
    fn test_nested_gitignore_is_scoped() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir_all(sub.join("deep")).unwrap();
        fs::write(sub.join(".gitignore"), "*.log\n!keep.log\n").unwrap();
        fs::write(dir.path().join("top.log"), "x").unwrap();
        fs::write(sub.join("a.log"), "x").unwrap();
        fs::write(sub.join("deep").join("b.log"), "x").unwrap();
        fs::write(sub.join("keep.log"), "x").unwrap();

        let files = FileDiscovery::default().discover(dir.path()).unwrap();
        let names = rel_names(dir.path(), &files);

        assert!(names.contains(&"top.log".to_string()));
        assert!(names.contains(&"sub/keep.log".to_string()));
        assert!(!names.contains(&"sub/a.log".to_string()));
        assert!(!names.contains(&"sub/deep/b.log".to_string()));
    }

    #[test]
    fn test_default_excludes() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("node_modules/pkg/index.js"), "x").unwrap();
        fs::write(dir.path().join("src/app.min.js"), "x").unwrap();
        fs::write(dir.path().join("src/app.js"), "x").unwrap();

        let files = FileDiscovery::default().discover(dir.path()).unwrap();
        assert_eq!(rel_names(dir.path(), &files), vec!["src/app.js".to_string()]);
    }

    #[test]
    fn test_nested_gitignore_disabled() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/.gitignore"), "*.txt\n").unwrap();
        fs::write(dir.path().join("sub/notes.txt"), "x").unwrap();

        let config = DiscoveryConfig {
            nested_gitignore: false,
            ..Default::default()
        };
        let files = FileDiscovery::new(config).discover(dir.path()).unwrap();
        assert!(rel_names(dir.path(), &files).contains(&"sub/notes.txt".to_string()));
    }

    #[test]
    fn test_missing_root() {
        let dir = tempdir().unwrap();
        let result = FileDiscovery::default().discover(&dir.path().join("missing"));
        assert!(matches!(result, Err(DiscoveryError::NotFound(_))));
    }

    #[test]
    fn test_check_file_size_and_text() {
        let dir = tempdir().unwrap();
        let small = dir.path().join("small.txt");
        let big = dir.path().join("big.txt");
        let binary = dir.path().join("blob.bin");
        fs::write(&small, "hello").unwrap();
        fs::write(&big, "x".repeat(2048)).unwrap();
        fs::write(&binary, [0u8, 159, 146, 150]).unwrap();

        let discovery = FileDiscovery::new(DiscoveryConfig {
            max_file_size: 1024,
            ..Default::default()
        });

        assert_eq!(discovery.check_file(&small), FileCheck::Indexable);
        assert_eq!(discovery.check_file(&big), FileCheck::TooLarge(2048));
        assert_eq!(discovery.check_file(&binary), FileCheck::NotText);
        assert!(matches!(
            discovery.check_file(&dir.path().join("nope")),
            FileCheck::Unreadable(_)
        ));
    }

    #[test]
    fn test_decode_drops_invalid_bytes() {
        let bytes = b"caf\xc3\xa9 \xff\xfeok";
        assert_eq!(decode_dropping_invalid(bytes), "café ok");
    }

    #[test]
    fn test_relative_path_uses_forward_slashes() {
        let base = Path::new("/project");
        assert_eq!(relative_path(Path::new("/project/src/a.py"), base), "src/a.py");
    }
}
