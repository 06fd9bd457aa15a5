//! Row predicates and the search filter builder that produces them.

use std::fmt;

use super::Chunk;

/// Chunk column a predicate can test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Path,
    Branch,
    ChunkType,
    Language,
    FileHash,
}

impl Column {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Branch => "branch",
            Self::ChunkType => "chunk_type",
            Self::Language => "language",
            Self::FileHash => "file_hash",
        }
    }

    fn value<'a>(&self, chunk: &'a Chunk) -> Option<&'a str> {
        match self {
            Self::Path => Some(chunk.path.as_str()),
            Self::Branch => chunk.branch.as_deref(),
            Self::ChunkType => Some(chunk.chunk_type.as_str()),
            Self::Language => Some(chunk.language.as_str()),
            Self::FileHash => Some(chunk.file_hash.as_str()),
        }
    }
}

/// A boolean condition over chunk rows.
///
/// Renders as a SQL-like `WHERE` clause and can be evaluated directly
/// against a [`Chunk`]. A null column never matches.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(Column, String),
    /// `%` matches any run of characters.
    Like(Column, String),
    In(Column, Vec<String>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(column: Column, value: impl Into<String>) -> Self {
        Self::Eq(column, value.into())
    }

    pub fn like(column: Column, pattern: impl Into<String>) -> Self {
        Self::Like(column, pattern.into())
    }

    /// Whether `chunk` satisfies this predicate.
    pub fn matches(&self, chunk: &Chunk) -> bool {
        match self {
            Self::Eq(col, value) => col.value(chunk) == Some(value.as_str()),
            Self::Like(col, pattern) => col.value(chunk).map(|v| like_match(pattern, v)).unwrap_or(false),
            Self::In(col, values) => col
                .value(chunk)
                .map(|v| values.iter().any(|x| x == v))
                .unwrap_or(false),
            Self::And(parts) => parts.iter().all(|p| p.matches(chunk)),
            Self::Or(parts) => parts.iter().any(|p| p.matches(chunk)),
        }
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq(col, value) => write!(f, "{} = {}", col.as_str(), quote(value)),
            Self::Like(col, pattern) => write!(f, "{} LIKE {}", col.as_str(), quote(pattern)),
            Self::In(col, values) => {
                let list: Vec<String> = values.iter().map(|v| quote(v)).collect();
                write!(f, "{} IN ({})", col.as_str(), list.join(", "))
            }
            Self::And(parts) | Self::Or(parts) => {
                let joiner = if matches!(self, Self::And(_)) { " AND " } else { " OR " };
                let rendered: Vec<String> = parts
                    .iter()
                    .map(|p| match p {
                        Self::And(_) | Self::Or(_) => format!("({})", p),
                        _ => p.to_string(),
                    })
                    .collect();
                f.write_str(&rendered.join(joiner))
            }
        }
    }
}

/// SQL `LIKE` with `%` wildcards, case-sensitive.
pub fn like_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return pattern == value;
    }

    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !value.starts_with(first) || value.len() < first.len() + last.len() {
        return false;
    }

    let mut rest = &value[first.len()..];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(pos) => rest = &rest[pos + middle.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

/// Optional search filters. Absent filters add no condition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    /// Substring of the file path
    pub file: Option<String>,
    pub branch: Option<String>,
    /// File extensions, any of which may match (e.g. `.py`)
    pub extensions: Vec<String>,
    /// Path prefixes, any of which may match (e.g. `src/`)
    pub directories: Vec<String>,
    pub chunk_types: Vec<String>,
    pub languages: Vec<String>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_directories(mut self, directories: Vec<String>) -> Self {
        self.directories = directories;
        self
    }

    pub fn with_chunk_types(mut self, chunk_types: Vec<String>) -> Self {
        self.chunk_types = chunk_types;
        self
    }

    pub fn with_languages(mut self, languages: Vec<String>) -> Self {
        self.languages = languages;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.to_predicate().is_none()
    }

    /// AND of every active filter, or `None` when no filter is set.
    pub fn to_predicate(&self) -> Option<Predicate> {
        let mut conditions = Vec::new();

        if !self.extensions.is_empty() {
            conditions.push(any_of(
                self.extensions
                    .iter()
                    .map(|ext| Predicate::like(Column::Path, format!("%{}", ext)))
                    .collect(),
            ));
        }

        if !self.directories.is_empty() {
            conditions.push(any_of(
                self.directories
                    .iter()
                    .map(|dir| Predicate::like(Column::Path, directory_pattern(dir)))
                    .collect(),
            ));
        }

        if !self.chunk_types.is_empty() {
            conditions.push(Predicate::In(Column::ChunkType, self.chunk_types.clone()));
        }

        if !self.languages.is_empty() {
            conditions.push(Predicate::In(Column::Language, self.languages.clone()));
        }

        if let Some(file) = &self.file {
            conditions.push(Predicate::like(Column::Path, format!("%{}%", file)));
        }

        if let Some(branch) = &self.branch {
            conditions.push(Predicate::eq(Column::Branch, branch.clone()));
        }

        match conditions.len() {
            0 => None,
            1 => conditions.pop(),
            _ => Some(Predicate::And(conditions)),
        }
    }

    /// Stable `key=value` pairs for every active filter, sorted by key.
    pub fn cache_parts(&self) -> Vec<String> {
        let mut parts = Vec::new();
        if !self.chunk_types.is_empty() {
            parts.push(format!("chunk_types={:?}", self.chunk_types));
        }
        if !self.directories.is_empty() {
            parts.push(format!("directories={:?}", self.directories));
        }
        if !self.extensions.is_empty() {
            parts.push(format!("extensions={:?}", self.extensions));
        }
        if let Some(file) = &self.file {
            parts.push(format!("file={}", file));
        }
        if let Some(branch) = &self.branch {
            parts.push(format!("branch={}", branch));
        }
        if !self.languages.is_empty() {
            parts.push(format!("languages={:?}", self.languages));
        }
        parts.sort();
        parts
    }
}

/// `LIKE` pattern for every path under `dir`. `src`, `src/` and `./src`
/// all mean the `src/` directory; `.` means the whole tree.
fn directory_pattern(dir: &str) -> String {
    let mut dir = dir.trim();
    while let Some(rest) = dir.strip_prefix("./") {
        dir = rest;
    }
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() || dir == "." {
        "%".to_string()
    } else {
        format!("{}/%", dir)
    }
}

fn any_of(mut options: Vec<Predicate>) -> Predicate {
    if options.len() == 1 {
        options.remove(0)
    } else {
        Predicate::Or(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkType;

    fn chunk(path: &str, language: &str, branch: Option<&str>) -> Chunk {
        Chunk {
            vector: vec![0.0; 4],
            text: String::new(),
            path: path.to_string(),
            start_line: 1,
            end_line: 1,
            chunk_type: ChunkType::Function,
            name: None,
            language: language.to_string(),
            file_hash: "h".to_string(),
            indexed_at: 0.0,
            branch: branch.map(String::from),
        }
    }

    #[test]
    fn test_like_match() {
        assert!(like_match("%.py", "src/a.py"));
        assert!(!like_match("%.py", "src/a.pyc"));
        assert!(like_match("src/%", "src/a.py"));
        assert!(!like_match("src/%", "lib/src/a.py"));
        assert!(like_match("%util%", "src/utils.rs"));
        assert!(like_match("a%b%c", "a--b--c"));
        assert!(!like_match("ab%ba", "aba"));
        assert!(like_match("exact", "exact"));
        assert!(like_match("%", ""));
    }

    #[test]
    fn test_empty_filter_has_no_predicate() {
        assert!(SearchFilter::new().to_predicate().is_none());
        assert!(SearchFilter::new().is_empty());
    }

    #[test]
    fn test_filter_renders_and_of_conditions() {
        let filter = SearchFilter::new()
            .with_extensions(vec![".py".into(), ".js".into()])
            .with_directories(vec!["src/".into()])
            .with_chunk_types(vec!["function".into(), "class".into()])
            .with_branch("main");

        let rendered = filter.to_predicate().unwrap().to_string();
        assert_eq!(
            rendered,
            "(path LIKE '%.py' OR path LIKE '%.js') AND path LIKE 'src/%' AND \
             chunk_type IN ('function', 'class') AND branch = 'main'"
        );
    }

    #[test]
    fn test_quotes_are_escaped() {
        let predicate = Predicate::eq(Column::Path, "it's.py");
        assert_eq!(predicate.to_string(), "path = 'it''s.py'");
    }

    #[test]
    fn test_predicate_evaluation() {
        let filter = SearchFilter::new()
            .with_extensions(vec![".py".into()])
            .with_languages(vec!["python".into()])
            .with_file("util");
        let predicate = filter.to_predicate().unwrap();

        assert!(predicate.matches(&chunk("src/utils.py", "python", None)));
        assert!(!predicate.matches(&chunk("src/main.py", "python", None)));
        assert!(!predicate.matches(&chunk("src/utils.rs", "rust", None)));
    }

    #[test]
    fn test_null_branch_never_matches() {
        let predicate = SearchFilter::new().with_branch("main").to_predicate().unwrap();
        assert!(!predicate.matches(&chunk("a.py", "python", None)));
        assert!(predicate.matches(&chunk("a.py", "python", Some("main"))));
    }

    #[test]
    fn test_directory_prefix_is_normalized() {
        for dir in ["src", "src/", "./src", "./src/"] {
            let predicate = SearchFilter::new()
                .with_directories(vec![dir.to_string()])
                .to_predicate()
                .unwrap();
            assert_eq!(predicate.to_string(), "path LIKE 'src/%'");
            assert!(predicate.matches(&chunk("src/lib.rs", "rust", None)));
            assert!(!predicate.matches(&chunk("src2/lib.rs", "rust", None)));
        }

        let everything = SearchFilter::new()
            .with_directories(vec!["./".to_string()])
            .to_predicate()
            .unwrap();
        assert!(everything.matches(&chunk("any/where.rs", "rust", None)));
    }

    #[test]
    fn test_cache_parts_sorted() {
        let filter = SearchFilter::new().with_file("x").with_branch("dev");
        assert_eq!(filter.cache_parts(), vec!["branch=dev".to_string(), "file=x".to_string()]);
    }
}
