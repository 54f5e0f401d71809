//! Architectural Enforcement Integration Tests
//!
//! Shared source scanning for the enforcement tests under `tests/`:
//! - No sleep() calls in production code
//! - No blocking I/O inside async functions
//!
//! Scanning is line based. Everything from a file's first `#[cfg(test)]`
//! onward is treated as test code and skipped.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["gateway/core/src", "gateway/daemon/src"];

/// Workspace root (two levels above this crate)
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// The production part of one source file
#[derive(Debug)]
pub struct SourceFile {
    /// Path relative to the workspace root
    pub path: PathBuf,
    /// Lines before the first `#[cfg(test)]`
    pub lines: Vec<String>,
}

impl SourceFile {
    /// Split `content` at its test module
    #[must_use]
    pub fn parse(path: PathBuf, content: &str) -> Self {
        let lines = content
            .lines()
            .take_while(|l| !l.trim_start().starts_with("#[cfg(test)]"))
            .map(str::to_string)
            .collect();
        Self { path, lines }
    }

    /// Whether the file imports `module` (e.g. `std::fs`)
    #[must_use]
    pub fn imports(&self, module: &str) -> bool {
        let needle = format!("use {module}");
        self.lines
            .iter()
            .any(|l| code_part(l).trim_start().starts_with(&needle))
    }
}

/// Every production `.rs` file in the workspace
#[must_use]
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let Ok(content) = fs::read_to_string(entry.path()) else {
                continue;
            };
            let relative = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_path_buf();
            files.push(SourceFile::parse(relative, &content));
        }
    }
    files
}

/// The code portion of a line; doc and line comments are dropped
#[must_use]
pub fn code_part(line: &str) -> &str {
    let trimmed = line.trim_start();
    if trimmed.starts_with("//") {
        return "";
    }
    line.split("//").next().unwrap_or(line)
}

/// Kind of the function enclosing a line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FnContext {
    /// A plain `fn`
    Sync,
    /// An `async fn`
    Async,
    /// Module level, or the scan hit an `impl`/`mod` boundary first
    None,
}

/// Classify a line as a function signature
fn signature(line: &str) -> Option<FnContext> {
    let mut rest = line.trim_start();
    for prefix in ["pub(crate) ", "pub(super) ", "pub "] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    if rest.starts_with("async fn ") {
        Some(FnContext::Async)
    } else if rest.starts_with("fn ") || rest.starts_with("const fn ") || rest.starts_with("unsafe fn ") {
        Some(FnContext::Sync)
    } else {
        None
    }
}

/// Find the function enclosing `lines[idx]` by scanning backwards
#[must_use]
pub fn enclosing_fn(lines: &[String], idx: usize) -> FnContext {
    for line in lines[..idx].iter().rev() {
        if let Some(kind) = signature(line) {
            return kind;
        }
        let trimmed = line.trim_start();
        if trimmed.starts_with("mod ") || (trimmed.starts_with("impl") && trimmed.contains('{')) {
            return FnContext::None;
        }
    }
    FnContext::None
}

/// One rule violation
#[derive(Debug)]
pub struct Violation {
    /// File, relative to the workspace root
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// What was found
    pub reason: &'static str,
    /// The offending line
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.reason,
            self.text.trim()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(src: &[&str]) -> Vec<String> {
        src.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_async_function_detection() {
        let code = lines(&[
            "    pub async fn run(&self) {",
            "        let contents = std::fs::read_to_string(\"file.txt\")?;",
            "    }",
        ]);
        assert_eq!(enclosing_fn(&code, 1), FnContext::Async);
    }

    #[test]
    fn test_sync_function_detection() {
        let code = lines(&[
            "pub(crate) fn load() {",
            "    let contents = std::fs::read_to_string(\"gateway.toml\")?;",
            "}",
        ]);
        assert_eq!(enclosing_fn(&code, 1), FnContext::Sync);
    }

    #[test]
    fn test_impl_boundary_stops_scan() {
        let code = lines(&["impl Server {", "    const LIMIT: usize = 4;"]);
        assert_eq!(enclosing_fn(&code, 1), FnContext::None);
    }

    #[test]
    fn test_test_module_is_cut() {
        let file = SourceFile::parse(
            PathBuf::from("x.rs"),
            "use std::fs;\nfn a() {}\n#[cfg(test)]\nmod tests {\n    use std::net;\n}\n",
        );
        assert_eq!(file.lines.len(), 2);
        assert!(file.imports("std::fs"));
        assert!(!file.imports("std::net"));
    }

    #[test]
    fn test_comments_are_ignored() {
        assert_eq!(code_part("    /// tokio::time::sleep(d)"), "");
        assert_eq!(code_part("let a = 1; // std::fs::write"), "let a = 1; ");
    }
}
