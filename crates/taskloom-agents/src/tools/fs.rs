use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ignore::WalkBuilder;
use regex::Regex;
use taskloom_common::{Error, Result};
use tracing::debug;

use crate::parser::ToolParams;
use crate::tools::{Tool, ToolContext, ToolOutput, optional_flag, required_param, truncate_output};

const MAX_LISTED_ENTRIES: usize = 1_000;
const MAX_SEARCH_MATCHES: usize = 200;

fn io_error(tool: &str, path: &Path, e: std::io::Error) -> Error {
    Error::Tool(format!("{tool}: {}: {e}", path.display()))
}

pub struct ReadFile {
    max_output_bytes: usize,
}

impl ReadFile {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }
}

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Read a UTF-8 text file."
    }

    fn parameters(&self) -> &'static [(&'static str, &'static str)] {
        &[("path", "file path, relative to the working directory")]
    }

    async fn execute(&self, context: &ToolContext, params: &ToolParams) -> Result<ToolOutput> {
        let path = context.resolve(required_param(params, self.name(), "path")?);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_error(self.name(), &path, e))?;
        Ok(ToolOutput::success(truncate_output(
            content,
            self.max_output_bytes,
        )))
    }
}

pub struct WriteToFile;

#[async_trait]
impl Tool for WriteToFile {
    fn name(&self) -> &'static str {
        "write_to_file"
    }

    fn description(&self) -> &'static str {
        "Create or overwrite a file with the given content. Parent directories are created."
    }

    fn parameters(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("path", "file path, relative to the working directory"),
            ("content", "complete new file content"),
        ]
    }

    async fn execute(&self, context: &ToolContext, params: &ToolParams) -> Result<ToolOutput> {
        let path = context.resolve(required_param(params, self.name(), "path")?);
        let content = required_param(params, self.name(), "content")?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(self.name(), parent, e))?;
        }
        let mut body = content.to_string();
        if !body.is_empty() && !body.ends_with('\n') {
            body.push('\n');
        }
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| io_error(self.name(), &path, e))?;
        Ok(ToolOutput::success(format!(
            "Wrote {} bytes to {}",
            content.len(),
            path.display()
        )))
    }
}

pub struct ReplaceInFile;

#[async_trait]
impl Tool for ReplaceInFile {
    fn name(&self) -> &'static str {
        "replace_in_file"
    }

    fn description(&self) -> &'static str {
        "Replace the first exact occurrence of `search` with `replace` in a file."
    }

    fn parameters(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("path", "file path, relative to the working directory"),
            ("search", "exact text to find"),
            ("replace", "replacement text"),
        ]
    }

    async fn execute(&self, context: &ToolContext, params: &ToolParams) -> Result<ToolOutput> {
        let path = context.resolve(required_param(params, self.name(), "path")?);
        let search = required_param(params, self.name(), "search")?;
        let replace = params.get("replace").map(String::as_str).unwrap_or("");
        if search.is_empty() {
            return Ok(ToolOutput::error("replace_in_file: `search` must not be empty"));
        }

        let original = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_error(self.name(), &path, e))?;
        let Some(offset) = original.find(search) else {
            return Ok(ToolOutput::error(format!(
                "replace_in_file: search text not found in {}",
                path.display()
            )));
        };

        let mut updated = String::with_capacity(original.len() + replace.len());
        updated.push_str(&original[..offset]);
        updated.push_str(replace);
        updated.push_str(&original[offset + search.len()..]);
        tokio::fs::write(&path, updated)
            .await
            .map_err(|e| io_error(self.name(), &path, e))?;

        let line = original[..offset].matches('\n').count() + 1;
        Ok(ToolOutput::success(format!(
            "Replaced text at line {line} of {}",
            path.display()
        )))
    }
}

pub struct ListFiles;

#[async_trait]
impl Tool for ListFiles {
    fn name(&self) -> &'static str {
        "list_files"
    }

    fn description(&self) -> &'static str {
        "List directory entries, one per line; directories end with '/'."
    }

    fn parameters(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("path", "directory, relative to the working directory"),
            ("recursive", "`true` to include subdirectories"),
        ]
    }

    async fn execute(&self, context: &ToolContext, params: &ToolParams) -> Result<ToolOutput> {
        let root = context.resolve(params.get("path").map(String::as_str).unwrap_or("."));
        let recursive = optional_flag(params, "recursive");

        let mut listed = Vec::new();
        for entry in walk(self.name(), root.clone(), recursive).await? {
            let mut display = entry.relative;
            if entry.is_dir {
                display.push('/');
            }
            listed.push(display);
            if listed.len() >= MAX_LISTED_ENTRIES {
                listed.sort();
                listed.push(format!("[listing stopped after {MAX_LISTED_ENTRIES} entries]"));
                return Ok(ToolOutput::success(listed.join("\n")));
            }
        }

        listed.sort();
        if listed.is_empty() {
            return Ok(ToolOutput::success(format!(
                "{} is empty",
                root.display()
            )));
        }
        Ok(ToolOutput::success(listed.join("\n")))
    }
}

pub struct SearchFiles {
    max_output_bytes: usize,
}

impl SearchFiles {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }
}

#[async_trait]
impl Tool for SearchFiles {
    fn name(&self) -> &'static str {
        "search_files"
    }

    fn description(&self) -> &'static str {
        "Search files under a directory for a regular expression; prints path:line: text."
    }

    fn parameters(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("path", "directory to search, relative to the working directory"),
            ("regex", "regular expression to match against each line"),
            ("file_suffix", "optional file name suffix filter, e.g. `.rs`"),
        ]
    }

    async fn execute(&self, context: &ToolContext, params: &ToolParams) -> Result<ToolOutput> {
        let root = context.resolve(params.get("path").map(String::as_str).unwrap_or("."));
        let pattern = required_param(params, self.name(), "regex")?;
        let regex = match Regex::new(pattern) {
            Ok(regex) => regex,
            Err(e) => return Ok(ToolOutput::error(format!("search_files: invalid regex: {e}"))),
        };
        let suffix = params.get("file_suffix").map(|s| s.trim()).unwrap_or("");

        let mut matches = Vec::new();
        'walk: for entry in walk(self.name(), root, true).await? {
            if entry.is_dir || (!suffix.is_empty() && !entry.relative.ends_with(suffix)) {
                continue;
            }
            // binary or unreadable files are skipped
            let Ok(content) = tokio::fs::read_to_string(&entry.path).await else {
                debug!("search_files: skipping {}", entry.path.display());
                continue;
            };
            for (number, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(format!("{}:{}: {}", entry.relative, number + 1, line.trim()));
                    if matches.len() >= MAX_SEARCH_MATCHES {
                        break 'walk;
                    }
                }
            }
        }

        if matches.is_empty() {
            return Ok(ToolOutput::success(format!("No matches for /{pattern}/")));
        }
        Ok(ToolOutput::success(truncate_output(
            matches.join("\n"),
            self.max_output_bytes,
        )))
    }
}

struct WalkedEntry {
    path: PathBuf,
    /// Path relative to the walk root, `/`-separated.
    relative: String,
    is_dir: bool,
}

/// Entries under `root` in file-name order, honouring `.gitignore` and
/// `.ignore` files even outside a git checkout. Entries that cannot be read
/// are skipped; only a missing root is an error.
async fn walk(tool: &'static str, root: PathBuf, recursive: bool) -> Result<Vec<WalkedEntry>> {
    let metadata = tokio::fs::metadata(&root)
        .await
        .map_err(|e| io_error(tool, &root, e))?;
    if !metadata.is_dir() {
        return Err(Error::Tool(format!(
            "{tool}: {} is not a directory",
            root.display()
        )));
    }

    tokio::task::spawn_blocking(move || {
        let mut builder = WalkBuilder::new(&root);
        builder
            .hidden(false)
            .follow_links(false)
            .git_ignore(true)
            .git_exclude(true)
            .git_global(false)
            .require_git(false)
            .filter_entry(|entry| entry.file_name() != ".git")
            .sort_by_file_name(|a, b| a.cmp(b));
        if !recursive {
            builder.max_depth(Some(1));
        }

        let mut entries = Vec::new();
        for entry in builder.build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("{tool}: skipping entry: {e}");
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            let relative = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            entries.push(WalkedEntry {
                path: entry.into_path(),
                relative,
                is_dir,
            });
        }
        entries
    })
    .await
    .map_err(|e| Error::Tool(format!("{tool}: directory walk failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> ToolParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn write_read_replace() {
        let dir = tempfile::tempdir().unwrap();
        let context = ToolContext::new(dir.path());

        WriteToFile
            .execute(
                &context,
                &params(&[("path", "src/main.rs"), ("content", "fn main() {}")]),
            )
            .await
            .unwrap();
        let read = ReadFile::new(1024)
            .execute(&context, &params(&[("path", "src/main.rs")]))
            .await
            .unwrap();
        assert_eq!(read.content, "fn main() {}\n");

        let replaced = ReplaceInFile
            .execute(
                &context,
                &params(&[
                    ("path", "src/main.rs"),
                    ("search", "main() {}"),
                    ("replace", "main() { run() }"),
                ]),
            )
            .await
            .unwrap();
        assert!(!replaced.is_error);
        let content = std::fs::read_to_string(dir.path().join("src/main.rs")).unwrap();
        assert_eq!(content, "fn main() { run() }\n");
    }

    #[tokio::test]
    async fn replace_reports_missing_search_text() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        let out = ReplaceInFile
            .execute(
                &ToolContext::new(dir.path()),
                &params(&[("path", "a.txt"), ("search", "beta"), ("replace", "x")]),
            )
            .await
            .unwrap();
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn read_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ReadFile::new(1024)
            .execute(&ToolContext::new(dir.path()), &params(&[("path", "nope.txt")]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope.txt"));
    }

    #[tokio::test]
    async fn lists_sorted_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("c.txt"), "").unwrap();
        let context = ToolContext::new(dir.path());

        let flat = ListFiles
            .execute(&context, &params(&[("path", ".")]))
            .await
            .unwrap();
        assert_eq!(flat.content, "a.txt\nb.txt\nsub/");

        let deep = ListFiles
            .execute(&context, &params(&[("path", "."), ("recursive", "true")]))
            .await
            .unwrap();
        assert_eq!(deep.content, "a.txt\nb.txt\nsub/\nsub/c.txt");
    }

    #[tokio::test]
    async fn searches_with_regex_and_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.rs"), "fn alpha() {}\nfn beta() {}\n").unwrap();
        std::fs::write(dir.path().join("notes.md"), "fn alpha in docs\n").unwrap();
        let out = SearchFiles::new(4096)
            .execute(
                &ToolContext::new(dir.path()),
                &params(&[("regex", r"fn alpha"), ("file_suffix", ".rs")]),
            )
            .await
            .unwrap();
        assert_eq!(out.content, "lib.rs:1: fn alpha() {}");
    }

    #[tokio::test]
    async fn walks_honour_gitignore_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "target/\n").unwrap();
        std::fs::write(dir.path().join("lib.rs"), "fn alpha() {}\n").unwrap();
        std::fs::create_dir(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("target").join("gen.rs"), "fn alpha() {}\n").unwrap();
        let context = ToolContext::new(dir.path());

        let out = SearchFiles::new(4096)
            .execute(&context, &params(&[("regex", "alpha")]))
            .await
            .unwrap();
        assert_eq!(out.content, "lib.rs:1: fn alpha() {}");

        let listed = ListFiles
            .execute(&context, &params(&[("recursive", "true")]))
            .await
            .unwrap();
        assert_eq!(listed.content, ".gitignore\nlib.rs");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_subdirectory_does_not_lose_other_matches() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("top.txt"), "needle here\n").unwrap();
        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::write(locked.join("inner.txt"), "no match\n").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();

        let out = SearchFiles::new(4096)
            .execute(&ToolContext::new(dir.path()), &params(&[("regex", "needle")]))
            .await;
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        let out = out.unwrap();
        assert!(!out.is_error);
        assert_eq!(out.content, "top.txt:1: needle here");
    }

    #[tokio::test]
    async fn listing_a_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ListFiles
            .execute(&ToolContext::new(dir.path()), &params(&[("path", "missing")]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
