//! The file-system tool family: `read_file`, `write_file`, `glob`, `grep`.
//!
//! Every path argument is resolved through `ctx.workspace` before touching
//! disk (P2 — the workspace boundary is enforced once, here, not
//! reimplemented per tool).

use super::{Confirmation, Tool, ToolContext, ToolOutput};
use async_trait::async_trait;
use globset::Glob;
use serde::Deserialize;
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;

const MAX_FILE_READ_LINES: usize = 2000;
const MAX_LINE_LENGTH: usize = 2000;
const MAX_GLOB_RESULTS: usize = 100;

fn is_probably_binary(bytes: &[u8]) -> bool {
    if bytes.contains(&0) {
        return true;
    }
    let sample = &bytes[..bytes.len().min(8192)];
    if sample.is_empty() {
        return false;
    }
    let non_printable = sample
        .iter()
        .filter(|b| !(b.is_ascii_graphic() || b.is_ascii_whitespace()))
        .count();
    (non_printable as f64 / sample.len() as f64) > 0.3
}

#[derive(Debug, Deserialize)]
struct ReadFileInput {
    path: String,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

/// Reads a text file, cat-n style, with line offset/limit and a line-count
/// ceiling so a single call can't blow the context budget on a huge file.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> String {
        "Read a text file from the workspace, with line numbers. Supports an \
offset/limit window for large files; without them, reads from the start, up \
to an internal line cap. Rejects binary files — use read_image for images."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": { "type": "string", "description": "File path to read" },
                "offset": { "type": "integer", "description": "0-based line to start from" },
                "limit": { "type": "integer", "description": "Maximum number of lines to return" }
            }
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: ReadFileInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        let path = match ctx.workspace.resolve_existing_file(&input.path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::error(e.to_string()),
        };

        let bytes = match fs::read(&path).await {
            Ok(b) => b,
            Err(e) => return ToolOutput::error(format!("Failed to read file: {e}")),
        };

        if is_probably_binary(&bytes) {
            return ToolOutput::error(format!(
                "{} looks like a binary file; read_file only handles text",
                path.display()
            ));
        }

        let text = String::from_utf8_lossy(&bytes);
        let offset = input.offset.unwrap_or(0);
        let limit = input.limit.unwrap_or(MAX_FILE_READ_LINES).min(MAX_FILE_READ_LINES);

        let mut rendered = String::new();
        let mut shown = 0;
        let mut total = 0;
        for (idx, line) in text.lines().enumerate() {
            total = idx + 1;
            if idx < offset {
                continue;
            }
            if shown >= limit {
                continue;
            }
            let truncated = if line.chars().count() > MAX_LINE_LENGTH {
                let head: String = line.chars().take(MAX_LINE_LENGTH).collect();
                format!("{head}...[line truncated]")
            } else {
                line.to_string()
            };
            rendered.push_str(&format!("{:>6}\t{}\n", idx + 1, truncated));
            shown += 1;
        }

        if shown == 0 && total > 0 {
            return ToolOutput::success(format!(
                "(no lines in range; file has {total} lines total)"
            ));
        }

        if offset + shown < total {
            rendered.push_str(&format!(
                "\n[showing lines {}-{} of {total}; pass offset={} to continue]\n",
                offset + 1,
                offset + shown,
                offset + shown
            ));
        }

        ToolOutput::success(rendered)
    }
}

#[derive(Debug, Deserialize)]
struct WriteFileInput {
    path: String,
    content: String,
}

/// Creates or overwrites a text file, creating parent directories as needed.
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> String {
        "Create or overwrite a file in the workspace with the given content. \
Creates parent directories if needed. Refuses to write over an existing \
directory.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["path", "content"],
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" }
            }
        })
    }

    fn confirmation(&self, input: &Value) -> Confirmation {
        let path = input.get("path").and_then(Value::as_str).unwrap_or("<unknown>");
        Confirmation::required(format!("write to `{path}`"))
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: WriteFileInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        let path = match ctx.workspace.ensure_parent(&input.path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::error(e.to_string()),
        };

        if path.is_dir() {
            return ToolOutput::error(format!("{} is a directory, not a file", path.display()));
        }

        let existed = path.exists();

        if let Err(e) = fs::write(&path, &input.content).await {
            return ToolOutput::error(format!("Failed to write file: {e}"));
        }

        ToolOutput::success(if existed {
            format!("overwrote {} ({} bytes)", path.display(), input.content.len())
        } else {
            format!("created {} ({} bytes)", path.display(), input.content.len())
        })
    }
}

#[derive(Debug, Deserialize)]
struct GlobInput {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

/// Finds files matching a glob pattern, respecting `.gitignore`, sorted
/// newest-modified first.
pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> String {
        "Find files in the workspace matching a glob pattern (e.g. `**/*.rs`). \
Honors .gitignore. Results are sorted by modification time, most recent \
first, and capped at 100 matches.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["pattern"],
            "properties": {
                "pattern": { "type": "string", "description": "Glob pattern, e.g. '**/*.rs'" },
                "path": { "type": "string", "description": "Directory to search under (default: workspace root)" }
            }
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: GlobInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        let search_root = match &input.path {
            Some(p) => match ctx.workspace.resolve_existing_dir(p) {
                Ok(p) => p,
                Err(e) => return ToolOutput::error(e.to_string()),
            },
            None => ctx.workspace.root().to_path_buf(),
        };

        let matcher = match Glob::new(&input.pattern) {
            Ok(g) => g.compile_matcher(),
            Err(e) => return ToolOutput::error(format!("Invalid glob pattern: {e}")),
        };

        let mut hits: Vec<(std::path::PathBuf, std::time::SystemTime)> = Vec::new();
        let walker = ignore::WalkBuilder::new(&search_root).hidden(false).build();
        for entry in walker.flatten() {
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&search_root) else {
                continue;
            };
            if !matcher.is_match(relative) {
                continue;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            hits.push((entry.path().to_path_buf(), modified));
        }

        hits.sort_by(|a, b| b.1.cmp(&a.1));
        let truncated = hits.len() > MAX_GLOB_RESULTS;
        hits.truncate(MAX_GLOB_RESULTS);

        if hits.is_empty() {
            return ToolOutput::success("No files matched.");
        }

        let mut rendered: String = hits
            .into_iter()
            .map(|(p, _)| p.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        if truncated {
            rendered.push_str(&format!("\n[results capped at {MAX_GLOB_RESULTS}]"));
        }
        ToolOutput::success(rendered)
    }
}

#[derive(Debug, Deserialize)]
struct GrepInput {
    pattern: String,
    #[serde(default)]
    include: Option<String>,
    #[serde(default)]
    path: Option<String>,
}

/// Content search via ripgrep, scoped to the workspace.
pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> String {
        "Search file contents in the workspace for a regex pattern using \
ripgrep. Optionally restrict to files matching a glob (`include`) or under a \
subdirectory (`path`). Results grouped by file, capped at 100 matching \
files.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["pattern"],
            "properties": {
                "pattern": { "type": "string", "description": "Regex pattern to search for" },
                "include": { "type": "string", "description": "Glob filter, e.g. '*.rs'" },
                "path": { "type": "string", "description": "Directory to search under (default: workspace root)" }
            }
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: GrepInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        let search_root = match &input.path {
            Some(p) => match ctx.workspace.resolve_existing_dir(p) {
                Ok(p) => p,
                Err(e) => return ToolOutput::error(e.to_string()),
            },
            None => ctx.workspace.root().to_path_buf(),
        };

        let mut cmd = Command::new("rg");
        cmd.arg("--line-number")
            .arg("--no-heading")
            .arg("--color=never")
            .arg("--max-count")
            .arg("100");
        if let Some(include) = &input.include {
            cmd.arg("--glob").arg(include);
        }
        cmd.arg(&input.pattern)
            .current_dir(&search_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = match cmd.output().await {
            Ok(o) => o,
            Err(e) => return ToolOutput::error(format!("Failed to run ripgrep: {e}")),
        };

        // rg exit code 1 means "no matches", not a failure.
        if output.status.code() == Some(1) {
            return ToolOutput::success("No matches found.");
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return ToolOutput::error(format!("ripgrep failed: {stderr}"));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut by_file: Vec<(String, Vec<String>)> = Vec::new();
        for line in stdout.lines() {
            let Some((file, rest)) = line.split_once(':') else {
                continue;
            };
            match by_file.iter_mut().find(|(f, _)| f == file) {
                Some((_, lines)) => lines.push(rest.to_string()),
                None => by_file.push((file.to_string(), vec![rest.to_string()])),
            }
        }

        if by_file.is_empty() {
            return ToolOutput::success("No matches found.");
        }

        let capped = by_file.len() > MAX_GLOB_RESULTS;
        by_file.truncate(MAX_GLOB_RESULTS);

        let mut rendered = by_file
            .into_iter()
            .map(|(file, lines)| format!("{file}:\n{}", lines.join("\n")))
            .collect::<Vec<_>>()
            .join("\n\n");
        if capped {
            rendered.push_str(&format!("\n\n[results capped at {MAX_GLOB_RESULTS} files]"));
        }
        ToolOutput::success(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelRegistry;
    use crate::shell::PersistentShellBroker;
    use crate::workspace::WorkspaceGuard;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn test_context(root: std::path::PathBuf) -> ToolContext {
        ToolContext::new(
            CancellationToken::new(),
            "test-session".to_string(),
            Arc::new(WorkspaceGuard::new(root)),
            Arc::new(PersistentShellBroker::new("orch")),
            Arc::new(ModelRegistry::new_empty()),
        )
    }

    #[tokio::test]
    async fn read_file_numbers_lines() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\n").unwrap();
        let tool = ReadFileTool;
        let result = tool
            .run(json!({"path": "a.txt"}), test_context(dir.path().to_path_buf()))
            .await;
        assert!(result.success, "{}", result.output);
        assert!(result.output.contains("1\tone"));
        assert!(result.output.contains("3\tthree"));
    }

    #[tokio::test]
    async fn read_file_rejects_binary() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.bin"), [0u8, 1, 2, 3, 255, 254]).unwrap();
        let tool = ReadFileTool;
        let result = tool
            .run(json!({"path": "b.bin"}), test_context(dir.path().to_path_buf()))
            .await;
        assert!(!result.success);
        assert!(result.output.contains("binary"));
    }

    #[tokio::test]
    async fn write_file_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let tool = WriteFileTool;
        let result = tool
            .run(
                json!({"path": "nested/dir/file.txt", "content": "hello"}),
                test_context(dir.path().to_path_buf()),
            )
            .await;
        assert!(result.success, "{}", result.output);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("nested/dir/file.txt")).unwrap(),
            "hello"
        );
    }

    #[tokio::test]
    async fn write_file_rejects_directory_target() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let tool = WriteFileTool;
        let result = tool
            .run(
                json!({"path": "sub", "content": "x"}),
                test_context(dir.path().to_path_buf()),
            )
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn glob_finds_matching_files_sorted() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.rs"), "").unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        let tool = GlobTool;
        let result = tool
            .run(
                json!({"pattern": "*.rs"}),
                test_context(dir.path().to_path_buf()),
            )
            .await;
        assert!(result.success, "{}", result.output);
        assert!(result.output.contains("a.rs"));
        assert!(!result.output.contains("b.txt"));
    }

    #[tokio::test]
    async fn glob_rejects_bad_pattern() {
        let dir = TempDir::new().unwrap();
        let tool = GlobTool;
        let result = tool
            .run(
                json!({"pattern": "["}),
                test_context(dir.path().to_path_buf()),
            )
            .await;
        assert!(!result.success);
    }
}
