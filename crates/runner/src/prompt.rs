//! Workspace prompt files.
//!
//! The system prompt is assembled on every dispatch from the workspace's
//! markdown files plus the tool catalog, so edits land on the next
//! invocation without any reload machinery. Reads go through a small cache
//! invalidated by mtime + size, with sha256 fingerprints for diagnostics.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use wr_domain::tool::ToolCatalog;
use wr_domain::TraceEvent;

/// Prompt files consulted for the system prompt, in assembly order.
pub const PROMPT_FILES: [&str; 4] = ["AGENT.md", "USER.md", "SOUL.md", "HEARTBEAT.md"];

#[derive(Debug, Clone)]
struct CachedFile {
    content: String,
    sha256: String,
    modified: SystemTime,
    size: u64,
}

/// Caching reader for a workspace's prompt files.
pub struct PromptReader {
    root: PathBuf,
    cache: RwLock<HashMap<String, CachedFile>>,
}

impl PromptReader {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read one file, using the cache when mtime and size are unchanged.
    /// Returns `None` for missing or unreadable files.
    pub fn read_file(&self, name: &str) -> Option<String> {
        let path = self.root.join(name);
        let metadata = std::fs::metadata(&path).ok()?;
        let modified = metadata.modified().ok()?;
        let size = metadata.len();

        {
            let cache = self.cache.read();
            if let Some(cached) = cache.get(name) {
                if cached.modified == modified && cached.size == size {
                    TraceEvent::PromptFileRead {
                        filename: name.to_owned(),
                        raw_chars: cached.content.len(),
                        cache_hit: true,
                    }
                    .emit();
                    return Some(cached.content.clone());
                }
            }
        }

        let content = std::fs::read_to_string(&path).ok()?;
        let sha256 = {
            let mut hasher = Sha256::new();
            hasher.update(content.as_bytes());
            format!("{:x}", hasher.finalize())
        };
        self.cache.write().insert(
            name.to_owned(),
            CachedFile {
                content: content.clone(),
                sha256,
                modified,
                size,
            },
        );
        TraceEvent::PromptFileRead {
            filename: name.to_owned(),
            raw_chars: content.len(),
            cache_hit: false,
        }
        .emit();
        Some(content)
    }

    /// Cached sha256 of a file, if it has been read.
    pub fn file_hash(&self, name: &str) -> Option<String> {
        self.cache.read().get(name).map(|c| c.sha256.clone())
    }

    /// Prompt files currently present on disk.
    pub fn present_files(&self) -> Vec<&'static str> {
        PROMPT_FILES
            .iter()
            .copied()
            .filter(|name| self.root.join(name).exists())
            .collect()
    }

    /// Assemble the system prompt: prompt files in order, then the tool
    /// catalog listing.
    pub fn build_system_prompt(&self, catalog: &dyn ToolCatalog) -> String {
        let mut sections = Vec::new();
        for name in PROMPT_FILES {
            if let Some(content) = self.read_file(name) {
                let trimmed = content.trim();
                if !trimmed.is_empty() {
                    sections.push(format!("## {name}\n\n{trimmed}"));
                }
            }
        }

        let tools = catalog.all();
        if !tools.is_empty() {
            let mut listing = String::from("## Available tools\n");
            for tool in &tools {
                listing.push_str(&format!("\n- {} — {}", tool.name, tool.description));
            }
            sections.push(listing);
        }

        sections.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wr_domain::tool::{StaticToolCatalog, ToolDefinition};

    fn reader(dir: &tempfile::TempDir) -> PromptReader {
        PromptReader::new(dir.path().to_path_buf())
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(reader(&dir).read_file("AGENT.md").is_none());
    }

    #[test]
    fn read_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENT.md"), "You are Gilfoyle.").unwrap();
        let r = reader(&dir);

        assert_eq!(r.read_file("AGENT.md").unwrap(), "You are Gilfoyle.");
        assert!(r.file_hash("AGENT.md").is_some());
        // Second read hits the cache and returns identical content.
        assert_eq!(r.read_file("AGENT.md").unwrap(), "You are Gilfoyle.");
    }

    #[test]
    fn present_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("SOUL.md"), "soul").unwrap();
        std::fs::write(dir.path().join("AGENT.md"), "agent").unwrap();
        assert_eq!(reader(&dir).present_files(), ["AGENT.md", "SOUL.md"]);
    }

    #[test]
    fn system_prompt_concatenates_sections() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENT.md"), "You are Gilfoyle.").unwrap();
        std::fs::write(dir.path().join("USER.md"), "The user is Richard.").unwrap();

        let mut catalog = StaticToolCatalog::new();
        catalog.register(ToolDefinition::new("read_file", "Read a file"), None);

        let prompt = reader(&dir).build_system_prompt(&catalog);
        assert!(prompt.contains("## AGENT.md\n\nYou are Gilfoyle."));
        assert!(prompt.contains("## USER.md\n\nThe user is Richard."));
        assert!(prompt.contains("## Available tools"));
        assert!(prompt.contains("- read_file — Read a file"));
        // Order: AGENT.md before USER.md before tools.
        let a = prompt.find("AGENT.md").unwrap();
        let u = prompt.find("USER.md").unwrap();
        let t = prompt.find("Available tools").unwrap();
        assert!(a < u && u < t);
    }

    #[test]
    fn empty_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENT.md"), "agent").unwrap();
        std::fs::write(dir.path().join("SOUL.md"), "   \n").unwrap();

        let prompt = reader(&dir).build_system_prompt(&StaticToolCatalog::new());
        assert!(prompt.contains("AGENT.md"));
        assert!(!prompt.contains("SOUL.md"));
    }

    #[test]
    fn edits_are_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AGENT.md");
        std::fs::write(&path, "v1").unwrap();
        let r = reader(&dir);
        assert_eq!(r.read_file("AGENT.md").unwrap(), "v1");

        // Size change guarantees invalidation even with coarse mtimes.
        std::fs::write(&path, "v2 with more text").unwrap();
        assert_eq!(r.read_file("AGENT.md").unwrap(), "v2 with more text");
    }
}
