//! Line-oriented instruction sources

use crate::{FabError, Result};
use std::fs;
use std::path::Path;

/// Instruction lines with a known total, consumed front to back
#[derive(Debug, Clone)]
pub struct GCodeSource {
    name: String,
    lines: Vec<String>,
    cursor: usize,
}

impl GCodeSource {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| FabError::BuildFile(format!("Failed to read {}: {}", path.display(), e)))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::from_lines(&name, text.lines().map(str::to_string).collect()))
    }

    pub fn from_lines(name: &str, lines: Vec<String>) -> Self {
        Self { name: name.to_string(), lines, cursor: 0 }
    }

    /// Wrap the build in `warmup` and `cooldown` lines
    pub fn bracketed(mut self, warmup: &[String], cooldown: &[String]) -> Self {
        let mut lines = Vec::with_capacity(warmup.len() + self.lines.len() + cooldown.len());
        lines.extend_from_slice(warmup);
        lines.extend(self.lines.drain(..));
        lines.extend_from_slice(cooldown);
        self.lines = lines;
        self.cursor = 0;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn remaining(&self) -> usize {
        self.lines.len() - self.cursor
    }
}

impl Iterator for GCodeSource {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let line = self.lines.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(line)
    }
}
