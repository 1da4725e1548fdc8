//! Procfile loading.
//!
//! One `name: command` entry per line. Blank lines and `#` comments are
//! skipped. Ports and colors are assigned by position in the file, before any
//! `--processes` selection is applied.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use thiserror::Error;

use crate::output::color_for;
use crate::process::ProcessSpec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcfileEntry {
    pub name: String,
    pub command: String,
    pub port: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProcfileError {
    #[error("line {line}: expected `name: command`, got {text:?}")]
    Invalid { line: usize, text: String },
    #[error("line {line}: process {name} is defined twice")]
    Duplicate { line: usize, name: String },
    #[error("port of {name} does not fit in 16 bits")]
    PortOverflow { name: String },
    #[error("no processes defined")]
    Empty,
}

fn entry_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^([A-Za-z0-9_-]+):\s*(.+?)\s*$").ok())
        .as_ref()
}

pub fn parse(content: &str, port_base: u16, port_step: u16) -> Result<Vec<ProcfileEntry>, ProcfileError> {
    let mut entries: Vec<ProcfileEntry> = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let captures = entry_pattern()
            .and_then(|pattern| pattern.captures(line))
            .ok_or_else(|| ProcfileError::Invalid {
                line: idx + 1,
                text: line.to_string(),
            })?;
        let name = captures[1].to_string();
        if entries.iter().any(|entry| entry.name == name) {
            return Err(ProcfileError::Duplicate {
                line: idx + 1,
                name,
            });
        }

        let port = u32::from(port_step)
            .checked_mul(entries.len() as u32)
            .and_then(|offset| offset.checked_add(u32::from(port_base)))
            .and_then(|port| u16::try_from(port).ok())
            .ok_or_else(|| ProcfileError::PortOverflow { name: name.clone() })?;
        entries.push(ProcfileEntry {
            name,
            command: captures[2].to_string(),
            port,
        });
    }
    if entries.is_empty() {
        return Err(ProcfileError::Empty);
    }
    Ok(entries)
}

pub fn load(path: &Path, port_base: u16, port_step: u16) -> Result<Vec<ProcfileEntry>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read procfile {}", path.display()))?;
    parse(&content, port_base, port_step)
        .with_context(|| format!("invalid procfile {}", path.display()))
}

/// Turns entries into process specs rooted at `root`, colored by position.
pub fn to_specs(entries: Vec<ProcfileEntry>, root: &Path) -> Vec<ProcessSpec> {
    entries
        .into_iter()
        .enumerate()
        .map(|(idx, entry)| ProcessSpec {
            name: entry.name,
            command: entry.command,
            root: root.to_path_buf(),
            port: Some(entry.port),
            color: color_for(idx),
        })
        .collect()
}
