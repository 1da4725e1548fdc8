//! Operator-facing status lines of the supervisor.
//!
//! Every line is prefixed with the process it concerns, padded to the longest
//! registered name and colored with the process's palette index when stdout
//! is a terminal. Lines from the supervisor itself use the `system` prefix.

use std::fmt::Display;
use std::io::{IsTerminal, Write};

use crate::process::ProcessSpec;

/// Prefix used for lines that do not belong to a process.
const SYSTEM_NAME: &str = "system";

/// 256-color palette indices assigned to processes by list position.
pub const COLORS: [u8; 10] = [2, 3, 4, 5, 6, 42, 130, 103, 129, 108];

pub fn color_for(index: usize) -> u8 {
    COLORS[index % COLORS.len()]
}

#[derive(Debug, Clone)]
pub struct Output {
    name_width: usize,
    colors: bool,
}

impl Output {
    pub fn new(max_name_len: usize) -> Self {
        Self {
            name_width: max_name_len.max(SYSTEM_NAME.len()),
            colors: std::io::stdout().is_terminal(),
        }
    }

    #[cfg(test)]
    fn plain(max_name_len: usize) -> Self {
        Self {
            name_width: max_name_len.max(SYSTEM_NAME.len()),
            colors: false,
        }
    }

    pub fn system(&self, text: impl Display) {
        self.write(&self.format_line(SYSTEM_NAME, None, &text.to_string()));
    }

    pub fn process(&self, spec: &ProcessSpec, text: impl Display) {
        self.write(&self.format_line(&spec.name, Some(spec.color), &text.to_string()));
    }

    fn format_line(&self, name: &str, color: Option<u8>, text: &str) -> String {
        let prefix = pad(name, self.name_width);
        let prefix = match color {
            Some(color) if self.colors => apply_color(&prefix, color),
            None if self.colors => format!("\u{1b}[1m{prefix}\u{1b}[0m"),
            _ => prefix,
        };
        format!("{prefix} | {text}")
    }

    fn write(&self, line: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
        let _ = stdout.flush();
    }
}

fn pad(name: &str, width: usize) -> String {
    let mut out = name.to_string();
    if out.len() < width {
        out.push_str(&" ".repeat(width - out.len()));
    }
    out
}

fn apply_color(prefix: &str, color: u8) -> String {
    format!("\u{1b}[1;38;5;{color}m{prefix}\u{1b}[0m")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_to_longest_name() {
        let output = Output::plain(8);
        assert_eq!(output.format_line("web", Some(2), "Started"), "web      | Started");
        assert_eq!(output.format_line("system", None, "hi"), "system   | hi");
    }

    #[test]
    fn system_prefix_sets_minimum_width() {
        let output = Output::plain(2);
        assert_eq!(output.format_line("db", Some(3), "x"), "db     | x");
    }

    #[test]
    fn colors_wrap_prefix_only() {
        let output = Output {
            name_width: 6,
            colors: true,
        };
        assert_eq!(
            output.format_line("web", Some(42), "up"),
            "\u{1b}[1;38;5;42mweb   \u{1b}[0m | up"
        );
    }

    #[test]
    fn palette_cycles() {
        assert_eq!(color_for(0), 2);
        assert_eq!(color_for(10), 2);
        assert_eq!(color_for(13), 5);
    }
}
