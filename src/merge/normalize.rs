//! Formatting passes applied to a merged module
//!
//! Both passes may only change layout. Anything inside a multi-line string
//! literal is left byte-for-byte intact.

use crate::python::{expand_leading_tabs, multiline_string_rows, parses_cleanly};
use crate::util::run_command_with_timeout;
use anyhow::{anyhow, Context, Result};
use std::process::Command;
use std::time::Duration;

const MAX_BLANK_RUN: usize = 2;

/// Lenient whitespace cleanup.
///
/// CRLF becomes LF, leading tabs become four spaces, trailing whitespace
/// is dropped and long runs of blank lines are collapsed. The result always
/// ends with exactly one newline.
pub fn normalize_whitespace(source: &str) -> String {
    let source = source.replace("\r\n", "\n");
    let spans = multiline_string_rows(&source);
    let opens_string = |row: usize| spans.iter().any(|&(start, _)| start == row);
    let inside_string = |row: usize| spans.iter().any(|&(start, end)| row > start && row <= end);

    let mut out: Vec<String> = Vec::new();
    let mut blank_run = 0;
    for (row, line) in source.lines().enumerate() {
        if inside_string(row) {
            blank_run = 0;
            out.push(line.to_string());
            continue;
        }
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run <= MAX_BLANK_RUN {
                out.push(String::new());
            }
            continue;
        }
        blank_run = 0;
        let expanded = expand_leading_tabs(line);
        if opens_string(row) {
            // trailing characters belong to the literal
            out.push(expanded);
        } else {
            out.push(expanded.trim_end().to_string());
        }
    }

    while out.last().map(|l| l.is_empty()).unwrap_or(false) {
        out.pop();
    }
    let mut text = out.join("\n");
    text.push('\n');
    text
}

/// An optional autoformat pass over merged source.
pub trait SourceFormatter: Send + Sync {
    fn format(&self, source: &str) -> Result<String>;
}

/// Runs an external formatter (e.g. `black -q`) on a temporary file.
#[derive(Debug, Clone)]
pub struct CommandFormatter {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandFormatter {
    /// Build from an argv list such as `["black", "-q"]`.
    pub fn from_argv(argv: &[String], timeout: Duration) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }
}

impl SourceFormatter for CommandFormatter {
    fn format(&self, source: &str) -> Result<String> {
        let file = tempfile::Builder::new()
            .prefix("splice-format-")
            .suffix(".py")
            .tempfile()
            .context("Failed to create formatter temp file")?;
        std::fs::write(file.path(), source).context("Failed to write formatter input")?;

        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(file.path());
        let result = run_command_with_timeout(&mut command, self.timeout).map_err(|e| anyhow!(e))?;
        if result.timed_out {
            return Err(anyhow!(
                "{} timed out after {}s",
                self.program,
                self.timeout.as_secs()
            ));
        }
        if !result.success() {
            return Err(anyhow!("{} failed: {}", self.program, result.stderr.trim()));
        }

        std::fs::read_to_string(file.path()).context("Failed to read formatter output")
    }
}

/// Apply `formatter` if given, falling back to `source` on any failure.
///
/// Output that no longer parses cleanly is rejected as well.
pub fn format_or_keep(source: String, formatter: Option<&dyn SourceFormatter>) -> String {
    let Some(formatter) = formatter else {
        return source;
    };
    match formatter.format(&source) {
        Ok(formatted) if parses_cleanly(&formatted) || !parses_cleanly(&source) => formatted,
        Ok(_) => {
            tracing::warn!("formatter output no longer parses; keeping normalized source");
            source
        }
        Err(err) => {
            tracing::warn!(error = %err, "formatter failed; keeping normalized source");
            source
        }
    }
}
