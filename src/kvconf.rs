//! Flat shell-style key-value files.
//!
//! VM records, the `.state` file, `/etc/os-release` and `/etc/default/grub`
//! all share the same format: one `KEY=value` assignment per line, optional
//! `export` prefix, `#` comments. Files are patched in place so that
//! comments, ordering and keys we do not know about survive a rewrite.

use crate::error::{LabError, Result};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    /// Blank line, comment, or anything that is not an assignment.
    Raw(String),
    /// `KEY=value`; `raw` is the original text, re-rendered only on change.
    Entry {
        key: String,
        value: String,
        export: bool,
        raw: String,
    },
}

/// A parsed key-value file that remembers its layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvFile {
    path: PathBuf,
    lines: Vec<Line>,
}

impl KvFile {
    /// Create an empty file bound to `path` (nothing is written yet).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lines: Vec::new(),
        }
    }

    /// Load and parse `path`. A missing file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        Self::parse(path, &text)
    }

    /// Load `path`, or start empty if it does not exist yet.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(path, &text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new(path)),
            Err(e) => Err(e.into()),
        }
    }

    /// Parse `text` as the contents of `path`.
    pub fn parse(path: impl Into<PathBuf>, text: &str) -> Result<Self> {
        let path = path.into();
        let mut lines = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = parse_line(raw).map_err(|msg| LabError::parse(&path, idx + 1, msg))?;
            if let Line::Raw(ref r) = line {
                let t = r.trim();
                if !t.is_empty() && !t.starts_with('#') {
                    tracing::debug!(path = %path.display(), line = idx + 1, "keeping unrecognized line verbatim");
                }
            }
            lines.push(line);
        }
        Ok(Self { path, lines })
    }

    /// Path this file is loaded from / saved to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value of the last assignment of `key`, like the shell would see it.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().rev().find_map(|line| match line {
            Line::Entry { key: k, value, .. } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Distinct keys in first-seen order.
    pub fn keys(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for line in &self.lines {
            if let Line::Entry { key, .. } = line {
                if !out.contains(&key.as_str()) {
                    out.push(key);
                }
            }
        }
        out
    }

    /// Set `key` to `value`, patching the last assignment in place or
    /// appending a new line. Returns whether the file content changed.
    pub fn set(&mut self, key: &str, value: &str) -> Result<bool> {
        if !is_valid_key(key) {
            return Err(LabError::validation(format!("invalid key name '{}'", key)));
        }
        if value.contains('\n') || value.contains('\r') {
            return Err(LabError::validation(format!(
                "value for {} must be a single line",
                key
            )));
        }

        let pos = self
            .lines
            .iter()
            .rposition(|line| matches!(line, Line::Entry { key: k, .. } if k == key));

        if let Some(Line::Entry {
            value: old,
            export,
            raw,
            ..
        }) = pos.map(|i| &mut self.lines[i])
        {
            if old.as_str() == value {
                return Ok(false);
            }
            *old = value.to_string();
            *raw = render_entry(key, value, *export);
            return Ok(true);
        }

        self.lines.push(Line::Entry {
            key: key.to_string(),
            value: value.to_string(),
            export: false,
            raw: render_entry(key, value, false),
        });
        Ok(true)
    }

    /// Remove every assignment of `key`. Returns whether anything was removed.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.lines.len();
        self.lines
            .retain(|line| !matches!(line, Line::Entry { key: k, .. } if k == key));
        self.lines.len() != before
    }

    /// Render the file, preserving untouched lines byte for byte.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Raw(raw) | Line::Entry { raw, .. } => out.push_str(raw),
            }
            out.push('\n');
        }
        out
    }

    /// Write the file atomically (temp file in the same directory, then rename).
    pub fn save(&self) -> Result<()> {
        write_atomic(&self.path, &self.render())
    }
}

/// Write `contents` to `path` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| LabError::config(format!("not a file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Shell variable name: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Double-quote `value` for a shell assignment.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn render_entry(key: &str, value: &str, export: bool) -> String {
    if export {
        format!("export {}={}", key, quote(value))
    } else {
        format!("{}={}", key, quote(value))
    }
}

fn parse_line(raw: &str) -> std::result::Result<Line, String> {
    let trimmed = raw.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(Line::Raw(raw.to_string()));
    }

    let (export, rest) = match trimmed.strip_prefix("export") {
        Some(r) if r.starts_with(|c: char| c == ' ' || c == '\t') => (true, r.trim_start()),
        _ => (false, trimmed),
    };

    let Some(eq) = rest.find('=') else {
        return Ok(Line::Raw(raw.to_string()));
    };
    let key = &rest[..eq];
    if !is_valid_key(key) {
        return Ok(Line::Raw(raw.to_string()));
    }

    let Some(value) = parse_value(&rest[eq + 1..])? else {
        return Ok(Line::Raw(raw.to_string()));
    };
    Ok(Line::Entry {
        key: key.to_string(),
        value,
        export,
        raw: raw.to_string(),
    })
}

/// Parse the right-hand side of an assignment: concatenated unquoted,
/// single-quoted and double-quoted words, optionally followed by a comment.
///
/// `None` when the line is shell code rather than a static value: command
/// substitution outside quotes, or more words after the value
/// (``GRUB_DISTRIBUTOR=`lsb_release -i -s` `` on Debian).
fn parse_value(input: &str) -> std::result::Result<Option<String>, String> {
    let mut value = String::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => loop {
                match chars.next() {
                    Some('\'') => break,
                    Some(ch) => value.push(ch),
                    None => return Err("unterminated single quote".into()),
                }
            },
            '"' => loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(ch @ ('"' | '\\' | '$' | '`')) => value.push(ch),
                        Some(ch) => {
                            value.push('\\');
                            value.push(ch);
                        }
                        None => return Err("unterminated double quote".into()),
                    },
                    Some(ch) => value.push(ch),
                    None => return Err("unterminated double quote".into()),
                }
            },
            '\\' => {
                if let Some(ch) = chars.next() {
                    value.push(ch);
                }
            }
            '`' => return Ok(None),
            '$' if chars.peek() == Some(&'(') => return Ok(None),
            c if c.is_whitespace() => {
                let tail: String = chars.collect();
                let tail = tail.trim();
                if tail.is_empty() || tail.starts_with('#') {
                    return Ok(Some(value));
                }
                return Ok(None);
            }
            c => value.push(c),
        }
    }

    Ok(Some(value))
}
