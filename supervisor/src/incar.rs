//! INCAR settings document: load, mutate, save.
//!
//! The INCAR is VASP's control-parameter file, a flat list of `TAG = value`
//! lines. Tags are case-insensitive and are normalized to uppercase here.
//! Values parse into a small closed set of scalar kinds; anything the parser
//! does not recognize is kept verbatim as a string, so unknown tags survive a
//! load → mutate → save cycle untouched.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::job::MissingInputError;

/// A scalar INCAR value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Serialized as `.TRUE.` / `.FALSE.` (VASP convention).
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Anything else, kept verbatim (covers string enums like `ALGO = Fast`
    /// and tags with syntax this parser does not model, e.g. `MAGMOM = 2*5.0`).
    Str(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(true) => write!(f, ".TRUE."),
            Value::Bool(false) => write!(f, ".FALSE."),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

fn parse_value(raw: &str) -> Value {
    let upper = raw.to_uppercase();
    match upper.as_str() {
        ".TRUE." | "T" | "TRUE" => return Value::Bool(true),
        ".FALSE." | "F" | "FALSE" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(v) = raw.parse::<i64>() {
        return Value::Int(v);
    }
    if let Ok(v) = raw.parse::<f64>() {
        return Value::Float(v);
    }
    Value::Str(raw.to_string())
}

/// Malformed INCAR content (a non-comment line with no `=`, or with an
/// empty tag left of it).
#[derive(Debug)]
pub struct IncarParseError {
    pub path: PathBuf,
    pub line: usize,
    pub content: String,
}

impl fmt::Display for IncarParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "malformed INCAR line {} in {}: '{}'",
            self.line,
            self.path.display(),
            self.content
        )
    }
}

impl std::error::Error for IncarParseError {}

/// An INCAR document: ordered `(TAG, value)` entries with uppercase tags.
///
/// Entry order is first-seen file order; `set` of a new tag appends. Saving
/// is deterministic and atomic (temp file + rename), so a crash mid-write
/// never leaves a truncated file readable by a subsequent load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Incar {
    entries: Vec<(String, Value)>,
}

impl Incar {
    /// Load an INCAR from disk.
    ///
    /// A missing file is a distinct, downcastable [`MissingInputError`];
    /// whether absence means "use defaults" is the caller's policy.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MissingInputError::new(path).into());
        }
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::parse(&contents, path)
    }

    fn parse(contents: &str, path: &Path) -> Result<Self> {
        let mut entries = Vec::new();
        for (idx, raw_line) in contents.lines().enumerate() {
            // Strip inline comments, then whitespace.
            let line = raw_line
                .split(['#', '!'])
                .next()
                .unwrap_or_default()
                .trim();
            if line.is_empty() {
                continue;
            }
            let entry = line
                .split_once('=')
                .filter(|(key, _)| !key.trim().is_empty());
            let Some((key, value)) = entry else {
                return Err(IncarParseError {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    content: raw_line.to_string(),
                }
                .into());
            };
            entries.push((key.trim().to_uppercase(), parse_value(value.trim())));
        }
        Ok(Self { entries })
    }

    /// Case-insensitive lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let key = key.to_uppercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// String view of a tag, `default` when absent.
    pub fn get_str(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(v) => v.to_string(),
            None => default.to_string(),
        }
    }

    /// Numeric view of a tag, `default` when absent or non-numeric.
    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.get(key) {
            Some(Value::Float(v)) => *v,
            Some(Value::Int(v)) => *v as f64,
            _ => default,
        }
    }

    /// Integer view of a tag, `default` when absent or non-integer.
    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(Value::Int(v)) => *v,
            _ => default,
        }
    }

    /// Upsert, preserving first-seen entry order; new tags append.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let key = key.to_uppercase();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    fn format(&self) -> String {
        let mut buf = String::new();
        for (key, value) in &self.entries {
            buf.push_str(&format!("{key} = {value}\n"));
        }
        buf
    }

    /// Atomically write the document back to disk (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, self.format())
            .with_context(|| format!("write temp INCAR {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path)
            .with_context(|| format!("replace INCAR {}", path.display()))?;
        Ok(())
    }
}
