//! Atom count from a POSCAR structure file.
//!
//! The handlers only need the number of sites, so this reads just the
//! species-count line rather than modeling the full structure. Both POSCAR
//! layouts are accepted: the modern one with an element-symbols line (counts
//! on line 7) and the legacy one without (counts on line 6).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::job::MissingInputError;

fn parse_counts(line: &str) -> Option<usize> {
    let mut total = 0usize;
    for token in line.split_whitespace() {
        total += token.parse::<usize>().ok()?;
    }
    if total == 0 { None } else { Some(total) }
}

/// Number of atoms in the structure.
///
/// A missing file is a downcastable [`MissingInputError`]; content that has
/// no recognizable species-count line is a plain error.
pub fn atom_count(path: &Path) -> Result<usize> {
    if !path.exists() {
        return Err(MissingInputError::new(path).into());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let lines: Vec<&str> = contents.lines().collect();

    // Lines 1-5 are comment, scale factor, and the three lattice vectors.
    for idx in [5, 6] {
        if let Some(count) = lines.get(idx).and_then(|line| parse_counts(line)) {
            return Ok(count);
        }
    }
    bail!("no species-count line found in {}", path.display());
}
