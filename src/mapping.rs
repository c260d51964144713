//! Class-name lists.
//!
//! The model predicts class indices; names come from either an explicit class
//! list file or the `names` entry the YOLO exporter writes into the ONNX
//! metadata. Both resolve to the same ordered `Vec<String>` (index → name).

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use regex::Regex;

use crate::error::StartupError;

/// Loads a class list file.
///
/// A file starting with `[` is read as a JSON array of strings (the format the
/// training pipeline emits as `class_names.json`); anything else is one class
/// per line, blank lines ignored.
pub fn load_class_mapping(file_path: &Path) -> Result<Vec<String>, StartupError> {
    let contents = fs::read_to_string(file_path)?;
    let names = if contents.trim_start().starts_with('[') {
        serde_json::from_str::<Vec<String>>(&contents).map_err(|e| {
            StartupError::ClassNames(format!("'{}' is not a JSON list of strings: {}", file_path.display(), e))
        })?
    } else {
        contents
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect()
    };
    validate_class_names(names)
}

/// Parses the exporter's `names` metadata, a Python dict literal such as
/// `{0: 'Tomato_Early_Blight', 1: "Apple's_Scab"}`.
pub fn parse_names_metadata(raw: &str) -> Result<Vec<String>, StartupError> {
    let entry = Regex::new(r#"(\d+)\s*:\s*(?:'([^']*)'|"([^"]*)")"#)
        .map_err(|e| StartupError::ClassNames(e.to_string()))?;

    let mut by_index = BTreeMap::new();
    for caps in entry.captures_iter(raw) {
        let index: usize = caps[1]
            .parse()
            .map_err(|_| StartupError::ClassNames(format!("bad class index '{}'", &caps[1])))?;
        let name = caps.get(2).or_else(|| caps.get(3)).map(|m| m.as_str().to_string()).unwrap_or_default();
        if by_index.insert(index, name).is_some() {
            return Err(StartupError::ClassNames(format!("class index {} appears twice", index)));
        }
    }

    // Indices must be exactly 0..N.
    if let Some((pos, idx)) = by_index.keys().enumerate().find(|(pos, idx)| *pos != **idx) {
        return Err(StartupError::ClassNames(format!("class index {} found where {} was expected", idx, pos)));
    }
    validate_class_names(by_index.into_values().collect())
}

/// Rejects empty lists, blank names and duplicates.
pub fn validate_class_names(names: Vec<String>) -> Result<Vec<String>, StartupError> {
    if names.is_empty() {
        return Err(StartupError::ClassNames("class list is empty".to_string()));
    }
    let mut seen = HashSet::new();
    for name in &names {
        if name.trim().is_empty() {
            return Err(StartupError::ClassNames("class list contains a blank name".to_string()));
        }
        if !seen.insert(name.as_str()) {
            return Err(StartupError::ClassNames(format!("duplicate class name '{}'", name)));
        }
    }
    Ok(names)
}

/// Checks the class list against the class count the model reports.
pub fn ensure_class_count(names: &[String], model_classes: usize) -> Result<(), StartupError> {
    if names.len() != model_classes {
        return Err(StartupError::ClassCountMismatch {
            model: model_classes,
            names: names.len(),
        });
    }
    Ok(())
}
