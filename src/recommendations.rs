//! Treatment recommendations keyed by disease name.
//!
//! The mapping is an optional JSON object:
//!
//! ```json
//! {
//!   "Early_Blight": {
//!     "treatments": ["Remove infected leaves"],
//!     "fertilizers": ["Balanced NPK 10-10-10"],
//!     "prevention": ["Rotate crops yearly"]
//!   }
//! }
//! ```
//!
//! Lookup is a case-insensitive substring match in either direction and the
//! first key in file order wins, not the closest one. A short key such as
//! `"Blight"` therefore matches every blight class; order keys accordingly.

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendationEntry {
    #[serde(default)]
    pub treatments: Vec<String>,
    #[serde(default)]
    pub fertilizers: Vec<String>,
    #[serde(default)]
    pub prevention: Vec<String>,
}

/// Read-only mapping, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recommendations {
    entries: IndexMap<String, RecommendationEntry>,
}

impl Recommendations {
    pub fn new(entries: IndexMap<String, RecommendationEntry>) -> Self {
        Self { entries }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads the mapping. A missing path, unreadable file or invalid JSON
    /// yields an empty mapping; the reason is logged.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            info!("no recommendations file configured");
            return Self::empty();
        };
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "recommendations file unavailable, continuing without");
                return Self::empty();
            }
        };
        match serde_json::from_str::<IndexMap<String, RecommendationEntry>>(&contents) {
            Ok(entries) => {
                info!(path = %path.display(), diseases = entries.len(), "loaded recommendations");
                Self::new(entries)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "recommendations file is not valid, continuing without");
                Self::empty()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry whose key contains, or is contained in, `disease_name`
    /// (case-insensitive), scanning in file order.
    pub fn lookup(&self, disease_name: &str) -> Option<&RecommendationEntry> {
        let name = disease_name.to_lowercase();
        self.entries
            .iter()
            .find(|(key, _)| {
                let key = key.to_lowercase();
                name.contains(&key) || key.contains(&name)
            })
            .map(|(_, entry)| entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn entry(tag: &str) -> RecommendationEntry {
        RecommendationEntry {
            treatments: vec![format!("{tag} treatment")],
            fertilizers: vec![format!("{tag} fertilizer")],
            prevention: vec![format!("{tag} prevention")],
        }
    }

    fn mapping(keys: &[&str]) -> Recommendations {
        Recommendations::new(keys.iter().map(|k| (k.to_string(), entry(k))).collect())
    }

    #[test]
    fn key_contained_in_disease_name_matches() {
        let recs = mapping(&["Early_Blight", "Healthy"]);
        assert_eq!(recs.lookup("Tomato_Early_Blight"), Some(&entry("Early_Blight")));
    }

    #[test]
    fn disease_name_contained_in_key_matches() {
        let recs = mapping(&["Tomato_Healthy_Leaf"]);
        assert_eq!(recs.lookup("healthy"), Some(&entry("Tomato_Healthy_Leaf")));
    }

    #[test]
    fn matching_ignores_case() {
        let recs = mapping(&["tomato_early_blight"]);
        assert!(recs.lookup("TOMATO_EARLY_BLIGHT").is_some());
    }

    #[test]
    fn first_match_in_file_order_wins() {
        // "Blight" precedes the exact key, so it shadows it.
        let recs = mapping(&["Blight", "Tomato_Early_Blight"]);
        assert_eq!(recs.lookup("Tomato_Early_Blight"), Some(&entry("Blight")));

        let reordered = mapping(&["Tomato_Early_Blight", "Blight"]);
        assert_eq!(reordered.lookup("Tomato_Early_Blight"), Some(&entry("Tomato_Early_Blight")));
    }

    #[test]
    fn lookup_is_deterministic() {
        let recs = mapping(&["Rust", "Scab", "Blight", "Healthy"]);
        let first = recs.lookup("Apple_Scab").cloned();
        for _ in 0..10 {
            assert_eq!(recs.lookup("Apple_Scab").cloned(), first);
        }
    }

    #[test]
    fn no_match_and_empty_mapping_return_none() {
        assert!(mapping(&["Corn_Rust"]).lookup("Tomato_Early_Blight").is_none());
        assert!(Recommendations::empty().lookup("Tomato_Early_Blight").is_none());
    }

    #[test]
    fn load_preserves_file_order_and_defaults_missing_lists() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"Zeta_Rot": {{"treatments": ["cut"]}}, "Alpha_Spot": {{"prevention": ["space plants"]}}}}"#
        )
        .unwrap();

        let recs = Recommendations::load(Some(file.path()));
        assert_eq!(recs.len(), 2);
        let keys: Vec<&String> = recs.entries.keys().collect();
        assert_eq!(keys, vec!["Zeta_Rot", "Alpha_Spot"]);

        let zeta = recs.lookup("zeta_rot").unwrap();
        assert_eq!(zeta.treatments, vec!["cut"]);
        assert!(zeta.fertilizers.is_empty());
        assert!(zeta.prevention.is_empty());
    }

    #[test]
    fn missing_or_invalid_file_yields_empty_mapping() {
        assert!(Recommendations::load(None).is_empty());

        let dir = tempfile::tempdir().unwrap();
        assert!(Recommendations::load(Some(&dir.path().join("absent.json"))).is_empty());

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(bad, "not json").unwrap();
        assert!(Recommendations::load(Some(bad.path())).is_empty());
    }
}
