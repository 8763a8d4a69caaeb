//! Composite-sample definitions.
//!
//! The "samples to combine" file maps a composite sample name to the pieces
//! that must be summed to form it. A piece token is either a full dataset
//! path (sanitized before storage) or the name of a composite sample defined
//! earlier in the file, whose already-expanded piece list is spliced in.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use hs_core::{Error, Result};

use crate::dataset;

/// Ordered composite-sample definitions, as loaded from the sample list.
#[derive(Debug, Clone, Default)]
pub struct SampleDefinitions {
    samples: Vec<(String, Vec<String>)>,
}

impl SampleDefinitions {
    /// Parse a samples-to-combine file: `#`-comment and blank lines ignored,
    /// each data line `<compositeSampleName> <piece1> [<piece2> ...]`.
    pub fn parse(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read sample list {}: {}", path.display(), e))
        })?;
        let mut defs = Self::default();
        for line in content.lines() {
            if line.starts_with('#') {
                continue;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut tokens = line.split_whitespace();
            let key = match tokens.next() {
                Some(k) => k.to_string(),
                None => continue,
            };
            let mut pieces: Vec<String> = Vec::new();
            for token in tokens {
                if let Some(existing) = defs.get(token) {
                    pieces.extend(existing.iter().cloned());
                } else {
                    pieces.push(dataset::sanitize_full_dataset(token)?);
                }
            }
            defs.samples.push((key, pieces));
        }
        Ok(defs)
    }

    /// Build definitions from pre-sanitized entries (used in tests).
    pub fn from_entries(samples: Vec<(String, Vec<String>)>) -> Self {
        Self { samples }
    }

    /// The piece list stored for a composite sample name, if defined.
    pub fn get(&self, sample: &str) -> Option<&[String]> {
        self.samples
            .iter()
            .find(|(name, _)| name == sample)
            .map(|(_, pieces)| pieces.as_slice())
    }

    /// Composite sample names in file order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.samples.iter().map(|(name, _)| name.as_str())
    }

    /// Expand a piece list to the flat set of leaf piece names.
    ///
    /// A piece that names another composite sample is expanded recursively;
    /// the in-progress set catches cyclic alias graphs, which the engine
    /// refuses instead of recursing forever.
    pub fn expand_pieces(&self, pieces: &[String]) -> Result<BTreeSet<String>> {
        let mut expanded = BTreeSet::new();
        let mut in_progress = BTreeSet::new();
        for piece in pieces {
            self.expand_one(piece, &mut expanded, &mut in_progress)?;
        }
        Ok(expanded)
    }

    /// Expand a composite sample name to its leaf piece set.
    pub fn expand_sample(&self, sample: &str) -> Result<BTreeSet<String>> {
        let pieces = self.get(sample).ok_or_else(|| {
            Error::Config(format!("sample '{}' is not defined in the sample list", sample))
        })?;
        self.expand_pieces(pieces)
    }

    fn expand_one(
        &self,
        piece: &str,
        expanded: &mut BTreeSet<String>,
        in_progress: &mut BTreeSet<String>,
    ) -> Result<()> {
        match self.get(piece) {
            Some(subpieces) => {
                if !in_progress.insert(piece.to_string()) {
                    return Err(Error::Validation(format!(
                        "cyclic sample alias detected while expanding '{}'",
                        piece
                    )));
                }
                let subpieces: Vec<String> = subpieces.to_vec();
                for sub in &subpieces {
                    self.expand_one(sub, expanded, in_progress)?;
                }
                in_progress.remove(piece);
            }
            None => {
                expanded.insert(piece.to_string());
            }
        }
        Ok(())
    }

    /// The first composite sample whose expanded piece set contains `piece`.
    pub fn find_sample_for_piece(&self, piece: &str) -> Option<&str> {
        self.samples.iter().find_map(|(name, pieces)| {
            match self.expand_pieces(pieces) {
                Ok(expanded) if expanded.contains(piece) => Some(name.as_str()),
                _ => None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_sample_list(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sampleList.txt");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_parse_splices_earlier_samples() {
        let (_dir, path) = write_sample_list(
            "# sample list\n\
             ZJet_Madgraph /DYJetsToLL_M-5to50_TuneCUETP8M1_13TeV-madgraphMLM-pythia8/Run/SIM\n\
             ALLBKG ZJet_Madgraph /WW_TuneCUETP8M1_13TeV-pythia8/Run/SIM\n",
        );
        let defs = SampleDefinitions::parse(&path).unwrap();
        let allbkg = defs.get("ALLBKG").unwrap();
        assert_eq!(
            allbkg,
            &["DYJetsToLL_M-5to50_madgraphMLM".to_string(), "WW".to_string()]
        );
    }

    #[test]
    fn test_parse_rejects_undefined_fragment() {
        let (_dir, path) = write_sample_list("ALLBKG NotDefinedEarlier\n");
        assert!(SampleDefinitions::parse(&path).is_err());
    }

    #[test]
    fn test_expand_is_idempotent_through_aliases() {
        let defs = SampleDefinitions::from_entries(vec![
            ("A".into(), vec!["x".into(), "y".into()]),
            ("B".into(), vec!["A".into(), "z".into()]),
            ("C".into(), vec!["B".into(), "A".into()]),
        ]);
        let expanded = defs.expand_sample("C").unwrap();
        let expected: BTreeSet<String> =
            ["x", "y", "z"].iter().map(|s| s.to_string()).collect();
        assert_eq!(expanded, expected);
        // expanding the expansion changes nothing
        let again = defs
            .expand_pieces(&expanded.iter().cloned().collect::<Vec<_>>())
            .unwrap();
        assert_eq!(again, expected);
    }

    #[test]
    fn test_cycle_detection() {
        let defs = SampleDefinitions::from_entries(vec![
            ("A".into(), vec!["B".into()]),
            ("B".into(), vec!["A".into()]),
        ]);
        let err = defs.expand_sample("A").unwrap_err();
        assert!(err.to_string().contains("cyclic"));
    }

    #[test]
    fn test_find_sample_for_piece() {
        let defs = SampleDefinitions::from_entries(vec![
            ("A".into(), vec!["x".into()]),
            ("B".into(), vec!["A".into(), "z".into()]),
        ]);
        assert_eq!(defs.find_sample_for_piece("x"), Some("A"));
        assert_eq!(defs.find_sample_for_piece("z"), Some("B"));
        assert_eq!(defs.find_sample_for_piece("nope"), None);
    }
}
