//! Piece-completeness validation.
//!
//! A partially-combined background (three of six mass-binned pieces, say)
//! is strictly worse than no sample at all: downstream statistical
//! inference cannot detect the under-count. Exact set equality is required;
//! anything else abandons the composite sample with no output written.

use std::collections::BTreeSet;

use hs_core::{Error, Result};

/// Verify that exactly the expected pieces were combined into `sample`.
///
/// The diagnostic names the symmetric difference plus both full sets, so
/// the failing combination can be reproduced by hand.
pub fn check_pieces_added(
    sample: &str,
    added: &BTreeSet<String>,
    expected: &BTreeSet<String>,
) -> Result<()> {
    if added == expected {
        return Ok(());
    }
    let difference: Vec<&String> = added.symmetric_difference(expected).collect();
    Err(Error::Validation(format!(
        "for sample {}, the following pieces requested in the sample list were not \
         correctly added: {:?}; the pieces indicated as part of the sample were: {:?}; \
         the pieces added were: {:?}. Refusing to proceed.",
        sample,
        difference,
        expected.iter().collect::<Vec<_>>(),
        added.iter().collect::<Vec<_>>(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_equal_sets_pass() {
        let s = set(&["A", "B", "C"]);
        assert!(check_pieces_added("DIBOSON", &s, &s).is_ok());
    }

    #[test]
    fn test_missing_piece_is_reported() {
        let expected = set(&["X", "Y", "Z"]);
        let added = set(&["X", "Y"]);
        let err = check_pieces_added("DIBOSON", &added, &expected).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("DIBOSON"));
        assert!(msg.contains("\"Z\""));
    }

    #[test]
    fn test_unexpected_piece_is_reported() {
        let expected = set(&["X", "Y"]);
        let added = set(&["X", "Y", "extra"]);
        let err = check_pieces_added("DIBOSON", &added, &expected).unwrap_err();
        assert!(err.to_string().contains("\"extra\""));
    }

    #[test]
    fn test_empty_sets_pass() {
        let s = set(&[]);
        assert!(check_pieces_added("EMPTY", &s, &s).is_ok());
    }
}
