//! Canonical dataset ("piece") names.
//!
//! Raw dataset names arrive in two shapes: short names from the input list
//! (file stems like `TTJets_DiLept_reduced_skim`) and full dataset paths
//! (`/Name_Tune.../Campaign/Tier`). Both are normalized to the same
//! canonical piece name, which is the dictionary key used everywhere else.

use hs_core::{Error, Result};

/// Normalize a dataset name taken from the input list.
///
/// Strips any `_reduced_skim` marker and truncates at the first `_pythia8`
/// suffix. Idempotent.
pub fn sanitize_from_input_list(name: &str) -> String {
    let name = name.replace("_reduced_skim", "");
    match name.find("_pythia8") {
        Some(pos) if name.ends_with("_pythia8") => name[..pos].to_string(),
        _ => name,
    }
}

/// Derive the canonical piece name from a full dataset path.
///
/// The candidates are the substring before `_Tune`, the substring before
/// `_13TeV`, and the second path segment; the shortest wins. `_extN` and
/// generator tags (`madgraphMLM`, `amcatnloFXFX`) are appended so that
/// extension runs and repeated generators stay distinct. `Run2015`-era data
/// paths keep their first two `__`-joined segments instead.
///
/// Fails with a configuration error when the path-separator structure is
/// absent: that means the token is a piece fragment that was never defined
/// earlier in the sample list, not a dataset path.
pub fn sanitize_full_dataset(dataset: &str) -> Result<String> {
    if dataset.contains("Run2015") {
        let joined = dataset.trim_start_matches('/').replace('/', "__");
        let mut parts = joined.split("__");
        let first = parts.next().unwrap_or_default();
        let second = parts.next().ok_or_else(|| {
            Error::Config(format!(
                "cannot sanitize dataset '{}': expected at least two path segments",
                dataset
            ))
        })?;
        return Ok(format!("{}__{}", first, second));
    }

    let stem = dataset.strip_prefix('/').unwrap_or(dataset);
    let mut candidates: Vec<&str> = Vec::new();
    if let Some(pos) = stem.find("_Tune") {
        candidates.push(&stem[..pos]);
    }
    if let Some(pos) = stem.find("_13TeV") {
        candidates.push(&stem[..pos]);
    }
    // the dataset-name path segment itself is the fallback candidate; a
    // token without path separators is a piece fragment, not a dataset path
    if dataset.contains('/') {
        if let Some(segment) = stem.split('/').next() {
            candidates.push(segment);
        }
    } else if candidates.is_empty() {
        return Err(Error::Config(format!(
            "cannot sanitize dataset '{}': no path separator found; this can happen \
             if this is a piece (not a full dataset) containing multiple samples \
             that has not been defined earlier in the sample list",
            dataset
        )));
    }
    let mut output = candidates
        .iter()
        .min_by_key(|c| c.len())
        .map(|c| c.to_string())
        .ok_or_else(|| {
            Error::Config(format!("cannot sanitize dataset '{}': empty name", dataset))
        })?;

    if let Some(pos) = dataset.find("_ext") {
        if let Some(digit) = dataset[pos + 4..].chars().next() {
            output.push_str("_ext");
            output.push(digit);
        }
    }
    if dataset.contains("madgraphMLM") {
        output.push_str("_madgraphMLM");
    } else if dataset.contains("amcatnloFXFX") {
        output.push_str("_amcatnloFXFX");
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_list_sanitization() {
        assert_eq!(
            sanitize_from_input_list("TTJets_DiLept_reduced_skim"),
            "TTJets_DiLept"
        );
        assert_eq!(
            sanitize_from_input_list("ZToEE_NNPDF30_13TeV-powheg_pythia8"),
            "ZToEE_NNPDF30_13TeV-powheg"
        );
        assert_eq!(sanitize_from_input_list("SingleElectron__Run2016G"), "SingleElectron__Run2016G");
    }

    #[test]
    fn test_input_list_sanitization_is_idempotent() {
        for raw in [
            "TTJets_DiLept_reduced_skim",
            "ZToEE_NNPDF30_13TeV-powheg_pythia8",
            "DYJetsToLL_M-50",
        ] {
            let once = sanitize_from_input_list(raw);
            assert_eq!(sanitize_from_input_list(&once), once);
        }
    }

    #[test]
    fn test_full_dataset_shortest_candidate_wins() {
        let name = sanitize_full_dataset(
            "/DYJetsToLL_M-50_TuneCUETP8M1_13TeV-amcatnloFXFX-pythia8/RunIISummer16/MINIAODSIM",
        )
        .unwrap();
        assert_eq!(name, "DYJetsToLL_M-50_amcatnloFXFX");
    }

    #[test]
    fn test_full_dataset_ext_suffix() {
        let name = sanitize_full_dataset(
            "/TTJets_DiLept_TuneCUETP8M1_13TeV-madgraphMLM-pythia8/RunII_ext1-v1/MINIAODSIM",
        )
        .unwrap();
        assert_eq!(name, "TTJets_DiLept_ext1_madgraphMLM");
    }

    #[test]
    fn test_run2015_data_path() {
        let name =
            sanitize_full_dataset("/SingleElectron/Run2015D-PromptReco-v4/MINIAOD").unwrap();
        assert_eq!(name, "SingleElectron__Run2015D-PromptReco-v4");
    }

    #[test]
    fn test_fragment_without_separator_is_config_error() {
        let err = sanitize_full_dataset("OtherBkgs").unwrap_err();
        assert!(err.to_string().contains("OtherBkgs"));
    }
}
