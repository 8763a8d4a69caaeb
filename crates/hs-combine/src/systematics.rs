//! LHE scale-weight and PDF-weight systematic combination.
//!
//! The per-sample `systematics` object is a labeled 2-D histogram
//! (x = selection, y = systematic variation; y data-bin 1 is the nominal).
//! Ordinary variation rows sum across pieces, but the combination rows must
//! not: the envelope of the maximum deviation for a *sum* of backgrounds is
//! not the sum of each background's own envelope. The combination rows are
//! therefore recomputed: per piece in uncorrelated mode (deltas then
//! combine in quadrature through the summed `sumw2`), or once on the fully
//! summed histogram in correlated mode.

use std::collections::BTreeMap;

use hs_core::{Error, Result};
use tracing::debug;

use crate::archive::{BranchMap, Histo2D};

pub const SCALE_WEIGHT_PREFIX: &str = "LHEScaleWeight_";
pub const SCALE_MAX_COMB: &str = "LHEScaleWeight_maxComb";
pub const SCALE_MAX_INDEX: &str = "LHEScaleWeight_maxIndex";
pub const SCALE_UP_COMB: &str = "LHEScale_UpComb";
pub const SCALE_DOWN_COMB: &str = "LHEScale_DownComb";
pub const PDF_WEIGHT_PREFIX: &str = "LHEPdfWeight_";
pub const PDF_WEIGHT_BRANCH: &str = "LHEPdfWeight";
pub const PDF_MC_UP_COMB: &str = "LHEPdfWeightMC_UpComb";
pub const PDF_MC_DOWN_COMB: &str = "LHEPdfWeightMC_DownComb";
pub const PDF_HESSIAN_NOMINAL_COMB: &str = "LHEPdfWeightHessian_NominalComb";
pub const PDF_UP_COMB: &str = "LHEPdf_UpComb";
pub const PDF_DOWN_COMB: &str = "LHEPdf_DownComb";

/// Scale-weight variation indices excluded from the envelope: the nominal
/// (4) and the two opposite μR/μF cross-variations (2 and 6) of the 9-point
/// scheme.
const INVALID_SCALE_INDICES: [usize; 3] = [2, 4, 6];

/// How a PDF set's variations combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdfVariationKind {
    /// Equally-likely replicas; the envelope is an order statistic.
    MonteCarlo { replicas: usize },
    /// Hessian eigenvector variations; the envelope is a quadrature sum.
    Hessian { eigenvectors: usize },
}

/// Known PDF sets by leading LHA ID. The bool is `true` for Hessian sets.
const KNOWN_PDF_SETS: &[(u32, bool, &str)] = &[
    (91400, true, "PDF4LHC15_nnlo_30_pdfas"),
    (260000, false, "NNPDF30_nlo_as_0118"),
    (262000, false, "NNPDF30_lo_as_0130"),
    (263000, false, "NNPDF30_lo_as_0130_nf_4"),
    (292000, false, "NNPDF30_nlo_nf_4_pdfas"),
    (292200, false, "NNPDF30_nlo_nf_5_pdfas"),
    (305800, true, "NNPDF31_nlo_hessian_pdfas"),
    (306000, true, "NNPDF31_nnlo_hessian_pdfas"),
    (316200, true, "NNPDF31_nnlo_as_0118_mc_hessian_pdfas"),
    (320900, false, "NNPDF31_nnlo_as_0118_nf_4"),
    (325300, true, "NNPDF31_nnlo_as_0118_mc_hessian_pdfas"),
    (325500, true, "NNPDF31_nnlo_as_0118_nf_4_mc_hessian"),
];

/// Classify a PDF set from the `LHEPdfWeight` branch title, which carries
/// the LHA ID range (e.g. `... for LHA IDs 306000 - 306102`).
///
/// The usable variation count discards the nominal member and any trailing
/// αS members beyond the canonical 100 (or 30) replicas/eigenvectors.
pub fn classify_pdf_set(branch_title: &str) -> Result<(PdfVariationKind, &'static str)> {
    let marker = "LHA IDs";
    let pos = branch_title.find(marker).ok_or_else(|| {
        Error::Config(format!(
            "cannot classify PDF set: no LHA ID range in branch title '{}'",
            branch_title
        ))
    })?;
    let mut ids = branch_title[pos + marker.len()..]
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>());
    let (lo, hi) = match (ids.next(), ids.next()) {
        (Some(Ok(lo)), Some(Ok(hi))) if hi >= lo => (lo, hi),
        _ => {
            return Err(Error::Config(format!(
                "cannot classify PDF set: malformed LHA ID range in branch title '{}'",
                branch_title
            )))
        }
    };
    let (_, hessian, name) = KNOWN_PDF_SETS
        .iter()
        .find(|(id, _, _)| *id == lo)
        .ok_or_else(|| {
            Error::Config(format!("unknown PDF set with leading LHA ID {}", lo))
        })?;
    let member_count = (hi - lo) as usize; // variations, nominal excluded
    let usable = if member_count >= 100 {
        100
    } else if member_count >= 30 {
        30
    } else {
        member_count
    };
    let kind = if *hessian {
        PdfVariationKind::Hessian { eigenvectors: usable }
    } else {
        PdfVariationKind::MonteCarlo { replicas: usable }
    };
    Ok((kind, *name))
}

/// The PDF kind for a systematics histogram, from its branch map.
pub fn pdf_kind_from_branch_map(branch_map: Option<&BranchMap>) -> Result<Option<PdfVariationKind>> {
    let Some(map) = branch_map else { return Ok(None) };
    let Some(titles) = map.map.get(PDF_WEIGHT_BRANCH) else {
        return Ok(None);
    };
    let Some(title) = titles.first() else { return Ok(None) };
    let (kind, name) = classify_pdf_set(title)?;
    debug!(pdf_set = name, ?kind, "classified PDF set");
    Ok(Some(kind))
}

fn scale_variation_rows(hist: &Histo2D) -> Vec<(usize, usize)> {
    let mut rows = Vec::new();
    for (i, label) in hist.y_labels.iter().enumerate() {
        if let Some(suffix) = label.strip_prefix(SCALE_WEIGHT_PREFIX) {
            if let Ok(idx) = suffix.parse::<usize>() {
                if !INVALID_SCALE_INDICES.contains(&idx) {
                    rows.push((i + 1, idx));
                }
            }
        }
    }
    rows
}

fn pdf_variation_rows(hist: &Histo2D, count: usize) -> Vec<usize> {
    (1..=count)
        .filter_map(|i| hist.find_y_label_bin(&format!("{}{}", PDF_WEIGHT_PREFIX, i)))
        .collect()
}

/// Maximum |variation − nominal| over the valid scale-weight rows at
/// selection column `ix`, plus the variation index realizing it.
pub fn scale_envelope(hist: &Histo2D, ix: usize) -> (f64, usize) {
    let nominal = hist.content(ix, 1);
    let mut max_delta = 0.0;
    let mut max_idx = 0;
    for (ybin, idx) in scale_variation_rows(hist) {
        let delta = (hist.content(ix, ybin) - nominal).abs();
        if delta > max_delta {
            max_delta = delta;
            max_idx = idx;
        }
    }
    (max_delta, max_idx)
}

/// 16th/84th order-statistic envelope of the MC replica rows at `ix`,
/// relative to `nominal`. Returns `(delta_up, delta_down)`.
pub fn mc_pdf_envelope(hist: &Histo2D, ix: usize, replicas: usize, nominal: f64) -> (f64, f64) {
    let mut yields: Vec<f64> = pdf_variation_rows(hist, replicas)
        .iter()
        .map(|&ybin| hist.content(ix, ybin))
        .collect();
    if yields.is_empty() {
        return (0.0, 0.0);
    }
    yields.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = yields.len();
    let idx_hi = (((0.84 * n as f64).round() as usize).max(1) - 1).min(n - 1);
    let idx_lo = (((0.16 * n as f64).round() as usize).max(1) - 1).min(n - 1);
    let delta_up = (yields[idx_hi] - nominal).max(0.0);
    let delta_down = (nominal - yields[idx_lo]).max(0.0);
    (delta_up, delta_down)
}

/// Quadrature sum of (variation − nominal) over the Hessian eigenvector
/// rows at `ix`.
pub fn hessian_pdf_envelope(hist: &Histo2D, ix: usize, eigenvectors: usize, nominal: f64) -> f64 {
    pdf_variation_rows(hist, eigenvectors)
        .iter()
        .map(|&ybin| {
            let d = hist.content(ix, ybin) - nominal;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// Prepare a single piece's systematics histogram for uncorrelated
/// combination.
///
/// The scale and PDF envelopes are computed on this piece alone and stored
/// in the combination rows as content = nominal + δ and sumw2 = δ², so that
/// the plain histogram addition used to merge pieces yields the quadrature
/// sum of the per-piece deltas in the combination rows' errors. Raw MC
/// replica rows are zeroed afterwards: replica k of one piece has no
/// relation to replica k of another, so their sum is meaningless.
pub fn prepare_piece_systematics(
    hist: &mut Histo2D,
    branch_map: Option<&BranchMap>,
) -> Result<()> {
    hist.add_y_rows(&[
        SCALE_MAX_COMB,
        SCALE_MAX_INDEX,
        PDF_MC_UP_COMB,
        PDF_MC_DOWN_COMB,
        PDF_HESSIAN_NOMINAL_COMB,
    ]);
    let n_cells_x = hist.n_bins_x + 2;
    let scale_comb = hist.find_y_label_bin(SCALE_MAX_COMB).unwrap_or(0);
    let scale_idx_row = hist.find_y_label_bin(SCALE_MAX_INDEX).unwrap_or(0);
    for ix in 0..n_cells_x {
        let nominal = hist.content(ix, 1);
        let (delta, max_idx) = scale_envelope(hist, ix);
        hist.set_content(ix, scale_comb, nominal + delta);
        hist.set_variance(ix, scale_comb, delta * delta);
        hist.set_content(ix, scale_idx_row, max_idx as f64);
        hist.set_variance(ix, scale_idx_row, 0.0);
    }

    let pdf_kind = pdf_kind_from_branch_map(branch_map)?;
    match pdf_kind {
        Some(PdfVariationKind::MonteCarlo { replicas }) => {
            let up_row = hist.find_y_label_bin(PDF_MC_UP_COMB).unwrap_or(0);
            let down_row = hist.find_y_label_bin(PDF_MC_DOWN_COMB).unwrap_or(0);
            for ix in 0..n_cells_x {
                let nominal = hist.content(ix, 1);
                let (up, down) = mc_pdf_envelope(hist, ix, replicas, nominal);
                hist.set_content(ix, up_row, up);
                hist.set_variance(ix, up_row, up * up);
                hist.set_content(ix, down_row, down);
                hist.set_variance(ix, down_row, down * down);
            }
            // replica k of this piece has no counterpart elsewhere; the
            // trailing alpha_s members go too
            let replica_rows: Vec<usize> = hist
                .y_labels
                .iter()
                .enumerate()
                .filter(|(_, label)| {
                    label
                        .strip_prefix(PDF_WEIGHT_PREFIX)
                        .is_some_and(|s| s.parse::<usize>().is_ok())
                })
                .map(|(i, _)| i + 1)
                .collect();
            for ybin in replica_rows {
                for ix in 0..n_cells_x {
                    hist.set_content(ix, ybin, 0.0);
                    hist.set_variance(ix, ybin, 0.0);
                }
            }
        }
        Some(PdfVariationKind::Hessian { .. }) => {
            let nom_row = hist.find_y_label_bin(PDF_HESSIAN_NOMINAL_COMB).unwrap_or(0);
            for ix in 0..n_cells_x {
                let nominal = hist.content(ix, 1);
                hist.set_content(ix, nom_row, nominal);
                hist.set_variance(ix, nom_row, nominal * nominal);
            }
        }
        None => {}
    }
    Ok(())
}

/// Recompute the final combination rows on a fully-summed sample
/// systematics histogram.
///
/// Correlated mode treats the same variation index as correlated across all
/// pieces, so the envelopes are evaluated once on the summed raw rows.
/// Uncorrelated mode reads the per-piece deltas back out of the combination
/// rows' accumulated variances.
pub fn finalize_sample_systematics(
    hist: &mut Histo2D,
    branch_map: Option<&BranchMap>,
    correlated: bool,
) -> Result<()> {
    hist.add_y_rows(&[
        SCALE_MAX_COMB,
        SCALE_MAX_INDEX,
        PDF_MC_UP_COMB,
        PDF_MC_DOWN_COMB,
        PDF_HESSIAN_NOMINAL_COMB,
        SCALE_UP_COMB,
        SCALE_DOWN_COMB,
        PDF_UP_COMB,
        PDF_DOWN_COMB,
    ]);
    let n_cells_x = hist.n_bins_x + 2;
    let pdf_kind = pdf_kind_from_branch_map(branch_map)?;

    let scale_comb = hist.find_y_label_bin(SCALE_MAX_COMB).unwrap_or(0);
    let scale_idx_row = hist.find_y_label_bin(SCALE_MAX_INDEX).unwrap_or(0);
    let scale_up = hist.find_y_label_bin(SCALE_UP_COMB).unwrap_or(0);
    let scale_down = hist.find_y_label_bin(SCALE_DOWN_COMB).unwrap_or(0);
    let mc_up_row = hist.find_y_label_bin(PDF_MC_UP_COMB).unwrap_or(0);
    let mc_down_row = hist.find_y_label_bin(PDF_MC_DOWN_COMB).unwrap_or(0);
    let hessian_row = hist.find_y_label_bin(PDF_HESSIAN_NOMINAL_COMB).unwrap_or(0);
    let pdf_up = hist.find_y_label_bin(PDF_UP_COMB).unwrap_or(0);
    let pdf_down = hist.find_y_label_bin(PDF_DOWN_COMB).unwrap_or(0);

    let has_hessian_part =
        (0..n_cells_x).any(|ix| hist.content(ix, hessian_row) != 0.0);

    for ix in 0..n_cells_x {
        let nominal = hist.content(ix, 1);

        let (scale_delta, max_idx) = if correlated {
            scale_envelope(hist, ix)
        } else {
            (hist.variance(ix, scale_comb).max(0.0).sqrt(), 0)
        };
        hist.set_content(ix, scale_comb, nominal + scale_delta);
        hist.set_variance(ix, scale_comb, scale_delta * scale_delta);
        hist.set_content(ix, scale_idx_row, max_idx as f64);
        for row in [scale_up, scale_down] {
            hist.set_content(ix, row, nominal + scale_delta);
            hist.set_variance(ix, row, scale_delta * scale_delta);
        }

        let (mc_delta_up, mc_delta_down) = match (correlated, pdf_kind) {
            (true, Some(PdfVariationKind::MonteCarlo { replicas })) => {
                mc_pdf_envelope(hist, ix, replicas, nominal)
            }
            _ => (
                hist.variance(ix, mc_up_row).max(0.0).sqrt(),
                hist.variance(ix, mc_down_row).max(0.0).sqrt(),
            ),
        };

        let hessian_delta = match (correlated, pdf_kind) {
            (true, Some(PdfVariationKind::Hessian { eigenvectors })) => {
                hessian_pdf_envelope(hist, ix, eigenvectors, nominal)
            }
            _ if has_hessian_part => {
                let hessian_nominal = hist.content(ix, hessian_row);
                match pdf_kind {
                    Some(PdfVariationKind::Hessian { eigenvectors }) => {
                        hessian_pdf_envelope(hist, ix, eigenvectors, hessian_nominal)
                    }
                    _ => 0.0,
                }
            }
            _ => 0.0,
        };

        let delta_up = (hessian_delta * hessian_delta + mc_delta_up * mc_delta_up).sqrt();
        let delta_down = (hessian_delta * hessian_delta + mc_delta_down * mc_delta_down).sqrt();
        hist.set_content(ix, pdf_up, nominal + delta_up);
        hist.set_variance(ix, pdf_up, delta_up * delta_up);
        hist.set_content(ix, pdf_down, nominal + delta_down);
        hist.set_variance(ix, pdf_down, delta_down * delta_down);
    }
    Ok(())
}

/// One systematic-variation yield at one selection point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystematicEntry {
    /// Varied yield at this selection.
    pub yield_value: f64,
    /// Varied yield at the preselection column, when that column exists.
    pub presel_yield: Option<f64>,
}

/// Extract the `(systematic, selection) → entry` view consumed by the
/// datacard step.
pub fn systematic_entries(
    hist: &Histo2D,
    presel_label: &str,
) -> BTreeMap<(String, String), SystematicEntry> {
    let presel_bin = hist.find_x_label_bin(presel_label);
    let mut entries = BTreeMap::new();
    for (yi, syst) in hist.y_labels.iter().enumerate() {
        for (xi, selection) in hist.x_labels.iter().enumerate() {
            let entry = SystematicEntry {
                yield_value: hist.content(xi + 1, yi + 1),
                presel_yield: presel_bin.map(|px| hist.content(px, yi + 1)),
            };
            entries.insert((syst.clone(), selection.clone()), entry);
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn syst_hist(selections: &[&str], systs: &[&str]) -> Histo2D {
        let mut h = Histo2D::new("systematics", selections.len(), systs.len());
        h.x_labels = selections.iter().map(|s| s.to_string()).collect();
        h.y_labels = systs.iter().map(|s| s.to_string()).collect();
        h
    }

    #[test]
    fn test_classify_pdf_set() {
        let (kind, name) = classify_pdf_set(
            "LHE pdf variation weights (w_var / w_nominal) for LHA IDs 306000 - 306102",
        )
        .unwrap();
        assert_eq!(kind, PdfVariationKind::Hessian { eigenvectors: 100 });
        assert_eq!(name, "NNPDF31_nnlo_hessian_pdfas");

        let (kind, _) = classify_pdf_set(
            "LHE pdf variation weights (w_var / w_nominal) for LHA IDs 260000 - 260100",
        )
        .unwrap();
        assert_eq!(kind, PdfVariationKind::MonteCarlo { replicas: 100 });

        let (kind, _) = classify_pdf_set(
            "LHE pdf variation weights (w_var / w_nominal) for LHA IDs 91400 - 91432",
        )
        .unwrap();
        assert_eq!(kind, PdfVariationKind::Hessian { eigenvectors: 30 });

        assert!(classify_pdf_set("no ids here").is_err());
        assert!(classify_pdf_set("for LHA IDs 999999 - 999999").is_err());
    }

    #[test]
    fn test_scale_envelope_excludes_unphysical_variations() {
        let labels: Vec<String> =
            (0..9).map(|i| format!("{}{}", SCALE_WEIGHT_PREFIX, i)).collect();
        let mut systs: Vec<&str> = vec!["nominal"];
        systs.extend(labels.iter().map(|s| s.as_str()));
        let mut h = syst_hist(&["presel"], &systs);
        h.set_content(1, 1, 10.0); // nominal
        for (i, _) in labels.iter().enumerate() {
            // row for LHEScaleWeight_i is y bin i+2 (nominal occupies bin 1)
            h.set_content(1, i + 2, 10.0 + i as f64 * 0.1);
        }
        // make the excluded cross-variation the largest deviation
        let bin_2 = h.find_y_label_bin("LHEScaleWeight_2").unwrap();
        h.set_content(1, bin_2, 99.0);
        let (delta, idx) = scale_envelope(&h, 1);
        // largest valid deviation is index 8: |10.8 - 10.0|
        assert_relative_eq!(delta, 0.8, max_relative = 1e-12);
        assert_eq!(idx, 8);
    }

    #[test]
    fn test_mc_pdf_envelope_order_statistics() {
        let labels: Vec<String> =
            (1..=100).map(|i| format!("{}{}", PDF_WEIGHT_PREFIX, i)).collect();
        let mut systs: Vec<&str> = vec!["nominal"];
        systs.extend(labels.iter().map(|s| s.as_str()));
        let mut h = syst_hist(&["presel"], &systs);
        h.set_content(1, 1, 50.0);
        // replica yields 1..=100
        for i in 1..=100usize {
            let ybin = h.find_y_label_bin(&format!("{}{}", PDF_WEIGHT_PREFIX, i)).unwrap();
            h.set_content(1, ybin, i as f64);
        }
        let (up, down) = mc_pdf_envelope(&h, 1, 100, 50.0);
        // sorted yields are 1..=100: 84th value is 84, 16th is 16
        assert_relative_eq!(up, 34.0, max_relative = 1e-12);
        assert_relative_eq!(down, 34.0, max_relative = 1e-12);
    }

    #[test]
    fn test_hessian_envelope_quadrature() {
        let labels: Vec<String> =
            (1..=2).map(|i| format!("{}{}", PDF_WEIGHT_PREFIX, i)).collect();
        let mut systs: Vec<&str> = vec!["nominal"];
        systs.extend(labels.iter().map(|s| s.as_str()));
        let mut h = syst_hist(&["presel"], &systs);
        h.set_content(1, 1, 10.0);
        h.set_content(1, 2, 13.0); // +3
        h.set_content(1, 3, 6.0); // -4
        let delta = hessian_pdf_envelope(&h, 1, 2, 10.0);
        assert_relative_eq!(delta, 5.0, max_relative = 1e-12);
    }

    #[test]
    fn test_uncorrelated_pieces_combine_in_quadrature() {
        // two pieces with scale deltas 3 and 4 must combine to 5, not 7
        let systs = ["nominal", "LHEScaleWeight_0"];
        let mut total: Option<Histo2D> = None;
        for delta in [3.0, 4.0] {
            let mut piece = syst_hist(&["presel"], &systs);
            piece.set_content(1, 1, 10.0);
            piece.set_content(1, 2, 10.0 + delta);
            prepare_piece_systematics(&mut piece, None).unwrap();
            match total.as_mut() {
                None => total = Some(piece),
                Some(t) => t.add(&piece).unwrap(),
            }
        }
        let mut total = total.unwrap();
        finalize_sample_systematics(&mut total, None, false).unwrap();
        let up = total.find_y_label_bin(SCALE_UP_COMB).unwrap();
        // summed nominal is 20; quadrature delta is 5
        assert_relative_eq!(total.content(1, up), 25.0, max_relative = 1e-12);
        assert_relative_eq!(total.variance(1, up), 25.0, max_relative = 1e-12);
    }

    #[test]
    fn test_correlated_pieces_use_summed_envelope() {
        let systs = ["nominal", "LHEScaleWeight_0"];
        let mut total: Option<Histo2D> = None;
        for delta in [3.0, 4.0] {
            let mut piece = syst_hist(&["presel"], &systs);
            piece.set_content(1, 1, 10.0);
            piece.set_content(1, 2, 10.0 + delta);
            match total.as_mut() {
                None => total = Some(piece),
                Some(t) => t.add(&piece).unwrap(),
            }
        }
        let mut total = total.unwrap();
        finalize_sample_systematics(&mut total, None, true).unwrap();
        let up = total.find_y_label_bin(SCALE_UP_COMB).unwrap();
        // summed variation row is 27, summed nominal 20: a linear delta of 7
        assert_relative_eq!(total.content(1, up), 27.0, max_relative = 1e-12);
    }

    #[test]
    fn test_systematic_entries_view() {
        let mut h = syst_hist(&["preselection", "final"], &["nominal", "Prefire_Up"]);
        h.set_content(1, 1, 100.0);
        h.set_content(2, 1, 40.0);
        h.set_content(1, 2, 103.0);
        h.set_content(2, 2, 41.0);
        let entries = systematic_entries(&h, "preselection");
        let e = entries
            .get(&("Prefire_Up".to_string(), "final".to_string()))
            .unwrap();
        assert_relative_eq!(e.yield_value, 41.0);
        assert_relative_eq!(e.presel_yield.unwrap(), 103.0);
    }
}
