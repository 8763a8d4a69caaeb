//! Per-piece weight computation.

use hs_core::{Error, Result};
use tracing::info;

use crate::xsection;

/// The weights applied to one piece during combination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PieceWeight {
    /// Table weight: (xsec × lumi) / sum of generator weights; 1.0 for data.
    pub weight: f64,
    /// Histogram fill weight: `weight / 1000` (pb vs fb unit convention,
    /// keeps fill weights near unity); 1.0 for data.
    pub plot_weight: f64,
    /// Cross-section × integrated luminosity; for data, the raw unweighted
    /// event count (the internal representation of "no reweighting").
    pub xsec_times_lumi: f64,
}

/// Compute the weight for one piece.
///
/// `xsection_val` is the raw cross-section string so the `"-1"` data
/// sentinel survives exactly. `pdf_reweight` substitutes the PDF-reweighted
/// sum of weights for a small set of historically mis-normalized signal
/// samples. A simulation piece with a zero sum of generator weights means a
/// corrupted or zero-event input file; that surfaces as a loud computation
/// error, never as an infinite weight poisoning downstream sums.
pub fn calculate_weight(
    n_total: f64,
    xsection_val: &str,
    int_lumi: f64,
    sum_weights: f64,
    lhe_pdf_weight_sumw: f64,
    pdf_reweight: bool,
    piece: &str,
) -> Result<PieceWeight> {
    if xsection::is_data(xsection_val) {
        info!(piece, "[data] no reweighting");
        return Ok(PieceWeight { weight: 1.0, plot_weight: 1.0, xsec_times_lumi: n_total });
    }
    let xsection: f64 = xsection_val.parse().map_err(|_| {
        Error::Config(format!(
            "bad cross-section value '{}' for piece '{}'",
            xsection_val, piece
        ))
    })?;
    let xsec_times_lumi = xsection * int_lumi;
    let sum_weights = if pdf_reweight {
        info!(
            piece,
            lhe_pdf_weight_sumw,
            original = sum_weights,
            "applying PDF-reweighted sum of weights"
        );
        lhe_pdf_weight_sumw
    } else {
        sum_weights
    };
    if sum_weights == 0.0 {
        return Err(Error::Computation(format!(
            "sum of generator weights is zero for simulated piece '{}' \
             (xsec={} pb, lumi={} pb^-1): corrupted or empty input file",
            piece, xsection_val, int_lumi
        )));
    }
    let weight = xsec_times_lumi / sum_weights;
    info!(piece, weight, xsec_times_lumi, sum_weights, "[MC] computed weight");
    Ok(PieceWeight { weight, plot_weight: weight / 1000.0, xsec_times_lumi })
}
