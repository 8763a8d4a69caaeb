//! Histogram accumulation across the pieces of a composite sample.
//!
//! The accumulator is keyed by the de-prefixed object name. Ordinary
//! histograms are scaled by the piece's plot weight and added bin by bin;
//! real-data pieces are never rescaled, and neither are the unweighted
//! bookkeeping histograms. The 2-D `systematics` object gets the LHE
//! combination treatment from [`crate::systematics`], and QCD-from-data
//! pieces have physically-meaningless negative bins zeroed on the way in.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use hs_core::{Error, Result};
use tracing::debug;

use crate::archive::{deprefixed, ArchiveObject, BranchMap, Histo2D, PlotsArchive};
use crate::systematics;

/// Object-name fragments that mark histograms which must never be rescaled.
const UNSCALED_NAME_FRAGMENTS: [&str; 2] = ["optimizerentries", "noweight"];

/// The name of the 2-D systematic-variation object.
pub const SYSTEMATICS_NAME: &str = "systematics";

/// The name of the systematic-to-branches associative object.
pub const BRANCH_MAP_NAME: &str = "systematicNameToBranchesMap";

/// Running per-sample histogram accumulator.
#[derive(Debug, Clone, Default)]
pub struct HistoStore {
    objects: BTreeMap<String, ArchiveObject>,
}

impl HistoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// The accumulated object for a bare name.
    pub fn get(&self, name: &str) -> Option<&ArchiveObject> {
        self.objects.get(name)
    }

    /// The accumulated `systematics` histogram, if any piece carried one.
    pub fn systematics(&self) -> Option<&Histo2D> {
        match self.objects.get(SYSTEMATICS_NAME) {
            Some(ArchiveObject::Histo2D(h)) => Some(h),
            _ => None,
        }
    }

    /// The merged branch map, if any piece carried one.
    pub fn branch_map(&self) -> Option<&BranchMap> {
        match self.objects.get(BRANCH_MAP_NAME) {
            Some(ArchiveObject::BranchMap(m)) => Some(m),
            _ => None,
        }
    }

    /// Accumulate one piece's objects.
    ///
    /// `plot_weight` is the piece's histogram fill weight (1.0 when the
    /// piece file was already pre-scaled); `is_data` suppresses all
    /// rescaling; `correlate_lhe` selects the LHE combination mode; `is_qcd`
    /// zeroes incoming negative bins.
    pub fn update_from(
        &mut self,
        objects: &[ArchiveObject],
        piece: &str,
        plot_weight: f64,
        correlate_lhe: bool,
        is_data: bool,
        is_qcd: bool,
    ) -> Result<()> {
        // branch maps first: the systematics preparation below needs the
        // PDF-set classification they carry
        for object in objects {
            let ArchiveObject::BranchMap(m) = object else { continue };
            let key = deprefixed(object.name()).to_string();
            match self.objects.entry(key.clone()) {
                Entry::Vacant(slot) => {
                    let mut incoming = m.clone();
                    incoming.name = key;
                    slot.insert(ArchiveObject::BranchMap(incoming));
                }
                Entry::Occupied(mut slot) => match slot.get_mut() {
                    ArchiveObject::BranchMap(acc) => {
                        for (syst, branches) in &m.map {
                            acc.map.entry(syst.clone()).or_insert_with(|| branches.clone());
                        }
                    }
                    other => {
                        return Err(Error::Validation(format!(
                            "object '{}' from piece '{}' clashes with a {} accumulator",
                            m.name,
                            piece,
                            other.name_prefix()
                        )))
                    }
                },
            }
        }
        for object in objects {
            let key = deprefixed(object.name()).to_string();
            let incoming = match object {
                ArchiveObject::Histo1D(h) => {
                    let mut incoming = h.clone();
                    incoming.name = key.clone();
                    if scale_applies(&key, is_data) {
                        incoming.scale(plot_weight);
                    }
                    if is_qcd {
                        incoming.zero_negative_bins();
                    }
                    ArchiveObject::Histo1D(incoming)
                }
                ArchiveObject::Histo2D(h) => {
                    let mut incoming = h.clone();
                    incoming.name = key.clone();
                    if scale_applies(&key, is_data) {
                        incoming.scale(plot_weight);
                    }
                    if is_qcd {
                        incoming.zero_negative_bins();
                    }
                    if key == SYSTEMATICS_NAME && !correlate_lhe && !is_data {
                        systematics::prepare_piece_systematics(
                            &mut incoming,
                            self.branch_map(),
                        )?;
                    }
                    ArchiveObject::Histo2D(incoming)
                }
                ArchiveObject::BranchMap(_) => continue, // merged above
            };
            match self.objects.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(incoming);
                }
                Entry::Occupied(mut slot) => match (slot.get_mut(), &incoming) {
                    (ArchiveObject::Histo1D(acc), ArchiveObject::Histo1D(new)) => {
                        acc.add(new).map_err(|e| {
                            Error::Validation(format!(
                                "failed adding histogram '{}' from piece '{}': {}",
                                object.name(),
                                piece,
                                e
                            ))
                        })?
                    }
                    (ArchiveObject::Histo2D(acc), ArchiveObject::Histo2D(new)) => {
                        acc.add(new).map_err(|e| {
                            Error::Validation(format!(
                                "failed adding histogram '{}' from piece '{}': {}",
                                object.name(),
                                piece,
                                e
                            ))
                        })?
                    }
                    (other, _) => {
                        return Err(Error::Validation(format!(
                            "object '{}' from piece '{}' clashes with a {} accumulator",
                            object.name(),
                            piece,
                            other.name_prefix()
                        )))
                    }
                },
            }
        }
        debug!(piece, objects = self.objects.len(), "accumulated piece histograms");
        Ok(())
    }

    /// Recompute the LHE combination rows of the accumulated `systematics`
    /// histogram. Call once, after the last piece.
    pub fn finalize_systematics(&mut self, correlate_lhe: bool) -> Result<()> {
        let branch_map = self.branch_map().cloned();
        if let Some(ArchiveObject::Histo2D(hist)) = self.objects.get_mut(SYSTEMATICS_NAME) {
            systematics::finalize_sample_systematics(hist, branch_map.as_ref(), correlate_lhe)?;
        }
        Ok(())
    }

    /// Zero negative bin contents of every accumulated histogram.
    pub fn zero_negative_bins(&mut self) {
        for object in self.objects.values_mut() {
            match object {
                ArchiveObject::Histo1D(h) => h.zero_negative_bins(),
                ArchiveObject::Histo2D(h) => h.zero_negative_bins(),
                ArchiveObject::BranchMap(_) => {}
            }
        }
    }

    /// Iterate the accumulated objects by bare name.
    pub fn objects(&self) -> impl Iterator<Item = (&String, &ArchiveObject)> {
        self.objects.iter()
    }

    /// Consume the store, yielding its bare-named objects. Used to hand a
    /// per-piece accumulator on to the sample-level accumulator.
    pub fn into_object_vec(self) -> Vec<ArchiveObject> {
        self.objects.into_values().collect()
    }

    /// Subtract another store's histograms bin by bin (branch maps pass
    /// through). Every histogram here must have a counterpart in `other`.
    pub fn subtract(&mut self, other: &HistoStore) -> Result<()> {
        for (key, object) in self.objects.iter_mut() {
            let counterpart = other.objects.get(key).ok_or_else(|| {
                Error::Validation(format!("no histogram '{}' to subtract", key))
            })?;
            match (object, counterpart) {
                (ArchiveObject::Histo1D(a), ArchiveObject::Histo1D(b)) => {
                    a.add_scaled(b, -1.0)?
                }
                (ArchiveObject::Histo2D(a), ArchiveObject::Histo2D(b)) => {
                    a.add_scaled(b, -1.0)?
                }
                (ArchiveObject::BranchMap(_), _) => {}
                _ => {
                    return Err(Error::Validation(format!(
                        "object classes do not match for '{}'",
                        key
                    )))
                }
            }
        }
        Ok(())
    }

    /// Scale every histogram's contents by `factor`.
    pub fn scale(&mut self, factor: f64) {
        for object in self.objects.values_mut() {
            match object {
                ArchiveObject::Histo1D(h) => h.scale(factor),
                ArchiveObject::Histo2D(h) => h.scale(factor),
                ArchiveObject::BranchMap(_) => {}
            }
        }
    }

    /// Export as a combined archive, prefixing every object name with its
    /// class and the sample name (`histo1D__{sample}__{var}`).
    pub fn to_archive(&self, sample: &str) -> PlotsArchive {
        let mut archive = PlotsArchive::default();
        for (key, object) in &self.objects {
            let mut renamed = object.clone();
            renamed.set_name(format!("{}__{}__{}", object.name_prefix(), sample, key));
            archive.push(renamed);
        }
        archive
    }
}

fn scale_applies(name: &str, is_data: bool) -> bool {
    if is_data {
        return false;
    }
    let lower = name.to_ascii_lowercase();
    !UNSCALED_NAME_FRAGMENTS.iter().any(|frag| lower.contains(frag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Histo1D;
    use approx::assert_relative_eq;

    fn one_bin_histo(name: &str, content: f64, sumw2: f64) -> ArchiveObject {
        let mut h = Histo1D::new(name, 1, 0.0, 1.0);
        h.bin_content[1] = content;
        h.sumw2[1] = sumw2;
        ArchiveObject::Histo1D(h)
    }

    #[test]
    fn test_scaled_accumulation() {
        let mut store = HistoStore::new();
        store
            .update_from(&[one_bin_histo("Mee", 10.0, 4.0)], "A", 0.5, false, false, false)
            .unwrap();
        store
            .update_from(&[one_bin_histo("Mee", 20.0, 16.0)], "B", 2.0, false, false, false)
            .unwrap();
        let Some(ArchiveObject::Histo1D(acc)) = store.get("Mee") else { panic!() };
        assert_relative_eq!(acc.bin_content[1], 45.0);
        // 0.25*4 + 4*16
        assert_relative_eq!(acc.sumw2[1], 65.0);
    }

    #[test]
    fn test_data_pieces_are_never_scaled() {
        let mut store = HistoStore::new();
        store
            .update_from(&[one_bin_histo("Mee", 10.0, 10.0)], "data", 0.5, false, true, false)
            .unwrap();
        let Some(ArchiveObject::Histo1D(acc)) = store.get("Mee") else { panic!() };
        assert_relative_eq!(acc.bin_content[1], 10.0);
    }

    #[test]
    fn test_unweighted_histograms_skip_scaling() {
        let mut store = HistoStore::new();
        store
            .update_from(
                &[one_bin_histo("Mee_noWeight", 10.0, 10.0)],
                "A",
                0.5,
                false,
                false,
                false,
            )
            .unwrap();
        let Some(ArchiveObject::Histo1D(acc)) = store.get("Mee_noWeight") else { panic!() };
        assert_relative_eq!(acc.bin_content[1], 10.0);
    }

    #[test]
    fn test_qcd_pieces_zero_negative_bins() {
        let mut store = HistoStore::new();
        store
            .update_from(&[one_bin_histo("Mee", -3.0, 1.0)], "A", 1.0, false, true, true)
            .unwrap();
        let Some(ArchiveObject::Histo1D(acc)) = store.get("Mee") else { panic!() };
        assert_relative_eq!(acc.bin_content[1], 0.0);
    }

    #[test]
    fn test_prefixed_names_deduplicate_with_bare_names() {
        let mut store = HistoStore::new();
        store
            .update_from(&[one_bin_histo("histo1D__A__Mee", 1.0, 1.0)], "A", 1.0, false, false, false)
            .unwrap();
        store
            .update_from(&[one_bin_histo("Mee", 2.0, 1.0)], "B", 1.0, false, false, false)
            .unwrap();
        assert_eq!(store.len(), 1);
        let Some(ArchiveObject::Histo1D(acc)) = store.get("Mee") else { panic!() };
        assert_relative_eq!(acc.bin_content[1], 3.0);
    }

    #[test]
    fn test_zero_negative_bins_across_store() {
        let mut store = HistoStore::new();
        store
            .update_from(&[one_bin_histo("Mee", -2.0, 1.0)], "A", 1.0, false, false, false)
            .unwrap();
        store.zero_negative_bins();
        let Some(ArchiveObject::Histo1D(acc)) = store.get("Mee") else { panic!() };
        assert_relative_eq!(acc.bin_content[1], 0.0);
    }

    #[test]
    fn test_to_archive_prefixes_names() {
        let mut store = HistoStore::new();
        store
            .update_from(&[one_bin_histo("Mee", 1.0, 1.0)], "A", 1.0, false, false, false)
            .unwrap();
        let archive = store.to_archive("ZJets");
        assert!(archive.get("histo1D__ZJets__Mee").is_some());
    }
}
