//! # hs-combine
//!
//! Sample-combination engine for a HEP analysis: merges per-dataset "pieces"
//! into named composite samples with cross-section reweighting,
//! variance-correct error propagation, LHE systematic-variation bookkeeping,
//! piece-completeness validation, and a data-driven QCD fake-rate
//! subtraction step.
//!
//! The engine is a one-shot batch pipeline: all state is created fresh per
//! run inside a [`context::CombinationContext`], mutated during a single
//! linear accumulation pass over the input pieces, and written out as
//! `*_plots.json` / `*_tables.dat` pairs at the end.

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod aggregate;
pub mod archive;
pub mod context;
pub mod dataset;
pub mod qcd;
pub mod samples;
pub mod systematics;
pub mod table;
pub mod validate;
pub mod weight;
pub mod xsection;

pub use archive::{ArchiveObject, BranchMap, Histo1D, Histo2D, PlotsArchive};
pub use context::{CombinationContext, CombineOptions};
pub use table::{CutRow, CutTable, Uncertainty};
