//! Splice-isoform quantitation for long-read sequencing data
//!
//! This crate turns aligned long reads into per-gene splice-pattern
//! counts. Every read overlapping a gene is re-aligned against the gene's
//! genomic window, interpreted into an ordered splice pattern and screened
//! for common long-read artifacts (polyA tail mis-mapping, reverse
//! splicing, poor coverage). The surviving patterns are then collated
//! across all samples: near-identical patterns collapse onto the dominant
//! annotated form, boundaries close to known donor/acceptor sites are
//! corrected, and each merged record keeps the provenance of what was
//! folded into it.

pub mod cli;
pub mod core;
pub mod utils;

pub use crate::core::quantify;
