//! Shared helpers: genome loading, sequence operations and run-level
//! rejection bookkeeping.

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use flate2::read::MultiGzDecoder;
use hashbrown::HashMap;
use log::debug;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::core::segments::RejectReason;

/// open a possibly gzip-compressed text file
pub fn open_text<P: AsRef<Path> + std::fmt::Debug>(path: P) -> Result<Box<dyn BufRead>> {
    let file =
        File::open(path.as_ref()).with_context(|| format!("ERROR: cannot open {:?}", path))?;

    if path.as_ref().extension().map_or(false, |e| e == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// read a multi-FASTA into a contig name -> sequence map
///
/// The name is the first whitespace-delimited token after `>`. Duplicate
/// names are a fatal error since downstream windows would be ambiguous.
pub fn read_fasta<P: AsRef<Path> + std::fmt::Debug>(path: P) -> Result<HashMap<String, String>> {
    debug!("Reading sequence from {:?}", path);

    let reader = open_text(&path)?;
    let mut chromosomes: HashMap<String, String> = HashMap::new();
    let mut seqname: Option<String> = None;
    let mut sequence = String::new();

    for line in reader.lines() {
        let line = line?;

        if let Some(header) = line.strip_prefix('>') {
            if let Some(name) = seqname.take() {
                if chromosomes.contains_key(&name) {
                    bail!("duplicate sequence name {} found in {:?}", name, path);
                }
                debug!("Added {} {} bp", name, sequence.len());
                chromosomes.insert(name, std::mem::take(&mut sequence));
            }
            seqname = Some(
                header
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_string(),
            );
        } else if seqname.is_some() {
            sequence.push_str(line.trim());
        }
    }

    if let Some(name) = seqname {
        if chromosomes.contains_key(&name) {
            bail!("duplicate sequence name {} found in {:?}", name, path);
        }
        debug!("Added {} {} bp", name, sequence.len());
        chromosomes.insert(name, sequence);
    }

    Ok(chromosomes)
}

/// reverse complement of a nucleotide sequence, uppercased
pub fn rev_comp_seq(seq: &str) -> String {
    seq.chars()
        .rev()
        .map(|c| match c.to_ascii_uppercase() {
            'A' => 'T',
            'C' => 'G',
            'G' => 'C',
            'T' => 'A',
            other => other,
        })
        .collect()
}

/// run-level tally of per-read rejection reasons, shared across genes
///
/// Genes bump their local counts into this accumulator; summation is
/// order-independent so the parallel gene walk needs no coordination
/// beyond the map itself.
#[derive(Debug, Default)]
pub struct RejectionTally(DashMap<RejectReason, u64>);

impl RejectionTally {
    pub fn absorb(&self, counts: &BTreeMap<RejectReason, u64>) {
        for (reason, count) in counts {
            *self.0.entry(*reason).or_insert(0) += count;
        }
    }

    pub fn total(&self) -> u64 {
        self.0.iter().map(|entry| *entry.value()).sum()
    }

    /// stable, human-readable view for the run descriptor
    pub fn summary(&self) -> BTreeMap<String, u64> {
        self.0
            .iter()
            .map(|entry| (entry.key().to_string(), *entry.value()))
            .collect()
    }
}
