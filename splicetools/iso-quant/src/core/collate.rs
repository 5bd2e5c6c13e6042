//! Cross-sample collation of splice patterns
//!
//! Per gene, every observed pattern is matched against a growing list of
//! accepted patterns in a fixed priority order: annotation-known patterns
//! before novel ones, higher counts before lower. A candidate within
//! `flexibility` of an already-accepted pattern of the same segment count
//! folds onto it; anything else becomes a new accepted pattern after its
//! boundaries are snapped to nearby known donor/acceptor sites. The greedy
//! first-match rule makes merge outcomes depend on that seeding order by
//! design, so minor variants collapse onto the dominant annotated form.
//!
//! Genes are independent and collated in parallel; the candidate walk
//! within one gene is inherently sequential.

use log::debug;
use rayon::prelude::*;
use serde::Serialize;

use std::collections::{BTreeMap, BTreeSet};

use config::{Strand, VARIANT_PREFIX};

use crate::core::annotate::GeneModel;
use crate::core::quant::SampleCounts;
use crate::core::segments::{Junction, SplicePattern};

/// canonical metadata for one collated splice pattern of a gene
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternRecord {
    /// a known transcript id, a colon-joined list of tied ids, or a
    /// synthesized `VariantN` for novel patterns
    pub transcript_id: String,
    /// total observations across all samples, before merging
    pub count: u64,
    /// `None` renders as "tbc": novel patterns carry no strand call
    pub strand: Option<Strand>,
    /// known transcript ids whose counts were folded into this record
    pub merged_isoforms: BTreeSet<String>,
    /// the original pattern when correction rekeyed this record
    pub uncorrected: Option<SplicePattern>,
}

/// per-sample stats accumulated onto one merged pattern
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MergedStats {
    pub count: u64,
    pub starts: Vec<i64>,
    pub ends: Vec<i64>,
    pub merged_isoforms: Vec<String>,
}

pub type MergedGeneCounts = BTreeMap<SplicePattern, MergedStats>;
/// per-sample merged counts, in sample (CLI) order
pub type MergedCounts = Vec<(String, BTreeMap<String, MergedGeneCounts>)>;
/// gene -> pattern -> metadata, including audit-only unmerged entries
pub type SpliceInfo = BTreeMap<String, BTreeMap<SplicePattern, PatternRecord>>;

/// where a candidate pattern ended up
#[derive(Debug, Clone, PartialEq)]
struct Resolution {
    target: SplicePattern,
    /// true only when donor/acceptor correction altered the pattern, not
    /// when it merged into another one
    updated: bool,
}

/// collate every gene's patterns across all samples
///
/// Returns the merged per-sample count tables (sample order preserved)
/// and the full per-gene metadata records.
pub fn collate_patterns(
    data: &[(String, SampleCounts)],
    genes: &BTreeMap<String, GeneModel>,
    flexibility: i64,
) -> (MergedCounts, SpliceInfo) {
    debug!("Merging similar variants");

    let Some((_, first)) = data.first() else {
        return (Vec::new(), BTreeMap::new());
    };
    let gene_keys: Vec<&String> = first.keys().collect();

    let per_gene: Vec<(
        &String,
        Vec<MergedGeneCounts>,
        BTreeMap<SplicePattern, PatternRecord>,
    )> = gene_keys
        .par_iter()
        .map(|gene_key| {
            let (merged, records) = collate_gene(gene_key, data, genes, flexibility);
            (*gene_key, merged, records)
        })
        .collect();

    let mut merged_all: MergedCounts = data
        .iter()
        .map(|(sample, _)| (sample.clone(), BTreeMap::new()))
        .collect();
    let mut info: SpliceInfo = BTreeMap::new();

    for (gene_key, merged, records) in per_gene {
        for (slot, bucket) in merged_all.iter_mut().zip(merged) {
            slot.1.insert(gene_key.clone(), bucket);
        }
        info.insert(gene_key.clone(), records);
    }

    (merged_all, info)
}

/// collate one gene; returns one merged bucket per sample, in data order
fn collate_gene(
    gene_key: &str,
    data: &[(String, SampleCounts)],
    genes: &BTreeMap<String, GeneModel>,
    flexibility: i64,
) -> (Vec<MergedGeneCounts>, BTreeMap<SplicePattern, PatternRecord>) {
    let gene_ids: Vec<&str> = gene_key.split(':').collect();

    // seed with annotation transcripts; transcripts arrive ordered by
    // ascending confidence, so on a shared pattern the most confident id
    // is prepended last and leads the concatenation
    let mut records: BTreeMap<SplicePattern, PatternRecord> = BTreeMap::new();
    let mut donor_set: BTreeSet<i64> = BTreeSet::new();
    let mut acceptor_set: BTreeSet<i64> = BTreeSet::new();

    for id in &gene_ids {
        let Some(gene) = genes.get(*id) else { continue };

        for transcript in &gene.transcripts {
            let pattern = transcript.splice_pattern();
            match records.get_mut(&pattern) {
                None => {
                    records.insert(
                        pattern,
                        PatternRecord {
                            transcript_id: transcript.id.clone(),
                            count: 0,
                            strand: Some(transcript.strand),
                            merged_isoforms: BTreeSet::new(),
                            uncorrected: None,
                        },
                    );
                }
                Some(record) => {
                    record.transcript_id =
                        format!("{}:{}", transcript.id, record.transcript_id);
                }
            }
        }

        donor_set.extend(&gene.splice_donors);
        acceptor_set.extend(&gene.splice_acceptors);
    }

    let donors: Vec<i64> = donor_set.into_iter().collect();
    let acceptors: Vec<i64> = acceptor_set.into_iter().collect();

    // pull in every observed pattern, tagging first-seen novel ones with a
    // per-gene Variant counter, and accumulate total counts
    let mut unknown_transcript = 1u32;
    for (_, sample_counts) in data {
        let Some(observed) = sample_counts.get(gene_key) else {
            continue;
        };
        for (pattern, stats) in observed {
            let record = records.entry(pattern.clone()).or_insert_with(|| {
                let record = PatternRecord {
                    transcript_id: format!("{}{}", VARIANT_PREFIX, unknown_transcript),
                    count: 0,
                    strand: None,
                    merged_isoforms: BTreeSet::new(),
                    uncorrected: None,
                };
                unknown_transcript += 1;
                record
            });
            record.count += stats.count;
        }
    }

    // matching priority: known patterns before novel, higher counts first
    let name_map = {
        let mut known: Vec<(&SplicePattern, u64)> = Vec::new();
        let mut novel: Vec<(&SplicePattern, u64)> = Vec::new();
        for (pattern, record) in &records {
            if record.transcript_id.starts_with(VARIANT_PREFIX) {
                novel.push((pattern, record.count));
            } else {
                known.push((pattern, record.count));
            }
        }
        known.sort_by(|a, b| b.1.cmp(&a.1));
        novel.sort_by(|a, b| b.1.cmp(&a.1));

        let candidates: Vec<&SplicePattern> = known
            .into_iter()
            .chain(novel)
            .map(|(pattern, _)| pattern)
            .collect();

        build_name_map(&candidates, flexibility, &donors, &acceptors)
    };

    // fold each sample's stats onto the resolved patterns
    let mut merged: Vec<MergedGeneCounts> = Vec::with_capacity(data.len());
    let mut observed_all: BTreeSet<&SplicePattern> = BTreeSet::new();

    for (_, sample_counts) in data {
        let mut bucket: MergedGeneCounts = BTreeMap::new();

        if let Some(observed) = sample_counts.get(gene_key) {
            for (pattern, stats) in observed {
                observed_all.insert(pattern);
                let resolution = &name_map[pattern];

                let entry = bucket.entry(resolution.target.clone()).or_default();
                entry.count += stats.count;
                entry.starts.extend(&stats.starts);
                entry.ends.extend(&stats.ends);

                if resolution.target != *pattern && !resolution.updated {
                    let source_id = &records[pattern].transcript_id;
                    if !source_id.starts_with(VARIANT_PREFIX) {
                        entry.merged_isoforms.push(source_id.clone());
                    }
                }
            }
        }

        merged.push(bucket);
    }

    // three-phase metadata rebuild: corrections rekey their record onto
    // the corrected pattern first, then merged known ids accumulate on
    // their targets; no key is renamed mid-iteration
    for pattern in &observed_all {
        let resolution = &name_map[*pattern];
        if resolution.updated && resolution.target != **pattern {
            if let Some(mut record) = records.remove(*pattern) {
                record.uncorrected = Some((*pattern).clone());
                records.insert(resolution.target.clone(), record);
            }
        }
    }
    for pattern in &observed_all {
        let resolution = &name_map[*pattern];
        if resolution.updated || resolution.target == **pattern {
            continue;
        }
        let source_id = records[*pattern].transcript_id.clone();
        if !source_id.starts_with(VARIANT_PREFIX) {
            if let Some(target) = records.get_mut(&resolution.target) {
                target.merged_isoforms.insert(source_id);
            }
        }
    }

    (merged, records)
}

/// resolve an ordered candidate list to its accepted patterns
///
/// Walks the candidates in priority order, matching each against the
/// accepted patterns so far; the first in-tolerance hit wins (greedy, not
/// best-distance). A candidate that matches nothing is accepted itself,
/// after donor/acceptor correction, and later candidates are compared
/// against the corrected form.
fn build_name_map(
    candidates: &[&SplicePattern],
    flexibility: i64,
    donors: &[i64],
    acceptors: &[i64],
) -> BTreeMap<SplicePattern, Resolution> {
    debug!("Merging {} different splice patterns", candidates.len());

    let mut map: BTreeMap<SplicePattern, Resolution> = BTreeMap::new();
    let mut accepted: Vec<SplicePattern> = Vec::new();

    for &candidate in candidates {
        let hit = accepted
            .iter()
            .find(|pattern| candidate.matches_within(pattern, flexibility));

        match hit {
            Some(target) => {
                map.insert(
                    candidate.clone(),
                    Resolution {
                        target: target.clone(),
                        updated: false,
                    },
                );
            }
            None => {
                let corrected = correct_pattern(candidate, donors, acceptors, flexibility);
                let updated = corrected != *candidate;
                map.insert(
                    candidate.clone(),
                    Resolution {
                        target: corrected.clone(),
                        updated,
                    },
                );
                accepted.push(corrected);
            }
        }
    }

    debug!("Produced {} deduplicated splice patterns", accepted.len());
    map
}

/// snap boundaries onto known donor/acceptor sites
///
/// The first boundary is donor-side, the last acceptor-side; internal
/// junctions snap their acceptor-side and donor-side values
/// independently. A boundary moves only when its nearest site is within
/// `(0, flexibility]`; an exact hit stays untouched.
fn correct_pattern(
    pattern: &SplicePattern,
    donors: &[i64],
    acceptors: &[i64],
    flexibility: i64,
) -> SplicePattern {
    let junctions = pattern
        .0
        .iter()
        .enumerate()
        .map(|(i, junction)| match junction {
            Junction::Edge(boundary) if i == 0 => {
                Junction::Edge(snap(*boundary, donors, flexibility))
            }
            Junction::Edge(boundary) => Junction::Edge(snap(*boundary, acceptors, flexibility)),
            Junction::Pair(acceptor_side, donor_side) => Junction::Pair(
                snap(*acceptor_side, acceptors, flexibility),
                snap(*donor_side, donors, flexibility),
            ),
        })
        .collect();

    SplicePattern(junctions)
}

/// nearest site within `(0, flexibility]`, ties to the lower coordinate
fn snap(value: i64, sites: &[i64], flexibility: i64) -> i64 {
    let mut best = value;
    let mut best_distance = i64::MAX;

    for &site in sites {
        let distance = (value - site).abs();
        if distance < best_distance {
            best_distance = distance;
            best = site;
        }
    }

    if best_distance > 0 && best_distance <= flexibility {
        best
    } else {
        value
    }
}
