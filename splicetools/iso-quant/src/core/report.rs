//! Output writers for the merged count tables
//!
//! Two formats over the same data: a tabular report with one row per
//! sample/gene/pattern, and a GTF-style report with one `transcript`
//! feature per gene/pattern and the counts summed across samples. With
//! `--report-all` the GTF writer also emits a match-info table covering
//! every record, including seeded reference patterns that were never
//! observed.

use anyhow::Result;
use log::{debug, info};

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use config::{MATCH_INFO_SUFFIX, NO_CORRECTION, TOOL_NAME};

use crate::core::annotate::GeneModel;
use crate::core::collate::{MergedCounts, SpliceInfo};
use crate::core::segments::{Junction, SplicePattern};

/// leading boundary of a junction: the single edge, or the acceptor side
fn junction_lead(junction: &Junction) -> i64 {
    match junction {
        Junction::Edge(boundary) => *boundary,
        Junction::Pair(acceptor, _) => *acceptor,
    }
}

/// feature bounds of a pattern: first and last junction leads
fn pattern_bounds(pattern: &SplicePattern) -> (i64, i64) {
    let first = pattern.0.first().map(junction_lead).unwrap_or_default();
    let last = pattern.0.last().map(junction_lead).unwrap_or_default();
    (first, last)
}

/// write the tabular count report
///
/// A pattern is reported when its merged count reaches `mincount` in at
/// least one sample (or always, with `report_all`); each reporting sample
/// contributes one row with its own count, observed start/end coordinate
/// lists and merged-isoform provenance.
pub fn write_output(
    data: &MergedCounts,
    genes: &BTreeMap<String, GeneModel>,
    info: &SpliceInfo,
    file: &Path,
    mincount: u64,
    report_all: bool,
) -> Result<()> {
    info!("Writing output to {:?} with min count {}", file, mincount);

    let mut out = BufWriter::new(File::create(file)?);
    writeln!(
        out,
        "File\tGeneID\tGeneName\tChr\tStrand\tSplicePattern\tTranscriptID\tCount\tStarts\tEnds\tMergedIsoforms"
    )?;

    let Some((_, first)) = data.first() else {
        return Ok(());
    };

    let mut lines_written = 0u64;
    for gene_key in first.keys() {
        // highest per-sample count gates rarely observed patterns
        let mut maxima: BTreeMap<&SplicePattern, u64> = BTreeMap::new();
        for (_, sample_genes) in data {
            if let Some(bucket) = sample_genes.get(gene_key) {
                for (pattern, stats) in bucket {
                    let current = maxima.entry(pattern).or_insert(0);
                    *current = (*current).max(stats.count);
                }
            }
        }

        let gene_ids: Vec<&str> = gene_key.split(':').collect();
        let Some(annotation) = genes.get(gene_ids[0]) else {
            continue;
        };
        let gene_records = &info[gene_key];

        for (pattern, maximum) in maxima {
            if maximum < mincount && !report_all {
                continue;
            }
            let record = gene_records
                .get(pattern)
                .expect("ERROR: merged pattern without a metadata record!");

            for (sample, sample_genes) in data {
                let Some(stats) = sample_genes.get(gene_key).and_then(|b| b.get(pattern)) else {
                    continue;
                };

                let starts = join_coords(&stats.starts);
                let ends = join_coords(&stats.ends);
                writeln!(
                    out,
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    sample,
                    gene_key,
                    annotation.name,
                    annotation.chrom,
                    annotation.strand,
                    pattern,
                    record.transcript_id,
                    stats.count,
                    starts,
                    ends,
                    stats.merged_isoforms.join("_")
                )?;
                lines_written += 1;
            }
        }
    }

    debug!("Wrote {} splices to {:?}", lines_written, file);
    Ok(())
}

/// write the GTF-style report, plus the match-info table when asked
pub fn write_gtf_output(
    data: &MergedCounts,
    genes: &BTreeMap<String, GeneModel>,
    info: &SpliceInfo,
    file: &Path,
    mincount: u64,
    report_all: bool,
) -> Result<()> {
    info!("Writing GTF output to {:?} with min count {}", file, mincount);

    let mut out = BufWriter::new(File::create(file)?);
    writeln!(
        out,
        "seqname\tsource\tfeature\tstart\tend\tscore\tstrand\tframe\tattribute"
    )?;

    // summed counts across samples, kept for the match-info table
    let mut merged_totals: BTreeMap<(String, SplicePattern), u64> = BTreeMap::new();
    let mut lines_written = 0u64;

    let Some((_, first)) = data.first() else {
        return Ok(());
    };

    for gene_key in first.keys() {
        let gene_ids: Vec<&str> = gene_key.split(':').collect();
        let Some(annotation) = genes.get(gene_ids[0]) else {
            continue;
        };
        let gene_records = &info[gene_key];

        let mut patterns: BTreeSet<&SplicePattern> = BTreeSet::new();
        for (_, sample_genes) in data {
            if let Some(bucket) = sample_genes.get(gene_key) {
                patterns.extend(bucket.keys());
            }
        }

        for pattern in patterns {
            let record = gene_records
                .get(pattern)
                .expect("ERROR: merged pattern without a metadata record!");
            let (start, end) = pattern_bounds(pattern);

            let mut score = 0u64;
            let mut above_min = false;
            for (_, sample_genes) in data {
                if let Some(stats) = sample_genes.get(gene_key).and_then(|b| b.get(pattern)) {
                    score += stats.count;
                    if stats.count >= mincount {
                        above_min = true;
                    }
                }
            }
            merged_totals.insert((gene_key.clone(), pattern.clone()), score);

            if above_min || report_all {
                let mut attribute = format!(
                    "transcript_id {}; gene_id {}; splicePattern {}",
                    record.transcript_id, gene_key, pattern
                );
                if !record.merged_isoforms.is_empty() {
                    let merged = record
                        .merged_isoforms
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join("_");
                    attribute.push_str(&format!("; mergedIsoforms {}", merged));
                }

                writeln!(
                    out,
                    "{}\t{}\ttranscript\t{}\t{}\t{}\t{}\t0\t{}",
                    annotation.chrom, TOOL_NAME, start, end, score, annotation.strand, attribute
                )?;
                lines_written += 1;
            }
        }
    }

    debug!("Wrote {} splices to {:?}", lines_written, file);

    if report_all {
        write_match_info(file, info, &merged_totals)?;
    }

    Ok(())
}

/// per-record audit table: identity, counts before and after merging,
/// correction provenance
fn write_match_info(
    gtf_file: &Path,
    info: &SpliceInfo,
    merged_totals: &BTreeMap<(String, SplicePattern), u64>,
) -> Result<()> {
    let stem = gtf_file.to_string_lossy().replace(".gtf", "");
    let path = PathBuf::from(format!("{}{}", stem, MATCH_INFO_SUFFIX));
    info!("Writing match info to {:?}", path);

    let mut out = BufWriter::new(File::create(&path)?);
    writeln!(
        out,
        "seqname\tsource\tfeature\tstart\tend\tid\texact_count\tmerged_count\tsplice_pattern\tuncorrected_splice_pattern\tmerged_isoforms"
    )?;

    for (gene_key, patterns) in info {
        for (pattern, record) in patterns {
            let (start, end) = pattern_bounds(pattern);
            let merged_count = merged_totals
                .get(&(gene_key.clone(), pattern.clone()))
                .copied()
                .unwrap_or(0);
            let uncorrected = record
                .uncorrected
                .as_ref()
                .map(|original| original.to_string())
                .unwrap_or_else(|| NO_CORRECTION.to_string());
            let merged = record
                .merged_isoforms
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join("_");

            writeln!(
                out,
                "{}\t{}\ttranscript\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                gene_key,
                TOOL_NAME,
                start,
                end,
                record.transcript_id,
                record.count,
                merged_count,
                pattern,
                uncorrected,
                merged
            )?;
        }
    }

    Ok(())
}

fn join_coords(coords: &[i64]) -> String {
    coords
        .iter()
        .map(|coord| coord.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::annotate::Transcript;
    use crate::core::collate::{collate_patterns, MergedStats, PatternRecord};
    use crate::core::quant::{GeneCounts, PatternStats, SampleCounts};
    use config::Strand;

    fn fixture() -> (
        MergedCounts,
        BTreeMap<String, GeneModel>,
        SpliceInfo,
        SplicePattern,
    ) {
        let transcript = Transcript {
            id: "T1".to_string(),
            name: "T1".to_string(),
            start: 10,
            end: 300,
            strand: Strand::Forward,
            exons: vec![(10, 100), (200, 300)],
            confidence: -1,
        };
        let pattern = transcript.splice_pattern();

        let gene = GeneModel {
            id: "G1".to_string(),
            name: "Alpha".to_string(),
            chrom: "chr1".to_string(),
            start: 10,
            end: 300,
            strand: Strand::Forward,
            transcripts: vec![transcript],
            splice_donors: [100].into_iter().collect(),
            splice_acceptors: [200].into_iter().collect(),
        };
        let mut genes = BTreeMap::new();
        genes.insert("G1".to_string(), gene);

        let mut counts: GeneCounts = BTreeMap::new();
        counts.insert(
            pattern.clone(),
            PatternStats {
                count: 3,
                starts: vec![11, 12, 13],
                ends: vec![290, 291, 292],
            },
        );
        let mut sample: SampleCounts = BTreeMap::new();
        sample.insert("G1".to_string(), counts);

        let data = vec![("sample.bam".to_string(), sample)];
        let (merged, info) = collate_patterns(&data, &genes, 5);

        (merged, genes, info, pattern)
    }

    #[test]
    fn test_write_output_row_shape() {
        let (merged, genes, info, pattern) = fixture();
        let file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();

        write_output(&merged, &genes, &info, file.path(), 2, false).unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("File\tGeneID"));
        let fields: Vec<&str> = lines[1].split('\t').collect();
        assert_eq!(fields[0], "sample.bam");
        assert_eq!(fields[1], "G1");
        assert_eq!(fields[2], "Alpha");
        assert_eq!(fields[4], "+");
        assert_eq!(fields[5], pattern.to_string());
        assert_eq!(fields[6], "T1");
        assert_eq!(fields[7], "3");
        assert_eq!(fields[8], "11,12,13");
        assert_eq!(fields[9], "290,291,292");
    }

    #[test]
    fn test_write_output_respects_mincount() {
        let (merged, genes, info, _) = fixture();
        let file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();

        write_output(&merged, &genes, &info, file.path(), 100, false).unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(content.lines().count(), 1);

        write_output(&merged, &genes, &info, file.path(), 100, true).unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_write_gtf_output_attributes_and_score() {
        let (merged, genes, info, pattern) = fixture();
        let file = tempfile::Builder::new().suffix(".gtf").tempfile().unwrap();

        write_gtf_output(&merged, &genes, &info, file.path(), 2, false).unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines.len(), 2);
        let fields: Vec<&str> = lines[1].split('\t').collect();
        assert_eq!(fields[0], "chr1");
        assert_eq!(fields[1], TOOL_NAME);
        assert_eq!(fields[2], "transcript");
        assert_eq!(fields[3], "100");
        assert_eq!(fields[4], "200");
        assert_eq!(fields[5], "3");
        assert_eq!(fields[6], "+");
        assert!(fields[8].contains("transcript_id T1"));
        assert!(fields[8].contains("gene_id G1"));
        assert!(fields[8].contains(&format!("splicePattern {}", pattern)));
    }

    #[test]
    fn test_match_info_covers_unobserved_records() {
        let (merged, genes, mut info, pattern) = fixture();

        // an audit-only record that no sample observed
        let ghost = SplicePattern(vec![Junction::Edge(700), Junction::Edge(800)]);
        info.get_mut("G1").unwrap().insert(
            ghost.clone(),
            PatternRecord {
                transcript_id: "T9".to_string(),
                count: 0,
                strand: Some(Strand::Forward),
                merged_isoforms: BTreeSet::new(),
                uncorrected: None,
            },
        );

        let dir = tempfile::tempdir().unwrap();
        let gtf = dir.path().join("out.gtf");
        write_gtf_output(&merged, &genes, &info, &gtf, 2, true).unwrap();

        let match_info = dir.path().join(format!("out{}", MATCH_INFO_SUFFIX));
        let content = std::fs::read_to_string(&match_info).unwrap();

        assert!(content.contains(&pattern.to_string()));
        assert!(content.contains("T9"));
        assert!(content.contains(NO_CORRECTION));
        // observed pattern carries the summed merged count
        let observed_row: Vec<&str> = content
            .lines()
            .find(|line| line.contains("T1"))
            .unwrap()
            .split('\t')
            .collect();
        assert_eq!(observed_row[7], "3");
    }

    #[test]
    fn test_merged_stats_default_is_empty() {
        let stats = MergedStats::default();
        assert_eq!(stats.count, 0);
        assert!(stats.starts.is_empty() && stats.merged_isoforms.is_empty());
    }
}
