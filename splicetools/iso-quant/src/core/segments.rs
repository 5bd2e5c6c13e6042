//! Interpretation of raw per-read alignment segments into splice patterns
//!
//! The external local aligner reports, per read, an ordered table of
//! aligned sub-ranges in genomic and read-local coordinates. This module
//! turns that table into a validated [`SplicePattern`] or a categorized
//! rejection: terminal segments that look like mis-mapped polyA tails are
//! trimmed, reads whose segments run against the gene's strand are
//! discarded with a reason naming where the reversal happened, and reads
//! failing the exon-count, mapped-fraction or gene-coverage thresholds are
//! tallied rather than counted.

use anyhow::{anyhow, Result};
use log::debug;
use serde::Serialize;

use std::collections::BTreeSet;
use std::fmt;

use config::{Strand, POLYA_KMERS, POLYA_KMER_FRACTION};

/// one element of a splice pattern
///
/// The first and last aligned segments of a read only have one meaningful
/// exon-internal boundary; internal segments carry both the acceptor-side
/// and the donor-side boundary, in aligned order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Junction {
    Edge(i64),
    Pair(i64, i64),
}

impl fmt::Display for Junction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Junction::Edge(boundary) => write!(f, "{}", boundary),
            Junction::Pair(acceptor, donor) => write!(f, "{}-{}", acceptor, donor),
        }
    }
}

/// ordered, immutable exon-junction structure of a read or transcript
///
/// Patterns are value types: equality, ordering and hashing depend only on
/// the boundary coordinates, which makes them usable as counting keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SplicePattern(pub Vec<Junction>);

impl SplicePattern {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// true when every corresponding boundary differs by at most
    /// `flexibility` bases
    ///
    /// Patterns with different segment counts never match, whatever the
    /// tolerance. The check short-circuits on the first violating
    /// boundary.
    pub fn matches_within(&self, other: &SplicePattern, flexibility: i64) -> bool {
        if self.0.len() != other.0.len() {
            return false;
        }

        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(own, theirs)| match (own, theirs) {
                (Junction::Edge(a), Junction::Edge(b)) => (a - b).abs() <= flexibility,
                (Junction::Pair(a0, a1), Junction::Pair(b0, b1)) => {
                    (a0 - b0).abs() <= flexibility && (a1 - b1).abs() <= flexibility
                }
                _ => false,
            })
    }
}

impl fmt::Display for SplicePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|junction| junction.to_string())
            .collect::<Vec<_>>()
            .join(":");
        write!(f, "{}", joined)
    }
}

/// why a read was not counted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RejectReason {
    ReverseSpliceLastExon,
    ReverseSpliceFirstExon,
    ReverseSpliceMiddleExon,
    NotEnoughExons,
    LowMappedFraction,
    LowGeneCoverage,
    AlignerFailure,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::ReverseSpliceLastExon => {
                write!(f, "Reverse splicing or mapping (last exon)")
            }
            RejectReason::ReverseSpliceFirstExon => {
                write!(f, "Reverse splicing or mapping (first exon)")
            }
            RejectReason::ReverseSpliceMiddleExon => {
                write!(f, "Reverse splicing or mapping (middle/>1 exon)")
            }
            RejectReason::NotEnoughExons => write!(f, "Not enough exons"),
            RejectReason::LowMappedFraction => write!(f, "Transcript coverage too low"),
            RejectReason::LowGeneCoverage => write!(f, "Gene coverage too low"),
            RejectReason::AlignerFailure => write!(f, "Aligner failed"),
        }
    }
}

/// per-read alignment segments in aligner-report order
///
/// `genomic` holds offset-translated genomic ranges, `read_local` the
/// matching read coordinates. Report order is not guaranteed to be
/// genomically monotonic; that is checked, not assumed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadSegments {
    pub genomic: Vec<(i64, i64)>,
    pub read_local: Vec<(i64, i64)>,
}

/// validation thresholds threaded through the interpreter
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub min_exons: usize,
    pub min_coverage: f64,
    pub map_threshold: f64,
    pub flexibility: i64,
}

/// outcome of interpreting one read
#[derive(Debug, Clone, PartialEq)]
pub enum Interpretation {
    Pattern {
        pattern: SplicePattern,
        start: i64,
        end: i64,
    },
    Reject(RejectReason),
}

/// parse the aligner's segment table into offset-translated segments
///
/// The table is pipe-delimited with a header line, a dashed separator and
/// one row per aligned segment; column 1 is the read-local range and
/// column 3 the window-local genomic range. Window coordinates are
/// 1-based, so translation to genomic space is `pos + offset - 1`.
pub fn parse_segment_table(table: &str, offset: i64) -> Result<ReadSegments> {
    let mut segments = ReadSegments::default();

    for line in table.lines() {
        if line.starts_with('-') || line.starts_with("Seg") {
            continue;
        }

        let sections: Vec<&str> = line.split('|').collect();
        if sections.len() < 4 || sections[0].trim().is_empty() {
            continue;
        }

        let (genomic_start, genomic_end) = field_bounds(sections[3])?;
        let (local_start, local_end) = field_bounds(sections[1])?;

        segments
            .genomic
            .push((genomic_start + offset - 1, genomic_end + offset - 1));
        segments.read_local.push((local_start, local_end));
    }

    Ok(segments)
}

/// first and last whitespace-delimited integers of a table cell
fn field_bounds(field: &str) -> Result<(i64, i64)> {
    let mut tokens = field.split_whitespace();
    let first = tokens
        .next()
        .ok_or_else(|| anyhow!("empty segment field: {:?}", field))?;
    let last = tokens.last().unwrap_or(first);

    Ok((first.parse::<i64>()?, last.parse::<i64>()?))
}

/// flag segments whose direction disagrees with the gene's strand
///
/// Returns `(reverse_first, reverse_index)`: whether the running order
/// established by the first two segments already points backwards, and the
/// 1-based index of the first later segment that reverses. Only the first
/// reversal is recorded so a final-junction reversal stays
/// distinguishable.
pub fn detect_reversals(locations: &[(i64, i64)], strand: Strand) -> (bool, usize) {
    let mut reverse_first = false;
    let mut reverse_index = 0usize;

    for (i, &(start, end)) in locations.iter().enumerate() {
        let count = i + 1;

        match count {
            1 => match strand {
                Strand::Forward => {
                    if start > end {
                        reverse_first = true;
                    }
                }
                Strand::Reverse => {
                    if start < end {
                        reverse_first = true;
                    }
                }
            },
            2 => {
                let previous_end = locations[i - 1].1;
                match strand {
                    Strand::Forward => {
                        if start < previous_end {
                            reverse_first = true;
                        }
                        if start > end {
                            reverse_index = count;
                        }
                    }
                    Strand::Reverse => {
                        if start > previous_end {
                            reverse_first = true;
                        }
                        if start < end {
                            reverse_index = count;
                        }
                    }
                }
            }
            _ => {
                if reverse_index == 0 {
                    let previous_end = locations[i - 1].1;
                    match strand {
                        Strand::Forward => {
                            if start < previous_end || start > end {
                                reverse_index = count;
                            }
                        }
                        Strand::Reverse => {
                            if start > previous_end || start < end {
                                reverse_index = count;
                            }
                        }
                    }
                }
            }
        }
    }

    (reverse_first, reverse_index)
}

/// drop trailing segments that look like mis-mapped polyA tails
///
/// Works backwards from the 3' end: a segment whose boundary sits within
/// `flexibility` of any known splice acceptor is real and stops the trim;
/// otherwise the segment is removed when its read-local subsequence is
/// dominated by polyA/polyT or dinucleotide-repeat 4-mers.
pub fn trim_polya(
    segments: &mut ReadSegments,
    sequence: &str,
    acceptors: &BTreeSet<i64>,
    flexibility: i64,
) {
    while !segments.genomic.is_empty() {
        let last = segments.genomic.len() - 1;
        let boundary = segments.genomic[last].0;

        if acceptors
            .iter()
            .any(|&acceptor| (acceptor - boundary).abs() <= flexibility)
        {
            break;
        }

        let exon_seq = local_slice(sequence, segments.read_local[last]);
        let hits: usize = POLYA_KMERS
            .iter()
            .map(|kmer| exon_seq.matches(kmer).count())
            .sum();

        if (hits as f64) > POLYA_KMER_FRACTION * exon_seq.len() as f64 {
            debug!(
                "Likely polyA mapping detected at terminal segment; excluding {:?}",
                segments.genomic[last]
            );
            segments.genomic.pop();
            segments.read_local.pop();
        } else {
            break;
        }
    }
}

fn local_slice(sequence: &str, (start, end): (i64, i64)) -> &str {
    let start = (start.max(0) as usize).min(sequence.len());
    let end = (end.max(0) as usize).min(sequence.len()).max(start);
    &sequence[start..end]
}

/// turn one read's segments into a splice pattern or a rejection
///
/// Order is a fixed behavioral contract: reversals are detected on the
/// untrimmed segments, polyA trimming runs next, then the reversal
/// classification, exon-count, mapped-fraction and gene-coverage checks
/// are applied to whatever remains.
pub fn interpret_segments(
    mut segments: ReadSegments,
    sequence: &str,
    strand: Strand,
    gene_span: (i64, i64),
    acceptors: &BTreeSet<i64>,
    thresholds: &Thresholds,
) -> Interpretation {
    let (reverse_first, reverse_index) = detect_reversals(&segments.genomic, strand);

    trim_polya(&mut segments, sequence, acceptors, thresholds.flexibility);
    let remaining = segments.genomic.len();

    // the three reversal cases are mutually exclusive and checked in this
    // priority order
    if reverse_index == remaining && !reverse_first {
        return Interpretation::Reject(RejectReason::ReverseSpliceLastExon);
    } else if reverse_first && (reverse_index == 0 || reverse_index > remaining) {
        return Interpretation::Reject(RejectReason::ReverseSpliceFirstExon);
    } else if reverse_index > 0 && reverse_index <= remaining {
        return Interpretation::Reject(RejectReason::ReverseSpliceMiddleExon);
    }

    if remaining < thresholds.min_exons {
        return Interpretation::Reject(RejectReason::NotEnoughExons);
    }

    let mapped_length = segments.read_local[remaining - 1].1 - segments.read_local[0].0;
    let mapped_fraction = mapped_length as f64 / sequence.len() as f64;
    if mapped_fraction < thresholds.map_threshold {
        return Interpretation::Reject(RejectReason::LowMappedFraction);
    }

    let genomic_span = (segments.genomic[0].0 - segments.genomic[remaining - 1].1).abs();
    let gene_length = (gene_span.1 - gene_span.0).abs();
    if (genomic_span as f64) < thresholds.min_coverage * gene_length as f64 {
        return Interpretation::Reject(RejectReason::LowGeneCoverage);
    }

    let mut junctions = Vec::with_capacity(remaining);
    for (i, &(start, end)) in segments.genomic.iter().enumerate() {
        if i == 0 {
            junctions.push(Junction::Edge(end));
        } else if i == remaining - 1 {
            junctions.push(Junction::Edge(start));
        } else {
            junctions.push(Junction::Pair(start, end));
        }
    }

    Interpretation::Pattern {
        pattern: SplicePattern(junctions),
        start: segments.genomic[0].0,
        end: segments.genomic[remaining - 1].1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> Thresholds {
        Thresholds {
            min_exons: 2,
            min_coverage: 0.1,
            map_threshold: 0.1,
            flexibility: 5,
        }
    }

    fn forward_segments() -> ReadSegments {
        ReadSegments {
            genomic: vec![(100, 200), (300, 400), (500, 600)],
            read_local: vec![(1, 100), (101, 200), (201, 300)],
        }
    }

    #[test]
    fn test_parse_segment_table() {
        let table = "\
Segment | cDNA | Dir | Genomic
--------|------|-----|--------
 1 | 1 120 | F | 4901 5020
 2 | 121 300 | F | 6001 6180
";
        let segments = parse_segment_table(table, 1000).unwrap();
        assert_eq!(segments.genomic, vec![(5900, 6019), (7000, 7179)]);
        assert_eq!(segments.read_local, vec![(1, 120), (121, 300)]);
    }

    #[test]
    fn test_parse_segment_table_skips_ragged_lines() {
        let table = "Seg\n | 1 2 | F | 3 4\nnoise\n 1 | 5 6 | F | 7 8\n";
        let segments = parse_segment_table(table, 1).unwrap();
        assert_eq!(segments.genomic, vec![(7, 8)]);
    }

    #[test]
    fn test_matches_within_is_reflexive_and_symmetric() {
        let pattern = SplicePattern(vec![
            Junction::Edge(200),
            Junction::Pair(300, 400),
            Junction::Edge(500),
        ]);
        let close = SplicePattern(vec![
            Junction::Edge(203),
            Junction::Pair(298, 404),
            Junction::Edge(496),
        ]);

        assert!(pattern.matches_within(&pattern, 0));
        assert!(pattern.matches_within(&close, 5));
        assert!(close.matches_within(&pattern, 5));
        assert!(!pattern.matches_within(&close, 2));
    }

    #[test]
    fn test_length_mismatch_never_matches() {
        let two = SplicePattern(vec![Junction::Edge(200), Junction::Edge(500)]);
        let three = SplicePattern(vec![
            Junction::Edge(200),
            Junction::Pair(300, 400),
            Junction::Edge(500),
        ]);

        assert!(!two.matches_within(&three, 1_000_000_000));
        assert!(!three.matches_within(&two, 1_000_000_000));
    }

    #[test]
    fn test_detect_reversals_middle_only() {
        let locations = vec![(100, 200), (400, 300), (500, 600)];
        let (first, index) = detect_reversals(&locations, Strand::Forward);
        assert!(!first);
        assert_eq!(index, 2);
    }

    #[test]
    fn test_detect_reversals_first_only() {
        let locations = vec![(200, 100), (300, 400)];
        let (first, index) = detect_reversals(&locations, Strand::Forward);
        assert!(first);
        assert_eq!(index, 0);
    }

    #[test]
    fn test_detect_reversals_last_only() {
        let locations = vec![(100, 200), (300, 400), (600, 500)];
        let (first, index) = detect_reversals(&locations, Strand::Forward);
        assert!(!first);
        assert_eq!(index, 3);
    }

    #[test]
    fn test_reverse_classification_through_interpreter() {
        let sequence = "ACGT".repeat(100);
        let acceptors: BTreeSet<i64> = [100, 300, 500].into_iter().collect();

        let middle = ReadSegments {
            genomic: vec![(100, 200), (400, 300), (500, 600)],
            read_local: vec![(1, 100), (101, 200), (201, 300)],
        };
        assert_eq!(
            interpret_segments(middle, &sequence, Strand::Forward, (0, 1000), &acceptors, &thresholds()),
            Interpretation::Reject(RejectReason::ReverseSpliceMiddleExon)
        );

        let first = ReadSegments {
            genomic: vec![(200, 100), (300, 400)],
            read_local: vec![(1, 100), (101, 200)],
        };
        assert_eq!(
            interpret_segments(first, &sequence, Strand::Forward, (0, 1000), &acceptors, &thresholds()),
            Interpretation::Reject(RejectReason::ReverseSpliceFirstExon)
        );

        let last = ReadSegments {
            genomic: vec![(100, 200), (300, 400), (600, 500)],
            read_local: vec![(1, 100), (101, 200), (201, 300)],
        };
        assert_eq!(
            interpret_segments(last, &sequence, Strand::Forward, (0, 1000), &acceptors, &thresholds()),
            Interpretation::Reject(RejectReason::ReverseSpliceLastExon)
        );
    }

    #[test]
    fn test_polya_trim_removes_repeat_rich_tail() {
        // terminal segment maps pure AAAA repeats and sits far from any
        // acceptor, so it must go
        let mut sequence = "ACGTACGTAC".repeat(20);
        sequence.push_str(&"AAAA".repeat(25));

        let mut segments = ReadSegments {
            genomic: vec![(100, 200), (300, 400), (9000, 9100)],
            read_local: vec![(0, 100), (100, 200), (200, 300)],
        };
        let acceptors: BTreeSet<i64> = [300].into_iter().collect();

        trim_polya(&mut segments, &sequence, &acceptors, 5);
        assert_eq!(segments.genomic.len(), 2);
        assert_eq!(segments.genomic.last(), Some(&(300, 400)));
    }

    #[test]
    fn test_polya_trim_keeps_tail_near_acceptor() {
        let mut sequence = "ACGTACGTAC".repeat(20);
        sequence.push_str(&"AAAA".repeat(25));

        let mut segments = ReadSegments {
            genomic: vec![(100, 200), (300, 400), (9000, 9100)],
            read_local: vec![(0, 100), (100, 200), (200, 300)],
        };
        // within tolerance of the terminal boundary: repeat content is
        // irrelevant
        let acceptors: BTreeSet<i64> = [9003].into_iter().collect();

        trim_polya(&mut segments, &sequence, &acceptors, 5);
        assert_eq!(segments.genomic.len(), 3);
    }

    #[test]
    fn test_min_exons_rejection_is_independent() {
        let sequence = "ACGT".repeat(100);
        let acceptors: BTreeSet<i64> = [500].into_iter().collect();
        let segments = ReadSegments {
            genomic: vec![(100, 500)],
            read_local: vec![(1, 400)],
        };

        // full mapped fraction and full gene coverage, still rejected
        assert_eq!(
            interpret_segments(segments, &sequence, Strand::Forward, (100, 500), &acceptors, &thresholds()),
            Interpretation::Reject(RejectReason::NotEnoughExons)
        );
    }

    #[test]
    fn test_low_mapped_fraction_rejection() {
        let sequence = "ACGT".repeat(1000);
        let acceptors: BTreeSet<i64> = [300, 500].into_iter().collect();
        let segments = ReadSegments {
            genomic: vec![(100, 200), (300, 400)],
            read_local: vec![(1, 100), (101, 200)],
        };

        assert_eq!(
            interpret_segments(segments, &sequence, Strand::Forward, (0, 1000), &acceptors, &thresholds()),
            Interpretation::Reject(RejectReason::LowMappedFraction)
        );
    }

    #[test]
    fn test_low_gene_coverage_rejection() {
        let sequence = "ACGT".repeat(100);
        let acceptors: BTreeSet<i64> = [300, 500].into_iter().collect();
        let segments = ReadSegments {
            genomic: vec![(100, 110), (120, 130)],
            read_local: vec![(1, 200), (201, 390)],
        };

        assert_eq!(
            interpret_segments(segments, &sequence, Strand::Forward, (0, 100_000), &acceptors, &thresholds()),
            Interpretation::Reject(RejectReason::LowGeneCoverage)
        );
    }

    #[test]
    fn test_pattern_emission_shape() {
        let sequence = "ACGT".repeat(100);
        let acceptors: BTreeSet<i64> = [300, 500].into_iter().collect();

        match interpret_segments(
            forward_segments(),
            &sequence,
            Strand::Forward,
            (100, 600),
            &acceptors,
            &thresholds(),
        ) {
            Interpretation::Pattern { pattern, start, end } => {
                assert_eq!(
                    pattern,
                    SplicePattern(vec![
                        Junction::Edge(200),
                        Junction::Pair(300, 400),
                        Junction::Edge(500),
                    ])
                );
                assert_eq!(start, 100);
                assert_eq!(end, 600);
            }
            other => panic!("expected a pattern, got {:?}", other),
        }
    }

    #[test]
    fn test_pattern_display() {
        let pattern = SplicePattern(vec![
            Junction::Edge(200),
            Junction::Pair(300, 400),
            Junction::Edge(500),
        ]);
        assert_eq!(pattern.to_string(), "200:300-400:500");
    }
}
