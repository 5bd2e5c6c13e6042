//! Gene and transcript models derived from GTF exon records
//!
//! Only `exon` features are consumed. Each gene accumulates its
//! transcripts and exons, the union of their spans, and the canonical
//! donor/acceptor site sets used later for boundary correction. An
//! optional external file of known splice sites can extend those sets for
//! any gene whose window covers the position.

use anyhow::Result;
use log::{debug, warn};
use serde::Serialize;

use std::collections::{BTreeMap, BTreeSet};
use std::io::BufRead;
use std::path::Path;

use config::{Strand, CONTEXT_SIZE, MIN_GTF_FIELDS, MIN_SPLICE_SITE_FIELDS, SPLICE_ACCEPTOR_TAG};

use crate::core::segments::{Junction, SplicePattern};
use crate::utils::open_text;

/// one annotated transcript of a gene
///
/// `confidence` is derived from the annotation's support-level and
/// coding-support hints on the transcript's first exon record; more
/// negative means less confident.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcript {
    pub id: String,
    pub name: String,
    pub start: i64,
    pub end: i64,
    pub strand: Strand,
    pub exons: Vec<(i64, i64)>,
    pub confidence: i32,
}

impl Transcript {
    /// reference splice pattern of this transcript
    ///
    /// Exons are sorted genomically, descending on the reverse strand so
    /// the pattern runs in transcript order: the first exon contributes
    /// only its intron-facing end, the last only its start, internal
    /// exons both boundaries.
    pub fn splice_pattern(&self) -> SplicePattern {
        let sorted = match self.strand {
            Strand::Forward => {
                let mut exons = self.exons.clone();
                exons.sort_unstable();
                exons
            }
            Strand::Reverse => {
                let mut exons: Vec<(i64, i64)> = self
                    .exons
                    .iter()
                    .map(|&(start, end)| (start.max(end), start.min(end)))
                    .collect();
                exons.sort_unstable();
                exons.reverse();
                exons
            }
        };

        let count = sorted.len();
        let mut junctions = Vec::with_capacity(count);
        for (i, &(lead, trail)) in sorted.iter().enumerate() {
            if i == 0 {
                junctions.push(Junction::Edge(trail));
            } else if i == count - 1 {
                junctions.push(Junction::Edge(lead));
            } else {
                junctions.push(Junction::Pair(lead, trail));
            }
        }

        SplicePattern(junctions)
    }
}

/// one annotated gene with its transcripts and known splice sites
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneModel {
    pub id: String,
    pub name: String,
    pub chrom: String,
    pub start: i64,
    pub end: i64,
    pub strand: Strand,
    /// ordered by ascending confidence, most confident last
    pub transcripts: Vec<Transcript>,
    pub splice_donors: BTreeSet<i64>,
    pub splice_acceptors: BTreeSet<i64>,
}

#[derive(Debug)]
struct GeneBuilder {
    name: String,
    chrom: String,
    start: i64,
    end: i64,
    strand: Strand,
    transcripts: BTreeMap<String, Transcript>,
    splice_acceptors: BTreeSet<i64>,
}

/// attributes pulled from column 9 of one exon record
#[derive(Debug, Default)]
struct ExonAttributes {
    gene_id: Option<String>,
    gene_name: Option<String>,
    transcript_id: Option<String>,
    transcript_name: Option<String>,
    exon_number: Option<u32>,
    confidence: i32,
}

fn parse_attributes(field: &str) -> ExonAttributes {
    let mut attrs = ExonAttributes::default();

    for raw in field.split(';') {
        let attr = raw.trim();

        if let Some(value) = attr.strip_prefix("gene_id") {
            attrs.gene_id = Some(clean_value(value));
        } else if let Some(value) = attr.strip_prefix("gene_name") {
            attrs.gene_name = Some(clean_value(value));
        } else if let Some(value) = attr.strip_prefix("transcript_support_level") {
            match clean_value(value).chars().next() {
                Some(level @ '1'..='5') => {
                    attrs.confidence -= level.to_digit(10).unwrap_or(6) as i32
                }
                _ => attrs.confidence -= 6,
            }
        } else if let Some(value) = attr.strip_prefix("transcript_id") {
            attrs.transcript_id = Some(clean_value(value));
        } else if let Some(value) = attr.strip_prefix("transcript_name") {
            attrs.transcript_name = Some(clean_value(value));
        } else if let Some(value) = attr.strip_prefix("exon_number") {
            attrs.exon_number = clean_value(value).parse::<u32>().ok();
        } else if attr.starts_with("ccds") {
            attrs.confidence += 10;
        }
    }

    attrs
}

fn clean_value(value: &str) -> String {
    value.trim().trim_matches('"').trim().to_string()
}

/// build one [`GeneModel`] per gene id from a GTF file
///
/// Exons without a resolvable gene or transcript identifier are warned
/// about and skipped. When `gene_filter` is given, only records whose
/// gene name or id equals it survive; an empty result is left to the
/// caller to treat as fatal.
pub fn read_annotation<P: AsRef<Path> + std::fmt::Debug>(
    path: P,
    gene_filter: Option<&str>,
) -> Result<BTreeMap<String, GeneModel>> {
    debug!("Reading GTF {:?} with gene filter {:?}", path, gene_filter);

    let reader = open_text(&path)?;
    let mut builders: BTreeMap<String, GeneBuilder> = BTreeMap::new();

    for line in reader.lines() {
        let line = line?;

        if line.starts_with('#') {
            continue;
        }

        let sections: Vec<&str> = line.split('\t').collect();
        if sections.len() < MIN_GTF_FIELDS {
            warn!("Not enough data in GTF line: {}", line);
            continue;
        }
        if sections[2] != "exon" {
            continue;
        }

        let chrom = sections[0];
        let (start, end) = match (sections[3].parse::<i64>(), sections[4].parse::<i64>()) {
            (Ok(start), Ok(end)) => (start, end),
            _ => {
                warn!("Unparseable coordinates in GTF line: {}", line);
                continue;
            }
        };
        let strand = match sections[6].parse::<Strand>() {
            Ok(strand) => strand,
            Err(_) => {
                warn!("Skipping unstranded exon at {}:{}-{}", chrom, start, end);
                continue;
            }
        };

        let attrs = parse_attributes(sections[8]);

        if attrs.gene_id.is_none() && attrs.gene_name.is_none() {
            warn!("No gene name or id found for exon at {}:{}-{}", chrom, start, end);
            continue;
        }
        if attrs.transcript_id.is_none() && attrs.transcript_name.is_none() {
            warn!(
                "No transcript name or id found for exon at {}:{}-{}",
                chrom, start, end
            );
            continue;
        }

        let gene_id = attrs.gene_id.clone().or(attrs.gene_name.clone()).unwrap();
        let gene_name = attrs.gene_name.or(attrs.gene_id).unwrap();

        if let Some(filter) = gene_filter {
            if gene_name != filter && gene_id != filter {
                continue;
            }
        }

        let transcript_id = attrs
            .transcript_id
            .clone()
            .or(attrs.transcript_name.clone())
            .unwrap();
        let transcript_name = attrs.transcript_name.or(attrs.transcript_id).unwrap();

        let builder = builders.entry(gene_id).or_insert_with(|| GeneBuilder {
            name: gene_name,
            chrom: chrom.to_string(),
            start,
            end,
            strand,
            transcripts: BTreeMap::new(),
            splice_acceptors: BTreeSet::new(),
        });
        builder.start = builder.start.min(start);
        builder.end = builder.end.max(end);

        let transcript = builder
            .transcripts
            .entry(transcript_id.clone())
            .or_insert_with(|| Transcript {
                id: transcript_id,
                name: transcript_name,
                start,
                end,
                strand,
                exons: Vec::new(),
                confidence: attrs.confidence,
            });
        transcript.start = transcript.start.min(start);
        transcript.end = transcript.end.max(end);
        transcript.exons.push((start, end));

        // only exons past the first contribute an acceptor site
        if attrs.exon_number.map_or(false, |number| number > 1) {
            let acceptor = match strand {
                Strand::Forward => start,
                Strand::Reverse => end,
            };
            builder.splice_acceptors.insert(acceptor);
        }
    }

    let mut genes = BTreeMap::new();
    for (gene_id, builder) in builders {
        let strand = builder.strand;

        // most confident transcript last, so on pattern collisions its
        // metadata is applied last
        let mut transcripts: Vec<Transcript> = builder.transcripts.into_values().collect();
        transcripts.sort_by(|a, b| {
            a.confidence
                .cmp(&b.confidence)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut splice_donors = BTreeSet::new();
        for transcript in &transcripts {
            let mut donors: Vec<i64> = match strand {
                Strand::Forward => transcript.exons.iter().map(|&(_, end)| end).collect(),
                Strand::Reverse => transcript.exons.iter().map(|&(start, _)| start).collect(),
            };
            donors.sort_unstable();
            if strand == Strand::Reverse {
                donors.reverse();
            }
            // the most 3' exon boundary is not a donor
            donors.pop();
            splice_donors.extend(donors);
        }

        genes.insert(
            gene_id.clone(),
            GeneModel {
                id: gene_id,
                name: builder.name,
                chrom: builder.chrom,
                start: builder.start,
                end: builder.end,
                strand,
                transcripts,
                splice_donors,
                splice_acceptors: builder.splice_acceptors,
            },
        );
    }

    Ok(genes)
}

/// extend gene donor/acceptor sets from an external known-site file
///
/// Rows are `chromosome<TAB>strand<TAB>kind<TAB>position`; a site is added
/// to every gene on the matching chromosome and strand whose span ±5000
/// covers the position.
pub fn read_splice_sites<P: AsRef<Path> + std::fmt::Debug>(
    genes: &mut BTreeMap<String, GeneModel>,
    path: P,
) -> Result<()> {
    let reader = open_text(&path)?;

    for line in reader.lines() {
        let line = line?;
        let sections: Vec<&str> = line.split('\t').collect();
        if sections.len() < MIN_SPLICE_SITE_FIELDS {
            warn!("Not enough data in splice-site line: {}", line);
            continue;
        }

        let Ok(strand) = sections[1].parse::<Strand>() else {
            warn!("Unparseable strand in splice-site line: {}", line);
            continue;
        };
        let Ok(position) = sections[3].trim().parse::<i64>() else {
            warn!("Unparseable position in splice-site line: {}", line);
            continue;
        };

        for gene in genes.values_mut() {
            if gene.chrom != sections[0] || gene.strand != strand {
                continue;
            }
            if gene.start - CONTEXT_SIZE < position && position < gene.end + CONTEXT_SIZE {
                if sections[2] == SPLICE_ACCEPTOR_TAG {
                    gene.splice_acceptors.insert(position);
                } else {
                    gene.splice_donors.insert(position);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn exon_line(
        chrom: &str,
        start: i64,
        end: i64,
        strand: &str,
        gene: &str,
        transcript: &str,
        number: u32,
        extra: &str,
    ) -> String {
        format!(
            "{}\thavana\texon\t{}\t{}\t.\t{}\t.\tgene_id \"{}\"; gene_name \"{}-name\"; transcript_id \"{}\"; transcript_name \"{}-name\"; exon_number \"{}\";{}\n",
            chrom, start, end, strand, gene, gene, transcript, transcript, number, extra
        )
    }

    fn write_gtf(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".gtf").tempfile().unwrap();
        write!(file, "{}", content).unwrap();
        file.flush().unwrap();
        file
    }

    fn two_transcript_gtf() -> String {
        let mut content = String::from("# header\n");
        // T1: weak support
        content.push_str(&exon_line("chr1", 100, 200, "+", "G1", "T1", 1, " transcript_support_level \"5\";"));
        content.push_str(&exon_line("chr1", 300, 400, "+", "G1", "T1", 2, " transcript_support_level \"5\";"));
        content.push_str(&exon_line("chr1", 500, 600, "+", "G1", "T1", 3, " transcript_support_level \"5\";"));
        // T2: strong support plus coding evidence
        content.push_str(&exon_line("chr1", 100, 200, "+", "G1", "T2", 1, " transcript_support_level \"1\"; ccds_id \"CCDS1\";"));
        content.push_str(&exon_line("chr1", 300, 400, "+", "G1", "T2", 2, " transcript_support_level \"1\"; ccds_id \"CCDS1\";"));
        content
    }

    #[test]
    fn test_read_annotation_builds_gene_model() {
        let file = write_gtf(&two_transcript_gtf());
        let genes = read_annotation(file.path(), None).unwrap();

        assert_eq!(genes.len(), 1);
        let gene = &genes["G1"];
        assert_eq!(gene.name, "G1-name");
        assert_eq!((gene.start, gene.end), (100, 600));
        assert_eq!(gene.strand, Strand::Forward);

        // ascending confidence: T1 (-15) before T2 (+9)
        let ids: Vec<&str> = gene.transcripts.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["T1", "T2"]);
        assert_eq!(gene.transcripts[0].confidence, -5);
        assert_eq!(gene.transcripts[1].confidence, 9);

        // donors: all 3' exon ends minus each transcript's last
        let donors: Vec<i64> = gene.splice_donors.iter().copied().collect();
        assert_eq!(donors, vec![200, 400]);
        // acceptors: starts of exons numbered > 1
        let acceptors: Vec<i64> = gene.splice_acceptors.iter().copied().collect();
        assert_eq!(acceptors, vec![300, 500]);
    }

    #[test]
    fn test_read_annotation_gene_filter() {
        let mut content = two_transcript_gtf();
        content.push_str(&exon_line("chr2", 10, 20, "+", "G2", "T3", 1, ""));

        let file = write_gtf(&content);
        let all = read_annotation(file.path(), None).unwrap();
        assert_eq!(all.len(), 2);

        let by_id = read_annotation(file.path(), Some("G2")).unwrap();
        assert_eq!(by_id.len(), 1);
        assert!(by_id.contains_key("G2"));

        let by_name = read_annotation(file.path(), Some("G1-name")).unwrap();
        assert_eq!(by_name.len(), 1);
        assert!(by_name.contains_key("G1"));

        let none = read_annotation(file.path(), Some("missing")).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_read_annotation_skips_anonymous_exons() {
        let mut content = two_transcript_gtf();
        content.push_str("chr1\thavana\texon\t700\t800\t.\t+\t.\texon_number \"1\";\n");
        content.push_str("chr1\thavana\texon\t700\t800\t.\t+\t.\tgene_id \"G9\";\n");

        let file = write_gtf(&content);
        let genes = read_annotation(file.path(), None).unwrap();
        assert_eq!(genes.len(), 1);
    }

    #[test]
    fn test_forward_splice_pattern() {
        let transcript = Transcript {
            id: "T".into(),
            name: "T".into(),
            start: 100,
            end: 600,
            strand: Strand::Forward,
            exons: vec![(300, 400), (100, 200), (500, 600)],
            confidence: 0,
        };

        assert_eq!(
            transcript.splice_pattern(),
            SplicePattern(vec![
                Junction::Edge(200),
                Junction::Pair(300, 400),
                Junction::Edge(500),
            ])
        );
    }

    #[test]
    fn test_reverse_splice_pattern() {
        let transcript = Transcript {
            id: "T".into(),
            name: "T".into(),
            start: 100,
            end: 600,
            strand: Strand::Reverse,
            exons: vec![(100, 200), (300, 400), (500, 600)],
            confidence: 0,
        };

        // transcript order runs high to low; boundaries flip sides
        assert_eq!(
            transcript.splice_pattern(),
            SplicePattern(vec![
                Junction::Edge(500),
                Junction::Pair(400, 300),
                Junction::Edge(200),
            ])
        );
    }

    #[test]
    fn test_read_splice_sites_respects_window() {
        let file = write_gtf(&two_transcript_gtf());
        let mut genes = read_annotation(file.path(), None).unwrap();

        let mut sites = tempfile::NamedTempFile::new().unwrap();
        write!(
            sites,
            "chr1\t+\tsplice_acceptor\t450\nchr1\t+\tsplice_donor\t460\nchr1\t-\tsplice_acceptor\t470\nchr1\t+\tsplice_acceptor\t99999\n"
        )
        .unwrap();
        sites.flush().unwrap();

        read_splice_sites(&mut genes, sites.path()).unwrap();
        let gene = &genes["G1"];

        assert!(gene.splice_acceptors.contains(&450));
        assert!(gene.splice_donors.contains(&460));
        // wrong strand and out-of-window sites are ignored
        assert!(!gene.splice_acceptors.contains(&470));
        assert!(!gene.splice_acceptors.contains(&99999));
    }
}
