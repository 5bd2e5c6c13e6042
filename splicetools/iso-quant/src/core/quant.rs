//! Per-sample aggregation of read-level splice patterns
//!
//! For every logical gene (all annotation ids sharing a name, chromosome
//! and strand) the overlapping reads are pulled from the alignment file
//! with `samtools`, re-aligned one by one against the gene's ±5kb genomic
//! window with the external local aligner, interpreted into splice
//! patterns and counted. Genes are independent and processed in parallel;
//! a failing read never aborts the gene, it only bumps a rejection tally.

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use hashbrown::{HashMap, HashSet};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use tempfile::Builder;

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use config::{get_progress_bar, Strand, CHEXONS, CONTEXT_SIZE, SAMTOOLS};

use crate::cli::Direction;
use crate::core::annotate::GeneModel;
use crate::core::segments::{
    self, Interpretation, ReadSegments, RejectReason, SplicePattern, Thresholds,
};
use crate::utils::{rev_comp_seq, RejectionTally};

/// observed support for one splice pattern in one sample
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PatternStats {
    pub count: u64,
    pub starts: Vec<i64>,
    pub ends: Vec<i64>,
}

/// per-gene pattern counts for one sample, keyed by the logical gene id
pub type GeneCounts = BTreeMap<SplicePattern, PatternStats>;
pub type SampleCounts = BTreeMap<String, GeneCounts>;

/// aggregation parameters threaded through every gene
#[derive(Debug, Clone, Copy)]
pub struct QuantParams<'a> {
    pub direction: Direction,
    pub thresholds: Thresholds,
    pub no_chr_prefix: bool,
    pub aligner: AlignerParams<'a>,
}

/// passthrough tuning for the external local aligner
#[derive(Debug, Clone, Copy)]
pub struct AlignerParams<'a> {
    pub splicemis: &'a str,
    pub mismatch: &'a str,
    pub gapopen: &'a str,
    pub splice: &'a str,
}

/// one logical gene: every annotation id sharing name, chromosome and
/// strand, with the union of their spans and acceptor sets
#[derive(Debug, Clone, PartialEq)]
pub struct GeneGroup {
    pub name: String,
    pub chrom: String,
    pub strand: Strand,
    pub ids: Vec<String>,
    pub start: i64,
    pub end: i64,
    pub splice_acceptors: BTreeSet<i64>,
}

impl GeneGroup {
    pub fn key(&self) -> String {
        self.ids.join(":")
    }
}

/// fold annotation genes into logical genes
///
/// A gene represented by several annotation ids must only be counted
/// once, so ids collapsing onto the same name/chromosome/strand triple
/// are quantitated together.
pub fn group_genes(genes: &BTreeMap<String, GeneModel>) -> Vec<GeneGroup> {
    let mut groups: BTreeMap<(String, String, Strand), GeneGroup> = BTreeMap::new();

    for (id, gene) in genes {
        let key = (gene.name.clone(), gene.chrom.clone(), gene.strand);
        let group = groups.entry(key).or_insert_with(|| GeneGroup {
            name: gene.name.clone(),
            chrom: gene.chrom.clone(),
            strand: gene.strand,
            ids: Vec::new(),
            start: i64::MAX,
            end: i64::MIN,
            splice_acceptors: BTreeSet::new(),
        });

        group.ids.push(id.clone());
        group.start = group.start.min(gene.start);
        group.end = group.end.max(gene.end);
        group.splice_acceptors.extend(&gene.splice_acceptors);
    }

    groups.into_values().collect()
}

/// quantitate every gene of one alignment file
pub fn process_alignment_file(
    genes: &BTreeMap<String, GeneModel>,
    chromosomes: &HashMap<String, String>,
    bam: &Path,
    params: &QuantParams,
    tally: &RejectionTally,
) -> Result<SampleCounts> {
    let groups = group_genes(genes);
    let counts: DashMap<String, GeneCounts> = DashMap::new();
    let pb = get_progress_bar(groups.len() as u64, "Quantitating genes...");

    groups.par_iter().for_each(|group| {
        match quantitate_gene(genes, chromosomes, bam, group, params, tally) {
            Ok(Some(gene_counts)) => {
                counts.insert(group.key(), gene_counts);
            }
            Ok(None) => {}
            Err(e) => warn!("Skipping {}: {}", group.name, e),
        }
        pb.inc(1);
    });

    pb.finish_and_clear();
    Ok(counts.into_iter().collect())
}

/// run one gene of one sample: extract reads, align, interpret, count
fn quantitate_gene(
    genes: &BTreeMap<String, GeneModel>,
    chromosomes: &HashMap<String, String>,
    bam: &Path,
    group: &GeneGroup,
    params: &QuantParams,
    tally: &RejectionTally,
) -> Result<Option<GeneCounts>> {
    info!(
        "Quantitating {} ({}; {} strand) in {:?}",
        group.name, group.chrom, group.strand, bam
    );

    let Some(sequence) = chromosomes.get(&group.chrom) else {
        warn!(
            "Skipping {} as there is no sequence for chromosome {}",
            group.name, group.chrom
        );
        return Ok(None);
    };

    // gene window with context either side; the window FASTA lives for
    // the whole gene and is removed when the handle drops
    let window = genomic_window(sequence, group.start, group.end);
    let offset = group.start - CONTEXT_SIZE;

    let mut gene_fasta = Builder::new().suffix(".fa").tempfile()?;
    writeln!(gene_fasta, ">{}\n{}", group.name, window)?;
    gene_fasta.flush()?;

    let reads = get_reads(genes, group, bam, params)?;
    info!(
        "Found {} reads for gene {} ({}) in {:?}",
        reads.len(),
        group.name,
        group.ids.join("/"),
        bam
    );

    let mut gene_counts: GeneCounts = BTreeMap::new();
    let mut reasons: BTreeMap<RejectReason, u64> = BTreeMap::new();

    for (_read_id, read_seq) in &reads {
        match align_read(read_seq, gene_fasta.path(), offset, params) {
            Ok(segments) => {
                let outcome = segments::interpret_segments(
                    segments,
                    read_seq,
                    group.strand,
                    (group.start, group.end),
                    &group.splice_acceptors,
                    &params.thresholds,
                );

                match outcome {
                    Interpretation::Pattern { pattern, start, end } => {
                        let stats = gene_counts.entry(pattern).or_default();
                        stats.count += 1;
                        stats.starts.push(start);
                        stats.ends.push(end);
                    }
                    Interpretation::Reject(reason) => {
                        *reasons.entry(reason).or_insert(0) += 1;
                    }
                }
            }
            Err(e) => {
                warn!("Aligner failed for a read of {}: {}", group.name, e);
                *reasons.entry(RejectReason::AlignerFailure).or_insert(0) += 1;
            }
        }
    }

    if !reasons.is_empty() {
        info!("Reasons for read rejection in {}:", group.name);
        for (reason, count) in &reasons {
            info!("{} {}", count, reason);
        }
    }
    tally.absorb(&reasons);

    Ok(Some(gene_counts))
}

/// slice the chromosome around the gene, clamped to the contig
fn genomic_window(sequence: &str, start: i64, end: i64) -> &str {
    let from = ((start - CONTEXT_SIZE - 1).max(0) as usize).min(sequence.len());
    let to = ((end + CONTEXT_SIZE).max(0) as usize).min(sequence.len()).max(from);
    &sequence[from..to]
}

/// pull the reads overlapping a gene group out of the alignment file
///
/// One region row per constituent annotation id; the strand filter
/// translates the library directionality into the flag filter on the
/// reverse-strand bit. Reads of reverse-strand genes are
/// reverse-complemented so the aligner always sees gene-forward sequence.
fn get_reads(
    genes: &BTreeMap<String, GeneModel>,
    group: &GeneGroup,
    bam: &Path,
    params: &QuantParams,
) -> Result<Vec<(String, String)>> {
    let mut bed = Builder::new().suffix(".bed").tempfile()?;
    for id in &group.ids {
        let Some(gene) = genes.get(id) else { continue };
        let chrom = if params.no_chr_prefix || gene.chrom.starts_with("chr") {
            gene.chrom.clone()
        } else {
            format!("chr{}", gene.chrom)
        };
        writeln!(bed, "{}\t{}\t{}", chrom, gene.start, gene.end)?;
    }
    bed.flush()?;

    let mut cmd = Command::new(SAMTOOLS);
    cmd.arg("view").arg(bam).arg("-L").arg(bed.path());
    match params.direction {
        Direction::None => {}
        Direction::Opposing => {
            let flag = match group.strand {
                Strand::Forward => "-f",
                Strand::Reverse => "-F",
            };
            cmd.args([flag, "16"]);
        }
        Direction::Same => {
            let flag = match group.strand {
                Strand::Forward => "-F",
                Strand::Reverse => "-f",
            };
            cmd.args([flag, "16"]);
        }
    }

    debug!("Launching {:?}", cmd);
    let output = cmd
        .output()
        .with_context(|| format!("ERROR: failed to run {}", SAMTOOLS))?;
    if !output.status.success() {
        bail!(
            "{} view failed: {}",
            SAMTOOLS,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let mut reads = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let sections: Vec<&str> = line.split('\t').collect();
        if sections.len() < 10 {
            debug!("Only {} sections in a {} record", sections.len(), SAMTOOLS);
            break;
        }

        let name = sections[0];
        if !seen.insert(name.to_string()) {
            warn!("Duplicate read name {} detected", name);
            continue;
        }

        let sequence = match group.strand {
            Strand::Forward => sections[9].to_string(),
            Strand::Reverse => rev_comp_seq(sections[9]),
        };
        reads.push((name.to_string(), sequence));
    }

    Ok(reads)
}

/// align one read against the gene window and parse the segment table
///
/// The aligner drops `.comp`/`.dat` files next to the basename; the
/// scratch guard removes them on every exit path, success or failure.
fn align_read(
    sequence: &str,
    genomic_fasta: &Path,
    offset: i64,
    params: &QuantParams,
) -> Result<ReadSegments> {
    let mut read_fasta = Builder::new().suffix(".fa").tempfile()?;
    writeln!(read_fasta, ">read\n{}", sequence)?;
    read_fasta.flush()?;

    let scratch = AlignerScratch::new(read_fasta.path());

    let status = Command::new(CHEXONS)
        .arg(read_fasta.path())
        .arg(genomic_fasta)
        .arg("--basename")
        .arg(read_fasta.path())
        .args(["--splicemis", params.aligner.splicemis])
        .args(["--mismatch", params.aligner.mismatch])
        .args(["--splice", params.aligner.splice])
        .args(["--gapopen", params.aligner.gapopen])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("ERROR: failed to launch {}", CHEXONS))?;
    if !status.success() {
        bail!("{} exited with {}", CHEXONS, status);
    }

    let table = std::fs::read_to_string(scratch.dat())
        .with_context(|| format!("{} produced no segment table", CHEXONS))?;

    segments::parse_segment_table(&table, offset)
}

/// transient aligner artifacts, removed when the guard drops
struct AlignerScratch {
    comp: PathBuf,
    dat: PathBuf,
}

impl AlignerScratch {
    fn new(basename: &Path) -> Self {
        let base = basename.to_string_lossy();
        Self {
            comp: PathBuf::from(format!("{}.comp", base)),
            dat: PathBuf::from(format!("{}.dat", base)),
        }
    }

    fn dat(&self) -> &Path {
        &self.dat
    }
}

impl Drop for AlignerScratch {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.comp);
        let _ = std::fs::remove_file(&self.dat);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::annotate::read_annotation;
    use std::io::Write as IoWrite;

    fn annotation_with_shared_name() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".gtf").tempfile().unwrap();
        let line = |gene: &str, strand: &str, start: i64, end: i64| {
            format!(
                "chr1\thavana\texon\t{}\t{}\t.\t{}\t.\tgene_id \"{}\"; gene_name \"Shared\"; transcript_id \"{}-T\"; exon_number \"1\";\n",
                start, end, strand, gene, gene
            )
        };
        let content = [
            line("G1", "+", 100, 200),
            line("G2", "+", 500, 900),
            line("G3", "-", 100, 200),
        ]
        .concat();
        write!(file, "{}", content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_group_genes_merges_same_name_chrom_strand() {
        let file = annotation_with_shared_name();
        let genes = read_annotation(file.path(), None).unwrap();
        let groups = group_genes(&genes);

        // G1+G2 share name/chrom/strand, G3 is on the other strand
        assert_eq!(groups.len(), 2);

        let forward = groups
            .iter()
            .find(|g| g.strand == Strand::Forward)
            .unwrap();
        assert_eq!(forward.ids, vec!["G1".to_string(), "G2".to_string()]);
        assert_eq!(forward.key(), "G1:G2");
        assert_eq!((forward.start, forward.end), (100, 900));

        let reverse = groups
            .iter()
            .find(|g| g.strand == Strand::Reverse)
            .unwrap();
        assert_eq!(reverse.ids, vec!["G3".to_string()]);
    }

    #[test]
    fn test_genomic_window_clamps_to_contig() {
        let sequence = "ACGT".repeat(10);
        assert_eq!(genomic_window(&sequence, 1, 10), &sequence[..]);
        assert_eq!(genomic_window(&sequence, 20_000, 30_000), "");
    }

    #[test]
    fn test_aligner_scratch_removes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("read.fa");
        let dat = dir.path().join("read.fa.dat");
        std::fs::write(&dat, "Seg\n").unwrap();

        {
            let _scratch = AlignerScratch::new(&base);
        }
        assert!(!dat.exists());
    }
}
