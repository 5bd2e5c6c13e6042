//! Core pipeline for splice-isoform quantitation
//!
//! The driver wires the stages together: the annotation is folded into
//! gene models with their reference splice patterns and donor/acceptor
//! sets, every alignment file is quantitated gene by gene, the per-sample
//! pattern counts are collated across samples, and the merged tables are
//! handed to the requested writers.

pub mod annotate;
pub mod collate;
pub mod quant;
pub mod report;
pub mod segments;

use anyhow::{bail, Result};
use log::{info, warn};

use std::path::{Path, PathBuf};

use config::{write_descriptor, DEFAULT_GTF_OUTFILE, DEFAULT_OUTFILE, REJECTION_SUMMARY};

use crate::cli::Args;
use crate::core::quant::{AlignerParams, QuantParams, SampleCounts};
use crate::core::segments::Thresholds;
use crate::utils::{self, RejectionTally};

/// run the whole quantitation pipeline
pub fn quantify(args: Args) -> Result<()> {
    info!(
        "Reading genes from {:?} with gene filter {:?}",
        args.gtf, args.gene
    );
    let mut genes = annotate::read_annotation(&args.gtf, args.gene.as_deref())?;
    if let Some(sites) = &args.splice_sites {
        annotate::read_splice_sites(&mut genes, sites)?;
    }

    info!("Found {} genes to quantitate", genes.len());
    if genes.is_empty() {
        bail!("no genes found");
    }

    info!("Reading chromosomes from {:?}", args.fasta);
    let chromosomes = utils::read_fasta(&args.fasta)?;
    info!("Found {} chromosomes", chromosomes.len());
    if chromosomes.is_empty() {
        bail!("no chromosomes found");
    }

    let min_exons = if args.minexons < 1 {
        warn!(
            "minexons (provided value: {}) cannot be less than 1: setting to 1",
            args.minexons
        );
        1
    } else {
        args.minexons as usize
    };

    let params = QuantParams {
        direction: args.direction,
        thresholds: Thresholds {
            min_exons,
            min_coverage: args.mincoverage,
            map_threshold: args.mapthreshold,
            flexibility: args.flexibility,
        },
        no_chr_prefix: args.no_chr_prefix,
        aligner: AlignerParams {
            splicemis: &args.splicemis,
            mismatch: &args.mismatch,
            gapopen: &args.gapopen,
            splice: &args.splice,
        },
    };

    let tally = RejectionTally::default();
    let mut quantitations: Vec<(String, SampleCounts)> = Vec::with_capacity(args.bam.len());

    for (index, bam) in args.bam.iter().enumerate() {
        info!(
            "Quantitating {:?} ({} of {})",
            bam,
            index + 1,
            args.bam.len()
        );

        let counts = quant::process_alignment_file(&genes, &chromosomes, bam, &params, &tally)?;
        let observations: u64 = counts
            .values()
            .flat_map(|gene_counts| gene_counts.values())
            .map(|stats| stats.count)
            .sum();
        info!("Found {} valid splices in {:?}", observations, bam);

        quantitations.push((bam.display().to_string(), counts));
    }

    info!("Collating splice variants");
    let (merged, records) = collate::collate_patterns(&quantitations, &genes, args.flexibility);

    if let Some(parent) = args.outfile.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    if args.both_out {
        let (gtf_outfile, custom_outfile) = split_outfiles(&args.outfile);
        report::write_gtf_output(&merged, &genes, &records, &gtf_outfile, args.mincount, args.report_all)?;
        report::write_output(&merged, &genes, &records, &custom_outfile, args.mincount, args.report_all)?;
    } else if args.gtf_out {
        let outfile = if args.outfile.to_string_lossy() == DEFAULT_OUTFILE {
            PathBuf::from(DEFAULT_GTF_OUTFILE)
        } else {
            args.outfile.clone()
        };
        report::write_gtf_output(&merged, &genes, &records, &outfile, args.mincount, args.report_all)?;
    } else {
        report::write_output(&merged, &genes, &records, &args.outfile, args.mincount, args.report_all)?;
    }

    info!("Rejected {} reads in total", tally.total());
    write_descriptor(&tally.summary(), REJECTION_SUMMARY);

    Ok(())
}

/// derive paired output names from one requested path
fn split_outfiles(outfile: &Path) -> (PathBuf, PathBuf) {
    let stripped = outfile
        .to_string_lossy()
        .replace(".txt", "")
        .replace(".gtf", "");

    (
        PathBuf::from(format!("{}.gtf", stripped)),
        PathBuf::from(format!("{}.txt", stripped)),
    )
}
