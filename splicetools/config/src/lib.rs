use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// numeric values
pub const MIN_THREADS: usize = 1;
pub const CONTEXT_SIZE: i64 = 5000;
pub const POLYA_KMER_FRACTION: f64 = 0.15;
pub const MIN_GTF_FIELDS: usize = 9;
pub const MIN_SPLICE_SITE_FIELDS: usize = 4;

// sequence motifs enriched in polyA/polyT and dinucleotide-repeat mappings
pub const POLYA_KMERS: [&str; 4] = ["AAAA", "TTTT", "ACAC", "GTGT"];

// identifiers
pub const VARIANT_PREFIX: &str = "Variant";
pub const NO_CORRECTION: &str = "no_correction";
pub const TOOL_NAME: &str = "iso-quant";
pub const SPLICE_ACCEPTOR_TAG: &str = "splice_acceptor";

// external tools
pub const SAMTOOLS: &str = "samtools";
pub const CHEXONS: &str = "chexons";

// file names
pub const DEFAULT_OUTFILE: &str = "iso_quant_output.txt";
pub const DEFAULT_GTF_OUTFILE: &str = "iso_quant_output.gtf";
pub const MATCH_INFO_SUFFIX: &str = "_matchInfo.tsv";
pub const REJECTION_SUMMARY: &str = "rejection_summary.json";

// os
#[cfg(not(windows))]
const TICK_SETTINGS: (&str, u64) = ("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ", 80);
#[cfg(windows)]
const TICK_SETTINGS: (&str, u64) = (r"+-x| ", 200);

/// return a pre-configured progress bar
pub fn get_progress_bar(length: u64, msg: &str) -> ProgressBar {
    let progressbar_style = ProgressStyle::default_spinner()
        .tick_chars(TICK_SETTINGS.0)
        .template(" {spinner} {msg:<30} {wide_bar} ETA {eta_precise} ")
        .expect("no template error");

    let progress_bar = ProgressBar::new(length);

    progress_bar.set_style(progressbar_style);
    progress_bar.enable_steady_tick(Duration::from_millis(TICK_SETTINGS.1));
    progress_bar.set_message(msg.to_owned());

    progress_bar
}

/// genomic strand of a gene, transcript or read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Strand {
    Forward,
    Reverse,
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strand::Forward => write!(f, "+"),
            Strand::Reverse => write!(f, "-"),
        }
    }
}

impl FromStr for Strand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "+" => Ok(Strand::Forward),
            "-" => Ok(Strand::Reverse),
            _ => Err(format!("ERROR: strand is not + or -: {}", s)),
        }
    }
}

/// write a serializable run summary to a JSON file
pub fn write_descriptor<T: Serialize>(data: &T, fname: &str) {
    log::info!("Writing run descriptor to {}", fname);
    let f = match File::create(fname) {
        Ok(f) => f,
        Err(e) => panic!("Error creating file: {}", e),
    };
    let mut writer = BufWriter::new(f);

    serde_json::to_writer_pretty(&mut writer, data).unwrap_or_else(|e| {
        panic!("Error writing descriptor: {}", e);
    });
    writer.flush().unwrap_or_else(|e| {
        panic!("Error flushing descriptor: {}", e);
    });
}

/// argument checker for the quantitation tool
pub trait ArgCheck {
    fn check(&self) -> Result<(), CliError> {
        self.validate_args()
    }

    fn validate_args(&self) -> Result<(), CliError> {
        validate(self.get_annotation(), &["gtf", "gtf.gz", "gff", "gff.gz"])?;
        validate(self.get_genome(), &["fa", "fasta", "fa.gz", "fasta.gz"])?;

        if self.get_alignments().is_empty() {
            let err = "No alignment files provided".to_string();
            return Err(CliError::InvalidInput(err));
        }
        for bam in self.get_alignments() {
            validate(bam, &["bam"])?;
        }

        if let Some(sites) = self.get_splice_sites() {
            validate_exists(sites)?;
        } else {
            log::warn!("No known splice-site file provided. Skipping...");
        }

        Ok(())
    }

    fn get_annotation(&self) -> &PathBuf;
    fn get_genome(&self) -> &PathBuf;
    fn get_alignments(&self) -> &Vec<PathBuf>;
    fn get_splice_sites(&self) -> Option<&PathBuf>;
}

/// error handling for CLI
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// argument validation
pub fn validate(arg: &PathBuf, extensions: &[&str]) -> Result<(), CliError> {
    validate_exists(arg)?;

    let name = arg
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if !extensions.iter().any(|ext| name.ends_with(ext)) {
        return Err(CliError::InvalidInput(format!(
            "ERROR: file {:?} does not end in .{}",
            arg,
            extensions.join("/.")
        )));
    }

    Ok(())
}

pub fn validate_exists(arg: &PathBuf) -> Result<(), CliError> {
    if !arg.exists() {
        return Err(CliError::InvalidInput(format!(
            "ERROR: {:?} does not exist",
            arg
        )));
    }

    if !arg.is_file() {
        return Err(CliError::InvalidInput(format!(
            "ERROR: {:?} is not a file",
            arg
        )));
    }

    match std::fs::metadata(arg) {
        Ok(metadata) if metadata.len() == 0 => Err(CliError::InvalidInput(format!(
            "ERROR: file {:?} is empty",
            arg
        ))),
        Ok(_) => Ok(()),
        Err(e) => Err(CliError::IoError(e)),
    }
}
