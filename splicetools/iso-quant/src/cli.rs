use clap::{Parser, ValueEnum};
use config::{ArgCheck, DEFAULT_OUTFILE};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about = "Quantitate splice isoforms from long-read alignments", long_about = None)]
pub struct Args {
    #[arg(
        short = 'a',
        long = "gtf",
        required = true,
        value_name = "PATH",
        help = "GTF file containing the genes to quantitate"
    )]
    pub gtf: PathBuf,

    #[arg(
        short = 's',
        long = "fasta",
        required = true,
        value_name = "PATH",
        help = "Multi-FASTA file containing the genome sequence"
    )]
    pub fasta: PathBuf,

    #[arg(
        short = 'b',
        long = "bam",
        required = true,
        value_name = "PATHS",
        value_delimiter = ',',
        num_args = 1..,
        help = "BAM files to quantitate, delimited by comma"
    )]
    pub bam: Vec<PathBuf>,

    #[arg(
        short = 'o',
        long = "outfile",
        value_name = "PATH",
        default_value = DEFAULT_OUTFILE,
        help = "File to write the output count table to"
    )]
    pub outfile: PathBuf,

    #[arg(
        long = "gtf-out",
        help = "Write a GTF-style table instead of the tabular format",
        value_name = "FLAG",
        default_value = "false"
    )]
    pub gtf_out: bool,

    #[arg(
        long = "both-out",
        help = "Write both the tabular and the GTF-style output",
        value_name = "FLAG",
        default_value = "false"
    )]
    pub both_out: bool,

    #[arg(
        short = 'f',
        long = "flexibility",
        value_name = "BASES",
        default_value_t = 5,
        help = "How many bases apart exon boundaries can be and still merge"
    )]
    pub flexibility: i64,

    #[arg(
        short = 'm',
        long = "mincount",
        value_name = "COUNT",
        default_value_t = 2,
        help = "Minimum number of observations for a variant to be reported"
    )]
    pub mincount: u64,

    #[arg(
        short = 'c',
        long = "mincoverage",
        value_name = "FRACTION",
        default_value_t = 0.1,
        help = "Minimum proportion of the gene a variant must cover"
    )]
    pub mincoverage: f64,

    #[arg(
        long = "mapthreshold",
        value_name = "FRACTION",
        default_value_t = 0.1,
        help = "Minimum proportion of a read that must be mapped"
    )]
    pub mapthreshold: f64,

    #[arg(
        short = 'e',
        long = "minexons",
        value_name = "COUNT",
        default_value_t = 2,
        help = "Minimum number of exons a read must align to"
    )]
    pub minexons: i64,

    #[arg(
        short = 'g',
        long = "gene",
        value_name = "NAME",
        help = "Name or ID of a single gene to quantitate"
    )]
    pub gene: Option<String>,

    #[arg(
        long = "splice-sites",
        value_name = "PATH",
        help = "Text file with known splice donors and acceptors"
    )]
    pub splice_sites: Option<PathBuf>,

    #[arg(
        short = 'd',
        long = "direction",
        value_enum,
        value_name = "DIRECTION",
        default_value = "none",
        help = "Directionality of the library"
    )]
    pub direction: Direction,

    #[arg(
        long = "no-chr-prefix",
        help = "Don't add a 'chr' prefix when extracting reads (e.g. for SIRV contigs)",
        value_name = "FLAG",
        default_value = "false"
    )]
    pub no_chr_prefix: bool,

    #[arg(
        long = "report-all",
        help = "Report all patterns, including seeded ones with no counts",
        value_name = "FLAG",
        default_value = "false"
    )]
    pub report_all: bool,

    #[arg(
        short = 't',
        long = "threads",
        help = "Number of threads",
        value_name = "THREADS",
        default_value_t = num_cpus::get()
    )]
    pub threads: usize,

    // passthrough tuning for the external local aligner
    #[arg(long = "splicemis", default_value = "150", hide = true)]
    pub splicemis: String,

    #[arg(long = "mismatch", default_value = "25", hide = true)]
    pub mismatch: String,

    #[arg(long = "gapopen", default_value = "25", hide = true)]
    pub gapopen: String,

    #[arg(long = "splice", default_value = "110", hide = true)]
    pub splice: String,
}

/// strandedness of the library relative to the annotated gene
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Direction {
    None,
    Same,
    Opposing,
}

impl ArgCheck for Args {
    fn get_annotation(&self) -> &PathBuf {
        &self.gtf
    }

    fn get_genome(&self) -> &PathBuf {
        &self.fasta
    }

    fn get_alignments(&self) -> &Vec<PathBuf> {
        &self.bam
    }

    fn get_splice_sites(&self) -> Option<&PathBuf> {
        self.splice_sites.as_ref()
    }
}
