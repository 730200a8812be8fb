//! The command line interface of the fuzzer

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(about = "Coverage-guided fuzzer with per-seed dynamic PCA analysis")]
pub struct Cli {
    #[arg(
        help = "The PUT command line: instrumented binary plus arguments. \
                An argument ending in '@@' is replaced by the input file path; \
                without it the input goes to stdin",
        long = "cli",
        required = true
    )]
    pub cli: String,

    #[arg(
        help = "The directory to read initial inputs from ('seeds')",
        short = 'i',
        long = "in-dir",
        required = true
    )]
    pub in_dir: PathBuf,

    #[arg(
        help = "The directory to store all outputs in (recreated if it exists)",
        short = 'o',
        long = "out-dir",
        required = true
    )]
    pub out_dir: PathBuf,

    #[arg(
        help = "Number of worker threads; must not exceed the CPU count",
        short = 'n',
        long = "threads",
        default_value = "2"
    )]
    pub thread_n: usize,

    #[arg(
        help = "Timeout for each individual execution, in milliseconds",
        short = 't',
        long = "timeout",
        default_value = "100"
    )]
    pub timeout: u64,

    #[arg(
        help = "Promote every coverage-extending run into a new seed",
        long = "evo",
        default_value = "false"
    )]
    pub use_evo: bool,

    #[arg(
        help = "If not set, the child's stdout and stderror will be redirected to /dev/null",
        short = 'd',
        long = "debug-child",
        default_value = "false"
    )]
    pub debug_child: bool,
}
