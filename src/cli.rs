//! CLI argument parsing for `rpress`.
use clap::{Parser, Subcommand};
use report_press::state::{ChartRef, SectionId};
use std::path::PathBuf;

pub const DEFAULT_CONFIG_PATH: &str = "rpress.json";

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "rpress",
    version,
    about = "Compile a data analysis report from a dataset summary and charts",
    after_help = "Commands:\n  init                      Write a default rpress.json\n  run --summary <file>      Plan, write, typeset and publish a report\n  check                     Validate a config or a section fragment\n\nExamples:\n  rpress init\n  rpress run --summary out/summary.txt --chart kpis=out/units_by_region.png\n  RPRESS_LM_COMMAND='ollama run llama3' rpress run --summary summary.txt\n  rpress check --fragment kpis.tex --section kpis",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Init(InitArgs),
    Run(RunArgs),
    Check(CheckArgs),
}

#[derive(Parser, Debug)]
#[command(about = "Write a default run configuration")]
pub struct InitArgs {
    /// Config file to create
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Overwrite an existing config
    #[arg(long)]
    pub force: bool,

    /// Print the default config instead of writing it
    #[arg(long, conflicts_with = "force")]
    pub print: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Run the report pipeline once")]
pub struct RunArgs {
    /// Text file describing the dataset (columns, sizes, summary statistics)
    #[arg(long, value_name = "PATH")]
    pub summary: PathBuf,

    /// Chart image for a section, as <section>=<path>; repeatable
    #[arg(long = "chart", value_name = "SECTION=PATH")]
    pub charts: Vec<ChartRef>,

    /// Run configuration (defaults apply when omitted)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Where the final PDF is published
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Work directory for sources, logs and the run report
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Run deadline in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout_secs: Option<u64>,

    /// Print the run report JSON on stdout
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Validate a config file or a section fragment")]
pub struct CheckArgs {
    /// Config file to validate
    #[arg(long, value_name = "PATH", required_unless_present = "fragment")]
    pub config: Option<PathBuf>,

    /// LaTeX fragment to sanitize and validate
    #[arg(long, value_name = "PATH")]
    pub fragment: Option<PathBuf>,

    /// Section the fragment belongs to
    #[arg(long, value_name = "SECTION", default_value = "stats")]
    pub section: SectionId,
}
