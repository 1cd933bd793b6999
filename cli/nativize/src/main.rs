//! Nativize CLI: rewrites the native-import stubs of a module image.

mod rewrite;

use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};
use log::LevelFilter;

#[derive(Parser)]
#[command(
    name = "nativize",
    version,
    about = "Replace declarative native-import stubs with explicit loader code"
)]
struct Cli {
    /// Input module image (.nmd)
    input: PathBuf,
    /// Output module image (.nmd)
    output: PathBuf,
    /// Rewrite configuration (nativize.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Report format
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    report: ReportFormat,
    /// More log output (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Only log errors; suppress the report
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Text,
    Json,
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = run(&cli) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

/// `RUST_LOG` wins over the command-line flags.
fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        LevelFilter::Error
    } else {
        match cli.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_env("RUST_LOG")
        .format_timestamp(None)
        .init();
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let report = rewrite::run(&cli.input, &cli.output, cli.config.as_deref())?;
    if !cli.quiet {
        println!("{}", rewrite::render(&report, cli.report)?);
    }
    Ok(())
}
