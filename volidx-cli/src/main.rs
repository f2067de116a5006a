//! volume-index - Build and search microscopy volume indices.

use std::path::PathBuf;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::{Parser, ValueEnum};
use colored::Colorize;

mod commands;
mod exit_codes;
mod utils;

use exit_codes::{ExitCode, USAGE_ERROR};

const EXIT_CODES_HELP: &str = "\
Exit codes:
  0   Success
  1   General error
  64  Usage error (missing or invalid arguments)
  65  Data error (malformed specification, corrupt or incompatible index)
  66  Input file or volume not found
  74  I/O error
  75  Timed out waiting for the index lock";

#[derive(Parser)]
#[command(name = "volume-index")]
#[command(author, version, about = "Index and search 3D microscopy volumes", long_about = None)]
#[command(after_help = EXIT_CODES_HELP)]
struct Cli {
    /// Operation to run
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Index specification (key=value file)
    #[arg(long = "indexSpecificationFile", value_name = "PATH")]
    index_specification_file: Option<PathBuf>,

    /// Sample specification to build (sample mode)
    #[arg(long = "sampleSpecificationFile", value_name = "PATH")]
    sample_specification_file: Option<PathBuf>,

    /// Sample index file written by sample mode and merged by index mode
    #[arg(long = "sampleIndexFile", value_name = "PATH")]
    sample_index_file: Option<PathBuf>,

    /// Query volume (search mode)
    #[arg(long, value_name = "PATH")]
    query: Option<PathBuf>,

    /// Maximum number of results (search mode)
    #[arg(long = "maxHits", value_name = "N")]
    max_hits: Option<usize>,

    /// Output format for search results
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Log progress at debug level
    #[arg(long)]
    debug: bool,

    /// Suppress summaries on stderr (results are still printed)
    #[arg(short, long)]
    quiet: bool,

    /// When to colorize output
    #[arg(long, value_enum, default_value_t = ColorChoice::Auto)]
    color: ColorChoice,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Build first-stage index entries for samples
    Sample,
    /// Search the consolidated index with a query volume
    Search,
    /// Merge a sample index file into the consolidated index
    Index,
}

/// Search result output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// `<sample id> <score>` per line
    #[default]
    Text,
    /// A JSON document
    Json,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum ColorChoice {
    #[default]
    Auto,
    Always,
    Never,
}

impl ColorChoice {
    fn apply(self) {
        match self {
            Self::Auto => {}
            Self::Always => colored::control::set_override(true),
            Self::Never => colored::control::set_override(false),
        }
    }
}

/// A fully validated invocation.
#[derive(Debug)]
enum Command {
    Sample {
        index_spec: PathBuf,
        sample_spec: PathBuf,
        sample_index: PathBuf,
    },
    Index {
        index_spec: PathBuf,
        sample_index: PathBuf,
    },
    Search {
        index_spec: PathBuf,
        query: PathBuf,
        max_hits: usize,
        format: OutputFormat,
    },
}

impl Cli {
    /// Check that the selected mode has every argument it needs.
    fn command(&self) -> std::result::Result<Command, String> {
        let mode = self
            .mode
            .ok_or("missing required argument -mode <sample|search|index>")?;
        let require = |value: &Option<PathBuf>, flag: &str| {
            value
                .clone()
                .ok_or_else(|| format!("-mode {} requires -{flag} <path>", mode_name(mode)))
        };
        let index_spec = require(&self.index_specification_file, "indexSpecificationFile")?;

        Ok(match mode {
            Mode::Sample => Command::Sample {
                index_spec,
                sample_spec: require(&self.sample_specification_file, "sampleSpecificationFile")?,
                sample_index: require(&self.sample_index_file, "sampleIndexFile")?,
            },
            Mode::Index => Command::Index {
                index_spec,
                sample_index: require(&self.sample_index_file, "sampleIndexFile")?,
            },
            Mode::Search => Command::Search {
                index_spec,
                query: require(&self.query, "query")?,
                max_hits: self
                    .max_hits
                    .ok_or("-mode search requires -maxHits <N>")?,
                format: self.format,
            },
        })
    }
}

fn mode_name(mode: Mode) -> &'static str {
    match mode {
        Mode::Sample => "sample",
        Mode::Search => "search",
        Mode::Index => "index",
    }
}

fn run(command: Command, quiet: bool) -> Result<()> {
    match command {
        Command::Sample {
            index_spec,
            sample_spec,
            sample_index,
        } => commands::sample::execute(&index_spec, &sample_spec, &sample_index, quiet),
        Command::Index {
            index_spec,
            sample_index,
        } => commands::index::execute(&index_spec, &sample_index, quiet),
        Command::Search {
            index_spec,
            query,
            max_hits,
            format,
        } => commands::search::execute(&index_spec, &query, max_hits, format, quiet),
    }
}

fn report(exit: ExitCode) -> std::process::ExitCode {
    if let Some(message) = &exit.message {
        eprintln!("{} {}", "error:".red().bold(), message);
    }
    std::process::ExitCode::from(exit.code as u8)
}

fn main() -> std::process::ExitCode {
    let args = utils::normalize_args(std::env::args_os());
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            err.exit()
        }
        Err(err) => {
            let _ = err.print();
            return std::process::ExitCode::from(USAGE_ERROR as u8);
        }
    };

    cli.color.apply();
    utils::init_tracing(cli.debug);

    let command = match cli.command() {
        Ok(command) => command,
        Err(message) => return report(ExitCode::error(USAGE_ERROR, message)),
    };

    match run(command, cli.quiet) {
        Ok(()) => report(ExitCode::success()),
        Err(err) => report(ExitCode::from_anyhow(&err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(utils::normalize_args(args.iter().map(Into::into))).unwrap()
    }

    #[test]
    fn test_single_dash_search_invocation() {
        let cli = parse(&[
            "volume-index",
            "-mode",
            "search",
            "-indexSpecificationFile",
            "index.spec",
            "-query",
            "q.v3draw",
            "-maxHits",
            "5",
        ]);
        match cli.command().unwrap() {
            Command::Search {
                query,
                max_hits,
                format,
                ..
            } => {
                assert_eq!(query, PathBuf::from("q.v3draw"));
                assert_eq!(max_hits, 5);
                assert_eq!(format, OutputFormat::Text);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_mode_specific_arguments_required() {
        let cli = parse(&["volume-index", "--mode", "index", "--indexSpecificationFile", "i"]);
        let message = cli.command().unwrap_err();
        assert!(message.contains("sampleIndexFile"), "{message}");

        let cli = parse(&["volume-index", "--indexSpecificationFile", "i"]);
        assert!(cli.command().unwrap_err().contains("-mode"));
    }
}
