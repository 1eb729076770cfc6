use std::path::PathBuf;

use clap::{Command, Parser};
use clap_complete::{Generator, Shell, generate};
use owo_colors::OwoColorize;

pub const BANNER: &str = r#"
      ____                    _ __
     / __/__ _______ _  ___ (_) /____
    / /_/ / // __/  ' \(_-</ / __/ -_)
   /_/ /_/_//_/ /_/_/_/___/_/\__/\__/

    @nt54hamnghi
"#;

pub const WARNINGS: &str = r#"
NOTE:
[!] Search and model usage is billed to your own API keys.
[!] Crawled sites remain subject to their own terms of use.
"#;

pub fn header() -> String {
    format!("{}\n{}", BANNER.purple(), WARNINGS.yellow())
}

/// Resolve company records to their canonical web domains
#[derive(Parser, Debug)]
#[command(name = "fsite")]
#[command(author, version, about, long_about)]
#[command(before_help = header(), before_long_help = header())]
#[command(arg_required_else_help = true)]
#[command(verbatim_doc_comment, propagate_version = true)]
pub struct Cli {
    /// CSV file with one company per row
    #[arg(short, long, required_unless_present = "completion")]
    pub input: Option<PathBuf>,

    /// Destination CSV, defaults to "<input stem>_enriched.csv"
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Enable verbosity and display progress in realtime
    #[arg(short, long)]
    pub verbose: bool,

    /// Generate completion for the given shell
    #[arg(short, long, conflicts_with_all = ["input", "output", "verbose"])]
    pub completion: Option<Shell>,
}

pub fn print_completions<G: Generator>(g: G, c: &mut Command) {
    generate(g, c, c.get_name().to_string(), &mut std::io::stdout());
}
