//! spkexport - export a speaker-embedding table to `spk2info.json`.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use spkexport::{ErrorPolicy, InputFormat, export};
use spkexport_cli::{OutputFormat, Profile, init_logging, load_config, render_summary};

/// spkexport - convert a PyTorch speaker table (spk2info.pt) to JSON.
///
/// The input is a mapping from speaker id to an embedding, or to a record
/// holding one under "embedding". The output is
/// `{"<id>": {"embedding": [...]}}` in the input's order.
///
/// Presets can be stored as profiles in ~/.spkexport/config.yaml.
#[derive(Parser, Debug)]
#[command(name = "spkexport")]
#[command(about = "Export speaker embeddings to spk2info.json")]
#[command(version)]
pub struct Cli {
    /// Speaker table to read (spk2info.pt, a pickle, or JSON)
    #[arg(long)]
    pub input: PathBuf,

    /// JSON file to write
    #[arg(long)]
    pub output: PathBuf,

    /// Input format (auto, torch, pickle, json)
    #[arg(long)]
    pub format: Option<InputFormat>,

    /// Required embedding length
    #[arg(long)]
    pub dim: Option<usize>,

    /// Report every failing entry instead of stopping at the first
    #[arg(long)]
    pub collect_errors: bool,

    /// Re-read the written file and compare it with the converted table
    #[arg(long)]
    pub verify: bool,

    /// Config file (default is ~/.spkexport/config.yaml)
    #[arg(long)]
    pub config: Option<String>,

    /// Profile name to use
    #[arg(short = 'p', long)]
    pub profile: Option<String>,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Verbose output
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl Cli {
    /// Options given explicitly on the command line.
    fn flags(&self) -> Profile {
        Profile {
            format: self.format,
            expected_dim: self.dim,
            error_policy: self.collect_errors.then_some(ErrorPolicy::CollectAll),
            verify: self.verify.then_some(true),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config = load_config(cli.config.as_deref())?;
    let profile = config
        .resolve_profile(cli.profile.as_deref())?
        .cloned()
        .unwrap_or_default();
    let opts = cli.flags().or(&profile).to_options();
    tracing::debug!(?opts, config = %config.path().display(), "resolved options");

    let summary = export(&cli.input, &cli.output, &opts)
        .with_context(|| format!("failed to export {}", cli.input.display()))?;

    println!(
        "{}",
        render_summary(&summary, OutputFormat::from_json_flag(cli.json))?
    );
    Ok(())
}
