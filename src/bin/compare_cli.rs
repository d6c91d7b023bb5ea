use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use clausediff::embedder::{remote_config_from_env, select_backend};
use clausediff::{
    CompareOptions, EmbedderChoice, PageSource, PdfPageSource, Pipeline, PlainTextSource,
};

#[derive(Parser, Debug)]
#[command(
    name = "clausediff-compare",
    about = "Offline clause comparison of two policy documents"
)]
struct CompareCli {
    /// Document A.
    file_a: PathBuf,

    /// Document B.
    file_b: PathBuf,

    /// Treat inputs as pre-extracted plain text (form-feed page breaks).
    #[arg(long, default_value_t = false)]
    plain: bool,

    /// Embedding backend (auto, local or remote).
    #[arg(long, env = "UCC_EMBEDDER", default_value = "auto")]
    embedder: String,

    /// Similarity threshold override.
    #[arg(long)]
    similarity_threshold: Option<f64>,

    /// Skip token diffs in the output.
    #[arg(long, default_value_t = false)]
    no_token_diffs: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = CompareCli::parse();
    let embedder_choice: EmbedderChoice = cli
        .embedder
        .parse()
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    let mut options = CompareOptions {
        embedder: embedder_choice,
        return_token_diffs: !cli.no_token_diffs,
        ..CompareOptions::default()
    };
    if let Some(threshold) = cli.similarity_threshold {
        options.similarity_threshold = threshold;
    }
    options.validate().map_err(|err| anyhow::anyhow!("{err}"))?;

    let bytes_a = std::fs::read(&cli.file_a)
        .with_context(|| format!("failed to read {}", cli.file_a.display()))?;
    let bytes_b = std::fs::read(&cli.file_b)
        .with_context(|| format!("failed to read {}", cli.file_b.display()))?;

    let source: Arc<dyn PageSource> = if cli.plain {
        Arc::new(PlainTextSource)
    } else {
        Arc::new(PdfPageSource)
    };
    let embedder = select_backend(options.embedder, remote_config_from_env())
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    let pipeline = Pipeline::new(options, embedder, source);

    let result = pipeline
        .compare(&bytes_a, &bytes_b)
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
