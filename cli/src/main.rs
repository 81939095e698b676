//! Knowledge retrieval CLI
//!
//! Loads configuration from the environment (and `.env`), warms the clients
//! and runs top-k retrieval against a user's knowledge table. Data goes to
//! stdout; logs go to stderr.

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use rag_retrieval::{
    BatchRetrievalRequest, MetadataFilter, RagConfig, RetrievalEngine, RetrievalRequest,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Top-k retrieval over pgvector knowledge tables
#[derive(Parser, Debug)]
#[command(name = "rag")]
#[command(about = "Top-k retrieval over pgvector knowledge tables", long_about = None)]
#[command(version)]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, env = "RAG_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Print retrieval metrics to stderr after the command
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Retrieve the passages closest to one query
    Retrieve(RetrieveArgs),

    /// Retrieve for several queries in one call
    Batch(BatchArgs),

    /// Embed a text and print the vector
    Embed(EmbedArgs),

    /// Print the effective configuration with secrets redacted
    Config,
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// User id; its digits select the knowledge table
    #[arg(long)]
    user: String,

    /// Agent id; its digits select the knowledge table
    #[arg(long)]
    agent: String,

    /// Number of passages per query
    #[arg(short = 'k', long, allow_negative_numbers = true)]
    top_k: Option<i64>,

    /// Embedding API key for this call
    #[arg(long)]
    api_key: Option<String>,

    /// Metadata equality predicate, `field=value` (repeatable)
    #[arg(long = "where", value_name = "FIELD=VALUE", value_parser = parse_predicate)]
    predicates: Vec<(String, String)>,

    /// Print the items as JSON instead of a context block
    #[arg(long)]
    json: bool,
}

impl TargetArgs {
    fn filter(&self) -> Option<MetadataFilter> {
        if self.predicates.is_empty() {
            return None;
        }
        let filter = self
            .predicates
            .iter()
            .fold(MetadataFilter::new(), |filter, (field, value)| {
                filter.equals(field.as_str(), value.as_str())
            });
        Some(filter)
    }
}

#[derive(Args, Debug)]
struct RetrieveArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Query text
    query: String,
}

#[derive(Args, Debug)]
struct BatchArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Query texts, answered in order
    #[arg(required = true)]
    queries: Vec<String>,
}

#[derive(Args, Debug)]
struct EmbedArgs {
    /// Model to embed with instead of the configured one
    #[arg(long)]
    model: Option<String>,

    text: String,
}

fn parse_predicate(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((field, value)) if !field.trim().is_empty() => {
            Ok((field.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected FIELD=VALUE, got {raw:?}")),
    }
}

fn init_logging(fallback: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(fallback).context("invalid log filter")?,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .try_init()
        .context("failed to initialise logging")?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let engine = RetrievalEngine::from_config(RagConfig::from_env())
        .await
        .context("failed to build retrieval engine")?;
    if !matches!(cli.command, Command::Config) {
        engine.warm().await;
    }

    match cli.command {
        Command::Retrieve(args) => {
            let mut request = RetrievalRequest::new(&args.target.user, &args.target.agent)
                .with_query(args.query.as_str());
            request.top_k = args.target.top_k;
            request.api_key = args.target.api_key.clone();
            request.metadata_filter = args.target.filter();

            let items = engine.retrieve_topk(request).await;
            if args.target.json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                println!("{}", engine.format_context(&items));
            }
        }
        Command::Batch(args) => {
            let mut request =
                BatchRetrievalRequest::new(&args.target.user, &args.target.agent, &args.queries);
            request.top_k = args.target.top_k;
            request.api_key = args.target.api_key.clone();
            request.metadata_filter = args.target.filter();

            let results = engine.retrieve_topk_batch(request).await;
            if args.target.json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                for (query, items) in args.queries.iter().zip(&results) {
                    println!("# {query}\n{}\n", engine.format_context(items));
                }
            }
        }
        Command::Embed(args) => {
            let Some(vector) = engine
                .embed_text(&args.text, None, args.model.as_deref())
                .await
            else {
                bail!("embedding failed; see logs");
            };
            println!(
                "{}",
                serde_json::json!({
                    "model": vector.model(),
                    "dimension": vector.dimension(),
                    "values": vector.values(),
                })
            );
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&engine.configuration().await)?);
        }
    }

    if cli.metrics {
        eprintln!("{}", serde_json::to_string_pretty(&engine.metrics())?);
    }
    Ok(())
}
