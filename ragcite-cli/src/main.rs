use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use ragcite_core::config::{Config, StorageMode};
use ragcite_core::rag::{
    DocumentStatus, IngestReport, MetadataFilter, MetadataValue, QueryOptions, QueryResponse, RagEngine, RagError,
};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ragcite")]
#[command(about = "Ask questions about your documents and get answers with citations", long_about = None)]
#[command(version)]
struct Cli {
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Load, chunk, embed and index a file or directory")]
    Ingest {
        path: PathBuf,

        #[arg(short, long, help = "Descend into subdirectories")]
        recursive: bool,
    },

    #[command(about = "Answer a question from the indexed documents")]
    Query {
        question: String,

        #[arg(short = 'k', long, help = "Number of chunks to retrieve (overrides retrieval.top_k)")]
        top_k: Option<usize>,

        #[arg(long, help = "Use Maximal Marginal Relevance for more diverse context")]
        mmr: bool,

        #[arg(long, help = "Do not list cited sources")]
        no_sources: bool,

        #[arg(long, help = "Only retrieve chunks from this source id")]
        source: Option<String>,

        #[arg(long = "filter", value_name = "KEY=VALUE", help = "Metadata equality filter (repeatable)")]
        filters: Vec<String>,

        #[arg(long, help = "Print the response as JSON")]
        json: bool,
    },

    #[command(about = "Delete every record from the index")]
    Reset {
        #[arg(short, long, help = "Skip the confirmation prompt")]
        yes: bool,
    },

    #[command(about = "Show index statistics")]
    Stats,

    #[command(about = "Show current configuration")]
    Config {
        #[arg(long, help = "Print the effective configuration as YAML")]
        yaml: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_tracing(&config.log_level);
    tracing::debug!(path = %cli.config.display(), "Configuration resolved");

    match cli.command {
        Commands::Ingest { path, recursive } => ingest(config, &path, recursive).await,
        Commands::Query {
            question,
            top_k,
            mmr,
            no_sources,
            source,
            filters,
            json,
        } => {
            let mut filter = MetadataFilter::new();
            if let Some(source) = source {
                filter = filter.source(source);
            }
            for raw in &filters {
                let (key, value) = parse_filter(raw)?;
                filter = filter.eq(key, value);
            }

            let mut options = QueryOptions::default().with_mmr(mmr).with_sources(!no_sources);
            if let Some(k) = top_k {
                options = options.with_top_k(k);
            }
            if !filter.is_empty() {
                options = options.with_filter(filter);
            }
            query(config, &question, &options, json).await
        }
        Commands::Reset { yes } => reset(config, yes).await,
        Commands::Stats => stats(config).await,
        Commands::Config { yaml } => show_config(&config, yaml),
    }
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::load(path).with_context(|| format!("Failed to load config from {}", path.display()))
    } else {
        Ok(Config::default())
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// Parses `key=value`; integers and booleans are typed, anything else is text.
fn parse_filter(raw: &str) -> Result<(String, MetadataValue)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("Invalid filter '{}', expected KEY=VALUE", raw))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("Invalid filter '{}': empty key", raw);
    }

    let value = value.trim();
    let value = if let Ok(n) = value.parse::<i64>() {
        MetadataValue::Integer(n)
    } else if let Ok(b) = value.parse::<bool>() {
        MetadataValue::Bool(b)
    } else {
        MetadataValue::Text(value.to_string())
    };
    Ok((key.to_string(), value))
}

async fn ingest(config: Config, path: &Path, recursive: bool) -> Result<()> {
    let engine = RagEngine::from_config(config).await.context("Failed to initialize engine")?;

    println!("{} Ingesting {}...", "→".blue(), path.display());
    let report = engine
        .ingest_path(path, recursive)
        .await
        .with_context(|| format!("Failed to ingest {}", path.display()))?;

    print_ingest_report(&report);
    Ok(())
}

fn print_ingest_report(report: &IngestReport) {
    if report.documents.is_empty() {
        println!("{}", "No supported documents found".yellow());
        return;
    }

    println!();
    for doc in &report.documents {
        match doc.status {
            DocumentStatus::Success => println!(
                "  {} {} ({} chunks, {} batches)",
                "✓".green().bold(),
                doc.source_id,
                doc.chunks_upserted,
                doc.batches
            ),
            DocumentStatus::Skipped => {
                println!("  {} {} (no chunks created)", "-".yellow().bold(), doc.source_id)
            }
            DocumentStatus::Failed => println!(
                "  {} {}: {}",
                "✗".red().bold(),
                doc.source_id,
                doc.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    println!();
    println!(
        "{} {} succeeded, {} skipped, {} failed, {} chunks indexed",
        "Summary:".bold(),
        report.successful().to_string().green(),
        report.skipped(),
        report.failed().to_string().red(),
        report.chunks_upserted()
    );
}

async fn query(config: Config, question: &str, options: &QueryOptions, json: bool) -> Result<()> {
    let engine = RagEngine::from_config(config).await.context("Failed to initialize engine")?;

    let outcome = if json {
        engine.query(question, options).await
    } else {
        println!("{}", "Answer:".bold().green());
        let outcome = engine
            .query_streaming(question, options, |token| {
                print!("{}", token);
                let _ = io::stdout().flush();
            })
            .await;
        println!();
        outcome
    };

    let response = match outcome {
        Ok(response) => response,
        Err(RagError::EmptyIndex) => {
            println!("{}", "The index is empty. Run 'ragcite ingest <path>' first.".yellow());
            return Ok(());
        }
        Err(e) => return Err(e).context("Query failed"),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&response).context("Failed to serialize response")?);
    } else {
        print_sources(&response);
    }
    Ok(())
}

fn print_sources(response: &QueryResponse) {
    let result = &response.result;
    if result.citations.is_empty() {
        return;
    }

    println!();
    println!("{}", "Sources:".bold());
    for citation in &result.citations {
        println!("  {} {} (score {:.3})", "•".cyan(), citation.marker(), citation.score);
    }
    println!(
        "{}",
        format!(
            "{} chunks retrieved via {}",
            result.retrieved_chunks, response.retrieval_method
        )
        .dimmed()
    );
}

async fn reset(config: Config, yes: bool) -> Result<()> {
    let collection = config.storage.vector_db.collection_name.clone();
    if !yes && !confirm(&format!("Delete every record in '{}'?", collection))? {
        println!("Aborted");
        return Ok(());
    }

    let engine = RagEngine::from_config(config).await.context("Failed to initialize engine")?;
    engine.reset().await.context("Failed to reset index")?;
    println!("{} Index '{}' reset", "✓".green().bold(), collection.cyan());
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

async fn stats(config: Config) -> Result<()> {
    let engine = RagEngine::from_config(config).await.context("Failed to initialize engine")?;
    let stats = engine.stats().await.context("Failed to read index statistics")?;

    println!("{}", "Index Statistics:".bold().green());
    println!();
    println!("  Backend:         {}", stats.backend.cyan());
    println!("  Collection:      {}", stats.collection);
    println!("  Records:         {}", stats.records);
    println!(
        "  Index Dimension: {}",
        stats.index_dimension.map(|d| d.to_string()).unwrap_or_else(|| "not provisioned".into())
    );
    println!("  Embedding Model: {} ({} dims)", stats.embedding_model.cyan(), stats.embedding_dimension);
    Ok(())
}

fn show_config(config: &Config, yaml: bool) -> Result<()> {
    if yaml {
        print!("{}", serde_yaml::to_string(config).context("Failed to serialize config")?);
        return Ok(());
    }

    println!("{}", "Current Configuration:".bold().green());
    println!();
    println!("{}", "Embedding:".bold());
    println!("  Provider:       {}", config.embedding.provider);
    println!("  Model:          {}", config.embedding.model.cyan());
    if let Some(dimension) = config.embedding.dimension {
        println!("  Dimension:      {}", dimension);
    }
    println!();
    println!("{}", "Chunking:".bold());
    println!("  Percentile:     {}", config.chunking.breakpoint_percentile);
    println!("  Chunk Size:     {}", config.chunking.chunk_size);
    println!("  Chunk Overlap:  {}", config.chunking.chunk_overlap);
    println!("  Enforce Size:   {}", config.chunking.enforce_max_size);
    println!();
    println!("{}", "Retrieval:".bold());
    println!("  Top K:          {}", config.retrieval.top_k);
    println!("  Fetch K:        {}", config.retrieval.fetch_k_for(config.retrieval.top_k));
    println!("  MMR Lambda:     {}", config.retrieval.mmr_lambda);
    println!();
    println!("{}", "LLM:".bold());
    println!("  Provider:       {}", config.llm.provider);
    println!("  Model:          {}", config.llm.model.cyan());
    println!("  Base URL:       {}", config.llm.base_url);
    println!("  Temperature:    {}", config.llm.temperature);
    println!();
    println!("{}", "Storage:".bold());
    match &config.storage.storage_mode {
        StorageMode::Memory => println!("  Mode:           memory"),
        StorageMode::Embedded { path } => println!("  Mode:           embedded ({})", path),
        StorageMode::Grpc { url } => println!("  Mode:           grpc ({})", url),
    }
    println!("  Collection:     {}", config.storage.vector_db.collection_name);
    println!("  Batch Size:     {}", config.storage.upsert_batch_size);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filter_types_values() {
        assert_eq!(parse_filter("page=3").unwrap(), ("page".to_string(), MetadataValue::Integer(3)));
        assert_eq!(
            parse_filter("draft=false").unwrap(),
            ("draft".to_string(), MetadataValue::Bool(false))
        );
        assert_eq!(
            parse_filter("document_type = markdown").unwrap(),
            ("document_type".to_string(), MetadataValue::Text("markdown".into()))
        );
    }

    #[test]
    fn test_parse_filter_rejects_malformed() {
        assert!(parse_filter("page").is_err());
        assert!(parse_filter("=3").is_err());
    }

    #[test]
    fn test_cli_parses_query_flags() {
        let cli = Cli::parse_from(["ragcite", "query", "What is MMR?", "-k", "3", "--mmr", "--source", "a.md"]);
        match cli.command {
            Commands::Query {
                top_k, mmr, source, ..
            } => {
                assert_eq!(top_k, Some(3));
                assert!(mmr);
                assert_eq!(source.as_deref(), Some("a.md"));
            }
            _ => panic!("expected query command"),
        }
    }
}
