//! Example demonstrating ingestion and a cited answer.
//!
//! This example shows how to:
//! - Ingest in-memory documents into a vector index
//! - Ask a question with plain similarity retrieval and with MMR
//! - Print the answer with its deduplicated sources
//!
//! It uses the hashing embedder and an in-memory index, so only the answer
//! model (Ollama by default) needs to be running.

use ragcite::config::{Config, StorageMode};
use ragcite::rag::QueryOptions;
use ragcite::{RagEngine, SourceDocument};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("ragcite - Ingest and Ask Example");
    println!("================================\n");

    let mut config = Config::load_or_default();
    config.embedding.provider = "hashing".to_string();
    config.embedding.dimension = Some(256);
    config.storage.storage_mode = StorageMode::Memory;

    let engine = RagEngine::from_config(config).await?;

    let documents = vec![
        SourceDocument::new(
            "handbook.md",
            "Vacation requests go through the HR portal. Requests need two weeks of notice. \
             Managers approve requests within three business days.",
        )
        .with_metadata("page", 3),
        SourceDocument::new(
            "faq.md",
            "The office opens at eight. Parking is free for employees. \
             Vacation balances are shown on the HR portal dashboard.",
        ),
    ];

    let report = engine.ingest(documents).await?;
    println!(
        "✓ Ingested {} documents ({} chunks)\n",
        report.successful(),
        report.chunks_upserted()
    );

    let question = "How do I request vacation?";
    for options in [QueryOptions::default(), QueryOptions::default().with_mmr(true)] {
        println!("=== {} retrieval ===", if options.use_mmr { "MMR" } else { "Similarity" });
        println!("Query: '{}'\n", question);

        match engine.query(question, &options).await {
            Ok(response) => {
                println!("Answer:\n{}\n", response.result.answer);
                for citation in &response.result.citations {
                    println!("  • {} (score {:.3})", citation.marker(), citation.score);
                }
                println!();
            }
            Err(e) => {
                eprintln!("⚠ Query failed: {}", e);
                eprintln!("  Make sure Ollama is running and the answer model is installed.\n");
                break;
            }
        }
    }

    Ok(())
}
