mod error;
mod event;
mod graph_store;
mod ingest;
mod predict;

use anyhow::{Context, Result};
use event::FrontpageMode;
use graph_store::GraphStore;
use ingest::{split_files, IngestMode, Ingestor};
use predict::{BatchPredictor, PredictOptions, PredictionRow};
use std::env;
use std::fs;
use std::path::PathBuf;
use tracing::{error, info, warn};

const CONNECT_RETRIES: u32 = 4;

#[derive(Debug)]
struct Config {
    neo4j_uri: String,
    neo4j_user: String,
    neo4j_password: String,
    /// Directory of newline-delimited JSON event logs.
    data_dir: PathBuf,
    /// Lower bound on read timestamps admitted into windowed queries.
    oldest_read: i64,
    result_limit: i64,
    friend_limit: i64,
    /// Cold-start category filter, comma-separated; empty means unfiltered.
    categories: Option<Vec<String>>,
    frontpage_mode: FrontpageMode,
    ingest_mode: IngestMode,
    /// Share of log files used for ingestion; the rest is held out.
    train_split: f64,
    concurrency: usize,
    output_path: PathBuf,
    /// Users to predict for, comma-separated.
    users: Vec<String>,
}

impl Config {
    fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        Ok(Config {
            neo4j_uri: env::var("NEO4J_URI").unwrap_or_else(|_| "bolt://localhost:7687".to_string()),
            neo4j_user: env::var("NEO4J_USER").unwrap_or_else(|_| "neo4j".to_string()),
            neo4j_password: env::var("NEO4J_PASSWORD").unwrap_or_else(|_| "password".to_string()),
            data_dir: PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "active1000".to_string())),
            oldest_read: env_parsed("OLDEST_READ", 0),
            result_limit: env_parsed("RESULT_LIMIT", 10),
            friend_limit: env_parsed("FRIEND_LIMIT", 10),
            categories: env::var("CATEGORIES")
                .ok()
                .map(|raw| parse_list(&raw))
                .filter(|list| !list.is_empty()),
            frontpage_mode: env::var("FRONTPAGE_MODE")
                .ok()
                .and_then(|raw| FrontpageMode::parse(&raw))
                .unwrap_or(FrontpageMode::Tag),
            ingest_mode: env::var("INGEST_MODE")
                .ok()
                .and_then(|raw| IngestMode::parse(&raw))
                .unwrap_or(IngestMode::Strict),
            train_split: env_parsed("TRAIN_SPLIT", 0.8),
            concurrency: env_parsed("CONCURRENCY", 4),
            output_path: PathBuf::from(
                env::var("OUTPUT_PATH").unwrap_or_else(|_| "predictions.csv".to_string()),
            ),
            users: env::var("USERS").map(|raw| parse_list(&raw)).unwrap_or_default(),
        })
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("🚀 newsgraph starting...");

    let config = Config::from_env()?;
    let phase = env::args().nth(1).unwrap_or_else(|| "pipeline".to_string());

    let store = GraphStore::connect(
        &config.neo4j_uri,
        &config.neo4j_user,
        &config.neo4j_password,
        CONNECT_RETRIES,
    )
    .await?;

    match phase.as_str() {
        "import" => run_import(&store, &config).await?,
        "predict" => run_predict(&store, &config).await?,
        "recommend" => run_recommend(&store, &config).await?,
        "newest" => run_newest(&store, &config).await?,
        "pipeline" => {
            run_import(&store, &config).await?;
            run_predict(&store, &config).await?;
        }
        other => {
            error!(
                "Unknown phase {:?}; expected import, predict, recommend, newest or pipeline",
                other
            );
            anyhow::bail!("unknown phase: {other}");
        }
    }

    info!("👋 newsgraph done");
    Ok(())
}

async fn run_import(store: &GraphStore, config: &Config) -> Result<()> {
    let (train, test) = split_files(&config.data_dir, config.train_split)?;
    info!(
        "📥 Ingesting {} train files from {:?} ({} held out)",
        train.len(),
        config.data_dir,
        test.len()
    );

    let ingestor = Ingestor::new(store, config.frontpage_mode, config.ingest_mode);
    ingestor.ingest_files(&train).await?;
    Ok(())
}

async fn run_predict(store: &GraphStore, config: &Config) -> Result<()> {
    if config.users.is_empty() {
        warn!("No users configured (set USERS), skipping prediction");
        return Ok(());
    }

    let opts = PredictOptions {
        oldest_read: config.oldest_read,
        limit: config.result_limit,
        friend_limit: config.friend_limit,
        categories: config.categories.clone(),
        concurrency: config.concurrency,
        ..PredictOptions::default()
    };

    let predictor = BatchPredictor::new(store.clone(), opts);
    let outcome = predictor.predict_batch(&config.users).await;

    for failure in &outcome.failures {
        error!("❌ No predictions for {}: {}", failure.user_id, failure.error);
    }

    fs::write(&config.output_path, render_csv(&outcome.rows))
        .with_context(|| format!("Failed to write {:?}", config.output_path))?;
    info!(
        "💾 Wrote {} prediction rows for {} users to {:?} ({} users failed)",
        outcome.rows.len(),
        config.users.len() - outcome.failures.len(),
        config.output_path,
        outcome.failures.len()
    );
    Ok(())
}

/// Direct collaborative recommendation per user, logged rather than
/// exported: the interactive counterpart of the batch `predict` phase.
async fn run_recommend(store: &GraphStore, config: &Config) -> Result<()> {
    for user in &config.users {
        info!("--------------------------------------");
        if store.user_exists(user).await? {
            info!("👤 User exists: {}, running collaborative recommendation", user);
            let recs = store
                .collaborative_recommend(user, config.oldest_read, config.result_limit)
                .await?;
            for rec in recs {
                info!(
                    "   Title: {}, url: {}, read-time: {}, time of read: {}",
                    rec.title, rec.url, rec.active_time, rec.time
                );
            }
        } else {
            info!("🧊 User: {}, does not exist, running cold start", user);
            let recs = match &config.categories {
                Some(categories) => {
                    info!("   With categories: {:?}", categories);
                    store
                        .cold_start_with_categories(config.oldest_read, categories, config.result_limit)
                        .await?
                }
                None => store.cold_start(config.oldest_read, config.result_limit).await?,
            };
            for rec in recs {
                info!(
                    "   Title: {}, url: {}, read-time: {}, time of read: {}",
                    rec.title, rec.url, rec.active_time, rec.time
                );
            }
        }
    }
    Ok(())
}

/// Recency-biased variant: newest unread articles from each user's best
/// friends, exported as the same (userId, url) table.
async fn run_newest(store: &GraphStore, config: &Config) -> Result<()> {
    let mut results = Vec::new();
    for user in &config.users {
        let friends = store.find_best_friends(user, config.friend_limit).await?;
        let urls = store
            .find_newest_to_friend(user, &friends, config.result_limit)
            .await?;
        info!("✅ {}: {} newest-by-friends recommendations", user, urls.len());
        results.push((user.clone(), urls));
    }

    let rows = predict::flatten(results);
    fs::write(&config.output_path, render_csv(&rows))
        .with_context(|| format!("Failed to write {:?}", config.output_path))?;
    info!("💾 Wrote {} rows to {:?}", rows.len(), config.output_path);
    Ok(())
}

/// Render the prediction table as CSV with a `userId,url` header.
fn render_csv(rows: &[PredictionRow]) -> String {
    let mut out = String::from("userId,url\n");
    for row in rows {
        out.push_str(&csv_field(&row.user_id));
        out.push(',');
        out.push_str(&csv_field(&row.url));
        out.push('\n');
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests;
