//! Batch prediction
//!
//! Fans a recommendation strategy out over a list of users. The path for
//! each user (personalized vs. cold start) is resolved once into a tagged
//! strategy, per-user store queries are retried with bounded attempts, and
//! a user that still fails is recorded without aborting the batch.

use crate::graph_store::GraphStore;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct PredictOptions {
    /// Lower bound on read timestamps admitted into windowed traversals.
    pub oldest_read: i64,
    /// Result size per user.
    pub limit: i64,
    /// Friend-set size for best-friend discovery.
    pub friend_limit: i64,
    /// Cold-start category filter; `None` means unfiltered cold start.
    pub categories: Option<Vec<String>>,
    /// Worker-pool bound, sized to the store's concurrent-transaction limit.
    pub concurrency: usize,
    /// Bounded attempts per store query before the user is marked failed.
    pub query_attempts: u32,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            oldest_read: 0,
            limit: 10,
            friend_limit: 10,
            categories: None,
            concurrency: 4,
            query_attempts: 3,
        }
    }
}

/// Recommendation path for one user, resolved once per batch entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// The user has read history: recommend from the discovered friend set.
    Personalized { friends: Vec<String> },
    /// No read history: global (optionally category-filtered) cold start.
    ColdStart { categories: Option<Vec<String>> },
}

/// Pure strategy selection; `friends` is the precomputed friend set and is
/// only meaningful when the user exists.
pub fn select_strategy(exists: bool, friends: Vec<String>, categories: Option<&[String]>) -> Strategy {
    if exists {
        Strategy::Personalized { friends }
    } else {
        Strategy::ColdStart {
            categories: categories.map(|c| c.to_vec()),
        }
    }
}

/// One row of the output table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionRow {
    pub user_id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserFailure {
    pub user_id: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub rows: Vec<PredictionRow>,
    pub failures: Vec<UserFailure>,
}

/// Flatten per-user results into the output table, preserving input order
/// across users and per-user recommendation order within each user.
pub fn flatten(results: Vec<(String, Vec<String>)>) -> Vec<PredictionRow> {
    results
        .into_iter()
        .flat_map(|(user_id, urls)| {
            urls.into_iter().map(move |url| PredictionRow {
                user_id: user_id.clone(),
                url,
            })
        })
        .collect()
}

#[derive(Clone)]
pub struct BatchPredictor {
    store: GraphStore,
    opts: PredictOptions,
}

impl BatchPredictor {
    pub fn new(store: GraphStore, opts: PredictOptions) -> Self {
        Self { store, opts }
    }

    /// Predict for every user, fanned out over a bounded worker pool.
    /// Completion order is arbitrary, so results are re-sorted to input
    /// order before flattening.
    pub async fn predict_batch(&self, users: &[String]) -> BatchOutcome {
        let total = users.len();
        let semaphore = Arc::new(Semaphore::new(self.opts.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (idx, user) in users.iter().enumerate() {
            let predictor = self.clone();
            let semaphore = semaphore.clone();
            let user = user.clone();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (idx, user, Err(anyhow!("worker pool closed"))),
                };
                let result = predictor.predict_user(&user).await;
                (idx, user, result)
            });
        }

        let mut per_user = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => {
                    info!("   Finished user {}/{}", per_user.len() + 1, total);
                    per_user.push(entry);
                }
                Err(e) => error!("❌ Prediction task panicked: {}", e),
            }
        }
        per_user.sort_by_key(|(idx, _, _)| *idx);

        let mut succeeded = Vec::new();
        let mut failures = Vec::new();
        for (_, user, result) in per_user {
            match result {
                Ok(urls) => {
                    info!("✅ {}: {} recommendations", user, urls.len());
                    succeeded.push((user, urls));
                }
                Err(e) => {
                    error!("❌ Prediction failed for {}: {:#}", user, e);
                    failures.push(UserFailure {
                        user_id: user,
                        error: format!("{e:#}"),
                    });
                }
            }
        }

        BatchOutcome {
            rows: flatten(succeeded),
            failures,
        }
    }

    /// Resolve the strategy for one user and run it. An empty result is a
    /// valid outcome, never an error.
    pub async fn predict_user(&self, user: &str) -> Result<Vec<String>> {
        match self.resolve_strategy(user).await? {
            Strategy::Personalized { friends } => {
                info!("👤 User exists: {}, running friend-based prediction", user);
                self.with_retry("friend-popularity recommendation", user, || {
                    let store = self.store.clone();
                    let user = user.to_string();
                    let friends = friends.clone();
                    let (oldest_read, limit) = (self.opts.oldest_read, self.opts.limit);
                    async move {
                        store
                            .friend_popularity_recommend(&user, &friends, oldest_read, limit)
                            .await
                    }
                })
                .await
            }
            Strategy::ColdStart { categories: Some(categories) } => {
                info!("🧊 User {} has no history, cold start with categories {:?}", user, categories);
                let recs = self
                    .with_retry("category cold start", user, || {
                        let store = self.store.clone();
                        let categories = categories.clone();
                        let (oldest_read, limit) = (self.opts.oldest_read, self.opts.limit);
                        async move {
                            store
                                .cold_start_with_categories(oldest_read, &categories, limit)
                                .await
                        }
                    })
                    .await?;
                Ok(recs.into_iter().map(|r| r.url).collect())
            }
            Strategy::ColdStart { categories: None } => {
                info!("🧊 User {} has no history, running cold start", user);
                let recs = self
                    .with_retry("cold start", user, || {
                        let store = self.store.clone();
                        let (oldest_read, limit) = (self.opts.oldest_read, self.opts.limit);
                        async move { store.cold_start(oldest_read, limit).await }
                    })
                    .await?;
                Ok(recs.into_iter().map(|r| r.url).collect())
            }
        }
    }

    async fn resolve_strategy(&self, user: &str) -> Result<Strategy> {
        let exists = self
            .with_retry("user existence check", user, || {
                let store = self.store.clone();
                let user = user.to_string();
                async move { store.user_exists(&user).await }
            })
            .await?;

        let friends = if exists {
            self.with_retry("best-friend discovery", user, || {
                let store = self.store.clone();
                let user = user.to_string();
                let limit = self.opts.friend_limit;
                async move { store.find_best_friends(&user, limit).await }
            })
            .await?
        } else {
            Vec::new()
        };

        Ok(select_strategy(exists, friends, self.opts.categories.as_deref()))
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, user: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        retry_query(self.opts.query_attempts, what, user, op).await
    }
}

/// True when the failure originated in the store driver and a retry could
/// plausibly succeed. Mapping and contract failures are deterministic and
/// fail the same way every attempt.
fn is_transient(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| cause.downcast_ref::<neo4rs::Error>().is_some())
}

/// Retry a single store query with exponential backoff, then surface the
/// failure for this user only. Non-transient failures return immediately.
async fn retry_query<T, F, Fut>(attempts: u32, what: &str, user: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !is_transient(&e) {
                    return Err(e);
                }
                if attempt < attempts {
                    let wait_time = 2u64.pow(attempt - 1); // 1s, 2s, ... doubling per attempt
                    warn!(
                        "⚠️  {} failed for {}: {:#}. Retrying in {}s (attempt {}/{})...",
                        what, user, e, wait_time, attempt, attempts
                    );
                    sleep(Duration::from_secs(wait_time)).await;
                }
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| anyhow!("{} failed for {}", what, user)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_user_gets_the_personalized_path() {
        let friends = vec!["u2".to_string(), "u3".to_string()];
        let strategy = select_strategy(true, friends.clone(), Some(&["sport".to_string()]));
        assert_eq!(strategy, Strategy::Personalized { friends });
    }

    #[test]
    fn unknown_user_gets_cold_start_filtered_iff_categories_configured() {
        let categories = vec!["sport".to_string(), "okonomi".to_string()];
        assert_eq!(
            select_strategy(false, Vec::new(), Some(&categories)),
            Strategy::ColdStart {
                categories: Some(categories)
            }
        );
        assert_eq!(
            select_strategy(false, Vec::new(), None),
            Strategy::ColdStart { categories: None }
        );
    }

    #[test]
    fn flatten_preserves_user_and_recommendation_order() {
        let rows = flatten(vec![
            ("u1".to_string(), vec!["a3".to_string(), "a1".to_string()]),
            ("u2".to_string(), vec![]),
            ("u3".to_string(), vec!["a2".to_string()]),
        ]);

        let pairs: Vec<(&str, &str)> = rows
            .iter()
            .map(|r| (r.user_id.as_str(), r.url.as_str()))
            .collect();
        assert_eq!(pairs, vec![("u1", "a3"), ("u1", "a1"), ("u3", "a2")]);
    }

    #[test]
    fn empty_result_is_a_valid_outcome() {
        let rows = flatten(vec![("u1".to_string(), vec![])]);
        assert!(rows.is_empty());
    }

    #[test]
    fn driver_failures_are_transient_even_when_wrapped_with_context() {
        use anyhow::Context;

        let store_err: Result<(), _> = Err(neo4rs::Error::UnsupportedVersion("5".to_string()));
        let wrapped = store_err.context("Failed to run query").unwrap_err();
        assert!(is_transient(&wrapped));

        assert!(!is_transient(&anyhow!("Missing url column")));
    }

    #[tokio::test]
    async fn deterministic_failures_are_not_retried() {
        let calls = std::cell::Cell::new(0u32);
        let result: Result<()> = retry_query(3, "row mapping", "u1", || {
            calls.set(calls.get() + 1);
            async { Err(anyhow!("Missing url column")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn retry_passes_the_first_success_through() {
        let value = retry_query(3, "existence check", "u1", || async { Ok(42_i64) })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }
}
