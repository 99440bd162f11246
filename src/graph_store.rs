//! Neo4j schema and traversals
//!
//! Merge-upserts for the User–Article–Category graph and the parameterized
//! Cypher traversals behind every recommendation strategy. Each public call
//! runs inside a single explicit transaction committed on success and
//! rolled back on failure; store errors propagate to the caller unmodified,
//! with no internal retries.

use crate::error::IngestError;
use crate::event::ReadEvent;
use anyhow::{Context, Result};
use neo4rs::query;
use tracing::{info, warn};

// ============================================================================
// Cypher
// ============================================================================

// Article identity is the full {title, url, publishTime, documentId} tuple:
// two events differing in any of these fields produce distinct nodes. The
// read relationship merges on its full attribute tuple as well, so
// re-ingesting an event is idempotent while two distinct reads of the same
// article stay two relationships.
const CREATE_EVENT_QUERY: &str = "MERGE (u:User {id: $userId})
     MERGE (a:Article {title: $title, url: $url, publishTime: $publishTime, documentId: $documentId})
     MERGE (u)-[r:read {activeTime: $activeTime, eventId: $eventId, time: $time}]->(a)
     RETURN id(a) AS articleId";

// Category edges attach by documentId so that articles fragmented across
// merge-key variants still pick up their categories.
const ATTACH_CATEGORY_QUERY: &str = "MATCH (a:Article {documentId: $documentId})
     MERGE (c:Category {name: $name})
     MERGE (a)-[:has_category]->(c)";

const USER_EXISTS_QUERY: &str = "MATCH (u:User {id: $userId}) RETURN u.id AS id LIMIT 1";

// Shared-read collaborative traversal: articles read by co-readers of the
// subject user, minus anything the user already read, minus front-page
// reads, within the time window. Candidates deduplicate by url; each row
// projects the single highest-activeTime connecting read so title,
// activeTime and time always describe one real read.
pub(crate) const COLLABORATIVE_QUERY: &str =
    "MATCH (u1:User {id: $userId})-[:read]->(a:Article)<-[:read]-(u2:User)
     WHERE a.title <> 'Frontpage' AND u2.id <> $userId
     MATCH (u2)-[r3:read]->(rec:Article)
     WHERE NOT (u1)-[:read]->(rec)
       AND rec.title <> 'Frontpage'
       AND r3.time >= $oldestRead
     WITH rec, r3 ORDER BY r3.activeTime DESC, r3.time DESC
     WITH rec.url AS url, collect({title: rec.title, activeTime: r3.activeTime, time: r3.time})[0] AS best
     RETURN url, best.title AS title, best.activeTime AS activeTime, best.time AS time
     ORDER BY activeTime DESC, url ASC
     LIMIT $limit";

pub(crate) const BEST_FRIENDS_QUERY: &str =
    "MATCH (u:User {id: $userId})-[:read]->(:Article)<-[:read]-(f:User)
     WHERE f.id <> $userId
     RETURN f.id AS friend, count(*) AS shared
     ORDER BY shared DESC, friend ASC
     LIMIT $limit";

pub(crate) const FRIEND_POPULARITY_QUERY: &str =
    "MATCH (f:User)-[r:read]->(rec:Article)
     WHERE f.id IN $friendIds
       AND rec.title <> 'Frontpage'
       AND r.time >= $oldestRead
     MATCH (u:User {id: $userId})
     WHERE NOT (u)-[:read]->(rec)
     WITH rec.url AS url, max(r.activeTime) AS activeTime
     RETURN url, activeTime
     ORDER BY activeTime DESC, url ASC
     LIMIT $limit";

pub(crate) const FRIEND_NEWEST_QUERY: &str =
    "MATCH (f:User)-[:read]->(rec:Article)
     WHERE f.id IN $friendIds
       AND rec.title <> 'Frontpage'
     MATCH (u:User {id: $userId})
     WHERE NOT (u)-[:read]->(rec)
     WITH rec.url AS url, max(rec.publishTime) AS publishTime
     RETURN url, publishTime
     ORDER BY publishTime DESC, url ASC
     LIMIT $limit";

pub(crate) const COLD_START_QUERY: &str =
    "MATCH (:User)-[r:read]->(rec:Article)
     WHERE rec.title <> 'Frontpage' AND r.time >= $oldestRead
     WITH rec, r ORDER BY r.activeTime DESC, r.time DESC
     WITH rec.url AS url, collect({title: rec.title, activeTime: r.activeTime, time: r.time})[0] AS best
     RETURN url, best.title AS title, best.activeTime AS activeTime, best.time AS time
     ORDER BY activeTime DESC, url ASC
     LIMIT $limit";

pub(crate) const COLD_START_CATEGORIES_QUERY: &str =
    "MATCH (:User)-[r:read]->(rec:Article)-[:has_category]->(c:Category)
     WHERE rec.title <> 'Frontpage'
       AND r.time >= $oldestRead
       AND c.name IN $categories
     WITH rec, r ORDER BY r.activeTime DESC, r.time DESC
     WITH rec.url AS url, collect({title: rec.title, activeTime: r.activeTime, time: r.time})[0] AS best
     RETURN url, best.title AS title, best.activeTime AS activeTime, best.time AS time
     ORDER BY activeTime DESC, url ASC
     LIMIT $limit";

// ============================================================================
// Typed rows
// ============================================================================

/// One ranked candidate article from a recommendation traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recommendation {
    pub title: String,
    pub url: String,
    /// activeTime of the best connecting read, -1 if the source omitted it.
    pub active_time: i64,
    /// Epoch seconds of that same connecting read.
    pub time: i64,
}

// ============================================================================
// Store handle
// ============================================================================

#[derive(Clone)]
pub struct GraphStore {
    graph: neo4rs::Graph,
}

impl GraphStore {
    pub fn new(graph: neo4rs::Graph) -> Self {
        Self { graph }
    }

    /// Connect to Neo4j with exponential backoff retry logic
    pub async fn connect(uri: &str, user: &str, password: &str, max_retries: u32) -> Result<Self> {
        use tokio::time::{sleep, Duration};
        use tracing::error;

        for attempt in 1..=max_retries {
            info!(
                "🔄 Attempting to connect to Neo4j at {}... (attempt {}/{})",
                uri, attempt, max_retries
            );

            match neo4rs::Graph::new(uri, user, password).await {
                Ok(graph) => {
                    info!("✅ Successfully connected to Neo4j");
                    return Ok(Self::new(graph));
                }
                Err(e) => {
                    if attempt < max_retries {
                        let wait_time = 2u64.pow(attempt - 1); // 1s, 2s, 4s, 8s
                        warn!(
                            "⚠️  Failed to connect to Neo4j: {}. Retrying in {}s (attempt {}/{})...",
                            e, wait_time, attempt, max_retries
                        );
                        sleep(Duration::from_secs(wait_time)).await;
                    } else {
                        error!("❌ Failed to connect to Neo4j after {} attempts: {}", max_retries, e);
                    }
                }
            }
        }

        Err(anyhow::anyhow!(
            "Neo4j connection failed after {} retries",
            max_retries
        ))
    }

    // ========================================================================
    // Ingestion upserts
    // ========================================================================

    /// Upsert a single normalized event: one transaction covering the User,
    /// Article and read-relationship merges. Returns the article's internal
    /// id for chaining.
    pub async fn insert_event(&self, event: &ReadEvent) -> Result<i64, IngestError> {
        let mut txn = self.graph.start_txn().await?;
        let result = run_event_upsert(&mut txn, event).await;
        finish_txn(txn, result).await
    }

    /// Upsert a batch of events, one transaction per event so no long-lived
    /// transaction spans a file. A store failure aborts the batch; rerunning
    /// the file is safe because the merges are idempotent.
    pub async fn insert_events(&self, events: &[ReadEvent]) -> Result<(), IngestError> {
        for event in events {
            self.insert_event(event).await?;
        }
        info!("   Upserted {} read events", events.len());
        Ok(())
    }

    /// Attach category edges for one event's pipe-split category segments,
    /// matched by documentId, in a single transaction.
    pub async fn attach_categories(
        &self,
        document_id: &str,
        categories: &[String],
    ) -> Result<(), IngestError> {
        if categories.is_empty() {
            return Ok(());
        }

        let mut txn = self.graph.start_txn().await?;
        let result = run_category_merges(&mut txn, document_id, categories).await;
        finish_txn(txn, result).await
    }

    // ========================================================================
    // Recommendation traversals
    // ========================================================================

    /// True iff a User node with this id exists. Selects the personalized
    /// vs. cold-start path; absence is a defined branch, not an error.
    pub async fn user_exists(&self, user: &str) -> Result<bool> {
        let mut txn = self
            .graph
            .start_txn()
            .await
            .context("Failed to start transaction")?;

        let result = first_row_exists(&mut txn, query(USER_EXISTS_QUERY).param("userId", user)).await;
        finish_txn(txn, result).await
    }

    /// Articles read by co-readers of the subject user, ranked by descending
    /// activeTime of the connecting read, deduplicated by url.
    pub async fn collaborative_recommend(
        &self,
        user: &str,
        oldest_read: i64,
        limit: i64,
    ) -> Result<Vec<Recommendation>> {
        let q = query(COLLABORATIVE_QUERY)
            .param("userId", user)
            .param("oldestRead", oldest_read)
            .param("limit", limit);
        self.fetch_recommendations(q).await
    }

    /// Top co-readers of the subject user by shared-read count. Counts carry
    /// no recency or popularity weighting, a documented simplification.
    pub async fn find_best_friends(&self, user: &str, limit: i64) -> Result<Vec<String>> {
        let q = query(BEST_FRIENDS_QUERY)
            .param("userId", user)
            .param("limit", limit);
        self.fetch_column(q, "friend").await
    }

    /// Friend-anchored variant of the collaborative traversal: candidates
    /// come only from the given friend set, ranked by activeTime.
    pub async fn friend_popularity_recommend(
        &self,
        user: &str,
        friends: &[String],
        oldest_read: i64,
        limit: i64,
    ) -> Result<Vec<String>> {
        let q = query(FRIEND_POPULARITY_QUERY)
            .param("userId", user)
            .param("friendIds", friends.to_vec())
            .param("oldestRead", oldest_read)
            .param("limit", limit);
        self.fetch_column(q, "url").await
    }

    /// Recency-biased friend variant: ranked by article publish time.
    pub async fn find_newest_to_friend(
        &self,
        user: &str,
        friends: &[String],
        limit: i64,
    ) -> Result<Vec<String>> {
        let q = query(FRIEND_NEWEST_QUERY)
            .param("userId", user)
            .param("friendIds", friends.to_vec())
            .param("limit", limit);
        self.fetch_column(q, "url").await
    }

    /// Globally most-recently-actively-read non-frontpage articles within
    /// the time window, for users with no read history.
    pub async fn cold_start(&self, oldest_read: i64, limit: i64) -> Result<Vec<Recommendation>> {
        let q = query(COLD_START_QUERY)
            .param("oldestRead", oldest_read)
            .param("limit", limit);
        self.fetch_recommendations(q).await
    }

    /// Cold start restricted to articles carrying at least one of the given
    /// categories.
    pub async fn cold_start_with_categories(
        &self,
        oldest_read: i64,
        categories: &[String],
        limit: i64,
    ) -> Result<Vec<Recommendation>> {
        let q = query(COLD_START_CATEGORIES_QUERY)
            .param("oldestRead", oldest_read)
            .param("categories", categories.to_vec())
            .param("limit", limit);
        self.fetch_recommendations(q).await
    }

    // ========================================================================
    // Row mapping
    // ========================================================================

    async fn fetch_recommendations(&self, q: neo4rs::Query) -> Result<Vec<Recommendation>> {
        let mut txn = self
            .graph
            .start_txn()
            .await
            .context("Failed to start transaction")?;

        let result = collect_recommendations(&mut txn, q).await;
        finish_txn(txn, result).await
    }

    async fn fetch_column(&self, q: neo4rs::Query, column: &str) -> Result<Vec<String>> {
        let mut txn = self
            .graph
            .start_txn()
            .await
            .context("Failed to start transaction")?;

        let result = collect_column(&mut txn, q, column).await;
        finish_txn(txn, result).await
    }
}

// ============================================================================
// Transaction plumbing
// ============================================================================

/// What to do with the server-side transaction once the operation inside
/// it has finished.
#[derive(Debug, PartialEq, Eq)]
enum TxnOutcome {
    Commit,
    Rollback,
}

fn txn_outcome<T, E>(result: &Result<T, E>) -> TxnOutcome {
    match result {
        Ok(_) => TxnOutcome::Commit,
        Err(_) => TxnOutcome::Rollback,
    }
}

/// Commit on success, roll back on failure, then propagate the operation
/// result. Dropping a `Txn` without either leaves an open transaction on a
/// pooled connection.
async fn finish_txn<T, E>(txn: neo4rs::Txn, result: Result<T, E>) -> Result<T, E>
where
    E: From<neo4rs::Error> + std::fmt::Display,
{
    match txn_outcome(&result) {
        TxnOutcome::Commit => txn.commit().await?,
        TxnOutcome::Rollback => {
            if let Err(e) = &result {
                warn!("❌ Transaction failed, rolling back: {}", e);
            }
            txn.rollback().await?;
        }
    }
    result
}

async fn run_event_upsert(txn: &mut neo4rs::Txn, event: &ReadEvent) -> Result<i64, IngestError> {
    let q = query(CREATE_EVENT_QUERY)
        .param("userId", event.user_id.as_str())
        .param("title", event.title.as_str())
        .param("url", event.url.as_str())
        .param("publishTime", event.publish_time)
        .param("documentId", event.document_id.as_str())
        .param("activeTime", event.active_time)
        .param("eventId", event.event_id)
        .param("time", event.time);

    let mut rows = txn.execute(q).await?;
    let row = rows.next(txn.handle()).await?;
    Ok(match row {
        Some(row) => row.get::<i64>("articleId").unwrap_or(-1),
        None => -1,
    })
}

async fn run_category_merges(
    txn: &mut neo4rs::Txn,
    document_id: &str,
    categories: &[String],
) -> Result<(), IngestError> {
    for name in categories {
        let q = query(ATTACH_CATEGORY_QUERY)
            .param("documentId", document_id)
            .param("name", name.as_str());
        txn.run(q).await?;
    }
    Ok(())
}

async fn first_row_exists(txn: &mut neo4rs::Txn, q: neo4rs::Query) -> Result<bool> {
    let mut rows = txn.execute(q).await.context("Failed to run existence query")?;
    let exists = rows
        .next(txn.handle())
        .await
        .context("Failed to fetch existence row")?
        .is_some();
    Ok(exists)
}

async fn collect_recommendations(
    txn: &mut neo4rs::Txn,
    q: neo4rs::Query,
) -> Result<Vec<Recommendation>> {
    let mut rows = txn.execute(q).await.context("Failed to run recommendation query")?;
    let mut out = Vec::new();
    while let Some(row) = rows
        .next(txn.handle())
        .await
        .context("Failed to fetch recommendation row")?
    {
        out.push(Recommendation {
            title: row.get::<String>("title").context("Missing title column")?,
            url: row.get::<String>("url").context("Missing url column")?,
            active_time: row.get::<i64>("activeTime").context("Missing activeTime column")?,
            time: row.get::<i64>("time").context("Missing time column")?,
        });
    }
    Ok(out)
}

async fn collect_column(
    txn: &mut neo4rs::Txn,
    q: neo4rs::Query,
    column: &str,
) -> Result<Vec<String>> {
    let mut rows = txn.execute(q).await.context("Failed to run query")?;
    let mut out = Vec::new();
    while let Some(row) = rows
        .next(txn.handle())
        .await
        .context("Failed to fetch row")?
    {
        out.push(
            row.get::<String>(column)
                .with_context(|| format!("Missing {column} column"))?,
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The traversal contracts live in the Cypher text; assert the pieces a
    // live store would enforce.

    #[test]
    fn collaborative_query_excludes_already_read_and_frontpage() {
        assert!(COLLABORATIVE_QUERY.contains("NOT (u1)-[:read]->(rec)"));
        assert!(COLLABORATIVE_QUERY.contains("a.title <> 'Frontpage'"));
        assert!(COLLABORATIVE_QUERY.contains("rec.title <> 'Frontpage'"));
    }

    #[test]
    fn windowed_queries_admit_reads_at_or_after_the_cutoff() {
        for q in [COLLABORATIVE_QUERY, FRIEND_POPULARITY_QUERY, COLD_START_QUERY, COLD_START_CATEGORIES_QUERY] {
            assert!(q.contains(">= $oldestRead"), "missing window bound in: {q}");
        }
    }

    #[test]
    fn ranked_queries_break_activetime_ties_by_url() {
        for q in [COLLABORATIVE_QUERY, FRIEND_POPULARITY_QUERY, COLD_START_QUERY, COLD_START_CATEGORIES_QUERY] {
            assert!(q.contains("ORDER BY activeTime DESC, url ASC"), "non-deterministic ordering in: {q}");
        }
        assert!(FRIEND_NEWEST_QUERY.contains("ORDER BY publishTime DESC, url ASC"));
    }

    #[test]
    fn ranked_queries_deduplicate_by_url() {
        for q in [COLLABORATIVE_QUERY, FRIEND_POPULARITY_QUERY, FRIEND_NEWEST_QUERY, COLD_START_QUERY, COLD_START_CATEGORIES_QUERY] {
            assert!(q.contains("WITH rec.url AS url"), "missing url aggregation in: {q}");
        }
    }

    #[test]
    fn recommendation_rows_project_a_single_connecting_read() {
        // Independent min/max aggregates would pair a title, activeTime and
        // read-time that never co-occurred; each row must come from the one
        // best-ranked read per url.
        for q in [COLLABORATIVE_QUERY, COLD_START_QUERY, COLD_START_CATEGORIES_QUERY] {
            assert!(q.contains("collect({title:"), "missing per-url read projection in: {q}");
            assert!(q.contains(")[0] AS best"), "missing head-of-group selection in: {q}");
            assert!(!q.contains("min(rec.title)"), "synthetic title aggregate in: {q}");
        }
    }

    #[test]
    fn result_sizes_are_parameterized() {
        for q in [
            COLLABORATIVE_QUERY,
            BEST_FRIENDS_QUERY,
            FRIEND_POPULARITY_QUERY,
            FRIEND_NEWEST_QUERY,
            COLD_START_QUERY,
            COLD_START_CATEGORIES_QUERY,
        ] {
            assert!(q.contains("LIMIT $limit"), "hardcoded limit in: {q}");
        }
    }

    #[test]
    fn best_friends_query_excludes_the_subject_and_orders_deterministically() {
        assert!(BEST_FRIENDS_QUERY.contains("f.id <> $userId"));
        assert!(BEST_FRIENDS_QUERY.contains("ORDER BY shared DESC, friend ASC"));
    }

    #[test]
    fn category_cold_start_requires_category_membership() {
        assert!(COLD_START_CATEGORIES_QUERY.contains("-[:has_category]->(c:Category)"));
        assert!(COLD_START_CATEGORIES_QUERY.contains("c.name IN $categories"));
    }

    #[test]
    fn failed_operations_roll_back_instead_of_committing() {
        let ok: Result<i64, IngestError> = Ok(7);
        assert_eq!(txn_outcome(&ok), TxnOutcome::Commit);

        let err: Result<i64> = Err(anyhow::anyhow!("store timeout"));
        assert_eq!(txn_outcome(&err), TxnOutcome::Rollback);
    }
}
