//! Semantic cache of previously validated question/answer pairs.
//!
//! Checked before any retrieval: a strong-enough match on a trusted entry
//! answers the request outright, bypassing retrieval and generation.

use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::core::errors::ApiError;

#[derive(Debug, Clone)]
pub struct QaMemoryEntry {
    pub id: i64,
    pub question: String,
    pub answer: String,
    pub trust_score: i64,
    pub is_expert_faq: bool,
    pub file_ids: Vec<String>,
}

impl QaMemoryEntry {
    /// Usability gate: expert-curated entries are always served; everything
    /// else needs enough reuse behind it.
    pub fn usable(&self, trust_floor: i64) -> bool {
        self.is_expert_faq || self.trust_score >= trust_floor
    }
}

#[derive(Debug, Clone)]
pub struct QaMemoryHit {
    pub entry: QaMemoryEntry,
    pub similarity: f64,
}

#[derive(Clone)]
pub struct QaMemoryStore {
    pool: SqlitePool,
}

impl QaMemoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), ApiError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS qa_memory (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                question TEXT NOT NULL,
                answer TEXT NOT NULL,
                embedding BLOB NOT NULL,
                org_id TEXT NOT NULL,
                project_id TEXT,
                trust_score INTEGER NOT NULL DEFAULT 0,
                is_expert_faq INTEGER NOT NULL DEFAULT 0,
                file_ids TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_qa_memory_org ON qa_memory(org_id)")
            .execute(&self.pool)
            .await
            .map_err(ApiError::internal)?;

        Ok(())
    }

    /// Best match at or above `threshold` within the tenant scope, or None.
    pub async fn best_match(
        &self,
        query_embedding: &[f32],
        org_id: &str,
        project_id: Option<&str>,
        threshold: f64,
        limit: i64,
    ) -> Result<Option<QaMemoryHit>, ApiError> {
        let rows = sqlx::query(
            "SELECT id, question, answer, embedding, trust_score, is_expert_faq, file_ids
             FROM qa_memory
             WHERE org_id = ?1 AND (project_id IS NULL OR project_id = ?2)",
        )
        .bind(org_id)
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        let mut hits: Vec<QaMemoryHit> = Vec::new();
        for row in rows {
            let embedding: Vec<u8> = row.try_get("embedding").map_err(ApiError::internal)?;
            let stored = deserialize_embedding(&embedding);
            let similarity = cosine_similarity(query_embedding, &stored);
            if similarity < threshold {
                continue;
            }
            let file_ids: Vec<String> = row
                .try_get::<String, _>("file_ids")
                .ok()
                .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
                .and_then(|v| {
                    v.as_array().map(|arr| {
                        arr.iter()
                            .filter_map(|x| x.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                })
                .unwrap_or_default();

            hits.push(QaMemoryHit {
                entry: QaMemoryEntry {
                    id: row.try_get("id").map_err(ApiError::internal)?,
                    question: row.try_get("question").unwrap_or_default(),
                    answer: row.try_get("answer").unwrap_or_default(),
                    trust_score: row.try_get("trust_score").unwrap_or(0),
                    is_expert_faq: row.try_get::<i64, _>("is_expert_faq").unwrap_or(0) != 0,
                    file_ids,
                },
                similarity,
            });
        }

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit.max(1) as usize);

        Ok(hits.into_iter().next())
    }

    /// Bump the trust score after a served reuse. Best-effort at call sites.
    pub async fn record_use(&self, id: i64) -> Result<(), ApiError> {
        sqlx::query("UPDATE qa_memory SET trust_score = trust_score + 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(ApiError::internal)?;
        Ok(())
    }

    /// Entries are written by the external curation flow; the pipeline
    /// only reads and bumps trust.
    #[allow(dead_code)]
    pub async fn insert(
        &self,
        question: &str,
        answer: &str,
        embedding: &[f32],
        org_id: &str,
        project_id: Option<&str>,
        trust_score: i64,
        is_expert_faq: bool,
        file_ids: &[String],
    ) -> Result<i64, ApiError> {
        let result = sqlx::query(
            "INSERT INTO qa_memory
                 (question, answer, embedding, org_id, project_id, trust_score, is_expert_faq, file_ids)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(question)
        .bind(answer)
        .bind(serialize_embedding(embedding))
        .bind(org_id)
        .bind(project_id)
        .bind(trust_score)
        .bind(is_expert_faq as i64)
        .bind(serde_json::to_string(file_ids).map_err(ApiError::internal)?)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;
        Ok(result.last_insert_rowid())
    }
}

fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> QaMemoryStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = QaMemoryStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn best_match_scopes_by_org() {
        let store = test_store().await;
        let embedding = vec![1.0, 0.0, 0.0];
        store
            .insert("q", "a", &embedding, "org-1", None, 5, false, &[])
            .await
            .unwrap();

        let hit = store
            .best_match(&embedding, "org-2", None, 0.9, 3)
            .await
            .unwrap();
        assert!(hit.is_none());

        let hit = store
            .best_match(&embedding, "org-1", None, 0.9, 3)
            .await
            .unwrap();
        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn best_match_takes_highest_similarity() {
        let store = test_store().await;
        store
            .insert("close", "a1", &[1.0, 0.0, 0.1], "org-1", None, 5, false, &[])
            .await
            .unwrap();
        store
            .insert("closer", "a2", &[1.0, 0.0, 0.0], "org-1", None, 5, false, &[])
            .await
            .unwrap();

        let hit = store
            .best_match(&[1.0, 0.0, 0.0], "org-1", None, 0.5, 3)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.entry.answer, "a2");
    }

    #[tokio::test]
    async fn record_use_increments_trust() {
        let store = test_store().await;
        let id = store
            .insert("q", "a", &[1.0, 0.0], "org-1", None, 0, false, &[])
            .await
            .unwrap();
        store.record_use(id).await.unwrap();
        store.record_use(id).await.unwrap();

        let hit = store
            .best_match(&[1.0, 0.0], "org-1", None, 0.9, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.entry.trust_score, 2);
    }

    #[test]
    fn usability_gate() {
        let mut entry = QaMemoryEntry {
            id: 1,
            question: "q".to_string(),
            answer: "a".to_string(),
            trust_score: 2,
            is_expert_faq: false,
            file_ids: vec![],
        };
        assert!(!entry.usable(3));
        entry.trust_score = 3;
        assert!(entry.usable(3));
        entry.trust_score = 0;
        entry.is_expert_faq = true;
        assert!(entry.usable(3));
    }
}
