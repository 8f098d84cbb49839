//! Observation vector store.
//!
//! The pipeline treats the store as a service exposing three operations:
//! idempotent `upsert`, cursor-based `scroll`, and partial `update_payload`.
//! `MemoryVectorStore` is the in-process implementation used by tests and
//! local development; the qdrant backend lives behind the `qdrant` cargo
//! feature.  Both go through the same explicit payload adapters so no
//! business logic ever sniffs record shapes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::schema::Observation;

#[cfg(feature = "qdrant")]
pub mod qdrant;

// ── Points and filters ────────────────────────────────────────────────────────

/// One stored point: the observation payload plus its embedding vector.
#[derive(Debug, Clone)]
pub struct ObservationPoint {
    pub observation: Observation,
    pub vector: Vec<f32>,
}

/// Time-window filter for scrolls.  Bounds are half-open:
/// `created_after <= created_at < created_before`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObservationFilter {
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl ObservationFilter {
    pub fn matches(&self, created_at: DateTime<Utc>) -> bool {
        if let Some(after) = self.created_after {
            if created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if created_at >= before {
                return false;
            }
        }
        true
    }
}

/// One page of a scroll.  `next_cursor` is `None` on the final page.
#[derive(Debug, Clone)]
pub struct ScrollPage {
    pub points: Vec<ObservationPoint>,
    pub next_cursor: Option<String>,
}

/// Partial payload update.  Only the fields set here are written; everything
/// else on the point is left untouched.
#[derive(Debug, Clone, Default)]
pub struct PayloadPatch {
    pub text: Option<String>,
    pub merged_count: Option<u32>,
    pub merged_into: Option<Uuid>,
    pub recall_count: Option<u32>,
    pub stale: Option<bool>,
    pub stale_tagged_at: Option<DateTime<Utc>>,
}

impl PayloadPatch {
    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.merged_count.is_none()
            && self.merged_into.is_none()
            && self.recall_count.is_none()
            && self.stale.is_none()
            && self.stale_tagged_at.is_none()
    }

    /// Apply the patch to an in-memory observation.
    pub fn apply(&self, observation: &mut Observation) {
        if let Some(text) = &self.text {
            observation.text = text.clone();
        }
        if let Some(count) = self.merged_count {
            observation.merged_count = count;
        }
        if let Some(target) = self.merged_into {
            observation.merged_into = Some(target);
        }
        if let Some(count) = self.recall_count {
            observation.recall_count = Some(count);
        }
        if let Some(stale) = self.stale {
            observation.stale = stale;
        }
        if let Some(at) = self.stale_tagged_at {
            observation.stale_tagged_at = Some(at);
        }
    }
}

// ── Store trait ───────────────────────────────────────────────────────────────

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace points by id.  Safe to retry: the derived point ids
    /// make re-submission overwrite rather than duplicate.
    async fn upsert(&self, points: Vec<ObservationPoint>) -> Result<(), StoreError>;

    /// Fetch one page of points matching `filter`, resuming from `cursor`.
    async fn scroll(
        &self,
        filter: &ObservationFilter,
        with_vector: bool,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<ScrollPage, StoreError>;

    /// Partially update one point's payload.
    async fn update_payload(&self, id: Uuid, patch: PayloadPatch) -> Result<(), StoreError>;
}

// ── Payload adapters ──────────────────────────────────────────────────────────

/// Serialize an observation into the wire payload.  `timestamp` (epoch
/// seconds) is written alongside the RFC 3339 `created_at` because the range
/// filters in the store index the numeric field.
pub fn observation_to_payload(observation: &Observation) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("observation".into(), json!(observation.text));
    payload.insert("session_id".into(), json!(observation.session_id));
    payload.insert("observation_type".into(), json!(observation.observation_type));
    payload.insert("timestamp".into(), json!(observation.created_at.timestamp()));
    payload.insert("created_at".into(), json!(observation.created_at.to_rfc3339()));
    if let Some(count) = observation.recall_count {
        payload.insert("recall_count".into(), json!(count));
    }
    if observation.merged_count > 0 {
        payload.insert("merged_count".into(), json!(observation.merged_count));
    }
    if observation.stale {
        payload.insert("stale".into(), json!(true));
    }
    if let Some(at) = observation.stale_tagged_at {
        payload.insert("stale_tagged_at".into(), json!(at.to_rfc3339()));
    }
    if let Some(target) = observation.merged_into {
        payload.insert("merged_into".into(), json!(target.to_string()));
    }
    payload
}

/// Deserialize an observation from the wire payload.  `created_at` prefers
/// the RFC 3339 field and falls back to the numeric `timestamp` written by
/// older ingesters.
pub fn observation_from_payload(
    id: Uuid,
    payload: &Map<String, Value>,
) -> Result<Observation, StoreError> {
    let text = payload
        .get("observation")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Integrity(format!("point {id} has no observation text")))?
        .to_string();

    let created_at = payload
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            payload
                .get("timestamp")
                .and_then(Value::as_i64)
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
        })
        .ok_or_else(|| StoreError::Integrity(format!("point {id} has no usable timestamp")))?;

    Ok(Observation {
        id,
        session_id: payload
            .get("session_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        text,
        observation_type: payload
            .get("observation_type")
            .and_then(Value::as_str)
            .unwrap_or("fact")
            .to_string(),
        created_at,
        recall_count: payload
            .get("recall_count")
            .and_then(Value::as_u64)
            .map(|count| count as u32),
        merged_count: payload
            .get("merged_count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        stale: payload.get("stale").and_then(Value::as_bool).unwrap_or(false),
        stale_tagged_at: payload
            .get("stale_tagged_at")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        merged_into: payload
            .get("merged_into")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok()),
    })
}

/// Bump an observation's recall counter after retrieval has surfaced it.
/// Staleness tagging keys off this counter, so a recalled observation stops
/// being a staleness candidate.
pub async fn record_recall(
    store: &dyn VectorStore,
    observation: &Observation,
) -> Result<(), StoreError> {
    store
        .update_payload(
            observation.id,
            PayloadPatch {
                recall_count: Some(observation.recall_count.unwrap_or(0) + 1),
                ..Default::default()
            },
        )
        .await
}

// ── In-process store ──────────────────────────────────────────────────────────

/// In-process `VectorStore` holding points in a mutex-guarded vec, ordered by
/// `(created_at, id)` so scroll cursors are stable between pages.
#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    points: Mutex<Vec<ObservationPoint>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.points.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.points.lock().await.is_empty()
    }

    pub async fn get(&self, id: Uuid) -> Option<Observation> {
        self.points
            .lock()
            .await
            .iter()
            .find(|point| point.observation.id == id)
            .map(|point| point.observation.clone())
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, new_points: Vec<ObservationPoint>) -> Result<(), StoreError> {
        let mut points = self.points.lock().await;
        for incoming in new_points {
            match points
                .iter_mut()
                .find(|point| point.observation.id == incoming.observation.id)
            {
                Some(existing) => *existing = incoming,
                None => points.push(incoming),
            }
        }
        points.sort_by(|left, right| {
            (left.observation.created_at, left.observation.id)
                .cmp(&(right.observation.created_at, right.observation.id))
        });
        Ok(())
    }

    async fn scroll(
        &self,
        filter: &ObservationFilter,
        with_vector: bool,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<ScrollPage, StoreError> {
        let offset: usize = match cursor {
            Some(raw) => raw
                .parse()
                .map_err(|_| StoreError::Integrity(format!("bad scroll cursor: {raw}")))?,
            None => 0,
        };

        let points = self.points.lock().await;
        let matching: Vec<&ObservationPoint> = points
            .iter()
            .filter(|point| filter.matches(point.observation.created_at))
            .collect();

        let page: Vec<ObservationPoint> = matching
            .iter()
            .skip(offset)
            .take(limit)
            .map(|point| ObservationPoint {
                observation: point.observation.clone(),
                vector: if with_vector { point.vector.clone() } else { Vec::new() },
            })
            .collect();

        let consumed = offset + page.len();
        let next_cursor = (consumed < matching.len()).then(|| consumed.to_string());

        Ok(ScrollPage {
            points: page,
            next_cursor,
        })
    }

    async fn update_payload(&self, id: Uuid, patch: PayloadPatch) -> Result<(), StoreError> {
        let mut points = self.points.lock().await;
        let point = points
            .iter_mut()
            .find(|point| point.observation.id == id)
            .ok_or_else(|| StoreError::Integrity(format!("no point with id {id}")))?;
        patch.apply(&mut point.observation);
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{
        MemoryVectorStore, ObservationFilter, ObservationPoint, PayloadPatch, VectorStore,
        observation_from_payload, observation_to_payload,
    };
    use crate::schema::Observation;

    fn point(session: &str, text: &str, age_hours: i64) -> ObservationPoint {
        ObservationPoint {
            observation: Observation::new(
                session,
                text,
                "fact",
                Utc::now() - Duration::hours(age_hours),
            ),
            vector: vec![1.0, 0.0, 0.0],
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_derived_id() {
        let store = MemoryVectorStore::new();
        store.upsert(vec![point("s1", "same fact", 1)]).await.unwrap();
        store.upsert(vec![point("s1", "same fact", 1)]).await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn scroll_paginates_until_cursor_is_exhausted() {
        let store = MemoryVectorStore::new();
        let points: Vec<_> = (0..7)
            .map(|i| point("s1", &format!("fact number {i}"), i))
            .collect();
        store.upsert(points).await.unwrap();

        let mut seen = 0usize;
        let mut cursor = None;
        let mut pages = 0usize;
        loop {
            let page = store
                .scroll(&ObservationFilter::default(), false, 3, cursor)
                .await
                .unwrap();
            seen += page.points.len();
            pages += 1;
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, 7);
        assert_eq!(pages, 3);
    }

    #[tokio::test]
    async fn scroll_filter_bounds_are_half_open() {
        let store = MemoryVectorStore::new();
        let now = Utc::now();
        store
            .upsert(vec![point("s1", "old", 48), point("s1", "new", 1)])
            .await
            .unwrap();

        let filter = ObservationFilter {
            created_after: Some(now - Duration::hours(24)),
            created_before: None,
        };
        let page = store.scroll(&filter, false, 10, None).await.unwrap();
        assert_eq!(page.points.len(), 1);
        assert_eq!(page.points[0].observation.text, "new");
    }

    #[tokio::test]
    async fn scroll_without_vectors_returns_empty_vectors() {
        let store = MemoryVectorStore::new();
        store.upsert(vec![point("s1", "fact", 1)]).await.unwrap();
        let page = store
            .scroll(&ObservationFilter::default(), false, 10, None)
            .await
            .unwrap();
        assert!(page.points[0].vector.is_empty());
    }

    #[tokio::test]
    async fn update_payload_patches_only_given_fields() {
        let store = MemoryVectorStore::new();
        let p = point("s1", "original text", 1);
        let id = p.observation.id;
        store.upsert(vec![p]).await.unwrap();

        store
            .update_payload(
                id,
                PayloadPatch {
                    merged_count: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let updated = store.get(id).await.unwrap();
        assert_eq!(updated.merged_count, 2);
        assert_eq!(updated.text, "original text");
        assert!(!updated.stale);
    }

    #[tokio::test]
    async fn record_recall_increments_from_unset_and_existing_counts() {
        let store = MemoryVectorStore::new();
        let p = point("s1", "recalled fact", 1);
        let id = p.observation.id;
        store.upsert(vec![p]).await.unwrap();

        let observation = store.get(id).await.unwrap();
        super::record_recall(&store, &observation).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().recall_count, Some(1));

        let observation = store.get(id).await.unwrap();
        super::record_recall(&store, &observation).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().recall_count, Some(2));
    }

    #[test]
    fn payload_round_trip_preserves_fields() {
        let mut observation = Observation::new("s9", "queue drained nightly", "decision", Utc::now());
        observation.recall_count = Some(4);
        observation.merged_count = 2;
        observation.stale = true;
        observation.stale_tagged_at = Some(observation.created_at);

        let payload = observation_to_payload(&observation);
        let back = observation_from_payload(observation.id, &payload).unwrap();
        assert_eq!(back.text, observation.text);
        assert_eq!(back.session_id, "s9");
        assert_eq!(back.recall_count, Some(4));
        assert_eq!(back.merged_count, 2);
        assert!(back.stale);
        // RFC 3339 keeps sub-second precision, so timestamps agree to the second.
        assert_eq!(back.created_at.timestamp(), observation.created_at.timestamp());
    }

    #[test]
    fn payload_without_text_is_an_integrity_error() {
        let payload = serde_json::Map::new();
        let err = observation_from_payload(uuid::Uuid::new_v4(), &payload).unwrap_err();
        assert!(matches!(err, crate::error::StoreError::Integrity(_)));
    }

    #[test]
    fn payload_falls_back_to_numeric_timestamp() {
        let mut payload = serde_json::Map::new();
        payload.insert("observation".into(), serde_json::json!("legacy point"));
        payload.insert("timestamp".into(), serde_json::json!(1_700_000_000));
        let observation = observation_from_payload(uuid::Uuid::new_v4(), &payload).unwrap();
        assert_eq!(observation.created_at.timestamp(), 1_700_000_000);
    }
}
