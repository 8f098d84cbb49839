//! Qdrant-backed `VectorStore`.
//!
//! Compiled behind the `qdrant` cargo feature.  The client is constructed
//! once at startup and passed in; nothing here holds global state.  Range
//! filters run against the numeric `timestamp` payload field, which the
//! ingest side always writes alongside `created_at`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use tracing::debug;
use uuid::Uuid;

use qdrant_client::Qdrant;
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::vectors_output::VectorsOptions;
use qdrant_client::qdrant::{
    Condition, Filter, ListValue, PointId, PointStruct, PointsIdsList, Range,
    ScrollPointsBuilder, SetPayloadPointsBuilder, Struct, UpsertPointsBuilder,
    Value as QdrantValue,
};

use crate::error::StoreError;
use crate::store::{
    ObservationFilter, ObservationPoint, PayloadPatch, ScrollPage, VectorStore,
    observation_from_payload, observation_to_payload,
};

pub struct QdrantVectorStore {
    client: Qdrant,
    collection: String,
}

impl QdrantVectorStore {
    /// Connect to a qdrant instance.  `timeout` applies to every request so
    /// a wedged store aborts the pass instead of blocking it forever.
    pub fn connect(url: &str, collection: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = Qdrant::from_url(url)
            .timeout(timeout)
            .build()
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            collection: collection.to_string(),
        })
    }

    fn range_filter(filter: &ObservationFilter) -> Option<Filter> {
        if filter.created_after.is_none() && filter.created_before.is_none() {
            return None;
        }
        let range = Range {
            gte: filter.created_after.map(|at| at.timestamp() as f64),
            lt: filter.created_before.map(|at| at.timestamp() as f64),
            ..Default::default()
        };
        Some(Filter::must([Condition::range("timestamp", range)]))
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn upsert(&self, points: Vec<ObservationPoint>) -> Result<(), StoreError> {
        if points.is_empty() {
            return Ok(());
        }
        let count = points.len();
        let structs: Vec<PointStruct> = points
            .into_iter()
            .map(|point| {
                let payload = payload_to_qdrant(observation_to_payload(&point.observation));
                PointStruct::new(point.observation.id.to_string(), point.vector, payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, structs).wait(true))
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        debug!(count, collection = %self.collection, "observation points upserted");
        Ok(())
    }

    async fn scroll(
        &self,
        filter: &ObservationFilter,
        with_vector: bool,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<ScrollPage, StoreError> {
        let mut request = ScrollPointsBuilder::new(&self.collection)
            .limit(limit as u32)
            .with_payload(true)
            .with_vectors(with_vector);
        if let Some(range) = Self::range_filter(filter) {
            request = request.filter(range);
        }
        if let Some(cursor) = cursor {
            request = request.offset(PointId::from(cursor));
        }

        let response = self
            .client
            .scroll(request)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;

        let mut points = Vec::with_capacity(response.result.len());
        for retrieved in response.result {
            let id = point_uuid(retrieved.id.as_ref())?;
            let payload = qdrant_to_payload(&retrieved.payload);
            let observation = observation_from_payload(id, &payload)?;
            let vector = retrieved
                .vectors
                .and_then(|vectors| vectors.vectors_options)
                .map(|options| match options {
                    VectorsOptions::Vector(vector) => vector.data,
                    VectorsOptions::Vectors(_) => Vec::new(),
                })
                .unwrap_or_default();
            points.push(ObservationPoint {
                observation,
                vector,
            });
        }

        let next_cursor = response.next_page_offset.as_ref().and_then(|offset| {
            match offset.point_id_options.as_ref()? {
                qdrant_client::qdrant::point_id::PointIdOptions::Uuid(raw) => Some(raw.clone()),
                qdrant_client::qdrant::point_id::PointIdOptions::Num(num) => Some(num.to_string()),
            }
        });

        Ok(ScrollPage {
            points,
            next_cursor,
        })
    }

    async fn update_payload(&self, id: Uuid, patch: PayloadPatch) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut fields = Map::new();
        if let Some(text) = patch.text {
            fields.insert("observation".into(), JsonValue::String(text));
        }
        if let Some(count) = patch.merged_count {
            fields.insert("merged_count".into(), JsonValue::from(count));
        }
        if let Some(target) = patch.merged_into {
            fields.insert("merged_into".into(), JsonValue::String(target.to_string()));
        }
        if let Some(count) = patch.recall_count {
            fields.insert("recall_count".into(), JsonValue::from(count));
        }
        if let Some(stale) = patch.stale {
            fields.insert("stale".into(), JsonValue::Bool(stale));
        }
        if let Some(at) = patch.stale_tagged_at {
            fields.insert("stale_tagged_at".into(), JsonValue::String(at.to_rfc3339()));
        }

        let selector = PointsIdsList {
            ids: vec![PointId::from(id.to_string())],
        };
        self.client
            .set_payload(
                SetPayloadPointsBuilder::new(&self.collection, payload_to_qdrant(fields))
                    .points_selector(selector)
                    .wait(true),
            )
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(())
    }
}

// ── Value conversion ──────────────────────────────────────────────────────────

fn point_uuid(id: Option<&PointId>) -> Result<Uuid, StoreError> {
    use qdrant_client::qdrant::point_id::PointIdOptions;
    match id.and_then(|id| id.point_id_options.as_ref()) {
        Some(PointIdOptions::Uuid(raw)) => raw
            .parse()
            .map_err(|_| StoreError::Integrity(format!("non-uuid point id {raw}"))),
        Some(PointIdOptions::Num(num)) => {
            Err(StoreError::Integrity(format!("numeric point id {num}")))
        }
        None => Err(StoreError::Integrity("point without id".to_string())),
    }
}

fn payload_to_qdrant(payload: Map<String, JsonValue>) -> qdrant_client::Payload {
    let converted: std::collections::HashMap<String, QdrantValue> = payload
        .into_iter()
        .map(|(key, value)| (key, json_to_qdrant(value)))
        .collect();
    qdrant_client::Payload::from(converted)
}

fn qdrant_to_payload(
    payload: &std::collections::HashMap<String, QdrantValue>,
) -> Map<String, JsonValue> {
    payload
        .iter()
        .map(|(key, value)| (key.clone(), qdrant_to_json(value)))
        .collect()
}

fn json_to_qdrant(value: JsonValue) -> QdrantValue {
    let kind = match value {
        JsonValue::Null => Kind::NullValue(0),
        JsonValue::Bool(b) => Kind::BoolValue(b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Kind::IntegerValue(i)
            } else {
                Kind::DoubleValue(n.as_f64().unwrap_or(0.0))
            }
        }
        JsonValue::String(s) => Kind::StringValue(s),
        JsonValue::Array(items) => Kind::ListValue(ListValue {
            values: items.into_iter().map(json_to_qdrant).collect(),
        }),
        JsonValue::Object(map) => Kind::StructValue(Struct {
            fields: map
                .into_iter()
                .map(|(key, value)| (key, json_to_qdrant(value)))
                .collect(),
        }),
    };
    QdrantValue { kind: Some(kind) }
}

fn qdrant_to_json(value: &QdrantValue) -> JsonValue {
    match &value.kind {
        Some(Kind::BoolValue(b)) => JsonValue::Bool(*b),
        Some(Kind::IntegerValue(i)) => JsonValue::from(*i),
        Some(Kind::DoubleValue(d)) => JsonValue::from(*d),
        Some(Kind::StringValue(s)) => JsonValue::String(s.clone()),
        Some(Kind::ListValue(list)) => {
            JsonValue::Array(list.values.iter().map(qdrant_to_json).collect())
        }
        Some(Kind::StructValue(object)) => JsonValue::Object(
            object
                .fields
                .iter()
                .map(|(key, value)| (key.clone(), qdrant_to_json(value)))
                .collect(),
        ),
        Some(Kind::NullValue(_)) | None => JsonValue::Null,
    }
}
