//! Nightly observation-store maintenance.
//!
//! Two independent, idempotent passes, each scroll-paginated so the working
//! set stays bounded regardless of store size:
//!
//! 1. **Dedup** – pairwise cosine comparison of the day's new observations;
//!    near-duplicates are absorbed into the earliest matching keeper.
//! 2. **Staleness** – observations past the configured age that have never
//!    been recalled get an advisory `stale` tag.
//!
//! Every decision is computed before the first payload write, so a store
//! failure mid-pass leaves either untouched state or a prefix of the
//! intended writes, both of which the next run completes safely.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use curator_config::ConsolidationConfig;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::similarity::cosine_similarity;
use crate::store::{ObservationFilter, ObservationPoint, PayloadPatch, VectorStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub scanned: usize,
    pub merged: usize,
    pub tagged_stale: usize,
}

pub struct StoreMaintainer<'a> {
    store: &'a dyn VectorStore,
    page_size: usize,
    dedup_threshold: f32,
    stale_after_days: u64,
}

impl<'a> StoreMaintainer<'a> {
    pub fn new(store: &'a dyn VectorStore, config: &ConsolidationConfig) -> Self {
        Self {
            store,
            page_size: config.scroll_page_size.max(1),
            dedup_threshold: config.dedup_threshold,
            stale_after_days: config.stale_after_days,
        }
    }

    /// Run both passes for the day window `[day_start, day_end)`.
    pub async fn run(
        &self,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<MaintenanceReport, StoreError> {
        let (scanned, merged) = self.dedup_pass(day_start, day_end).await?;
        let (_, tagged_stale) = self.staleness_pass(now).await?;
        let report = MaintenanceReport {
            scanned,
            merged,
            tagged_stale,
        };
        info!(
            scanned = report.scanned,
            merged = report.merged,
            tagged_stale = report.tagged_stale,
            "maintenance pass complete"
        );
        Ok(report)
    }

    async fn scroll_all(
        &self,
        filter: ObservationFilter,
        with_vector: bool,
    ) -> Result<Vec<ObservationPoint>, StoreError> {
        let mut points = Vec::new();
        let mut cursor = None;
        loop {
            let page = self
                .store
                .scroll(&filter, with_vector, self.page_size, cursor)
                .await?;
            points.extend(page.points);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(points),
            }
        }
    }

    /// Merge near-duplicate observations created inside the window.
    ///
    /// For every pair `(i, j)` in scan order with neither point absorbed,
    /// a cosine similarity above the threshold absorbs `j` into `i`: `j` is
    /// marked terminal via `merged_into`, `i`'s `merged_count` grows by one,
    /// and `i` adopts `j`'s text when it is fresher (newer `created_at`,
    /// ties broken by longer text).  O(n²) over one day's batch, which stays
    /// small; a larger deployment would bucket by approximate neighbours
    /// first.
    ///
    /// Returns `(scanned, merged)`.
    pub async fn dedup_pass(
        &self,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
    ) -> Result<(usize, usize), StoreError> {
        let filter = ObservationFilter {
            created_after: Some(day_start),
            created_before: Some(day_end),
        };
        let points = self.scroll_all(filter, true).await?;
        let scanned = points.len();

        // Decision phase: no writes until every pair has been examined.
        let mut absorbed: HashSet<Uuid> = points
            .iter()
            .filter(|point| point.observation.is_absorbed())
            .map(|point| point.observation.id)
            .collect();
        let mut keepers: HashMap<Uuid, KeeperState> = HashMap::new();
        let mut merges: Vec<(Uuid, Uuid)> = Vec::new();

        for i in 0..points.len() {
            let keeper_id = points[i].observation.id;
            if absorbed.contains(&keeper_id) {
                continue;
            }
            for j in (i + 1)..points.len() {
                let candidate = &points[j];
                if absorbed.contains(&candidate.observation.id) {
                    continue;
                }
                let sim = cosine_similarity(&points[i].vector, &candidate.vector);
                if sim <= self.dedup_threshold {
                    continue;
                }

                debug!(
                    keeper = %keeper_id,
                    duplicate = %candidate.observation.id,
                    sim,
                    "absorbing near-duplicate observation"
                );
                absorbed.insert(candidate.observation.id);
                merges.push((candidate.observation.id, keeper_id));

                let state = keepers
                    .entry(keeper_id)
                    .or_insert_with(|| KeeperState::new(&points[i].observation));
                state.merged_count += 1;
                state.adopt_if_fresher(&candidate.observation);
            }
        }

        // Write phase.
        for (duplicate, keeper) in &merges {
            self.store
                .update_payload(
                    *duplicate,
                    PayloadPatch {
                        merged_into: Some(*keeper),
                        ..Default::default()
                    },
                )
                .await?;
        }
        for (keeper_id, state) in &keepers {
            self.store
                .update_payload(
                    *keeper_id,
                    PayloadPatch {
                        merged_count: Some(state.merged_count),
                        text: state.text_changed.then(|| state.text.clone()),
                        ..Default::default()
                    },
                )
                .await?;
        }

        Ok((scanned, merges.len()))
    }

    /// Tag observations older than the staleness window that have never been
    /// recalled.  Advisory only: nothing is deleted, and already-tagged
    /// points are left alone so re-runs change nothing.
    ///
    /// Returns `(scanned, tagged)`.
    pub async fn staleness_pass(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize), StoreError> {
        let cutoff = now - Duration::days(self.stale_after_days as i64);
        let filter = ObservationFilter {
            created_after: None,
            created_before: Some(cutoff),
        };
        let points = self.scroll_all(filter, false).await?;
        let scanned = points.len();

        let to_tag: Vec<Uuid> = points
            .iter()
            .filter(|point| !point.observation.stale && point.observation.never_recalled())
            .map(|point| point.observation.id)
            .collect();

        for id in &to_tag {
            self.store
                .update_payload(
                    *id,
                    PayloadPatch {
                        stale: Some(true),
                        stale_tagged_at: Some(now),
                        ..Default::default()
                    },
                )
                .await?;
        }

        Ok((scanned, to_tag.len()))
    }
}

/// Running state for a keeper while the decision phase accumulates merges.
struct KeeperState {
    merged_count: u32,
    text: String,
    text_created_at: DateTime<Utc>,
    text_changed: bool,
}

impl KeeperState {
    fn new(observation: &crate::schema::Observation) -> Self {
        Self {
            merged_count: observation.merged_count,
            text: observation.text.clone(),
            text_created_at: observation.created_at,
            text_changed: false,
        }
    }

    /// Replace the keeper's text when the duplicate's is fresher: created
    /// later, or created at the same instant but longer.
    fn adopt_if_fresher(&mut self, duplicate: &crate::schema::Observation) {
        let fresher = duplicate.created_at > self.text_created_at
            || (duplicate.created_at == self.text_created_at
                && duplicate.text.chars().count() > self.text.chars().count());
        if fresher {
            self.text = duplicate.text.clone();
            self.text_created_at = duplicate.created_at;
            self.text_changed = true;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use curator_config::ConsolidationConfig;

    use super::{MaintenanceReport, StoreMaintainer};
    use crate::schema::Observation;
    use crate::store::{MemoryVectorStore, ObservationPoint, PayloadPatch, VectorStore};

    fn point_at(
        session: &str,
        text: &str,
        created_at: chrono::DateTime<Utc>,
        vector: Vec<f32>,
    ) -> ObservationPoint {
        ObservationPoint {
            observation: Observation::new(session, text, "fact", created_at),
            vector,
        }
    }

    fn config() -> ConsolidationConfig {
        ConsolidationConfig {
            scroll_page_size: 2, // small pages to exercise the cursor loop
            ..Default::default()
        }
    }

    fn day_window() -> (chrono::DateTime<Utc>, chrono::DateTime<Utc>) {
        let start = Utc.with_ymd_and_hms(2026, 1, 7, 0, 0, 0).unwrap();
        (start, start + Duration::days(1))
    }

    #[tokio::test]
    async fn near_duplicates_merge_and_keeper_adopts_fresher_text() {
        let store = MemoryVectorStore::new();
        let (day_start, day_end) = day_window();
        let older = point_at("s1", "deploy failed", day_start + Duration::hours(1), vec![1.0, 0.0, 0.0]);
        let newer = point_at(
            "s2",
            "deploy failed on the canary stage",
            day_start + Duration::hours(5),
            vec![0.99, 0.1, 0.0],
        );
        let keeper_id = older.observation.id;
        let dup_id = newer.observation.id;
        store.upsert(vec![older, newer]).await.unwrap();

        let maintainer = StoreMaintainer::new(&store, &config());
        let (scanned, merged) = maintainer.dedup_pass(day_start, day_end).await.unwrap();
        assert_eq!(scanned, 2);
        assert_eq!(merged, 1);

        let keeper = store.get(keeper_id).await.unwrap();
        assert_eq!(keeper.merged_count, 1);
        assert_eq!(keeper.text, "deploy failed on the canary stage");
        assert!(keeper.merged_into.is_none());

        let duplicate = store.get(dup_id).await.unwrap();
        assert_eq!(duplicate.merged_into, Some(keeper_id));
        assert_eq!(duplicate.text, "deploy failed on the canary stage");
    }

    #[tokio::test]
    async fn created_at_tie_prefers_longer_text() {
        let store = MemoryVectorStore::new();
        let (day_start, day_end) = day_window();
        let at = day_start + Duration::hours(2);
        let a = point_at("s1", "short note", at, vec![1.0, 0.0, 0.0]);
        let b = point_at("s2", "short note with more detail", at, vec![1.0, 0.01, 0.0]);
        // Scan order within an identical timestamp is by id.
        let keeper_id = a.observation.id.min(b.observation.id);
        store.upsert(vec![a, b]).await.unwrap();

        let maintainer = StoreMaintainer::new(&store, &config());
        maintainer.dedup_pass(day_start, day_end).await.unwrap();

        // Whichever point scanned first, the surviving text is the longer one.
        let keeper = store.get(keeper_id).await.unwrap();
        assert_eq!(keeper.merged_count, 1);
        assert_eq!(keeper.text, "short note with more detail");
    }

    #[tokio::test]
    async fn dissimilar_observations_are_not_merged() {
        let store = MemoryVectorStore::new();
        let (day_start, day_end) = day_window();
        store
            .upsert(vec![
                point_at("s1", "queue restarted", day_start + Duration::hours(1), vec![1.0, 0.0, 0.0]),
                point_at("s2", "user renamed project", day_start + Duration::hours(2), vec![0.0, 1.0, 0.0]),
            ])
            .await
            .unwrap();

        let maintainer = StoreMaintainer::new(&store, &config());
        let (_, merged) = maintainer.dedup_pass(day_start, day_end).await.unwrap();
        assert_eq!(merged, 0);
    }

    #[tokio::test]
    async fn zero_norm_vectors_never_merge() {
        let store = MemoryVectorStore::new();
        let (day_start, day_end) = day_window();
        store
            .upsert(vec![
                point_at("s1", "a", day_start + Duration::hours(1), vec![0.0, 0.0, 0.0]),
                point_at("s2", "b", day_start + Duration::hours(2), vec![0.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let maintainer = StoreMaintainer::new(&store, &config());
        let (_, merged) = maintainer.dedup_pass(day_start, day_end).await.unwrap();
        assert_eq!(merged, 0);
    }

    #[tokio::test]
    async fn one_keeper_absorbs_a_whole_cluster() {
        let store = MemoryVectorStore::new();
        let (day_start, day_end) = day_window();
        let first = point_at("s1", "cache keys", day_start + Duration::hours(1), vec![1.0, 0.0, 0.0]);
        let keeper_id = first.observation.id;
        store
            .upsert(vec![
                first,
                point_at("s2", "cache keys v2", day_start + Duration::hours(2), vec![0.99, 0.05, 0.0]),
                point_at("s3", "cache keys v3", day_start + Duration::hours(3), vec![0.98, 0.08, 0.0]),
            ])
            .await
            .unwrap();

        let maintainer = StoreMaintainer::new(&store, &config());
        let (_, merged) = maintainer.dedup_pass(day_start, day_end).await.unwrap();
        assert_eq!(merged, 2);
        let keeper = store.get(keeper_id).await.unwrap();
        assert_eq!(keeper.merged_count, 2);
        assert_eq!(keeper.text, "cache keys v3");
    }

    #[tokio::test]
    async fn observations_outside_the_window_are_ignored() {
        let store = MemoryVectorStore::new();
        let (day_start, day_end) = day_window();
        store
            .upsert(vec![
                point_at("s1", "yesterday fact", day_start - Duration::hours(3), vec![1.0, 0.0, 0.0]),
                point_at("s2", "yesterday fact again", day_start - Duration::hours(2), vec![1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let maintainer = StoreMaintainer::new(&store, &config());
        let (scanned, merged) = maintainer.dedup_pass(day_start, day_end).await.unwrap();
        assert_eq!(scanned, 0);
        assert_eq!(merged, 0);
    }

    #[tokio::test]
    async fn maintenance_is_idempotent_on_unchanged_data() {
        let store = MemoryVectorStore::new();
        let (day_start, day_end) = day_window();
        let now = day_end;
        store
            .upsert(vec![
                point_at("s1", "dup a", day_start + Duration::hours(1), vec![1.0, 0.0, 0.0]),
                point_at("s2", "dup b", day_start + Duration::hours(2), vec![0.99, 0.1, 0.0]),
                // Old and never recalled: stale candidate.
                point_at("s3", "ancient fact", day_start - Duration::days(60), vec![0.0, 1.0, 0.0]),
            ])
            .await
            .unwrap();

        let maintainer = StoreMaintainer::new(&store, &config());
        let first = maintainer.run(day_start, day_end, now).await.unwrap();
        assert_eq!(first.merged, 1);
        assert_eq!(first.tagged_stale, 1);

        let second = maintainer.run(day_start, day_end, now).await.unwrap();
        assert_eq!(
            second,
            MaintenanceReport {
                scanned: first.scanned,
                merged: 0,
                tagged_stale: 0
            }
        );
    }

    #[tokio::test]
    async fn staleness_skips_recalled_and_recent_observations() {
        let store = MemoryVectorStore::new();
        let now = Utc.with_ymd_and_hms(2026, 1, 7, 0, 0, 0).unwrap();
        let old = point_at("s1", "old unrecalled", now - Duration::days(45), vec![1.0, 0.0, 0.0]);
        let old_id = old.observation.id;
        let recalled = point_at("s2", "old but recalled", now - Duration::days(45), vec![0.0, 1.0, 0.0]);
        let recalled_id = recalled.observation.id;
        let recent = point_at("s3", "recent", now - Duration::days(2), vec![0.0, 0.0, 1.0]);
        let recent_id = recent.observation.id;
        store.upsert(vec![old, recalled, recent]).await.unwrap();
        store
            .update_payload(
                recalled_id,
                PayloadPatch {
                    recall_count: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let maintainer = StoreMaintainer::new(&store, &config());
        let (_, tagged) = maintainer.staleness_pass(now).await.unwrap();
        assert_eq!(tagged, 1);

        assert!(store.get(old_id).await.unwrap().stale);
        assert!(store.get(old_id).await.unwrap().stale_tagged_at.is_some());
        assert!(!store.get(recalled_id).await.unwrap().stale);
        assert!(!store.get(recent_id).await.unwrap().stale);
    }

    #[tokio::test]
    async fn absorbed_points_are_terminal_across_passes() {
        let store = MemoryVectorStore::new();
        let (day_start, day_end) = day_window();
        let a = point_at("s1", "first", day_start + Duration::hours(1), vec![1.0, 0.0, 0.0]);
        let b = point_at("s2", "second", day_start + Duration::hours(2), vec![0.99, 0.1, 0.0]);
        let a_id = a.observation.id;
        let b_id = b.observation.id;
        store.upsert(vec![a, b]).await.unwrap();

        let maintainer = StoreMaintainer::new(&store, &config());
        maintainer.dedup_pass(day_start, day_end).await.unwrap();
        assert_eq!(store.get(b_id).await.unwrap().merged_into, Some(a_id));

        // A later arrival similar to the absorbed point must pair with the
        // keeper, never with the absorbed point.
        let c = point_at("s3", "third", day_start + Duration::hours(3), vec![0.98, 0.12, 0.0]);
        let c_id = c.observation.id;
        store.upsert(vec![c]).await.unwrap();
        maintainer.dedup_pass(day_start, day_end).await.unwrap();

        assert_eq!(store.get(c_id).await.unwrap().merged_into, Some(a_id));
        assert_eq!(store.get(a_id).await.unwrap().merged_count, 2);
    }
}
