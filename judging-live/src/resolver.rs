//! Track configuration resolver
//!
//! Loads each track's criteria once and caches them for the lifetime of the
//! event's aggregation runtime. Actors receive an `Arc<TrackConfig>` and
//! never touch the cache again.
//!
//! Track ids the store does not know are remembered too, so a stream of
//! scores for a missing track is answered without a store round trip until
//! the recheck interval passes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::store::ScoreStore;
use judging_common::TrackConfig;

type CacheKey = (String, String);

/// How long a missing track id is answered from cache
pub const UNKNOWN_TRACK_RECHECK: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Cache {
    configs: HashMap<CacheKey, Arc<TrackConfig>>,
    unknown: HashMap<CacheKey, Instant>,
}

/// Resolves `(event_id, track_id)` to a normalized [`TrackConfig`]
pub struct TrackConfigResolver {
    store: Arc<dyn ScoreStore>,
    cache: Mutex<Cache>,
    unknown_recheck: Duration,
}

impl TrackConfigResolver {
    pub fn new(store: Arc<dyn ScoreStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(Cache::default()),
            unknown_recheck: UNKNOWN_TRACK_RECHECK,
        }
    }

    pub fn with_unknown_recheck(mut self, recheck: Duration) -> Self {
        self.unknown_recheck = recheck;
        self
    }

    /// Resolve a track's config, loading it on first use
    ///
    /// A track without scoring config resolves to the default template;
    /// only a track id unknown to the event is `ConfigNotFound`.
    pub async fn resolve(&self, event_id: &str, track_id: &str) -> Result<Arc<TrackConfig>> {
        let key = (event_id.to_string(), track_id.to_string());
        let not_found = || Error::ConfigNotFound {
            event_id: event_id.to_string(),
            track_id: track_id.to_string(),
        };

        {
            let cache = self.lock();
            if let Some(config) = cache.configs.get(&key) {
                return Ok(config.clone());
            }
            if let Some(seen) = cache.unknown.get(&key) {
                if seen.elapsed() < self.unknown_recheck {
                    return Err(not_found());
                }
            }
        }

        let Some(definition) = self.store.get_track_config(event_id, track_id).await? else {
            self.lock().unknown.insert(key, Instant::now());
            return Err(not_found());
        };

        let config = Arc::new(TrackConfig::from_definition(&definition));
        if config.is_default {
            info!(event_id, track_id, "No scoring config for track, using default template");
        } else {
            debug!(event_id, track_id, criteria = config.criteria.len(), "Loaded track config");
        }

        // First load wins
        let mut cache = self.lock();
        cache.unknown.remove(&key);
        Ok(cache.configs.entry(key).or_insert(config).clone())
    }

    /// Seed the cache from an already-fetched track list
    pub fn prime(&self, event_id: &str, config: TrackConfig) -> Arc<TrackConfig> {
        let key = (event_id.to_string(), config.track_id.clone());
        let mut cache = self.lock();
        cache.unknown.remove(&key);
        cache.configs.entry(key).or_insert_with(|| Arc::new(config)).clone()
    }

    /// Drop every cached track of an evicted event
    pub fn forget_event(&self, event_id: &str) {
        let mut cache = self.lock();
        cache.configs.retain(|(cached_event, _), _| cached_event != event_id);
        cache.unknown.retain(|(cached_event, _), _| cached_event != event_id);
    }

    pub fn cached_tracks(&self, event_id: &str) -> usize {
        self.lock().configs.keys().filter(|(e, _)| e == event_id).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Cache> {
        // Entries are immutable Arcs; a poisoned map is still consistent
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteScoreStore;
    use judging_common::model::{CriterionDoc, ScoringConfigDoc};
    use judging_common::TrackDefinition;

    async fn store_with_tracks() -> (tempfile::TempDir, Arc<SqliteScoreStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteScoreStore::open(&dir.path().join("judging.db"), 16)
            .await
            .unwrap();

        store
            .upsert_track(&TrackDefinition {
                event_id: "ev".to_string(),
                track_id: "web".to_string(),
                name: "Web".to_string(),
                scoring: Some(ScoringConfigDoc {
                    name: "Web".to_string(),
                    criteria: vec![CriterionDoc {
                        id: "tech".to_string(),
                        weight: Some(2.0),
                        ..Default::default()
                    }],
                }),
            })
            .await
            .unwrap();
        store
            .upsert_track(&TrackDefinition {
                event_id: "ev".to_string(),
                track_id: "open".to_string(),
                name: "Open".to_string(),
                scoring: None,
            })
            .await
            .unwrap();

        (dir, Arc::new(store))
    }

    #[tokio::test]
    async fn test_resolves_and_caches_configured_track() {
        let (_dir, store) = store_with_tracks().await;
        let resolver = TrackConfigResolver::new(store.clone());

        let first = resolver.resolve("ev", "web").await.unwrap();
        assert_eq!(first.criterion("tech").unwrap().weight, 2.0);

        // Later edits in the store do not affect the cached copy
        store
            .upsert_track(&TrackDefinition {
                event_id: "ev".to_string(),
                track_id: "web".to_string(),
                name: "Web".to_string(),
                scoring: None,
            })
            .await
            .unwrap();
        let second = resolver.resolve("ev", "web").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_unconfigured_track_gets_default_template() {
        let (_dir, store) = store_with_tracks().await;
        let resolver = TrackConfigResolver::new(store);

        let config = resolver.resolve("ev", "open").await.unwrap();
        assert!(config.is_default);
        assert_eq!(config.criteria.len(), 4);
    }

    #[tokio::test]
    async fn test_unknown_track_is_config_not_found() {
        let (_dir, store) = store_with_tracks().await;
        let resolver = TrackConfigResolver::new(store);

        let err = resolver.resolve("ev", "missing").await.unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));

        let err = resolver.resolve("other-event", "web").await.unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));
    }

    #[tokio::test]
    async fn test_forget_event_clears_cache() {
        let (_dir, store) = store_with_tracks().await;
        let resolver = TrackConfigResolver::new(store);

        resolver.resolve("ev", "web").await.unwrap();
        resolver.resolve("ev", "open").await.unwrap();
        assert_eq!(resolver.cached_tracks("ev"), 2);

        resolver.forget_event("ev");
        assert_eq!(resolver.cached_tracks("ev"), 0);
    }

    #[tokio::test]
    async fn test_unknown_track_is_remembered_until_recheck() {
        let (_dir, store) = store_with_tracks().await;
        let resolver = TrackConfigResolver::new(store.clone());
        let late = TrackDefinition {
            event_id: "ev".to_string(),
            track_id: "late".to_string(),
            name: "Late".to_string(),
            scoring: None,
        };

        assert!(resolver.resolve("ev", "late").await.is_err());
        store.upsert_track(&late).await.unwrap();
        // still answered from the negative cache
        let err = resolver.resolve("ev", "late").await.unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));

        // a snapshot listing the track clears it
        resolver.prime("ev", TrackConfig::from_definition(&late));
        assert!(resolver.resolve("ev", "late").await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_track_is_looked_up_again_after_recheck() {
        let (_dir, store) = store_with_tracks().await;
        let resolver = TrackConfigResolver::new(store.clone()).with_unknown_recheck(Duration::ZERO);

        assert!(resolver.resolve("ev", "late").await.is_err());
        store
            .upsert_track(&TrackDefinition {
                event_id: "ev".to_string(),
                track_id: "late".to_string(),
                name: "Late".to_string(),
                scoring: None,
            })
            .await
            .unwrap();
        assert!(resolver.resolve("ev", "late").await.unwrap().is_default);
    }
}
