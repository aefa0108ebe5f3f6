use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Method;
use serde_json::Value;

use crate::api::{self, Backend};
use crate::cache::{Clearable, Lookup, TimedCache};
use crate::clock::Clock;
use crate::models::{ContentPage, GenerateRequest, PostStatus, ScheduledContent, ScheduledPost};

#[derive(Clone)]
pub struct ContentService {
    backend: Arc<dyn Backend>,
}

impl ContentService {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn scheduled(&self) -> Result<ScheduledContent> {
        let value = self
            .backend
            .fetch_resource(Method::GET, "/content/scheduled", None)
            .context("content: load scheduled")?;
        api::decode(value).context("content: decode scheduled")
    }

    pub fn all(&self, limit: usize, offset: usize) -> Result<ContentPage> {
        let path = format!("/content/all?limit={}&offset={}", limit, offset);
        let value = self
            .backend
            .fetch_resource(Method::GET, &path, None)
            .context("content: load all")?;
        api::decode(value).context("content: decode all")
    }

    pub fn generate(&self, request: &GenerateRequest) -> Result<Value> {
        let body = serde_json::to_value(request).context("content: encode generate request")?;
        self.backend
            .fetch_resource(Method::POST, "/content/generate", Some(&body))
            .context("content: generate")
    }
}

pub struct ContentCache {
    service: ContentService,
    scheduled: TimedCache<Vec<ScheduledPost>>,
    all: TimedCache<Vec<ScheduledPost>>,
}

impl ContentCache {
    pub fn new(service: ContentService, clock: Arc<dyn Clock>, ttl: Duration, page_size: usize) -> Self {
        let scheduled_source = service.clone();
        let all_source = service.clone();
        Self {
            scheduled: TimedCache::new("content.scheduled", clock.clone(), ttl, move || {
                Ok(scheduled_source.scheduled()?.content)
            }),
            all: TimedCache::new("content.all", clock, ttl, move || {
                Ok(all_source.all(page_size, 0)?.content)
            }),
            service,
        }
    }

    pub fn scheduled(&self, force_refresh: bool) -> Lookup<Vec<ScheduledPost>> {
        self.scheduled.get(force_refresh)
    }

    pub fn all(&self, force_refresh: bool) -> Lookup<Vec<ScheduledPost>> {
        self.all.get(force_refresh)
    }

    // optimistic: both views flip to published without a refetch
    pub fn mark_posted(&self, post_id: &str) -> bool {
        let mark = |posts: &mut Vec<ScheduledPost>| {
            let mut found = false;
            for post in posts.iter_mut().filter(|p| p.id == post_id) {
                post.status = PostStatus::Published;
                found = true;
            }
            found
        };
        let mut found = false;
        self.scheduled.update(|posts| found |= mark(posts));
        self.all.update(|posts| found |= mark(posts));
        found
    }

    pub fn generate(&self, request: &GenerateRequest) -> Result<Value> {
        let job = self.service.generate(request)?;
        self.invalidate();
        Ok(job)
    }

    pub fn invalidate(&self) {
        self.scheduled.invalidate();
        self.all.invalidate();
    }
}

impl Clearable for ContentCache {
    fn clear_all(&self) {
        self.scheduled.clear();
        self.all.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::FakeBackend;
    use crate::clock::ManualClock;
    use crate::models::Platform;
    use serde_json::json;

    fn setup() -> (Arc<FakeBackend>, Arc<ManualClock>, ContentCache) {
        let backend = Arc::new(FakeBackend::new());
        backend.respond(
            "GET /content/scheduled",
            json!({
                "content": [
                    {"id": 1, "platform": "facebook", "scheduled_date": "2024-03-01", "status": "scheduled"},
                    {"id": 2, "platform": "twitter", "scheduled_at": "2024-03-02T10:00:00Z", "status": "scheduled"}
                ],
                "date": "2024-03-01",
                "count": 2
            }),
        );
        backend.respond(
            "GET /content/all?limit=20&offset=0",
            json!({"content": [{"id": 1, "platform": "facebook", "scheduled_date": "2024-03-01"}], "count": 1}),
        );
        backend.respond("POST /content/generate", json!({"status": "queued"}));
        let clock = Arc::new(ManualClock::new(0));
        let cache = ContentCache::new(
            ContentService::new(backend.clone()),
            clock.clone(),
            Duration::from_secs(300),
            20,
        );
        (backend, clock, cache)
    }

    #[test]
    fn scheduled_reads_through_once_per_ttl() {
        let (backend, clock, cache) = setup();
        assert_eq!(cache.scheduled(false).value.len(), 2);
        clock.advance(299_000);
        assert!(cache.scheduled(false).served_from_cache);
        assert_eq!(backend.count("GET /content/scheduled"), 1);
        clock.advance(2_000);
        cache.scheduled(false);
        assert_eq!(backend.count("GET /content/scheduled"), 2);
    }

    #[test]
    fn mark_posted_updates_all_views() {
        let (backend, _clock, cache) = setup();
        cache.scheduled(false);
        cache.all(false);
        assert!(cache.mark_posted("1"));

        let scheduled = cache.scheduled(false);
        assert_eq!(scheduled.value[0].status, PostStatus::Published);
        assert_eq!(scheduled.value[1].status, PostStatus::Scheduled);
        assert_eq!(cache.all(false).value[0].status, PostStatus::Published);
        assert_eq!(backend.count("GET /content/scheduled"), 1);
        assert!(!cache.mark_posted("missing"));
    }

    #[test]
    fn generate_invalidates_content() {
        let (backend, _clock, cache) = setup();
        cache.scheduled(false);
        let request = GenerateRequest {
            platforms: vec![Platform::Facebook],
            days: Some(7),
            ..GenerateRequest::default()
        };
        cache.generate(&request).unwrap();
        assert_eq!(
            backend.last_body("POST /content/generate"),
            Some(json!({"platforms": ["facebook"], "days": 7}))
        );
        cache.scheduled(false);
        assert_eq!(backend.count("GET /content/scheduled"), 2);
    }

    #[test]
    fn backend_failure_keeps_previous_content() {
        let (backend, clock, cache) = setup();
        cache.scheduled(false);
        backend.fail("GET /content/scheduled", 503);
        clock.advance(600_000);
        let lookup = cache.scheduled(false);
        assert_eq!(lookup.value.len(), 2);
        assert!(lookup.error.is_none());
    }

    #[test]
    fn unknown_platform_post_is_dropped_from_cold_cache() {
        let backend = Arc::new(FakeBackend::new());
        backend.respond(
            "GET /content/scheduled",
            json!({"content": [
                {"id": 1, "platform": "facebook", "scheduled_date": "2024-03-01"},
                {"id": 2, "platform": "pinterest", "scheduled_date": "2024-03-01"}
            ]}),
        );
        let cache = ContentCache::new(
            ContentService::new(backend),
            Arc::new(ManualClock::new(0)),
            Duration::from_secs(300),
            20,
        );
        let lookup = cache.scheduled(false);
        assert!(lookup.error.is_none());
        assert_eq!(lookup.value.len(), 1);
        assert_eq!(lookup.value[0].platform, Platform::Facebook);
    }
}
