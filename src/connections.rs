use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;

use crate::api::{self, Backend};
use crate::cache::{Clearable, Lookup, TimedCache};
use crate::clock::Clock;
use crate::models::{dedupe_by_identity, AuthUrl, Connection, Platform, Records, SocialPost};

#[derive(Deserialize)]
#[serde(untagged)]
enum ConnectionList {
    Wrapped { connections: Records<Connection> },
    Bare(Records<Connection>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PostList {
    Wrapped { posts: Records<SocialPost> },
    Bare(Records<SocialPost>),
}

#[derive(Clone)]
pub struct ConnectionService {
    backend: Arc<dyn Backend>,
}

impl ConnectionService {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn list(&self) -> Result<Vec<Connection>> {
        let value = self
            .backend
            .fetch_resource(Method::GET, "/connections", None)
            .context("connections: list")?;
        let list: ConnectionList = api::decode(value).context("connections: decode list")?;
        let Records(connections) = match list {
            ConnectionList::Wrapped { connections } => connections,
            ConnectionList::Bare(connections) => connections,
        };
        Ok(dedupe_by_identity(connections))
    }

    pub fn posts(&self) -> Result<Vec<SocialPost>> {
        let value = self
            .backend
            .fetch_resource(Method::GET, "/social/posts", None)
            .context("social: list posts")?;
        let list: PostList = api::decode(value).context("social: decode posts")?;
        let Records(posts) = match list {
            PostList::Wrapped { posts } => posts,
            PostList::Bare(posts) => posts,
        };
        Ok(posts)
    }

    pub fn authorization_url(&self, platform: Platform) -> Result<String> {
        let value = match platform {
            Platform::Google => self
                .backend
                .fetch_resource(Method::GET, "/connections/google/auth/initiate", None),
            other => {
                let path = format!("/connections/{}/connect", other.as_str());
                self.backend.fetch_resource(Method::POST, &path, None)
            }
        }
        .with_context(|| format!("connections: start {} authorisation", platform))?;
        let auth: AuthUrl = api::decode(value)
            .with_context(|| format!("connections: {} returned no auth url", platform))?;
        if auth.auth_url.trim().is_empty() {
            bail!("connections: {} returned an empty auth url", platform);
        }
        Ok(auth.auth_url)
    }

    pub fn disconnect(&self, connection: &Connection) -> Result<Value> {
        let info = connection.info();
        match info.platform {
            Platform::Google => self
                .backend
                .fetch_resource(Method::GET, "/connections/google/disconnect", None),
            _ => {
                let path = format!("/connections/{}", info.id);
                self.backend.fetch_resource(Method::DELETE, &path, None)
            }
        }
        .with_context(|| format!("connections: disconnect {}", info.platform))
    }
}

pub struct SocialCache {
    service: ConnectionService,
    connections: TimedCache<Vec<Connection>>,
    posts: TimedCache<Vec<SocialPost>>,
}

impl SocialCache {
    pub fn new(service: ConnectionService, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        let connections_source = service.clone();
        let posts_source = service.clone();
        Self {
            connections: TimedCache::new("social.connections", clock.clone(), ttl, move || {
                connections_source.list()
            }),
            posts: TimedCache::new("social.posts", clock, ttl, move || posts_source.posts()),
            service,
        }
    }

    pub fn service(&self) -> &ConnectionService {
        &self.service
    }

    pub fn connections(&self, force_refresh: bool) -> Lookup<Vec<Connection>> {
        self.connections.get(force_refresh)
    }

    pub fn posts(&self, force_refresh: bool) -> Lookup<Vec<SocialPost>> {
        self.posts.get(force_refresh)
    }

    pub fn connections_cache(&self) -> &TimedCache<Vec<Connection>> {
        &self.connections
    }

    pub fn resync(&self) -> Lookup<Vec<Connection>> {
        self.connections.invalidate();
        self.connections.get(true)
    }

    pub fn find(&self, platform: Platform) -> Result<Option<Connection>> {
        let connections = self.connections(false).into_result()?;
        Ok(connections
            .into_iter()
            .filter(|c| c.platform() == platform)
            .max_by_key(|c| c.is_active()))
    }

    pub fn disconnect(&self, connection: &Connection) -> Result<()> {
        self.service.disconnect(connection)?;
        let refreshed = self.resync();
        if let Some(err) = refreshed.error {
            tracing::warn!(error = %err, "connections: refresh after disconnect failed");
        }
        Ok(())
    }
}

impl Clearable for SocialCache {
    fn clear_all(&self) {
        self.connections.clear();
        self.posts.clear();
    }
}
