use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Facebook,
    Instagram,
    Linkedin,
    Twitter,
    Youtube,
    Google,
    Wordpress,
    Tiktok,
}

impl Platform {
    pub const ALL: [Platform; 8] = [
        Platform::Facebook,
        Platform::Instagram,
        Platform::Linkedin,
        Platform::Twitter,
        Platform::Youtube,
        Platform::Google,
        Platform::Wordpress,
        Platform::Tiktok,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Facebook => "facebook",
            Platform::Instagram => "instagram",
            Platform::Linkedin => "linkedin",
            Platform::Twitter => "twitter",
            Platform::Youtube => "youtube",
            Platform::Google => "google",
            Platform::Wordpress => "wordpress",
            Platform::Tiktok => "tiktok",
        }
    }

    pub fn default_method(&self) -> ConnectionMethod {
        match self {
            Platform::Wordpress => ConnectionMethod::Token,
            _ => ConnectionMethod::OAuth,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_ascii_lowercase();
        match key.as_str() {
            "x" => return Ok(Platform::Twitter),
            "google_business" | "gmb" => return Ok(Platform::Google),
            _ => {}
        }
        Platform::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == key)
            .ok_or_else(|| anyhow!("unknown platform: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMethod {
    #[serde(alias = "oauth2")]
    OAuth,
    #[serde(alias = "api_key", alias = "app_password")]
    Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Active,
    Expired,
    Revoked,
    Error,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub platform: Platform,
    pub is_active: bool,
    pub status: ConnectionStatus,
    pub external_account_id: Option<String>,
    pub display_name: String,
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OAuthConnection {
    pub info: ConnectionInfo,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenConnection {
    pub info: ConnectionInfo,
    pub site_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "connection_method", rename_all = "lowercase")]
pub enum Connection {
    OAuth(OAuthConnection),
    Token(TokenConnection),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub platform: Platform,
    pub external_account_id: Option<String>,
}

impl Connection {
    pub fn info(&self) -> &ConnectionInfo {
        match self {
            Connection::OAuth(c) => &c.info,
            Connection::Token(c) => &c.info,
        }
    }

    pub fn method(&self) -> ConnectionMethod {
        match self {
            Connection::OAuth(_) => ConnectionMethod::OAuth,
            Connection::Token(_) => ConnectionMethod::Token,
        }
    }

    pub fn platform(&self) -> Platform {
        self.info().platform
    }

    pub fn is_active(&self) -> bool {
        let info = self.info();
        info.is_active && info.status == ConnectionStatus::Active
    }

    pub fn identity_key(&self) -> IdentityKey {
        let info = self.info();
        IdentityKey {
            platform: info.platform,
            external_account_id: info.external_account_id.clone(),
        }
    }
}

/// Wire shape of a connection record. Two backends produce slightly
/// different records; `Connection::try_from` settles which one it is.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConnection {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub platform: Platform,
    #[serde(default)]
    pub connection_method: Option<ConnectionMethod>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub status: Option<ConnectionStatus>,
    #[serde(default, alias = "platform_user_id", alias = "account_id")]
    pub external_account_id: Option<String>,
    #[serde(default, alias = "account_name", alias = "platform_username")]
    pub display_name: Option<String>,
    #[serde(default, alias = "last_sync")]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub token_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    #[serde(default)]
    pub site_url: Option<String>,
}

fn default_true() -> bool {
    true
}

impl TryFrom<RawConnection> for Connection {
    type Error = anyhow::Error;

    fn try_from(raw: RawConnection) -> Result<Self> {
        if raw.id.is_empty() {
            bail!("connection: id required");
        }
        let method = raw.connection_method.unwrap_or_else(|| {
            if raw.token_expires_at.is_some() || raw.scopes.is_some() {
                ConnectionMethod::OAuth
            } else if raw.site_url.is_some() {
                ConnectionMethod::Token
            } else {
                raw.platform.default_method()
            }
        });
        let status = raw.status.unwrap_or(if raw.is_active {
            ConnectionStatus::Active
        } else {
            ConnectionStatus::Disconnected
        });
        let info = ConnectionInfo {
            display_name: raw
                .display_name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| raw.platform.as_str().to_string()),
            id: raw.id,
            platform: raw.platform,
            is_active: raw.is_active,
            status,
            external_account_id: raw.external_account_id.filter(|id| !id.is_empty()),
            last_sync_at: raw.last_sync_at,
        };
        Ok(match method {
            ConnectionMethod::OAuth => Connection::OAuth(OAuthConnection {
                info,
                token_expires_at: raw.token_expires_at,
                scopes: raw.scopes.unwrap_or_default(),
            }),
            ConnectionMethod::Token => Connection::Token(TokenConnection {
                info,
                site_url: raw.site_url,
            }),
        })
    }
}

impl<'de> Deserialize<'de> for Connection {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawConnection::deserialize(deserializer)?;
        Connection::try_from(raw).map_err(serde::de::Error::custom)
    }
}

/// Keeps one connection per identity key, preferring the most recently
/// synced record. Connections without an external account id collapse to
/// one per platform.
pub fn dedupe_by_identity(connections: Vec<Connection>) -> Vec<Connection> {
    let mut kept: Vec<Connection> = Vec::with_capacity(connections.len());
    for connection in connections {
        let key = connection.identity_key();
        match kept.iter_mut().find(|c| c.identity_key() == key) {
            Some(existing) => {
                if connection.info().last_sync_at > existing.info().last_sync_at {
                    *existing = connection;
                }
            }
            None => kept.push(connection),
        }
    }
    kept
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    #[default]
    Draft,
    Scheduled,
    #[serde(alias = "posted")]
    Published,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawScheduledPost")]
pub struct ScheduledPost {
    pub id: String,
    pub platform: Platform,
    pub scheduled_date: NaiveDate,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub content: String,
    pub hashtags: Vec<String>,
    pub media_attachments: Vec<String>,
    pub status: PostStatus,
}

#[derive(Debug, Deserialize)]
struct RawScheduledPost {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    platform: Platform,
    #[serde(default)]
    scheduled_date: Option<String>,
    #[serde(default, alias = "scheduled_time")]
    scheduled_at: Option<String>,
    #[serde(default, alias = "text")]
    content: String,
    #[serde(default)]
    hashtags: Vec<String>,
    #[serde(default, alias = "media_urls")]
    media_attachments: Vec<String>,
    #[serde(default)]
    status: PostStatus,
}

impl TryFrom<RawScheduledPost> for ScheduledPost {
    type Error = anyhow::Error;

    fn try_from(raw: RawScheduledPost) -> Result<Self> {
        let scheduled_at = match raw.scheduled_at.as_deref().filter(|s| !s.is_empty()) {
            Some(value) => Some(parse_timestamp(value)?),
            None => None,
        };
        let scheduled_date = match (raw.scheduled_date.as_deref(), scheduled_at) {
            (Some(date), _) if !date.is_empty() => parse_calendar_date(date)?,
            (_, Some(at)) => at.date_naive(),
            _ => bail!("post {}: missing scheduled date", raw.id),
        };
        Ok(ScheduledPost {
            id: raw.id,
            platform: raw.platform,
            scheduled_date,
            scheduled_at,
            content: raw.content,
            hashtags: raw.hashtags,
            media_attachments: raw.media_attachments,
            status: raw.status,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Ok(at.with_timezone(&Utc));
    }
    // naive timestamps from the backend are UTC
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|err| anyhow!("invalid timestamp {:?}: {}", value, err))
}

fn parse_calendar_date(value: &str) -> Result<NaiveDate> {
    let day = value.get(..10).unwrap_or(value);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|err| anyhow!("invalid date {:?}: {}", value, err))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialPost {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub platform: Platform,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: PostStatus,
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub post_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduledContent {
    #[serde(default, deserialize_with = "lenient_list")]
    pub content: Vec<ScheduledPost>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub count: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentPage {
    #[serde(default, deserialize_with = "lenient_list")]
    pub content: Vec<ScheduledPost>,
    #[serde(default)]
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerateRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<Platform>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthUrl {
    #[serde(alias = "authorization_url")]
    pub auth_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default)]
    pub features: Vec<String>,
}

fn default_currency() -> String {
    "usd".into()
}

fn default_interval() -> String {
    "month".into()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub plan_name: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
}

impl SubscriptionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self.status.as_str(), "active" | "trialing")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub invoice_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSubscription {
    pub plan_id: String,
}

/// A JSON array decoded one element at a time. Elements that do not
/// decode are logged and dropped.
#[derive(Debug, Clone, Default)]
pub struct Records<T>(pub Vec<T>);

impl<'de, T: DeserializeOwned> Deserialize<'de> for Records<T> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Vec::<Value>::deserialize(deserializer)?;
        let total = raw.len();
        let kept: Vec<T> = raw
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<T>(item) {
                Ok(record) => Some(record),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping record that failed to decode");
                    None
                }
            })
            .collect();
        if kept.len() < total {
            tracing::warn!(kept = kept.len(), total, "dropped undecodable records");
        }
        Ok(Records(kept))
    }
}

fn lenient_list<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Records::deserialize(deserializer).map(|records| records.0)
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}
