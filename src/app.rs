use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;

use crate::api::{ApiClient, Backend, ClientConfig};
use crate::cache::Lookup;
use crate::clock::{Clock, SystemClock};
use crate::config::{self, Config};
use crate::connections::{ConnectionService, SocialCache};
use crate::content::{ContentCache, ContentService};
use crate::dashboard;
use crate::error::{classify, ErrorKind};
use crate::models::{GenerateRequest, Platform};
use crate::oauth::{BrowserOpener, CoordinatorConfig, MessageBus, Outcome, PopupOAuthCoordinator, PopupOpener, PopupSize};
use crate::session::SessionManager;
use crate::storage;
use crate::subscription::SubscriptionService;
use crate::upload::MediaService;

pub struct App {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub sessions: Arc<SessionManager>,
    pub backend: Arc<dyn Backend>,
    pub content: Arc<ContentCache>,
    pub social: Arc<SocialCache>,
    pub subscriptions: SubscriptionService,
    pub media: MediaService,
    pub bus: Arc<MessageBus>,
    pub oauth: PopupOAuthCoordinator,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let store = storage::Store::open(storage::Options {
            path: config.storage.path.clone(),
        })
        .context("open storage")?;
        let bus = Arc::new(MessageBus::new());
        let opener: Arc<dyn PopupOpener> =
            Arc::new(BrowserOpener::new(bus.clone(), config.oauth.callback_addr.clone()));
        Self::with_parts(config, store, bus, opener, Arc::new(SystemClock))
    }

    pub fn with_parts(
        config: Config,
        store: storage::Store,
        bus: Arc<MessageBus>,
        opener: Arc<dyn PopupOpener>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let sessions = Arc::new(SessionManager::new(Arc::new(store), clock.clone())?);
        let backend: Arc<dyn Backend> = Arc::new(ApiClient::new(
            sessions.clone(),
            ClientConfig {
                base_url: Some(config.api.base_url.clone()),
                user_agent: config.api.user_agent.clone(),
                timeout: Some(config.api.timeout),
                http_client: None,
            },
        )?);

        let ttl = config.cache.ttl;
        let content = Arc::new(ContentCache::new(
            ContentService::new(backend.clone()),
            clock.clone(),
            ttl,
            config.cache.content_page_size,
        ));
        let social = Arc::new(SocialCache::new(
            ConnectionService::new(backend.clone()),
            clock.clone(),
            ttl,
        ));
        sessions.register_cache(content.clone());
        sessions.register_cache(social.clone());

        let oauth = PopupOAuthCoordinator::new(
            social.clone(),
            opener,
            bus.clone(),
            clock.clone(),
            CoordinatorConfig {
                poll_interval: config.oauth.poll_interval,
                timeout: config.oauth.timeout,
                popup: PopupSize {
                    width: config.oauth.popup_width,
                    height: config.oauth.popup_height,
                },
                trusted_origins: config.oauth.trusted_origins.clone(),
            },
        );

        Ok(Self {
            subscriptions: SubscriptionService::new(backend.clone()),
            media: MediaService::new(backend.clone(), config.upload.limits()),
            config,
            clock,
            sessions,
            backend,
            content,
            social,
            bus,
            oauth,
        })
    }
}

pub fn run(args: Vec<String>) -> Result<()> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    let app = App::new(cfg)?;
    let result = dispatch(&app, &args);
    if let Err(err) = &result {
        if classify(err) == ErrorKind::Auth {
            return Err(anyhow!("{err:#}\nsign in with: postdeck login <token>"));
        }
    }
    result
}

fn dispatch(app: &App, args: &[String]) -> Result<()> {
    let (command, rest) = match args.split_first() {
        Some((command, rest)) => (command.as_str(), rest),
        None => bail!("no command given; see --help"),
    };
    let refresh = rest.iter().any(|a| a == "--refresh");
    let positional: Vec<&str> = rest
        .iter()
        .map(String::as_str)
        .filter(|a| !a.starts_with("--"))
        .collect();

    match command {
        "login" => {
            let token = positional.first().context("usage: postdeck login <token> [email]")?;
            let email = positional.get(1).copied().unwrap_or_default();
            app.sessions.login(token, email, None)?;
            println!("Signed in.");
        }
        "logout" => {
            app.sessions.logout()?;
            println!("Signed out.");
        }
        "whoami" => {
            let session = app.sessions.active()?;
            let who = if session.email.is_empty() {
                "signed in"
            } else {
                session.email.as_str()
            };
            println!("{who} (since {})", session.created_at.format("%Y-%m-%d %H:%M"));
        }
        "scheduled" => {
            let posts = report(app.content.scheduled(refresh), "scheduled content")?;
            for (day, posts) in dashboard::group_by_date(&posts) {
                println!("{day}");
                for post in posts {
                    println!("  [{}] {:<10} {:?} {}", post.id, post.platform, post.status, post.content);
                }
            }
        }
        "content" => {
            let posts = report(app.content.all(refresh), "content")?;
            for post in &posts {
                println!(
                    "{} {:<10} {:<10?} {}",
                    post.scheduled_date, post.platform, post.status, post.content
                );
            }
        }
        "generate" => {
            let platforms = positional
                .iter()
                .map(|p| p.parse::<Platform>())
                .collect::<Result<Vec<_>>>()?;
            app.content.generate(&GenerateRequest {
                platforms,
                ..GenerateRequest::default()
            })?;
            println!("Generation started; run `postdeck scheduled` to see new content.");
        }
        "connections" => {
            let connections = report(app.social.connections(refresh), "connections")?;
            if connections.is_empty() {
                println!("No platforms connected.");
            }
            for connection in &connections {
                let info = connection.info();
                println!(
                    "{:<10} {:<12} {:?} via {:?}",
                    info.platform,
                    info.display_name,
                    info.status,
                    connection.method()
                );
            }
        }
        "connect" => {
            let platform: Platform = positional
                .first()
                .context("usage: postdeck connect <platform>")?
                .parse()?;
            app.sessions.active()?;
            println!("Opening {platform} authorisation in your browser...");
            match app.oauth.connect(platform)? {
                Outcome::Success => println!("{platform} connected."),
                Outcome::Error(err) => bail!("{platform} authorisation failed: {err}"),
                other => println!("Authorisation finished ({other}); connection list refreshed."),
            }
        }
        "disconnect" => {
            let platform: Platform = positional
                .first()
                .context("usage: postdeck disconnect <platform>")?
                .parse()?;
            let connection = app
                .social
                .find(platform)?
                .with_context(|| format!("{platform} is not connected"))?;
            app.social.disconnect(&connection)?;
            println!("{platform} disconnected.");
        }
        "dashboard" => {
            let connections = report(app.social.connections(refresh), "connections")?;
            let posts = report(app.content.scheduled(refresh), "scheduled content")?;
            for row in dashboard::platform_summaries(&connections, &posts) {
                let state = if row.connected { "connected" } else { "-" };
                println!(
                    "{:<10} {:<10} scheduled {:>3}  published {:>3}  failed {:>3}",
                    row.platform, state, row.scheduled, row.published, row.failed
                );
            }
            let today = Utc::now().date_naive();
            let week = dashboard::upcoming(&posts, today, 7);
            println!("\n{} post(s) due in the next 7 days", week.len());
        }
        "plans" => {
            for plan in app.subscriptions.plans()? {
                println!("{:<12} {:<16} {:.2} {}/{}", plan.id, plan.name, plan.price, plan.currency, plan.interval);
            }
        }
        "subscription" => {
            let status = app.subscriptions.status()?;
            println!(
                "{} {}",
                status.plan_name.or(status.plan_id).unwrap_or_else(|| "no plan".into()),
                status.status
            );
            if let Some(end) = status.current_period_end {
                let verb = if status.cancel_at_period_end { "ends" } else { "renews" };
                println!("{verb} {}", end.format("%Y-%m-%d"));
            }
        }
        "subscribe" => {
            let plan = positional.first().context("usage: postdeck subscribe <plan-id>")?;
            let response = app.subscriptions.create(plan)?;
            match response.get("checkout_url").and_then(|v| v.as_str()) {
                Some(url) => println!("Complete checkout at {url}"),
                None => println!("Subscription requested."),
            }
        }
        "cancel" => {
            app.subscriptions.cancel()?;
            println!("Subscription cancelled.");
        }
        "billing" => {
            for record in app.subscriptions.billing_history()? {
                let date = record
                    .created_at
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_default();
                println!("{:<10} {:>8.2} {} {}", date, record.amount, record.currency, record.status);
            }
        }
        "upload" => {
            let path = positional.first().context("usage: postdeck upload <file>")?;
            let url = app.media.upload(Path::new(path))?;
            println!("{url}");
        }
        other => bail!("unknown command: {other}; see --help"),
    }
    Ok(())
}

fn report<T>(lookup: Lookup<T>, what: &str) -> Result<T> {
    if lookup.served_from_cache {
        tracing::debug!(what, "served from cache");
    }
    lookup.into_result().with_context(|| format!("load {what}"))
}
