use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use crossbeam_channel::{after, bounded, select, tick, unbounded, Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::RngCore;
use serde::Deserialize;
use serde_json::{json, Value};
use tiny_http::{Header, Method, Response, Server};
use url::Url;

use crate::clock::Clock;
use crate::connections::SocialCache;
use crate::models::{ConnectionMethod, Platform};

static HTML_DONE: Lazy<String> = Lazy::new(|| {
    r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <title>postdeck</title>
    <style>
      body { font-family: sans-serif; display: flex; min-height: 100vh; align-items: center; justify-content: center; }
      .card { max-width: 420px; text-align: center; }
    </style>
  </head>
  <body>
    <div class="card">
      <h1>All set</h1>
      <p>You can close this window and return to postdeck.</p>
    </div>
  </body>
</html>
"#
    .to_string()
});

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("{0} is connected with a token, not through a popup")]
    UnsupportedPlatform(Platform),
    #[error("could not start authorisation: {0:#}")]
    Api(anyhow::Error),
    #[error("could not open popup: {0:#}")]
    Popup(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowMessage {
    pub origin: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum OAuthMessage {
    #[serde(rename = "oauth_success", alias = "OAUTH_SUCCESS")]
    Success {
        #[serde(default)]
        platform: Option<Platform>,
    },
    #[serde(rename = "oauth_error", alias = "OAUTH_ERROR")]
    Error {
        #[serde(default)]
        platform: Option<Platform>,
        #[serde(default)]
        error: Option<String>,
    },
}

impl OAuthMessage {
    fn platform(&self) -> Option<Platform> {
        match self {
            OAuthMessage::Success { platform } | OAuthMessage::Error { platform, .. } => *platform,
        }
    }
}

pub type ListenerId = u64;

pub struct Listener {
    pub id: ListenerId,
    rx: Receiver<WindowMessage>,
}

#[derive(Default)]
pub struct MessageBus {
    listeners: Mutex<HashMap<ListenerId, Sender<WindowMessage>>>,
    next_id: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> Listener {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = unbounded();
        self.listeners.lock().insert(id, tx);
        Listener { id, rx }
    }

    pub fn remove(&self, id: ListenerId) {
        self.listeners.lock().remove(&id);
    }

    pub fn post(&self, message: WindowMessage) -> usize {
        let mut listeners = self.listeners.lock();
        listeners.retain(|_, tx| tx.send(message.clone()).is_ok());
        listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct OriginAllowList {
    origins: Vec<url::Origin>,
}

impl OriginAllowList {
    pub fn new(same_origin: &Url, partners: &[String]) -> Self {
        let mut list = Self::default();
        list.trust_url(same_origin);
        for partner in partners {
            match Url::parse(partner) {
                Ok(url) => list.trust_url(&url),
                Err(err) => tracing::warn!(origin = %partner, error = %err, "oauth: ignoring invalid trusted origin"),
            }
        }
        list
    }

    fn trust_url(&mut self, url: &Url) {
        let origin = url.origin();
        if origin.is_tuple() && !self.origins.contains(&origin) {
            self.origins.push(origin);
        }
    }

    pub fn with(&self, origin: &str) -> Self {
        let mut list = self.clone();
        if let Ok(url) = Url::parse(origin) {
            list.trust_url(&url);
        }
        list
    }

    pub fn allows(&self, origin: &str) -> bool {
        match Url::parse(origin) {
            Ok(url) => {
                let origin = url.origin();
                origin.is_tuple() && self.origins.contains(&origin)
            }
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopupSize {
    pub width: u32,
    pub height: u32,
}

impl Default for PopupSize {
    fn default() -> Self {
        Self {
            width: 500,
            height: 600,
        }
    }
}

pub trait Popup: Send {
    fn is_closed(&self) -> bool;
    fn close(&self);
    fn origin(&self) -> Option<String> {
        None
    }
}

pub trait PopupOpener: Send + Sync {
    fn open(&self, url: &str, size: PopupSize) -> Result<Box<dyn Popup>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error(String),
    /// The popup was closed without reporting back.
    Unknown,
    Timeout,
    /// A newer flow for the same platform took over.
    Cancelled,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::Error(err) => write!(f, "error: {}", err),
            Outcome::Unknown => f.write_str("unknown"),
            Outcome::Timeout => f.write_str("timeout"),
            Outcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OAuthState {
    #[default]
    Idle,
    AwaitingCompletion {
        platform: Platform,
        created_at_ms: i64,
    },
    Completed(Outcome),
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub popup: PopupSize,
    pub trusted_origins: Vec<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            popup: PopupSize::default(),
            trusted_origins: Vec::new(),
        }
    }
}

struct ActiveFlow {
    session: u64,
    cancel: Sender<()>,
}

#[derive(Default)]
struct Flows {
    active: Mutex<HashMap<Platform, ActiveFlow>>,
    states: Mutex<HashMap<Platform, OAuthState>>,
}

impl Flows {
    // false when a newer flow has already taken the platform over
    fn release(&self, platform: Platform, session: u64) -> bool {
        let mut active = self.active.lock();
        if active.get(&platform).map(|f| f.session) == Some(session) {
            active.remove(&platform);
            true
        } else {
            false
        }
    }
}

/// An authorisation flow that has been started and not yet completed.
/// Dropping it tears the flow down and leaves the platform `Cancelled`.
pub struct PendingAuthorization {
    pub platform: Platform,
    pub auth_url: String,
    pub created_at_ms: i64,
    session: u64,
    popup: Box<dyn Popup>,
    listener: Listener,
    cancel: Receiver<()>,
    allow: OriginAllowList,
    bus: Arc<MessageBus>,
    flows: Arc<Flows>,
    finished: bool,
}

impl PendingAuthorization {
    fn teardown(&mut self) -> bool {
        if self.finished {
            return false;
        }
        self.finished = true;
        self.bus.remove(self.listener.id);
        self.popup.close();
        self.flows.release(self.platform, self.session)
    }
}

impl Drop for PendingAuthorization {
    fn drop(&mut self) {
        if self.teardown() {
            self.flows
                .states
                .lock()
                .insert(self.platform, OAuthState::Completed(Outcome::Cancelled));
        }
    }
}

pub struct PopupOAuthCoordinator {
    social: Arc<SocialCache>,
    opener: Arc<dyn PopupOpener>,
    bus: Arc<MessageBus>,
    allow: OriginAllowList,
    clock: Arc<dyn Clock>,
    cfg: CoordinatorConfig,
    next_session: AtomicU64,
    flows: Arc<Flows>,
}

impl PopupOAuthCoordinator {
    pub fn new(
        social: Arc<SocialCache>,
        opener: Arc<dyn PopupOpener>,
        bus: Arc<MessageBus>,
        clock: Arc<dyn Clock>,
        cfg: CoordinatorConfig,
    ) -> Self {
        let allow = OriginAllowList::new(social.service().backend().base_url(), &cfg.trusted_origins);
        Self {
            social,
            opener,
            bus,
            allow,
            clock,
            cfg,
            next_session: AtomicU64::new(0),
            flows: Arc::new(Flows::default()),
        }
    }

    pub fn state(&self, platform: Platform) -> OAuthState {
        self.flows
            .states
            .lock()
            .get(&platform)
            .cloned()
            .unwrap_or_default()
    }

    pub fn connect(&self, platform: Platform) -> Result<Outcome, OAuthError> {
        let pending = self.initiate(platform)?;
        Ok(self.complete(pending))
    }

    /// Requests an authorisation URL and opens the popup. A flow already
    /// running for the same platform is cancelled.
    pub fn initiate(&self, platform: Platform) -> Result<PendingAuthorization, OAuthError> {
        if platform.default_method() != ConnectionMethod::OAuth {
            return Err(OAuthError::UnsupportedPlatform(platform));
        }
        let auth_url = self
            .social
            .service()
            .authorization_url(platform)
            .map_err(OAuthError::Api)?;

        let listener = self.bus.register();
        let popup = match self.opener.open(&auth_url, self.cfg.popup) {
            Ok(popup) => popup,
            Err(err) => {
                self.bus.remove(listener.id);
                return Err(OAuthError::Popup(err));
            }
        };
        let allow = match popup.origin() {
            Some(origin) => self.allow.with(&origin),
            None => self.allow.clone(),
        };

        let session = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let (cancel_tx, cancel_rx) = bounded(1);
        if let Some(previous) = self.flows.active.lock().insert(
            platform,
            ActiveFlow {
                session,
                cancel: cancel_tx,
            },
        ) {
            tracing::info!(%platform, "oauth: replacing flow already in progress");
            let _ = previous.cancel.try_send(());
        }

        let created_at_ms = self.clock.now_ms();
        self.flows.states.lock().insert(
            platform,
            OAuthState::AwaitingCompletion {
                platform,
                created_at_ms,
            },
        );
        tracing::info!(%platform, "oauth: popup opened");

        Ok(PendingAuthorization {
            platform,
            auth_url,
            created_at_ms,
            session,
            popup,
            listener,
            cancel: cancel_rx,
            allow,
            bus: self.bus.clone(),
            flows: self.flows.clone(),
            finished: false,
        })
    }

    /// Blocks until the message, close-poll or timeout path fires, then
    /// tears the flow down and resyncs connections from the backend.
    pub fn complete(&self, mut pending: PendingAuthorization) -> Outcome {
        let outcome = self.race(&pending);
        let current = pending.teardown();

        let platform = pending.platform;
        match &outcome {
            Outcome::Error(err) => tracing::warn!(%platform, error = %err, "oauth: provider reported an error"),
            other => tracing::info!(%platform, outcome = %other, "oauth: flow finished"),
        }

        if outcome != Outcome::Cancelled {
            let synced = self.social.resync();
            if let Some(err) = synced.error {
                tracing::warn!(%platform, error = %err, "oauth: connection resync failed");
            }
        }
        if current {
            self.flows
                .states
                .lock()
                .insert(platform, OAuthState::Completed(outcome.clone()));
        }
        outcome
    }

    fn race(&self, pending: &PendingAuthorization) -> Outcome {
        let poll = tick(self.cfg.poll_interval);
        let deadline = after(self.cfg.timeout);
        let messages = &pending.listener.rx;

        loop {
            select! {
                recv(messages) -> msg => match msg {
                    Ok(message) => {
                        if let Some(outcome) = self.accept(pending, message) {
                            return outcome;
                        }
                    }
                    Err(_) => return Outcome::Cancelled,
                },
                recv(pending.cancel) -> _ => return Outcome::Cancelled,
                recv(poll) -> _ => {
                    if pending.popup.is_closed() {
                        return self.drain(pending).unwrap_or(Outcome::Unknown);
                    }
                },
                recv(deadline) -> _ => {
                    return self.drain(pending).unwrap_or(Outcome::Timeout);
                },
            }
        }
    }

    fn drain(&self, pending: &PendingAuthorization) -> Option<Outcome> {
        while let Ok(message) = pending.listener.rx.try_recv() {
            if let Some(outcome) = self.accept(pending, message) {
                return Some(outcome);
            }
        }
        None
    }

    fn accept(&self, pending: &PendingAuthorization, message: WindowMessage) -> Option<Outcome> {
        if !pending.allow.allows(&message.origin) {
            tracing::debug!(origin = %message.origin, "oauth: ignoring message from untrusted origin");
            return None;
        }
        let parsed: OAuthMessage = match serde_json::from_value(message.data) {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::trace!(origin = %message.origin, "oauth: ignoring unrelated message");
                return None;
            }
        };
        if let Some(platform) = parsed.platform() {
            if platform != pending.platform {
                return None;
            }
        }
        Some(match parsed {
            OAuthMessage::Success { .. } => Outcome::Success,
            OAuthMessage::Error { error, .. } => {
                Outcome::Error(error.unwrap_or_else(|| "authorization failed".into()))
            }
        })
    }
}

pub struct CallbackListener {
    server: Arc<Server>,
    origin: String,
    state: String,
    closed: Arc<AtomicBool>,
}

impl CallbackListener {
    pub fn start(addr: &str, bus: Arc<MessageBus>) -> Result<Self> {
        let server = Server::http(addr).map_err(|err| anyhow!("oauth: listen on {}: {}", addr, err))?;
        let server = Arc::new(server);
        let origin = format!("http://{}", server.server_addr());
        let state = random_string(24);

        let worker = server.clone();
        let expected_state = state.clone();
        let message_origin = origin.clone();
        thread::spawn(move || {
            for request in worker.incoming_requests() {
                handle_callback(request, &expected_state, &message_origin, &bus);
            }
        });

        Ok(Self {
            server,
            origin,
            state,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn return_url(&self) -> String {
        format!("{}/oauth/complete?state={}", self.origin, self.state)
    }

    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.server.unblock();
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn handle_callback(request: tiny_http::Request, state: &str, origin: &str, bus: &MessageBus) {
    if request.method() != &Method::Get {
        let _ = request.respond(Response::from_string("method not allowed").with_status_code(405));
        return;
    }
    let url = match Url::parse(&format!("http://callback{}", request.url())) {
        Ok(url) => url,
        Err(_) => {
            let _ = request.respond(Response::from_string("bad request").with_status_code(400));
            return;
        }
    };
    if url.path() != "/oauth/complete" {
        let _ = request.respond(Response::from_string("not found").with_status_code(404));
        return;
    }
    let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
    if params.get("state").map(String::as_str) != Some(state) {
        let _ = request.respond(Response::from_string("state mismatch").with_status_code(400));
        return;
    }

    let platform = params.get("platform").cloned();
    let data = match params.get("status").map(String::as_str) {
        Some("success") => json!({"type": "oauth_success", "platform": platform}),
        _ => {
            let error = params
                .get("error_description")
                .or_else(|| params.get("error"))
                .cloned();
            json!({"type": "oauth_error", "platform": platform, "error": error})
        }
    };
    bus.post(WindowMessage {
        origin: origin.to_string(),
        data,
    });

    let page = Response::from_string(HTML_DONE.clone());
    let page = match Header::from_bytes(&b"Content-Type"[..], &b"text/html; charset=utf-8"[..]) {
        Ok(header) => page.with_header(header),
        Err(_) => page,
    };
    let _ = request.respond(page);
}

fn random_string(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub struct BrowserOpener {
    bus: Arc<MessageBus>,
    callback_addr: String,
}

impl BrowserOpener {
    pub fn new(bus: Arc<MessageBus>, callback_addr: impl Into<String>) -> Self {
        Self {
            bus,
            callback_addr: callback_addr.into(),
        }
    }
}

struct BrowserPopup {
    listener: CallbackListener,
    closed: AtomicBool,
}

impl Popup for BrowserPopup {
    // A browser tab cannot be watched; only an explicit close counts.
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.listener.shutdown();
    }

    fn origin(&self) -> Option<String> {
        Some(self.listener.origin().to_string())
    }
}

impl PopupOpener for BrowserOpener {
    fn open(&self, url: &str, size: PopupSize) -> Result<Box<dyn Popup>> {
        let listener = CallbackListener::start(&self.callback_addr, self.bus.clone())?;
        let mut target = Url::parse(url).with_context(|| format!("oauth: parse auth url {url}"))?;
        target
            .query_pairs_mut()
            .append_pair("return_to", &listener.return_url());
        tracing::debug!(width = size.width, height = size.height, "oauth: opening browser");
        webbrowser::open(target.as_str()).context("oauth: open browser")?;
        Ok(Box::new(BrowserPopup {
            listener,
            closed: AtomicBool::new(false),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::FakeBackend;
    use crate::clock::ManualClock;
    use crate::connections::ConnectionService;
    use std::time::Instant;

    const APP: &str = "https://app.example.com";
    const PARTNER: &str = "https://auth.partner.io";

    #[derive(Default)]
    struct FakeOpener {
        opened: Mutex<Vec<(String, PopupSize)>>,
        windows: Mutex<Vec<Arc<AtomicBool>>>,
        fail: AtomicBool,
    }

    struct FakePopup {
        closed: Arc<AtomicBool>,
    }

    impl Popup for FakePopup {
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    impl PopupOpener for FakeOpener {
        fn open(&self, url: &str, size: PopupSize) -> Result<Box<dyn Popup>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow!("popup blocked"));
            }
            let closed = Arc::new(AtomicBool::new(false));
            self.opened.lock().push((url.to_string(), size));
            self.windows.lock().push(closed.clone());
            Ok(Box::new(FakePopup { closed }))
        }
    }

    impl FakeOpener {
        fn window(&self, index: usize) -> Arc<AtomicBool> {
            self.windows.lock()[index].clone()
        }
    }

    struct Harness {
        backend: Arc<FakeBackend>,
        social: Arc<SocialCache>,
        opener: Arc<FakeOpener>,
        bus: Arc<MessageBus>,
        coordinator: Arc<PopupOAuthCoordinator>,
    }

    fn harness(timeout: Duration) -> Harness {
        let backend = Arc::new(FakeBackend::new());
        backend.respond("GET /connections", json!({"connections": []}));
        backend.respond("POST /connections/facebook/connect", json!({"auth_url": "https://fb/oauth"}));
        backend.respond("POST /connections/linkedin/connect", json!({"auth_url": "https://li/oauth"}));
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
        let social = Arc::new(SocialCache::new(
            ConnectionService::new(backend.clone()),
            clock.clone(),
            Duration::from_secs(300),
        ));
        let opener = Arc::new(FakeOpener::default());
        let bus = Arc::new(MessageBus::new());
        let coordinator = Arc::new(PopupOAuthCoordinator::new(
            social.clone(),
            opener.clone(),
            bus.clone(),
            clock,
            CoordinatorConfig {
                poll_interval: Duration::from_millis(20),
                timeout,
                popup: PopupSize::default(),
                trusted_origins: vec![PARTNER.to_string()],
            },
        ));
        Harness {
            backend,
            social,
            opener,
            bus,
            coordinator,
        }
    }

    fn message(origin: &str, data: Value) -> WindowMessage {
        WindowMessage {
            origin: origin.to_string(),
            data,
        }
    }

    fn spawn_complete(h: &Harness, pending: PendingAuthorization) -> thread::JoinHandle<Outcome> {
        let coordinator = h.coordinator.clone();
        thread::spawn(move || coordinator.complete(pending))
    }

    #[test]
    fn allow_list_matches_scheme_host_and_port() {
        let allow = OriginAllowList::new(&Url::parse("https://app.example.com/api/").unwrap(), &[PARTNER.into()]);
        assert!(allow.allows("https://app.example.com"));
        assert!(allow.allows("https://auth.partner.io/callback"));
        assert!(!allow.allows("http://app.example.com"));
        assert!(!allow.allows("https://app.example.com:8443"));
        assert!(!allow.allows("https://evil.example.net"));
        assert!(!allow.allows("null"));
    }

    #[test]
    fn success_message_closes_popup_and_resyncs() {
        let h = harness(Duration::from_secs(5));
        h.social.connections(false);
        let pending = h.coordinator.initiate(Platform::Facebook).unwrap();
        assert_eq!(h.opener.opened.lock()[0], ("https://fb/oauth".to_string(), PopupSize { width: 500, height: 600 }));
        assert!(matches!(
            h.coordinator.state(Platform::Facebook),
            OAuthState::AwaitingCompletion { platform: Platform::Facebook, created_at_ms: 1_000 }
        ));

        let handle = spawn_complete(&h, pending);
        h.bus.post(message(APP, json!({"type": "oauth_success", "platform": "facebook"})));
        assert_eq!(handle.join().unwrap(), Outcome::Success);

        assert!(h.opener.window(0).load(Ordering::SeqCst));
        assert_eq!(h.bus.listener_count(), 0);
        assert_eq!(h.backend.count("GET /connections"), 2);
        assert_eq!(
            h.coordinator.state(Platform::Facebook),
            OAuthState::Completed(Outcome::Success)
        );
    }

    #[test]
    fn untrusted_origin_does_not_touch_cache() {
        let h = harness(Duration::from_secs(5));
        h.social.connections(false);
        let pending = h.coordinator.initiate(Platform::Facebook).unwrap();
        let handle = spawn_complete(&h, pending);

        h.bus.post(message("https://evil.example.net", json!({"type": "oauth_success"})));
        thread::sleep(Duration::from_millis(100));
        assert!(h.social.connections_cache().is_valid());
        assert_eq!(h.backend.count("GET /connections"), 1);
        assert!(matches!(
            h.coordinator.state(Platform::Facebook),
            OAuthState::AwaitingCompletion { .. }
        ));

        h.bus.post(message(PARTNER, json!({"type": "OAUTH_SUCCESS"})));
        assert_eq!(handle.join().unwrap(), Outcome::Success);
        assert_eq!(h.backend.count("GET /connections"), 2);
    }

    #[test]
    fn closed_popup_without_message_is_unknown_and_resyncs() {
        let h = harness(Duration::from_secs(5));
        h.social.connections(false);
        let pending = h.coordinator.initiate(Platform::Facebook).unwrap();
        h.opener.window(0).store(true, Ordering::SeqCst);

        let outcome = h.coordinator.complete(pending);
        assert_eq!(outcome, Outcome::Unknown);
        assert_eq!(h.backend.count("GET /connections"), 2);
        assert_eq!(h.bus.listener_count(), 0);
    }

    #[test]
    fn message_beats_close_poll_when_both_ready() {
        let h = harness(Duration::from_secs(5));
        let pending = h.coordinator.initiate(Platform::Facebook).unwrap();
        h.bus.post(message(APP, json!({"type": "oauth_success"})));
        h.opener.window(0).store(true, Ordering::SeqCst);
        assert_eq!(h.coordinator.complete(pending), Outcome::Success);
    }

    #[test]
    fn timeout_cleans_up_and_resyncs() {
        let h = harness(Duration::from_millis(80));
        let started = Instant::now();
        let pending = h.coordinator.initiate(Platform::Facebook).unwrap();
        let outcome = h.coordinator.complete(pending);
        assert_eq!(outcome, Outcome::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert!(h.opener.window(0).load(Ordering::SeqCst));
        assert_eq!(h.bus.listener_count(), 0);
        assert_eq!(h.backend.count("GET /connections"), 1);
    }

    #[test]
    fn error_message_is_reported() {
        let h = harness(Duration::from_secs(5));
        let pending = h.coordinator.initiate(Platform::Facebook).unwrap();
        let handle = spawn_complete(&h, pending);
        h.bus.post(message(
            APP,
            json!({"type": "oauth_error", "platform": "facebook", "error": "access_denied"}),
        ));
        assert_eq!(handle.join().unwrap(), Outcome::Error("access_denied".into()));
        assert!(h.opener.window(0).load(Ordering::SeqCst));
    }

    #[test]
    fn messages_for_other_platforms_are_ignored() {
        let h = harness(Duration::from_millis(150));
        let pending = h.coordinator.initiate(Platform::Facebook).unwrap();
        h.bus.post(message(APP, json!({"type": "oauth_success", "platform": "linkedin"})));
        assert_eq!(h.coordinator.complete(pending), Outcome::Timeout);
    }

    #[test]
    fn second_flow_cancels_first() {
        let h = harness(Duration::from_secs(5));
        let first = h.coordinator.initiate(Platform::Facebook).unwrap();
        let first_handle = spawn_complete(&h, first);
        let second = h.coordinator.initiate(Platform::Facebook).unwrap();

        assert_eq!(first_handle.join().unwrap(), Outcome::Cancelled);
        assert!(h.opener.window(0).load(Ordering::SeqCst));
        assert_eq!(h.bus.listener_count(), 1);
        assert_eq!(h.backend.count("GET /connections"), 0);

        let second_handle = spawn_complete(&h, second);
        h.bus.post(message(APP, json!({"type": "oauth_success"})));
        assert_eq!(second_handle.join().unwrap(), Outcome::Success);
        assert_eq!(h.bus.listener_count(), 0);
    }

    #[test]
    fn token_platforms_and_blocked_popups_fail_fast() {
        let h = harness(Duration::from_secs(5));
        assert!(matches!(
            h.coordinator.initiate(Platform::Wordpress),
            Err(OAuthError::UnsupportedPlatform(Platform::Wordpress))
        ));
        h.opener.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            h.coordinator.initiate(Platform::Linkedin),
            Err(OAuthError::Popup(_))
        ));
        assert_eq!(h.bus.listener_count(), 0);
        assert!(matches!(
            h.coordinator.initiate(Platform::Tiktok),
            Err(OAuthError::Api(_))
        ));
    }

    #[test]
    fn dropping_pending_flow_removes_listener() {
        let h = harness(Duration::from_secs(5));
        let pending = h.coordinator.initiate(Platform::Linkedin).unwrap();
        assert_eq!(h.bus.listener_count(), 1);
        drop(pending);
        assert_eq!(h.bus.listener_count(), 0);
        assert!(h.opener.window(0).load(Ordering::SeqCst));
        assert_eq!(
            h.coordinator.state(Platform::Linkedin),
            OAuthState::Completed(Outcome::Cancelled)
        );
        assert!(h.coordinator.flows.active.lock().is_empty());
        assert_eq!(h.backend.count("GET /connections"), 0);

        let again = h.coordinator.initiate(Platform::Linkedin).unwrap();
        assert!(matches!(
            h.coordinator.state(Platform::Linkedin),
            OAuthState::AwaitingCompletion { .. }
        ));
        drop(again);
    }

    #[test]
    fn callback_listener_posts_messages_for_valid_state() {
        let bus = Arc::new(MessageBus::new());
        let listener = bus.register();
        let callback = CallbackListener::start("127.0.0.1:0", bus.clone()).unwrap();
        let client = reqwest::blocking::Client::new();

        let bad = client
            .get(format!("{}/oauth/complete?state=wrong&status=success", callback.origin()))
            .send()
            .unwrap();
        assert_eq!(bad.status().as_u16(), 400);
        assert!(listener.rx.try_recv().is_err());

        let ok = client
            .get(format!("{}&status=success&platform=youtube", callback.return_url()))
            .send()
            .unwrap();
        assert!(ok.status().is_success());

        let received = listener.rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received.origin, callback.origin());
        assert_eq!(
            serde_json::from_value::<OAuthMessage>(received.data).unwrap(),
            OAuthMessage::Success { platform: Some(Platform::Youtube) }
        );
        callback.shutdown();
    }
}
