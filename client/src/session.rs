//! Login session driver
//!
//! A [`Session`] owns everything one login needs: the connector, the cookie
//! jar, the host checker state and the form callbacks. [`Session::negotiate_session`]
//! runs the request/response loop until the gateway reports success.

use crate::csd::{CsdHook, CsdRequest, CsdState};
use crate::error::{BoxError, SessionError};
use crate::present::{FormHandler, FormOutcome, process_auth_form};
use crate::stoken::{UnlockOutcome, unlock_soft_token};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tollgate_crypto::{TokenGenerator, TokenMode, sha1_hex, sha1_matches};
use tollgate_protocol::{
    AuthForm, ClientIdentity, DEFAULT_BODY_CAPACITY, Element, InitRequest, KeepaliveAction,
    KeepaliveState, ParseContext, ReplyContext, default_csd_tag, encode_init_request,
    encode_legacy, encode_structured, parse_auth_response,
};
use tollgate_transport::{
    BoxedStream, CancelToken, Connector, CookieJar, HttpConnection, HttpResponse, Request,
    SESSION_COOKIE, parse_url,
};
use tracing::{debug, error, info, trace};

pub const DEFAULT_MAX_REDIRECTS: usize = 10;
pub const DEFAULT_USER_AGENT: &str = "Open AnyConnect VPN Agent";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const CSD_COOKIE: &str = "sdesktop";
const CONFIG_COOKIE: &str = "webvpnc";
const REFRESH_DELAY: Duration = Duration::from_secs(1);

/// `"<base> v<version>"`
pub fn user_agent(base: &str) -> String {
    format!("{} v{}", base, env!("CARGO_PKG_VERSION"))
}

/// Per-session knobs
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub useragent: String,
    /// Structured (XML) bodies instead of query strings
    pub xmlpost: bool,
    pub no_http_keepalive: bool,
    /// Refuse any form that needs input
    pub no_passwd: bool,
    /// Redirects and refreshes allowed between two form submissions
    pub max_redirects: usize,
    pub identity: ClientIdentity,
    /// Checksum of the gateway config we already have
    pub xml_sha1: Option<String>,
    pub body_capacity: usize,
    pub csd_tag: String,
    pub csd_nostub: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            useragent: user_agent(DEFAULT_USER_AGENT),
            xmlpost: true,
            no_http_keepalive: false,
            no_passwd: false,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            identity: ClientIdentity::default(),
            xml_sha1: None,
            body_capacity: DEFAULT_BODY_CAPACITY,
            csd_tag: default_csd_tag().to_string(),
            csd_nostub: false,
        }
    }
}

/// Receives a gateway configuration whose checksum changed
#[async_trait]
pub trait ConfigSink: Send {
    async fn write_config(&mut self, data: &[u8]) -> Result<(), BoxError>;
}

/// Writes downloaded configuration to a file
pub struct FileConfigSink {
    path: PathBuf,
}

impl FileConfigSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSink for FileConfigSink {
    async fn write_config(&mut self, data: &[u8]) -> Result<(), BoxError> {
        tokio::fs::write(&self.path, data).await?;
        info!("Wrote gateway config to {}", self.path.display());
        Ok(())
    }
}

/// Next request to send
#[derive(Debug, Clone, PartialEq, Eq)]
enum Pending {
    /// Structured `init` document
    Init { cert_fail: bool },
    Get,
    Post(String),
}

/// What a parsed form asks the driver to do
#[derive(Debug)]
enum FormStep {
    LoggedIn,
    /// Fetch and run the host checker stub
    Csd,
    /// Restart with the newly selected auth group
    NewGroup,
    Submit(String),
}

/// Location of a downloaded gateway config
#[derive(Debug, Clone, PartialEq, Eq)]
struct ConfigTarget {
    base: String,
    file: String,
    sha1: String,
}

/// One login to one gateway
pub struct Session {
    options: SessionOptions,
    connector: Box<dyn Connector>,
    handler: Option<Box<dyn FormHandler>>,
    csd_hook: Option<Box<dyn CsdHook>>,
    config_sink: Option<Box<dyn ConfigSink>>,
    tokens: TokenGenerator,
    cancel: CancelToken,

    cookies: CookieJar,
    csd: CsdState,
    /// The next 200 body is the host checker stub
    awaiting_stub: bool,
    authgroup: Option<String>,
    opaque: Option<Element>,
    session_token: Option<String>,

    host: String,
    port: u16,
    path: Option<String>,
    conn: Option<HttpConnection<BoxedStream>>,

    keepalive: Option<KeepaliveState>,
}

/// Builds a [`Session`]
pub struct SessionBuilder {
    options: SessionOptions,
    connector: Box<dyn Connector>,
    handler: Option<Box<dyn FormHandler>>,
    csd_hook: Option<Box<dyn CsdHook>>,
    config_sink: Option<Box<dyn ConfigSink>>,
    tokens: TokenGenerator,
    authgroup: Option<String>,
    cancel: CancelToken,
}

impl SessionBuilder {
    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn form_handler(mut self, handler: impl FormHandler + 'static) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn csd_hook(mut self, hook: impl CsdHook + 'static) -> Self {
        self.csd_hook = Some(Box::new(hook));
        self
    }

    pub fn config_sink(mut self, sink: impl ConfigSink + 'static) -> Self {
        self.config_sink = Some(Box::new(sink));
        self
    }

    pub fn tokens(mut self, tokens: TokenGenerator) -> Self {
        self.tokens = tokens;
        self
    }

    /// Auth group remembered from an earlier login
    pub fn authgroup(mut self, group: Option<String>) -> Self {
        self.authgroup = group;
        self
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> Session {
        Session {
            options: self.options,
            connector: self.connector,
            handler: self.handler,
            csd_hook: self.csd_hook,
            config_sink: self.config_sink,
            tokens: self.tokens,
            cancel: self.cancel,
            cookies: CookieJar::new(),
            csd: CsdState::default(),
            awaiting_stub: false,
            authgroup: self.authgroup,
            opaque: None,
            session_token: None,
            host: String::new(),
            port: 443,
            path: None,
            conn: None,
            keepalive: None,
        }
    }
}

impl Session {
    pub fn builder(connector: impl Connector + 'static) -> SessionBuilder {
        SessionBuilder {
            options: SessionOptions::default(),
            connector: Box::new(connector),
            handler: None,
            csd_hook: None,
            config_sink: None,
            tokens: TokenGenerator::default(),
            authgroup: None,
            cancel: CancelToken::never(),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current request path, without its leading `/`
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    /// Auth group in effect; updated when the user picks another one
    pub fn authgroup(&self) -> Option<&str> {
        self.authgroup.as_deref()
    }

    pub fn csd(&self) -> &CsdState {
        &self.csd
    }

    pub fn tokens(&self) -> &TokenGenerator {
        &self.tokens
    }

    /// Log in at `start_url` and return the session cookie
    pub async fn negotiate_session(&mut self, start_url: &str) -> Result<String, SessionError> {
        let url = parse_url(start_url, Some(443)).map_err(|e| {
            error!("Failed to parse server URL '{}': {}", start_url, e);
            SessionError::from(e)
        })?;
        if url.scheme.as_deref().is_some_and(|s| s != "https") {
            error!("Only https:// URLs are supported: '{}'", start_url);
            return Err(SessionError::Unsupported(format!(
                "Only https:// URLs are supported: '{}'",
                start_url
            )));
        }
        self.host = url.host;
        self.port = url.port;
        self.path = url.path;

        self.tokens.reset();
        if self.tokens.mode() == TokenMode::HardwareSeed {
            let handler = self.handler.as_deref_mut();
            if unlock_soft_token(&mut self.tokens, handler).await? == UnlockOutcome::Cancelled {
                info!("Soft token unlock cancelled; token codes disabled");
                self.tokens.disable();
            }
        }

        let result = self.login().await;
        if let Some(hook) = self.csd_hook.as_deref_mut() {
            hook.cleanup();
        }
        let cookie = result?;

        if self.config_sink.is_some() {
            let target = self
                .cookies
                .get(CONFIG_COOKIE)
                .and_then(|v| parse_webvpnc(v, self.options.xml_sha1.as_deref()));
            if let Some(target) = target {
                if let Err(e) = self.fetch_config(&target).await {
                    error!("Failed to fetch new gateway config: {}", e);
                }
            }
        }

        Ok(cookie)
    }

    async fn login(&mut self) -> Result<String, SessionError> {
        let mut pending = self.initial_request();
        let mut hops = 0;

        loop {
            let resp = self.fetch(&pending).await?;

            if resp.status != 200 {
                if let Some(location) = &resp.location {
                    self.count_hop(&mut hops)?;
                    self.follow_location(location).await?;
                    continue;
                }
            }
            if resp.status != 200 || resp.body.is_empty() {
                error!("Unexpected {} result from server", resp.status);
                return Err(SessionError::Protocol(format!(
                    "Unexpected {} result from server",
                    resp.status
                )));
            }

            if self.awaiting_stub {
                self.run_csd_stub(&resp.body).await?;
                pending = Pending::Get;
                hops = 0;
                continue;
            }

            let body = resp.body_str();
            if !body.trim_start().starts_with("<?xml") {
                if body.to_ascii_lowercase().contains("http-equiv=\"refresh\"") {
                    info!("Refreshing {} after 1 second...", self.path_str());
                    self.count_hop(&mut hops)?;
                    self.sleep(REFRESH_DELAY).await?;
                    continue;
                }
                error!("Unknown response from server");
                return Err(SessionError::Protocol(
                    "Unknown response from server".to_string(),
                ));
            }

            let parsed = {
                let mut ctx = ParseContext {
                    cert_request_allowed: pending == Pending::Init { cert_fail: false },
                    csd_done: self.csd.done,
                    csd_nostub: self.options.csd_nostub,
                    csd_tag: &self.options.csd_tag,
                    token: Some(&mut self.tokens),
                };
                parse_auth_response(&body, &mut ctx)?
            };

            if parsed.session_token.is_some() {
                self.session_token = parsed.session_token;
            }
            if parsed.opaque.is_some() {
                self.opaque = parsed.opaque;
            }
            if !self.csd.done {
                self.csd.apply(parsed.csd);
            }

            if parsed.cert_requested {
                info!("Server requested a client certificate; none configured");
                pending = Pending::Init { cert_fail: true };
                continue;
            }

            let mut form = parsed.form;
            hops = 0;
            match self.handle_auth_form(&mut form).await? {
                FormStep::LoggedIn => break,
                FormStep::Csd => {
                    self.prepare_csd_fetch().await?;
                    pending = Pending::Get;
                }
                FormStep::NewGroup => {
                    pending = self.initial_request();
                }
                FormStep::Submit(body) => {
                    if let Some(action) = form.action.as_deref().filter(|a| !a.is_empty()) {
                        self.follow_location(action).await?;
                    }
                    pending = Pending::Post(body);
                }
            }
        }

        let cookie = self
            .session_token
            .clone()
            .or_else(|| self.cookies.get(SESSION_COOKIE).map(str::to_string));
        match cookie {
            Some(cookie) => {
                info!("Login to {} succeeded", self.host);
                Ok(cookie)
            }
            None => {
                error!("Server reported success but sent no session cookie");
                Err(SessionError::Protocol(
                    "Server reported success but sent no session cookie".to_string(),
                ))
            }
        }
    }

    fn initial_request(&self) -> Pending {
        if self.options.xmlpost {
            Pending::Init { cert_fail: false }
        } else {
            Pending::Get
        }
    }

    async fn handle_auth_form(&mut self, form: &mut AuthForm) -> Result<FormStep, SessionError> {
        if form.is_success() {
            return Ok(FormStep::LoggedIn);
        }

        if self.options.no_passwd {
            error!("Asked for password but no-passwd is set");
            return Err(SessionError::AuthDenied(
                "Asked for password but no-passwd is set".to_string(),
            ));
        }

        if !self.csd.done && self.csd.is_complete() {
            self.cookies.clear();
            return Ok(FormStep::Csd);
        }

        if form.opts.is_empty() {
            if let Some(message) = &form.message {
                info!("{}", message);
            }
            if let Some(err) = &form.error {
                error!("{}", err);
            }
            let reason = form
                .error
                .clone()
                .or_else(|| form.message.clone())
                .unwrap_or_else(|| "Login failed".to_string());
            return Err(SessionError::AuthDenied(reason));
        }

        let xmlpost = self.options.xmlpost;
        let handler = self.handler.as_deref_mut();
        match process_auth_form(form, handler, xmlpost, &mut self.authgroup).await? {
            FormOutcome::Ok => {}
            FormOutcome::Cancelled => {
                info!("Login cancelled by user");
                return Err(SessionError::UserCancelled);
            }
            FormOutcome::NewGroup => return Ok(FormStep::NewGroup),
        }

        // After the user has seen the form, so a username can be entered first
        self.tokens.generate(form)?;

        let capacity = self.options.body_capacity;
        let body = if xmlpost {
            let reply = ReplyContext {
                opaque: self.opaque.as_ref(),
                csd_token: self.csd.token.as_deref(),
            };
            encode_structured(form, &self.options.identity, reply, capacity)?
        } else {
            encode_legacy(form, capacity)?
        };
        Ok(FormStep::Submit(body))
    }

    /// Send `pending` on the open connection, or on a new one
    async fn fetch(&mut self, pending: &Pending) -> Result<HttpResponse, SessionError> {
        let payload = match pending {
            Pending::Get => None,
            Pending::Post(body) => Some(body.clone()),
            Pending::Init { cert_fail } => {
                let init = InitRequest {
                    host: &self.host,
                    path: self.path.as_deref(),
                    cert_fail: *cert_fail,
                    authgroup: self.authgroup.as_deref(),
                };
                Some(encode_init_request(
                    &self.options.identity,
                    &init,
                    self.options.body_capacity,
                )?)
            }
        };

        let path = self.path.clone().unwrap_or_default();
        let req = match &payload {
            Some(data) => Request::post(
                &self.host,
                &path,
                &self.options.useragent,
                FORM_CONTENT_TYPE,
                data.as_bytes(),
            ),
            None => Request::get(&self.host, &path, &self.options.useragent),
        };

        if self.port == 443 {
            info!("{} https://{}/{}", req.method, self.host, path);
        } else {
            info!("{} https://{}:{}/{}", req.method, self.host, self.port, path);
        }

        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                let stream = self
                    .connector
                    .connect(&self.host, self.port, &self.cancel)
                    .await
                    .map_err(|e| {
                        error!("Failed to open HTTPS connection to {}: {}", self.host, e);
                        SessionError::from(e)
                    })?;
                HttpConnection::new(stream)
            }
        };

        let resp = conn.exchange(&req, &mut self.cookies, &self.cancel).await?;
        trace!("Got HTTP response: {} ({} bytes)", resp.status, resp.body.len());

        if resp.close || self.options.no_http_keepalive {
            conn.shutdown().await;
        } else {
            self.conn = Some(conn);
        }
        Ok(resp)
    }

    /// Point the next request at `location`
    ///
    /// A move to another host or port drops the connection, the cached
    /// address and every cookie.
    async fn follow_location(&mut self, location: &str) -> Result<(), SessionError> {
        if location.starts_with("https://") {
            let url = parse_url(location, None).map_err(|e| {
                error!("Failed to parse redirected URL '{}': {}", location, e);
                SessionError::from(e)
            })?;

            if !url.host.eq_ignore_ascii_case(&self.host) || url.port != self.port {
                debug!("Redirected to new host {}:{}", url.host, url.port);
                self.host = url.host;
                self.port = url.port;
                self.connector.reset();
                self.close().await;
                self.cookies.clear();
            }
            self.path = url.path;
        } else if location.contains("://") {
            error!("Cannot follow redirection to non-https URL '{}'", location);
            return Err(SessionError::Protocol(format!(
                "Cannot follow redirection to non-https URL '{}'",
                location
            )));
        } else if let Some(absolute) = location.strip_prefix('/') {
            self.path = Some(absolute.to_string());
        } else {
            let dir = self
                .path
                .as_deref()
                .and_then(|p| p.rfind('/').map(|i| &p[..i]));
            self.path = Some(match dir {
                Some(dir) => format!("{}/{}", dir, location),
                None => location.to_string(),
            });
        }
        Ok(())
    }

    fn count_hop(&self, hops: &mut usize) -> Result<(), SessionError> {
        *hops += 1;
        if *hops > self.options.max_redirects {
            error!("Too many redirects (limit {})", self.options.max_redirects);
            return Err(SessionError::TooManyRedirects(self.options.max_redirects));
        }
        Ok(())
    }

    async fn prepare_csd_fetch(&mut self) -> Result<(), SessionError> {
        if self.csd_hook.is_none() {
            error!("Server requested host checker (CSD) but no CSD hook is configured");
            return Err(SessionError::Unsupported(
                "Host checker (CSD) requested but not configured".to_string(),
            ));
        }
        let Some(location) = self.csd.stub_location().map(str::to_string) else {
            error!("Host checker (CSD) requested without a stub URL");
            return Err(SessionError::Protocol(
                "Host checker (CSD) requested without a stub URL".to_string(),
            ));
        };

        debug!("Fetching CSD stub from {}", location);
        self.follow_location(&location).await?;
        self.awaiting_stub = true;
        Ok(())
    }

    async fn run_csd_stub(&mut self, script: &[u8]) -> Result<(), SessionError> {
        self.awaiting_stub = false;

        let Some(hook) = self.csd_hook.as_deref_mut() else {
            error!("No CSD hook to run the stub");
            return Err(SessionError::Unsupported(
                "Host checker (CSD) requested but not configured".to_string(),
            ));
        };
        let (Some(ticket), Some(starturl), Some(waiturl)) = (
            self.csd.ticket.as_deref(),
            self.csd.starturl.as_deref(),
            self.csd.waiturl.clone(),
        ) else {
            error!("Host checker (CSD) state is incomplete");
            return Err(SessionError::Protocol(
                "Host checker (CSD) state is incomplete".to_string(),
            ));
        };

        let start_url = if starturl.starts_with("https://") {
            starturl.to_string()
        } else {
            format!("https://{}{}", self.host, starturl)
        };
        let request = CsdRequest {
            script,
            ticket,
            group: self.authgroup.as_deref().unwrap_or_default(),
            host: &self.host,
            start_url: &start_url,
        };
        hook.run(&request).await.map_err(|e| {
            error!("Failed to run CSD script: {}", e);
            SessionError::Handler(e)
        })?;

        self.csd.stuburl = None;
        self.csd.waiturl = None;
        self.csd.done = true;
        if waiturl.starts_with("https://") {
            self.follow_location(&waiturl).await?;
        } else {
            self.path = Some(waiturl.strip_prefix('/').unwrap_or(&waiturl).to_string());
        }
        if let Some(token) = self.csd.token.as_deref() {
            self.cookies.set(CSD_COOKIE, token);
        }
        Ok(())
    }

    async fn fetch_config(&mut self, target: &ConfigTarget) -> Result<(), SessionError> {
        let location = format!("{}{}", target.base, target.file);
        let config_path = if location.starts_with("https://") {
            parse_url(&location, None)?.path
        } else {
            Some(location.trim_start_matches('/').to_string())
        };

        let login_path = std::mem::replace(&mut self.path, config_path);
        let resp = self.fetch(&Pending::Get).await;
        let path = std::mem::replace(&mut self.path, login_path);
        let resp = resp?;

        if resp.status != 200 {
            error!("Unexpected {} result fetching /{}", resp.status, path.unwrap_or_default());
            return Err(SessionError::Protocol(format!(
                "Unexpected {} result from server",
                resp.status
            )));
        }
        if !sha1_matches(&resp.body, &target.sha1) {
            error!("Downloaded config file did not match intended SHA1");
            debug!("Got SHA1 {}, expected {}", sha1_hex(&resp.body), target.sha1);
            return Err(SessionError::Protocol(
                "Downloaded config file did not match intended SHA1".to_string(),
            ));
        }

        let Some(sink) = self.config_sink.as_deref_mut() else {
            return Ok(());
        };
        sink.write_config(&resp.body).await.map_err(|e| {
            error!("Failed to write new gateway config: {}", e);
            SessionError::Handler(e)
        })?;
        self.options.xml_sha1 = Some(target.sha1.clone());
        Ok(())
    }

    async fn sleep(&self, duration: Duration) -> Result<(), SessionError> {
        self.cancel
            .run(tokio::time::sleep(duration))
            .await
            .ok_or_else(|| {
                error!("Login cancelled");
                SessionError::Cancelled
            })
    }

    fn path_str(&self) -> &str {
        self.path.as_deref().unwrap_or_default()
    }

    /// Close the open connection, if any
    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.shutdown().await;
        }
    }

    /// Arm the tunnel liveness timers
    pub fn start_keepalive(&mut self, dpd: Duration, keepalive: Duration, rekey: Duration) {
        self.keepalive = Some(KeepaliveState::new(dpd, keepalive, rekey, Instant::now()));
    }

    pub fn keepalive_mut(&mut self) -> Option<&mut KeepaliveState> {
        self.keepalive.as_mut()
    }

    /// Next liveness action; `timeout` is only ever tightened
    pub fn compute_keepalive_action(
        &mut self,
        now: Instant,
        timeout: &mut Duration,
    ) -> KeepaliveAction {
        match self.keepalive.as_mut() {
            Some(state) => state.keepalive_action(now, timeout),
            None => KeepaliveAction::None,
        }
    }

    /// Liveness check while the channel cannot be written
    pub fn stalled_action(&self, now: Instant, timeout: &mut Duration) -> KeepaliveAction {
        match self.keepalive.as_ref() {
            Some(state) => state.stalled_action(now, timeout),
            None => KeepaliveAction::None,
        }
    }
}

/// Split a `bu:<base>&fu:<file>&fh:<sha1>` cookie
///
/// Returns `None` when a part is missing or the checksum equals `known`.
fn parse_webvpnc(value: &str, known: Option<&str>) -> Option<ConfigTarget> {
    let mut base = None;
    let mut file = None;
    let mut sha1 = None;

    for part in value.split('&') {
        if let Some(v) = part.strip_prefix("bu:") {
            base = Some(v);
        } else if let Some(v) = part.strip_prefix("fu:") {
            file = Some(v);
        } else if let Some(v) = part.strip_prefix("fh:") {
            if known.is_some_and(|k| k.eq_ignore_ascii_case(v)) {
                debug!("Gateway config is unchanged");
                return None;
            }
            sha1 = Some(v);
        }
    }

    Some(ConfigTarget {
        base: base?.to_string(),
        file: file?.to_string(),
        sha1: sha1?.to_string(),
    })
}
