//! Stateful HTTP test session.
//!
//! Every test actor owns one [`HttpSession`]. The session keeps a private
//! cookie jar and records the outcome of the most recent request: status,
//! body, and (for 3xx responses) the redirect target. Redirect-following is
//! disabled at the transport level on purpose: one action produces exactly
//! one recorded response, so a test can assert on an intermediate 302 (for
//! example that a failed login redirects back to `/auth/login`) before
//! deciding whether to follow it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::redirect::Policy;
use reqwest::{Client, RequestBuilder, Url};
use tracing::debug;

/// Marker the server embeds in rendered pages, holding the anti-forgery
/// token required on state-changing form submissions.
const CSRF_MARKER: &str = "_sc_globalCsrf = \"";

#[derive(Debug, Clone)]
struct LastResponse {
    status: u16,
    body: String,
    redirect_url: Option<String>,
}

pub struct HttpSession {
    /// Root endpoint of the server under test. Mutable mid-test to simulate
    /// tenant subdomain routing against the same instance.
    pub base_url: String,
    jar: Arc<Jar>,
    client: Client,
    last: Option<LastResponse>,
}

impl HttpSession {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        let client = build_client(&jar)?;
        Ok(Self {
            base_url: base_url.into(),
            jar,
            client,
            last: None,
        })
    }

    /// Session against a locally bound instance.
    pub fn for_port(port: u16) -> Result<Self> {
        Self::new(format!("http://127.0.0.1:{port}/"))
    }

    /// Discard all cookies and recorded state. Starts a clean client
    /// identity; no network call is made.
    pub fn reset(&mut self) -> Result<()> {
        self.jar = Arc::new(Jar::default());
        self.client = build_client(&self.jar)?;
        self.last = None;
        Ok(())
    }

    /// GET `base_url` joined with `path`, recording status, body and
    /// redirect target. HTTP error statuses are recorded, never raised;
    /// only transport failures surface as errors.
    pub async fn get(&mut self, path: &str) -> Result<()> {
        let url = self.url_for(path)?;
        let request = self.client.get(url);
        self.send(request).await
    }

    /// [`HttpSession::get`] with an explicit per-request bound. Individual
    /// calls otherwise inherit the transport default.
    pub async fn get_with_timeout(&mut self, path: &str, timeout: Duration) -> Result<()> {
        let url = self.url_for(path)?;
        let request = self.client.get(url).timeout(timeout);
        self.send(request).await
    }

    /// POST a form-encoded body built from `fields`, same recording
    /// contract as [`HttpSession::get`].
    pub async fn post_form(&mut self, path: &str, fields: &[(&str, &str)]) -> Result<()> {
        let url = self.url_for(path)?;
        let request = self.client.post(url).form(fields);
        self.send(request).await
    }

    pub async fn post_form_with_timeout(
        &mut self,
        path: &str,
        fields: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<()> {
        let url = self.url_for(path)?;
        let request = self.client.post(url).form(fields).timeout(timeout);
        self.send(request).await
    }

    /// GET the pending redirect target. Errors if the last response was not
    /// a redirect.
    pub async fn follow_redirect(&mut self) -> Result<()> {
        let target = self
            .redirect_url()
            .context("no redirect pending in this session")?
            .to_string();
        self.get(&target).await
    }

    /// Status code of the most recent response, unset before the first
    /// request and after [`HttpSession::reset`].
    pub fn status(&self) -> Option<u16> {
        self.last.as_ref().map(|last| last.status)
    }

    /// Body of the most recent response.
    pub fn content(&self) -> Option<&str> {
        self.last.as_ref().map(|last| last.body.as_str())
    }

    /// Redirect target of the most recent response. Defined iff the status
    /// was in [300,400). The target is the last whitespace-delimited token
    /// of the body, which is how the server under test spells its redirect
    /// responses ("Found. Redirecting to /auth/login").
    pub fn redirect_url(&self) -> Option<&str> {
        self.last
            .as_ref()
            .and_then(|last| last.redirect_url.as_deref())
    }

    /// Anti-forgery token embedded in the last response body. Returns an
    /// empty string when the marker is absent so tests can assert on its
    /// absence.
    pub fn csrf(&self) -> String {
        let Some(body) = self.content() else {
            return String::new();
        };
        let Some(start) = body.find(CSRF_MARKER) else {
            return String::new();
        };
        let rest = &body[start + CSRF_MARKER.len()..];
        match rest.find('"') {
            Some(end) => rest[..end].to_string(),
            None => String::new(),
        }
    }

    /// Cookies this session would send to `base_url`, rendered as a
    /// `Cookie` header value. This is the credential the real-time client
    /// presents at connect time.
    pub fn session_cookie(&self) -> Option<String> {
        let url = Url::parse(&self.base_url).ok()?;
        let header = self.jar.cookies(&url)?;
        header.to_str().ok().map(str::to_string)
    }

    fn url_for(&self, path: &str) -> Result<Url> {
        Url::parse(&self.base_url)
            .with_context(|| format!("invalid base url {}", self.base_url))?
            .join(path)
            .with_context(|| format!("joining {path} onto {}", self.base_url))
    }

    async fn send(&mut self, request: RequestBuilder) -> Result<()> {
        let response = request.send().await.context("request failed")?;
        let status = response.status().as_u16();
        let body = response.text().await.context("reading response body")?;
        // Always defined for a 3xx, even when the body is blank: the iff
        // relation between status class and redirect target must hold.
        let redirect_url = if (300..400).contains(&status) {
            Some(body.split_whitespace().last().unwrap_or("").to_string())
        } else {
            None
        };
        debug!(status, redirect = redirect_url.as_deref(), "response recorded");
        self.last = Some(LastResponse {
            status,
            body,
            redirect_url,
        });
        Ok(())
    }
}

fn build_client(jar: &Arc<Jar>) -> Result<Client> {
    Client::builder()
        .redirect(Policy::none())
        .cookie_provider(jar.clone())
        .build()
        .context("building session client")
}
