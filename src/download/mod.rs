pub mod assemble;
pub mod direct;
pub mod metadata;
pub mod mux;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod store;
#[cfg(test)]
pub(crate) mod testing;
pub mod tile;
pub mod video_id;

use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_LENGTH, COOKIE, ORIGIN, RANGE, REFERER, SET_COOKIE,
};
use reqwest::{Response, StatusCode};
use tracing::debug;
use url::Url;

use crate::cookies::Session;
use crate::error::{DriveError, Result};
use crate::options::Options;

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// HTTP access to the hosting service, shaped like the in-browser viewer.
pub struct DriveClient {
    client: reqwest::Client,
    base_url: Url,
    session: RwLock<Session>,
}

impl DriveClient {
    pub fn new(options: &Options, session: Session) -> Result<Self> {
        let origin = options.base_url.origin().ascii_serialization();

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        if let Ok(value) = HeaderValue::from_str(&origin) {
            headers.insert(ORIGIN, value);
        }
        if let Ok(value) = HeaderValue::from_str(options.base_url.as_str()) {
            headers.insert(REFERER, value);
        }

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(options.request_timeout)
            .build()
            .map_err(DriveError::Http)?;

        Ok(Self {
            client,
            base_url: options.base_url.clone(),
            session: RwLock::new(session),
        })
    }

    pub fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|err| DriveError::Config(format!("invalid endpoint {}: {}", path, err)))?;

        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }

        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: &Url) -> reqwest::RequestBuilder {
        let request = self.client.request(method, url.as_str());
        match self.session.read().cookie_header() {
            Some(cookies) => request.header(COOKIE, cookies),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &Url) -> Result<Response> {
        let response = request.send().await.map_err(DriveError::from_reqwest)?;

        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(DriveError::RangeNotSatisfiable);
        }

        if let Some(err) = DriveError::from_status(response.status(), url.path()) {
            debug!(status = %response.status(), "request to {} failed", url.path());
            return Err(err);
        }

        // the service answers unauthenticated viewer requests with a sign-in page
        if is_sign_in_page(response.url()) {
            return Err(DriveError::AuthRequired(format!("{} redirected to sign-in", url.path())));
        }

        Ok(response)
    }

    pub async fn get(&self, url: &Url) -> Result<Response> {
        self.send(self.request(reqwest::Method::GET, url), url).await
    }

    /// GET from byte `start` on, with its own timeout for long streamed bodies.
    /// `None` when the service says the range starts past the end.
    pub async fn get_range(&self, url: &Url, start: Option<u64>, timeout: Duration) -> Result<Option<Response>> {
        let mut request = self.request(reqwest::Method::GET, url).timeout(timeout);
        if let Some(start) = start {
            request = request.header(RANGE, format!("bytes={}-", start));
        }

        match self.send(request, url).await {
            Err(DriveError::RangeNotSatisfiable) => Ok(None),
            other => other.map(Some),
        }
    }

    pub async fn get_bytes(&self, url: &Url) -> Result<Bytes> {
        self.get(url).await?.bytes().await.map_err(DriveError::from_reqwest)
    }

    pub async fn get_text(&self, url: &Url) -> Result<String> {
        let response = self.get(url).await?;
        self.absorb_cookies(response.headers());
        response.text().await.map_err(DriveError::from_reqwest)
    }

    /// Size announced by a HEAD request, 0 when the service does not say.
    pub async fn content_length(&self, url: &Url) -> Result<u64> {
        let response = self.send(self.request(reqwest::Method::HEAD, url), url).await?;

        let length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(length)
    }

    /// Merges `Set-Cookie` values of a response into the session.
    pub fn absorb_cookies(&self, headers: &HeaderMap) {
        let cookies = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(parse_set_cookie)
            .collect::<Vec<_>>();

        if !cookies.is_empty() {
            debug!(count = cookies.len(), "merging response cookies into session");
            self.session.write().merge(cookies);
        }
    }
}

fn is_sign_in_page(url: &Url) -> bool {
    let on_accounts_host = url.host_str().map(|host| host.starts_with("accounts.")).unwrap_or(false);
    on_accounts_host || url.path().starts_with("/ServiceLogin")
}

fn parse_set_cookie(value: &str) -> Option<(String, String)> {
    let pair = value.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}
