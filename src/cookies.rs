use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{DriveError, Result};

const REQUIRED_COOKIES: [&str; 2] = ["SID", "HSID"];

/// Authenticated context handed to the client. Only the `Cookie` header it
/// produces is observable.
#[derive(Debug, Clone, Default)]
pub struct Session {
    cookies: BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CookieExport {
    Nested { cookies: Vec<CookieEntry> },
    List(Vec<CookieEntry>),
    Map(BTreeMap<String, String>),
}

#[derive(Deserialize)]
struct CookieEntry {
    name: Option<String>,
    value: Option<String>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn from_cookie_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| DriveError::Cookie(format!("cannot read {}: {}", path.display(), err)))?;

        let session = Self::parse(&content)?;
        if session.is_empty() {
            return Err(DriveError::Cookie(format!("no cookies found in {}", path.display())));
        }
        debug!(count = session.cookies.len(), "loaded cookies from {}", path.display());

        if !session.has_auth_cookies() {
            warn!("cookie file lacks {:?}, view-only files usually need them", REQUIRED_COOKIES);
        }

        Ok(session)
    }

    /// Accepts JSON exports (list, map or `{"cookies": [...]}`) and Netscape cookie files.
    pub fn parse(content: &str) -> Result<Self> {
        let trimmed = content.trim_start();
        let cookies = if trimmed.starts_with('[') || trimmed.starts_with('{') {
            parse_json(trimmed)?
        } else {
            parse_netscape(content)?
        };

        Ok(Self { cookies })
    }

    /// Later values win, the way a browser applies `Set-Cookie`.
    pub fn merge<I>(&mut self, cookies: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.cookies.extend(cookies);
    }

    pub fn has_auth_cookies(&self) -> bool {
        REQUIRED_COOKIES.iter().all(|name| self.cookies.contains_key(*name))
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }

        let header = self
            .cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ");

        Some(header)
    }
}

fn parse_json(content: &str) -> Result<BTreeMap<String, String>> {
    let export: CookieExport = serde_json::from_str(content)
        .map_err(|err| DriveError::Cookie(format!("invalid JSON cookie export: {}", err)))?;

    let cookies = match export {
        CookieExport::Nested { cookies } | CookieExport::List(cookies) => cookies
            .into_iter()
            .filter_map(|entry| Some((entry.name?, entry.value?)))
            .collect(),
        CookieExport::Map(map) => map,
    };

    Ok(cookies)
}

fn parse_netscape(content: &str) -> Result<BTreeMap<String, String>> {
    let mut cookies = BTreeMap::new();

    for (number, line) in content.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        let line = match line.strip_prefix("#HttpOnly_") {
            Some(rest) => rest,
            None if line.starts_with('#') || line.trim().is_empty() => continue,
            None => line,
        };

        let fields = line.split('\t').collect::<Vec<_>>();
        if fields.len() != 7 {
            return Err(DriveError::Cookie(format!(
                "line {}: expected 7 tab separated fields, found {}",
                number + 1,
                fields.len()
            )));
        }

        cookies.insert(fields[5].to_string(), fields[6].to_string());
    }

    Ok(cookies)
}
