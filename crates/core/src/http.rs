//! Framework-neutral request and response values handed to the HTTP module.
//!
//! The API crate converts its framework types into [`HttpRequest`] before a
//! script runs and turns the [`ResponseWriter`] contents back into a response
//! afterwards. Both are injected through the state store.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{TimeZone, Utc};

/// Response was already produced; scripts get exactly one write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("response has already been written")]
pub struct AlreadyWritten;

/// An inbound request as seen by a route script.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub host: String,
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: String,
    pub tls: bool,
    pub remote_addr: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Variables bound by the matched route pattern.
    pub path_vars: BTreeMap<String, String>,
}

impl HttpRequest {
    /// Build a request from a method and a path that may carry a query string.
    pub fn new(method: impl Into<String>, path_and_query: &str) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (path_and_query.to_string(), String::new()),
        };
        Self {
            method: method.into().to_ascii_uppercase(),
            path,
            query,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// All headers grouped by lower-cased name.
    pub fn header_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in &self.headers {
            map.entry(key.to_ascii_lowercase())
                .or_default()
                .push(value.clone());
        }
        map
    }

    /// Media type of the body with parameters (`; charset=...`) removed.
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
            .map(|value| value.split(';').next().unwrap_or(value).trim())
    }

    pub fn query_params(&self) -> BTreeMap<String, Vec<String>> {
        group_pairs(form_urlencoded::parse(self.query.as_bytes()))
    }

    /// Body parsed as `application/x-www-form-urlencoded`.
    pub fn form_params(&self) -> BTreeMap<String, Vec<String>> {
        group_pairs(form_urlencoded::parse(&self.body))
    }

    pub fn cookies(&self) -> Vec<Cookie> {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case("cookie"))
            .flat_map(|(_, value)| value.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some(Cookie::new(name, value.trim().trim_matches('"')))
            })
            .collect()
    }

    pub fn protocol(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }

    /// Remote address with any trailing `:port` removed.
    pub fn remote_ip(&self) -> Option<&str> {
        let addr = self.remote_addr.as_deref()?;
        if let Some(stripped) = addr.strip_prefix('[') {
            return Some(stripped.split(']').next().unwrap_or(stripped));
        }
        Some(match addr.rsplit_once(':') {
            Some((ip, _port)) if !ip.contains(':') => ip,
            _ => addr,
        })
    }
}

fn group_pairs<'a>(
    pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in pairs {
        map.entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    map
}

/// A cookie read from a request or queued on a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    /// Expiry as unix epoch seconds.
    pub expires: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Self::default()
        }
    }

    /// Render as a `Set-Cookie` header value.
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(expires) = self.expires.and_then(|e| Utc.timestamp_opt(e, 0).single()) {
            out.push_str("; Expires=");
            out.push_str(&expires.format("%a, %d %b %Y %H:%M:%S GMT").to_string());
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        out
    }
}

/// Everything a script produced for the response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseParts {
    /// `None` until the script writes a status.
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Response sink shared between the dispatcher and the HTTP module.
#[derive(Debug, Default)]
pub struct ResponseWriter {
    inner: Mutex<ResponseParts>,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn parts(&self) -> MutexGuard<'_, ResponseParts> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace every header with the same name.
    pub fn set_header(&self, name: &str, value: &str) {
        let mut parts = self.parts();
        parts.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        parts.headers.push((name.to_string(), value.to_string()));
    }

    /// Append a header, keeping existing values (used for `Set-Cookie`).
    pub fn add_header(&self, name: &str, value: &str) {
        self.parts()
            .headers
            .push((name.to_string(), value.to_string()));
    }

    pub fn set_cookie(&self, cookie: &Cookie) {
        self.add_header("Set-Cookie", &cookie.to_header_value());
    }

    /// Write the status and body. Only the first write is accepted.
    pub fn write(&self, status: u16, body: Vec<u8>) -> Result<(), AlreadyWritten> {
        let mut parts = self.parts();
        if parts.status.is_some() {
            return Err(AlreadyWritten);
        }
        parts.status = Some(status);
        parts.body = body;
        Ok(())
    }

    /// Set `Location` and write an empty body with `status`.
    pub fn redirect(&self, status: u16, location: &str) -> Result<(), AlreadyWritten> {
        if self.is_written() {
            return Err(AlreadyWritten);
        }
        self.set_header("Location", location);
        self.write(status, Vec::new())
    }

    pub fn is_written(&self) -> bool {
        self.parts().status.is_some()
    }

    pub fn snapshot(&self) -> ResponseParts {
        self.parts().clone()
    }
}
