//! Request identity for the page cache.

use std::collections::BTreeMap;

use axum::http::{HeaderMap, Method, Uri, header};
use sha2::{Digest, Sha256};
use url::form_urlencoded;

/// The parts of an incoming request that decide which snapshot it maps to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
    /// Extra discriminators, such as a device class, that split the cache.
    pub extensions: BTreeMap<String, String>,
}

impl RequestInfo {
    pub fn new(
        method: impl Into<String>,
        scheme: impl Into<String>,
        host: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            scheme: scheme.into(),
            host: host.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Build from the request line and headers of an HTTP request.
    pub fn from_http(method: &Method, uri: &Uri, headers: &HeaderMap) -> Self {
        let scheme = uri
            .scheme_str()
            .or_else(|| header_str(headers, "x-forwarded-proto"))
            .unwrap_or("http");
        let host = uri
            .authority()
            .map(|authority| authority.as_str())
            .or_else(|| header_str(headers, header::HOST.as_str()))
            .unwrap_or_default();

        let mut info = Self::new(method.as_str(), scheme, host, uri.path());
        if let Some(query) = uri.query() {
            info = info.with_query(query);
        }
        for cookie in headers.get_all(header::COOKIE) {
            if let Ok(cookie) = cookie.to_str() {
                info = info.with_cookie_header(cookie);
            }
        }
        info.if_none_match = header_str(headers, header::IF_NONE_MATCH.as_str()).map(str::to_string);
        info.if_modified_since =
            header_str(headers, header::IF_MODIFIED_SINCE.as_str()).map(str::to_string);
        info
    }

    /// Append the pairs of a raw query string.
    pub fn with_query(mut self, raw: &str) -> Self {
        self.query.extend(
            form_urlencoded::parse(raw.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        self
    }

    /// Append the cookies of a `Cookie` header value.
    pub fn with_cookie_header(mut self, raw: &str) -> Self {
        for pair in raw.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            self.cookies
                .push((name.trim().to_string(), value.trim().to_string()));
        }
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(name.into(), value.into());
        self
    }

    pub fn with_if_none_match(mut self, value: impl Into<String>) -> Self {
        self.if_none_match = Some(value.into());
        self
    }

    pub fn with_if_modified_since(mut self, value: impl Into<String>) -> Self {
        self.if_modified_since = Some(value.into());
        self
    }

    /// Only GET and HEAD responses are cached.
    pub fn is_cacheable_method(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET") || self.method.eq_ignore_ascii_case("HEAD")
    }

    pub fn has_cookie_with_prefix(&self, prefixes: &[String]) -> bool {
        self.cookies.iter().any(|(name, _)| {
            prefixes
                .iter()
                .any(|prefix| !prefix.is_empty() && name.starts_with(prefix.as_str()))
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Stable digest of a request plus the keys derived from it.
///
/// `key` covers everything that varies the response; `url_key` covers the URL
/// alone so one version counter invalidates every variant of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFingerprint {
    key: String,
    url_key: String,
}

impl RequestFingerprint {
    pub fn of(request: &RequestInfo) -> Self {
        let mut query: Vec<(&str, &str)> = request
            .query
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        query.sort_unstable();

        // Underscore cookies belong to analytics and never vary the page.
        let mut cookies: Vec<(&str, &str)> = request
            .cookies
            .iter()
            .filter(|(name, _)| !name.starts_with('_'))
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        cookies.sort_unstable();

        let mut digest = FieldDigest::default();
        digest.field(request.method.to_ascii_uppercase().as_bytes());
        digest.field(request.scheme.to_ascii_lowercase().as_bytes());
        digest.field(request.host.to_ascii_lowercase().as_bytes());
        digest.field(request.path.as_bytes());
        digest.pairs(&query);
        digest.pairs(&cookies);
        let extensions: Vec<(&str, &str)> = request
            .extensions
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        digest.pairs(&extensions);

        Self {
            key: digest.finish(),
            url_key: Self::url_key_for(&request.scheme, &request.host, &request.path),
        }
    }

    /// Digest of a bare URL, shared by every variant of that page.
    pub fn url_key_for(scheme: &str, host: &str, path: &str) -> String {
        let mut digest = FieldDigest::default();
        digest.field(scheme.to_ascii_lowercase().as_bytes());
        digest.field(host.to_ascii_lowercase().as_bytes());
        digest.field(path.as_bytes());
        digest.finish()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn url_key(&self) -> &str {
        &self.url_key
    }

    pub fn snapshot_key(&self) -> &str {
        &self.key
    }

    pub fn counter_key(&self) -> String {
        format!("{}_req", self.key)
    }

    pub fn lock_key(&self) -> String {
        format!("{}_genlock", self.key)
    }

    pub fn version_key(&self) -> String {
        version_key(&self.url_key)
    }
}

pub(crate) fn version_key(url_key: &str) -> String {
    format!("{url_key}_version")
}

/// Length-prefixed field hashing, so adjacent fields never run together.
struct FieldDigest {
    hasher: Sha256,
}

impl Default for FieldDigest {
    fn default() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }
}

impl FieldDigest {
    fn field(&mut self, bytes: &[u8]) {
        self.hasher.update((bytes.len() as u64).to_be_bytes());
        self.hasher.update(bytes);
    }

    fn pairs(&mut self, pairs: &[(&str, &str)]) {
        self.hasher.update((pairs.len() as u64).to_be_bytes());
        for (name, value) in pairs {
            self.field(name.as_bytes());
            self.field(value.as_bytes());
        }
    }

    fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}
