use crate::{response::Response, types::Headers};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use url::Url;

static REQUEST_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone, derive_more::Display)]
pub enum Method {
    #[display(fmt = "GET")]
    Get,
    #[display(fmt = "POST")]
    Post,
    #[display(fmt = "PUT")]
    Put,
    #[display(fmt = "DELETE")]
    Delete,
    #[display(fmt = "HEAD")]
    Head,
    #[display(fmt = "PATCH")]
    Patch,
    #[display(fmt = "OPTIONS")]
    Options,
    #[display(fmt = "{}", _0)]
    Other(String),
}

#[derive(Debug, Clone)]
pub struct Request {
    pub id: usize,
    pub url: Url,
    /// Pseudo-headers first, regular headers after, all in send order.
    pub headers: Headers,
    pub body: Bytes,
    /// Header names whose values must never enter a compression table.
    pub sensitive: Vec<String>,
}

impl Request {
    pub fn new(method: Method, url: Url, body: impl Into<Bytes>) -> Self {
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_owned(),
        };
        let headers = vec![
            (":method".to_owned(), method.to_string()),
            (":scheme".to_owned(), url.scheme().to_owned()),
            (":path".to_owned(), path),
            (
                ":authority".to_owned(),
                if let Some(port) = url.port() {
                    format!("{}:{}", url.host_str().expect("URL cannot be a base"), port)
                } else {
                    url.host_str().expect("URL cannot be a base").to_owned()
                },
            ),
        ];
        Self {
            id: REQUEST_ID.fetch_add(1, Ordering::SeqCst),
            url,
            headers,
            body: body.into(),
            sensitive: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self::new(Method::Get, url, Bytes::new())
    }

    #[inline]
    pub fn post(url: Url, body: impl Into<Bytes>) -> Self {
        Self::new(Method::Post, url, body)
    }

    #[cfg(feature = "json")]
    pub fn post_json<T: serde::Serialize>(url: Url, body: &T) -> serde_json::Result<Self> {
        Ok(Self::post(url, serde_json::to_vec(body)?).header("content-type", "application/json"))
    }

    /// Appends a regular header. Names are lowercased as HTTP/2 requires.
    #[must_use]
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .push((name.as_ref().to_ascii_lowercase(), value.into()));
        self
    }

    /// Appends a header that will be encoded "never indexed" (for
    /// authorization tokens, cookies, and similar secrets).
    #[must_use]
    pub fn sensitive_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        let name = name.as_ref().to_ascii_lowercase();
        self.sensitive.push(name.clone());
        self.headers.push((name, value.into()));
        self
    }

    /// Builds the follow-up GET for a redirect response, if it names one.
    #[must_use]
    pub fn redirect(&self, response: &Response) -> Option<Self> {
        let location = response.header("location")?;
        let url = self.url.join(location).ok()?;
        Some(Self::get(url))
    }
}
