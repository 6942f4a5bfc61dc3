//! Resubmittable request description and the request interceptor.
//!
//! `reqwest::RequestBuilder` cannot be replayed once sent (multipart bodies
//! are streams), so requests are kept as plain data and rebuilt for every
//! attempt.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{multipart, Method};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub enum FormPart {
    Text(String),
    File {
        bytes: Vec<u8>,
        file_name: String,
        mime: Option<String>,
    },
}

/// Multipart form that can be rebuilt for a retry.
#[derive(Debug, Clone, Default)]
pub struct MultipartForm {
    parts: Vec<(String, FormPart)>,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push((name.into(), FormPart::Text(value.into())));
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        bytes: Vec<u8>,
        mime: Option<&str>,
    ) -> Self {
        self.parts.push((
            name.into(),
            FormPart::File {
                bytes,
                file_name: file_name.into(),
                mime: mime.map(str::to_string),
            },
        ));
        self
    }

    /// Read a file from disk into a part.
    pub fn file_from_path(self, name: impl Into<String>, path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read upload file {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        Ok(self.file(name, file_name, bytes, None))
    }

    pub fn parts(&self) -> &[(String, FormPart)] {
        &self.parts
    }

    pub(crate) fn to_form(&self) -> Result<multipart::Form> {
        let mut form = multipart::Form::new();
        for (name, part) in &self.parts {
            form = match part {
                FormPart::Text(value) => form.text(name.clone(), value.clone()),
                FormPart::File { bytes, file_name, mime } => {
                    let mut file = multipart::Part::bytes(bytes.clone()).file_name(file_name.clone());
                    if let Some(mime) = mime {
                        file = file
                            .mime_str(mime)
                            .with_context(|| format!("Invalid MIME type: {}", mime))?;
                    }
                    form.part(name.clone(), file)
                }
            };
        }
        Ok(form)
    }
}

#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Multipart(MultipartForm),
}

impl RequestBody {
    pub fn is_multipart(&self) -> bool {
        matches!(self, RequestBody::Multipart(_))
    }
}

/// One logical API call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: RequestBody,
    /// Overrides the client default (and the upload default for multipart).
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self> {
        let value = serde_json::to_value(body).context("Failed to serialize request body")?;
        self.body = RequestBody::Json(value);
        Ok(self)
    }

    pub fn json_value(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.body = RequestBody::Multipart(form);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Tracks whether a request already spent its one refresh-and-retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempted: bool,
}

/// Headers every request starts from.
pub fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

/// Request interceptor: defaults, then request headers, then the bearer
/// token if one exists. Multipart bodies lose any preset content type so
/// the transport can add its boundary.
pub fn intercept_request(
    defaults: &HeaderMap,
    request: &ApiRequest,
    token: Option<&str>,
) -> Result<HeaderMap> {
    let mut headers = defaults.clone();
    for (name, value) in &request.headers {
        headers.insert(name.clone(), value.clone());
    }

    match token {
        Some(token) => {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .context("Access token is not a valid header value")?;
            headers.insert(header::AUTHORIZATION, value);
        }
        None => {
            headers.remove(header::AUTHORIZATION);
        }
    }

    if request.body.is_multipart() {
        headers.remove(header::CONTENT_TYPE);
    }

    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_no_token_means_no_authorization_header() {
        let headers = intercept_request(&default_headers(), &ApiRequest::get("/complaints"), None)
            .expect("headers");
        assert!(headers.get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn test_stale_authorization_removed_without_token() {
        let request = ApiRequest::get("/complaints")
            .header(header::AUTHORIZATION, HeaderValue::from_static("Bearer old"));
        let headers = intercept_request(&default_headers(), &request, None).expect("headers");
        assert!(headers.get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn test_bearer_token_attached() {
        let headers = intercept_request(&default_headers(), &ApiRequest::get("/complaints"), Some("abc"))
            .expect("headers");
        assert_eq!(headers.get(header::AUTHORIZATION).map(|v| v.as_bytes()), Some(&b"Bearer abc"[..]));
    }

    #[test]
    fn test_multipart_strips_content_type() {
        let form = MultipartForm::new()
            .text("title", "Broken projector")
            .file("attachment", "photo.jpg", vec![0xff, 0xd8], Some("image/jpeg"));
        let request = ApiRequest::post("/complaints").multipart(form);
        let headers = intercept_request(&default_headers(), &request, Some("abc")).expect("headers");
        assert!(headers.get(header::CONTENT_TYPE).is_none());
        assert!(headers.get(header::AUTHORIZATION).is_some());
    }

    #[test]
    fn test_json_keeps_default_content_type() {
        let request = ApiRequest::post("/complaints").json_value(json!({"title": "Leaky roof"}));
        let headers = intercept_request(&default_headers(), &request, None).expect("headers");
        assert_eq!(
            headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("application/json")
        );
    }

    #[test]
    fn test_request_headers_override_defaults() {
        let request = ApiRequest::get("/reports/export")
            .header(header::ACCEPT, HeaderValue::from_static("text/csv"));
        let headers = intercept_request(&default_headers(), &request, None).expect("headers");
        assert_eq!(headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()), Some("text/csv"));
    }

    #[test]
    fn test_multipart_form_rebuilds() {
        let form = MultipartForm::new()
            .text("category", "facilities")
            .file("doc", "a.pdf", b"%PDF".to_vec(), Some("application/pdf"));
        assert_eq!(form.parts().len(), 2);
        assert!(form.to_form().is_ok());
        // Same form can be turned into a transport body again for a retry
        assert!(form.to_form().is_ok());

        let bad = MultipartForm::new().file("doc", "a", vec![], Some("not a mime"));
        assert!(bad.to_form().is_err());
    }
}
