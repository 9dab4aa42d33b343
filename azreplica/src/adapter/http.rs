//! Shared REST transport for the storage data-planes

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use url::Url;

use crate::credential::Credential;
use crate::error::TransferError;

pub const API_VERSION: &str = "2023-11-03";

#[derive(Clone, Debug)]
pub enum Auth {
    Bearer(Credential),
    /// Shared access signature appended to every URL, without the leading `?`.
    Sas(String),
}

/// One data-plane request.
pub struct Call {
    method: Method,
    url: Url,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
}

impl Call {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn metadata<'a>(
        mut self,
        metadata: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Self {
        for (key, value) in metadata {
            self.headers.push((format!("x-ms-meta-{key}"), value.clone()));
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// A successful response with its body fully read.
#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Reply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

pub struct Transport {
    client: reqwest::Client,
    auth: Auth,
    timeout: std::time::Duration,
    /// Azure Files requires a declared intent for OAuth requests.
    file_intent: bool,
}

impl Transport {
    pub fn new(client: reqwest::Client, auth: Auth, timeout: std::time::Duration) -> Self {
        Self {
            client,
            auth,
            timeout,
            file_intent: false,
        }
    }

    pub fn with_file_intent(mut self) -> Self {
        self.file_intent = true;
        self
    }

    pub fn sas(&self) -> Option<&str> {
        match &self.auth {
            Auth::Sas(sas) => Some(sas),
            Auth::Bearer(_) => None,
        }
    }

    fn headers(&self, call: &Call) -> Result<HeaderMap, TransferError> {
        let mut headers = HeaderMap::new();
        headers.insert("x-ms-version", HeaderValue::from_static(API_VERSION));
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        headers.insert("x-ms-date", header_value(&date)?);
        if self.file_intent && matches!(self.auth, Auth::Bearer(_)) {
            headers.insert("x-ms-file-request-intent", HeaderValue::from_static("backup"));
        }
        for (name, value) in &call.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| TransferError::InvalidName(format!("header {name:?}: {err}")))?;
            headers.insert(name, header_value(value)?);
        }
        Ok(headers)
    }

    /// Sends `call`, reading the whole response body within the call timeout.
    pub async fn send(&self, call: Call) -> Result<Reply, TransferError> {
        throttle::get_request_token().await;
        let headers = self.headers(&call)?;
        let mut url = call.url;
        let mut bearer = None;
        match &self.auth {
            Auth::Sas(sas) => append_sas(&mut url, sas),
            Auth::Bearer(credential) => bearer = Some(credential.token().await?),
        }
        tracing::trace!("{} {}", call.method, redact(&url));
        let mut request = self.client.request(call.method, url).headers(headers);
        if let Some(token) = &bearer {
            request = request.bearer_auth(token);
        }
        if let Some(body) = call.body {
            request = request.body(body);
        }
        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>(Reply {
                status,
                headers,
                body,
            })
        };
        let reply = match tokio::time::timeout(self.timeout, exchange).await {
            Err(_) => return Err(TransferError::Timeout(self.timeout)),
            Ok(Err(err)) if err.is_timeout() => return Err(TransferError::Timeout(self.timeout)),
            Ok(Err(err)) => return Err(TransferError::Network(format!("{err}"))),
            Ok(Ok(reply)) => reply,
        };
        if reply.status.is_success() {
            return Ok(reply);
        }
        let code = reply.header("x-ms-error-code").map(str::to_string);
        let error = classify(
            reply.status,
            code.as_deref(),
            &String::from_utf8_lossy(&reply.body),
            bearer.is_some(),
        );
        if let (TransferError::TokenExpired, Auth::Bearer(credential), Some(token)) =
            (&error, &self.auth, &bearer)
        {
            credential.invalidate(token);
        }
        Err(error)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, TransferError> {
    HeaderValue::from_str(value)
        .map_err(|err| TransferError::InvalidName(format!("header value {value:?}: {err}")))
}

pub fn append_sas(url: &mut Url, sas: &str) {
    let query = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{existing}&{sas}"),
        _ => sas.to_string(),
    };
    url.set_query(Some(&query));
}

/// Drops the query string so signatures never reach the logs.
pub fn redact(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

#[derive(serde::Deserialize)]
struct XmlError {
    #[serde(rename = "Code")]
    code: String,
}

/// Error code from a response body, for replies without `x-ms-error-code`.
fn body_error_code(body: &str) -> Option<String> {
    let body = body.trim_start_matches('\u{feff}').trim_start();
    if body.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(body).ok()?;
        return ["odata.error", "error"]
            .iter()
            .find_map(|field| value.get(field)?.get("code")?.as_str())
            .map(str::to_string);
    }
    quick_xml::de::from_str::<XmlError>(body).ok().map(|error| error.code)
}

/// Maps a failed response onto the retry taxonomy.
pub fn classify(status: StatusCode, code: Option<&str>, body: &str, bearer: bool) -> TransferError {
    let from_body = match code {
        Some(code) if !code.is_empty() => None,
        _ => body_error_code(body),
    };
    let code = from_body.as_deref().or(code).unwrap_or_default();
    let message = if code.is_empty() {
        body.chars().take(200).collect::<String>()
    } else {
        code.to_string()
    };
    match status.as_u16() {
        408 | 429 | 500 | 502 | 503 | 504 => TransferError::Throttled {
            status: status.as_u16(),
            message,
        },
        401 if bearer => TransferError::TokenExpired,
        401 | 403 => TransferError::PermissionDenied(message),
        404 => TransferError::NotFound(message),
        409 if code.ends_with("AlreadyExists") => TransferError::AlreadyExists,
        409 => TransferError::Busy(message),
        400 if (code.starts_with("Invalid") && code.contains("Name"))
            || code == "OutOfRangeInput" =>
        {
            TransferError::InvalidName(message)
        }
        _ => TransferError::Other(format!("HTTP {status}: {message}")),
    }
}
