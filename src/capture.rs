use std::{collections::BTreeMap, io::Read as _};

use bytes::Bytes;
use cookie::Cookie;
use flate2::read::GzDecoder;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, StatusCode, Uri,
    header::{self, HeaderMap, HeaderName, HeaderValue},
};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

// RFC 3986 path characters stay literal; everything else is escaped.
const PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'!')
    .remove(b'$')
    .remove(b'&')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'+')
    .remove(b',')
    .remove(b';')
    .remove(b'=')
    .remove(b':')
    .remove(b'@')
    .remove(b'/');

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            other => Err(format!("unknown scheme `{other}`")),
        }
    }
}

/// Canonical snapshot of an observed request. The `host` and `cookie`
/// headers are promoted into their own fields and not repeated in
/// `headers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedRequest {
    pub scheme: Scheme,
    pub method: String,
    pub path: String,
    pub host: String,
    pub headers: BTreeMap<String, Vec<String>>,
    pub cookies: BTreeMap<String, String>,
    pub get_params: BTreeMap<String, Vec<String>>,
    pub post_params: BTreeMap<String, Vec<String>>,
    pub body: String,
}

/// Canonical snapshot of an observed response. `body` holds the inflated
/// text when the origin answered gzip-encoded; `content_length` is the
/// declared length, falling back to the raw body size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: String,
    pub content_length: u64,
    pub compressed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    MalformedBody(String),
    MalformedForm(String),
    InvalidTarget(String),
    DecodeBody(String),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedBody(reason) => write!(f, "read request body: {reason}"),
            Self::MalformedForm(reason) => write!(f, "parse form body: {reason}"),
            Self::InvalidTarget(reason) => write!(f, "compose request target: {reason}"),
            Self::DecodeBody(reason) => write!(f, "decode response body: {reason}"),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Reads the request body, captures the request, and hands back a request
/// carrying a re-readable copy of the body so the caller can still forward
/// it.
pub async fn encode_request<B>(
    req: Request<B>,
    scheme: Scheme,
) -> Result<(Request<Full<Bytes>>, CapturedRequest), CaptureError>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|err| CaptureError::MalformedBody(err.to_string()))?
        .to_bytes();
    let captured = capture_request(&parts, &body, scheme)?;
    Ok((Request::from_parts(parts, Full::new(body)), captured))
}

pub fn capture_request(
    parts: &hyper::http::request::Parts,
    body: &Bytes,
    scheme: Scheme,
) -> Result<CapturedRequest, CaptureError> {
    let body = std::str::from_utf8(body)
        .map_err(|err| {
            CaptureError::MalformedBody(format!("request body is not valid UTF-8: {err}"))
        })?
        .to_owned();

    let host = effective_host(&parts.uri, &parts.headers).ok_or_else(|| {
        CaptureError::InvalidTarget(
            "request carries neither a URL authority nor a Host header".to_owned(),
        )
    })?;

    let post_params = if is_form_content_type(&parts.headers) {
        validate_form_encoding(&body)?;
        parse_params(&body)
    } else {
        BTreeMap::new()
    };

    Ok(CapturedRequest {
        scheme,
        method: parts.method.to_string(),
        path: percent_encoding::percent_decode_str(parts.uri.path())
            .decode_utf8_lossy()
            .into_owned(),
        host,
        headers: request_headers_to_model(&parts.headers),
        cookies: flatten_cookies(&parts.headers),
        get_params: parse_params(parts.uri.query().unwrap_or("")),
        post_params,
        body,
    })
}

/// Rebuilds a live request from a captured record: target URL composed from
/// scheme, host, re-encoded path, and query; headers and cookies
/// re-attached; POST/PUT with captured form fields get a freshly
/// form-encoded body.
pub fn build_request(record: &CapturedRequest) -> Result<Request<Full<Bytes>>, CaptureError> {
    if record.host.is_empty() {
        return Err(CaptureError::InvalidTarget(
            "captured request has no host".to_owned(),
        ));
    }

    let mut target = format!(
        "{}://{}{}",
        record.scheme,
        record.host,
        utf8_percent_encode(&record.path, PATH_ENCODE_SET)
    );
    let query = encode_params(&record.get_params);
    if !query.is_empty() {
        target.push('?');
        target.push_str(&query);
    }
    let uri: Uri = target
        .parse()
        .map_err(|err| CaptureError::InvalidTarget(format!("parse `{target}`: {err}")))?;
    let method = Method::from_bytes(record.method.as_bytes()).map_err(|err| {
        CaptureError::InvalidTarget(format!("parse method `{}`: {err}", record.method))
    })?;

    let mut request = Request::new(Full::new(Bytes::from(record.body.clone())));
    *request.uri_mut() = uri;
    *request.method_mut() = method;

    for (name, values) in &record.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| CaptureError::InvalidTarget(format!("header name `{name}`: {err}")))?;
        for value in values {
            let header_value = HeaderValue::from_str(value).map_err(|err| {
                CaptureError::InvalidTarget(format!("value of header `{name}`: {err}"))
            })?;
            request.headers_mut().append(header_name.clone(), header_value);
        }
    }
    // Framing is recomputed from the actual body; a stale captured length
    // would desynchronize the stream after the form-body override.
    request.headers_mut().remove(header::CONTENT_LENGTH);
    request.headers_mut().remove(header::TRANSFER_ENCODING);

    if !record.cookies.is_empty() {
        let cookie_header = record
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        let value = HeaderValue::from_str(&cookie_header).map_err(|err| {
            CaptureError::InvalidTarget(format!("compose cookie header: {err}"))
        })?;
        request.headers_mut().insert(header::COOKIE, value);
    }

    let replay_form = (request.method() == Method::POST || request.method() == Method::PUT)
        && !record.post_params.is_empty();
    if replay_form {
        request.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(FORM_CONTENT_TYPE),
        );
        *request.body_mut() = Full::new(Bytes::from(encode_params(&record.post_params)));
    }

    Ok(request)
}

pub fn decode_response(
    status: StatusCode,
    headers: &HeaderMap,
    raw_body: &Bytes,
) -> Result<CapturedResponse, CaptureError> {
    let compressed = is_gzip_encoded(headers);
    let body = if compressed {
        let mut inflated = String::new();
        GzDecoder::new(raw_body.as_ref())
            .read_to_string(&mut inflated)
            .map_err(|err| {
                CaptureError::DecodeBody(format!("inflate gzip response body: {err}"))
            })?;
        inflated
    } else {
        std::str::from_utf8(raw_body)
            .map_err(|err| {
                CaptureError::DecodeBody(format!("response body is not valid UTF-8: {err}"))
            })?
            .to_owned()
    };

    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(raw_body.len() as u64);

    Ok(CapturedResponse {
        status_code: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("").to_owned(),
        headers: headers_to_model(headers),
        body,
        content_length,
        compressed,
    })
}

fn effective_host(uri: &Uri, headers: &HeaderMap) -> Option<String> {
    if let Some(authority) = uri.authority() {
        return Some(authority.to_string());
    }
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .filter(|host| !host.is_empty())
}

fn headers_to_model(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut model: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        model.entry(name.as_str().to_owned()).or_default().push(value);
    }
    model
}

fn request_headers_to_model(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut model = headers_to_model(headers);
    model.remove(header::HOST.as_str());
    model.remove(header::COOKIE.as_str());
    model
}

fn flatten_cookies(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut cookies = BTreeMap::new();
    for raw in headers.get_all(header::COOKIE) {
        let Ok(raw) = raw.to_str() else { continue };
        // Last write wins; cookie names are not unique on the wire.
        for cookie in Cookie::split_parse(raw).flatten() {
            cookies.insert(cookie.name().to_owned(), cookie.value().to_owned());
        }
    }
    cookies
}

fn parse_params(encoded: &str) -> BTreeMap<String, Vec<String>> {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in form_urlencoded::parse(encoded.as_bytes()) {
        params
            .entry(name.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    params
}

fn encode_params(params: &BTreeMap<String, Vec<String>>) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (name, values) in params {
        for value in values {
            serializer.append_pair(name, value);
        }
    }
    serializer.finish()
}

fn is_form_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|content_type| content_type.split(';').next())
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE))
}

fn is_gzip_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|encoding| encoding.trim().eq_ignore_ascii_case("gzip"))
}

fn validate_form_encoding(body: &str) -> Result<(), CaptureError> {
    let bytes = body.as_bytes();
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' {
            let valid = index + 2 < bytes.len()
                && bytes[index + 1].is_ascii_hexdigit()
                && bytes[index + 2].is_ascii_hexdigit();
            if !valid {
                return Err(CaptureError::MalformedForm(format!(
                    "invalid percent escape at byte {index}"
                )));
            }
            index += 3;
        } else {
            index += 1;
        }
    }
    Ok(())
}
