//! Content negotiation between JSON and YAML
//!
//! `Accept` handling follows the API server: a missing, empty, wildcard or
//! unparseable header gets JSON. Only a well-formed header that names nothing
//! we can produce is refused. Ranges are tried in descending `q` order, and a
//! range with `q=0` is excluded.

use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// `application/json`
pub const JSON: &str = "application/json";

/// `application/yaml`
pub const YAML: &str = "application/yaml";

/// `application/merge-patch+json`
pub const MERGE_PATCH: &str = "application/merge-patch+json";

/// Serialization formats the server speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    /// JSON
    Json,
    /// YAML
    Yaml,
}

impl MediaType {
    fn from_essence(essence: &str) -> Option<Self> {
        match essence {
            JSON => Some(MediaType::Json),
            YAML | "application/x-yaml" | "text/yaml" => Some(MediaType::Yaml),
            _ => None,
        }
    }

    /// Content-Type header value
    pub fn content_type(self) -> HeaderValue {
        match self {
            MediaType::Json => HeaderValue::from_static(JSON),
            MediaType::Yaml => HeaderValue::from_static(YAML),
        }
    }

    /// Serialize `value`
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            MediaType::Json => serde_json::to_vec(value)
                .map_err(|e| Error::Internal(format!("failed to encode response: {}", e))),
            MediaType::Yaml => serde_yaml::to_string(value)
                .map(String::into_bytes)
                .map_err(|e| Error::Internal(format!("failed to encode response: {}", e))),
        }
    }

    /// Deserialize a request body
    pub fn decode<T: DeserializeOwned>(self, body: &[u8]) -> Result<T> {
        match self {
            MediaType::Json => serde_json::from_slice(body)
                .map_err(|e| Error::BadRequest(format!("invalid JSON body: {}", e))),
            MediaType::Yaml => serde_yaml::from_slice(body)
                .map_err(|e| Error::BadRequest(format!("invalid YAML body: {}", e))),
        }
    }
}

/// Encode `value` as a response with the matching Content-Type
pub fn respond<T: Serialize>(status: StatusCode, media: MediaType, value: &T) -> Result<Response> {
    let body = media.encode(value)?;
    let mut response = (status, body).into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, media.content_type());
    Ok(response)
}

/// `type/subtype` without parameters, lowercased
fn essence(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_media_range(essence: &str) -> bool {
    match essence.split_once('/') {
        Some((ty, sub)) => !ty.is_empty() && !sub.is_empty() && !sub.contains('/'),
        None => false,
    }
}

/// One `Accept` range: essence and quality
struct Range {
    essence: String,
    quality: f32,
}

impl Range {
    /// `None` when the range or its `q` parameter is malformed
    fn parse(raw: &str) -> Option<Self> {
        let mut params = raw.split(';');
        let essence = essence(params.next().unwrap_or_default());
        if !is_media_range(&essence) {
            return None;
        }

        let mut quality = 1.0;
        for param in params {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case("q") {
                quality = value.trim().parse::<f32>().ok()?;
                if !(0.0..=1.0).contains(&quality) {
                    return None;
                }
            }
        }
        Some(Self { essence, quality })
    }
}

enum Offer {
    Fallback,
    Pick(MediaType),
    Refuse(String),
}

fn evaluate(headers: &HeaderMap) -> Offer {
    let Some(raw) = headers.get(ACCEPT) else {
        return Offer::Fallback;
    };
    let Ok(raw) = raw.to_str() else {
        return Offer::Fallback;
    };
    if raw.trim().is_empty() {
        return Offer::Fallback;
    }

    let Some(mut ranges) = raw.split(',').map(Range::parse).collect::<Option<Vec<_>>>() else {
        return Offer::Fallback;
    };
    ranges.retain(|r| r.quality > 0.0);
    // Stable, so equal qualities keep header order
    ranges.sort_by(|a, b| b.quality.total_cmp(&a.quality));

    for range in &ranges {
        if range.essence == "*/*" || range.essence == "application/*" {
            return Offer::Fallback;
        }
        if let Some(media) = MediaType::from_essence(&range.essence) {
            return Offer::Pick(media);
        }
    }
    Offer::Refuse(raw.to_string())
}

/// Response format for resource requests
///
/// Fails with 406 when `Accept` only names unsupported types.
pub fn negotiate(headers: &HeaderMap) -> Result<MediaType> {
    match evaluate(headers) {
        Offer::Fallback => Ok(MediaType::Json),
        Offer::Pick(media) => Ok(media),
        Offer::Refuse(raw) => Err(Error::NotAcceptable(raw)),
    }
}

/// Response format for discovery documents, never fails
pub fn negotiate_or_json(headers: &HeaderMap) -> MediaType {
    match evaluate(headers) {
        Offer::Pick(media) => media,
        Offer::Fallback | Offer::Refuse(_) => MediaType::Json,
    }
}

/// `Content-Type` essence of the request, empty when absent
pub fn content_type(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(essence)
        .unwrap_or_default()
}

/// Body format of a create or update request
///
/// A missing Content-Type is read as JSON.
pub fn body_media_type(headers: &HeaderMap) -> Result<MediaType> {
    let content_type = content_type(headers);
    if content_type.is_empty() {
        return Ok(MediaType::Json);
    }
    MediaType::from_essence(&content_type).ok_or_else(|| {
        Error::UnsupportedMediaType(format!("unsupported media type {:?}", content_type))
    })
}
