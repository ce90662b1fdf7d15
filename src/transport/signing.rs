//! Request signing: HMAC helpers, AWS Signature Version 4 and Tencent TC3.

use crate::{Error, ErrorContext, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use sha2::{Digest, Sha256};
use url::Url;

type HmacSha256 = Hmac<Sha256>;

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex(&Sha256::digest(data))
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| {
        Error::internal_with_context(e.to_string(), ErrorContext::new().with_source("signing.hmac"))
    })?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// RFC 3986 encoding as AWS expects it: unreserved characters stay, the rest
/// become upper-case `%XX`.
pub fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// AWS SigV4 credentials and scope.
#[derive(Debug, Clone)]
pub struct SigV4 {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
    pub region: String,
    pub service: String,
    /// Sign and send `x-amz-content-sha256` (required by S3).
    pub content_sha256_header: bool,
}

impl SigV4 {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        let service = service.into();
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            session_token: None,
            region: region.into(),
            content_sha256_header: service == "s3",
            service,
        }
    }

    /// Adds `x-amz-date`, optional security/content headers and `Authorization`.
    pub fn sign(
        &self,
        method: &str,
        url: &Url,
        headers: &mut HeaderMap,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let payload_hash = sha256_hex(payload);

        insert(headers, "x-amz-date", &amz_date)?;
        if self.content_sha256_header {
            insert(headers, "x-amz-content-sha256", &payload_hash)?;
        }
        if let Some(token) = &self.session_token {
            insert(headers, "x-amz-security-token", token)?;
        }

        let host = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{}:{}", h, p),
            (Some(h), None) => h.to_string(),
            (None, _) => {
                return Err(Error::invalid_request_with_context(
                    "url has no host",
                    ErrorContext::new().with_source("signing.sigv4"),
                ))
            }
        };

        let mut canonical: Vec<(String, String)> = vec![("host".to_string(), host)];
        for (name, value) in headers.iter() {
            let name = name.as_str().to_ascii_lowercase();
            if name == "host" || name == "authorization" || name == "content-length" {
                continue;
            }
            if name.starts_with("x-amz-") || name == "content-type" {
                let value = value.to_str().unwrap_or("").trim().to_string();
                canonical.push((name, value));
            }
        }
        canonical.sort();
        let canonical_headers: String = canonical
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();
        let signed_headers = canonical
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_uri = if self.service == "s3" {
            url.path().to_string()
        } else {
            url.path()
                .split('/')
                .map(|seg| uri_encode(seg, true))
                .collect::<Vec<_>>()
                .join("/")
        };
        let canonical_uri = if canonical_uri.is_empty() {
            "/".to_string()
        } else {
            canonical_uri
        };

        let mut query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (uri_encode(&k, true), uri_encode(&v, true)))
            .collect();
        query.sort();
        let canonical_query = query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, canonical_uri, canonical_query, canonical_headers, signed_headers, payload_hash
        );
        let scope = format!("{}/{}/{}/aws4_request", date, self.region, self.service);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let k_date = hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes())?;
        let k_region = hmac_sha256(&k_date, self.region.as_bytes())?;
        let k_service = hmac_sha256(&k_region, self.service.as_bytes())?;
        let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
        let signature = hex(&hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

        let auth = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, scope, signed_headers, signature
        );
        headers.insert(AUTHORIZATION, header_value(&auth)?);
        Ok(())
    }
}

/// Tencent Cloud API 3.0 signing (`TC3-HMAC-SHA256`).
#[derive(Debug, Clone)]
pub struct Tc3 {
    pub secret_id: String,
    pub secret_key: String,
    pub service: String,
}

impl Tc3 {
    pub fn new(secret_id: impl Into<String>, secret_key: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            secret_id: secret_id.into(),
            secret_key: secret_key.into(),
            service: service.into(),
        }
    }

    /// `Authorization` value for a JSON POST to `/` on `host`. Signs
    /// `content-type` and `host` only.
    pub fn authorization(&self, host: &str, payload: &[u8], now: DateTime<Utc>) -> Result<String> {
        let date = now.format("%Y-%m-%d").to_string();
        let signed_headers = "content-type;host";
        let canonical_request = format!(
            "POST\n/\n\ncontent-type:application/json\nhost:{}\n\n{}\n{}",
            host,
            signed_headers,
            sha256_hex(payload)
        );
        let scope = format!("{}/{}/tc3_request", date, self.service);
        let string_to_sign = format!(
            "TC3-HMAC-SHA256\n{}\n{}\n{}",
            now.timestamp(),
            scope,
            sha256_hex(canonical_request.as_bytes())
        );
        let k_date = hmac_sha256(format!("TC3{}", self.secret_key).as_bytes(), date.as_bytes())?;
        let k_service = hmac_sha256(&k_date, self.service.as_bytes())?;
        let k_signing = hmac_sha256(&k_service, b"tc3_request")?;
        let signature = hex(&hmac_sha256(&k_signing, string_to_sign.as_bytes())?);
        Ok(format!(
            "TC3-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.secret_id, scope, signed_headers, signature
        ))
    }
}

fn header_value(v: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(v).map_err(|e| {
        Error::invalid_request_with_context(
            format!("invalid header value: {}", e),
            ErrorContext::new().with_source("signing"),
        )
    })
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<()> {
    headers.insert(HeaderName::from_static(name), header_value(value)?);
    Ok(())
}
