//! Intake: upload validation and vetted remote fetch.
//!
//! The SSRF protections are load-bearing. A remote URL is fetched only
//! after scheme, host-allowlist and resolved-address checks pass, with a
//! hard timeout, no redirects, a content-type allowlist and a size-capped
//! body stream. Nothing is read from a host that resolves to any
//! non-globally-routable address.

use std::net::IpAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use stevedore_protocol::defaults::{ALLOWED_CONTENT_TYPES, REMOTE_FETCH_TIMEOUT_SECS};
use stevedore_protocol::{ErrorCode, ExportFormat, TransferError, TransferResult};
use stevedore_storage::LocalStorage;

/// Intake limits and allowlists, from configuration.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    pub max_file_size: u64,
    /// Host allowlist; empty allows any host that passes the address checks.
    pub allowed_hosts: Vec<String>,
}

/// A validated, persisted import source.
#[derive(Debug, Clone)]
pub struct StoredSource {
    pub key: String,
    pub file_name: Option<String>,
    pub size: i64,
    pub format: ExportFormat,
}

/// Validate and persist an uploaded file.
pub async fn store_upload(
    storage: &LocalStorage,
    config: &IntakeConfig,
    file_name: &str,
    content_type: &str,
    bytes: &[u8],
) -> TransferResult<StoredSource> {
    check_content_type(content_type)?;
    if bytes.is_empty() {
        return Err(TransferError::new(ErrorCode::EmptyFile, "uploaded file is empty"));
    }
    if bytes.len() as u64 > config.max_file_size {
        return Err(TransferError::new(
            ErrorCode::FileTooLarge,
            format!("upload exceeds the {} byte limit", config.max_file_size),
        ));
    }
    let format = detect_format(Some(file_name), content_type)?;

    let key = source_key(Some(file_name));
    let saved = storage.save_buffer(&key, bytes).await?;
    info!(key, bytes = saved.bytes, "stored upload");
    Ok(StoredSource {
        key,
        file_name: Some(file_name.to_string()),
        size: saved.bytes as i64,
        format,
    })
}

/// Fetch a remote source after the full SSRF gauntlet and persist it.
pub async fn fetch_remote(
    storage: &LocalStorage,
    config: &IntakeConfig,
    raw_url: &str,
) -> TransferResult<StoredSource> {
    let url = Url::parse(raw_url).map_err(|e| {
        TransferError::new(ErrorCode::UrlNotAllowed, format!("invalid URL: {e}"))
    })?;
    check_url(&url, &config.allowed_hosts)?;
    resolve_and_check(&url).await?;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(REMOTE_FETCH_TIMEOUT_SECS))
        .build()
        .map_err(|e| TransferError::new(ErrorCode::InternalError, e.to_string()))?;

    let response = client.get(url.clone()).send().await.map_err(|e| {
        TransferError::new(ErrorCode::UrlFetchFailed, format!("fetch failed: {e}"))
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransferError::new(
            ErrorCode::UrlFetchFailed,
            format!("remote returned status {status}"),
        ));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();
    check_content_type(&content_type)?;

    if let Some(length) = response.content_length() {
        if length > config.max_file_size {
            return Err(TransferError::new(
                ErrorCode::FileTooLarge,
                format!("Content-Length {length} exceeds the {} byte limit", config.max_file_size),
            ));
        }
    }

    let file_name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(str::to_string);
    let format = detect_format(file_name.as_deref(), &content_type)?;

    // Stream the body through the size cap.
    let key = source_key(file_name.as_deref());
    let mut sink = storage.create_write_stream(&key).await?;
    let mut total: u64 = 0;
    let mut response = response;
    loop {
        let chunk = match response.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                drop(sink);
                let _ = storage.delete(&key).await;
                return Err(TransferError::new(
                    ErrorCode::UrlFetchFailed,
                    format!("body transfer failed: {err}"),
                ));
            }
        };
        total += chunk.len() as u64;
        if total > config.max_file_size {
            drop(sink);
            let _ = storage.delete(&key).await;
            return Err(TransferError::new(
                ErrorCode::FileTooLarge,
                format!("remote body exceeds the {} byte limit", config.max_file_size),
            ));
        }
        sink.write_all(&chunk).await?;
    }
    sink.flush().await?;

    if total == 0 {
        let _ = storage.delete(&key).await;
        return Err(TransferError::new(ErrorCode::EmptyFile, "remote body was empty"));
    }

    info!(key, bytes = total, url = %url, "fetched remote source");
    Ok(StoredSource {
        key,
        file_name,
        size: total as i64,
        format,
    })
}

fn source_key(file_name: Option<&str>) -> String {
    let suffix = file_name
        .map(sanitize_file_name)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "remote".to_string());
    format!("imports/{}-{}", Uuid::new_v4(), suffix)
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn check_content_type(content_type: &str) -> TransferResult<()> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if ALLOWED_CONTENT_TYPES.contains(&essence.as_str()) {
        Ok(())
    } else {
        Err(TransferError::new(
            ErrorCode::UnsupportedFormat,
            format!("content type {content_type:?} is not supported"),
        ))
    }
}

/// Format from file extension first, content type second.
fn detect_format(file_name: Option<&str>, content_type: &str) -> TransferResult<ExportFormat> {
    if let Some(format) = file_name.and_then(ExportFormat::from_file_name) {
        return Ok(format);
    }
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "application/json" | "text/json" => Ok(ExportFormat::Json),
        "application/ndjson" | "application/x-ndjson" | "application/jsonl" | "text/plain" => {
            Ok(ExportFormat::Ndjson)
        }
        _ => Err(TransferError::new(
            ErrorCode::UnsupportedFormat,
            "cannot determine source format from name or content type",
        )),
    }
}

/// Scheme and host checks that need no network.
fn check_url(url: &Url, allowed_hosts: &[String]) -> TransferResult<()> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(TransferError::new(
            ErrorCode::UrlNotAllowed,
            format!("scheme {:?} is not allowed", url.scheme()),
        ));
    }
    let host = url
        .host_str()
        .ok_or_else(|| TransferError::new(ErrorCode::UrlNotAllowed, "URL has no host"))?
        .to_ascii_lowercase();

    if host == "localhost" || host.ends_with(".localhost") || host.ends_with(".local") {
        return Err(TransferError::new(
            ErrorCode::UrlNotAllowed,
            format!("host {host:?} is not allowed"),
        ));
    }

    if !allowed_hosts.is_empty() {
        let allowed = allowed_hosts.iter().any(|entry| {
            host == *entry || host.ends_with(&format!(".{entry}"))
        });
        if !allowed {
            return Err(TransferError::new(
                ErrorCode::UrlNotAllowed,
                format!("host {host:?} is not on the allowlist"),
            ));
        }
    }
    Ok(())
}

/// DNS resolution check: every resolved address must be globally routable.
async fn resolve_and_check(url: &Url) -> TransferResult<()> {
    let host = url
        .host_str()
        .ok_or_else(|| TransferError::new(ErrorCode::UrlNotAllowed, "URL has no host"))?;
    let port = url.port_or_known_default().unwrap_or(443);

    // Literal addresses skip DNS but not the check itself.
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if is_disallowed_ip(ip) {
            return Err(TransferError::new(
                ErrorCode::UrlNotAllowed,
                format!("address {ip} is not globally routable"),
            ));
        }
        return Ok(());
    }

    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| {
            TransferError::new(ErrorCode::UrlFetchFailed, format!("DNS resolution failed: {e}"))
        })?
        .collect();
    if addrs.is_empty() {
        return Err(TransferError::new(
            ErrorCode::UrlFetchFailed,
            format!("host {host:?} resolved to no addresses"),
        ));
    }
    for addr in addrs {
        if is_disallowed_ip(addr.ip()) {
            warn!(host, ip = %addr.ip(), "remote host resolves to a non-routable address");
            return Err(TransferError::new(
                ErrorCode::UrlNotAllowed,
                format!("host {host:?} resolves to a non-routable address"),
            ));
        }
    }
    Ok(())
}

/// Private, loopback, link-local, multicast, unspecified and v4-mapped
/// private addresses all count as disallowed.
fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // Carrier-grade NAT 100.64.0.0/10.
                || (octets[0] == 100 && (64..128).contains(&octets[1]))
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_disallowed_ip(IpAddr::V4(mapped));
            }
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                // Unique local fc00::/7.
                || (segments[0] & 0xfe00) == 0xfc00
                // Link-local fe80::/10.
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}
