//! `Authorization` header handling for link credentials.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tether_rpc::Credentials;
use tracing::debug;

/// Credentials presented on an upgrade request. A missing or malformed
/// `Authorization: Basic` header yields [`Credentials::Anonymous`].
pub fn credentials_from_headers(headers: &HeaderMap) -> Credentials {
    let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return Credentials::Anonymous;
    };
    match parse_basic(value) {
        Some((username, password)) => Credentials::Basic { username, password },
        None => {
            debug!("unparseable authorization header, treating link as anonymous");
            Credentials::Anonymous
        }
    }
}

/// `Authorization` header value for basic credentials, if any.
pub fn authorization_header(credentials: &Credentials) -> Option<String> {
    match credentials {
        Credentials::Basic { username, password } => {
            Some(format!("Basic {}", STANDARD.encode(format!("{username}:{password}"))))
        }
        _ => None,
    }
}

fn parse_basic(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}
