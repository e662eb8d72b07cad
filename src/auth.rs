use axum::extract::Query;
use axum::http::{HeaderMap, Uri, header::AUTHORIZATION};
use serde::Deserialize;

pub const GOOG_API_KEY_HEADER: &str = "x-goog-api-key";

/// Where a caller may put its key, depending on whether the route was translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialScheme {
    HeaderOrQueryKey,
    BearerOrQueryKey,
}

#[derive(Debug, Default, Deserialize)]
struct KeyQuery {
    key: Option<String>,
}

#[derive(Clone, Debug)]
pub struct AuthGuard {
    secret: Option<String>,
}

impl AuthGuard {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    pub fn check(&self, scheme: CredentialScheme, headers: &HeaderMap, uri: &Uri) -> bool {
        let Some(secret) = self.secret.as_deref() else {
            return true;
        };
        match scheme {
            CredentialScheme::HeaderOrQueryKey => {
                let provided = header_value(headers, GOOG_API_KEY_HEADER).or_else(|| query_key(uri));
                provided.as_deref() == Some(secret)
            }
            CredentialScheme::BearerOrQueryKey => match header_value(headers, AUTHORIZATION.as_str()) {
                Some(authorization) => authorization
                    .strip_prefix("Bearer ")
                    .is_some_and(|key| key == secret),
                None => query_key(uri).as_deref() == Some(secret),
            },
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn query_key(uri: &Uri) -> Option<String> {
    Query::<KeyQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(q)| q.key)
        .filter(|k| !k.is_empty())
}
