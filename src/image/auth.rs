//! Bearer token negotiation against a registry's token service

use crate::image::transport::Transport;
use crate::{PullError, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, info};

/// Token endpoint advertised by a `401` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// URL tokens are requested from
    pub realm: String,
    /// Service name passed back to the token endpoint; empty when not advertised
    pub service: String,
}

impl AuthChallenge {
    /// Parse a `WWW-Authenticate` header value
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();
        let params = match header.split_once(' ') {
            Some((scheme, params)) if scheme.eq_ignore_ascii_case("bearer") => params,
            _ => {
                return Err(PullError::Auth(format!(
                    "Unsupported authentication challenge: {}",
                    header
                )))
            }
        };

        let mut realm = None;
        let mut service = None;
        for (key, value) in challenge_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                _ => {}
            }
        }

        let realm = realm.filter(|r| !r.is_empty()).ok_or_else(|| {
            PullError::Auth(format!("Challenge carries no token realm: {}", header))
        })?;

        Ok(Self {
            realm,
            service: service.unwrap_or_default(),
        })
    }
}

/// Split `key="value",key=value` pairs, honouring commas inside quotes
fn challenge_params(params: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut chars = params.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }

        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => value.extend(chars.next()),
                    '"' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',') {
                value.push(c);
            }
        }

        pairs.push((key.trim().to_string(), value.trim().to_string()));
    }

    pairs
}

/// Short-lived credential for one pull request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken {
    value: String,
}

impl BearerToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Value for the `Authorization` header
    pub fn header_value(&self) -> Result<HeaderValue> {
        HeaderValue::from_str(&format!("Bearer {}", self.value))
            .map_err(|_| PullError::Auth("Token is not a valid header value".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Mints pull tokens for one repository
///
/// Tokens are requested fresh for every fetch instead of being cached with an
/// expiry clock.
#[derive(Debug, Clone)]
pub struct Authenticator {
    challenge: Option<AuthChallenge>,
    scope: String,
}

impl Authenticator {
    /// Ask the registry root whether tokens are needed
    pub async fn probe(transport: &Transport, endpoint: &str, repository: &str) -> Result<Self> {
        let url = format!("{}/v2/", endpoint.trim_end_matches('/'));
        info!("Connecting to registry: {}", endpoint);

        let response = transport.get(&url, &HeaderMap::new()).await?;
        let challenge = match response.status() {
            StatusCode::OK => {
                debug!("Registry {} needs no authentication", endpoint);
                None
            }
            StatusCode::UNAUTHORIZED => {
                let header = response
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        PullError::Auth(format!(
                            "{} answered 401 without a WWW-Authenticate challenge",
                            url
                        ))
                    })?;
                let challenge = AuthChallenge::parse(header)?;
                debug!(
                    "Token endpoint {} (service {:?})",
                    challenge.realm, challenge.service
                );
                Some(challenge)
            }
            status => {
                return Err(PullError::Auth(format!(
                    "Unexpected status {} probing {}",
                    status, url
                )))
            }
        };

        Ok(Self::new(challenge, repository))
    }

    pub fn new(challenge: Option<AuthChallenge>, repository: &str) -> Self {
        Self {
            challenge,
            scope: format!("repository:{}:pull", repository),
        }
    }

    pub fn challenge(&self) -> Option<&AuthChallenge> {
        self.challenge.as_ref()
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// URL a token is requested from
    pub fn token_url(&self, challenge: &AuthChallenge) -> Result<Url> {
        let mut url = Url::parse(&challenge.realm).map_err(|e| {
            PullError::Auth(format!("Invalid token realm {}: {}", challenge.realm, e))
        })?;
        url.query_pairs_mut()
            .append_pair("service", &challenge.service)
            .append_pair("scope", &self.scope);
        Ok(url)
    }

    /// Request a new token
    pub async fn token(&self, transport: &Transport) -> Result<Option<BearerToken>> {
        let Some(challenge) = &self.challenge else {
            return Ok(None);
        };

        let url = self.token_url(challenge)?;
        let response = transport
            .get(url.as_str(), &HeaderMap::new())
            .await
            .map_err(|e| match e {
                PullError::Connection(msg) => {
                    PullError::Auth(format!("Token endpoint unreachable: {}", msg))
                }
                other => other,
            })?;

        if !response.status().is_success() {
            return Err(PullError::Auth(format!(
                "Token endpoint {} returned {}",
                challenge.realm,
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| PullError::Auth(format!("Unreadable token response: {}", e)))?;

        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .map(BearerToken::new)
            .map(Some)
            .ok_or_else(|| PullError::Auth("Token response has no token field".to_string()))
    }

    /// Headers for the next registry call: a fresh token plus the given Accept
    pub async fn mint(&self, transport: &Transport, accept: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(token) = self.token(transport).await? {
            headers.insert(AUTHORIZATION, token.header_value()?);
        }
        if !accept.is_empty() {
            headers.insert(
                ACCEPT,
                HeaderValue::from_str(accept)
                    .map_err(|_| PullError::Auth(format!("Invalid Accept value {}", accept)))?,
            );
        }
        Ok(headers)
    }
}
