//! Socket admission: bearer tokens, origin checks, identity resolution.
//!
//! Tokens arrive either as websocket subprotocol entries or as a `token`
//! query parameter. Validation itself is pluggable through
//! [`TokenValidator`]; the bundled [`JwtValidator`] covers the common
//! HS256 deployment.

use std::collections::HashMap;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::SignalingError;

/// The subprotocol name reserved for protocol negotiation. Any other
/// entry in `Sec-WebSocket-Protocol` is treated as a token candidate.
pub const SUBPROTOCOL: &str = "huddle.v1";

/// Claims extracted from a validated token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Claims {
    pub subject: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Validates a bearer token into [`Claims`].
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<Claims, SignalingError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct JwtClaims {
    sub: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    exp: u64,
}

/// HS256 validator over a shared secret.
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl TokenValidator for JwtValidator {
    fn validate(&self, token: &str) -> Result<Claims, SignalingError> {
        let data = jsonwebtoken::decode::<JwtClaims>(token, &self.key, &self.validation)
            .map_err(|e| SignalingError::Auth(e.to_string()))?;
        Ok(Claims {
            subject: data.claims.sub,
            name: data.claims.name,
            email: data.claims.email,
        })
    }
}

/// Accepts any non-empty token and uses it verbatim as the subject.
///
/// Development mode only; never wire this up in a deployment that is
/// reachable from anything you do not trust.
#[derive(Debug, Default)]
pub struct InsecureValidator;

impl TokenValidator for InsecureValidator {
    fn validate(&self, token: &str) -> Result<Claims, SignalingError> {
        if token.is_empty() {
            return Err(SignalingError::Auth("empty token".to_owned()));
        }
        Ok(Claims {
            subject: token.to_owned(),
            name: None,
            email: None,
        })
    }
}

/// The identity a socket was admitted with.
#[derive(Clone, Debug)]
pub struct Admitted {
    pub client_id: String,
    pub display_name: String,
    pub claims: Claims,
    /// Set when the token came in via the subprotocol header; the upgrade
    /// response must echo it so the client can confirm which candidate
    /// won.
    pub echo_subprotocol: Option<String>,
}

pub struct Admission {
    validator: Box<dyn TokenValidator>,
    /// `(scheme, host)` pairs; empty admits every origin.
    allowed_origins: Vec<(String, String)>,
    dev_mode: bool,
}

impl Admission {
    pub fn new(
        validator: Box<dyn TokenValidator>,
        allowed_origins: &[String],
        dev_mode: bool,
    ) -> Self {
        let allowed_origins = allowed_origins
            .iter()
            .filter_map(|origin| match url::Url::parse(origin) {
                Ok(url) => {
                    let host = url.host_str()?.to_owned();
                    Some((url.scheme().to_owned(), host))
                }
                Err(e) => {
                    tracing::warn!("ignoring unparseable allowed origin {origin:?}: {e}");
                    None
                }
            })
            .collect();
        Self {
            validator,
            allowed_origins,
            dev_mode,
        }
    }

    /// Validates the request origin by scheme and host. Requests without
    /// an origin (non-browser clients) pass.
    pub fn check_origin(&self, origin: Option<&str>) -> Result<(), SignalingError> {
        let Some(origin) = origin else {
            return Ok(());
        };
        if self.allowed_origins.is_empty() {
            return Ok(());
        }
        let url = url::Url::parse(origin)
            .map_err(|e| SignalingError::Origin(format!("unparseable origin {origin:?}: {e}")))?;
        let host = url.host_str().unwrap_or_default();
        if self
            .allowed_origins
            .iter()
            .any(|(scheme, allowed)| scheme == url.scheme() && allowed == host)
        {
            Ok(())
        } else {
            Err(SignalingError::Origin(format!(
                "origin {origin:?} not in allow-list"
            )))
        }
    }

    /// Resolves the socket's identity from the subprotocol header and the
    /// request query string.
    ///
    /// Subprotocol candidates are tried in order and the first that
    /// validates wins (and is echoed back in the handshake); the `token`
    /// query parameter is the fallback.
    pub fn authorize(
        &self,
        subprotocols: Option<&str>,
        query: &HashMap<String, String>,
    ) -> Result<Admitted, SignalingError> {
        let mut last_err = None;
        if let Some(header) = subprotocols {
            for candidate in header
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty() && *t != SUBPROTOCOL)
            {
                match self.validator.validate(candidate) {
                    Ok(claims) => {
                        return Ok(self.admitted(claims, query, Some(candidate.to_owned())));
                    }
                    Err(e) => last_err = Some(e),
                }
            }
        }

        if let Some(token) = query.get("token") {
            let claims = self.validator.validate(token)?;
            return Ok(self.admitted(claims, query, None));
        }

        Err(last_err.unwrap_or_else(|| SignalingError::Auth("no token presented".to_owned())))
    }

    fn admitted(
        &self,
        claims: Claims,
        query: &HashMap<String, String>,
        echo_subprotocol: Option<String>,
    ) -> Admitted {
        let username = query.get("username").filter(|n| !n.is_empty());

        // username param > name claim > email local-part > subject
        let display_name = username
            .cloned()
            .or_else(|| claims.name.clone())
            .or_else(|| {
                claims
                    .email
                    .as_deref()
                    .and_then(|email| email.split('@').next())
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| claims.subject.clone());

        // In dev mode the username parameter also forks the client id so
        // one principal can simulate several participants.
        let client_id = match (self.dev_mode, username) {
            (true, Some(name)) => name.clone(),
            _ => claims.subject.clone(),
        };

        Admitted {
            client_id,
            display_name,
            claims,
            echo_subprotocol,
        }
    }
}

/// Parses the query portion of a request URI into a key/value map.
pub fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let Some(query) = query else {
        return HashMap::new();
    };
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}
