//! Authentication and authorization.
//!
//! Three modes selected by configuration: `none` (development, grants all
//! scopes), `psk` (three independent bearer tokens mapped to scopes), and
//! `jwt` (HS256/RS256/ES256 verified against a shared secret, a PEM public
//! key, or a JWKS URL). Admin hierarchically implies submit and read.

mod middleware;

pub use middleware::{require_admin, require_read, require_submit};

use crate::config::{AuthConfig, AuthMode};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Submit,
    Read,
    Admin,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submit => "lens:submit",
            Self::Read => "lens:read",
            Self::Admin => "lens:admin",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "lens:submit" | "submit" => Some(Self::Submit),
            "lens:read" | "read" => Some(Self::Read),
            "lens:admin" | "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub authenticated: bool,
    pub scopes: HashSet<Scope>,
    pub subject: Option<String>,
    pub token_type: Option<&'static str>,
}

impl AuthContext {
    pub fn allow_all() -> Self {
        Self {
            authenticated: true,
            scopes: HashSet::from([Scope::Admin]),
            subject: None,
            token_type: None,
        }
    }

    fn with_scopes(scopes: HashSet<Scope>, token_type: &'static str, subject: &str) -> Self {
        Self {
            authenticated: true,
            scopes,
            subject: Some(subject.to_string()),
            token_type: Some(token_type),
        }
    }

    /// Scope check honoring the hierarchy: admin satisfies everything.
    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&Scope::Admin) || self.scopes.contains(&scope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    MissingToken,
    InvalidToken,
}

impl AuthFailure {
    pub fn message(&self) -> &'static str {
        match self {
            Self::MissingToken => "Missing bearer token",
            Self::InvalidToken => "Invalid or expired token",
        }
    }
}

/// Extract the token from an Authorization header value. The scheme match is
/// case-insensitive; any non-Bearer scheme fails.
pub fn parse_bearer(header: &str) -> Option<&str> {
    let mut parts = header.split_whitespace();
    let scheme = parts.next()?;
    let token = parts.next()?;
    if parts.next().is_some() || !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token)
}

/// Extract the token from a `Sec-WebSocket-Protocol: bearer,<token>` header.
pub fn parse_ws_subprotocol_token(header: &str) -> Option<String> {
    let mut parts = header.split(',').map(str::trim);
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    parts.next().filter(|t| !t.is_empty()).map(str::to_string)
}

const JWKS_CACHE_TTL: Duration = Duration::from_secs(300);

pub struct Authenticator {
    cfg: AuthConfig,
    http: OnceLock<reqwest::Client>,
    jwks_cache: tokio::sync::Mutex<Option<(Instant, jsonwebtoken::jwk::JwkSet)>>,
}

impl Authenticator {
    pub fn new(cfg: AuthConfig) -> Self {
        Self {
            cfg,
            http: OnceLock::new(),
            jwks_cache: tokio::sync::Mutex::new(None),
        }
    }

    pub fn mode(&self) -> AuthMode {
        self.cfg.mode
    }

    /// Authenticate from an Authorization header value.
    pub async fn authenticate(&self, header: Option<&str>) -> Result<AuthContext, AuthFailure> {
        if self.cfg.mode == AuthMode::None {
            return Ok(AuthContext::allow_all());
        }
        let token = header
            .and_then(parse_bearer)
            .ok_or(AuthFailure::MissingToken)?;
        self.authenticate_token(token).await
    }

    /// Authenticate a bare token (WebSocket subprotocol path).
    pub async fn authenticate_token(&self, token: &str) -> Result<AuthContext, AuthFailure> {
        match self.cfg.mode {
            AuthMode::None => Ok(AuthContext::allow_all()),
            AuthMode::Psk => self.validate_psk(token),
            AuthMode::Jwt => self.validate_jwt(token).await,
        }
    }

    fn validate_psk(&self, token: &str) -> Result<AuthContext, AuthFailure> {
        // Admin first: it grants all scopes.
        if self.cfg.psk_admin.as_deref() == Some(token) {
            return Ok(AuthContext::with_scopes(
                HashSet::from([Scope::Admin]),
                "psk",
                "admin",
            ));
        }
        if self.cfg.psk_submit.as_deref() == Some(token) {
            return Ok(AuthContext::with_scopes(
                HashSet::from([Scope::Submit]),
                "psk",
                "submit",
            ));
        }
        if self.cfg.psk_read.as_deref() == Some(token) {
            return Ok(AuthContext::with_scopes(
                HashSet::from([Scope::Read]),
                "psk",
                "read",
            ));
        }
        Err(AuthFailure::InvalidToken)
    }

    fn algorithm(&self) -> Algorithm {
        match self.cfg.jwt_algorithm.to_ascii_uppercase().as_str() {
            "RS256" => Algorithm::RS256,
            "ES256" => Algorithm::ES256,
            _ => Algorithm::HS256,
        }
    }

    fn static_decoding_key(&self) -> Option<DecodingKey> {
        match self.algorithm() {
            Algorithm::HS256 => self
                .cfg
                .jwt_secret
                .as_ref()
                .map(|s| DecodingKey::from_secret(s.as_bytes())),
            Algorithm::RS256 => self
                .cfg
                .jwt_public_key
                .as_ref()
                .and_then(|pem| DecodingKey::from_rsa_pem(pem.as_bytes()).ok()),
            Algorithm::ES256 => self
                .cfg
                .jwt_public_key
                .as_ref()
                .and_then(|pem| DecodingKey::from_ec_pem(pem.as_bytes()).ok()),
            _ => None,
        }
    }

    async fn jwks_decoding_key(&self, token: &str) -> Option<DecodingKey> {
        let url = self.cfg.jwt_jwks_url.as_ref()?;
        let kid = decode_header(token).ok()?.kid;

        let mut cache = self.jwks_cache.lock().await;
        let needs_fetch = cache
            .as_ref()
            .map(|(at, _)| at.elapsed() >= JWKS_CACHE_TTL)
            .unwrap_or(true);
        if needs_fetch {
            let client = self.http.get_or_init(|| {
                reqwest::Client::builder()
                    .timeout(Duration::from_secs(5))
                    .build()
                    .expect("reqwest client construction cannot fail with static options")
            });
            match client.get(url).send().await {
                Ok(resp) => match resp.json::<jsonwebtoken::jwk::JwkSet>().await {
                    Ok(set) => *cache = Some((Instant::now(), set)),
                    Err(e) => warn!(error = %e, "JWKS decode failed"),
                },
                Err(e) => warn!(error = %e, "JWKS fetch failed"),
            }
        }

        let (_, set) = cache.as_ref()?;
        let jwk = match &kid {
            Some(kid) => set.find(kid)?,
            None => set.keys.first()?,
        };
        DecodingKey::from_jwk(jwk).ok()
    }

    async fn validate_jwt(&self, token: &str) -> Result<AuthContext, AuthFailure> {
        let key = if self.cfg.jwt_jwks_url.is_some() {
            self.jwks_decoding_key(token).await
        } else {
            self.static_decoding_key()
        }
        .ok_or(AuthFailure::InvalidToken)?;

        let mut validation = Validation::new(self.algorithm());
        if let Some(iss) = &self.cfg.jwt_issuer {
            validation.set_issuer(&[iss]);
        }
        match &self.cfg.jwt_audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        let data = decode::<Value>(token, &key, &validation).map_err(|e| {
            debug!(error = %e, "JWT validation failed");
            AuthFailure::InvalidToken
        })?;

        let scopes = extract_scopes(&data.claims, &self.cfg.jwt_scope_claim);
        if scopes.is_empty() {
            return Err(AuthFailure::InvalidToken);
        }
        let subject = data
            .claims
            .get("sub")
            .and_then(|s| s.as_str())
            .unwrap_or("jwt");
        Ok(AuthContext::with_scopes(scopes, "jwt", subject))
    }
}

/// Pull scopes out of the configured claim; accepts a space-separated string
/// or an array of strings.
fn extract_scopes(claims: &Value, claim: &str) -> HashSet<Scope> {
    let mut scopes = HashSet::new();
    match claims.get(claim) {
        Some(Value::String(s)) => {
            for part in s.split_whitespace() {
                if let Some(scope) = Scope::parse(part) {
                    scopes.insert(scope);
                }
            }
        }
        Some(Value::Array(arr)) => {
            for part in arr.iter().filter_map(|v| v.as_str()) {
                if let Some(scope) = Scope::parse(part) {
                    scopes.insert(scope);
                }
            }
        }
        _ => {}
    }
    scopes
}
