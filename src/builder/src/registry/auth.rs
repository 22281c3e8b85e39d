//! Registry authentication.
//!
//! Implements the Docker Registry token flow: parse the `WWW-Authenticate`
//! challenge from an unauthenticated response, exchange credentials at the
//! token realm, and hold the resulting state for subsequent requests.
//!
//! State machine per client: `Unauthenticated` → `Basic` or
//! `Bearer(token)`. Any later 401 re-runs the bearer exchange, bounded by a
//! refresh budget of five per client.

use serde::Deserialize;
use strata_core::error::{Result, StrataError};

use crate::credentials::Credential;

/// What the token is for; decides the requested scope actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryOperation {
    Pull,
    Push,
}

impl RegistryOperation {
    pub fn scope_actions(&self) -> &'static str {
        match self {
            RegistryOperation::Pull => "pull",
            RegistryOperation::Push => "pull,push",
        }
    }
}

/// Current authentication state of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    /// Attach basic credentials to every request.
    Basic(Credential),
    /// Attach `Authorization: Bearer <token>`.
    Bearer(String),
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic,
    Bearer(BearerChallenge),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    /// Defaults to the registry host when the challenge omits it.
    pub service: Option<String>,
}

impl Challenge {
    /// Parse a `WWW-Authenticate` header value. Returns `None` for schemes
    /// we do not speak.
    pub fn parse(header: &str) -> Option<Self> {
        let trimmed = header.trim();
        let scheme = trimmed.split_whitespace().next()?;
        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Challenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let realm = param_value(trimmed, "realm")?;
        let service = param_value(trimmed, "service");
        Some(Challenge::Bearer(BearerChallenge { realm, service }))
    }
}

/// Extract `key="value"` from a challenge parameter list.
fn param_value(header: &str, key: &str) -> Option<String> {
    let params = header.split_once(char::is_whitespace)?.1;
    for param in params.split(',') {
        let (name, value) = match param.split_once('=') {
            Some(pair) => pair,
            None => continue,
        };
        if name.trim().eq_ignore_ascii_case(key) {
            return Some(value.trim().trim_matches('"').to_string());
        }
    }
    None
}

/// Token endpoint response. `access_token` is an accepted alias for `token`.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

impl TokenResponse {
    fn into_token(self) -> Option<String> {
        self.token.or(self.access_token)
    }
}

/// Exchanges credentials for bearer tokens at a challenge's realm.
#[derive(Debug, Clone)]
pub struct Authenticator {
    registry: String,
    repository: String,
    credential: Option<Credential>,
}

impl Authenticator {
    pub fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
        credential: Option<Credential>,
    ) -> Self {
        Self {
            registry: registry.into(),
            repository: repository.into(),
            credential,
        }
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// The scope string requested from the token endpoint.
    pub fn scope(&self, operation: RegistryOperation) -> String {
        format!("repository:{}:{}", self.repository, operation.scope_actions())
    }

    /// Fetch a bearer token for `operation` from the challenge's realm.
    ///
    /// Sends basic auth with the configured credential, or an OAuth2
    /// `refresh_token` grant when the credential is a refresh token.
    pub async fn fetch_token(
        &self,
        http: &reqwest::Client,
        challenge: &BearerChallenge,
        operation: RegistryOperation,
    ) -> Result<String> {
        let service = challenge.service.as_deref().unwrap_or(&self.registry);
        let scope = self.scope(operation);

        let response = match &self.credential {
            Some(credential) if credential.is_refresh_token() => {
                let form = [
                    ("grant_type", "refresh_token"),
                    ("refresh_token", credential.secret.as_str()),
                    ("service", service),
                    ("scope", scope.as_str()),
                ];
                http.post(&challenge.realm).form(&form).send().await
            }
            credential => {
                let mut request = http
                    .get(&challenge.realm)
                    .query(&[("service", service), ("scope", scope.as_str())]);
                if let Some(credential) = credential {
                    request = request
                        .basic_auth(&credential.username, Some(&credential.secret));
                }
                request.send().await
            }
        }
        .map_err(|e| StrataError::Transient {
            message: format!("token request to {} failed: {e}", challenge.realm),
        })?;

        if !response.status().is_success() {
            return Err(StrataError::Unauthorized {
                registry: self.registry.clone(),
                repository: self.repository.clone(),
                challenge: Some(format!(
                    "token endpoint {} returned {}",
                    challenge.realm,
                    response.status()
                )),
            });
        }

        let parsed: TokenResponse =
            response
                .json()
                .await
                .map_err(|e| StrataError::Serialization(format!(
                    "token response from {}: {e}",
                    challenge.realm
                )))?;

        parsed
            .into_token()
            .ok_or_else(|| StrataError::Unauthorized {
                registry: self.registry.clone(),
                repository: self.repository.clone(),
                challenge: Some(format!(
                    "no token in authentication response from {}",
                    challenge.realm
                )),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = Challenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io""#,
        )
        .unwrap();
        match challenge {
            Challenge::Bearer(bearer) => {
                assert_eq!(bearer.realm, "https://auth.docker.io/token");
                assert_eq!(bearer.service.as_deref(), Some("registry.docker.io"));
            }
            other => panic!("unexpected challenge: {other:?}"),
        }
    }

    #[test]
    fn test_parse_bearer_without_service() {
        let challenge = Challenge::parse(r#"Bearer realm="https://reg/token""#).unwrap();
        match challenge {
            Challenge::Bearer(bearer) => assert_eq!(bearer.service, None),
            other => panic!("unexpected challenge: {other:?}"),
        }
    }

    #[test]
    fn test_parse_basic_challenge() {
        assert_eq!(
            Challenge::parse(r#"Basic realm="registry""#),
            Some(Challenge::Basic)
        );
        // scheme is case-insensitive
        assert_eq!(
            Challenge::parse(r#"BASIC realm="registry""#),
            Some(Challenge::Basic)
        );
    }

    #[test]
    fn test_parse_bearer_missing_realm_is_none() {
        assert_eq!(Challenge::parse(r#"Bearer service="x""#), None);
    }

    #[test]
    fn test_parse_unknown_scheme_is_none() {
        assert_eq!(Challenge::parse(r#"Negotiate abc"#), None);
    }

    #[test]
    fn test_scope_strings() {
        let auth = Authenticator::new("my.reg", "acme/app", None);
        assert_eq!(
            auth.scope(RegistryOperation::Pull),
            "repository:acme/app:pull"
        );
        assert_eq!(
            auth.scope(RegistryOperation::Push),
            "repository:acme/app:pull,push"
        );
    }

    #[test]
    fn test_token_response_alias() {
        let with_token: TokenResponse =
            serde_json::from_str(r#"{"token": "t1"}"#).unwrap();
        assert_eq!(with_token.into_token().as_deref(), Some("t1"));

        let with_access: TokenResponse =
            serde_json::from_str(r#"{"access_token": "t2"}"#).unwrap();
        assert_eq!(with_access.into_token().as_deref(), Some("t2"));

        let with_both: TokenResponse =
            serde_json::from_str(r#"{"token": "t1", "access_token": "t2"}"#).unwrap();
        assert_eq!(with_both.into_token().as_deref(), Some("t1"));
    }
}
