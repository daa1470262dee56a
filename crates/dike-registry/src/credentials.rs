//! Registry credential resolution.
//!
//! Builds an ordered authentication lookup chain per fetch: explicit pull
//! secrets first, then named cloud credential helpers, then anonymous
//! access. Secrets are re-read through the [`SecretLister`] on every
//! resolution so rotated credentials take effect immediately; nothing is
//! cached across evaluations.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{RegistryAuth, RegistryOptions};
use crate::error::{RegistryError, Result};

/// A pull secret as stored by the cluster: the raw `.dockerconfigjson`
/// bytes.
#[derive(Debug, Clone)]
pub struct RegistrySecret {
    /// Raw `.dockerconfigjson` content.
    pub dockerconfigjson: Vec<u8>,
}

/// Lookup of named pull secrets, implemented by the surrounding webhook.
///
/// Absence of a named secret is reported as `Ok(None)` and tolerated;
/// other lookup failures propagate.
pub trait SecretLister: Send + Sync {
    /// Fetches a secret by name.
    ///
    /// # Errors
    ///
    /// Returns an error when the lookup itself fails (not when the secret
    /// merely does not exist).
    fn get(&self, name: &str) -> Result<Option<RegistrySecret>>;
}

/// A named credential helper for a cloud registry family.
pub trait CredentialHelper: Send + Sync {
    /// Resolves credentials for the given registry host.
    ///
    /// # Errors
    ///
    /// Returns an error when the helper cannot produce credentials; the
    /// resolver decides whether that is fatal.
    fn resolve(&self, registry: &str) -> Result<RegistryAuth>;
}

/// Resolves registry authentication from pull secrets, credential helpers,
/// and anonymous fallback.
#[derive(Clone)]
pub struct CredentialResolver {
    lister: Option<Arc<dyn SecretLister>>,
    helpers: HashMap<String, Arc<dyn CredentialHelper>>,
}

impl fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("has_lister", &self.lister.is_some())
            .field("helpers", &self.helpers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialResolver {
    /// Creates a resolver with the built-in `azure` helper registered.
    #[must_use]
    pub fn new() -> Self {
        let mut helpers: HashMap<String, Arc<dyn CredentialHelper>> = HashMap::new();
        helpers.insert("azure".to_string(), Arc::new(AzureCredentialHelper::new()));
        Self {
            lister: None,
            helpers,
        }
    }

    /// Attaches a secret lister for pull-secret resolution.
    #[must_use]
    pub fn with_secret_lister(mut self, lister: Arc<dyn SecretLister>) -> Self {
        self.lister = Some(lister);
        self
    }

    /// Registers a credential helper under a provider name.
    #[must_use]
    pub fn with_helper(mut self, name: impl Into<String>, helper: Arc<dyn CredentialHelper>) -> Self {
        self.helpers.insert(name.into(), helper);
        self
    }

    /// Resolves authentication for one registry host.
    ///
    /// Sources are tried in registration order: each named pull secret,
    /// each named provider helper, then anonymous. The first source that
    /// yields credentials for the host wins.
    ///
    /// # Errors
    ///
    /// Returns an error when a secret lookup fails or a secret exists but
    /// cannot be parsed. A missing secret, an unknown provider name, and a
    /// helper that declines are all skipped.
    pub fn resolve(&self, options: &RegistryOptions, registry: &str) -> Result<RegistryAuth> {
        for name in &options.pull_secrets {
            let Some(lister) = &self.lister else {
                warn!(secret = %name, "No secret lister configured; skipping pull secrets");
                break;
            };
            let Some(secret) = lister.get(name)? else {
                debug!(secret = %name, "Pull secret not found");
                continue;
            };
            if let Some(auth) = auth_from_docker_config(name, &secret, registry)? {
                debug!(secret = %name, registry, "Resolved credentials from pull secret");
                return Ok(auth);
            }
        }

        for provider in &options.providers {
            let Some(helper) = self.helpers.get(provider) else {
                warn!(provider = %provider, "Unknown credential provider; skipping");
                continue;
            };
            match helper.resolve(registry)? {
                RegistryAuth::Anonymous => {}
                auth => {
                    debug!(provider = %provider, registry, "Resolved credentials from provider");
                    return Ok(auth);
                }
            }
        }

        Ok(RegistryAuth::Anonymous)
    }
}

/// One entry of a `.dockerconfigjson` `auths` table.
#[derive(Debug, Deserialize, Default)]
struct DockerAuthEntry {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    identitytoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

/// Extracts credentials for a registry host from a pull secret, if present.
fn auth_from_docker_config(
    name: &str,
    secret: &RegistrySecret,
    registry: &str,
) -> Result<Option<RegistryAuth>> {
    let config: DockerConfig =
        serde_json::from_slice(&secret.dockerconfigjson).map_err(|e| RegistryError::SecretError {
            name: name.to_string(),
            message: format!("not a valid dockerconfigjson: {e}"),
        })?;

    let Some(entry) = lookup_host(&config, registry) else {
        return Ok(None);
    };

    if let Some(token) = &entry.identitytoken {
        return Ok(Some(RegistryAuth::bearer(token)));
    }

    if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
        return Ok(Some(RegistryAuth::basic(username, password)));
    }

    if let Some(auth) = &entry.auth {
        let decoded = BASE64.decode(auth).map_err(|e| RegistryError::SecretError {
            name: name.to_string(),
            message: format!("auth field is not valid base64: {e}"),
        })?;
        let decoded = String::from_utf8(decoded).map_err(|_| RegistryError::SecretError {
            name: name.to_string(),
            message: "auth field is not valid UTF-8".to_string(),
        })?;
        let Some((username, password)) = decoded.split_once(':') else {
            return Err(RegistryError::SecretError {
                name: name.to_string(),
                message: "auth field is not 'user:password'".to_string(),
            });
        };
        return Ok(Some(RegistryAuth::basic(username, password)));
    }

    Ok(None)
}

/// Finds the auths entry for a host, honoring the legacy Docker Hub keys.
fn lookup_host<'a>(config: &'a DockerConfig, registry: &str) -> Option<&'a DockerAuthEntry> {
    if let Some(entry) = config.auths.get(registry) {
        return Some(entry);
    }

    // docker.io credentials are conventionally stored under the index host.
    if registry == "docker.io" {
        for key in ["index.docker.io", "https://index.docker.io/v1/", "registry-1.docker.io"] {
            if let Some(entry) = config.auths.get(key) {
                return Some(entry);
            }
        }
    }

    // Tolerate scheme-prefixed keys.
    config
        .auths
        .iter()
        .find(|(key, _)| key.trim_start_matches("https://").trim_end_matches('/') == registry)
        .map(|(_, entry)| entry)
}

/// Credential helper for Azure Container Registry hosts.
///
/// Exchanges an ambient Azure access token for an ACR refresh token. Any
/// failure, including the absence of a token, degrades to anonymous access;
/// credential resolution never hard-fails on this path.
pub struct AzureCredentialHelper {
    client: reqwest::blocking::Client,
}

impl AzureCredentialHelper {
    /// ACR refresh tokens authenticate as this fixed user name.
    const TOKEN_USER: &'static str = "00000000-0000-0000-0000-000000000000";

    /// Creates the helper.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
        }
    }

    fn exchange(&self, registry: &str) -> Result<RegistryAuth> {
        let Ok(aad_token) = std::env::var("AZURE_ACCESS_TOKEN") else {
            debug!(registry, "No Azure access token in environment");
            return Ok(RegistryAuth::Anonymous);
        };

        let url = format!("https://{registry}/oauth2/exchange");
        let response = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "access_token"),
                ("service", registry),
                ("access_token", aad_token.as_str()),
            ])
            .send()?;

        if !response.status().is_success() {
            return Err(RegistryError::AuthenticationFailed {
                registry: registry.to_string(),
                message: format!("token exchange returned {}", response.status()),
            });
        }

        #[derive(Deserialize)]
        struct Exchange {
            refresh_token: String,
        }

        let exchange: Exchange = response.json()?;
        Ok(RegistryAuth::basic(Self::TOKEN_USER, exchange.refresh_token))
    }
}

impl Default for AzureCredentialHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialHelper for AzureCredentialHelper {
    fn resolve(&self, registry: &str) -> Result<RegistryAuth> {
        if !registry.ends_with(".azurecr.io") {
            return Ok(RegistryAuth::Anonymous);
        }

        match self.exchange(registry) {
            Ok(auth) => Ok(auth),
            Err(e) => {
                warn!(registry, error = %e, "Azure login failed; falling back to anonymous");
                Ok(RegistryAuth::Anonymous)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapLister(HashMap<String, RegistrySecret>);

    impl SecretLister for MapLister {
        fn get(&self, name: &str) -> Result<Option<RegistrySecret>> {
            Ok(self.0.get(name).cloned())
        }
    }

    fn secret(json: &str) -> RegistrySecret {
        RegistrySecret {
            dockerconfigjson: json.as_bytes().to_vec(),
        }
    }

    fn resolver_with(secrets: &[(&str, &str)]) -> CredentialResolver {
        let map = secrets
            .iter()
            .map(|(name, json)| ((*name).to_string(), secret(json)))
            .collect();
        CredentialResolver::new().with_secret_lister(Arc::new(MapLister(map)))
    }

    #[test]
    fn test_resolve_from_auth_field() {
        let encoded = BASE64.encode("robot:hunter2");
        let json = format!(r#"{{"auths": {{"ghcr.io": {{"auth": "{encoded}"}}}}}}"#);
        let resolver = resolver_with(&[("regcred", &json)]);

        let options = RegistryOptions {
            pull_secrets: vec!["regcred".to_string()],
            ..RegistryOptions::default()
        };

        let auth = resolver.resolve(&options, "ghcr.io").unwrap();
        assert_eq!(auth, RegistryAuth::basic("robot", "hunter2"));
    }

    #[test]
    fn test_resolve_prefers_identity_token() {
        let json = r#"{"auths": {"ghcr.io": {"identitytoken": "tok", "username": "u", "password": "p"}}}"#;
        let resolver = resolver_with(&[("regcred", json)]);

        let options = RegistryOptions {
            pull_secrets: vec!["regcred".to_string()],
            ..RegistryOptions::default()
        };

        let auth = resolver.resolve(&options, "ghcr.io").unwrap();
        assert_eq!(auth, RegistryAuth::bearer("tok"));
    }

    #[test]
    fn test_missing_secret_is_tolerated() {
        let resolver = resolver_with(&[]);
        let options = RegistryOptions {
            pull_secrets: vec!["absent".to_string()],
            ..RegistryOptions::default()
        };

        let auth = resolver.resolve(&options, "ghcr.io").unwrap();
        assert!(auth.is_anonymous());
    }

    #[test]
    fn test_malformed_secret_propagates() {
        let resolver = resolver_with(&[("regcred", "not json")]);
        let options = RegistryOptions {
            pull_secrets: vec!["regcred".to_string()],
            ..RegistryOptions::default()
        };

        assert!(resolver.resolve(&options, "ghcr.io").is_err());
    }

    #[test]
    fn test_first_matching_secret_wins() {
        let first = format!(
            r#"{{"auths": {{"ghcr.io": {{"auth": "{}"}}}}}}"#,
            BASE64.encode("first:one")
        );
        let second = format!(
            r#"{{"auths": {{"ghcr.io": {{"auth": "{}"}}}}}}"#,
            BASE64.encode("second:two")
        );
        let resolver = resolver_with(&[("a", &first), ("b", &second)]);

        let options = RegistryOptions {
            pull_secrets: vec!["a".to_string(), "b".to_string()],
            ..RegistryOptions::default()
        };

        let auth = resolver.resolve(&options, "ghcr.io").unwrap();
        assert_eq!(auth, RegistryAuth::basic("first", "one"));
    }

    #[test]
    fn test_docker_hub_legacy_keys() {
        let json = format!(
            r#"{{"auths": {{"https://index.docker.io/v1/": {{"auth": "{}"}}}}}}"#,
            BASE64.encode("hubuser:hubpass")
        );
        let resolver = resolver_with(&[("regcred", &json)]);

        let options = RegistryOptions {
            pull_secrets: vec!["regcred".to_string()],
            ..RegistryOptions::default()
        };

        let auth = resolver.resolve(&options, "docker.io").unwrap();
        assert_eq!(auth, RegistryAuth::basic("hubuser", "hubpass"));
    }

    #[test]
    fn test_azure_helper_ignores_other_hosts() {
        let helper = AzureCredentialHelper::new();
        let auth = helper.resolve("ghcr.io").unwrap();
        assert!(auth.is_anonymous());
    }

    #[test]
    fn test_anonymous_fallback_with_no_sources() {
        let resolver = CredentialResolver::new();
        let auth = resolver.resolve(&RegistryOptions::default(), "ghcr.io").unwrap();
        assert!(auth.is_anonymous());
    }
}
