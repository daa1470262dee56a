//! Configuration for registry access.

use std::time::Duration;

use dike_core::policy::CredentialSources;

/// Options governing one set of registry fetches.
///
/// Derived from a policy's credential configuration plus engine-level
/// settings, and passed to every fetch performed for that policy.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Names of image pull secrets to resolve through the secret lister.
    pub pull_secrets: Vec<String>,

    /// Named cloud credential helpers, tried after pull secrets.
    pub providers: Vec<String>,

    /// Accept plain-HTTP registries and unverified TLS certificates.
    pub allow_insecure: bool,

    /// Per-request timeout. The surrounding caller owns the overall
    /// deadline; this only bounds a single registry round trip.
    pub timeout: Duration,

    /// User agent presented to registries.
    pub user_agent: String,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            pull_secrets: Vec::new(),
            providers: Vec::new(),
            allow_insecure: false,
            timeout: Duration::from_secs(30),
            user_agent: format!("dike/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl RegistryOptions {
    /// Builds options from a policy's credential configuration.
    #[must_use]
    pub fn from_credentials(credentials: &CredentialSources) -> Self {
        Self {
            pull_secrets: credentials.secrets.clone(),
            providers: credentials.providers.clone(),
            allow_insecure: credentials.allow_insecure_registry,
            ..Self::default()
        }
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Allows insecure registries.
    #[must_use]
    pub const fn with_allow_insecure(mut self, allow: bool) -> Self {
        self.allow_insecure = allow;
        self
    }
}

/// Authentication material resolved for one registry host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RegistryAuth {
    /// No credentials; pull anonymously.
    #[default]
    Anonymous,

    /// HTTP basic authentication.
    Basic {
        /// User name.
        username: String,
        /// Password or personal access token.
        password: String,
    },

    /// Bearer token authentication.
    Bearer {
        /// The token.
        token: String,
    },
}

impl RegistryAuth {
    /// Creates basic credentials.
    #[must_use]
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Creates bearer credentials.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer {
            token: token.into(),
        }
    }

    /// Returns `true` for anonymous access.
    #[must_use]
    pub const fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }
}

/// Safety bounds for the image cache and referrer retrieval.
#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    /// Maximum in-flight fetches during batch prefetch.
    pub max_concurrent_fetches: usize,

    /// Maximum accepted size of a single referrer payload, in bytes.
    pub max_referrer_payload: u64,

    /// Maximum accepted entry count in a referrers index.
    pub max_referrers: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 20,
            max_referrer_payload: 10 * 1024 * 1024,
            max_referrers: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_credentials() {
        let credentials = CredentialSources {
            secrets: vec!["regcred".to_string()],
            providers: vec!["azure".to_string()],
            allow_insecure_registry: true,
        };

        let options = RegistryOptions::from_credentials(&credentials);
        assert_eq!(options.pull_secrets, vec!["regcred"]);
        assert_eq!(options.providers, vec!["azure"]);
        assert!(options.allow_insecure);
    }

    #[test]
    fn test_default_limits() {
        let limits = CacheLimits::default();
        assert_eq!(limits.max_concurrent_fetches, 20);
        assert_eq!(limits.max_referrer_payload, 10 * 1024 * 1024);
        assert_eq!(limits.max_referrers, 50);
    }

    #[test]
    fn test_auth_constructors() {
        assert!(RegistryAuth::Anonymous.is_anonymous());
        assert!(!RegistryAuth::basic("user", "pass").is_anonymous());
        assert!(!RegistryAuth::bearer("token").is_anonymous());
    }
}
