//! OCI Distribution API client.
//!
//! [`RegistryApi`] is the seam between the engine and the network: the
//! fetcher and verifiers take it as an injected dependency, and tests
//! substitute an in-memory implementation. [`HttpRegistryClient`] is the
//! production implementation over blocking HTTP.

use std::fmt;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::config::{RegistryAuth, RegistryOptions};
use crate::error::{RegistryError, Result};
use crate::oci::{self, Descriptor, ImageIndex};

/// The accept header offered when pulling manifests.
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

/// Registry operations required by the fetcher and verifiers.
///
/// All calls are blocking; callers own any overall deadline.
pub trait RegistryApi: Send + Sync {
    /// Fetches a manifest by tag or digest, returning the raw bytes and the
    /// response content type.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for a missing manifest and
    /// [`RegistryError::HttpError`] for other failures.
    fn get_manifest(
        &self,
        registry: &str,
        repository: &str,
        reference: &str,
        auth: &RegistryAuth,
    ) -> Result<(Vec<u8>, String)>;

    /// Resolves the canonical descriptor (digest, size, media type) of a
    /// manifest without downloading it.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`RegistryApi::get_manifest`].
    fn head_manifest(
        &self,
        registry: &str,
        repository: &str,
        reference: &str,
        auth: &RegistryAuth,
    ) -> Result<Descriptor>;

    /// Fetches a blob by digest.
    ///
    /// # Errors
    ///
    /// Returns an error when the blob is missing or the transfer fails.
    fn get_blob(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
        auth: &RegistryAuth,
    ) -> Result<Vec<u8>>;

    /// Fetches the referrers index for a digest.
    ///
    /// A registry without referrers support (404) yields an empty index.
    ///
    /// # Errors
    ///
    /// Returns an error for non-404 failures.
    fn get_referrers(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
        auth: &RegistryAuth,
    ) -> Result<ImageIndex>;
}

/// Blocking HTTP implementation of [`RegistryApi`].
pub struct HttpRegistryClient {
    http: Client,
    allow_insecure: bool,
}

impl fmt::Debug for HttpRegistryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRegistryClient")
            .field("allow_insecure", &self.allow_insecure)
            .finish_non_exhaustive()
    }
}

impl HttpRegistryClient {
    /// Creates a client from registry options.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(options: &RegistryOptions) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(options.timeout)
            .user_agent(&options.user_agent);

        if options.allow_insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder.build().map_err(|e| RegistryError::ConnectionFailed {
            url: "client construction".to_string(),
            source: e,
        })?;

        Ok(Self {
            http,
            allow_insecure: options.allow_insecure,
        })
    }

    /// Returns the base URL for a registry host.
    ///
    /// Loopback hosts use plain HTTP when insecure registries are allowed;
    /// everything else is HTTPS.
    fn base_url(&self, registry: &str) -> String {
        let loopback = registry.starts_with("localhost") || registry.starts_with("127.0.0.1");
        if self.allow_insecure && loopback {
            format!("http://{registry}")
        } else {
            format!("https://{registry}")
        }
    }

    /// Sends a request, answering a bearer challenge once if the registry
    /// demands token authentication.
    fn send(&self, method: Method, url: &str, auth: &RegistryAuth, accept: &str) -> Result<Response> {
        let response = self
            .request(method.clone(), url, accept)
            .headers(auth_headers(auth)?)
            .send()?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(challenge) = response
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse)
        else {
            return Ok(response);
        };

        let token = self.exchange_token(&challenge, auth)?;
        debug!(url, "Retrying with exchanged bearer token");

        Ok(self
            .request(method, url, accept)
            .bearer_auth(token)
            .send()?)
    }

    fn request(&self, method: Method, url: &str, accept: &str) -> RequestBuilder {
        self.http.request(method, url).header(ACCEPT, accept)
    }

    /// Performs the token exchange of the OCI distribution auth flow.
    fn exchange_token(&self, challenge: &BearerChallenge, auth: &RegistryAuth) -> Result<String> {
        let mut request = self.http.get(&challenge.realm).query(&challenge.params);

        if let RegistryAuth::Basic { username, password } = auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send()?;
        if !response.status().is_success() {
            return Err(RegistryError::AuthenticationFailed {
                registry: challenge.realm.clone(),
                message: format!("token endpoint returned {}", response.status()),
            });
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            token: Option<String>,
            #[serde(default)]
            access_token: Option<String>,
        }

        let body: TokenResponse = response.json()?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| RegistryError::AuthenticationFailed {
                registry: challenge.realm.clone(),
                message: "token endpoint returned no token".to_string(),
            })
    }
}

impl RegistryApi for HttpRegistryClient {
    #[instrument(skip(self, auth))]
    fn get_manifest(
        &self,
        registry: &str,
        repository: &str,
        reference: &str,
        auth: &RegistryAuth,
    ) -> Result<(Vec<u8>, String)> {
        let url = format!(
            "{}/v2/{repository}/manifests/{reference}",
            self.base_url(registry)
        );
        let response = self.send(Method::GET, &url, auth, MANIFEST_ACCEPT)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound {
                image: format!("{registry}/{repository}:{reference}"),
            });
        }
        if !response.status().is_success() {
            return Err(http_error(response));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or(oci::OCI_MANIFEST)
            .to_string();

        Ok((response.bytes()?.to_vec(), content_type))
    }

    #[instrument(skip(self, auth))]
    fn head_manifest(
        &self,
        registry: &str,
        repository: &str,
        reference: &str,
        auth: &RegistryAuth,
    ) -> Result<Descriptor> {
        let url = format!(
            "{}/v2/{repository}/manifests/{reference}",
            self.base_url(registry)
        );
        let response = self.send(Method::HEAD, &url, auth, MANIFEST_ACCEPT)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound {
                image: format!("{registry}/{repository}:{reference}"),
            });
        }
        if !response.status().is_success() {
            return Err(http_error(response));
        }

        let media_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or(oci::OCI_MANIFEST)
            .to_string();
        let size = response
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        // Registries are required to echo the canonical digest on HEAD; if
        // one does not, fall back to hashing the manifest body.
        let digest = match response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
        {
            Some(digest) => digest.to_string(),
            None => {
                let (body, _) = self.get_manifest(registry, repository, reference, auth)?;
                compute_digest(&body)
            }
        };

        Ok(Descriptor::new(media_type, digest, size))
    }

    #[instrument(skip(self, auth))]
    fn get_blob(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
        auth: &RegistryAuth,
    ) -> Result<Vec<u8>> {
        let url = format!("{}/v2/{repository}/blobs/{digest}", self.base_url(registry));
        let response = self.send(Method::GET, &url, auth, "application/octet-stream")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound {
                image: format!("{registry}/{repository}@{digest}"),
            });
        }
        if !response.status().is_success() {
            return Err(http_error(response));
        }

        Ok(response.bytes()?.to_vec())
    }

    #[instrument(skip(self, auth))]
    fn get_referrers(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
        auth: &RegistryAuth,
    ) -> Result<ImageIndex> {
        let url = format!(
            "{}/v2/{repository}/referrers/{digest}",
            self.base_url(registry)
        );
        let response = self.send(Method::GET, &url, auth, oci::OCI_INDEX)?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(registry, repository, digest, "Registry has no referrers support");
            return Ok(ImageIndex {
                schema_version: 2,
                media_type: Some(oci::OCI_INDEX.to_string()),
                manifests: Vec::new(),
            });
        }
        if !response.status().is_success() {
            return Err(http_error(response));
        }

        Ok(response.json()?)
    }
}

/// A parsed `WWW-Authenticate: Bearer` challenge.
struct BearerChallenge {
    realm: String,
    params: Vec<(String, String)>,
}

impl BearerChallenge {
    fn parse(header: &str) -> Option<Self> {
        let rest = header.strip_prefix("Bearer ")?;

        let mut realm = None;
        let mut params = Vec::new();
        for part in rest.split(',') {
            let (key, value) = part.trim().split_once('=')?;
            let value = value.trim_matches('"').to_string();
            if key == "realm" {
                realm = Some(value);
            } else {
                params.push((key.to_string(), value));
            }
        }

        Some(Self {
            realm: realm?,
            params,
        })
    }
}

/// Creates authentication headers for directly supplied credentials.
fn auth_headers(auth: &RegistryAuth) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    match auth {
        RegistryAuth::Anonymous => {}
        RegistryAuth::Basic { username, password } => {
            let credentials = base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                format!("{username}:{password}"),
            );
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Basic {credentials}")).map_err(|_| {
                    RegistryError::AuthenticationFailed {
                        registry: String::new(),
                        message: "Invalid credentials".to_string(),
                    }
                })?,
            );
        }
        RegistryAuth::Bearer { token } => {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                    RegistryError::AuthenticationFailed {
                        registry: String::new(),
                        message: "Invalid token".to_string(),
                    }
                })?,
            );
        }
    }

    Ok(headers)
}

fn http_error(response: Response) -> RegistryError {
    let status = response.status().as_u16();
    RegistryError::HttpError {
        status,
        message: response.text().unwrap_or_default(),
    }
}

/// Computes the `sha256:hex` digest of raw content.
#[must_use]
pub fn compute_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
