//! Docker Registry v2 / OCI Distribution client.
//!
//! One client instance talks to one repository on one registry. The instance
//! owns its authentication state (see [`auth`]): requests go out with the
//! current token, a 401 triggers a serialized refresh bounded by a budget of
//! five, and queued requests pick up the new token on retry. Transient
//! failures (connection reset, 5xx, 429) retry with exponential backoff.

pub mod auth;

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, RANGE, RETRY_AFTER, WWW_AUTHENTICATE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use strata_core::error::{Result, StrataError};

use crate::blob::{BlobDescriptor, Digest, Digester};
use crate::credentials::Credential;
use crate::image::manifest::ACCEPTED_MANIFEST_TYPES;
use auth::{AuthState, Authenticator, Challenge, RegistryOperation};

/// Refreshes allowed after the initial authentication, per client.
const MAX_TOKEN_REFRESHES: u32 = 5;

/// Attempts per request for transient failures.
const MAX_TRANSIENT_ATTEMPTS: u32 = 4;

/// Chunk size for resumable blob uploads.
const UPLOAD_CHUNK_SIZE: u64 = 1024 * 1024;

/// Blobs at or above this size skip the monolithic path and upload chunked.
const MONOLITHIC_LIMIT: u64 = 64 * 1024 * 1024;

/// Per-client knobs, frozen at construction.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Permit falling back to plain HTTP and ignoring certificate errors.
    /// Off unless the build plan explicitly enables it.
    pub allow_insecure: bool,
    /// Connect/read timeout per HTTP call.
    pub timeout: Duration,
    /// Base delay for exponential backoff on transient failures.
    pub retry_base_delay: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            allow_insecure: false,
            timeout: Duration::from_secs(20),
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// A pulled manifest: raw bytes plus wire metadata.
#[derive(Debug, Clone)]
pub struct ManifestAndDigest {
    pub bytes: Vec<u8>,
    pub media_type: Option<String>,
    pub digest: Digest,
}

/// Where blob bytes come from when pushing.
#[derive(Debug, Clone)]
pub enum BlobSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl BlobSource {
    pub fn len(&self) -> Result<u64> {
        match self {
            BlobSource::Bytes(bytes) => Ok(bytes.len() as u64),
            BlobSource::File(path) => Ok(std::fs::metadata(path)?.len()),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn read_all(&self) -> Result<Vec<u8>> {
        match self {
            BlobSource::Bytes(bytes) => Ok(bytes.clone()),
            BlobSource::File(path) => Ok(std::fs::read(path)?),
        }
    }

    /// Read `[start, start+len)`, clamped to the source size.
    fn read_range(&self, start: u64, len: u64) -> Result<Vec<u8>> {
        match self {
            BlobSource::Bytes(bytes) => {
                let end = (start + len).min(bytes.len() as u64) as usize;
                Ok(bytes[start as usize..end].to_vec())
            }
            BlobSource::File(path) => {
                use std::io::{Read, Seek, SeekFrom};
                let mut file = std::fs::File::open(path)?;
                file.seek(SeekFrom::Start(start))?;
                let mut buf = vec![0u8; len as usize];
                let mut filled = 0;
                while filled < buf.len() {
                    let n = file.read(&mut buf[filled..])?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                Ok(buf)
            }
        }
    }
}

/// Client for one repository on one registry.
pub struct RegistryClient {
    http: reqwest::Client,
    registry: String,
    repository: String,
    authenticator: Authenticator,
    settings: RegistrySettings,
    state: tokio::sync::RwLock<AuthState>,
    /// Serializes refreshes; holds the count of refreshes consumed.
    refresh_budget: tokio::sync::Mutex<u32>,
    /// Bumped on every successful refresh so queued 401 handlers can tell
    /// whether someone else already refreshed.
    auth_generation: AtomicU64,
    /// Flipped once when an insecure registry only answers plain HTTP.
    use_http: AtomicBool,
}

impl RegistryClient {
    pub fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
        credential: Option<Credential>,
        settings: RegistrySettings,
    ) -> Result<Self> {
        let registry = registry.into();
        let repository = repository.into();

        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("strata/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(settings.timeout)
            .read_timeout(settings.timeout);
        if settings.allow_insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| StrataError::Transient {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        let authenticator = Authenticator::new(&registry, &repository, credential);

        Ok(Self {
            http,
            registry,
            repository,
            authenticator,
            settings,
            state: tokio::sync::RwLock::new(AuthState::Unauthenticated),
            refresh_budget: tokio::sync::Mutex::new(0),
            auth_generation: AtomicU64::new(0),
            use_http: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    fn scheme(&self) -> &'static str {
        if self.use_http.load(Ordering::Relaxed) {
            "http"
        } else {
            "https"
        }
    }

    /// Resolve a `Location` header, which may be relative.
    fn absolute_location(&self, location: &str) -> String {
        if location.starts_with('/') {
            format!("{}://{}{}", self.scheme(), self.registry, location)
        } else {
            location.to_string()
        }
    }

    /// Probe `GET /v2/` and run the auth flow for `operation`.
    pub async fn authenticate(&self, operation: RegistryOperation) -> Result<()> {
        let registry = self.registry.clone();
        let response = self
            .send(operation, &move |http, scheme| {
                http.request(Method::GET, v2_url(scheme, &registry, ""))
            })
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => Err(self.unauthorized(&response)),
            status => Err(StrataError::Transient {
                message: format!("unexpected status {status} from /v2/ probe"),
            }),
        }
    }

    /// Pull a manifest by tag or digest, verifying the content digest.
    pub async fn pull_manifest(&self, reference: &str) -> Result<ManifestAndDigest> {
        let registry = self.registry.clone();
        let suffix = format!("{}/manifests/{}", self.repository, reference);
        let accept = ACCEPTED_MANIFEST_TYPES.join(", ");

        let response = self
            .send(RegistryOperation::Pull, &move |http, scheme| {
                http.request(Method::GET, v2_url(scheme, &registry, &suffix))
                    .header("Accept", &accept)
            })
            .await?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(StrataError::ManifestNotFound {
                    reference: format!("{}/{}:{}", self.registry, self.repository, reference),
                })
            }
            StatusCode::UNAUTHORIZED => return Err(self.unauthorized(&response)),
            StatusCode::FORBIDDEN => return Err(self.forbidden()),
            status => {
                return Err(StrataError::Transient {
                    message: format!("unexpected status {status} pulling manifest {reference}"),
                })
            }
        }

        let media_type = header_string(response.headers(), CONTENT_TYPE.as_str());
        let advertised = header_string(response.headers(), "Docker-Content-Digest");
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StrataError::Transient {
                message: format!("reading manifest body: {e}"),
            })?
            .to_vec();

        let computed = Digest::of_bytes(&bytes);
        if let Some(advertised) = advertised {
            let advertised = Digest::parse(advertised.trim())?;
            if advertised != computed {
                return Err(StrataError::DigestMismatch {
                    expected: advertised.to_string(),
                    actual: computed.to_string(),
                });
            }
        }
        if let Ok(requested) = Digest::parse(reference) {
            if requested != computed {
                return Err(StrataError::DigestMismatch {
                    expected: requested.to_string(),
                    actual: computed.to_string(),
                });
            }
        }

        Ok(ManifestAndDigest {
            bytes,
            media_type,
            digest: computed,
        })
    }

    /// Push manifest bytes under `tag`. Returns the manifest digest.
    pub async fn push_manifest(
        &self,
        bytes: &[u8],
        content_type: &str,
        tag: &str,
    ) -> Result<Digest> {
        let registry = self.registry.clone();
        let suffix = format!("{}/manifests/{}", self.repository, tag);
        let body = bytes.to_vec();
        let content_type = content_type.to_string();

        let response = self
            .send(RegistryOperation::Push, &move |http, scheme| {
                http.request(Method::PUT, v2_url(scheme, &registry, &suffix))
                    .header(CONTENT_TYPE, &content_type)
                    .body(body.clone())
            })
            .await?;

        let computed = Digest::of_bytes(bytes);
        match response.status() {
            status if status.is_success() => {
                if let Some(advertised) = header_string(response.headers(), "Docker-Content-Digest")
                {
                    let advertised = Digest::parse(advertised.trim())?;
                    if advertised != computed {
                        return Err(StrataError::DigestMismatch {
                            expected: advertised.to_string(),
                            actual: computed.to_string(),
                        });
                    }
                }
                Ok(computed)
            }
            StatusCode::UNAUTHORIZED => Err(self.unauthorized(&response)),
            StatusCode::FORBIDDEN => Err(self.forbidden()),
            status => Err(StrataError::Transient {
                message: format!("unexpected status {status} pushing manifest {tag}"),
            }),
        }
    }

    /// `HEAD` a blob: `Some(content length)` if present, `None` on 404.
    pub async fn blob_exists(&self, digest: &Digest) -> Result<Option<u64>> {
        let registry = self.registry.clone();
        let suffix = format!("{}/blobs/{}", self.repository, digest);
        let response = self
            .send(RegistryOperation::Pull, &move |http, scheme| {
                http.request(Method::HEAD, v2_url(scheme, &registry, &suffix))
            })
            .await?;

        match response.status() {
            status if status.is_success() => {
                let length = header_string(response.headers(), CONTENT_LENGTH.as_str())
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(0);
                Ok(Some(length))
            }
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED => Err(self.unauthorized(&response)),
            StatusCode::FORBIDDEN => Err(self.forbidden()),
            status => Err(StrataError::Transient {
                message: format!("unexpected status {status} checking blob {digest}"),
            }),
        }
    }

    /// Stream a blob into `dest`, verifying the digest on the fly.
    ///
    /// A digest mismatch surfaces after the copy; the caller owns discarding
    /// whatever was written.
    pub async fn pull_blob<W: Write>(&self, digest: &Digest, dest: &mut W) -> Result<BlobDescriptor> {
        let registry = self.registry.clone();
        let suffix = format!("{}/blobs/{}", self.repository, digest);
        let response = self
            .send(RegistryOperation::Pull, &move |http, scheme| {
                http.request(Method::GET, v2_url(scheme, &registry, &suffix))
            })
            .await?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(StrataError::BlobNotFound {
                    registry: self.registry.clone(),
                    repository: self.repository.clone(),
                    digest: digest.to_string(),
                })
            }
            StatusCode::UNAUTHORIZED => return Err(self.unauthorized(&response)),
            StatusCode::FORBIDDEN => return Err(self.forbidden()),
            status => {
                return Err(StrataError::Transient {
                    message: format!("unexpected status {status} pulling blob {digest}"),
                })
            }
        }

        let mut digester = Digester::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| StrataError::Transient {
                message: format!("reading blob {digest}: {e}"),
            })?;
            digester.write_all(&chunk)?;
            dest.write_all(&chunk)?;
        }

        let descriptor = digester.finalize();
        if descriptor.digest != *digest {
            return Err(StrataError::DigestMismatch {
                expected: digest.to_string(),
                actual: descriptor.digest.to_string(),
            });
        }
        Ok(descriptor)
    }

    /// Attempt a cross-repository mount without uploading anything.
    ///
    /// Returns `true` on 201 (mounted). A 202 means the registry opened an
    /// upload session instead; the session is abandoned and `false` comes
    /// back so the caller can materialize the blob first.
    pub async fn try_mount(&self, digest: &Digest, from_repository: &str) -> Result<bool> {
        match self.start_upload(digest, Some(from_repository)).await? {
            UploadStart::Mounted => Ok(true),
            UploadStart::Session(_) => Ok(false),
        }
    }

    /// Push a blob, preferring a cross-repository mount when a source
    /// repository is given. Returns `true` when the registry mounted the
    /// blob and no bytes went over the wire.
    pub async fn push_blob(
        &self,
        digest: &Digest,
        source: BlobSource,
        mount_from: Option<&str>,
    ) -> Result<bool> {
        let location = match self.start_upload(digest, mount_from).await? {
            UploadStart::Mounted => {
                tracing::debug!(digest = %digest, from = ?mount_from, "Blob mounted across repositories");
                return Ok(true);
            }
            UploadStart::Session(location) => location,
        };

        let size = source.len()?;
        if size < MONOLITHIC_LIMIT {
            match self.push_monolithic(&location, digest, &source).await {
                Ok(()) => return Ok(false),
                Err(e) if e.is_transient() => {
                    tracing::debug!(digest = %digest, error = %e, "Monolithic upload failed, retrying chunked");
                }
                Err(e) => return Err(e),
            }
            // A fresh session: the failed monolithic PUT consumed the old one.
            let location = match self.start_upload(digest, None).await? {
                UploadStart::Mounted => return Ok(true),
                UploadStart::Session(location) => location,
            };
            self.push_chunked(&location, digest, &source, size).await?;
        } else {
            self.push_chunked(&location, digest, &source, size).await?;
        }
        Ok(false)
    }

    /// `POST /v2/<repo>/blobs/uploads/`, optionally with mount parameters.
    async fn start_upload(
        &self,
        digest: &Digest,
        mount_from: Option<&str>,
    ) -> Result<UploadStart> {
        let registry = self.registry.clone();
        let mut suffix = format!("{}/blobs/uploads/", self.repository);
        if let Some(from) = mount_from {
            suffix = format!("{suffix}?mount={digest}&from={from}");
        }

        let response = self
            .send(RegistryOperation::Push, &move |http, scheme| {
                http.request(Method::POST, v2_url(scheme, &registry, &suffix))
                    .header(CONTENT_LENGTH, 0)
            })
            .await?;

        match response.status() {
            StatusCode::CREATED => Ok(UploadStart::Mounted),
            StatusCode::ACCEPTED => {
                let location = header_string(response.headers(), LOCATION.as_str())
                    .ok_or_else(|| StrataError::Transient {
                        message: "upload start response missing Location".to_string(),
                    })?;
                Ok(UploadStart::Session(self.absolute_location(&location)))
            }
            StatusCode::UNAUTHORIZED => Err(self.unauthorized(&response)),
            StatusCode::FORBIDDEN => Err(self.forbidden()),
            StatusCode::NOT_FOUND => Err(StrataError::BlobNotFound {
                registry: self.registry.clone(),
                repository: self.repository.clone(),
                digest: digest.to_string(),
            }),
            status => Err(StrataError::Transient {
                message: format!("unexpected status {status} starting upload for {digest}"),
            }),
        }
    }

    /// Single `PUT <location>?digest=` with the whole body.
    async fn push_monolithic(
        &self,
        location: &str,
        digest: &Digest,
        source: &BlobSource,
    ) -> Result<()> {
        let url = append_query(location, &format!("digest={digest}"));
        let body = source.read_all()?;
        let size = body.len();

        let response = self
            .send(RegistryOperation::Push, &move |http, _| {
                http.request(Method::PUT, &url)
                    .header(CONTENT_LENGTH, size)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(body.clone())
            })
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => Err(self.unauthorized(&response)),
            StatusCode::FORBIDDEN => Err(self.forbidden()),
            status => Err(StrataError::Transient {
                message: format!("unexpected status {status} uploading blob {digest}"),
            }),
        }
    }

    /// Repeated `PATCH` with `Content-Range`, then the terminating `PUT`.
    ///
    /// On 416 the registry reports how much it has via `Range`; uploading
    /// resumes from there.
    async fn push_chunked(
        &self,
        location: &str,
        digest: &Digest,
        source: &BlobSource,
        size: u64,
    ) -> Result<()> {
        let mut location = location.to_string();
        let mut offset: u64 = 0;

        while offset < size {
            let chunk = source.read_range(offset, UPLOAD_CHUNK_SIZE)?;
            let end = offset + chunk.len() as u64 - 1;
            let range = format!("{offset}-{end}");
            let chunk_len = chunk.len();
            let url = location.clone();

            let response = self
                .send(RegistryOperation::Push, &move |http, _| {
                    http.request(Method::PATCH, &url)
                        .header("Content-Range", &range)
                        .header(CONTENT_LENGTH, chunk_len)
                        .header(CONTENT_TYPE, "application/octet-stream")
                        .body(chunk.clone())
                })
                .await?;

            match response.status() {
                StatusCode::ACCEPTED => {
                    if let Some(next) = header_string(response.headers(), LOCATION.as_str()) {
                        location = self.absolute_location(&next);
                    }
                    offset = end + 1;
                }
                StatusCode::RANGE_NOT_SATISFIABLE => {
                    // resume from what the registry actually has
                    let committed = header_string(response.headers(), RANGE.as_str())
                        .and_then(|r| parse_range_end(&r));
                    match committed {
                        Some(end) => {
                            tracing::debug!(digest = %digest, resume_at = end + 1, "Resuming chunked upload");
                            offset = end + 1;
                        }
                        None => {
                            return Err(StrataError::Transient {
                                message: format!(
                                    "chunked upload of {digest} rejected without a Range"
                                ),
                            })
                        }
                    }
                }
                StatusCode::UNAUTHORIZED => return Err(self.unauthorized(&response)),
                StatusCode::FORBIDDEN => return Err(self.forbidden()),
                status => {
                    return Err(StrataError::Transient {
                        message: format!("unexpected status {status} uploading chunk of {digest}"),
                    })
                }
            }
        }

        let url = append_query(&location, &format!("digest={digest}"));
        let response = self
            .send(RegistryOperation::Push, &move |http, _| {
                http.request(Method::PUT, &url).header(CONTENT_LENGTH, 0)
            })
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => Err(self.unauthorized(&response)),
            status => Err(StrataError::Transient {
                message: format!("unexpected status {status} finalizing blob {digest}"),
            }),
        }
    }

    /// Send a request with auth attached, refreshing tokens on 401 and
    /// retrying transient failures with backoff.
    async fn send(
        &self,
        operation: RegistryOperation,
        factory: &(dyn Fn(&reqwest::Client, &str) -> RequestBuilder + Send + Sync),
    ) -> Result<Response> {
        let mut transient_attempts: u32 = 0;
        loop {
            let generation = self.auth_generation.load(Ordering::Acquire);
            let request = self.apply_auth(factory(&self.http, self.scheme())).await;

            let outcome = request.send().await;
            let response = match outcome {
                Ok(response) => response,
                Err(e) => {
                    if self.settings.allow_insecure && !self.use_http.load(Ordering::Relaxed) {
                        tracing::warn!(
                            registry = %self.registry,
                            error = %e,
                            "TLS connection failed, falling back to plain HTTP"
                        );
                        self.use_http.store(true, Ordering::Relaxed);
                        continue;
                    }
                    transient_attempts += 1;
                    if transient_attempts >= MAX_TRANSIENT_ATTEMPTS {
                        return Err(StrataError::Transient {
                            message: format!("request to {} failed: {e}", self.registry),
                        });
                    }
                    self.backoff(transient_attempts, None).await;
                    continue;
                }
            };

            match response.status() {
                StatusCode::UNAUTHORIZED => {
                    let challenge = header_string(response.headers(), WWW_AUTHENTICATE.as_str());
                    self.refresh_auth(operation, challenge.as_deref(), generation)
                        .await?;
                    continue;
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    transient_attempts += 1;
                    if transient_attempts >= MAX_TRANSIENT_ATTEMPTS {
                        return Err(StrataError::Transient {
                            message: format!("{} keeps rate-limiting", self.registry),
                        });
                    }
                    let retry_after = header_string(response.headers(), RETRY_AFTER.as_str())
                        .and_then(|v| v.trim().parse::<u64>().ok())
                        .map(Duration::from_secs);
                    self.backoff(transient_attempts, retry_after).await;
                    continue;
                }
                status if status.is_server_error() => {
                    transient_attempts += 1;
                    if transient_attempts >= MAX_TRANSIENT_ATTEMPTS {
                        return Err(StrataError::Transient {
                            message: format!("{} returned {status}", self.registry),
                        });
                    }
                    self.backoff(transient_attempts, None).await;
                    continue;
                }
                _ => return Ok(response),
            }
        }
    }

    async fn apply_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &*self.state.read().await {
            AuthState::Unauthenticated => request,
            AuthState::Basic(credential) => {
                request.basic_auth(&credential.username, Some(&credential.secret))
            }
            AuthState::Bearer(token) => request.bearer_auth(token),
        }
    }

    /// Run the §auth state machine off a 401.
    ///
    /// Refreshes are serialized: whoever holds the budget lock checks
    /// whether another task already refreshed (generation moved) and then
    /// performs at most one exchange.
    async fn refresh_auth(
        &self,
        operation: RegistryOperation,
        challenge_header: Option<&str>,
        seen_generation: u64,
    ) -> Result<()> {
        let mut budget = self.refresh_budget.lock().await;

        if self.auth_generation.load(Ordering::Acquire) != seen_generation {
            // someone else refreshed while we waited; retry with their token
            return Ok(());
        }

        let was_authenticated = !matches!(*self.state.read().await, AuthState::Unauthenticated);
        if was_authenticated {
            if *budget >= MAX_TOKEN_REFRESHES {
                return Err(StrataError::Unauthorized {
                    registry: self.registry.clone(),
                    repository: self.repository.clone(),
                    challenge: challenge_header.map(str::to_string),
                });
            }
            *budget += 1;
            tracing::debug!(
                registry = %self.registry,
                repository = %self.repository,
                refresh = *budget,
                "Refreshing registry auth token"
            );
        }

        let challenge = challenge_header.and_then(Challenge::parse).ok_or_else(|| {
            StrataError::Unauthorized {
                registry: self.registry.clone(),
                repository: self.repository.clone(),
                challenge: challenge_header.map(str::to_string),
            }
        })?;

        let new_state = match challenge {
            Challenge::Basic => match self.authenticator.credential() {
                Some(credential) => AuthState::Basic(credential.clone()),
                None => {
                    return Err(StrataError::Unauthorized {
                        registry: self.registry.clone(),
                        repository: self.repository.clone(),
                        challenge: challenge_header.map(str::to_string),
                    })
                }
            },
            Challenge::Bearer(bearer) => {
                let token = self
                    .authenticator
                    .fetch_token(&self.http, &bearer, operation)
                    .await?;
                AuthState::Bearer(token)
            }
        };

        // A basic retry that got 401 again must not loop forever: if we were
        // already in Basic and the challenge is still Basic, the credential
        // is simply wrong.
        if was_authenticated {
            let current = self.state.read().await.clone();
            if matches!((&current, &new_state), (AuthState::Basic(_), AuthState::Basic(_))) {
                return Err(StrataError::Unauthorized {
                    registry: self.registry.clone(),
                    repository: self.repository.clone(),
                    challenge: challenge_header.map(str::to_string),
                });
            }
        }

        *self.state.write().await = new_state;
        self.auth_generation.fetch_add(1, Ordering::Release);
        Ok(())
    }

    async fn backoff(&self, attempt: u32, retry_after: Option<Duration>) {
        let delay = retry_after
            .unwrap_or_else(|| self.settings.retry_base_delay * 2u32.pow(attempt.saturating_sub(1)));
        tracing::debug!(
            registry = %self.registry,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Backing off before retry"
        );
        tokio::time::sleep(delay).await;
    }

    fn unauthorized(&self, response: &Response) -> StrataError {
        StrataError::Unauthorized {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            challenge: header_string(response.headers(), WWW_AUTHENTICATE.as_str()),
        }
    }

    fn forbidden(&self) -> StrataError {
        StrataError::Forbidden {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
        }
    }
}

enum UploadStart {
    /// 201: the registry mounted the blob; nothing to upload.
    Mounted,
    /// 202: an upload session with its location.
    Session(String),
}

fn v2_url(scheme: &str, registry: &str, suffix: &str) -> String {
    format!("{scheme}://{registry}/v2/{suffix}")
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v: &HeaderValue| v.to_str().ok())
        .map(str::to_string)
}

fn append_query(url: &str, query: &str) -> String {
    if url.contains('?') {
        format!("{url}&{query}")
    } else {
        format!("{url}?{query}")
    }
}

/// Parse the end offset out of a `Range: 0-12345` header.
fn parse_range_end(range: &str) -> Option<u64> {
    range
        .trim()
        .trim_start_matches("bytes=")
        .split('-')
        .nth(1)?
        .trim()
        .parse()
        .ok()
}
