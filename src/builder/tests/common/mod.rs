//! In-process fake registry for integration tests.
//!
//! Speaks enough of the Docker Registry v2 protocol for full builds: bearer
//! challenges and token grants, manifest pull/push, blob HEAD/GET, uploads
//! (monolithic and chunked) and cross-repository mounts. Every interesting
//! event increments a counter so tests can assert wire behavior, and a
//! fault injector can answer a fixed number of authenticated requests with
//! 401 to exercise token refresh.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use strata_builder::Digest;

pub const TOKEN: &str = "fake-registry-token";

#[derive(Default)]
pub struct Counters {
    pub token_requests: u32,
    pub manifest_gets: u32,
    pub manifest_puts: u32,
    pub blob_heads: u32,
    pub blob_gets: u32,
    pub blob_uploads: u32,
    pub mount_attempts: u32,
    pub mounts: u32,
    pub patches: u32,
    pub total_requests: u32,
}

#[derive(Default)]
pub struct RegistryState {
    /// `(repository, digest)` → blob bytes.
    pub blobs: HashMap<(String, String), Vec<u8>>,
    /// `(repository, tag-or-digest)` → (manifest bytes, media type).
    pub manifests: HashMap<(String, String), (Vec<u8>, String)>,
    /// upload session id → (repository, accumulated bytes).
    uploads: HashMap<String, (String, Vec<u8>)>,
    next_upload_id: u64,

    /// Challenge every unauthenticated request with bearer auth.
    pub require_bearer: bool,
    /// Authorization header observed at the token endpoint.
    pub token_authorization: Option<String>,
    /// Answer this many authenticated /v2/ requests with 401 first.
    pub fail_with_401: u32,

    pub counters: Counters,
}

pub struct FakeRegistry {
    pub state: Arc<Mutex<RegistryState>>,
    addr: SocketAddr,
}

impl FakeRegistry {
    pub async fn start(require_bearer: bool) -> Self {
        let state = Arc::new(Mutex::new(RegistryState {
            require_bearer,
            ..Default::default()
        }));

        let app = axum::Router::new()
            .fallback(handle)
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { state, addr }
    }

    /// `host:port`, usable as an image reference registry component.
    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    /// Store a gzipped layer blob under `repository`. Returns
    /// `(digest, diff_id, size)`.
    pub fn seed_layer(&self, repository: &str, payload: &[u8]) -> (Digest, Digest, u64) {
        let mut compressed = Vec::new();
        let blob =
            strata_builder::blob::gzip_compress(&mut &payload[..], &mut compressed).unwrap();
        self.state.lock().unwrap().blobs.insert(
            (repository.to_string(), blob.digest.to_string()),
            compressed,
        );
        (blob.digest, blob.diff_id, blob.size)
    }

    /// Store a complete single-platform base image and return its manifest
    /// digest.
    pub fn seed_image(
        &self,
        repository: &str,
        tag: &str,
        architecture: &str,
        layer_payloads: &[&[u8]],
    ) -> Digest {
        let mut layers = Vec::new();
        let mut diff_ids = Vec::new();
        for payload in layer_payloads {
            let (digest, diff_id, size) = self.seed_layer(repository, payload);
            layers.push(serde_json::json!({
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "digest": digest.to_string(),
                "size": size,
            }));
            diff_ids.push(diff_id.to_string());
        }

        let config = serde_json::json!({
            "architecture": architecture,
            "os": "linux",
            "created": "2023-01-01T00:00:00Z",
            "config": {
                "Env": ["PATH=/usr/local/bin:/usr/bin"],
                "Cmd": ["/bin/sh"],
            },
            "rootfs": {"type": "layers", "diff_ids": diff_ids},
            "history": [
                {"created": "2023-01-01T00:00:00Z", "created_by": "/bin/sh -c #(nop) base"}
            ],
        });
        let config_bytes = serde_json::to_vec(&config).unwrap();
        let config_digest = Digest::of_bytes(&config_bytes);
        self.state.lock().unwrap().blobs.insert(
            (repository.to_string(), config_digest.to_string()),
            config_bytes.clone(),
        );

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "digest": config_digest.to_string(),
                "size": config_bytes.len(),
            },
            "layers": layers,
        });
        self.seed_manifest(
            repository,
            tag,
            &serde_json::to_vec(&manifest).unwrap(),
            "application/vnd.docker.distribution.manifest.v2+json",
        )
    }

    /// Store raw manifest bytes under a tag (and its digest).
    pub fn seed_manifest(
        &self,
        repository: &str,
        tag: &str,
        bytes: &[u8],
        media_type: &str,
    ) -> Digest {
        let digest = Digest::of_bytes(bytes);
        let mut state = self.state.lock().unwrap();
        state.manifests.insert(
            (repository.to_string(), tag.to_string()),
            (bytes.to_vec(), media_type.to_string()),
        );
        state.manifests.insert(
            (repository.to_string(), digest.to_string()),
            (bytes.to_vec(), media_type.to_string()),
        );
        digest
    }

    pub fn counters<T>(&self, read: impl FnOnce(&Counters) -> T) -> T {
        read(&self.state.lock().unwrap().counters)
    }

    /// Make the next `n` authenticated requests fail with 401.
    pub fn inject_401(&self, n: u32) {
        self.state.lock().unwrap().fail_with_401 = n;
    }
}

fn response(status: u16) -> axum::http::response::Builder {
    Response::builder().status(status)
}

fn challenge(addr: &str) -> Response {
    response(401)
        .header(
            "WWW-Authenticate",
            format!("Bearer realm=\"http://{addr}/token\",service=\"fake-registry\""),
        )
        .body(Body::empty())
        .unwrap()
}

async fn handle(State(state): State<Arc<Mutex<RegistryState>>>, request: Request) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or("").to_string();
    let host = request
        .headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("127.0.0.1")
        .to_string();
    let authorization = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec();

    let mut state = state.lock().unwrap();
    state.counters.total_requests += 1;

    // token endpoint is outside the authenticated surface
    if path == "/token" {
        state.counters.token_requests += 1;
        state.token_authorization = authorization;
        return response(200)
            .header("Content-Type", "application/json")
            .body(Body::from(format!("{{\"token\":\"{TOKEN}\"}}")))
            .unwrap();
    }

    if state.require_bearer {
        let authorized = authorization.as_deref() == Some(&format!("Bearer {TOKEN}"));
        if !authorized {
            return challenge(&host);
        }
        if state.fail_with_401 > 0 {
            state.fail_with_401 -= 1;
            return challenge(&host);
        }
    }

    let Some(rest) = path.strip_prefix("/v2/") else {
        return response(404).body(Body::empty()).unwrap();
    };

    if rest.is_empty() {
        return response(200).body(Body::from("{}")).unwrap();
    }

    // /v2/<repo>/manifests/<ref>
    if let Some((repo, reference)) = split_endpoint(rest, "/manifests/") {
        match method.as_str() {
            "GET" | "HEAD" => {
                state.counters.manifest_gets += 1;
                let Some((bytes, media_type)) =
                    state.manifests.get(&(repo.clone(), reference.clone())).cloned()
                else {
                    return response(404).body(Body::empty()).unwrap();
                };
                return response(200)
                    .header("Content-Type", media_type)
                    .header("Docker-Content-Digest", Digest::of_bytes(&bytes).to_string())
                    .body(Body::from(bytes))
                    .unwrap();
            }
            "PUT" => {
                state.counters.manifest_puts += 1;
                let digest = Digest::of_bytes(&body);
                let media_type = "application/vnd.docker.distribution.manifest.v2+json";
                state.manifests.insert(
                    (repo.clone(), reference),
                    (body.clone(), media_type.to_string()),
                );
                state
                    .manifests
                    .insert((repo, digest.to_string()), (body, media_type.to_string()));
                return response(201)
                    .header("Docker-Content-Digest", digest.to_string())
                    .body(Body::empty())
                    .unwrap();
            }
            _ => return response(405).body(Body::empty()).unwrap(),
        }
    }

    // /v2/<repo>/blobs/uploads/...
    if let Some((repo, session)) = split_endpoint(rest, "/blobs/uploads/") {
        if method == "POST" && session.is_empty() {
            let params = parse_query(&query);
            if let (Some(digest), Some(from)) = (params.get("mount"), params.get("from")) {
                state.counters.mount_attempts += 1;
                if let Some(bytes) = state.blobs.get(&(from.clone(), digest.clone())).cloned() {
                    state.counters.mounts += 1;
                    state.blobs.insert((repo.clone(), digest.clone()), bytes);
                    return response(201)
                        .header("Location", format!("/v2/{repo}/blobs/{digest}"))
                        .body(Body::empty())
                        .unwrap();
                }
            }
            state.next_upload_id += 1;
            let id = format!("session-{}", state.next_upload_id);
            state.uploads.insert(id.clone(), (repo.clone(), Vec::new()));
            return response(202)
                .header("Location", format!("/v2/{repo}/blobs/uploads/{id}"))
                .body(Body::empty())
                .unwrap();
        }

        if method == "PATCH" {
            state.counters.patches += 1;
            match state.uploads.get_mut(&session) {
                Some((_, accumulated)) => accumulated.extend_from_slice(&body),
                None => return response(404).body(Body::empty()).unwrap(),
            }
            return response(202)
                .header("Location", format!("/v2/{repo}/blobs/uploads/{session}"))
                .body(Body::empty())
                .unwrap();
        }

        if method == "PUT" {
            let params = parse_query(&query);
            let Some(digest) = params.get("digest") else {
                return response(400).body(Body::empty()).unwrap();
            };
            let Some((_, mut accumulated)) = state.uploads.remove(&session) else {
                return response(404).body(Body::empty()).unwrap();
            };
            accumulated.extend_from_slice(&body);
            let actual = Digest::of_bytes(&accumulated).to_string();
            if actual != *digest {
                return response(400).body(Body::from("digest mismatch")).unwrap();
            }
            state.counters.blob_uploads += 1;
            state.blobs.insert((repo.clone(), digest.clone()), accumulated);
            return response(201)
                .header("Location", format!("/v2/{repo}/blobs/{digest}"))
                .header("Docker-Content-Digest", digest.clone())
                .body(Body::empty())
                .unwrap();
        }

        return response(405).body(Body::empty()).unwrap();
    }

    // /v2/<repo>/blobs/<digest>
    if let Some((repo, digest)) = split_endpoint(rest, "/blobs/") {
        let stored = state.blobs.get(&(repo, digest)).cloned();
        match (method.as_str(), stored) {
            ("HEAD", Some(bytes)) => {
                state.counters.blob_heads += 1;
                return response(200)
                    .header("Content-Length", bytes.len())
                    .body(Body::empty())
                    .unwrap();
            }
            ("HEAD", None) => {
                state.counters.blob_heads += 1;
                return response(404).body(Body::empty()).unwrap();
            }
            ("GET", Some(bytes)) => {
                state.counters.blob_gets += 1;
                return response(200).body(Body::from(bytes)).unwrap();
            }
            ("GET", None) => return response(404).body(Body::empty()).unwrap(),
            _ => return response(405).body(Body::empty()).unwrap(),
        }
    }

    response(404).body(Body::empty()).unwrap()
}

/// Split `<repo><marker><rest>` on the *last* occurrence of the marker, so
/// multi-segment repository names survive.
fn split_endpoint(path: &str, marker: &str) -> Option<(String, String)> {
    let idx = path.rfind(marker)?;
    let repo = &path[..idx];
    let rest = &path[idx + marker.len()..];
    if repo.is_empty() {
        return None;
    }
    Some((repo.to_string(), rest.to_string()))
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
