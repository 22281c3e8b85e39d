//! The build engine: a dependency-ordered step graph with bounded
//! parallelism.
//!
//! Steps run as soon as their inputs are ready; peers run concurrently up to
//! the plan's concurrency limit, enforced by a semaphore around every leaf
//! step. A build-level cancel signal stops new steps and aborts in-flight
//! network I/O.
//!
//! ```text
//! RetrieveBaseCredentials ──► PullBaseManifest ──► PullBaseConfig ─┐
//! RetrieveTargetCredentials ─► AuthenticatePush ────────────────┐ │
//! BuildApplicationLayers (per layer, cache-backed) ─────────────┤ │
//!                                                               ▼ ▼
//!                      PushLayers (skip on HEAD hit, mount, upload)
//!                                      ▼
//!                  BuildContainerConfig ─► PushContainerConfig
//!                                      ▼
//!                        PushManifest (+ additional tags)
//! ```

use std::future::Future;
use std::io::BufReader;
use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use strata_core::error::{Result, StrataError};
use tokio::sync::{watch, Semaphore};

use super::layer::{self, BuiltLayer};
use super::progress::ProgressTracker;
use super::{BuildPlan, OutputTarget};
use crate::blob::{BlobDescriptor, CompressedBlob, Digest};
use crate::cache::{CachedLayer, LayerCache};
use crate::credentials::{Credential, CredentialResolver};
use crate::export::{self, ExportImage};
use crate::image::config::HistoryEntry;
use crate::image::manifest::{self, ImageManifest, PulledManifest, Schema1Manifest};
use crate::image::{ContainerConfig, PreparedLayer};
use crate::registry::auth::RegistryOperation;
use crate::registry::{BlobSource, RegistryClient, RegistrySettings};

/// Result of a completed build.
#[derive(Debug)]
pub struct BuildOutcome {
    /// Digest of the (pushed or exported) manifest.
    pub digest: Digest,
    /// Total layers in the image.
    pub layer_count: usize,
    /// Application layers served straight from the cache.
    pub reused_layers: usize,
    /// Blobs uploaded to the target registry.
    pub uploaded_blobs: usize,
    /// Blobs satisfied by cross-repository mounts.
    pub mounted_blobs: usize,
    /// Blobs the target registry already had.
    pub skipped_blobs: usize,
}

/// Handle used to cancel a running build.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Signal observed by the engine.
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Create a linked cancel handle/signal pair.
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

/// Run a build to completion.
pub async fn build(plan: BuildPlan) -> Result<BuildOutcome> {
    let (_handle, signal) = cancellation();
    build_with_cancel(plan, signal).await
}

/// Run a build that can be cancelled from another task.
pub async fn build_with_cancel(plan: BuildPlan, cancel: CancelSignal) -> Result<BuildOutcome> {
    let cache_root = plan
        .cache_dir
        .clone()
        .unwrap_or_else(|| strata_core::paths::cache_home().join("strata"));
    let cache = Arc::new(LayerCache::open(cache_root)?);

    let engine = Engine {
        semaphore: Arc::new(Semaphore::new(plan.concurrency.max(1))),
        progress: ProgressTracker::new(),
        cache,
        cancel,
        plan,
    };

    match engine.plan.deadline {
        Some(deadline) => match tokio::time::timeout(deadline, engine.run()).await {
            Ok(result) => result,
            Err(_) => Err(StrataError::Transient {
                message: format!("build deadline of {}s exceeded", deadline.as_secs()),
            }),
        },
        None => engine.run().await,
    }
}

struct BaseImage {
    layers: Vec<PreparedLayer>,
    config: ContainerConfig,
}

impl BaseImage {
    /// The empty base: no layers, config synthesized from the platform.
    fn scratch(plan: &BuildPlan) -> Self {
        BaseImage {
            layers: Vec::new(),
            config: ContainerConfig {
                architecture: plan.platform.architecture.clone(),
                os: plan.platform.os.clone(),
                ..Default::default()
            },
        }
    }
}

enum PushOutcome {
    Skipped,
    Mounted,
    Uploaded,
}

struct Engine {
    plan: BuildPlan,
    cache: Arc<LayerCache>,
    semaphore: Arc<Semaphore>,
    cancel: CancelSignal,
    progress: Arc<ProgressTracker>,
}

impl Engine {
    async fn run(&self) -> Result<BuildOutcome> {
        if self.plan.offline && self.plan.output == OutputTarget::Registry {
            return Err(StrataError::OfflineMiss {
                resource: format!("registry push to {}", self.plan.target_image),
            });
        }

        tracing::info!(
            base = %self.plan.base_image,
            target = %self.plan.target_image,
            platform = %self.plan.platform,
            "Starting build"
        );

        match self.plan.output {
            OutputTarget::Registry => self.run_registry_build().await,
            _ => self.run_export_build().await,
        }
    }

    // ------------------------------------------------------------------
    // Registry mode
    // ------------------------------------------------------------------

    async fn run_registry_build(&self) -> Result<BuildOutcome> {
        let ((base, base_client), app_layers, target) = tokio::try_join!(
            self.step("pull base image", self.pull_base_image()),
            self.build_app_layers(),
            self.step("authenticate push", self.prepare_target_client()),
        )?;

        let (uploaded, mounted, skipped) = self
            .push_layers(&target, &base, base_client.as_ref(), &app_layers)
            .await?;

        let config = self.build_container_config(&base, &app_layers);
        let config_bytes = config.to_bytes()?;
        let config_descriptor = BlobDescriptor::new(
            Digest::of_bytes(&config_bytes),
            config_bytes.len() as u64,
        );

        self.step("push container config", async {
            if target.blob_exists(&config_descriptor.digest).await?.is_none() {
                target
                    .push_blob(
                        &config_descriptor.digest,
                        BlobSource::Bytes(config_bytes.clone()),
                        None,
                    )
                    .await?;
            }
            Ok(())
        })
        .await?;

        let manifest = self.build_manifest(&base, &app_layers, &config_descriptor);
        let manifest_bytes = manifest.to_bytes()?;

        let digest = self
            .step("push manifest", async {
                let mut digest = None;
                let mut tags = vec![self.plan.target_image.manifest_reference()];
                tags.extend(self.plan.additional_tags.iter().cloned());
                for tag in &tags {
                    let pushed = target
                        .push_manifest(&manifest_bytes, manifest.content_type(), tag)
                        .await?;
                    digest.get_or_insert(pushed);
                }
                Ok(digest.unwrap_or_else(|| Digest::of_bytes(&manifest_bytes)))
            })
            .await?;

        let reused = app_layers.iter().filter(|l| l.from_cache).count();
        tracing::info!(
            target = %self.plan.target_image,
            digest = %digest,
            layers = manifest.layers.len(),
            uploaded,
            mounted,
            skipped,
            "Pushed image"
        );

        Ok(BuildOutcome {
            digest,
            layer_count: manifest.layers.len(),
            reused_layers: reused,
            uploaded_blobs: uploaded,
            mounted_blobs: mounted,
            skipped_blobs: skipped,
        })
    }

    // ------------------------------------------------------------------
    // Export modes (tar file, docker daemon)
    // ------------------------------------------------------------------

    async fn run_export_build(&self) -> Result<BuildOutcome> {
        let ((base, base_client), app_layers) = tokio::try_join!(
            self.step("pull base image", self.pull_base_image()),
            self.build_app_layers(),
        )?;

        // exports need every base layer materialized locally
        let mut layers: Vec<CachedLayer> = Vec::new();
        for prepared in &base.layers {
            let cached = self
                .step("materialize base layer", async {
                    self.materialize_blob(base_client.as_deref(), &prepared.digest)
                        .await
                })
                .await?;
            layers.push(cached);
        }
        layers.extend(app_layers.iter().map(|built| built.layer.clone()));

        let config = self.build_container_config(&base, &app_layers);
        let config_bytes = config.to_bytes()?;
        let config_descriptor = BlobDescriptor::new(
            Digest::of_bytes(&config_bytes),
            config_bytes.len() as u64,
        );
        let manifest = self.build_manifest(&base, &app_layers, &config_descriptor);
        let manifest_bytes = manifest.to_bytes()?;

        let image = ExportImage {
            config: config_bytes,
            layers,
            repo_tags: self.repo_tags(),
        };

        match &self.plan.output {
            OutputTarget::TarFile(path) => {
                let path = path.clone();
                self.step("write tarball", async { export::write_tar_file(&image, &path) })
                    .await?;
            }
            OutputTarget::DockerDaemon => {
                self.step("docker load", export::load_into_docker(&image, "docker"))
                    .await?;
            }
            OutputTarget::Registry => unreachable!("registry mode handled separately"),
        }

        let reused = app_layers.iter().filter(|l| l.from_cache).count();
        Ok(BuildOutcome {
            digest: Digest::of_bytes(&manifest_bytes),
            layer_count: manifest.layers.len(),
            reused_layers: reused,
            uploaded_blobs: 0,
            mounted_blobs: 0,
            skipped_blobs: 0,
        })
    }

    fn repo_tags(&self) -> Vec<String> {
        let target = &self.plan.target_image;
        let mut tags = vec![target.manifest_reference()];
        tags.extend(self.plan.additional_tags.iter().cloned());
        tags.iter()
            .map(|tag| format!("{}/{}:{}", target.registry, target.repository, tag))
            .collect()
    }

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    /// RetrieveBaseCredentials → PullBaseManifest → PullBaseConfig.
    ///
    /// Returns the base image model and, when the network was involved, the
    /// client for later mounts and layer pulls.
    async fn pull_base_image(&self) -> Result<(BaseImage, Option<Arc<RegistryClient>>)> {
        let plan = &self.plan;
        let platform_key = plan.platform.to_string();

        if plan.base_image.repository == "library/scratch" && plan.base_image.is_docker_hub() {
            return Ok((BaseImage::scratch(plan), None));
        }

        if plan.offline {
            let (manifest_bytes, config_bytes) = self
                .cache
                .base_image(&plan.base_image, &platform_key)?
                .ok_or_else(|| StrataError::OfflineMiss {
                    resource: plan.base_image.to_string(),
                })?;
            let base = self.base_from_cached(&manifest_bytes, &config_bytes)?;
            return Ok((base, None));
        }

        let credential = self
            .resolve_credential(&plan.base_image.registry, plan.base_credential.clone())
            .await?;
        let client = Arc::new(RegistryClient::new(
            &plan.base_image.registry,
            &plan.base_image.repository,
            credential,
            self.registry_settings(),
        )?);

        let pulled = client
            .pull_manifest(&plan.base_image.manifest_reference())
            .await?;

        let (manifest_bytes, image_manifest) =
            match PulledManifest::parse(&pulled.bytes, pulled.media_type.as_deref())? {
                PulledManifest::Image(manifest) => (pulled.bytes, manifest),
                PulledManifest::List(list) => {
                    let entry = list.select(&plan.platform)?;
                    tracing::debug!(
                        platform = %plan.platform,
                        digest = %entry.digest,
                        "Resolved manifest list entry"
                    );
                    let sub = client.pull_manifest(&entry.digest.to_string()).await?;
                    match PulledManifest::parse(&sub.bytes, sub.media_type.as_deref())? {
                        PulledManifest::Image(manifest) => (sub.bytes, manifest),
                        _ => {
                            return Err(StrataError::ManifestNotFound {
                                reference: format!(
                                    "{} resolved to a nested manifest list",
                                    plan.base_image
                                ),
                            })
                        }
                    }
                }
                PulledManifest::Schema1(schema1) => {
                    let base = self.base_from_schema1(&client, &schema1, &pulled.bytes).await?;
                    return Ok((base, Some(client)));
                }
            };

        let mut config_bytes = Vec::new();
        client
            .pull_blob(&image_manifest.config.digest, &mut config_bytes)
            .await?;
        let config = ContainerConfig::from_slice(&config_bytes)?;

        if image_manifest.layers.len() != config.rootfs.diff_ids.len() {
            return Err(StrataError::LayerCountMismatch {
                layers: image_manifest.layers.len(),
                diff_ids: config.rootfs.diff_ids.len(),
            });
        }

        let layers = image_manifest
            .layers
            .iter()
            .zip(config.rootfs.diff_ids.iter())
            .map(|(descriptor, diff_id)| PreparedLayer {
                digest: descriptor.digest,
                diff_id: *diff_id,
                size: descriptor.size,
                media_type: descriptor.media_type.clone(),
            })
            .collect();

        self.cache
            .write_base_image(&plan.base_image, &platform_key, &manifest_bytes, &config_bytes)?;

        tracing::info!(
            base = %plan.base_image,
            layers = config.rootfs.diff_ids.len(),
            "Pulled base image metadata"
        );
        Ok((BaseImage { layers, config }, Some(client)))
    }

    /// Rebuild the base model from cached metadata (offline mode).
    fn base_from_cached(&self, manifest_bytes: &[u8], config_bytes: &[u8]) -> Result<BaseImage> {
        let config = ContainerConfig::from_slice(config_bytes)?;
        let layers = match PulledManifest::parse(manifest_bytes, None)? {
            PulledManifest::Image(manifest) => {
                if manifest.layers.len() != config.rootfs.diff_ids.len() {
                    return Err(StrataError::LayerCountMismatch {
                        layers: manifest.layers.len(),
                        diff_ids: config.rootfs.diff_ids.len(),
                    });
                }
                manifest
                    .layers
                    .iter()
                    .zip(config.rootfs.diff_ids.iter())
                    .map(|(descriptor, diff_id)| PreparedLayer {
                        digest: descriptor.digest,
                        diff_id: *diff_id,
                        size: descriptor.size,
                        media_type: descriptor.media_type.clone(),
                    })
                    .collect()
            }
            PulledManifest::Schema1(schema1) => {
                // layers were cached when this manifest was first pulled
                let mut layers = Vec::new();
                for (digest, diff_id) in schema1
                    .layer_digests()
                    .into_iter()
                    .zip(config.rootfs.diff_ids.iter())
                {
                    let cached = self.cache.layer_by_digest(&digest)?.ok_or_else(|| {
                        StrataError::OfflineMiss {
                            resource: digest.to_string(),
                        }
                    })?;
                    layers.push(PreparedLayer {
                        digest,
                        diff_id: *diff_id,
                        size: cached.size,
                        media_type: manifest::DOCKER_LAYER.to_string(),
                    });
                }
                layers
            }
            PulledManifest::List(_) => {
                return Err(StrataError::CacheCorrupted {
                    message: "cached base manifest is unexpectedly a manifest list".to_string(),
                })
            }
        };
        Ok(BaseImage { layers, config })
    }

    /// Legacy schema 1 base: layer blobs must be pulled to learn their
    /// diff IDs and sizes; the container config is synthesized from the v1
    /// compatibility blob.
    async fn base_from_schema1(
        &self,
        client: &Arc<RegistryClient>,
        schema1: &Schema1Manifest,
        raw_manifest: &[u8],
    ) -> Result<BaseImage> {
        let mut layers = Vec::new();
        for digest in schema1.layer_digests() {
            let cached = self.materialize_blob(Some(client.as_ref()), &digest).await?;
            layers.push(PreparedLayer {
                digest,
                diff_id: cached.diff_id,
                size: cached.size,
                media_type: manifest::DOCKER_LAYER.to_string(),
            });
        }

        let mut config = schema1_container_config(schema1)?;
        config.rootfs.diff_ids = layers.iter().map(|l| l.diff_id).collect();

        self.cache.write_base_image(
            &self.plan.base_image,
            &self.plan.platform.to_string(),
            raw_manifest,
            &config.to_bytes()?,
        )?;

        Ok(BaseImage { layers, config })
    }

    /// BuildApplicationLayers: one step per layer spec, file I/O off the
    /// async runtime, results in plan order.
    async fn build_app_layers(&self) -> Result<Vec<BuiltLayer>> {
        let allocation = Arc::new(
            self.progress
                .allocate(0.3, self.plan.layers.len().max(1) as u64),
        );

        let jobs = self.plan.layers.iter().map(|spec| {
            let cache = Arc::clone(&self.cache);
            let spec = spec.clone();
            let allocation = Arc::clone(&allocation);
            self.step("build application layer", async move {
                let built = tokio::task::spawn_blocking(move || {
                    layer::build_layer(&cache, &spec.name, &spec.entries)
                })
                .await
                .map_err(|e| StrataError::Transient {
                    message: format!("layer build task failed: {e}"),
                })??;
                allocation.complete_unit();
                Ok(built)
            })
        });

        try_join_all(jobs).await
    }

    /// RetrieveTargetCredentials → AuthenticatePush.
    async fn prepare_target_client(&self) -> Result<Arc<RegistryClient>> {
        let plan = &self.plan;
        let credential = self
            .resolve_credential(&plan.target_image.registry, plan.target_credential.clone())
            .await?;
        let client = Arc::new(RegistryClient::new(
            &plan.target_image.registry,
            &plan.target_image.repository,
            credential,
            self.registry_settings(),
        )?);
        client.authenticate(RegistryOperation::Push).await?;
        Ok(client)
    }

    /// PushLayers: every layer is idempotent (HEAD first), base layers try
    /// a cross-repository mount before any bytes move.
    async fn push_layers(
        &self,
        target: &Arc<RegistryClient>,
        base: &BaseImage,
        base_client: Option<&Arc<RegistryClient>>,
        app_layers: &[BuiltLayer],
    ) -> Result<(usize, usize, usize)> {
        let total = base.layers.len() + app_layers.len();
        let allocation = Arc::new(self.progress.allocate(0.4, total.max(1) as u64));

        let mut jobs: Vec<BoxFuture<'_, Result<PushOutcome>>> = Vec::with_capacity(total);
        for prepared in &base.layers {
            let allocation = Arc::clone(&allocation);
            jobs.push(
                self.step("push base layer", async move {
                    let outcome = self.push_base_layer(target, base_client, prepared).await?;
                    allocation.complete_unit();
                    Ok(outcome)
                })
                .boxed(),
            );
        }
        for built in app_layers {
            let allocation = Arc::clone(&allocation);
            jobs.push(
                self.step("push application layer", async move {
                    let outcome = self.push_app_layer(target, &built.layer).await?;
                    allocation.complete_unit();
                    Ok(outcome)
                })
                .boxed(),
            );
        }
        let outcomes = try_join_all(jobs).await?;

        let mut uploaded = 0;
        let mut mounted = 0;
        let mut skipped = 0;
        for outcome in outcomes.iter() {
            match outcome {
                PushOutcome::Uploaded => uploaded += 1,
                PushOutcome::Mounted => mounted += 1,
                PushOutcome::Skipped => skipped += 1,
            }
        }
        Ok((uploaded, mounted, skipped))
    }

    async fn push_base_layer(
        &self,
        target: &RegistryClient,
        base_client: Option<&Arc<RegistryClient>>,
        prepared: &PreparedLayer,
    ) -> Result<PushOutcome> {
        if target.blob_exists(&prepared.digest).await?.is_some() {
            return Ok(PushOutcome::Skipped);
        }

        if let Some(base_client) = base_client {
            if base_client.registry() == target.registry()
                && target
                    .try_mount(&prepared.digest, base_client.repository())
                    .await?
            {
                return Ok(PushOutcome::Mounted);
            }
        }

        // Mount was unavailable or refused: materialize the blob locally
        // and upload it.
        let cached = self
            .materialize_blob(base_client.map(|c| c.as_ref()), &prepared.digest)
            .await?;
        target
            .push_blob(&prepared.digest, BlobSource::File(cached.blob_path), None)
            .await?;
        Ok(PushOutcome::Uploaded)
    }

    async fn push_app_layer(
        &self,
        target: &RegistryClient,
        layer: &CachedLayer,
    ) -> Result<PushOutcome> {
        if target.blob_exists(&layer.digest).await?.is_some() {
            return Ok(PushOutcome::Skipped);
        }
        target
            .push_blob(
                &layer.digest,
                BlobSource::File(layer.blob_path.clone()),
                None,
            )
            .await?;
        Ok(PushOutcome::Uploaded)
    }

    /// Resolve a blob to a local cache entry, pulling it if needed.
    async fn materialize_blob(
        &self,
        source: Option<&RegistryClient>,
        digest: &Digest,
    ) -> Result<CachedLayer> {
        if let Some(cached) = self.cache.layer_by_digest(digest)? {
            return Ok(cached);
        }
        let Some(client) = source else {
            return Err(StrataError::OfflineMiss {
                resource: digest.to_string(),
            });
        };

        let mut temp = self.cache.begin_write()?;
        let descriptor = client.pull_blob(digest, temp.file()).await?;

        // diff id: hash of the decompressed stream
        let file = std::fs::File::open(temp.path())?;
        let mut decoder = flate2::read::GzDecoder::new(BufReader::new(file));
        let diff = crate::blob::compute_digest(&mut decoder)?;

        let blob = CompressedBlob {
            digest: descriptor.digest,
            size: descriptor.size,
            diff_id: diff.digest,
            uncompressed_size: diff.size,
        };
        self.cache.commit_layer(temp, &blob)
    }

    // ------------------------------------------------------------------
    // Config and manifest synthesis
    // ------------------------------------------------------------------

    /// BuildContainerConfig: base config + plan overrides + rootfs diff_ids
    /// mirroring the final layer order.
    fn build_container_config(&self, base: &BaseImage, app_layers: &[BuiltLayer]) -> ContainerConfig {
        let plan = &self.plan;
        let created = plan
            .container
            .creation_time
            .unwrap_or(chrono::DateTime::UNIX_EPOCH)
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        let mut config = base.config.clone();
        config.created = Some(created.clone());
        config.architecture = plan.platform.architecture.clone();
        config.os = plan.platform.os.clone();

        if let Some(entrypoint) = &plan.container.entrypoint {
            config.config.entrypoint = Some(entrypoint.clone());
        }
        if let Some(cmd) = &plan.container.cmd {
            config.config.cmd = Some(cmd.clone());
        }
        if let Some(user) = &plan.container.user {
            config.config.user = Some(user.clone());
        }
        if let Some(working_dir) = &plan.container.working_dir {
            config.config.working_dir = Some(working_dir.clone());
        }
        config.config.env.extend(plan.container.env.iter().cloned());
        for (key, value) in &plan.container.labels {
            config.config.labels.insert(key.clone(), value.clone());
        }
        for port in &plan.container.exposed_ports {
            config.expose(*port);
        }
        for volume in &plan.container.volumes {
            config.add_volume(volume.clone());
        }

        config.rootfs.diff_ids = base
            .layers
            .iter()
            .map(|l| l.diff_id)
            .chain(app_layers.iter().map(|built| built.layer.diff_id))
            .collect();

        for spec in plan.layers.iter().take(app_layers.len()) {
            config.history.push(HistoryEntry {
                created: Some(created.clone()),
                author: Some("strata".to_string()),
                created_by: Some(format!("strata:{}", spec.name)),
                comment: None,
                empty_layer: false,
            });
        }

        config
    }

    fn build_manifest(
        &self,
        base: &BaseImage,
        app_layers: &[BuiltLayer],
        config_descriptor: &BlobDescriptor,
    ) -> ImageManifest {
        // base layers first, application layers after, in plan order
        let layers: Vec<BlobDescriptor> = base
            .layers
            .iter()
            .map(|prepared| BlobDescriptor::new(prepared.digest, prepared.size))
            .chain(app_layers.iter().map(|built| {
                BlobDescriptor::new(built.layer.digest, built.layer.size)
            }))
            .collect();
        ImageManifest::build(self.plan.format, config_descriptor.clone(), layers)
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    async fn resolve_credential(
        &self,
        registry: &str,
        explicit: Option<Credential>,
    ) -> Result<Option<Credential>> {
        if self.plan.offline {
            return Ok(None);
        }
        CredentialResolver::default_chain(explicit, self.plan.credential_helper.clone())
            .resolve(registry)
            .await
    }

    fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            allow_insecure: self.plan.allow_insecure,
            timeout: self.plan.http_timeout,
            ..RegistrySettings::default()
        }
    }

    /// Run one leaf step: wait for a concurrency permit, bail if cancelled,
    /// and abort the step's I/O the moment the cancel signal fires.
    async fn step<T>(
        &self,
        name: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| StrataError::Cancelled)?;

        let mut rx = self.cancel.rx.clone();
        if *rx.borrow() {
            return Err(StrataError::Cancelled);
        }

        tracing::debug!(step = name, "Step started");
        let result = tokio::select! {
            _ = cancelled(&mut rx) => Err(StrataError::Cancelled),
            result = fut => result,
        };
        match &result {
            Ok(_) => tracing::debug!(step = name, "Step finished"),
            Err(e) => tracing::debug!(step = name, error = %e, "Step failed"),
        }
        result
    }
}

/// Resolves when the signal fires; pends forever if the handle goes away
/// without cancelling.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// Synthesize a container config from a schema 1 manifest's v1
/// compatibility blob.
fn schema1_container_config(schema1: &Schema1Manifest) -> Result<ContainerConfig> {
    let newest = schema1
        .history
        .first()
        .ok_or_else(|| StrataError::BadContainerConfig {
            message: "schema 1 manifest carries no history".to_string(),
        })?;
    let v1: serde_json::Value = serde_json::from_str(&newest.v1_compatibility).map_err(|e| {
        StrataError::BadContainerConfig {
            message: format!("invalid v1Compatibility blob: {e}"),
        }
    })?;

    let mut config = ContainerConfig {
        architecture: v1
            .get("architecture")
            .and_then(|v| v.as_str())
            .unwrap_or("amd64")
            .to_string(),
        os: v1.get("os").and_then(|v| v.as_str()).unwrap_or("linux").to_string(),
        ..Default::default()
    };
    if let Some(exec) = v1.get("config") {
        config.config = serde_json::from_value(exec.clone()).map_err(|e| {
            StrataError::BadContainerConfig {
                message: format!("invalid config in v1Compatibility blob: {e}"),
            }
        })?;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Platform;
    use crate::reference::ImageReference;

    fn plan(cache: &tempfile::TempDir) -> BuildPlan {
        let mut plan = BuildPlan::new(
            ImageReference::parse("scratch").unwrap(),
            ImageReference::parse("registry.example.com/acme/app:1.0").unwrap(),
        );
        plan.cache_dir = Some(cache.path().to_path_buf());
        plan
    }

    #[tokio::test]
    async fn test_offline_registry_push_rejected() {
        let cache = tempfile::TempDir::new().unwrap();
        let mut plan = plan(&cache);
        plan.offline = true;
        let err = build(plan).await.unwrap_err();
        assert!(matches!(err, StrataError::OfflineMiss { .. }));
    }

    #[test]
    fn test_scratch_base_is_empty() {
        let cache = tempfile::TempDir::new().unwrap();
        let mut p = plan(&cache);
        p.platform = Platform::new("linux", "arm64");
        let base = BaseImage::scratch(&p);
        assert!(base.layers.is_empty());
        assert_eq!(base.config.architecture, "arm64");
        assert_eq!(base.config.os, "linux");
    }

    #[test]
    fn test_schema1_config_synthesis() {
        let schema1 = Schema1Manifest {
            schema_version: 1,
            fs_layers: vec![],
            history: vec![crate::image::manifest::Schema1History {
                v1_compatibility:
                    r#"{"architecture":"amd64","os":"linux","config":{"Cmd":["/bin/sh"],"Env":["A=1"]}}"#
                        .to_string(),
            }],
        };
        let config = schema1_container_config(&schema1).unwrap();
        assert_eq!(config.architecture, "amd64");
        assert_eq!(config.config.cmd, Some(vec!["/bin/sh".to_string()]));
        assert_eq!(config.config.env, vec!["A=1".to_string()]);
    }

    #[test]
    fn test_schema1_without_history_rejected() {
        let schema1 = Schema1Manifest {
            schema_version: 1,
            fs_layers: vec![],
            history: vec![],
        };
        assert!(schema1_container_config(&schema1).is_err());
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let (handle, signal) = cancellation();
        handle.cancel();
        let cache = tempfile::TempDir::new().unwrap();
        let mut p = plan(&cache);
        p.output = OutputTarget::TarFile(std::env::temp_dir().join("strata-cancelled.tar"));
        // scratch base + no layers: the first step still observes the signal
        let err = build_with_cancel(p, signal).await.unwrap_err();
        assert!(matches!(err, StrataError::Cancelled));
    }
}
