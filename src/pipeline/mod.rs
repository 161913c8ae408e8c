use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Error, Result, anyhow};
use async_channel::{Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::Config;
use crate::pipeline::planner::{PlanOptions, SyncPlanner};
use crate::pipeline::syncer::{DownloadItem, ObjectSyncer, SyncAction, UploadItem};
use crate::storage::checksum::{ContentHasher, Md5ContentHasher};
use crate::storage::filter::has_wildcard;
use crate::storage::hash_cache::HashCache;
use crate::storage::local::{LocalInventory, LocalInventoryBuilder, fs_util};
use crate::storage::s3::lister::{RemoteInventory, RemoteInventoryBuilder};
use crate::storage::{ObjectStore, SyncInventory};
use crate::types::error::{S3mirrorError, is_cancelled_error};
use crate::types::token::SyncCancellationToken;
use crate::types::{StoragePath, SyncDirection, SyncPlan, SyncReport, SyncStatistics};

const CHANNEL_CAPACITY: usize = 20000;

pub mod diff_detector;
pub mod planner;
pub mod syncer;
mod storage_factory;

/// Both inventories of a run, plus where local files live.
struct SyncSides {
    local: LocalInventory,
    remote: RemoteInventory,
    local_root: PathBuf,
    single_file: bool,
}

/// One sync run: load the hash cache, build both inventories, plan, execute, save the cache.
pub struct Pipeline {
    config: Config,
    store: ObjectStore,
    hasher: ContentHasher,
    hash_cache: Arc<Mutex<HashCache>>,
    cancellation_token: SyncCancellationToken,
    stats_sender: Sender<SyncStatistics>,
    stats_receiver: Receiver<SyncStatistics>,
    ready: bool,
}

impl Pipeline {
    pub async fn new(config: Config, cancellation_token: SyncCancellationToken) -> Result<Self> {
        let store = storage_factory::create_object_store(&config).await?;
        Ok(Self::with_store(config, store, cancellation_token))
    }

    /// Runs against the given store instead of one built from the client configuration.
    pub fn with_store(
        config: Config,
        store: ObjectStore,
        cancellation_token: SyncCancellationToken,
    ) -> Self {
        let (stats_sender, stats_receiver) = async_channel::unbounded();

        Self {
            config,
            store,
            hasher: Md5ContentHasher::boxed_new(),
            hash_cache: Arc::new(Mutex::new(HashCache::new())),
            cancellation_token,
            stats_sender,
            stats_receiver,
            ready: true,
        }
    }

    pub fn with_hasher(mut self, hasher: ContentHasher) -> Self {
        self.hasher = hasher;
        self
    }

    pub async fn run(&mut self) -> Result<SyncReport> {
        if !self.ready {
            return Err(anyhow!("it can be executed only once."));
        }
        self.ready = false;

        let start_time = Instant::now();
        trace!("sync pipeline start.");

        self.load_hash_cache()?;

        let direction = self.config.direction();
        let mut sides = match direction {
            SyncDirection::Upload => self.build_upload_sides().await?,
            SyncDirection::Download => self.build_download_sides().await?,
        };

        if self.config.upload_id.is_some() && !sides.single_file {
            return Err(anyhow!(S3mirrorError::InvalidConfiguration(
                "--upload-id requires a single local file as SOURCE.".to_string()
            )));
        }

        if self.config.check_checksum {
            sides
                .remote
                .resolve_composite_hashes(&self.store, &self.cancellation_token)
                .await?;
        }

        let planner = SyncPlanner::new(self.plan_options(), self.cancellation_token.clone());
        let plan = planner
            .plan(&mut sides.local, &mut sides.remote, direction)
            .await?;

        self.send_skip_stats(&plan, &sides, direction).await;
        let batches = self.build_actions(&plan, &sides, direction);

        let mut report = SyncReport {
            dry_run: self.config.dry_run,
            ..SyncReport::default()
        };

        if self.config.dry_run {
            for action in batches.iter().flatten() {
                info!(
                    key = action.relative_path(),
                    action = action.describe(),
                    "[dry-run] sync planned."
                );
                report.planned += 1;
            }
        } else {
            for batch in batches {
                if let Err(e) = self.execute(batch).await {
                    self.collect_stats(&mut report);
                    return Err(e);
                }
            }

            if self.cancellation_token.is_cancelled() {
                return Err(anyhow!(S3mirrorError::Cancelled));
            }

            self.save_hash_cache()?;
        }

        self.collect_stats(&mut report);

        let duration_sec = format!("{:.3}", start_time.elapsed().as_secs_f32());
        info!(
            transferred = report.transferred,
            transferred_byte = report.transferred_bytes,
            copied = report.copied,
            deleted = report.deleted,
            skipped = report.skipped,
            failed = report.failed,
            warning = report.warnings,
            e_tag_verified = report.e_tag_verified,
            planned = report.planned,
            duration_sec = duration_sec,
            "sync summary"
        );

        Ok(report)
    }

    fn plan_options(&self) -> PlanOptions {
        PlanOptions {
            skip_existing: self.config.skip_existing,
            check_checksum: self.config.check_checksum,
            dedup: self.config.dedup,
            delete_removed: self.config.delete_removed,
        }
    }

    fn load_hash_cache(&self) -> Result<()> {
        let Some(path) = &self.config.hash_cache_file else {
            return Ok(());
        };

        let mut hash_cache = HashCache::load(path)?;
        hash_cache.mark_all_for_purge();

        let entries = hash_cache.len();
        let path = path.to_string_lossy().to_string();
        debug!(path = path, entries = entries, "hash cache loaded.");

        *self
            .hash_cache
            .lock()
            .map_err(|_| anyhow!("hash cache lock poisoned."))? = hash_cache;

        Ok(())
    }

    fn save_hash_cache(&self) -> Result<()> {
        let Some(path) = &self.config.hash_cache_file else {
            return Ok(());
        };

        let mut hash_cache = self
            .hash_cache
            .lock()
            .map_err(|_| anyhow!("hash cache lock poisoned."))?;
        let purged = hash_cache.purge();
        hash_cache.save(path)?;

        let entries = hash_cache.len();
        let path = path.to_string_lossy().to_string();
        debug!(
            path = path,
            entries = entries,
            purged = purged,
            "hash cache saved."
        );

        Ok(())
    }

    async fn build_upload_sides(&self) -> Result<SyncSides> {
        let (_, prefix) = storage_factory::remote_path(&self.config)?;

        let files_from = match &self.config.files_from {
            Some(path) => Some(
                tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("failed to read: {}", path.display()))?
                    .lines()
                    .map(str::to_string)
                    .collect::<Vec<_>>(),
            ),
            None => None,
        };

        let roots = storage_factory::local_sources(&self.config);
        let mut builder = LocalInventoryBuilder::new(roots.clone(), self.cancellation_token.clone());
        builder.recursive = self.config.recursive;
        builder.follow_symlinks = self.config.follow_symlinks;
        builder.filter = self.config.filter_config.build_path_filter()?;
        builder.files_from = files_from;

        let mut local = builder.build(
            self.hash_cache.clone(),
            dyn_clone::clone_box(&*self.hasher),
        )?;

        let single_file = local.is_single_file();
        let mut remote_prefix = prefix.clone();
        if single_file {
            let file_name = local.keys().into_iter().next().unwrap_or_default();
            if prefix.is_empty() || prefix.ends_with('/') {
                remote_prefix = format!("{prefix}{file_name}");
            } else {
                let target_name = prefix.rsplit('/').next().unwrap_or_default().to_string();
                debug!(
                    path = file_name,
                    key = prefix,
                    "single file is uploaded under another name."
                );
                local.rename(&file_name, &target_name);
            }
        } else if !prefix.is_empty() && !prefix.ends_with('/') {
            // a directory is always uploaded under the prefix, never beside it
            remote_prefix = format!("{prefix}/");
        }

        let mut remote = self.build_remote_inventory(&remote_prefix).await?;
        if single_file {
            let local_keys: BTreeSet<String> = local.keys().into_iter().collect();
            remote.retain(|relative_key| local_keys.contains(relative_key));
        }

        Ok(SyncSides {
            local,
            remote,
            local_root: roots.into_iter().next().unwrap_or_default(),
            single_file,
        })
    }

    async fn build_download_sides(&self) -> Result<SyncSides> {
        let (_, prefix) = storage_factory::remote_path(&self.config)?;
        let StoragePath::Local(target) = &self.config.target else {
            return Err(anyhow!(S3mirrorError::InvalidConfiguration(
                "TARGET must be a local path.".to_string()
            )));
        };

        let mut remote = self.build_remote_inventory(&prefix).await?;

        let single_object = !prefix.is_empty()
            && !prefix.ends_with('/')
            && !has_wildcard(&prefix)
            && remote.len() == 1
            && remote.objects().all(|object| object.key == prefix);

        let (local_root, file_name) = storage_factory::resolve_local_target(target, single_object);
        if let Some(file_name) = file_name {
            if let Some(relative_key) = remote.keys().into_iter().next() {
                debug!(
                    key = prefix,
                    path = file_name,
                    "single object is downloaded under another name."
                );
                remote.rename(&relative_key, &file_name);
            }
        }

        let mut local = if local_root.is_dir() {
            let mut builder = LocalInventoryBuilder::new(
                vec![storage_factory::with_trailing_separator(&local_root)],
                self.cancellation_token.clone(),
            );
            builder.recursive = self.config.recursive;
            builder.follow_symlinks = self.config.follow_symlinks;
            builder.filter = self.config.filter_config.build_path_filter()?;

            builder.build(
                self.hash_cache.clone(),
                dyn_clone::clone_box(&*self.hasher),
            )?
        } else {
            let local_root = local_root.to_string_lossy().to_string();
            debug!(path = local_root, "local target does not exist yet.");
            LocalInventory::empty(
                self.hash_cache.clone(),
                dyn_clone::clone_box(&*self.hasher),
            )
        };

        // Only the selected objects are in scope, never their local siblings.
        if single_object || has_wildcard(&prefix) {
            let remote_keys: BTreeSet<String> = remote.keys().into_iter().collect();
            local.retain(|relative_path| remote_keys.contains(relative_path));
        }

        Ok(SyncSides {
            local,
            remote,
            local_root,
            single_file: single_object,
        })
    }

    async fn build_remote_inventory(&self, prefix: &str) -> Result<RemoteInventory> {
        let mut builder = RemoteInventoryBuilder::new(
            dyn_clone::clone_box(&*self.store),
            prefix,
            self.cancellation_token.clone(),
        );
        builder.recursive = self.config.recursive;
        builder.max_keys = self.config.max_keys;
        builder.filter = self.config.filter_config.build_path_filter()?;
        builder.head_single_object = self.config.check_checksum;

        builder.build().await
    }

    async fn send_skip_stats(&self, plan: &SyncPlan, sides: &SyncSides, direction: SyncDirection) {
        let source_keys = match direction {
            SyncDirection::Upload => sides.local.keys(),
            SyncDirection::Download => sides.remote.keys(),
        };

        for key in source_keys.into_iter().filter(|key| !plan.contains(key)) {
            let _ = self
                .stats_sender
                .send(SyncStatistics::SyncSkip { key })
                .await;
        }
    }

    /// Transfers, then copies, then deletes. A copy may read an object a transfer creates.
    fn build_actions(
        &self,
        plan: &SyncPlan,
        sides: &SyncSides,
        direction: SyncDirection,
    ) -> [Vec<SyncAction>; 3] {
        let mut transfers = Vec::new();
        let mut copies = Vec::new();
        let mut deletes = Vec::new();

        match direction {
            SyncDirection::Upload => {
                for path in &plan.to_transfer {
                    if let Some(item) = upload_item(sides, path) {
                        transfers.push(SyncAction::Upload(item));
                    }
                }
                for (path, existing) in &plan.to_copy {
                    let Some(upload) = upload_item(sides, path) else {
                        continue;
                    };
                    let source_key = sides
                        .remote
                        .get(existing)
                        .map(|object| object.key.clone())
                        .unwrap_or_else(|| sides.remote.full_key(existing));
                    copies.push(SyncAction::CopyObject { source_key, upload });
                }
                for path in &plan.to_delete {
                    let key = sides
                        .remote
                        .get(path)
                        .map(|object| object.key.clone())
                        .unwrap_or_else(|| sides.remote.full_key(path));
                    deletes.push(SyncAction::DeleteObject {
                        relative_path: path.clone(),
                        key,
                    });
                }
            }
            SyncDirection::Download => {
                for path in &plan.to_transfer {
                    if let Some(item) = download_item(sides, path) {
                        transfers.push(SyncAction::Download(item));
                    }
                }
                for (path, existing) in &plan.to_copy {
                    let Some(download) = download_item(sides, path) else {
                        continue;
                    };
                    copies.push(SyncAction::CopyFile {
                        source_path: fs_util::relative_path_to_file_path(
                            &sides.local_root,
                            existing,
                        ),
                        download,
                    });
                }
                for path in &plan.to_delete {
                    let path_buf = sides
                        .local
                        .get(path)
                        .map(|file| file.absolute_path.clone())
                        .unwrap_or_else(|| {
                            fs_util::relative_path_to_file_path(&sides.local_root, path)
                        });
                    deletes.push(SyncAction::DeleteFile {
                        relative_path: path.clone(),
                        path: path_buf,
                    });
                }
            }
        }

        [transfers, copies, deletes]
    }

    async fn execute(&self, actions: Vec<SyncAction>) -> Result<()> {
        if actions.is_empty() || self.cancellation_token.is_cancelled() {
            return Ok(());
        }

        let (sender, receiver) = async_channel::bounded::<SyncAction>(CHANNEL_CAPACITY);

        let mut join_handles: Vec<JoinHandle<Result<()>>> = Vec::new();
        for worker_index in 0..self.config.worker_size.max(1) {
            let syncer = ObjectSyncer::new(
                self.config.clone(),
                dyn_clone::clone_box(&*self.store),
                receiver.clone(),
                self.stats_sender.clone(),
                self.cancellation_token.clone(),
                worker_index,
            );
            join_handles.push(tokio::spawn(async move { syncer.sync().await }));
        }
        drop(receiver);

        for action in actions {
            if self.cancellation_token.is_cancelled() {
                break;
            }
            if sender.send(action).await.is_err() {
                // every worker has stopped
                break;
            }
        }
        sender.close();

        let mut first_error: Option<Error> = None;
        for join_handle in join_handles {
            let result = match join_handle.await {
                Ok(result) => result,
                Err(e) => Err(anyhow!(e).context("sync worker panicked.")),
            };
            if let Err(e) = result {
                if !is_cancelled_error(&e) {
                    let error = format!("{e:#}");
                    error!(error = error, "sync worker failed.");
                }
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn collect_stats(&self, report: &mut SyncReport) {
        while let Ok(stats) = self.stats_receiver.try_recv() {
            report.add(&stats);
        }

        if report.has_failures() {
            warn!(failed = report.failed, "some objects failed to sync.");
        }
    }
}

fn upload_item(sides: &SyncSides, path: &str) -> Option<UploadItem> {
    let mut local = sides.local.get(path)?.clone();
    if local.content_hash.is_none() {
        local.content_hash = sides.local.known_hash(path);
    }

    Some(UploadItem {
        relative_path: path.to_string(),
        key: sides.remote.full_key(path),
        local,
    })
}

fn download_item(sides: &SyncSides, path: &str) -> Option<DownloadItem> {
    let object = sides.remote.get(path)?;

    Some(DownloadItem {
        relative_path: path.to_string(),
        key: object.key.clone(),
        path: fs_util::relative_path_to_file_path(&sides.local_root, path),
        size: object.size,
        expected_hash: object.comparable_hash(),
        last_modified: object.last_modified,
    })
}
