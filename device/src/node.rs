//! A sync node: one engine store backed by SQLite.
//!
//! Every mutating call works on a clone of the store, persists the result
//! in a single transaction, and only then replaces the in-memory store.
//! A call that fails, or whose future is dropped, leaves both untouched.

use crate::{
    config::Config,
    db::{self, NewSyncHistory, Pool, SyncHistoryEntry, SyncMethod, SyncStatus},
    error::{DeviceError, Result},
};
use msync_engine::{
    decode_bundle, seal_bundle, suggested_filename, BundleManifest, BundlePreview, Conflict,
    ConflictSummary, DecodedBundle, EntityType, ExportOptions, ImportSummary, LocalDevice,
    MergeReport, MoneyEventVersion, MoneyPolicy, Operation, Record, Resolution, Store, SystemTime,
    TimeSource,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How a node is set up.
#[derive(Clone)]
pub struct NodeOptions {
    /// Name for the device if it does not exist yet
    pub device_name: String,
    pub money_policy: MoneyPolicy,
    pub time: Arc<dyn TimeSource>,
}

impl NodeOptions {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            money_policy: MoneyPolicy::default(),
            time: Arc::new(SystemTime),
        }
    }
}

impl From<&Config> for NodeOptions {
    fn from(config: &Config) -> Self {
        Self {
            device_name: config.device_name.clone(),
            money_policy: config.money_policy,
            time: Arc::new(SystemTime),
        }
    }
}

/// Sync state of this device.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub device: LocalDevice,
    /// Local operations not yet exported
    pub pending_ops: usize,
    pub open_conflicts: usize,
    pub total_ops: usize,
    pub money_policy: MoneyPolicy,
    pub last_sync: Option<SyncHistoryEntry>,
}

/// A bundle written to disk.
#[derive(Debug, Clone)]
pub struct ExportResult {
    pub manifest: BundleManifest,
    pub path: PathBuf,
}

pub struct SyncNode {
    pool: Pool,
    store: Mutex<Store>,
}

impl SyncNode {
    /// Connect to the configured database and load the node.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::create_pool(&config.database_url, config.max_connections).await?;
        Self::with_pool(pool, NodeOptions::from(config)).await
    }

    /// Load the node from an existing pool, migrating the database first.
    pub async fn with_pool(pool: Pool, options: NodeOptions) -> Result<Self> {
        db::run_migrations(&pool).await?;

        let device = db::get_or_create_device(&pool, &options.device_name).await?;
        let mut store = Store::new(device, options.time);
        if let Some(snapshot) = db::load_snapshot(&pool).await? {
            store.import_state(snapshot)?;
        }
        let store = store.with_money_policy(options.money_policy);

        info!(
            device_id = %store.device_id(),
            ops = store.op_count(),
            pending = store.pending_ops_count(),
            "node loaded"
        );
        Ok(Self {
            pool,
            store: Mutex::new(store),
        })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn device(&self) -> LocalDevice {
        self.store.lock().await.device().clone()
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let last_sync = db::last_sync(&self.pool).await?;
        let store = self.store.lock().await;
        Ok(NodeStatus {
            device: store.device().clone(),
            pending_ops: store.pending_ops_count(),
            open_conflicts: store.open_conflicts_count(),
            total_ops: store.op_count(),
            money_policy: store.money_policy(),
            last_sync,
        })
    }

    // ------------------------------------------------------------------
    // Local changes
    // ------------------------------------------------------------------

    pub async fn create(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: serde_json::Value,
    ) -> Result<Operation> {
        self.mutate(|store| store.capture_create(entity_type, entity_id, payload))
            .await
    }

    pub async fn update(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        changes: serde_json::Value,
    ) -> Result<Vec<Operation>> {
        self.mutate(|store| store.capture_update(entity_type, entity_id, changes))
            .await
    }

    pub async fn delete(&self, entity_type: EntityType, entity_id: &str) -> Result<Operation> {
        self.mutate(|store| store.capture_delete(entity_type, entity_id))
            .await
    }

    pub async fn archive(&self, entity_type: EntityType, entity_id: &str) -> Result<Operation> {
        self.mutate(|store| store.capture_archive(entity_type, entity_id))
            .await
    }

    pub async fn unarchive(&self, entity_type: EntityType, entity_id: &str) -> Result<Operation> {
        self.mutate(|store| store.capture_unarchive(entity_type, entity_id))
            .await
    }

    pub async fn mark_paid(&self, transaction_id: &str, paid_at: Option<&str>) -> Result<Operation> {
        self.mutate(|store| store.capture_mark_paid(transaction_id, paid_at))
            .await
    }

    /// Merge operations handed over by a peer transport.
    pub async fn apply_ops(&self, ops: Vec<Operation>) -> Result<MergeReport> {
        self.mutate(|store| Ok(store.apply_ops(ops))).await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get(&self, entity_type: &EntityType, entity_id: &str) -> Option<Record> {
        self.store.lock().await.get(entity_type, entity_id).cloned()
    }

    pub async fn list(&self, entity_type: &EntityType, include_deleted: bool) -> Vec<Record> {
        let store = self.store.lock().await;
        let Some(query) = store.query(entity_type) else {
            return Vec::new();
        };
        let query = if include_deleted {
            query.include_deleted()
        } else {
            query
        };
        query.all().into_iter().cloned().collect()
    }

    pub async fn money_versions(&self, transaction_id: &str) -> Vec<MoneyEventVersion> {
        self.store.lock().await.money_versions(transaction_id).to_vec()
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// Conflicts in creation order; only open ones unless `include_resolved`.
    pub async fn conflicts(&self, include_resolved: bool) -> Vec<Conflict> {
        let store = self.store.lock().await;
        if include_resolved {
            store.conflicts().cloned().collect()
        } else {
            store.open_conflicts(None).into_iter().cloned().collect()
        }
    }

    pub async fn conflict(&self, id: &str) -> Option<Conflict> {
        self.store.lock().await.conflict(id).cloned()
    }

    pub async fn conflict_summary(&self) -> ConflictSummary {
        self.store.lock().await.conflict_summary()
    }

    pub async fn resolve_conflict(&self, id: &str, resolution: Resolution) -> Result<Operation> {
        self.mutate(|store| store.resolve_conflict(id, resolution))
            .await
    }

    /// Resolve every open conflict to its newest candidate.
    pub async fn resolve_all_conflicts(&self) -> Result<Vec<Operation>> {
        self.mutate(|store| store.resolve_all_conflicts()).await
    }

    // ------------------------------------------------------------------
    // Bundles
    // ------------------------------------------------------------------

    /// Seal pending operations into a bundle file inside `dir`.
    pub async fn export_bundle(
        &self,
        dir: &Path,
        passphrase: &str,
        options: &ExportOptions,
    ) -> Result<ExportResult> {
        let mut current = self.store.lock().await;
        let bundle = current.prepare_export(options)?;

        let passphrase = passphrase.to_string();
        let (bundle, data) = tokio::task::spawn_blocking(move || {
            seal_bundle(&bundle, &passphrase).map(|data| (bundle, data))
        })
        .await??;

        let file_name = suggested_filename(&bundle.manifest);
        let path = dir.join(&file_name);
        write_file(&path, &data).await?;

        let mut next = current.clone();
        next.mark_exported(&bundle);
        let history = NewSyncHistory {
            bundle_id: bundle.manifest.id.clone(),
            method: SyncMethod::Export,
            file_name: Some(file_name),
            peer_device_id: None,
            peer_device_name: None,
            op_count: bundle.manifest.op_count,
            applied: 0,
            skipped: 0,
            conflicts: 0,
            status: SyncStatus::Success,
        };
        self.persist(&next, next.op_count(), Some(&history)).await?;
        *current = next;

        info!(
            bundle_id = %bundle.manifest.id,
            op_count = bundle.manifest.op_count,
            path = %path.display(),
            "bundle exported"
        );
        Ok(ExportResult {
            manifest: bundle.manifest,
            path,
        })
    }

    /// Decrypt a bundle file and report what importing it would do.
    pub async fn preview_bundle(&self, path: &Path, passphrase: &str) -> Result<BundlePreview> {
        let decoded = read_bundle(path, passphrase).await?;
        Ok(self.store.lock().await.preview_decoded(&decoded))
    }

    /// Decrypt, verify and merge a bundle file.
    ///
    /// Decoding failures abort before anything is touched. Importing a bundle
    /// that was already imported changes nothing and records no history.
    pub async fn import_bundle(&self, path: &Path, passphrase: &str) -> Result<ImportSummary> {
        let decoded = match read_bundle(path, passphrase).await {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "bundle rejected");
                return Err(e);
            }
        };
        let peer_id = decoded.manifest.created_by_device_id.clone();
        let peer_name = decoded.manifest.created_by_name.clone();
        let op_count = decoded.manifest.op_count;

        let mut current = self.store.lock().await;
        if current.is_bundle_imported(&decoded.manifest.id) {
            return Ok(current.import_decoded(decoded));
        }

        let mut next = current.clone();
        let before = next.op_count();
        let summary = next.import_decoded(decoded);

        let history = NewSyncHistory {
            bundle_id: summary.bundle_id.clone(),
            method: SyncMethod::Import,
            file_name: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            peer_device_id: Some(peer_id),
            peer_device_name: Some(peer_name),
            op_count,
            applied: summary.applied,
            skipped: summary.skipped,
            conflicts: summary.conflicts,
            status: if summary.malformed.is_empty() {
                SyncStatus::Success
            } else {
                SyncStatus::Partial
            },
        };
        self.persist(&next, before, Some(&history)).await?;
        *current = next;
        Ok(summary)
    }

    pub async fn history(&self, limit: i64) -> Result<Vec<SyncHistoryEntry>> {
        Ok(db::list_history(&self.pool, limit).await?)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut Store) -> msync_engine::error::Result<T>,
    ) -> Result<T> {
        let mut current = self.store.lock().await;
        let mut next = current.clone();
        let before = next.op_count();
        let out = change(&mut next)?;
        self.persist(&next, before, None).await?;
        *current = next;
        Ok(out)
    }

    /// Write operations logged after `before`, the engine state and an
    /// optional history row in one transaction.
    async fn persist(
        &self,
        store: &Store,
        before: usize,
        history: Option<&NewSyncHistory>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let inserted = db::insert_operations(&mut *tx, store.ops_appended_after(before)).await?;
        db::save_snapshot(&mut *tx, store.export_state()).await?;
        if let Some(history) = history {
            db::insert_history(&mut *tx, history).await?;
        }
        tx.commit().await?;
        debug!(inserted, "state persisted");
        Ok(())
    }
}

async fn read_bundle(path: &Path, passphrase: &str) -> Result<DecodedBundle> {
    let data = tokio::fs::read(path).await?;
    let passphrase = passphrase.to_string();
    let decoded = tokio::task::spawn_blocking(move || decode_bundle(&data, &passphrase)).await??;
    Ok(decoded)
}

/// Write to a temporary file next to `path`, then rename it into place.
async fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("msync.tmp");
    tokio::fs::write(&tmp, data).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(DeviceError::Io(e));
    }
    Ok(())
}
