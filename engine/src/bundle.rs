//! `.msync` bundle files.
//!
//! A bundle carries operations from one device to others. The cleartext is
//! `{"manifest": {...}, "ops": [...]}`; the manifest's content hash covers
//! the exact bytes of the `ops` array, so a decoder can check it without
//! re-serializing anything. The whole document is sealed with
//! [`crate::crypto`].
//!
//! Export and import are split so hosts can run the key derivation off
//! their async executor:
//!
//! ```text
//! export: Store::prepare_export -> seal_bundle -> Store::mark_exported
//! import: decode_bundle -> Store::import_decoded
//! ```

use crate::{
    crypto,
    error::Result,
    merge::{SkipReason, SkippedOp},
    record::iso_timestamp,
    ConflictId, Error, Hlc, NodeId, Operation, Store,
};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{info, warn};

pub const BUNDLE_VERSION: u32 = 1;

/// File extension of bundle files, without the dot.
pub const BUNDLE_EXTENSION: &str = "msync";

/// Cleartext description of a bundle's contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    /// Derived from the creating device, creation time and content hash
    pub id: String,
    pub bundle_version: u32,
    /// RFC 3339
    pub created_at: String,
    pub created_by_device_id: NodeId,
    pub created_by_name: String,
    pub op_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_cursor: Option<Hlc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until_cursor: Option<Hlc>,
    /// `"sha256:<hex>"` over the serialized `ops` array
    pub content_hash: String,
}

/// An unsealed bundle ready to be encrypted.
#[derive(Debug, Clone, PartialEq)]
pub struct MsyncBundle {
    pub manifest: BundleManifest,
    pub ops: Vec<Operation>,
}

#[derive(Serialize)]
struct WireOut<'a> {
    manifest: &'a BundleManifest,
    ops: &'a RawValue,
}

#[derive(Deserialize)]
struct WireIn<'a> {
    manifest: BundleManifest,
    #[serde(borrow)]
    ops: &'a RawValue,
}

impl MsyncBundle {
    /// The cleartext JSON document.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let ops = serde_json::to_string(&self.ops).map_err(encode_error)?;
        let ops = RawValue::from_string(ops).map_err(encode_error)?;
        serde_json::to_vec(&WireOut {
            manifest: &self.manifest,
            ops: &ops,
        })
        .map_err(encode_error)
    }
}

fn encode_error(e: serde_json::Error) -> Error {
    Error::Encryption(format!("failed to encode bundle: {e}"))
}

/// Which operations an export selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExportScope {
    /// Operations captured on this device
    #[default]
    Local,
    /// Every logged operation, including ones received from peers
    All,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// Only operations after this clock value. Defaults to the export cursor
    /// for [`ExportScope::Local`] and to the beginning for [`ExportScope::All`].
    pub since: Option<Hlc>,
    pub scope: ExportScope,
}

impl ExportOptions {
    /// Everything this device has ever logged.
    pub fn full_backup() -> Self {
        Self {
            since: Some(Hlc::zero()),
            scope: ExportScope::All,
        }
    }
}

/// A sealed bundle and how to name it.
#[derive(Debug, Clone)]
pub struct ExportedBundle {
    pub manifest: BundleManifest,
    pub data: Vec<u8>,
    pub filename: String,
}

/// A decrypted and verified bundle.
#[derive(Debug, Clone)]
pub struct DecodedBundle {
    pub manifest: BundleManifest,
    pub ops: Vec<Operation>,
    /// Entries of the `ops` array that are not valid operations
    pub undecodable: Vec<SkippedOp>,
}

impl DecodedBundle {
    /// Number of entries in the `ops` array.
    pub fn entry_count(&self) -> usize {
        self.ops.len() + self.undecodable.len()
    }
}

/// What importing a bundle would do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundlePreview {
    pub manifest: BundleManifest,
    /// Operations not yet in the local log
    pub new_ops_count: usize,
    pub undecodable_count: usize,
    pub already_imported: bool,
}

/// Result of importing a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub bundle_id: String,
    pub applied: usize,
    pub skipped: usize,
    pub superseded: usize,
    pub conflicts: usize,
    pub conflict_ids: Vec<ConflictId>,
    pub malformed: Vec<SkippedOp>,
    pub already_imported: bool,
}

impl Store {
    /// Select operations and build an unsealed bundle. Does not mutate.
    pub fn prepare_export(&self, options: &ExportOptions) -> Result<MsyncBundle> {
        let since = match (&options.since, options.scope) {
            (Some(since), _) => since.clone(),
            (None, ExportScope::Local) => self.export_cursor.clone(),
            (None, ExportScope::All) => Hlc::zero(),
        };
        let ops: Vec<Operation> = match options.scope {
            ExportScope::Local => self.get_local_ops_since(&since),
            ExportScope::All => self.get_ops_since(&since),
        }
        .into_iter()
        .cloned()
        .collect();

        let Some(last) = ops.last() else {
            return Err(Error::NothingToExport);
        };
        let until = last.hlc.clone();

        let ops_json = serde_json::to_vec(&ops).map_err(encode_error)?;
        let content_hash = content_hash(&ops_json);
        let created_at = iso_timestamp(self.now());

        let manifest = BundleManifest {
            id: bundle_id(&self.device.id, &created_at, &content_hash),
            bundle_version: BUNDLE_VERSION,
            created_at,
            created_by_device_id: self.device.id.clone(),
            created_by_name: self.device.name.clone(),
            op_count: ops.len(),
            since_cursor: (!since.is_zero()).then_some(since),
            until_cursor: Some(until),
            content_hash,
        };
        Ok(MsyncBundle { manifest, ops })
    }

    /// Advance the export cursor past the local operations of a bundle.
    pub fn mark_exported(&mut self, bundle: &MsyncBundle) {
        let newest_local = bundle
            .ops
            .iter()
            .filter(|op| op.device_id == self.device.id)
            .map(|op| &op.hlc)
            .max();
        if let Some(hlc) = newest_local {
            if *hlc > self.export_cursor {
                self.export_cursor = hlc.clone();
            }
        }
    }

    /// Export operations as an encrypted bundle and advance the cursor.
    pub fn create_bundle(
        &mut self,
        passphrase: &str,
        options: &ExportOptions,
    ) -> Result<ExportedBundle> {
        let bundle = self.prepare_export(options)?;
        let data = seal_bundle(&bundle, passphrase)?;
        self.mark_exported(&bundle);
        info!(
            bundle_id = %bundle.manifest.id,
            op_count = bundle.manifest.op_count,
            "bundle created"
        );
        Ok(ExportedBundle {
            filename: suggested_filename(&bundle.manifest),
            manifest: bundle.manifest,
            data,
        })
    }

    /// Decrypt a bundle and report what importing it would do.
    pub fn preview_bundle(&self, data: &[u8], passphrase: &str) -> Result<BundlePreview> {
        let decoded = decode_bundle(data, passphrase)?;
        Ok(self.preview_decoded(&decoded))
    }

    pub fn preview_decoded(&self, decoded: &DecodedBundle) -> BundlePreview {
        let new_ops_count = distinct_new_ops(self, &decoded.ops);
        BundlePreview {
            manifest: decoded.manifest.clone(),
            new_ops_count,
            undecodable_count: decoded.undecodable.len(),
            already_imported: self.is_bundle_imported(&decoded.manifest.id)
                || new_ops_count == 0,
        }
    }

    /// Decrypt, verify and merge a bundle.
    ///
    /// Decoding failures abort before anything is touched. Importing the
    /// same bundle again is a no-op.
    pub fn import_bundle(&mut self, data: &[u8], passphrase: &str) -> Result<ImportSummary> {
        let decoded = decode_bundle(data, passphrase)?;
        Ok(self.import_decoded(decoded))
    }

    pub fn import_decoded(&mut self, decoded: DecodedBundle) -> ImportSummary {
        let bundle_id = decoded.manifest.id.clone();
        if self.is_bundle_imported(&bundle_id) {
            info!(%bundle_id, "bundle already imported");
            return ImportSummary {
                bundle_id,
                applied: 0,
                skipped: decoded.entry_count(),
                superseded: 0,
                conflicts: 0,
                conflict_ids: Vec::new(),
                malformed: Vec::new(),
                already_imported: true,
            };
        }

        let mut report = self.apply_ops(decoded.ops);
        for skipped in decoded.undecodable {
            report.record_undecodable(skipped);
        }
        self.imported_bundles.insert(bundle_id.clone());

        if !report.malformed.is_empty() {
            warn!(%bundle_id, count = report.malformed.len(), "bundle contained malformed operations");
        }
        info!(
            %bundle_id,
            from = %decoded.manifest.created_by_device_id,
            applied = report.applied,
            skipped = report.skipped,
            conflicts = report.conflicts,
            "bundle imported"
        );
        ImportSummary {
            bundle_id,
            applied: report.applied,
            skipped: report.skipped,
            superseded: report.superseded,
            conflicts: report.conflicts,
            conflict_ids: report.conflict_ids,
            malformed: report.malformed,
            already_imported: false,
        }
    }
}

fn distinct_new_ops(store: &Store, ops: &[Operation]) -> usize {
    let mut seen = HashSet::new();
    ops.iter()
        .filter(|op| !store.log.contains(&op.id) && seen.insert(op.id.as_str()))
        .count()
}

/// Encrypt an unsealed bundle.
pub fn seal_bundle(bundle: &MsyncBundle, passphrase: &str) -> Result<Vec<u8>> {
    crypto::seal(&bundle.to_json()?, passphrase)
}

/// Decrypt and verify a bundle file.
pub fn decode_bundle(data: &[u8], passphrase: &str) -> Result<DecodedBundle> {
    let plaintext = crypto::open(data, passphrase)?;
    parse_bundle(&plaintext)
}

/// Verify and decode the cleartext JSON document of a bundle.
///
/// Entries of the `ops` array that do not decode as operations are kept as
/// skips instead of failing the whole bundle.
pub fn parse_bundle(json: &[u8]) -> Result<DecodedBundle> {
    let wire: WireIn<'_> = serde_json::from_slice(json)
        .map_err(|e| Error::InvalidBundle(format!("malformed bundle document: {e}")))?;
    let manifest = wire.manifest;

    if manifest.bundle_version != BUNDLE_VERSION {
        return Err(Error::InvalidBundle(format!(
            "unsupported bundle version {}",
            manifest.bundle_version
        )));
    }
    if content_hash(wire.ops.get().as_bytes()) != manifest.content_hash {
        return Err(Error::InvalidBundle("content hash mismatch".into()));
    }

    let entries: Vec<&RawValue> = serde_json::from_str(wire.ops.get())
        .map_err(|e| Error::InvalidBundle(format!("ops must be an array: {e}")))?;
    if entries.len() != manifest.op_count {
        return Err(Error::InvalidBundle(format!(
            "manifest declares {} operations, bundle has {}",
            manifest.op_count,
            entries.len()
        )));
    }

    let mut ops = Vec::with_capacity(entries.len());
    let mut undecodable = Vec::new();
    for entry in entries {
        match serde_json::from_str::<Operation>(entry.get()) {
            Ok(op) => ops.push(op),
            Err(e) => undecodable.push(SkippedOp {
                op_id: entry_id(entry),
                reason: SkipReason::Undecodable(e.to_string()),
            }),
        }
    }

    Ok(DecodedBundle {
        manifest,
        ops,
        undecodable,
    })
}

fn entry_id(entry: &RawValue) -> Option<String> {
    #[derive(Deserialize)]
    struct IdOnly {
        id: Option<String>,
    }
    serde_json::from_str::<IdOnly>(entry.get())
        .ok()
        .and_then(|e| e.id)
}

/// `"sha256:<hex>"` of some bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

fn bundle_id(device_id: &str, created_at: &str, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(device_id.as_bytes());
    hasher.update(b"|");
    hasher.update(created_at.as_bytes());
    hasher.update(b"|");
    hasher.update(content_hash.as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(32);
    id
}

/// A file name for a bundle: `msync_<device name>_<YYYYMMDD>_<HHMMSS>.msync`.
pub fn suggested_filename(manifest: &BundleManifest) -> String {
    let name: String = manifest
        .created_by_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let stamp = chrono::DateTime::parse_from_rfc3339(&manifest.created_at)
        .map(|t| t.format("%Y%m%d_%H%M%S").to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("msync_{name}_{stamp}.{BUNDLE_EXTENSION}")
}

/// Whether a file name looks like a bundle.
pub fn is_msync_file(name: &str) -> bool {
    std::path::Path::new(name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(BUNDLE_EXTENSION))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hlc::ManualTime, EntityType, LocalDevice};
    use serde_json::json;
    use std::sync::Arc;

    fn device(id: &str, name: &str) -> (Store, ManualTime) {
        let time = ManualTime::new(1_700_000_000_000);
        let store = Store::new(
            LocalDevice::new(id, name, "2024-01-01T00:00:00.000Z"),
            Arc::new(time.clone()),
        );
        (store, time)
    }

    fn decoded(bundle: &MsyncBundle) -> DecodedBundle {
        parse_bundle(&bundle.to_json().unwrap()).unwrap()
    }

    fn laptop_with_clients() -> Store {
        let (mut a, time) = device("dev-a", "Work Laptop");
        a.capture_create(EntityType::Client, "c-1", json!({"name": "Acme"}))
            .unwrap();
        time.advance(1);
        a.capture_create(EntityType::Client, "c-2", json!({"name": "Globex"}))
            .unwrap();
        a
    }

    #[test]
    fn manifest_describes_selection() {
        let a = laptop_with_clients();
        let bundle = a.prepare_export(&ExportOptions::default()).unwrap();
        let m = &bundle.manifest;

        assert_eq!(m.bundle_version, BUNDLE_VERSION);
        assert_eq!(m.op_count, 2);
        assert_eq!(m.created_by_device_id, "dev-a");
        assert_eq!(m.created_by_name, "Work Laptop");
        assert_eq!(m.created_at, "2023-11-14T22:13:20.001Z");
        assert_eq!(m.since_cursor, None);
        assert_eq!(m.until_cursor.as_ref(), Some(&bundle.ops[1].hlc));
        assert!(m.content_hash.starts_with("sha256:"));
        assert_eq!(m.id.len(), 32);
        // Preparing does not move the cursor
        assert_eq!(a.pending_ops_count(), 2);
    }

    #[test]
    fn export_cursor_limits_next_export() {
        let mut a = laptop_with_clients();
        let bundle = a.prepare_export(&ExportOptions::default()).unwrap();
        a.mark_exported(&bundle);
        assert_eq!(a.pending_ops_count(), 0);
        assert_eq!(
            a.prepare_export(&ExportOptions::default()),
            Err(Error::NothingToExport)
        );

        a.capture_update(EntityType::Client, "c-1", json!({"notes": "vip"}))
            .unwrap();
        let next = a.prepare_export(&ExportOptions::default()).unwrap();
        assert_eq!(next.manifest.op_count, 1);
        assert_eq!(next.manifest.since_cursor.as_ref(), Some(a.export_cursor()));
    }

    #[test]
    fn scope_all_relays_peer_operations() {
        let a = laptop_with_clients();
        let (mut b, _) = device("dev-b", "Phone");
        b.import_decoded(decoded(&a.prepare_export(&ExportOptions::default()).unwrap()));

        assert_eq!(
            b.prepare_export(&ExportOptions::default()),
            Err(Error::NothingToExport)
        );
        let relay = b
            .prepare_export(&ExportOptions {
                since: None,
                scope: ExportScope::All,
            })
            .unwrap();
        assert_eq!(relay.manifest.op_count, 2);
        assert_eq!(relay.manifest.created_by_device_id, "dev-b");
    }

    #[test]
    fn import_applies_and_is_idempotent() {
        let a = laptop_with_clients();
        let (mut b, _) = device("dev-b", "Phone");
        let bundle = decoded(&a.prepare_export(&ExportOptions::default()).unwrap());

        let preview = b.preview_decoded(&bundle);
        assert_eq!(preview.new_ops_count, 2);
        assert!(!preview.already_imported);

        let first = b.import_decoded(bundle.clone());
        assert_eq!(first.applied, 2);
        assert_eq!(first.skipped, 0);
        assert!(!first.already_imported);
        assert!(b.get(&EntityType::Client, "c-2").is_some());

        assert!(b.preview_decoded(&bundle).already_imported);
        let second = b.import_decoded(bundle);
        assert_eq!(second.applied, 0);
        assert_eq!(second.skipped, 2);
        assert!(second.already_imported);
        assert_eq!(b.op_count(), 2);
    }

    #[test]
    fn tampered_content_is_rejected() {
        let a = laptop_with_clients();
        let json = a
            .prepare_export(&ExportOptions::default())
            .unwrap()
            .to_json()
            .unwrap();
        let text = String::from_utf8(json).unwrap().replace("Globex", "Globez");
        assert_eq!(
            parse_bundle(text.as_bytes()).unwrap_err(),
            Error::InvalidBundle("content hash mismatch".into())
        );
        assert!(matches!(
            parse_bundle(b"{\"manifest\": 1}"),
            Err(Error::InvalidBundle(_))
        ));
    }

    #[test]
    fn undecodable_entries_are_skipped_not_fatal() {
        let a = laptop_with_clients();
        let mut bundle = a.prepare_export(&ExportOptions::default()).unwrap();
        let mut ops: Vec<serde_json::Value> = bundle
            .ops
            .iter()
            .map(|op| serde_json::to_value(op).unwrap())
            .collect();
        ops[0]["hlc"] = json!("not-a-clock");
        let ops_json = serde_json::to_string(&ops).unwrap();
        bundle.manifest.content_hash = content_hash(ops_json.as_bytes());
        let doc = format!(
            "{{\"manifest\":{},\"ops\":{}}}",
            serde_json::to_string(&bundle.manifest).unwrap(),
            ops_json
        );

        let decoded = parse_bundle(doc.as_bytes()).unwrap();
        assert_eq!(decoded.ops.len(), 1);
        assert_eq!(decoded.undecodable.len(), 1);
        assert_eq!(decoded.undecodable[0].op_id.as_ref(), Some(&bundle.ops[0].id));

        let (mut b, _) = device("dev-b", "Phone");
        let summary = b.import_decoded(decoded);
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.skipped, 1);
        assert!(matches!(
            summary.malformed[0].reason,
            SkipReason::Undecodable(_)
        ));
    }

    #[test]
    fn sealed_roundtrip() {
        let mut a = laptop_with_clients();
        let exported = a
            .create_bundle("river-stone-lamp", &ExportOptions::default())
            .unwrap();
        assert_eq!(a.pending_ops_count(), 0);
        assert_eq!(
            exported.filename,
            "msync_Work-Laptop_20231114_221320.msync"
        );

        let (mut b, _) = device("dev-b", "Phone");
        assert_eq!(
            b.import_bundle(&exported.data, "wrong").unwrap_err(),
            Error::IncorrectPassphrase
        );
        assert_eq!(b.op_count(), 0);

        let summary = b.import_bundle(&exported.data, "river-stone-lamp").unwrap();
        assert_eq!(summary.bundle_id, exported.manifest.id);
        assert_eq!(summary.applied, 2);
    }

    #[test]
    fn file_names() {
        assert!(is_msync_file("msync_x_20240101_000000.msync"));
        assert!(is_msync_file("BACKUP.MSYNC"));
        assert!(!is_msync_file("notes.txt"));
        assert!(!is_msync_file("msync"));
    }
}
