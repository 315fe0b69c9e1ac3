//! # msync engine
//!
//! An offline-first sync core for a single-user bookkeeping application
//! running on several devices, exchanged through encrypted `.msync` files.
//!
//! This crate holds the pure sync logic: clocks, the operation log, merge
//! rules, conflicts and the bundle format. It has no knowledge of databases,
//! files or the network; the host persists [`StoreSnapshot`]s and moves bundle
//! bytes around.
//!
//! ## Core Concepts
//!
//! ### Hybrid Logical Clock
//!
//! Every change is stamped with an [`Hlc`]: wall-clock milliseconds, a
//! counter and the device id. Clock values are totally ordered and their
//! string form sorts the same way. The [`HybridClock`] of a store issues
//! them with `tick()` and folds in remote values with `receive()`.
//!
//! ### Operations
//!
//! Business mutations go through the capture methods of [`Store`]
//! (`capture_create`, `capture_update`, ...). Each appends immutable
//! [`Operation`]s to the log; updates are recorded per field.
//!
//! ### Merge
//!
//! Remote operations are merged with [`Store::apply_ops`]:
//! - Plain fields: last writer wins on the per-field clock value
//! - Money fields of transactions: versioned; divergent edits become
//!   [`ConflictType::MoneyVersion`] conflicts instead of being overwritten
//! - Deletes are absorbing
//! - Malformed operations are skipped and reported, never fatal
//!
//! ### Bundles
//!
//! [`Store::create_bundle`] and [`Store::import_bundle`] move operations
//! between devices as passphrase-encrypted files. Importing is idempotent.
//!
//! ## Quick Start
//!
//! ```rust
//! use msync_engine::{EntityType, ExportOptions, LocalDevice, Store, SystemTime};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let device = |id: &str| LocalDevice::new(id, id, "2024-01-01T00:00:00.000Z");
//! let mut laptop = Store::new(device("laptop"), Arc::new(SystemTime));
//! let mut phone = Store::new(device("phone"), Arc::new(SystemTime));
//!
//! // 1. Capture local changes
//! laptop.capture_create(EntityType::Client, "client-1", json!({"name": "Acme"}))?;
//! laptop.capture_update(EntityType::Client, "client-1", json!({"email": "hi@acme.test"}))?;
//! assert_eq!(laptop.pending_ops_count(), 2);
//!
//! // 2. Export (sealing with a passphrase is `create_bundle`)
//! let bundle = laptop.prepare_export(&ExportOptions::default())?;
//! laptop.mark_exported(&bundle);
//!
//! // 3. Merge on the other device
//! let report = phone.apply_ops(bundle.ops);
//! assert_eq!(report.applied, 2);
//! let client = phone.get(&EntityType::Client, "client-1").unwrap();
//! assert_eq!(client.field("email"), "hi@acme.test");
//! # Ok::<(), msync_engine::Error>(())
//! ```
//!
//! ## Persistence
//!
//! Use [`Store::export_state`] and [`Store::import_state`] with [`StoreSnapshot`]
//! for persistence. Snapshots are serializable to JSON with deterministic ordering.

pub mod bundle;
pub mod capture;
pub mod conflict;
pub mod crypto;
pub mod device;
pub mod entity;
pub mod error;
pub mod hlc;
pub mod merge;
pub mod money;
pub mod operation;
pub mod oplog;
pub mod passphrase;
pub mod record;
pub mod resolve;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use bundle::{
    decode_bundle, is_msync_file, parse_bundle, seal_bundle, suggested_filename, BundleManifest,
    BundlePreview, DecodedBundle, ExportOptions, ExportScope, ExportedBundle, ImportSummary,
    MsyncBundle, BUNDLE_VERSION,
};
pub use conflict::{
    Candidate, Conflict, ConflictId, ConflictResolution, ConflictStatus, ConflictSummary,
    ConflictType,
};
pub use device::LocalDevice;
pub use entity::{EntityType, FieldDef, FieldKind, FieldType, MoneyField};
pub use error::Error;
pub use hlc::{Hlc, HybridClock, ManualTime, SystemTime, TimeSource};
pub use merge::{ApplyOutcome, MergeReport, MoneyPolicy, SkipReason, SkippedOp};
pub use money::{MoneyChain, MoneyEventVersion, MoneySnapshot};
pub use operation::{MoneyChange, OpType, Operation, OperationId};
pub use passphrase::{check_passphrase, generate_passphrase, PassphraseCheck, Strength};
pub use record::{Metadata, Origin, Record};
pub use resolve::Resolution;
pub use snapshot::{StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{Collection, FieldMeta, QueryBuilder, Store};

/// Type aliases for clarity
pub type EntityId = String;
pub type NodeId = String;
pub type Version = u64;
/// Milliseconds since the Unix epoch
pub type Timestamp = i64;
