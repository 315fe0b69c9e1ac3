//! Identity of the local device.

use crate::NodeId;
use serde::{Deserialize, Serialize};

/// The device this store runs on.
///
/// Created once per install by the host and never regenerated; its id is
/// the node id of every clock value and operation this device produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalDevice {
    pub id: NodeId,
    /// Human-readable name shown in bundle manifests
    pub name: String,
    /// RFC 3339
    pub created_at: String,
}

impl LocalDevice {
    pub fn new(
        id: impl Into<NodeId>,
        name: impl Into<String>,
        created_at: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            created_at: created_at.into(),
        }
    }
}
