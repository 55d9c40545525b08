//! Telemetry data model.
//!
//! A `Snapshot` is one timestamped capture of every GPU device and every
//! compute process the backend reported. Snapshots start out unpersisted
//! (`id: None`) and become immutable once the store assigns an id.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// One physical device's instantaneous state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReading {
    pub index: u32,
    pub name: String,
    /// Globally-unique hardware identifier reported by the backend.
    pub uuid: String,
    /// Compute utilization, percent in [0, 100].
    pub util_gpu: f64,
    /// Memory utilization, percent in [0, 100].
    pub util_mem: f64,
    pub mem_used_mb: f64,
    pub mem_total_mb: f64,
    pub temp_c: f64,
    pub power_w: f64,
    pub power_limit_w: f64,
}

/// One compute process's usage of one device.
///
/// `gpu_uuid` references a `DeviceReading::uuid` within the same snapshot.
/// It may dangle if the device disappeared between the two backend queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessReading {
    pub pid: u32,
    pub process_name: String,
    pub used_mem_mb: f64,
    pub gpu_uuid: String,
    /// Resolved account name, `"?"` when the pid's uid could not be read,
    /// or `"uid:<n>"` when the uid has no account entry.
    pub owner: String,
}

/// A point-in-time capture of all device and process telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Store-assigned identifier; `None` until the snapshot is first saved.
    pub id: Option<i64>,
    pub ts: DateTime<Local>,
    pub devices: Vec<DeviceReading>,
    pub processes: Vec<ProcessReading>,
}

/// Lightweight (id, timestamp) projection of a persisted snapshot, used for
/// day-range navigation without hydrating full device/process detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: i64,
    pub ts: DateTime<Local>,
}

/// Display aggregation: total GPU memory charged to one account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserUsage {
    pub owner: String,
    pub mem_used_mb: f64,
}
