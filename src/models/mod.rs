pub mod snapshot;

pub use snapshot::{DeviceReading, ProcessReading, Snapshot, SnapshotMeta, UserUsage};
