use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{
    helpers::{day_bounds, from_unix_ts},
    Database, StoreError,
};
use crate::models::{DeviceReading, ProcessReading, Snapshot, SnapshotMeta};

impl Database {
    /// Persist a full snapshot — header, device rows, process rows — as one
    /// transaction. Any row failure rolls the whole snapshot back. Returns
    /// the newly assigned id.
    ///
    /// Callers must not pass a snapshot that already carries an id; saving
    /// is insert-only.
    pub async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<i64> {
        let record = snapshot.clone();
        self.execute(move |conn| {
            let tx = conn.transaction().context("failed to open transaction")?;

            tx.execute(
                "INSERT INTO snapshots (ts) VALUES (?1)",
                params![record.ts.timestamp()],
            )
            .context("failed to insert snapshot header")?;
            let id = tx.last_insert_rowid();

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO device_readings (
                        snapshot_id, device_index, name, uuid,
                        util_gpu, util_mem, mem_used_mb, mem_total_mb,
                        temp_c, power_w, power_limit_w
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )?;
                for device in &record.devices {
                    stmt.execute(params![
                        id,
                        device.index,
                        device.name,
                        device.uuid,
                        device.util_gpu,
                        device.util_mem,
                        device.mem_used_mb,
                        device.mem_total_mb,
                        device.temp_c,
                        device.power_w,
                        device.power_limit_w,
                    ])
                    .context("failed to insert device reading")?;
                }
            }

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO process_readings (
                        snapshot_id, gpu_uuid, pid, process_name, used_mem_mb, owner
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for process in &record.processes {
                    stmt.execute(params![
                        id,
                        process.gpu_uuid,
                        process.pid,
                        process.process_name,
                        process.used_mem_mb,
                        process.owner,
                    ])
                    .context("failed to insert process reading")?;
                }
            }

            tx.commit().context("failed to commit snapshot")?;
            Ok(id)
        })
        .await
    }

    /// Hydrate a full snapshot by id. `StoreError::NotFound` if the header
    /// row is absent.
    pub async fn load_snapshot(&self, id: i64) -> Result<Snapshot> {
        self.execute(move |conn| hydrate_snapshot(conn, id)).await
    }

    /// Metas for all snapshots whose timestamp falls on `day` (local time),
    /// ascending. An empty day is not an error.
    pub async fn list_snapshots_by_date(&self, day: NaiveDate) -> Result<Vec<SnapshotMeta>> {
        let (start, end) = day_bounds(day);
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, ts FROM snapshots WHERE ts >= ?1 AND ts < ?2 ORDER BY ts ASC",
            )?;

            let mut rows = stmt.query(params![start, end])?;
            let mut metas = Vec::new();
            while let Some(row) = rows.next()? {
                metas.push(SnapshotMeta {
                    id: row.get(0)?,
                    ts: from_unix_ts(row.get(1)?)?,
                });
            }
            Ok(metas)
        })
        .await
    }

    /// The snapshot with the greatest timestamp, ties broken by greatest id.
    /// `StoreError::NoSnapshots` when the store is empty.
    pub async fn load_latest(&self) -> Result<Snapshot> {
        self.execute(|conn| {
            let id: i64 = conn
                .query_row(
                    "SELECT id FROM snapshots ORDER BY ts DESC, id DESC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(StoreError::NoSnapshots)?;
            hydrate_snapshot(conn, id)
        })
        .await
    }
}

fn hydrate_snapshot(conn: &Connection, id: i64) -> Result<Snapshot> {
    let ts: i64 = conn
        .query_row("SELECT ts FROM snapshots WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?
        .ok_or(StoreError::NotFound(id))?;

    let mut snapshot = Snapshot {
        id: Some(id),
        ts: from_unix_ts(ts)?,
        devices: Vec::new(),
        processes: Vec::new(),
    };

    let mut stmt = conn.prepare(
        "SELECT device_index, name, uuid, util_gpu, util_mem, mem_used_mb,
                mem_total_mb, temp_c, power_w, power_limit_w
         FROM device_readings WHERE snapshot_id = ?1",
    )?;
    let mut rows = stmt.query(params![id])?;
    while let Some(row) = rows.next()? {
        snapshot.devices.push(DeviceReading {
            index: row.get(0)?,
            name: row.get(1)?,
            uuid: row.get(2)?,
            util_gpu: row.get(3)?,
            util_mem: row.get(4)?,
            mem_used_mb: row.get(5)?,
            mem_total_mb: row.get(6)?,
            temp_c: row.get(7)?,
            power_w: row.get(8)?,
            power_limit_w: row.get(9)?,
        });
    }

    let mut stmt = conn.prepare(
        "SELECT gpu_uuid, pid, process_name, used_mem_mb, owner
         FROM process_readings WHERE snapshot_id = ?1",
    )?;
    let mut rows = stmt.query(params![id])?;
    while let Some(row) = rows.next()? {
        snapshot.processes.push(ProcessReading {
            gpu_uuid: row.get(0)?,
            pid: row.get(1)?,
            process_name: row.get(2)?,
            used_mem_mb: row.get(3)?,
            owner: row.get(4)?,
        });
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Local, TimeZone};
    use tempfile::TempDir;

    fn open_store() -> (TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(dir.path().join("gpuscope.db")).expect("open store");
        (dir, db)
    }

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn device(index: u32, uuid: &str) -> DeviceReading {
        DeviceReading {
            index,
            name: "NVIDIA A100".into(),
            uuid: uuid.into(),
            util_gpu: 42.0,
            util_mem: 12.5,
            mem_used_mb: 2048.0,
            mem_total_mb: 40960.0,
            temp_c: 55.0,
            power_w: 180.0,
            power_limit_w: 400.0,
        }
    }

    fn process(pid: u32, uuid: &str, owner: &str) -> ProcessReading {
        ProcessReading {
            pid,
            process_name: "python3".into(),
            used_mem_mb: 1024.0,
            gpu_uuid: uuid.into(),
            owner: owner.into(),
        }
    }

    fn snapshot_at(ts: DateTime<Local>) -> Snapshot {
        Snapshot {
            id: None,
            ts,
            devices: vec![device(0, "GPU-aaaa"), device(1, "GPU-bbbb")],
            processes: vec![process(10, "GPU-aaaa", "alice"), process(20, "GPU-bbbb", "bob")],
        }
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let (_dir, db) = open_store();
        let original = snapshot_at(local(2024, 3, 10, 14, 30, 0));

        let id = db.save_snapshot(&original).await.expect("save");
        let loaded = db.load_snapshot(id).await.expect("load");

        assert_eq!(loaded.id, Some(id));
        assert_eq!(loaded.ts.timestamp(), original.ts.timestamp());

        let mut loaded_devices = loaded.devices.clone();
        loaded_devices.sort_by_key(|d| d.index);
        assert_eq!(loaded_devices, original.devices);

        let mut loaded_processes = loaded.processes.clone();
        loaded_processes.sort_by_key(|p| p.pid);
        assert_eq!(loaded_processes, original.processes);
    }

    #[tokio::test]
    async fn load_missing_snapshot_is_not_found() {
        let (_dir, db) = open_store();
        let err = db.load_snapshot(12345).await.expect_err("missing id");
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::NotFound(12345)) => {}
            other => panic!("expected NotFound(12345), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_by_date_respects_the_local_day_window() {
        let (_dir, db) = open_store();

        let inside = db
            .save_snapshot(&snapshot_at(local(2024, 1, 1, 23, 59, 59)))
            .await
            .unwrap();
        let _outside = db
            .save_snapshot(&snapshot_at(local(2024, 1, 2, 0, 0, 1)))
            .await
            .unwrap();

        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let metas = db.list_snapshots_by_date(day).await.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].id, inside);
    }

    #[tokio::test]
    async fn list_by_date_is_sorted_ascending() {
        let (_dir, db) = open_store();

        let later = db
            .save_snapshot(&snapshot_at(local(2024, 1, 1, 18, 0, 0)))
            .await
            .unwrap();
        let earlier = db
            .save_snapshot(&snapshot_at(local(2024, 1, 1, 9, 0, 0)))
            .await
            .unwrap();

        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let metas = db.list_snapshots_by_date(day).await.unwrap();
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0].id, earlier);
        assert_eq!(metas[1].id, later);
    }

    #[tokio::test]
    async fn list_by_empty_date_is_empty_not_an_error() {
        let (_dir, db) = open_store();
        let day = NaiveDate::from_ymd_opt(2030, 7, 4).unwrap();
        assert!(db.list_snapshots_by_date(day).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn latest_on_empty_store_is_no_snapshots() {
        let (_dir, db) = open_store();
        let err = db.load_latest().await.expect_err("empty store");
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::NoSnapshots) => {}
            other => panic!("expected NoSnapshots, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn latest_returns_the_greatest_timestamp() {
        let (_dir, db) = open_store();

        db.save_snapshot(&snapshot_at(local(2024, 5, 1, 8, 0, 0)))
            .await
            .unwrap();
        let newest = db
            .save_snapshot(&snapshot_at(local(2024, 5, 1, 9, 0, 0)))
            .await
            .unwrap();

        let latest = db.load_latest().await.unwrap();
        assert_eq!(latest.id, Some(newest));
    }

    #[tokio::test]
    async fn latest_breaks_timestamp_ties_by_greatest_id() {
        let (_dir, db) = open_store();
        let ts = local(2024, 5, 1, 12, 0, 0);

        db.save_snapshot(&snapshot_at(ts)).await.unwrap();
        let second = db.save_snapshot(&snapshot_at(ts)).await.unwrap();

        let latest = db.load_latest().await.unwrap();
        assert_eq!(latest.id, Some(second));
    }

    #[tokio::test]
    async fn failed_child_row_rolls_back_the_whole_snapshot() {
        let (_dir, db) = open_store();

        // Inject a failure on the second device row.
        db.execute(|conn| {
            conn.execute(
                "CREATE UNIQUE INDEX idx_inject_dup ON device_readings(uuid)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let mut snapshot = snapshot_at(local(2024, 2, 2, 2, 2, 2));
        snapshot.devices = vec![device(0, "GPU-dup"), device(1, "GPU-dup")];

        db.save_snapshot(&snapshot).await.expect_err("duplicate uuid");

        // No partial write may be visible: the header must be gone too.
        let err = db.load_latest().await.expect_err("store must stay empty");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::NoSnapshots)
        ));
    }

    #[tokio::test]
    async fn orphan_child_rows_are_rejected() {
        let (_dir, db) = open_store();
        let result = db
            .execute(|conn| {
                conn.execute(
                    "INSERT INTO device_readings (snapshot_id, device_index, name, uuid)
                     VALUES (999, 0, 'ghost', 'GPU-ghost')",
                    [],
                )?;
                Ok(())
            })
            .await;
        assert!(result.is_err(), "foreign keys must reject orphan children");
    }

    #[tokio::test]
    async fn reopening_the_store_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gpuscope.db");

        let first = Database::new(path.clone()).unwrap();
        let id = first
            .save_snapshot(&snapshot_at(local(2024, 4, 4, 4, 4, 4)))
            .await
            .unwrap();
        drop(first);

        let second = Database::new(path).unwrap();
        let loaded = second.load_snapshot(id).await.unwrap();
        assert_eq!(loaded.devices.len(), 2);
    }
}
