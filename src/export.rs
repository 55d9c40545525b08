//! One-shot export surfaces and display aggregation.
//!
//! These consume a `Snapshot` read-only; they never touch the store or the
//! session state.

use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::models::{Snapshot, UserUsage};

pub fn to_json(snapshot: &Snapshot) -> Result<String> {
    serde_json::to_string_pretty(snapshot).context("failed to serialize snapshot")
}

/// Flat CSV rendering: one row per (device, owning process), plus one row per
/// device with no processes, process columns left empty.
pub fn to_csv(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    out.push_str(
        "Timestamp,GPU Index,GPU Name,GPU Util %,Mem Util %,Mem Used MB,Mem Total MB,Temp C,Power W,PID,Process,User,Proc Mem MB\n",
    );

    let ts = snapshot.ts.to_rfc3339();
    for device in &snapshot.devices {
        let owning: Vec<_> = snapshot
            .processes
            .iter()
            .filter(|p| p.gpu_uuid == device.uuid)
            .collect();

        if owning.is_empty() {
            out.push_str(&format!(
                "{},{},{},{:.1},{:.1},{:.1},{:.1},{:.1},{:.1},,,,\n",
                ts,
                device.index,
                csv_field(&device.name),
                device.util_gpu,
                device.util_mem,
                device.mem_used_mb,
                device.mem_total_mb,
                device.temp_c,
                device.power_w,
            ));
            continue;
        }

        for process in owning {
            out.push_str(&format!(
                "{},{},{},{:.1},{:.1},{:.1},{:.1},{:.1},{:.1},{},{},{},{:.1}\n",
                ts,
                device.index,
                csv_field(&device.name),
                device.util_gpu,
                device.util_mem,
                device.mem_used_mb,
                device.mem_total_mb,
                device.temp_c,
                device.power_w,
                process.pid,
                csv_field(&process.process_name),
                csv_field(&process.owner),
                process.used_mem_mb,
            ));
        }
    }
    out
}

fn csv_field(raw: &str) -> String {
    if raw.contains(',') || raw.contains('"') || raw.contains('\n') {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

/// Total GPU memory per resolved owner, largest first (ties by name).
pub fn aggregate_by_user(snapshot: &Snapshot) -> Vec<UserUsage> {
    let mut totals: HashMap<&str, f64> = HashMap::new();
    for process in &snapshot.processes {
        *totals.entry(process.owner.as_str()).or_default() += process.used_mem_mb;
    }

    let mut usage: Vec<UserUsage> = totals
        .into_iter()
        .map(|(owner, mem_used_mb)| UserUsage {
            owner: owner.to_string(),
            mem_used_mb,
        })
        .collect();
    usage.sort_by(|a, b| {
        b.mem_used_mb
            .partial_cmp(&a.mem_used_mb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.owner.cmp(&b.owner))
    });
    usage
}

/// Threshold violations worth surfacing, one message per violation.
pub fn threshold_alerts(snapshot: &Snapshot, max_temp_c: f64, max_mem_pct: f64) -> Vec<String> {
    let mut alerts = Vec::new();
    for device in &snapshot.devices {
        if device.temp_c > max_temp_c {
            alerts.push(format!(
                "GPU {} ({}) temperature {:.1}°C exceeds threshold {:.1}°C",
                device.index, device.name, device.temp_c, max_temp_c
            ));
        }
        if device.util_mem > max_mem_pct {
            alerts.push(format!(
                "GPU {} ({}) memory utilization {:.1}% exceeds threshold {:.1}%",
                device.index, device.name, device.util_mem, max_mem_pct
            ));
        }
    }
    alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceReading, ProcessReading};
    use chrono::{Local, TimeZone};

    fn snapshot() -> Snapshot {
        Snapshot {
            id: Some(3),
            ts: Local.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            devices: vec![
                DeviceReading {
                    index: 0,
                    name: "NVIDIA A100".into(),
                    uuid: "GPU-aaaa".into(),
                    util_gpu: 80.0,
                    util_mem: 50.0,
                    mem_used_mb: 20480.0,
                    mem_total_mb: 40960.0,
                    temp_c: 70.0,
                    power_w: 300.0,
                    power_limit_w: 400.0,
                },
                DeviceReading {
                    index: 1,
                    name: "NVIDIA A100".into(),
                    uuid: "GPU-bbbb".into(),
                    util_gpu: 0.0,
                    util_mem: 0.0,
                    mem_used_mb: 0.0,
                    mem_total_mb: 40960.0,
                    temp_c: 30.0,
                    power_w: 50.0,
                    power_limit_w: 400.0,
                },
            ],
            processes: vec![
                ProcessReading {
                    pid: 10,
                    process_name: "python3".into(),
                    used_mem_mb: 512.0,
                    gpu_uuid: "GPU-aaaa".into(),
                    owner: "alice".into(),
                },
                ProcessReading {
                    pid: 20,
                    process_name: "train".into(),
                    used_mem_mb: 2048.0,
                    gpu_uuid: "GPU-aaaa".into(),
                    owner: "bob".into(),
                },
            ],
        }
    }

    #[test]
    fn json_export_carries_the_full_snapshot() {
        let json = to_json(&snapshot()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["id"], 3);
        assert_eq!(value["devices"].as_array().unwrap().len(), 2);
        assert_eq!(value["processes"][0]["owner"], "alice");
    }

    #[test]
    fn csv_export_emits_one_row_per_device_process_pair() {
        let csv = to_csv(&snapshot());
        let lines: Vec<&str> = csv.lines().collect();
        // Header + 2 rows for GPU 0 + 1 empty-process row for GPU 1.
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("Timestamp,"));
        assert!(lines[1].contains(",10,python3,alice,512.0"));
        assert!(lines[3].ends_with(",,,,"));
    }

    #[test]
    fn csv_quotes_fields_with_commas() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn user_aggregation_sums_and_sorts_by_memory() {
        let usage = aggregate_by_user(&snapshot());
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].owner, "bob");
        assert_eq!(usage[0].mem_used_mb, 2048.0);
        assert_eq!(usage[1].owner, "alice");
        assert_eq!(usage[1].mem_used_mb, 512.0);
    }

    #[test]
    fn alerts_fire_only_above_thresholds() {
        let snap = snapshot();
        assert!(threshold_alerts(&snap, 90.0, 95.0).is_empty());

        let alerts = threshold_alerts(&snap, 60.0, 40.0);
        assert_eq!(alerts.len(), 2);
        assert!(alerts[0].contains("temperature"));
        assert!(alerts[1].contains("memory utilization"));
    }
}
