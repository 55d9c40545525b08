//! Telemetry acquisition via the `nvidia-smi` backend.
//!
//! `sample()` is synchronous; async callers run it through
//! `tokio::task::spawn_blocking`. Each call is independent — no state is
//! cached between samples.

mod owners;

pub use owners::UNKNOWN_OWNER;

use std::process::{Command, Stdio};

use chrono::Local;
use log::debug;

use crate::models::{DeviceReading, ProcessReading, Snapshot};

const NVIDIA_SMI: &str = "nvidia-smi";

/// Fields requested from the device query, in order.
const DEVICE_QUERY: &str = "--query-gpu=index,name,uuid,utilization.gpu,utilization.memory,memory.used,memory.total,temperature.gpu,power.draw,power.limit";
const DEVICE_FIELDS: usize = 10;

const PROCESS_QUERY: &str = "--query-compute-apps=pid,process_name,used_memory,gpu_uuid";
const PROCESS_FIELDS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("nvidia-smi not found or not working")]
    BackendUnavailable,
    #[error("device query failed: {0}")]
    DeviceQuery(String),
}

/// Capture one snapshot of all devices and compute processes.
///
/// The process query is allowed to fail (no compute apps, transient backend
/// hiccup); the snapshot is still returned with an empty process set. Only a
/// missing backend or a failed device query is fatal.
pub fn sample() -> Result<Snapshot, AcquireError> {
    check_backend()?;

    let devices = query_devices()?;
    let mut processes = query_processes().unwrap_or_else(|err| {
        debug!("process query returned nothing: {err}");
        Vec::new()
    });
    owners::resolve_owners(&mut processes);

    Ok(Snapshot {
        id: None,
        ts: Local::now(),
        devices,
        processes,
    })
}

/// Presence check: `nvidia-smi -L` must exist and exit zero.
fn check_backend() -> Result<(), AcquireError> {
    let status = Command::new(NVIDIA_SMI)
        .arg("-L")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        _ => Err(AcquireError::BackendUnavailable),
    }
}

fn query_devices() -> Result<Vec<DeviceReading>, AcquireError> {
    let output = Command::new(NVIDIA_SMI)
        .args([DEVICE_QUERY, "--format=csv,noheader,nounits"])
        .output()
        .map_err(|err| AcquireError::DeviceQuery(err.to_string()))?;

    if !output.status.success() {
        return Err(AcquireError::DeviceQuery(format!(
            "exit status {}",
            output.status
        )));
    }

    Ok(parse_device_rows(&String::from_utf8_lossy(&output.stdout)))
}

fn query_processes() -> Result<Vec<ProcessReading>, AcquireError> {
    let output = Command::new(NVIDIA_SMI)
        .args([PROCESS_QUERY, "--format=csv,noheader,nounits"])
        .output()
        .map_err(|err| AcquireError::DeviceQuery(err.to_string()))?;

    if !output.status.success() {
        return Err(AcquireError::DeviceQuery(format!(
            "exit status {}",
            output.status
        )));
    }

    Ok(parse_process_rows(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse the device listing. Rows with fewer than the expected field count
/// are skipped; the backend is known to emit partial trailing rows.
fn parse_device_rows(raw: &str) -> Vec<DeviceReading> {
    let mut readings = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < DEVICE_FIELDS {
            continue;
        }
        readings.push(DeviceReading {
            index: field_u32(fields[0]),
            name: fields[1].to_string(),
            uuid: fields[2].to_string(),
            util_gpu: field_f64(fields[3]),
            util_mem: field_f64(fields[4]),
            mem_used_mb: field_f64(fields[5]),
            mem_total_mb: field_f64(fields[6]),
            temp_c: field_f64(fields[7]),
            power_w: field_f64(fields[8]),
            power_limit_w: field_f64(fields[9]),
        });
    }
    readings
}

fn parse_process_rows(raw: &str) -> Vec<ProcessReading> {
    let mut readings = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < PROCESS_FIELDS {
            continue;
        }
        readings.push(ProcessReading {
            pid: field_u32(fields[0]),
            process_name: fields[1].to_string(),
            used_mem_mb: field_f64(fields[2]),
            gpu_uuid: fields[3].to_string(),
            owner: String::new(),
        });
    }
    readings
}

// The backend occasionally reports "[N/A]" or garbage in numeric columns;
// lenient parsing maps those to 0 rather than dropping the row.
fn field_u32(raw: &str) -> u32 {
    raw.trim().parse().unwrap_or_default()
}

fn field_f64(raw: &str) -> f64 {
    raw.trim().parse().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_OUTPUT: &str = "\
0, NVIDIA A100-SXM4-40GB, GPU-8f4c3a1e-0001-0002-0003-abcdefabcdef, 87, 42, 16384, 40960, 61, 312.45, 400.00
1, NVIDIA A100-SXM4-40GB, GPU-8f4c3a1e-0001-0002-0003-fedcbafedcba, 3, 1, 512, 40960, 33, 54.10, 400.00
";

    #[test]
    fn parses_device_rows() {
        let devices = parse_device_rows(DEVICE_OUTPUT);
        assert_eq!(devices.len(), 2);

        let first = &devices[0];
        assert_eq!(first.index, 0);
        assert_eq!(first.name, "NVIDIA A100-SXM4-40GB");
        assert_eq!(first.uuid, "GPU-8f4c3a1e-0001-0002-0003-abcdefabcdef");
        assert_eq!(first.util_gpu, 87.0);
        assert_eq!(first.util_mem, 42.0);
        assert_eq!(first.mem_used_mb, 16384.0);
        assert_eq!(first.mem_total_mb, 40960.0);
        assert_eq!(first.temp_c, 61.0);
        assert_eq!(first.power_w, 312.45);
        assert_eq!(first.power_limit_w, 400.0);
    }

    #[test]
    fn short_device_row_is_skipped_without_aborting() {
        let raw = "\
0, NVIDIA A100, GPU-aaaa, 10, 5, 100, 1000, 40, 100.0, 250.0
1, truncated row
2, NVIDIA A100, GPU-bbbb, 20, 10, 200, 1000, 45, 120.0, 250.0
";
        let devices = parse_device_rows(raw);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].index, 0);
        assert_eq!(devices[1].index, 2);
    }

    #[test]
    fn empty_and_blank_lines_are_ignored() {
        assert!(parse_device_rows("").is_empty());
        assert!(parse_device_rows("\n   \n").is_empty());
    }

    #[test]
    fn unparseable_numeric_fields_default_to_zero() {
        let raw = "0, NVIDIA A100, GPU-aaaa, [N/A], 5, 100, 1000, 40, [N/A], 250.0";
        let devices = parse_device_rows(raw);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].util_gpu, 0.0);
        assert_eq!(devices[0].power_w, 0.0);
    }

    #[test]
    fn parses_process_rows() {
        let raw = "\
41235, /usr/bin/python3, 15872, GPU-8f4c3a1e-0001-0002-0003-abcdefabcdef
902, ./train, 512, GPU-8f4c3a1e-0001-0002-0003-fedcbafedcba
";
        let procs = parse_process_rows(raw);
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[0].pid, 41235);
        assert_eq!(procs[0].process_name, "/usr/bin/python3");
        assert_eq!(procs[0].used_mem_mb, 15872.0);
        assert_eq!(
            procs[0].gpu_uuid,
            "GPU-8f4c3a1e-0001-0002-0003-abcdefabcdef"
        );
        assert!(procs[0].owner.is_empty());
    }

    #[test]
    fn short_process_row_is_skipped() {
        let raw = "41235, python\n902, ./train, 512, GPU-aaaa\n";
        let procs = parse_process_rows(raw);
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].pid, 902);
    }
}
