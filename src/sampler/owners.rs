//! Process-owner resolution.
//!
//! The backend reports pids but not owners. Each sample refreshes exactly the
//! pids it saw and maps their real uid to an account name through a freshly
//! read user list — account changes must be visible on the next sample, so
//! nothing is cached across calls.

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, Users};

use crate::models::ProcessReading;

/// Owner sentinel for a pid whose uid could not be read (usually a process
/// that exited between the two backend queries).
pub const UNKNOWN_OWNER: &str = "?";

pub fn resolve_owners(processes: &mut [ProcessReading]) {
    if processes.is_empty() {
        return;
    }

    let users = Users::new_with_refreshed_list();
    let pids: Vec<Pid> = processes.iter().map(|p| Pid::from_u32(p.pid)).collect();

    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&pids),
        ProcessRefreshKind::everything(),
    );

    for reading in processes.iter_mut() {
        let uid = system
            .process(Pid::from_u32(reading.pid))
            .and_then(|process| process.user_id());

        reading.owner = match uid {
            Some(uid) => match users.get_user_by_id(uid) {
                Some(user) => user.name().to_string(),
                None => format!("uid:{}", **uid),
            },
            None => UNKNOWN_OWNER.to_string(),
        };
    }
}
