//! Session state machine.
//!
//! `apply` is a pure transition function: it never performs I/O and never
//! blocks. Side effects are returned as `Effect` values for the runtime to
//! execute; every dispatched effect produces exactly one completion message
//! later. History loads and day lists carry a monotonically increasing
//! request token so that late completions for superseded requests are
//! discarded instead of clobbering newer state.

use chrono::{Duration, NaiveDate};

use crate::models::{Snapshot, SnapshotMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Live,
    History,
}

/// Display-only filters over the currently shown snapshot. Cycling walks an
/// explicit sorted distinct-value list and wraps back to "no filter".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filters {
    pub user: Option<String>,
    pub device: Option<u32>,
    pub sort_by_mem: bool,
}

impl Filters {
    pub fn is_active(&self) -> bool {
        self.user.is_some() || self.device.is_some() || self.sort_by_mem
    }

    /// Project a snapshot through the active filters for display.
    pub fn apply(&self, snapshot: &Snapshot) -> Snapshot {
        let mut view = snapshot.clone();

        if let Some(index) = self.device {
            view.devices.retain(|d| d.index == index);
            let kept: Vec<&str> = view.devices.iter().map(|d| d.uuid.as_str()).collect();
            view.processes
                .retain(|p| kept.iter().any(|uuid| *uuid == p.gpu_uuid));
        }

        if let Some(user) = &self.user {
            view.processes
                .retain(|p| p.owner.eq_ignore_ascii_case(user));
        }

        if self.sort_by_mem {
            view.processes.sort_by(|a, b| {
                b.used_mem_mb
                    .partial_cmp(&a.used_mem_mb)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        view
    }
}

/// Discrete operator commands, from keypresses or a headless driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Refresh,
    Save,
    ToggleHistory,
    JumpToday,
    ToggleAutoRecord,
    PageDay(i64),
    PageSnapshot(i64),
    CycleUserFilter,
    CycleDeviceFilter,
    ToggleMemSort,
    ClearFilters,
    ToggleHelp,
    Quit,
}

/// Everything the reducer consumes: the tick, operator commands, and the
/// single completion message each asynchronous effect produces.
///
/// Errors cross as display strings — acquisition and persistence failures
/// are transient display state, nothing more.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    Tick,
    Command(Command),
    SampleReady { snapshot: Snapshot, persisted: bool },
    SampleFailed { error: String },
    SaveDone { id: i64 },
    SaveFailed { error: String },
    DayListReady { token: u64, metas: Vec<SnapshotMeta> },
    DayListFailed { token: u64, error: String },
    SnapshotReady { token: u64, snapshot: Snapshot },
    SnapshotFailed { token: u64, error: String },
}

/// Side effects the runtime executes. `StartTicker` replaces any running
/// ticker, so at most one tick source ever exists.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Sample { persist: bool },
    Persist { snapshot: Snapshot },
    LoadDayList { day: NaiveDate, token: u64 },
    LoadSnapshot { id: i64, token: u64 },
    StartTicker,
    StopTicker,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub mode: Mode,
    pub auto_record: bool,
    /// Currently displayed snapshot: the latest live sample, or the hydrated
    /// history entry at the cursor.
    pub current: Option<Snapshot>,
    pub status: String,
    pub last_error: Option<String>,
    pub selected_day: NaiveDate,
    pub metas: Vec<SnapshotMeta>,
    pub cursor: usize,
    pub filters: Filters,
    pub show_help: bool,
    pub quit: bool,
    /// Tick re-entrancy guard: a tick-driven sample is still in flight.
    sampling: bool,
    day_list_token: u64,
    load_token: u64,
}

impl SessionState {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            mode: Mode::Live,
            auto_record: true,
            current: None,
            status: "starting".into(),
            last_error: None,
            selected_day: today,
            metas: Vec::new(),
            cursor: 0,
            filters: Filters::default(),
            show_help: false,
            quit: false,
            sampling: false,
            day_list_token: 0,
            load_token: 0,
        }
    }

    /// Effects to dispatch before the first message arrives: one unpersisted
    /// sample plus the ticker (the initial state is Live with auto-record on).
    pub fn initial_effects(&self) -> Vec<Effect> {
        vec![Effect::Sample { persist: false }, Effect::StartTicker]
    }

    /// The displayed snapshot projected through the active filters.
    pub fn visible_snapshot(&self) -> Option<Snapshot> {
        self.current.as_ref().map(|s| self.filters.apply(s))
    }
}

pub fn apply(state: SessionState, msg: Msg, today: NaiveDate) -> (SessionState, Vec<Effect>) {
    let mut state = state;
    let mut effects = Vec::new();

    match msg {
        Msg::Tick => {
            if state.mode == Mode::Live && state.auto_record && !state.sampling {
                state.sampling = true;
                effects.push(Effect::Sample { persist: true });
            }
        }

        Msg::Command(cmd) => {
            return apply_command(state, cmd, today);
        }

        Msg::SampleReady {
            snapshot,
            persisted: _,
        } => {
            state.sampling = false;
            // A live sample completing after the operator switched to
            // history must not clobber the history view.
            if state.mode == Mode::Live {
                state.status = format!(
                    "LIVE {} | autosave:{}",
                    snapshot.ts.format("%H:%M:%S"),
                    state.auto_record
                );
                state.current = Some(snapshot);
                state.last_error = None;
            }
        }

        Msg::SampleFailed { error } => {
            state.sampling = false;
            if state.mode == Mode::Live {
                // Keep the previous snapshot on screen; the next tick retries.
                state.status = "sampling error".into();
                state.last_error = Some(error);
            }
        }

        Msg::SaveDone { id } => {
            state.status = format!("saved snapshot #{id}");
            if let Some(current) = state.current.as_mut() {
                if current.id.is_none() {
                    current.id = Some(id);
                }
            }
        }

        Msg::SaveFailed { error } => {
            state.last_error = Some(error);
        }

        Msg::DayListReady { token, metas } => {
            if state.mode == Mode::History && token == state.day_list_token {
                state.cursor = 0;
                if metas.is_empty() {
                    state.metas = metas;
                    state.current = None;
                    state.status = "no snapshots on this date".into();
                } else {
                    let first = metas[0].id;
                    state.metas = metas;
                    state.load_token += 1;
                    effects.push(Effect::LoadSnapshot {
                        id: first,
                        token: state.load_token,
                    });
                }
            }
        }

        Msg::DayListFailed { token, error } => {
            if state.mode == Mode::History && token == state.day_list_token {
                state.last_error = Some(error);
            }
        }

        Msg::SnapshotReady { token, snapshot } => {
            if state.mode == Mode::History && token == state.load_token {
                state.status = format!(
                    "HISTORY {} ({}/{})",
                    snapshot.ts.format("%Y-%m-%d %H:%M:%S"),
                    state.cursor + 1,
                    state.metas.len()
                );
                state.current = Some(snapshot);
                state.last_error = None;
            }
        }

        Msg::SnapshotFailed { token, error } => {
            if state.mode == Mode::History && token == state.load_token {
                state.last_error = Some(error);
            }
        }
    }

    (state, effects)
}

fn apply_command(
    state: SessionState,
    cmd: Command,
    today: NaiveDate,
) -> (SessionState, Vec<Effect>) {
    let mut state = state;
    let mut effects = Vec::new();

    match cmd {
        Command::Refresh => {
            if state.mode == Mode::Live {
                effects.push(Effect::Sample { persist: false });
            }
        }

        Command::Save => {
            if state.mode == Mode::Live {
                match &state.current {
                    None => {
                        state.last_error = Some("no current snapshot".into());
                    }
                    Some(snapshot) if snapshot.id.is_some() => {
                        // Already persisted; saving an identified snapshot
                        // would duplicate it.
                        state.status = "snapshot already saved".into();
                    }
                    Some(snapshot) => {
                        effects.push(Effect::Persist {
                            snapshot: snapshot.clone(),
                        });
                    }
                }
            }
        }

        Command::ToggleHistory => match state.mode {
            Mode::Live => {
                state.mode = Mode::History;
                state.selected_day = today;
                state.cursor = 0;
                state.day_list_token += 1;
                state.status = "loading history".into();
                effects.push(Effect::StopTicker);
                effects.push(Effect::LoadDayList {
                    day: state.selected_day,
                    token: state.day_list_token,
                });
            }
            Mode::History => {
                state.mode = Mode::Live;
                effects.push(Effect::Sample { persist: false });
                if state.auto_record {
                    effects.push(Effect::StartTicker);
                }
            }
        },

        Command::JumpToday => {
            let was_history = state.mode == Mode::History;
            state.mode = Mode::Live;
            effects.push(Effect::Sample { persist: false });
            if was_history && state.auto_record {
                effects.push(Effect::StartTicker);
            }
        }

        Command::ToggleAutoRecord => {
            if state.mode == Mode::Live {
                state.auto_record = !state.auto_record;
                if state.auto_record {
                    effects.push(Effect::StartTicker);
                } else {
                    effects.push(Effect::StopTicker);
                }
            }
        }

        Command::PageDay(delta) => {
            if state.mode == Mode::History {
                state.selected_day = state
                    .selected_day
                    .checked_add_signed(Duration::days(delta))
                    .unwrap_or(state.selected_day);
                state.day_list_token += 1;
                effects.push(Effect::LoadDayList {
                    day: state.selected_day,
                    token: state.day_list_token,
                });
            }
        }

        Command::PageSnapshot(delta) => {
            if state.mode == Mode::History && !state.metas.is_empty() {
                let last = state.metas.len() - 1;
                let moved = state.cursor as i64 + delta;
                state.cursor = moved.clamp(0, last as i64) as usize;
                state.load_token += 1;
                effects.push(Effect::LoadSnapshot {
                    id: state.metas[state.cursor].id,
                    token: state.load_token,
                });
            }
        }

        Command::CycleUserFilter => {
            let users = distinct_users(state.current.as_ref());
            state.filters.user = cycle(&users, state.filters.user.as_ref());
        }

        Command::CycleDeviceFilter => {
            let devices = distinct_devices(state.current.as_ref());
            state.filters.device = cycle(&devices, state.filters.device.as_ref());
        }

        Command::ToggleMemSort => {
            state.filters.sort_by_mem = !state.filters.sort_by_mem;
        }

        Command::ClearFilters => {
            state.filters = Filters::default();
        }

        Command::ToggleHelp => {
            state.show_help = !state.show_help;
        }

        Command::Quit => {
            state.quit = true;
            effects.push(Effect::StopTicker);
        }
    }

    (state, effects)
}

/// Advance through `values`; after the last one, wrap to `None` (no filter).
fn cycle<T: Clone + PartialEq>(values: &[T], current: Option<&T>) -> Option<T> {
    if values.is_empty() {
        return None;
    }
    match current {
        None => Some(values[0].clone()),
        Some(current) => match values.iter().position(|v| v == current) {
            Some(i) if i + 1 < values.len() => Some(values[i + 1].clone()),
            _ => None,
        },
    }
}

fn distinct_users(snapshot: Option<&Snapshot>) -> Vec<String> {
    let mut users: Vec<String> = snapshot
        .map(|s| s.processes.iter().map(|p| p.owner.clone()).collect())
        .unwrap_or_default();
    users.sort();
    users.dedup();
    users
}

fn distinct_devices(snapshot: Option<&Snapshot>) -> Vec<u32> {
    let mut devices: Vec<u32> = snapshot
        .map(|s| s.devices.iter().map(|d| d.index).collect())
        .unwrap_or_default();
    devices.sort_unstable();
    devices.dedup();
    devices
}
