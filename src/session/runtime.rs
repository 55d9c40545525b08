use chrono::Local;
use log::info;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::sampler;

use super::state::{apply, Command, Effect, Msg, SessionState};
use super::Config;

/// Cloneable handle for feeding operator commands into the session loop.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Msg>,
}

impl SessionHandle {
    pub fn command(&self, cmd: Command) {
        let _ = self.tx.send(Msg::Command(cmd));
    }
}

struct Ticker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the message channel, the store handle, and the sampling ticker.
///
/// Every effect runs as its own task and reports back with a single message;
/// the loop itself never blocks on sampling or store I/O, and messages are
/// folded into the state strictly in arrival order.
pub struct SessionRuntime {
    db: Database,
    config: Config,
    state: SessionState,
    msg_tx: mpsc::UnboundedSender<Msg>,
    msg_rx: mpsc::UnboundedReceiver<Msg>,
    state_tx: watch::Sender<SessionState>,
    ticker: Option<Ticker>,
}

impl SessionRuntime {
    pub fn new(
        db: Database,
        config: Config,
    ) -> (Self, SessionHandle, watch::Receiver<SessionState>) {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let state = SessionState::new(Local::now().date_naive());
        let (state_tx, state_rx) = watch::channel(state.clone());
        let handle = SessionHandle { tx: msg_tx.clone() };

        let runtime = Self {
            db,
            config,
            state,
            msg_tx,
            msg_rx,
            state_tx,
            ticker: None,
        };
        (runtime, handle, state_rx)
    }

    /// Drive the session until a `Quit` command lands (or every handle is
    /// dropped).
    pub async fn run(mut self) {
        for effect in self.state.initial_effects() {
            self.execute(effect);
        }
        self.publish();

        while let Some(msg) = self.msg_rx.recv().await {
            let today = Local::now().date_naive();
            let (next, effects) = apply(self.state.clone(), msg, today);
            self.state = next;
            for effect in effects {
                self.execute(effect);
            }
            self.publish();

            if self.state.quit {
                break;
            }
        }

        self.stop_ticker();
        info!("session loop finished");
    }

    fn publish(&self) {
        let _ = self.state_tx.send(self.state.clone());
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Sample { persist } => {
                let tx = self.msg_tx.clone();
                let db = self.db.clone();
                tokio::spawn(async move {
                    let sampled = tokio::task::spawn_blocking(sampler::sample).await;
                    let msg = match sampled {
                        Ok(Ok(mut snapshot)) => {
                            if persist {
                                match db.save_snapshot(&snapshot).await {
                                    Ok(id) => {
                                        snapshot.id = Some(id);
                                        Msg::SampleReady {
                                            snapshot,
                                            persisted: true,
                                        }
                                    }
                                    Err(err) => Msg::SampleFailed {
                                        error: err.to_string(),
                                    },
                                }
                            } else {
                                Msg::SampleReady {
                                    snapshot,
                                    persisted: false,
                                }
                            }
                        }
                        Ok(Err(err)) => Msg::SampleFailed {
                            error: err.to_string(),
                        },
                        Err(err) => Msg::SampleFailed {
                            error: format!("sampler task failed: {err}"),
                        },
                    };
                    let _ = tx.send(msg);
                });
            }

            Effect::Persist { snapshot } => {
                let tx = self.msg_tx.clone();
                let db = self.db.clone();
                tokio::spawn(async move {
                    let msg = match db.save_snapshot(&snapshot).await {
                        Ok(id) => Msg::SaveDone { id },
                        Err(err) => Msg::SaveFailed {
                            error: err.to_string(),
                        },
                    };
                    let _ = tx.send(msg);
                });
            }

            Effect::LoadDayList { day, token } => {
                let tx = self.msg_tx.clone();
                let db = self.db.clone();
                tokio::spawn(async move {
                    let msg = match db.list_snapshots_by_date(day).await {
                        Ok(metas) => Msg::DayListReady { token, metas },
                        Err(err) => Msg::DayListFailed {
                            token,
                            error: err.to_string(),
                        },
                    };
                    let _ = tx.send(msg);
                });
            }

            Effect::LoadSnapshot { id, token } => {
                let tx = self.msg_tx.clone();
                let db = self.db.clone();
                tokio::spawn(async move {
                    let msg = match db.load_snapshot(id).await {
                        Ok(snapshot) => Msg::SnapshotReady { token, snapshot },
                        Err(err) => Msg::SnapshotFailed {
                            token,
                            error: err.to_string(),
                        },
                    };
                    let _ = tx.send(msg);
                });
            }

            Effect::StartTicker => self.start_ticker(),
            Effect::StopTicker => self.stop_ticker(),
        }
    }

    /// Replace any running ticker with a fresh one, so at most one tick
    /// source exists no matter how often auto-record is toggled.
    fn start_ticker(&mut self) {
        self.stop_ticker();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tx = self.msg_tx.clone();
        let interval = self.config.sample_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first interval tick completes immediately; skip it so the
            // cadence starts one interval after arming.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if tx.send(Msg::Tick).is_err() {
                            break;
                        }
                    }
                    _ = token.cancelled() => {
                        info!("sampling ticker stopped");
                        break;
                    }
                }
            }
        });

        self.ticker = Some(Ticker { cancel, handle });
    }

    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.cancel.cancel();
            ticker.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn open_store() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(dir.path().join("gpuscope.db")).expect("open store");
        (dir, db)
    }

    #[tokio::test]
    async fn quit_command_stops_the_loop() {
        let (_dir, db) = open_store();
        let (runtime, handle, _state_rx) = SessionRuntime::new(db, Config::default());

        let task = tokio::spawn(runtime.run());
        handle.command(Command::Quit);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session loop must stop on quit")
            .expect("session task must not panic");
    }

    #[tokio::test]
    async fn ticker_toggling_never_stacks_tickers() {
        let (_dir, db) = open_store();
        let (runtime, handle, _state_rx) = SessionRuntime::new(db, Config::default());

        let task = tokio::spawn(runtime.run());
        handle.command(Command::ToggleAutoRecord);
        handle.command(Command::ToggleAutoRecord);
        handle.command(Command::ToggleAutoRecord);
        handle.command(Command::Quit);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session loop must stop on quit")
            .expect("session task must not panic");
    }
}
