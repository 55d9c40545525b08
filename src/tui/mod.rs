//! Terminal dashboard.
//!
//! The dashboard is a read-only renderer over the session state: keys map to
//! session commands, and redraws follow the state `watch` channel. It never
//! touches the store or the sampler directly.

mod view;

use std::io;
use std::time::Duration;

use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::prelude::*;
use tokio::time;

use crate::db::Database;
use crate::session::{Command, Config, SessionHandle, SessionRuntime};

pub async fn run(db: Database, config: Config) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Restore the terminal before printing any panic.
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen, crossterm::cursor::Show);
        original_hook(info);
    }));

    let result = run_loop(&mut terminal, db, config).await;

    let _ = std::panic::take_hook();
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        crossterm::cursor::Show
    )?;

    result
}

async fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    db: Database,
    config: Config,
) -> Result<()> {
    let thresholds = (config.max_temp_c, config.max_mem_pct);
    let (runtime, handle, mut state_rx) = SessionRuntime::new(db, config);
    let session = tokio::spawn(runtime.run());

    // Key reading is blocking; it lives on its own thread and feeds commands
    // through the same channel every other message uses.
    let key_handle = handle.clone();
    let key_thread = std::thread::spawn(move || key_loop(key_handle));

    // Redraw on state changes, plus a slow repaint tick for resizes.
    let mut repaint = time::interval(Duration::from_millis(250));

    loop {
        let state = state_rx.borrow_and_update().clone();
        terminal.draw(|f| view::draw(f, &state, thresholds))?;
        if state.quit {
            break;
        }

        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = repaint.tick() => {}
        }
    }

    let _ = session.await;
    let _ = key_thread.join();
    Ok(())
}

fn key_loop(handle: SessionHandle) {
    loop {
        if !event::poll(Duration::from_millis(100)).unwrap_or(false) {
            continue;
        }
        let Ok(Event::Key(key)) = event::read() else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        let cmd = match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                Some(Command::Quit)
            }
            KeyCode::Char('q') => Some(Command::Quit),
            KeyCode::Char('r') => Some(Command::Refresh),
            KeyCode::Char('s') => Some(Command::Save),
            KeyCode::Char('a') => Some(Command::ToggleAutoRecord),
            KeyCode::Char('h') => Some(Command::ToggleHistory),
            KeyCode::Char('t') => Some(Command::JumpToday),
            KeyCode::Left => Some(Command::PageSnapshot(-1)),
            KeyCode::Right => Some(Command::PageSnapshot(1)),
            KeyCode::Up => Some(Command::PageDay(-1)),
            KeyCode::Down => Some(Command::PageDay(1)),
            KeyCode::Char('f') => Some(Command::CycleUserFilter),
            KeyCode::Char('g') => Some(Command::CycleDeviceFilter),
            KeyCode::Char('m') => Some(Command::ToggleMemSort),
            KeyCode::Char('c') => Some(Command::ClearFilters),
            KeyCode::Char('?') => Some(Command::ToggleHelp),
            _ => None,
        };

        if let Some(cmd) = cmd {
            let quitting = cmd == Command::Quit;
            handle.command(cmd);
            if quitting {
                break;
            }
        }
    }
}
