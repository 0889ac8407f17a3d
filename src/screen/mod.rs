//! The three views of the dashboard. Exactly one is active; the app swaps
//! them according to the [`Flow`] their handlers return.

use std::sync::{Arc, Mutex, Weak};

use chrono::FixedOffset;
use tokio_util::task::TaskTracker;

use crate::error::DeviceError;
use crate::input::MouseEvent;
use crate::session::SessionHost;
use crate::source::{LogSource, Subscriber};
use crate::tty::Terminal;

pub mod display;
pub mod loading;
pub mod selection;

pub use display::DisplayView;
pub use loading::LoadingView;
pub use selection::SelectionView;

/// What the driving loop should do after an input was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stop the input loop and shut down.
    Quit,
    /// Go back to source selection with these sources chosen.
    Select(Vec<LogSource>),
    /// Start tailing these sources.
    Display(Vec<LogSource>),
}

/// Everything a view needs to start background work.
pub struct InitContext<H> {
    pub host: Weak<Mutex<H>>,
    pub subscriber: Arc<dyn Subscriber>,
    pub tracker: TaskTracker,
    pub utc_offset: FixedOffset,
}

#[derive(Debug)]
pub enum Screen {
    Loading(LoadingView),
    Selection(SelectionView),
    Display(DisplayView),
}

impl Screen {
    pub fn name(&self) -> &'static str {
        match self {
            Screen::Loading(_) => "loading",
            Screen::Selection(_) => "selection",
            Screen::Display(_) => "display",
        }
    }

    pub fn init<H: SessionHost>(&mut self, ctx: &InitContext<H>) {
        match self {
            Screen::Loading(_) | Screen::Selection(_) => {}
            Screen::Display(view) => view.init(ctx),
        }
    }

    /// Repaints if anything changed since the previous frame.
    pub fn render(&mut self, terminal: &mut Terminal) -> Result<(), DeviceError> {
        match self {
            Screen::Loading(view) => view.render(terminal),
            Screen::Selection(view) => view.render(terminal),
            Screen::Display(view) => view.render(terminal),
        }
    }

    /// Forces the next render to repaint everything.
    pub fn invalidate(&mut self) {
        match self {
            Screen::Loading(view) => view.invalidate(),
            Screen::Selection(view) => view.invalidate(),
            Screen::Display(view) => view.invalidate(),
        }
    }

    pub fn handle_key(&mut self, key: char) -> Flow {
        match self {
            Screen::Loading(_) => Flow::Continue,
            Screen::Selection(view) => view.handle_key(key),
            Screen::Display(view) => view.handle_key(key),
        }
    }

    pub fn handle_escape(&mut self) -> Flow {
        match self {
            Screen::Loading(_) => Flow::Continue,
            Screen::Selection(view) => view.handle_escape(),
            Screen::Display(view) => view.handle_escape(),
        }
    }

    pub fn handle_control(&mut self, sequence: &str) -> Flow {
        match self {
            Screen::Loading(_) => Flow::Continue,
            Screen::Selection(view) => view.handle_control(sequence),
            Screen::Display(view) => view.handle_control(sequence),
        }
    }

    pub fn handle_mouse(&mut self, mouse: MouseEvent) -> Flow {
        match self {
            Screen::Loading(_) => Flow::Continue,
            Screen::Selection(view) => view.handle_mouse(mouse),
            Screen::Display(view) => view.handle_mouse(mouse),
        }
    }
}
