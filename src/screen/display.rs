use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};

use chrono::FixedOffset;
use crossterm::cursor::MoveTo;
use crossterm::style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor};
use futures_util::FutureExt;
use log::{debug, info, warn};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::app::panic_message;
use crate::error::{DeviceError, SubscriptionError};
use crate::input::{
    BACKSPACE, CTRL_H, CURSOR_DOWN, CURSOR_LEFT, CURSOR_RIGHT, CURSOR_UP, MOUSE_LEFT,
    MOUSE_WHEEL_DOWN, MOUSE_WHEEL_UP, MouseEvent, PAGE_DOWN, PAGE_UP,
};
use crate::screen::{Flow, InitContext};
use crate::session::{Session, SessionHost, SessionMap, StreamStatus, ViewMode, with_sessions};
use crate::source::{LogEvent, LogSource, Subscriber, wrap_text};
use crate::text::{Severity, clip_to_width, clip_with_ellipsis, flatten_lines, severity_segments};
use crate::tty::{Terminal, WindowSize};

/// Rows taken by the header and the status line reserve.
const CHROME_ROWS: usize = 2;
const DEFAULT_ROWS: usize = 24;
const DEFAULT_COLS: usize = 80;

/// Live view over the chosen sources, one [`Session`] each.
///
/// Every session is fed by its own background task. Dropping the view
/// cancels all of them.
#[derive(Debug)]
pub struct DisplayView {
    sources: Vec<LogSource>,
    foreground: usize,
    sessions: SessionMap,
    generation: u64,
    token: CancellationToken,
    rows: usize,
    cols: usize,
    dirty: bool,
    missing_drawn: bool,
}

impl DisplayView {
    pub fn new(sources: Vec<LogSource>, generation: u64, parent: &CancellationToken) -> Self {
        Self {
            sources,
            foreground: 0,
            sessions: SessionMap::new(),
            generation,
            token: parent.child_token(),
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            dirty: true,
            missing_drawn: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn sources(&self) -> &[LogSource] {
        &self.sources
    }

    pub fn foreground(&self) -> Option<&LogSource> {
        self.sources.get(self.foreground)
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Records a session per source and starts the task that feeds it.
    pub fn init<H: SessionHost>(&mut self, ctx: &InitContext<H>) {
        for source in &self.sources {
            let token = self.token.child_token();
            self.sessions.insert(
                source.id.clone(),
                Session::new(token.clone(), self.visible_rows()),
            );
            ctx.tracker.spawn(follow_source(
                ctx.host.clone(),
                self.generation,
                source.clone(),
                Arc::clone(&ctx.subscriber),
                token,
                ctx.utc_offset,
            ));
        }
        info!(
            "display {} tails {} sources",
            self.generation,
            self.sources.len()
        );
    }

    /// Cancels every subscription of this view.
    pub fn close(&mut self) {
        if !self.token.is_cancelled() {
            debug!("closing display {}", self.generation);
            for session in self.sessions.values() {
                session.cancel();
            }
            self.token.cancel();
        }
    }

    pub fn resize(&mut self, size: WindowSize) {
        self.rows = usize::from(size.rows);
        self.cols = usize::from(size.cols);
        self.dirty = true;
    }

    pub fn invalidate(&mut self) {
        self.dirty = true;
    }

    fn visible_rows(&self) -> usize {
        self.rows.saturating_sub(CHROME_ROWS)
    }

    fn foreground_session(&mut self) -> Option<&mut Session> {
        let source = self.sources.get(self.foreground)?;
        self.sessions.get_mut(&source.id)
    }

    fn cursor_up(&mut self, rows: usize) {
        if let Some(session) = self.foreground_session() {
            session.cursor_up(rows);
        }
    }

    fn cursor_down(&mut self, rows: usize) {
        let visible_rows = self.visible_rows();
        if let Some(session) = self.foreground_session() {
            session.cursor_down(rows, visible_rows);
        }
    }

    fn next_source(&mut self) {
        if self.sources.is_empty() {
            return;
        }
        self.foreground = (self.foreground + 1) % self.sources.len();
        self.dirty = true;
    }

    fn prev_source(&mut self) {
        if self.sources.is_empty() {
            return;
        }
        self.foreground = self
            .foreground
            .checked_sub(1)
            .unwrap_or(self.sources.len() - 1);
        self.dirty = true;
    }

    pub fn handle_key(&mut self, key: char) -> Flow {
        let page = self.visible_rows();
        match key {
            BACKSPACE | CTRL_H => {
                self.close();
                return Flow::Select(self.sources.clone());
            }
            'q' => return Flow::Quit,
            'j' => self.cursor_down(1),
            'k' => self.cursor_up(1),
            'J' => self.cursor_down(page),
            'K' => self.cursor_up(page),
            'l' => self.next_source(),
            'h' => self.prev_source(),
            ',' => {
                if let Some(session) = self.foreground_session() {
                    session.toggle_live();
                }
            }
            ' ' => {
                if let Some(session) = self.foreground_session() {
                    session.toggle_detail();
                }
            }
            _ => {}
        }
        Flow::Continue
    }

    /// Leaves the detail view.
    pub fn handle_escape(&mut self) -> Flow {
        if let Some(session) = self.foreground_session() {
            session.close_detail();
        }
        Flow::Continue
    }

    pub fn handle_control(&mut self, sequence: &str) -> Flow {
        let page = self.visible_rows();
        match sequence {
            CURSOR_UP => self.cursor_up(1),
            CURSOR_DOWN => self.cursor_down(1),
            PAGE_UP => self.cursor_up(page),
            PAGE_DOWN => self.cursor_down(page),
            CURSOR_RIGHT => self.next_source(),
            CURSOR_LEFT => self.prev_source(),
            _ => {}
        }
        Flow::Continue
    }

    pub fn handle_mouse(&mut self, mouse: MouseEvent) -> Flow {
        match mouse.code {
            MOUSE_LEFT => {
                if let Some(row) = usize::from(mouse.row).checked_sub(CHROME_ROWS)
                    && let Some(session) = self.foreground_session()
                {
                    session.click(row);
                }
            }
            MOUSE_WHEEL_UP => self.cursor_up(1),
            MOUSE_WHEEL_DOWN => self.cursor_down(1),
            _ => {}
        }
        Flow::Continue
    }

    /// Draws the foreground source when it or the view changed.
    pub fn render(&mut self, terminal: &mut Terminal) -> Result<(), DeviceError> {
        let size = terminal.size()?;
        self.rows = usize::from(size.rows);
        self.cols = usize::from(size.cols);
        let visible_rows = self.visible_rows();
        let cols = self.cols;
        for session in self.sessions.values_mut() {
            session.follow_tail(visible_rows);
        }

        let Some(source) = self.sources.get(self.foreground) else {
            return Ok(());
        };
        let view_dirty = std::mem::take(&mut self.dirty);
        let Some(session) = self.sessions.get_mut(&source.id) else {
            if !view_dirty && self.missing_drawn {
                return Ok(());
            }
            self.missing_drawn = true;
            terminal.clear()?;
            terminal.enable_mouse()?;
            draw_header(terminal, &source.id, "unavailable", None, cols)?;
            return terminal.flush();
        };
        self.missing_drawn = false;
        if !session.take_dirty() && !view_dirty {
            return Ok(());
        }

        terminal.clear()?;
        session.finish_transition();
        if session.view_mode() == ViewMode::Detail {
            terminal.disable_mouse()?;
        } else {
            terminal.enable_mouse()?;
        }

        let position = Some((
            session.cursor().map_or(0, |cursor| cursor + 1),
            session.buffer().len(),
        ));
        draw_header(terminal, &source.id, status_label(session), position, cols)?;

        if session.view_mode() == ViewMode::Detail {
            if let Some(event) = session.selected() {
                draw_detail(terminal, event, visible_rows + 1, cols)?;
            }
        } else {
            draw_stream(terminal, session, visible_rows, cols)?;
        }
        terminal.flush()
    }
}

impl Drop for DisplayView {
    fn drop(&mut self) {
        self.close();
    }
}

impl SessionHost for DisplayView {
    fn sessions(&mut self, generation: u64) -> Option<&mut SessionMap> {
        (generation == self.generation).then_some(&mut self.sessions)
    }
}

fn status_label(session: &Session) -> &'static str {
    match session.status() {
        StreamStatus::Connecting => "connecting",
        StreamStatus::Closed => "closed",
        StreamStatus::Streaming if session.is_live() => "live",
        StreamStatus::Streaming => "paused",
    }
}

fn draw_header(
    terminal: &mut Terminal,
    id: &str,
    status: &str,
    position: Option<(usize, usize)>,
    cols: usize,
) -> Result<(), DeviceError> {
    let mut header = format!("{id} {status}");
    if let Some((current, total)) = position {
        header.push_str(&format!(" [{current}/{total}]"));
    }
    terminal.queue(MoveTo(0, 0))?;
    terminal.queue(SetForegroundColor(Color::DarkGreen))?;
    terminal.queue(Print(clip_to_width(&header, cols)))?;
    terminal.queue(ResetColor)
}

fn draw_stream(
    terminal: &mut Terminal,
    session: &Session,
    visible_rows: usize,
    cols: usize,
) -> Result<(), DeviceError> {
    for (row, index) in session.window(visible_rows).enumerate() {
        let Some(event) = session.buffer().get(index) else {
            break;
        };
        let timestamp = clip_to_width(&event.formatted_timestamp(), cols);
        let budget = cols.saturating_sub(timestamp.chars().count() + 1);
        let message = clip_with_ellipsis(&flatten_lines(event.message()), budget);

        terminal.queue(MoveTo(0, (row + 1) as u16))?;
        if session.cursor() == Some(index) {
            terminal.queue(SetAttribute(Attribute::Reverse))?;
        }
        terminal.queue(SetForegroundColor(Color::DarkGreen))?;
        terminal.queue(Print(timestamp))?;
        terminal.queue(Print(" "))?;
        for (text, severity) in severity_segments(&message) {
            let color = severity.map_or(Color::DarkYellow, Severity::color);
            terminal.queue(SetForegroundColor(color))?;
            terminal.queue(Print(text))?;
        }
        terminal.queue(SetAttribute(Attribute::Reset))?;
        terminal.queue(ResetColor)?;
    }
    Ok(())
}

fn draw_detail(
    terminal: &mut Terminal,
    event: &LogEvent,
    max_rows: usize,
    cols: usize,
) -> Result<(), DeviceError> {
    let lines = match pretty_message(event.message()) {
        Some(pretty) => wrap_text(&pretty, cols),
        None => event.wrap(cols),
    };
    for (row, line) in lines.into_iter().take(max_rows).enumerate() {
        terminal.queue(MoveTo(0, (row + 1) as u16))?;
        terminal.queue(Print(line))?;
    }
    Ok(())
}

/// Indented form of a message that is a JSON object.
pub fn pretty_message(message: &str) -> Option<String> {
    match serde_json::from_str::<Value>(message) {
        Ok(value @ Value::Object(_)) => serde_json::to_string_pretty(&value).ok(),
        _ => None,
    }
}

/// A panic inside a collaborator is treated as a failed stream.
fn fault(source_id: &str, payload: Box<dyn Any + Send>) -> SubscriptionError {
    SubscriptionError::Stream {
        source_id: source_id.to_owned(),
        reason: format!("fault: {}", panic_message(payload)),
    }
}

/// Feeds one session from its subscription until the view goes away, the
/// token is cancelled or the stream ends.
async fn follow_source<H: SessionHost>(
    host: Weak<Mutex<H>>,
    generation: u64,
    source: LogSource,
    subscriber: Arc<dyn Subscriber>,
    token: CancellationToken,
    utc_offset: FixedOffset,
) {
    let id = source.id.as_str();
    let subscribed = tokio::select! {
        _ = token.cancelled() => return,
        subscribed = AssertUnwindSafe(subscriber.subscribe(&source)).catch_unwind() => {
            subscribed.unwrap_or_else(|payload| Err(fault(id, payload)))
        }
    };
    let mut subscription = match subscribed {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!("{err}");
            with_sessions(&host, generation, |sessions| sessions.remove(id));
            return;
        }
    };
    info!("subscribed to {id}");

    let attached = with_sessions(&host, generation, |sessions| {
        sessions.get_mut(id).map(Session::mark_streaming).is_some()
    });
    if attached != Some(true) {
        subscription.close().await;
        return;
    }

    loop {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            received = AssertUnwindSafe(subscription.receive()).catch_unwind() => {
                received.unwrap_or_else(|payload| Err(fault(id, payload)))
            }
        };
        match received {
            Ok(Some(batch)) => {
                if batch.is_empty() {
                    continue;
                }
                let events = batch
                    .iter()
                    .map(|raw| LogEvent::new(raw, utc_offset))
                    .collect::<Vec<_>>();
                let appended = with_sessions(&host, generation, |sessions| {
                    sessions.get_mut(id).map(|session| session.append(events))
                });
                if !matches!(appended, Some(Some(()))) {
                    break;
                }
            }
            Ok(None) => {
                info!("stream for {id} ended");
                with_sessions(&host, generation, |sessions| {
                    if let Some(session) = sessions.get_mut(id) {
                        session.mark_closed();
                    }
                });
                break;
            }
            Err(err) => {
                warn!("{err}");
                with_sessions(&host, generation, |sessions| sessions.remove(id));
                break;
            }
        }
    }

    if AssertUnwindSafe(subscription.close()).catch_unwind().await.is_err() {
        warn!("closing the subscription for {id} panicked");
    } else {
        debug!("closed subscription for {id}");
    }
}
