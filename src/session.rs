use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::{Mutex, PoisonError, Weak};

use tokio_util::sync::CancellationToken;

use crate::source::LogEvent;

pub const MAX_EVENTS: usize = 1000;

/// Bounded event log that drops its oldest entries first.
#[derive(Debug)]
pub struct EventBuffer {
    events: VecDeque<LogEvent>,
    capacity: usize,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::with_capacity(MAX_EVENTS)
    }
}

impl EventBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = LogEvent>) -> usize {
        let mut evicted = 0;
        for event in events {
            self.events.push_back(event);
            if self.events.len() > self.capacity {
                self.events.pop_front();
                evicted += 1;
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&LogEvent> {
        self.events.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEvent> {
        self.events.iter()
    }

    fn last_index(&self) -> Option<usize> {
        self.events.len().checked_sub(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
    Stream,
    OpeningDetail,
    Detail,
    ClosingDetail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Connecting,
    Streaming,
    Closed,
}

/// Per-source state of a display view.
///
/// `cursor` is `None` while following the tail of an empty buffer; once the
/// buffer has events it always indexes into it.
#[derive(Debug)]
pub struct Session {
    buffer: EventBuffer,
    cursor: Option<usize>,
    offset: usize,
    live: bool,
    view_mode: ViewMode,
    status: StreamStatus,
    dirty: bool,
    tail_rows: usize,
    subscription: CancellationToken,
}

impl Session {
    /// `visible_rows` is the stream height live mode pins to until the next
    /// [`Session::follow_tail`].
    pub fn new(subscription: CancellationToken, visible_rows: usize) -> Self {
        Self {
            buffer: EventBuffer::default(),
            cursor: None,
            offset: 0,
            live: true,
            view_mode: ViewMode::Stream,
            status: StreamStatus::Connecting,
            dirty: true,
            tail_rows: visible_rows,
            subscription,
        }
    }

    pub fn append(&mut self, events: impl IntoIterator<Item = LogEvent>) {
        let evicted = self.buffer.extend(events);
        if evicted > 0 {
            self.offset = self.offset.saturating_sub(evicted);
            self.cursor = self.cursor.map(|cursor| cursor.saturating_sub(evicted));
        }
        if self.live {
            self.follow_tail(self.tail_rows);
        } else if self.cursor.is_none() {
            self.cursor = self.buffer.last_index();
        }
        self.dirty = true;
    }

    pub fn buffer(&self) -> &EventBuffer {
        &self.buffer
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn view_mode(&self) -> ViewMode {
        self.view_mode
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    /// Stops the task feeding this session.
    pub fn cancel(&self) {
        self.subscription.cancel();
    }

    pub fn selected(&self) -> Option<&LogEvent> {
        self.cursor.and_then(|cursor| self.buffer.get(cursor))
    }

    pub fn mark_streaming(&mut self) {
        self.status = StreamStatus::Streaming;
        self.dirty = true;
    }

    pub fn mark_closed(&mut self) {
        self.status = StreamStatus::Closed;
        self.dirty = true;
    }

    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Pins the cursor to the newest event and the window to the last
    /// `visible_rows + 1` events while live.
    pub fn follow_tail(&mut self, visible_rows: usize) {
        self.tail_rows = visible_rows;
        if !self.live {
            return;
        }
        let Some(last) = self.buffer.last_index() else {
            self.cursor = None;
            self.offset = 0;
            return;
        };
        self.cursor = Some(last);
        self.offset = last.saturating_sub(visible_rows);
    }

    pub fn window(&self, visible_rows: usize) -> Range<usize> {
        let end = (self.offset + visible_rows + 1).min(self.buffer.len());
        self.offset.min(end)..end
    }

    pub fn cursor_up(&mut self, rows: usize) {
        let Some(last) = self.buffer.last_index() else {
            return;
        };
        self.live = false;

        let cursor = self.cursor.unwrap_or(last).saturating_sub(rows).min(last);
        self.cursor = Some(cursor);
        if cursor < self.offset {
            self.offset = cursor;
        }
        self.dirty = true;
    }

    pub fn cursor_down(&mut self, rows: usize, visible_rows: usize) {
        let Some(last) = self.buffer.last_index() else {
            return;
        };
        self.live = false;

        let cursor = self.cursor.unwrap_or(last).saturating_add(rows).min(last);
        self.cursor = Some(cursor);

        let bottom = (self.offset + visible_rows).min(last);
        if cursor > bottom {
            self.offset += cursor - bottom;
        }
        self.offset = self.offset.min(last);
        self.dirty = true;
    }

    /// No-op on an empty buffer. Returns whether live mode changed.
    pub fn toggle_live(&mut self) -> bool {
        if self.buffer.is_empty() {
            return false;
        }
        self.live = !self.live;
        self.dirty = true;
        true
    }

    pub fn toggle_detail(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        self.live = false;
        match self.view_mode {
            ViewMode::Stream => self.view_mode = ViewMode::OpeningDetail,
            ViewMode::Detail => self.view_mode = ViewMode::ClosingDetail,
            ViewMode::OpeningDetail | ViewMode::ClosingDetail => {}
        }
        self.dirty = true;
    }

    pub fn close_detail(&mut self) -> bool {
        if self.view_mode != ViewMode::Detail {
            return false;
        }
        self.view_mode = ViewMode::ClosingDetail;
        self.dirty = true;
        true
    }

    /// Selects the event drawn `row` rows below the header. Clicking the
    /// already selected event toggles the detail view.
    pub fn click(&mut self, row: usize) {
        let Some(last) = self.buffer.last_index() else {
            return;
        };
        if self.view_mode != ViewMode::Stream {
            self.toggle_detail();
            return;
        }

        let clicked = (self.offset + row).min(last);
        let previous = self.cursor.replace(clicked);
        self.live = false;
        self.dirty = true;
        if previous == Some(clicked) {
            self.toggle_detail();
        }
    }

    /// Settles a pending detail transition and returns the mode it settled on.
    pub fn finish_transition(&mut self) -> Option<ViewMode> {
        let settled = match self.view_mode {
            ViewMode::OpeningDetail => ViewMode::Detail,
            ViewMode::ClosingDetail => ViewMode::Stream,
            ViewMode::Stream | ViewMode::Detail => return None,
        };
        self.view_mode = settled;
        Some(settled)
    }
}

pub type SessionMap = HashMap<String, Session>;

/// Whatever currently owns the session map of a display view. Background
/// tasks reach their sessions through this, keyed by the view's generation,
/// and stop once the view they belong to is gone.
pub trait SessionHost: Send + 'static {
    fn sessions(&mut self, generation: u64) -> Option<&mut SessionMap>;
}

/// Returns `None` when the host is gone or shows another view.
pub fn with_sessions<H, T>(
    host: &Weak<Mutex<H>>,
    generation: u64,
    f: impl FnOnce(&mut SessionMap) -> T,
) -> Option<T>
where
    H: SessionHost,
{
    let host = host.upgrade()?;
    let mut host = host.lock().unwrap_or_else(PoisonError::into_inner);
    host.sessions(generation).map(f)
}
