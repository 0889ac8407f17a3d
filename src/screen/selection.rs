use std::collections::BTreeSet;

use crossterm::cursor::MoveTo;
use crossterm::style::{Attribute, Print, SetAttribute};

use crate::error::DeviceError;
use crate::input::{
    BACKSPACE, CTRL_H, CURSOR_DOWN, CURSOR_UP, ENTER, MOUSE_LEFT, MOUSE_WHEEL_DOWN,
    MOUSE_WHEEL_UP, MouseEvent,
};
use crate::screen::Flow;
use crate::source::LogSource;
use crate::text::{clip_to_width, clip_with_ellipsis};
use crate::tty::Terminal;

const TITLE: &str = "Choose Logs";
const HELP: &str =
    "(/: search, space: select/unselect, j/k: up/down, h/l: prev/next, enter: apply, q: quit)";
/// Title, status line and a blank row sit above the list.
const HEADER_ROWS: usize = 3;
const DEFAULT_LIMIT: usize = 10;

/// Catalog positions whose identifier contains `filter`, in catalog order.
pub fn filter_catalog(catalog: &[LogSource], filter: &str) -> Vec<usize> {
    catalog
        .iter()
        .enumerate()
        .filter(|(_, source)| source.id.contains(filter))
        .map(|(position, _)| position)
        .collect()
}

/// Source picker with search and multi-select.
#[derive(Debug)]
pub struct SelectionView {
    catalog: Vec<LogSource>,
    chosen: BTreeSet<usize>,
    filter: String,
    draft: Option<String>,
    filtered: Vec<usize>,
    index: usize,
    offset: usize,
    limit: usize,
    dirty: bool,
}

impl SelectionView {
    /// `chosen` sources missing from `catalog` are dropped.
    pub fn new(catalog: Vec<LogSource>, chosen: &[LogSource]) -> Self {
        let chosen = catalog
            .iter()
            .enumerate()
            .filter(|(_, source)| chosen.contains(source))
            .map(|(position, _)| position)
            .collect();
        let filtered = filter_catalog(&catalog, "");
        Self {
            catalog,
            chosen,
            filter: String::new(),
            draft: None,
            filtered,
            index: 0,
            offset: 0,
            limit: DEFAULT_LIMIT,
            dirty: true,
        }
    }

    pub fn catalog(&self) -> &[LogSource] {
        &self.catalog
    }

    /// Chosen sources in catalog order.
    pub fn chosen(&self) -> Vec<LogSource> {
        self.chosen
            .iter()
            .map(|&position| self.catalog[position].clone())
            .collect()
    }

    pub fn filtered(&self) -> impl Iterator<Item = &LogSource> {
        self.filtered.iter().map(|&position| &self.catalog[position])
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn is_searching(&self) -> bool {
        self.draft.is_some()
    }

    pub fn invalidate(&mut self) {
        self.dirty = true;
    }

    pub fn handle_key(&mut self, key: char) -> Flow {
        self.dirty = true;
        if let Some(draft) = &mut self.draft {
            match key {
                BACKSPACE | CTRL_H => {
                    draft.pop();
                }
                ENTER => {
                    let filter = std::mem::take(draft);
                    self.draft = None;
                    self.apply_filter(filter);
                }
                key if !key.is_control() => draft.push(key),
                _ => {}
            }
            return Flow::Continue;
        }

        match key {
            'j' => self.down(),
            'k' => self.up(),
            'l' => self.next_page(),
            'h' => self.prev_page(),
            ' ' => self.toggle_highlighted(),
            '/' => self.draft = Some(String::new()),
            'r' => self.apply_filter(String::new()),
            'q' => return Flow::Quit,
            ENTER => return self.confirm(),
            _ => {}
        }
        Flow::Continue
    }

    /// Cancels an unfinished search.
    pub fn handle_escape(&mut self) -> Flow {
        if self.draft.take().is_some() {
            self.dirty = true;
        }
        Flow::Continue
    }

    pub fn handle_control(&mut self, sequence: &str) -> Flow {
        match sequence {
            CURSOR_UP => self.up(),
            CURSOR_DOWN => self.down(),
            _ => return Flow::Continue,
        }
        self.dirty = true;
        Flow::Continue
    }

    pub fn handle_mouse(&mut self, mouse: MouseEvent) -> Flow {
        match mouse.code {
            MOUSE_LEFT => {
                let Some(row) = usize::from(mouse.row).checked_sub(HEADER_ROWS + 1) else {
                    return Flow::Continue;
                };
                let clicked = self.offset + row;
                if clicked >= self.filtered.len() {
                    return Flow::Continue;
                }
                if clicked == self.index {
                    self.toggle_highlighted();
                } else {
                    self.index = clicked;
                }
            }
            MOUSE_WHEEL_UP => self.up(),
            MOUSE_WHEEL_DOWN => self.down(),
            _ => return Flow::Continue,
        }
        self.dirty = true;
        Flow::Continue
    }

    /// Adds the highlighted source to the chosen set, or removes it.
    pub fn toggle_highlighted(&mut self) {
        let Some(&position) = self.filtered.get(self.index) else {
            return;
        };
        if !self.chosen.remove(&position) {
            self.chosen.insert(position);
        }
        self.dirty = true;
    }

    fn confirm(&self) -> Flow {
        if self.chosen.is_empty() {
            return Flow::Continue;
        }
        Flow::Display(self.chosen())
    }

    fn apply_filter(&mut self, filter: String) {
        self.filtered = filter_catalog(&self.catalog, &filter);
        self.filter = filter;
        self.index = 0;
        self.offset = 0;
    }

    fn down(&mut self) {
        if self.filtered.is_empty() {
            return;
        }
        self.index += 1;
        if self.index >= self.filtered.len() {
            self.index = 0;
            self.offset = 0;
        } else if self.index >= self.offset + self.limit {
            self.offset = self.index + 1 - self.limit;
        }
    }

    fn up(&mut self) {
        if self.filtered.is_empty() {
            return;
        }
        if self.index == 0 {
            self.index = self.filtered.len() - 1;
            self.offset = self.filtered.len().saturating_sub(self.limit);
            return;
        }
        self.index -= 1;
        if self.index < self.offset {
            self.offset = self.index;
        }
    }

    fn next_page(&mut self) {
        let next = self.offset + self.limit;
        if next >= self.filtered.len() {
            return;
        }
        self.offset = next;
        self.index = next;
    }

    fn prev_page(&mut self) {
        self.offset = self.offset.saturating_sub(self.limit);
        self.index = self.offset;
    }

    pub fn render(&mut self, terminal: &mut Terminal) -> Result<(), DeviceError> {
        if !self.dirty {
            return Ok(());
        }
        self.dirty = false;

        let size = terminal.size()?;
        let cols = usize::from(size.cols);
        self.limit = usize::from(size.rows).saturating_sub(HEADER_ROWS).max(1);
        if self.index >= self.offset + self.limit {
            self.offset = self.index + 1 - self.limit;
        }

        terminal.clear()?;
        terminal.queue(SetAttribute(Attribute::Bold))?;
        terminal.queue(Print(TITLE))?;
        terminal.queue(SetAttribute(Attribute::Reset))?;

        let status = match &self.draft {
            Some(draft) => format!("Search (enter to apply): {draft}"),
            None if !self.filter.is_empty() => format!("Search (r: reset): {}", self.filter),
            None => HELP.to_owned(),
        };
        terminal.queue(MoveTo(0, 1))?;
        terminal.queue(Print(clip_to_width(&status, cols)))?;

        let visible = self
            .filtered
            .iter()
            .enumerate()
            .skip(self.offset)
            .take(self.limit);
        for (row, (index, &position)) in visible.enumerate() {
            let source = &self.catalog[position];
            let mark = if self.chosen.contains(&position) { 'x' } else { ' ' };
            let option = format!(
                "{:3}. [{mark}] {} ({}:{})",
                index + 1,
                source.name,
                source.account_id,
                source.profile
            );
            let option = clip_with_ellipsis(&option, cols.saturating_sub(3));

            terminal.queue(MoveTo(0, (HEADER_ROWS + row) as u16))?;
            terminal.queue(Print("  "))?;
            if index == self.index {
                terminal.queue(SetAttribute(Attribute::Reverse))?;
                terminal.queue(Print(option))?;
                terminal.queue(SetAttribute(Attribute::Reset))?;
            } else {
                terminal.queue(Print(option))?;
            }
        }

        terminal.flush()
    }
}
