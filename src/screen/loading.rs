use crossterm::style::Print;
use tokio::time::Instant;

use crate::error::DeviceError;
use crate::tty::Terminal;

/// Animated placeholder shown while the catalog loads.
#[derive(Debug)]
pub struct LoadingView {
    started: Instant,
    drawn_phase: Option<u64>,
}

impl LoadingView {
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            drawn_phase: None,
        }
    }

    pub fn invalidate(&mut self) {
        self.drawn_phase = None;
    }

    pub fn render(&mut self, terminal: &mut Terminal) -> Result<(), DeviceError> {
        let phase = self.started.elapsed().as_secs() % 3;
        if self.drawn_phase == Some(phase) {
            return Ok(());
        }
        self.drawn_phase = Some(phase);

        terminal.clear()?;
        let dots = ".".repeat(phase as usize + 1);
        terminal.queue(Print(format!("Loading{dots}")))?;
        terminal.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::LoadingView;
    use crate::tty::testing::Capture;
    use crate::tty::{Terminal, WindowSize};

    #[tokio::test(start_paused = true)]
    async fn dots_advance_once_per_second() {
        let capture = Capture::default();
        let mut terminal = Terminal::headless(capture.clone(), WindowSize::new(24, 80));
        let mut view = LoadingView::new(Instant::now());

        view.render(&mut terminal).unwrap();
        assert_eq!(capture.take(), "\x1b[2J\x1b[HLoading.");

        view.render(&mut terminal).unwrap();
        assert_eq!(capture.take(), "");

        tokio::time::advance(Duration::from_secs(1)).await;
        view.render(&mut terminal).unwrap();
        assert!(capture.take().ends_with("Loading.."));

        tokio::time::advance(Duration::from_secs(2)).await;
        view.render(&mut terminal).unwrap();
        assert!(capture.take().ends_with("Loading."));

        view.invalidate();
        view.render(&mut terminal).unwrap();
        assert!(capture.take().ends_with("Loading."));
    }
}
