//! Application driver: the state behind the single lock plus the tasks that
//! read input, paint frames, load the catalog and watch for signals.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::FixedOffset;
use log::{debug, error, info, warn};
use tokio::io::AsyncRead;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::DeviceError;
use crate::input::{CTRL_C, InputDecoder, InputEvent};
use crate::screen::{DisplayView, Flow, InitContext, LoadingView, Screen, SelectionView};
use crate::session::{SessionHost, SessionMap};
use crate::source::{Catalog, LogSource, Subscriber};
use crate::tty::{RuneReader, TTY_PATH, Terminal, WindowSize, cursor_position};

pub const FRAME_RATE: u32 = 30;
/// How long shutdown waits for source tasks to close their subscriptions.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub type SharedState = Arc<Mutex<AppState>>;

/// Takes the single state lock. A poisoned lock is still usable so the
/// terminal can always be restored.
pub fn lock(shared: &Mutex<AppState>) -> MutexGuard<'_, AppState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything the input, render and source tasks share.
pub struct AppState {
    this: Weak<Mutex<AppState>>,
    terminal: Terminal,
    screen: Screen,
    catalog: Vec<LogSource>,
    subscriber: Arc<dyn Subscriber>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    utc_offset: FixedOffset,
    generation: u64,
    last_size: Option<WindowSize>,
}

impl AppState {
    pub fn shared(
        terminal: Terminal,
        subscriber: Arc<dyn Subscriber>,
        utc_offset: FixedOffset,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> SharedState {
        Arc::new_cyclic(|this| {
            Mutex::new(Self {
                this: this.clone(),
                terminal,
                screen: Screen::Loading(LoadingView::new(Instant::now())),
                catalog: Vec::new(),
                subscriber,
                tracker,
                cancel,
                utc_offset,
                generation: 0,
                last_size: None,
            })
        })
    }

    pub fn screen(&self) -> &Screen {
        &self.screen
    }

    pub fn selection(&self) -> Option<&SelectionView> {
        match &self.screen {
            Screen::Selection(view) => Some(view),
            _ => None,
        }
    }

    pub fn display(&self) -> Option<&DisplayView> {
        match &self.screen {
            Screen::Display(view) => Some(view),
            _ => None,
        }
    }

    pub fn terminal(&self) -> &Terminal {
        &self.terminal
    }

    pub fn terminal_mut(&mut self) -> &mut Terminal {
        &mut self.terminal
    }

    /// Leaves the loading screen for source selection.
    pub fn catalog_loaded(&mut self, sources: Vec<LogSource>) {
        info!("catalog loaded with {} sources", sources.len());
        self.catalog = sources;
        self.show_selection(&[]);
    }

    /// Routes one input event to the active view. Returns `false` once the
    /// app should quit.
    pub fn handle_event(&mut self, event: InputEvent) -> bool {
        let flow = match event {
            InputEvent::Ctrl(CTRL_C) => Flow::Quit,
            InputEvent::Char(key) | InputEvent::Ctrl(key) => self.screen.handle_key(key),
            InputEvent::Escape => self.screen.handle_escape(),
            InputEvent::Sequence(sequence) => self.screen.handle_control(&sequence),
            InputEvent::Mouse(mouse) => self.screen.handle_mouse(mouse),
        };
        self.apply(flow)
    }

    fn apply(&mut self, flow: Flow) -> bool {
        match flow {
            Flow::Continue => true,
            Flow::Quit => false,
            Flow::Select(chosen) => {
                self.show_selection(&chosen);
                true
            }
            Flow::Display(sources) => {
                self.show_display(sources);
                true
            }
        }
    }

    fn show_selection(&mut self, chosen: &[LogSource]) {
        let view = SelectionView::new(self.catalog.clone(), chosen);
        self.switch_to(Screen::Selection(view));
        if let Err(err) = self.terminal.enable_mouse() {
            warn!("failed to enable mouse reporting: {err}");
        }
    }

    fn show_display(&mut self, sources: Vec<LogSource>) {
        self.generation += 1;
        let mut view = DisplayView::new(sources, self.generation, &self.cancel);
        match self.terminal.size() {
            Ok(size) => view.resize(size),
            Err(err) => warn!("terminal size unavailable: {err}"),
        }
        let mut screen = Screen::Display(view);
        screen.init(&InitContext {
            host: self.this.clone(),
            subscriber: Arc::clone(&self.subscriber),
            tracker: self.tracker.clone(),
            utc_offset: self.utc_offset,
        });
        self.switch_to(screen);
    }

    fn switch_to(&mut self, screen: Screen) {
        info!("screen {} -> {}", self.screen.name(), screen.name());
        self.screen = screen;
    }

    /// Paints one frame. Does nothing once shutdown has begun.
    pub fn render(&mut self) -> Result<(), DeviceError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let size = self.terminal.size()?;
        if self.last_size != Some(size) {
            debug!("terminal is {}x{}", size.cols, size.rows);
            self.last_size = Some(size);
            self.screen.invalidate();
        }
        self.screen.render(&mut self.terminal)
    }

    /// Stops every source task of the current view and restores the terminal.
    pub fn shutdown(&mut self) -> Result<(), DeviceError> {
        if let Screen::Display(view) = &mut self.screen {
            view.close();
        }
        self.terminal.close()
    }
}

impl SessionHost for AppState {
    fn sessions(&mut self, generation: u64) -> Option<&mut SessionMap> {
        match &mut self.screen {
            Screen::Display(view) => view.sessions(generation),
            _ => None,
        }
    }
}

/// Collaborators and settings the app runs with.
pub struct AppConfig {
    pub catalog: Arc<dyn Catalog>,
    pub subscriber: Arc<dyn Subscriber>,
    pub excluded_profiles: Vec<String>,
    pub utc_offset: FixedOffset,
}

/// Byte stream the input task decodes.
pub type InputStream = Box<dyn AsyncRead + Unpin + Send>;

pub struct App {
    shared: SharedState,
    decoder: InputDecoder<InputStream>,
    catalog: Arc<dyn Catalog>,
    excluded_profiles: Vec<String>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl App {
    /// Takes over the controlling terminal and shows the loading screen.
    pub async fn open(config: AppConfig) -> anyhow::Result<Self> {
        let (mut terminal, input) = Terminal::open(TTY_PATH).context("opening the terminal")?;
        let mut reader = RuneReader::new(Box::new(input) as InputStream);
        match cursor_position(&mut terminal, &mut reader).await {
            Ok((row, col)) => debug!("cursor started at row {row}, column {col}"),
            Err(err) => debug!("cursor position unavailable: {err}"),
        }
        Self::with_terminal(terminal, reader, config)
    }

    /// Runs on an already opened terminal that reads from `input`.
    pub fn with_terminal(
        mut terminal: Terminal,
        input: RuneReader<InputStream>,
        config: AppConfig,
    ) -> anyhow::Result<Self> {
        terminal.enable_alt()?;
        terminal.hide_cursor()?;
        terminal.enable_mouse()?;
        terminal.clear()?;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let shared = AppState::shared(
            terminal,
            config.subscriber,
            config.utc_offset,
            cancel.clone(),
            tracker.clone(),
        );

        Ok(Self {
            shared,
            decoder: InputDecoder::new(input),
            catalog: config.catalog,
            excluded_profiles: config.excluded_profiles,
            cancel,
            tracker,
        })
    }

    pub fn shared(&self) -> SharedState {
        Arc::clone(&self.shared)
    }

    /// Runs until the operator quits, a signal arrives or a task fails. The
    /// terminal is restored before any error is returned.
    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            shared,
            decoder,
            catalog,
            excluded_profiles,
            cancel,
            tracker,
        } = self;

        let mut tasks = JoinSet::new();
        tasks.spawn(read_input(Arc::clone(&shared), decoder, cancel.clone()));
        tasks.spawn(render_frames(Arc::clone(&shared), cancel.clone()));
        tasks.spawn(load_catalog(
            Arc::clone(&shared),
            catalog,
            excluded_profiles,
            cancel.clone(),
        ));
        tasks.spawn(watch_signals(cancel.clone()));

        let mut outcome = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(err) if err.is_panic() => {
                    Err(anyhow!("fault: {}", panic_message(err.into_panic())))
                }
                Err(err) => Err(err.into()),
            };
            if let Err(err) = result {
                error!("{err:#}");
                cancel.cancel();
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }

        tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait())
            .await
            .is_err()
        {
            warn!("{} source tasks still running at shutdown", tracker.len());
        }

        let restored = lock(&shared).shutdown();
        outcome?;
        restored.context("restoring the terminal")?;
        info!("shut down cleanly");
        Ok(())
    }
}

async fn read_input<R>(
    shared: SharedState,
    mut decoder: InputDecoder<R>,
    cancel: CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let _quit = cancel.clone().drop_guard();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = decoder.next_event() => event.context("reading terminal input")?,
        };
        if !lock(&shared).handle_event(event) {
            info!("quit requested");
            return Ok(());
        }
    }
}

async fn render_frames(shared: SharedState, cancel: CancellationToken) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(1) / FRAME_RATE);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        lock(&shared).render().context("drawing a frame")?;
    }
}

async fn load_catalog(
    shared: SharedState,
    catalog: Arc<dyn Catalog>,
    excluded_profiles: Vec<String>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let sources = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        sources = catalog.list_sources(&excluded_profiles) => sources?,
    };
    lock(&shared).catalog_loaded(sources);
    Ok(())
}

async fn watch_signals(cancel: CancellationToken) -> anyhow::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    let name = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
    };
    info!("received {name}, shutting down");
    cancel.cancel();
    Ok(())
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
