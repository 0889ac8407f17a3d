use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Offset, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use logdeck::app::lock;
use logdeck::error::SubscriptionError;
use logdeck::input::{BACKSPACE, ENTER, InputEvent};
use logdeck::session::StreamStatus;
use logdeck::tty::{Terminal, WindowSize};
use logdeck::{AppState, LogEvent, LogSource, RawEvent, SharedState, Subscriber, Subscription};

/// Subscriber whose streams are fed from test-held channels.
#[derive(Default)]
struct FakeSubscriber {
    feeds: Mutex<HashMap<String, mpsc::UnboundedReceiver<Vec<RawEvent>>>>,
    subscribed: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

impl FakeSubscriber {
    fn feed(&self, source: &LogSource) -> mpsc::UnboundedSender<Vec<RawEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap().insert(source.id.clone(), rx);
        tx
    }
}

#[async_trait]
impl Subscriber for FakeSubscriber {
    async fn subscribe(
        &self,
        source: &LogSource,
    ) -> Result<Box<dyn Subscription>, SubscriptionError> {
        self.subscribed.fetch_add(1, Ordering::SeqCst);
        let rx = self.feeds.lock().unwrap().remove(&source.id);
        Ok(Box::new(FakeSubscription {
            rx,
            closed: Arc::clone(&self.closed),
        }))
    }
}

struct FakeSubscription {
    rx: Option<mpsc::UnboundedReceiver<Vec<RawEvent>>>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Subscription for FakeSubscription {
    async fn receive(&mut self) -> Result<Option<Vec<RawEvent>>, SubscriptionError> {
        match &mut self.rx {
            Some(rx) => Ok(rx.recv().await),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn source(name: &str, account: &str) -> LogSource {
    LogSource {
        name: name.to_owned(),
        id: format!("file:///{account}/{name}"),
        account_id: account.to_owned(),
        region: "local".to_owned(),
        profile: "default".to_owned(),
    }
}

fn catalog() -> Vec<LogSource> {
    vec![
        source("api.log", "a"),
        source("auth.log", "a"),
        source("worker.log", "b"),
    ]
}

fn start(subscriber: &Arc<FakeSubscriber>) -> (SharedState, TaskTracker) {
    let tracker = TaskTracker::new();
    let terminal = Terminal::headless(std::io::sink(), WindowSize::new(24, 80));
    let shared = AppState::shared(
        terminal,
        Arc::clone(subscriber) as Arc<dyn Subscriber>,
        Utc.fix(),
        CancellationToken::new(),
        tracker.clone(),
    );
    lock(&shared).catalog_loaded(catalog());
    (shared, tracker)
}

fn press(shared: &SharedState, events: &[InputEvent]) {
    let mut state = lock(shared);
    for event in events {
        assert!(state.handle_event(event.clone()));
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn select_cycle_and_return_to_selection() {
    let subscriber = Arc::new(FakeSubscriber::default());
    let (shared, tracker) = start(&subscriber);
    let sources = catalog();

    press(
        &shared,
        &[
            InputEvent::Char('j'),
            InputEvent::Char('j'),
            InputEvent::Char(' '),
            InputEvent::Char('k'),
            InputEvent::Char('k'),
            InputEvent::Char(' '),
            InputEvent::Ctrl(ENTER),
        ],
    );

    {
        let state = lock(&shared);
        let display = state.display().expect("display view");
        assert_eq!(display.sources(), [sources[0].clone(), sources[2].clone()]);
        assert_eq!(display.session_count(), 2);
        assert!(display.session(&sources[0].id).is_some());
        assert!(display.session(&sources[2].id).is_some());
        assert!(display.session(&sources[1].id).is_none());
        assert_eq!(display.foreground(), Some(&sources[0]));
    }

    eventually(|| {
        let state = lock(&shared);
        let display = state.display().expect("display view");
        display
            .sources()
            .iter()
            .all(|source| {
                display
                    .session(&source.id)
                    .is_some_and(|session| session.status() == StreamStatus::Streaming)
            })
    })
    .await;
    assert_eq!(subscriber.subscribed.load(Ordering::SeqCst), 2);

    press(&shared, &[InputEvent::Char('l')]);
    assert_eq!(
        lock(&shared).display().and_then(|d| d.foreground().cloned()),
        Some(sources[2].clone())
    );
    press(&shared, &[InputEvent::Char('l')]);
    assert_eq!(
        lock(&shared).display().and_then(|d| d.foreground().cloned()),
        Some(sources[0].clone())
    );

    press(&shared, &[InputEvent::Ctrl(BACKSPACE)]);
    tracker.close();
    tokio::time::timeout(Duration::from_secs(5), tracker.wait())
        .await
        .expect("source tasks finish");
    assert_eq!(subscriber.closed.load(Ordering::SeqCst), 2);

    let state = lock(&shared);
    let selection = state.selection().expect("selection view");
    assert_eq!(selection.chosen(), vec![sources[0].clone(), sources[2].clone()]);
    assert_eq!(selection.catalog(), sources.as_slice());
}

#[tokio::test]
async fn live_buffer_keeps_the_latest_thousand_events() {
    let subscriber = Arc::new(FakeSubscriber::default());
    let sources = catalog();
    let feed = subscriber.feed(&sources[1]);
    let (shared, _tracker) = start(&subscriber);

    press(
        &shared,
        &[
            InputEvent::Char('j'),
            InputEvent::Char(' '),
            InputEvent::Ctrl(ENTER),
        ],
    );

    for seq in 1..=1500 {
        feed.send(vec![RawEvent {
            timestamp_millis: seq,
            message: format!("event {seq}"),
        }])
        .unwrap();
    }

    let id = sources[1].id.clone();
    eventually(|| {
        lock(&shared)
            .display()
            .and_then(|display| display.session(&id))
            .and_then(|session| session.buffer().iter().last())
            .is_some_and(|event| event.message() == "event 1500")
    })
    .await;

    let state = lock(&shared);
    let session = state.display().and_then(|d| d.session(&id)).unwrap();
    let messages = session
        .buffer()
        .iter()
        .map(LogEvent::message)
        .collect::<Vec<_>>();
    let expected = (501..=1500).map(|seq| format!("event {seq}")).collect::<Vec<_>>();
    assert_eq!(messages, expected);
    assert!(session.is_live());
}
