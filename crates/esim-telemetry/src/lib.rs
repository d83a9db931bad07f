//! Appends bus events to a JSON-lines log on a background writer thread.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use esim_core::{Event, EventBus, Subscription};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

const EVENT_QUEUE_CAPACITY: usize = 256;
const MAX_EVENT_BYTES: u64 = 2 * 1024 * 1024;
const EVENTS_FILE: &str = "events.jsonl";

#[derive(Serialize)]
struct EventRecord {
    at_unix_millis: i64,
    app: String,
    session_id: String,
    #[serde(flatten)]
    event: Event,
}

/// Bus subscriber persisting every event. Dropping it stops recording;
/// [`finish`](Self::finish) also waits for queued lines to land on disk.
pub struct EventRecorder {
    subscription: Option<Subscription>,
    writer: Option<JoinHandle<()>>,
    path: PathBuf,
    dropped: Arc<AtomicU64>,
}

impl EventRecorder {
    /// Records under `<data_dir>/events/<app_name>/`.
    pub fn start(bus: &EventBus, app_name: &str) -> Self {
        Self::start_in(bus, app_name, &esim_util::data_dir())
    }

    pub fn start_in(bus: &EventBus, app_name: &str, root: &Path) -> Self {
        let dir = root.join("events").join(app_name);
        let path = dir.join(EVENTS_FILE);
        let (sender, receiver) = sync_channel::<EventRecord>(EVENT_QUEUE_CAPACITY);
        let writer = start_writer_thread(dir, receiver);

        let dropped = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&dropped);
        let app = app_name.to_string();
        let session_id = Uuid::new_v4().to_string();
        let subscription = bus.subscribe(move |event| {
            let record = EventRecord {
                at_unix_millis: esim_util::now_millis(),
                app: app.clone(),
                session_id: session_id.clone(),
                event: event.clone(),
            };
            match sender.try_send(record) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        });

        Self {
            subscription: Some(subscription),
            writer: Some(writer),
            path,
            dropped,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Events discarded because the writer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Unsubscribes and blocks until the writer has flushed its queue.
    pub fn finish(mut self) {
        self.subscription.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("event writer thread panicked");
            }
        }
    }
}

impl Drop for EventRecorder {
    fn drop(&mut self) {
        self.subscription.take();
    }
}

fn start_writer_thread(dir: PathBuf, receiver: Receiver<EventRecord>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while let Ok(record) = receiver.recv() {
            if let Err(err) = write_record(&dir, &record) {
                warn!("failed to record event under {}: {err}", dir.display());
            }
        }
    })
}

fn write_record(dir: &Path, record: &EventRecord) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let path = dir.join(EVENTS_FILE);
    rotate_if_needed(&path, MAX_EVENT_BYTES)?;

    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    let line = serde_json::to_string(record).map_err(io::Error::other)?;
    writeln!(file, "{line}")
}

fn rotate_if_needed(path: &Path, max_bytes: u64) -> io::Result<()> {
    if let Ok(meta) = fs::metadata(path) {
        if meta.len() >= max_bytes {
            let rotated = path.with_extension("jsonl.1");
            let _ = fs::remove_file(&rotated);
            fs::rename(path, rotated)?;
        }
    }
    Ok(())
}
