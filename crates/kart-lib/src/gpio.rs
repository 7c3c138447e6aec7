//! Physical buttons: sample GPIO lines, debounce, trigger slot announcements.
//!
//! Each line gets its own sampler thread that polls the level and feeds a
//! [`Debouncer`]. Confirmed presses are sent to the async monitor, which asks
//! the [`Announcer`] for the bound slot. A press that arrives while something
//! is playing is refused by the coordinator and logged.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use kart_core::debounce::{Activation, Debouncer, Level};
use kart_core::types::Source;

use crate::announcer::Announcer;
use crate::config::ButtonSettings;
use crate::error::{AnnounceError, ButtonError};

/// How often the config file is checked for edits.
pub const CONFIG_POLL: Duration = Duration::from_secs(10);

/// Raw level source for one input line.
pub trait LineReader: Send {
    /// `true` when the line is electrically high.
    fn read(&mut self) -> std::io::Result<bool>;
}

// ─── sysfs ─────────────────────────────────────────────────────────────────

/// A line exported through the legacy `/sys/class/gpio` interface.
#[derive(Debug)]
pub struct SysfsLine {
    value: PathBuf,
}

impl SysfsLine {
    /// Export `line` under `root` if needed and configure it as an input.
    pub fn open(root: &Path, line: u32) -> std::io::Result<Self> {
        let dir = root.join(format!("gpio{line}"));
        if !dir.exists() {
            match std::fs::write(root.join("export"), line.to_string()) {
                Ok(()) => {}
                // Already exported by someone else.
                Err(e) if e.kind() == ErrorKind::ResourceBusy => {}
                Err(e) => return Err(e),
            }
        }
        std::fs::write(dir.join("direction"), "in")?;
        debug!("gpio: line {line} ready at {}", dir.display());
        Ok(Self {
            value: dir.join("value"),
        })
    }
}

impl LineReader for SysfsLine {
    fn read(&mut self) -> std::io::Result<bool> {
        Ok(std::fs::read_to_string(&self.value)?.trim() == "1")
    }
}

fn sample_line(
    mut reader: Box<dyn LineReader>,
    mut debouncer: Debouncer,
    active_low: bool,
    poll: Duration,
    tx: mpsc::Sender<Activation>,
    stop: Arc<AtomicBool>,
) {
    let mut failing = false;
    while !stop.load(Ordering::SeqCst) {
        match reader.read() {
            Ok(high) => {
                if failing {
                    info!("gpio: {} readable again", debouncer.slot());
                    failing = false;
                }
                let level = Level::from_raw(high, active_low);
                if let Some(activation) = debouncer.observe(level, Instant::now()) {
                    if tx.blocking_send(activation).is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                if !failing {
                    warn!("gpio: failed to read {}: {e}", debouncer.slot());
                    failing = true;
                }
            }
        }
        std::thread::sleep(poll);
    }
    debug!(
        "gpio: sampler for {} stopped ({:?})",
        debouncer.slot(),
        debouncer.state()
    );
}

// ─── Monitor ───────────────────────────────────────────────────────────────

pub struct ButtonMonitor {
    announcer: Announcer,
    settings: ButtonSettings,
    lines: Vec<(String, Box<dyn LineReader>)>,
    reload_every: Duration,
}

impl ButtonMonitor {
    /// Open every configured button line through sysfs.
    pub fn from_config(announcer: Announcer) -> Result<Self, ButtonError> {
        let config = announcer.config().snapshot();
        let wiring = config.button_lines();
        if wiring.is_empty() {
            return Err(ButtonError::NoButtons);
        }
        let mut lines: Vec<(String, Box<dyn LineReader>)> = Vec::with_capacity(wiring.len());
        for (slot, line) in wiring {
            let reader = SysfsLine::open(&config.buttons.gpio_root, line)
                .map_err(|source| ButtonError::Line { line, source })?;
            info!("gpio: {slot} on line {line}");
            lines.push((slot, Box::new(reader)));
        }
        Ok(Self::with_lines(announcer, config.buttons, lines))
    }

    pub fn with_lines(
        announcer: Announcer,
        settings: ButtonSettings,
        lines: Vec<(String, Box<dyn LineReader>)>,
    ) -> Self {
        Self {
            announcer,
            settings,
            lines,
            reload_every: CONFIG_POLL,
        }
    }

    pub fn reload_every(mut self, interval: Duration) -> Self {
        self.reload_every = interval;
        self
    }

    /// Handle presses until `shutdown` resolves. Pre-generation and config
    /// polling run as their own tasks so a slow provider never holds up a
    /// press.
    pub async fn run(
        self,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<(), ButtonError> {
        let Self {
            announcer,
            settings,
            lines,
            reload_every,
        } = self;

        let (tx, mut rx) = mpsc::channel::<Activation>(16);
        let stop = Arc::new(AtomicBool::new(false));
        let timing = settings.timing();
        for (slot, reader) in lines {
            let debouncer = Debouncer::new(slot.clone(), timing);
            let tx = tx.clone();
            let stop = stop.clone();
            let active_low = settings.active_low;
            let poll = settings.poll_interval();
            std::thread::Builder::new()
                .name(format!("kart-gpio-{slot}"))
                .spawn(move || sample_line(reader, debouncer, active_low, poll, tx, stop))
                .map_err(|source| ButtonError::Sampler { slot, source })?;
        }
        drop(tx);
        info!("gpio: monitoring buttons");

        let warm = announcer.clone();
        tokio::spawn(async move {
            let ready = warm.warm().await;
            debug!("gpio: {ready} slot(s) pre-generated");
        });
        let watcher = tokio::spawn(watch_config(announcer.clone(), reload_every));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                activation = rx.recv() => {
                    let Some(activation) = activation else {
                        warn!("gpio: all samplers stopped");
                        break;
                    };
                    dispatch(&announcer, activation);
                }
                _ = &mut shutdown => break,
            }
        }

        watcher.abort();
        stop.store(true, Ordering::SeqCst);
        info!("gpio: monitor stopped");
        Ok(())
    }
}

fn dispatch(announcer: &Announcer, activation: Activation) {
    let announcer = announcer.clone();
    tokio::spawn(async move {
        let slot = activation.slot;
        info!("gpio: {slot} pressed");
        match announcer.announce_slot(Source::Button(slot.clone()), &slot).await {
            Ok(admitted) => {
                debug!("gpio: {slot} admitted for ~{:.1}s", admitted.estimated.as_secs_f64());
            }
            Err(AnnounceError::AlreadyPlaying { seconds_remaining, .. }) => {
                info!("gpio: {slot} ignored, announcement busy for {seconds_remaining:.1}s");
            }
            Err(e) => error!("gpio: {slot} failed: {e}"),
        }
    });
}

/// Poll the config file until aborted. Re-warming after an edit happens
/// here, off the press path.
async fn watch_config(announcer: Announcer, every: Duration) {
    let mut reload = tokio::time::interval(every);
    reload.tick().await;
    loop {
        reload.tick().await;
        let before = announcer.config().snapshot().button_lines();
        match announcer.reload_config().await {
            Ok(true) => {
                if announcer.config().snapshot().button_lines() != before {
                    warn!("gpio: button wiring changed; restart to apply");
                }
            }
            Ok(false) => {}
            Err(e) => error!("config: reload failed, keeping previous: {e}"),
        }
    }
}
