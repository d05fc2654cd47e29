//! Download progress reporting

use crate::image::oci::short_digest;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// Number of increments a transfer of known length is divided into
pub const PROGRESS_STEPS: u64 = 50;

/// Receives progress for a single blob transfer
pub trait BlobProgress: Send {
    /// The transfer started; `total` is the advertised length, if any
    fn start(&mut self, total: Option<u64>);

    /// `steps` out of [`PROGRESS_STEPS`] are complete
    fn update(&mut self, steps: u64);

    /// Bytes arrived on a transfer of unknown length
    fn tick(&mut self) {}

    /// Switch to a new phase (e.g. extracting)
    fn message(&mut self, msg: &str);

    fn finish(&mut self, msg: &str);
}

/// Hands out one progress reporter per blob
pub trait ProgressFactory: Send + Sync {
    fn blob(&self, digest: &str) -> Box<dyn BlobProgress>;
}

/// Converts received bytes into whole progress steps
#[derive(Debug, Clone)]
pub struct StepCounter {
    total: Option<u64>,
    received: u64,
    steps: u64,
}

impl StepCounter {
    /// A zero length counts as unknown
    pub fn new(total: Option<u64>) -> Self {
        Self {
            total: total.filter(|t| *t > 0),
            received: 0,
            steps: 0,
        }
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn is_indeterminate(&self) -> bool {
        self.total.is_none()
    }

    /// Record `len` more bytes, returning the step count when it advanced
    pub fn record(&mut self, len: u64) -> Option<u64> {
        self.received += len;
        let total = self.total?;
        let steps = (self.received.saturating_mul(PROGRESS_STEPS) / total).min(PROGRESS_STEPS);
        if steps > self.steps {
            self.steps = steps;
            Some(steps)
        } else {
            None
        }
    }
}

/// Progress that goes nowhere
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl BlobProgress for NoProgress {
    fn start(&mut self, _total: Option<u64>) {}
    fn update(&mut self, _steps: u64) {}
    fn message(&mut self, _msg: &str) {}
    fn finish(&mut self, _msg: &str) {}
}

impl ProgressFactory for NoProgress {
    fn blob(&self, _digest: &str) -> Box<dyn BlobProgress> {
        Box::new(NoProgress)
    }
}

/// Docker-style progress bars on stderr
pub struct ConsoleProgress {
    multi: MultiProgress,
}

impl ConsoleProgress {
    pub fn new(visible: bool) -> Self {
        let multi = if visible {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        Self { multi }
    }
}

impl ProgressFactory for ConsoleProgress {
    fn blob(&self, digest: &str) -> Box<dyn BlobProgress> {
        let bar = self.multi.add(ProgressBar::new(PROGRESS_STEPS));
        bar.set_prefix(short_digest(digest).to_string());
        bar.set_message("Downloading");
        Box::new(ConsoleBar { bar })
    }
}

struct ConsoleBar {
    bar: ProgressBar,
}

impl BlobProgress for ConsoleBar {
    fn start(&mut self, total: Option<u64>) {
        let style = match total {
            Some(_) => ProgressStyle::with_template("{prefix}: {msg} [{bar:50}]")
                .map(|s| s.progress_chars("=> ")),
            None => ProgressStyle::with_template("{prefix}: {msg} {spinner}"),
        };
        if let Ok(style) = style {
            self.bar.set_style(style);
        }
        if total.is_none() {
            self.bar.enable_steady_tick(Duration::from_millis(120));
        }
    }

    fn update(&mut self, steps: u64) {
        self.bar.set_position(steps);
    }

    fn tick(&mut self) {
        self.bar.tick();
    }

    fn message(&mut self, msg: &str) {
        self.bar.set_message(msg.to_string());
    }

    fn finish(&mut self, msg: &str) {
        self.bar.set_position(PROGRESS_STEPS);
        self.bar.finish_with_message(msg.to_string());
    }
}
