//! Out-of-band progress reporting for long storage operations.
//!
//! Protocol code never prints; it calls into an injected reporter so the
//! transfer loops stay free of terminal concerns.

use indicatif::{ProgressBar, ProgressStyle};

pub trait ProgressReporter {
    fn start(&mut self, total: u64);
    fn advance(&mut self, done: u64);
    fn finish(&mut self) {}
}

/// No-op reporter for library use and tests.
#[derive(Default)]
pub struct Silent;

impl ProgressReporter for Silent {
    fn start(&mut self, _total: u64) {}

    fn advance(&mut self, _done: u64) {}
}

/// Terminal progress bar.
#[derive(Default)]
pub struct Console {
    bar: Option<ProgressBar>,
}

impl ProgressReporter for Console {
    fn start(&mut self, total: u64) {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template(
                "{bar:50} {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        self.bar = Some(bar);
    }

    fn advance(&mut self, done: u64) {
        if let Some(bar) = &self.bar {
            bar.set_position(done);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
