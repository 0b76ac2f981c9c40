use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use scannon_stream::StatsSnapshot;

const PLAIN_STATUS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
    disable_pretty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool, disable_pretty: bool) -> Self {
        Self {
            mode,
            is_tty,
            disable_pretty,
        }
    }

    pub fn from_args(ui_flag: Option<&str>, is_tty: bool, disable_pretty: bool) -> Self {
        let mode = match ui_flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        };
        Self::new(mode, is_tty, disable_pretty)
    }

    fn use_pretty(&self) -> bool {
        self.is_tty
            && match self.mode {
                UiMode::Pretty => true,
                UiMode::Auto => !self.disable_pretty,
                UiMode::Plain => false,
            }
    }

    fn spinner(message: String) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        spinner.set_draw_target(ProgressDrawTarget::stderr());
        spinner.enable_steady_tick(Duration::from_millis(120));
        let style = ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner.set_message(message);
        spinner
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.use_pretty() {
            StageGuard::new(name.to_string(), Some(Self::spinner(format!("{name}…"))))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    /// Status line for a running stream.
    pub fn live(&self, endpoint: &str) -> LiveDisplay {
        let spinner = if self.use_pretty() {
            Some(Self::spinner(format!("connecting to {endpoint}…")))
        } else {
            eprintln!("==> Stream to {}", endpoint);
            None
        };
        LiveDisplay {
            spinner,
            last_plain: None,
            last_line: String::new(),
        }
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let message = format!("✔ {} ({})", self.name, format_duration(elapsed));
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

/// Faces / documents / fps readout with a LIVE marker and the error banner.
pub struct LiveDisplay {
    spinner: Option<ProgressBar>,
    last_plain: Option<Instant>,
    last_line: String,
}

impl LiveDisplay {
    pub fn update(&mut self, stats: StatsSnapshot, live: bool, banner: Option<&str>) {
        let line = status_line(stats, live, banner);
        if let Some(spinner) = &self.spinner {
            if line != self.last_line {
                spinner.set_message(line.clone());
            }
        } else {
            let due = self
                .last_plain
                .map(|at| at.elapsed() >= PLAIN_STATUS_INTERVAL)
                .unwrap_or(true);
            if due && line != self.last_line {
                eprintln!("{line}");
                self.last_plain = Some(Instant::now());
            }
        }
        self.last_line = line;
    }

    pub fn finish(self, summary: &str) {
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(summary.to_string()),
            None => eprintln!("{summary}"),
        }
    }
}

fn status_line(stats: StatsSnapshot, live: bool, banner: Option<&str>) -> String {
    let mut line = format!(
        "faces {} | documents {} | total {} | {} fps",
        stats.faces, stats.documents, stats.total, stats.fps
    );
    if live {
        line.push_str(" | LIVE");
    }
    if let Some(banner) = banner {
        line.push_str(" | ");
        line.push_str(banner);
    }
    line
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
