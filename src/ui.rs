use anyhow::{anyhow, Result};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use activity_audit::ProgressStore;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

/// Stderr feedback for the command-line tools.
#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
    disable_pretty: bool,
}

impl Ui {
    pub fn from_args(ui_flag: Option<&str>, is_tty: bool, disable_pretty: bool) -> Self {
        let mode = match ui_flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        };
        Self {
            mode,
            is_tty,
            disable_pretty,
        }
    }

    fn pretty(&self) -> bool {
        self.is_tty
            && match self.mode {
                UiMode::Pretty => true,
                UiMode::Auto => !self.disable_pretty,
                UiMode::Plain => false,
            }
    }

    /// A named step that reports its duration when dropped.
    pub fn stage(&self, name: &str) -> StageGuard {
        if self.pretty() {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    /// Waits for `job`, rendering the progress entry `process_id` meanwhile.
    pub fn follow<T>(
        &self,
        progress: &dyn ProgressStore,
        process_id: &str,
        job: JoinHandle<Result<T>>,
    ) -> Result<T> {
        let started = Instant::now();
        let bar = if self.pretty() {
            let bar = ProgressBar::new(100);
            bar.set_draw_target(ProgressDrawTarget::stderr());
            let style = ProgressStyle::with_template("{bar:30} {pos:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            Some(bar)
        } else {
            None
        };

        let mut last_step = String::new();
        while !job.is_finished() {
            if let Ok(Some(snapshot)) = progress.get(process_id) {
                match &bar {
                    Some(bar) => {
                        bar.set_position(u64::from(snapshot.percentage));
                        bar.set_message(snapshot.current_step.clone());
                    }
                    None if snapshot.current_step != last_step => {
                        eprintln!("[{:>3}%] {}", snapshot.percentage, snapshot.current_step);
                    }
                    None => {}
                }
                last_step = snapshot.current_step;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        let outcome = job
            .join()
            .map_err(|_| anyhow!("comparison thread panicked"))?;
        let summary = match &outcome {
            Ok(_) => format!("✔ comparison finished ({})", format_duration(started.elapsed())),
            Err(_) => format!("✘ comparison failed ({})", format_duration(started.elapsed())),
        };
        match bar {
            Some(bar) => {
                if outcome.is_ok() {
                    bar.set_position(100);
                }
                bar.finish_with_message(summary);
            }
            None => eprintln!("{summary}"),
        }
        outcome
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
        let message = format!("✔ {} ({})", self.name, format_duration(self.start.elapsed()));
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
