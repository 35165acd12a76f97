use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

/// How stderr progress is rendered by the command-line tools.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    fn parse(flag: Option<&str>) -> Self {
        match flag.map(|f| f.trim().to_ascii_lowercase()).as_deref() {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Ui {
    pretty: bool,
}

impl Ui {
    /// `piped` is true when stdout is not a terminal; auto mode then stays plain
    /// so spinners do not interleave with report output.
    pub fn from_args(ui_flag: Option<&str>, is_tty: bool, piped: bool) -> Self {
        let pretty = is_tty
            && match UiMode::parse(ui_flag) {
                UiMode::Pretty => true,
                UiMode::Auto => !piped,
                UiMode::Plain => false,
            };
        Self { pretty }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        let spinner = if self.pretty {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            Some(spinner)
        } else {
            eprintln!("==> {}", name);
            None
        };
        StageGuard {
            name: name.to_string(),
            start: Instant::now(),
            spinner,
            rows: None,
        }
    }

    /// A stage that counts rows as they are written.
    pub fn rows(&self, name: &str, total: u64) -> StageGuard {
        if !self.pretty {
            eprintln!("==> {} ({} rows)", name, total);
            return StageGuard {
                name: name.to_string(),
                start: Instant::now(),
                spinner: None,
                rows: Some(total),
            };
        }
        let bar = ProgressBar::new(total);
        bar.set_draw_target(ProgressDrawTarget::stderr());
        let style = ProgressStyle::with_template("{msg} [{bar:30}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message(name.to_string());
        StageGuard {
            name: name.to_string(),
            start: Instant::now(),
            spinner: Some(bar),
            rows: Some(total),
        }
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
    rows: Option<u64>,
}

impl StageGuard {
    pub fn inc(&self, n: u64) {
        if let Some(bar) = &self.spinner {
            bar.inc(n);
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let elapsed = format_duration(self.start.elapsed());
        let message = match self.rows {
            Some(rows) => format!("✔ {} ({} rows, {})", self.name, rows, elapsed),
            None => format!("✔ {} ({})", self.name, elapsed),
        };
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
