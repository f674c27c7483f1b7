//! Leaf/group progress reporting for deploy runs.
//!
//! Long-running steps render as spinners; everything degrades to plain lines
//! when stderr is not a terminal (CI) or when running under tests.

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

static MULTI: OnceLock<MultiProgress> = OnceLock::new();

fn multi() -> &'static MultiProgress {
    MULTI.get_or_init(MultiProgress::new)
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner} {wide_msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub struct ProgressTracker {}

impl ProgressTracker {
    /// Prints a line above any active spinners.
    pub fn println(msg: impl AsRef<str>) {
        let _ = multi().println(msg.as_ref());
    }

    pub fn eprintln(msg: impl AsRef<str>) {
        let _ = multi().println(msg.as_ref());
    }

    /// Runs `future` under a spinner labeled `name`, clearing it on completion.
    pub async fn leaf<T, F: Future<Output = T>>(name: impl Into<String>, future: F) -> T {
        let bar = multi().add(ProgressBar::new_spinner());
        bar.set_style(spinner_style());
        bar.set_message(name.into());
        bar.enable_steady_tick(Duration::from_millis(100));
        let out = future.await;
        bar.finish_and_clear();
        out
    }

    /// Runs `thunk` with every line it prints prefixed by `group`.
    pub async fn with_group<T, F: Future<Output = T>>(
        group: impl Into<String>,
        thunk: impl FnOnce() -> F,
    ) -> T {
        let group = group.into();
        Self::println(format!("[{group}]"));
        thunk().await
    }

    /// A numbered step line, shipit-style.
    pub fn step(host: &str, n: usize, total: usize, msg: &str) {
        Self::println(format!("[{host}] ({n}/{total}) {msg}"));
    }
}
