use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Controls how step output is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Spinners + ring-buffer logs, clear logs on completion.
    Normal,
    /// Like Normal but keeps log lines after step completion.
    Verbose,
    /// Spinners only, no log lines.
    Quiet,
    /// No ANSI, plain println output (for piped/non-TTY).
    Plain,
    /// Nothing at all. Used by tests.
    Silent,
}

/// Orchestrates numbered provisioning steps with spinners and checkmarks.
pub struct StepProgress {
    multi: MultiProgress,
    total_steps: usize,
    current_step: usize,
    mode: OutputMode,
}

/// Shared state between `Step` and `StepProgress::run()`.
///
/// The closure may drop `Step` before the future completes, so `run()`
/// keeps its own `Arc` clone to finalize the bar regardless.
struct StepState {
    log_lines: VecDeque<String>,
    done_label: Option<String>,
}

/// Handle passed into the step closure for logging during execution.
///
/// Log lines are encoded as extra lines in the spinner bar's message
/// (multi-line `ProgressBar`) instead of separate bars, which keeps
/// indicatif's terminal line count accurate on redraw.
pub struct Step {
    bar: ProgressBar,
    state: Arc<Mutex<StepState>>,
    label: String,
    mode: OutputMode,
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] {spinner:.cyan} {msg}")
        .expect("valid spinner template")
}

fn done_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] \u{2713} {msg:.green}")
        .expect("valid done template")
}

fn failed_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] \u{2717} {msg:.red}")
        .expect("valid failed template")
}

const MAX_LOG_LINES: usize = 10;

impl StepProgress {
    pub fn new(total_steps: usize, mode: OutputMode) -> Self {
        let multi = if matches!(mode, OutputMode::Plain | OutputMode::Silent) {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        Self {
            multi,
            total_steps,
            current_step: 0,
            mode,
        }
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Run a fallible async task as a numbered step.
    ///
    /// Shows a spinner while running, then a checkmark on `Ok` or a cross
    /// on `Err`. Finalization happens here, not in `Step::drop`, so steps
    /// that never capture the handle still get the right transition.
    pub async fn run<F, Fut, T, E>(&mut self, label: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(Step) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.current_step += 1;
        let prefix = format!("{}/{}", self.current_step, self.total_steps);

        if self.mode == OutputMode::Plain {
            println!("[{prefix}] {label}");
        }

        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style());
        bar.set_prefix(prefix.clone());
        bar.set_message(label.to_string());
        if !matches!(self.mode, OutputMode::Plain | OutputMode::Silent) {
            bar.enable_steady_tick(std::time::Duration::from_millis(80));
        }

        let state = Arc::new(Mutex::new(StepState {
            log_lines: VecDeque::new(),
            done_label: None,
        }));

        let step = Step {
            bar: bar.clone(),
            state: state.clone(),
            label: label.to_string(),
            mode: self.mode,
        };

        let result = f(step).await;

        let st = state.lock().unwrap();

        // Verbose keeps the step's log lines above the managed area.
        if self.mode == OutputMode::Verbose {
            for line in &st.log_lines {
                self.multi.println(format!("        {line}")).ok();
            }
        }

        let done_label = st
            .done_label
            .clone()
            .unwrap_or_else(|| label.to_string());
        drop(st);

        let (mark, style) = if result.is_ok() {
            ('\u{2713}', done_style())
        } else {
            ('\u{2717}', failed_style())
        };

        if self.mode == OutputMode::Plain {
            println!("[{prefix}] {mark} {done_label}");
        }

        // Collapses the bar from label + log lines back to one line.
        bar.set_style(style);
        bar.finish_with_message(done_label);

        result
    }

    /// Print an info line.
    pub fn info(&self, text: &str) {
        match self.mode {
            OutputMode::Silent => {}
            OutputMode::Plain => println!("      \u{2192} {text}"),
            _ => {
                self.multi.println(format!("      \u{2192} {text}")).ok();
            }
        }
    }

    /// Print a plain line via multi.println (final messages).
    pub fn println(&self, text: &str) {
        match self.mode {
            OutputMode::Silent => {}
            OutputMode::Plain => println!("{text}"),
            _ => {
                self.multi.println(text).ok();
            }
        }
    }
}

impl Step {
    /// Add a log line under this step (ring buffer of ~10).
    pub fn log(&self, line: &str) {
        match self.mode {
            OutputMode::Quiet | OutputMode::Silent => return,
            OutputMode::Plain => {
                for sub in line.split('\n') {
                    println!("        {sub}");
                }
                return;
            }
            OutputMode::Normal | OutputMode::Verbose => {}
        }

        let mut state = self.state.lock().unwrap();

        // One ring-buffer entry per visual line.
        for sub in line.split('\n') {
            if state.log_lines.len() >= MAX_LOG_LINES {
                state.log_lines.pop_front();
            }
            state.log_lines.push_back(sub.to_string());
        }

        let mut msg = self.label.clone();
        for log_line in &state.log_lines {
            msg.push_str("\n        ");
            msg.push_str(log_line);
        }
        self.bar.set_message(msg);
    }

    /// Override the completion label shown with the checkmark.
    pub fn set_done_label(&self, label: impl Into<String>) {
        self.state.lock().unwrap().done_label = Some(label.into());
    }
}
