use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Controls how per-VM progress is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Spinners + ring-buffer logs, clear logs on completion.
    Normal,
    /// Like Normal but keeps log lines after the VM's task completes.
    Verbose,
    /// Spinners only, no log lines.
    Quiet,
    /// No ANSI, `[*]` status lines (for piped/non-TTY).
    Plain,
    /// Nothing at all; used for JSON output and tests.
    Silent,
}

/// One spinner per VM inside a phase ("Booting", "Provisioning", ...).
pub struct Progress {
    multi: MultiProgress,
    mode: OutputMode,
}

struct TaskState {
    label: String,
    log_lines: VecDeque<String>,
}

/// Handle for one VM's work within a phase.
///
/// Log lines are encoded as extra lines in the spinner bar's message so the
/// `MultiProgress` never has to add or remove bars mid-phase.
pub struct Task {
    bar: ProgressBar,
    multi: MultiProgress,
    state: Arc<Mutex<TaskState>>,
    name: String,
    mode: OutputMode,
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] {spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn done_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] \u{2713} {msg:.green}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn failed_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] \u{2717} {msg:.red}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

const MAX_LOG_LINES: usize = 10;

impl Progress {
    pub fn new(mode: OutputMode) -> Self {
        let multi = match mode {
            OutputMode::Plain | OutputMode::Silent => {
                MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
            }
            _ => MultiProgress::new(),
        };
        Self { multi, mode }
    }

    pub fn silent() -> Self {
        Self::new(OutputMode::Silent)
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Announce a phase that runs one task per VM.
    pub fn phase(&self, title: &str) {
        match self.mode {
            OutputMode::Silent => {}
            OutputMode::Plain => println!("[*] {title}"),
            _ => {
                self.multi
                    .println(console::style(title).bold().to_string())
                    .ok();
            }
        }
    }

    /// Start a spinner for VM `name`.
    pub fn task(&self, name: &str, label: &str) -> Task {
        if self.mode == OutputMode::Plain {
            println!("[*] {name}: {label}");
        }

        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style());
        bar.set_prefix(name.to_string());
        bar.set_message(label.to_string());
        if matches!(self.mode, OutputMode::Normal | OutputMode::Verbose | OutputMode::Quiet) {
            bar.enable_steady_tick(std::time::Duration::from_millis(80));
        }

        Task {
            bar,
            multi: self.multi.clone(),
            state: Arc::new(Mutex::new(TaskState {
                label: label.to_string(),
                log_lines: VecDeque::new(),
            })),
            name: name.to_string(),
            mode: self.mode,
        }
    }

    /// Print an info line under the current phase.
    pub fn info(&self, text: &str) {
        match self.mode {
            OutputMode::Silent => {}
            OutputMode::Plain => println!("      \u{2192} {text}"),
            _ => {
                self.multi.println(format!("      \u{2192} {text}")).ok();
            }
        }
    }
}

impl Task {
    /// Replace the spinner label, keeping any log lines below it.
    pub fn set_label(&self, label: &str) {
        if self.mode == OutputMode::Plain {
            println!("[*] {}: {label}", self.name);
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            state.label = label.to_string();
            self.bar.set_message(render(&state));
        }
    }

    /// Add a log line under this VM (ring buffer of ~10).
    pub fn log(&self, line: &str) {
        match self.mode {
            OutputMode::Quiet | OutputMode::Silent => return,
            OutputMode::Plain => {
                for sub in line.split('\n') {
                    println!("        {sub}");
                }
                return;
            }
            _ => {}
        }

        let Ok(mut state) = self.state.lock() else {
            return;
        };
        for sub in line.split('\n') {
            if state.log_lines.len() >= MAX_LOG_LINES {
                state.log_lines.pop_front();
            }
            state.log_lines.push_back(sub.to_string());
        }
        self.bar.set_message(render(&state));
    }

    pub fn finish(&self, label: &str) {
        self.close(label, done_style(), '\u{2713}');
    }

    pub fn fail(&self, label: &str) {
        self.close(label, failed_style(), '\u{2717}');
    }

    fn close(&self, label: &str, style: ProgressStyle, mark: char) {
        if self.mode == OutputMode::Plain {
            println!("[{}] {mark} {label}", self.name);
        }
        if self.mode == OutputMode::Verbose
            && let Ok(state) = self.state.lock()
        {
            for line in &state.log_lines {
                self.multi.println(format!("        {line}")).ok();
            }
        }
        // Collapses the bar back to a single line.
        self.bar.set_style(style);
        self.bar.finish_with_message(label.to_string());
    }
}

fn render(state: &TaskState) -> String {
    let mut msg = state.label.clone();
    for line in &state.log_lines {
        msg.push_str("\n        ");
        msg.push_str(line);
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_ring_buffer_keeps_latest_lines() {
        let progress = Progress::new(OutputMode::Normal);
        let task = progress.task("web", "booting");
        for i in 0..(MAX_LOG_LINES + 3) {
            task.log(&format!("line {i}"));
        }
        let state = task.state.lock().unwrap();
        assert_eq!(state.log_lines.len(), MAX_LOG_LINES);
        assert_eq!(state.log_lines.front().unwrap(), "line 3");
        task.bar.finish_and_clear();
    }

    #[test]
    fn silent_mode_records_nothing() {
        let progress = Progress::silent();
        let task = progress.task("web", "booting");
        task.log("hidden");
        task.set_label("provisioning");
        task.finish("done");
        let state = task.state.lock().unwrap();
        assert!(state.log_lines.is_empty());
        assert_eq!(state.label, "provisioning");
    }
}
