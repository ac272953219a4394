use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Shared progress of a batched per-row evaluation (likelihoods, phase KDEs).
///
/// Worker threads only bump atomic counters; an optional render thread reads
/// them and draws a bar on stderr.
pub struct EvaluationProgress {
    pub label: &'static str,
    pub total: usize,
    pub completed: AtomicUsize,
    pub failures: AtomicUsize,
    pub done: AtomicBool,
    pub start_time: Instant,
}

impl EvaluationProgress {
    pub fn new(label: &'static str, total: usize) -> Self {
        Self {
            label,
            total,
            completed: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            start_time: Instant::now(),
        }
    }

    pub fn increment(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn finish(&self) {
        self.done.store(true, Ordering::Relaxed);
    }
}

/// Elapsed wall time as `12.3s` or `4m05s`.
fn fmt_elapsed(secs: f64) -> String {
    let secs = secs.max(0.0);
    if secs < 60.0 {
        format!("{secs:.1}s")
    } else {
        let whole = secs as u64;
        format!("{}m{:02}s", whole / 60, whole % 60)
    }
}

/// Rows per second, zero until a measurable time has passed.
fn rows_per_sec(completed: usize, secs: f64) -> f64 {
    if secs > 0.05 {
        completed as f64 / secs
    } else {
        0.0
    }
}

fn render(state: &EvaluationProgress) {
    let completed = state.completed().min(state.total);
    let total = state.total;
    let elapsed = state.start_time.elapsed().as_secs_f64();
    let width = 30;
    let filled = if total == 0 { width } else { width * completed / total };
    let pct = if total == 0 { 100 } else { completed * 100 / total };
    let bar: String = "━".repeat(filled) + &"╌".repeat(width - filled);
    let end = if state.done.load(Ordering::Relaxed) { "\n" } else { "" };

    let mut err = std::io::stderr().lock();
    let _ = write!(
        err,
        "\r{} {bar} {pct:>3}% │ {completed}/{total} rows │ {} failed │ {:.0} rows/s │ {}\x1b[K{end}",
        state.label,
        state.failures(),
        rows_per_sec(completed, elapsed),
        fmt_elapsed(elapsed),
    );
    let _ = err.flush();
}

/// Progress tracker plus its optional render thread.
pub(crate) struct ProgressGuard {
    pub state: Arc<EvaluationProgress>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressGuard {
    /// Start tracking `total` rows; with `render`, redraw the bar every
    /// 100 ms until the guard is dropped.
    pub fn start(label: &'static str, total: usize, render: bool) -> Self {
        let state = Arc::new(EvaluationProgress::new(label, total));
        let handle = render.then(|| {
            let state = Arc::clone(&state);
            std::thread::spawn(move || {
                while !state.done.load(Ordering::Relaxed) {
                    self::render(&state);
                    std::thread::sleep(Duration::from_millis(100));
                }
                self::render(&state);
            })
        });
        Self { state, handle }
    }
}

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        self.state.finish();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}
