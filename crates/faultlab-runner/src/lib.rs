use anyhow::{anyhow, Result};
use chrono::Local;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Outcome code recorded when the sandbox runtime cannot start the
/// workload at all. Deliberately indistinguishable from a workload exit
/// code; the ledger records it like any other crash.
pub const LAUNCH_FAILURE_CODE: i32 = 127;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub image: String,
    pub entry_command: String,
    pub build_context: PathBuf,
    pub log_file: PathBuf,
    pub gst_debug: u32,
    pub gpus: String,
    pub thread_counts: AxisRange,
    pub encoders_per_pipeline: AxisRange,
    pub iterations: Option<u64>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            image: "reproduce-deepstream-segfault-c".to_string(),
            entry_command: "/app/src/pipeline_test".to_string(),
            build_context: PathBuf::from("."),
            log_file: PathBuf::from("logs/table.log"),
            gst_debug: 2,
            gpus: "all".to_string(),
            thread_counts: AxisRange { min: 1, max: 12 },
            encoders_per_pipeline: AxisRange { min: 1, max: 12 },
            iterations: None,
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(anyhow!("config missing required field: image"));
        }
        if self.entry_command.trim().is_empty() {
            return Err(anyhow!("config missing required field: entry_command"));
        }
        self.thread_counts.validate("thread_counts")?;
        self.encoders_per_pipeline.validate("encoders_per_pipeline")?;
        Ok(())
    }

    pub fn grid(&self) -> Result<ParamGrid> {
        ParamGrid::new(self.thread_counts, self.encoders_per_pipeline)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct AxisRange {
    pub min: u32,
    pub max: u32,
}

impl AxisRange {
    pub fn values(self) -> impl Iterator<Item = u32> {
        self.min..=self.max
    }

    pub fn span(&self) -> usize {
        (self.max - self.min + 1) as usize
    }

    pub fn contains(&self, value: u32) -> bool {
        value >= self.min && value <= self.max
    }

    fn validate(&self, axis: &str) -> Result<()> {
        if self.min < 1 {
            return Err(anyhow!(
                "invalid {} range: minimum must be at least 1 (got {})",
                axis,
                self.min
            ));
        }
        if self.min > self.max {
            return Err(anyhow!(
                "invalid {} range: minimum {} exceeds maximum {}",
                axis,
                self.min,
                self.max
            ));
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|err| anyhow!("failed to read config {}: {}", path.display(), err))?;
    let config: HarnessConfig = serde_yaml::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamPair {
    pub thread_count: u32,
    pub encoders_per_pipeline: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamGrid {
    thread_counts: AxisRange,
    encoders_per_pipeline: AxisRange,
}

impl ParamGrid {
    pub fn new(thread_counts: AxisRange, encoders_per_pipeline: AxisRange) -> Result<Self> {
        thread_counts.validate("thread_counts")?;
        encoders_per_pipeline.validate("encoders_per_pipeline")?;
        Ok(Self {
            thread_counts,
            encoders_per_pipeline,
        })
    }

    /// Scan order: thread count outer ascending, encoders inner ascending.
    /// The order decides which cells resume first after an interrupt.
    pub fn pairs(&self) -> impl Iterator<Item = ParamPair> {
        let encoders = self.encoders_per_pipeline;
        self.thread_counts.values().flat_map(move |thread_count| {
            encoders.values().map(move |encoders_per_pipeline| ParamPair {
                thread_count,
                encoders_per_pipeline,
            })
        })
    }

    pub fn contains(&self, pair: ParamPair) -> bool {
        self.thread_counts.contains(pair.thread_count)
            && self.encoders_per_pipeline.contains(pair.encoders_per_pipeline)
    }

    pub fn cell_count(&self) -> usize {
        self.thread_counts.span() * self.encoders_per_pipeline.span()
    }

    pub fn thread_counts(&self) -> AxisRange {
        self.thread_counts
    }

    pub fn encoders_per_pipeline(&self) -> AxisRange {
        self.encoders_per_pipeline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("parameter pair outside the configured grid: THREAD_COUNT={thread_count} ENCODERS_PER_PIPELINE={encoders_per_pipeline}")]
pub struct OutOfRangeError {
    pub thread_count: u32,
    pub encoders_per_pipeline: u32,
}

impl OutOfRangeError {
    fn for_pair(pair: ParamPair) -> Self {
        Self {
            thread_count: pair.thread_count,
            encoders_per_pipeline: pair.encoders_per_pipeline,
        }
    }
}

/// Per-cell trial history for the whole grid. Every pair is enumerated at
/// construction, so in-grid lookups never miss; cells only ever grow.
#[derive(Debug, Clone)]
pub struct OutcomeLedger {
    grid: ParamGrid,
    cells: BTreeMap<ParamPair, Vec<i32>>,
}

impl OutcomeLedger {
    pub fn new(grid: ParamGrid) -> Self {
        let cells = grid.pairs().map(|pair| (pair, Vec::new())).collect();
        Self { grid, cells }
    }

    pub fn grid(&self) -> ParamGrid {
        self.grid
    }

    pub fn recorded_count(&self, pair: ParamPair) -> Result<usize, OutOfRangeError> {
        Ok(self.cell(pair)?.len())
    }

    pub fn append(&mut self, pair: ParamPair, code: i32) -> Result<(), OutOfRangeError> {
        let cell = self
            .cells
            .get_mut(&pair)
            .ok_or_else(|| OutOfRangeError::for_pair(pair))?;
        cell.push(code);
        Ok(())
    }

    pub fn frequency_table(
        &self,
        pair: ParamPair,
    ) -> Result<BTreeMap<i32, usize>, OutOfRangeError> {
        let mut counts: BTreeMap<i32, usize> = BTreeMap::new();
        for &code in self.cell(pair)? {
            *counts.entry(code).or_default() += 1;
        }
        Ok(counts)
    }

    pub fn total_recorded(&self) -> usize {
        self.cells.values().map(Vec::len).sum()
    }

    fn cell(&self, pair: ParamPair) -> Result<&Vec<i32>, OutOfRangeError> {
        self.cells
            .get(&pair)
            .ok_or_else(|| OutOfRangeError::for_pair(pair))
    }
}

/// Shared cancellation flag flipped by the interrupt handler and checked
/// at trial boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct TrialOutcome {
    pub exit_code: i32,
    pub captured_output: String,
}

/// One synchronous sandboxed trial per call. `Err` means the trial was
/// aborted mid-flight and its outcome is lost; workload failures come
/// back as `Ok` with a non-zero exit code.
pub trait TrialLauncher {
    fn run(&self, pair: ParamPair) -> Result<TrialOutcome>;
}

impl<L: TrialLauncher + ?Sized> TrialLauncher for &L {
    fn run(&self, pair: ParamPair) -> Result<TrialOutcome> {
        (**self).run(pair)
    }
}

pub struct DockerLauncher {
    image: String,
    entry_command: String,
    gst_debug: u32,
    gpus: String,
}

impl DockerLauncher {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            image: config.image.clone(),
            entry_command: config.entry_command.clone(),
            gst_debug: config.gst_debug,
            gpus: config.gpus.clone(),
        }
    }

    fn run_args(&self, pair: ParamPair) -> Vec<String> {
        vec![
            "run".to_string(),
            "--rm".to_string(),
            "--gpus".to_string(),
            self.gpus.clone(),
            "--env".to_string(),
            format!("GST_DEBUG={}", self.gst_debug),
            "--env".to_string(),
            format!("THREAD_COUNT={}", pair.thread_count),
            "--env".to_string(),
            format!("ENCODERS_PER_PIPELINE={}", pair.encoders_per_pipeline),
            self.image.clone(),
            self.entry_command.clone(),
        ]
    }
}

impl TrialLauncher for DockerLauncher {
    fn run(&self, pair: ParamPair) -> Result<TrialOutcome> {
        let mut cmd = Command::new("docker");
        cmd.args(self.run_args(pair));
        Ok(run_captured(cmd))
    }
}

fn run_captured(mut cmd: Command) -> TrialOutcome {
    cmd.stdin(Stdio::null());
    match cmd.output() {
        Ok(output) => {
            let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
            captured.push_str(&String::from_utf8_lossy(&output.stderr));
            TrialOutcome {
                exit_code: exit_code_of(&output.status),
                captured_output: captured,
            }
        }
        Err(err) => {
            tracing::warn!("sandbox launch failed: {}", err);
            TrialOutcome {
                exit_code: LAUNCH_FAILURE_CODE,
                captured_output: format!("failed to launch sandbox runtime: {}\n", err),
            }
        }
    }
}

fn exit_code_of(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    LAUNCH_FAILURE_CODE
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("sandbox image build exited with status {status}")]
    BuildFailed { status: i32 },
    #[error("failed to invoke the sandbox image build: {0}")]
    Spawn(#[from] std::io::Error),
}

impl ProvisionError {
    /// Status the process should exit with when provisioning fails.
    pub fn exit_status(&self) -> i32 {
        match self {
            ProvisionError::BuildFailed { status } => *status,
            ProvisionError::Spawn(_) => 1,
        }
    }
}

pub trait ImageProvisioner {
    fn provision(&self) -> Result<(), ProvisionError>;
}

impl<P: ImageProvisioner + ?Sized> ImageProvisioner for &P {
    fn provision(&self) -> Result<(), ProvisionError> {
        (**self).provision()
    }
}

pub struct DockerImageBuilder {
    image: String,
    build_context: PathBuf,
}

impl DockerImageBuilder {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            image: config.image.clone(),
            build_context: config.build_context.clone(),
        }
    }

    fn build_args(&self) -> Vec<String> {
        vec![
            "build".to_string(),
            "-t".to_string(),
            self.image.clone(),
            ".".to_string(),
        ]
    }
}

impl ImageProvisioner for DockerImageBuilder {
    fn provision(&self) -> Result<(), ProvisionError> {
        tracing::info!("building sandbox image {}", self.image);
        // Build output streams straight to the operator's terminal.
        let status = Command::new("docker")
            .args(self.build_args())
            .current_dir(&self.build_context)
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(ProvisionError::BuildFailed {
                status: exit_code_of(&status),
            })
        }
    }
}

/// Operator-facing log: `HH:MM:SS`-stamped lines echoed to stdout and
/// appended to a log file truncated at construction.
pub struct LogSink {
    path: PathBuf,
    file: fs::File,
    echo: bool,
}

impl LogSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = fs::File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            echo: true,
        })
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&mut self, message: &str) -> Result<()> {
        let stamped = format!("{} {}", Local::now().format("%H:%M:%S"), message);
        if self.echo {
            println!("{}", stamped);
        }
        self.file.write_all(stamped.as_bytes())?;
        self.file.write_all(b"\n")?;
        Ok(())
    }

    /// Captured trial output goes into the log verbatim, unstamped.
    pub fn append_raw(&mut self, text: &str) -> Result<()> {
        self.file.write_all(text.as_bytes())?;
        Ok(())
    }
}

/// Render the ledger as a bordered frequency matrix. Pure function of the
/// ledger state.
pub fn render_matrix(ledger: &OutcomeLedger) -> String {
    let grid = ledger.grid();
    let encoder_values: Vec<u32> = grid.encoders_per_pipeline().values().collect();

    let mut header: Vec<String> = Vec::with_capacity(encoder_values.len() + 1);
    header.push("Thr \\ Enc".to_string());
    header.extend(encoder_values.iter().map(|e| e.to_string()));

    let mut rows: Vec<Vec<String>> = Vec::new();
    for thread_count in grid.thread_counts().values() {
        let mut row: Vec<String> = Vec::with_capacity(encoder_values.len() + 1);
        row.push(thread_count.to_string());
        for &encoders_per_pipeline in &encoder_values {
            let pair = ParamPair {
                thread_count,
                encoders_per_pipeline,
            };
            let counts = ledger.frequency_table(pair).unwrap_or_default();
            row.push(format_cell(&counts));
        }
        rows.push(row);
    }

    let mut widths: Vec<usize> = header.iter().map(String::len).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let rule = |fill: &str| {
        let mut line = String::from("+");
        for width in &widths {
            line.push_str(&fill.repeat(width + 2));
            line.push('+');
        }
        line
    };
    let format_row = |cells: &[String]| {
        let mut line = String::from("|");
        for (i, cell) in cells.iter().enumerate() {
            line.push(' ');
            line.push_str(cell);
            line.push_str(&" ".repeat(widths[i] - cell.len() + 1));
            line.push('|');
        }
        line
    };

    let mut lines: Vec<String> = Vec::with_capacity(rows.len() * 2 + 3);
    lines.push(rule("-"));
    lines.push(format_row(&header));
    lines.push(rule("="));
    for row in &rows {
        lines.push(format_row(row));
        lines.push(rule("-"));
    }
    lines.join("\n")
}

fn format_cell(counts: &BTreeMap<i32, usize>) -> String {
    if counts.is_empty() {
        return "{}".to_string();
    }
    let entries: Vec<String> = counts
        .iter()
        .map(|(code, count)| format!("{}: {}", code, count))
        .collect();
    format!("{{{}}}", entries.join(", "))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Completed { trials_run: usize },
    Interrupted { trials_run: usize },
}

pub struct GridScheduler {
    grid: ParamGrid,
}

impl GridScheduler {
    pub fn new(grid: ParamGrid) -> Self {
        Self { grid }
    }

    /// One quota-driven pass over the grid: every pair whose cell is still
    /// below `iteration` gets exactly one trial, in scan order. The due
    /// check runs once per pair per pass, so a restarted pass skips cells
    /// the interrupted pass already filled — the ledger is the checkpoint.
    pub fn run_pass<L: TrialLauncher>(
        &self,
        iteration: u64,
        ledger: &mut OutcomeLedger,
        launcher: &L,
        sink: &mut LogSink,
        token: &CancellationToken,
    ) -> Result<PassOutcome> {
        let mut trials_run = 0usize;
        for pair in self.grid.pairs() {
            if token.is_cancelled() {
                return Ok(PassOutcome::Interrupted { trials_run });
            }
            if (ledger.recorded_count(pair)? as u64) >= iteration {
                continue;
            }
            sink.line(&format!(
                "Running with THREAD_COUNT={}, ENCODERS_PER_PIPELINE={}",
                pair.thread_count, pair.encoders_per_pipeline
            ))?;
            let outcome = match launcher.run(pair) {
                Ok(outcome) => outcome,
                Err(err) => {
                    // Aborted mid-flight; the outcome is lost, not recorded.
                    sink.line(&format!("Trial aborted before completion: {}", err))?;
                    return Ok(PassOutcome::Interrupted { trials_run });
                }
            };
            if token.is_cancelled() {
                // The interrupt landed while the trial was blocked; its
                // outcome is discarded.
                return Ok(PassOutcome::Interrupted { trials_run });
            }
            ledger.append(pair, outcome.exit_code)?;
            trials_run += 1;
            sink.append_raw(&outcome.captured_output)?;
            sink.line(&format!(
                "Exited with code {} | TC={}, EPP={}",
                outcome.exit_code, pair.thread_count, pair.encoders_per_pipeline
            ))?;
            sink.line(&format!(
                "Results table (iteration {})\n{}",
                iteration,
                render_matrix(ledger)
            ))?;
        }
        Ok(PassOutcome::Completed { trials_run })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Provisioning,
    Running,
    Stopping,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations_started: u64,
    pub trials_recorded: usize,
    pub interrupted: bool,
}

pub struct RunController<P, L> {
    provisioner: P,
    launcher: L,
    scheduler: GridScheduler,
    token: CancellationToken,
    max_iterations: Option<u64>,
    state: RunState,
}

impl<P: ImageProvisioner, L: TrialLauncher> RunController<P, L> {
    pub fn new(provisioner: P, launcher: L, grid: ParamGrid, token: CancellationToken) -> Self {
        Self {
            provisioner,
            launcher,
            scheduler: GridScheduler::new(grid),
            token,
            max_iterations: None,
            state: RunState::Provisioning,
        }
    }

    pub fn with_max_iterations(mut self, cap: Option<u64>) -> Self {
        self.max_iterations = cap;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn run(&mut self, ledger: &mut OutcomeLedger, sink: &mut LogSink) -> Result<RunSummary> {
        self.state = RunState::Provisioning;
        sink.line("Building Docker image...")?;
        if let Err(err) = self.provisioner.provision() {
            self.state = RunState::Terminated;
            return Err(err.into());
        }

        self.state = RunState::Running;
        sink.line("Starting test iterations...")?;

        let mut iteration: u64 = 0;
        let mut interrupted = false;
        let outcome: Result<()> = loop {
            if self.token.is_cancelled() {
                interrupted = true;
                break Ok(());
            }
            if let Some(cap) = self.max_iterations {
                if iteration >= cap {
                    break Ok(());
                }
            }
            iteration += 1;
            if let Err(err) = sink.line(&format!("Starting iteration {}...", iteration)) {
                break Err(err);
            }
            match self
                .scheduler
                .run_pass(iteration, ledger, &self.launcher, sink, &self.token)
            {
                Ok(PassOutcome::Completed { .. }) => {}
                Ok(PassOutcome::Interrupted { .. }) => {
                    interrupted = true;
                    break Ok(());
                }
                Err(err) => break Err(err),
            }
        };

        self.state = RunState::Stopping;
        if interrupted {
            sink.line("Stopped by user")?;
        }
        // Final render happens on every exit path out of Running so the
        // operator always sees the latest recorded state.
        sink.line(&format!(
            "Results table (iteration {})\n{}",
            iteration.max(1),
            render_matrix(ledger)
        ))?;
        self.state = RunState::Terminated;
        outcome?;
        Ok(RunSummary {
            iterations_started: iteration,
            trials_recorded: ledger.total_recorded(),
            interrupted,
        })
    }
}
