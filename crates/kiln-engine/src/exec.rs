//! Subprocess execution engine.
//!
//! Runs one code submission against an existing session workspace:
//!
//! 1. writes the source to `code_<unixMillis>_<random6><suffix>`,
//! 2. assembles the command from the language recipe (compile-then-run
//!    pipelines go through `sh -c`), pointing the environment into the
//!    language's base workspace when one exists,
//! 3. spawns the child in its own process group with fully piped stdio,
//!    feeds stdin once, and collects stdout and stderr through bounded
//!    readers,
//! 4. enforces the wall-clock budget with a polite-then-forceful kill
//!    (SIGTERM to the group, grace window, SIGKILL) recording exit code 124,
//! 5. samples `/proc/<pid>/status` for the peak resident set,
//! 6. removes the temporary source on every exit path.
//!
//! Concurrency is a fair semaphore (waiters are FIFO); a request that cannot
//! get a slot within the queue budget fails with `QueueTimeout` without
//! running anything. At most one execution runs per session at a time.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kiln_admission::{
    CircuitBreaker, CircuitBreakerConfig, RateLimitConfig, RateLimitDecision, RateLimiter,
};
use kiln_error::BrokerError;
use kiln_model::{
    ExecOutcome, ExecRequest, LanguageSpec, Recipe, Session, OUTPUT_CAP_BYTES, TIMEOUT_EXIT_CODE,
    TRUNCATION_MARKER,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Executions in flight at once.
    pub max_concurrent: usize,
    /// How long a request may wait for a slot.
    pub queue_wait: Duration,
    /// Dispatch smoothing: admissions per second at burst.
    pub dispatch_burst_per_sec: u64,
    /// Per-stream capture cap in bytes.
    pub output_cap: usize,
    /// Grace window between SIGTERM and SIGKILL.
    pub term_grace: Duration,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            queue_wait: Duration::from_secs(60),
            dispatch_burst_per_sec: 50,
            output_cap: OUTPUT_CAP_BYTES,
            term_grace: Duration::from_secs(5),
        }
    }
}

/// The execution engine. Shared behind an `Arc`.
pub struct ExecutionEngine {
    config: ExecConfig,
    slots: Arc<Semaphore>,
    dispatch: RateLimiter,
    session_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    toolchain_breakers: Mutex<HashMap<&'static str, Arc<CircuitBreaker>>>,
}

impl ExecutionEngine {
    /// Create an engine with the given knobs.
    pub fn new(config: ExecConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent));
        let dispatch = RateLimiter::new(RateLimitConfig {
            points: config.dispatch_burst_per_sec,
            window: Duration::from_secs(1),
            // Short block: this bucket smooths dispatch, it does not punish.
            block: Duration::from_millis(50),
        });
        Self {
            config,
            slots,
            dispatch,
            session_locks: Mutex::new(HashMap::new()),
            toolchain_breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Free per-session state after a session is destroyed.
    pub fn forget_session(&self, session_id: &str) {
        self.session_locks
            .lock()
            .expect("session lock map poisoned")
            .remove(session_id);
    }

    /// Execution slots currently available (for health reporting).
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Breaker snapshots per toolchain (for health and metrics).
    pub fn breaker_snapshots(&self) -> Vec<(String, kiln_admission::BreakerSnapshot)> {
        self.toolchain_breakers
            .lock()
            .expect("breaker map poisoned")
            .iter()
            .map(|(lang, b)| (format!("toolchain:{lang}"), b.snapshot()))
            .collect()
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.session_locks
            .lock()
            .expect("session lock map poisoned")
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn toolchain_breaker(&self, language: &'static str) -> Arc<CircuitBreaker> {
        self.toolchain_breakers
            .lock()
            .expect("breaker map poisoned")
            .entry(language)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    format!("toolchain:{language}"),
                    CircuitBreakerConfig::default(),
                ))
            })
            .clone()
    }

    /// Run one request in `session`'s workspace.
    ///
    /// The caller has already verified the session is live and its workspace
    /// exists; `base_workspace` is the language's base dir when provisioning
    /// succeeded at startup.
    pub async fn execute(
        &self,
        session: &Session,
        base_workspace: Option<&Path>,
        req: &ExecRequest,
    ) -> Result<ExecOutcome, BrokerError> {
        let spec = LanguageSpec::lookup(req.language);

        // One execution per session at a time; others queue here.
        let lock = self.session_lock(&session.id);
        let _serialized = lock.lock().await;

        // Bounded queue: give up without running if no slot frees in time.
        let queued_at = Instant::now();
        let _permit = tokio::time::timeout(
            self.config.queue_wait,
            self.slots.clone().acquire_owned(),
        )
        .await
        .map_err(|_| BrokerError::QueueTimeout {
            waited_ms: queued_at.elapsed().as_millis() as u64,
        })?
        .expect("engine semaphore never closes");

        // Dispatch smoothing on top of the slot cap.
        loop {
            match self.dispatch.consume("dispatch", 1) {
                RateLimitDecision::Allowed => break,
                RateLimitDecision::Blocked { retry_after } => {
                    if queued_at.elapsed() >= self.config.queue_wait {
                        return Err(BrokerError::QueueTimeout {
                            waited_ms: queued_at.elapsed().as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(retry_after.min(Duration::from_millis(50))).await;
                }
            }
        }

        let breaker = self.toolchain_breaker(req.language.as_str());
        breaker.check().map_err(|_| BrokerError::CircuitOpen {
            dependency: format!("toolchain:{}", req.language),
        })?;

        // Fresh source file in the session workspace.
        let file_name = format!(
            "code_{}_{}{}",
            chrono::Utc::now().timestamp_millis(),
            random6(),
            spec.suffix
        );
        let source_path = session.workspace_dir.join(&file_name);
        tokio::fs::write(&source_path, &req.code)
            .await
            .map_err(|e| {
                BrokerError::internal(anyhow::Error::new(e).context("writing source file"))
            })?;

        let command = build_command(spec, base_workspace, &session.workspace_dir, &source_path)
            .await
            .map_err(BrokerError::internal)?;

        let result = self.run_child(command, req, &breaker).await;

        // The temp source goes away on every exit path.
        if let Err(e) = tokio::fs::remove_file(&source_path).await {
            tracing::debug!(path = %source_path.display(), error = %e, "temp source cleanup failed");
        }

        result
    }

    /// Spawn, feed, collect, supervise, and reap one child.
    pub(crate) async fn run_child(
        &self,
        mut command: Command,
        req: &ExecRequest,
        breaker: &CircuitBreaker,
    ) -> Result<ExecOutcome, BrokerError> {
        let timeout = Duration::from_millis(req.effective_timeout_ms());
        let started = Instant::now();

        let mut child = match command.spawn() {
            Ok(child) => {
                breaker.on_success();
                child
            }
            Err(e) => {
                let expected = matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                );
                breaker.on_failure(expected);
                return Err(BrokerError::SpawnFailed { source: e });
            }
        };
        let child_pid = child.id();

        // Feed stdin once and close it; a child that exited early is fine.
        if let Some(mut child_stdin) = child.stdin.take() {
            if let Some(text) = &req.stdin {
                let _ = child_stdin.write_all(text.as_bytes()).await;
                let _ = child_stdin.shutdown().await;
            }
            // Dropping closes the pipe either way.
        }

        let stdout_pipe = child
            .stdout
            .take()
            .expect("stdout is piped by construction");
        let stderr_pipe = child
            .stderr
            .take()
            .expect("stderr is piped by construction");

        let cap = self.config.output_cap;
        let overflow = Arc::new(Notify::new());
        let stdout_capture = StreamCapture::default();
        let stderr_capture = StreamCapture::default();
        let mut stdout_task = tokio::spawn(pump(
            stdout_pipe,
            cap,
            stdout_capture.clone(),
            Some(overflow.clone()),
        ));
        let mut stderr_task = tokio::spawn(pump(stderr_pipe, cap, stderr_capture.clone(), None));

        // Best-effort peak-RSS sampling while the child runs.
        let peak_kb = Arc::new(AtomicU64::new(0));
        let sampler = child_pid.map(|pid| {
            let peak = peak_kb.clone();
            tokio::spawn(async move {
                loop {
                    if let Some(kb) = read_vm_hwm_kb(pid).await {
                        peak.fetch_max(kb, Ordering::Relaxed);
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            })
        });

        enum RunEnd {
            Exited(std::process::ExitStatus),
            TimedOut,
            Overflowed,
        }

        let end = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => RunEnd::Exited(status),
                Err(e) => {
                    if let Some(s) = sampler { s.abort(); }
                    kill_group(child_pid);
                    let _ = child.kill().await;
                    stdout_task.abort();
                    stderr_task.abort();
                    return Err(BrokerError::internal(
                        anyhow::Error::new(e).context("waiting for child"),
                    ));
                }
            },
            _ = tokio::time::sleep(timeout) => RunEnd::TimedOut,
            _ = overflow.notified() => RunEnd::Overflowed,
        };

        if let Some(s) = sampler {
            s.abort();
        }

        let peak_memory_mib = match peak_kb.load(Ordering::Relaxed) {
            0 => None,
            kb => Some(kb / 1024),
        };

        match end {
            RunEnd::Exited(status) => {
                // Let trailing output land, then stop any writers the child
                // left behind holding the pipes.
                settle(&mut stdout_task, &mut stderr_task, Duration::from_millis(500)).await;
                kill_group(child_pid);
                settle(&mut stdout_task, &mut stderr_task, Duration::from_millis(200)).await;
                stdout_task.abort();
                stderr_task.abort();

                if stdout_capture.overflowed() {
                    return Err(BrokerError::OutputOverflow { cap_bytes: cap });
                }

                let mut stderr = stderr_capture.take_string();
                if stderr_capture.overflowed() {
                    stderr.push_str(TRUNCATION_MARKER);
                }

                Ok(ExecOutcome {
                    stdout: stdout_capture.take_string(),
                    stderr,
                    exit_code: exit_code_of(status),
                    wall_time_ms: started.elapsed().as_millis() as u64,
                    peak_memory_mib,
                })
            }
            RunEnd::TimedOut => {
                terminate_two_phase(&mut child, child_pid, self.config.term_grace).await;
                settle(&mut stdout_task, &mut stderr_task, Duration::from_millis(500)).await;
                stdout_task.abort();
                stderr_task.abort();

                let mut stderr = stderr_capture.take_string();
                if stderr_capture.overflowed() {
                    stderr.push_str(TRUNCATION_MARKER);
                }
                stderr.push_str(&format!(
                    "\n[execution timed out after {}ms]",
                    req.effective_timeout_ms()
                ));

                Ok(ExecOutcome {
                    stdout: stdout_capture.take_string(),
                    stderr,
                    exit_code: TIMEOUT_EXIT_CODE,
                    wall_time_ms: started.elapsed().as_millis() as u64,
                    peak_memory_mib,
                })
            }
            RunEnd::Overflowed => {
                // The writer is stalled against a full pipe; nothing polite
                // to wait for.
                kill_group(child_pid);
                let _ = child.kill().await;
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                Err(BrokerError::OutputOverflow { cap_bytes: cap })
            }
        }
    }
}

/// Shared capture buffer for one output stream.
#[derive(Clone, Default)]
struct StreamCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    overflowed: Arc<AtomicBool>,
}

impl StreamCapture {
    fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::SeqCst)
    }

    fn take_string(&self) -> String {
        let buf = self.buf.lock().expect("capture buffer lock poisoned");
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// Read a stream into the shared capture, stopping at `cap` bytes.
///
/// Crossing the cap sets the overflow flag and, when `overflow_notify` is
/// set, wakes the supervisor immediately.
async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    cap: usize,
    capture: StreamCapture,
    overflow_notify: Option<Arc<Notify>>,
) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let crossed = {
                    let mut buf = capture.buf.lock().expect("capture buffer lock poisoned");
                    if buf.len() + n > cap {
                        let take = cap.saturating_sub(buf.len());
                        buf.extend_from_slice(&chunk[..take.min(n)]);
                        true
                    } else {
                        buf.extend_from_slice(&chunk[..n]);
                        false
                    }
                };
                if crossed {
                    capture.overflowed.store(true, Ordering::SeqCst);
                    if let Some(notify) = overflow_notify {
                        notify.notify_one();
                    }
                    return;
                }
            }
        }
    }
}

/// Wait up to `wait` for both collectors to hit EOF.
async fn settle(
    stdout_task: &mut JoinHandle<()>,
    stderr_task: &mut JoinHandle<()>,
    wait: Duration,
) {
    let _ = tokio::time::timeout(wait, async {
        if !stdout_task.is_finished() {
            let _ = (&mut *stdout_task).await;
        }
        if !stderr_task.is_finished() {
            let _ = (&mut *stderr_task).await;
        }
    })
    .await;
}

/// Six characters of file-name entropy.
fn random6() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// Assemble the child command from the language recipe.
///
/// `{file}` is replaced with the absolute source path — the only template
/// substitution. Shell pipelines additionally see `KILN_BUILD` (the build
/// directory) and `KILN_MAIN` (the source stem) in their environment, and the
/// base workspace, when present, is injected via `PATH`, `VIRTUAL_ENV`,
/// `NODE_PATH`, `CARGO_HOME`, and `GOPATH`.
async fn build_command(
    spec: &LanguageSpec,
    base_workspace: Option<&Path>,
    session_workspace: &Path,
    source_path: &Path,
) -> anyhow::Result<Command> {
    let source = source_path.to_string_lossy();

    let mut command = match spec.recipe {
        Recipe::Exec(argv) => {
            let mut parts = argv.iter().map(|a| a.replace("{file}", &source));
            let program = parts.next().expect("recipe has a program");
            let mut command = Command::new(program);
            command.args(parts);
            command
        }
        Recipe::Shell(line) => {
            let mut command = Command::new("sh");
            command.arg("-c").arg(line.replace("{file}", &source));
            command
        }
    };

    command.current_dir(session_workspace);

    if matches!(spec.recipe, Recipe::Shell(_)) {
        let build_dir = base_workspace
            .map(|b| b.join("build"))
            .unwrap_or_else(|| session_workspace.join("build"));
        tokio::fs::create_dir_all(&build_dir).await?;
        command.env("KILN_BUILD", &build_dir);

        let stem = source_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        command.env("KILN_MAIN", stem);
    }

    if let Some(base) = base_workspace {
        let mut path_entries = vec![
            base.join("bin").to_string_lossy().into_owned(),
            base.join("node_modules/.bin").to_string_lossy().into_owned(),
        ];
        if let Ok(existing) = std::env::var("PATH") {
            path_entries.push(existing);
        }
        command.env("PATH", path_entries.join(":"));
        command.env("VIRTUAL_ENV", base);
        command.env("NODE_PATH", base.join("node_modules"));
        command.env("CARGO_HOME", base.join(".cargo"));
        command.env("GOPATH", base.join("gopath"));
    }

    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    Ok(command)
}

/// SIGKILL an entire process group, if the leader pid is known.
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: kill(2) with a valid signal; negative pid targets the group.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
}

/// Polite, then forceful: SIGTERM to the group, wait out the grace window,
/// SIGKILL to the group.
async fn terminate_two_phase(child: &mut Child, pid: Option<u32>, grace: Duration) {
    if let Some(pid) = pid {
        // SAFETY: kill(2) with a valid signal; negative pid targets the group.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            tracing::debug!(pid, "child ignored SIGTERM, escalating");
        }
    }
    kill_group(pid);
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Exit code, mapping a fatal signal to `128 + signo`.
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

/// Peak resident set (VmHWM) of a live process, in KiB.
async fn read_vm_hwm_kb(pid: u32) -> Option<u64> {
    let status = tokio::fs::read_to_string(format!("/proc/{pid}/status"))
        .await
        .ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmHWM:") {
            return rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse::<u64>()
                .ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_model::LanguageId;

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(ExecConfig::default())
    }

    fn small_cap_engine(cap: usize) -> ExecutionEngine {
        ExecutionEngine::new(ExecConfig {
            output_cap: cap,
            term_grace: Duration::from_millis(300),
            ..ExecConfig::default()
        })
    }

    fn request(timeout_ms: u64) -> ExecRequest {
        ExecRequest {
            language: LanguageId::Python,
            code: String::new(),
            session_id: None,
            stdin: None,
            timeout_ms: Some(timeout_ms),
        }
    }

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        command
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", CircuitBreakerConfig::default())
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let e = engine();
        let out = e
            .run_child(sh("echo hello"), &request(5_000), &breaker())
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.exit_code, 0);
        assert!(out.is_success());
    }

    #[tokio::test]
    async fn captures_stderr_separately() {
        let e = engine();
        let out = e
            .run_child(sh("echo oops >&2; exit 3"), &request(5_000), &breaker())
            .await
            .unwrap();
        assert_eq!(out.stderr.trim(), "oops");
        assert!(out.stdout.is_empty());
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn feeds_stdin_once() {
        let e = engine();
        let mut req = request(5_000);
        req.stdin = Some("line one\nline two\n".into());
        let out = e.run_child(sh("cat"), &req, &breaker()).await.unwrap();
        assert_eq!(out.stdout, "line one\nline two\n");
    }

    #[tokio::test]
    async fn timeout_kills_and_reports_124() {
        let e = small_cap_engine(OUTPUT_CAP_BYTES);
        let started = Instant::now();
        let out = e
            .run_child(sh("echo partial; sleep 30"), &request(1_000), &breaker())
            .await
            .unwrap();
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert!(out.timed_out());
        assert!(out.stdout.contains("partial"), "partial output preserved");
        assert!(out.stderr.contains("timed out"));
        assert!(out.wall_time_ms >= 1_000);
        // killed well within timeout + grace
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test]
    async fn sigterm_resistant_child_gets_sigkilled() {
        let e = small_cap_engine(OUTPUT_CAP_BYTES);
        let started = Instant::now();
        let out = e
            .run_child(sh("trap '' TERM; sleep 30"), &request(1_000), &breaker())
            .await
            .unwrap();
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "SIGKILL should fire right after the grace window"
        );
    }

    #[tokio::test]
    async fn timeout_with_lingering_grandchild_does_not_hang() {
        let e = small_cap_engine(OUTPUT_CAP_BYTES);
        let started = Instant::now();
        // The background sleep inherits the pipes; the group kill must end it.
        let out = e
            .run_child(sh("sleep 30 & echo spawned; wait"), &request(1_000), &breaker())
            .await
            .unwrap();
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert!(out.stdout.contains("spawned"));
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test]
    async fn stdout_overflow_aborts_the_run() {
        let e = small_cap_engine(4 * 1024);
        let err = e
            .run_child(sh("yes overflow"), &request(10_000), &breaker())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "OUTPUT_OVERFLOW");
    }

    #[tokio::test]
    async fn stderr_overflow_truncates_with_marker() {
        let e = small_cap_engine(1024);
        let out = e
            .run_child(
                sh("i=0; while [ $i -lt 200 ]; do echo aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa >&2; i=$((i+1)); done; echo done"),
                &request(10_000),
                &breaker(),
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.stderr.contains(TRUNCATION_MARKER.trim()));
        assert!(out.stderr.len() <= 1024 + TRUNCATION_MARKER.len());
        assert!(out.stdout.contains("done"));
    }

    #[tokio::test]
    async fn signal_death_maps_to_128_plus_signo() {
        let e = engine();
        let out = e
            .run_child(sh("kill -9 $$"), &request(5_000), &breaker())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 128 + 9);
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_os_error() {
        let e = engine();
        let mut command = Command::new("/nonexistent/kiln-test-binary");
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let err = e
            .run_child(command, &request(5_000), &breaker())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SPAWN_FAILED");
    }

    #[tokio::test]
    async fn repeated_spawn_failures_open_the_toolchain_breaker() {
        let e = engine();
        let b = breaker();
        for _ in 0..5 {
            let mut command = Command::new("/nonexistent/kiln-test-binary");
            command
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            let _ = e.run_child(command, &request(5_000), &b).await;
        }
        assert!(b.check().is_err(), "breaker should be open");
    }

    #[tokio::test]
    async fn wall_time_is_recorded() {
        let e = engine();
        let out = e
            .run_child(sh("sleep 0.2; echo ok"), &request(5_000), &breaker())
            .await
            .unwrap();
        assert!(out.wall_time_ms >= 180, "got {}", out.wall_time_ms);
    }

    #[tokio::test]
    async fn executions_in_one_session_are_serialized() {
        use kiln_model::SessionKind;

        // Only meaningful when the interpreter exists on the host.
        if tokio::process::Command::new("sh")
            .arg("-c")
            .arg("command -v python3")
            .output()
            .await
            .map(|o| !o.status.success())
            .unwrap_or(true)
        {
            eprintln!("python3 unavailable; skipping");
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(
            SessionKind::Execution,
            Some(LanguageId::Python),
            "1g",
            dir.path().to_path_buf(),
            "c1",
        );
        let e = Arc::new(engine());

        // Each run appends to the same file; with serialization the file
        // never sees interleaved partial writes.
        let code = r#"
with open('counter.txt', 'a') as f:
    f.write('x')
print('ran')
"#;
        let mut handles = Vec::new();
        for _ in 0..2 {
            let e = e.clone();
            let session = session.clone();
            let req = ExecRequest {
                language: LanguageId::Python,
                code: code.to_string(),
                session_id: Some(session.id.clone()),
                stdin: None,
                timeout_ms: Some(20_000),
            };
            handles.push(tokio::spawn(async move { e.execute(&session, None, &req).await }));
        }
        for handle in handles {
            let out = handle.await.unwrap().unwrap();
            assert_eq!(out.exit_code, 0);
            assert!(out.stdout.contains("ran"));
        }
        let counter = std::fs::read_to_string(dir.path().join("counter.txt")).unwrap();
        assert_eq!(counter, "xx");
    }

    #[tokio::test]
    async fn execute_cleans_up_the_temp_source() {
        use kiln_model::SessionKind;

        if tokio::process::Command::new("sh")
            .arg("-c")
            .arg("command -v python3")
            .output()
            .await
            .map(|o| !o.status.success())
            .unwrap_or(true)
        {
            eprintln!("python3 unavailable; skipping");
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(
            SessionKind::Execution,
            Some(LanguageId::Python),
            "1g",
            dir.path().to_path_buf(),
            "c1",
        );
        let e = engine();
        let req = ExecRequest {
            language: LanguageId::Python,
            code: "print('hi')".into(),
            session_id: Some(session.id.clone()),
            stdin: None,
            timeout_ms: Some(20_000),
        };
        let out = e.execute(&session, None, &req).await.unwrap();
        assert!(out.stdout.contains("hi"));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("code_"))
            .collect();
        assert!(leftovers.is_empty(), "temp source should be removed");
    }

    #[tokio::test]
    async fn queue_timeout_fires_without_running() {
        let e = ExecutionEngine::new(ExecConfig {
            max_concurrent: 1,
            queue_wait: Duration::from_millis(100),
            ..ExecConfig::default()
        });

        // Occupy the only slot.
        let _held = e.slots.clone().acquire_owned().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(
            kiln_model::SessionKind::Execution,
            Some(LanguageId::Python),
            "1g",
            dir.path().to_path_buf(),
            "c1",
        );
        let req = ExecRequest {
            language: LanguageId::Python,
            code: "print(1)".into(),
            session_id: None,
            stdin: None,
            timeout_ms: Some(5_000),
        };
        let err = e.execute(&session, None, &req).await.unwrap_err();
        assert_eq!(err.code(), "QUEUE_TIMEOUT");
    }

    #[tokio::test]
    async fn vm_hwm_parses_own_process() {
        let kb = read_vm_hwm_kb(std::process::id()).await;
        // Any Linux host exposes VmHWM for a live process.
        if cfg!(target_os = "linux") {
            assert!(kb.unwrap() > 0);
        }
    }

    #[test]
    fn random6_is_six_alphanumerics() {
        let s = random6();
        assert_eq!(s.len(), 6);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
