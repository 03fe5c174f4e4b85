use super::{types::*, Detector};
use crate::{config::Config, error::DetectionError, region::DetectedRegion};
use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use image::{ImageFormat, RgbImage};
use serde::{de::DeserializeOwned, Serialize};
use std::io::{BufRead, BufReader, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const WORKER_SCRIPT: &str = "easyocr_worker.py";

/// EasyOCR behind a long-lived Python child process.
///
/// The child is spawned on the first `detect` call and reused until it
/// fails or times out, after which the next call spawns a fresh one. A
/// worker that never came up is not retried. The pipe protocol is strictly
/// request/response, so calls are serialized through a mutex.
pub struct PythonDetector {
    settings: WorkerSettings,
    slot: Mutex<WorkerSlot>,
    next_id: AtomicU64,
}

enum WorkerSlot {
    Idle,
    Ready(Worker),
    /// Startup failed; later calls fail fast with the same cause instead of
    /// waiting out the startup timeout again.
    Failed(String),
}

struct WorkerSettings {
    python_exe: PathBuf,
    script: PathBuf,
    hello: WorkerHello,
    confidence_scale: f64,
    startup_timeout: Duration,
    item_timeout: Option<Duration>,
    doctor_timeout: u64,
    keep_stderr: bool,
}

impl PythonDetector {
    pub fn new(cfg: &Config) -> Result<Self> {
        let scripts_dir = PathBuf::from(&cfg.paths.scripts_dir);
        if cfg.security.pin_scripts_dir {
            let cwd = std::env::current_dir().with_context(|| "current_dir")?;
            let canon = scripts_dir
                .canonicalize()
                .with_context(|| format!("canonicalize scripts_dir: {}", scripts_dir.display()))?;
            if !canon.starts_with(&cwd) {
                return Err(anyhow!(
                    "scripts_dir is outside cwd while pin_scripts_dir=true: {}",
                    canon.display()
                ));
            }
        }
        let script = scripts_dir.join(WORKER_SCRIPT);
        if !script.exists() {
            return Err(anyhow!("missing script: {}", script.display()));
        }
        if cfg.engine.languages.is_empty() {
            return Err(anyhow!("engine.languages must name at least one language"));
        }

        let item_timeout = match cfg.engine.item_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            settings: WorkerSettings {
                python_exe: resolve_python_exe(&cfg.engine.python_exe)?,
                script,
                hello: WorkerHello {
                    languages: cfg.engine.languages.clone(),
                    gpu: cfg.engine.device.is_gpu(),
                },
                confidence_scale: cfg.engine.confidence_scale,
                startup_timeout: Duration::from_secs(cfg.engine.startup_timeout_seconds.max(1)),
                item_timeout,
                doctor_timeout: cfg.engine.doctor_timeout_seconds.max(1),
                keep_stderr: cfg.debug.keep_python_stderr,
            },
            slot: Mutex::new(WorkerSlot::Idle),
            next_id: AtomicU64::new(1),
        })
    }

    /// One-shot environment check; does not touch the persistent worker.
    pub fn doctor(&self) -> Result<EngineDiag> {
        self.run_json(
            &["--doctor"],
            &self.settings.hello,
            Some(self.settings.doctor_timeout),
        )
    }

    /// Spawns the worker now instead of on the first item, so model loading
    /// is not charged to whichever image happens to come first.
    pub fn warm_up(&self) -> std::result::Result<(), DetectionError> {
        let mut slot = self.lock_slot();
        self.ensure_started(&mut *slot).map(|_| ())
    }

    // A panic while the lock was held leaves the worker in an unknown state
    // mid-exchange, so it is discarded.
    fn lock_slot(&self) -> MutexGuard<'_, WorkerSlot> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("detection worker lock poisoned; discarding worker");
                let mut guard = poisoned.into_inner();
                *guard = WorkerSlot::Idle;
                self.slot.clear_poison();
                guard
            }
        }
    }

    fn ensure_started<'s>(
        &self,
        slot: &'s mut WorkerSlot,
    ) -> std::result::Result<&'s mut Worker, DetectionError> {
        if let WorkerSlot::Failed(cause) = &*slot {
            return Err(DetectionError::Unavailable(cause.clone()));
        }
        if matches!(*slot, WorkerSlot::Idle) {
            match Worker::spawn(&self.settings) {
                Ok(worker) => *slot = WorkerSlot::Ready(worker),
                Err(err) => {
                    *slot = WorkerSlot::Failed(err.to_string());
                    return Err(err);
                }
            }
        }
        match slot {
            WorkerSlot::Ready(worker) => Ok(worker),
            _ => Err(DetectionError::Crashed("worker unavailable".into())),
        }
    }

    fn run_json<I: Serialize, O: DeserializeOwned>(
        &self,
        args: &[&str],
        input: &I,
        timeout_seconds: Option<u64>,
    ) -> Result<O> {
        let script = &self.settings.script;
        debug!(
            "python run {} {:?} timeout={:?}",
            script.display(),
            args,
            timeout_seconds
        );
        let mut cmd = Command::new(&self.settings.python_exe);
        cmd.arg(script);
        cmd.args(args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning python: {}", script.display()))?;

        {
            let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("no stdin"))?;
            let bytes = serde_json::to_vec(input)?;
            stdin.write_all(&bytes)?;
            stdin.flush().ok();
        }

        let output = if let Some(secs) = timeout_seconds {
            wait_with_timeout(&mut child, Duration::from_secs(secs))?
        } else {
            child
                .wait_with_output()
                .with_context(|| "waiting for python")?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "python script failed: {}\n{}",
                script.display(),
                stderr
            ));
        }

        if self.settings.keep_stderr && !output.stderr.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("python stderr {}: {}", script.display(), stderr.trim());
        }

        let out: O = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("parsing python JSON output: {}", script.display()))?;
        Ok(out)
    }
}

impl Detector for PythonDetector {
    fn detect(
        &self,
        image: &RgbImage,
    ) -> std::result::Result<Vec<DetectedRegion>, DetectionError> {
        let request = WorkerRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            image_png_b64: encode_png_b64(image)?,
        };

        let mut slot = self.lock_slot();
        let worker = self.ensure_started(&mut *slot)?;

        let response = match worker.call(&request, self.settings.item_timeout) {
            Ok(resp) if resp.id == request.id => resp,
            Ok(resp) => {
                *slot = WorkerSlot::Idle;
                return Err(DetectionError::Protocol(format!(
                    "response id {} does not match request id {}",
                    resp.id, request.id
                )));
            }
            Err(err) => {
                warn!("detection worker reset after error: {err}");
                *slot = WorkerSlot::Idle;
                return Err(err);
            }
        };
        drop(slot);

        if !response.ok {
            return Err(DetectionError::Engine(
                response
                    .error
                    .unwrap_or_else(|| "engine returned ok=false".to_string()),
            ));
        }

        let scale = self.settings.confidence_scale;
        Ok(response
            .regions
            .into_iter()
            .map(|r| r.into_region(scale))
            .collect())
    }
}

struct Worker {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<std::io::Result<String>>,
}

impl Worker {
    fn spawn(settings: &WorkerSettings) -> std::result::Result<Self, DetectionError> {
        let started = Instant::now();
        let mut cmd = Command::new(&settings.python_exe);
        cmd.arg(&settings.script).arg("--serve");
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(if settings.keep_stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd.spawn().map_err(|e| {
            DetectionError::Spawn(format!("{}: {e}", settings.python_exe.display()))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DetectionError::Spawn("no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DetectionError::Spawn("no stdout".into()))?;

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        if let Some(stderr) = child.stderr.take() {
            std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    debug!(target: "easyocr_worker", "{}", line.trim_end());
                }
            });
        }

        let mut worker = Worker {
            child,
            stdin,
            lines: rx,
        };
        worker.send(&settings.hello)?;
        let ready: WorkerReady = worker.recv(Some(settings.startup_timeout))?;
        if !ready.ok {
            return Err(DetectionError::Engine(
                ready
                    .error
                    .unwrap_or_else(|| "worker failed to initialize".to_string()),
            ));
        }

        info!(
            "detection worker ready in {:.1}s languages={:?} gpu={} engine={}",
            started.elapsed().as_secs_f64(),
            settings.hello.languages,
            settings.hello.gpu,
            ready.engine_version.as_deref().unwrap_or("unknown")
        );
        Ok(worker)
    }

    fn call(
        &mut self,
        request: &WorkerRequest,
        timeout: Option<Duration>,
    ) -> std::result::Result<WorkerResponse, DetectionError> {
        self.send(request)?;
        self.recv(timeout)
    }

    fn send<T: Serialize>(&mut self, msg: &T) -> std::result::Result<(), DetectionError> {
        let mut line =
            serde_json::to_vec(msg).map_err(|e| DetectionError::Protocol(e.to_string()))?;
        line.push(b'\n');
        self.stdin.write_all(&line)?;
        self.stdin.flush()?;
        Ok(())
    }

    fn recv<O: DeserializeOwned>(
        &mut self,
        timeout: Option<Duration>,
    ) -> std::result::Result<O, DetectionError> {
        let received = match timeout {
            Some(t) => match self.lines.recv_timeout(t) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(DetectionError::Timeout {
                        seconds: t.as_secs(),
                    })
                }
                Err(RecvTimeoutError::Disconnected) => return Err(self.exited()),
            },
            None => match self.lines.recv() {
                Ok(line) => line,
                Err(_) => return Err(self.exited()),
            },
        };
        let line = received?;
        serde_json::from_str(&line).map_err(|e| {
            let shown: String = line.chars().take(200).collect();
            DetectionError::Protocol(format!("{e}: {shown}"))
        })
    }

    fn exited(&mut self) -> DetectionError {
        match self.child.try_wait() {
            Ok(Some(status)) => DetectionError::Crashed(status.to_string()),
            _ => DetectionError::Crashed("stdout closed".to_string()),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn encode_png_b64(image: &RgbImage) -> std::result::Result<String, DetectionError> {
    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| DetectionError::Protocol(format!("encoding request image: {e}")))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(png))
}

fn resolve_python_exe(raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("auto") {
        if let Ok(env_val) = std::env::var("BATCH_REDACT_PYTHON") {
            let p = expand_tilde(&env_val);
            if p.exists() {
                return Ok(p);
            }
        }
        let venv = Path::new(".venv").join("bin").join("python");
        if venv.exists() {
            return Ok(venv);
        }
        return Ok(PathBuf::from("python3"));
    }
    Ok(expand_tilde(raw))
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<Output> {
    // Drain pipes while waiting so model-download chatter can't deadlock the
    // child on a full stdout/stderr buffer.
    let stdout_reader = child.stdout.take();
    let stderr_reader = child.stderr.take();

    let stdout_thread = std::thread::spawn(move || -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout_reader {
            out.read_to_end(&mut buf).with_context(|| "read stdout")?;
        }
        Ok(buf)
    });

    let stderr_thread = std::thread::spawn(move || -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        if let Some(mut err) = stderr_reader {
            err.read_to_end(&mut buf).with_context(|| "read stderr")?;
        }
        Ok(buf)
    });

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().with_context(|| "try_wait")? {
            let stdout = stdout_thread
                .join()
                .map_err(|_| anyhow!("stdout reader thread panicked"))??;
            let stderr = stderr_thread
                .join()
                .map_err(|_| anyhow!("stderr reader thread panicked"))??;
            return Ok(Output {
                status,
                stdout,
                stderr,
            });
        }

        if start.elapsed() > timeout {
            warn!("python process timed out after {:?}", timeout);
            let _ = child.kill();
            child.wait().with_context(|| "wait after kill")?;
            let stderr = stderr_thread
                .join()
                .map_err(|_| anyhow!("stderr reader thread panicked"))??;
            let _ = stdout_thread.join();
            return Err(anyhow!(
                "python process exceeded timeout ({:?}); stderr: {}",
                timeout,
                String::from_utf8_lossy(&stderr)
            ));
        }

        std::thread::sleep(Duration::from_millis(50));
    }
}
