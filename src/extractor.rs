#![forbid(unsafe_code)]

//! yt-dlp invocations.
//!
//! Every call builds its argument list with a pure function (so the exact
//! flags are unit-testable), runs the program in its own process group and
//! ends the list with `--` so a client URL can never be read as an option.

use std::{
    io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    process::{Child, ChildStderr, ChildStdout, Command},
    sync::{OwnedSemaphorePermit, Semaphore},
};
use tracing::{debug, info, warn};

use crate::metadata::{MERGE_CONTAINER, RawMetadataDocument};

/// Upper bound on captured stderr; yt-dlp can be chatty on long downloads.
const STDERR_LIMIT: usize = 64 * 1024;
/// Time between SIGTERM and SIGKILL when stopping a process group.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("extractor exited with {}", exit_label(.code))]
    Failed { code: Option<i32>, stderr: String },
    #[error("extractor did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("extractor returned invalid JSON: {0}")]
    InvalidOutput(#[from] serde_json::Error),
    #[error("extractor I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl ExtractorError {
    /// Captured stderr, when the process got far enough to write any.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::Failed { stderr, .. } => Some(stderr.trim()).filter(|text| !text.is_empty()),
            _ => None,
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (killed by signal)".to_string(),
    }
}

/// Knobs for a stream-to-stdout invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    /// yt-dlp format expression, e.g. `137+bestaudio/best`.
    pub format: String,
    pub merge_container: Option<String>,
    /// Audio codec to convert to (`--extract-audio --audio-format`).
    pub extract_audio: Option<String>,
    /// Subtitle language to request.
    pub subtitles: Option<String>,
    pub embed_thumbnail: bool,
    pub add_metadata: bool,
}

impl StreamOptions {
    /// Video download merged into the default container.
    pub fn video(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            merge_container: Some(MERGE_CONTAINER.to_string()),
            extract_audio: None,
            subtitles: None,
            embed_thumbnail: false,
            add_metadata: false,
        }
    }

    /// Audio-only download converted to `codec`.
    pub fn audio(format: impl Into<String>, codec: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            merge_container: None,
            extract_audio: Some(codec.into()),
            subtitles: None,
            embed_thumbnail: false,
            add_metadata: false,
        }
    }
}

pub fn metadata_args(url: &str) -> Vec<String> {
    let mut args = vec![
        "--dump-single-json".to_string(),
        "--skip-download".to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--no-progress".to_string(),
        "--no-check-certificates".to_string(),
        "--prefer-free-formats".to_string(),
    ];
    push_url(&mut args, url);
    args
}

pub fn playlist_args(url: &str) -> Vec<String> {
    let mut args = vec![
        "--dump-json".to_string(),
        "--flat-playlist".to_string(),
        "--no-warnings".to_string(),
        "--no-progress".to_string(),
        "--no-check-certificates".to_string(),
    ];
    push_url(&mut args, url);
    args
}

pub fn stream_args(url: &str, options: &StreamOptions) -> Vec<String> {
    let mut args = vec![
        "--format".to_string(),
        options.format.clone(),
        "--output".to_string(),
        "-".to_string(),
        "--no-warnings".to_string(),
        "--no-progress".to_string(),
        "--no-playlist".to_string(),
    ];
    if let Some(container) = &options.merge_container {
        args.push("--merge-output-format".to_string());
        args.push(container.clone());
    }
    if let Some(codec) = &options.extract_audio {
        args.push("--extract-audio".to_string());
        args.push("--audio-format".to_string());
        args.push(codec.clone());
    }
    if let Some(language) = &options.subtitles {
        args.push("--write-sub".to_string());
        args.push("--sub-lang".to_string());
        args.push(language.clone());
    }
    if options.embed_thumbnail {
        args.push("--embed-thumbnail".to_string());
    }
    if options.add_metadata {
        args.push("--add-metadata".to_string());
    }
    push_url(&mut args, url);
    args
}

fn push_url(args: &mut Vec<String>, url: &str) {
    args.push("--".to_string());
    args.push(url.trim().to_string());
}

/// Fully collected result of a short-lived invocation.
#[derive(Debug)]
pub struct CollectedOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// A running stream-to-stdout process. The permit, when present, keeps a
/// concurrency slot until the process has been reaped.
#[derive(Debug)]
pub struct StreamingProcess {
    pub child: GroupChild,
    pub permit: Option<OwnedSemaphorePermit>,
}

/// Extractor child that leads its own process group. Dropping it before the
/// child has been reaped sends SIGKILL to the whole group, so helpers such
/// as ffmpeg cannot outlive an abandoned request.
#[derive(Debug)]
pub struct GroupChild {
    child: Child,
    group: Option<u32>,
}

impl GroupChild {
    fn new(child: Child) -> Self {
        let group = child.id();
        Self { child, group }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Cancel safe: the group stays armed until the exit status is in hand.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.group = None;
        Ok(status)
    }

    /// SIGTERM to the group, a short grace period, then SIGKILL. Always
    /// reaps the child.
    pub async fn terminate(&mut self) {
        terminate(&mut self.child).await;
        self.group = None;
    }
}

impl Drop for GroupChild {
    fn drop(&mut self) {
        if let Some(pid) = self.group.take() {
            debug!(pid, "extractor dropped while running, killing its process group");
            signal_group(pid, GroupSignal::Kill);
        }
    }
}

/// Handle on the yt-dlp executable, shared by every request.
#[derive(Debug, Clone)]
pub struct Extractor {
    program: PathBuf,
    timeout: Option<Duration>,
    slots: Option<Arc<Semaphore>>,
}

impl Extractor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: None,
            slots: None,
        }
    }

    /// Deadline for metadata and playlist calls. Streams are never timed out.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Caps the number of extractor processes alive at once.
    pub fn with_max_concurrent(mut self, limit: Option<usize>) -> Self {
        self.slots = limit
            .filter(|limit| *limit > 0)
            .map(|limit| Arc::new(Semaphore::new(limit)));
        self
    }

    /// Runs `--dump-single-json` and parses the document.
    pub async fn fetch_metadata(&self, url: &str) -> Result<RawMetadataDocument, ExtractorError> {
        let output = self.run_collect(metadata_args(url)).await?;
        if !output.status.success() {
            return Err(ExtractorError::Failed {
                code: output.status.code(),
                stderr: output.stderr,
            });
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    /// Runs the flat playlist listing. A non-zero exit is returned as-is
    /// because partial NDJSON output is still usable.
    pub async fn fetch_playlist(&self, url: &str) -> Result<CollectedOutput, ExtractorError> {
        self.run_collect(playlist_args(url)).await
    }

    /// Starts a stream-to-stdout process with both pipes attached.
    pub async fn spawn_stream(
        &self,
        url: &str,
        options: &StreamOptions,
    ) -> Result<StreamingProcess, ExtractorError> {
        let permit = self.acquire().await;
        let child = self.spawn(&stream_args(url, options))?;
        info!(format = %options.format, pid = ?child.id(), "extractor stream started");
        Ok(StreamingProcess { child, permit })
    }

    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        let slots = self.slots.clone()?;
        slots.acquire_owned().await.ok()
    }

    fn spawn(&self, args: &[String]) -> Result<GroupChild, ExtractorError> {
        let mut std_command = std::process::Command::new(&self.program);
        std_command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so ffmpeg children die with yt-dlp.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut std_command, 0);
        let mut command = Command::from(std_command);
        command.kill_on_drop(true);
        let child = command.spawn().map_err(|source| ExtractorError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;
        Ok(GroupChild::new(child))
    }

    async fn run_collect(&self, args: Vec<String>) -> Result<CollectedOutput, ExtractorError> {
        let _permit = self.acquire().await;
        let mut child = self.spawn(&args)?;
        debug!(pid = ?child.id(), "extractor started");

        let stdout = child.take_stdout();
        let stderr = child.take_stderr();
        let stdout_task = tokio::spawn(async move {
            let mut buffer = Vec::new();
            if let Some(mut pipe) = stdout {
                pipe.read_to_end(&mut buffer).await?;
            }
            Ok::<_, io::Error>(buffer)
        });
        let stderr_task = tokio::spawn(async move {
            match stderr {
                Some(pipe) => drain_stderr(pipe).await,
                None => String::new(),
            }
        });

        let status = match self.timeout {
            Some(limit) => {
                let waited = tokio::time::timeout(limit, child.wait()).await;
                match waited {
                    Ok(status) => status?,
                    Err(_) => {
                        warn!(?limit, "extractor timed out, terminating");
                        child.terminate().await;
                        return Err(ExtractorError::TimedOut(limit));
                    }
                }
            }
            None => child.wait().await?,
        };

        let stdout = stdout_task.await.map_err(io::Error::other)??;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            warn!(status = %status, "extractor failed");
        }
        Ok(CollectedOutput {
            status,
            stdout,
            stderr,
        })
    }
}

/// Reads stderr to EOF, logging each line at debug and keeping at most
/// `STDERR_LIMIT` bytes for diagnostics.
pub(crate) async fn drain_stderr<R>(pipe: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut captured = String::new();
    let mut lines = BufReader::new(pipe).split(b'\n');
    loop {
        match lines.next_segment().await {
            Ok(Some(raw)) => {
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end();
                debug!(target: "aquaseal_tools::extractor::stderr", "{line}");
                if captured.len() + line.len() < STDERR_LIMIT {
                    captured.push_str(line);
                    captured.push('\n');
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!("stderr read failed: {err}");
                break;
            }
        }
    }
    captured
}

async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id()
        && signal_group(pid, GroupSignal::Terminate)
    {
        if tokio::time::timeout(TERMINATE_GRACE, child.wait())
            .await
            .is_ok()
        {
            return;
        }
        signal_group(pid, GroupSignal::Kill);
    }
    if let Err(err) = child.start_kill() {
        debug!("start_kill: {err}");
    }
    if let Err(err) = child.wait().await {
        debug!("reaping terminated extractor: {err}");
    }
}

#[derive(Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, kind: GroupSignal) -> bool {
    use nix::{
        sys::signal::{Signal, killpg},
        unistd::Pid,
    };

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    let signal = match kind {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    killpg(Pid::from_raw(raw), signal).is_ok()
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _kind: GroupSignal) -> bool {
    false
}
