#![forbid(unsafe_code)]

//! Streams extractor stdout to an HTTP body.
//!
//! A download hands back a [`RelayBody`] only once the first chunk has
//! arrived, so failures that happen before any byte can still become a
//! proper error response. After that the body is a plain byte stream; if it
//! is dropped before EOF the supervisor stops the extractor's process group.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::{process::ChildStdout, sync::OwnedSemaphorePermit, task::JoinHandle};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{debug, info, warn};

use crate::{
    extractor::{
        Extractor, ExtractorError, GroupChild, StreamOptions, StreamingProcess, drain_stderr,
    },
    metadata::BEST_FORMAT,
};

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Extractor(#[from] ExtractorError),
    #[error("extractor exited with status {code:?} before sending any data")]
    EarlyExit { code: Option<i32>, stderr: String },
    #[error("extractor stdout was not captured")]
    MissingPipe,
    #[error("reading extractor output failed: {0}")]
    Read(#[from] io::Error),
}

impl RelayError {
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::Extractor(err) => err.diagnostic(),
            Self::EarlyExit { stderr, .. } => Some(stderr.trim()).filter(|text| !text.is_empty()),
            _ => None,
        }
    }
}

/// How the extractor process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed,
    Failed { code: Option<i32>, stderr: String },
    /// The body was dropped before EOF and the process group was stopped.
    Cancelled,
}

pub struct RelayStart {
    pub body: RelayBody,
    /// Resolves once the process has been reaped.
    pub outcome: JoinHandle<RelayOutcome>,
}

/// Turns a client format id into a yt-dlp selector. A bare id is paired
/// with the best audio track, falling back to the best single file.
pub fn format_selector(format_id: Option<&str>) -> String {
    match format_id.map(str::trim) {
        None | Some("") | Some(BEST_FORMAT) => BEST_FORMAT.to_string(),
        Some(id) => format!("{id}+bestaudio/best"),
    }
}

/// Spawns the extractor and waits for its first stdout chunk.
pub async fn start(
    extractor: &Extractor,
    url: &str,
    options: &StreamOptions,
) -> Result<RelayStart, RelayError> {
    let StreamingProcess { mut child, permit } = extractor.spawn_stream(url, options).await?;
    let Some(stdout) = child.take_stdout() else {
        child.terminate().await;
        return Err(RelayError::MissingPipe);
    };
    let stderr_task = child.take_stderr().map(|pipe| tokio::spawn(drain_stderr(pipe)));
    let mut stdout = ReaderStream::with_capacity(stdout, CHUNK_SIZE);

    let first = match stdout.next().await {
        Some(Ok(chunk)) => Some(chunk),
        Some(Err(err)) => {
            child.terminate().await;
            return Err(RelayError::Read(err));
        }
        None => None,
    };

    if first.is_none() {
        let status = child.wait().await?;
        if !status.success() {
            let stderr = collect_stderr(stderr_task).await;
            warn!(status = %status, "extractor failed before sending data");
            return Err(RelayError::EarlyExit {
                code: status.code(),
                stderr,
            });
        }
        debug!("extractor finished without output");
    }

    let signals = StopSignals::default();
    let outcome = tokio::spawn(supervise(child, signals.clone(), stderr_task, permit));
    Ok(RelayStart {
        body: RelayBody {
            first,
            stdout,
            finished: false,
            signals,
        },
        outcome,
    })
}

/// Ways the body side asks the supervisor to stop the extractor early.
#[derive(Clone, Default)]
struct StopSignals {
    client_gone: CancellationToken,
    read_failed: CancellationToken,
}

enum Stop {
    ClientGone,
    ReadFailed,
}

async fn supervise(
    mut child: GroupChild,
    signals: StopSignals,
    stderr_task: Option<JoinHandle<String>>,
    permit: Option<OwnedSemaphorePermit>,
) -> RelayOutcome {
    let _permit = permit;
    let waited = tokio::select! {
        status = child.wait() => Ok(status),
        () = signals.client_gone.cancelled() => Err(Stop::ClientGone),
        () = signals.read_failed.cancelled() => Err(Stop::ReadFailed),
    };

    match waited {
        Err(Stop::ClientGone) => {
            child.terminate().await;
            info!("client disconnected, extractor stopped");
            RelayOutcome::Cancelled
        }
        Err(Stop::ReadFailed) => {
            child.terminate().await;
            let stderr = collect_stderr(stderr_task).await;
            warn!("extractor output unreadable, extractor stopped");
            RelayOutcome::Failed { code: None, stderr }
        }
        Ok(Ok(status)) if status.success() => {
            debug!("extractor stream completed");
            RelayOutcome::Completed
        }
        Ok(Ok(status)) => {
            let stderr = collect_stderr(stderr_task).await;
            warn!(status = %status, "extractor failed mid-stream, response truncated");
            RelayOutcome::Failed {
                code: status.code(),
                stderr,
            }
        }
        Ok(Err(err)) => {
            warn!("waiting on extractor failed: {err}");
            RelayOutcome::Failed {
                code: None,
                stderr: err.to_string(),
            }
        }
    }
}

async fn collect_stderr(task: Option<JoinHandle<String>>) -> String {
    match task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// Response body fed by extractor stdout. Dropping it before EOF cancels the
/// download.
pub struct RelayBody {
    first: Option<Bytes>,
    stdout: ReaderStream<ChildStdout>,
    finished: bool,
    signals: StopSignals,
}

impl Stream for RelayBody {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(chunk) = this.first.take() {
            return Poll::Ready(Some(Ok(chunk)));
        }
        if this.finished {
            return Poll::Ready(None);
        }
        match this.stdout.poll_next_unpin(cx) {
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(err))) => {
                warn!("reading extractor stdout failed: {err}");
                this.finished = true;
                this.signals.read_failed.cancel();
                Poll::Ready(Some(Err(err)))
            }
            other => other,
        }
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        if !self.finished {
            self.signals.client_gone.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::tests::{install_stub, read_pid};
    #[cfg(target_os = "linux")]
    use crate::extractor::tests::{assert_stops, helper_then_block};
    use anyhow::Result;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn collect(body: RelayBody) -> Vec<u8> {
        body.map(|chunk| chunk.unwrap())
            .collect::<Vec<_>>()
            .await
            .concat()
    }

    #[test]
    fn selectors_pair_ids_with_best_audio() {
        assert_eq!(format_selector(Some("137")), "137+bestaudio/best");
        assert_eq!(format_selector(Some("best")), "best");
        assert_eq!(format_selector(Some("  ")), "best");
        assert_eq!(format_selector(None), "best");
    }

    #[tokio::test]
    async fn relays_stdout_and_completes() -> Result<()> {
        let dir = tempdir()?;
        let stub = install_stub(
            dir.path(),
            "echo 'progress noise' >&2\nprintf 'hello '\nsleep 0.1\nprintf 'world'",
        )?;
        let start = start(&Extractor::new(stub), "u", &StreamOptions::video("best")).await?;
        assert_eq!(collect(start.body).await, b"hello world");
        assert_eq!(start.outcome.await?, RelayOutcome::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn failure_before_first_byte_is_an_error() -> Result<()> {
        let dir = tempdir()?;
        let stub = install_stub(dir.path(), "echo 'ERROR: Requested format is not available' >&2\nexit 2")?;
        let Err(err) = start(&Extractor::new(stub), "u", &StreamOptions::video("best")).await else {
            panic!("expected an error");
        };
        assert!(matches!(err, RelayError::EarlyExit { code: Some(2), .. }));
        assert_eq!(err.diagnostic(), Some("ERROR: Requested format is not available"));
        Ok(())
    }

    #[tokio::test]
    async fn clean_exit_without_output_is_an_empty_body() -> Result<()> {
        let dir = tempdir()?;
        let stub = install_stub(dir.path(), "exit 0")?;
        let start = start(&Extractor::new(stub), "u", &StreamOptions::video("best")).await?;
        assert!(collect(start.body).await.is_empty());
        assert_eq!(start.outcome.await?, RelayOutcome::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn failure_after_data_truncates() -> Result<()> {
        let dir = tempdir()?;
        let stub = install_stub(dir.path(), "printf 'partial'\necho 'ERROR: lost connection' >&2\nexit 4")?;
        let start = start(&Extractor::new(stub), "u", &StreamOptions::video("best")).await?;
        assert_eq!(collect(start.body).await, b"partial");
        match start.outcome.await? {
            RelayOutcome::Failed { code, stderr } => {
                assert_eq!(code, Some(4));
                assert!(stderr.contains("lost connection"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn read_failure_is_reported_as_a_failure() -> Result<()> {
        let dir = tempdir()?;
        let ready = dir.path().join("ready.pid");
        let stub = install_stub(
            dir.path(),
            &format!(
                "echo 'ERROR: broken pipe' >&2\necho $$ > '{}'\nexec sleep 30",
                ready.display()
            ),
        )?;
        let StreamingProcess { mut child, permit } = Extractor::new(stub)
            .spawn_stream("u", &StreamOptions::video("best"))
            .await?;
        read_pid(&ready).await?;
        let stderr_task = child.take_stderr().map(|pipe| tokio::spawn(drain_stderr(pipe)));
        let signals = StopSignals::default();
        signals.read_failed.cancel();

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            supervise(child, signals, stderr_task, permit),
        )
        .await?;
        match outcome {
            RelayOutcome::Failed { code, stderr } => {
                assert_eq!(code, None);
                assert!(stderr.contains("broken pipe"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn abort_before_first_byte_kills_the_whole_group() -> Result<()> {
        let dir = tempdir()?;
        let pid_file = dir.path().join("helper.pid");
        let stub = install_stub(dir.path(), &helper_then_block(&pid_file))?;
        let extractor = Extractor::new(stub);
        let options = StreamOptions::video("best");

        let aborted =
            tokio::time::timeout(Duration::from_millis(500), start(&extractor, "u", &options)).await;
        assert!(aborted.is_err());

        let helper = read_pid(&pid_file).await?;
        assert_stops(helper).await;
        Ok(())
    }

    #[tokio::test]
    async fn dropping_body_stops_the_extractor() -> Result<()> {
        let dir = tempdir()?;
        let stub = install_stub(dir.path(), "printf 'chunk'\nexec sleep 30")?;
        let mut start = start(&Extractor::new(stub), "u", &StreamOptions::video("best")).await?;
        let first = start.body.next().await.expect("first chunk")?;
        assert_eq!(&first[..], b"chunk");
        drop(start.body);

        let outcome = tokio::time::timeout(Duration::from_secs(5), start.outcome).await??;
        assert_eq!(outcome, RelayOutcome::Cancelled);
        Ok(())
    }
}
