//! Stream muxing through an external ffmpeg binary.
//!
//! The archiver hands the best video and audio variant to an [`Encoder`], which
//! copies both into a single container without re-encoding.

use crate::progress::{clamp_fraction, ProgressSink};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::debug;

/// Number of trailing stderr lines kept in a failure message.
const STDERR_TAIL_LINES: usize = 5;

/// Error type for muxing operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// ffmpeg exited with non-zero status
    #[error("ffmpeg failed with exit code {code}: {stderr}")]
    FfmpegFailed { code: i32, stderr: String },

    /// ffmpeg was terminated by signal
    #[error("ffmpeg process was terminated by signal")]
    FfmpegTerminated,

    /// IO error while running ffmpeg
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inputs and output of one mux job.
#[derive(Debug, Clone)]
pub struct MuxRequest {
    /// Video input, a URL or a local path
    pub video: String,
    /// Audio input, a URL or a local path
    pub audio: String,
    /// Output file; its extension selects the container
    pub output: PathBuf,
    /// Expected playback length, used to compute progress fractions
    pub duration: Option<Duration>,
}

/// Something that can combine a video and an audio input into one file.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Produce `request.output`, reporting progress as it goes.
    async fn mux(&self, request: &MuxRequest, progress: &dyn ProgressSink)
        -> Result<(), EncodeError>;
}

/// Build an ffmpeg command that stream-copies both inputs into the output
///
/// Creates a Command configured with:
/// - Both inputs, video first
/// - The first video stream of input 0 and the first audio stream of input 1
/// - Stream copy (no re-encoding)
/// - Machine readable progress on stdout
///
/// # Arguments
/// * `binary` - Path to the ffmpeg executable
/// * `request` - Inputs, output and duration of the job
///
/// # Returns
/// A configured Command ready for execution
pub fn build_mux_command(binary: &Path, request: &MuxRequest) -> Command {
    let mut cmd = Command::new(binary);

    cmd.arg("-hide_banner")
        .arg("-nostdin")
        .arg("-y")
        .arg("-i")
        .arg(&request.video)
        .arg("-i")
        .arg(&request.audio)
        .arg("-map")
        .arg("0:v:0")
        .arg("-map")
        .arg("1:a:0")
        .arg("-c")
        .arg("copy")
        .arg("-progress")
        .arg("pipe:1")
        .arg("-nostats")
        .arg(&request.output);

    cmd
}

/// Turn one line of ffmpeg `-progress` output into a completed fraction.
///
/// `out_time_us` and `out_time_ms` both carry microseconds. Without a known
/// duration only the final `progress=end` line yields a value.
pub fn parse_progress_line(line: &str, duration: Option<Duration>) -> Option<f64> {
    let (key, value) = line.trim().split_once('=')?;

    match key {
        "progress" if value == "end" => Some(1.0),
        "out_time_us" | "out_time_ms" => {
            let total = duration?.as_micros();
            if total == 0 {
                return None;
            }
            let elapsed: i64 = value.parse().ok()?;
            Some(clamp_fraction(elapsed as f64 / total as f64))
        }
        _ => None,
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// [`Encoder`] backed by an ffmpeg executable.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    binary: PathBuf,
}

impl FfmpegEncoder {
    /// Encoder running the ffmpeg binary at `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Path of the ffmpeg binary.
    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn mux(
        &self,
        request: &MuxRequest,
        progress: &dyn ProgressSink,
    ) -> Result<(), EncodeError> {
        debug!(output = %request.output.display(), "Starting ffmpeg mux");

        let mut child = tokio::process::Command::from(build_mux_command(&self.binary, request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // stderr is drained concurrently so a chatty ffmpeg never blocks on a full pipe.
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if let Some(fraction) = parse_progress_line(&line, request.duration) {
                    progress.report(fraction);
                }
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            Ok(())
        } else {
            match status.code() {
                Some(code) => Err(EncodeError::FfmpegFailed {
                    code,
                    stderr: stderr_tail(&stderr),
                }),
                None => Err(EncodeError::FfmpegTerminated),
            }
        }
    }
}
