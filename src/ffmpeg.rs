//! FFmpeg and ffprobe process plumbing
//!
//! A small argument builder for one-shot `ffmpeg` invocations, a runner
//! with a wall-clock timeout, duration probing via `ffprobe` JSON output,
//! and [`ManagedProcess`] for long-running children (segmenter, recorder)
//! that must be stopped gracefully.

use serde::Deserialize;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use crate::common::{FusionError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Check that a tool is on PATH
pub fn require_tool(tool: &str) -> Result<()> {
    which::which(tool)
        .map(|_| ())
        .map_err(|_| FusionError::ToolNotFound { tool: tool.to_string() })
}

/// Builder for ffmpeg command lines
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    input: String,
    output: String,
    input_args: Vec<String>,
    output_args: Vec<String>,
    overwrite: bool,
    log_level: String,
}

impl FfmpegCommand {
    /// `input` may be a path or a URL such as `udp://127.0.0.1:1234`
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            overwrite: true,
            log_level: "error".to_string(),
        }
    }

    /// Add an argument placed before `-i`
    pub fn input_arg(mut self, arg: impl Into<String>) -> Self {
        self.input_args.push(arg.into());
        self
    }

    /// Add an argument placed after the input
    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Seek the input before decoding
    pub fn seek(self, seconds: f64) -> Self {
        self.input_arg("-ss").input_arg(format!("{:.3}", seconds))
    }

    /// Limit the amount of input read
    pub fn duration(self, seconds: f64) -> Self {
        self.input_arg("-t").input_arg(format!("{:.3}", seconds))
    }

    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:v").output_arg(codec)
    }

    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:a").output_arg(codec)
    }

    pub fn crf(self, crf: u8) -> Self {
        self.output_arg("-crf").output_arg(crf.to_string())
    }

    pub fn preset(self, preset: impl Into<String>) -> Self {
        self.output_arg("-preset").output_arg(preset)
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Full argument list, without the program name
    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.overwrite {
            args.push("-y".to_string());
        }
        args.push("-v".to_string());
        args.push(self.log_level.clone());

        args.extend(self.input_args.iter().cloned());
        args.push("-i".to_string());
        args.push(self.input.clone());
        args.extend(self.output_args.iter().cloned());
        args.push(self.output.clone());

        args
    }

    /// Run to completion, killing the process after `timeout`
    ///
    /// # Errors
    /// * `ToolNotFound` - ffmpeg is not installed
    /// * `Timeout` - The process ran longer than `timeout`
    /// * `CommandFailed` - Non-zero exit, with captured stderr
    #[instrument(skip(self), fields(output = %self.output))]
    pub fn run(&self, timeout: Option<Duration>) -> Result<()> {
        require_tool("ffmpeg")?;
        let args = self.build_args();
        debug!("Running: ffmpeg {}", args.join(" "));

        let mut command = Command::new("ffmpeg");
        command.args(&args);
        let (status, stderr) = run_captured(command, "ffmpeg", timeout)?;

        if status.success() {
            Ok(())
        } else {
            Err(FusionError::CommandFailed {
                tool: "ffmpeg".to_string(),
                message: format!("exited with {}", status),
                stderr: Some(stderr),
            })
        }
    }
}

impl FfmpegCommand {
    /// Run with the output sent to stdout (`pipe:1`) and return the bytes
    ///
    /// # Errors
    /// Same as [`FfmpegCommand::run`].
    pub fn run_to_stdout(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        require_tool("ffmpeg")?;
        let args = self.build_args();
        debug!("Running: ffmpeg {}", args.join(" "));

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take();
        let stdout_reader = thread::spawn(move || {
            let mut bytes = Vec::new();
            if let Some(mut pipe) = stdout {
                let _ = pipe.read_to_end(&mut bytes);
            }
            bytes
        });
        let stderr_reader = drain_stderr(&mut child);

        let status = wait_with_timeout(&mut child, "ffmpeg", timeout)?;
        let bytes = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        if status.success() {
            Ok(bytes)
        } else {
            Err(FusionError::CommandFailed {
                tool: "ffmpeg".to_string(),
                message: format!("exited with {}", status),
                stderr: Some(stderr),
            })
        }
    }
}

/// Spawn `command`, wait up to `timeout`, and return its status and stderr
fn run_captured(mut command: Command, tool: &str, timeout: Option<Duration>) -> Result<(ExitStatus, String)> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    let stderr_reader = drain_stderr(&mut child);
    let status = wait_with_timeout(&mut child, tool, timeout)?;
    let stderr = stderr_reader.join().unwrap_or_default();

    Ok((status, stderr))
}

fn drain_stderr(child: &mut Child) -> JoinHandle<String> {
    let stderr = child.stderr.take();
    thread::spawn(move || {
        let mut text = String::new();
        if let Some(mut pipe) = stderr {
            let _ = pipe.read_to_string(&mut text);
        }
        text
    })
}

fn wait_with_timeout(child: &mut Child, tool: &str, timeout: Option<Duration>) -> Result<ExitStatus> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                warn!("{} timed out after {:.1}s, killing process", tool, limit.as_secs_f64());
                let _ = child.kill();
                let _ = child.wait();
                return Err(FusionError::Timeout {
                    operation: tool.to_string(),
                    seconds: limit.as_secs_f64(),
                });
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Parse the container duration out of `ffprobe -print_format json -show_format` output
pub fn parse_probe_duration(json: &str) -> Result<f64> {
    let probe: FfprobeOutput = serde_json::from_str(json)?;
    Ok(probe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0))
}

/// Container duration of a media file in seconds
///
/// # Errors
/// * `ToolNotFound` - ffprobe is not installed
/// * `Timeout` - ffprobe did not answer within `timeout`
/// * `CommandFailed` - ffprobe could not read the file (e.g. still being written)
#[instrument(skip(path), fields(path = %path.as_ref().display()))]
pub fn probe_duration(path: impl AsRef<Path>, timeout: Duration) -> Result<f64> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(FusionError::VideoNotFound { path: path.display().to_string() });
    }
    require_tool("ffprobe")?;

    let mut child = Command::new("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    let stdout = child.stdout.take();
    let reader = thread::spawn(move || {
        let mut text = String::new();
        if let Some(mut pipe) = stdout {
            let _ = pipe.read_to_string(&mut text);
        }
        text
    });

    let status = wait_with_timeout(&mut child, "ffprobe", Some(timeout))?;
    let stdout = reader.join().unwrap_or_default();

    if !status.success() {
        return Err(FusionError::CommandFailed {
            tool: "ffprobe".to_string(),
            message: format!("exited with {}", status),
            stderr: None,
        });
    }

    parse_probe_duration(&stdout)
}

/// A long-running child process that is asked to quit before being killed
///
/// ffmpeg finishes the current segment/container and exits when it reads
/// `q` on stdin, so stdin is kept as a pipe.
pub struct ManagedProcess {
    name: String,
    child: Child,
}

impl ManagedProcess {
    /// Spawn `program` with `args`, discarding its output
    pub fn spawn(name: &str, program: &str, args: &[String]) -> Result<Self> {
        require_tool(program)?;
        debug!("Spawning {}: {} {}", name, program, args.join(" "));

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        info!("{} started (PID: {})", name, child.id());
        Ok(Self { name: name.to_string(), child })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Whether the process is still running
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit status if the process has ended
    pub fn try_status(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Ask the process to quit, wait up to `grace`, then kill it
    ///
    /// After a kill, the process is reaped with a further bounded wait.
    pub fn stop(&mut self, grace: Duration) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(Some(status));
        }

        if let Some(stdin) = self.child.stdin.as_mut() {
            let _ = stdin.write_all(b"q");
            let _ = stdin.flush();
        }
        // Closing stdin also signals EOF to ffmpeg
        drop(self.child.stdin.take());

        match wait_with_timeout(&mut self.child, &self.name, Some(grace)) {
            Ok(status) => {
                info!("{} stopped ({})", self.name, status);
                Ok(Some(status))
            }
            Err(FusionError::Timeout { .. }) => {
                // wait_with_timeout already killed and reaped the process
                warn!("{} did not stop within {:.0}s and was killed", self.name, grace.as_secs_f64());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("name", &self.name)
            .field("pid", &self.child.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_command_args() {
        let args = FfmpegCommand::new("rec.mxf", "clips/chapter_001_Intro.mp4")
            .seek(12.5)
            .duration(30.0)
            .video_codec("libx264")
            .preset("ultrafast")
            .crf(28)
            .audio_codec("aac")
            .output_args(["-avoid_negative_ts", "make_zero"])
            .build_args();

        assert_eq!(
            args,
            vec![
                "-y", "-v", "error", "-ss", "12.500", "-t", "30.000", "-i", "rec.mxf",
                "-c:v", "libx264", "-preset", "ultrafast", "-crf", "28", "-c:a", "aac",
                "-avoid_negative_ts", "make_zero", "clips/chapter_001_Intro.mp4",
            ]
        );
    }

    #[test]
    fn test_no_overwrite_flag() {
        let args = FfmpegCommand::new("in.mp4", "out.mp4").overwrite(false).log_level("warning").build_args();
        assert_eq!(args[0], "-v");
        assert_eq!(args[1], "warning");
    }

    #[test]
    fn test_parse_probe_duration() {
        let json = r#"{"format": {"filename": "chunk_0000_20s.mp4", "duration": "19.433000", "size": "912345"}}"#;
        assert!((parse_probe_duration(json).unwrap() - 19.433).abs() < 1e-9);

        assert_eq!(parse_probe_duration(r#"{"format": {}}"#).unwrap(), 0.0);
        assert_eq!(parse_probe_duration("{}").unwrap(), 0.0);
        assert!(parse_probe_duration("not json").is_err());
    }

    #[test]
    fn test_probe_missing_file() {
        let result = probe_duration("definitely_missing_chunk.mp4", Duration::from_secs(5));
        assert!(matches!(result, Err(FusionError::VideoNotFound { .. })));
    }

    #[test]
    fn test_require_unknown_tool() {
        let result = require_tool("no-such-tool-for-mediafusion");
        assert!(matches!(result, Err(FusionError::ToolNotFound { .. })));
    }
}
