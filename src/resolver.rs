#![forbid(unsafe_code)]

//! yt-dlp invocations.
//!
//! Two entry points share one subprocess contract: `resolve_metadata` buffers
//! `--dump-single-json` output and parses it, `open_stream` hands back the
//! last stage's stdout so the relay can forward it chunk by chunk. Audio goes
//! through an ffmpeg stage, since yt-dlp skips its post-processors when
//! writing to stdout.
//!
//! Each extractor leads its own process group and its transcoder joins it, so
//! anything yt-dlp forks (ffmpeg for merging) is reachable too. Every path
//! that gives up on a download goes through `terminate`: SIGTERM to the
//! group, then SIGKILL once the grace period is over.

use std::{
    collections::VecDeque,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    process::{Child, ChildStderr, ChildStdout, Command},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    error::FetchError,
    video::{FormatSpec, MediaFormat, Quality, VideoId},
};

/// Number of stderr lines kept around for failure classification.
const STDERR_TAIL_LINES: usize = 40;

/// Picked up from the working directory when present.
pub const DEFAULT_COOKIES_FILE: &str = "cookies.txt";

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub program: PathBuf,
    pub transcoder: PathBuf,
    pub cookies_file: Option<PathBuf>,
    pub metadata_timeout: Duration,
    pub download_timeout: Duration,
    pub kill_grace: Duration,
    pub audio_bitrate: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("yt-dlp"),
            transcoder: PathBuf::from("ffmpeg"),
            cookies_file: Some(PathBuf::from(DEFAULT_COOKIES_FILE)),
            metadata_timeout: Duration::from_secs(60),
            download_timeout: Duration::from_secs(600),
            kill_grace: Duration::from_secs(3),
            audio_bitrate: "192K".to_string(),
        }
    }
}

/// Subset of the `--dump-single-json` payload used by the cache and `/info`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VideoMetadata {
    pub id: Option<String>,
    pub title: Option<String>,
    pub fulltitle: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub uploader: Option<String>,
    pub channel: Option<String>,
    pub view_count: Option<u64>,
    pub upload_date: Option<String>,
    pub formats: Vec<FormatInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FormatInfo {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub height: Option<u32>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
}

impl FormatInfo {
    fn has_video(&self) -> bool {
        self.height.is_some() && self.vcodec.as_deref() != Some("none")
    }

    fn is_audio_only(&self) -> bool {
        self.vcodec.as_deref() == Some("none") && self.acodec.as_deref() != Some("none")
    }

    fn size(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx)
    }
}

/// One entry of the `formats` array returned by `/info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatSummary {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub quality: String,
    pub size: Option<u64>,
}

impl VideoMetadata {
    pub fn display_title(&self) -> Option<&str> {
        self.title.as_deref().or(self.fulltitle.as_deref())
    }

    pub fn uploader_name(&self) -> Option<&str> {
        self.uploader.as_deref().or(self.channel.as_deref())
    }

    pub fn duration_secs(&self) -> Option<u64> {
        self.duration
            .filter(|value| value.is_finite() && *value >= 0.0)
            .map(|value| value.round() as u64)
    }

    /// Lists the quality tiers this source can actually satisfy, plus the
    /// audio-only extraction.
    pub fn format_summary(&self) -> Vec<FormatSummary> {
        let video: Vec<&FormatInfo> = self.formats.iter().filter(|f| f.has_video()).collect();
        let mut summary = Vec::new();

        if let Some(max_height) = video.iter().filter_map(|f| f.height).max() {
            for quality in Quality::ALL {
                let ceiling = match quality.height() {
                    None => max_height,
                    Some(height) if height <= max_height => height,
                    Some(_) => continue,
                };
                let chosen = video
                    .iter()
                    .filter_map(|f| f.height)
                    .filter(|height| *height <= ceiling)
                    .max();
                let size = chosen.and_then(|height| {
                    video
                        .iter()
                        .filter(|f| f.height == Some(height))
                        .filter_map(|f| f.size())
                        .max()
                });
                summary.push(FormatSummary {
                    kind: "video",
                    quality: quality.label().to_string(),
                    size,
                });
            }
        }

        if self.formats.iter().any(FormatInfo::is_audio_only) {
            let size = self
                .formats
                .iter()
                .filter(|f| f.is_audio_only())
                .filter_map(|f| f.size())
                .max();
            summary.push(FormatSummary {
                kind: "audio",
                quality: "best".to_string(),
                size,
            });
        }

        summary
    }
}

/// Maps yt-dlp's stderr to the failure taxonomy. Order matters: YouTube
/// prefixes private videos with "Video unavailable", and age gates mention
/// both unavailability and signing in.
pub fn classify_failure(stderr: &str, status: Option<ExitStatus>) -> FetchError {
    let lower = stderr.to_ascii_lowercase();
    let contains_any = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

    if contains_any(&["private video", "video is private"]) {
        return FetchError::PrivateVideo;
    }
    if contains_any(&[
        "sign in to confirm",
        "login required",
        "use --cookies",
        "cookies-from-browser",
        "members-only",
        "confirm your age",
    ]) {
        return FetchError::AuthenticationRequired;
    }
    if contains_any(&[
        "video unavailable",
        "is not available",
        "no longer available",
        "has been removed",
        "does not exist",
        "account associated with this video has been terminated",
    ]) {
        return FetchError::VideoUnavailable;
    }

    let reason = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| match status {
            Some(status) => format!("extractor exited with {status}"),
            None => "extractor failed".to_string(),
        });

    if contains_any(&[
        "http error 5",
        "timed out",
        "connection reset",
        "connection refused",
        "temporary failure in name resolution",
        "network is unreachable",
        "remote end closed connection",
        "incompleteread",
        "unable to download webpage",
    ]) {
        return FetchError::TransientFailure(reason);
    }
    FetchError::GenericFailure(reason)
}

fn group_of(child: &Child) -> Option<Pid> {
    child
        .id()
        .and_then(|pid| i32::try_from(pid).ok())
        .map(Pid::from_raw)
}

fn signal_group(group: Pid, signal: Signal) {
    match killpg(group, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => {
            debug!(group = group.as_raw(), ?signal, %err, "signalling process group failed")
        }
    }
}

/// Asks the whole process group to exit, waits up to `grace` for `children`
/// and then SIGKILLs whatever is left of the group.
pub async fn terminate(group: Option<Pid>, children: &mut [&mut Child], grace: Duration) {
    if let Some(group) = group {
        signal_group(group, Signal::SIGTERM);
    }
    let exited = timeout(grace, async {
        for child in children.iter_mut() {
            let _ = child.wait().await;
        }
    })
    .await
    .is_ok();
    if exited {
        debug!(group = group.map(Pid::as_raw), "extractor exited after SIGTERM");
    } else {
        warn!(
            group = group.map(Pid::as_raw),
            grace_ms = grace.as_millis() as u64,
            "extractor ignored SIGTERM"
        );
    }

    // Stragglers such as an ffmpeg merge outlive the leader otherwise.
    if let Some(group) = group {
        signal_group(group, Signal::SIGKILL);
    }
    for child in children.iter_mut() {
        if matches!(child.try_wait(), Ok(None))
            && let Err(err) = child.kill().await
        {
            warn!(%err, "failed to kill extractor");
        }
    }
}

/// Reads a pipe to the end, keeping only the last lines. Invalid UTF-8 is
/// replaced rather than aborting, so the child never blocks on a full pipe.
async fn read_tail<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut reader = BufReader::new(reader);
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line).trim_end().to_string();
                if text.is_empty() {
                    continue;
                }
                debug!(target: "newtube_gateway::extractor", "{text}");
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(text);
            }
        }
    }
    Vec::from(tail).join("\n")
}

/// One process of a download pipeline plus the task draining its stderr.
#[derive(Debug)]
struct Stage {
    child: Child,
    stderr: JoinHandle<String>,
}

impl Stage {
    fn new(mut child: Child) -> Self {
        let stderr = child.stderr.take();
        let stderr = tokio::spawn(async move {
            match stderr {
                Some(stderr) => read_tail::<ChildStderr>(stderr).await,
                None => String::new(),
            }
        });
        Self { child, stderr }
    }

    async fn wait(&mut self) -> Result<(ExitStatus, String), FetchError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|err| FetchError::GenericFailure(format!("waiting for extractor: {err}")))?;
        let stderr = (&mut self.stderr).await.unwrap_or_default();
        Ok((status, stderr))
    }
}

/// Running download pipeline (`yt-dlp -o -`, optionally piped into ffmpeg)
/// whose stdout is consumed incrementally.
#[derive(Debug)]
pub struct StreamHandle {
    extractor: Stage,
    transcoder: Option<Stage>,
    group: Option<Pid>,
    stdout: ChildStdout,
    kill_grace: Duration,
    settled: bool,
}

impl StreamHandle {
    /// Reads the next chunk of media bytes. Returns `Ok(0)` at end of stream.
    /// Cancel safe.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf).await
    }

    /// Pid of the extractor, which is also the process group id.
    pub fn pid(&self) -> Option<u32> {
        self.extractor.child.id()
    }

    /// Waits for every stage after stdout hit EOF and classifies a non-zero
    /// exit. Extractor errors win over transcoder errors.
    pub async fn finish(mut self) -> Result<(), FetchError> {
        let (status, stderr) = self.extractor.wait().await?;
        let transcoded = match self.transcoder.as_mut() {
            Some(stage) => Some(stage.wait().await?),
            None => None,
        };
        self.settled = true;

        if !status.success() {
            return Err(classify_failure(&stderr, Some(status)));
        }
        if let Some((status, stderr)) = transcoded
            && !status.success()
        {
            let reason = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("no diagnostics");
            return Err(FetchError::GenericFailure(format!(
                "transcoder exited with {status}: {reason}"
            )));
        }
        Ok(())
    }

    pub async fn terminate(mut self) {
        let mut children = vec![&mut self.extractor.child];
        if let Some(stage) = self.transcoder.as_mut() {
            children.push(&mut stage.child);
        }
        terminate(self.group, &mut children, self.kill_grace).await;
        self.extractor.stderr.abort();
        if let Some(stage) = &self.transcoder {
            stage.stderr.abort();
        }
        self.settled = true;
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        // kill_on_drop only reaches the direct children.
        if !self.settled
            && let Some(group) = self.group
        {
            signal_group(group, Signal::SIGKILL);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExternalResolver {
    config: ResolverConfig,
}

impl ExternalResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    fn push_common_args(&self, args: &mut Vec<String>) {
        args.push("--no-playlist".into());
        args.push("--no-warnings".into());
        if let Some(cookies) = &self.config.cookies_file
            && cookies.exists()
        {
            args.push("--cookies".into());
            args.push(cookies.to_string_lossy().into_owned());
        }
    }

    pub fn metadata_args(&self, video_id: &VideoId) -> Vec<String> {
        let mut args = vec!["--dump-single-json".to_string(), "--skip-download".to_string()];
        self.push_common_args(&mut args);
        args.push(video_id.watch_url());
        args
    }

    pub fn stream_args(&self, video_id: &VideoId, spec: FormatSpec) -> Vec<String> {
        let mut args = vec!["--format".to_string(), spec.selector()];
        if spec.format == MediaFormat::Video {
            args.extend(["--merge-output-format", "mp4"].map(String::from));
        }
        args.extend(["--output", "-", "--no-progress", "--quiet"].map(String::from));
        self.push_common_args(&mut args);
        args.push(video_id.watch_url());
        args
    }

    /// ffmpeg arguments that re-encode whatever audio arrives on stdin to MP3
    /// at the configured bitrate.
    pub fn transcode_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-i", "pipe:0", "-vn"]
            .map(String::from)
            .into();
        args.extend(["-codec:a".to_string(), "libmp3lame".to_string()]);
        args.extend(["-b:a".to_string(), self.config.audio_bitrate.to_ascii_lowercase()]);
        args.extend(["-f", "mp3", "pipe:1"].map(String::from));
        args
    }

    /// `group` 0 makes the child the leader of a new process group.
    fn spawn(
        &self,
        program: &Path,
        args: &[String],
        stdin: Stdio,
        group: i32,
    ) -> Result<Child, FetchError> {
        Command::new(program)
            .args(args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(group)
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                FetchError::TransientFailure(format!("spawning {}: {err}", program.display()))
            })
    }

    /// Runs a metadata lookup to completion under the metadata timeout.
    pub async fn resolve_metadata(&self, video_id: &VideoId) -> Result<VideoMetadata, FetchError> {
        let mut child = self.spawn(
            &self.config.program,
            &self.metadata_args(video_id),
            Stdio::null(),
            0,
        )?;
        let group = group_of(&child);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let collect = async {
            let read_stdout = async {
                let mut buf = Vec::new();
                if let Some(mut stdout) = stdout {
                    stdout.read_to_end(&mut buf).await?;
                }
                Ok::<_, io::Error>(buf)
            };
            let read_stderr = async {
                match stderr {
                    Some(stderr) => read_tail(stderr).await,
                    None => String::new(),
                }
            };
            let (stdout, stderr) = tokio::join!(read_stdout, read_stderr);
            let status = child.wait().await?;
            Ok::<_, io::Error>((status, stdout?, stderr))
        };

        let outcome = timeout(self.config.metadata_timeout, collect).await;
        let (status, stdout, stderr) = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                terminate(group, &mut [&mut child], self.config.kill_grace).await;
                return Err(FetchError::TransientFailure(format!(
                    "reading extractor output: {err}"
                )));
            }
            Err(_) => {
                warn!(%video_id, timeout_secs = self.config.metadata_timeout.as_secs(), "metadata lookup timed out");
                terminate(group, &mut [&mut child], self.config.kill_grace).await;
                return Err(FetchError::Timeout);
            }
        };

        if !status.success() {
            return Err(classify_failure(&stderr, Some(status)));
        }
        serde_json::from_slice::<VideoMetadata>(&stdout)
            .map_err(|err| FetchError::ParseError(err.to_string()))
    }

    /// Starts a download and returns the live stdout without buffering it.
    pub fn open_stream(
        &self,
        video_id: &VideoId,
        spec: FormatSpec,
    ) -> Result<StreamHandle, FetchError> {
        let mut child = self.spawn(
            &self.config.program,
            &self.stream_args(video_id, spec),
            Stdio::null(),
            0,
        )?;
        let group = group_of(&child);
        let media = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::TransientFailure("extractor stdout missing".into()))?;
        let extractor = Stage::new(child);

        let (stdout, transcoder) = match spec.format {
            MediaFormat::Video => (media, None),
            MediaFormat::Audio => {
                let upstream: Stdio = media.try_into().map_err(|err: io::Error| {
                    FetchError::TransientFailure(format!("piping extractor output: {err}"))
                })?;
                let mut child = self.spawn(
                    &self.config.transcoder,
                    &self.transcode_args(),
                    upstream,
                    group.map_or(0, Pid::as_raw),
                )?;
                let encoded = child.stdout.take().ok_or_else(|| {
                    FetchError::TransientFailure("transcoder stdout missing".into())
                })?;
                (encoded, Some(Stage::new(child)))
            }
        };

        debug!(
            %video_id,
            pid = extractor.child.id(),
            selector = %spec.selector(),
            transcoding = transcoder.is_some(),
            "extractor stream spawned"
        );
        Ok(StreamHandle {
            extractor,
            transcoder,
            group,
            stdout,
            kill_grace: self.config.kill_grace,
            settled: false,
        })
    }
}
