//! Site downloaders backed by `yt-dlp`.
//!
//! Metadata is probed through the [`ShellRunner`] with `--dump-single-json`.
//! The download runs `yt-dlp` directly so its progress lines can be streamed
//! into the entry's `load_msg`; dropping the loader future kills the child.

use async_process::{Command, Stdio};
use async_trait::async_trait;
use futures::{io::BufReader, AsyncBufReadExt, AsyncReadExt, StreamExt};
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};
use tracing::{debug, error, info};

use super::{progress, DownloadResult, Downloader, LoadOptions, Loader};
use crate::{
    audio::entry::{Cancellation, Entry, LoadResult},
    error::{PipelineError, ProcessError, SourceError},
    shell::{ShellRunner, Tools},
};

pub const VIDEO_FILE: &str = "download.mp4";
pub const AUDIO_FILE: &str = "audio.mp3";

static YOUTUBE_ID_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(vi/|v=|/v/|youtu\.be/|/embed/|/shorts/)").expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Site {
    Bilibili,
    NicoNico,
    SoundCloud,
    YouTube,
}

impl Site {
    /// Orden de registro.
    pub const ALL: [Site; 4] = [Site::Bilibili, Site::NicoNico, Site::SoundCloud, Site::YouTube];

    pub fn name(self) -> &'static str {
        match self {
            Site::Bilibili => "bilibili",
            Site::NicoNico => "niconico",
            Site::SoundCloud => "soundcloud",
            Site::YouTube => "youtube",
        }
    }

    /// Used in progress messages: "Loading {label} `title`...".
    pub fn label(self) -> &'static str {
        match self {
            Site::Bilibili => "bilibili video",
            Site::NicoNico => "niconico video",
            Site::SoundCloud => "soundcloud audio",
            Site::YouTube => "youtube video",
        }
    }

    pub fn matches(self, url: &str) -> bool {
        match self {
            Site::Bilibili => url.contains("bilibili.com/video/") || url.contains("b23.tv/"),
            Site::NicoNico => url.contains("nicovideo.jp/watch/sm") || url.contains("nico.ms/sm"),
            Site::SoundCloud => url.contains("soundcloud.com/"),
            Site::YouTube => url.contains("youtu") || url.contains("ytimg"),
        }
    }

    pub fn audio_only(self) -> bool {
        matches!(self, Site::SoundCloud)
    }

    /// Discord embeds these links on its own.
    pub fn embeddable(self) -> bool {
        matches!(self, Site::YouTube | Site::SoundCloud)
    }

    /// URL handed to yt-dlp.
    pub fn normalize(self, url: &str) -> Result<String, SourceError> {
        match self {
            Site::YouTube => {
                let id = youtube_id(url).ok_or(SourceError::Unrecognized)?;
                Ok(format!("https://www.youtube.com/watch?v={}", id))
            }
            _ => Ok(url.trim().to_string()),
        }
    }
}

/// Extracts the 11 character video id from any YouTube URL shape.
pub fn youtube_id(url: &str) -> Option<String> {
    let m = YOUTUBE_ID_PREFIX.find(url)?;
    let id: String = url[m.end()..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    (id.len() == 11).then_some(id)
}

/// Credenciales opcionales por sitio.
#[derive(Debug, Clone, Default)]
pub struct SiteCredentials {
    pub niconico: Option<(String, String)>,
    pub bilibili_sessdata: Option<String>,
}

impl SiteCredentials {
    fn args(&self, site: Site) -> Vec<String> {
        match site {
            Site::NicoNico => match &self.niconico {
                Some((user, password)) => vec![
                    "--username".to_string(),
                    user.clone(),
                    "--password".to_string(),
                    password.clone(),
                ],
                None => Vec::new(),
            },
            Site::Bilibili => match &self.bilibili_sessdata {
                Some(sessdata) => vec![
                    "--add-header".to_string(),
                    format!("Cookie:SESSDATA={}", sessdata),
                ],
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }
}

/// Shared by every yt-dlp backed downloader.
#[derive(Clone)]
pub struct YtDlpContext {
    shell: Arc<dyn ShellRunner>,
    tools: Tools,
    video_limit_mins: u64,
    credentials: SiteCredentials,
}

impl YtDlpContext {
    pub fn new(shell: Arc<dyn ShellRunner>, tools: Tools, video_limit_mins: u64) -> Self {
        Self {
            shell,
            tools,
            video_limit_mins,
            credentials: SiteCredentials::default(),
        }
    }

    pub fn with_credentials(mut self, credentials: SiteCredentials) -> Self {
        self.credentials = credentials;
        self
    }
}

#[derive(Debug, Deserialize)]
struct ProbeInfo {
    title: String,
    duration: Option<f64>,
    webpage_url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

pub struct YtDlpDownloader {
    site: Site,
    ctx: YtDlpContext,
}

impl YtDlpDownloader {
    pub fn new(site: Site, ctx: YtDlpContext) -> Self {
        Self { site, ctx }
    }

    async fn probe(&self, url: &str) -> Result<ProbeInfo, SourceError> {
        let mut args = vec![
            "--dump-single-json".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
        ];
        args.extend(self.ctx.credentials.args(self.site));
        args.push(url.to_string());

        let stdout = match self.ctx.shell.run(&self.ctx.tools.ytdlp, &args).await {
            Ok(stdout) => stdout,
            Err(ProcessError::Exit { stderr, .. }) => {
                let reason = stderr
                    .lines()
                    .rev()
                    .find(|l| l.starts_with("ERROR"))
                    .unwrap_or("Could not get video info!")
                    .trim_start_matches("ERROR:")
                    .trim()
                    .to_string();
                return Err(SourceError::Unavailable(reason));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&stdout)?)
    }
}

#[async_trait]
impl Downloader for YtDlpDownloader {
    fn name(&self) -> &'static str {
        self.site.name()
    }

    fn matches(&self, url: &str) -> bool {
        self.site.matches(url)
    }

    fn audio_only(&self) -> bool {
        self.site.audio_only()
    }

    async fn resolve(
        &self,
        url: &str,
        options: LoadOptions,
    ) -> Result<DownloadResult, SourceError> {
        if self.site.audio_only() && options.video {
            return Err(SourceError::Unsupported(
                "SoundCloud does not support videos.".to_string(),
            ));
        }
        let url = self.site.normalize(url)?;
        info!("🔍 Obteniendo info de {}: {}", self.site.name(), url);

        let info = self.probe(&url).await?;
        let duration = info.duration.unwrap_or(0.0);
        if duration <= 0.0 {
            return Err(SourceError::Unavailable(
                "Error getting video info, please try again.".to_string(),
            ));
        }
        if duration > (self.ctx.video_limit_mins * 60) as f64 {
            return Err(SourceError::TooLong {
                limit_mins: self.ctx.video_limit_mins,
            });
        }

        let original_url = match self.site {
            Site::YouTube => url.clone(),
            _ => info.webpage_url.clone().unwrap_or_else(|| url.clone()),
        };

        Ok(DownloadResult {
            title: info.title,
            original_url,
            embeddable: self.site.embeddable(),
            loader: Box::new(YtDlpLoader {
                site: self.site,
                url,
                options,
                width: info.width.unwrap_or(0),
                height: info.height.unwrap_or(0),
                ctx: self.ctx.clone(),
            }),
        })
    }
}

/// Descarga diferida de un video ya resuelto.
pub struct YtDlpLoader {
    site: Site,
    url: String,
    options: LoadOptions,
    width: u32,
    height: u32,
    ctx: YtDlpContext,
}

impl YtDlpLoader {
    fn download_args(&self, entry: &Entry) -> Vec<String> {
        let mut args = vec![
            "--newline".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--progress-template".to_string(),
            progress::progress_template(),
            "--ffmpeg-location".to_string(),
            self.ctx.tools.ffmpeg.clone(),
            "-P".to_string(),
            entry.path().display().to_string(),
        ];
        if self.site.audio_only() {
            args.extend(
                ["-f", "bestaudio/best", "-x", "--audio-format", "mp3", "-o", "audio.%(ext)s"]
                    .map(String::from),
            );
        } else {
            args.extend(
                [
                    "-f",
                    "best[ext=mp4]/bestvideo[ext=mp4]+bestaudio[ext=m4a]/best",
                    "--merge-output-format",
                    "mp4",
                    "-o",
                    "download.%(ext)s",
                ]
                .map(String::from),
            );
        }
        args.extend(self.ctx.credentials.args(self.site));
        args.push(self.url.clone());
        args
    }

    async fn download(&self, entry: &Entry) -> Result<(), PipelineError> {
        let args = self.download_args(entry);
        debug!("⬇️ {} {}", self.ctx.tools.ytdlp, args.join(" "));

        let mut child = Command::new(&self.ctx.tools.ytdlp)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                binary: self.ctx.tools.ytdlp.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let report = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Some(Ok(line)) = lines.next().await {
                    if let Some(p) = progress::parse_line(&line) {
                        entry.set_load_msg(progress::render(self.site.label(), entry.title(), p));
                    }
                }
            }
        };
        let collect_stderr = async {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        };
        let ((), stderr) = futures::join!(report, collect_stderr);

        let status = child.status().await?;
        if !status.success() {
            error!("❌ yt-dlp falló para {}: {}", self.url, stderr.trim());
            return Err(ProcessError::Exit {
                binary: self.ctx.tools.ytdlp.clone(),
                code: status.code(),
                stderr: stderr.trim().to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl Loader for YtDlpLoader {
    async fn load(
        &self,
        entry: &Entry,
        cancel: &Cancellation,
    ) -> Result<LoadResult, PipelineError> {
        entry.set_load_msg(format!("Loading {} `{}`...", self.site.label(), entry.title()));
        cancel.guard(self.download(entry)).await??;

        let mut result = LoadResult {
            width: self.width,
            height: self.height,
            ..Default::default()
        };

        if self.site.audio_only() {
            result.audio_path = Some(AUDIO_FILE.into());
            return Ok(result);
        }

        if self.options.video {
            result.video_path = Some(VIDEO_FILE.into());
        }
        if self.options.audio {
            let args = vec![
                "-y".to_string(),
                "-i".to_string(),
                entry.path().join(VIDEO_FILE).display().to_string(),
                "-ac".to_string(),
                "2".to_string(),
                "-f".to_string(),
                "mp3".to_string(),
                entry.path().join(AUDIO_FILE).display().to_string(),
            ];
            cancel
                .guard(self.ctx.shell.run(&self.ctx.tools.ffmpeg, &args))
                .await??;
            result.audio_path = Some(AUDIO_FILE.into());
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::testing::RecordingShell;
    use pretty_assertions::assert_eq;

    fn ctx(shell: RecordingShell) -> (Arc<RecordingShell>, YtDlpContext) {
        let shell = Arc::new(shell);
        (shell.clone(), YtDlpContext::new(shell, Tools::default(), 10))
    }

    #[test]
    fn test_youtube_id_forms() {
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ?t=42",
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
            "https://m.youtube.com/watch?feature=share&v=dQw4w9WgXcQ&list=PL1",
            "https://youtube.com/shorts/dQw4w9WgXcQ",
            "https://i.ytimg.com/vi/dQw4w9WgXcQ/hqdefault.jpg",
        ] {
            assert_eq!(youtube_id(url).as_deref(), Some("dQw4w9WgXcQ"), "{url}");
        }
        assert_eq!(youtube_id("https://www.youtube.com/watch?v=short"), None);
        assert_eq!(youtube_id("https://www.youtube.com/"), None);
    }

    #[test]
    fn test_site_matching() {
        assert!(Site::NicoNico.matches("https://www.nicovideo.jp/watch/sm9"));
        assert!(Site::Bilibili.matches("https://www.bilibili.com/video/BV1xx411c7mD"));
        assert!(Site::SoundCloud.matches("https://soundcloud.com/a/b"));
        assert!(!Site::YouTube.matches("https://soundcloud.com/a/b"));
    }

    #[tokio::test]
    async fn test_resolve_youtube() {
        let (shell, ctx) = ctx(RecordingShell::new().respond(
            "yt-dlp",
            r#"{"title": "Never Gonna Give You Up", "duration": 212.0, "webpage_url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ", "width": 1920, "height": 1080}"#,
        ));
        let downloader = YtDlpDownloader::new(Site::YouTube, ctx);

        let result = downloader
            .resolve("https://youtu.be/dQw4w9WgXcQ", LoadOptions::default())
            .await
            .unwrap();

        assert_eq!(result.title, "Never Gonna Give You Up");
        assert_eq!(result.original_url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert!(result.embeddable);
        let calls = shell.calls_to("yt-dlp");
        assert_eq!(calls[0].first().map(String::as_str), Some("--dump-single-json"));
        assert_eq!(
            calls[0].last().map(String::as_str),
            Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
        );
    }

    #[tokio::test]
    async fn test_resolve_rejects_long_and_unknown_durations() {
        let shell =
            RecordingShell::new().respond("yt-dlp", r#"{"title": "Live", "duration": 3600}"#);
        let (_, long) = ctx(shell);
        let err = YtDlpDownloader::new(Site::NicoNico, long)
            .resolve("https://www.nicovideo.jp/watch/sm9", LoadOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Please only queue videos shorter than 10 minutes.");

        let shell = RecordingShell::new().respond("yt-dlp", r#"{"title": "?", "duration": 0}"#);
        let (_, zero) = ctx(shell);
        let err = YtDlpDownloader::new(Site::NicoNico, zero)
            .resolve("https://www.nicovideo.jp/watch/sm9", LoadOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Error getting video info, please try again.");
    }

    #[tokio::test]
    async fn test_probe_failure_reports_reason() {
        let (_, ctx) = ctx(RecordingShell::new().fail(
            "yt-dlp",
            "[youtube] dQw4w9WgXcQ: Downloading webpage\nERROR: [youtube] dQw4w9WgXcQ: Private video",
        ));
        let err = YtDlpDownloader::new(Site::YouTube, ctx)
            .resolve("https://youtu.be/dQw4w9WgXcQ", LoadOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "[youtube] dQw4w9WgXcQ: Private video");
    }

    #[tokio::test]
    async fn test_soundcloud_is_audio_only() {
        let (shell, ctx) = ctx(RecordingShell::new());
        let err = YtDlpDownloader::new(Site::SoundCloud, ctx)
            .resolve("https://soundcloud.com/a/b", LoadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Unsupported(_)));
        assert!(shell.calls().is_empty());
    }

    #[test]
    fn test_credentials_are_passed_per_site() {
        let creds = SiteCredentials {
            niconico: Some(("user".into(), "pass".into())),
            bilibili_sessdata: Some("abc".into()),
        };
        assert_eq!(creds.args(Site::NicoNico), vec!["--username", "user", "--password", "pass"]);
        assert_eq!(creds.args(Site::Bilibili), vec!["--add-header", "Cookie:SESSDATA=abc"]);
        assert!(creds.args(Site::YouTube).is_empty());
    }
}
