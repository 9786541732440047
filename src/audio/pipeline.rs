use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, warn};

use super::entry::{Artifact, Cancellation, Entry, LoadResult, ProcessState, ProcessingRun};
use crate::{
    error::PipelineError,
    shell::{ShellRunner, Tools},
};

pub const THUMBNAIL_FILE: &str = "thumb.jpg";
pub const INDEX_FILE: &str = "index.html";
pub const SHIFTED_AUDIO_FILE: &str = "shifted.mp3";
pub const EXTRACTED_AUDIO_FILE: &str = "audio.mp3";
const GENERATED_VIDEO_PREFIX: &str = "video-";

/// Estrategia de mux según el offset efectivo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxStrategy {
    /// Sin offset: copia directa de ambos streams.
    StreamCopy,
    /// Offset positivo: el audio se retrasa y se recodifica.
    DelayAudio { ms: u64 },
    /// Offset negativo: se retrasa el video con `-itsoffset`.
    DelayVideo { ms: u64 },
}

impl MuxStrategy {
    pub fn for_offset(offset_ms: i64) -> Self {
        match offset_ms {
            0 => MuxStrategy::StreamCopy,
            ms if ms > 0 => MuxStrategy::DelayAudio { ms: ms.unsigned_abs() },
            ms => MuxStrategy::DelayVideo { ms: ms.unsigned_abs() },
        }
    }

    pub fn ffmpeg_args(&self, video: &Path, audio: &Path, output: &Path) -> Vec<String> {
        let video = video.display().to_string();
        let audio = audio.display().to_string();
        let mut args: Vec<String> = match *self {
            MuxStrategy::StreamCopy => vec![
                "-i".into(),
                video,
                "-i".into(),
                audio,
                "-c:v".into(),
                "copy".into(),
                "-c:a".into(),
                "copy".into(),
                "-map".into(),
                "0:v:0".into(),
                "-map".into(),
                "1:a:0".into(),
            ],
            MuxStrategy::DelayAudio { ms } => vec![
                "-i".into(),
                video,
                "-i".into(),
                audio,
                "-c:v".into(),
                "copy".into(),
                "-c:a".into(),
                "mp3".into(),
                "-af".into(),
                format!("adelay={ms}|{ms}"),
                "-map".into(),
                "0:v:0".into(),
                "-map".into(),
                "1:a:0".into(),
            ],
            MuxStrategy::DelayVideo { ms } => vec![
                "-i".into(),
                audio,
                "-itsoffset".into(),
                format!("{}.{:03}", ms / 1000, ms % 1000),
                "-i".into(),
                video,
                "-c:a".into(),
                "copy".into(),
                "-c:v".into(),
                "copy".into(),
                "-map".into(),
                "1:v:0".into(),
                "-map".into(),
                "0:a:0".into(),
            ],
        };
        args.extend([
            "-movflags".into(),
            "faststart".into(),
            output.display().to_string(),
        ]);
        args
    }
}

/// Maps entry working directories under the serving root to public URLs.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    serving_dir: PathBuf,
    host: String,
}

impl ArtifactLayout {
    /// A relative `serving_dir` is resolved against the current directory,
    /// the same way entry directories created under it are.
    pub fn new(serving_dir: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        let serving_dir = serving_dir.into();
        Self {
            serving_dir: std::path::absolute(&serving_dir).unwrap_or(serving_dir),
            host: host.into(),
        }
    }

    pub fn serving_dir(&self) -> &Path {
        &self.serving_dir
    }

    /// Creates a fresh, uniquely named working directory for one entry.
    pub fn create_entry_dir(&self) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.serving_dir)?;
        let dir = tempfile::Builder::new()
            .prefix("entry-")
            .tempdir_in(&self.serving_dir)?;
        #[allow(deprecated)]
        Ok(dir.into_path())
    }

    /// `https://{host}/{ruta relativa al serving dir}`
    pub fn public_url(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.serving_dir).unwrap_or(path);
        let segments: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                std::path::Component::Normal(s) => {
                    Some(urlencoding::encode(&s.to_string_lossy()).into_owned())
                }
                _ => None,
            })
            .collect();
        format!("https://{}/{}", self.host, segments.join("/"))
    }
}

pub fn cache_token() -> String {
    (0..8).map(|_| fastrand::alphabetic()).collect()
}

/// Download then transcode for a single entry.
pub struct Pipeline {
    shell: Arc<dyn ShellRunner>,
    tools: Tools,
    layout: ArtifactLayout,
}

impl Pipeline {
    pub fn new(shell: Arc<dyn ShellRunner>, tools: Tools, layout: ArtifactLayout) -> Self {
        Self {
            shell,
            tools,
            layout,
        }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Runs one pipeline pass. Cancellation is checked after every external
    /// step; a cancelled run returns [`PipelineError::Cancelled`] and leaves
    /// nothing referenced by the entry's state.
    pub async fn run(&self, entry: &Entry, run: &ProcessingRun) -> Result<Artifact, PipelineError> {
        let cancel = &run.cancel;
        cancel.check()?;

        let mut load = match entry.cached_load_result() {
            Some(cached) => {
                debug!("📦 Usando descarga en caché para {}", entry.title());
                cached
            }
            None => {
                entry.advance_state(run.generation, ProcessState::Downloading);
                // La miniatura era del video anterior
                remove_partial(&entry.path().join(THUMBNAIL_FILE)).await;
                let mut merged = LoadResult::default();
                for loader in entry.loaders() {
                    let part = cancel.guard(loader.load(entry, cancel)).await??;
                    merged.merge(part);
                    cancel.check()?;
                }
                entry.store_load_result(run.generation, merged.clone());
                merged
            }
        };

        let dir = entry.path();
        let pitch = entry.pitch_shift();
        let offset = entry.effective_offset_ms();

        match (&load.video_path, &load.audio_path) {
            (None, None) => {
                return Err(PipelineError::Load("Nothing was downloaded".to_string()));
            }
            (Some(video), _) if pitch == 0 && offset == 0 && entry.embeddable() => {
                debug!("⏩ Sin cambios, se usa la URL original: {}", entry.original_url());
                return Ok(Artifact::Original {
                    media_path: dir.join(video),
                });
            }
            (None, Some(audio)) if pitch == 0 && entry.embeddable() => {
                return Ok(Artifact::Original {
                    media_path: dir.join(audio),
                });
            }
            _ => {}
        }

        entry.advance_state(run.generation, ProcessState::Transcoding);

        if let Some(video) = load.video_path.clone() {
            if !load.has_dimensions() {
                let (width, height) = self.probe_dimensions(&dir.join(&video), cancel).await?;
                load.width = width;
                load.height = height;
                entry.store_load_result(run.generation, load.clone());
            }
        }

        let mut audio = match (&load.audio_path, &load.video_path) {
            (Some(audio), _) => dir.join(audio),
            (None, Some(video)) if pitch != 0 => {
                let extracted = dir.join(EXTRACTED_AUDIO_FILE);
                let args = vec![
                    "-y".to_string(),
                    "-i".to_string(),
                    dir.join(video).display().to_string(),
                    "-ac".to_string(),
                    "2".to_string(),
                    "-f".to_string(),
                    "mp3".to_string(),
                    extracted.display().to_string(),
                ];
                self.exec(cancel, &self.tools.ffmpeg, args).await?;
                extracted
            }
            (None, Some(video)) => dir.join(video),
            (None, None) => {
                return Err(PipelineError::Load("Nothing was downloaded".to_string()));
            }
        };

        if pitch != 0 {
            entry.set_load_msg(format!(
                "Loading video `{}`...\nShifting pitch...",
                entry.title()
            ));
            let shifted = dir.join(SHIFTED_AUDIO_FILE);
            let args = vec![
                audio.display().to_string(),
                shifted.display().to_string(),
                "pitch".to_string(),
                (pitch * 100).to_string(),
            ];
            self.exec(cancel, &self.tools.sox, args).await?;
            audio = shifted;
        }

        let Some(video) = load.video_path.as_ref().map(|v| dir.join(v)) else {
            // Solo audio: el archivo (quizás con pitch) es el resultado.
            self.write_index(entry, None, &audio, &load).await?;
            cancel.check()?;
            return Ok(self.generated(entry, audio));
        };

        entry.set_load_msg(format!("Loading video `{}`...\nCreating video...", entry.title()));
        remove_superseded_videos(&dir).await;
        let output = dir.join(format!("{}{}.mp4", GENERATED_VIDEO_PREFIX, cache_token()));
        let strategy = MuxStrategy::for_offset(offset);
        debug!("🎬 Mux {:?} para {}", strategy, entry.title());
        let args = strategy.ffmpeg_args(&video, &audio, &output);
        if let Err(e) = self.exec(cancel, &self.tools.ffmpeg, args).await {
            remove_partial(&output).await;
            return Err(e);
        }

        let thumb = dir.join(THUMBNAIL_FILE);
        if !tokio::fs::try_exists(&thumb).await.unwrap_or(false) {
            let args = vec![
                "-i".to_string(),
                video.display().to_string(),
                "-vf".to_string(),
                "select=eq(n\\,0)".to_string(),
                "-q:v".to_string(),
                "3".to_string(),
                thumb.display().to_string(),
            ];
            self.exec(cancel, &self.tools.ffmpeg, args).await?;
        }

        self.write_index(entry, Some(&thumb), &output, &load).await?;
        cancel.check()?;

        info!("🎤 Video generado para {}", entry.title());
        Ok(self.generated(entry, output))
    }

    fn generated(&self, entry: &Entry, media_path: PathBuf) -> Artifact {
        Artifact::Generated {
            media_path,
            page_url: format!("{}/", self.layout.public_url(entry.path())),
            cache_token: cache_token(),
        }
    }

    async fn exec(
        &self,
        cancel: &Cancellation,
        binary: &str,
        args: Vec<String>,
    ) -> Result<String, PipelineError> {
        let stdout = cancel.guard(self.shell.run(binary, &args)).await??;
        cancel.check()?;
        Ok(stdout)
    }

    async fn probe_dimensions(
        &self,
        video: &Path,
        cancel: &Cancellation,
    ) -> Result<(u32, u32), PipelineError> {
        let args = vec![
            "-loglevel".to_string(),
            "quiet".to_string(),
            "-select_streams".to_string(),
            "v:0".to_string(),
            "-show_entries".to_string(),
            "stream=width,height".to_string(),
            "-of".to_string(),
            "csv=p=0".to_string(),
            video.display().to_string(),
        ];
        let stdout = self.exec(cancel, &self.tools.ffprobe, args).await?;
        parse_dimensions(&stdout).ok_or_else(|| PipelineError::Probe(stdout.trim().to_string()))
    }

    async fn write_index(
        &self,
        entry: &Entry,
        thumb: Option<&Path>,
        media: &Path,
        load: &LoadResult,
    ) -> Result<(), PipelineError> {
        let title = escape_html(&entry.name());
        let media_url = self.layout.public_url(media);
        let mut meta = vec![format!(r#"<meta property="og:title" content="{title}" />"#)];
        match thumb {
            Some(thumb) => {
                meta.push(r#"<meta property="og:type" content="video" />"#.to_string());
                meta.push(format!(
                    r#"<meta property="og:image" content="{}" />"#,
                    self.layout.public_url(thumb)
                ));
                meta.push(format!(r#"<meta property="og:video" content="{media_url}" />"#));
                meta.push(format!(
                    r#"<meta property="og:video:width" content="{}" />"#,
                    load.width
                ));
                meta.push(format!(
                    r#"<meta property="og:video:height" content="{}" />"#,
                    load.height
                ));
                meta.push(r#"<meta property="og:video:type" content="video/mp4" />"#.to_string());
            }
            None => {
                meta.push(r#"<meta property="og:type" content="music.song" />"#.to_string());
                meta.push(format!(r#"<meta property="og:audio" content="{media_url}" />"#));
                meta.push(r#"<meta property="og:audio:type" content="audio/mpeg" />"#.to_string());
            }
        }

        let html = format!(
            "<!DOCTYPE html>\n<html>\n    <head>\n{}\n    </head>\n</html>\n",
            meta.iter()
                .map(|m| format!("        {m}"))
                .collect::<Vec<_>>()
                .join("\n")
        );
        tokio::fs::write(entry.path().join(INDEX_FILE), html).await?;
        Ok(())
    }
}

fn parse_dimensions(stdout: &str) -> Option<(u32, u32)> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let mut parts = line.trim().trim_end_matches(',').split(',');
    let width = parts.next()?.trim().parse().ok()?;
    let height = parts.next()?.trim().parse().ok()?;
    Some((width, height))
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Removes the videos generated by earlier runs; each run writes a new name.
async fn remove_superseded_videos(dir: &Path) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("No se pudo listar {}: {}", dir.display(), e);
            return;
        }
    };
    while let Ok(Some(file)) = entries.next_entry().await {
        let name = file.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(GENERATED_VIDEO_PREFIX) && name.ends_with(".mp4") {
            debug!("🧹 Borrando video anterior {}", name);
            remove_partial(&file.path()).await;
        }
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("No se pudo borrar salida parcial {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::entry::{testing::new_entry, NewEntry};
    use crate::audio::queue::{KaraQueue, QueueLimits};
    use crate::shell::testing::RecordingShell;
    use crate::sources::Loader;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serenity::model::id::{ChannelId, GuildId};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Weak,
    };
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Writes a fake download into the entry directory.
    struct FakeLoader {
        result: LoadResult,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Loader for FakeLoader {
        async fn load(
            &self,
            entry: &Entry,
            _cancel: &Cancellation,
        ) -> Result<LoadResult, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(video) = &self.result.video_path {
                tokio::fs::write(entry.path().join(video), b"video").await?;
            }
            if let Some(audio) = &self.result.audio_path {
                tokio::fs::write(entry.path().join(audio), b"audio").await?;
            }
            Ok(self.result.clone())
        }
    }

    struct Fixture {
        root: tempfile::TempDir,
        shell: Arc<RecordingShell>,
        pipeline: Pipeline,
        loads: Arc<AtomicUsize>,
    }

    fn fixture(shell: RecordingShell) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let shell = Arc::new(shell);
        let pipeline = Pipeline::new(
            shell.clone(),
            Tools::default(),
            ArtifactLayout::new(root.path(), "karaoke.example.com"),
        );
        Fixture {
            root,
            shell,
            pipeline,
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    impl Fixture {
        fn fields(&self, result: LoadResult) -> NewEntry {
            let dir = self.pipeline.layout().create_entry_dir().unwrap();
            let mut fields = new_entry(&dir, "dQw4w9WgXcQ", 1);
            fields.loaders = vec![Box::new(FakeLoader {
                result,
                calls: self.loads.clone(),
            })];
            fields
        }
    }

    fn video_and_audio() -> LoadResult {
        LoadResult {
            video_path: Some("download.mp4".into()),
            audio_path: Some("audio.mp3".into()),
            width: 1280,
            height: 720,
        }
    }

    #[test]
    fn test_mux_strategy_from_offset() {
        assert_eq!(MuxStrategy::for_offset(0), MuxStrategy::StreamCopy);
        assert_eq!(MuxStrategy::for_offset(500), MuxStrategy::DelayAudio { ms: 500 });
        assert_eq!(MuxStrategy::for_offset(-500), MuxStrategy::DelayVideo { ms: 500 });
    }

    #[test]
    fn test_mux_args() {
        let (v, a, o) = (Path::new("v.mp4"), Path::new("a.mp3"), Path::new("o.mp4"));

        let copy = MuxStrategy::StreamCopy.ffmpeg_args(v, a, o).join(" ");
        assert_eq!(
            copy,
            "-i v.mp4 -i a.mp3 -c:v copy -c:a copy -map 0:v:0 -map 1:a:0 -movflags faststart o.mp4"
        );

        let delayed_audio = MuxStrategy::DelayAudio { ms: 500 }.ffmpeg_args(v, a, o);
        assert!(delayed_audio.contains(&"adelay=500|500".to_string()));
        assert!(delayed_audio.windows(2).any(|w| w == ["-c:a", "mp3"]));

        let delayed_video = MuxStrategy::DelayVideo { ms: 1500 }.ffmpeg_args(v, a, o).join(" ");
        assert_eq!(
            delayed_video,
            "-i a.mp3 -itsoffset 1.500 -i v.mp4 -c:a copy -c:v copy -map 1:v:0 -map 0:a:0 -movflags faststart o.mp4"
        );
    }

    #[test]
    fn test_public_url_is_relative_to_serving_dir() {
        let layout = ArtifactLayout::new("/srv/videos", "karaoke.example.com");
        assert_eq!(
            layout.public_url(Path::new("/srv/videos/entry-abc/thumb.jpg")),
            "https://karaoke.example.com/entry-abc/thumb.jpg"
        );
        assert_eq!(
            layout.public_url(Path::new("/srv/videos/entry abc")),
            "https://karaoke.example.com/entry%20abc"
        );
    }

    #[test]
    fn test_relative_serving_dir_matches_entry_dirs() {
        let layout = ArtifactLayout::new("_generated_videos", "karaoke.example.com");
        assert!(layout.serving_dir().is_absolute());

        let entry_dir = std::env::current_dir()
            .unwrap()
            .join("_generated_videos")
            .join("entry-abc");
        assert_eq!(
            layout.public_url(&entry_dir.join("video-x.mp4")),
            "https://karaoke.example.com/entry-abc/video-x.mp4"
        );
    }

    #[test]
    fn test_parse_dimensions() {
        assert_eq!(parse_dimensions("1280,720\n"), Some((1280, 720)));
        assert_eq!(parse_dimensions("\n640,360,\n"), Some((640, 360)));
        assert_eq!(parse_dimensions("N/A"), None);
    }

    #[tokio::test]
    async fn test_unchanged_entry_skips_transcoding() {
        let fx = fixture(RecordingShell::new());
        let entry = Entry::new(fx.fields(video_and_audio()), Weak::new());
        let run = entry.begin_processing(&CancellationToken::new()).unwrap();

        let artifact = fx.pipeline.run(&entry, &run).await.unwrap();
        entry.finish(run.generation, Ok(artifact), false);

        assert!(fx.shell.calls().is_empty());
        assert_eq!(entry.url().unwrap(), entry.original_url());
        assert_eq!(entry.video_path().unwrap(), entry.path().join("download.mp4"));
    }

    #[tokio::test]
    async fn test_pitch_shift_runs_sox_then_mux() {
        let fx = fixture(RecordingShell::new());
        let mut fields = fx.fields(video_and_audio());
        fields.pitch_shift = 2;
        let entry = Entry::new(fields, Weak::new());
        let run = entry.begin_processing(&CancellationToken::new()).unwrap();

        let artifact = fx.pipeline.run(&entry, &run).await.unwrap();

        let sox = fx.shell.calls_to("sox");
        assert_eq!(sox.len(), 1);
        assert_eq!(&sox[0][2..], ["pitch", "200"]);

        let ffmpeg = fx.shell.calls_to("ffmpeg");
        assert_eq!(ffmpeg.len(), 2, "mux and thumbnail");
        assert!(ffmpeg[0].contains(&entry.path().join(SHIFTED_AUDIO_FILE).display().to_string()));
        assert!(fx.shell.calls_to("ffprobe").is_empty());

        let index = std::fs::read_to_string(entry.path().join(INDEX_FILE)).unwrap();
        assert!(index.contains(r#"og:video:width" content="1280""#));
        assert!(index.contains("dQw4w9WgXcQ [+2]"));

        match artifact {
            Artifact::Generated { page_url, cache_token, .. } => {
                assert!(page_url.starts_with("https://karaoke.example.com/entry-"));
                assert_eq!(cache_token.len(), 8);
            }
            other => panic!("unexpected artifact {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mux_branch_uses_effective_offset() {
        let fx = fixture(RecordingShell::new());
        let queue = KaraQueue::new(
            GuildId::new(1),
            ChannelId::new(2),
            QueueLimits::default(),
        );

        let cases = [(500, 0, "adelay=500|500"), (-200, -300, "-itsoffset"), (300, -300, "copy")];
        for (entry_offset, global, needle) in cases {
            queue.lock().await.set_global_offset(global);
            let mut fields = fx.fields(video_and_audio());
            fields.offset_ms = entry_offset;
            fields.embeddable = false;
            let entry = Entry::new(fields, Arc::downgrade(&queue));
            let run = entry.begin_processing(&CancellationToken::new()).unwrap();
            fx.pipeline.run(&entry, &run).await.unwrap();

            let mux = fx.shell.calls_to("ffmpeg").into_iter().rev().nth(1).unwrap();
            assert!(mux.iter().any(|a| a == needle), "{needle} missing in {mux:?}");
            if needle == "copy" {
                assert!(!mux.iter().any(|a| a.starts_with("adelay") || a == "-itsoffset"));
            }
        }
    }

    #[tokio::test]
    async fn test_probes_missing_dimensions() {
        let fx = fixture(RecordingShell::new().respond("ffprobe", "640,360\n"));
        let mut fields = fx.fields(LoadResult {
            video_path: Some("download.mp4".into()),
            audio_path: Some("audio.mp3".into()),
            ..Default::default()
        });
        fields.offset_ms = 100;
        let entry = Entry::new(fields, Weak::new());
        let run = entry.begin_processing(&CancellationToken::new()).unwrap();

        fx.pipeline.run(&entry, &run).await.unwrap();

        assert_eq!(fx.shell.calls_to("ffprobe").len(), 1);
        assert_eq!(entry.cached_load_result().unwrap().width, 640);
    }

    #[tokio::test]
    async fn test_reset_keeps_download_cached() {
        let fx = fixture(RecordingShell::new());
        let mut fields = fx.fields(video_and_audio());
        fields.pitch_shift = 1;
        let entry = Entry::new(fields, Weak::new());

        let run = entry.begin_processing(&CancellationToken::new()).unwrap();
        fx.pipeline.run(&entry, &run).await.unwrap();
        entry.set_pitch_shift(3);
        entry.reset();
        let run = entry.begin_processing(&CancellationToken::new()).unwrap();
        fx.pipeline.run(&entry, &run).await.unwrap();
        assert_eq!(fx.loads.load(Ordering::SeqCst), 1);

        entry.reload();
        let run = entry.begin_processing(&CancellationToken::new()).unwrap();
        fx.pipeline.run(&entry, &run).await.unwrap();
        assert_eq!(fx.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_every_run_gets_a_new_cache_token() {
        let fx = fixture(RecordingShell::new());
        let mut fields = fx.fields(video_and_audio());
        fields.pitch_shift = 2;
        let entry = Entry::new(fields, Weak::new());

        let run = entry.begin_processing(&CancellationToken::new()).unwrap();
        let artifact = fx.pipeline.run(&entry, &run).await.unwrap();
        assert!(entry.finish(run.generation, Ok(artifact), false));
        let first = entry.url().unwrap();
        assert_eq!(entry.url().unwrap(), first);

        entry.reset();
        let run = entry.begin_processing(&CancellationToken::new()).unwrap();
        let artifact = fx.pipeline.run(&entry, &run).await.unwrap();
        assert!(entry.finish(run.generation, Ok(artifact), false));
        let second = entry.url().unwrap();

        let page = format!("{}/", fx.pipeline.layout().public_url(entry.path()));
        assert!(first.starts_with(&page));
        assert!(second.starts_with(&page));
        assert_ne!(first, second);
        assert_eq!(entry.url().unwrap(), second);
    }

    #[tokio::test]
    async fn test_reprocessing_removes_superseded_video() {
        let fx = fixture(RecordingShell::new());
        let mut fields = fx.fields(video_and_audio());
        fields.pitch_shift = 1;
        let entry = Entry::new(fields, Weak::new());

        let run = entry.begin_processing(&CancellationToken::new()).unwrap();
        let first = fx.pipeline.run(&entry, &run).await.unwrap();
        // Lo que ffmpeg habría escrito
        std::fs::write(first.media_path(), b"mux").unwrap();
        entry.finish(run.generation, Ok(first.clone()), false);

        entry.set_pitch_shift(2);
        entry.reset();
        let run = entry.begin_processing(&CancellationToken::new()).unwrap();
        let second = fx.pipeline.run(&entry, &run).await.unwrap();

        assert_ne!(first.media_path(), second.media_path());
        assert!(!first.media_path().exists());
        assert!(entry.path().join("download.mp4").exists());
    }

    #[tokio::test]
    async fn test_reload_discards_old_thumbnail() {
        let fx = fixture(RecordingShell::new());
        let mut fields = fx.fields(video_and_audio());
        fields.offset_ms = 100;
        let entry = Entry::new(fields, Weak::new());
        let thumb = entry.path().join(THUMBNAIL_FILE);

        let run = entry.begin_processing(&CancellationToken::new()).unwrap();
        fx.pipeline.run(&entry, &run).await.unwrap();
        std::fs::write(&thumb, b"jpg").unwrap();

        entry.reset();
        let run = entry.begin_processing(&CancellationToken::new()).unwrap();
        fx.pipeline.run(&entry, &run).await.unwrap();
        assert!(thumb.exists(), "reset keeps the download and its thumbnail");
        assert_eq!(fx.shell.calls_to("ffmpeg").len(), 3);

        entry.reload();
        assert!(thumb.exists());
        let run = entry.begin_processing(&CancellationToken::new()).unwrap();
        fx.pipeline.run(&entry, &run).await.unwrap();
        assert!(!thumb.exists());
        assert_eq!(fx.shell.calls_to("ffmpeg").len(), 5);
    }

    #[tokio::test]
    async fn test_tool_failure_is_pipeline_error() {
        let fx = fixture(RecordingShell::new().fail("sox", "sox FAIL formats"));
        let mut fields = fx.fields(video_and_audio());
        fields.pitch_shift = -1;
        let entry = Entry::new(fields, Weak::new());
        let run = entry.begin_processing(&CancellationToken::new()).unwrap();

        let err = fx.pipeline.run(&entry, &run).await.unwrap_err();
        assert!(matches!(err, PipelineError::Process(_)));
        assert!(fx.shell.calls_to("ffmpeg").is_empty());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_mux_and_removes_output() {
        let fx = fixture(RecordingShell::new().slow("ffmpeg", Duration::from_secs(60)));
        let mut fields = fx.fields(video_and_audio());
        fields.offset_ms = 250;
        let entry = Entry::new(fields, Weak::new());
        let run = entry.begin_processing(&CancellationToken::new()).unwrap();

        let canceller = entry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.reset();
        });

        let err = fx.pipeline.run(&entry, &run).await.unwrap_err();
        assert!(err.is_cancelled());
        let leftovers: Vec<_> = std::fs::read_dir(entry.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("video-"))
            .collect();
        assert!(leftovers.is_empty());
        assert!(!entry.path().join(INDEX_FILE).exists());
    }

    #[tokio::test]
    async fn test_audio_only_entry_gets_audio_page() {
        let fx = fixture(RecordingShell::new());
        let mut fields = fx.fields(LoadResult {
            audio_path: Some("audio.mp3".into()),
            ..Default::default()
        });
        fields.pitch_shift = 1;
        let entry = Entry::new(fields, Weak::new());
        let run = entry.begin_processing(&CancellationToken::new()).unwrap();

        let artifact = fx.pipeline.run(&entry, &run).await.unwrap();

        assert!(fx.shell.calls_to("ffmpeg").is_empty());
        assert_eq!(artifact.media_path(), entry.path().join(SHIFTED_AUDIO_FILE));
        let index = std::fs::read_to_string(entry.path().join(INDEX_FILE)).unwrap();
        assert!(index.contains("og:audio"));
    }
}
