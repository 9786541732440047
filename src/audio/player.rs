use async_trait::async_trait;
use regex::Regex;
use std::{path::Path, sync::LazyLock, time::Duration};
use tracing::{debug, info, warn};

use crate::error::PlayerError;

/// Lo que reporta el reproductor local.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerStatus {
    pub position_ms: u64,
    pub duration_ms: u64,
    /// File name only, without directories.
    pub filename: String,
    /// Full path, when the player reports it.
    pub filepath: Option<String>,
}

impl PlayerStatus {
    /// Whether the player is showing `path`.
    ///
    /// Entries share media file names (`download.mp4`), so the full path is
    /// compared whenever the player reports one.
    pub fn shows(&self, path: &Path) -> bool {
        let opened = path.display().to_string();
        let name = opened.rsplit(['/', '\\']).next().unwrap_or_default();
        if !name.eq_ignore_ascii_case(&self.filename) {
            return false;
        }
        match &self.filepath {
            Some(full) => same_path(full, &opened),
            None => true,
        }
    }
}

/// MPC-HC corre en Windows: separadores y mayúsculas no importan.
fn same_path(a: &str, b: &str) -> bool {
    let normalize = |p: &str| p.replace('\\', "/").trim_end_matches('/').to_lowercase();
    normalize(a) == normalize(b)
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Player: Send + Sync {
    /// `None` when the player is not running or has nothing loaded.
    async fn status(&self) -> Result<Option<PlayerStatus>, PlayerError>;

    async fn open(&self, path: &Path) -> Result<(), PlayerError>;
}

static VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<p id="(?P<key>[a-z]+)">(?P<value>[^<]*)</p>"#).expect("valid regex")
});

/// MPC-HC controlado por su interfaz web.
pub struct MpcHcPlayer {
    client: reqwest::Client,
    base_url: String,
    binary: String,
}

impl MpcHcPlayer {
    pub fn new(webport: u16, binary: impl Into<String>) -> Result<Self, PlayerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self {
            client,
            base_url: format!("http://127.0.0.1:{}", webport),
            binary: binary.into(),
        })
    }

    async fn launch(&self, path: &Path) -> Result<(), PlayerError> {
        info!("▶️ Lanzando {} {}", self.binary, path.display());
        async_process::Command::new(&self.binary)
            .arg(path)
            .arg("/play")
            .arg("/close")
            .spawn()?;
        Ok(())
    }
}

/// Parses the `variables.html` page of the MPC-HC web interface.
pub fn parse_variables(html: &str) -> Option<PlayerStatus> {
    let mut filename = None;
    let mut filepath = None;
    let mut position = None;
    let mut duration = None;
    for caps in VARIABLE.captures_iter(html) {
        let value = &caps["value"];
        match &caps["key"] {
            "file" => filename = Some(value.to_string()),
            "filepath" => filepath = Some(value.to_string()).filter(|p| !p.is_empty()),
            "position" => position = value.parse().ok(),
            "duration" => duration = value.parse().ok(),
            _ => {}
        }
    }
    let filename = filename.filter(|f| !f.is_empty())?;
    Some(PlayerStatus {
        position_ms: position?,
        duration_ms: duration?,
        filename,
        filepath,
    })
}

#[async_trait]
impl Player for MpcHcPlayer {
    async fn status(&self) -> Result<Option<PlayerStatus>, PlayerError> {
        let url = format!("{}/variables.html", self.base_url);
        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) if e.is_connect() => {
                debug!("MPC-HC no responde en {}", self.base_url);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let html = response.error_for_status()?.text().await?;
        Ok(parse_variables(&html))
    }

    async fn open(&self, path: &Path) -> Result<(), PlayerError> {
        let url = format!(
            "{}/browser.html?path={}",
            self.base_url,
            urlencoding::encode(&path.display().to_string())
        );
        match self.client.get(&url).send().await {
            Ok(r) if r.status().is_success() => Ok(()),
            Ok(r) => {
                warn!("MPC-HC rechazó la apertura ({}), lanzando binario", r.status());
                self.launch(path).await
            }
            Err(_) => self.launch(path).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PAGE: &str = r#"<html><body>
<p id="file">video-AbCdEfGh.mp4</p>
<p id="filepath">C:\karaoke\entry-1\video-AbCdEfGh.mp4</p>
<p id="state">2</p>
<p id="position">61500</p>
<p id="positionstring">00:01:01</p>
<p id="duration">180000</p>
</body></html>"#;

    #[test]
    fn test_parse_variables() {
        assert_eq!(
            parse_variables(PAGE),
            Some(PlayerStatus {
                position_ms: 61_500,
                duration_ms: 180_000,
                filename: "video-AbCdEfGh.mp4".to_string(),
                filepath: Some(r"C:\karaoke\entry-1\video-AbCdEfGh.mp4".to_string()),
            })
        );
    }

    #[test]
    fn test_shows_compares_full_path() {
        let status = |filepath: Option<&str>| PlayerStatus {
            position_ms: 0,
            duration_ms: 1_000,
            filename: "download.mp4".to_string(),
            filepath: filepath.map(str::to_string),
        };

        let opened = Path::new("/srv/karaoke/entry-b/download.mp4");
        assert!(status(Some("/srv/karaoke/entry-b/download.mp4")).shows(opened));
        assert!(!status(Some("/srv/karaoke/entry-a/download.mp4")).shows(opened));
        assert!(status(None).shows(opened));
        assert!(!status(None).shows(Path::new("/srv/karaoke/entry-b/video-x.mp4")));

        let windows = Path::new(r"C:\Karaoke\entry-b\download.mp4");
        assert!(status(Some("c:/karaoke/entry-b/download.mp4")).shows(windows));
    }

    #[test]
    fn test_parse_variables_without_file() {
        let idle = r#"<p id="file"></p><p id="position">0</p><p id="duration">0</p>"#;
        assert_eq!(parse_variables(idle), None);
        assert_eq!(parse_variables("<html></html>"), None);
    }
}
