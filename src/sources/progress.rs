use num_format::{Locale, ToFormattedString};

const BAR_CELLS: usize = 20;

/// Prefix yt-dlp prints before every progress line we ask it for.
pub const PROGRESS_MARKER: &str = "karaqueue-progress";

/// `--progress-template` value producing lines understood by [`parse_line`].
pub fn progress_template() -> String {
    format!(
        "download:{} %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s",
        PROGRESS_MARKER
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

fn parse_bytes(s: &str) -> Option<u64> {
    s.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v as u64)
}

/// Parses one progress line; the estimate is used when the total is unknown.
pub fn parse_line(line: &str) -> Option<Progress> {
    let mut parts = line.trim().split_whitespace();
    if parts.next()? != PROGRESS_MARKER {
        return None;
    }
    let downloaded = parse_bytes(parts.next()?).unwrap_or(0);
    let total = parts.next().and_then(parse_bytes);
    let estimate = parts.next().and_then(parse_bytes);
    Some(Progress {
        downloaded,
        total: total.or(estimate).filter(|t| *t > 0),
    })
}

/// Barra de 20 celdas y porcentaje.
pub fn bar(done: u64, total: u64) -> (String, f64) {
    let ratio = if total == 0 {
        0.0
    } else {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    };
    let filled = (ratio * BAR_CELLS as f64).round() as usize;
    let bar = "█".repeat(filled) + &"░".repeat(BAR_CELLS - filled);
    (bar, ratio * 100.0)
}

pub fn render(label: &str, title: &str, progress: Progress) -> String {
    match progress.total {
        None => format!(
            "Loading {} `{}`...\nDownloading... {} bytes downloaded",
            label,
            title,
            progress.downloaded.to_formatted_string(&Locale::en)
        ),
        Some(total) => {
            let (bar, percent) = bar(progress.downloaded, total);
            let mb = progress.downloaded.max(total) as f64 / 1024.0 / 1024.0;
            format!(
                "Loading {} `{}`...\nDownloading: {} {:.0}% of {:.1}Mb",
                label, title, bar, percent, mb
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_line() {
        assert_eq!(
            parse_line("karaqueue-progress 1024 4096 NA"),
            Some(Progress { downloaded: 1024, total: Some(4096) })
        );
        assert_eq!(
            parse_line("karaqueue-progress 10 NA 2000.5"),
            Some(Progress { downloaded: 10, total: Some(2000) })
        );
        assert_eq!(
            parse_line("karaqueue-progress 10 NA NA"),
            Some(Progress { downloaded: 10, total: None })
        );
        assert_eq!(parse_line("[youtube] dQw4w9WgXcQ: Downloading webpage"), None);
    }

    #[test]
    fn test_render_with_total() {
        let msg = render(
            "youtube video",
            "Song",
            Progress { downloaded: 5 * 1024 * 1024, total: Some(10 * 1024 * 1024) },
        );
        assert_eq!(
            msg,
            "Loading youtube video `Song`...\nDownloading: ██████████░░░░░░░░░░ 50% of 10.0Mb"
        );
    }

    #[test]
    fn test_render_without_total() {
        let msg = render("niconico video", "Song", Progress { downloaded: 1_234_567, total: None });
        assert_eq!(
            msg,
            "Loading niconico video `Song`...\nDownloading... 1,234,567 bytes downloaded"
        );
    }

    #[test]
    fn test_bar_clamps() {
        assert_eq!(bar(0, 0).1, 0.0);
        let (full, percent) = bar(20, 10);
        assert_eq!(full, "█".repeat(20));
        assert_eq!(percent, 100.0);
    }
}
