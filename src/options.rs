use serde::{Deserialize, Serialize};

/// Parameters chosen at enqueue time. Never modified afterwards; retries and
/// respawns reuse the same snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    /// Output directory; falls back to the engine's download dir.
    pub output_dir: Option<String>,
    /// `audio`, `best`, or a raw yt-dlp format selector.
    pub format: Option<String>,
    /// `mp3`, `m4a`, `flac`, `wav`, `opus`, `aac`.
    pub audio_format: Option<String>,
    pub audio_bitrate: Option<String>,
    /// Remux target (`mp4`, `mkv`, `webm`).
    pub container: Option<String>,
    /// Clip start, `HH:MM:SS`, `MM:SS` or seconds.
    pub range_start: Option<String>,
    pub range_end: Option<String>,
    pub subtitles: bool,
    pub subtitle_lang: Option<String>,
    pub embed_subtitles: bool,
    pub embed_metadata: bool,
    pub custom_filename: Option<String>,
    pub cookies_file: Option<String>,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    /// Passed to `--limit-rate`, e.g. `2M`.
    pub rate_limit: Option<String>,
}

impl DownloadOptions {
    pub fn is_audio_only(&self) -> bool {
        self.format.as_deref() == Some("audio")
            || (self.format.is_none() && self.audio_format.is_some())
    }

    pub fn is_clip(&self) -> bool {
        self.range_start.is_some() || self.range_end.is_some()
    }

    /// Whether a post-processing pass (merge, extract, trim, remux, embed)
    /// is expected after the raw transfer.
    pub fn expects_post_processing(&self) -> bool {
        self.is_audio_only()
            || self.is_clip()
            || self.container.is_some()
            || self.embed_metadata
            || self.embed_subtitles
            || matches!(self.format.as_deref(), None | Some("best"))
    }

    /// Length of the requested clip in seconds, if a range was given.
    /// An open end is estimated as sixty seconds past the start.
    pub fn clip_duration_secs(&self) -> Option<f64> {
        if !self.is_clip() {
            return None;
        }
        let start = parse_time_to_seconds(self.range_start.as_deref());
        let end = parse_time_to_seconds(self.range_end.as_deref());
        let end = if end > 0.0 { end } else { start + 60.0 };
        Some((end - start).max(1.0))
    }
}

/// Parses `HH:MM:SS(.fff)`, `MM:SS` or plain seconds; anything else is zero.
pub fn parse_time_to_seconds(value: Option<&str>) -> f64 {
    let s = match value {
        Some(v) => v.trim(),
        None => return 0.0,
    };
    if s.is_empty() || s == "inf" {
        return 0.0;
    }

    let mut total = 0.0;
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() > 3 {
        return 0.0;
    }
    for part in parts {
        let Ok(v) = part.parse::<f64>() else {
            return 0.0;
        };
        total = total * 60.0 + v;
    }
    total
}
