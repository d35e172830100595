use crate::config::QueueSettings;
use crate::events::{DOWNLOAD_PREFIX, FILE_PREFIX, POSTPROCESS_PREFIX, TITLE_PREFIX};
use crate::options::DownloadOptions;
use crate::paths::AppPaths;
use crate::process::LaunchSpec;
use crate::{EngineError, Result};
use std::path::{Path, PathBuf};
use url::Url;

const SOCKET_TIMEOUT_SECS: &str = "30";
const DEFAULT_OUTPUT_TEMPLATE: &str = "%(title)s [%(id)s].%(ext)s";

const TRACKING_PARAMS: &[&str] = &[
    "si",
    "pp",
    "feature",
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "gclid",
    "fbclid",
    "igshid",
];

/// Resolved locations of the external tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub yt_dlp: PathBuf,
    /// Passed as `--ffmpeg-location`; `None` leaves ffmpeg to `PATH`.
    pub ffmpeg_location: Option<PathBuf>,
}

impl ToolPaths {
    /// Settings overrides win over bundled binaries, which win over `PATH`.
    pub fn resolve(paths: &AppPaths, settings: &QueueSettings) -> Self {
        let yt_dlp = settings
            .yt_dlp_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| paths.yt_dlp_cmd());
        let ffmpeg_location = settings
            .ffmpeg_path
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| paths.bundled_ffmpeg_dir());
        Self {
            yt_dlp,
            ffmpeg_location,
        }
    }
}

/// Accepts http(s) URLs with a host and strips tracking parameters.
pub fn normalize_url(value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidUrl("empty URL provided".to_string()));
    }
    let redacted = redact_url_for_log(trimmed);

    let mut parsed = Url::parse(trimmed)
        .map_err(|_| EngineError::InvalidUrl(format!("invalid URL format: {redacted}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(EngineError::InvalidUrl(format!(
            "unsupported URL scheme for {redacted}; only http/https are allowed"
        )));
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(EngineError::InvalidUrl(format!(
            "URL is missing host: {redacted}"
        )));
    }

    if parsed.query().is_some() {
        let kept: Vec<(String, String)> = parsed
            .query_pairs()
            .into_owned()
            .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.as_str()))
            .collect();
        if kept.is_empty() {
            parsed.set_query(None);
        } else {
            parsed.query_pairs_mut().clear().extend_pairs(kept);
        }
    }

    Ok(parsed.to_string())
}

/// Scheme and host only, for log lines.
pub fn redact_url_for_log(value: &str) -> String {
    match Url::parse(value.trim()) {
        Ok(url) => format!(
            "{}://{}/...",
            url.scheme(),
            url.host_str().unwrap_or("unknown-host")
        ),
        Err(_) => "[invalid-url]".to_string(),
    }
}

pub fn build_invocation(
    url: &str,
    options: &DownloadOptions,
    output_dir: &Path,
    tools: &ToolPaths,
) -> Result<LaunchSpec> {
    let url = normalize_url(url)?;
    Ok(LaunchSpec {
        program: tools.yt_dlp.clone(),
        args: build_args(&url, options, output_dir, tools),
        working_dir: Some(output_dir.to_path_buf()),
        expect_post_processing: options.expects_post_processing(),
        clip_duration_secs: options.clip_duration_secs(),
    })
}

pub fn build_args(
    url: &str,
    options: &DownloadOptions,
    output_dir: &Path,
    tools: &ToolPaths,
) -> Vec<String> {
    let fragments = if options.is_clip() { "1" } else { "4" };

    let mut args: Vec<String> = vec![
        "-P".to_string(),
        output_dir.to_string_lossy().to_string(),
        "-o".to_string(),
        output_template(options),
        "--newline".to_string(),
        "--no-colors".to_string(),
        "--no-playlist".to_string(),
        "--no-overwrites".to_string(),
        "--continue".to_string(),
        "--ignore-config".to_string(),
        "--encoding".to_string(),
        "utf-8".to_string(),
        "-N".to_string(),
        fragments.to_string(),
        "--socket-timeout".to_string(),
        SOCKET_TIMEOUT_SECS.to_string(),
        "--progress".to_string(),
        "--no-simulate".to_string(),
        "--progress-template".to_string(),
        format!(
            "download:{DOWNLOAD_PREFIX}%(progress.status)s;%(progress.downloaded_bytes)s;\
             %(progress.total_bytes)s;%(progress.total_bytes_estimate)s;%(progress.speed)s;%(progress.eta)s"
        ),
        "--progress-template".to_string(),
        format!("postprocess:{POSTPROCESS_PREFIX}%(progress.status)s;%(progress.postprocessor)s"),
        "--print".to_string(),
        format!("before_dl:{TITLE_PREFIX}%(title)s"),
        "--print".to_string(),
        format!("after_move:{FILE_PREFIX}%(filepath)s"),
    ];

    if let Some(location) = &tools.ffmpeg_location {
        args.push("--ffmpeg-location".to_string());
        args.push(location.to_string_lossy().to_string());
    }

    if options.is_audio_only() {
        let audio_format = options.audio_format.as_deref().unwrap_or("mp3");
        args.push("-f".to_string());
        args.push("ba/b".to_string());
        args.push("-x".to_string());
        args.push("--audio-format".to_string());
        args.push(audio_format.to_string());
        args.push("--audio-quality".to_string());
        args.push(audio_quality(options.audio_bitrate.as_deref()).to_string());
    } else {
        let selector = match options.format.as_deref() {
            None | Some("best") => "bv*+ba/b",
            Some(raw) => raw,
        };
        args.push("-f".to_string());
        args.push(selector.to_string());
        if let Some(container) = &options.container {
            args.push("--merge-output-format".to_string());
            args.push(container.clone());
        }
    }

    if options.is_clip() {
        let start = options
            .range_start
            .as_deref()
            .map(sanitize_time)
            .unwrap_or_else(|| "0".to_string());
        let end = options
            .range_end
            .as_deref()
            .map(sanitize_time)
            .unwrap_or_else(|| "inf".to_string());
        args.push("--download-sections".to_string());
        args.push(format!("*{start}-{end}"));
        args.push("--force-keyframes-at-cuts".to_string());
    }

    if options.subtitles {
        let lang = options.subtitle_lang.as_deref().unwrap_or("en");
        args.push("--write-subs".to_string());
        if lang == "all" {
            args.push("--all-subs".to_string());
        } else {
            args.push("--write-auto-subs".to_string());
            args.push("--sub-langs".to_string());
            args.push(lang.to_string());
        }
        if options.embed_subtitles && !options.is_audio_only() && !options.is_clip() {
            args.push("--embed-subs".to_string());
            args.push("--convert-subs".to_string());
            args.push("srt".to_string());
        }
    }

    if options.embed_metadata {
        args.push("--embed-metadata".to_string());
    }
    if let Some(cookies) = non_empty(options.cookies_file.as_deref()) {
        args.push("--cookies".to_string());
        args.push(cookies.to_string());
    }
    if let Some(proxy) = non_empty(options.proxy.as_deref()) {
        args.push("--proxy".to_string());
        args.push(proxy.to_string());
    }
    if let Some(agent) = non_empty(options.user_agent.as_deref()) {
        args.push("--user-agent".to_string());
        args.push(agent.to_string());
    }
    if let Some(rate) = non_empty(options.rate_limit.as_deref()) {
        args.push("--limit-rate".to_string());
        args.push(rate.to_string());
    }

    args.push("--".to_string());
    args.push(url.to_string());
    args
}

fn output_template(options: &DownloadOptions) -> String {
    match non_empty(options.custom_filename.as_deref()) {
        Some(name) => format!("{}.%(ext)s", sanitize_filename(name)),
        None => DEFAULT_OUTPUT_TEMPLATE.to_string(),
    }
}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').to_string();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

fn sanitize_time(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ':' || *c == '.')
        .collect()
}

fn audio_quality(bitrate: Option<&str>) -> &'static str {
    match bitrate.map(|b| b.trim().trim_end_matches('k')) {
        Some("320") => "0",
        Some("256") => "1",
        Some("160") => "3",
        Some("128") => "5",
        Some("96") => "7",
        Some("64") => "9",
        _ => "2",
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
