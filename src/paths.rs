use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn queue_settings_path(&self) -> PathBuf {
        self.config_dir().join("queue_settings.json")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.base_dir.join("db")
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_dir().join("queue.sqlite")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base_dir.join("tools")
    }

    pub fn yt_dlp_bin_path(&self) -> PathBuf {
        let mut path = self.tools_dir().join("yt-dlp").join("yt-dlp");
        if cfg!(windows) {
            path.set_extension("exe");
        }
        path
    }

    pub fn ffmpeg_bin_path(&self) -> PathBuf {
        let mut path = self.tools_dir().join("ffmpeg").join("ffmpeg");
        if cfg!(windows) {
            path.set_extension("exe");
        }
        path
    }

    /// Bundled yt-dlp when present, otherwise whatever is on `PATH`.
    pub fn yt_dlp_cmd(&self) -> PathBuf {
        let path = self.yt_dlp_bin_path();
        if path.exists() {
            path
        } else {
            PathBuf::from("yt-dlp")
        }
    }

    /// Directory handed to yt-dlp's `--ffmpeg-location`, if ffmpeg is bundled.
    pub fn bundled_ffmpeg_dir(&self) -> Option<PathBuf> {
        let path = self.ffmpeg_bin_path();
        if path.exists() {
            path.parent().map(Path::to_path_buf)
        } else {
            None
        }
    }

    pub fn download_dir_override_path(&self) -> PathBuf {
        self.config_dir().join("download_dir.txt")
    }

    pub fn default_download_dir(&self) -> PathBuf {
        self.base_dir.join("downloads")
    }

    pub fn download_dir_override(&self) -> std::io::Result<Option<PathBuf>> {
        let path = self.download_dir_override_path();
        if !path.exists() {
            return Ok(None);
        }

        let raw = std::fs::read_to_string(path)?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        Ok(Some(PathBuf::from(trimmed)))
    }

    pub fn effective_download_dir(&self) -> std::io::Result<PathBuf> {
        if let Some(override_dir) = self.download_dir_override()? {
            return Ok(override_dir);
        }
        Ok(self.default_download_dir())
    }

    pub fn set_download_dir_override(&self, dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::write(
            self.download_dir_override_path(),
            format!("{}\n", dir.to_string_lossy()),
        )?;
        Ok(())
    }

    pub fn clear_download_dir_override(&self) -> std::io::Result<()> {
        let path = self.download_dir_override_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.db_dir())?;
        std::fs::create_dir_all(self.tools_dir())?;
        std::fs::create_dir_all(self.effective_download_dir()?)?;
        Ok(())
    }
}
