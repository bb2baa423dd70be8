use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".stepwise"))
            .unwrap_or_else(|| PathBuf::from(".stepwise"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.base.join("snapshots")
    }

    pub fn browser_profiles_dir(&self) -> PathBuf {
        self.base.join("browser_profiles")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.snapshots_dir())?;
        std::fs::create_dir_all(self.browser_profiles_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
