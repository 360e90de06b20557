use eyre::{Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TestSettings {
    pub fio_settings: Option<FioSettings>,
    /// Benchmark every empty non-root disk instead of an explicit target list.
    #[serde(default)]
    pub use_all_disks: bool,
    #[serde(default)]
    pub workers: i32,
    /// Pause between consecutive target dispatches.
    #[serde(default)]
    pub delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FioSettings {
    #[serde(default)]
    pub numjobs: Vec<u32>,
    #[serde(default = "default_io_engine")]
    pub ioengine: String,
    #[serde(default)]
    pub direct: bool,
    #[serde(default)]
    pub verify: bool,
    #[serde(default)]
    pub bs: Vec<String>,
    /// Per-invocation runtime in seconds.
    #[serde(default)]
    pub runtime: u64,
    #[serde(default)]
    pub iodepth: Vec<u32>,
    #[serde(default)]
    pub rw: Vec<String>,
    /// Explicit device or file targets. May be empty when `use_all_disks`.
    #[serde(default)]
    pub filename: Vec<String>,
}

fn default_io_engine() -> String {
    "libaio".to_owned()
}

impl Default for FioSettings {
    fn default() -> Self {
        Self {
            numjobs: Vec::new(),
            ioengine: default_io_engine(),
            direct: false,
            verify: false,
            bs: Vec::new(),
            runtime: 0,
            iodepth: Vec::new(),
            rw: Vec::new(),
            filename: Vec::new(),
        }
    }
}

impl TestSettings {
    /// Reject configurations that cannot produce any work and normalize the
    /// worker count.
    pub fn validate(&mut self) -> Result<()> {
        let Some(fio_settings) = &self.fio_settings else {
            bail!("fio parameters should be specified");
        };
        if !self.use_all_disks && fio_settings.filename.is_empty() {
            bail!("filename or use_all_disks should be specified");
        }
        if self.workers <= 0 {
            self.workers = 1;
        }
        Ok(())
    }
}
