use crate::region::RedactionPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: Global,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub policy: RedactionPolicy,
    #[serde(default)]
    pub engine: Engine,
    #[serde(default)]
    pub archive: Archive,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub debug: Debug,
    #[serde(default)]
    pub security: Security,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;
        if self.archive.prefix.is_empty() {
            anyhow::bail!("archive.prefix must not be empty");
        }
        if image::ImageFormat::from_extension(&self.archive.extension).is_none() {
            anyhow::bail!("archive.extension is not an image format: {}", self.archive.extension);
        }
        if self.engine.confidence_scale <= 0.0 {
            anyhow::bail!("engine.confidence_scale must be > 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Global {
    pub print_summary: bool,
    /// 1 processes items strictly one after another.
    pub max_parallel_items: usize,
}
impl Default for Global {
    fn default() -> Self {
        Self {
            print_summary: true,
            max_parallel_items: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    pub input_dir: String,
    pub output_dir: String,
    pub pdf_filename: String,
    pub report_filename: String,
    pub scripts_dir: String,
}
impl Default for Paths {
    fn default() -> Self {
        Self {
            input_dir: "input_images".into(),
            output_dir: "output_images".into(),
            pdf_filename: "processed_document.pdf".into(),
            report_filename: "report.json".into(),
            scripts_dir: "scripts".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Gpu,
}

impl Device {
    pub fn is_gpu(self) -> bool {
        matches!(self, Device::Gpu)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Engine {
    pub python_exe: String,
    pub languages: Vec<String>,
    pub device: Device,
    /// Upper end of the engine's native score range; 100.0 for engines that
    /// report percentages.
    pub confidence_scale: f64,
    pub startup_timeout_seconds: u64,
    pub item_timeout_seconds: u64,
    pub doctor_timeout_seconds: u64,
}
impl Default for Engine {
    fn default() -> Self {
        Self {
            python_exe: "auto".into(),
            languages: vec!["en".into()],
            device: Device::Cpu,
            confidence_scale: 1.0,
            startup_timeout_seconds: 300,
            item_timeout_seconds: 120,
            doctor_timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Archive {
    pub prefix: String,
    pub extension: String,
}
impl Default for Archive {
    fn default() -> Self {
        Self {
            prefix: "redacted".into(),
            extension: "png".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_input_file_bytes: u64,
    pub batch_timeout_seconds: u64,
}
impl Default for Limits {
    fn default() -> Self {
        Self {
            max_input_file_bytes: 200 * 1024 * 1024,
            batch_timeout_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Debug {
    pub keep_python_stderr: bool,
    pub dump_effective_config: bool,
}
impl Default for Debug {
    fn default() -> Self {
        Self {
            keep_python_stderr: true,
            dump_effective_config: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Security {
    pub pin_scripts_dir: bool,
}
impl Default for Security {
    fn default() -> Self {
        Self {
            pin_scripts_dir: true,
        }
    }
}
