use crate::error::Result;
use crate::tiling::SchedulerConfig;
use crate::transform::ica::IcaConfig;
use crate::transform::matrix::Direction;
use crate::transform::mnf::MnfConfig;
use crate::transform::pca::PcaConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

pub(crate) fn save_toml<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<()> {
    let toml_string = toml::to_string_pretty(value)?;
    let mut file = BufWriter::new(fs::File::create(path.as_ref())?);
    file.write_all(toml_string.as_bytes())?;
    file.flush()?;
    Ok(())
}

pub(crate) fn load_toml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let toml_string = fs::read_to_string(path.as_ref())?;
    Ok(toml::from_str(&toml_string)?)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    #[default]
    Pca,
    Mnf,
    Ica,
}

/// Everything a batch job needs besides the rasters themselves. Every field has a
/// default, so an empty file is a valid job.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub transform: TransformKind,
    pub direction: Direction,
    pub scheduler: SchedulerConfig,
    pub pca: PcaConfig,
    pub mnf: MnfConfig,
    pub ica: IcaConfig,
}

impl JobConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_toml(path.as_ref())?;
        log::debug!("Loaded job configuration from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_toml(self, path)
    }
}
