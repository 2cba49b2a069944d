//! FileSink - writes each prediction to its own file

use contracts::{ContractError, LabelVolume, PredictionSink, SampleId};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, instrument};

/// On-disk encoding of a prediction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileFormat {
    /// NumPy `.npy` (`u16`), any rank
    #[default]
    Npy,
    /// bincode-encoded ndarray, any rank
    Bincode,
    /// JSON-encoded ndarray, any rank
    Json,
    /// 16-bit grayscale PNG, 2D only
    Png,
}

impl FileFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "npy" => Some(Self::Npy),
            "bin" | "bincode" => Some(Self::Bincode),
            "json" => Some(Self::Json),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Npy => "npy",
            Self::Bincode => "bin",
            Self::Json => "json",
            Self::Png => "png",
        }
    }
}

/// Configuration for FileSink
#[derive(Debug, Clone)]
pub struct FileSinkConfig {
    /// Output directory
    pub base_path: PathBuf,
    pub format: FileFormat,
}

impl FileSinkConfig {
    /// Create config from params map (`base_path`, `format`)
    pub fn from_params(params: &HashMap<String, String>) -> std::io::Result<Self> {
        let base_path = params
            .get("base_path")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./predictions"));

        let format = match params.get("format") {
            Some(value) => FileFormat::parse(value).ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("unknown prediction format '{value}'"),
                )
            })?,
            None => FileFormat::default(),
        };

        Ok(Self { base_path, format })
    }
}

/// Sink that writes predictions to disk files
pub struct FileSink {
    name: String,
    config: FileSinkConfig,
}

impl FileSink {
    /// Create a new FileSink; the output directory is created eagerly
    pub fn new(name: impl Into<String>, config: FileSinkConfig) -> std::io::Result<Self> {
        fs::create_dir_all(&config.base_path)?;

        Ok(Self {
            name: name.into(),
            config,
        })
    }

    /// Create from params map (for factory)
    pub fn from_params(
        name: impl Into<String>,
        params: &HashMap<String, String>,
    ) -> std::io::Result<Self> {
        let config = FileSinkConfig::from_params(params)?;
        Self::new(name, config)
    }

    /// Path a prediction for `sample_id` is written to
    pub fn output_path(&self, sample_id: &SampleId) -> PathBuf {
        let stem: String = sample_id
            .as_str()
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
            .collect();
        self.config
            .base_path
            .join(format!("{stem}.{}", self.config.format.extension()))
    }

    fn write_to_disk(&self, path: &Path, volume: &LabelVolume) -> std::io::Result<()> {
        match self.config.format {
            FileFormat::Npy => {
                ndarray_npy::write_npy(path, volume).map_err(std::io::Error::other)
            }
            FileFormat::Bincode => {
                let mut writer = BufWriter::new(File::create(path)?);
                bincode::serialize_into(&mut writer, volume).map_err(std::io::Error::other)?;
                writer.flush()
            }
            FileFormat::Json => {
                let mut writer = BufWriter::new(File::create(path)?);
                serde_json::to_writer(&mut writer, volume)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                writer.flush()
            }
            FileFormat::Png => save_png(path, volume),
        }
    }

    fn persist(&self, sample_id: &SampleId, volume: &LabelVolume) -> Result<(), ContractError> {
        let path = self.output_path(sample_id);
        self.write_to_disk(&path, volume).map_err(|e| {
            error!(sink = %self.name, sample_id = %sample_id, error = %e, "Write failed");
            ContractError::sink_write(&self.name, format!("{}: {e}", path.display()))
        })?;
        debug!(sink = %self.name, path = %path.display(), "prediction written");
        Ok(())
    }
}

fn save_png(path: &Path, volume: &LabelVolume) -> std::io::Result<()> {
    let &[height, width] = volume.shape() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("png output needs a 2D volume, got shape {:?}", volume.shape()),
        ));
    };
    let (Ok(width), Ok(height)) = (u32::try_from(width), u32::try_from(height)) else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "volume too large for png",
        ));
    };

    // Row-major iteration matches the image buffer layout
    let pixels: Vec<u16> = volume.iter().copied().collect();
    let buffer = image::ImageBuffer::<image::Luma<u16>, Vec<u16>>::from_raw(width, height, pixels)
        .ok_or_else(|| std::io::Error::other("pixel buffer size mismatch"))?;
    buffer.save(path).map_err(std::io::Error::other)
}

impl PredictionSink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        name = "file_sink_write",
        skip(self, volume),
        fields(sink = %self.name, sample_id = %sample_id)
    )]
    async fn write(
        &mut self,
        sample_id: &SampleId,
        volume: &LabelVolume,
    ) -> Result<(), ContractError> {
        self.persist(sample_id, volume)
    }

    #[instrument(name = "file_sink_flush", skip(self))]
    async fn flush(&mut self) -> Result<(), ContractError> {
        Ok(())
    }

    #[instrument(name = "file_sink_close", skip(self))]
    async fn close(&mut self) -> Result<(), ContractError> {
        debug!(sink = %self.name, "FileSink closed");
        Ok(())
    }
}
