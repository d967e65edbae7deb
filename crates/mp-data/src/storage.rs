use std::path::{Path, PathBuf};

use async_trait::async_trait;
use csv::{ReaderBuilder, WriterBuilder};
use mp_types::{DataError, FeatureMatrix, MpResult, TargetVector};
use tracing::{debug, info};

/// Durable storage for numeric arrays, addressed by path.
///
/// Failures surface as [`DataError::StorageUnavailable`]; retrying is left to
/// the caller.
#[async_trait]
pub trait ArrayStore: Send + Sync + std::fmt::Debug {
    /// Load a 2-D array of features.
    async fn load_matrix(&self, path: &str) -> MpResult<FeatureMatrix>;

    /// Load a 1-D array of targets.
    async fn load_vector(&self, path: &str) -> MpResult<TargetVector>;

    async fn store_matrix(&self, matrix: &FeatureMatrix, path: &str) -> MpResult<()>;

    async fn store_vector(&self, vector: &TargetVector, path: &str) -> MpResult<()>;

    /// Get store name
    fn name(&self) -> &str;
}

/// On-disk encoding, picked from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayFormat {
    /// Headerless CSV, one row per sample.
    Csv,
    /// JSON array (`[..]` for vectors, `[[..], ..]` for matrices).
    Json,
}

impl ArrayFormat {
    pub fn from_path(path: &Path) -> MpResult<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => Ok(Self::Csv),
            Some(ext) if ext.eq_ignore_ascii_case("json") => Ok(Self::Json),
            other => Err(DataError::InvalidFormat {
                message: format!(
                    "unsupported array file extension {:?} for {}",
                    other.unwrap_or(""),
                    path.display()
                ),
            }
            .into()),
        }
    }
}

/// Array store backed by files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalArrayStore {
    pub data_root: PathBuf,
}

impl LocalArrayStore {
    pub fn new<P: AsRef<Path>>(data_root: P) -> Self {
        Self {
            data_root: data_root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.data_root.join(path)
    }

    async fn read_bytes(&self, path: &str) -> MpResult<(PathBuf, Vec<u8>)> {
        let full_path = self.resolve(path);
        let bytes = tokio::fs::read(&full_path)
            .await
            .map_err(|e| unavailable(&full_path, e))?;
        debug!("Read {} bytes from {}", bytes.len(), full_path.display());
        Ok((full_path, bytes))
    }

    async fn write_bytes(&self, path: &str, bytes: Vec<u8>) -> MpResult<()> {
        let full_path = self.resolve(path);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| unavailable(&full_path, e))?;
        }
        tokio::fs::write(&full_path, bytes)
            .await
            .map_err(|e| unavailable(&full_path, e))?;
        Ok(())
    }
}

#[async_trait]
impl ArrayStore for LocalArrayStore {
    async fn load_matrix(&self, path: &str) -> MpResult<FeatureMatrix> {
        let (full_path, bytes) = self.read_bytes(path).await?;
        let matrix = match ArrayFormat::from_path(&full_path)? {
            ArrayFormat::Csv => parse_csv(&bytes)?,
            ArrayFormat::Json => {
                let rows: Vec<Vec<f64>> = serde_json::from_slice(&bytes).map_err(|e| {
                    DataError::InvalidFormat {
                        message: format!("{}: {}", full_path.display(), e),
                    }
                })?;
                FeatureMatrix::from_rows(rows)?
            }
        };
        info!(
            "Loaded {}x{} matrix from {}",
            matrix.n_rows(),
            matrix.n_cols(),
            full_path.display()
        );
        Ok(matrix)
    }

    async fn load_vector(&self, path: &str) -> MpResult<TargetVector> {
        let (full_path, bytes) = self.read_bytes(path).await?;
        let vector = match ArrayFormat::from_path(&full_path)? {
            ArrayFormat::Csv => TargetVector::try_from(parse_csv(&bytes)?)?,
            ArrayFormat::Json => {
                // Accept both a flat array and a single-column matrix.
                match serde_json::from_slice::<Vec<f64>>(&bytes) {
                    Ok(values) => TargetVector::new(values),
                    Err(_) => {
                        let rows: Vec<Vec<f64>> = serde_json::from_slice(&bytes).map_err(|e| {
                            DataError::InvalidFormat {
                                message: format!("{}: {}", full_path.display(), e),
                            }
                        })?;
                        TargetVector::try_from(FeatureMatrix::from_rows(rows)?)?
                    }
                }
            }
        };
        info!("Loaded {} targets from {}", vector.len(), full_path.display());
        Ok(vector)
    }

    async fn store_matrix(&self, matrix: &FeatureMatrix, path: &str) -> MpResult<()> {
        let bytes = match ArrayFormat::from_path(Path::new(path))? {
            ArrayFormat::Csv => write_csv(matrix.iter_rows())?,
            ArrayFormat::Json => serde_json::to_vec(&matrix.to_rows())?,
        };
        self.write_bytes(path, bytes).await
    }

    async fn store_vector(&self, vector: &TargetVector, path: &str) -> MpResult<()> {
        let bytes = match ArrayFormat::from_path(Path::new(path))? {
            ArrayFormat::Csv => write_csv(vector.as_slice().chunks(1))?,
            ArrayFormat::Json => serde_json::to_vec(vector.as_slice())?,
        };
        self.write_bytes(path, bytes).await
    }

    fn name(&self) -> &str {
        "local"
    }
}

fn unavailable(path: &Path, error: std::io::Error) -> DataError {
    DataError::StorageUnavailable {
        path: path.display().to_string(),
        message: error.to_string(),
    }
}

fn parse_csv(bytes: &[u8]) -> MpResult<FeatureMatrix> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| DataError::InvalidFormat {
            message: format!("CSV record {}: {}", line, e),
        })?;
        let row = record
            .iter()
            .map(|field| {
                field.parse::<f64>().map_err(|e| DataError::InvalidFormat {
                    message: format!("CSV record {}: cannot parse {:?}: {}", line, field, e),
                })
            })
            .collect::<Result<Vec<f64>, _>>()?;
        rows.push(row);
    }

    FeatureMatrix::from_rows(rows)
}

fn write_csv<'a>(rows: impl Iterator<Item = &'a [f64]>) -> MpResult<Vec<u8>> {
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    for row in rows {
        writer
            .write_record(row.iter().map(|v| v.to_string()))
            .map_err(|e| DataError::InvalidFormat {
                message: e.to_string(),
            })?;
    }
    writer.into_inner().map_err(|e| {
        DataError::InvalidFormat {
            message: e.to_string(),
        }
        .into()
    })
}
