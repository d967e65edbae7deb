use async_trait::async_trait;
use dashmap::DashMap;
use mp_types::{DataError, FeatureMatrix, MpResult, TargetVector};

/// In-memory array store, used for tests and for staging synthetic data.
#[derive(Debug, Default)]
pub struct InMemoryArrayStore {
    matrices: DashMap<String, FeatureMatrix>,
    vectors: DashMap<String, TargetVector>,
}

impl InMemoryArrayStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.matrices.len() + self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, path: &str) -> bool {
        self.matrices.contains_key(path) || self.vectors.contains_key(path)
    }
}

fn missing(path: &str) -> DataError {
    DataError::StorageUnavailable {
        path: path.to_string(),
        message: "no array stored at this path".to_string(),
    }
}

#[async_trait]
impl crate::ArrayStore for InMemoryArrayStore {
    async fn load_matrix(&self, path: &str) -> MpResult<FeatureMatrix> {
        self.matrices
            .get(path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| missing(path).into())
    }

    async fn load_vector(&self, path: &str) -> MpResult<TargetVector> {
        if let Some(entry) = self.vectors.get(path) {
            return Ok(entry.value().clone());
        }
        // A single-column matrix stored under the path also qualifies.
        match self.matrices.get(path) {
            Some(entry) => TargetVector::try_from(entry.value().clone()),
            None => Err(missing(path).into()),
        }
    }

    async fn store_matrix(&self, matrix: &FeatureMatrix, path: &str) -> MpResult<()> {
        self.matrices.insert(path.to_string(), matrix.clone());
        Ok(())
    }

    async fn store_vector(&self, vector: &TargetVector, path: &str) -> MpResult<()> {
        self.vectors.insert(path.to_string(), vector.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
