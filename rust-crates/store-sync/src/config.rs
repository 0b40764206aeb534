use crate::{
    Result,
    SyncError,
    schema::{
        Column,
        ColumnType,
        Schema,
        TableId,
        TableSchema,
    },
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    collections::BTreeMap,
    fs,
    path::{
        Path,
        PathBuf,
    },
};

const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnConfig {
    pub name: String,
    /// `bool`, `uintN`, `intN`, `address`, `bytes32`, `string`, `bytes` or `enum:<Name>`.
    #[serde(rename = "type")]
    pub ty: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    pub columns: Vec<ColumnConfig>,
    pub key: Vec<String>,
}

impl TableConfig {
    pub fn id(&self) -> TableId {
        TableId::new(self.namespace.clone(), self.name.clone())
    }

    fn to_schema(&self) -> Result<TableSchema> {
        let id = self.id();
        let columns = self
            .columns
            .iter()
            .map(|column| {
                column
                    .ty
                    .parse::<ColumnType>()
                    .map(|ty| Column::new(column.name.clone(), ty))
                    .map_err(|reason| {
                        SyncError::Config(format!("table {id} column '{}': {reason}", column.name))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        TableSchema::new(id, columns, self.key.clone())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Smallest percentage change worth publishing; 0 publishes every change.
    #[serde(default)]
    pub min_percentage_delta: f64,
}

/// Resolved world configuration, loaded once at startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub tables: Vec<TableConfig>,
    #[serde(default)]
    pub enums: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl SyncConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_json_str(&raw)?;
        tracing::debug!(
            path = %path.display(),
            tables = config.tables.len(),
            enums = config.enums.len(),
            "loaded sync config"
        );
        Ok(config)
    }

    /// Parses and validates a config document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| SyncError::Config(format!("failed to parse config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(SyncError::Config("queue_capacity must be at least 1".into()));
        }
        let delta = self.progress.min_percentage_delta;
        if !delta.is_finite() || !(0.0..=100.0).contains(&delta) {
            return Err(SyncError::Config(format!(
                "progress.min_percentage_delta must be within 0..=100, got {delta}"
            )));
        }
        self.schema().map(|_| ())
    }

    pub fn schema(&self) -> Result<Schema> {
        let tables = self
            .tables
            .iter()
            .map(TableConfig::to_schema)
            .collect::<Result<Vec<_>>>()?;
        Schema::new(tables, self.enums.clone())
    }
}
