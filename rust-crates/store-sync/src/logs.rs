// Log entries as delivered by the chain collaborator, and their decoding against the
// schema. Payloads are hex encoded per column; decoding happens before any store
// mutation so a malformed batch never touches the store.
use crate::{
    Result,
    SyncError,
    schema::{
        ColumnType,
        Schema,
        TableId,
        TableSchema,
    },
    value::{
        FieldMap,
        RecordKey,
        Value,
        decode_hex,
    },
};
use serde::{
    Deserialize,
    Serialize,
};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogKind {
    /// Full record write; upserts the supplied columns.
    Set,
    /// Partial write of the supplied columns.
    Update,
    Delete,
    /// Replace `delete_count` bytes at `start` of a dynamic column with `data`.
    Splice {
        column: String,
        start: usize,
        delete_count: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub table: TableId,
    #[serde(flatten)]
    pub kind: LogKind,
    /// Hex encoded key values, one per key column in key-tuple order.
    pub key: Vec<String>,
    /// Hex encoded column values keyed by column name.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Hex encoded splice payload.
    #[serde(default)]
    pub data: Option<String>,
    pub block_number: u64,
    pub log_index: u32,
}

/// All logs emitted in one block; applied atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLogBatch {
    pub block_number: u64,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl BlockLogBatch {
    pub fn new(block_number: u64, logs: Vec<LogEntry>) -> Self {
        Self {
            block_number,
            logs,
        }
    }

    pub fn empty(block_number: u64) -> Self {
        Self::new(block_number, Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedOp {
    Set(FieldMap),
    Update(FieldMap),
    Delete,
    Splice {
        column: String,
        start: usize,
        delete_count: usize,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLog {
    pub table: TableId,
    pub key: RecordKey,
    pub op: DecodedOp,
    pub log_index: u32,
}

fn enum_len(schema: &Schema, ty: &ColumnType) -> Option<usize> {
    match ty {
        ColumnType::Enum(name) => schema.enum_variants(name).map(<[String]>::len),
        _ => None,
    }
}

fn decode_column(
    schema: &Schema,
    ty: &ColumnType,
    encoded: &str,
) -> std::result::Result<Value, String> {
    let bytes = decode_hex(encoded)?;
    Value::decode(ty, &bytes, enum_len(schema, ty))
}

fn decode_key(schema: &Schema, table: &TableSchema, raw: &[String]) -> Result<RecordKey> {
    if raw.len() != table.key_arity() {
        return Err(SyncError::schema(
            &table.id,
            format!(
                "key has {} values, table declares {} key columns",
                raw.len(),
                table.key_arity()
            ),
        ));
    }
    let mut values = Vec::with_capacity(raw.len());
    for (column, encoded) in table.key_columns().zip(raw) {
        let value = decode_column(schema, &column.ty, encoded)
            .map_err(|reason| {
                SyncError::decode(&table.id, format!("key {}: {reason}", column.name))
            })?;
        values.push(value);
    }
    Ok(RecordKey::new(values))
}

fn decode_fields(
    schema: &Schema,
    table: &TableSchema,
    raw: &BTreeMap<String, String>,
) -> Result<FieldMap> {
    let mut fields = FieldMap::new();
    for (name, encoded) in raw {
        let column = table.column(name).ok_or_else(|| {
            SyncError::schema(&table.id, format!("unknown column '{name}'"))
        })?;
        if table.is_key_column(name) {
            return Err(SyncError::schema(
                &table.id,
                format!("key column '{name}' cannot be written"),
            ));
        }
        let value = decode_column(schema, &column.ty, encoded).map_err(|reason| {
            SyncError::decode(&table.id, format!("column {name}: {reason}"))
        })?;
        fields.insert(name.clone(), value);
    }
    Ok(fields)
}

impl LogEntry {
    /// Decodes the entry against the schema without touching any store state.
    pub fn decode(&self, schema: &Schema) -> Result<DecodedLog> {
        let table = schema.table(&self.table).ok_or_else(|| {
            SyncError::schema(&self.table, "table is not declared in the schema")
        })?;
        let key = decode_key(schema, table, &self.key)?;
        let op = match &self.kind {
            LogKind::Set => DecodedOp::Set(decode_fields(schema, table, &self.fields)?),
            LogKind::Update => DecodedOp::Update(decode_fields(schema, table, &self.fields)?),
            LogKind::Delete => DecodedOp::Delete,
            LogKind::Splice {
                column,
                start,
                delete_count,
            } => {
                let declared = table.column(column).ok_or_else(|| {
                    SyncError::schema(&table.id, format!("unknown column '{column}'"))
                })?;
                if table.is_key_column(column) {
                    return Err(SyncError::schema(
                        &table.id,
                        format!("key column '{column}' cannot be written"),
                    ));
                }
                if !declared.ty.is_dynamic() {
                    return Err(SyncError::decode(
                        &table.id,
                        format!(
                            "cannot splice static column '{column}' of type {}",
                            declared.ty
                        ),
                    ));
                }
                let data = match &self.data {
                    Some(raw) => decode_hex(raw).map_err(|reason| {
                        SyncError::decode(&table.id, format!("splice {column}: {reason}"))
                    })?,
                    None => Vec::new(),
                };
                DecodedOp::Splice {
                    column: column.clone(),
                    start: *start,
                    delete_count: *delete_count,
                    data,
                }
            }
        };
        Ok(DecodedLog {
            table: self.table.clone(),
            key,
            op,
            log_index: self.log_index,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::schema::{
        Column,
        TableSchema,
    };

    fn schema() -> Schema {
        let table = TableSchema::new(
            TableId::new("app", "Player"),
            vec![
                Column::new("id", ColumnType::Uint(32)),
                Column::new("name", ColumnType::String),
                Column::new("level", ColumnType::Uint(8)),
            ],
            vec!["id".into()],
        )
        .unwrap();
        Schema::new(vec![table], BTreeMap::new()).unwrap()
    }

    fn entry(kind: LogKind, fields: &[(&str, &str)]) -> LogEntry {
        LogEntry {
            table: TableId::new("app", "Player"),
            kind,
            key: vec!["0x00000001".into()],
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            data: None,
            block_number: 1,
            log_index: 0,
        }
    }

    #[test]
    fn decode__set_decodes_key_and_fields() {
        // given
        let log = entry(LogKind::Set, &[("name", "0x616c696365"), ("level", "0x07")]);

        // when
        let decoded = log.decode(&schema()).unwrap();

        // then
        assert_eq!(decoded.key, RecordKey::from(Value::Uint(1)));
        let mut expected = FieldMap::new();
        expected.insert("name".into(), Value::String("alice".into()));
        expected.insert("level".into(), Value::Uint(7));
        assert_eq!(decoded.op, DecodedOp::Set(expected));
    }

    #[test]
    fn decode__unknown_column_is_schema_violation() {
        let log = entry(LogKind::Update, &[("mana", "0x01")]);
        let result = log.decode(&schema());
        assert!(matches!(result, Err(SyncError::SchemaViolation { .. })));
    }

    #[test]
    fn decode__writing_key_column_is_schema_violation() {
        let log = entry(LogKind::Update, &[("id", "0x00000002")]);
        let result = log.decode(&schema());
        assert!(matches!(result, Err(SyncError::SchemaViolation { .. })));
    }

    #[test]
    fn decode__wrong_key_arity_is_schema_violation() {
        // given
        let mut log = entry(LogKind::Delete, &[]);
        log.key.push("0x00".into());

        // when
        let result = log.decode(&schema());

        // then
        assert!(matches!(result, Err(SyncError::SchemaViolation { .. })));
    }

    #[test]
    fn decode__malformed_payload_is_decode_failure() {
        let log = entry(LogKind::Set, &[("level", "0x0102")]);
        let result = log.decode(&schema());
        assert!(matches!(result, Err(SyncError::DecodeFailure { .. })));
    }

    #[test]
    fn decode__splice_on_static_column_is_decode_failure() {
        // given
        let log = entry(
            LogKind::Splice {
                column: "level".into(),
                start: 0,
                delete_count: 1,
            },
            &[],
        );

        // when
        let result = log.decode(&schema());

        // then
        assert!(matches!(result, Err(SyncError::DecodeFailure { .. })));
    }

    #[test]
    fn log_entry__deserializes_from_json_lines_format() {
        // given
        let raw = r#"{
            "table": "app__Player",
            "kind": "splice",
            "column": "name",
            "start": 1,
            "delete_count": 2,
            "key": ["0x00000001"],
            "data": "0x6f",
            "block_number": 12,
            "log_index": 3
        }"#;

        // when
        let log: LogEntry = serde_json::from_str(raw).unwrap();

        // then
        assert_eq!(
            log.kind,
            LogKind::Splice {
                column: "name".into(),
                start: 1,
                delete_count: 2,
            }
        );
        assert_eq!(log.table, TableId::new("app", "Player"));
        assert_eq!(log.block_number, 12);
    }
}
