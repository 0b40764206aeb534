// Table definitions the store validates every write against.
use crate::{
    Result,
    SyncError,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    fmt,
    str::FromStr,
    sync::Arc,
};

const NAMESPACE_SEPARATOR: &str = "__";

/// Identifies a table as `namespace__name`; the root namespace is empty and renders as
/// the bare name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableId {
    pub namespace: String,
    pub name: String,
}

impl TableId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn root(name: impl Into<String>) -> Self {
        Self::new("", name)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}{NAMESPACE_SEPARATOR}{}", self.namespace, self.name)
        }
    }
}

impl FromStr for TableId {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        let raw = raw.trim();
        let (namespace, name) = raw.split_once(NAMESPACE_SEPARATOR).unwrap_or(("", raw));
        if name.is_empty() {
            return Err(format!("table id '{raw}' has an empty name"));
        }
        Ok(Self::new(namespace, name))
    }
}

impl TryFrom<String> for TableId {
    type Error = String;

    fn try_from(raw: String) -> std::result::Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<TableId> for String {
    fn from(id: TableId) -> Self {
        id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Bool,
    /// Unsigned integer of the given bit width (8..=128, multiple of 8).
    Uint(u16),
    /// Signed integer of the given bit width (8..=128, multiple of 8).
    Int(u16),
    Address,
    Bytes32,
    String,
    Bytes,
    Enum(String),
}

impl ColumnType {
    /// Dynamic columns have no fixed width and accept splices.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, ColumnType::String | ColumnType::Bytes)
    }

    /// Encoded width in bytes, `None` for dynamic columns.
    pub fn static_width(&self) -> Option<usize> {
        match self {
            ColumnType::Bool | ColumnType::Enum(_) => Some(1),
            ColumnType::Uint(bits) | ColumnType::Int(bits) => Some(usize::from(*bits) / 8),
            ColumnType::Address => Some(20),
            ColumnType::Bytes32 => Some(32),
            ColumnType::String | ColumnType::Bytes => None,
        }
    }

    /// Integer columns must be a multiple of 8 bits, at most 128.
    pub fn has_valid_width(&self) -> bool {
        match self {
            ColumnType::Uint(bits) | ColumnType::Int(bits) => valid_int_width(*bits),
            _ => true,
        }
    }
}

fn valid_int_width(bits: u16) -> bool {
    bits != 0 && bits <= 128 && bits % 8 == 0
}

fn parse_bits(raw: &str, digits: &str) -> std::result::Result<u16, String> {
    let bits: u16 = digits
        .parse()
        .map_err(|_| format!("invalid integer width in column type '{raw}'"))?;
    if !valid_int_width(bits) {
        return Err(format!(
            "integer width in column type '{raw}' must be a multiple of 8 up to 128"
        ));
    }
    Ok(bits)
}

impl FromStr for ColumnType {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        let ty = raw.trim();
        if let Some(name) = ty.strip_prefix("enum:") {
            if name.is_empty() {
                return Err(format!("column type '{raw}' names no enum"));
            }
            return Ok(ColumnType::Enum(name.to_string()));
        }
        if let Some(digits) = ty.strip_prefix("uint") {
            return parse_bits(raw, digits).map(ColumnType::Uint);
        }
        if let Some(digits) = ty.strip_prefix("int") {
            return parse_bits(raw, digits).map(ColumnType::Int);
        }
        match ty {
            "bool" => Ok(ColumnType::Bool),
            "address" => Ok(ColumnType::Address),
            "bytes32" => Ok(ColumnType::Bytes32),
            "string" => Ok(ColumnType::String),
            "bytes" => Ok(ColumnType::Bytes),
            _ => Err(format!("unknown column type '{raw}'")),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Bool => write!(f, "bool"),
            ColumnType::Uint(bits) => write!(f, "uint{bits}"),
            ColumnType::Int(bits) => write!(f, "int{bits}"),
            ColumnType::Address => write!(f, "address"),
            ColumnType::Bytes32 => write!(f, "bytes32"),
            ColumnType::String => write!(f, "string"),
            ColumnType::Bytes => write!(f, "bytes"),
            ColumnType::Enum(name) => write!(f, "enum:{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub id: TableId,
    columns: Vec<Column>,
    key: Vec<String>,
}

impl TableSchema {
    /// Builds a table schema; `key` lists the primary key columns in key-tuple order.
    pub fn new(id: TableId, columns: Vec<Column>, key: Vec<String>) -> Result<Self> {
        if key.is_empty() {
            return Err(SyncError::Config(format!("table {id} declares no key columns")));
        }
        let mut seen = BTreeSet::new();
        for column in &columns {
            if !column.ty.has_valid_width() {
                return Err(SyncError::Config(format!(
                    "table {id} column '{}' has invalid type {}: integer width must be a multiple of 8 up to 128",
                    column.name, column.ty
                )));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(SyncError::Config(format!(
                    "table {id} declares column '{}' twice",
                    column.name
                )));
            }
        }
        let mut key_seen = BTreeSet::new();
        for name in &key {
            if !seen.contains(name.as_str()) {
                return Err(SyncError::Config(format!(
                    "table {id} key column '{name}' is not a declared column"
                )));
            }
            if !key_seen.insert(name.as_str()) {
                return Err(SyncError::Config(format!(
                    "table {id} lists key column '{name}' twice"
                )));
            }
        }
        Ok(Self { id, columns, key })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn is_key_column(&self, name: &str) -> bool {
        self.key.iter().any(|key| key == name)
    }

    /// Key columns in key-tuple order.
    pub fn key_columns(&self) -> impl Iterator<Item = &Column> {
        self.key.iter().filter_map(|name| self.column(name))
    }

    pub fn value_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns
            .iter()
            .filter(|column| !self.is_key_column(&column.name))
    }

    pub fn key_arity(&self) -> usize {
        self.key.len()
    }
}

/// The resolved set of tables and enums, fixed for the lifetime of a session.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    tables: BTreeMap<TableId, Arc<TableSchema>>,
    enums: BTreeMap<String, Vec<String>>,
}

impl Schema {
    pub fn new(
        tables: impl IntoIterator<Item = TableSchema>,
        enums: BTreeMap<String, Vec<String>>,
    ) -> Result<Self> {
        for (name, variants) in &enums {
            if variants.is_empty() || variants.len() > 256 {
                return Err(SyncError::Config(format!(
                    "enum {name} must have between 1 and 256 variants"
                )));
            }
        }
        let mut by_id = BTreeMap::new();
        for table in tables {
            for column in table.columns() {
                if let ColumnType::Enum(enum_name) = &column.ty {
                    if !enums.contains_key(enum_name) {
                        return Err(SyncError::Config(format!(
                            "table {} column '{}' references unknown enum {enum_name}",
                            table.id, column.name
                        )));
                    }
                }
            }
            let id = table.id.clone();
            if by_id.insert(id.clone(), Arc::new(table)).is_some() {
                return Err(SyncError::Config(format!("table {id} is declared twice")));
            }
        }
        Ok(Self {
            tables: by_id,
            enums,
        })
    }

    pub fn table(&self, id: &TableId) -> Option<&Arc<TableSchema>> {
        self.tables.get(id)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<TableSchema>> {
        self.tables.values()
    }

    pub fn enum_variants(&self, name: &str) -> Option<&[String]> {
        self.enums.get(name).map(Vec::as_slice)
    }

    pub fn enums(&self) -> &BTreeMap<String, Vec<String>> {
        &self.enums
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn table_id__round_trips_namespaced_name() {
        // given
        let raw = "app__Position";

        // when
        let id: TableId = raw.parse().unwrap();

        // then
        assert_eq!(id, TableId::new("app", "Position"));
        assert_eq!(id.to_string(), raw);
    }

    #[test]
    fn table_id__root_namespace_renders_bare_name() {
        let id: TableId = "Counter".parse().unwrap();
        assert_eq!(id, TableId::root("Counter"));
        assert_eq!(id.to_string(), "Counter");
    }

    #[test]
    fn column_type__parses_known_types() {
        assert_eq!("uint32".parse::<ColumnType>().unwrap(), ColumnType::Uint(32));
        assert_eq!("int8".parse::<ColumnType>().unwrap(), ColumnType::Int(8));
        assert_eq!(
            "enum:Direction".parse::<ColumnType>().unwrap(),
            ColumnType::Enum("Direction".into())
        );
        assert_eq!("address".parse::<ColumnType>().unwrap(), ColumnType::Address);
    }

    #[test]
    fn column_type__rejects_invalid_widths() {
        assert!("uint7".parse::<ColumnType>().is_err());
        assert!("uint256".parse::<ColumnType>().is_err());
        assert!("int0".parse::<ColumnType>().is_err());
        assert!("float".parse::<ColumnType>().is_err());
    }

    #[test]
    fn table_schema__rejects_invalid_integer_width() {
        for ty in [
            ColumnType::Int(0),
            ColumnType::Uint(12),
            ColumnType::Uint(200),
            ColumnType::Int(136),
        ] {
            // given
            let columns = vec![
                Column::new("id", ColumnType::Uint(8)),
                Column::new("v", ty.clone()),
            ];

            // when
            let result = TableSchema::new(TableId::root("T"), columns, vec!["id".into()]);

            // then
            assert!(matches!(result, Err(SyncError::Config(_))), "{ty} accepted");
        }
    }

    #[test]
    fn table_schema__rejects_undeclared_key_column() {
        // given
        let columns = vec![Column::new("name", ColumnType::String)];

        // when
        let result = TableSchema::new(TableId::root("T"), columns, vec!["id".into()]);

        // then
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn table_schema__splits_key_and_value_columns() {
        // given
        let columns = vec![
            Column::new("owner", ColumnType::Address),
            Column::new("amount", ColumnType::Uint(64)),
            Column::new("slot", ColumnType::Uint(8)),
        ];

        // when
        let table = TableSchema::new(
            TableId::root("Balance"),
            columns,
            vec!["slot".into(), "owner".into()],
        )
        .unwrap();

        // then
        let keys: Vec<_> = table.key_columns().map(|c| c.name.as_str()).collect();
        let values: Vec<_> = table.value_columns().map(|c| c.name.as_str()).collect();
        assert_eq!(keys, vec!["slot", "owner"]);
        assert_eq!(values, vec!["amount"]);
    }

    #[test]
    fn schema__rejects_unknown_enum_reference() {
        // given
        let table = TableSchema::new(
            TableId::root("Unit"),
            vec![
                Column::new("id", ColumnType::Uint(32)),
                Column::new("kind", ColumnType::Enum("UnitKind".into())),
            ],
            vec!["id".into()],
        )
        .unwrap();

        // when
        let result = Schema::new(vec![table], BTreeMap::new());

        // then
        assert!(matches!(result, Err(SyncError::Config(_))));
    }
}
