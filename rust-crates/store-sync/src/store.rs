// In-memory table store. One `RecordStore` owns the write path; any number of
// `StoreReader` handles read and subscribe. Writes are staged in a `StoreTxn` and become
// visible in a single commit, so readers never observe half of a batch.
use crate::{
    Result,
    SyncError,
    logs::{
        DecodedLog,
        DecodedOp,
    },
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
    },
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    panic::{
        AssertUnwindSafe,
        catch_unwind,
    },
    sync::{
        Arc,
        Mutex,
        PoisonError,
        RwLock,
        RwLockReadGuard,
        Weak,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub table: TableId,
    pub key: RecordKey,
    /// Non-key columns.
    pub value: FieldMap,
    pub last_modified_block: u64,
}

impl Record {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.value.get(column)
    }

    /// Key and value columns merged into one map.
    pub fn to_fields(&self, schema: &TableSchema) -> FieldMap {
        let mut fields = self.value.clone();
        for (column, value) in schema.key_columns().zip(self.key.values()) {
            fields.insert(column.name.clone(), value.clone());
        }
        fields
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordChange {
    pub table: TableId,
    pub key: RecordKey,
    pub kind: ChangeKind,
    pub previous: Option<Record>,
    pub current: Option<Record>,
    pub block_number: u64,
}

/// Changes delivered to one subscriber for one commit, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreUpdate {
    pub block_number: u64,
    pub changes: Vec<RecordChange>,
}

/// Which records of a table a subscriber or selection is interested in.
#[derive(Clone)]
pub enum KeyFilter {
    All,
    Key(RecordKey),
    Keys(Vec<RecordKey>),
    Predicate(Arc<dyn Fn(&Record) -> bool + Send + Sync>),
}

impl KeyFilter {
    pub fn predicate(f: impl Fn(&Record) -> bool + Send + Sync + 'static) -> Self {
        KeyFilter::Predicate(Arc::new(f))
    }

    pub fn matches_record(&self, record: &Record) -> bool {
        match self {
            KeyFilter::All => true,
            KeyFilter::Key(key) => record.key == *key,
            KeyFilter::Keys(keys) => keys.contains(&record.key),
            KeyFilter::Predicate(predicate) => predicate(record),
        }
    }

    /// A change matches when the record matched before or after it.
    pub fn matches_change(&self, change: &RecordChange) -> bool {
        match self {
            KeyFilter::All => true,
            KeyFilter::Key(key) => change.key == *key,
            KeyFilter::Keys(keys) => keys.contains(&change.key),
            KeyFilter::Predicate(predicate) => {
                change.previous.as_ref().is_some_and(|r| predicate(r))
                    || change.current.as_ref().is_some_and(|r| predicate(r))
            }
        }
    }
}

impl std::fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyFilter::All => write!(f, "All"),
            KeyFilter::Key(key) => write!(f, "Key({key})"),
            KeyFilter::Keys(keys) => write!(f, "Keys({})", keys.len()),
            KeyFilter::Predicate(_) => write!(f, "Predicate"),
        }
    }
}

struct TableData {
    schema: Arc<TableSchema>,
    enum_lens: HashMap<String, usize>,
    records: HashMap<RecordKey, Record>,
    tombstones: HashMap<RecordKey, u64>,
}

impl TableData {
    fn new(schema: Arc<TableSchema>, all: &Schema) -> Self {
        let enum_lens = schema
            .columns()
            .iter()
            .filter_map(|column| match &column.ty {
                ColumnType::Enum(name) => all
                    .enum_variants(name)
                    .map(|variants| (column.name.clone(), variants.len())),
                _ => None,
            })
            .collect();
        Self {
            schema,
            enum_lens,
            records: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }

    fn validate_key(&self, key: &RecordKey) -> Result<()> {
        let table = &self.schema.id;
        if key.len() != self.schema.key_arity() {
            return Err(SyncError::schema(
                table,
                format!(
                    "key has {} values, table declares {} key columns",
                    key.len(),
                    self.schema.key_arity()
                ),
            ));
        }
        for (column, value) in self.schema.key_columns().zip(key.values()) {
            let enum_len = self.enum_lens.get(&column.name).copied();
            if !value.conforms_to(&column.ty, enum_len) {
                return Err(SyncError::schema(
                    table,
                    format!("key value {value} does not fit {} {}", column.ty, column.name),
                ));
            }
        }
        Ok(())
    }

    fn validate_fields(&self, fields: &FieldMap) -> Result<()> {
        let table = &self.schema.id;
        for (name, value) in fields {
            let column = self.schema.column(name).ok_or_else(|| {
                SyncError::schema(table, format!("unknown column '{name}'"))
            })?;
            if self.schema.is_key_column(name) {
                return Err(SyncError::schema(
                    table,
                    format!("key column '{name}' cannot be written"),
                ));
            }
            let enum_len = self.enum_lens.get(name).copied();
            if !value.conforms_to(&column.ty, enum_len) {
                return Err(SyncError::schema(
                    table,
                    format!("value {value} does not fit {} {name}", column.ty),
                ));
            }
        }
        Ok(())
    }

    fn default_value(&self) -> FieldMap {
        self.schema
            .value_columns()
            .map(|column| (column.name.clone(), Value::default_for(&column.ty)))
            .collect()
    }
}

#[derive(Default)]
struct StoreState {
    tables: BTreeMap<TableId, TableData>,
}

impl StoreState {
    fn table(&self, id: &TableId) -> Result<&TableData> {
        self.tables
            .get(id)
            .ok_or_else(|| SyncError::schema(id, "table is not registered"))
    }
}

type Callback = Arc<dyn Fn(&StoreUpdate) + Send + Sync>;

#[derive(Clone)]
enum Sink {
    Callback(Callback),
    Channel(mpsc::UnboundedSender<StoreUpdate>),
}

struct Subscriber {
    id: u64,
    table: TableId,
    filter: KeyFilter,
    sink: Sink,
}

#[derive(Default)]
struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl SubscriberRegistry {
    fn add(&self, table: TableId, filter: KeyFilter, sink: Sink) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                id,
                table,
                filter,
                sink,
            });
        id
    }

    fn remove(&self, ids: &[u64]) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|subscriber| !ids.contains(&subscriber.id));
    }

    fn len(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Delivers `changes` to every interested subscriber. Callbacks run outside the
    /// registry lock so they may read the store or (un)subscribe.
    fn notify(&self, block_number: u64, changes: &[RecordChange]) -> Vec<SyncError> {
        if changes.is_empty() {
            return Vec::new();
        }
        let deliveries: Vec<(u64, Sink, StoreUpdate)> = {
            let subscribers = self
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers
                .iter()
                .filter_map(|subscriber| {
                    let matching: Vec<RecordChange> = changes
                        .iter()
                        .filter(|change| {
                            change.table == subscriber.table
                                && subscriber.filter.matches_change(change)
                        })
                        .cloned()
                        .collect();
                    if matching.is_empty() {
                        return None;
                    }
                    let update = StoreUpdate {
                        block_number,
                        changes: matching,
                    };
                    Some((subscriber.id, subscriber.sink.clone(), update))
                })
                .collect()
        };

        let mut failures = Vec::new();
        let mut closed = Vec::new();
        for (id, sink, update) in deliveries {
            match sink {
                Sink::Callback(callback) => {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(&update))) {
                        let reason = panic_message(panic.as_ref());
                        tracing::error!(subscriber = id, %reason, "subscriber callback panicked");
                        failures.push(SyncError::SubscriberError {
                            subscriber: id,
                            reason,
                        });
                    }
                }
                Sink::Channel(sender) => {
                    if sender.send(update).is_err() {
                        tracing::debug!(subscriber = id, "subscriber channel closed");
                        closed.push(id);
                    }
                }
            }
        }
        if !closed.is_empty() {
            self.remove(&closed);
        }
        failures
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle for one or more registrations; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    ids: Vec<u64>,
    registry: Weak<SubscriberRegistry>,
}

impl Subscription {
    fn merge(mut self, mut other: Subscription) -> Self {
        self.ids.append(&mut other.ids);
        self
    }

    pub(crate) fn combine(subscriptions: Vec<Subscription>) -> Option<Subscription> {
        subscriptions.into_iter().reduce(Subscription::merge)
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.ids);
        }
    }
}

/// Borrowed view of the committed store state.
pub struct StoreView<'a> {
    state: RwLockReadGuard<'a, StoreState>,
}

impl StoreView<'_> {
    pub fn get_record(&self, table: &TableId, key: &RecordKey) -> Option<&Record> {
        self.state.tables.get(table)?.records.get(key)
    }

    /// Live records of a table in key order.
    pub fn records(&self, table: &TableId) -> Vec<&Record> {
        let mut records: Vec<&Record> = self
            .state
            .tables
            .get(table)
            .map(|data| data.records.values().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    pub fn len(&self, table: &TableId) -> usize {
        self.state
            .tables
            .get(table)
            .map(|data| data.records.len())
            .unwrap_or(0)
    }
}

/// Cloneable read and subscribe handle.
#[derive(Clone)]
pub struct StoreReader {
    state: Arc<RwLock<StoreState>>,
    registry: Arc<SubscriberRegistry>,
}

impl StoreReader {
    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn view(&self) -> StoreView<'_> {
        StoreView { state: self.read() }
    }

    pub fn get_record(&self, table: &TableId, key: &RecordKey) -> Option<Record> {
        self.view().get_record(table, key).cloned()
    }

    /// Point lookups for several keys; missing keys are omitted.
    pub fn get_records(
        &self,
        table: &TableId,
        keys: &[RecordKey],
    ) -> BTreeMap<RecordKey, Record> {
        let view = self.view();
        keys.iter()
            .filter_map(|key| {
                view.get_record(table, key)
                    .map(|record| (key.clone(), record.clone()))
            })
            .collect()
    }

    pub fn records(&self, table: &TableId) -> Vec<Record> {
        self.view().records(table).into_iter().cloned().collect()
    }

    pub fn len(&self, table: &TableId) -> usize {
        self.view().len(table)
    }

    pub fn table_ids(&self) -> Vec<TableId> {
        self.read().tables.keys().cloned().collect()
    }

    pub fn table_schema(&self, table: &TableId) -> Option<Arc<TableSchema>> {
        self.read()
            .tables
            .get(table)
            .map(|data| data.schema.clone())
    }

    /// Block at which a deleted record was removed, while its tombstone is kept.
    pub fn tombstone(&self, table: &TableId, key: &RecordKey) -> Option<u64> {
        self.read()
            .tables
            .get(table)?
            .tombstones
            .get(key)
            .copied()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    fn ensure_table(&self, table: &TableId) -> Result<()> {
        self.read().table(table).map(|_| ())
    }

    /// Registers `callback` for creates, updates and deletes of matching records. The
    /// callback runs after each commit, before the next batch is processed.
    pub fn subscribe(
        &self,
        table: &TableId,
        filter: KeyFilter,
        callback: impl Fn(&StoreUpdate) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.ensure_table(table)?;
        let id = self.registry.add(
            table.clone(),
            filter,
            Sink::Callback(Arc::new(callback)),
        );
        Ok(Subscription {
            ids: vec![id],
            registry: Arc::downgrade(&self.registry),
        })
    }

    /// Channel flavour of [`StoreReader::subscribe`] for async consumers.
    pub fn subscribe_channel(
        &self,
        table: &TableId,
        filter: KeyFilter,
    ) -> Result<(Subscription, mpsc::UnboundedReceiver<StoreUpdate>)> {
        self.ensure_table(table)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self
            .registry
            .add(table.clone(), filter, Sink::Channel(sender));
        let subscription = Subscription {
            ids: vec![id],
            registry: Arc::downgrade(&self.registry),
        };
        Ok((subscription, receiver))
    }
}

enum Slot {
    Live(Record),
    Deleted { block: u64 },
}

struct StagedEntry {
    table: TableId,
    key: RecordKey,
    original: Option<Record>,
    slot: Slot,
}

/// Uncommitted writes layered over the committed state.
pub struct StoreTxn<'a> {
    base: RwLockReadGuard<'a, StoreState>,
    index: HashMap<(TableId, RecordKey), usize>,
    entries: Vec<StagedEntry>,
}

impl StoreTxn<'_> {
    fn current(&self, table: &TableId, key: &RecordKey) -> Option<&Record> {
        match self.index.get(&(table.clone(), key.clone())) {
            Some(i) => match &self.entries[*i].slot {
                Slot::Live(record) => Some(record),
                Slot::Deleted { .. } => None,
            },
            None => self.base.tables.get(table)?.records.get(key),
        }
    }

    fn put(&mut self, table: &TableId, key: &RecordKey, slot: Slot) {
        let lookup = (table.clone(), key.clone());
        match self.index.get(&lookup) {
            Some(i) => self.entries[*i].slot = slot,
            None => {
                let original = self
                    .base
                    .tables
                    .get(table)
                    .and_then(|data| data.records.get(key))
                    .cloned();
                self.index.insert(lookup, self.entries.len());
                self.entries.push(StagedEntry {
                    table: table.clone(),
                    key: key.clone(),
                    original,
                    slot,
                });
            }
        }
    }

    fn starting_value(&self, data: &TableData, key: &RecordKey) -> FieldMap {
        self.current(&data.schema.id, key)
            .map(|record| record.value.clone())
            .unwrap_or_else(|| data.default_value())
    }

    /// Upserts `fields`, merging into the existing record or into column defaults.
    pub fn set_fields(
        &mut self,
        table: &TableId,
        key: &RecordKey,
        fields: FieldMap,
        block: u64,
    ) -> Result<()> {
        let data = self.base.table(table)?;
        data.validate_key(key)?;
        data.validate_fields(&fields)?;
        let mut value = self.starting_value(data, key);
        value.extend(fields);
        let record = Record {
            table: table.clone(),
            key: key.clone(),
            value,
            last_modified_block: block,
        };
        self.put(table, key, Slot::Live(record));
        Ok(())
    }

    /// Replaces `delete_count` bytes at `start` of a `string` or `bytes` column.
    pub fn splice(
        &mut self,
        table: &TableId,
        key: &RecordKey,
        column: &str,
        start: usize,
        delete_count: usize,
        data: &[u8],
        block: u64,
    ) -> Result<()> {
        let table_data = self.base.table(table)?;
        table_data.validate_key(key)?;
        let declared = table_data.schema.column(column).ok_or_else(|| {
            SyncError::schema(table, format!("unknown column '{column}'"))
        })?;
        if table_data.schema.is_key_column(column) {
            return Err(SyncError::schema(
                table,
                format!("key column '{column}' cannot be written"),
            ));
        }
        let mut value = self.starting_value(table_data, key);
        let mut bytes = match value.get(column) {
            Some(Value::String(text)) => text.clone().into_bytes(),
            Some(Value::Bytes(bytes)) => bytes.clone(),
            _ => {
                return Err(SyncError::decode(
                    table,
                    format!(
                        "cannot splice static column '{column}' of type {}",
                        declared.ty
                    ),
                ));
            }
        };
        let Some(end) = start
            .checked_add(delete_count)
            .filter(|end| *end <= bytes.len())
        else {
            return Err(SyncError::decode(
                table,
                format!(
                    "splice of {delete_count} bytes at {start} exceeds '{column}' length {}",
                    bytes.len()
                ),
            ));
        };
        bytes.splice(start..end, data.iter().copied());
        let spliced = match declared.ty {
            ColumnType::String => Value::String(String::from_utf8(bytes).map_err(|e| {
                SyncError::decode(table, format!("splice left '{column}' invalid UTF-8: {e}"))
            })?),
            _ => Value::Bytes(bytes),
        };
        value.insert(column.to_string(), spliced);
        let record = Record {
            table: table.clone(),
            key: key.clone(),
            value,
            last_modified_block: block,
        };
        self.put(table, key, Slot::Live(record));
        Ok(())
    }

    /// Removes the record; deleting a missing key is a no-op.
    pub fn delete(&mut self, table: &TableId, key: &RecordKey, block: u64) -> Result<()> {
        let data = self.base.table(table)?;
        data.validate_key(key)?;
        if self.current(table, key).is_none() {
            return Ok(());
        }
        self.put(table, key, Slot::Deleted { block });
        Ok(())
    }

    /// Applies one decoded log at `block`.
    pub fn apply_log(&mut self, log: DecodedLog, block: u64) -> Result<()> {
        match log.op {
            DecodedOp::Set(fields) => self.set_fields(&log.table, &log.key, fields, block),
            DecodedOp::Update(fields) => {
                if self.current(&log.table, &log.key).is_none() {
                    tracing::debug!(
                        table = %log.table,
                        key = %log.key,
                        "update on missing record, starting from column defaults"
                    );
                }
                self.set_fields(&log.table, &log.key, fields, block)
            }
            DecodedOp::Delete => self.delete(&log.table, &log.key, block),
            DecodedOp::Splice {
                column,
                start,
                delete_count,
                data,
            } => self.splice(
                &log.table,
                &log.key,
                &column,
                start,
                delete_count,
                &data,
                block,
            ),
        }
    }

    /// Ends staging and releases the read lock.
    pub fn finish(self, block_number: u64) -> StagedBatch {
        let mut writes = Vec::with_capacity(self.entries.len());
        let mut changes = Vec::new();
        for entry in self.entries {
            let (kind, current, deleted_at) = match entry.slot {
                Slot::Live(record) => {
                    let kind = if entry.original.is_some() {
                        ChangeKind::Updated
                    } else {
                        ChangeKind::Created
                    };
                    (Some(kind), Some(record), None)
                }
                Slot::Deleted { block } => {
                    // created and deleted inside the batch: no visible change, but the
                    // tombstone is still recorded
                    let kind = entry.original.as_ref().map(|_| ChangeKind::Deleted);
                    (kind, None, Some(block))
                }
            };
            if let Some(kind) = kind {
                changes.push(RecordChange {
                    table: entry.table.clone(),
                    key: entry.key.clone(),
                    kind,
                    previous: entry.original,
                    current: current.clone(),
                    block_number,
                });
            }
            writes.push(StagedWrite {
                table: entry.table,
                key: entry.key,
                current,
                deleted_at,
            });
        }
        StagedBatch {
            block_number,
            writes,
            changes,
        }
    }
}

struct StagedWrite {
    table: TableId,
    key: RecordKey,
    current: Option<Record>,
    deleted_at: Option<u64>,
}

/// A fully validated batch of writes, ready to commit.
pub struct StagedBatch {
    block_number: u64,
    writes: Vec<StagedWrite>,
    changes: Vec<RecordChange>,
}

impl StagedBatch {
    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn changes(&self) -> &[RecordChange] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// The single writer. Owned by the ingestion pipeline; hands out [`StoreReader`]s.
pub struct RecordStore {
    reader: StoreReader,
}

impl RecordStore {
    pub fn new(schema: &Schema) -> Self {
        let tables = schema
            .tables()
            .map(|table| (table.id.clone(), TableData::new(table.clone(), schema)))
            .collect();
        let state = StoreState { tables };
        Self {
            reader: StoreReader {
                state: Arc::new(RwLock::new(state)),
                registry: Arc::new(SubscriberRegistry::default()),
            },
        }
    }

    pub fn reader(&self) -> StoreReader {
        self.reader.clone()
    }

    pub fn get_record(&self, table: &TableId, key: &RecordKey) -> Option<Record> {
        self.reader.get_record(table, key)
    }

    pub fn get_records(
        &self,
        table: &TableId,
        keys: &[RecordKey],
    ) -> BTreeMap<RecordKey, Record> {
        self.reader.get_records(table, keys)
    }

    pub fn subscribe(
        &self,
        table: &TableId,
        filter: KeyFilter,
        callback: impl Fn(&StoreUpdate) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.reader.subscribe(table, filter, callback)
    }

    /// Starts staging writes against the committed state.
    pub fn begin(&self) -> StoreTxn<'_> {
        StoreTxn {
            base: self.reader.read(),
            index: HashMap::new(),
            entries: Vec::new(),
        }
    }

    /// Makes a staged batch visible in one step and returns its changes. Subscribers
    /// are not notified here; see [`RecordStore::notify`].
    pub fn commit(&mut self, staged: StagedBatch) -> Vec<RecordChange> {
        let mut state = self
            .reader
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for write in staged.writes {
            let Some(data) = state.tables.get_mut(&write.table) else {
                continue;
            };
            match (write.current, write.deleted_at) {
                (Some(record), _) => {
                    data.tombstones.remove(&write.key);
                    data.records.insert(write.key, record);
                }
                (None, Some(block)) => {
                    data.records.remove(&write.key);
                    data.tombstones.insert(write.key, block);
                }
                (None, None) => {}
            }
        }
        staged.changes
    }

    /// Delivers committed changes to subscribers. Returns subscriber failures, which
    /// are isolated and never affect the store.
    pub fn notify(&self, block_number: u64, changes: &[RecordChange]) -> Vec<SyncError> {
        self.reader.registry.notify(block_number, changes)
    }

    fn commit_and_notify(&mut self, staged: StagedBatch) -> Vec<RecordChange> {
        let block_number = staged.block_number();
        let changes = self.commit(staged);
        self.notify(block_number, &changes);
        changes
    }

    /// Upserts one record outside of a batch. Fails before mutating anything when the
    /// key or a column does not match the schema.
    pub fn set_record(
        &mut self,
        table: &TableId,
        key: &RecordKey,
        fields: FieldMap,
        block: u64,
    ) -> Result<RecordChange> {
        let staged = {
            let mut txn = self.begin();
            txn.set_fields(table, key, fields, block)?;
            txn.finish(block)
        };
        let mut changes = self.commit_and_notify(staged);
        changes
            .pop()
            .ok_or_else(|| SyncError::schema(table, "set produced no change"))
    }

    /// Deletes one record outside of a batch; returns `None` when nothing was deleted.
    pub fn delete_record(
        &mut self,
        table: &TableId,
        key: &RecordKey,
        block: u64,
    ) -> Result<Option<RecordChange>> {
        let staged = {
            let mut txn = self.begin();
            txn.delete(table, key, block)?;
            txn.finish(block)
        };
        Ok(self.commit_and_notify(staged).pop())
    }

    /// Drops tombstones recorded at or before `up_to_block`; returns how many.
    pub fn purge_tombstones(&mut self, up_to_block: u64) -> usize {
        let mut state = self
            .reader
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut purged = 0;
        for data in state.tables.values_mut() {
            let before = data.tombstones.len();
            data.tombstones.retain(|_, block| *block > up_to_block);
            purged += before - data.tombstones.len();
        }
        purged
    }

    /// Replaces the committed state with a restored snapshot without notifying.
    pub fn restore(
        &mut self,
        records: Vec<Record>,
        tombstones: Vec<(TableId, RecordKey, u64)>,
    ) -> Result<()> {
        let mut state = self
            .reader
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for record in &records {
            let data = state.table(&record.table)?;
            data.validate_key(&record.key)?;
            data.validate_fields(&record.value)?;
        }
        for (table, key, _) in &tombstones {
            state.table(table)?.validate_key(key)?;
        }
        for data in state.tables.values_mut() {
            data.records.clear();
            data.tombstones.clear();
        }
        for record in records {
            if let Some(data) = state.tables.get_mut(&record.table) {
                data.records.insert(record.key.clone(), record);
            }
        }
        for (table, key, block) in tombstones {
            if let Some(data) = state.tables.get_mut(&table) {
                data.tombstones.insert(key, block);
            }
        }
        Ok(())
    }

    /// All live records and tombstones, for persistence.
    pub fn export(&self) -> (Vec<Record>, Vec<(TableId, RecordKey, u64)>) {
        let state = self.reader.read();
        let mut records = Vec::new();
        let mut tombstones = Vec::new();
        for (id, data) in &state.tables {
            records.extend(data.records.values().cloned());
            tombstones.extend(
                data.tombstones
                    .iter()
                    .map(|(key, block)| (id.clone(), key.clone(), *block)),
            );
        }
        (records, tombstones)
    }
}
