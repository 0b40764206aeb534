// Derived views over the store. A projection recomputes on every commit to the tables it
// reads and only reaches listeners when the result differs under its comparator.
use crate::{
    Result,
    SyncError,
    schema::TableId,
    store::{
        KeyFilter,
        Record,
        StoreReader,
        StoreView,
        Subscription,
    },
    value::RecordKey,
};
use std::{
    panic::{
        AssertUnwindSafe,
        catch_unwind,
    },
    sync::{
        Arc,
        Mutex,
        PoisonError,
        Weak,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
};
use tokio::sync::watch;

type Compute<T> = Box<dyn Fn(&StoreView<'_>) -> T + Send + Sync>;
type Comparator<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;
type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ProjectionInner<T> {
    reader: StoreReader,
    compute: Compute<T>,
    same: Comparator<T>,
    last: watch::Sender<T>,
    next_listener: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
}

impl<T: Clone> ProjectionInner<T> {
    fn compute(&self) -> T {
        (self.compute)(&self.reader.view())
    }

    fn refresh(&self) {
        let next = self.compute();
        let changed = self.last.send_if_modified(|last| {
            if (self.same)(last, &next) {
                return false;
            }
            *last = next.clone();
            true
        });
        if !changed {
            return;
        }
        let listeners: Vec<(u64, Listener<T>)> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&next))).is_err() {
                tracing::error!(listener = id, "projection listener panicked");
            }
        }
    }
}

/// A derived value kept in step with the store.
pub struct Projection<T> {
    inner: Arc<ProjectionInner<T>>,
    _source: Option<Subscription>,
}

/// Records of one table matching a [`KeyFilter`], in key order.
pub type Selection = Projection<Vec<Record>>;

impl<T: Clone + Send + Sync + 'static> Projection<T> {
    /// Current value, computed from the latest committed batch.
    pub fn get(&self) -> T {
        self.inner.compute()
    }

    /// Last value delivered to listeners.
    pub fn last_delivered(&self) -> T {
        self.inner.last.borrow().clone()
    }

    /// `listener` runs after each commit that changes the projected value.
    pub fn subscribe(
        &self,
        listener: impl Fn(&T) + Send + Sync + 'static,
    ) -> ProjectionSubscription<T> {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        ProjectionSubscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn watch(&self) -> watch::Receiver<T> {
        self.inner.last.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[must_use = "dropping a ProjectionSubscription removes the listener"]
pub struct ProjectionSubscription<T> {
    id: u64,
    inner: Weak<ProjectionInner<T>>,
}

impl<T> ProjectionSubscription<T> {
    pub fn unsubscribe(self) {}
}

impl<T> Drop for ProjectionSubscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}

fn select_records(view: &StoreView<'_>, table: &TableId, filter: &KeyFilter) -> Vec<Record> {
    match filter {
        KeyFilter::Key(key) => view.get_record(table, key).into_iter().cloned().collect(),
        KeyFilter::Keys(keys) => {
            let mut keys: Vec<&RecordKey> = keys.iter().collect();
            keys.sort();
            keys.dedup();
            keys.into_iter()
                .filter_map(|key| view.get_record(table, key).cloned())
                .collect()
        }
        _ => view
            .records(table)
            .into_iter()
            .filter(|record| filter.matches_record(record))
            .cloned()
            .collect(),
    }
}

impl StoreReader {
    /// Projection over `tables`, compared with `PartialEq`.
    pub fn project<T>(
        &self,
        tables: &[TableId],
        compute: impl Fn(&StoreView<'_>) -> T + Send + Sync + 'static,
    ) -> Result<Projection<T>>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.project_with(tables, compute, |a: &T, b: &T| a == b)
    }

    /// Projection over `tables`; `same` decides whether two results are equivalent.
    pub fn project_with<T>(
        &self,
        tables: &[TableId],
        compute: impl Fn(&StoreView<'_>) -> T + Send + Sync + 'static,
        same: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
    ) -> Result<Projection<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let sources = tables
            .iter()
            .map(|table| (table.clone(), KeyFilter::All))
            .collect();
        self.projection(sources, Box::new(compute), Box::new(same))
    }

    /// Matching records of `table`, re-delivered whenever the set or any member changes.
    pub fn select(&self, table: &TableId, filter: KeyFilter) -> Result<Selection> {
        let id = table.clone();
        let projected = filter.clone();
        self.projection(
            vec![(table.clone(), filter)],
            Box::new(move |view: &StoreView<'_>| select_records(view, &id, &projected)),
            Box::new(|a: &Vec<Record>, b: &Vec<Record>| a == b),
        )
    }

    /// Single-record projection; `None` while the record does not exist.
    pub fn select_record(
        &self,
        table: &TableId,
        key: RecordKey,
    ) -> Result<Projection<Option<Record>>> {
        let id = table.clone();
        let lookup = key.clone();
        self.projection(
            vec![(table.clone(), KeyFilter::Key(key))],
            Box::new(move |view: &StoreView<'_>| view.get_record(&id, &lookup).cloned()),
            Box::new(|a: &Option<Record>, b: &Option<Record>| a == b),
        )
    }

    fn projection<T>(
        &self,
        sources: Vec<(TableId, KeyFilter)>,
        compute: Compute<T>,
        same: Comparator<T>,
    ) -> Result<Projection<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        for (table, _) in &sources {
            if self.table_schema(table).is_none() {
                return Err(SyncError::schema(table, "table is not registered"));
            }
        }
        let initial = compute(&self.view());
        let (last, _) = watch::channel(initial);
        let inner = Arc::new(ProjectionInner {
            reader: self.clone(),
            compute,
            same,
            last,
            next_listener: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        });
        let mut subscriptions = Vec::with_capacity(sources.len());
        for (table, filter) in sources {
            let inner = inner.clone();
            subscriptions.push(self.subscribe(&table, filter, move |_| inner.refresh())?);
        }
        Ok(Projection {
            inner,
            _source: Subscription::combine(subscriptions),
        })
    }
}
