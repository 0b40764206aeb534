#![allow(non_snake_case)]

use proptest::prelude::*;
use std::collections::BTreeMap;
use store_sync::{
    IngestionPipeline,
    RecordStore,
    logs::{
        BlockLogBatch,
        LogEntry,
        LogKind,
    },
    progress::percentage,
    schema::{
        Column,
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

fn table_id() -> TableId {
    TableId::new("app", "Balance")
}

fn schema() -> Schema {
    let table = TableSchema::new(
        table_id(),
        vec![
            Column::new("owner", ColumnType::Uint(8)),
            Column::new("amount", ColumnType::Uint(64)),
        ],
        vec!["owner".into()],
    )
    .unwrap();
    Schema::new(vec![table], BTreeMap::new()).unwrap()
}

fn key(owner: u8) -> RecordKey {
    RecordKey::from(Value::Uint(u128::from(owner)))
}

fn amount(value: u64) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert("amount".into(), Value::Uint(u128::from(value)));
    fields
}

fn set_amount(owner: u8, value: u64, block: u64, log_index: u32) -> LogEntry {
    let mut fields = BTreeMap::new();
    fields.insert(
        "amount".to_string(),
        format!("0x{}", hex::encode(value.to_be_bytes())),
    );
    LogEntry {
        table: table_id(),
        kind: LogKind::Set,
        key: vec![format!("0x{owner:02x}")],
        fields,
        data: None,
        block_number: block,
        log_index,
    }
}

// one write: (owner, amount, blocks to advance before it)
prop_compose! {
    fn write()(owner in 0u8..4, value in any::<u64>(), gap in 0u64..3) -> (u8, u64, u64) {
        (owner, value, gap)
    }
}

// (observe head?, block step) pairs; head observations and batches interleave
prop_compose! {
    fn sync_steps()(
        steps in prop::collection::vec((any::<bool>(), 0u64..4), 1..30)
    ) -> Vec<(bool, u64)> {
        steps
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 10, .. ProptestConfig::default() })]

    #[test]
    fn delete_record__twice_matches_deleting_once(
        writes in prop::collection::vec(write(), 1..20),
        target in 0u8..4,
    ) {
        // given
        let mut once = RecordStore::new(&schema());
        let mut twice = RecordStore::new(&schema());
        for (block, (owner, value, _)) in writes.iter().enumerate() {
            let block = block as u64 + 1;
            once.set_record(&table_id(), &key(*owner), amount(*value), block).unwrap();
            twice.set_record(&table_id(), &key(*owner), amount(*value), block).unwrap();
        }
        let delete_block = writes.len() as u64 + 1;

        // when
        once.delete_record(&table_id(), &key(target), delete_block).unwrap();
        twice.delete_record(&table_id(), &key(target), delete_block).unwrap();
        let second = twice.delete_record(&table_id(), &key(target), delete_block + 1).unwrap();

        // then
        prop_assert!(second.is_none());
        let (mut once_records, once_tombstones) = once.export();
        let (mut twice_records, twice_tombstones) = twice.export();
        once_records.sort_by(|a, b| a.key.cmp(&b.key));
        twice_records.sort_by(|a, b| a.key.cmp(&b.key));
        prop_assert_eq!(once_records, twice_records);
        prop_assert_eq!(once_tombstones, twice_tombstones);
    }

    #[test]
    fn apply_batch__last_write_in_block_and_index_order_wins(
        writes in prop::collection::vec(write(), 1..40),
    ) {
        // given
        let mut batches: BTreeMap<u64, Vec<LogEntry>> = BTreeMap::new();
        let mut expected: BTreeMap<u8, u64> = BTreeMap::new();
        let mut block = 1u64;
        for (owner, value, gap) in &writes {
            block += gap;
            let logs = batches.entry(block).or_default();
            let log_index = logs.len() as u32;
            logs.push(set_amount(*owner, *value, block, log_index));
            expected.insert(*owner, *value);
        }
        let mut pipeline = IngestionPipeline::new(schema());

        // when
        for (block, mut logs) in batches {
            // delivery order inside a block must not matter
            logs.reverse();
            pipeline.apply_batch(BlockLogBatch::new(block, logs)).unwrap();
        }

        // then
        let reader = pipeline.reader();
        for (owner, value) in expected {
            let record = reader.get_record(&table_id(), &key(owner)).unwrap();
            prop_assert_eq!(record.get("amount").cloned(), Some(Value::Uint(u128::from(value))));
        }
        prop_assert_eq!(pipeline.current_block(), Some(block));
    }

    #[test]
    fn percentage__stays_within_bounds(current in any::<u64>(), latest in any::<u64>()) {
        let pct = percentage(current, latest);
        prop_assert!(pct.is_finite());
        prop_assert!((0.0..=100.0).contains(&pct));
        if latest == 0 {
            prop_assert_eq!(pct, 0.0);
        }
    }

    #[test]
    fn observe_latest_block__live_is_one_way(steps in sync_steps()) {
        // given
        let mut pipeline = IngestionPipeline::new(schema());
        let mut head = 0u64;
        let mut applied = 0u64;
        let mut was_live = false;

        for (observe, step) in steps {
            // when
            if observe {
                head += step;
                pipeline.observe_latest_block(head);
            } else {
                applied += step.max(1);
                pipeline.apply_batch(BlockLogBatch::empty(applied)).unwrap();
            }

            // then
            let progress = pipeline.progress();
            prop_assert!(progress.percentage() <= 100.0);
            if was_live {
                prop_assert!(progress.is_live());
                prop_assert!(pipeline.state().is_live());
            }
            was_live = progress.is_live();
        }
    }
}
