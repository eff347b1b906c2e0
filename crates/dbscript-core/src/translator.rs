//! Rows notification to change event translation.
//!
//! Translation is pure: a rows notification plus the schema snapshot it was
//! delivered with always yields the same, order-preserving batch. Rows are
//! mapped to columns strictly by position; a row narrower than the schema only
//! contributes the columns it actually carries.

use crate::{
    ChangeBatch, ChangeEvent, ChangeType, DbscriptError, EventHeader, Result, RowAction,
    RowImage, RowsEvent, TableSchemaSnapshot,
};
use serde_json::Value;

/// Converts raw row tuples into [`ChangeEvent`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct EventTranslator {
    strict_primary_key: bool,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject rows that are too short to carry every primary key column
    /// instead of leaving the missing key values out.
    pub fn with_strict_primary_key(mut self, strict: bool) -> Self {
        self.strict_primary_key = strict;
        self
    }

    pub fn is_strict_primary_key(&self) -> bool {
        self.strict_primary_key
    }

    /// Dispatch on the rows action of a notification.
    pub fn translate(&self, event: &RowsEvent) -> Result<ChangeBatch> {
        match &event.action {
            RowAction::Insert => self.translate_insert(&event.table, &event.rows, &event.header),
            RowAction::Update => self.translate_update(&event.table, &event.rows, &event.header),
            RowAction::Delete => self.translate_delete(&event.table, &event.rows, &event.header),
            RowAction::Other(action) => Err(DbscriptError::UnsupportedOperation(action.clone())),
        }
    }

    pub fn translate_insert(
        &self,
        table: &TableSchemaSnapshot,
        rows: &[Vec<Value>],
        header: &EventHeader,
    ) -> Result<ChangeBatch> {
        let pk_columns = table.primary_key_names();

        rows.iter()
            .map(|row| {
                Ok(build_event(
                    table,
                    header,
                    ChangeType::Insert,
                    self.primary_key(table, row)?,
                    pk_columns.clone(),
                    None,
                    Some(row_image(table, row)),
                ))
            })
            .collect()
    }

    pub fn translate_delete(
        &self,
        table: &TableSchemaSnapshot,
        rows: &[Vec<Value>],
        header: &EventHeader,
    ) -> Result<ChangeBatch> {
        let pk_columns = table.primary_key_names();

        rows.iter()
            .map(|row| {
                Ok(build_event(
                    table,
                    header,
                    ChangeType::Delete,
                    self.primary_key(table, row)?,
                    pk_columns.clone(),
                    Some(row_image(table, row)),
                    None,
                ))
            })
            .collect()
    }

    /// Rows alternate before/after; the key is always read from the before row.
    pub fn translate_update(
        &self,
        table: &TableSchemaSnapshot,
        rows: &[Vec<Value>],
        header: &EventHeader,
    ) -> Result<ChangeBatch> {
        if rows.len() % 2 != 0 {
            return Err(DbscriptError::MissingPairedRow {
                database: table.schema.clone(),
                table: table.name.clone(),
                rows: rows.len(),
            });
        }

        let pk_columns = table.primary_key_names();

        rows.chunks_exact(2)
            .map(|pair| {
                let (before, after) = (&pair[0], &pair[1]);
                Ok(build_event(
                    table,
                    header,
                    ChangeType::Update,
                    self.primary_key(table, before)?,
                    pk_columns.clone(),
                    Some(row_image(table, before)),
                    Some(row_image(table, after)),
                ))
            })
            .collect()
    }

    fn primary_key(&self, table: &TableSchemaSnapshot, row: &[Value]) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(table.pk_columns.len());

        for &idx in &table.pk_columns {
            if idx >= table.columns.len() {
                continue;
            }
            match row.get(idx) {
                Some(value) => values.push(value.clone()),
                None if self.strict_primary_key => {
                    return Err(DbscriptError::RowShorterThanPrimaryKey {
                        table: format!("{}.{}", table.schema, table.name),
                        index: idx,
                        row_len: row.len(),
                    })
                }
                None => {}
            }
        }

        Ok(values)
    }
}

fn row_image(table: &TableSchemaSnapshot, row: &[Value]) -> RowImage {
    table
        .columns
        .iter()
        .zip(row)
        .map(|(column, value)| (column.name.clone(), value.clone()))
        .collect()
}

fn build_event(
    table: &TableSchemaSnapshot,
    header: &EventHeader,
    change_type: ChangeType,
    primary_key: Vec<Value>,
    primary_key_columns: Vec<String>,
    before: Option<RowImage>,
    after: Option<RowImage>,
) -> ChangeEvent {
    ChangeEvent {
        database: table.schema.clone(),
        table: table.name.clone(),
        change_type,
        timestamp: header.timestamp,
        position: header.log_pos,
        server_id: header.server_id,
        primary_key,
        primary_key_columns,
        before,
        after,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ColumnType;
    use serde_json::json;
    use std::sync::Arc;

    fn test_table() -> TableSchemaSnapshot {
        TableSchemaSnapshot::new("test_db", "test_table")
            .with_column("id", ColumnType::Number)
            .with_column("name", ColumnType::String)
            .with_column("email", ColumnType::String)
            .with_column("age", ColumnType::Number)
            .with_primary_key(0)
    }

    fn test_header() -> EventHeader {
        EventHeader::new(1234567890, 1, 1000)
    }

    fn john() -> Vec<Value> {
        vec![json!(1), json!("John Doe"), json!("john@example.com"), json!(30)]
    }

    fn john_image() -> RowImage {
        RowImage::from([
            ("id".to_string(), json!(1)),
            ("name".to_string(), json!("John Doe")),
            ("email".to_string(), json!("john@example.com")),
            ("age".to_string(), json!(30)),
        ])
    }

    #[test]
    fn test_single_insert() {
        let events = EventTranslator::new()
            .translate_insert(&test_table(), &[john()], &test_header())
            .unwrap();

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.database, "test_db");
        assert_eq!(event.table, "test_table");
        assert_eq!(event.change_type, ChangeType::Insert);
        assert_eq!(event.timestamp, 1234567890);
        assert_eq!(event.server_id, 1);
        assert_eq!(event.position, 1000);
        assert_eq!(event.primary_key, vec![json!(1)]);
        assert_eq!(event.primary_key_columns, vec!["id"]);
        assert!(event.before.is_none());
        assert_eq!(event.after, Some(john_image()));
    }

    #[test]
    fn test_multiple_inserts_keep_row_order() {
        let jane = vec![json!(2), json!("Jane Smith"), json!("jane@example.com"), json!(25)];
        let events = EventTranslator::new()
            .translate_insert(&test_table(), &[john(), jane], &test_header())
            .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].primary_key, vec![json!(1)]);
        assert_eq!(events[1].primary_key, vec![json!(2)]);
        assert_eq!(
            events[1].after.as_ref().unwrap().get("name"),
            Some(&json!("Jane Smith"))
        );
    }

    #[test]
    fn test_delete_mirrors_insert() {
        let events = EventTranslator::new()
            .translate_delete(&test_table(), &[john()], &test_header())
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change_type, ChangeType::Delete);
        assert_eq!(events[0].before, Some(john_image()));
        assert!(events[0].after.is_none());
        assert_eq!(events[0].primary_key, vec![json!(1)]);
    }

    #[test]
    fn test_empty_rows_yield_nothing() {
        let translator = EventTranslator::new();
        assert!(translator
            .translate_insert(&test_table(), &[], &test_header())
            .unwrap()
            .is_empty());
        assert!(translator
            .translate_delete(&test_table(), &[], &test_header())
            .unwrap()
            .is_empty());
        assert!(translator
            .translate_update(&test_table(), &[], &test_header())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_update_pair() {
        let after = vec![
            json!(1),
            json!("John Doe"),
            json!("john@newexample.com"),
            json!(31),
        ];
        let events = EventTranslator::new()
            .translate_update(&test_table(), &[john(), after], &test_header())
            .unwrap();

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.change_type, ChangeType::Update);
        assert_eq!(event.before, Some(john_image()));
        let after = event.after.as_ref().unwrap();
        assert_eq!(after.get("email"), Some(&json!("john@newexample.com")));
        assert_eq!(after.get("age"), Some(&json!(31)));
        assert_eq!(event.primary_key, vec![json!(1)]);
    }

    #[test]
    fn test_update_key_comes_from_before_row() {
        let after = vec![json!(99), json!("John Doe")];
        let events = EventTranslator::new()
            .translate_update(&test_table(), &[john(), after], &test_header())
            .unwrap();

        assert_eq!(events[0].primary_key, vec![json!(1)]);
        assert_eq!(events[0].after.as_ref().unwrap().len(), 2);
        assert_eq!(events[0].before.as_ref().unwrap().len(), 4);
    }

    #[test]
    fn test_update_even_rows_produce_half_as_many_events() {
        let rows: Vec<Vec<Value>> = (0..6)
            .map(|i| vec![json!(i), json!(format!("user-{i}"))])
            .collect();
        let events = EventTranslator::new()
            .translate_update(&test_table(), &rows, &test_header())
            .unwrap();

        assert_eq!(events.len(), 3);
        for event in &events {
            assert!(event.before.is_some());
            assert!(event.after.is_some());
        }
        assert_eq!(events[2].primary_key, vec![json!(4)]);
    }

    #[test]
    fn test_update_odd_rows_rejected() {
        let result =
            EventTranslator::new().translate_update(&test_table(), &[john()], &test_header());

        match result {
            Err(DbscriptError::MissingPairedRow { table, rows, .. }) => {
                assert_eq!(table, "test_table");
                assert_eq!(rows, 1);
            }
            other => panic!("expected MissingPairedRow, got {:?}", other),
        }
    }

    #[test]
    fn test_short_row_omits_missing_columns() {
        let events = EventTranslator::new()
            .translate_insert(&test_table(), &[vec![json!(5), json!("Short")]], &test_header())
            .unwrap();

        let after = events[0].after.as_ref().unwrap();
        assert_eq!(after.len(), 2);
        assert!(!after.contains_key("email"));
        assert!(!after.contains_key("age"));
    }

    #[test]
    fn test_null_values_are_kept() {
        let row = vec![json!(7), Value::Null, json!("x@example.com"), json!(40)];
        let events = EventTranslator::new()
            .translate_insert(&test_table(), &[row], &test_header())
            .unwrap();

        assert_eq!(events[0].after.as_ref().unwrap().get("name"), Some(&Value::Null));
    }

    #[test]
    fn test_primary_key_beyond_row_is_omitted() {
        let table = TableSchemaSnapshot::new("test_db", "composite")
            .with_column("tenant", ColumnType::Number)
            .with_column("label", ColumnType::String)
            .with_column("id", ColumnType::Number)
            .with_primary_key(0)
            .with_primary_key(2);

        let events = EventTranslator::new()
            .translate_insert(&table, &[vec![json!(3), json!("a")]], &test_header())
            .unwrap();

        assert_eq!(events[0].primary_key, vec![json!(3)]);
        assert_eq!(events[0].primary_key_columns, vec!["tenant", "id"]);
    }

    #[test]
    fn test_strict_primary_key_rejects_short_row() {
        let translator = EventTranslator::new().with_strict_primary_key(true);
        let result = translator.translate_delete(&test_table(), &[vec![]], &test_header());

        match result {
            Err(DbscriptError::RowShorterThanPrimaryKey { index, row_len, .. }) => {
                assert_eq!(index, 0);
                assert_eq!(row_len, 0);
            }
            other => panic!("expected RowShorterThanPrimaryKey, got {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_action() {
        let event = RowsEvent::new(Arc::new(test_table()), "truncate", vec![john()], test_header());
        let result = EventTranslator::new().translate(&event);

        assert!(matches!(result, Err(DbscriptError::UnsupportedOperation(a)) if a == "truncate"));
    }

    #[test]
    fn test_translate_is_deterministic() {
        let event = RowsEvent::new(
            Arc::new(test_table()),
            RowAction::Insert,
            vec![john(), vec![json!(2)]],
            test_header(),
        );
        let translator = EventTranslator::new();

        assert_eq!(
            translator.translate(&event).unwrap(),
            translator.translate(&event).unwrap()
        );
    }
}
