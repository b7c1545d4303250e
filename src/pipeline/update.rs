//! Update and lookup fix-up phases

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::{Pipeline, external_id_value, record_text};
use crate::endpoint::{ID_FIELD, Record, WriteOperation};
use crate::error::{DataMoveError, Result};
use crate::script::{FileRole, ObjectSet, Operation, PendingLookup, ScriptObject};
use crate::transfer::csv::CsvReader;
use crate::transfer::streaming::RecordSource;
use crate::transfer::write_status_file;

/// Target value of a lookup field
#[derive(Debug, Clone, PartialEq, Eq)]
enum LookupValue {
    /// The source record references nothing
    Empty,
    Resolved(String),
    /// The parent is written later in this run; holds the source parent id
    Pending(String),
    /// The parent has no counterpart in the target
    Missing,
}

/// A record ready to be written, with what is needed to process its result
#[derive(Debug, Clone)]
struct PreparedRecord {
    record: Record,
    external_id: String,
    /// (target field, source field, source parent id) of pending lookups
    unresolved: Vec<(String, String, String)>,
}

#[derive(Debug, Default)]
struct WritePlan {
    inserts: Vec<PreparedRecord>,
    updates: Vec<PreparedRecord>,
    skipped: u64,
}

/// Translate a lookup value: source parent id → parent external ID →
/// parent target id.
fn translate_lookup(set: &ObjectSet, object: &ScriptObject, field: &str, record: &Record, delimiter: &str) -> LookupValue {
    let Some(parent_id) = record_text(record, field) else {
        return LookupValue::Empty;
    };
    let Some(parent) = object.extra.lookup_objects.get(field).and_then(|p| set.object(p)) else {
        return LookupValue::Missing;
    };

    let external_id = parent
        .extra
        .source_id_to_external_id
        .get(&parent_id)
        .filter(|v| !v.is_empty())
        .cloned()
        .or_else(|| {
            let paths = object.extra.relationship_fields.get(field)?;
            external_id_value(record, &paths.join(delimiter), delimiter)
        });

    match external_id.and_then(|ext| parent.extra.target_external_id_to_id.get(&ext)) {
        Some(target_id) => LookupValue::Resolved(target_id.clone()),
        None if parent.operation.is_write() && !parent.completed => LookupValue::Pending(parent_id),
        None => LookupValue::Missing,
    }
}

/// Build target records of an object from its staged source records.
fn plan_writes(set: &ObjectSet, object: &ScriptObject, source_records: Vec<Record>, delimiter: &str) -> WritePlan {
    let extra = &object.extra;
    let mut plan = WritePlan::default();

    for source in source_records {
        if record_text(&source, ID_FIELD).is_none() {
            continue;
        }
        let external_id = external_id_value(&source, &extra.external_id, delimiter).unwrap_or_default();

        let mut record = Record::new();
        let mut unresolved = Vec::new();
        for field in &extra.query.fields {
            if field == ID_FIELD || field.contains('.') || extra.excluded_from_update.contains(field) {
                continue;
            }
            let target_field = extra.mapper.map_field(field);

            if extra.lookup_objects.contains_key(field) {
                match translate_lookup(set, object, field, &source, delimiter) {
                    LookupValue::Empty => {
                        record.insert(target_field, Value::Null);
                    }
                    LookupValue::Resolved(id) => {
                        record.insert(target_field, Value::String(id));
                    }
                    LookupValue::Pending(parent_id) => unresolved.push((target_field, field.clone(), parent_id)),
                    LookupValue::Missing => {
                        debug!("{}: {} has no target record for {}", object.name(), field, external_id);
                    }
                }
                continue;
            }

            record.insert(target_field, source.get(field).cloned().unwrap_or(Value::Null));
        }

        let matched = match object.operation {
            Operation::Insert => None,
            _ if external_id.is_empty() => None,
            _ => extra.target_external_id_to_id.get(&external_id).cloned(),
        };

        if matched.is_some() && object.skip_existing_records {
            plan.skipped += 1;
            continue;
        }

        match (object.operation, matched) {
            (Operation::Update | Operation::Upsert, Some(target_id)) => {
                record.insert(ID_FIELD.to_string(), Value::String(target_id));
                plan.updates.push(PreparedRecord {
                    record,
                    external_id,
                    unresolved,
                });
            }
            (Operation::Insert | Operation::Upsert, _) => plan.inserts.push(PreparedRecord {
                record,
                external_id,
                unresolved,
            }),
            _ => plan.skipped += 1,
        }
    }

    plan
}

impl Pipeline {
    /// Write every insert/update/upsert object, parents first.
    ///
    /// The staged source file is read batch by batch; each batch is planned
    /// and written before the next one is read.
    pub(super) async fn update_target(&self, set: &mut ObjectSet) -> Result<()> {
        let index = set.index;
        let delimiter = self.delimiter().to_string();

        for name in set.update_objects_order.clone() {
            let Some(position) = set.position(&name) else {
                continue;
            };
            let object = &set.objects[position];
            if !object.operation.is_write() || !object.is_active() {
                continue;
            }
            let context = |e: DataMoveError| e.with_context(index, &name, Some(self.target.label()));

            let status_path = set.file_for(object, FileRole::Status);
            let mut staged = CsvReader::open(&set.file_for(object, FileRole::Source), self.staged_batch_size())
                .await
                .map_err(context)?;

            let mut job_failed = false;
            let mut skipped = 0;
            while let Some(batch) = staged.next_batch().await.map_err(context)? {
                let plan = plan_writes(set, &set.objects[position], batch, &delimiter);
                debug!(
                    "{}: {} to insert, {} to update, {} skipped",
                    name,
                    plan.inserts.len(),
                    plan.updates.len(),
                    plan.skipped
                );
                skipped += plan.skipped;

                let object = &mut set.objects[position];
                for (operation, prepared) in [
                    (WriteOperation::Insert, plan.inserts),
                    (WriteOperation::Update, plan.updates),
                ] {
                    job_failed |= self
                        .write_prepared(object, operation, prepared, &status_path)
                        .await
                        .map_err(context)?;
                }
            }
            staged.close().await.map_err(context)?;

            let object = &mut set.objects[position];
            object.completed = !job_failed;
            let stats = object.extra.stats;
            info!(
                "{}: {} inserted, {} updated, {} skipped, {} failed",
                name, stats.inserted, stats.updated, skipped, stats.failed
            );
        }
        Ok(())
    }

    /// Write prepared records, record their results and remember the lookups
    /// left for the fix-up phase. Returns whether a bulk job failed.
    async fn write_prepared(
        &self,
        object: &mut ScriptObject,
        operation: WriteOperation,
        prepared: Vec<PreparedRecord>,
        status_path: &Path,
    ) -> Result<bool> {
        if prepared.is_empty() {
            return Ok(false);
        }

        let records = prepared.iter().map(|p| p.record.clone()).collect();
        let outcome = self
            .write_records(&object.extra.target_entity, operation, records)
            .await?;
        write_status_file(status_path, &outcome.results).await?;

        let extra = &mut object.extra;
        for result in &outcome.results {
            let Some(prepared) = prepared.get(result.index) else {
                continue;
            };
            if !result.is_success() {
                extra.stats.failed += 1;
                continue;
            }
            match operation {
                WriteOperation::Insert => extra.stats.inserted += 1,
                _ => extra.stats.updated += 1,
            }
            let Some(target_id) = &result.id else {
                continue;
            };
            if !prepared.external_id.is_empty() {
                extra
                    .target_external_id_to_id
                    .insert(prepared.external_id.clone(), target_id.clone());
            }
            for (target_field, source_field, parent_id) in &prepared.unresolved {
                extra.pending_lookups.push(PendingLookup {
                    target_id: target_id.clone(),
                    target_field: target_field.clone(),
                    source_field: source_field.clone(),
                    source_parent_id: parent_id.clone(),
                });
            }
        }

        if outcome.job_failed() {
            warn!(
                "{}: {} job ended {:?}: {}",
                object.name(),
                operation,
                outcome.job_state,
                outcome.job_error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(outcome.job_failed())
    }

    /// Patch lookups whose parent was written after the child.
    pub(super) async fn fix_lookups(&self, set: &mut ObjectSet) -> Result<()> {
        let index = set.index;

        for name in set.update_objects_order.clone() {
            let Some(position) = set.position(&name) else {
                continue;
            };
            let pending = std::mem::take(&mut set.objects[position].extra.pending_lookups);
            if pending.is_empty() {
                continue;
            }

            let object = &set.objects[position];
            let mut patches: BTreeMap<String, Record> = BTreeMap::new();
            let mut unresolved = 0;
            for lookup in &pending {
                let parent_target_id = object
                    .extra
                    .lookup_objects
                    .get(&lookup.source_field)
                    .and_then(|parent| set.object(parent))
                    .and_then(|parent| {
                        let ext = parent.extra.source_id_to_external_id.get(&lookup.source_parent_id)?;
                        parent.extra.target_external_id_to_id.get(ext)
                    });

                match parent_target_id {
                    Some(parent_target_id) => {
                        patches
                            .entry(lookup.target_id.clone())
                            .or_insert_with(|| {
                                Record::from_iter([(ID_FIELD.to_string(), Value::String(lookup.target_id.clone()))])
                            })
                            .insert(lookup.target_field.clone(), Value::String(parent_target_id.clone()));
                    }
                    None => unresolved += 1,
                }
            }

            if unresolved > 0 {
                warn!("{}: {} lookups could not be resolved", name, unresolved);
            }
            if patches.is_empty() {
                continue;
            }

            let context = |e: DataMoveError| e.with_context(index, &name, Some(self.target.label()));
            let status_path = set.file_for(object, FileRole::Status);
            let target_entity = object.extra.target_entity.clone();
            let records: Vec<Record> = patches.into_values().collect();
            let count = records.len();

            let outcome = self
                .write_records(&target_entity, WriteOperation::Update, records)
                .await
                .map_err(context)?;
            write_status_file(&status_path, &outcome.results).await.map_err(context)?;

            set.objects[position].extra.stats.failed += outcome.failed;
            info!("{}: patched lookups of {} records ({} failed)", name, count, outcome.failed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Script;
    use serde_json::json;
    use std::path::Path;

    fn set_with(script: &str) -> ObjectSet {
        Script::from_json_str(script, Path::new("/tmp"))
            .unwrap()
            .object_sets
            .remove(0)
    }

    fn record(pairs: &[(&str, &str)]) -> Record {
        pairs.iter().map(|(k, v)| (k.to_string(), json!(v))).collect()
    }

    fn account_contact_set() -> ObjectSet {
        let mut set = set_with(
            r#"{"objects":[
                {"query":"SELECT Id, Name FROM Account","operation":"Upsert","externalId":"Name"},
                {"query":"SELECT Id, LastName, AccountId FROM Contact","operation":"Upsert","externalId":"LastName"}
            ]}"#,
        );
        set.objects[0].extra.external_id = "Name".to_string();
        set.objects[0].extra.mapper = crate::query::FieldMapper::identity("Account");
        let contact = &mut set.objects[1].extra;
        contact.external_id = "LastName".to_string();
        contact.mapper = crate::query::FieldMapper::identity("Contact");
        contact.lookup_objects.insert("AccountId".into(), "Account".into());
        contact
            .relationship_fields
            .insert("AccountId".into(), vec!["Account.Name".to_string()]);
        contact.query.fields.push("Account.Name".to_string());
        set
    }

    #[test]
    fn test_translate_lookup_through_external_id() {
        let mut set = account_contact_set();
        set.objects[0].extra.source_id_to_external_id.insert("A1".into(), "Acme".into());
        set.objects[0].extra.target_external_id_to_id.insert("Acme".into(), "T1".into());

        let source = record(&[("Id", "C1"), ("AccountId", "A1")]);
        let value = translate_lookup(&set, &set.objects[1], "AccountId", &source, ";");
        assert_eq!(value, LookupValue::Resolved("T1".to_string()));

        // Falls back to the relationship column when the parent was not fetched
        let source = record(&[("Id", "C2"), ("AccountId", "A9"), ("Account.Name", "Acme")]);
        let value = translate_lookup(&set, &set.objects[1], "AccountId", &source, ";");
        assert_eq!(value, LookupValue::Resolved("T1".to_string()));

        let source = record(&[("Id", "C3"), ("AccountId", "A7")]);
        let value = translate_lookup(&set, &set.objects[1], "AccountId", &source, ";");
        assert_eq!(value, LookupValue::Pending("A7".to_string()));

        set.objects[0].completed = true;
        let value = translate_lookup(&set, &set.objects[1], "AccountId", &source, ";");
        assert_eq!(value, LookupValue::Missing);

        let source = record(&[("Id", "C4")]);
        let value = translate_lookup(&set, &set.objects[1], "AccountId", &source, ";");
        assert_eq!(value, LookupValue::Empty);
    }

    #[test]
    fn test_plan_writes_splits_insert_and_update() {
        let mut set = account_contact_set();
        set.objects[0].extra.target_external_id_to_id.insert("Acme".into(), "T1".into());

        let records = vec![
            record(&[("Id", "A1"), ("Name", "Acme")]),
            record(&[("Id", "A2"), ("Name", "Globex")]),
        ];
        let plan = plan_writes(&set, &set.objects[0], records.clone(), ";");
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].record["Id"], json!("T1"));
        assert_eq!(plan.inserts.len(), 1);
        assert!(plan.inserts[0].record.get("Id").is_none());

        set.objects[0].skip_existing_records = true;
        let plan = plan_writes(&set, &set.objects[0], records.clone(), ";");
        assert_eq!((plan.inserts.len(), plan.updates.len(), plan.skipped), (1, 0, 1));

        set.objects[0].skip_existing_records = false;
        set.objects[0].operation = Operation::Update;
        let plan = plan_writes(&set, &set.objects[0], records, ";");
        assert_eq!((plan.inserts.len(), plan.updates.len(), plan.skipped), (0, 1, 1));
    }
}
