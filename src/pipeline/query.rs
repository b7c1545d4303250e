//! Count, delete and query phases

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use tracing::{debug, info, warn};

use super::{Pipeline, external_id_parts, external_id_value, record_text, transport_of};
use crate::endpoint::{ID_FIELD, QueryTransport, Record, WriteOperation};
use crate::engine::suggest_query_engine;
use crate::error::{DataMoveError, Result};
use crate::query::{BoolOperator, ClauseBuilder, ClauseValue, ParsedQuery, equality_clause};
use crate::script::{ExtraData, FileRole, ObjectSet, Operation, ScriptObject};
use crate::transfer::csv::{CsvReader, CsvWriter};
use crate::transfer::streaming::{RecordSink, RecordSource};
use crate::transfer::write_status_file;

/// Filter key → values of one child query round
type ChildFilters = Vec<(String, Vec<String>)>;

/// Target query over the mapped field list
fn target_query(extra: &ExtraData, filter: &str) -> String {
    ParsedQuery {
        fields: extra.target_fields.clone(),
        entity_name: extra.target_entity.clone(),
        filter: filter.to_string(),
        ..Default::default()
    }
    .compose()
}

impl Pipeline {
    /// Start every staged source and target file over with its header row,
    /// and drop status files of earlier runs.
    pub(super) async fn reset_working_files(&self, set: &ObjectSet) -> Result<()> {
        for object in &set.objects {
            for (role, headers) in [
                (FileRole::Source, &object.extra.query.fields),
                (FileRole::Target, &object.extra.target_fields),
            ] {
                let mut writer = CsvWriter::create(&set.file_for(object, role), headers.clone()).await?;
                writer.finalize().await?;
            }

            match tokio::fs::remove_file(set.file_for(object, FileRole::Status)).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }

    pub(super) async fn count_records(&self, set: &mut ObjectSet) -> Result<()> {
        let index = set.index;
        for object in set.objects.iter_mut().filter(|o| o.is_active()) {
            let name = object.name().to_string();
            let extra = &mut object.extra;

            if object.operation != Operation::Delete {
                let query = extra.query.count_query(None);
                let count = self
                    .source
                    .count(&query)
                    .await
                    .map_err(|e| e.with_context(index, &name, Some(self.source.label())))?;
                extra.source_total = extra.query.limit.map_or(count, |limit| count.min(limit));
            }

            let query = extra.query.count_query(Some(&extra.mapper));
            extra.target_total = self
                .target
                .count(&query)
                .await
                .map_err(|e| e.with_context(index, &name, Some(self.target.label())))?;

            if let Some(delete_query) = &extra.delete_query {
                let query = delete_query.count_query(Some(&extra.mapper));
                extra.target_to_delete = self
                    .target
                    .count(&query)
                    .await
                    .map_err(|e| e.with_context(index, &name, Some(self.target.label())))?;
                extra.target_total = extra.target_total.saturating_sub(extra.target_to_delete);
            }

            info!(
                "{}: {} source records, {} target records, {} to delete",
                name, extra.source_total, extra.target_total, extra.target_to_delete
            );
        }
        Ok(())
    }

    /// Delete target records of `Delete` objects and of objects replacing
    /// their old data, children first.
    pub(super) async fn delete_records(&self, set: &mut ObjectSet) -> Result<()> {
        let index = set.index;
        for name in set.delete_objects_order.clone() {
            let Some(position) = set.position(&name) else {
                continue;
            };
            let object = &set.objects[position];
            if !object.is_active() || !object.deletes_target_records() {
                continue;
            }
            let Some(delete_query) = object.extra.delete_query.clone() else {
                continue;
            };
            let export_path = set.file_for(object, FileRole::Export);
            let status_path = set.file_for(object, FileRole::Status);
            let context = |e: DataMoveError| e.with_context(index, &name, Some(self.target.label()));

            let object = &mut set.objects[position];
            let to_delete = object.extra.target_to_delete;
            if to_delete == 0 {
                info!("{}: nothing to delete", name);
                if object.operation == Operation::Delete {
                    object.completed = true;
                }
                continue;
            }

            let choice = suggest_query_engine(to_delete, to_delete, 1, &self.context.config.engine);
            let query = delete_query.compose_with(Some(&object.extra.mapper), Some(&[ID_FIELD.to_string()]), false);
            self.transfer
                .query_to_csv(
                    self.target.as_ref(),
                    &query,
                    transport_of(&choice),
                    &format!("{name} (delete)"),
                    &export_path,
                    vec![ID_FIELD.to_string()],
                    false,
                    Some,
                )
                .await
                .map_err(context)?;

            let operation = if object.hard_delete {
                WriteOperation::HardDelete
            } else {
                WriteOperation::Delete
            };

            let mut exported = CsvReader::open(&export_path, self.staged_batch_size())
                .await
                .map_err(context)?;
            let mut job_failed = false;
            while let Some(batch) = exported.next_batch().await.map_err(context)? {
                let records: Vec<Record> = batch
                    .iter()
                    .filter_map(|record| record_text(record, ID_FIELD))
                    .map(|id| Record::from_iter([(ID_FIELD.to_string(), id.into())]))
                    .collect();

                let outcome = self
                    .write_records(&object.extra.target_entity, operation, records)
                    .await
                    .map_err(context)?;
                write_status_file(&status_path, &outcome.results).await.map_err(context)?;

                object.extra.stats.deleted += outcome.processed;
                object.extra.stats.failed += outcome.failed;
                if outcome.job_failed() {
                    job_failed = true;
                    warn!(
                        "{}: delete job ended {:?}: {}",
                        name,
                        outcome.job_state,
                        outcome.job_error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            exported.close().await.map_err(context)?;

            let stats = object.extra.stats;
            info!("{}: deleted {} records ({} failed)", name, stats.deleted, stats.failed);

            if !job_failed && object.operation == Operation::Delete {
                object.completed = true;
            }
        }
        Ok(())
    }

    /// Stream a source query into the object's source file, recording the
    /// external ID of every new record and the parent ids it references.
    async fn stream_source(
        &self,
        set_index: usize,
        object: &mut ScriptObject,
        query: &str,
        transport: QueryTransport,
        path: &Path,
    ) -> Result<u64> {
        let name = object.name().to_string();
        let delimiter = self.delimiter();
        let headers = object.extra.query.fields.clone();
        let external_id = object.extra.external_id.clone();
        let lookups: Vec<String> = object.extra.lookup_objects.keys().cloned().collect();

        let extra = &mut object.extra;
        let seen = &mut extra.source_id_to_external_id;
        let referenced = &mut extra.referenced_source_ids;

        let result = self
            .transfer
            .query_to_csv(
                self.source.as_ref(),
                query,
                transport,
                &format!("{name} (source)"),
                path,
                headers,
                true,
                |record| {
                    let id = record_text(&record, ID_FIELD)?;
                    if seen.contains_key(&id) {
                        return None;
                    }
                    for field in &lookups {
                        if let Some(parent_id) = record_text(&record, field) {
                            referenced.entry(field.clone()).or_default().insert(parent_id);
                        }
                    }
                    let value = external_id_value(&record, &external_id, delimiter).unwrap_or_default();
                    seen.insert(id, value);
                    Some(record)
                },
            )
            .await
            .map_err(|e| e.with_context(set_index, &name, Some(self.source.label())))?;

        extra.stats.source_queried += result.records_written;
        Ok(result.records_written)
    }

    /// Stream a target query into the object's target file, recording the
    /// target id of every external ID not matched yet.
    async fn stream_target(
        &self,
        set_index: usize,
        object: &mut ScriptObject,
        query: &str,
        transport: QueryTransport,
        path: &Path,
    ) -> Result<u64> {
        let name = object.name().to_string();
        let delimiter = self.delimiter();
        let headers = object.extra.target_fields.clone();
        let external_id = object.extra.target_external_id.clone();

        let extra = &mut object.extra;
        let matched = &mut extra.target_external_id_to_id;

        let result = self
            .transfer
            .query_to_csv(
                self.target.as_ref(),
                query,
                transport,
                &format!("{name} (target)"),
                path,
                headers,
                true,
                |record| {
                    let id = record_text(&record, ID_FIELD)?;
                    if let Some(value) = external_id_value(&record, &external_id, delimiter) {
                        if matched.contains_key(&value) {
                            return None;
                        }
                        matched.insert(value, id);
                    }
                    Some(record)
                },
            )
            .await
            .map_err(|e| e.with_context(set_index, &name, Some(self.target.label())))?;

        extra.stats.target_queried += result.records_written;
        Ok(result.records_written)
    }

    /// Query master objects from source, then from target, in write order.
    pub(super) async fn query_master_objects(&self, set: &mut ObjectSet) -> Result<()> {
        let index = set.index;
        let engine = &self.context.config.engine;

        for name in set.update_objects_order.clone() {
            let Some(position) = set.position(&name) else {
                continue;
            };
            let object = &set.objects[position];
            if !object.master || !object.is_active() || object.operation == Operation::Delete {
                continue;
            }
            let source_path = set.file_for(object, FileRole::Source);
            let target_path = set.file_for(object, FileRole::Target);
            let object = &mut set.objects[position];

            let total = object.extra.source_total;
            let choice = suggest_query_engine(total, total, 1, engine);
            if !choice.skip {
                let query = object.extra.query.compose();
                self.stream_source(index, object, &query, transport_of(&choice), &source_path)
                    .await?;
            }
            object.extra.source_fully_queried =
                object.extra.query.filter.is_empty() && object.extra.query.limit.is_none();

            if object.operation == Operation::Insert {
                continue;
            }
            let total = object.extra.target_total;
            let choice = suggest_query_engine(total, total, 1, engine);
            if !choice.skip {
                let query = target_query(&object.extra, &object.extra.target_filter);
                self.stream_target(index, object, &query, transport_of(&choice), &target_path)
                    .await?;
            }
        }
        Ok(())
    }

    /// Filters selecting the records of a child object that are related to
    /// records already fetched: (a) children of fetched parents, by lookup
    /// field, and (b) parents referenced by fetched children, by `Id`.
    fn child_filters(set: &ObjectSet, position: usize) -> ChildFilters {
        let object = &set.objects[position];
        let extra = &object.extra;
        let mut filters = Vec::new();

        for (field, parent) in &extra.lookup_objects {
            let Some(parent) = set.object(parent) else {
                continue;
            };
            let used = extra.queried_values.get(field);
            let mut values: Vec<String> = parent
                .extra
                .source_id_to_external_id
                .keys()
                .filter(|id| !used.is_some_and(|u| u.contains(*id)))
                .cloned()
                .collect();
            values.sort();
            if !values.is_empty() {
                filters.push((field.clone(), values));
            }
        }

        let used = extra.queried_values.get(ID_FIELD);
        let mut ids = BTreeSet::new();
        for other in &set.objects {
            for (field, parent) in &other.extra.lookup_objects {
                if parent != object.name() {
                    continue;
                }
                let Some(referenced) = other.extra.referenced_source_ids.get(field) else {
                    continue;
                };
                ids.extend(
                    referenced
                        .iter()
                        .filter(|id| !extra.source_id_to_external_id.contains_key(*id))
                        .filter(|id| !used.is_some_and(|u| u.contains(*id)))
                        .cloned(),
                );
            }
        }
        if !ids.is_empty() {
            filters.push((ID_FIELD.to_string(), ids.into_iter().collect()));
        }

        filters
    }

    async fn query_child_source(
        &self,
        set_index: usize,
        object: &mut ScriptObject,
        filters: ChildFilters,
        path: &Path,
    ) -> Result<u64> {
        let builder = ClauseBuilder::new(self.clause_limits())
            .with_query_base_length(object.extra.query.select_from_length(None));

        let mut queries = Vec::new();
        let mut subset = 0u64;
        for (field, values) in &filters {
            subset += values.len() as u64;
            let literals: Vec<ClauseValue> = values.iter().map(|v| ClauseValue::from(v.as_str())).collect();
            for clause in builder.build_in_clause(field, &literals, &object.extra.query.filter) {
                queries.push(object.extra.query.with_filter(clause).compose());
            }
        }

        for (field, values) in filters {
            object.extra.queried_values.entry(field).or_default().extend(values);
        }

        let choice = suggest_query_engine(
            object.extra.source_total,
            subset,
            queries.len() as u64,
            &self.context.config.engine,
        );
        if choice.skip {
            return Ok(0);
        }
        if choice.query_all {
            debug!("{}: fetching the whole entity instead of {} queries", object.name(), queries.len());
            queries = vec![object.extra.query.compose()];
            object.extra.source_fully_queried = true;
        }

        let transport = transport_of(&choice);
        let mut fetched = 0;
        for query in queries {
            fetched += self.stream_source(set_index, object, &query, transport, path).await?;
        }
        Ok(fetched)
    }

    /// Query non-master objects from source in rounds until a round fetches
    /// nothing new or the configured number of rounds is spent.
    pub(super) async fn query_child_objects(&self, set: &mut ObjectSet) -> Result<()> {
        let rounds = self.context.config.query.child_query_rounds.max(1);

        for round in 1..=rounds {
            let mut fetched = 0;
            for name in set.update_objects_order.clone() {
                let Some(position) = set.position(&name) else {
                    continue;
                };
                let object = &set.objects[position];
                if object.master
                    || !object.is_active()
                    || object.operation == Operation::Delete
                    || object.extra.source_fully_queried
                {
                    continue;
                }

                let filters = Self::child_filters(set, position);
                if filters.is_empty() {
                    continue;
                }
                let path = set.file_for(&set.objects[position], FileRole::Source);
                let count = self
                    .query_child_source(set.index, &mut set.objects[position], filters, &path)
                    .await?;
                debug!("Round {}: {} new {} records", round, count, name);
                fetched += count;
            }

            info!("Object set {}: child round {} fetched {} records", set.index, round, fetched);
            if fetched == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Match non-master objects against the target by the external IDs seen
    /// on the source side.
    pub(super) async fn query_target_child_objects(&self, set: &mut ObjectSet) -> Result<()> {
        let index = set.index;
        let delimiter = self.delimiter().to_string();

        for name in set.update_objects_order.clone() {
            let Some(position) = set.position(&name) else {
                continue;
            };
            let object = &set.objects[position];
            if object.master
                || !object.is_active()
                || matches!(object.operation, Operation::Delete | Operation::Insert)
                || object.extra.target_total == 0
            {
                continue;
            }
            let path = set.file_for(object, FileRole::Target);
            let object = &mut set.objects[position];
            let extra = &object.extra;

            let mut values: Vec<String> = extra
                .source_id_to_external_id
                .values()
                .filter(|v| !v.is_empty() && !extra.target_external_id_to_id.contains_key(*v))
                .cloned()
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            values.sort();
            if values.is_empty() {
                continue;
            }

            let base_length = target_query(extra, "").len();
            let builder = ClauseBuilder::new(self.clause_limits()).with_query_base_length(base_length);
            let parts = external_id_parts(&extra.target_external_id, &delimiter);

            let clauses = if parts.len() == 1 {
                let literals: Vec<ClauseValue> = values.iter().map(|v| ClauseValue::from(v.as_str())).collect();
                builder.build_in_clause(&parts[0], &literals, &extra.target_filter)
            } else {
                let matches: Vec<String> = values
                    .iter()
                    .filter_map(|value| {
                        let pieces: Vec<&str> = value.split(delimiter.as_str()).collect();
                        (pieces.len() == parts.len()).then(|| {
                            let pairs: Vec<(String, ClauseValue)> = parts
                                .iter()
                                .zip(pieces)
                                .map(|(part, piece)| (part.clone(), ClauseValue::from(piece)))
                                .collect();
                            equality_clause(&pairs)
                        })
                    })
                    .collect();
                builder.build_or_and_clause(BoolOperator::Or, &matches, &extra.target_filter)
            };

            let choice = suggest_query_engine(
                extra.target_total,
                values.len() as u64,
                clauses.len() as u64,
                &self.context.config.engine,
            );
            if choice.skip {
                continue;
            }
            let queries: Vec<String> = if choice.query_all {
                vec![target_query(extra, &extra.target_filter)]
            } else {
                clauses.iter().map(|clause| target_query(extra, clause)).collect()
            };

            let transport = transport_of(&choice);
            for query in queries {
                self.stream_target(index, object, &query, transport, &path).await?;
            }
            info!(
                "{}: {} of {} external IDs matched on target",
                name,
                object.extra.target_external_id_to_id.len(),
                values.len()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_query() {
        let extra = ExtraData {
            target_fields: vec!["Id".to_string(), "Title__c".to_string()],
            target_entity: "Customer__c".to_string(),
            ..Default::default()
        };
        assert_eq!(target_query(&extra, ""), "SELECT Id, Title__c FROM Customer__c");
        assert_eq!(
            target_query(&extra, "Title__c IN ('a')"),
            "SELECT Id, Title__c FROM Customer__c WHERE Title__c IN ('a')"
        );
    }
}
