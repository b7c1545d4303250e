//! Prepare, reference resolution and finalize phases

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use tracing::{debug, info, warn};

use super::{Pipeline, Side, external_id_parts};
use crate::endpoint::{EndpointKind, EntityDescribe, FieldDescribe, ID_FIELD};
use crate::error::{ConfigError, DataMoveError, Result, SchemaError};
use crate::query::{FieldMapper, ParsedQuery, lookup_field_of_path, to_relationship_field};
use crate::script::{ObjectSet, Operation, ScriptObject};

/// Properties selectable with `<property>_<true|false>` keywords
const MULTISELECT_PROPERTIES: [&str; 8] = [
    "createable",
    "updateable",
    "custom",
    "lookup",
    "unique",
    "nillable",
    "autonumber",
    "namefield",
];

const ALL_KEYWORD: &str = "all";

fn field_property(field: &FieldDescribe, property: &str) -> Option<bool> {
    Some(match property {
        "createable" => field.createable,
        "updateable" => field.updateable,
        "custom" => field.custom,
        "lookup" => field.is_lookup(),
        "unique" => field.unique,
        "nillable" => field.nillable,
        "autonumber" => field.auto_number,
        "namefield" => field.name_field,
        _ => return None,
    })
}

/// Expand multiselect keywords of a field list against a schema.
fn expand_multiselect(fields: &[String], describe: &EntityDescribe) -> Vec<String> {
    let mut expanded = Vec::new();
    for field in fields {
        if describe.has_field(field) {
            expanded.push(field.clone());
            continue;
        }

        let keyword = field.to_lowercase();
        if keyword == ALL_KEYWORD {
            expanded.extend(describe.fields.iter().map(|f| f.name.clone()));
            continue;
        }

        let selector = keyword.rsplit_once('_').and_then(|(property, flag)| {
            let flag = flag.parse::<bool>().ok()?;
            MULTISELECT_PROPERTIES.contains(&property).then_some((property.to_string(), flag))
        });
        match selector {
            Some((property, flag)) => expanded.extend(
                describe
                    .fields
                    .iter()
                    .filter(|f| field_property(f, &property) == Some(flag))
                    .map(|f| f.name.clone()),
            ),
            None => expanded.push(field.clone()),
        }
    }
    expanded
}

fn dedupe(fields: &mut Vec<String>) {
    let mut seen = HashSet::new();
    fields.retain(|f| seen.insert(f.clone()));
}

/// Copy of a schema under another entity name with renamed fields
fn rename_describe(describe: &EntityDescribe, entity: &str, rename: impl Fn(&str) -> String) -> EntityDescribe {
    EntityDescribe {
        name: entity.to_string(),
        fields: describe
            .fields
            .iter()
            .map(|f| FieldDescribe {
                name: rename(&f.name),
                ..f.clone()
            })
            .collect(),
    }
}

/// Parse delete queries and reject inconsistent delete settings.
///
/// Runs before any endpoint is contacted.
pub(super) fn validate_object_set(set: &mut ObjectSet) -> Result<()> {
    let index = set.index;
    for object in &mut set.objects {
        let name = object.name().to_string();
        let context = |e: DataMoveError| e.with_context(index, name.clone(), None);

        object.extra.delete_query = if !object.delete_query.is_empty() {
            let parsed = ParsedQuery::parse(&object.delete_query);
            if parsed.is_empty() {
                return Err(context(
                    ConfigError::InvalidFormat(format!("cannot parse delete query `{}`", object.delete_query)).into(),
                ));
            }
            if !parsed.entity_name.eq_ignore_ascii_case(&name) {
                return Err(context(
                    ConfigError::DeleteQueryMismatch {
                        expected: name.clone(),
                        found: parsed.entity_name,
                    }
                    .into(),
                ));
            }
            Some(ParsedQuery {
                fields: vec![ID_FIELD.to_string()],
                entity_name: name.clone(),
                ..parsed
            })
        } else if object.delete_old_data && object.operation == Operation::Update {
            return Err(context(ConfigError::DeleteQueryRequired(name.clone()).into()));
        } else if object.operation == Operation::Delete {
            // The main query selects the records to delete
            Some(ParsedQuery {
                fields: vec![ID_FIELD.to_string()],
                order_by: String::new(),
                polymorphic_fields: BTreeMap::new(),
                ..object.extra.query.clone()
            })
        } else if object.delete_old_data {
            Some(ParsedQuery {
                fields: vec![ID_FIELD.to_string()],
                entity_name: name.clone(),
                ..Default::default()
            })
        } else {
            None
        };
    }
    Ok(())
}

impl Pipeline {
    async fn describe_cached(&mut self, side: Side, entity: &str) -> Result<EntityDescribe> {
        let endpoint = self.endpoint(side).clone();
        let key = (endpoint.label().to_string(), entity.to_string());
        if let Some(describe) = self.describe_cache.get(&key) {
            return Ok(describe.clone());
        }

        debug!("Describing {} on {}", entity, endpoint.label());
        let describe = endpoint.describe(entity).await?;
        self.describe_cache.insert(key, describe.clone());
        Ok(describe)
    }

    /// Schemas of an object on both sides. A flat-file side without a schema
    /// of its own adopts the database side's schema.
    async fn describe_pair(&mut self, set_index: usize, object: &ScriptObject) -> Result<(EntityDescribe, EntityDescribe)> {
        let source_entity = object.name().to_string();
        let target_entity = object.mapped_target_entity().unwrap_or(&source_entity).to_string();
        let mapped = object.mapped_fields();
        let source_label = self.source.label().to_string();
        let target_label = self.target.label().to_string();

        let with_source_context = |e: DataMoveError| e.with_context(set_index, source_entity.clone(), Some(&source_label));
        let with_target_context = |e: DataMoveError| e.with_context(set_index, source_entity.clone(), Some(&target_label));

        match (self.source.kind(), self.target.kind()) {
            (EndpointKind::File, EndpointKind::Database) => {
                let target = self
                    .describe_cached(Side::Target, &target_entity)
                    .await
                    .map_err(with_target_context)?;
                let reverse: HashMap<&str, &str> = mapped.iter().map(|(s, t)| (t.as_str(), s.as_str())).collect();
                let source = rename_describe(&target, &source_entity, |name| {
                    reverse.get(name).map(|s| s.to_string()).unwrap_or_else(|| name.to_string())
                });
                self.source.register_schema(&source).await.map_err(with_source_context)?;
                Ok((source, target))
            }
            (EndpointKind::Database, EndpointKind::File) => {
                let source = self
                    .describe_cached(Side::Source, &source_entity)
                    .await
                    .map_err(with_source_context)?;
                let forward: HashMap<&str, &str> = mapped.iter().map(|(s, t)| (s.as_str(), t.as_str())).collect();
                let target = rename_describe(&source, &target_entity, |name| {
                    forward.get(name).map(|t| t.to_string()).unwrap_or_else(|| name.to_string())
                });
                self.target.register_schema(&target).await.map_err(with_target_context)?;
                Ok((source, target))
            }
            _ => {
                let source = self
                    .describe_cached(Side::Source, &source_entity)
                    .await
                    .map_err(with_source_context)?;
                let target = self
                    .describe_cached(Side::Target, &target_entity)
                    .await
                    .map_err(with_target_context)?;
                Ok((source, target))
            }
        }
    }

    pub(super) async fn prepare_objects(&mut self, set: &mut ObjectSet) -> Result<()> {
        let index = set.index;
        for object in &mut set.objects {
            let name = object.name().to_string();
            self.prepare_object(index, object)
                .await
                .map_err(|e| e.with_context(index, name, None))?;
        }
        Ok(())
    }

    /// Describe an object and derive its field list, external ID and lookups.
    async fn prepare_object(&mut self, set_index: usize, object: &mut ScriptObject) -> Result<()> {
        let (source_describe, target_describe) = self.describe_pair(set_index, object).await?;
        let delimiter = self.delimiter().to_string();
        let name = object.name().to_string();
        let write = object.operation.is_write();
        let inserts = matches!(object.operation, Operation::Insert | Operation::Upsert);
        let updates = matches!(object.operation, Operation::Update | Operation::Upsert);

        let mapper = match object.mapped_target_entity() {
            Some(target) => FieldMapper::new(name.clone(), target, object.mapped_fields()),
            None if object.use_field_mapping => FieldMapper::new(name.clone(), name.clone(), object.mapped_fields()),
            None => FieldMapper::identity(name.clone()),
        };

        // External ID, canonical field spelling
        let (external_id, auto_assigned) = if object.operation == Operation::Insert {
            (ID_FIELD.to_string(), true)
        } else if object.external_id.is_empty() {
            (source_describe.default_external_id(), true)
        } else {
            let parts: Vec<String> = external_id_parts(&object.external_id, &delimiter)
                .into_iter()
                .map(|part| source_describe.field(&part).map(|f| f.name.clone()).unwrap_or(part))
                .collect();
            (parts.join(&delimiter), false)
        };
        let ext_parts = external_id_parts(&external_id, &delimiter);

        let mut fields = expand_multiselect(&object.extra.query.fields, &source_describe);
        for part in &ext_parts {
            if !fields.iter().any(|f| f.eq_ignore_ascii_case(part)) {
                fields.push(part.clone());
            }
        }
        if !fields.iter().any(|f| f == ID_FIELD) {
            fields.insert(0, ID_FIELD.to_string());
        }
        fields.retain(|f| {
            f == ID_FIELD
                || ext_parts.contains(f)
                || !object.excluded_fields.iter().any(|e| e.eq_ignore_ascii_case(f))
        });

        let missing_ext = |field: &str, endpoint: &str| -> DataMoveError {
            let err: DataMoveError = SchemaError::ExternalIdFieldMissing {
                entity: name.clone(),
                field: field.to_string(),
                endpoint: endpoint.to_string(),
            }
            .into();
            err.with_context(set_index, name.clone(), Some(endpoint))
        };

        let mut kept = Vec::new();
        let mut lookup_entities = BTreeMap::new();
        let mut master_detail_lookups = BTreeMap::new();
        let mut excluded_from_update = BTreeSet::new();

        for field in fields {
            if field == ID_FIELD {
                kept.push(field);
                continue;
            }
            let is_ext = ext_parts.iter().any(|p| p.eq_ignore_ascii_case(&field));

            if let Some(lookup) = lookup_field_of_path(&field) {
                if source_describe.field(&lookup).is_some_and(FieldDescribe::is_lookup) {
                    kept.push(field);
                } else if is_ext {
                    return Err(missing_ext(&field, self.source.label()));
                } else {
                    warn!("{}: relationship field {} has no lookup {} and is dropped", name, field, lookup);
                }
                continue;
            }

            let Some(describe) = source_describe.field(&field) else {
                if is_ext {
                    return Err(missing_ext(&field, self.source.label()));
                }
                warn!("{}: field {} not found on {} and is dropped", name, field, self.source.label());
                continue;
            };
            let field = describe.name.clone();

            if write {
                let target_field = mapper.map_field(&field);
                match target_describe.field(&target_field) {
                    None if is_ext => return Err(missing_ext(&target_field, self.target.label())),
                    None => {
                        warn!("{}: field {} not found on {} and is dropped", name, target_field, self.target.label());
                        continue;
                    }
                    Some(target) if !target.is_writable(inserts, updates) => {
                        let kept_for_selection = is_ext
                            || object
                                .excluded_from_update_fields
                                .iter()
                                .any(|e| e.eq_ignore_ascii_case(&field));
                        if !kept_for_selection {
                            debug!("{}: field {} cannot be written by {} and is dropped", name, field, object.operation);
                            continue;
                        }
                        excluded_from_update.insert(field.clone());
                    }
                    Some(_) => {}
                }
            }

            if describe.is_lookup() {
                let referenced = if describe.reference_to.len() > 1 {
                    match object.extra.query.polymorphic_fields.get(&field) {
                        Some(entity) => Some(entity.clone()),
                        None if is_ext => {
                            let err: DataMoveError = SchemaError::PolymorphicLookup {
                                entity: name.clone(),
                                field: field.clone(),
                            }
                            .into();
                            return Err(err.with_context(set_index, name.clone(), Some(self.source.label())));
                        }
                        None => {
                            warn!(
                                "{}: lookup {} references {:?}; annotate it as {}%<Entity> to keep it",
                                name, field, describe.reference_to, field
                            );
                            continue;
                        }
                    }
                } else {
                    describe.reference_to.first().cloned()
                };

                if let Some(entity) = referenced {
                    if describe.is_master_detail() {
                        master_detail_lookups.insert(field.clone(), entity.clone());
                    }
                    lookup_entities.insert(field.clone(), entity);
                }
            }

            kept.push(field);
        }
        dedupe(&mut kept);

        for field in &object.excluded_from_update_fields {
            let field = source_describe
                .field(field)
                .map(|f| f.name.clone())
                .unwrap_or_else(|| field.clone());
            excluded_from_update.insert(field);
        }

        debug!(
            "{}: {} fields, external ID {}{}, lookups {:?}",
            name,
            kept.len(),
            external_id,
            if auto_assigned { " (default)" } else { "" },
            lookup_entities
        );

        let extra = &mut object.extra;
        extra.query.fields = kept;
        extra.target_entity = mapper.target_entity().to_string();
        extra.mapper = mapper;
        extra.external_id = external_id;
        extra.external_id_auto_assigned = auto_assigned;
        extra.lookup_entities = lookup_entities;
        extra.master_detail_lookups = master_detail_lookups;
        extra.excluded_from_update = excluded_from_update;
        extra.source_describe = Some(source_describe);
        extra.target_describe = Some(target_describe);
        Ok(())
    }

    /// Link lookups to the objects of the set, adding a read-only object for
    /// every referenced entity the script does not declare.
    pub(super) async fn resolve_references(&mut self, set: &mut ObjectSet) -> Result<()> {
        let mut pending: Vec<usize> = (0..set.objects.len()).collect();

        while !pending.is_empty() {
            let mut synthesized: Vec<String> = Vec::new();

            for &position in &pending {
                let name = set.objects[position].name().to_string();
                let lookups = set.objects[position].extra.lookup_entities.clone();

                for (field, entity) in lookups {
                    let excluded = set.excluded_objects.iter().any(|e| e.eq_ignore_ascii_case(&entity));
                    let declared = set.object(&entity).is_some() || synthesized.contains(&entity);

                    if !excluded && (declared || !set.targets_entity(&entity, &name)) {
                        if !declared {
                            info!("Object set {}: adding {} referenced by {}.{}", set.index, entity, name, field);
                            synthesized.push(entity.clone());
                        }
                        set.objects[position].extra.lookup_objects.insert(field, entity);
                        continue;
                    }

                    if excluded {
                        debug!("{}: lookup {} references excluded {} and is dropped", name, field, entity);
                    } else {
                        warn!("{}: lookup {} references {}, already targeted by another object; dropped", name, field, entity);
                    }
                    let extra = &mut set.objects[position].extra;
                    extra.query.fields.retain(|f| *f != field);
                    extra.lookup_entities.remove(&field);
                    extra.master_detail_lookups.remove(&field);
                }
            }

            pending.clear();
            for entity in synthesized {
                let mut object = ScriptObject::readonly_id_only(&entity, set.index);
                self.prepare_object(set.index, &mut object).await?;
                pending.push(set.objects.len());
                set.objects.push(object);
            }
        }
        Ok(())
    }

    /// Complete field lists with relationship fields, map everything to
    /// target spelling and promote unscoped non-master objects.
    pub(super) fn finalize_objects(&self, set: &mut ObjectSet) -> Result<()> {
        let delimiter = self.delimiter().to_string();
        let index = set.index;

        for object in &set.objects {
            if !object.operation.is_write() {
                continue;
            }
            for parent in object.extra.lookup_objects.values() {
                if let Some(parent) = set.object(parent) {
                    if parent.operation == Operation::Delete && parent.hard_delete {
                        return Err(DataMoveError::from(ConfigError::HardDeleteReferenced {
                            entity: object.name().to_string(),
                            referenced: parent.name().to_string(),
                        })
                        .with_context(index, object.name(), None));
                    }
                }
            }
        }

        let parent_external_ids: HashMap<String, String> = set
            .objects
            .iter()
            .map(|o| (o.name().to_string(), o.extra.external_id.clone()))
            .collect();

        for object in &mut set.objects {
            let name = object.name().to_string();
            let operation = object.operation;
            let extra = &mut object.extra;
            dedupe(&mut extra.query.fields);

            for (field, parent) in extra.lookup_objects.clone() {
                if field.contains('.') {
                    continue;
                }
                let Some(parent_external_id) = parent_external_ids.get(&parent) else {
                    continue;
                };
                if parent_external_id == ID_FIELD {
                    continue;
                }

                let relationship = to_relationship_field(&field);
                let paths: Vec<String> = external_id_parts(parent_external_id, &delimiter)
                    .into_iter()
                    .map(|part| format!("{relationship}.{part}"))
                    .collect();
                for path in &paths {
                    if !extra.query.fields.contains(path) {
                        extra.query.fields.push(path.clone());
                    }
                }
                extra.relationship_fields.insert(field, paths);
            }

            extra.target_fields = extra.query.fields.iter().map(|f| extra.mapper.map_field(f)).collect();
            extra.target_filter = extra.mapper.map_where_clause(&extra.query.filter);

            extra.target_external_id = if !extra.external_id_auto_assigned {
                extra.mapper.map_external_id(&extra.external_id, &delimiter)
            } else if operation == Operation::Insert {
                ID_FIELD.to_string()
            } else {
                extra
                    .target_describe
                    .as_ref()
                    .map(EntityDescribe::default_external_id)
                    .unwrap_or_else(|| extra.mapper.map_external_id(&extra.external_id, &delimiter))
            };

            for part in external_id_parts(&extra.target_external_id, &delimiter) {
                let present = part.contains('.')
                    || extra.target_describe.as_ref().is_none_or(|d| d.has_field(&part));
                if !present {
                    return Err(DataMoveError::from(SchemaError::ExternalIdFieldMissing {
                        entity: extra.target_entity.clone(),
                        field: part,
                        endpoint: self.target.label().to_string(),
                    })
                    .with_context(index, name, Some(self.target.label())));
                }
                if !extra.target_fields.contains(&part) {
                    extra.target_fields.push(part);
                }
            }
        }

        promote_unscoped_objects(set);
        Ok(())
    }
}

/// Make every non-master object master when no master object is reachable
/// from it through lookups in either direction.
fn promote_unscoped_objects(set: &mut ObjectSet) {
    let mut neighbours: HashMap<String, Vec<String>> = HashMap::new();
    for object in &set.objects {
        for parent in object.extra.lookup_objects.values() {
            neighbours.entry(object.name().to_string()).or_default().push(parent.clone());
            neighbours.entry(parent.clone()).or_default().push(object.name().to_string());
        }
    }
    let masters: HashSet<String> = set
        .objects
        .iter()
        .filter(|o| o.master)
        .map(|o| o.name().to_string())
        .collect();

    for object in &mut set.objects {
        if object.master {
            continue;
        }

        let mut visited = HashSet::from([object.name().to_string()]);
        let mut queue = VecDeque::from([object.name().to_string()]);
        let mut scoped = false;
        while let Some(current) = queue.pop_front() {
            if masters.contains(&current) {
                scoped = true;
                break;
            }
            for next in neighbours.get(&current).into_iter().flatten() {
                if visited.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }

        if !scoped {
            info!("{}: no master object in reach, promoted to master", object.name());
            object.master = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Script;
    use std::path::Path;

    fn account_describe() -> EntityDescribe {
        let mut name = FieldDescribe::text("Name");
        name.name_field = true;
        let mut number = FieldDescribe::text("AccountNumber");
        number.unique = true;
        number.nillable = false;
        EntityDescribe::new(
            "Account",
            vec![FieldDescribe::id(), name, number, FieldDescribe::lookup("OwnerId", "User")],
        )
    }

    #[test]
    fn test_expand_multiselect() {
        let describe = account_describe();
        let fields = expand_multiselect(&["Id".to_string(), "lookup_true".to_string()], &describe);
        assert_eq!(fields, vec!["Id", "OwnerId"]);

        let fields = expand_multiselect(&["nillable_false".to_string()], &describe);
        assert_eq!(fields, vec!["Id", "AccountNumber"]);

        let all = expand_multiselect(&["all".to_string()], &describe);
        assert_eq!(all.len(), 4);

        let unknown = expand_multiselect(&["Bogus_c".to_string()], &describe);
        assert_eq!(unknown, vec!["Bogus_c"]);
    }

    #[test]
    fn test_validate_delete_query() {
        let mut script = Script::from_json_str(
            r#"{"objects":[{"query":"SELECT Id FROM Account","operation":"Upsert","deleteQuery":"SELECT Id FROM Contact"}]}"#,
            Path::new("/tmp"),
        )
        .unwrap();
        let err = validate_object_set(&mut script.object_sets[0]).unwrap_err();
        assert_eq!(err.kind_name(), "config");
        assert!(err.to_string().contains("[object set 1] Account"));

        let mut script = Script::from_json_str(
            r#"{"objects":[{"query":"SELECT Id FROM Account","operation":"Update","deleteOldData":true}]}"#,
            Path::new("/tmp"),
        )
        .unwrap();
        assert!(validate_object_set(&mut script.object_sets[0]).is_err());
    }

    #[test]
    fn test_delete_operation_uses_main_filter() {
        let mut script = Script::from_json_str(
            r#"{"objects":[{"query":"SELECT Id, Name FROM Lead WHERE Status = 'Old'","operation":"Delete"}]}"#,
            Path::new("/tmp"),
        )
        .unwrap();
        validate_object_set(&mut script.object_sets[0]).unwrap();
        let delete = script.object_sets[0].objects[0].extra.delete_query.clone().unwrap();
        assert_eq!(delete.compose(), "SELECT Id FROM Lead WHERE Status = 'Old'");
    }

    #[test]
    fn test_promote_unscoped_objects() {
        let mut script = Script::from_json_str(
            r#"{"objects":[
                {"query":"SELECT Id FROM Account","master":false},
                {"query":"SELECT Id FROM Contact","master":false},
                {"query":"SELECT Id FROM Case"},
                {"query":"SELECT Id FROM Task","master":false}
            ]}"#,
            Path::new("/tmp"),
        )
        .unwrap();
        let set = &mut script.object_sets[0];
        set.objects[1].extra.lookup_objects.insert("AccountId".into(), "Account".into());
        set.objects[3].extra.lookup_objects.insert("WhatId".into(), "Case".into());

        promote_unscoped_objects(set);
        let masters: Vec<bool> = set.objects.iter().map(|o| o.master).collect();
        // Account and Contact reach no master; Task reaches Case
        assert_eq!(masters, vec![true, true, true, false]);
    }
}
