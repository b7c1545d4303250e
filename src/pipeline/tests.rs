use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use super::*;
use crate::config::Config;
use crate::endpoint::{CsvFileEndpoint, FieldDescribe, MemoryEndpoint};

fn record(pairs: &[(&str, &str)]) -> Record {
    pairs.iter().map(|(k, v)| (k.to_string(), json!(v))).collect()
}

fn account_describe() -> EntityDescribe {
    let mut name = FieldDescribe::text("Name");
    name.name_field = true;
    EntityDescribe::new("Account", vec![FieldDescribe::id(), name])
}

fn contact_describe() -> EntityDescribe {
    let mut last_name = FieldDescribe::text("LastName");
    last_name.name_field = true;
    EntityDescribe::new(
        "Contact",
        vec![
            FieldDescribe::id(),
            last_name,
            FieldDescribe::text("FirstName"),
            FieldDescribe::lookup("AccountId", "Account"),
        ],
    )
}

fn case_describe() -> EntityDescribe {
    let mut subject = FieldDescribe::text("Subject");
    subject.name_field = true;
    EntityDescribe::new(
        "Case",
        vec![FieldDescribe::id(), subject, FieldDescribe::lookup("ContactId", "Contact")],
    )
}

fn lead_describe() -> EntityDescribe {
    EntityDescribe::new(
        "Lead",
        vec![FieldDescribe::id(), FieldDescribe::text("LastName"), FieldDescribe::text("Status")],
    )
}

fn source_org() -> MemoryEndpoint {
    MemoryEndpoint::new("source")
        .with_entity(
            account_describe(),
            vec![
                record(&[("Id", "A1"), ("Name", "Acme")]),
                record(&[("Id", "A2"), ("Name", "Globex")]),
            ],
        )
        .with_entity(
            contact_describe(),
            vec![
                record(&[("Id", "C1"), ("LastName", "Smith"), ("FirstName", "John"), ("AccountId", "A1")]),
                record(&[("Id", "C2"), ("LastName", "Jones"), ("FirstName", "Mary"), ("AccountId", "A2")]),
                record(&[("Id", "C3"), ("LastName", "Brown"), ("FirstName", "Bob")]),
            ],
        )
        .with_entity(
            case_describe(),
            vec![
                record(&[("Id", "K1"), ("Subject", "Printer"), ("ContactId", "C1")]),
                record(&[("Id", "K2"), ("Subject", "Login"), ("ContactId", "C3")]),
                record(&[("Id", "K3"), ("Subject", "Orphan")]),
            ],
        )
        .with_entity(lead_describe(), Vec::new())
}

fn target_org(accounts: Vec<Record>) -> MemoryEndpoint {
    target_org_with_contacts(accounts, Vec::new())
}

fn target_org_with_contacts(accounts: Vec<Record>, contacts: Vec<Record>) -> MemoryEndpoint {
    MemoryEndpoint::new("target")
        .with_entity(account_describe(), accounts)
        .with_entity(contact_describe(), contacts)
        .with_entity(case_describe(), Vec::new())
        .with_entity(
            lead_describe(),
            vec![
                record(&[("Id", "L1"), ("LastName", "Old One"), ("Status", "Old")]),
                record(&[("Id", "L2"), ("LastName", "Old Two"), ("Status", "Old")]),
                record(&[("Id", "L3"), ("LastName", "Fresh"), ("Status", "Open")]),
            ],
        )
}

const ACCOUNT_CONTACT_SCRIPT: &str = r#"{"objects":[
    {"query":"SELECT Id, Name FROM Account","operation":"Upsert","externalId":"Name"},
    {"query":"SELECT Id, LastName, AccountId FROM Contact","operation":"Upsert","externalId":"LastName","master":false}
]}"#;

async fn run(
    config: Config,
    source: Arc<dyn EndpointClient>,
    target: Arc<dyn EndpointClient>,
    script: &str,
) -> (TempDir, Result<RunSummary>) {
    let dir = TempDir::new().unwrap();
    let context = RunContext::new(config, dir.path());
    let script = Script::from_json_str(script, &context.working_dir).unwrap();
    let mut pipeline = Pipeline::new(context, source, target);
    let result = pipeline.run_script(script).await;
    (dir, result)
}

fn text(record: &Record, field: &str) -> String {
    record_text(record, field).unwrap_or_default()
}

#[tokio::test]
async fn test_children_follow_their_parents() {
    let source = Arc::new(source_org());
    let target = Arc::new(target_org(Vec::new()));

    let (_dir, result) = run(Config::default(), source.clone(), target.clone(), ACCOUNT_CONTACT_SCRIPT).await;
    let summary = result.unwrap();

    let accounts = target.records("Account").await;
    assert_eq!(accounts.len(), 2);
    let account_ids: Vec<String> = accounts.iter().map(|a| text(a, "Id")).collect();

    // Only contacts of queried accounts are moved
    let contacts = target.records("Contact").await;
    let mut names: Vec<String> = contacts.iter().map(|c| text(c, "LastName")).collect();
    names.sort();
    assert_eq!(names, vec!["Jones", "Smith"]);
    for contact in &contacts {
        assert!(account_ids.contains(&text(contact, "AccountId")));
    }
    let smith = contacts.iter().find(|c| text(c, "LastName") == "Smith").unwrap();
    let acme = accounts.iter().find(|a| text(a, "Name") == "Acme").unwrap();
    assert_eq!(text(smith, "AccountId"), text(acme, "Id"));

    let queries = source.executed_queries().await;
    let account_query = queries.iter().position(|q| q == "SELECT Id, Name FROM Account").unwrap();
    let contact_query = queries
        .iter()
        .position(|q| q.contains("FROM Contact") && q.contains("AccountId IN"))
        .unwrap();
    assert!(account_query < contact_query);

    let contact = summary.object(1, "Contact").unwrap();
    assert!(contact.completed);
    assert_eq!(contact.stats.source_queried, 2);
    assert_eq!(contact.stats.inserted, 2);
    assert_eq!(summary.object(1, "Account").unwrap().stats.inserted, 2);
    assert_eq!(summary.failed(), 0);
}

#[tokio::test]
async fn test_upsert_updates_matched_records() {
    let source = Arc::new(source_org());
    let target = Arc::new(target_org(vec![record(&[("Id", "T1"), ("Name", "Acme")])]));

    let (_dir, result) = run(Config::default(), source, target.clone(), ACCOUNT_CONTACT_SCRIPT).await;
    let summary = result.unwrap();

    let accounts = target.records("Account").await;
    assert_eq!(accounts.len(), 2);
    assert_eq!(accounts.iter().filter(|a| text(a, "Name") == "Acme").count(), 1);

    let account = summary.object(1, "Account").unwrap();
    assert_eq!(account.stats.updated, 1);
    assert_eq!(account.stats.inserted, 1);

    let contacts = target.records("Contact").await;
    let smith = contacts.iter().find(|c| text(c, "LastName") == "Smith").unwrap();
    assert_eq!(text(smith, "AccountId"), "T1");
}

#[tokio::test]
async fn test_delete_operation_removes_matching_target_records() {
    let target = Arc::new(target_org(Vec::new()));

    let (_dir, result) = run(
        Config::default(),
        Arc::new(source_org()),
        target.clone(),
        r#"{"objects":[{"query":"SELECT Id FROM Lead WHERE Status = 'Old'","operation":"Delete"}]}"#,
    )
    .await;
    let summary = result.unwrap();

    let leads = target.records("Lead").await;
    assert_eq!(leads.len(), 1);
    assert_eq!(text(&leads[0], "Id"), "L3");

    let lead = summary.object(1, "Lead").unwrap();
    assert!(lead.completed);
    assert_eq!(lead.stats.deleted, 2);
}

#[tokio::test]
async fn test_delete_query_mismatch_fails_before_any_call() {
    let source = Arc::new(source_org());
    let target = Arc::new(target_org(Vec::new()));

    let (_dir, result) = run(
        Config::default(),
        source.clone(),
        target.clone(),
        r#"{"objects":[{"query":"SELECT Id, Name FROM Account","operation":"Upsert","deleteOldData":true,"deleteQuery":"SELECT Id FROM Contact"}]}"#,
    )
    .await;

    let err = result.unwrap_err();
    assert_eq!(err.kind_name(), "config");
    assert_eq!(source.describe_calls().await, 0);
    assert_eq!(target.describe_calls().await, 0);
}

#[tokio::test]
async fn test_referenced_entity_is_added_and_matched() {
    let source = Arc::new(source_org());
    let target = Arc::new(target_org(vec![
        record(&[("Id", "T1"), ("Name", "Acme")]),
        record(&[("Id", "T2"), ("Name", "Globex")]),
    ]));

    let (_dir, result) = run(
        Config::default(),
        source.clone(),
        target.clone(),
        r#"{"objects":[{"query":"SELECT Id, LastName, AccountId FROM Contact","operation":"Insert"}]}"#,
    )
    .await;
    let summary = result.unwrap();

    // The added parent is read, never written
    let account = summary.object(1, "Account").unwrap();
    assert_eq!(account.operation, Operation::Readonly);
    assert_eq!(account.stats.source_queried, 2);
    assert_eq!(target.records("Account").await.len(), 2);

    let contacts = target.records("Contact").await;
    assert_eq!(contacts.len(), 3);
    let jones = contacts.iter().find(|c| text(c, "LastName") == "Jones").unwrap();
    assert_eq!(text(jones, "AccountId"), "T2");
    let brown = contacts.iter().find(|c| text(c, "LastName") == "Brown").unwrap();
    assert_eq!(text(brown, "AccountId"), "");

    assert!(
        source
            .executed_queries()
            .await
            .iter()
            .any(|q| q.contains("FROM Account") && q.contains("Id IN"))
    );
}

#[tokio::test]
async fn test_failed_bulk_job_leaves_object_incomplete() {
    let mut config = Config::default();
    config.engine.bulk_update_call_cost = 0.0;
    let target = Arc::new(target_org(Vec::new()));
    target.set_failing("Contact", true).await;

    let (_dir, result) = run(config, Arc::new(source_org()), target.clone(), ACCOUNT_CONTACT_SCRIPT).await;
    let summary = result.unwrap();

    assert!(summary.object(1, "Account").unwrap().completed);
    let contact = summary.object(1, "Contact").unwrap();
    assert!(!contact.completed);
    assert_eq!(contact.stats.failed, 2);
    assert_eq!(target.records("Account").await.len(), 2);
    assert!(target.records("Contact").await.is_empty());
}

#[tokio::test]
async fn test_hard_deleted_parent_cannot_be_referenced() {
    let (_dir, result) = run(
        Config::default(),
        Arc::new(source_org()),
        Arc::new(target_org(Vec::new())),
        r#"{"objects":[
            {"query":"SELECT Id FROM Account","operation":"Delete","hardDelete":true},
            {"query":"SELECT Id, LastName, AccountId FROM Contact","operation":"Upsert","externalId":"LastName"}
        ]}"#,
    )
    .await;

    let err = result.unwrap_err();
    assert_eq!(err.kind_name(), "config");
    assert!(err.to_string().contains("Account"));
}

#[tokio::test]
async fn test_missing_external_id_field() {
    let (_dir, result) = run(
        Config::default(),
        Arc::new(source_org()),
        Arc::new(target_org(Vec::new())),
        r#"{"objects":[{"query":"SELECT Id, Name FROM Account","operation":"Upsert","externalId":"Code__c"}]}"#,
    )
    .await;

    let err = result.unwrap_err();
    assert_eq!(err.kind_name(), "schema");
    assert!(err.to_string().contains("Code__c"));
    assert!(err.to_string().contains("[object set 1] Account"));
}

#[tokio::test]
async fn test_csv_files_to_database() {
    let files = TempDir::new().unwrap();
    tokio::fs::write(files.path().join("Account.csv"), "Id,Name\nA1,Acme\nA2,Globex\n")
        .await
        .unwrap();
    let source = CsvFileEndpoint::open("csvfile", files.path()).await.unwrap();
    let target = Arc::new(target_org(vec![record(&[("Id", "T1"), ("Name", "Acme")])]));

    let (dir, result) = run(
        Config::default(),
        Arc::new(source),
        target.clone(),
        r#"{"objects":[{"query":"SELECT Id, Name FROM Account","operation":"Upsert","externalId":"Name"}]}"#,
    )
    .await;
    let summary = result.unwrap();

    let mut names: Vec<String> = target.records("Account").await.iter().map(|a| text(a, "Name")).collect();
    names.sort();
    assert_eq!(names, vec!["Acme", "Globex"]);
    assert_eq!(summary.object(1, "Account").unwrap().stats.updated, 1);

    let status = dir
        .path()
        .join(DEFAULT_WORKING_DIR)
        .join("objectset-1/status/Account_Upsert_status.csv");
    let content = tokio::fs::read_to_string(status).await.unwrap();
    assert!(content.starts_with("id,created,error,status"));
    assert_eq!(content.lines().count(), 3);
}

#[tokio::test]
async fn test_grandchildren_are_queried_in_later_rounds() {
    let source = Arc::new(source_org());
    let target = Arc::new(target_org(Vec::new()));

    let (_dir, result) = run(
        Config::default(),
        source.clone(),
        target.clone(),
        r#"{"objects":[
            {"query":"SELECT Id, Subject, ContactId FROM Case","operation":"Upsert","externalId":"Subject","master":false},
            {"query":"SELECT Id, Name FROM Account","operation":"Upsert","externalId":"Name"},
            {"query":"SELECT Id, LastName, AccountId FROM Contact","operation":"Upsert","externalId":"LastName","master":false}
        ]}"#,
    )
    .await;
    let summary = result.unwrap();

    // Only the case of a contact of a queried account
    let cases = target.records("Case").await;
    assert_eq!(cases.len(), 1);
    assert_eq!(text(&cases[0], "Subject"), "Printer");

    let contacts = target.records("Contact").await;
    let smith = contacts.iter().find(|c| text(c, "LastName") == "Smith").unwrap();
    assert_eq!(text(&cases[0], "ContactId"), text(smith, "Id"));

    assert!(
        source
            .executed_queries()
            .await
            .iter()
            .any(|q| q.contains("FROM Case") && q.contains("ContactId IN ('C1','C2')"))
    );
    assert_eq!(summary.object(1, "Case").unwrap().stats.source_queried, 1);
    assert_eq!(summary.object(1, "Contact").unwrap().stats.source_queried, 2);
}

#[tokio::test]
async fn test_child_matched_on_target_by_external_id() {
    let target = Arc::new(target_org_with_contacts(
        Vec::new(),
        vec![
            record(&[("Id", "TC1"), ("LastName", "Smith")]),
            record(&[("Id", "TC9"), ("LastName", "Other")]),
        ],
    ));

    let (_dir, result) = run(Config::default(), Arc::new(source_org()), target.clone(), ACCOUNT_CONTACT_SCRIPT).await;
    let summary = result.unwrap();

    let queries = target.executed_queries().await;
    assert!(
        queries
            .iter()
            .any(|q| q.contains("FROM Contact WHERE LastName IN ('Jones','Smith')"))
    );

    let contact = summary.object(1, "Contact").unwrap();
    assert_eq!(contact.stats.target_queried, 1);
    assert_eq!(contact.stats.updated, 1);
    assert_eq!(contact.stats.inserted, 1);

    let contacts = target.records("Contact").await;
    assert_eq!(contacts.len(), 3);
    let smith = contacts.iter().find(|c| text(c, "Id") == "TC1").unwrap();
    let accounts = target.records("Account").await;
    let acme = accounts.iter().find(|a| text(a, "Name") == "Acme").unwrap();
    assert_eq!(text(smith, "AccountId"), text(acme, "Id"));
}

#[tokio::test]
async fn test_child_target_query_falls_back_to_whole_entity() {
    // One value per clause and no penalty for extra records: a single
    // unfiltered query beats one query per external ID
    let mut config = Config::default();
    config.query.max_where_clause_length = 1;
    config.engine.irrelevant_records_penalty = 0.0;

    let target = Arc::new(target_org_with_contacts(
        Vec::new(),
        vec![
            record(&[("Id", "TC1"), ("LastName", "Smith")]),
            record(&[("Id", "TC9"), ("LastName", "Other")]),
        ],
    ));

    let (_dir, result) = run(config, Arc::new(source_org()), target.clone(), ACCOUNT_CONTACT_SCRIPT).await;
    let summary = result.unwrap();

    let queries = target.executed_queries().await;
    assert!(
        queries
            .iter()
            .any(|q| q.starts_with("SELECT Id, LastName") && q.ends_with("FROM Contact"))
    );

    let contact = summary.object(1, "Contact").unwrap();
    assert_eq!(contact.stats.target_queried, 2);
    assert_eq!(contact.stats.updated, 1);
    assert_eq!(contacts_named(&target, "Smith").await, 1);
}

async fn contacts_named(target: &MemoryEndpoint, last_name: &str) -> usize {
    target
        .records("Contact")
        .await
        .iter()
        .filter(|c| text(c, "LastName") == last_name)
        .count()
}

#[tokio::test]
async fn test_composite_external_id_matches_on_every_part() {
    let target = Arc::new(target_org_with_contacts(
        Vec::new(),
        vec![
            record(&[("Id", "TC1"), ("LastName", "Smith"), ("FirstName", "John")]),
            record(&[("Id", "TC2"), ("LastName", "Smith"), ("FirstName", "Jane")]),
            record(&[("Id", "TC9"), ("LastName", "Other"), ("FirstName", "Ann")]),
        ],
    ));

    let (_dir, result) = run(
        Config::default(),
        Arc::new(source_org()),
        target.clone(),
        r#"{"objects":[
            {"query":"SELECT Id, Name FROM Account","operation":"Upsert","externalId":"Name"},
            {"query":"SELECT Id, LastName, FirstName, AccountId FROM Contact","operation":"Upsert","externalId":"LastName;FirstName","master":false}
        ]}"#,
    )
    .await;
    let summary = result.unwrap();

    assert!(target.executed_queries().await.iter().any(|q| q.contains(
        "WHERE (LastName = 'Jones' AND FirstName = 'Mary') OR (LastName = 'Smith' AND FirstName = 'John')"
    )));

    let contact = summary.object(1, "Contact").unwrap();
    assert_eq!(contact.stats.target_queried, 1);
    assert_eq!(contact.stats.updated, 1);
    assert_eq!(contact.stats.inserted, 1);

    let contacts = target.records("Contact").await;
    assert_eq!(contacts.len(), 4);
    let john = contacts.iter().find(|c| text(c, "Id") == "TC1").unwrap();
    assert!(!text(john, "AccountId").is_empty());
    let jane = contacts.iter().find(|c| text(c, "Id") == "TC2").unwrap();
    assert_eq!(text(jane, "AccountId"), "");
}

#[tokio::test]
async fn test_lookup_cycle_is_patched_after_both_writes() {
    let mut primary_contact = FieldDescribe::lookup("PrimaryContactId", "Contact");
    primary_contact.nillable = true;
    let mut name = FieldDescribe::text("Name");
    name.name_field = true;
    let account = EntityDescribe::new("Account", vec![FieldDescribe::id(), name, primary_contact]);

    let source = MemoryEndpoint::new("source")
        .with_entity(
            account.clone(),
            vec![record(&[("Id", "A1"), ("Name", "Acme"), ("PrimaryContactId", "C1")])],
        )
        .with_entity(
            contact_describe(),
            vec![
                record(&[("Id", "C1"), ("LastName", "Smith"), ("AccountId", "A1")]),
                record(&[("Id", "C2"), ("LastName", "Jones"), ("AccountId", "A1")]),
            ],
        );
    let target = Arc::new(
        MemoryEndpoint::new("target")
            .with_entity(account, Vec::new())
            .with_entity(contact_describe(), Vec::new()),
    );

    let (_dir, result) = run(
        Config::default(),
        Arc::new(source),
        target.clone(),
        r#"{"objects":[
            {"query":"SELECT Id, Name, PrimaryContactId FROM Account","operation":"Upsert","externalId":"Name"},
            {"query":"SELECT Id, LastName, AccountId FROM Contact","operation":"Upsert","externalId":"LastName"}
        ]}"#,
    )
    .await;
    let summary = result.unwrap();
    assert_eq!(summary.failed(), 0);

    // Whichever side was written first had its lookup patched afterwards
    let accounts = target.records("Account").await;
    assert_eq!(accounts.len(), 1);
    let contacts = target.records("Contact").await;
    assert_eq!(contacts.len(), 2);

    let smith = contacts.iter().find(|c| text(c, "LastName") == "Smith").unwrap();
    assert_eq!(text(&accounts[0], "PrimaryContactId"), text(smith, "Id"));
    for contact in &contacts {
        assert_eq!(text(contact, "AccountId"), text(&accounts[0], "Id"));
    }
}

#[tokio::test]
async fn test_entity_and_field_renamed_on_target() {
    let mut title = FieldDescribe::text("Title");
    title.name_field = true;
    let target = Arc::new(MemoryEndpoint::new("target").with_entity(
        EntityDescribe::new("Organization", vec![FieldDescribe::id(), title]),
        vec![record(&[("Id", "O1"), ("Title", "Acme")])],
    ));

    let (_dir, result) = run(
        Config::default(),
        Arc::new(source_org()),
        target.clone(),
        r#"{"objects":[{
            "query":"SELECT Id, Name FROM Account",
            "operation":"Upsert",
            "externalId":"Name",
            "useFieldMapping":true,
            "fieldMapping":[
                {"targetObject":"Organization"},
                {"sourceField":"Name","targetField":"Title"}
            ]
        }]}"#,
    )
    .await;
    let summary = result.unwrap();

    assert!(
        target
            .executed_queries()
            .await
            .iter()
            .any(|q| q.contains("Title") && q.contains("FROM Organization"))
    );

    let account = summary.object(1, "Account").unwrap();
    assert_eq!(account.stats.updated, 1);
    assert_eq!(account.stats.inserted, 1);

    let mut titles: Vec<String> = target
        .records("Organization")
        .await
        .iter()
        .map(|o| text(o, "Title"))
        .collect();
    titles.sort();
    assert_eq!(titles, vec!["Acme", "Globex"]);
}

#[tokio::test]
async fn test_update_leaves_create_only_fields_alone() {
    let mut name = FieldDescribe::text("Name");
    name.name_field = true;
    let mut region = FieldDescribe::text("Region");
    region.updateable = false;
    let account = EntityDescribe::new("Account", vec![FieldDescribe::id(), name, region]);

    let source = MemoryEndpoint::new("source").with_entity(
        account.clone(),
        vec![record(&[("Id", "A1"), ("Name", "Acme"), ("Region", "East")])],
    );
    let target = Arc::new(
        MemoryEndpoint::new("target").with_entity(account, vec![record(&[("Id", "T1"), ("Name", "Acme"), ("Region", "West")])]),
    );

    let (_dir, result) = run(
        Config::default(),
        Arc::new(source),
        target.clone(),
        r#"{"objects":[{"query":"SELECT Id, Name, Region FROM Account","operation":"Update","externalId":"Name"}]}"#,
    )
    .await;
    let summary = result.unwrap();

    assert_eq!(summary.object(1, "Account").unwrap().stats.updated, 1);
    let accounts = target.records("Account").await;
    assert_eq!(accounts.len(), 1);
    assert_eq!(text(&accounts[0], "Region"), "West");
}

#[tokio::test]
async fn test_staged_records_are_written_in_batches() {
    let mut config = Config::default();
    config.engine.bulk_update_batch_size = 1;
    let target = Arc::new(target_org(Vec::new()));

    let (dir, result) = run(config, Arc::new(source_org()), target.clone(), ACCOUNT_CONTACT_SCRIPT).await;
    let summary = result.unwrap();

    assert_eq!(summary.object(1, "Contact").unwrap().stats.inserted, 2);
    assert_eq!(target.records("Contact").await.len(), 2);

    let status = dir
        .path()
        .join(DEFAULT_WORKING_DIR)
        .join("objectset-1/status/Contact_Upsert_status.csv");
    let content = tokio::fs::read_to_string(status).await.unwrap();
    assert_eq!(content.lines().count(), 3);
}
