//! Relation resolution, counting, unlinking and cascading deletes.

mod common;

use common::{address_row, assert_sql_contains, loaded_address, loaded_user, row, Address, MockDatabase, Reply};
use metaorm::{define, Entity, EntityMetadata, EntityState, Model, OrmError};
use serde_json::json;

#[tokio::test]
async fn has_many_loads_once_and_caches() {
    let db = MockDatabase::new();
    db.rows(vec![address_row(1, 6, "Guangzhou"), address_row(2, 6, "Shenzhen")]);
    let mut user = loaded_user(6, "shi", 24);

    let addresses = user.related_many(&db, "addresses").await.unwrap();
    assert_eq!(addresses.len(), 2);
    assert!(addresses.iter().all(|a| a.is_loaded()));
    let q = db.last();
    assert_sql_contains(&q.sql, &[r#"FROM "address" WHERE "user_id" = $1"#]);
    assert_eq!(q.params, vec![json!(6)]);

    user.related_many(&db, "addresses").await.unwrap();
    assert_eq!(db.statements(), 1);
}

#[tokio::test]
async fn belongs_to_resolves_parent_by_its_key() {
    let db = MockDatabase::new();
    db.rows(vec![json!({"id": 6, "name": "shi", "age": 24})]);
    let mut address = loaded_address(1, 6, "Guangzhou");
    let owner = address.related_one(&db, "user").await.unwrap();
    assert_eq!(owner.get("name"), &json!("shi"));
    assert_sql_contains(&db.last().sql, &[r#"FROM "user" WHERE "id" = $1 LIMIT 1"#]);
}

#[tokio::test]
async fn null_foreign_key_resolves_without_a_query() {
    let db = MockDatabase::new();
    let mut address = Entity::from_row(
        Address::metadata(),
        row(json!({"id": 1, "user_id": null, "addr": "a", "tel": "1"})),
    );
    let owner = address.related_one(&db, "user").await.unwrap();
    assert!(!owner.is_loaded());
    assert_eq!(address.count_related(&db, "user").await.unwrap(), 0);
    assert_eq!(db.statements(), 0);
}

#[tokio::test]
async fn related_accessors_check_cardinality() {
    let db = MockDatabase::new();
    let mut user = loaded_user(6, "shi", 24);
    let err = user.related_one(&db, "addresses").await.unwrap_err();
    assert!(matches!(err, OrmError::RelationMismatch { expected: "single-valued", .. }));
    // the load itself succeeded and stays cached
    assert!(user.cached_related("addresses").is_some());

    let err = user.related_many(&db, "address").await.unwrap_err();
    assert!(matches!(err, OrmError::RelationMismatch { expected: "a collection", .. }));
    assert_eq!(db.statements(), 2);

    let err = user.related(&db, "friends").await.unwrap_err();
    assert!(matches!(err, OrmError::UnknownRelation { ref relation, .. } if relation == "friends"));
}

#[tokio::test]
async fn count_related_counts_through_the_foreign_key() {
    let db = MockDatabase::new();
    db.reply(Reply::Scalar(Some(json!(2))));
    let user = loaded_user(6, "shi", 24);
    assert_eq!(user.count_related(&db, "addresses").await.unwrap(), 2);
    let q = db.last();
    assert_eq!(q.sql, r#"SELECT COUNT(*) FROM "address" WHERE "user_id" = $1"#);
    assert_eq!(q.params, vec![json!(6)]);
}

#[tokio::test]
async fn delete_related_removes_every_child() {
    let db = MockDatabase::new();
    db.rows(vec![address_row(1, 6, "a"), address_row(2, 6, "b")]);
    db.reply(Reply::Scalar(Some(json!(0))));
    let mut user = loaded_user(6, "shi", 24);

    assert_eq!(user.delete_related(&db, "addresses").await.unwrap(), 2);
    assert_eq!(user.count_related(&db, "addresses").await.unwrap(), 0);

    let log = db.executed();
    assert_eq!(log.len(), 4);
    assert_eq!(log[1].sql, r#"DELETE FROM "address" WHERE "id" = $1"#);
    assert_eq!(log[1].params, vec![json!(1)]);
    assert_eq!(log[2].params, vec![json!(2)]);
    // the owner itself is untouched
    assert_eq!(user.state(), EntityState::Loaded);
}

#[tokio::test]
async fn remove_relations_rewrites_children_in_one_statement() {
    let db = MockDatabase::new();
    db.reply(Reply::Affected(2));
    let mut user = loaded_user(6, "shi", 24);
    assert_eq!(user.remove_relations(&db, "addresses", 0).await.unwrap(), 2);
    let q = db.last();
    assert_eq!(q.sql, r#"UPDATE "address" SET "user_id" = $1 WHERE "user_id" = $2"#);
    assert_eq!(q.params, vec![json!(0), json!(6)]);
    assert_eq!(db.statements(), 1);
}

#[tokio::test]
async fn clear_relations_writes_null_without_a_parameter() {
    let db = MockDatabase::new();
    let mut user = loaded_user(6, "shi", 24);
    assert_eq!(user.clear_relations(&db, "addresses").await.unwrap(), 1);
    let q = db.last();
    assert_eq!(q.sql, r#"UPDATE "address" SET "user_id" = NULL WHERE "user_id" = $1"#);
    assert_eq!(q.params, vec![json!(6)]);
}

#[tokio::test]
async fn remove_relations_on_belongs_to_saves_own_foreign_key() {
    let db = MockDatabase::new();
    let mut address = loaded_address(1, 6, "a");
    assert_eq!(address.remove_relations(&db, "user", 0).await.unwrap(), 1);
    assert_eq!(db.last().sql, r#"UPDATE "address" SET "user_id" = $1 WHERE "id" = $2"#);
    assert_eq!(address.get("user_id"), &json!(0));
    assert!(!address.is_dirty());

    // user_id is required, so nulling it is rejected before any write
    let err = address.clear_relations(&db, "user").await.unwrap_err();
    assert!(matches!(err, OrmError::Validation(ref v) if v.for_field("user_id").count() == 1));
    assert_eq!(db.statements(), 1);
}

fn team() -> &'static EntityMetadata {
    define("CascadeTeam", |m| {
        m.with_table("team").with_columns(["id", "name", "leader_id"]);
        m.has_many_named("members", "CascadeMember")
            .foreign_key("team_id")
            .cascade_delete();
    })
}

fn member() -> &'static EntityMetadata {
    define("CascadeMember", |m| {
        m.with_table("member").with_columns(["id", "team_id", "name"]);
        m.has_many_named("led_teams", "CascadeTeam")
            .foreign_key("leader_id")
            .cascade_delete();
    })
}

#[tokio::test]
async fn cascade_delete_stops_at_cycles() {
    let (team, member) = (team(), member());
    let db = MockDatabase::new();
    db.rows(vec![json!({"id": 10, "team_id": 1, "name": "ann"})]);
    let mut t = Entity::from_row(team, row(json!({"id": 1, "name": "core", "leader_id": 10})));
    t.delete(&db).await.unwrap();
    assert_eq!(t.state(), EntityState::Deleted);

    let sql: Vec<String> = db.executed().into_iter().map(|q| q.sql).collect();
    assert_eq!(
        sql,
        vec![
            r#"SELECT "member"."id", "member"."team_id", "member"."name" FROM "member" WHERE "team_id" = $1"#,
            r#"DELETE FROM "team" WHERE "leader_id" = $1"#,
            r#"DELETE FROM "member" WHERE "id" = $1"#,
            r#"DELETE FROM "team" WHERE "id" = $1"#,
        ]
    );

    db.reset_log();
    db.rows(vec![json!({"id": 1, "name": "core", "leader_id": 10})]);
    let mut m = Entity::from_row(member, row(json!({"id": 10, "team_id": 1, "name": "ann"})));
    m.delete(&db).await.unwrap();
    let log = db.executed();
    assert_eq!(log.len(), 4);
    assert_sql_contains(&log[0].sql, &[r#"FROM "team" WHERE "leader_id" = $1"#]);
    assert_eq!(log[1].sql, r#"DELETE FROM "member" WHERE "team_id" = $1"#);
    assert_eq!(log[2].sql, r#"DELETE FROM "team" WHERE "id" = $1"#);
    assert_eq!(log[3].sql, r#"DELETE FROM "member" WHERE "id" = $1"#);
}

#[tokio::test]
async fn failed_cascade_leaves_owner_loaded() {
    let db = MockDatabase::new();
    db.reply(Reply::Fail("lock timeout".into()));
    let mut t = Entity::from_row(team(), row(json!({"id": 2, "name": "ops", "leader_id": null})));
    member();
    assert!(matches!(t.delete(&db).await, Err(OrmError::Database(_))));
    assert_eq!(t.state(), EntityState::Loaded);
    assert_eq!(db.statements(), 1);
}

#[tokio::test]
async fn undeclared_related_type_fails_on_resolution() {
    let owner = define("Orphanage", |m| {
        m.with_columns(["id"]);
        m.has_many_named("kids", "NeverDeclared");
    });
    let db = MockDatabase::new();
    let mut e = Entity::from_row(owner, row(json!({"id": 1})));
    let err = e.related(&db, "kids").await.unwrap_err();
    assert!(matches!(
        err,
        OrmError::UnknownRelation { ref entity, ref relation } if entity == "NeverDeclared" && relation == "kids"
    ));
    assert!(e.count_related(&db, "kids").await.is_err());
    assert_eq!(db.statements(), 0);
}

#[tokio::test]
async fn self_referencing_cascade_deletes_direct_children_in_bulk() {
    let category = define("CascadeCategory", |m| {
        m.with_table("category").with_columns(["id", "parent_id", "name"]);
        m.has_many_named("children", "CascadeCategory")
            .foreign_key("parent_id")
            .cascade_delete();
    });
    let db = MockDatabase::new();
    let mut root = Entity::from_row(category, row(json!({"id": 1, "parent_id": null, "name": "root"})));
    root.delete(&db).await.unwrap();

    let log = db.executed();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].sql, r#"DELETE FROM "category" WHERE "parent_id" = $1"#);
    assert_eq!(log[0].params, vec![json!(1)]);
    assert_eq!(log[1].sql, r#"DELETE FROM "category" WHERE "id" = $1"#);
}
