//! Walkthrough: declare two related entities, write them, load them back eagerly and lazily,
//! then tear the relation down.
//!
//! Needs `DATABASE_URL` (a `.env` file works). Run from the repo root:
//! `cargo run -p metaorm-demo`

use metaorm::{Database, Entity, EntityMetadata, LifecycleEvent, Model, OrmConfig, PgDatabase};
use std::ops::{Deref, DerefMut};

struct User(Entity);
struct Address(Entity);

macro_rules! wraps_entity {
    ($t:ident) => {
        impl From<Entity> for $t {
            fn from(e: Entity) -> Self {
                $t(e)
            }
        }
        impl Deref for $t {
            type Target = Entity;
            fn deref(&self) -> &Entity {
                &self.0
            }
        }
        impl DerefMut for $t {
            fn deref_mut(&mut self) -> &mut Entity {
                &mut self.0
            }
        }
    };
}

wraps_entity!(User);
wraps_entity!(Address);

impl Model for User {
    const NAME: &'static str = "User";

    fn declare(meta: &mut EntityMetadata) {
        meta.with_table("demo_user").with_columns(["id", "name", "age"]);
        meta.add_rule("name", "Name", "notEmpty")
            .add_rule("age", "Age", "between(1,120)");
        meta.has_many::<Address>("addresses").cascade_delete();
        meta.on(LifecycleEvent::AfterCreate, |e: &mut Entity| {
            tracing::info!(id = %e.pk(), "user created");
            Ok(())
        });
    }
}

impl Model for Address {
    const NAME: &'static str = "Address";

    fn declare(meta: &mut EntityMetadata) {
        meta.with_table("demo_address").with_columns(["id", "user_id", "addr", "tel"]);
        meta.add_rule("addr", "Address", "notEmpty")
            .add_rule("tel", "Phone", "notEmpty && digit");
        meta.belongs_to::<User>("user");
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS demo_user (id BIGSERIAL PRIMARY KEY, name TEXT NOT NULL, age INT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS demo_address (id BIGSERIAL PRIMARY KEY, user_id BIGINT, addr TEXT NOT NULL, tel TEXT NOT NULL)",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("metaorm=info,metaorm_demo=info")),
        )
        .init();

    let config = OrmConfig::from_env()?;
    let db = PgDatabase::connect(&config).await?;
    for ddl in SCHEMA {
        db.execute(ddl, &[]).await?;
    }

    let mut user = User::blank();
    user.set("name", "shi")?.set("age", 24)?;
    let user_id = user.create(&db).await?;

    for (addr, tel) in [("Guangzhou", "13800000000"), ("Shenzhen", "13900000000")] {
        let mut address = Address::blank();
        address.set("user_id", user_id.clone())?.set("addr", addr)?.set("tel", tel)?;
        address.create(&db).await?;
    }

    // rejected before reaching the database
    let mut invalid = User::blank();
    invalid.set("name", "")?.set("age", 300)?;
    if let Err(e) = invalid.create(&db).await {
        tracing::warn!(body = %serde_json::to_string(&e.to_body())?, "create rejected");
    }

    let users: Vec<User> = User::query_builder()
        .r#where("id", user_id.clone())?
        .with("addresses")?
        .find_all(&db)
        .await?;
    for u in &users {
        tracing::info!(user = %serde_json::to_string(&**u)?, "eager load");
    }

    user.set("age", 25)?;
    user.update(&db).await?;
    tracing::info!(addresses = user.count_related(&db, "addresses").await?, "counted");

    // unlink inside a transaction, then roll it back
    let tx = db.begin().await?;
    let unlinked = user.remove_relations(&tx, "addresses", serde_json::Value::Null).await?;
    tracing::info!(unlinked, "unlinked in transaction");
    tx.rollback().await?;

    // cascades through the addresses
    user.delete(&db).await?;
    let remaining = Address::query_builder()
        .r#where("user_id", user_id)?
        .count(&db)
        .await?;
    tracing::info!(remaining, "deleted with cascade");
    Ok(())
}
