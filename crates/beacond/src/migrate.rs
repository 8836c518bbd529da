//! Startup migrations.
//!
//! Embedded SQL applied in order and tracked in `schema_migrations`. The
//! initial migration provisions the sample schema plus the CDC publication
//! and slot, mirroring what the stream client subscribes to.

use tokio_postgres::error::SqlState;
use tokio_postgres::Client;
use tracing::info;

use crate::store::StoreError;

const LEDGER_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    name TEXT PRIMARY KEY,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

/// Apply all unapplied migrations.
pub async fn run(client: &Client, publication: &str, slot: &str) -> Result<(), StoreError> {
    client.batch_execute(LEDGER_TABLE).await?;

    if !is_applied(client, "0001_initial").await? {
        info!(migration = "0001_initial", "applying migration");
        client.batch_execute(&initial_schema(publication)).await?;
        // Slot creation cannot run inside the schema transaction.
        ensure_replication_slot(client, slot).await?;
        record(client, "0001_initial").await?;
    }

    info!("migrations up to date");
    Ok(())
}

async fn is_applied(client: &Client, name: &str) -> Result<bool, StoreError> {
    let row = client
        .query_opt("SELECT 1 FROM schema_migrations WHERE name = $1", &[&name])
        .await?;
    Ok(row.is_some())
}

async fn record(client: &Client, name: &str) -> Result<(), StoreError> {
    client
        .execute("INSERT INTO schema_migrations (name) VALUES ($1)", &[&name])
        .await?;
    Ok(())
}

fn initial_schema(publication: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS users (
    id BIGSERIAL PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    password TEXT,
    role TEXT NOT NULL DEFAULT 'user' CHECK (role IN ('admin', 'user')),
    status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'inactive')),
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS users_email_idx ON users (email);
CREATE INDEX IF NOT EXISTS users_status_idx ON users (status);

INSERT INTO users (email, name, password, role, status)
VALUES (
    'admin@example.com',
    'Admin User',
    '$2b$10$rQZ5kEHQ0Z8t5Xg0QZmzOeM5YX0QZmzOeM5YX0QZmzOeM5YX0Qzm',
    'admin',
    'active'
)
ON CONFLICT (email) DO NOTHING;

DO $$
BEGIN
    IF NOT EXISTS (SELECT 1 FROM pg_publication WHERE pubname = '{publication}') THEN
        EXECUTE 'CREATE PUBLICATION {publication} FOR TABLE users';
    END IF;
END
$$;
"#
    )
}

async fn ensure_replication_slot(client: &Client, slot: &str) -> Result<(), StoreError> {
    let exists: bool = client
        .query_one(
            "SELECT EXISTS (SELECT 1 FROM pg_replication_slots WHERE slot_name = $1)",
            &[&slot],
        )
        .await?
        .get(0);
    if exists {
        return Ok(());
    }

    match client
        .query(
            "SELECT pg_create_logical_replication_slot($1, 'pgoutput')",
            &[&slot],
        )
        .await
    {
        Ok(_) => {
            info!(slot, "created logical replication slot");
            Ok(())
        }
        // Another instance won the race; the slot exists either way.
        Err(e) if e.code() == Some(&SqlState::DUPLICATE_OBJECT) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
