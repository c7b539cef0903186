//! Schema versioning.
//!
//! The highest applied version is kept in `schema_migrations`; each newer
//! [`Migration`] runs in its own transaction together with its version row,
//! so a crash mid-migration leaves the previous version intact.

use sqlx::SqlitePool;
use thiserror::Error;

use super::schema::{Migration, MIGRATIONS};

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A statement of the named migration failed.
    #[error("Migration {version} ({name}) failed: {reason}")]
    Failed {
        version: i64,
        name: &'static str,
        reason: String,
    },

    /// The database was written by a newer janitor.
    #[error("Database schema version {found} is newer than the supported version {supported}")]
    TooNew { found: i64, supported: i64 },
}

/// A row of `schema_migrations`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    pub version: i64,
    pub name: String,
    /// Milliseconds since the epoch.
    pub applied_at: i64,
}

/// Applies [`MIGRATIONS`] to a pool.
pub struct MigrationRunner {
    pool: SqlitePool,
}

impl MigrationRunner {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Brings the schema up to the latest version.
    ///
    /// Returns the number of migrations applied by this call.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        let current = self.current_version().await?;
        let supported = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);
        if current > supported {
            return Err(MigrationError::TooNew {
                found: current,
                supported,
            });
        }

        let mut applied = 0;
        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            self.apply(migration).await?;
            tracing::debug!(
                version = migration.version,
                name = migration.name,
                "Applied migration"
            );
            applied += 1;
        }

        Ok(applied)
    }

    /// Returns the highest applied version, 0 for an empty database.
    pub async fn current_version(&self) -> Result<i64, MigrationError> {
        self.ensure_version_table().await?;
        let (version,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(version) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await?;
        Ok(version.unwrap_or(0))
    }

    /// Lists applied migrations, oldest first.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_version_table().await?;
        let rows = sqlx::query_as(
            "SELECT version, name, applied_at FROM schema_migrations ORDER BY version",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn ensure_version_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply(&self, migration: &Migration) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;

        for statement in migration.statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| MigrationError::Failed {
                    version: migration.version,
                    name: migration.name,
                    reason: e.to_string(),
                })?;
        }

        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(migration.version)
            .bind(migration.name)
            .bind(chrono::Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let runner = MigrationRunner::new(db.pool().clone());

        assert_eq!(runner.run_migrations().await.unwrap(), MIGRATIONS.len());
        assert_eq!(runner.run_migrations().await.unwrap(), 0);

        let applied = runner.applied().await.unwrap();
        let names: Vec<&str> = applied.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["pipeline_state", "publishing", "audit_log"]);
        assert_eq!(runner.current_version().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_newer_schema_is_rejected() {
        let db = Database::in_memory().await.unwrap();
        let runner = MigrationRunner::new(db.pool().clone());
        runner.run_migrations().await.unwrap();

        sqlx::query(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (99, 'future', 0)",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let err = runner.run_migrations().await.unwrap_err();
        assert!(matches!(err, MigrationError::TooNew { found: 99, .. }));
    }
}
