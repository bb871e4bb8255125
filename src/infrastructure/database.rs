//! Pooled Postgres connection

use crate::infrastructure::settings::Settings;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::ops::Deref;

pub struct DatabaseConnection {
    connection: PgPool,
}

impl DatabaseConnection {
    /// Builds the pool without opening a connection; the first query connects.
    pub fn create(settings: &Settings) -> Result<DatabaseConnection, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.db_max_connections)
            .connect_lazy(&settings.database_url)?;

        Ok(DatabaseConnection { connection: pool })
    }

    pub fn from_pool(pool: PgPool) -> DatabaseConnection {
        DatabaseConnection { connection: pool }
    }
}

impl Deref for DatabaseConnection {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}
