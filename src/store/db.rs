// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Postgres connection pool wrapper
//!
//! Instances of [Db] can be cloned to share access to the same pool. The
//! pool is sized for a small, bounded number of concurrent short
//! transactions; nothing in the relay holds a connection across an await
//! point longer than one insert or status update.

use anyhow::anyhow;
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncConnection, AsyncPgConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tracing::info;
use url::Url;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Clone)]
pub struct Db {
    pool: Pool<AsyncPgConnection>,
    database_url: String,
}

// Wrapper struct over the pooled connection type so callers never name the
// underlying pool types.
pub struct Connection<'a>(PooledConnection<'a, AsyncPgConnection>);

impl Db {
    /// Construct a new connection pool talking to the database at
    /// `database_url`.
    pub async fn connect(
        database_url: &Url,
        pool_size: u32,
        connection_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url.as_str());
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_timeout(connection_timeout)
            .build(manager)
            .await?;
        Ok(Self {
            pool,
            database_url: database_url.to_string(),
        })
    }

    /// Retrieves a connection from the pool. Fails with a timeout if none
    /// becomes available in time.
    pub async fn connection(&self) -> anyhow::Result<Connection<'_>> {
        Ok(Connection(self.pool.get().await?))
    }

    /// Run the embedded migrations on a dedicated connection.
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        use diesel_migrations::MigrationHarness;

        info!("Running migrations ...");
        let conn = AsyncPgConnection::establish(&self.database_url)
            .await
            .map_err(|e| anyhow!("failed to establish migration connection: {e}"))?;
        let mut wrapper: AsyncConnectionWrapper<AsyncPgConnection> = conn.into();

        tokio::task::spawn_blocking(move || {
            wrapper
                .run_pending_migrations(MIGRATIONS)
                .map(|_| ())
                .map_err(|e| anyhow!("failed to run migrations: {e:?}"))
        })
        .await??;
        info!("Migrations complete.");
        Ok(())
    }
}

impl<'a> Deref for Connection<'a> {
    type Target = PooledConnection<'a, AsyncPgConnection>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Connection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
