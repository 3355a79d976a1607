use crate::persistence::errors::DbError;
use crate::persistence::schema::apply_schema;
use libsql::{Builder, Connection, Database};
use std::sync::Arc;
use tracing::{info, instrument};

/// Wraps a libsql `Database`, supporting both an embedded file/`:memory:`
/// store and a hosted libSQL server behind one connection type (§9:
/// "pick one abstraction at the boundary rather than branching per call
/// site").
#[derive(Clone)]
pub struct DbClient {
    database: Arc<Database>,
    /// A fresh `:memory:` connection is a private, empty database, not a
    /// handle onto shared state, so `:memory:` mode hands out clones of
    /// this one connection instead of opening a new one per call.
    memory_anchor: Option<Connection>,
}

impl DbClient {
    #[instrument(skip(auth_token))]
    pub async fn connect(database_url: &str, auth_token: Option<String>) -> Result<Self, DbError> {
        if database_url.is_empty() {
            return Err(DbError::Configuration("DATABASE_URL is empty".into()));
        }

        let is_remote = database_url.starts_with("libsql://") || database_url.starts_with("https://");
        let is_memory = database_url.contains(":memory:");

        info!(%database_url, is_remote, "connecting to database");

        let database = if is_remote {
            let token = auth_token
                .ok_or_else(|| DbError::Configuration("remote database requires an auth token".into()))?;
            Builder::new_remote(database_url.to_string(), token).build().await
        } else {
            Builder::new_local(database_url).build().await
        }
        .map_err(|e| DbError::Connection(e.to_string()))?;

        let database = Arc::new(database);
        let memory_anchor = if is_memory {
            let anchor = database.connect().map_err(|e| DbError::Connection(e.to_string()))?;
            apply_schema(&anchor).await.map_err(|e| DbError::Connection(e.to_string()))?;
            Some(anchor)
        } else {
            let bootstrap = database.connect().map_err(|e| DbError::Connection(e.to_string()))?;
            apply_schema(&bootstrap).await.map_err(|e| DbError::Connection(e.to_string()))?;
            None
        };

        Ok(Self { database, memory_anchor })
    }

    pub fn connection(&self) -> Result<Connection, DbError> {
        match &self.memory_anchor {
            Some(anchor) => Ok(anchor.clone()),
            None => self.database.connect().map_err(|e| DbError::Connection(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_connections_see_each_others_writes() {
        let client = DbClient::connect(":memory:", None).await.unwrap();
        let conn = client.connection().unwrap();
        conn.execute("INSERT INTO aggregated_hosts (id, node_id, name, location, primary_mac, secondary_macs, ip, status, last_seen_at, discovered, ping_responsive, notes, tags, power_control, open_ports, port_scanned_at, port_scan_expire_at) VALUES ('h1','n1','desktop','lab','AA:BB:CC:DD:EE:FF','[]',NULL,'asleep','2026-01-01T00:00:00Z',1,NULL,NULL,'[]',NULL,NULL,NULL,NULL)", ()).await.unwrap();

        let conn2 = client.connection().unwrap();
        let mut rows = conn2.query("SELECT id FROM aggregated_hosts WHERE id = 'h1'", ()).await.unwrap();
        assert!(rows.next().await.unwrap().is_some());
    }
}
