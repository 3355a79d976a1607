use crate::persistence::client::DbClient;
use crate::persistence::errors::DbError;
use chrono::Utc;
use cnc_models::host::{Host, HostStatus, OpenPort, PortScanSnapshot, PowerControlMetadata};
use libsql::{params, Row};
use std::collections::BTreeSet;
use tracing::instrument;
use uuid::Uuid;

/// Owns all reads/writes against `aggregated_hosts`. The host aggregator
/// is the only caller; every other component sees value snapshots (§3
/// Ownership).
pub struct HostRepository {
    db: DbClient,
}

impl HostRepository {
    pub fn new(db: DbClient) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn find_by_node_and_macs(&self, node_id: &str, macs: &BTreeSet<String>) -> Result<Vec<Host>, DbError> {
        let rows = self.list_by_node(node_id).await?;
        Ok(rows.into_iter().filter(|h| h.all_macs().any(|m| macs.contains(m))).collect())
    }

    #[instrument(skip(self))]
    pub async fn find_by_node_and_name(&self, node_id: &str, name: &str) -> Result<Option<Host>, DbError> {
        let conn = self.db.connection()?;
        let mut rows = conn
            .query("SELECT * FROM aggregated_hosts WHERE node_id = ?1 AND name = ?2", params![node_id, name])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_host(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    pub async fn list_by_node(&self, node_id: &str) -> Result<Vec<Host>, DbError> {
        let conn = self.db.connection()?;
        let mut rows = conn.query("SELECT * FROM aggregated_hosts WHERE node_id = ?1", params![node_id]).await?;
        let mut hosts = Vec::new();
        while let Some(row) = rows.next().await? {
            hosts.push(row_to_host(&row)?);
        }
        Ok(hosts)
    }

    #[instrument(skip(self))]
    pub async fn list_all(&self) -> Result<Vec<Host>, DbError> {
        let conn = self.db.connection()?;
        let mut rows = conn.query("SELECT * FROM aggregated_hosts", ()).await?;
        let mut hosts = Vec::new();
        while let Some(row) = rows.next().await? {
            hosts.push(row_to_host(&row)?);
        }
        Ok(hosts)
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> Result<Option<Host>, DbError> {
        let conn = self.db.connection()?;
        let mut rows = conn.query("SELECT * FROM aggregated_hosts WHERE id = ?1", params![id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_host(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, host))]
    pub async fn upsert(&self, host: &Host) -> Result<(), DbError> {
        let conn = self.db.connection()?;
        conn.execute(
            r#"
            INSERT INTO aggregated_hosts (
                id, node_id, name, location, primary_mac, secondary_macs, ip, status,
                last_seen_at, discovered, ping_responsive, notes, tags, power_control,
                open_ports, port_scanned_at, port_scan_expire_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ON CONFLICT(id) DO UPDATE SET
                node_id = excluded.node_id,
                name = excluded.name,
                location = excluded.location,
                primary_mac = excluded.primary_mac,
                secondary_macs = excluded.secondary_macs,
                ip = excluded.ip,
                status = excluded.status,
                last_seen_at = excluded.last_seen_at,
                discovered = excluded.discovered,
                ping_responsive = excluded.ping_responsive,
                notes = excluded.notes,
                tags = excluded.tags,
                power_control = excluded.power_control,
                open_ports = excluded.open_ports,
                port_scanned_at = excluded.port_scanned_at,
                port_scan_expire_at = excluded.port_scan_expire_at
            "#,
            params![
                host.id.clone(),
                host.node_id.clone(),
                host.name.clone(),
                host.location.clone(),
                host.primary_mac.clone(),
                serde_json::to_string(&host.secondary_macs).map_err(|e| DbError::Mapping(e.to_string()))?,
                host.ip.clone(),
                status_str(host.status).to_string(),
                host.last_seen_at.to_rfc3339(),
                host.discovered as i64,
                host.ping_responsive.map(|b| b as i64),
                host.notes.clone(),
                serde_json::to_string(&host.tags).map_err(|e| DbError::Mapping(e.to_string()))?,
                host.power_control.as_ref().map(serde_json::to_string).transpose().map_err(|e| DbError::Mapping(e.to_string()))?,
                host.port_scan.as_ref().map(|p| serde_json::to_string(&p.open_ports)).transpose().map_err(|e| DbError::Mapping(e.to_string()))?,
                host.port_scan.as_ref().map(|p| p.scanned_at.to_rfc3339()),
                host.port_scan.as_ref().map(|p| p.expire_at.to_rfc3339()),
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<(), DbError> {
        let conn = self.db.connection()?;
        conn.execute("DELETE FROM aggregated_hosts WHERE id = ?1", params![id]).await?;
        Ok(())
    }

    /// Deletes every row on `node_id` sharing `mac` in either primary or
    /// secondary position, except `keep_id` (§4.3 reconciliation collapse).
    #[instrument(skip(self))]
    pub async fn delete_other_rows_sharing_mac(&self, node_id: &str, mac: &str, keep_id: &str) -> Result<u64, DbError> {
        let candidates = self.list_by_node(node_id).await?;
        let mut deleted = 0;
        for host in candidates {
            if host.id != keep_id && host.all_macs().any(|m| m == mac) {
                self.delete(&host.id).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    #[instrument(skip(self))]
    pub async fn delete_by_node_and_name(&self, node_id: &str, name: &str) -> Result<Option<Host>, DbError> {
        if let Some(host) = self.find_by_node_and_name(node_id, name).await? {
            self.delete(&host.id).await?;
            return Ok(Some(host));
        }
        Ok(None)
    }

    /// Flips every awake host of `node_id` to asleep, returning the hosts
    /// that actually changed so the caller can write history rows.
    #[instrument(skip(self))]
    pub async fn mark_node_hosts_unreachable(&self, node_id: &str) -> Result<Vec<Host>, DbError> {
        let hosts = self.list_by_node(node_id).await?;
        let mut transitioned = Vec::new();
        for mut host in hosts.into_iter().filter(|h| h.status == HostStatus::Awake) {
            host.status = HostStatus::Asleep;
            self.upsert(&host).await?;
            transitioned.push(host);
        }
        Ok(transitioned)
    }

    #[instrument(skip(self))]
    pub async fn save_port_scan_snapshot(&self, id: &str, snapshot: &PortScanSnapshot) -> Result<(), DbError> {
        let conn = self.db.connection()?;
        conn.execute(
            "UPDATE aggregated_hosts SET open_ports = ?1, port_scanned_at = ?2, port_scan_expire_at = ?3 WHERE id = ?4",
            params![
                serde_json::to_string(&snapshot.open_ports).map_err(|e| DbError::Mapping(e.to_string()))?,
                snapshot.scanned_at.to_rfc3339(),
                snapshot.expire_at.to_rfc3339(),
                id,
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stats(&self) -> Result<cnc_models::host::HostStats, DbError> {
        let conn = self.db.connection()?;
        let mut rows = conn.query("SELECT location, status FROM aggregated_hosts", ()).await?;
        let mut stats = cnc_models::host::HostStats { total: 0, awake: 0, asleep: 0, by_location: Default::default() };
        while let Some(row) = rows.next().await? {
            let location: String = row.get(0)?;
            let status: String = row.get(1)?;
            stats.total += 1;
            let entry = stats.by_location.entry(location).or_default();
            entry.total += 1;
            if status == "awake" {
                stats.awake += 1;
                entry.awake += 1;
            } else {
                stats.asleep += 1;
            }
        }
        Ok(stats)
    }
}

fn status_str(status: HostStatus) -> &'static str {
    match status {
        HostStatus::Awake => "awake",
        HostStatus::Asleep => "asleep",
    }
}

fn row_to_host(row: &Row) -> Result<Host, DbError> {
    let secondary_macs_raw: String = row.get(5)?;
    let status_raw: String = row.get(7)?;
    let tags_raw: String = row.get(12)?;
    let power_control_raw: Option<String> = row.get(13)?;
    let open_ports_raw: Option<String> = row.get(14)?;
    let port_scanned_at_raw: Option<String> = row.get(15)?;
    let port_scan_expire_at_raw: Option<String> = row.get(16)?;

    let secondary_macs: BTreeSet<String> = serde_json::from_str(&secondary_macs_raw).unwrap_or_default();
    let tags: Vec<String> = serde_json::from_str(&tags_raw).unwrap_or_default();
    let power_control: Option<PowerControlMetadata> =
        power_control_raw.and_then(|raw| serde_json::from_str(&raw).ok());

    let port_scan = match (open_ports_raw, port_scanned_at_raw, port_scan_expire_at_raw) {
        (Some(open_ports_raw), Some(scanned_at), Some(expire_at)) => {
            let open_ports: Vec<OpenPort> = serde_json::from_str(&open_ports_raw).unwrap_or_default();
            Some(PortScanSnapshot {
                open_ports,
                scanned_at: chrono::DateTime::parse_from_rfc3339(&scanned_at)
                    .map_err(|e| DbError::Mapping(e.to_string()))?
                    .with_timezone(&Utc),
                expire_at: chrono::DateTime::parse_from_rfc3339(&expire_at)
                    .map_err(|e| DbError::Mapping(e.to_string()))?
                    .with_timezone(&Utc),
            })
        }
        _ => None,
    };

    let ping_responsive_raw: Option<i64> = row.get(10)?;
    let discovered_raw: i64 = row.get(9)?;

    Ok(Host {
        id: row.get(0)?,
        node_id: row.get(1)?,
        name: row.get(2)?,
        location: row.get(3)?,
        primary_mac: row.get(4)?,
        secondary_macs,
        ip: row.get(6)?,
        status: if status_raw == "awake" { HostStatus::Awake } else { HostStatus::Asleep },
        last_seen_at: parse_ts(row.get(8)?)?,
        discovered: discovered_raw != 0,
        ping_responsive: ping_responsive_raw.map(|v| v != 0),
        notes: row.get(11)?,
        tags,
        power_control,
        port_scan,
    })
}

fn parse_ts(raw: String) -> Result<chrono::DateTime<Utc>, DbError> {
    chrono::DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::Mapping(e.to_string()))
}

pub fn new_host_id() -> String {
    Uuid::new_v4().to_string()
}
