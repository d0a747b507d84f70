//! SQLite implementation of the resource store.
//!
//! Tables mirror the abstract schema the controller expects: POPs and
//! links with JSON-valued columns, the per-link free-slot set as rows,
//! interface records addressed by (pop, router, name), and connection
//! records. Every multi-step mutation runs inside one transaction.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument, warn};

use super::{ConnectionRecord, ResourceStore, StoreError};
use crate::domain::{
    unix_now, ConnectionId, ConnectionStatus, InterfaceName, InterfaceState, LinkId, Modulation,
    NetworkLink, PathSegment, PopId, PopNode, RouterId,
};

const CREATE_POPS_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS pops (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        location TEXT,
        routers TEXT NOT NULL DEFAULT '[]',
        interfaces TEXT NOT NULL DEFAULT '[]'
    )
";

const CREATE_LINKS_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS links (
        id TEXT PRIMARY KEY,
        pop_a TEXT NOT NULL,
        pop_b TEXT NOT NULL,
        distance_km REAL NOT NULL,
        total_slots INTEGER NOT NULL,
        occupied_slots TEXT NOT NULL DEFAULT '{}'
    )
";

const CREATE_FREE_SLOTS_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS link_free_slots (
        link_id TEXT NOT NULL,
        slot INTEGER NOT NULL,
        PRIMARY KEY (link_id, slot)
    )
";

const CREATE_INTERFACES_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS interfaces (
        pop TEXT NOT NULL,
        router TEXT NOT NULL,
        name TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'AVAILABLE',
        current_connection TEXT,
        allocated_at REAL,
        released_at REAL,
        PRIMARY KEY (pop, router, name)
    )
";

const CREATE_CONNECTIONS_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS connections (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        source_pop TEXT NOT NULL,
        destination_pop TEXT NOT NULL,
        source_interface TEXT,
        destination_interface TEXT,
        source_router TEXT,
        destination_router TEXT,
        bandwidth_gbps REAL NOT NULL,
        modulation TEXT NOT NULL,
        estimated_osnr REAL,
        path TEXT NOT NULL DEFAULT '[]',
        details TEXT NOT NULL DEFAULT '{}',
        created_at REAL NOT NULL,
        updated_at REAL NOT NULL
    )
";

/// SQLite-backed resource store.
pub struct SqliteResourceStore {
    pool: SqlitePool,
}

impl SqliteResourceStore {
    /// Opens (creating if missing) the database at `url` and initializes
    /// the schema. `timeout` bounds connection acquisition.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|source| StoreError::Database { source })?
            .create_if_missing(true);

        // In-memory databases exist per connection, so the pool must
        // not hand out more than one.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(timeout)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!("resource store ready");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for ddl in [
            CREATE_POPS_TABLE,
            CREATE_LINKS_TABLE,
            CREATE_FREE_SLOTS_TABLE,
            CREATE_INTERFACES_TABLE,
            CREATE_CONNECTIONS_TABLE,
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Closes the underlying pool. Idle after this call.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Loads a topology fixture into the store: POPs, links (with their
    /// free-slot sets seeded to the full range), and interfaces in
    /// AVAILABLE state. Used at provisioning time and by tests.
    #[instrument(skip_all)]
    pub async fn seed_topology(
        &self,
        pops: &[PopNode],
        links: &[NetworkLink],
        interfaces: &[(PopId, RouterId, InterfaceName)],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for pop in pops {
            sqlx::query(
                "INSERT OR REPLACE INTO pops (id, name, location, routers, interfaces) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(pop.id.as_str())
            .bind(&pop.name)
            .bind(pop.location.as_deref())
            .bind(serde_json::to_string(&pop.routers)?)
            .bind(serde_json::to_string(&pop.interfaces)?)
            .execute(&mut *tx)
            .await?;
        }

        for link in links {
            sqlx::query(
                "INSERT OR REPLACE INTO links \
                 (id, pop_a, pop_b, distance_km, total_slots, occupied_slots) \
                 VALUES (?1, ?2, ?3, ?4, ?5, '{}')",
            )
            .bind(link.id.as_str())
            .bind(link.pop_a.as_str())
            .bind(link.pop_b.as_str())
            .bind(link.length_km)
            .bind(i64::from(link.total_slots))
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM link_free_slots WHERE link_id = ?1")
                .bind(link.id.as_str())
                .execute(&mut *tx)
                .await?;
            for slot in 0..link.total_slots {
                sqlx::query("INSERT INTO link_free_slots (link_id, slot) VALUES (?1, ?2)")
                    .bind(link.id.as_str())
                    .bind(i64::from(slot))
                    .execute(&mut *tx)
                    .await?;
            }
        }

        for (pop, router, name) in interfaces {
            sqlx::query(
                "INSERT OR REPLACE INTO interfaces (pop, router, name, status) \
                 VALUES (?1, ?2, ?3, 'AVAILABLE')",
            )
            .bind(pop.as_str())
            .bind(router.as_str())
            .bind(name.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(
            pops = pops.len(),
            links = links.len(),
            interfaces = interfaces.len(),
            "seeded topology"
        );
        Ok(())
    }

    fn parse_occupied(
        link: &LinkId,
        raw: &str,
    ) -> Result<HashMap<String, Vec<u16>>, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
            key: format!("link:{link}"),
            reason: format!("occupied_slots is not a map: {e}"),
        })
    }

    /// Seeds the free-slot rows of a link whose set was never written:
    /// such a link reads as entirely free.
    async fn ensure_slots_seeded(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        link: &LinkId,
        total_slots: u16,
        occupied: &HashMap<String, Vec<u16>>,
    ) -> Result<(), StoreError> {
        let free_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM link_free_slots WHERE link_id = ?1")
                .bind(link.as_str())
                .fetch_one(&mut **tx)
                .await?;

        if free_count == 0 && occupied.is_empty() {
            debug!(link = %link, "free-slot set absent, defaulting to full range");
            for slot in 0..total_slots {
                sqlx::query("INSERT INTO link_free_slots (link_id, slot) VALUES (?1, ?2)")
                    .bind(link.as_str())
                    .bind(i64::from(slot))
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Ok(())
    }

    fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ConnectionRecord, StoreError> {
        let id: String = row.get("id");
        let key = format!("connection:{id}");

        let status: String = row.get("status");
        let status = ConnectionStatus::from_str(&status).map_err(|reason| StoreError::Corrupt {
            key: key.clone(),
            reason,
        })?;

        let modulation: String = row.get("modulation");
        let modulation =
            Modulation::from_str(&modulation).map_err(|reason| StoreError::Corrupt {
                key: key.clone(),
                reason,
            })?;

        let path_json: String = row.get("path");
        let path: Vec<PathSegment> =
            serde_json::from_str(&path_json).map_err(|e| StoreError::Corrupt {
                key: key.clone(),
                reason: format!("path is not a segment list: {e}"),
            })?;

        let details_json: String = row.get("details");
        let details = serde_json::from_str(&details_json).map_err(|e| StoreError::Corrupt {
            key,
            reason: format!("details is not a map: {e}"),
        })?;

        Ok(ConnectionRecord {
            id: ConnectionId::new(id),
            status,
            source_pop: PopId::new(row.get::<String, _>("source_pop")),
            destination_pop: PopId::new(row.get::<String, _>("destination_pop")),
            source_interface: row
                .get::<Option<String>, _>("source_interface")
                .map(InterfaceName::new),
            destination_interface: row
                .get::<Option<String>, _>("destination_interface")
                .map(InterfaceName::new),
            source_router: row
                .get::<Option<String>, _>("source_router")
                .map(RouterId::new),
            destination_router: row
                .get::<Option<String>, _>("destination_router")
                .map(RouterId::new),
            bandwidth_gbps: row.get("bandwidth_gbps"),
            modulation,
            estimated_osnr: row.get("estimated_osnr"),
            path,
            details,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl ResourceStore for SqliteResourceStore {
    #[instrument(skip(self))]
    async fn load_topology(
        &self,
    ) -> Result<(HashMap<PopId, PopNode>, HashMap<LinkId, NetworkLink>), StoreError> {
        let mut pops = HashMap::new();
        for row in sqlx::query("SELECT id, name, location, routers, interfaces FROM pops")
            .fetch_all(&self.pool)
            .await?
        {
            let id: String = row.get("id");
            let routers_json: String = row.get("routers");
            let interfaces_json: String = row.get("interfaces");
            let routers: Vec<RouterId> =
                serde_json::from_str(&routers_json).map_err(|e| StoreError::Corrupt {
                    key: format!("pop:{id}"),
                    reason: format!("routers is not a list: {e}"),
                })?;
            let interfaces: Vec<InterfaceName> =
                serde_json::from_str(&interfaces_json).map_err(|e| StoreError::Corrupt {
                    key: format!("pop:{id}"),
                    reason: format!("interfaces is not a list: {e}"),
                })?;

            let pop = PopNode {
                id: PopId::new(id),
                name: row.get("name"),
                location: row.get("location"),
                routers,
                interfaces,
            };
            pops.insert(pop.id.clone(), pop);
        }

        let mut links = HashMap::new();
        for row in sqlx::query("SELECT id, pop_a, pop_b, distance_km, total_slots FROM links")
            .fetch_all(&self.pool)
            .await?
        {
            let total_slots: i64 = row.get("total_slots");
            let link = NetworkLink {
                id: LinkId::new(row.get::<String, _>("id")),
                pop_a: PopId::new(row.get::<String, _>("pop_a")),
                pop_b: PopId::new(row.get::<String, _>("pop_b")),
                length_km: row.get("distance_km"),
                total_slots: u16::try_from(total_slots).unwrap_or(u16::MAX),
            };
            links.insert(link.id.clone(), link);
        }

        info!(pops = pops.len(), links = links.len(), "loaded topology");
        Ok((pops, links))
    }

    async fn available_interfaces(
        &self,
        pop: &PopId,
        router: &RouterId,
    ) -> Result<Vec<InterfaceName>, StoreError> {
        let rows = sqlx::query(
            "SELECT name FROM interfaces \
             WHERE pop = ?1 AND router = ?2 AND status = 'AVAILABLE' \
               AND (current_connection IS NULL OR current_connection = '') \
             ORDER BY name",
        )
        .bind(pop.as_str())
        .bind(router.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InterfaceName::new(row.get::<String, _>("name")))
            .collect())
    }

    #[instrument(skip(self), fields(pop = %pop, router = %router, name = %name, conn = %conn))]
    async fn allocate_interface(
        &self,
        pop: &PopId,
        router: &RouterId,
        name: &InterfaceName,
        conn: &ConnectionId,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT status, current_connection FROM interfaces \
             WHERE pop = ?1 AND router = ?2 AND name = ?3",
        )
        .bind(pop.as_str())
        .bind(router.as_str())
        .bind(name.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            warn!("interface does not exist");
            return Ok(false);
        };

        let status: String = row.get("status");
        let holder: Option<String> = row.get("current_connection");
        if status != InterfaceState::Available.as_str()
            || holder.as_deref().is_some_and(|h| !h.is_empty())
        {
            debug!("interface is not available");
            return Ok(false);
        }

        sqlx::query(
            "UPDATE interfaces \
             SET status = 'OCCUPIED', current_connection = ?4, allocated_at = ?5 \
             WHERE pop = ?1 AND router = ?2 AND name = ?3",
        )
        .bind(pop.as_str())
        .bind(router.as_str())
        .bind(name.as_str())
        .bind(conn.as_str())
        .bind(unix_now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!("allocated interface");
        Ok(true)
    }

    #[instrument(skip(self), fields(pop = %pop, router = %router, name = %name))]
    async fn release_interface(
        &self,
        pop: &PopId,
        router: &RouterId,
        name: &InterfaceName,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE interfaces \
             SET status = 'AVAILABLE', current_connection = NULL, released_at = ?4 \
             WHERE pop = ?1 AND router = ?2 AND name = ?3",
        )
        .bind(pop.as_str())
        .bind(router.as_str())
        .bind(name.as_str())
        .bind(unix_now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!("interface does not exist");
            return Ok(false);
        }
        info!("released interface");
        Ok(true)
    }

    #[instrument(skip(self, slots), fields(link = %link, conn = %conn, slots = slots.len()))]
    async fn allocate_spectrum_slots(
        &self,
        link: &LinkId,
        conn: &ConnectionId,
        slots: &[u16],
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT total_slots, occupied_slots FROM links WHERE id = ?1")
            .bind(link.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            warn!("link does not exist");
            return Ok(false);
        };

        let total_slots = u16::try_from(row.get::<i64, _>("total_slots")).unwrap_or(u16::MAX);
        let mut occupied = Self::parse_occupied(link, &row.get::<String, _>("occupied_slots"))?;
        Self::ensure_slots_seeded(&mut tx, link, total_slots, &occupied).await?;

        let free: HashSet<u16> =
            sqlx::query("SELECT slot FROM link_free_slots WHERE link_id = ?1")
                .bind(link.as_str())
                .fetch_all(&mut *tx)
                .await?
                .into_iter()
                .map(|row| u16::try_from(row.get::<i64, _>("slot")).unwrap_or(u16::MAX))
                .collect();

        if let Some(taken) = slots.iter().find(|slot| !free.contains(slot)) {
            warn!(slot = taken, "slot is not available, aborting allocation");
            return Ok(false);
        }

        for slot in slots {
            sqlx::query("DELETE FROM link_free_slots WHERE link_id = ?1 AND slot = ?2")
                .bind(link.as_str())
                .bind(i64::from(*slot))
                .execute(&mut *tx)
                .await?;
        }

        occupied.insert(conn.to_string(), slots.to_vec());
        sqlx::query("UPDATE links SET occupied_slots = ?2 WHERE id = ?1")
            .bind(link.as_str())
            .bind(serde_json::to_string(&occupied)?)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(?slots, "allocated spectrum slots");
        Ok(true)
    }

    #[instrument(skip(self), fields(link = %link, conn = %conn))]
    async fn release_spectrum_slots(
        &self,
        link: &LinkId,
        conn: &ConnectionId,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT occupied_slots FROM links WHERE id = ?1")
            .bind(link.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            warn!("link does not exist");
            return Ok(false);
        };

        let mut occupied = Self::parse_occupied(link, &row.get::<String, _>("occupied_slots"))?;
        let Some(released) = occupied.remove(conn.as_str()) else {
            debug!("connection holds no slots on link");
            return Ok(true);
        };

        sqlx::query("UPDATE links SET occupied_slots = ?2 WHERE id = ?1")
            .bind(link.as_str())
            .bind(serde_json::to_string(&occupied)?)
            .execute(&mut *tx)
            .await?;

        for slot in &released {
            sqlx::query("INSERT OR IGNORE INTO link_free_slots (link_id, slot) VALUES (?1, ?2)")
                .bind(link.as_str())
                .bind(i64::from(*slot))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        info!(slots = ?released, "released spectrum slots");
        Ok(true)
    }

    async fn get_available_slots(&self, link: &LinkId) -> Result<Vec<u16>, StoreError> {
        let free: Vec<u16> =
            sqlx::query("SELECT slot FROM link_free_slots WHERE link_id = ?1 ORDER BY slot")
                .bind(link.as_str())
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|row| u16::try_from(row.get::<i64, _>("slot")).unwrap_or(u16::MAX))
                .collect();

        if !free.is_empty() {
            return Ok(free);
        }

        // Distinguish a fully occupied link from one whose set was
        // never seeded: the latter reads as entirely free.
        let row = sqlx::query("SELECT total_slots, occupied_slots FROM links WHERE id = ?1")
            .bind(link.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(Vec::new());
        };
        let occupied = Self::parse_occupied(link, &row.get::<String, _>("occupied_slots"))?;
        if occupied.is_empty() {
            let total = u16::try_from(row.get::<i64, _>("total_slots")).unwrap_or(u16::MAX);
            return Ok((0..total).collect());
        }
        Ok(Vec::new())
    }

    #[instrument(skip(self, record), fields(conn = %record.id))]
    async fn create_connection_record(&self, record: &ConnectionRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO connections \
             (id, status, source_pop, destination_pop, source_interface, \
              destination_interface, source_router, destination_router, \
              bandwidth_gbps, modulation, estimated_osnr, path, details, \
              created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        )
        .bind(record.id.as_str())
        .bind(record.status.as_str())
        .bind(record.source_pop.as_str())
        .bind(record.destination_pop.as_str())
        .bind(record.source_interface.as_ref().map(|v| v.as_str()))
        .bind(record.destination_interface.as_ref().map(|v| v.as_str()))
        .bind(record.source_router.as_ref().map(|v| v.as_str()))
        .bind(record.destination_router.as_ref().map(|v| v.as_str()))
        .bind(record.bandwidth_gbps)
        .bind(record.modulation.as_str())
        .bind(record.estimated_osnr)
        .bind(serde_json::to_string(&record.path)?)
        .bind(serde_json::to_string(&record.details)?)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        info!("created connection record");
        Ok(())
    }

    #[instrument(skip(self, details), fields(conn = %conn, status = status.as_str()))]
    async fn update_connection_status(
        &self,
        conn: &ConnectionId,
        status: ConnectionStatus,
        details: Option<serde_json::Value>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT details FROM connections WHERE id = ?1")
            .bind(conn.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            warn!("connection record does not exist");
            return Ok(false);
        };

        let mut merged: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&row.get::<String, _>("details")).unwrap_or_default();
        if let Some(serde_json::Value::Object(extra)) = details {
            merged.extend(extra);
        }

        sqlx::query(
            "UPDATE connections SET status = ?2, details = ?3, updated_at = ?4 WHERE id = ?1",
        )
        .bind(conn.as_str())
        .bind(status.as_str())
        .bind(serde_json::to_string(&merged)?)
        .bind(unix_now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("updated connection status");
        Ok(true)
    }

    #[instrument(skip(self), fields(conn = %conn))]
    async fn delete_connection_record(&self, conn: &ConnectionId) -> Result<bool, StoreError> {
        sqlx::query("DELETE FROM connections WHERE id = ?1")
            .bind(conn.as_str())
            .execute(&self.pool)
            .await?;
        info!("deleted connection record");
        Ok(true)
    }

    async fn load_connections(&self) -> Result<Vec<ConnectionRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM connections ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn health_check(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}
