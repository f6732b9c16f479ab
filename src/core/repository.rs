//! Persistent store for nodes and cluster bootstrap records.
//!
//! The executor depends on per-call atomicity only: each trait method is
//! a single logical read or write, no multi-call transaction is assumed.

use crate::error::{Error, Result};
use crate::node::{FullNode, NewNode, NodeAuth};
use rusqlite::{Connection, OptionalExtension, Row};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Mutex;

pub const DEFAULT_CLUSTER_ID: i64 = 1;

/// Credentials a worker needs to authenticate to an existing control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapCredentials {
    pub token: String,
    pub endpoint: String,
    pub ca_cert_hash: String,
}

/// Read once per pipeline run; selects the init-vs-join branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapState {
    Unbootstrapped,
    Bootstrapped(BootstrapCredentials),
}

impl BootstrapState {
    pub fn is_bootstrapped(&self) -> bool {
        matches!(self, BootstrapState::Bootstrapped(_))
    }
}

pub trait Repository: Send + Sync {
    fn get_nodes(&self) -> Result<Vec<FullNode>>;
    fn get_full_node(&self, id: i64) -> Result<FullNode>;
    fn add_node(&self, node: &NewNode) -> Result<i64>;
    fn remove_node(&self, id: i64) -> Result<()>;
    fn find_node_by_addr(&self, ip: IpAddr) -> Result<Option<i64>>;
    fn set_node_cluster(&self, id: i64, cluster_id: i64, control_plane: bool) -> Result<()>;
    fn reset_node_cluster(&self, id: i64) -> Result<()>;

    fn cluster_bootstrap(&self, cluster_id: i64) -> Result<BootstrapState>;
    fn set_cluster_bootstrap(&self, cluster_id: i64, creds: &BootstrapCredentials) -> Result<()>;
    fn clear_cluster_bootstrap(&self, cluster_id: i64) -> Result<()>;
}

// ============================================================================
// SQLite implementation
// ============================================================================

pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS clusters (
                id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE,
                endpoint TEXT NOT NULL DEFAULT '',
                token TEXT NOT NULL DEFAULT '',
                ca_cert_hash TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS nodes (
                id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                ip TEXT NOT NULL,
                port INTEGER NOT NULL,
                login TEXT NOT NULL,
                password TEXT,
                identity_file TEXT,
                cluster_id INTEGER NOT NULL DEFAULT 0,
                is_control_plane INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        // The default cluster exists from first start.
        conn.execute(
            "INSERT OR IGNORE INTO clusters (id, name) VALUES (?1, 'default')",
            [DEFAULT_CLUSTER_ID],
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("repository lock poisoned")
    }
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, u16, String, Option<String>, Option<String>, i64, bool)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn build_node(
    raw: (i64, String, String, u16, String, Option<String>, Option<String>, i64, bool),
) -> Result<FullNode> {
    let (id, name, ip, port, login, password, identity_file, cluster_id, is_control_plane) = raw;
    let ip: IpAddr = ip
        .parse()
        .map_err(|e| Error::Parse(format!("invalid node address in store: {}", e)))?;
    let auth = match (password, identity_file) {
        (Some(password), _) => NodeAuth::Password(password),
        (None, Some(path)) => NodeAuth::IdentityFile(path),
        (None, None) => {
            return Err(Error::Parse(format!("node {} has no stored credentials", id)))
        }
    };
    Ok(FullNode {
        id,
        name,
        addr: SocketAddr::new(ip, port),
        login,
        auth,
        cluster_id,
        is_control_plane,
    })
}

const NODE_COLUMNS: &str =
    "id, name, ip, port, login, password, identity_file, cluster_id, is_control_plane";

impl Repository for SqliteRepository {
    fn get_nodes(&self) -> Result<Vec<FullNode>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM nodes ORDER BY id", NODE_COLUMNS))?;
        let rows = stmt.query_map([], node_from_row)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(build_node(row?)?);
        }
        Ok(nodes)
    }

    fn get_full_node(&self, id: i64) -> Result<FullNode> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM nodes WHERE id = ?1", NODE_COLUMNS),
                [id],
                node_from_row,
            )
            .optional()?
            .ok_or(Error::NodeNotFound(id))?;
        build_node(raw)
    }

    fn add_node(&self, node: &NewNode) -> Result<i64> {
        let (password, identity_file) = match &node.auth {
            NodeAuth::Password(password) => (Some(password.as_str()), None),
            NodeAuth::IdentityFile(path) => (None, Some(path.as_str())),
        };
        let conn = self.lock();
        conn.execute(
            "INSERT INTO nodes (name, ip, port, login, password, identity_file) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                node.name,
                node.addr.ip().to_string(),
                node.addr.port(),
                node.login,
                password,
                identity_file,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn remove_node(&self, id: i64) -> Result<()> {
        let changed = self.lock().execute("DELETE FROM nodes WHERE id = ?1", [id])?;
        if changed == 0 {
            return Err(Error::NodeNotFound(id));
        }
        Ok(())
    }

    fn find_node_by_addr(&self, ip: IpAddr) -> Result<Option<i64>> {
        let conn = self.lock();
        let id = conn
            .query_row(
                "SELECT id FROM nodes WHERE ip = ?1 LIMIT 1",
                [ip.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn set_node_cluster(&self, id: i64, cluster_id: i64, control_plane: bool) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE nodes SET cluster_id = ?2, is_control_plane = ?3 WHERE id = ?1",
            rusqlite::params![id, cluster_id, control_plane],
        )?;
        if changed == 0 {
            return Err(Error::NodeNotFound(id));
        }
        Ok(())
    }

    fn reset_node_cluster(&self, id: i64) -> Result<()> {
        self.lock().execute(
            "UPDATE nodes SET cluster_id = 0, is_control_plane = 0 WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    fn cluster_bootstrap(&self, cluster_id: i64) -> Result<BootstrapState> {
        let conn = self.lock();
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT token, endpoint, ca_cert_hash FROM clusters WHERE id = ?1",
                [cluster_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some((token, endpoint, ca_cert_hash))
                if !token.is_empty() && !endpoint.is_empty() && !ca_cert_hash.is_empty() =>
            {
                Ok(BootstrapState::Bootstrapped(BootstrapCredentials {
                    token,
                    endpoint,
                    ca_cert_hash,
                }))
            }
            _ => Ok(BootstrapState::Unbootstrapped),
        }
    }

    fn set_cluster_bootstrap(&self, cluster_id: i64, creds: &BootstrapCredentials) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE clusters SET token = ?2, endpoint = ?3, ca_cert_hash = ?4 WHERE id = ?1",
            rusqlite::params![cluster_id, creds.token, creds.endpoint, creds.ca_cert_hash],
        )?;
        if changed == 0 {
            return Err(Error::Other(format!("cluster {} not found", cluster_id)));
        }
        Ok(())
    }

    fn clear_cluster_bootstrap(&self, cluster_id: i64) -> Result<()> {
        self.lock().execute(
            "UPDATE clusters SET token = '', endpoint = '', ca_cert_hash = '' WHERE id = ?1",
            [cluster_id],
        )?;
        Ok(())
    }
}
