//! SQLite registry backend
//!
//! Applications, their hostnames and their live instances live in three
//! tables. Instance appends and removals are single statements, so each one
//! is atomic even when several router nodes share the database file.

use super::{Application, HostBinding, Instance, InstanceMatch, LaunchSpec, Registry, TlsPolicy};
use crate::error::RegistryError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// How long a writer waits on a database locked by another node
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl ToSql for TlsPolicy {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TlsPolicy {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        TlsPolicy::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown ssl policy '{}'", s).into()))
    }
}

/// Registry stored in a SQLite database.
///
/// Trait operations run on the blocking pool; a database locked by another
/// node never stalls the runtime.
pub struct SqliteRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRegistry {
    /// Open or create a registry database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        registry.run_migrations()?;

        info!(path = %path.display(), "Registry database opened");
        Ok(registry)
    }

    /// Open an in-memory registry (for testing)
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        registry.run_migrations()?;
        Ok(registry)
    }

    fn run_migrations(&self) -> Result<(), RegistryError> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        if current_version < SCHEMA_VERSION {
            info!(from = current_version, to = SCHEMA_VERSION, "Running registry migrations");
            if current_version < 1 {
                migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Insert or replace an application record, keeping its recorded instances
    pub fn put_application(&self, app: &Application) -> Result<(), RegistryError> {
        store_application(&mut self.conn.lock(), app)
    }

    pub fn get_application(&self, app_id: &str) -> Result<Option<Application>, RegistryError> {
        let conn = self.conn.lock();
        load_application(&conn, app_id)
    }

    /// Run `op` with the connection on the blocking pool
    async fn run_blocking<T, F>(&self, op: F) -> Result<T, RegistryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, RegistryError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || op(&mut conn.lock()))
            .await
            .map_err(|e| RegistryError::Task(e.to_string()))?
    }
}

fn migrate_v1(conn: &Connection) -> Result<(), RegistryError> {
    debug!("Applying registry migration v1: initial schema");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS applications (
            id TEXT PRIMARY KEY,
            max_instances INTEGER NOT NULL,
            executable TEXT NOT NULL,
            args TEXT NOT NULL DEFAULT '[]'
        );

        CREATE TABLE IF NOT EXISTS hosts (
            host TEXT PRIMARY KEY,
            app_id TEXT NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
            ssl TEXT NOT NULL DEFAULT 'none',
            cert TEXT,
            key TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_hosts_app ON hosts(app_id);

        CREATE TABLE IF NOT EXISTS instances (
            app_id TEXT NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
            host TEXT NOT NULL,
            port INTEGER NOT NULL,
            registered_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (app_id, host, port)
        );

        INSERT INTO schema_migrations (version) VALUES (1);
        "#,
    )?;

    Ok(())
}

fn store_application(conn: &mut Connection, app: &Application) -> Result<(), RegistryError> {
    let tx = conn.transaction()?;

    tx.execute(
        "INSERT INTO applications (id, max_instances, executable, args)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
            max_instances = excluded.max_instances,
            executable = excluded.executable,
            args = excluded.args",
        params![
            app.id,
            app.max_instances as i64,
            app.process.executable,
            serde_json::to_string(&app.process.args)?,
        ],
    )?;

    tx.execute("DELETE FROM hosts WHERE app_id = ?1", params![app.id])?;
    for binding in &app.hosts {
        tx.execute(
            "INSERT OR REPLACE INTO hosts (host, app_id, ssl, cert, key) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                binding.host.to_lowercase(),
                app.id,
                binding.ssl,
                binding.cert,
                binding.key
            ],
        )?;
    }

    for machine in &app.machines {
        tx.execute(
            "INSERT OR IGNORE INTO instances (app_id, host, port) VALUES (?1, ?2, ?3)",
            params![app.id, machine.host, machine.port],
        )?;
    }

    tx.commit()?;
    debug!(app_id = %app.id, hosts = app.hosts.len(), "Application record stored");
    Ok(())
}

fn load_application(conn: &Connection, app_id: &str) -> Result<Option<Application>, RegistryError> {
    let row = conn
        .query_row(
            "SELECT max_instances, executable, args FROM applications WHERE id = ?1",
            params![app_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((max_instances, executable, args)) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare("SELECT host, ssl, cert, key FROM hosts WHERE app_id = ?1 ORDER BY host")?;
    let hosts = stmt
        .query_map(params![app_id], |row| {
            Ok(HostBinding {
                host: row.get(0)?,
                ssl: row.get(1)?,
                cert: row.get(2)?,
                key: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT host, port FROM instances WHERE app_id = ?1 ORDER BY registered_at, host, port",
    )?;
    let machines = stmt
        .query_map(params![app_id], |row| {
            Ok(Instance {
                host: row.get(0)?,
                port: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(Application {
        id: app_id.to_string(),
        hosts,
        max_instances: usize::try_from(max_instances).unwrap_or(0),
        process: LaunchSpec {
            executable,
            args: serde_json::from_str(&args)?,
        },
        machines,
    }))
}

#[async_trait]
impl Registry for SqliteRegistry {
    async fn find_by_hostname(&self, hostname: &str) -> Result<Option<Application>, RegistryError> {
        let hostname = hostname.to_lowercase();
        self.run_blocking(move |conn| {
            let app_id: Option<String> = conn
                .query_row("SELECT app_id FROM hosts WHERE host = ?1", params![hostname], |row| {
                    row.get(0)
                })
                .optional()?;

            match app_id {
                Some(id) => load_application(conn, &id),
                None => Ok(None),
            }
        })
        .await
    }

    async fn append_instance(&self, app_id: &str, instance: &Instance) -> Result<(), RegistryError> {
        let app_id = app_id.to_string();
        let instance = instance.clone();
        self.run_blocking(move |conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM applications WHERE id = ?1)",
                params![app_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(RegistryError::UnknownApplication(app_id));
            }

            conn.execute(
                "INSERT OR IGNORE INTO instances (app_id, host, port) VALUES (?1, ?2, ?3)",
                params![app_id, instance.host, instance.port],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove_instance(&self, app_id: &str, target: &InstanceMatch) -> Result<(), RegistryError> {
        let app_id = app_id.to_string();
        let target = target.clone();
        self.run_blocking(move |conn| {
            let removed = match &target {
                InstanceMatch::Endpoint(instance) => conn.execute(
                    "DELETE FROM instances WHERE app_id = ?1 AND host = ?2 AND port = ?3",
                    params![app_id, instance.host, instance.port],
                )?,
                InstanceMatch::Host(host) => conn.execute(
                    "DELETE FROM instances WHERE app_id = ?1 AND host = ?2",
                    params![app_id, host],
                )?,
            };
            debug!(app_id = %app_id, removed, "Instances removed from registry");
            Ok(())
        })
        .await
    }

    async fn tls_applications(&self) -> Result<Vec<Application>, RegistryError> {
        self.run_blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT app_id FROM hosts WHERE ssl IN ('allow', 'require') ORDER BY app_id",
            )?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            drop(stmt);

            let mut apps = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(app) = load_application(conn, &id)? {
                    apps.push(app);
                }
            }
            Ok(apps)
        })
        .await
    }

    async fn seed(&self, apps: &[Application]) -> Result<(), RegistryError> {
        let apps = apps.to_vec();
        self.run_blocking(move |conn| {
            for app in &apps {
                store_application(conn, app)?;
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_app() -> Application {
        let mut secure = HostBinding::new("secure.x.test", TlsPolicy::Require);
        secure.cert = Some("certs/x-cert.pem".into());
        secure.key = Some("certs/x-key.pem".into());

        Application::new(
            "app1",
            vec![HostBinding::new("x.test", TlsPolicy::None), secure],
            2,
            LaunchSpec::new("node").with_args(vec!["server.js".into()]),
        )
    }

    #[tokio::test]
    async fn test_put_and_find_application() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.put_application(&sample_app()).unwrap();

        let app = registry.find_by_hostname("X.TEST").await.unwrap().unwrap();
        assert_eq!(app.id, "app1");
        assert_eq!(app.max_instances, 2);
        assert_eq!(app.process, LaunchSpec::new("node").with_args(vec!["server.js".into()]));
        assert_eq!(app.hosts.len(), 2);
        assert!(app.machines.is_empty());

        assert!(registry.find_by_hostname("other.test").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_and_remove_instances() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.put_application(&sample_app()).unwrap();

        let a = Instance::new("10.0.0.1", 8000);
        let b = Instance::new("10.0.0.1", 8001);
        registry.append_instance("app1", &a).await.unwrap();
        registry.append_instance("app1", &a).await.unwrap();
        registry.append_instance("app1", &b).await.unwrap();

        let app = registry.get_application("app1").unwrap().unwrap();
        assert_eq!(app.machines.len(), 2);

        registry.remove_instance("app1", &a.clone().into()).await.unwrap();
        let app = registry.get_application("app1").unwrap().unwrap();
        assert_eq!(app.machines, vec![b]);

        registry
            .remove_instance("app1", &InstanceMatch::Host("10.0.0.1".into()))
            .await
            .unwrap();
        let app = registry.get_application("app1").unwrap().unwrap();
        assert!(app.machines.is_empty());
    }

    #[tokio::test]
    async fn test_append_to_unknown_application() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let result = registry
            .append_instance("missing", &Instance::new("10.0.0.1", 8000))
            .await;
        assert!(matches!(result, Err(RegistryError::UnknownApplication(_))));
    }

    #[tokio::test]
    async fn test_put_application_keeps_instances() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.put_application(&sample_app()).unwrap();
        registry
            .append_instance("app1", &Instance::new("10.0.0.1", 8000))
            .await
            .unwrap();

        let mut updated = sample_app();
        updated.max_instances = 5;
        updated.hosts.truncate(1);
        registry.put_application(&updated).unwrap();

        let app = registry.get_application("app1").unwrap().unwrap();
        assert_eq!(app.max_instances, 5);
        assert_eq!(app.hosts.len(), 1);
        assert_eq!(app.machines.len(), 1);
        assert!(registry.find_by_hostname("secure.x.test").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tls_applications() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.put_application(&sample_app()).unwrap();
        registry
            .put_application(&Application::new(
                "plain",
                vec![HostBinding::new("plain.test", TlsPolicy::None)],
                1,
                LaunchSpec::new("backend"),
            ))
            .unwrap();

        let apps = registry.tls_applications().await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].id, "app1");
    }

    #[tokio::test]
    async fn test_locked_database_does_not_stall_runtime() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("registry.db");
        let registry = Arc::new(SqliteRegistry::open(&path).unwrap());
        registry.put_application(&sample_app()).unwrap();

        // another node holding the write lock
        let other = Connection::open(&path).unwrap();
        other.execute_batch("BEGIN IMMEDIATE").unwrap();

        let writer = Arc::clone(&registry);
        let append = tokio::spawn(async move {
            writer
                .append_instance("app1", &Instance::new("10.0.0.1", 8000))
                .await
        });

        let start = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(start.elapsed() < Duration::from_millis(500));

        tokio::time::sleep(Duration::from_millis(500)).await;
        other.execute_batch("COMMIT").unwrap();

        append.await.unwrap().unwrap();
        let app = registry.get_application("app1").unwrap().unwrap();
        assert_eq!(app.machines, vec![Instance::new("10.0.0.1", 8000)]);
    }

    #[tokio::test]
    async fn test_seed_upserts_applications() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.seed(&[sample_app()]).await.unwrap();
        registry.seed(&[sample_app()]).await.unwrap();

        let app = registry.find_by_hostname("x.test").await.unwrap().unwrap();
        assert_eq!(app.id, "app1");
    }

    #[test]
    fn test_reopen_runs_migrations_once() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("registry.db");

        SqliteRegistry::open(&path).unwrap().put_application(&sample_app()).unwrap();
        let reopened = SqliteRegistry::open(&path).unwrap();
        assert!(reopened.get_application("app1").unwrap().is_some());
    }
}
