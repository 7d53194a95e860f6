use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{Connection, Executor};
use tracing::{debug, info, warn};
use utils::consts::{MYSQL_PORT, OPERATOR_DB_NAME, OPERATOR_STATUS_TABLE};

/// Timeout of opening a connection to a node
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Seconds between two connection attempts of a replica to its master
const MASTER_CONNECT_RETRY: u32 = 1;
/// Status table key written once the node is configured
const CONFIGURED_KEY: &str = "configured";
/// Status table key holding the purged GTID set of the restored backup
const BACKUP_GTID_PURGED_KEY: &str = "backup_gtid_purged";
/// Status table key written once the purged GTID set was applied
const SET_GTID_PURGED_KEY: &str = "set_gtid_purged";

/// Errors of the queries run on a node
#[derive(Debug, thiserror::Error)]
pub(crate) enum SqlError {
    /// Mysql driver error
    #[error("mysql error on {host}: {source}")]
    Driver {
        /// The node
        host: String,
        /// Driver error
        source: sqlx::Error,
    },
    /// The node did not accept the connection in time
    #[error("timeout connecting to {0}")]
    ConnectTimeout(String),
    /// Both ways of starting the replication failed
    #[error("failed to start slave on {host}: {source}")]
    StartSlave {
        /// The node
        host: String,
        /// Error of the fallback sequence
        source: sqlx::Error,
    },
}

/// The operations run on a freshly started mysql node
#[async_trait]
pub(crate) trait NodeSql: Send + Sync {
    /// The node address, as seen by the other nodes
    fn host(&self) -> &str;

    /// Run `SELECT 1`
    async fn ping(&self) -> Result<(), SqlError>;

    /// Whether the node was configured before
    async fn is_configured(&self) -> Result<bool, SqlError>;

    /// Keep the node read only but allow the operator user to write
    async fn disable_super_read_only(&self) -> Result<(), SqlError>;

    /// Forbid writes to every user
    async fn enable_super_read_only(&self) -> Result<(), SqlError>;

    /// Apply the purged GTID set of the backup the node was restored from,
    /// once. Returns whether it was applied by this call
    async fn set_purged_gtid(&self) -> Result<bool, SqlError>;

    /// Replicate from `master_host` and start the replication threads
    async fn change_master_to(&self, master_host: &str, user: &str, password: &str) -> Result<(), SqlError>;

    /// Write the configured flag, the node readiness probe waits for it
    async fn mark_configured(&self) -> Result<(), SqlError>;
}

/// Quote a string literal for the text protocol
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len().saturating_add(2));
    quoted.push('\'');
    for c in value.chars() {
        match c {
            '\'' => quoted.push_str("\\'"),
            '\\' => quoted.push_str("\\\\"),
            '\0' => quoted.push_str("\\0"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            _ => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

/// The replication setup statements
fn change_master_statements(master_host: &str, user: &str, password: &str) -> [String; 2] {
    [
        "STOP SLAVE".to_owned(),
        format!(
            "CHANGE MASTER TO MASTER_AUTO_POSITION=1, MASTER_HOST={}, MASTER_PORT={MYSQL_PORT}, \
             MASTER_USER={}, MASTER_PASSWORD={}, MASTER_CONNECT_RETRY={MASTER_CONNECT_RETRY}",
            quote(master_host),
            quote(user),
            quote(password),
        ),
    ]
}

/// Forget the local binary logs and take the purged set of the backup, the
/// value never leaves the session
fn set_purged_gtid_statements() -> [String; 6] {
    [
        "START TRANSACTION".to_owned(),
        format!(
            "SELECT value INTO @gtid FROM {OPERATOR_DB_NAME}.{OPERATOR_STATUS_TABLE} WHERE name = {}",
            quote(BACKUP_GTID_PURGED_KEY)
        ),
        "RESET MASTER".to_owned(),
        "SET @@GLOBAL.GTID_PURGED = @gtid".to_owned(),
        format!(
            "REPLACE INTO {OPERATOR_DB_NAME}.{OPERATOR_STATUS_TABLE} (name, value) VALUES ({}, @gtid)",
            quote(SET_GTID_PURGED_KEY)
        ),
        "COMMIT".to_owned(),
    ]
}

/// Restart the replication resetting the IO thread, works around
/// <https://bugs.mysql.com/bug.php?id=83713>
const START_SLAVE_FALLBACK: [&str; 5] = [
    "RESET SLAVE",
    "START SLAVE IO_THREAD",
    "STOP SLAVE IO_THREAD",
    "RESET SLAVE",
    "START SLAVE",
];

/// A node reached with the mysql protocol, one connection per operation
pub(crate) struct MysqlNode {
    /// The node address
    host: String,
    /// Connection options
    options: MySqlConnectOptions,
}

impl MysqlNode {
    /// New a node reached at `host` with the operator credentials
    pub(crate) fn new(host: String, user: &str, password: &str) -> Self {
        let options = MySqlConnectOptions::new()
            .host(&host)
            .port(MYSQL_PORT)
            .username(user)
            .password(password);
        Self { host, options }
    }

    /// Wrap a driver error
    fn driver(&self, source: sqlx::Error) -> SqlError {
        SqlError::Driver {
            host: self.host.clone(),
            source,
        }
    }

    /// Open a session with the binary log disabled, the operator writes must
    /// not be replicated
    async fn connect(&self) -> Result<MySqlConnection, SqlError> {
        let mut conn = tokio::time::timeout(CONNECT_TIMEOUT, MySqlConnection::connect_with(&self.options))
            .await
            .map_err(|_elapsed| SqlError::ConnectTimeout(self.host.clone()))?
            .map_err(|err| self.driver(err))?;
        let _done = conn
            .execute("SET @@SESSION.SQL_LOG_BIN = 0")
            .await
            .map_err(|err| self.driver(err))?;
        Ok(conn)
    }

    /// Run `statements` in order on one session
    async fn run(&self, statements: &[&str]) -> Result<(), SqlError> {
        let mut conn = self.connect().await?;
        let result = Self::run_on(&mut conn, statements).await;
        if let Err(err) = conn.close().await {
            debug!(host = self.host.as_str(), "failed to close the connection: {err}");
        }
        result.map_err(|err| self.driver(err))
    }

    /// Run `statements` in order on `conn`
    async fn run_on(conn: &mut MySqlConnection, statements: &[&str]) -> Result<(), sqlx::Error> {
        for statement in statements {
            debug!("running query {statement}");
            let _done = (&mut *conn).execute(*statement).await?;
        }
        Ok(())
    }

    /// Read a value of the operator status table
    async fn read_status(&self, key: &str) -> Result<Option<String>, SqlError> {
        let mut conn = self.connect().await?;
        let query = format!("SELECT value FROM {OPERATOR_DB_NAME}.{OPERATOR_STATUS_TABLE} WHERE name = ?");
        let value = sqlx::query_scalar::<_, String>(&query)
            .bind(key)
            .fetch_optional(&mut conn)
            .await
            .map_err(|err| self.driver(err));
        if let Err(err) = conn.close().await {
            debug!(host = self.host.as_str(), "failed to close the connection: {err}");
        }
        value
    }

    /// Write a value of the operator status table
    async fn write_status(&self, key: &str, value: &str) -> Result<(), SqlError> {
        let statement = format!(
            "REPLACE INTO {OPERATOR_DB_NAME}.{OPERATOR_STATUS_TABLE} (name, value) VALUES ({}, {})",
            quote(key),
            quote(value)
        );
        self.run(&[&statement]).await
    }
}

#[async_trait]
impl NodeSql for MysqlNode {
    fn host(&self) -> &str {
        &self.host
    }

    async fn ping(&self) -> Result<(), SqlError> {
        self.run(&["SELECT 1"]).await
    }

    async fn is_configured(&self) -> Result<bool, SqlError> {
        Ok(self.read_status(CONFIGURED_KEY).await?.as_deref() == Some("1"))
    }

    async fn disable_super_read_only(&self) -> Result<(), SqlError> {
        self.run(&["SET GLOBAL READ_ONLY = 1", "SET GLOBAL SUPER_READ_ONLY = 0"])
            .await
    }

    async fn enable_super_read_only(&self) -> Result<(), SqlError> {
        self.run(&["SET GLOBAL SUPER_READ_ONLY = 1"]).await
    }

    async fn set_purged_gtid(&self) -> Result<bool, SqlError> {
        if let Some(applied) = self.read_status(SET_GTID_PURGED_KEY).await?.filter(|v| !v.is_empty()) {
            debug!(host = self.host.as_str(), gtid_purged = applied.as_str(), "gtid purged was already set");
            return Ok(false);
        }
        let backup_gtid = self.read_status(BACKUP_GTID_PURGED_KEY).await?;
        if !backup_gtid.is_some_and(|v| !v.is_empty()) {
            debug!(host = self.host.as_str(), "no gtid purged to set");
            return Ok(false);
        }
        info!(host = self.host.as_str(), "setting gtid purged from the backup");
        let statements = set_purged_gtid_statements();
        let statements: Vec<&str> = statements.iter().map(String::as_str).collect();
        self.run(&statements).await?;
        Ok(true)
    }

    async fn change_master_to(&self, master_host: &str, user: &str, password: &str) -> Result<(), SqlError> {
        let [stop, change] = change_master_statements(master_host, user, password);
        self.run(&[&stop, &change]).await?;
        let Err(err) = self.run(&["START SLAVE"]).await else {
            return Ok(());
        };
        info!(host = self.host.as_str(), "failed to start slave ({err}), trying the IO thread reset");
        let mut conn = self.connect().await?;
        let result = Self::run_on(&mut conn, &START_SLAVE_FALLBACK).await;
        if let Err(close_err) = conn.close().await {
            warn!(host = self.host.as_str(), "failed to close the connection: {close_err}");
        }
        result.map_err(|source| SqlError::StartSlave {
            host: self.host.clone(),
            source,
        })
    }

    async fn mark_configured(&self) -> Result<(), SqlError> {
        self.write_status(CONFIGURED_KEY, "1").await
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// A node recording the operations run on it
    #[derive(Default)]
    pub(crate) struct FakeNode {
        /// The node address
        pub(crate) host: String,
        /// Pings failing before the node is up
        pub(crate) failing_pings: AtomicUsize,
        /// Whether the node was configured before
        pub(crate) configured: bool,
        /// Whether changing the master fails
        pub(crate) change_master_fails: bool,
        /// Purged GTID set of the restored backup, if any
        pub(crate) backup_gtid_purged: Option<String>,
        /// Operations run, in order
        pub(crate) calls: Mutex<Vec<String>>,
    }

    impl FakeNode {
        /// A fresh node at `host`
        pub(crate) fn new(host: &str) -> Self {
            Self {
                host: host.to_owned(),
                ..Self::default()
            }
        }

        /// Record an operation
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        /// The operations run, without the pings
        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| *c != "ping")
                .cloned()
                .collect()
        }

        /// Number of pings
        pub(crate) fn pings(&self) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| *c == "ping").count()
        }
    }

    #[async_trait]
    impl NodeSql for FakeNode {
        fn host(&self) -> &str {
            &self.host
        }

        async fn ping(&self) -> Result<(), SqlError> {
            self.record("ping".to_owned());
            let failing = self.failing_pings.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_pings.store(failing - 1, Ordering::SeqCst);
                return Err(SqlError::ConnectTimeout(self.host.clone()));
            }
            Ok(())
        }

        async fn is_configured(&self) -> Result<bool, SqlError> {
            Ok(self.configured)
        }

        async fn disable_super_read_only(&self) -> Result<(), SqlError> {
            self.record("disable_super_read_only".to_owned());
            Ok(())
        }

        async fn enable_super_read_only(&self) -> Result<(), SqlError> {
            self.record("enable_super_read_only".to_owned());
            Ok(())
        }

        async fn set_purged_gtid(&self) -> Result<bool, SqlError> {
            let Some(ref gtid) = self.backup_gtid_purged else {
                return Ok(false);
            };
            self.record(format!("set_purged_gtid {gtid}"));
            Ok(true)
        }

        async fn change_master_to(&self, master_host: &str, user: &str, _password: &str) -> Result<(), SqlError> {
            self.record(format!("change_master_to {master_host} {user}"));
            if self.change_master_fails {
                return Err(SqlError::StartSlave {
                    host: self.host.clone(),
                    source: sqlx::Error::PoolClosed,
                });
            }
            Ok(())
        }

        async fn mark_configured(&self) -> Result<(), SqlError> {
            self.record("mark_configured".to_owned());
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn literals_are_escaped() {
        assert_eq!(quote("repl"), "'repl'");
        assert_eq!(quote("it's"), "'it\\'s'");
        assert_eq!(quote("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn change_master_uses_auto_position() {
        let [stop, change] = change_master_statements("foo-mysql-0.mysql.default", "repl", "p'w");
        assert_eq!(stop, "STOP SLAVE");
        assert!(change.starts_with("CHANGE MASTER TO MASTER_AUTO_POSITION=1"));
        assert!(change.contains("MASTER_HOST='foo-mysql-0.mysql.default'"));
        assert!(change.contains("MASTER_PORT=3306"));
        assert!(change.contains("MASTER_PASSWORD='p\\'w'"));
        assert!(change.contains("MASTER_CONNECT_RETRY=1"));
    }

    #[test]
    fn gtid_purged_is_set_in_one_transaction() {
        let statements = set_purged_gtid_statements();
        assert_eq!(statements[0], "START TRANSACTION");
        assert_eq!(
            statements[1],
            "SELECT value INTO @gtid FROM sys_operator.status WHERE name = 'backup_gtid_purged'"
        );
        assert_eq!(statements[2], "RESET MASTER");
        assert_eq!(statements[3], "SET @@GLOBAL.GTID_PURGED = @gtid");
        assert!(statements[4].ends_with("VALUES ('set_gtid_purged', @gtid)"));
        assert_eq!(statements[5], "COMMIT");
    }
}
