use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identity of a mysql server
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceKey {
    /// Host name
    pub hostname: String,
    /// Mysql port
    pub port: u16,
}

impl InstanceKey {
    /// New an instance key
    #[inline]
    #[must_use]
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

/// A nullable integer as encoded by orchestrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NullInt64 {
    /// The value, meaningless when `valid` is false
    pub int64: i64,
    /// Whether the value is set
    pub valid: bool,
}

impl NullInt64 {
    /// A set value
    #[inline]
    #[must_use]
    pub fn some(value: i64) -> Self {
        Self {
            int64: value,
            valid: true,
        }
    }

    /// The value if set
    #[inline]
    #[must_use]
    pub fn value(self) -> Option<i64> {
        self.valid.then_some(self.int64)
    }
}

/// A snapshot of one mysql server, it may be stale
#[allow(clippy::struct_excessive_bools)] // mirrors the orchestrator payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Instance {
    /// The server identity
    pub key: InstanceKey,
    /// Seconds since the server started
    pub uptime: u64,
    /// Server id
    #[serde(rename = "ServerID")]
    pub server_id: u64,
    /// Whether `read_only` is on
    pub read_only: bool,
    /// The server this one replicates from, empty hostname for a master
    pub master_key: InstanceKey,
    /// A master that was detached from its replicas
    pub is_detached_master: bool,
    /// One of the two masters of a co-master setup
    pub is_co_master: bool,
    /// The SQL thread is running
    #[serde(rename = "Slave_SQL_Running")]
    pub slave_sql_running: bool,
    /// The IO thread is running
    #[serde(rename = "Slave_IO_Running")]
    pub slave_io_running: bool,
    /// Replication lag
    pub seconds_behind_master: NullInt64,
    /// Replication lag measured by the heartbeat
    pub slave_lag_seconds: NullInt64,
    /// The cluster name computed by orchestrator
    pub cluster_name: String,
    /// The alias of the cluster
    pub suggested_cluster_alias: String,
    /// The last check succeeded
    pub is_last_check_valid: bool,
    /// The snapshot is fresh
    pub is_up_to_date: bool,
    /// Last replication SQL error
    #[serde(rename = "LastSQLError")]
    pub last_sql_error: String,
    /// Last replication IO error
    #[serde(rename = "LastIOError")]
    pub last_io_error: String,
}

impl Instance {
    /// Whether the snapshot can be trusted
    #[inline]
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.is_up_to_date && self.is_last_check_valid
    }

    /// Whether both replication threads run
    #[inline]
    #[must_use]
    pub fn is_replicating(&self) -> bool {
        self.slave_io_running && self.slave_sql_running
    }

    /// Whether the instance is a replication root
    #[inline]
    #[must_use]
    pub fn is_master_candidate(&self) -> bool {
        (self.master_key.hostname.is_empty() || self.is_detached_master) && !self.is_co_master
    }
}

/// A failover performed by orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TopologyRecovery {
    /// Recovery id, used to acknowledge it
    pub id: i64,
    /// Unique id
    #[serde(rename = "UID")]
    pub uid: String,
    /// The promoted instance
    pub successor_key: Option<InstanceKey>,
    /// The recovery is still running
    pub is_active: bool,
    /// The recovery succeeded
    pub is_successful: bool,
    /// Errors met during the recovery
    pub all_errors: Vec<String>,
    /// When the recovery started
    pub recovery_start_timestamp: String,
    /// When the recovery ended
    pub recovery_end_timestamp: String,
    /// Whether it was acknowledged
    pub acknowledged: bool,
    /// Who acknowledged it
    pub acknowledged_by: String,
    /// The acknowledgement comment
    pub acknowledged_comment: String,
}

impl TopologyRecovery {
    /// A short description used in condition messages
    #[inline]
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "{{id: {}, uid: {}, success: {}, time: {}}}",
            self.id, self.uid, self.is_successful, self.recovery_start_timestamp
        )
    }
}

/// Pick the master out of an instance list.
///
/// The master is the only instance that replicates from nobody and is not a
/// co-master.
///
/// # Errors
///
/// Return `Error::NoMaster` when no instance qualifies and
/// `Error::MultipleMasters` when more than one does.
#[inline]
pub fn determine_master(instances: &[Instance]) -> Result<&Instance> {
    let mut candidates = instances.iter().filter(|inst| inst.is_master_candidate());
    let Some(master) = candidates.next() else {
        return Err(Error::NoMaster);
    };
    let others: Vec<_> = candidates.map(|inst| inst.key.hostname.clone()).collect();
    if !others.is_empty() {
        let mut hosts = vec![master.key.hostname.clone()];
        hosts.extend(others);
        return Err(Error::MultipleMasters(hosts));
    }
    Ok(master)
}

#[cfg(test)]
mod test {
    use super::*;

    fn instance(host: &str, master: Option<&str>) -> Instance {
        Instance {
            key: InstanceKey::new(host, 3306),
            master_key: master.map(|m| InstanceKey::new(m, 3306)).unwrap_or_default(),
            ..Instance::default()
        }
    }

    #[test]
    fn single_master() {
        let instances = vec![
            instance("h-1", Some("h-0")),
            instance("h-0", None),
            instance("h-2", Some("h-0")),
        ];
        assert_eq!(determine_master(&instances).unwrap().key.hostname, "h-0");
    }

    #[test]
    fn detached_master_is_a_candidate() {
        let mut detached = instance("h-0", Some("old"));
        detached.is_detached_master = true;
        let instances = vec![detached, instance("h-1", Some("h-0"))];
        assert_eq!(determine_master(&instances).unwrap().key.hostname, "h-0");
    }

    #[test]
    fn ambiguous_master_is_an_error() {
        let instances = vec![instance("h-0", None), instance("h-1", None)];
        let Err(Error::MultipleMasters(hosts)) = determine_master(&instances) else {
            panic!("two roots must be rejected");
        };
        assert_eq!(hosts, vec!["h-0".to_owned(), "h-1".to_owned()]);
    }

    #[test]
    fn no_master_is_an_error() {
        let mut co = instance("h-0", Some("h-1"));
        co.is_co_master = true;
        let instances = vec![co, instance("h-1", Some("h-0"))];
        assert!(matches!(determine_master(&instances), Err(Error::NoMaster)));
        assert!(matches!(determine_master(&[]), Err(Error::NoMaster)));
    }

    #[test]
    fn decode_instance() {
        let json = r#"{
            "Key": {"Hostname": "foo-mysql-0.mysql.default", "Port": 3306},
            "ReadOnly": false,
            "Slave_SQL_Running": true,
            "Slave_IO_Running": true,
            "SecondsBehindMaster": {"Int64": 12, "Valid": true},
            "IsUpToDate": true,
            "IsLastCheckValid": true,
            "Uptime": 100,
            "Unknown": "ignored"
        }"#;
        let inst: Instance = serde_json::from_str(json).unwrap();
        assert_eq!(inst.key.hostname, "foo-mysql-0.mysql.default");
        assert_eq!(inst.seconds_behind_master.value(), Some(12));
        assert!(inst.is_replicating());
        assert!(inst.is_fresh());
        assert!(inst.is_master_candidate());
    }
}
