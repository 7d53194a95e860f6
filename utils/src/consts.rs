/// The default mysql port
pub const MYSQL_PORT: u16 = 3306;
/// The port of the prometheus mysql exporter
pub const EXPORTER_PORT: u16 = 9125;
/// The path on which the exporter serves metrics
pub const EXPORTER_PATH: &str = "/metrics";
/// The port on which the sidecar serves backups and probes
pub const SIDECAR_SERVER_PORT: u16 = 8088;
/// The probe path of the sidecar server
pub const SIDECAR_SERVER_PROBE_PATH: &str = "/health";
/// The database used by the operator to keep bookkeeping data inside mysql.
/// pt-heartbeat also writes into this database.
pub const OPERATOR_DB_NAME: &str = "sys_operator";
/// The table in `OPERATOR_DB_NAME` holding `(name, value, inserted_at)` rows
pub const OPERATOR_STATUS_TABLE: &str = "status";
/// The path where mysql configs are mounted
pub const CONF_VOLUME_MOUNT_PATH: &str = "/etc/mysql";
/// Extra mysql configs dir, included at the end of `my.cnf`
pub const CONF_D_PATH: &str = "/etc/mysql/conf.d";
/// The config map mount path used by init containers
pub const CONF_MAP_VOLUME_MOUNT_PATH: &str = "/mnt/conf";
/// The path to mysql data
pub const DATA_VOLUME_MOUNT_PATH: &str = "/var/lib/mysql";
/// The rclone config file rendered by the sidecar image
pub const RCLONE_CONFIG_FILE: &str = "/etc/rclone.conf";
