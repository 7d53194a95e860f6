/// Backup jobs and URLs
pub(crate) mod backup;
/// Objects owned by a `MysqlCluster`
pub(crate) mod cluster;
/// Spec defaults and validation
pub(crate) mod defaults;
