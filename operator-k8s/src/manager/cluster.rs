use std::collections::BTreeMap;
use std::sync::Arc;

use crd_api::v1alpha1::{MysqlCluster, QueryLimits, ResourceName};
use k8s_openapi::api::apps::v1::{
    StatefulSet, StatefulSetPersistentVolumeClaimRetentionPolicy, StatefulSetSpec,
    StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource,
    EnvFromSource, EnvVar, EnvVarSource, ExecAction, HTTPGetAction, ObjectFieldSelector,
    PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, Secret, SecretEnvSource, SecretKeySelector,
    Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::Resource;
use utils::consts::{
    CONF_D_PATH, CONF_MAP_VOLUME_MOUNT_PATH, CONF_VOLUME_MOUNT_PATH, DATA_VOLUME_MOUNT_PATH,
    EXPORTER_PATH, EXPORTER_PORT, MYSQL_PORT, OPERATOR_DB_NAME, SIDECAR_SERVER_PORT,
    SIDECAR_SERVER_PROBE_PATH,
};
use utils::credential::{random_password, random_user};

use crate::config::OperatorOptions;
use crate::consts::{DEFAULT_MYSQL_VERSION, LABEL_HEALTHY, LABEL_ROLE, MYSQL_UID};

/// Operator user key in the operated secret
pub(crate) const OPERATOR_USER_KEY: &str = "OPERATOR_USER";
/// Operator password key in the operated secret
pub(crate) const OPERATOR_PASSWORD_KEY: &str = "OPERATOR_PASSWORD";
/// Replication user key
pub(crate) const REPLICATION_USER_KEY: &str = "REPLICATION_USER";
/// Replication password key
pub(crate) const REPLICATION_PASSWORD_KEY: &str = "REPLICATION_PASSWORD";
/// Exporter user key
pub(crate) const EXPORTER_USER_KEY: &str = "METRICS_EXPORTER_USER";
/// Exporter password key
pub(crate) const EXPORTER_PASSWORD_KEY: &str = "METRICS_EXPORTER_PASSWORD";
/// Backup user key
pub(crate) const BACKUP_USER_KEY: &str = "BACKUP_USER";
/// Backup password key
pub(crate) const BACKUP_PASSWORD_KEY: &str = "BACKUP_PASSWORD";
/// Root password key in the user secret
pub(crate) const ROOT_PASSWORD_KEY: &str = "ROOT_PASSWORD";

/// Fixed users of the operated secret
const OPERATED_USERS: [(&str, &str, &str); 4] = [
    (OPERATOR_USER_KEY, OPERATOR_PASSWORD_KEY, "sys_operator"),
    (REPLICATION_USER_KEY, REPLICATION_PASSWORD_KEY, "sys_replication"),
    (EXPORTER_USER_KEY, EXPORTER_PASSWORD_KEY, "sys_exporter"),
    (BACKUP_USER_KEY, BACKUP_PASSWORD_KEY, "sys_backups"),
];

/// Options always written in `my.cnf`
const MYSQL_MASTER_SLAVE_CONFIGS: [(&str, &str); 36] = [
    ("log-bin", "/var/lib/mysql/mysql-bin"),
    ("log-slave-updates", "on"),
    ("read-only", "on"),
    ("skip-slave-start", "on"),
    ("relay-log-info-repository", "TABLE"),
    ("relay-log-recovery", "on"),
    ("master-info-repository", "TABLE"),
    ("default-storage-engine", "InnoDB"),
    ("gtid-mode", "on"),
    ("enforce-gtid-consistency", "on"),
    ("key-buffer-size", "32M"),
    ("myisam-recover-options", "FORCE,BACKUP"),
    ("max-allowed-packet", "16M"),
    ("max-connect-errors", "1000000"),
    ("sql-mode", "STRICT_TRANS_TABLES,ERROR_FOR_DIVISION_BY_ZERO,NO_AUTO_CREATE_USER,NO_AUTO_VALUE_ON_ZERO,NO_ENGINE_SUBSTITUTION,NO_ZERO_DATE,NO_ZERO_IN_DATE,ONLY_FULL_GROUP_BY"),
    ("sysdate-is-now", "1"),
    ("expire-logs-days", "14"),
    ("sync-binlog", "1"),
    ("binlog-format", "ROW"),
    ("tmp-table-size", "32M"),
    ("max-heap-table-size", "32M"),
    ("query-cache-type", "0"),
    ("query-cache-size", "0"),
    ("max-connections", "500"),
    ("thread-cache-size", "50"),
    ("open-files-limit", "65535"),
    ("table-definition-cache", "4096"),
    ("table-open-cache", "4096"),
    ("innodb-flush-method", "O_DIRECT"),
    ("innodb-log-files-in-group", "2"),
    ("innodb-flush-log-at-trx-commit", "2"),
    ("innodb-file-per-table", "1"),
    ("character-set-server", "utf8mb4"),
    ("collation-server", "utf8mb4_unicode_ci"),
    ("datadir", DATA_VOLUME_MOUNT_PATH),
    ("port", "3306"),
];

/// Flags without a value in `my.cnf`
const MYSQL_BOOLEAN_CONFIGS: [&str; 2] = ["skip-name-resolve", "skip-host-cache"];

/// Pod template annotation with the config map revision
pub(crate) const ANNOTATION_CONFIG_REV: &str = "config_rev";
/// Pod template annotation with the operated secret revision
pub(crate) const ANNOTATION_SECRET_REV: &str = "secret_rev";

/// Volume with the rendered configs
const CONF_VOLUME: &str = "conf";
/// Volume with the config map
const CONF_MAP_VOLUME: &str = "config-map";
/// The data volume, also the name of the claim template
pub(crate) const DATA_VOLUME: &str = "data";

/// Container names
const CONTAINER_INIT: &str = "init-mysql";
/// Mysql container
const CONTAINER_MYSQL: &str = "mysql";
/// Sidecar container
const CONTAINER_SIDECAR: &str = "sidecar";
/// Exporter container
const CONTAINER_EXPORTER: &str = "metrics-exporter";
/// Heartbeat container
const CONTAINER_HEARTBEAT: &str = "pt-heartbeat";
/// Query killer container
const CONTAINER_KILLER: &str = "pt-kill";

/// The role of a mysql node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    /// Accepts writes
    Master,
    /// Replicates from the master
    Replica,
}

impl Role {
    /// The value of the `role` label
    pub(crate) fn label(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Replica => "replica",
        }
    }
}

/// Read objects from `MysqlCluster`
pub(crate) struct Extractor<'a> {
    /// `MysqlCluster`
    cluster: &'a MysqlCluster,
}

impl<'a> Extractor<'a> {
    /// Constructor
    pub(crate) fn new(cluster: &'a MysqlCluster) -> Self {
        Self { cluster }
    }

    /// Extract name, namespace
    pub(crate) fn extract_id(&self) -> (&str, &str) {
        let meta = &self.cluster.metadata;
        (
            meta.name.as_deref().unwrap_or_default(),
            meta.namespace.as_deref().unwrap_or_default(),
        )
    }

    /// Extract owner reference, missing for objects never stored by the api server
    pub(crate) fn extract_owner_ref(&self) -> Option<OwnerReference> {
        self.cluster.controller_owner_ref(&())
    }

    /// Extract the mysql version
    fn extract_version(&self) -> &str {
        self.cluster
            .spec
            .mysql_version
            .as_deref()
            .unwrap_or(DEFAULT_MYSQL_VERSION)
    }

    /// Labels of all owned objects
    pub(crate) fn extract_labels(&self) -> BTreeMap<String, String> {
        self.cluster.labels_with_version(self.extract_version())
    }

    /// Labels of the pods, user labels included
    fn extract_pod_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.cluster.spec.pod_spec.labels.clone();
        labels.extend(self.extract_labels());
        labels
    }

    /// Extract the data volume claim template, if the cluster uses one
    fn extract_pvc_template(&self) -> Option<PersistentVolumeClaim> {
        let spec = self.cluster.spec.volume_spec.persistent_volume_claim.clone()?;
        Some(PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(DATA_VOLUME.to_owned()),
                labels: Some(self.cluster.selector_labels()),
                ..ObjectMeta::default()
            },
            spec: Some(spec),
            ..PersistentVolumeClaim::default()
        })
    }

    /// Extract the data volume, if it is not a claim
    fn extract_data_volume(&self) -> Option<Volume> {
        let spec = &self.cluster.spec.volume_spec;
        if spec.persistent_volume_claim.is_some() {
            return None;
        }
        if let Some(host_path) = spec.host_path.clone() {
            return Some(Volume {
                name: DATA_VOLUME.to_owned(),
                host_path: Some(host_path),
                ..Volume::default()
            });
        }
        Some(Volume {
            name: DATA_VOLUME.to_owned(),
            empty_dir: Some(spec.empty_dir.clone().unwrap_or_default()),
            ..Volume::default()
        })
    }
}

/// Render `my.cnf`: operator defaults overridden by `mysqlConf`, keys sorted
pub(crate) fn render_my_cnf(conf: &BTreeMap<String, IntOrString>) -> String {
    let mut options: BTreeMap<String, String> = MYSQL_MASTER_SLAVE_CONFIGS
        .iter()
        .map(|&(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
    for (key, value) in conf {
        let value = match *value {
            IntOrString::Int(ref i) => i.to_string(),
            IntOrString::String(ref s) => s.clone(),
        };
        let _prev = options.insert(key.clone(), value);
    }
    let mut out = String::from("[mysqld]\n");
    for (key, value) in options {
        out.push_str(&key);
        out.push_str(" = ");
        out.push_str(&value);
        out.push('\n');
    }
    for flag in MYSQL_BOOLEAN_CONFIGS {
        out.push_str(flag);
        out.push('\n');
    }
    out.push_str("!includedir ");
    out.push_str(CONF_D_PATH);
    out.push('\n');
    out
}

/// The `pt-kill` options for the query limits
pub(crate) fn pt_kill_options(limits: &QueryLimits) -> Vec<String> {
    let mut options = vec![
        "--print".to_owned(),
        "--wait-after-kill=1".to_owned(),
        "--busy-time".to_owned(),
        limits.max_query_time.to_string(),
    ];
    match limits.kill_mode.as_deref() {
        Some("connection") => options.push("--kill".to_owned()),
        _ => options.push("--kill-query".to_owned()),
    }
    if let Some(idle) = limits.max_idle_time {
        options.extend(["--idle-time".to_owned(), idle.to_string()]);
    }
    if let Some(kill) = limits.kill.as_ref().filter(|k| !k.is_empty()) {
        options.extend(["--victims".to_owned(), kill.clone()]);
    }
    for (flag, values) in [
        ("--ignore-db", &limits.ignore_db),
        ("--ignore-command", &limits.ignore_command),
        ("--ignore-user", &limits.ignore_user),
    ] {
        if !values.is_empty() {
            options.extend([flag.to_owned(), values.join("|")]);
        }
    }
    options
}

/// Keys missing from the user secret and their generated values.
///
/// # Errors
///
/// Return the secret name if `ROOT_PASSWORD` is missing
pub(crate) fn user_secret_additions(
    secret_name: &str,
    data: &BTreeMap<String, ByteString>,
) -> Result<BTreeMap<String, ByteString>, String> {
    if !data.contains_key(ROOT_PASSWORD_KEY) {
        return Err(secret_name.to_owned());
    }
    let generators: [(&str, fn() -> String); 6] = [
        (REPLICATION_USER_KEY, || random_user("repl_")),
        (REPLICATION_PASSWORD_KEY, random_password),
        (EXPORTER_USER_KEY, || random_user("exp_")),
        (EXPORTER_PASSWORD_KEY, random_password),
        (BACKUP_USER_KEY, || random_user("backup_")),
        (BACKUP_PASSWORD_KEY, random_password),
    ];
    Ok(generators
        .into_iter()
        .filter(|&(key, _)| data.get(key).map_or(true, |v| v.0.is_empty()))
        .map(|(key, generate)| (key.to_owned(), ByteString(generate().into_bytes())))
        .collect())
}

/// Factory generate the objects in k8s
pub(crate) struct Factory {
    /// `MysqlCluster`
    cluster: Arc<MysqlCluster>,
    /// Operator options
    options: Arc<OperatorOptions>,
}

impl Factory {
    /// Constructor
    pub(crate) fn new(cluster: Arc<MysqlCluster>, options: Arc<OperatorOptions>) -> Self {
        Self { cluster, options }
    }

    /// Get the general metadata
    fn general_metadata(&self, resource: ResourceName) -> ObjectMeta {
        let extractor = Extractor::new(self.cluster.as_ref());
        let (_, namespace) = extractor.extract_id();
        ObjectMeta {
            labels: Some(extractor.extract_labels()),
            name: Some(self.cluster.name_for(resource)),
            namespace: Some(namespace.to_owned()),
            owner_references: extractor.extract_owner_ref().map(|r| vec![r]), // allow k8s GC to clean up
            ..ObjectMeta::default()
        }
    }

    /// The `my.cnf` config map
    pub(crate) fn config_map(&self) -> ConfigMap {
        ConfigMap {
            metadata: self.general_metadata(ResourceName::ConfigMap),
            data: Some(
                [(
                    "my.cnf".to_owned(),
                    render_my_cnf(&self.cluster.spec.mysql_conf),
                )]
                .into(),
            ),
            ..ConfigMap::default()
        }
    }

    /// The operated secret, keeping the passwords already generated in `existing`
    pub(crate) fn operated_secret(&self, existing: Option<&Secret>) -> Secret {
        let existing = existing.and_then(|s| s.data.as_ref());
        let keep_or = |key: &str, generate: &dyn Fn() -> String| {
            existing
                .and_then(|data| data.get(key))
                .filter(|value| !value.0.is_empty())
                .cloned()
                .unwrap_or_else(|| ByteString(generate().into_bytes()))
        };
        let mut data = BTreeMap::new();
        for (user_key, password_key, user) in OPERATED_USERS {
            let _prev = data.insert(user_key.to_owned(), ByteString(user.as_bytes().to_vec()));
            let _prev = data.insert(password_key.to_owned(), keep_or(password_key, &random_password));
        }
        let _prev = data.insert(
            "ORC_TOPOLOGY_USER".to_owned(),
            ByteString(self.options.orchestrator_topology_user.clone().into_bytes()),
        );
        let _prev = data.insert(
            "ORC_TOPOLOGY_PASSWORD".to_owned(),
            ByteString(self.options.orchestrator_topology_password.clone().into_bytes()),
        );
        Secret {
            metadata: self.general_metadata(ResourceName::OperatedSecret),
            data: Some(data),
            ..Secret::default()
        }
    }

    /// A service selecting the pods with the `extra` labels
    fn service(&self, resource: ResourceName, extra: &[(&str, &str)]) -> Service {
        let mut selector = self.cluster.selector_labels();
        selector.extend(extra.iter().map(|&(k, v)| (k.to_owned(), v.to_owned())));
        Service {
            metadata: self.general_metadata(resource),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_owned()),
                selector: Some(selector),
                ports: Some(vec![ServicePort {
                    name: Some("mysql".to_owned()),
                    port: i32::from(MYSQL_PORT),
                    target_port: Some(IntOrString::Int(i32::from(MYSQL_PORT))),
                    protocol: Some("TCP".to_owned()),
                    ..ServicePort::default()
                }]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    /// The headless service shared by the clusters of a namespace
    pub(crate) fn headless_service(&self) -> Service {
        let extractor = Extractor::new(self.cluster.as_ref());
        let (_, namespace) = extractor.extract_id();
        let selector: BTreeMap<String, String> = self
            .cluster
            .selector_labels()
            .into_iter()
            .filter(|&(ref k, _)| k.starts_with("app.kubernetes.io/"))
            .collect();
        Service {
            metadata: ObjectMeta {
                name: Some(self.cluster.name_for(ResourceName::HeadlessService)),
                namespace: Some(namespace.to_owned()),
                labels: Some(selector.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_owned()),
                publish_not_ready_addresses: Some(true),
                selector: Some(selector),
                ports: Some(vec![
                    ServicePort {
                        name: Some("mysql".to_owned()),
                        port: i32::from(MYSQL_PORT),
                        ..ServicePort::default()
                    },
                    ServicePort {
                        name: Some("prometheus".to_owned()),
                        port: i32::from(EXPORTER_PORT),
                        ..ServicePort::default()
                    },
                ]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    /// The service pointing to the master
    pub(crate) fn master_service(&self) -> Service {
        self.service(
            ResourceName::MasterService,
            &[(LABEL_ROLE, Role::Master.label())],
        )
    }

    /// The service pointing to every healthy node
    pub(crate) fn healthy_nodes_service(&self) -> Service {
        self.service(ResourceName::HealthyNodesService, &[(LABEL_HEALTHY, "yes")])
    }

    /// The service pointing to the healthy replicas
    pub(crate) fn healthy_replicas_service(&self) -> Service {
        self.service(
            ResourceName::HealthyReplicasService,
            &[(LABEL_ROLE, Role::Replica.label()), (LABEL_HEALTHY, "yes")],
        )
    }

    /// The pod disruption budget, only when `minAvailable` is set
    pub(crate) fn pod_disruption_budget(&self) -> Option<PodDisruptionBudget> {
        let min_available = self
            .cluster
            .spec
            .min_available
            .as_ref()
            .filter(|m| !m.is_empty())?;
        let min_available = min_available
            .parse::<i32>()
            .map_or_else(|_| IntOrString::String(min_available.clone()), IntOrString::Int);
        Some(PodDisruptionBudget {
            metadata: self.general_metadata(ResourceName::PodDisruptionBudget),
            spec: Some(PodDisruptionBudgetSpec {
                min_available: Some(min_available),
                selector: Some(LabelSelector {
                    match_labels: Some(self.cluster.selector_labels()),
                    ..LabelSelector::default()
                }),
                ..PodDisruptionBudgetSpec::default()
            }),
            ..PodDisruptionBudget::default()
        })
    }

    /// Env var from a pod field
    fn field_env(name: &str, path: &str) -> EnvVar {
        EnvVar {
            name: name.to_owned(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    api_version: Some("v1".to_owned()),
                    field_path: path.to_owned(),
                }),
                ..EnvVarSource::default()
            }),
            ..EnvVar::default()
        }
    }

    /// Env var from a secret key
    pub(crate) fn secret_env(name: &str, secret: &str, key: &str, optional: bool) -> EnvVar {
        EnvVar {
            name: name.to_owned(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: Some(secret.to_owned()),
                    key: key.to_owned(),
                    optional: optional.then_some(true),
                }),
                ..EnvVarSource::default()
            }),
            ..EnvVar::default()
        }
    }

    /// Plain env var
    fn value_env(name: &str, value: impl Into<String>) -> EnvVar {
        EnvVar {
            name: name.to_owned(),
            value: Some(value.into()),
            ..EnvVar::default()
        }
    }

    /// Env vars shared by all containers
    fn common_env(&self) -> Vec<EnvVar> {
        let extractor = Extractor::new(self.cluster.as_ref());
        let (name, _) = extractor.extract_id();
        let mut env = vec![
            Self::field_env("MY_NAMESPACE", "metadata.namespace"),
            Self::field_env("MY_POD_NAME", "metadata.name"),
            Self::field_env("MY_POD_IP", "status.podIP"),
            Self::value_env(
                "MY_SERVICE_NAME",
                self.cluster.name_for(ResourceName::HeadlessService),
            ),
            Self::value_env("MY_CLUSTER_NAME", name),
            Self::value_env("MY_FQDN", "$(MY_POD_NAME).$(MY_SERVICE_NAME).$(MY_NAMESPACE)"),
            Self::value_env("ORCHESTRATOR_URI", self.options.orchestrator_uri.clone()),
        ];
        if let Some(offset) = self.cluster.spec.server_id_offset {
            env.push(Self::value_env("MY_SERVER_ID_OFFSET", offset.to_string()));
        }
        env
    }

    /// Env from the operated secret
    fn operated_env_from(&self) -> EnvFromSource {
        EnvFromSource {
            secret_ref: Some(SecretEnvSource {
                name: Some(self.cluster.name_for(ResourceName::OperatedSecret)),
                optional: None,
            }),
            ..EnvFromSource::default()
        }
    }

    /// Volume mount helper
    fn mount(name: &str, path: &str) -> VolumeMount {
        VolumeMount {
            name: name.to_owned(),
            mount_path: path.to_owned(),
            ..VolumeMount::default()
        }
    }

    /// Small resources of the helper containers
    fn helper_resources(cpu_limit: &str) -> ResourceRequirements {
        ResourceRequirements {
            requests: Some(
                [
                    ("cpu".to_owned(), Quantity("10m".to_owned())),
                    ("memory".to_owned(), Quantity("32Mi".to_owned())),
                ]
                .into(),
            ),
            limits: Some([("cpu".to_owned(), Quantity(cpu_limit.to_owned()))].into()),
            ..ResourceRequirements::default()
        }
    }

    /// A container with the common settings
    fn container(&self, name: &str, image: &str, args: Vec<String>) -> Container {
        Container {
            name: name.to_owned(),
            image: Some(image.to_owned()),
            image_pull_policy: self.cluster.spec.pod_spec.image_pull_policy.clone(),
            args: (!args.is_empty()).then_some(args),
            env: Some(self.common_env()),
            ..Container::default()
        }
    }

    /// The init container rendering the configs and cloning data
    fn init_container(&self) -> Container {
        let spec = &self.cluster.spec;
        let mut init = self.container(
            CONTAINER_INIT,
            &self.options.sidecar_image,
            vec!["clone-and-init".to_owned()],
        );
        let mut env_from = vec![self.operated_env_from()];
        if let Some(url) = spec.init_bucket_url.as_ref().filter(|u| !u.is_empty()) {
            init.env
                .get_or_insert_with(Vec::new)
                .push(Self::value_env("INIT_BUCKET_URI", url.clone()));
        }
        if let Some(secret) = spec.init_bucket_secret_name.as_ref().filter(|s| !s.is_empty()) {
            env_from.push(EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name: Some(secret.clone()),
                    optional: None,
                }),
                ..EnvFromSource::default()
            });
        }
        init.env_from = Some(env_from);
        init.volume_mounts = Some(vec![
            Self::mount(CONF_VOLUME, CONF_VOLUME_MOUNT_PATH),
            Self::mount(CONF_MAP_VOLUME, CONF_MAP_VOLUME_MOUNT_PATH),
            Self::mount(DATA_VOLUME, DATA_VOLUME_MOUNT_PATH),
        ]);
        init
    }

    /// The mysql container
    fn mysql_container(&self, mysql_image: &str) -> Container {
        let secret = &self.cluster.spec.secret_name;
        let mut mysql = self.container(CONTAINER_MYSQL, mysql_image, vec![]);
        mysql.env.get_or_insert_with(Vec::new).extend([
            Self::secret_env("MYSQL_ROOT_PASSWORD", secret, ROOT_PASSWORD_KEY, false),
            Self::secret_env("MYSQL_USER", secret, "USER", true),
            Self::secret_env("MYSQL_PASSWORD", secret, "PASSWORD", true),
            Self::secret_env("MYSQL_DATABASE", secret, "DATABASE", true),
        ]);
        mysql.ports = Some(vec![ContainerPort {
            name: Some("mysql".to_owned()),
            container_port: i32::from(MYSQL_PORT),
            ..ContainerPort::default()
        }]);
        mysql.resources = self.cluster.spec.pod_spec.resources.clone();
        mysql.volume_mounts = Some(vec![
            Self::mount(CONF_VOLUME, CONF_VOLUME_MOUNT_PATH),
            Self::mount(DATA_VOLUME, DATA_VOLUME_MOUNT_PATH),
        ]);
        let client_cnf = format!("--defaults-file={CONF_VOLUME_MOUNT_PATH}/client.cnf");
        mysql.liveness_probe = Some(Probe {
            initial_delay_seconds: Some(60),
            timeout_seconds: Some(5),
            period_seconds: Some(5),
            exec: Some(ExecAction {
                command: Some(vec!["mysqladmin".to_owned(), client_cnf.clone(), "ping".to_owned()]),
            }),
            ..Probe::default()
        });
        mysql.readiness_probe = Some(Probe {
            initial_delay_seconds: Some(5),
            timeout_seconds: Some(5),
            period_seconds: Some(2),
            exec: Some(ExecAction {
                command: Some(vec![
                    "mysql".to_owned(),
                    client_cnf,
                    "-e".to_owned(),
                    "SELECT 1".to_owned(),
                ]),
            }),
            ..Probe::default()
        });
        mysql
    }

    /// The sidecar serving backups
    fn sidecar_container(&self) -> Container {
        let mut sidecar = self.container(
            CONTAINER_SIDECAR,
            &self.options.sidecar_image,
            vec!["config-and-serve".to_owned()],
        );
        sidecar.env_from = Some(vec![self.operated_env_from()]);
        sidecar.ports = Some(vec![ContainerPort {
            name: Some("sidecar-http".to_owned()),
            container_port: i32::from(SIDECAR_SERVER_PORT),
            ..ContainerPort::default()
        }]);
        sidecar.volume_mounts = Some(vec![
            Self::mount(CONF_VOLUME, CONF_VOLUME_MOUNT_PATH),
            Self::mount(DATA_VOLUME, DATA_VOLUME_MOUNT_PATH),
        ]);
        sidecar.readiness_probe = Some(Probe {
            initial_delay_seconds: Some(30),
            timeout_seconds: Some(5),
            period_seconds: Some(5),
            http_get: Some(HTTPGetAction {
                path: Some(SIDECAR_SERVER_PROBE_PATH.to_owned()),
                port: IntOrString::Int(i32::from(SIDECAR_SERVER_PORT)),
                scheme: Some("HTTP".to_owned()),
                ..HTTPGetAction::default()
            }),
            ..Probe::default()
        });
        sidecar.resources = Some(Self::helper_resources("50m"));
        sidecar
    }

    /// The prometheus exporter
    fn exporter_container(&self) -> Container {
        let operated = self.cluster.name_for(ResourceName::OperatedSecret);
        let mut exporter = self.container(
            CONTAINER_EXPORTER,
            &self.options.metrics_exporter_image,
            vec![
                format!("--web.listen-address=0.0.0.0:{EXPORTER_PORT}"),
                format!("--web.telemetry-path={EXPORTER_PATH}"),
                "--collect.heartbeat".to_owned(),
                format!("--collect.heartbeat.database={OPERATOR_DB_NAME}"),
            ],
        );
        exporter.env.get_or_insert_with(Vec::new).extend([
            Self::secret_env("USER", &operated, EXPORTER_USER_KEY, false),
            Self::secret_env("PASSWORD", &operated, EXPORTER_PASSWORD_KEY, false),
            Self::value_env(
                "DATA_SOURCE_NAME",
                format!("$(USER):$(PASSWORD)@(127.0.0.1:{MYSQL_PORT})/"),
            ),
        ]);
        exporter.ports = Some(vec![ContainerPort {
            name: Some("prometheus".to_owned()),
            container_port: i32::from(EXPORTER_PORT),
            ..ContainerPort::default()
        }]);
        exporter.liveness_probe = Some(Probe {
            initial_delay_seconds: Some(30),
            timeout_seconds: Some(30),
            period_seconds: Some(30),
            http_get: Some(HTTPGetAction {
                path: Some(EXPORTER_PATH.to_owned()),
                port: IntOrString::Int(i32::from(EXPORTER_PORT)),
                scheme: Some("HTTP".to_owned()),
                ..HTTPGetAction::default()
            }),
            ..Probe::default()
        });
        exporter.resources = Some(Self::helper_resources("100m"));
        exporter
    }

    /// The replication heartbeat writer
    fn heartbeat_container(&self) -> Container {
        let mut heartbeat = self.container(
            CONTAINER_HEARTBEAT,
            &self.options.sidecar_image,
            [
                "pt-heartbeat",
                "--update",
                "--replace",
                "--check-read-only",
                "--create-table",
                "--database",
                OPERATOR_DB_NAME,
                "--table",
                "heartbeat",
                "--defaults-file",
            ]
            .into_iter()
            .map(ToOwned::to_owned)
            .chain([format!("{CONF_VOLUME_MOUNT_PATH}/heartbeat.conf")])
            .collect(),
        );
        heartbeat.volume_mounts = Some(vec![Self::mount(CONF_VOLUME, CONF_VOLUME_MOUNT_PATH)]);
        heartbeat.resources = Some(Self::helper_resources("50m"));
        heartbeat
    }

    /// The query killer
    fn killer_container(&self, limits: &QueryLimits) -> Container {
        let mut args = vec![
            "pt-kill".to_owned(),
            "--host=127.0.0.1".to_owned(),
            format!("--defaults-file={CONF_VOLUME_MOUNT_PATH}/client.cnf"),
        ];
        args.extend(pt_kill_options(limits));
        let mut killer = self.container(CONTAINER_KILLER, &self.options.sidecar_image, args);
        killer.volume_mounts = Some(vec![Self::mount(CONF_VOLUME, CONF_VOLUME_MOUNT_PATH)]);
        killer.resources = Some(Self::helper_resources("50m"));
        killer
    }

    /// The pod template
    fn pod_template(&self, mysql_image: &str, config_rev: &str, secret_rev: &str) -> PodTemplateSpec {
        let extractor = Extractor::new(self.cluster.as_ref());
        let pod_spec = &self.cluster.spec.pod_spec;
        let mut annotations = pod_spec.annotations.clone();
        let _prev = annotations.insert(ANNOTATION_CONFIG_REV.to_owned(), config_rev.to_owned());
        let _prev = annotations.insert(ANNOTATION_SECRET_REV.to_owned(), secret_rev.to_owned());
        let _prev = annotations.insert("prometheus.io/scrape".to_owned(), "true".to_owned());
        let _prev = annotations.insert("prometheus.io/port".to_owned(), EXPORTER_PORT.to_string());

        let mut containers = vec![
            self.mysql_container(mysql_image),
            self.sidecar_container(),
            self.exporter_container(),
            self.heartbeat_container(),
        ];
        if let Some(limits) = self.cluster.spec.query_limits.as_ref() {
            containers.push(self.killer_container(limits));
        }
        let mut volumes = vec![
            Volume {
                name: CONF_VOLUME.to_owned(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Volume::default()
            },
            Volume {
                name: CONF_MAP_VOLUME.to_owned(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(self.cluster.name_for(ResourceName::ConfigMap)),
                    default_mode: Some(0o644),
                    ..ConfigMapVolumeSource::default()
                }),
                ..Volume::default()
            },
        ];
        volumes.extend(extractor.extract_data_volume());
        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(extractor.extract_pod_labels()),
                annotations: Some(annotations),
                ..ObjectMeta::default()
            }),
            spec: Some(PodSpec {
                init_containers: Some(vec![self.init_container()]),
                containers,
                volumes: Some(volumes),
                affinity: pod_spec.affinity.clone(),
                node_selector: pod_spec.node_selector.clone(),
                tolerations: pod_spec.tolerations.clone(),
                priority_class_name: pod_spec.priority_class_name.clone(),
                service_account_name: pod_spec.service_account_name.clone(),
                image_pull_secrets: pod_spec.image_pull_secrets.clone(),
                security_context: Some(PodSecurityContext {
                    fs_group: Some(MYSQL_UID),
                    run_as_user: Some(MYSQL_UID),
                    ..PodSecurityContext::default()
                }),
                ..PodSpec::default()
            }),
        }
    }

    /// The mysql statefulset.
    /// `config_rev` and `secret_rev` are the revisions of the config map and the
    /// operated secret, a change rolls the pods.
    pub(crate) fn statefulset(&self, mysql_image: &str, config_rev: &str, secret_rev: &str) -> StatefulSet {
        let extractor = Extractor::new(self.cluster.as_ref());
        let pvc_template = extractor.extract_pvc_template();
        StatefulSet {
            metadata: self.general_metadata(ResourceName::StatefulSet),
            spec: Some(StatefulSetSpec {
                replicas: Some(self.cluster.replicas()),
                selector: LabelSelector {
                    match_labels: Some(self.cluster.selector_labels()),
                    ..LabelSelector::default()
                },
                service_name: self.cluster.name_for(ResourceName::HeadlessService),
                pod_management_policy: Some("Parallel".to_owned()),
                update_strategy: Some(StatefulSetUpdateStrategy {
                    type_: Some("RollingUpdate".to_owned()),
                    ..StatefulSetUpdateStrategy::default()
                }),
                persistent_volume_claim_retention_policy: pvc_template.as_ref().map(|_| {
                    StatefulSetPersistentVolumeClaimRetentionPolicy {
                        when_deleted: Some("Retain".to_owned()),
                        when_scaled: Some("Retain".to_owned()),
                    }
                }),
                volume_claim_templates: pvc_template.map(|pvc| vec![pvc]),
                template: self.pod_template(mysql_image, config_rev, secret_rev),
                ..StatefulSetSpec::default()
            }),
            ..StatefulSet::default()
        }
    }
}
