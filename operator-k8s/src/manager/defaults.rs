use std::collections::BTreeMap;

use crd_api::v1alpha1::MysqlCluster;
use garde::Validate;
use k8s_openapi::api::core::v1::{
    Affinity, LocalObjectReference, PodAffinityTerm, PodAntiAffinity, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::config::OperatorOptions;
use crate::consts::DEFAULT_MYSQL_VERSION;

/// One kibibyte
pub(crate) const KB: i64 = 1 << 10;
/// One mebibyte
pub(crate) const MB: i64 = 1 << 20;
/// One gibibyte
pub(crate) const GB: i64 = 1 << 30;

/// Images of the mysql versions besides the default one
const MYSQL_IMAGES: [(&str, &str); 4] = [
    ("5.7.24", "percona:5.7.24"),
    ("5.7.25", "percona:5.7.25"),
    ("5.7.26", "percona:5.7.26"),
    ("8.0", "percona:8.0"),
];

/// Reasons a cluster spec is refused
#[derive(thiserror::Error, Debug)]
pub(crate) enum SpecError {
    /// Field validation failed
    #[error("invalid cluster spec: {0}")]
    Invalid(#[from] garde::Report),
    /// No image is known for the version
    #[error("invalid mysql version {0}, no image found")]
    UnknownVersion(String),
}

/// Parse a quantity into its base unit, rounding up
#[allow(
    clippy::float_arithmetic,
    clippy::as_conversions,
    clippy::cast_possible_truncation
)] // quantities are decimal numbers with a scale suffix
fn parse_quantity(quantity: &Quantity, scale: f64) -> Option<i64> {
    let raw = quantity.0.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "Ki" => 1024.0,
        "Mi" => 1_048_576.0,
        "Gi" => 1_073_741_824.0,
        "Ti" => 1_099_511_627_776.0,
        exp if exp.starts_with(['e', 'E']) => 10_f64.powi(exp.get(1..)?.parse().ok()?),
        _ => return None,
    };
    Some((number * multiplier * scale).ceil() as i64)
}

/// The value of a quantity, e.g. bytes for memory
pub(crate) fn quantity_value(quantity: &Quantity) -> Option<i64> {
    parse_quantity(quantity, 1.0)
}

/// The value of a quantity in thousandths, e.g. millicores for cpu
pub(crate) fn quantity_milli_value(quantity: &Quantity) -> Option<i64> {
    parse_quantity(quantity, 1000.0)
}

/// Format a size with the largest unit that represents it within 0.1%
pub(crate) fn humanize_size(value: i64) -> String {
    [(GB, "G"), (MB, "M"), (KB, "K")]
        .into_iter()
        .find_map(|(scale, unit)| {
            let allow = value.checked_div(1000)?;
            let rest = value.checked_rem(scale)?;
            (value >= scale && rest <= allow)
                .then(|| format!("{}{unit}", value.checked_div(scale).unwrap_or_default()))
        })
        .unwrap_or_else(|| value.to_string())
}

/// The innodb buffer pool size for a memory request, `None` for requests too small
#[allow(
    clippy::float_arithmetic,
    clippy::as_conversions,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss
)] // a percentage of the memory
pub(crate) fn innodb_buffer_pool_size(memory: i64) -> Option<i64> {
    let (reserved, percent) = if memory <= 512 * MB {
        return None;
    } else if memory <= GB {
        (256 * MB, 0.5)
    } else if memory <= 4 * GB {
        (256 * MB, 0.75)
    } else {
        (512 * MB, 0.8)
    };
    Some((memory.saturating_sub(reserved) as f64 * percent) as i64)
}

/// The innodb log file size for a memory request
pub(crate) fn innodb_log_file_size(memory: i64) -> i64 {
    if memory < GB {
        48 * MB
    } else if memory <= 4 * GB {
        128 * MB
    } else if memory <= 8 * GB {
        512 * MB
    } else if memory <= 16 * GB {
        GB
    } else {
        2 * GB
    }
}

/// `(binlog-space-limit, max-binlog-size)` for a data volume size
pub(crate) fn binlog_limits(space: i64) -> (i64, i64) {
    if space < 2 * GB {
        let limit = space / 3;
        (limit, (limit / 3).min(GB))
    } else {
        let limit = space / 2;
        (limit, (limit / 4).min(GB))
    }
}

/// Buffer pool instances: one per cpu, at most one per GB of pool, at least one
pub(crate) fn innodb_buffer_pool_instances(cpu_millis: i64, pool_size: i64) -> i64 {
    let cpus = cpu_millis.saturating_add(999) / 1000;
    cpus.min(pool_size / GB).max(1)
}

/// The mysql image for a version
pub(crate) fn mysql_image_for(version: &str, options: &OperatorOptions) -> Option<String> {
    if version == DEFAULT_MYSQL_VERSION {
        return Some(options.mysql_image.clone());
    }
    MYSQL_IMAGES
        .iter()
        .find(|&&(v, _)| v == version)
        .map(|&(_, image)| image.to_owned())
}

/// The image the mysql container runs
pub(crate) fn resolve_mysql_image(
    cluster: &MysqlCluster,
    options: &OperatorOptions,
) -> Result<String, SpecError> {
    if let Some(image) = cluster.spec.image.as_ref().filter(|i| !i.is_empty()) {
        return Ok(image.clone());
    }
    let version = cluster
        .spec
        .mysql_version
        .as_deref()
        .unwrap_or(DEFAULT_MYSQL_VERSION);
    mysql_image_for(version, options).ok_or_else(|| SpecError::UnknownVersion(version.to_owned()))
}

/// Move deprecated fields to their replacement, returns true if the spec changed
pub(crate) fn migrate_spec(cluster: &mut MysqlCluster) -> bool {
    let spec = &mut cluster.spec;
    if spec.init_bucket_url.as_deref().map_or(true, str::is_empty) {
        if let Some(uri) = spec.init_bucket_uri.as_ref().filter(|u| !u.is_empty()) {
            spec.init_bucket_url = Some(uri.clone());
            return true;
        }
    }
    false
}

/// Insert `value` in the mysql config unless the user set it
fn set_conf_if_not_set(conf: &mut BTreeMap<String, IntOrString>, key: &str, value: IntOrString) {
    let _prev = conf.entry(key.to_owned()).or_insert(value);
}

/// Fill the spec fields left empty by the user
pub(crate) fn set_defaults(cluster: &mut MysqlCluster, options: &OperatorOptions) {
    let selector = cluster.selector_labels();
    let spec = &mut cluster.spec;
    let pod_spec = &mut spec.pod_spec;
    if pod_spec.image_pull_policy.as_deref().map_or(true, str::is_empty) {
        pod_spec.image_pull_policy = Some(options.image_pull_policy.clone());
    }
    if pod_spec.image_pull_secrets.as_ref().map_or(true, Vec::is_empty)
        && !options.image_pull_secret.is_empty()
    {
        pod_spec.image_pull_secrets = Some(vec![LocalObjectReference {
            name: Some(options.image_pull_secret.clone()),
        }]);
    }
    if pod_spec.affinity.is_none() {
        pod_spec.affinity = Some(Affinity {
            pod_anti_affinity: Some(PodAntiAffinity {
                preferred_during_scheduling_ignored_during_execution: Some(vec![
                    WeightedPodAffinityTerm {
                        weight: 100,
                        pod_affinity_term: PodAffinityTerm {
                            topology_key: "kubernetes.io/hostname".to_owned(),
                            label_selector: Some(LabelSelector {
                                match_labels: Some(selector),
                                ..LabelSelector::default()
                            }),
                            ..PodAffinityTerm::default()
                        },
                    },
                ]),
                ..PodAntiAffinity::default()
            }),
            ..Affinity::default()
        });
    }
    if spec.mysql_version.as_deref().map_or(true, str::is_empty) {
        spec.mysql_version = Some(DEFAULT_MYSQL_VERSION.to_owned());
    }

    let resources = pod_spec.resources.as_ref();
    let memory = resources
        .and_then(|r| r.requests.as_ref())
        .and_then(|requests| requests.get("memory"))
        .and_then(quantity_value);
    let cpu_limit = resources
        .and_then(|r| r.limits.as_ref())
        .and_then(|limits| limits.get("cpu"))
        .and_then(quantity_milli_value);
    let storage = spec
        .volume_spec
        .persistent_volume_claim
        .as_ref()
        .and_then(|pvc| pvc.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|requests| requests.get("storage"))
        .and_then(quantity_value);

    let conf = &mut spec.mysql_conf;
    // mysql default
    let mut pool_size = 128 * MB;
    if let Some(memory) = memory {
        if let Some(size) = innodb_buffer_pool_size(memory) {
            pool_size = size;
            set_conf_if_not_set(
                conf,
                "innodb-buffer-pool-size",
                IntOrString::String(humanize_size(size)),
            );
        }
        set_conf_if_not_set(
            conf,
            "innodb-log-file-size",
            IntOrString::String(humanize_size(innodb_log_file_size(memory))),
        );
    }
    if let Some(space) = storage {
        let (limit, max_size) = binlog_limits(space);
        set_conf_if_not_set(
            conf,
            "binlog-space-limit",
            IntOrString::String(humanize_size(limit)),
        );
        set_conf_if_not_set(
            conf,
            "max-binlog-size",
            IntOrString::String(humanize_size(max_size)),
        );
    }
    if let Some(cpu) = cpu_limit.filter(|&c| c > 0) {
        let instances = innodb_buffer_pool_instances(cpu, pool_size);
        set_conf_if_not_set(
            conf,
            "innodb-buffer-pool-instances",
            IntOrString::Int(i32::try_from(instances).unwrap_or(i32::MAX)),
        );
    }
}

/// Validate a defaulted cluster
pub(crate) fn validate(cluster: &MysqlCluster, options: &OperatorOptions) -> Result<(), SpecError> {
    cluster.spec.validate(&())?;
    let _image = resolve_mysql_image(cluster, options)?;
    Ok(())
}
