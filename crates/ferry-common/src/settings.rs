//! Engine settings
//!
//! One explicit value built at startup and handed to the engine and the
//! builders. Defaults are production values; [`Settings::from_env`] reads
//! overrides from the process environment.

use std::time::Duration;

use crate::{Error, Result};

/// Default guest conversion image (cold path)
pub const DEFAULT_VIRT_V2V_IMAGE: &str = "quay.io/kubev2v/forklift-virt-v2v:latest";
/// Default guest conversion image (warm path)
pub const DEFAULT_VIRT_V2V_WARM_IMAGE: &str = "quay.io/kubev2v/forklift-virt-v2v-warm:latest";
/// Default namespace holding VM templates
pub const DEFAULT_TEMPLATE_NAMESPACE: &str = "openshift";
/// Port of the conversion pod's control surface
pub const DEFAULT_CONVERSION_PORT: u16 = 8080;

/// Engine settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Conversion image used on the cold path
    pub virt_v2v_image_cold: String,
    /// Conversion image used on the warm path
    pub virt_v2v_image_warm: String,
    /// Do not request `/dev/kvm` for conversion and consumer pods
    pub virt_v2v_dont_request_kvm: bool,
    /// Keep importer pods after the import completes
    pub retain_precopy_importer_pods: bool,
    /// ConfigMap mapping vSphere guest ids to preferences
    pub vsphere_os_config_map: String,
    /// ConfigMap mapping oVirt OS types to preferences
    pub ovirt_os_config_map: String,
    /// Namespace the engine runs in (holds the OS maps)
    pub operator_namespace: String,
    /// Namespace VM templates are listed from
    pub template_namespace: String,
    /// Port of the conversion control surface
    pub conversion_port: u16,
    /// Connect timeout for control surface requests
    pub conversion_connect_timeout: Duration,
    /// Total timeout for control surface requests
    pub conversion_request_timeout: Duration,
    /// Attempts at creating an object under a fresh generated name
    pub create_retries: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            virt_v2v_image_cold: DEFAULT_VIRT_V2V_IMAGE.to_string(),
            virt_v2v_image_warm: DEFAULT_VIRT_V2V_WARM_IMAGE.to_string(),
            virt_v2v_dont_request_kvm: false,
            retain_precopy_importer_pods: false,
            vsphere_os_config_map: "forklift-vsphere-osmap".to_string(),
            ovirt_os_config_map: "forklift-ovirt-osmap".to_string(),
            operator_namespace: "openshift-mtv".to_string(),
            template_namespace: DEFAULT_TEMPLATE_NAMESPACE.to_string(),
            conversion_port: DEFAULT_CONVERSION_PORT,
            conversion_connect_timeout: Duration::from_secs(10),
            conversion_request_timeout: Duration::from_secs(30),
            create_retries: 3,
        }
    }
}

impl Settings {
    /// Settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Settings from an arbitrary lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let string = |key: &str, target: &mut String| {
            if let Some(v) = lookup(key).filter(|v| !v.is_empty()) {
                *target = v;
            }
        };
        string("VIRT_V2V_IMAGE", &mut settings.virt_v2v_image_cold);
        string("VIRT_V2V_WARM_IMAGE", &mut settings.virt_v2v_image_warm);
        string("VSPHERE_OS_CONFIG_MAP", &mut settings.vsphere_os_config_map);
        string("OVIRT_OS_CONFIG_MAP", &mut settings.ovirt_os_config_map);
        string("POD_NAMESPACE", &mut settings.operator_namespace);
        string("TEMPLATE_NAMESPACE", &mut settings.template_namespace);

        if let Some(v) = lookup("VIRT_V2V_DONT_REQUEST_KVM") {
            settings.virt_v2v_dont_request_kvm = parse_bool("VIRT_V2V_DONT_REQUEST_KVM", &v)?;
        }
        if let Some(v) = lookup("RETAIN_PRECOPY_IMPORTER_PODS") {
            settings.retain_precopy_importer_pods = parse_bool("RETAIN_PRECOPY_IMPORTER_PODS", &v)?;
        }
        if let Some(v) = lookup("CONVERSION_PORT") {
            settings.conversion_port = v.trim().parse().map_err(|_| {
                Error::validation(format!("CONVERSION_PORT must be a port number, got {:?}", v))
            })?;
        }
        if let Some(v) = lookup("CONVERSION_CONNECT_TIMEOUT_SECS") {
            let secs: u64 = v.trim().parse().map_err(|_| {
                Error::validation(format!(
                    "CONVERSION_CONNECT_TIMEOUT_SECS must be whole seconds, got {:?}",
                    v
                ))
            })?;
            settings.conversion_connect_timeout = Duration::from_secs(secs);
        }
        Ok(settings)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "false" | "0" | "no" => Ok(false),
        "true" | "1" | "yes" => Ok(true),
        other => Err(Error::validation(format!(
            "{} must be a boolean, got {:?}",
            key, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_empty_environment_yields_defaults() {
        assert_eq!(Settings::from_lookup(lookup(&[])).unwrap(), Settings::default());
    }

    #[test]
    fn test_overrides_are_applied() {
        let settings = Settings::from_lookup(lookup(&[
            ("VIRT_V2V_IMAGE", "registry/v2v:1"),
            ("POD_NAMESPACE", "ferry-system"),
            ("VIRT_V2V_DONT_REQUEST_KVM", "true"),
            ("CONVERSION_PORT", "9090"),
            ("CONVERSION_CONNECT_TIMEOUT_SECS", "3"),
        ]))
        .unwrap();
        assert_eq!(settings.virt_v2v_image_cold, "registry/v2v:1");
        assert_eq!(settings.operator_namespace, "ferry-system");
        assert!(settings.virt_v2v_dont_request_kvm);
        assert_eq!(settings.conversion_port, 9090);
        assert_eq!(settings.conversion_connect_timeout, Duration::from_secs(3));
        assert_eq!(settings.template_namespace, DEFAULT_TEMPLATE_NAMESPACE);
    }

    #[rstest]
    #[case("VIRT_V2V_DONT_REQUEST_KVM", "maybe")]
    #[case("RETAIN_PRECOPY_IMPORTER_PODS", "2")]
    #[case("CONVERSION_PORT", "http")]
    #[case("CONVERSION_PORT", "70000")]
    #[case("CONVERSION_CONNECT_TIMEOUT_SECS", "1.5")]
    fn test_malformed_values_are_validation_errors(#[case] key: &str, #[case] value: &str) {
        let err = Settings::from_lookup(lookup(&[(key, value)])).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "{key}={value}: {err}");
    }

    #[rstest]
    #[case("TRUE", true)]
    #[case("yes", true)]
    #[case("0", false)]
    #[case("", false)]
    fn test_booleans_accept_common_spellings(#[case] raw: &str, #[case] expected: bool) {
        assert_eq!(parse_bool("K", raw).unwrap(), expected);
    }
}
