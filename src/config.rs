//! Command-line and environment configuration

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use aperture_api::{GroupVersion, ResourceDescriptor};
use aperture_auth::RequestHeaderConfig;
use aperture_common::{APERTURE_SYSTEM_NAMESPACE, DEFAULT_HTTPS_PORT};
use aperture_pki::RotatorConfig;
use clap::Parser;

/// Aperture - API extension server with live-rotated TLS
#[derive(Parser, Debug, Clone)]
#[command(name = "aperture", version, about, long_about = None)]
pub struct Cli {
    /// Address the HTTPS listener binds
    #[arg(long, env = "APERTURE_BIND_ADDRESS", default_value_t = default_bind_address())]
    pub bind_address: SocketAddr,

    /// Namespace for the serving certificate, settings and trust records
    #[arg(long, env = "APERTURE_NAMESPACE", default_value = APERTURE_SYSTEM_NAMESPACE)]
    pub namespace: String,

    /// Run without a cluster: in-memory storage, allow-all authorization
    #[arg(long, env = "APERTURE_STANDALONE")]
    pub standalone: bool,

    /// Whether the server starts enabled; the settings ConfigMap overrides it
    #[arg(long, env = "APERTURE_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub enabled: bool,

    /// ConfigMap holding `enabled` and `authenticator.<name>` switches
    #[arg(long, env = "APERTURE_SETTINGS_CONFIGMAP", default_value = "aperture-settings")]
    pub settings_configmap: String,

    /// Resources to serve, as group/version/Kind/plural[/cluster]
    #[arg(long = "resource", env = "APERTURE_RESOURCES", value_delimiter = ',')]
    pub resources: Vec<ResourceSpec>,

    /// Secret holding the serving certificate
    #[arg(long, env = "APERTURE_SERVING_SECRET", default_value = "aperture-serving-cert")]
    pub serving_secret: String,

    /// DNS names and IPs the serving certificate covers
    #[arg(
        long,
        env = "APERTURE_SUBJECT_NAMES",
        value_delimiter = ',',
        default_value = "localhost"
    )]
    pub subject_names: Vec<String>,

    /// Serving certificate lifetime in days
    #[arg(long, env = "APERTURE_CERT_VALIDITY_DAYS", default_value_t = 365)]
    pub cert_validity_days: u64,

    /// Renew when less than this percentage of the lifetime remains
    #[arg(long, env = "APERTURE_RENEW_BEFORE_PERCENT", default_value_t = 20, value_parser = clap::value_parser!(u8).range(1..100))]
    pub renew_before_percent: u8,

    /// Seconds between certificate expiry checks
    #[arg(long, env = "APERTURE_ROTATION_CHECK_SECS", default_value_t = 3600)]
    pub rotation_check_secs: u64,

    /// Secret (in --namespace) whose ca.crt verifies client certificates
    #[arg(long, env = "APERTURE_CLIENT_CA_SECRET")]
    pub client_ca_secret: Option<String>,

    /// Secret (in --namespace) whose ca.crt verifies the front proxy
    #[arg(long, env = "APERTURE_REQUESTHEADER_CA_SECRET")]
    pub requestheader_ca_secret: Option<String>,

    /// Front-proxy certificate CNs allowed to assert identities; empty allows any
    #[arg(long, env = "APERTURE_REQUESTHEADER_ALLOWED_NAMES", value_delimiter = ',')]
    pub requestheader_allowed_names: Vec<String>,

    /// Headers carrying the username from the front proxy
    #[arg(
        long,
        env = "APERTURE_REQUESTHEADER_USERNAME_HEADERS",
        value_delimiter = ',',
        default_value = "X-Remote-User"
    )]
    pub requestheader_username_headers: Vec<String>,

    /// Headers carrying groups from the front proxy
    #[arg(
        long,
        env = "APERTURE_REQUESTHEADER_GROUP_HEADERS",
        value_delimiter = ',',
        default_value = "X-Remote-Group"
    )]
    pub requestheader_group_headers: Vec<String>,

    /// Audiences requested in TokenReviews; empty uses the API server's
    #[arg(long, env = "APERTURE_TOKEN_AUDIENCES", value_delimiter = ',')]
    pub token_audiences: Vec<String>,

    /// Service fronting this server, deleted along with the APIServices on disable
    #[arg(long, env = "APERTURE_SERVICE_NAME")]
    pub service_name: Option<String>,

    /// Concurrent fetches per trust refresh
    #[arg(long, env = "APERTURE_TRUST_WORKERS", default_value_t = 2)]
    pub trust_workers: usize,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "APERTURE_LOG_TEXT")]
    pub log_text: bool,
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTPS_PORT))
}

impl Cli {
    /// Rotation settings from the flags
    pub fn rotator_config(&self) -> RotatorConfig {
        let validity = Duration::from_secs(self.cert_validity_days * 24 * 60 * 60);
        let renew_before = validity * u32::from(self.renew_before_percent) / 100;
        RotatorConfig::new(
            self.namespace.clone(),
            self.serving_secret.clone(),
            self.subject_names.clone(),
        )
        .with_validity(validity)
        .with_renew_before(renew_before)
        .with_check_interval(Duration::from_secs(self.rotation_check_secs))
    }

    /// Front-proxy settings from the flags
    pub fn request_header_config(&self) -> RequestHeaderConfig {
        RequestHeaderConfig {
            username_headers: self.requestheader_username_headers.clone(),
            group_headers: self.requestheader_group_headers.clone(),
            allowed_names: self.requestheader_allowed_names.clone(),
        }
    }
}

/// A resource to serve, parsed from `group/version/Kind/plural[/cluster]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub group_version: GroupVersion,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceSpec {
    pub fn descriptor(&self) -> ResourceDescriptor {
        let descriptor = ResourceDescriptor::new(self.kind.clone(), self.plural.clone());
        if self.namespaced {
            descriptor
        } else {
            descriptor.cluster_scoped()
        }
    }
}

impl FromStr for ResourceSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let namespaced = match parts.get(4) {
            None => true,
            Some(&"cluster") => false,
            Some(other) => return Err(format!("unknown scope {:?}, expected \"cluster\"", other)),
        };
        match parts.as_slice() {
            [group, version, kind, plural, ..] if parts.len() <= 5 => {
                if [group, version, kind, plural].iter().any(|p| p.is_empty()) {
                    return Err(format!("empty segment in resource {:?}", s));
                }
                Ok(Self {
                    group_version: GroupVersion::new(*group, *version),
                    kind: kind.to_string(),
                    plural: plural.to_string(),
                    namespaced,
                })
            }
            _ => Err(format!(
                "invalid resource {:?}, expected group/version/Kind/plural[/cluster]",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resource_specs() {
        let spec: ResourceSpec = "example.io/v1/Widget/widgets".parse().unwrap();
        assert_eq!(spec.group_version, GroupVersion::new("example.io", "v1"));
        assert_eq!(spec.kind, "Widget");
        assert_eq!(spec.plural, "widgets");
        assert!(spec.namespaced);
        assert!(spec.descriptor().namespaced);

        let spec: ResourceSpec = "example.io/v1/Gadget/gadgets/cluster".parse().unwrap();
        assert!(!spec.namespaced);
        assert!(!spec.descriptor().namespaced);
    }

    #[test]
    fn rejects_bad_resource_specs() {
        for bad in [
            "example.io/v1/Widget",
            "example.io//Widget/widgets",
            "example.io/v1/Widget/widgets/global",
            "a/b/c/d/cluster/extra",
        ] {
            assert!(bad.parse::<ResourceSpec>().is_err(), "{bad}");
        }
    }

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["aperture"]);
        assert_eq!(cli.bind_address.port(), DEFAULT_HTTPS_PORT);
        assert!(cli.enabled);
        assert!(!cli.standalone);
        assert_eq!(cli.subject_names, vec!["localhost".to_string()]);

        let rotation = cli.rotator_config();
        assert_eq!(rotation.validity, Duration::from_secs(365 * 24 * 60 * 60));
        assert_eq!(rotation.renew_before, Duration::from_secs(73 * 24 * 60 * 60));
        assert_eq!(rotation.check_interval, Duration::from_secs(3600));
    }

    #[test]
    fn repeated_and_delimited_resources() {
        let cli = Cli::parse_from([
            "aperture",
            "--resource",
            "example.io/v1/Widget/widgets,example.io/v1/Gadget/gadgets/cluster",
            "--resource",
            "other.io/v1beta1/Thing/things",
            "--enabled",
            "false",
        ]);
        assert_eq!(cli.resources.len(), 3);
        assert!(!cli.enabled);
    }
}
