//! Runtime configuration.
//!
//! The configuration file declares, per controller, the primary resource, its
//! dependents and references, and the external handlers bound to the
//! reconcile, finalize and sync paths, plus the optional admission webhook
//! endpoint. Loaded from YAML and validated before the manager starts.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::handler::Handler;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Controller declarations.
    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,
    /// Admission webhook endpoint, when serving webhooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
    /// Telemetry endpoint consumed by an external exporter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Config> {
        let raw = fs::read_to_string(path.as_ref())?;
        let config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole document.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for (i, controller) in self.controllers.iter().enumerate() {
            controller
                .validate()
                .map_err(|e| prefix(&format!("controllers[{i}]"), e))?;
            if !names.insert(controller.name.clone()) {
                return Err(Error::InvalidConfig(format!(
                    "controllers[{i}]: duplicate controller name '{}'",
                    controller.name
                )));
            }
        }

        if let Some(webhook) = &self.webhook {
            webhook.validate().map_err(|e| prefix("webhook", e))?;
        }

        if let Some(metrics) = &self.metrics {
            metrics.validate().map_err(|e| prefix("metrics", e))?;
        }

        Ok(())
    }
}

fn prefix(path: &str, err: Error) -> Error {
    match err {
        Error::InvalidConfig(msg) => Error::InvalidConfig(format!("{path}: {msg}")),
        other => other,
    }
}

/// A `(group, version, kind)` triple naming a cluster resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceRef {
    /// API group; empty for the core group.
    pub group: String,
    /// API version.
    pub version: String,
    /// Object kind.
    pub kind: String,
}

impl ResourceRef {
    /// Whether no field is set at all.
    pub fn is_empty(&self) -> bool {
        self.group.is_empty() && self.version.is_empty() && self.kind.is_empty()
    }

    /// `group/version` as it appears in `apiVersion`, or just the version
    /// for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// One controller: a primary resource plus its handlers.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Unique controller identifier, used in logs and task names.
    #[serde(default)]
    pub name: String,
    /// Primary resource this controller manages.
    #[serde(default)]
    pub resource: ResourceRef,
    /// Kinds owned by the primary.
    #[serde(default)]
    pub dependents: Vec<DependentConfig>,
    /// Kinds the primary reads but does not own.
    #[serde(default)]
    pub references: Vec<ReferenceConfig>,
    /// Reconcile handler; required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciler: Option<ReconcilerConfig>,
    /// Finalize handler; optional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizer: Option<HandlerConfig>,
    /// Periodic re-sync; optional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syncer: Option<SyncerConfig>,
}

impl ControllerConfig {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("name must be specified".into()));
        }
        if self.resource.is_empty() {
            return Err(Error::InvalidConfig("resource is empty".into()));
        }

        for (i, dep) in self.dependents.iter().enumerate() {
            if dep.resource.is_empty() {
                return Err(Error::InvalidConfig(format!("dependents[{i}] is empty")));
            }
        }

        for (i, reference) in self.references.iter().enumerate() {
            reference
                .validate()
                .map_err(|e| prefix(&format!("references[{i}]"), e))?;
        }

        match &self.reconciler {
            None => return Err(Error::InvalidConfig("reconciler must be specified".into())),
            Some(reconciler) => reconciler.validate().map_err(|e| prefix("reconciler", e))?,
        }

        if let Some(finalizer) = &self.finalizer {
            finalizer.validate().map_err(|e| prefix("finalizer", e))?;
        }

        Ok(())
    }

    /// Whether any dependent is declared `orphan`.
    pub fn has_orphan_dependents(&self) -> bool {
        self.dependents.iter().any(|d| d.orphan)
    }
}

/// A dependent kind and its deletion policy.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependentConfig {
    /// Dependent resource kind.
    #[serde(flatten)]
    pub resource: ResourceRef,
    /// Release ownership on primary deletion instead of cascading.
    #[serde(default)]
    pub orphan: bool,
}

/// A referenced kind and the path in the primary that names the instance.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceConfig {
    /// Referenced resource kind.
    #[serde(flatten)]
    pub resource: ResourceRef,
    /// Dotted path into the primary yielding the referenced object's name.
    #[serde(default)]
    pub name_field_path: String,
}

impl ReferenceConfig {
    fn validate(&self) -> Result<()> {
        if self.resource.is_empty() {
            return Err(Error::InvalidConfig("resource is empty".into()));
        }
        if self.name_field_path.is_empty() {
            return Err(Error::InvalidConfig(
                "nameFieldPath must be specified".into(),
            ));
        }
        Ok(())
    }
}

/// Reconcile handler binding.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerConfig {
    /// Handler transport.
    #[serde(flatten)]
    pub handler: HandlerConfig,
    /// Re-enqueue delay after each successful reconcile; absent means
    /// informer events drive re-entry.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub requeue_after: Option<Duration>,
    /// Log intended writes instead of performing them.
    #[serde(default)]
    pub observe: bool,
}

impl ReconcilerConfig {
    fn validate(&self) -> Result<()> {
        self.handler.validate()
    }
}

/// Periodic re-sync configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncerConfig {
    /// Tick interval; absent or zero disables the syncer.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,
}

/// A handler slot: exactly one transport variant.
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerConfig {
    /// Subprocess transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecHandlerConfig>,
    /// HTTP POST transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpHandlerConfig>,
    /// In-process transport; constructed programmatically, never from YAML.
    #[serde(skip)]
    pub func: Option<FuncHandlerConfig>,
}

impl HandlerConfig {
    /// Validate the exactly-one-variant rule and the chosen variant.
    pub fn validate(&self) -> Result<()> {
        let specified =
            self.exec.is_some() as usize + self.http.is_some() as usize + self.func.is_some() as usize;
        if specified == 0 {
            return Err(Error::InvalidConfig("handler must be specified".into()));
        }
        if specified > 1 {
            return Err(Error::InvalidConfig(
                "exactly one handler must be specified".into(),
            ));
        }

        if let Some(exec) = &self.exec {
            exec.validate()?;
        }
        if let Some(http) = &self.http {
            http.validate()?;
        }
        Ok(())
    }

    /// Shorthand for building an in-process handler slot in tests and
    /// embedders.
    pub fn from_func(handler: Arc<dyn Handler>) -> HandlerConfig {
        HandlerConfig {
            func: Some(FuncHandlerConfig { handler }),
            ..HandlerConfig::default()
        }
    }

    /// The transport timeout of the configured variant, if any.
    pub fn timeout(&self) -> Option<Duration> {
        match (&self.exec, &self.http) {
            (Some(exec), _) => exec.timeout,
            (_, Some(http)) => http.timeout,
            _ => None,
        }
    }
}

impl fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerConfig")
            .field("exec", &self.exec)
            .field("http", &self.http)
            .field("func", &self.func.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Subprocess transport configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecHandlerConfig {
    /// Command to launch.
    #[serde(default)]
    pub command: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; inherited when empty.
    #[serde(default)]
    pub working_dir: String,
    /// Additional environment variables.
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
    /// Kill the process when it runs longer than this.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Stream handler stderr to the runtime log.
    #[serde(default)]
    pub debug: bool,
}

impl ExecHandlerConfig {
    fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(Error::InvalidConfig("command must be specified".into()));
        }
        Ok(())
    }
}

/// HTTP POST transport configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpHandlerConfig {
    /// Endpoint URL.
    #[serde(default)]
    pub url: String,
    /// Mutual-TLS client configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<HttpTlsConfig>,
    /// Request timeout.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Log request and response bodies.
    #[serde(default)]
    pub debug: bool,
}

impl HttpHandlerConfig {
    fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(Error::InvalidConfig("url must be specified".into()));
        }
        if let Some(tls) = &self.tls {
            tls.validate().map_err(|e| prefix("tls", e))?;
        }
        Ok(())
    }
}

/// Client-side TLS material for the HTTP transport.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpTlsConfig {
    /// Client certificate (PEM).
    #[serde(default)]
    pub cert_file: String,
    /// Client private key (PEM).
    #[serde(default)]
    pub key_file: String,
    /// CA bundle used to verify the server (PEM).
    #[serde(default)]
    pub ca_cert_file: String,
}

impl HttpTlsConfig {
    fn validate(&self) -> Result<()> {
        if self.cert_file.is_empty() {
            return Err(Error::InvalidConfig("cert file must be specified".into()));
        }
        if self.key_file.is_empty() {
            return Err(Error::InvalidConfig("key file must be specified".into()));
        }
        require_readable(&self.cert_file, "cert file")?;
        require_readable(&self.key_file, "key file")?;
        if !self.ca_cert_file.is_empty() {
            require_readable(&self.ca_cert_file, "CA cert file")?;
        }
        Ok(())
    }
}

fn require_readable(path: &str, what: &str) -> Result<()> {
    fs::File::open(path)
        .map(|_| ())
        .map_err(|e| Error::InvalidConfig(format!("failed to read {what} '{path}': {e}")))
}

/// Admission webhook endpoint.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    /// Bind host; all interfaces when empty.
    #[serde(default)]
    pub host: String,
    /// Bind port.
    #[serde(default)]
    pub port: u16,
    /// Server certificate; mandatory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<WebhookTlsConfig>,
    /// Admission handler bindings.
    #[serde(default)]
    pub handlers: Vec<WebhookHandlerConfig>,
}

impl WebhookConfig {
    fn validate(&self) -> Result<()> {
        match &self.tls {
            None => return Err(Error::InvalidConfig("tls must be specified".into())),
            Some(tls) => tls.validate().map_err(|e| prefix("tls", e))?,
        }
        for (i, handler) in self.handlers.iter().enumerate() {
            handler
                .validate()
                .map_err(|e| prefix(&format!("handlers[{i}]"), e))?;
        }
        Ok(())
    }
}

/// Server TLS material for the admission endpoint.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookTlsConfig {
    /// Server certificate (PEM).
    #[serde(default)]
    pub cert_file: String,
    /// Server private key (PEM).
    #[serde(default)]
    pub key_file: String,
}

impl WebhookTlsConfig {
    fn validate(&self) -> Result<()> {
        if self.cert_file.is_empty() {
            return Err(Error::InvalidConfig("cert file must be specified".into()));
        }
        if self.key_file.is_empty() {
            return Err(Error::InvalidConfig("key file must be specified".into()));
        }
        Ok(())
    }
}

/// Admission handlers for one resource.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookHandlerConfig {
    /// Resource these handlers admit.
    #[serde(default)]
    pub resource: ResourceRef,
    /// Validating handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<HandlerConfig>,
    /// Mutating handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutator: Option<HandlerConfig>,
    /// Mutating handler whose patches must be signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injector: Option<InjectorConfig>,
}

impl WebhookHandlerConfig {
    fn validate(&self) -> Result<()> {
        if self.resource.is_empty() {
            return Err(Error::InvalidConfig("resource is empty".into()));
        }
        if let Some(validator) = &self.validator {
            validator.validate().map_err(|e| prefix("validator", e))?;
        }
        if let Some(mutator) = &self.mutator {
            mutator.validate().map_err(|e| prefix("mutator", e))?;
        }
        if let Some(injector) = &self.injector {
            injector.validate().map_err(|e| prefix("injector", e))?;
        }
        Ok(())
    }
}

/// Injector binding: a mutator plus the key used to verify its patches.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectorConfig {
    /// Handler transport.
    #[serde(flatten)]
    pub handler: HandlerConfig,
    /// Public key (PEM) verifying patch signatures.
    #[serde(default)]
    pub verify_key_file: String,
}

impl InjectorConfig {
    fn validate(&self) -> Result<()> {
        if self.verify_key_file.is_empty() {
            return Err(Error::InvalidConfig(
                "verification key file must be specified".into(),
            ));
        }
        require_readable(&self.verify_key_file, "verification key file")?;
        self.handler.validate()
    }
}

/// Telemetry endpoint served by an external exporter.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    /// Bind host.
    #[serde(default)]
    pub host: String,
    /// Bind port; required.
    #[serde(default)]
    pub port: u16,
}

impl MetricsConfig {
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::InvalidConfig("port must be specified".into()));
        }
        Ok(())
    }
}

/// In-process handler slot.
#[derive(Clone)]
pub struct FuncHandlerConfig {
    /// The handler itself.
    pub handler: Arc<dyn Handler>,
}

impl fmt::Debug for FuncHandlerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FuncHandlerConfig")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn exec_handler() -> HandlerConfig {
        HandlerConfig {
            exec: Some(ExecHandlerConfig {
                command: "/bin/true".into(),
                ..ExecHandlerConfig::default()
            }),
            ..HandlerConfig::default()
        }
    }

    fn minimal_controller() -> ControllerConfig {
        ControllerConfig {
            name: "hello".into(),
            resource: ResourceRef {
                group: "example.com".into(),
                version: "v1".into(),
                kind: "Hello".into(),
            },
            reconciler: Some(ReconcilerConfig {
                handler: exec_handler(),
                ..ReconcilerConfig::default()
            }),
            ..ControllerConfig::default()
        }
    }

    #[test]
    fn minimal_config_validates() {
        let config = Config {
            controllers: vec![minimal_controller()],
            ..Config::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn controller_requires_name_resource_and_reconciler() {
        let mut c = minimal_controller();
        c.name.clear();
        let err = Config {
            controllers: vec![c],
            ..Config::default()
        }
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("name must be specified"));

        let mut c = minimal_controller();
        c.resource = ResourceRef::default();
        let err = Config {
            controllers: vec![c],
            ..Config::default()
        }
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("resource is empty"));

        let mut c = minimal_controller();
        c.reconciler = None;
        let err = Config {
            controllers: vec![c],
            ..Config::default()
        }
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("reconciler must be specified"));
    }

    #[test]
    fn duplicate_controller_names_rejected() {
        let config = Config {
            controllers: vec![minimal_controller(), minimal_controller()],
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate controller name"));
    }

    #[test]
    fn handler_variant_must_be_exactly_one() {
        let none = HandlerConfig::default();
        assert!(none.validate().is_err());

        let both = HandlerConfig {
            exec: Some(ExecHandlerConfig {
                command: "/bin/true".into(),
                ..ExecHandlerConfig::default()
            }),
            http: Some(HttpHandlerConfig {
                url: "http://localhost:9999/".into(),
                ..HttpHandlerConfig::default()
            }),
            func: None,
        };
        let err = both.validate().unwrap_err();
        assert!(err.to_string().contains("exactly one handler"));
    }

    #[test]
    fn reference_requires_name_field_path() {
        let mut c = minimal_controller();
        c.references.push(ReferenceConfig {
            resource: ResourceRef {
                version: "v1".into(),
                kind: "ConfigMap".into(),
                ..ResourceRef::default()
            },
            name_field_path: String::new(),
        });
        let err = Config {
            controllers: vec![c],
            ..Config::default()
        }
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("nameFieldPath"));
    }

    #[test]
    fn http_tls_requires_readable_cert_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("client.crt");
        let key = dir.path().join("client.key");
        fs::write(&cert, "cert").unwrap();
        fs::write(&key, "key").unwrap();

        let mut http = HttpHandlerConfig {
            url: "https://handler.local/".into(),
            tls: Some(HttpTlsConfig {
                cert_file: cert.display().to_string(),
                key_file: key.display().to_string(),
                ca_cert_file: String::new(),
            }),
            ..HttpHandlerConfig::default()
        };
        http.validate().unwrap();

        // Empty paths inside a specified TLS block are rejected.
        http.tls.as_mut().unwrap().key_file.clear();
        let err = http.validate().unwrap_err();
        assert!(err.to_string().contains("key file must be specified"));

        // Unreadable paths are rejected too.
        http.tls.as_mut().unwrap().key_file = dir.path().join("missing.key").display().to_string();
        assert!(http.validate().is_err());
    }

    #[test]
    fn injector_requires_existing_key_file() {
        let mut injector = InjectorConfig {
            handler: exec_handler(),
            verify_key_file: "/nonexistent/verify.pem".into(),
        };
        assert!(injector.validate().is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not really a key").unwrap();
        injector.verify_key_file = file.path().display().to_string();
        injector.validate().unwrap();
    }

    #[test]
    fn webhook_requires_tls() {
        let webhook = WebhookConfig {
            port: 8443,
            ..WebhookConfig::default()
        };
        let err = webhook.validate().unwrap_err();
        assert!(err.to_string().contains("tls must be specified"));
    }

    #[test]
    fn metrics_requires_port() {
        let err = MetricsConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn yaml_round_trip_with_durations() {
        let yaml = r#"
controllers:
  - name: hello
    resource:
      group: example.com
      version: v1
      kind: Hello
    dependents:
      - version: v1
        kind: ConfigMap
        orphan: true
    references:
      - version: v1
        kind: ConfigMap
        nameFieldPath: spec.configRef.name
    reconciler:
      exec:
        command: /usr/local/bin/reconcile
        timeout: 30s
      requeueAfter: 1m
    syncer:
      interval: 5m
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        let controller = &config.controllers[0];
        assert!(controller.dependents[0].orphan);
        assert!(controller.has_orphan_dependents());
        assert_eq!(
            controller.references[0].name_field_path,
            "spec.configRef.name"
        );
        let reconciler = controller.reconciler.as_ref().unwrap();
        assert_eq!(reconciler.requeue_after, Some(Duration::from_secs(60)));
        assert_eq!(
            reconciler.handler.timeout(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            controller.syncer.as_ref().unwrap().interval,
            Some(Duration::from_secs(300))
        );
    }
}
