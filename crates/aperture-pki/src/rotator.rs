//! Serving certificate rotation
//!
//! The rotator owns one secret-store record (`tls.crt` / `tls.key`) holding a
//! self-signed certificate for the configured names. It:
//!
//! - loads the record at construction, if present
//! - regenerates when the record is missing, unparseable, does not cover the
//!   configured names, or has less than `renew_before` validity left
//! - writes with create-if-absent / update-if-present, never deletes
//! - adopts material written by another replica instead of regenerating
//!
//! Readers take lock-free snapshots through [`CertificateRotator::current`].
//! [`CertificateRotator::subscribe`] notifies on every change.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use rustls::sign::CertifiedKey;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use aperture_common::{
    SecretEvent, SecretRecord, SecretSelector, SecretStore, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
    TLS_CERT_KEY, TLS_KEY_KEY,
};

use crate::pki::{
    generate_self_signed, parse_pem_bundle, CertificateInfo, PkiError, Result,
    ROTATION_THRESHOLD, SERVING_CERT_VALIDITY_DAYS,
};

/// Default interval between expiry checks
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Pause before re-establishing a watch that ended
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Rotation settings
#[derive(Debug, Clone)]
pub struct RotatorConfig {
    /// Namespace of the persisted record
    pub namespace: String,
    /// Name of the persisted record
    pub secret_name: String,
    /// Subject CN
    pub common_name: String,
    /// DNS names and IPs the certificate must cover
    pub subject_names: Vec<String>,
    /// Lifetime of generated certificates
    pub validity: Duration,
    /// Regenerate when less than this much validity remains
    pub renew_before: Duration,
    /// How often expiry is checked
    pub check_interval: Duration,
}

impl RotatorConfig {
    /// Config with the default lifetime, threshold and interval
    pub fn new(
        namespace: impl Into<String>,
        secret_name: impl Into<String>,
        subject_names: Vec<String>,
    ) -> Self {
        let validity = Duration::from_secs(SERVING_CERT_VALIDITY_DAYS as u64 * 24 * 60 * 60);
        let renew_before = Duration::from_secs(
            (validity.as_secs() as f64 * (1.0 - ROTATION_THRESHOLD)).round() as u64,
        );
        let common_name = subject_names
            .first()
            .cloned()
            .unwrap_or_else(|| "aperture".to_string());
        Self {
            namespace: namespace.into(),
            secret_name: secret_name.into(),
            common_name,
            subject_names,
            validity,
            renew_before,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Override the certificate lifetime
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    /// Override the renewal threshold
    pub fn with_renew_before(mut self, renew_before: Duration) -> Self {
        self.renew_before = renew_before;
        self
    }

    /// Override the check interval
    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }
}

/// A parsed, ready-to-serve certificate and key
pub struct ServingCertificate {
    cert_pem: String,
    key_pem: Zeroizing<String>,
    info: CertificateInfo,
    certified_key: Arc<CertifiedKey>,
}

impl ServingCertificate {
    /// Parse PEM material into a rustls identity
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let chain = parse_pem_bundle(cert_pem)?;
        let leaf = chain
            .first()
            .ok_or_else(|| PkiError::ParseError("no certificate in PEM".to_string()))?;
        let info = CertificateInfo::from_der(leaf)?;

        let key_der = parse_private_key(key_pem)?;
        let signing_key = any_supported_type(&key_der)
            .map_err(|e| PkiError::ParseError(format!("unsupported private key: {}", e)))?;
        let certs = chain.into_iter().map(CertificateDer::from).collect();

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: Zeroizing::new(key_pem.to_string()),
            info,
            certified_key: Arc::new(CertifiedKey::new(certs, signing_key)),
        })
    }

    fn from_record(record: &SecretRecord) -> Result<Self> {
        let cert_pem = record
            .data_str(TLS_CERT_KEY)
            .ok_or_else(|| PkiError::ParseError(format!("record missing {}", TLS_CERT_KEY)))?;
        let key_pem = record
            .data_str(TLS_KEY_KEY)
            .ok_or_else(|| PkiError::ParseError(format!("record missing {}", TLS_KEY_KEY)))?;
        Self::from_pem(cert_pem, key_pem)
    }

    /// PEM certificate chain
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// PEM private key
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Validity and subject details
    pub fn info(&self) -> &CertificateInfo {
        &self.info
    }

    /// Expiry as a Unix timestamp
    pub fn not_after(&self) -> i64 {
        self.info.not_after
    }

    /// rustls identity
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.certified_key.clone()
    }

    /// Whether `server_name` is one of the certificate's SANs
    pub fn matches_name(&self, server_name: &str) -> bool {
        self.info
            .subject_names
            .iter()
            .any(|n| n.eq_ignore_ascii_case(server_name))
    }
}

impl fmt::Debug for ServingCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServingCertificate")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

fn parse_private_key(key_pem: &str) -> Result<PrivateKeyDer<'static>> {
    let block = ::pem::parse(key_pem.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse key PEM: {}", e)))?;
    let der = block.contents().to_vec();
    match block.tag() {
        "PRIVATE KEY" => Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der))),
        "RSA PRIVATE KEY" => Ok(PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(der))),
        "EC PRIVATE KEY" => Ok(PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(der))),
        other => Err(PkiError::ParseError(format!(
            "unsupported key PEM tag '{}'",
            other
        ))),
    }
}

/// Keeps the persisted serving certificate valid
pub struct CertificateRotator {
    config: RotatorConfig,
    store: Arc<dyn SecretStore>,
    current: ArcSwapOption<ServingCertificate>,
    changes: watch::Sender<Option<Arc<ServingCertificate>>>,
}

impl CertificateRotator {
    /// Create a rotator and load any existing material
    ///
    /// A missing or broken record is not an error here; the first check in
    /// [`run`](Self::run) or [`rotate_if_needed`](Self::rotate_if_needed)
    /// replaces it.
    pub async fn new(config: RotatorConfig, store: Arc<dyn SecretStore>) -> Self {
        let rotator = Self {
            config,
            store,
            current: ArcSwapOption::empty(),
            changes: watch::Sender::new(None),
        };

        match rotator
            .store
            .get(&rotator.config.namespace, &rotator.config.secret_name)
            .await
        {
            Ok(Some(record)) => match ServingCertificate::from_record(&record) {
                Ok(cert) => {
                    info!(
                        secret = %rotator.config.secret_name,
                        not_after = cert.not_after(),
                        "loaded serving certificate"
                    );
                    rotator.publish(Arc::new(cert));
                }
                Err(e) => warn!(error = %e, "stored serving certificate is unusable"),
            },
            Ok(None) => debug!(secret = %rotator.config.secret_name, "no serving certificate stored yet"),
            Err(e) => warn!(error = %e, "failed to load serving certificate"),
        }

        rotator
    }

    /// Rotation settings
    pub fn config(&self) -> &RotatorConfig {
        &self.config
    }

    /// Current certificate, if any has been loaded or generated
    pub fn current(&self) -> Option<Arc<ServingCertificate>> {
        self.current.load_full()
    }

    /// PEM bundle of the current certificate, for registration records
    pub fn current_pem(&self) -> Option<String> {
        self.current().map(|c| c.cert_pem().to_string())
    }

    /// Receiver notified whenever the certificate changes
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ServingCertificate>>> {
        self.changes.subscribe()
    }

    fn publish(&self, cert: Arc<ServingCertificate>) {
        self.current.store(Some(cert.clone()));
        self.changes.send_replace(Some(cert));
    }

    fn needs_rotation(&self, cert: &ServingCertificate) -> bool {
        let remaining = cert.info().remaining_secs();
        remaining < self.config.renew_before.as_secs() as i64
            || !cert.info().covers(&self.config.subject_names)
    }

    /// Generate and persist a new certificate if the stored one is due
    ///
    /// Returns whether this call wrote new material. Concurrent callers,
    /// in this process or another replica, are arbitrated by the store: the
    /// loser of a write conflict adopts the winner's record.
    pub async fn rotate_if_needed(&self) -> Result<bool> {
        let ns = &self.config.namespace;
        let name = &self.config.secret_name;

        let stored = self.store.get(ns, name).await?;
        if let Some(record) = &stored {
            match ServingCertificate::from_record(record) {
                Ok(cert) if !self.needs_rotation(&cert) => {
                    self.adopt(cert);
                    return Ok(false);
                }
                Ok(cert) => debug!(
                    remaining_secs = cert.info().remaining_secs(),
                    "serving certificate due for rotation"
                ),
                Err(e) => warn!(error = %e, "stored serving certificate is unusable, replacing"),
            }
        }

        let (cert_pem, key_pem) = generate_self_signed(
            &self.config.common_name,
            &self.config.subject_names,
            self.config.validity,
        )?;
        let key_pem = Zeroizing::new(key_pem);
        let cert = Arc::new(ServingCertificate::from_pem(&cert_pem, &key_pem)?);

        let written = match stored {
            Some(mut record) => {
                record
                    .data
                    .insert(TLS_CERT_KEY.to_string(), cert_pem.into_bytes());
                record
                    .data
                    .insert(TLS_KEY_KEY.to_string(), key_pem.as_bytes().to_vec());
                self.store.update(record).await
            }
            None => {
                let record = SecretRecord::new(ns.clone(), name.clone())
                    .with_label(MANAGED_BY_LABEL, MANAGED_BY_VALUE)
                    .with_data(TLS_CERT_KEY, cert_pem.into_bytes())
                    .with_data(TLS_KEY_KEY, key_pem.as_bytes().to_vec());
                self.store.create(record).await
            }
        };

        match written {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                info!(secret = %name, "serving certificate written concurrently, adopting stored record");
                self.adopt_stored().await?;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            secret = %name,
            not_after = cert.not_after(),
            names = ?self.config.subject_names,
            "rotated serving certificate"
        );
        self.publish(cert);
        Ok(true)
    }

    /// Re-read the record after losing a write race and adopt it if usable
    async fn adopt_stored(&self) -> Result<()> {
        let ns = &self.config.namespace;
        let name = &self.config.secret_name;
        match self.store.get(ns, name).await? {
            Some(record) => match ServingCertificate::from_record(&record) {
                Ok(cert) if !self.needs_rotation(&cert) => self.adopt(cert),
                Ok(_) => warn!(secret = %name, "concurrently written certificate is already due, retrying next check"),
                Err(e) => warn!(secret = %name, error = %e, "concurrently written certificate is unusable"),
            },
            None => warn!(secret = %name, "serving certificate vanished after a write conflict"),
        }
        Ok(())
    }

    /// Take material found in the store unless it is what we already serve
    /// or older than it
    fn adopt(&self, cert: ServingCertificate) {
        if let Some(current) = self.current() {
            if current.cert_pem() == cert.cert_pem() || current.not_after() > cert.not_after() {
                return;
            }
        }
        info!(not_after = cert.not_after(), "adopted serving certificate from store");
        self.publish(Arc::new(cert));
    }

    fn on_event(&self, event: SecretEvent) {
        match event {
            SecretEvent::Applied(record) => match ServingCertificate::from_record(&record) {
                Ok(cert) => self.adopt(cert),
                Err(e) => warn!(error = %e, "ignoring unusable serving certificate update"),
            },
            SecretEvent::Deleted(_) => {
                debug!("serving certificate record deleted, recreating on next check")
            }
        }
    }

    /// Check now and then every interval until `cancel` fires
    ///
    /// Out-of-band changes to the record are adopted as they happen.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            secret = %self.config.secret_name,
            interval_secs = self.config.check_interval.as_secs(),
            "starting certificate rotator"
        );

        let selector = SecretSelector::named(&self.config.namespace, &self.config.secret_name);
        let mut changes = self.store.watch(&selector);
        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("certificate rotator stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.rotate_if_needed().await {
                        error!(error = %e, "certificate rotation failed, retrying next interval");
                    }
                }
                event = changes.next() => match event {
                    Some(event) => self.on_event(event),
                    None => {
                        warn!("serving certificate watch ended, re-establishing");
                        tokio::select! {
                            _ = cancel.cancelled() => continue,
                            _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
                        }
                        changes = self.store.watch(&selector);
                    }
                },
            }
        }
    }
}

impl fmt::Debug for CertificateRotator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRotator")
            .field("config", &self.config)
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}
