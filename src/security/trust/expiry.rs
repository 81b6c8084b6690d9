//! Periodic trust anchor expiry sweep.
//!
//! Each sweep snapshots the anchors, classifies the time left on each one and
//! emits a single aggregated audit event listing every anchor inside the
//! `fine_days` horizon.

use super::store::TrustStore;
use crate::audit::{AuditActor, AuditEvent, AuditSink};
use crate::config::ExpiryCheckConfig;
use crate::error::Result;
use crate::security::metrics::SecurityMetrics;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ExpirySeverity {
    Fine,
    Info,
    Warning,
    Expired,
}

impl ExpirySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpirySeverity::Fine => "FINE",
            ExpirySeverity::Info => "INFO",
            ExpirySeverity::Warning => "WARNING",
            ExpirySeverity::Expired => "EXPIRED",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpiryFinding {
    pub id: String,
    pub name: String,
    pub subject_dn: String,
    pub severity: ExpirySeverity,
    pub remaining: String,
}

/// Severity for the time left on a certificate; `None` when it is outside the
/// `fine_days` horizon.
pub fn classify(remaining: ChronoDuration, config: &ExpiryCheckConfig) -> Option<ExpirySeverity> {
    if remaining <= ChronoDuration::zero() {
        Some(ExpirySeverity::Expired)
    } else if remaining <= ChronoDuration::days(config.warning_days as i64) {
        Some(ExpirySeverity::Warning)
    } else if remaining <= ChronoDuration::days(config.info_days as i64) {
        Some(ExpirySeverity::Info)
    } else if remaining <= ChronoDuration::days(config.fine_days as i64) {
        Some(ExpirySeverity::Fine)
    } else {
        None
    }
}

/// Human readable time left: minutes under 3 hours, hours under 3 days,
/// days otherwise, with one decimal.
pub fn format_remaining(remaining: ChronoDuration) -> String {
    let expired = remaining <= ChronoDuration::zero();
    let secs = remaining.num_seconds().unsigned_abs() as f64;

    let amount = if secs < 3.0 * 3600.0 {
        format!("{:.1} minutes", secs / 60.0)
    } else if secs < 3.0 * 86400.0 {
        format!("{:.1} hours", secs / 3600.0)
    } else {
        format!("{:.1} days", secs / 86400.0)
    };

    if expired {
        format!("expired {} ago", amount)
    } else {
        amount
    }
}

pub struct CertificateExpiryChecker {
    trust_store: Arc<TrustStore>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<SecurityMetrics>,
    config: RwLock<ExpiryCheckConfig>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CertificateExpiryChecker {
    pub fn new(
        trust_store: Arc<TrustStore>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<SecurityMetrics>,
        config: ExpiryCheckConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            trust_store,
            audit,
            metrics,
            config: RwLock::new(config),
            task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> ExpiryCheckConfig {
        self.config.read().clone()
    }

    /// Run one sweep now
    pub async fn sweep(&self) -> Result<Vec<ExpiryFinding>> {
        let config = self.config();
        let anchors = self.trust_store.all().await?;
        let now = Utc::now();

        let mut findings: Vec<ExpiryFinding> = anchors
            .iter()
            .filter_map(|anchor| {
                let remaining = anchor.not_after - now;
                classify(remaining, &config).map(|severity| ExpiryFinding {
                    id: anchor.id.clone(),
                    name: anchor.name.clone(),
                    subject_dn: anchor.subject_dn.clone(),
                    severity,
                    remaining: format_remaining(remaining),
                })
            })
            .collect();
        findings.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.id.cmp(&b.id)));

        self.metrics.record_expiry_sweep();
        debug!(
            "Expiry sweep checked {} anchors, {} within horizon",
            anchors.len(),
            findings.len()
        );

        if let Some(worst) = findings.first().map(|f| f.severity) {
            match worst {
                ExpirySeverity::Expired | ExpirySeverity::Warning => {
                    warn!("{} trusted certificates expire soon or have expired", findings.len())
                }
                _ => info!("{} trusted certificates approaching expiry", findings.len()),
            }

            let mut event = AuditEvent::new(AuditActor::System, "trust_store.expiry_check", worst.as_str());
            for finding in &findings {
                event = event.with_detail(
                    finding.id.clone(),
                    format!(
                        "{} [{}] {}",
                        finding.subject_dn,
                        finding.severity.as_str(),
                        finding.remaining
                    ),
                );
            }
            self.audit.record(event);
        }

        Ok(findings)
    }

    /// Start the periodic sweep with the current period
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let config = self.config();
        config.validate()?;
        self.spawn_task(config);
        Ok(())
    }

    /// Replace the configuration and restart the timer with the new period.
    /// An invalid configuration is refused and the running task is kept.
    pub fn reschedule(self: &Arc<Self>, config: ExpiryCheckConfig) -> Result<()> {
        config.validate()?;
        *self.config.write() = config.clone();
        info!("Rescheduling certificate expiry check every {} hours", config.period_hours);
        self.spawn_task(config);
        Ok(())
    }

    fn spawn_task(self: &Arc<Self>, config: ExpiryCheckConfig) {
        let mut task = self.task.lock();
        if let Some(previous) = task.take() {
            previous.abort();
        }
        if !config.enabled {
            debug!("Certificate expiry check disabled");
            return;
        }

        let checker: Weak<Self> = Arc::downgrade(self);
        let period = config.period();
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let checker = match checker.upgrade() {
                    Some(checker) => checker,
                    None => break,
                };
                if let Err(e) = checker.sweep().await {
                    error!("Certificate expiry sweep failed: {}", e);
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for CertificateExpiryChecker {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
