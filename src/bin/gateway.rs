//! TokenBridge gateway: serves the CSR endpoint and runs the trust store
//! expiry checker.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokenbridge::admin::CsrApi;
use tokenbridge::audit::{AuditSink, InMemoryAuditSink};
use tokenbridge::csr::{CsrSigner, CsrSigningService, IdentityProvider, InMemoryIdentityProvider};
use tokenbridge::security::metrics::SecurityMetrics;
use tokenbridge::security::{
    CertificateExpiryChecker, ClientCertificateRegistry, InMemoryClientCertStore,
    InMemoryTrustAnchorRepository, TrustFlag, TrustStore, TrustedCertificateRecord,
};
use tokenbridge::Config;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tokenbridge-gateway", version, about = "Credential exchange gateway")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "config/gateway.toml")]
    config: String,

    /// Override csr.listen_addr
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    info!("Loading configuration from: {}", args.config);
    let config = if std::path::Path::new(&args.config).exists() {
        Config::from_file(&args.config).with_context(|| format!("failed to load {}", args.config))?
    } else {
        warn!("{} not found, using defaults", args.config);
        Config::default()
    };
    config.validate().context("invalid configuration")?;

    let metrics = Arc::new(SecurityMetrics::new());
    let audit: Arc<dyn AuditSink> = Arc::new(InMemoryAuditSink::new(10_000));

    let trust_store = Arc::new(TrustStore::new(
        Arc::new(InMemoryTrustAnchorRepository::new()),
        config.trust_store.cache_ttl(),
        metrics.clone(),
    ));

    let registry = Arc::new(ClientCertificateRegistry::new(Arc::new(InMemoryClientCertStore::new()))?);
    let providers: Vec<Arc<dyn IdentityProvider>> = config
        .identity
        .providers
        .iter()
        .map(|p| Arc::new(InMemoryIdentityProvider::from_config(p)) as Arc<dyn IdentityProvider>)
        .collect();
    info!("Loaded {} identity providers", providers.len());

    let signer = CsrSigner::from_config(&config.csr).context("failed to prepare the signing CA")?;
    let ca_record = TrustedCertificateRecord::from_der(
        config.csr.ca_common_name.clone(),
        signer.ca_certificate_der(),
        [TrustFlag::SigningClientCerts, TrustFlag::TrustAnchor],
    )?;
    trust_store.save(ca_record).await?;

    let service = Arc::new(CsrSigningService::new(
        config.csr.enabled,
        providers,
        registry,
        signer,
        audit.clone(),
        metrics.clone(),
    ));

    let expiry_checker = CertificateExpiryChecker::new(
        trust_store.clone(),
        audit.clone(),
        metrics.clone(),
        config.expiry_check.clone(),
    );
    if config.expiry_check.enabled {
        expiry_checker.start()?;
    }

    let addr: SocketAddr = match args.listen {
        Some(addr) => addr,
        None => config
            .csr
            .listen_addr
            .parse()
            .with_context(|| format!("invalid csr.listen_addr '{}'", config.csr.listen_addr))?,
    };
    let tls = match (&config.csr.tls_cert_path, &config.csr.tls_key_path) {
        (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
        _ => None,
    };
    let api = CsrApi::new(service, metrics.clone(), config.csr.tls_enabled());

    tokio::select! {
        result = api.serve(addr, tls) => result?,
        _ = signal::ctrl_c() => info!("Received shutdown signal (Ctrl+C)"),
    }

    expiry_checker.stop();
    info!("Gateway stopped");
    Ok(())
}
