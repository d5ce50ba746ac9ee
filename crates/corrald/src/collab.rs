//! Local implementations of the external-collaborator seams.
//!
//! The real deployments plug in an AMQP/gRPC cloud transport, the IAM
//! daemon and a PKCS#11-backed crypto provider. The implementations here
//! cover what the daemon can do on its own: fetch images over HTTP or
//! from the filesystem, read the unit's node roster from IAM's exported
//! file, and keep everything buffered while no cloud link is attached.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use corral_alerts::AlertSender;
use corral_core::{
    Alert, CertificateChainInfo, CertificateInfo, DecryptInfo, ErrorInfo, ErrorKind,
    InstallCertStatus, NodeId, NodeInfo, SignInfo, SubjectId, UnitStatus,
};
use corral_images::{Downloader, ImageCrypto, ImageUnpacker};
use corral_monitoring::{MonitoringMessage, MonitoringSender};
use corral_network::DnsController;
use corral_node::IamNodeSource;
use corral_updates::{CertHandler, IdentProvider, StatusSender};

// ── Downloader ─────────────────────────────────────────────────────

/// Downloads over `http(s)://` via reqwest and copies `file://` sources.
/// Alternative URLs are tried in order.
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    async fn fetch_one(&self, url: &str, dest: &Path) -> Result<(), ErrorInfo> {
        if let Some(path) = url.strip_prefix("file://") {
            std::fs::copy(path, dest)
                .map_err(|e| ErrorInfo::new(ErrorKind::Runtime, e.to_string()))?;
            return Ok(());
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ErrorInfo::new(ErrorKind::Timeout, e.to_string()))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ErrorInfo::new(ErrorKind::Timeout, e.to_string()))?;

        std::fs::write(dest, &bytes)
            .map_err(|e| ErrorInfo::new(ErrorKind::Runtime, e.to_string()))
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, urls: &[String], dest: &Path) -> Result<(), ErrorInfo> {
        let mut last = ErrorInfo::new(ErrorKind::InvalidArgument, "no urls");

        for url in urls {
            match self.fetch_one(url, dest).await {
                Ok(()) => {
                    debug!(%url, "image downloaded");
                    return Ok(());
                }
                Err(e) => {
                    warn!(%url, error = %e, "download attempt failed");
                    last = e;
                }
            }
        }

        Err(last)
    }
}

// ── Crypto ─────────────────────────────────────────────────────────

/// Stand-in for the PKCS#11/OpenSSL crypto provider.
///
/// Plain images (no envelope, no signature) pass through; encrypted or
/// signed payloads are refused until the real provider is attached —
/// digest validation upstream still guards integrity.
pub struct PlainCrypto;

#[async_trait]
impl ImageCrypto for PlainCrypto {
    async fn decrypt(&self, src: &Path, dest: &Path, info: &DecryptInfo) -> Result<(), ErrorInfo> {
        if !info.key_wrap_alg.is_empty() || !info.wrapped_key.is_empty() {
            return Err(ErrorInfo::new(
                ErrorKind::NotSupported,
                "encrypted images require the platform crypto provider",
            ));
        }

        std::fs::copy(src, dest)
            .map(|_| ())
            .map_err(|e| ErrorInfo::new(ErrorKind::Runtime, e.to_string()))
    }

    async fn verify(
        &self,
        _path: &Path,
        info: &SignInfo,
        _chains: &[CertificateChainInfo],
    ) -> Result<(), ErrorInfo> {
        if !info.signature.is_empty() {
            return Err(ErrorInfo::new(
                ErrorKind::NotSupported,
                "signed images require the platform crypto provider",
            ));
        }
        Ok(())
    }
}

// ── Unpacker ───────────────────────────────────────────────────────

/// Places the validated archive into the blob directory as-is; the
/// node-side runtime understands the archive format.
pub struct ArchiveUnpacker;

#[async_trait]
impl ImageUnpacker for ArchiveUnpacker {
    async fn unpack(&self, archive: &Path, dest: &Path) -> Result<u64, ErrorInfo> {
        std::fs::create_dir_all(dest)
            .and_then(|_| std::fs::copy(archive, dest.join("content")))
            .map_err(|e| ErrorInfo::new(ErrorKind::Runtime, e.to_string()))
    }
}

// ── DNS ────────────────────────────────────────────────────────────

/// DNS restarts are executed by the node-local network component; the CM
/// only records that one is due.
pub struct NodeLocalDns;

#[async_trait]
impl DnsController for NodeLocalDns {
    async fn restart_dns_server(&self) -> Result<(), ErrorInfo> {
        debug!("dns restart requested");
        Ok(())
    }
}

// ── IAM ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct NodeRoster {
    #[serde(default)]
    nodes: Vec<NodeInfo>,
    #[serde(default)]
    subjects: Vec<SubjectId>,
}

/// IAM's provisioning view, read from the roster file the IAM daemon
/// exports next to its database.
pub struct FileIamSource {
    path: PathBuf,
}

impl FileIamSource {
    pub fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }

    fn roster(&self) -> NodeRoster {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(roster) => roster,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "bad node roster");
                    NodeRoster { nodes: Vec::new(), subjects: Vec::new() }
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                NodeRoster { nodes: Vec::new(), subjects: Vec::new() }
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read node roster");
                NodeRoster { nodes: Vec::new(), subjects: Vec::new() }
            }
        }
    }
}

impl IamNodeSource for FileIamSource {
    fn node_ids(&self) -> Vec<NodeId> {
        self.roster().nodes.into_iter().map(|n| n.node_id).collect()
    }

    fn node_info(&self, node_id: &str) -> Option<NodeInfo> {
        self.roster().nodes.into_iter().find(|n| n.node_id == node_id)
    }
}

impl IdentProvider for FileIamSource {
    fn unit_subjects(&self) -> Vec<SubjectId> {
        self.roster().subjects
    }
}

/// Stores received certificates on disk for the IAM daemon to pick up.
pub struct FileCertStore {
    dir: PathBuf,
}

impl FileCertStore {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }
}

#[async_trait]
impl CertHandler for FileCertStore {
    async fn install_certificates(&self, certs: &[CertificateInfo]) -> Vec<InstallCertStatus> {
        let mut statuses = Vec::new();

        for (index, cert) in certs.iter().enumerate() {
            let result = std::fs::create_dir_all(&self.dir).and_then(|_| {
                std::fs::write(
                    self.dir.join(format!("{}-{index}.der", cert.cert_type)),
                    &cert.certificate,
                )
            });

            statuses.push(InstallCertStatus {
                cert_type: cert.cert_type.clone(),
                serial: format!("{index}"),
                error: result
                    .err()
                    .map(|e| ErrorInfo::new(ErrorKind::Runtime, e.to_string())),
            });
        }

        info!(count = statuses.len(), "certificates stored");
        statuses
    }
}

// ── Cloud link ─────────────────────────────────────────────────────

/// Placeholder for the cloud transport. While detached the update
/// manager stays in disconnected mode, so these senders are never
/// reached; a real transport replaces this and drives `on_connect`.
pub struct DetachedCloud;

#[async_trait]
impl StatusSender for DetachedCloud {
    async fn send_unit_status(&self, _status: &UnitStatus) -> Result<(), ErrorInfo> {
        Err(ErrorInfo::new(ErrorKind::Timeout, "cloud link not attached"))
    }
}

#[async_trait]
impl AlertSender for DetachedCloud {
    async fn send_alerts(&self, _alerts: &[Alert]) -> Result<(), ErrorInfo> {
        Err(ErrorInfo::new(ErrorKind::Timeout, "cloud link not attached"))
    }
}

#[async_trait]
impl MonitoringSender for DetachedCloud {
    async fn send_monitoring(&self, _monitoring: &MonitoringMessage) -> Result<(), ErrorInfo> {
        Err(ErrorInfo::new(ErrorKind::Timeout, "cloud link not attached"))
    }
}
