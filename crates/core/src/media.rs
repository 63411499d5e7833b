//! Media router seam
//!
//! The coordination core only needs three things from an SFU: a router per
//! room, transports on that router, and a way to close it. [`LocalMediaRouter`]
//! is an in-process stand-in that hands out descriptors built from the
//! configured announced address and port range.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::MediaConfig;
use crate::error::DependencyError;

/// Parameters a client needs to connect a WebRTC transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    pub transport_id: String,
    pub ice_parameters: serde_json::Value,
    pub ice_candidates: serde_json::Value,
    pub dtls_parameters: serde_json::Value,
}

/// Allocates one router per room
#[async_trait]
pub trait MediaRouter: Send + Sync {
    async fn allocate_router(&self) -> Result<Arc<dyn RouterHandle>, DependencyError>;
}

/// A router owned by exactly one room
#[async_trait]
pub trait RouterHandle: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;

    async fn create_transport(&self) -> Result<TransportDescriptor, DependencyError>;

    /// Release the router; further transport requests fail
    async fn close(&self);
}

/// In-process router factory
#[derive(Debug, Clone)]
pub struct LocalMediaRouter {
    config: MediaConfig,
}

impl LocalMediaRouter {
    pub fn new(config: MediaConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MediaRouter for LocalMediaRouter {
    async fn allocate_router(&self) -> Result<Arc<dyn RouterHandle>, DependencyError> {
        if self.config.rtc_min_port > self.config.rtc_max_port {
            return Err(DependencyError::RouterAllocation(format!(
                "empty port range {}-{}",
                self.config.rtc_min_port, self.config.rtc_max_port
            )));
        }
        let router = LocalRouter {
            id: Uuid::new_v4().to_string(),
            config: self.config.clone(),
            closed: AtomicBool::new(false),
            transports: AtomicU64::new(0),
        };
        info!(router_id = %router.id, "Router allocated");
        Ok(Arc::new(router))
    }
}

#[derive(Debug)]
struct LocalRouter {
    id: String,
    config: MediaConfig,
    closed: AtomicBool,
    transports: AtomicU64,
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_fingerprint() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[async_trait]
impl RouterHandle for LocalRouter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_transport(&self) -> Result<TransportDescriptor, DependencyError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DependencyError::Transport(format!(
                "router {} is closed",
                self.id
            )));
        }

        let port = rand::thread_rng().gen_range(self.config.rtc_min_port..=self.config.rtc_max_port);
        let transport_id = Uuid::new_v4().to_string();
        self.transports.fetch_add(1, Ordering::Relaxed);

        debug!(router_id = %self.id, transport_id = %transport_id, port, "Transport created");

        Ok(TransportDescriptor {
            transport_id,
            ice_parameters: json!({
                "usernameFragment": random_token(16),
                "password": random_token(32),
                "iceLite": true,
            }),
            ice_candidates: json!([{
                "foundation": "udpcandidate",
                "ip": self.config.announced_ip,
                "port": port,
                "priority": 1_076_302_079u32,
                "protocol": "udp",
                "type": "host",
            }]),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{
                    "algorithm": "sha-256",
                    "value": random_fingerprint(),
                }],
            }),
        })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(
                router_id = %self.id,
                transports = self.transports.load(Ordering::Relaxed),
                "Router closed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_uses_announced_address() {
        let media = LocalMediaRouter::new(MediaConfig {
            announced_ip: "203.0.113.7".into(),
            rtc_min_port: 41_000,
            rtc_max_port: 41_000,
        });
        let router = media.allocate_router().await.unwrap();
        let transport = router.create_transport().await.unwrap();

        assert_eq!(transport.ice_candidates[0]["ip"], "203.0.113.7");
        assert_eq!(transport.ice_candidates[0]["port"], 41_000);
        assert_eq!(transport.dtls_parameters["fingerprints"][0]["algorithm"], "sha-256");
    }

    #[tokio::test]
    async fn test_closed_router_rejects_transports() {
        let media = LocalMediaRouter::new(MediaConfig::default());
        let router = media.allocate_router().await.unwrap();
        router.close().await;
        router.close().await;
        assert!(matches!(
            router.create_transport().await,
            Err(DependencyError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_inverted_port_range_fails_allocation() {
        let media = LocalMediaRouter::new(MediaConfig {
            rtc_min_port: 50_000,
            rtc_max_port: 40_000,
            ..Default::default()
        });
        assert!(matches!(
            media.allocate_router().await,
            Err(DependencyError::RouterAllocation(_))
        ));
    }
}
