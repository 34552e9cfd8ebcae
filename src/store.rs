//! Optional durable mirror of the router's in-memory maps.
//!
//! Stores are collaborators: they receive plain snapshots and never hold a
//! reference back into the service. The router works fully in memory; when
//! a store is configured it is fed on every mutation and read once at
//! startup.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::envelope::Envelope;
use crate::proto::{ManifestAdmission, NodeDescriptor, NodeManifest, PaymentReceipt, PaymentRequest};
use crate::timestamp::UnixMillis;

/// Everything a store can resurrect after a restart.
#[derive(Debug, Default, Clone)]
pub struct RouterSnapshot {
    pub nodes: Vec<NodeDescriptor>,
    pub payment_requests: Vec<(String, Envelope<PaymentRequest>)>,
    pub payment_receipts: Vec<(String, Envelope<PaymentReceipt>)>,
    pub manifests: Vec<Envelope<NodeManifest>>,
    pub manifest_admissions: Vec<ManifestAdmission>,
}

/// Cutoffs applied by the store's own retention pass.
#[derive(Debug, Clone, Copy)]
pub struct StoreRetention {
    pub node_cutoff: UnixMillis,
    pub payment_request_cutoff: UnixMillis,
    pub payment_receipt_cutoff: UnixMillis,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Durable router store contract.
#[async_trait]
pub trait RouterStore: Send + Sync {
    async fn load(&self) -> Result<RouterSnapshot, StoreError>;
    async fn save_node(&self, node: &NodeDescriptor) -> Result<(), StoreError>;
    async fn save_payment_request(
        &self,
        key: &str,
        envelope: &Envelope<PaymentRequest>,
    ) -> Result<(), StoreError>;
    async fn save_payment_receipt(
        &self,
        key: &str,
        envelope: &Envelope<PaymentReceipt>,
    ) -> Result<(), StoreError>;
    async fn save_manifest(&self, manifest: &Envelope<NodeManifest>) -> Result<(), StoreError>;
    async fn save_manifest_admission(&self, admission: &ManifestAdmission) -> Result<(), StoreError>;
    /// Remove rows older than the configured horizons.
    async fn apply_retention(&self, retention: StoreRetention) -> Result<(), StoreError>;
}

/// Reference in-memory store, used in tests and as the durable-variant
/// behavioral baseline.
#[derive(Debug, Default)]
pub struct MemoryRouterStore {
    nodes: DashMap<String, NodeDescriptor>,
    payment_requests: DashMap<String, Envelope<PaymentRequest>>,
    payment_receipts: DashMap<String, Envelope<PaymentReceipt>>,
    manifests: DashMap<String, Envelope<NodeManifest>>,
    manifest_admissions: DashMap<String, ManifestAdmission>,
}

impl MemoryRouterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RouterStore for MemoryRouterStore {
    async fn load(&self) -> Result<RouterSnapshot, StoreError> {
        Ok(RouterSnapshot {
            nodes: self.nodes.iter().map(|e| e.value().clone()).collect(),
            payment_requests: self
                .payment_requests
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            payment_receipts: self
                .payment_receipts
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            manifests: self.manifests.iter().map(|e| e.value().clone()).collect(),
            manifest_admissions: self
                .manifest_admissions
                .iter()
                .map(|e| e.value().clone())
                .collect(),
        })
    }

    async fn save_node(&self, node: &NodeDescriptor) -> Result<(), StoreError> {
        self.nodes.insert(node.node_id.clone(), node.clone());
        Ok(())
    }

    async fn save_payment_request(
        &self,
        key: &str,
        envelope: &Envelope<PaymentRequest>,
    ) -> Result<(), StoreError> {
        self.payment_requests.insert(key.to_owned(), envelope.clone());
        Ok(())
    }

    async fn save_payment_receipt(
        &self,
        key: &str,
        envelope: &Envelope<PaymentReceipt>,
    ) -> Result<(), StoreError> {
        self.payment_receipts.insert(key.to_owned(), envelope.clone());
        Ok(())
    }

    async fn save_manifest(&self, manifest: &Envelope<NodeManifest>) -> Result<(), StoreError> {
        self.manifests
            .insert(manifest.payload.node_id.clone(), manifest.clone());
        Ok(())
    }

    async fn save_manifest_admission(&self, admission: &ManifestAdmission) -> Result<(), StoreError> {
        self.manifest_admissions
            .insert(admission.node_id.clone(), admission.clone());
        Ok(())
    }

    async fn apply_retention(&self, retention: StoreRetention) -> Result<(), StoreError> {
        self.nodes.retain(|_, node| {
            node.last_heartbeat_ms
                .is_some_and(|hb| hb >= retention.node_cutoff)
        });
        self.payment_requests
            .retain(|_, env| env.payload.expires_at_ms >= retention.payment_request_cutoff);
        self.payment_receipts
            .retain(|_, env| env.payload.paid_at_ms >= retention.payment_receipt_cutoff);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keys;
    use crate::payments::synthesize_request;
    use crate::proto::{NodeCapacity, PayeeType};

    fn node(node_id: &str, heartbeat: UnixMillis) -> NodeDescriptor {
        NodeDescriptor {
            node_id: node_id.to_owned(),
            key_id: Keys::generate().npub(),
            endpoint: "http://127.0.0.1:1".parse().unwrap(),
            capacity: NodeCapacity {
                max_concurrent: 1,
                current_load: 0,
            },
            capabilities: vec![],
            last_heartbeat_ms: Some(heartbeat),
            trust_score: None,
        }
    }

    #[tokio::test]
    async fn snapshot_roundtrip() {
        let store = MemoryRouterStore::new();
        let keys = Keys::generate();
        store.save_node(&node("n1", UnixMillis(10))).await.unwrap();
        let request = synthesize_request(
            "r1",
            PayeeType::Node,
            "n1",
            10.0,
            None,
            None,
            UnixMillis(10),
        );
        let env = Envelope::signed(request, &keys).unwrap();
        store.save_payment_request("r1|node|n1", &env).await.unwrap();

        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.payment_requests.len(), 1);
    }

    #[tokio::test]
    async fn retention_drops_old_rows() {
        let store = MemoryRouterStore::new();
        store.save_node(&node("old", UnixMillis(10))).await.unwrap();
        store.save_node(&node("new", UnixMillis(100))).await.unwrap();
        store
            .apply_retention(StoreRetention {
                node_cutoff: UnixMillis(50),
                payment_request_cutoff: UnixMillis(0),
                payment_receipt_cutoff: UnixMillis(0),
            })
            .await
            .unwrap();
        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.nodes[0].node_id, "new");
    }
}
