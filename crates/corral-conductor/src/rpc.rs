//! RPC envelope and dispatch.
//!
//! The conductor is addressed over a topic-based message bus; the bus
//! client itself lives outside this crate. What is defined here is the
//! wire shape: a request envelope carrying the caller's context and a
//! correlation id, a tagged method enum, and a reply that mirrors the
//! correlation id and carries either a JSON payload or a fault from the
//! error taxonomy.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use corral_common::{Error, RequestContext};

use crate::conductor::{
    ClusterCreateRequest, ClusterUpdate, Conductor, NodeGroupCreateRequest, NodeGroupUpdate,
    ResizeRequest, TemplateCreateRequest, UpgradeRequest,
};

/// A request as read off the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub correlation_id: Uuid,
    pub context: RequestContext,
    #[serde(flatten)]
    pub request: RpcRequest,
}

/// The dispatchable method set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum RpcRequest {
    PingConductor,
    ClusterCreate(ClusterCreateRequest),
    ClusterUpdate {
        cluster: String,
        patch: ClusterUpdate,
        #[serde(default)]
        rollback: bool,
    },
    ClusterResize {
        cluster: String,
        #[serde(flatten)]
        request: ResizeRequest,
    },
    ClusterUpgrade {
        cluster: String,
        #[serde(flatten)]
        request: UpgradeRequest,
    },
    ClusterDelete {
        cluster: String,
    },
    NodegroupCreate {
        cluster: String,
        #[serde(flatten)]
        request: NodeGroupCreateRequest,
    },
    NodegroupUpdate {
        cluster: String,
        nodegroup: String,
        patch: NodeGroupUpdate,
    },
    NodegroupDelete {
        cluster: String,
        nodegroup: String,
    },
    SignCertificate {
        cluster: String,
        csr: String,
        validity_days: Option<i64>,
    },
    GetCaCertificate {
        cluster: String,
        kind: Option<String>,
    },
    ClusterTemplateCreate(TemplateCreateRequest),
    ClusterTemplateDelete {
        template: String,
    },
    FederationCreate {
        name: String,
        hostcluster: String,
    },
    FederationUpdate {
        federation: String,
    },
    FederationDelete {
        federation: String,
    },
}

/// Reply payload: result or fault, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcResult {
    Ok(serde_json::Value),
    Err { kind: String, message: String },
}

/// A reply as written back to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    pub correlation_id: Uuid,
    pub result: RpcResult,
}

fn ok_reply<T: Serialize>(correlation_id: Uuid, value: &T) -> RpcReply {
    match serde_json::to_value(value) {
        Ok(json) => RpcReply {
            correlation_id,
            result: RpcResult::Ok(json),
        },
        Err(e) => err_reply(
            correlation_id,
            &Error::internal("rpc", format!("cannot serialize reply: {}", e)),
        ),
    }
}

fn err_reply(correlation_id: Uuid, error: &Error) -> RpcReply {
    RpcReply {
        correlation_id,
        result: RpcResult::Err {
            kind: error.kind().to_string(),
            message: error.to_string(),
        },
    }
}

impl Conductor {
    /// Dispatch one envelope onto the matching entry point.
    pub async fn dispatch(&self, envelope: RpcEnvelope) -> RpcReply {
        let id = envelope.correlation_id;
        let rc = &envelope.context;

        match envelope.request {
            RpcRequest::PingConductor => ok_reply(id, &self.ping_conductor().await),
            RpcRequest::ClusterCreate(request) => {
                match self.cluster_create(rc, request).await {
                    Ok(cluster) => ok_reply(id, &cluster),
                    Err(e) => err_reply(id, &e),
                }
            }
            RpcRequest::ClusterUpdate {
                cluster,
                patch,
                rollback,
            } => match self.cluster_update(rc, &cluster, patch, rollback).await {
                Ok(cluster) => ok_reply(id, &cluster),
                Err(e) => err_reply(id, &e),
            },
            RpcRequest::ClusterResize { cluster, request } => {
                match self.cluster_resize(rc, &cluster, request).await {
                    Ok(cluster) => ok_reply(id, &cluster),
                    Err(e) => err_reply(id, &e),
                }
            }
            RpcRequest::ClusterUpgrade { cluster, request } => {
                match self.cluster_upgrade(rc, &cluster, request).await {
                    Ok(cluster) => ok_reply(id, &cluster),
                    Err(e) => err_reply(id, &e),
                }
            }
            RpcRequest::ClusterDelete { cluster } => {
                match self.cluster_delete(rc, &cluster).await {
                    Ok(()) => ok_reply(id, &serde_json::json!({"accepted": true})),
                    Err(e) => err_reply(id, &e),
                }
            }
            RpcRequest::NodegroupCreate { cluster, request } => {
                match self.nodegroup_create(rc, &cluster, request).await {
                    Ok(nodegroup) => ok_reply(id, &nodegroup),
                    Err(e) => err_reply(id, &e),
                }
            }
            RpcRequest::NodegroupUpdate {
                cluster,
                nodegroup,
                patch,
            } => match self.nodegroup_update(rc, &cluster, &nodegroup, patch).await {
                Ok(nodegroup) => ok_reply(id, &nodegroup),
                Err(e) => err_reply(id, &e),
            },
            RpcRequest::NodegroupDelete { cluster, nodegroup } => {
                match self.nodegroup_delete(rc, &cluster, &nodegroup).await {
                    Ok(()) => ok_reply(id, &serde_json::json!({"accepted": true})),
                    Err(e) => err_reply(id, &e),
                }
            }
            RpcRequest::SignCertificate {
                cluster,
                csr,
                validity_days,
            } => match self
                .sign_certificate(rc, &cluster, &csr, validity_days)
                .await
            {
                Ok(signed) => ok_reply(id, &signed),
                Err(e) => err_reply(id, &e),
            },
            RpcRequest::GetCaCertificate { cluster, kind } => {
                match self
                    .get_ca_certificate(rc, &cluster, kind.as_deref())
                    .await
                {
                    Ok(pem) => ok_reply(id, &serde_json::json!({"pem": pem})),
                    Err(e) => err_reply(id, &e),
                }
            }
            RpcRequest::ClusterTemplateCreate(request) => {
                match self.cluster_template_create(rc, request).await {
                    Ok(template) => ok_reply(id, &template),
                    Err(e) => err_reply(id, &e),
                }
            }
            RpcRequest::ClusterTemplateDelete { template } => {
                match self.cluster_template_delete(rc, &template).await {
                    Ok(()) => ok_reply(id, &serde_json::json!({"deleted": true})),
                    Err(e) => err_reply(id, &e),
                }
            }
            RpcRequest::FederationCreate { .. }
            | RpcRequest::FederationUpdate { .. }
            | RpcRequest::FederationDelete { .. } => {
                err_reply(id, &crate::federation::not_implemented())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_format() {
        let text = r#"{
            "correlation_id": "0b2f0370-7f85-4d31-9ed5-0d4fe3bb9ba3",
            "context": {"project_id": "p1", "user_id": "u1"},
            "method": "cluster_delete",
            "params": {"cluster": "k1"}
        }"#;
        let envelope: RpcEnvelope = serde_json::from_str(text).unwrap();
        assert!(matches!(
            envelope.request,
            RpcRequest::ClusterDelete { ref cluster } if cluster == "k1"
        ));
        assert_eq!(envelope.context.project_id, "p1");
    }

    #[test]
    fn resize_params_flatten() {
        let text = r#"{
            "correlation_id": "0b2f0370-7f85-4d31-9ed5-0d4fe3bb9ba3",
            "context": {"project_id": "p1", "user_id": "u1"},
            "method": "cluster_resize",
            "params": {"cluster": "k1", "node_count": 3}
        }"#;
        let envelope: RpcEnvelope = serde_json::from_str(text).unwrap();
        match envelope.request {
            RpcRequest::ClusterResize { cluster, request } => {
                assert_eq!(cluster, "k1");
                assert_eq!(request.node_count, 3);
                assert!(request.nodes_to_remove.is_empty());
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn reply_round_trips() {
        let reply = RpcReply {
            correlation_id: Uuid::new_v4(),
            result: RpcResult::Err {
                kind: "QuotaExceeded".into(),
                message: "quota exceeded".into(),
            },
        };
        let json = serde_json::to_string(&reply).unwrap();
        let parsed: RpcReply = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.correlation_id, reply.correlation_id);
        assert!(matches!(parsed.result, RpcResult::Err { ref kind, .. } if kind == "QuotaExceeded"));
    }
}
