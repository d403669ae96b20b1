use kind_provider_apis::{NodeObservation, NodeStatus};

use crate::kind::{ImageLookup, KindBackend, NodeAddresses};

/// Resolves the observed state of single KIND nodes.
pub(crate) struct NodeInspector<'a> {
    backend: &'a dyn KindBackend,
    images: &'a dyn ImageLookup,
}

impl<'a> NodeInspector<'a> {
    pub fn new(backend: &'a dyn KindBackend, images: &'a dyn ImageLookup) -> Self {
        Self { backend, images }
    }

    /// A node is [`NodeStatus::Running`] if both its role and its addresses can be
    /// resolved. The image is informational only.
    pub async fn inspect(&self, node: &str) -> NodeObservation {
        let role = self.backend.node_role(node).await;
        let addresses = self.backend.node_addresses(node).await;
        let status = match (&role, &addresses) {
            (Ok(_), Ok(_)) => NodeStatus::Running,
            (role, addresses) => {
                if let Err(e) = role {
                    debug!("cannot resolve role of node {}: {}", node, e);
                }
                if let Err(e) = addresses {
                    debug!("cannot resolve addresses of node {}: {}", node, e);
                }
                NodeStatus::Unknown
            }
        };
        let NodeAddresses { ipv4, ipv6 } = addresses.unwrap_or_default();
        NodeObservation {
            name: node.to_string(),
            role: role.unwrap_or_default(),
            status,
            image: self.images.lookup_image(node).await,
            ip_address: ipv4,
            ipv6_address: ipv6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::{
        MockImageLookup,
        fake::{FakeKind, FakeNode},
    };

    fn images(image: &'static str) -> MockImageLookup {
        let mut images = MockImageLookup::new();
        images
            .expect_lookup_image()
            .returning(move |_| image.to_string());
        images
    }

    #[tokio::test]
    async fn running_when_role_and_addresses_resolve() {
        let backend = FakeKind::default().with_cluster(
            "demo",
            vec![FakeNode::running(
                "demo-control-plane",
                "control-plane",
                "172.18.0.2",
            )],
        );
        let images = images("kindest/node:v1.33.1");
        let obs = NodeInspector::new(&backend, &images)
            .inspect("demo-control-plane")
            .await;
        assert_eq!(
            NodeObservation {
                name: "demo-control-plane".to_string(),
                role: "control-plane".to_string(),
                status: NodeStatus::Running,
                image: "kindest/node:v1.33.1".to_string(),
                ip_address: "172.18.0.2".to_string(),
                ipv6_address: String::new(),
            },
            obs
        );
    }

    #[tokio::test]
    async fn unknown_when_role_fails() {
        let mut node = FakeNode::running("demo-worker", "worker", "172.18.0.3");
        node.role = None;
        let backend = FakeKind::default().with_cluster("demo", vec![node]);
        let images = images("kindest/node:v1.33.1");
        let obs = NodeInspector::new(&backend, &images)
            .inspect("demo-worker")
            .await;
        assert_eq!(NodeStatus::Unknown, obs.status);
        assert_eq!("", obs.role);
        assert_eq!("172.18.0.3", obs.ip_address);
    }

    #[tokio::test]
    async fn unknown_when_addresses_fail() {
        let mut node = FakeNode::running("demo-worker", "worker", "172.18.0.3");
        node.addresses = None;
        let backend = FakeKind::default().with_cluster("demo", vec![node]);
        let images = images("kindest/node:v1.33.1");
        let obs = NodeInspector::new(&backend, &images)
            .inspect("demo-worker")
            .await;
        assert_eq!(NodeStatus::Unknown, obs.status);
        assert_eq!("worker", obs.role);
        assert_eq!("", obs.ip_address);
    }

    #[tokio::test]
    async fn missing_image_does_not_affect_status() {
        let backend = FakeKind::default().with_cluster(
            "demo",
            vec![FakeNode::running("demo-worker", "worker", "172.18.0.3")],
        );
        let images = images("");
        let obs = NodeInspector::new(&backend, &images)
            .inspect("demo-worker")
            .await;
        assert_eq!(NodeStatus::Running, obs.status);
        assert_eq!("", obs.image);
    }

    #[tokio::test]
    async fn empty_role_label_is_still_running() {
        let backend = FakeKind::default().with_cluster(
            "demo",
            vec![FakeNode::running("demo-worker", "", "172.18.0.3")],
        );
        let images = images("kindest/node:v1.33.1");
        let obs = NodeInspector::new(&backend, &images)
            .inspect("demo-worker")
            .await;
        assert_eq!(NodeStatus::Running, obs.status);
        assert_eq!("", obs.role);
    }
}
