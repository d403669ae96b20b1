//! Access to the local KIND backend.
//!
//! [`KindCli`] drives the `kind` and `docker` command line tools, which talk to the
//! local Docker daemon and need no credentials. Spawned processes are killed when
//! the future awaiting them is dropped, so cancelling a reconcile cancels the
//! backend call without rolling back anything it already did.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, process::Command};

#[cfg(test)]
use mockall::automock;

use crate::kind_config::KindCluster;

/// Kubeconfig path handed to KIND so it never touches the host's `~/.kube/config`.
#[cfg(not(windows))]
pub(crate) const NULL_DEVICE: &'static str = "/dev/null";
#[cfg(windows)]
pub(crate) const NULL_DEVICE: &'static str = "NUL";

/// Docker label KIND stores the node role in.
const NODE_ROLE_LABEL: &'static str = "io.x-k8s.kind.role";

#[derive(thiserror::Error, Debug)]
pub(crate) enum BackendError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} failed: {stderr}")]
    Failed { command: String, stderr: String },
    /// The process was terminated by a signal.
    #[error("{command} was cancelled")]
    Cancelled { command: String },
    #[error("unexpected output of {command}: {output:?}")]
    UnexpectedOutput { command: String, output: String },
    #[error("cannot render KIND cluster config: {0}")]
    Config(#[from] serde_yaml::Error),
}

/// IP addresses of a KIND node container, empty if the address family is not in use.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct NodeAddresses {
    pub ipv4: String,
    pub ipv6: String,
}

/// Parameters of a cluster creation.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct CreateOptions {
    pub config: KindCluster,
    /// Wait for the control plane to become ready.
    pub wait_for_ready: Option<Duration>,
    /// Where KIND writes the kubeconfig of the new cluster.
    pub kubeconfig_path: PathBuf,
}

/// The KIND provider operations used to manage clusters and inspect their nodes.
#[async_trait]
pub(crate) trait KindBackend: Send + Sync {
    /// Names of all KIND clusters.
    async fn list_clusters(&self) -> Result<Vec<String>, BackendError>;

    /// The external (host reachable) kubeconfig of `cluster`.
    async fn kubeconfig(&self, cluster: &str) -> Result<String, BackendError>;

    /// Container names of the nodes of `cluster`.
    async fn list_nodes(&self, cluster: &str) -> Result<Vec<String>, BackendError>;

    async fn node_role(&self, node: &str) -> Result<String, BackendError>;

    async fn node_addresses(&self, node: &str) -> Result<NodeAddresses, BackendError>;

    async fn create_cluster(&self, name: &str, options: CreateOptions)
    -> Result<(), BackendError>;

    async fn delete_cluster(&self, name: &str, kubeconfig_path: &Path)
    -> Result<(), BackendError>;
}

/// Best effort lookup of the image a node container runs.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait ImageLookup: Send + Sync {
    /// The image of `node`, or an empty string if it cannot be determined.
    async fn lookup_image(&self, node: &str) -> String;
}

/// Run `program` with `args`, optionally feeding `stdin`, and return its stdout.
async fn run(program: &str, args: &[&str], stdin: Option<&str>) -> Result<String, BackendError> {
    let command = format!("{} {}", program, args.join(" "));
    debug!("running {}", command);
    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| BackendError::Spawn {
            command: command.clone(),
            source,
        })?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .await
            .map_err(|source| BackendError::Spawn {
                command: command.clone(),
                source,
            })?;
        // Close stdin so the child sees EOF.
        drop(pipe);
    }
    let output = child
        .wait_with_output()
        .await
        .map_err(|source| BackendError::Spawn {
            command: command.clone(),
            source,
        })?;
    match output.status.code() {
        Some(0) => Ok(String::from_utf8_lossy(&output.stdout).to_string()),
        Some(_) => Err(BackendError::Failed {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }),
        None => Err(BackendError::Cancelled { command }),
    }
}

fn lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect()
}

/// Parse the `{ipv4},{ipv6}` output of the node address inspection.
fn parse_addresses(command: &str, output: &str) -> Result<NodeAddresses, BackendError> {
    let line = output.trim();
    match line.split(',').collect::<Vec<_>>().as_slice() {
        [ipv4, ipv6] => Ok(NodeAddresses {
            ipv4: ipv4.to_string(),
            ipv6: ipv6.to_string(),
        }),
        _ => Err(BackendError::UnexpectedOutput {
            command: command.to_string(),
            output: line.to_string(),
        }),
    }
}

/// [`KindBackend`] using the `kind` and `docker` binaries.
#[derive(Clone, Debug)]
pub(crate) struct KindCli {
    kind: String,
    docker: String,
}

impl KindCli {
    pub fn new(kind: String, docker: String) -> Self {
        Self { kind, docker }
    }
}

#[async_trait]
impl KindBackend for KindCli {
    async fn list_clusters(&self) -> Result<Vec<String>, BackendError> {
        Ok(lines(&run(&self.kind, &["get", "clusters"], None).await?))
    }

    async fn kubeconfig(&self, cluster: &str) -> Result<String, BackendError> {
        run(&self.kind, &["get", "kubeconfig", "--name", cluster], None).await
    }

    async fn list_nodes(&self, cluster: &str) -> Result<Vec<String>, BackendError> {
        Ok(lines(
            &run(&self.kind, &["get", "nodes", "--name", cluster], None).await?,
        ))
    }

    /// The role label of `node`, empty if the container carries none.
    async fn node_role(&self, node: &str) -> Result<String, BackendError> {
        let format = format!("--format={{{{ index .Config.Labels {:?} }}}}", NODE_ROLE_LABEL);
        Ok(run(&self.docker, &["inspect", format.as_str(), node], None)
            .await?
            .trim()
            .to_string())
    }

    async fn node_addresses(&self, node: &str) -> Result<NodeAddresses, BackendError> {
        let args = [
            "inspect",
            "--format={{range .NetworkSettings.Networks}}{{.IPAddress}},{{.GlobalIPv6Address}}{{end}}",
            node,
        ];
        let output = run(&self.docker, &args, None).await?;
        parse_addresses(&format!("{} {}", self.docker, args.join(" ")), &output)
    }

    async fn create_cluster(
        &self,
        name: &str,
        options: CreateOptions,
    ) -> Result<(), BackendError> {
        let config = options.config.to_yaml()?;
        let kubeconfig = options.kubeconfig_path.to_string_lossy().to_string();
        let wait = options
            .wait_for_ready
            .map(|d| format!("{}ms", d.as_millis()));
        let mut args = vec![
            "create",
            "cluster",
            "--name",
            name,
            "--config",
            "-",
            "--kubeconfig",
            kubeconfig.as_str(),
        ];
        if let Some(wait) = wait.as_deref() {
            args.extend(["--wait", wait]);
        }
        info!("creating KIND cluster {}", name);
        run(&self.kind, &args, Some(config.as_str())).await?;
        Ok(())
    }

    async fn delete_cluster(&self, name: &str, kubeconfig_path: &Path) -> Result<(), BackendError> {
        let kubeconfig = kubeconfig_path.to_string_lossy().to_string();
        info!("deleting KIND cluster {}", name);
        run(
            &self.kind,
            &["delete", "cluster", "--name", name, "--kubeconfig", &kubeconfig],
            None,
        )
        .await?;
        Ok(())
    }
}

/// [`ImageLookup`] inspecting the node container with `docker`.
#[derive(Clone, Debug)]
pub(crate) struct DockerImageLookup {
    docker: String,
}

impl DockerImageLookup {
    pub fn new(docker: String) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ImageLookup for DockerImageLookup {
    async fn lookup_image(&self, node: &str) -> String {
        match run(
            &self.docker,
            &["inspect", "--format={{.Config.Image}}", node],
            None,
        )
        .await
        {
            Ok(image) => image.trim().to_string(),
            Err(e) => {
                debug!("cannot determine image of node {}: {}", node, e);
                String::new()
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_list_ignores_blank_lines() {
        assert_eq!(vec!["a", "b"], lines("a\n\n  b  \n"));
        assert!(lines("").is_empty());
    }

    #[test]
    fn parse_node_addresses() {
        assert_eq!(
            NodeAddresses {
                ipv4: "172.18.0.2".to_string(),
                ipv6: "fc00:f853:ccd:e793::2".to_string(),
            },
            parse_addresses("docker inspect", "172.18.0.2,fc00:f853:ccd:e793::2\n").unwrap()
        );
        assert_eq!(
            NodeAddresses {
                ipv4: "172.18.0.2".to_string(),
                ipv6: String::new(),
            },
            parse_addresses("docker inspect", "172.18.0.2,").unwrap()
        );
        assert!(parse_addresses("docker inspect", "").is_err());
        assert!(parse_addresses("docker inspect", "a,b,c,d").is_err());
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let kind = KindCli::new(
            "kind-provider-test-no-such-binary".to_string(),
            "docker".to_string(),
        );
        match kind.list_clusters().await {
            Err(BackendError::Spawn { command, .. }) => {
                assert_eq!("kind-provider-test-no-such-binary get clusters", command)
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn node_without_role_label_has_empty_role() {
        // `true` exits successfully without output, like `docker inspect` of a
        // container lacking the label.
        let kind = KindCli::new("kind".to_string(), "true".to_string());
        assert_eq!("", kind.node_role("demo-control-plane").await.unwrap());
    }

    #[tokio::test]
    async fn image_lookup_degrades_to_empty_string() {
        let images = DockerImageLookup::new("kind-provider-test-no-such-binary".to_string());
        assert_eq!("", images.lookup_image("demo-control-plane").await);
    }
}
