//! Docker Engine runtime.
//!
//! Talks to the Docker Engine API over its Unix socket. Each instance is a
//! plain container limited to its machine type's CPU and memory.
//!
//! Reference: https://docs.docker.com/engine/api/v1.43/

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::runtime::{ContainerHandle, ContainerRuntime, ContainerSpec, ContainerStatus, RuntimeError};

/// Docker Engine client for Unix socket communication.
pub struct DockerRuntime {
    socket_path: String,
    client: Client<UnixConnector>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainer<'a> {
    image: &'a str,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    cmd: &'a [String],
    hostname: &'a str,
    labels: &'a BTreeMap<String, String>,
    env: &'a [String],
    host_config: HostConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    nano_cpus: u64,
    memory: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Created {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inspected {
    state: InspectedState,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedState {
    running: bool,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl DockerRuntime {
    /// Create a client for the socket at `socket_path`.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        let socket_path = socket_path.as_ref().to_string_lossy().to_string();
        Self {
            socket_path,
            client: Client::unix(),
        }
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<(), RuntimeError> {
        let (status, body) = self.send(Method::GET, "/_ping", None).await?;
        expect_success(status, &body, "ping")
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes), RuntimeError> {
        let uri: hyper::Uri = Uri::new(&self.socket_path, path).into();
        debug!(method = %method, path, "Docker API request");

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        let body = match body {
            Some(bytes) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(bytes)
            }
            None => Body::empty(),
        };
        let request = builder
            .body(body)
            .map_err(|e| RuntimeError::Other(anyhow::anyhow!("building docker request: {e}")))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("docker socket {}: {e}", self.socket_path)))?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("reading docker response: {e}")))?;
        Ok((status, bytes))
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        let (from_image, tag) = split_image(image);
        info!(image, "Pulling image");
        let path = format!("/images/create?fromImage={from_image}&tag={tag}");
        let (status, body) = self.send(Method::POST, &path, None).await?;
        expect_success(status, &body, image)
    }

    async fn create_once(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let body = serde_json::to_vec(&create_body(spec))
            .map_err(|e| RuntimeError::Other(e.into()))?;
        let path = format!("/containers/create?name={}", spec.name);
        let (status, bytes) = self.send(Method::POST, &path, Some(body)).await?;
        expect_success(status, &bytes, &spec.image)?;

        let created: Created =
            serde_json::from_slice(&bytes).map_err(|e| RuntimeError::Other(e.into()))?;
        Ok(ContainerHandle::new(created.id))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let handle = match self.create_once(spec).await {
            // 404 on create means the image is not present locally
            Err(RuntimeError::NotFound(_)) => {
                self.pull(&spec.image).await?;
                self.create_once(spec).await?
            }
            other => other?,
        };
        info!(container = %handle, name = %spec.name, image = %spec.image, "Container created");
        Ok(handle)
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let path = format!("/containers/{handle}/start");
        let (status, body) = self.send(Method::POST, &path, None).await?;
        if status == StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        expect_success(status, &body, handle.as_str())
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeError> {
        let path = format!("/containers/{handle}/stop?t={}", grace.as_secs());
        let (status, body) = self.send(Method::POST, &path, None).await?;
        if status == StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        expect_success(status, &body, handle.as_str())
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let path = format!("/containers/{handle}/kill");
        let (status, body) = self.send(Method::POST, &path, None).await?;
        // 409: not running
        if status == StatusCode::CONFLICT {
            warn!(container = %handle, "Kill on a container that is not running");
            return Ok(());
        }
        expect_success(status, &body, handle.as_str())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let path = format!("/containers/{handle}?force=true");
        let (status, body) = self.send(Method::DELETE, &path, None).await?;
        expect_success(status, &body, handle.as_str())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerStatus, RuntimeError> {
        let path = format!("/containers/{handle}/json");
        let (status, body) = self.send(Method::GET, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(ContainerStatus::Missing);
        }
        expect_success(status, &body, handle.as_str())?;

        let inspected: Inspected =
            serde_json::from_slice(&body).map_err(|e| RuntimeError::Other(e.into()))?;
        Ok(if inspected.state.running {
            ContainerStatus::Running
        } else {
            ContainerStatus::Stopped
        })
    }
}

fn create_body(spec: &ContainerSpec) -> CreateContainer<'_> {
    CreateContainer {
        image: &spec.image,
        cmd: &spec.command,
        hostname: &spec.hostname,
        labels: &spec.labels,
        env: &spec.env,
        host_config: HostConfig {
            nano_cpus: spec.nano_cpus,
            memory: spec.memory_bytes,
        },
    }
}

/// Split `repo[:tag]` into repository and tag, defaulting to `latest`.
fn split_image(image: &str) -> (&str, &str) {
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

fn expect_success(status: StatusCode, body: &[u8], subject: &str) -> Result<(), RuntimeError> {
    if status.is_success() {
        return Ok(());
    }

    let message = serde_json::from_slice::<ErrorBody>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).to_string());

    Err(match status {
        StatusCode::NOT_FOUND => RuntimeError::NotFound(format!("{subject}: {message}")),
        s if s.is_server_error() => RuntimeError::Unavailable(format!("docker {s}: {message}")),
        s => RuntimeError::Other(anyhow::anyhow!("docker {s}: {message}")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("debian:bookworm-slim", "debian", "bookworm-slim")]
    #[case("nginx", "nginx", "latest")]
    #[case("ghcr.io/org/app:1.2", "ghcr.io/org/app", "1.2")]
    #[case("localhost:5000/app", "localhost:5000/app", "latest")]
    fn test_split_image(#[case] image: &str, #[case] repo: &str, #[case] tag: &str) {
        assert_eq!(split_image(image), (repo, tag));
    }

    #[test]
    fn test_create_body_shape() {
        let spec = ContainerSpec {
            name: "stratus-vm".to_string(),
            image: "debian:bookworm-slim".to_string(),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            hostname: "vm".to_string(),
            nano_cpus: 2_000_000_000,
            memory_bytes: 1024,
            labels: BTreeMap::from([("stratus.instance".to_string(), "vm".to_string())]),
            env: vec!["A=b".to_string()],
        };

        let json = serde_json::to_value(create_body(&spec)).unwrap();
        assert_eq!(json["Image"], "debian:bookworm-slim");
        assert_eq!(json["Cmd"][1], "infinity");
        assert_eq!(json["HostConfig"]["NanoCpus"], 2_000_000_000u64);
        assert_eq!(json["HostConfig"]["Memory"], 1024);
        assert_eq!(json["Labels"]["stratus.instance"], "vm");
    }

    #[test]
    fn test_error_mapping() {
        let body = br#"{"message":"No such container: abc"}"#;
        assert!(matches!(
            expect_success(StatusCode::NOT_FOUND, body, "abc"),
            Err(RuntimeError::NotFound(m)) if m.contains("No such container")
        ));
        assert!(matches!(
            expect_success(StatusCode::INTERNAL_SERVER_ERROR, b"oops", "abc"),
            Err(RuntimeError::Unavailable(_))
        ));
        assert!(matches!(
            expect_success(StatusCode::CONFLICT, b"{}", "abc"),
            Err(RuntimeError::Other(_))
        ));
        assert!(expect_success(StatusCode::NO_CONTENT, b"", "abc").is_ok());
    }

    #[test]
    fn test_inspect_parsing() {
        let body = br#"{"Id":"abc","State":{"Status":"exited","Running":false}}"#;
        let inspected: Inspected = serde_json::from_slice(body).unwrap();
        assert!(!inspected.state.running);
    }
}
