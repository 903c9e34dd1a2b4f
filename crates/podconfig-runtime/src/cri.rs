//! Minimal CRI client: just enough of `runtime.v1.RuntimeService` to map a
//! container id to the pid of its init process.

use crate::error::{Result, RuntimeError};
use crate::traits::ProcessResolver;
use crate::types::strip_runtime_scheme;
use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::{pin, task};
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

const SERVICE: &str = "runtime.v1.RuntimeService";
const CONTAINER_STATUS_PATH: &str = "/runtime.v1.RuntimeService/ContainerStatus";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerStatusRequest {
    #[prost(string, tag = "1")]
    pub container_id: String,
    #[prost(bool, tag = "2")]
    pub verbose: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerStatusResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<ContainerStatus>,
    /// Verbose runtime details; `info` holds a JSON document with `pid`
    #[prost(map = "string, string", tag = "2")]
    pub info: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerStatus {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(int32, tag = "3")]
    pub state: i32,
}

#[derive(Debug, Clone)]
struct UnixConnector {
    path: PathBuf,
}

impl tower::Service<hyper::Uri> for UnixConnector {
    type Response = TokioIo<tokio::net::UnixStream>;

    type Error = std::io::Error;

    type Future = pin::Pin<
        Box<dyn std::future::Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        _cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: hyper::Uri) -> Self::Future {
        let path = self.path.clone();
        Box::pin(async move {
            let stream = tokio::net::UnixStream::connect(path).await?;
            Ok(TokioIo::new(stream))
        })
    }
}

/// Socket path from either a plain path or a `unix://` URL
pub fn socket_path(endpoint: &str) -> PathBuf {
    PathBuf::from(endpoint.strip_prefix("unix://").unwrap_or(endpoint))
}

/// Pull the pid out of the verbose `info` map
pub fn extract_pid(container_id: &str, info: &HashMap<String, String>) -> Result<u32> {
    let raw = info
        .get("info")
        .ok_or_else(|| RuntimeError::malformed_info(container_id, "no `info` entry"))?;
    let doc: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
        RuntimeError::malformed_info(container_id, format!("`info` is not JSON: {}", e))
    })?;

    let pid = match doc.get("pid") {
        Some(v) if v.is_u64() => v.as_u64(),
        // some runtimes encode numbers as floats
        Some(v) => v.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64),
        None => return Err(RuntimeError::malformed_info(container_id, "no `pid` field")),
    };

    match pid.and_then(|p| u32::try_from(p).ok()) {
        Some(0) | None => Err(RuntimeError::malformed_info(
            container_id,
            format!("invalid pid {}", doc["pid"]),
        )),
        Some(pid) => Ok(pid),
    }
}

/// ContainerStatus client over the runtime's unix socket
#[derive(Debug, Clone)]
pub struct CriClient {
    socket: PathBuf,
}

impl CriClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            socket: socket_path(endpoint),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn connect(&self) -> Result<tonic::client::Grpc<Channel>> {
        debug!("Connecting to container runtime at {}", self.socket.display());
        let connector = UnixConnector {
            path: self.socket.clone(),
        };
        // The authority is ignored by the connector
        let channel = Endpoint::from_static("http://[::]:50051")
            .connect_with_connector(connector)
            .await
            .map_err(|e| self.transport(e))?;
        Ok(tonic::client::Grpc::new(channel))
    }

    fn transport(&self, e: impl std::fmt::Display) -> RuntimeError {
        RuntimeError::transport(self.socket.display().to_string(), e.to_string())
    }

    async fn container_status(
        &self,
        grpc: &mut tonic::client::Grpc<Channel>,
        container_id: &str,
    ) -> Result<ContainerStatusResponse> {
        grpc.ready()
            .await
            .map_err(|e| self.transport(format!("service not ready: {}", e)))?;

        let mut request = tonic::Request::new(ContainerStatusRequest {
            container_id: container_id.to_string(),
            verbose: true,
        });
        request
            .extensions_mut()
            .insert(tonic::GrpcMethod::new(SERVICE, "ContainerStatus"));

        let codec: ProstCodec<ContainerStatusRequest, ContainerStatusResponse> =
            ProstCodec::default();
        let response = grpc
            .unary(request, PathAndQuery::from_static(CONTAINER_STATUS_PATH), codec)
            .await
            .map_err(|status| match status.code() {
                tonic::Code::NotFound => RuntimeError::not_found("container", container_id),
                _ => self.transport(format!("ContainerStatus({}): {}", container_id, status)),
            })?;

        Ok(response.into_inner())
    }

    async fn resolve_on(
        &self,
        grpc: &mut tonic::client::Grpc<Channel>,
        container_id: &str,
    ) -> Result<u32> {
        let id = strip_runtime_scheme(container_id);
        let response = self.container_status(grpc, id).await?;
        let pid = extract_pid(id, &response.info)?;
        debug!("Container {} runs as pid {}", id, pid);
        Ok(pid)
    }
}

#[async_trait]
impl ProcessResolver for CriClient {
    async fn resolve_pids(&self, container_ids: &[String]) -> Result<Vec<Result<u32>>> {
        let mut grpc = self.connect().await?;
        let mut results = Vec::with_capacity(container_ids.len());
        for id in container_ids {
            results.push(self.resolve_on(&mut grpc, id).await);
        }
        Ok(results)
    }
}
