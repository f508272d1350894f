//! Wire types and client for the `deployer.Deployer` gateway service.
//!
//! The message structs are kept by hand with their original field numbers;
//! changing a tag breaks wire compatibility with the gateway.

use std::collections::HashMap;

use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeploymentFilter {
    #[prost(string, tag = "1")]
    pub cluster: String,
    #[prost(string, tag = "2")]
    pub deployer_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogsFilter {
    #[prost(string, tag = "1")]
    pub cluster: String,
    #[prost(string, tag = "2")]
    pub deployer_name: String,
}

/// A desired model-serving deployment as broadcast by the gateway.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Deployment {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub namespace: String,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub image_name: String,
    #[prost(string, tag = "5")]
    pub ingress_host: String,
    #[prost(map = "string, string", tag = "6")]
    pub labels: HashMap<String, String>,
    #[prost(message, optional, tag = "7")]
    pub deployment: Option<DeploymentSpec>,
    #[prost(message, optional, tag = "8")]
    pub service: Option<ServiceSpec>,
    #[prost(message, optional, tag = "9")]
    pub ingress: Option<IngressSpec>,
    #[prost(message, optional, tag = "10")]
    pub metrics: Option<MetricsSpec>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeploymentSpec {
    #[prost(int32, tag = "1")]
    pub replicas: i32,
    #[prost(string, tag = "2")]
    pub image: String,
    #[prost(int32, repeated, tag = "3")]
    pub ports: Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceSpec {
    /// "loadbalancer" or "nodeport"; anything else falls back to node-port.
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(message, repeated, tag = "2")]
    pub ports: Vec<ServicePort>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServicePort {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int32, tag = "2")]
    pub port: i32,
    #[prost(int32, tag = "3")]
    pub target_port: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IngressSpec {
    #[prost(string, tag = "1")]
    pub class: String,
    #[prost(string, tag = "2")]
    pub host: String,
}

/// Optional model-proxy sidecar configuration.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetricsSpec {
    #[prost(bool, tag = "1")]
    pub enabled: bool,
    #[prost(string, tag = "2")]
    pub image: String,
    /// Class list, either plain or base64 encoded.
    #[prost(string, tag = "3")]
    pub classes: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetDeploymentsResponse {
    #[prost(message, repeated, tag = "1")]
    pub deployments: Vec<Deployment>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateDeploymentRequest {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub status: String,
    #[prost(int32, tag = "4")]
    pub available_replicas: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateDeploymentResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateDeployerRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub version: String,
    #[prost(string, tag = "3")]
    pub cluster: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateDeployerResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogsRequest {
    #[prost(string, tag = "1")]
    pub tx_id: String,
    #[prost(string, tag = "2")]
    pub deployment_id: String,
    #[prost(enumeration = "LogsContainer", tag = "3")]
    pub container: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum LogsContainer {
    Model = 0,
    Proxy = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Logs {
    #[prost(string, tag = "1")]
    pub tx_id: String,
    #[prost(string, tag = "2")]
    pub line: String,
    #[prost(int64, tag = "3")]
    pub created_index: i64,
    #[prost(bool, tag = "4")]
    pub eof: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogsResponse {}

/// Client for the `deployer.Deployer` service.
#[derive(Debug, Clone)]
pub struct DeployerClient {
    inner: tonic::client::Grpc<Channel>,
}

impl DeployerClient {
    pub fn new(channel: Channel) -> DeployerClient {
        DeployerClient {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    async fn ready(&mut self) -> Result<(), tonic::Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unknown(format!("service was not ready: {}", e)))
    }

    /// Server-push stream of desired deployments.
    pub async fn stream_deployments(
        &mut self,
        request: tonic::Request<DeploymentFilter>,
    ) -> Result<tonic::Response<tonic::codec::Streaming<Deployment>>, tonic::Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::<DeploymentFilter, Deployment>::default();
        self.inner
            .server_streaming(
                request,
                PathAndQuery::from_static("/deployer.Deployer/StreamDeployments"),
                codec,
            )
            .await
    }

    /// Full desired-state list; the authoritative input of the reap phase.
    pub async fn list_deployments(
        &mut self,
        request: tonic::Request<DeploymentFilter>,
    ) -> Result<tonic::Response<GetDeploymentsResponse>, tonic::Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::<DeploymentFilter, GetDeploymentsResponse>::default();
        self.inner
            .unary(
                request,
                PathAndQuery::from_static("/deployer.Deployer/ListDeployments"),
                codec,
            )
            .await
    }

    pub async fn update_deployment(
        &mut self,
        request: tonic::Request<UpdateDeploymentRequest>,
    ) -> Result<tonic::Response<UpdateDeploymentResponse>, tonic::Status> {
        self.ready().await?;
        let codec =
            tonic::codec::ProstCodec::<UpdateDeploymentRequest, UpdateDeploymentResponse>::default();
        self.inner
            .unary(
                request,
                PathAndQuery::from_static("/deployer.Deployer/UpdateDeployment"),
                codec,
            )
            .await
    }

    pub async fn update_deployer(
        &mut self,
        request: tonic::Request<UpdateDeployerRequest>,
    ) -> Result<tonic::Response<UpdateDeployerResponse>, tonic::Status> {
        self.ready().await?;
        let codec =
            tonic::codec::ProstCodec::<UpdateDeployerRequest, UpdateDeployerResponse>::default();
        self.inner
            .unary(
                request,
                PathAndQuery::from_static("/deployer.Deployer/UpdateDeployer"),
                codec,
            )
            .await
    }

    /// Server-push stream of log requests from the gateway.
    pub async fn stream_log_requests(
        &mut self,
        request: tonic::Request<LogsFilter>,
    ) -> Result<tonic::Response<tonic::codec::Streaming<LogsRequest>>, tonic::Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::<LogsFilter, LogsRequest>::default();
        self.inner
            .server_streaming(
                request,
                PathAndQuery::from_static("/deployer.Deployer/StreamLogRequests"),
                codec,
            )
            .await
    }

    /// Client-push stream of log lines answering a log request.
    pub async fn send_logs(
        &mut self,
        request: impl tonic::IntoStreamingRequest<Message = Logs>,
    ) -> Result<tonic::Response<LogsResponse>, tonic::Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::<Logs, LogsResponse>::default();
        self.inner
            .client_streaming(
                request.into_streaming_request(),
                PathAndQuery::from_static("/deployer.Deployer/SendLogs"),
                codec,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_container_accessor_tolerates_unknown_values() {
        let mut request = LogsRequest {
            tx_id: "55".to_string(),
            deployment_id: "100".to_string(),
            container: LogsContainer::Proxy as i32,
        };
        assert_eq!(request.container(), LogsContainer::Proxy);

        // out-of-range values decay to the default variant
        request.container = 42;
        assert_eq!(request.container(), LogsContainer::Model);
    }
}
