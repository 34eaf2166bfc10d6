/*
Copyright 2024 The lxe Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! gRPC hosting for the `runtime.v1.RuntimeService` surface.
//!
//! The implementation trait plus a tower `Service` that dispatches the unary
//! CRI calls through `tonic::server::Grpc`. All RPCs of the runtime service
//! are unary, which keeps the dispatch table a plain path match.

use std::sync::Arc;
use std::task::{Context, Poll};

use tonic::codegen::{empty_body, http, Body, BoxFuture, Service, StdError};
use tonic::{Request, Response, Status};

use super::*;

/// Server side of the CRI runtime service.
#[tonic::async_trait]
pub trait RuntimeService: Send + Sync + 'static {
    async fn version(&self, request: Request<VersionRequest>)
        -> Result<Response<VersionResponse>, Status>;
    async fn run_pod_sandbox(
        &self,
        request: Request<RunPodSandboxRequest>,
    ) -> Result<Response<RunPodSandboxResponse>, Status>;
    async fn stop_pod_sandbox(
        &self,
        request: Request<StopPodSandboxRequest>,
    ) -> Result<Response<StopPodSandboxResponse>, Status>;
    async fn remove_pod_sandbox(
        &self,
        request: Request<RemovePodSandboxRequest>,
    ) -> Result<Response<RemovePodSandboxResponse>, Status>;
    async fn pod_sandbox_status(
        &self,
        request: Request<PodSandboxStatusRequest>,
    ) -> Result<Response<PodSandboxStatusResponse>, Status>;
    async fn list_pod_sandbox(
        &self,
        request: Request<ListPodSandboxRequest>,
    ) -> Result<Response<ListPodSandboxResponse>, Status>;
    async fn create_container(
        &self,
        request: Request<CreateContainerRequest>,
    ) -> Result<Response<CreateContainerResponse>, Status>;
    async fn start_container(
        &self,
        request: Request<StartContainerRequest>,
    ) -> Result<Response<StartContainerResponse>, Status>;
    async fn stop_container(
        &self,
        request: Request<StopContainerRequest>,
    ) -> Result<Response<StopContainerResponse>, Status>;
    async fn remove_container(
        &self,
        request: Request<RemoveContainerRequest>,
    ) -> Result<Response<RemoveContainerResponse>, Status>;
    async fn list_containers(
        &self,
        request: Request<ListContainersRequest>,
    ) -> Result<Response<ListContainersResponse>, Status>;
    async fn container_status(
        &self,
        request: Request<ContainerStatusRequest>,
    ) -> Result<Response<ContainerStatusResponse>, Status>;
    async fn update_container_resources(
        &self,
        request: Request<UpdateContainerResourcesRequest>,
    ) -> Result<Response<UpdateContainerResourcesResponse>, Status>;
    async fn reopen_container_log(
        &self,
        request: Request<ReopenContainerLogRequest>,
    ) -> Result<Response<ReopenContainerLogResponse>, Status>;
    async fn exec_sync(
        &self,
        request: Request<ExecSyncRequest>,
    ) -> Result<Response<ExecSyncResponse>, Status>;
    async fn exec(&self, request: Request<ExecRequest>) -> Result<Response<ExecResponse>, Status>;
    async fn attach(
        &self,
        request: Request<AttachRequest>,
    ) -> Result<Response<AttachResponse>, Status>;
    async fn port_forward(
        &self,
        request: Request<PortForwardRequest>,
    ) -> Result<Response<PortForwardResponse>, Status>;
    async fn container_stats(
        &self,
        request: Request<ContainerStatsRequest>,
    ) -> Result<Response<ContainerStatsResponse>, Status>;
    async fn list_container_stats(
        &self,
        request: Request<ListContainerStatsRequest>,
    ) -> Result<Response<ListContainerStatsResponse>, Status>;
    async fn update_runtime_config(
        &self,
        request: Request<UpdateRuntimeConfigRequest>,
    ) -> Result<Response<UpdateRuntimeConfigResponse>, Status>;
    async fn status(&self, request: Request<StatusRequest>)
        -> Result<Response<StatusResponse>, Status>;
}

/// Hosts a [`RuntimeService`] implementation on a tonic server.
pub struct RuntimeServiceServer<T> {
    inner: Arc<T>,
}

impl<T: RuntimeService> RuntimeServiceServer<T> {
    pub fn new(inner: T) -> Self {
        Self::from_arc(Arc::new(inner))
    }

    pub fn from_arc(inner: Arc<T>) -> Self {
        Self { inner }
    }
}

impl<T> Clone for RuntimeServiceServer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

// One unary dispatch arm: an ad-hoc UnaryService forwarding to the trait
// method, run through the grpc codec machinery.
macro_rules! unary {
    ($self:ident, $req:ident, $method:ident, $request:ty, $response:ty) => {{
        struct Unary<T>(Arc<T>);
        impl<T: RuntimeService> tonic::server::UnaryService<$request> for Unary<T> {
            type Response = $response;
            type Future = BoxFuture<Response<Self::Response>, Status>;

            fn call(&mut self, request: Request<$request>) -> Self::Future {
                let inner = Arc::clone(&self.0);
                Box::pin(async move { inner.$method(request).await })
            }
        }
        let inner = Arc::clone(&$self.inner);
        Box::pin(async move {
            let codec = tonic::codec::ProstCodec::default();
            let mut grpc = tonic::server::Grpc::new(codec);
            Ok(grpc.unary(Unary(inner), $req).await)
        })
    }};
}

impl<T, B> Service<http::Request<B>> for RuntimeServiceServer<T>
where
    T: RuntimeService,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        match req.uri().path() {
            "/runtime.v1.RuntimeService/Version" => {
                unary!(self, req, version, VersionRequest, VersionResponse)
            }
            "/runtime.v1.RuntimeService/RunPodSandbox" => unary!(
                self,
                req,
                run_pod_sandbox,
                RunPodSandboxRequest,
                RunPodSandboxResponse
            ),
            "/runtime.v1.RuntimeService/StopPodSandbox" => unary!(
                self,
                req,
                stop_pod_sandbox,
                StopPodSandboxRequest,
                StopPodSandboxResponse
            ),
            "/runtime.v1.RuntimeService/RemovePodSandbox" => unary!(
                self,
                req,
                remove_pod_sandbox,
                RemovePodSandboxRequest,
                RemovePodSandboxResponse
            ),
            "/runtime.v1.RuntimeService/PodSandboxStatus" => unary!(
                self,
                req,
                pod_sandbox_status,
                PodSandboxStatusRequest,
                PodSandboxStatusResponse
            ),
            "/runtime.v1.RuntimeService/ListPodSandbox" => unary!(
                self,
                req,
                list_pod_sandbox,
                ListPodSandboxRequest,
                ListPodSandboxResponse
            ),
            "/runtime.v1.RuntimeService/CreateContainer" => unary!(
                self,
                req,
                create_container,
                CreateContainerRequest,
                CreateContainerResponse
            ),
            "/runtime.v1.RuntimeService/StartContainer" => unary!(
                self,
                req,
                start_container,
                StartContainerRequest,
                StartContainerResponse
            ),
            "/runtime.v1.RuntimeService/StopContainer" => unary!(
                self,
                req,
                stop_container,
                StopContainerRequest,
                StopContainerResponse
            ),
            "/runtime.v1.RuntimeService/RemoveContainer" => unary!(
                self,
                req,
                remove_container,
                RemoveContainerRequest,
                RemoveContainerResponse
            ),
            "/runtime.v1.RuntimeService/ListContainers" => unary!(
                self,
                req,
                list_containers,
                ListContainersRequest,
                ListContainersResponse
            ),
            "/runtime.v1.RuntimeService/ContainerStatus" => unary!(
                self,
                req,
                container_status,
                ContainerStatusRequest,
                ContainerStatusResponse
            ),
            "/runtime.v1.RuntimeService/UpdateContainerResources" => unary!(
                self,
                req,
                update_container_resources,
                UpdateContainerResourcesRequest,
                UpdateContainerResourcesResponse
            ),
            "/runtime.v1.RuntimeService/ReopenContainerLog" => unary!(
                self,
                req,
                reopen_container_log,
                ReopenContainerLogRequest,
                ReopenContainerLogResponse
            ),
            "/runtime.v1.RuntimeService/ExecSync" => {
                unary!(self, req, exec_sync, ExecSyncRequest, ExecSyncResponse)
            }
            "/runtime.v1.RuntimeService/Exec" => {
                unary!(self, req, exec, ExecRequest, ExecResponse)
            }
            "/runtime.v1.RuntimeService/Attach" => {
                unary!(self, req, attach, AttachRequest, AttachResponse)
            }
            "/runtime.v1.RuntimeService/PortForward" => unary!(
                self,
                req,
                port_forward,
                PortForwardRequest,
                PortForwardResponse
            ),
            "/runtime.v1.RuntimeService/ContainerStats" => unary!(
                self,
                req,
                container_stats,
                ContainerStatsRequest,
                ContainerStatsResponse
            ),
            "/runtime.v1.RuntimeService/ListContainerStats" => unary!(
                self,
                req,
                list_container_stats,
                ListContainerStatsRequest,
                ListContainerStatsResponse
            ),
            "/runtime.v1.RuntimeService/UpdateRuntimeConfig" => unary!(
                self,
                req,
                update_runtime_config,
                UpdateRuntimeConfigRequest,
                UpdateRuntimeConfigResponse
            ),
            "/runtime.v1.RuntimeService/Status" => {
                unary!(self, req, status, StatusRequest, StatusResponse)
            }
            _ => Box::pin(async move {
                Ok(http::Response::builder()
                    .status(200)
                    .header("grpc-status", "12")
                    .header("content-type", "application/grpc")
                    .body(empty_body())
                    .unwrap())
            }),
        }
    }
}

impl<T: RuntimeService> tonic::server::NamedService for RuntimeServiceServer<T> {
    const NAME: &'static str = "runtime.v1.RuntimeService";
}
