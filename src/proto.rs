//! gRPC definitions of the credential service
//!
//! Messages and client of `v1alpha1.ConfigService`, the API the
//! anck-credentials service listens on (port 6000):
//!
//! ```text
//! service ConfigService {
//!   rpc DesiredState(DesiredStateRequest) returns (DesiredStateResponse);
//!   rpc DeleteNetwork(DeleteNetworkRequest) returns (DeleteNetworkResponse);
//!   rpc DeleteAccount(DeleteAccountRequest) returns (DeleteAccountResponse);
//! }
//! ```
//!
//! Kept in the shape `tonic-build` emits so the build needs no `protoc`.

#![allow(missing_docs)]

pub mod v1alpha1 {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DesiredStateRequest {
        #[prost(string, tag = "1")]
        pub network: ::prost::alloc::string::String,
        #[prost(string, repeated, tag = "2")]
        pub participants: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Credentials {
        #[prost(string, tag = "1")]
        pub network_participant: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub username: ::prost::alloc::string::String,
        #[prost(string, tag = "3")]
        pub password: ::prost::alloc::string::String,
        /// NATS creds file
        #[prost(string, tag = "4")]
        pub creds: ::prost::alloc::string::String,
        #[prost(string, tag = "5")]
        pub user_account_name: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct NetworkInfo {
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub account_name: ::prost::alloc::string::String,
        #[prost(string, tag = "3")]
        pub account_public_key: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DesiredStateResponse {
        #[prost(message, optional, tag = "1")]
        pub network: ::core::option::Option<NetworkInfo>,
        #[prost(message, repeated, tag = "2")]
        pub creds: ::prost::alloc::vec::Vec<Credentials>,
        #[prost(string, repeated, tag = "3")]
        pub deleted_participants: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DeleteNetworkRequest {
        #[prost(string, tag = "1")]
        pub network: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DeleteNetworkResponse {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DeleteAccountRequest {
        #[prost(string, tag = "1")]
        pub account_name: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DeleteAccountResponse {}

    pub mod config_service_client {
        use tonic::codegen::http::uri::PathAndQuery;
        use tonic::codegen::*;

        #[derive(Debug, Clone)]
        pub struct ConfigServiceClient<T> {
            inner: tonic::client::Grpc<T>,
        }

        impl<T> ConfigServiceClient<T>
        where
            T: tonic::client::GrpcService<tonic::body::BoxBody>,
            T::Error: Into<StdError>,
            T::ResponseBody: Body<Data = Bytes> + Send + 'static,
            <T::ResponseBody as Body>::Error: Into<StdError> + Send,
        {
            pub fn new(inner: T) -> Self {
                Self {
                    inner: tonic::client::Grpc::new(inner),
                }
            }

            async fn call<Req, Resp>(
                &mut self,
                request: impl tonic::IntoRequest<Req>,
                path: &'static str,
            ) -> Result<tonic::Response<Resp>, tonic::Status>
            where
                Req: ::prost::Message + Send + Sync + 'static,
                Resp: ::prost::Message + Default + Send + Sync + 'static,
            {
                self.inner.ready().await.map_err(|e| {
                    tonic::Status::new(
                        tonic::Code::Unknown,
                        format!("Service was not ready: {}", e.into()),
                    )
                })?;
                let codec = tonic::codec::ProstCodec::default();
                let path = PathAndQuery::from_static(path);
                self.inner.unary(request.into_request(), path, codec).await
            }

            pub async fn desired_state(
                &mut self,
                request: impl tonic::IntoRequest<super::DesiredStateRequest>,
            ) -> Result<tonic::Response<super::DesiredStateResponse>, tonic::Status> {
                self.call(request, "/v1alpha1.ConfigService/DesiredState")
                    .await
            }

            pub async fn delete_network(
                &mut self,
                request: impl tonic::IntoRequest<super::DeleteNetworkRequest>,
            ) -> Result<tonic::Response<super::DeleteNetworkResponse>, tonic::Status> {
                self.call(request, "/v1alpha1.ConfigService/DeleteNetwork")
                    .await
            }

            pub async fn delete_account(
                &mut self,
                request: impl tonic::IntoRequest<super::DeleteAccountRequest>,
            ) -> Result<tonic::Response<super::DeleteAccountResponse>, tonic::Status> {
                self.call(request, "/v1alpha1.ConfigService/DeleteAccount")
                    .await
            }
        }
    }
}

pub use v1alpha1::*;
