use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tonic::transport::Endpoint;
use tonic::{Code, Request, Response, Status};
use tracing::{debug, info};

use super::Probe;
use crate::proto::{GreeterClient, HelloReply, HelloRequest};
use crate::tunnel::{Authority, TunnelConnector};

/// Deadline applied to the `SayHello` call.
pub const RPC_DEADLINE: Duration = Duration::from_secs(2);

/// Calls `hello.Greeter/SayHello` once through the tunnel.
#[derive(Debug, Clone)]
pub struct GrpcProbe {
    target: Authority,
    client_name: String,
    deadline: Duration,
}

impl GrpcProbe {
    pub fn new(target: Authority, client_name: impl Into<String>) -> Self {
        Self {
            target,
            client_name: client_name.into(),
            deadline: RPC_DEADLINE,
        }
    }

    async fn say_hello(&self, client: &mut GreeterClient) -> Result<Response<HelloReply>, Status> {
        let mut request = Request::new(HelloRequest {
            name: self.client_name.clone(),
        });
        // Sent as `grpc-timeout` so the server gives up at the same time.
        request.set_timeout(self.deadline);

        let started = Instant::now();
        let result = tokio::time::timeout(self.deadline, client.say_hello(request))
            .await
            .unwrap_or_else(|_| Err(self.deadline_exceeded()));

        // A server enforcing the deadline answers Cancelled.
        match result {
            Err(status) if status.code() == Code::Cancelled && started.elapsed() >= self.deadline => {
                Err(self.deadline_exceeded())
            }
            other => other,
        }
    }

    fn deadline_exceeded(&self) -> Status {
        Status::deadline_exceeded(format!("no reply within {:?}", self.deadline))
    }
}

#[tonic::async_trait]
impl Probe for GrpcProbe {
    fn target(&self) -> &Authority {
        &self.target
    }

    async fn run(&self, connector: TunnelConnector) -> Result<String> {
        // The URI only feeds the :authority pseudo-header, the connector ignores it.
        let endpoint = Endpoint::from_shared(format!("http://{}", self.target))
            .context("invalid gRPC target")?;
        let channel = endpoint
            .connect_with_connector(connector)
            .await
            .context("failed to open gRPC channel over the tunnel")?;
        debug!(target = %self.target, "gRPC channel ready");

        let mut client = GreeterClient::new(channel);
        let reply = self
            .say_hello(&mut client)
            .await
            .context("failed to say hello")?
            .into_inner();

        info!("Greeting: {}", reply.message);
        Ok(reply.message)
    }
}
