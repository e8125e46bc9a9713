use std::future::Future;

use anyhow::{anyhow, Result};
use tokio::net::TcpListener;
use tonic::transport::server::TcpIncoming;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::info;

use crate::proto::{Greeter, GreeterServer, HelloReply, HelloRequest};

/// Greets whoever asks.
#[derive(Debug, Default)]
pub struct HelloGreeter;

pub fn greeting(name: &str) -> String {
    format!("Hello, {}", name)
}

#[tonic::async_trait]
impl Greeter for HelloGreeter {
    async fn say_hello(
        &self,
        request: Request<HelloRequest>,
    ) -> Result<Response<HelloReply>, Status> {
        info!(remote = ?request.remote_addr(), "Got a request: {:?}", request.get_ref());

        Ok(Response::new(HelloReply {
            message: greeting(&request.into_inner().name),
        }))
    }
}

/// Serve `greeter` on `listener` until `shutdown` resolves.
pub async fn serve<G, F>(listener: TcpListener, greeter: G, shutdown: F) -> Result<()>
where
    G: Greeter,
    F: Future<Output = ()>,
{
    let addr = listener.local_addr()?;
    let incoming = TcpIncoming::from_listener(listener, true, None).map_err(|e| anyhow!(e))?;
    info!("Start grpc server on: {}", addr);

    Server::builder()
        .add_service(GreeterServer::new(greeter))
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await?;

    info!("grpc server stopped");
    Ok(())
}
