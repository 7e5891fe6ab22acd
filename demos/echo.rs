//! Echo demo: hosts two in-process echo servers and calls them through a proxy.
//!
//! Run with `cargo run --example echo`. Set `RUST_LOG=surge=debug` for more detail.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;

use surge::{
    init_logging, AddressModel, ClientConfig, InvokeHandler, InvokeServer, RemoteInvokeMessage, RemoteInvokeResult,
    ServiceDescriptor, ServiceProxy, ServiceRoute, StaticRouteProvider, TcpTransport,
};

const CONFIG: &str = r#"
[invoke]
default_timeout = 1000

[health]
check_interval = 2000

[log]
level = "info"

[[commands]]
Key = "Echo"
ShuntStrategy = "Polling"
MaxConcurrentRequests = 16
"#;

struct Echo {
    name: String,
}

#[async_trait]
impl InvokeHandler for Echo {
    async fn handle(&self, request: RemoteInvokeMessage) -> RemoteInvokeResult {
        RemoteInvokeResult::success(json!({
            "server": self.name,
            "echo": request.parameters.get("text"),
        }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ClientConfig::from_toml_str(CONFIG).context("parse config")?;
    init_logging(&config.log)?;

    let codec = Arc::new(config.codec());
    let mut servers = Vec::new();
    let mut addresses = Vec::new();
    for name in ["echo-a", "echo-b"] {
        let handler = Arc::new(Echo { name: name.to_string() });
        let server = InvokeServer::bind("127.0.0.1:0", Arc::clone(&codec), handler).await?;
        addresses.push(AddressModel::new("127.0.0.1", server.local_addr().port()));
        servers.push(server);
    }

    let routes = Arc::new(StaticRouteProvider::new());
    routes.set_route(ServiceRoute::new(ServiceDescriptor::new("Echo"), addresses));

    let transport = Arc::new(TcpTransport::with_config(Arc::clone(&codec), config.transport.clone()));
    let proxy = ServiceProxy::builder(routes, transport).config(&config)?.build();

    for i in 0..4 {
        let mut params = HashMap::new();
        params.insert("text".to_string(), json!(format!("hello #{}", i)));
        let reply = proxy.invoke("Echo", params, None).await?;
        println!("{}", reply);
    }

    for server in &servers {
        server.shutdown();
    }
    Ok(())
}
