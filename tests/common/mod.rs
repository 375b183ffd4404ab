#![allow(dead_code)]

use remote_agent::{http_server, AgentConfig, AppState};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const TOKEN: &str = "test-token";

pub struct TestAgent {
    pub addr: SocketAddr,
    pub state: AppState,
    pub client: reqwest::Client,
    root: TempDir,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<io::Result<()>>,
}

pub async fn start() -> TestAgent {
    start_with(|config| config).await
}

pub async fn start_with(configure: impl FnOnce(AgentConfig) -> AgentConfig) -> TestAgent {
    let root = TempDir::new().unwrap();
    let mut config = AgentConfig::new(root.path(), TOKEN).unwrap();
    config.shell = "/bin/sh".to_string();
    let state = AppState::new(configure(config)).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, signal) = oneshot::channel::<()>();
    let server = tokio::spawn(http_server::serve(listener, state.clone(), async move {
        let _ = signal.await;
    }));

    TestAgent {
        addr,
        state,
        client: reqwest::Client::new(),
        root,
        shutdown,
        server,
    }
}

impl TestAgent {
    pub fn root(&self) -> &Path {
        self.state.sandbox.root()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, query: &str) -> String {
        format!("ws://{}/terminal{}", self.addr, query)
    }

    /// POST `body` with the bearer token; returns status and JSON body.
    pub async fn post(&self, path: &str, body: serde_json::Value) -> (u16, serde_json::Value) {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(TOKEN)
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(serde_json::Value::Null))
    }

    pub async fn get(&self, path: &str) -> (u16, serde_json::Value) {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(serde_json::Value::Null))
    }

    /// Trigger graceful shutdown and wait for the server to return.
    pub async fn stop(self) -> io::Result<()> {
        let _ = self.shutdown.send(());
        let result = self.server.await.unwrap();
        drop(self.root);
        result
    }
}
