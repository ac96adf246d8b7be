#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use uuid::Uuid;

use flag_overrides::api::actor::ACTOR_HEADER;
use flag_overrides::config::Config;
use flag_overrides::server::serve;

pub use flag_overrides::config::DEFAULT_TEST_CONFIG;

pub struct ServerHandle {
    pub addr: SocketAddr,
    client: reqwest::Client,
    shutdown: Arc<Notify>,
}

impl ServerHandle {
    pub async fn for_config(config: Config) -> ServerHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        tokio::spawn(async move {
            serve(config, listener, async move { notify.notified().await }).await
        });
        ServerHandle {
            addr,
            client: reqwest::Client::new(),
            shutdown,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{:?}{}", self.addr, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn post_as(&self, actor: Uuid, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header(ACTOR_HEADER, actor.to_string())
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn put_as(&self, actor: Uuid, path: &str, body: Value) -> reqwest::Response {
        self.client
            .put(self.url(path))
            .header(ACTOR_HEADER, actor.to_string())
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn delete_as(&self, actor: Uuid, path: &str) -> reqwest::Response {
        self.client
            .delete(self.url(path))
            .header(ACTOR_HEADER, actor.to_string())
            .send()
            .await
            .expect("failed to send request")
    }

    /// Creates a boolean flag and returns its JSON representation.
    pub async fn create_flag(&self, actor: Uuid, key: &str, owner: Value) -> Value {
        let res = self
            .post_as(
                actor,
                "/flags",
                json!({
                    "key": key,
                    "type": "boolean",
                    "defaultValue": "false",
                    "description": "test flag",
                    "owner": owner,
                }),
            )
            .await;
        assert_eq!(res.status(), reqwest::StatusCode::CREATED);
        let body = res.json::<Value>().await.unwrap();
        body["data"].clone()
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}

pub fn org_owner(organization_id: Uuid) -> Value {
    json!({"kind": "organization", "organizationId": organization_id})
}

pub fn personal_owner(user_id: Uuid) -> Value {
    json!({"kind": "personal", "userId": user_id})
}
