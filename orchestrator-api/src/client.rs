use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::instance::{determine_master, Instance, InstanceKey, TopologyRecovery};

/// Timeout of a single orchestrator request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The operations the operator needs from orchestrator
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Ask orchestrator to start polling a host
    async fn discover(&self, host: &str, port: u16) -> Result<()>;

    /// Ask orchestrator to drop a host
    async fn forget(&self, host: &str, port: u16) -> Result<()>;

    /// The master of the cluster, as seen by orchestrator
    async fn master(&self, cluster_hint: &str) -> Result<Instance>;

    /// All instances of the cluster
    async fn cluster(&self, cluster_hint: &str) -> Result<Vec<Instance>>;

    /// The recoveries performed on the cluster
    async fn audit_recovery(&self, cluster_hint: &str) -> Result<Vec<TopologyRecovery>>;

    /// Acknowledge a recovery so orchestrator may run the next one
    async fn ack_recovery(&self, id: i64, comment: &str) -> Result<()>;

    /// Turn `read_only` off on a host
    async fn set_host_writable(&self, key: &InstanceKey) -> Result<()>;

    /// Turn `read_only` on on a host
    async fn set_host_read_only(&self, key: &InstanceKey) -> Result<()>;

    /// The master of the cluster computed from its instance list, stricter
    /// than [`Orchestrator::master`] as any ambiguity is an error
    async fn determined_master(&self, cluster_hint: &str) -> Result<Instance> {
        let instances = self.cluster(cluster_hint).await?;
        determine_master(&instances).cloned()
    }
}

/// The envelope of orchestrator replies without payload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiResponse {
    /// `OK` or `ERROR`
    code: String,
    /// Description
    #[serde(default)]
    message: String,
}

/// Orchestrator over its http api
#[derive(Debug, Clone)]
pub struct HttpOrchestrator {
    /// Base uri, such as `http://orchestrator:80/api`
    base_uri: String,
    /// Http client
    client: reqwest::Client,
}

impl HttpOrchestrator {
    /// New an orchestrator client
    ///
    /// # Errors
    ///
    /// Return error when the http client cannot be built
    #[inline]
    pub fn new(base_uri: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_uri: base_uri.into().trim_end_matches('/').to_owned(),
            client,
        })
    }

    /// Full url of an api path
    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_uri)
    }

    /// Send a request and decode its payload
    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if status.is_server_error() {
            return Err(Error::Status {
                status: status.as_u16(),
                message: reply_message(&body),
            });
        }
        serde_json::from_slice(&body).map_err(|err| {
            debug!("cannot decode orchestrator reply: {}", String::from_utf8_lossy(&body));
            if status.is_success() {
                Error::Decode(err)
            } else {
                Error::Status {
                    status: status.as_u16(),
                    message: reply_message(&body),
                }
            }
        })
    }

    /// GET a path returning a payload
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        debug!("orc request on: {url}");
        self.send(self.client.get(url)).await
    }

    /// Check the `{Code, Message}` envelope of a reply
    async fn call(&self, request: reqwest::RequestBuilder) -> Result<()> {
        let reply: ApiResponse = self.send(request).await?;
        if reply.code != "OK" {
            return Err(Error::Api {
                code: reply.code,
                message: reply.message,
            });
        }
        Ok(())
    }

    /// GET a path returning only the envelope
    async fn get_api(&self, path: &str) -> Result<()> {
        let url = self.url(path);
        debug!("orc request on: {url}");
        self.call(self.client.get(url)).await
    }
}

/// The `Message` of an error reply, the raw body when it is not json
fn reply_message(body: &[u8]) -> String {
    serde_json::from_slice::<ApiResponse>(body).map_or_else(
        |_err| String::from_utf8_lossy(body).into_owned(),
        |reply| reply.message,
    )
}

#[async_trait]
impl Orchestrator for HttpOrchestrator {
    async fn discover(&self, host: &str, port: u16) -> Result<()> {
        self.get_api(&format!("discover/{host}/{port}")).await
    }

    async fn forget(&self, host: &str, port: u16) -> Result<()> {
        self.get_api(&format!("forget/{host}/{port}")).await
    }

    async fn master(&self, cluster_hint: &str) -> Result<Instance> {
        self.get(&format!("master/{cluster_hint}")).await
    }

    async fn cluster(&self, cluster_hint: &str) -> Result<Vec<Instance>> {
        self.get(&format!("cluster/{cluster_hint}")).await
    }

    async fn audit_recovery(&self, cluster_hint: &str) -> Result<Vec<TopologyRecovery>> {
        self.get(&format!("audit-recovery/{cluster_hint}")).await
    }

    async fn ack_recovery(&self, id: i64, comment: &str) -> Result<()> {
        let url = self.url(&format!("ack-recovery/{id}"));
        debug!("orc request on: {url}");
        self.call(self.client.post(url).query(&[("comment", comment)]))
            .await
    }

    async fn set_host_writable(&self, key: &InstanceKey) -> Result<()> {
        self.get_api(&format!("set-writeable/{}/{}", key.hostname, key.port))
            .await
    }

    async fn set_host_read_only(&self, key: &InstanceKey) -> Result<()> {
        self.get_api(&format!("set-read-only/{}/{}", key.hostname, key.port))
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn url_is_joined_once() {
        let orc = HttpOrchestrator::new("http://orc:3000/api/").unwrap();
        assert_eq!(orc.url("discover/h/3306"), "http://orc:3000/api/discover/h/3306");
    }

    #[test]
    fn error_message_prefers_envelope() {
        assert_eq!(
            reply_message(br#"{"Code":"ERROR","Message":"No masters found"}"#),
            "No masters found"
        );
        assert_eq!(reply_message(b"bad gateway"), "bad gateway");
    }
}
