//! Kusto REST client

use super::auth::Authenticator;
use super::http::{HttpRequest, HttpResponse, HttpTransport};
use super::table::{parse_v1, ResultTable};
use crate::error::{OpsError, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Which REST endpoint a command goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// `/v1/rest/query`
    Query,
    /// `/v1/rest/mgmt` (control commands starting with `.`)
    Management,
}

impl CommandKind {
    /// Management for text starting with `.`, query otherwise
    pub fn detect(csl: &str) -> Self {
        if csl.trim_start().starts_with('.') {
            Self::Management
        } else {
            Self::Query
        }
    }

    fn path(&self) -> &'static str {
        match self {
            Self::Query => "/v1/rest/query",
            Self::Management => "/v1/rest/mgmt",
        }
    }
}

/// Format a duration as the `hh:mm:ss` timespan Kusto request options expect
pub fn kusto_timespan(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Client bound to one cluster
pub struct KustoClient {
    cluster: String,
    transport: Arc<dyn HttpTransport>,
    auth: Authenticator,
    properties: Value,
}

impl KustoClient {
    /// Client for `cluster` (e.g. `https://help.kusto.windows.net`)
    pub fn new(cluster: impl Into<String>, transport: Arc<dyn HttpTransport>, auth: Authenticator) -> Self {
        Self {
            cluster: cluster.into().trim_end_matches('/').to_string(),
            transport,
            auth,
            properties: json!({"Options": {}}),
        }
    }

    /// Set a client request option such as `servertimeout`
    pub fn with_option(mut self, name: &str, value: Value) -> Self {
        if let Some(options) = self.properties["Options"].as_object_mut() {
            options.insert(name.to_string(), value);
        }
        self
    }

    /// Cluster URL
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Run a query
    pub fn execute_query(&mut self, database: &str, csl: &str) -> Result<Vec<ResultTable>> {
        self.execute(CommandKind::Query, database, csl)
    }

    /// Run a management command
    pub fn execute_mgmt(&mut self, database: &str, csl: &str) -> Result<Vec<ResultTable>> {
        self.execute(CommandKind::Management, database, csl)
    }

    /// Send a command; a 401 triggers one forced interactive login and one retry
    pub fn execute(&mut self, kind: CommandKind, database: &str, csl: &str) -> Result<Vec<ResultTable>> {
        let url = format!("{}{}", self.cluster, kind.path());
        let body = json!({
            "db": database,
            "csl": csl,
            "properties": self.properties,
        });

        let token = self.auth.token()?;
        let mut response = self.send(&url, &body, &token.token)?;

        if response.status == 401 {
            tracing::warn!("{} rejected the token from {}, signing in again", self.cluster, token.source);
            self.auth.invalidate();
            let token = self.auth.login(true)?;
            response = self.send(&url, &body, &token.token)?;
            if response.status == 401 {
                return Err(OpsError::Unauthorized(url));
            }
        }

        if !response.is_success() {
            return Err(OpsError::KustoRequest {
                status: response.status,
                body: response.body,
            });
        }
        parse_v1(&response.body)
    }

    fn send(&self, url: &str, body: &Value, token: &str) -> Result<HttpResponse> {
        let request_id = format!("opskit;{}", uuid::Uuid::new_v4());
        tracing::debug!("POST {} ({})", url, request_id);
        let request = HttpRequest::json(url, body.clone())
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/json")
            .header("x-ms-client-request-id", request_id)
            .header("x-ms-app", "opskit");
        self.transport.send(&request)
    }
}
