//! In-process test doubles shared by the unit tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::error::ClientError;
use crate::transport::{ApiRequest, ApiResponse, Transport};

type Handler = dyn Fn(&ApiRequest) -> Result<ApiResponse, ClientError> + Send + Sync;

/// A recorded call: path and the bearer credential it carried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub path: String,
    pub bearer: Option<String>,
}

/// Answers every request with a scripted closure and records what it saw.
pub struct ScriptedTransport {
    handler: Box<Handler>,
    delay: Option<Duration>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&ApiRequest) -> (StatusCode, String) + Send + Sync + 'static,
    {
        Self::with_results(move |req| {
            let (status, body) = respond(req);
            Ok(ApiResponse::new(status, body))
        })
    }

    pub fn with_results<F>(respond: F) -> Self
    where
        F: Fn(&ApiRequest) -> Result<ApiResponse, ClientError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(respond),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Hold every response for `delay`, widening the window in which
    /// concurrent requests overlap
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls().iter().filter(|c| c.path == path).count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ClientError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                path: request.path.clone(),
                bearer: request.bearer_token().map(str::to_string),
            });
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(request)
    }
}
