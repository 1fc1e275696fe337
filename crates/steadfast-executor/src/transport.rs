//! Transport seam.
//!
//! The runtime never issues network traffic itself; callers plug in any
//! client that can take a [`RequestSpec`](crate::RequestSpec) and produce a
//! status, headers and a decoded body.

use crate::operation::RequestSpec;
use async_trait::async_trait;
use steadfast_core::{ExecutionContext, OperationError};

/// A response as the executor sees it.
#[derive(Debug, Clone)]
pub struct TransportResponse<T> {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: T,
}

impl<T> TransportResponse<T> {
    pub fn new(status: u16, body: T) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header with the given name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A client able to execute one parameterised request.
#[async_trait]
pub trait Transport<T>: Send + Sync {
    async fn send(
        &self,
        request: &RequestSpec,
        context: &ExecutionContext,
    ) -> Result<TransportResponse<T>, OperationError>;
}
