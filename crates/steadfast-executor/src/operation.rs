//! Operation descriptors.
//!
//! An [`Operation`] declaratively describes one unit of unreliable work,
//! a transport request or an arbitrary async function, together with its
//! resilience profile, hooks and observability flags. Descriptors are
//! immutable once dispatched; the runtime only reads them.

use crate::profile::ProfilePatch;
use crate::result::AttemptRecord;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use steadfast_buffer::StableBuffer;
use steadfast_core::{ExecutionContext, OperationError};

/// Opaque JSON state shared between hooks, buffers and job payloads.
pub type StateValue = serde_json::Value;

/// The buffer object threaded through every hook of a composite execution.
pub type SharedBuffer = Arc<StableBuffer<StateValue>>;

/// Transport verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    #[default]
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

/// A parameterised request, transport-agnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSpec {
    pub method: Method,
    pub protocol: Protocol,
    pub hostname: String,
    /// Default 443.
    pub port: u16,
    /// Default "/".
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<StateValue>,
    /// Request-level attempt deadline; the profile timeout wins if both
    /// are set and shorter.
    pub timeout: Option<Duration>,
}

impl RequestSpec {
    pub fn new(method: Method, hostname: impl Into<String>) -> Self {
        Self {
            method,
            protocol: Protocol::Https,
            hostname: hostname.into(),
            port: 443,
            path: "/".to_string(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(hostname: impl Into<String>) -> Self {
        Self::new(Method::Get, hostname)
    }

    pub fn post(hostname: impl Into<String>) -> Self {
        Self::new(Method::Post, hostname)
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: StateValue) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Full URL including the query string.
    pub fn url(&self) -> String {
        let mut url = format!(
            "{}://{}:{}{}",
            self.protocol.as_str(),
            self.hostname,
            self.port,
            if self.path.starts_with('/') {
                self.path.clone()
            } else {
                format!("/{}", self.path)
            }
        );
        for (i, (name, value)) in self.query.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(name);
            url.push('=');
            url.push_str(value);
        }
        url
    }
}

/// Inputs handed to a pre-execution hook.
pub struct HookInput {
    pub context: ExecutionContext,
    pub params: Option<StateValue>,
    pub buffer: Option<SharedBuffer>,
}

/// A hook run before each attempt. It may return a partial profile
/// override, applied for that attempt only when the operation opts in.
pub type PreExecutionHook<T> = Arc<
    dyn Fn(HookInput) -> BoxFuture<'static, Result<Option<ProfilePatch<T>>, OperationError>>
        + Send
        + Sync,
>;

/// What a response analyzer concluded about a successful invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Analysis {
    /// The payload is genuinely good.
    Pass,
    /// Transport-level success but semantically bad; treat as a failure.
    Fail { message: String, retryable: bool },
}

/// Inputs handed to a response analyzer.
pub struct AnalyzerInput<T> {
    pub payload: T,
    /// Transport status, absent for function operations.
    pub status: Option<u16>,
    pub context: ExecutionContext,
    pub buffer: Option<SharedBuffer>,
}

pub type ResponseAnalyzer<T> = Arc<
    dyn Fn(AnalyzerInput<T>) -> BoxFuture<'static, Result<Analysis, OperationError>> + Send + Sync,
>;

/// Verdict of a final-error analyzer after attempts are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalDisposition {
    /// Report the failure normally.
    Propagate,
    /// Recovered failure: the caller sees success=false with the error
    /// held out of the throw path, and composite executors continue.
    Suppress,
}

/// Inputs handed to a final-error analyzer.
pub struct FinalErrorInput {
    pub error: OperationError,
    pub attempts_made: u32,
    pub context: ExecutionContext,
    pub buffer: Option<SharedBuffer>,
}

pub type FinalErrorAnalyzer =
    Arc<dyn Fn(FinalErrorInput) -> BoxFuture<'static, FinalDisposition> + Send + Sync>;

/// Observer of failed attempts (fires when `log_all_errors` is set).
pub type ErrorHandler = Arc<dyn Fn(&OperationError, &ExecutionContext) + Send + Sync>;

/// Observer of successful attempts (fires when `log_all_successes` is set).
pub type SuccessHandler<T> = Arc<dyn Fn(&AttemptRecord<T>, &ExecutionContext) + Send + Sync>;

/// Inputs handed to a function operation.
pub struct CallInput {
    pub context: ExecutionContext,
    pub buffer: Option<SharedBuffer>,
}

/// The callable of a function operation.
pub type CallFn<T> =
    Arc<dyn Fn(CallInput) -> BoxFuture<'static, Result<T, OperationError>> + Send + Sync>;

/// What kind of work an operation performs.
pub enum OperationKind<T> {
    /// A transport request.
    Request(RequestSpec),
    /// An arbitrary async function.
    Call {
        /// Stable identity for cache fingerprints.
        identity: String,
        /// Canonical argument material for cache fingerprints.
        args: StateValue,
        f: CallFn<T>,
    },
}

impl<T> Clone for OperationKind<T> {
    fn clone(&self) -> Self {
        match self {
            OperationKind::Request(spec) => OperationKind::Request(spec.clone()),
            OperationKind::Call { identity, args, f } => OperationKind::Call {
                identity: identity.clone(),
                args: args.clone(),
                f: Arc::clone(f),
            },
        }
    }
}

impl<T> fmt::Debug for OperationKind<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Request(spec) => f.debug_tuple("Request").field(&spec.url()).finish(),
            OperationKind::Call { identity, .. } => {
                f.debug_struct("Call").field("identity", identity).finish()
            }
        }
    }
}

/// One attempt-bearing unit of work.
pub struct Operation<T> {
    /// Unique within its batch or phase.
    pub id: String,
    /// Group identifier for group-level profile policy.
    pub group: Option<String>,
    pub kind: OperationKind<T>,
    /// Per-descriptor profile overrides.
    pub profile: ProfilePatch<T>,
    pub pre_hook: Option<PreExecutionHook<T>>,
    pub pre_hook_params: Option<StateValue>,
    /// Apply the hook's returned override to the current attempt.
    pub apply_pre_hook_override: bool,
    /// Treat a failed pre-hook as a retryable attempt failure instead of a
    /// fatal one.
    pub continue_on_pre_hook_failure: bool,
    pub response_analyzer: Option<ResponseAnalyzer<T>>,
    pub final_error_analyzer: Option<FinalErrorAnalyzer>,
    pub log_all_errors: bool,
    pub log_all_successes: bool,
    pub on_error: Option<ErrorHandler>,
    pub on_success: Option<SuccessHandler<T>>,
    pub context: ExecutionContext,
    pub buffer: Option<SharedBuffer>,
}

impl<T> Clone for Operation<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            group: self.group.clone(),
            kind: self.kind.clone(),
            profile: self.profile.clone(),
            pre_hook: self.pre_hook.clone(),
            pre_hook_params: self.pre_hook_params.clone(),
            apply_pre_hook_override: self.apply_pre_hook_override,
            continue_on_pre_hook_failure: self.continue_on_pre_hook_failure,
            response_analyzer: self.response_analyzer.clone(),
            final_error_analyzer: self.final_error_analyzer.clone(),
            log_all_errors: self.log_all_errors,
            log_all_successes: self.log_all_successes,
            on_error: self.on_error.clone(),
            on_success: self.on_success.clone(),
            context: self.context.clone(),
            buffer: self.buffer.clone(),
        }
    }
}

impl<T> fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("kind", &self.kind)
            .finish()
    }
}

impl<T> Operation<T> {
    fn with_kind(id: impl Into<String>, kind: OperationKind<T>) -> Self {
        Self {
            id: id.into(),
            group: None,
            kind,
            profile: ProfilePatch::default(),
            pre_hook: None,
            pre_hook_params: None,
            apply_pre_hook_override: false,
            continue_on_pre_hook_failure: false,
            response_analyzer: None,
            final_error_analyzer: None,
            log_all_errors: false,
            log_all_successes: false,
            on_error: None,
            on_success: None,
            context: ExecutionContext::default(),
            buffer: None,
        }
    }

    /// A transport request operation.
    pub fn request(id: impl Into<String>, spec: RequestSpec) -> Self {
        Self::with_kind(id, OperationKind::Request(spec))
    }

    /// A function operation. The id doubles as its cache identity.
    pub fn call<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
    {
        let id = id.into();
        let identity = id.clone();
        Self::with_kind(
            id,
            OperationKind::Call {
                identity,
                args: StateValue::Null,
                f: Arc::new(move |input| Box::pin(f(input))),
            },
        )
    }

    /// Canonical argument material folded into the function fingerprint.
    pub fn with_call_args(mut self, args: StateValue) -> Self {
        if let OperationKind::Call { args: slot, .. } = &mut self.kind {
            *slot = args;
        }
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_profile(mut self, profile: ProfilePatch<T>) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_buffer(mut self, buffer: SharedBuffer) -> Self {
        self.buffer = Some(buffer);
        self
    }

    /// Install a pre-execution hook.
    pub fn with_pre_hook<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<ProfilePatch<T>>, OperationError>> + Send + 'static,
    {
        self.pre_hook = Some(Arc::new(move |input| Box::pin(f(input))));
        self
    }

    pub fn with_pre_hook_params(mut self, params: StateValue) -> Self {
        self.pre_hook_params = Some(params);
        self
    }

    pub fn apply_pre_hook_override(mut self, apply: bool) -> Self {
        self.apply_pre_hook_override = apply;
        self
    }

    pub fn continue_on_pre_hook_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_pre_hook_failure = continue_on_failure;
        self
    }

    /// Install a response analyzer.
    pub fn with_response_analyzer<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(AnalyzerInput<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Analysis, OperationError>> + Send + 'static,
    {
        self.response_analyzer = Some(Arc::new(move |input| Box::pin(f(input))));
        self
    }

    /// Install a final-error analyzer.
    pub fn with_final_error_analyzer<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(FinalErrorInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FinalDisposition> + Send + 'static,
    {
        self.final_error_analyzer = Some(Arc::new(move |input| Box::pin(f(input))));
        self
    }

    pub fn log_all_errors(mut self, log: bool) -> Self {
        self.log_all_errors = log;
        self
    }

    pub fn log_all_successes(mut self, log: bool) -> Self {
        self.log_all_successes = log;
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&OperationError, &ExecutionContext) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self.log_all_errors = true;
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&AttemptRecord<T>, &ExecutionContext) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self.log_all_successes = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_renders_defaults() {
        let spec = RequestSpec::get("api.example.com");
        assert_eq!(spec.url(), "https://api.example.com:443/");
    }

    #[test]
    fn url_renders_path_port_and_query() {
        let spec = RequestSpec::get("api.example.com")
            .with_protocol(Protocol::Http)
            .with_port(8080)
            .with_path("/v1/items")
            .with_query("page", "2")
            .with_query("limit", "50");
        assert_eq!(
            spec.url(),
            "http://api.example.com:8080/v1/items?page=2&limit=50"
        );
    }

    #[test]
    fn bare_paths_gain_a_leading_slash() {
        let spec = RequestSpec::get("api.example.com").with_path("health");
        assert_eq!(spec.url(), "https://api.example.com:443/health");
    }

    #[test]
    fn call_operations_default_identity_to_id() {
        let op: Operation<u32> = Operation::call("lookup", |_| async { Ok(1) });
        match &op.kind {
            OperationKind::Call { identity, .. } => assert_eq!(identity, "lookup"),
            _ => panic!("expected a call"),
        }
    }
}
