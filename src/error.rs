use std::fmt;

/// Errors that cross the library boundary as genuine failures rather than
/// admission outcomes. Admission denials are `Decision` values, never
/// `Result::Err` — this enum is for configuration, backend I/O, and
/// invariant-violation failures only.
#[derive(Debug)]
#[allow(dead_code)]
pub enum GatewayError {
    Config(String),
    BackendConnect(String),
    BackendTimeout,
    Http(reqwest::Error),
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::BackendConnect(msg) => write!(f, "backend connect error: {}", msg),
            GatewayError::BackendTimeout => write!(f, "backend timeout"),
            GatewayError::Http(e) => write!(f, "http error: {}", e),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Reason a tool call was denied admission. Carried inline on a `Decision`.
/// `Display` renders the canonical wire string used in JSON-RPC error
/// messages and log lines (e.g. `"tool_not_allowed:delete"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    InvalidApiKey,
    KeyRevoked,
    KeySuspended,
    KeyExpired,
    SandboxToolDenied(String),
    SandboxToolNotAllowed(String),
    SandboxQuotaExceeded,
    ToolDenied(String),
    ToolNotAllowed(String),
    ScopeMissing(String),
    PolicyDenied(String),
    InsufficientCredits,
    SpendingLimitExceeded,
    QuotaDailyCallsExceeded,
    QuotaMonthlyCallsExceeded,
    QuotaDailyCreditsExceeded,
    QuotaMonthlyCreditsExceeded,
    HourlyCallCapExceeded,
    HourlyCreditCapExceeded,
    ServerDailyCallCap,
    ServerDailyCreditCap,
    RateLimited,
    TokenBucketExhausted,
    ConcurrencyLimit,
    CircuitOpen,
    BackendError,
    InternalError(String),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::InvalidApiKey => write!(f, "invalid_api_key"),
            DenyReason::KeyRevoked => write!(f, "key_revoked"),
            DenyReason::KeySuspended => write!(f, "key_suspended"),
            DenyReason::KeyExpired => write!(f, "key_expired"),
            DenyReason::SandboxToolDenied(t) => write!(f, "sandbox_tool_denied:{}", t),
            DenyReason::SandboxToolNotAllowed(t) => write!(f, "sandbox_tool_not_allowed:{}", t),
            DenyReason::SandboxQuotaExceeded => write!(f, "sandbox_quota_exceeded"),
            DenyReason::ToolDenied(t) => write!(f, "tool_denied:{}", t),
            DenyReason::ToolNotAllowed(t) => write!(f, "tool_not_allowed:{}", t),
            DenyReason::ScopeMissing(s) => write!(f, "scope_missing:{}", s),
            DenyReason::PolicyDenied(name) => write!(f, "policy_denied:{}", name),
            DenyReason::InsufficientCredits => write!(f, "insufficient_credits"),
            DenyReason::SpendingLimitExceeded => write!(f, "spending_limit_exceeded"),
            DenyReason::QuotaDailyCallsExceeded => write!(f, "quota_daily_calls_exceeded"),
            DenyReason::QuotaMonthlyCallsExceeded => write!(f, "quota_monthly_calls_exceeded"),
            DenyReason::QuotaDailyCreditsExceeded => write!(f, "quota_daily_credits_exceeded"),
            DenyReason::QuotaMonthlyCreditsExceeded => write!(f, "quota_monthly_credits_exceeded"),
            DenyReason::HourlyCallCapExceeded => write!(f, "hourly_call_cap_exceeded"),
            DenyReason::HourlyCreditCapExceeded => write!(f, "hourly_credit_cap_exceeded"),
            DenyReason::ServerDailyCallCap => write!(f, "server_daily_call_cap"),
            DenyReason::ServerDailyCreditCap => write!(f, "server_daily_credit_cap"),
            DenyReason::RateLimited => write!(f, "rate_limited"),
            DenyReason::TokenBucketExhausted => write!(f, "rate_limited:token_bucket"),
            DenyReason::ConcurrencyLimit => write!(f, "concurrency_limit"),
            DenyReason::CircuitOpen => write!(f, "circuit_open"),
            DenyReason::BackendError => write!(f, "backend_error"),
            DenyReason::InternalError(msg) => write!(f, "internal_error:{}", msg),
        }
    }
}

impl DenyReason {
    /// Rewritten reason string used when the call ran in shadow mode.
    pub fn shadow(&self) -> String {
        format!("shadow:{}", self)
    }

    /// JSON-RPC error code for this reason.
    pub fn rpc_code(&self) -> i64 {
        match self {
            DenyReason::BackendError | DenyReason::InternalError(_) => -32603,
            _ => -32402,
        }
    }
}
