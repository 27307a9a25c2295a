use thiserror::Error;

/// Upstream code for an access token that has lapsed.
pub const ERRCODE_TOKEN_EXPIRED: i64 = 42001;
/// Upstream code for an access token that is invalid or was superseded.
pub const ERRCODE_INVALID_CREDENTIAL: i64 = 40001;
/// OAuth code missing from the exchange request.
pub const ERRCODE_MISSING_CODE: i64 = 41008;
/// OAuth code already used or never issued.
pub const ERRCODE_INVALID_CODE: i64 = 40029;
/// OAuth code consumed by an earlier exchange.
pub const ERRCODE_CODE_BEEN_USED: i64 = 40163;

/// Errors surfaced by the envelope, signing, cipher and credential layers.
///
/// The type is `Clone` so that a single failed refresh can be handed to every
/// caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("credential expired ({code}): {message}")]
    CredentialExpired { code: i64, message: String },

    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),

    #[error("upstream error {code}: {message}")]
    Upstream { code: i64, message: String },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("{operation} is not supported for {kind} accounts")]
    Unsupported { kind: String, operation: String },

    #[error("transport error: {0}")]
    Transport(String),
}

pub type GateResult<T> = Result<T, GateError>;

impl GateError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        GateError::MalformedInput(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        GateError::Authentication(msg.into())
    }

    /// Build the error for an upstream `errcode`/`errmsg` pair.
    pub fn from_errcode(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ERRCODE_TOKEN_EXPIRED | ERRCODE_INVALID_CREDENTIAL => {
                GateError::CredentialExpired { code, message }
            }
            _ => GateError::Upstream { code, message },
        }
    }

    pub fn is_credential_expired(&self) -> bool {
        matches!(self, GateError::CredentialExpired { .. })
    }

    /// The OAuth code cannot be exchanged, so the user has to be sent back
    /// through the authorize page for a new one.
    pub fn is_stale_oauth_code(&self) -> bool {
        matches!(
            self,
            GateError::Upstream {
                code: ERRCODE_MISSING_CODE | ERRCODE_INVALID_CODE | ERRCODE_CODE_BEEN_USED,
                ..
            }
        )
    }

    /// Upstream error code, `-2` for transport failures, `0` otherwise.
    pub fn code(&self) -> i64 {
        match self {
            GateError::CredentialExpired { code, .. } | GateError::Upstream { code, .. } => *code,
            GateError::Transport(_) => -2,
            _ => 0,
        }
    }
}

impl From<base64::DecodeError> for GateError {
    fn from(err: base64::DecodeError) -> Self {
        GateError::MalformedInput(format!("base64: {err}"))
    }
}

impl From<quick_xml::Error> for GateError {
    fn from(err: quick_xml::Error) -> Self {
        GateError::MalformedInput(format!("xml: {err}"))
    }
}

impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        GateError::MalformedInput(format!("json: {err}"))
    }
}

impl From<reqwest::Error> for GateError {
    fn from(err: reqwest::Error) -> Self {
        GateError::Transport(err.to_string())
    }
}
