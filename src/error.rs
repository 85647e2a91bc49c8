use std::fmt;

/// Domain errors. Node-local failures (dialplan, remote resource) travel
/// through the status ledger as `*_error` + `stop` statuses; this enum only
/// surfaces where a `Result` crosses a boundary: plan loading, call
/// admission, the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A call-flow definition is missing required structure.
    MalformedPlan(String),
    /// A node's required runtime parameter is missing or invalid.
    Dialplan(String),
    /// A remote protocol call failed or returned a non-success code.
    RemoteResource { code: u16, message: String },
    /// A live room already exists for this call id.
    DuplicateCall(String),
    /// The dispatcher no longer admits new calls.
    AdmissionClosed,
    /// No live room for this call id.
    UnknownCall(String),
    /// An inbound event could not be mapped to a call.
    Correlation(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MalformedPlan(msg) => write!(f, "malformed plan: {}", msg),
            Error::Dialplan(msg) => write!(f, "dialplan error: {}", msg),
            Error::RemoteResource { code, message } => {
                write!(f, "remote resource error (http {}): {}", code, message)
            }
            Error::DuplicateCall(call_id) => {
                write!(f, "a call with id {} is already live", call_id)
            }
            Error::AdmissionClosed => write!(f, "admission is closed"),
            Error::UnknownCall(call_id) => write!(f, "no live call with id {}", call_id),
            Error::Correlation(msg) => write!(f, "correlation error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
