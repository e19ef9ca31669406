use anyhow::Error;

/// Failures while handling a request that map onto a SIP status code.
#[derive(Debug)]
pub enum ProxyError {
    BadRequest(String),
    HopLimitExceeded,
    RoutingLoop(String),
    NotFound(String),
    Unavailable(String),
    Timeout,
    NoDialog,
    Other(Error),
}

impl ProxyError {
    pub fn status_code(&self) -> rsip::StatusCode {
        match self {
            ProxyError::BadRequest(_) => rsip::StatusCode::BadRequest,
            ProxyError::HopLimitExceeded => rsip::StatusCode::TooManyHops,
            ProxyError::RoutingLoop(_) => rsip::StatusCode::LoopDetected,
            ProxyError::NotFound(_) => rsip::StatusCode::NotFound,
            ProxyError::Unavailable(_) => rsip::StatusCode::ServiceUnavailable,
            ProxyError::Timeout => rsip::StatusCode::ServerTimeOut,
            ProxyError::NoDialog => rsip::StatusCode::CallTransactionDoesNotExist,
            ProxyError::Other(_) => rsip::StatusCode::ServerInternalError,
        }
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::BadRequest(reason) => write!(f, "Bad request: {}", reason),
            ProxyError::HopLimitExceeded => write!(f, "Max-Forwards exhausted"),
            ProxyError::RoutingLoop(via) => write!(f, "Loop detected via {}", via),
            ProxyError::NotFound(what) => write!(f, "Not found: {}", what),
            ProxyError::Unavailable(reason) => write!(f, "Service unavailable: {}", reason),
            ProxyError::Timeout => write!(f, "Downstream timed out"),
            ProxyError::NoDialog => write!(f, "No matching dialog"),
            ProxyError::Other(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<Error> for ProxyError {
    fn from(e: Error) -> Self {
        ProxyError::Other(e)
    }
}
