use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    NoUpstream,
    UpstreamTransport(String),
    ResponseTooLarge { limit: usize, actual: usize },
    BulkParse(String),
    Queue(String),
    Config(String),
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoUpstream => write!(f, "no upstream available"),
            GatewayError::UpstreamTransport(msg) => write!(f, "upstream transport error: {}", msg),
            GatewayError::ResponseTooLarge { limit, actual } => write!(
                f,
                "upstream response too large: {} bytes (limit {})",
                actual, limit
            ),
            GatewayError::BulkParse(msg) => write!(f, "bulk parse error: {}", msg),
            GatewayError::Queue(msg) => write!(f, "queue error: {}", msg),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}
