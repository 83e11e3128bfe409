/// Outcome of a failed protocol parse. `Incomplete` is not fatal: the caller
/// should read more bytes from the stream and parse again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Incomplete,
    NoSni,
    InvalidArgument(String),
    AllocationFailure,
    Malformed(String),
}

impl ParseError {
    pub fn malformed(msg: &str) -> ParseError {
        ParseError::Malformed(msg.into())
    }

    pub fn invalid(msg: String) -> ParseError {
        ParseError::InvalidArgument(msg)
    }

    pub fn is_retryable(&self) -> bool {
        *self == ParseError::Incomplete
    }
}

impl std::error::Error for ParseError {}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Incomplete => write!(f, "incomplete request"),
            ParseError::NoSni => write!(f, "no server name indication"),
            ParseError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            ParseError::AllocationFailure => write!(f, "allocation failure"),
            ParseError::Malformed(msg) => write!(f, "invalid tls client hello: {msg}"),
        }
    }
}
