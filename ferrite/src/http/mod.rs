//! HTTP/1.1 server with streaming request/response transactions and
//! protocol upgrade support.

pub mod head;
pub mod server;
pub mod target;

pub use server::{
    EndTransactionCallback, ReceiveCallback, SendCallback, Server, ServerConfig, SocketOptions,
    StartTransactionCallback, Transaction, Upgrade,
};
pub use target::canonicalize;

use std::fmt;

/// Promised length of a message body. `Chunked` is the sentinel for
/// `Transfer-Encoding: chunked` framing on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContentLength {
    Length(usize),
    Chunked,
}

impl ContentLength {
    #[inline]
    pub fn is_chunked(self) -> bool {
        matches!(self, ContentLength::Chunked)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

impl HeaderField {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> HeaderField {
        HeaderField {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Continue = 100,
    SwitchingProtocols = 101,
    EarlyHints = 103,

    Ok = 200,
    Created = 201,
    Accepted = 202,
    NonAuthoritativeInformation = 203,
    NoContent = 204,
    ResetContent = 205,
    PartialContent = 206,

    MultipleChoices = 300,
    MovedPermanently = 301,
    Found = 302,
    SeeOther = 303,
    NotModified = 304,
    TemporaryRedirect = 307,
    PermanentRedirect = 308,

    BadRequest = 400,
    Unauthorized = 401,
    PaymentRequired = 402,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    NotAcceptable = 406,
    ProxyAuthenticationRequired = 407,
    RequestTimeout = 408,
    Conflict = 409,
    Gone = 410,
    LengthRequired = 411,
    PreconditionFailed = 412,
    PayloadTooLarge = 413,
    UriTooLong = 414,
    UnsupportedMediaType = 415,
    RangeNotSatisfiable = 416,
    ExpectationFailed = 417,
    UnprocessableEntity = 422,
    TooEarly = 425,
    UpgradeRequired = 426,
    PreconditionRequired = 428,
    TooManyRequests = 429,
    RequestHeaderFieldsTooLarge = 431,
    UnavailableForLegalReasons = 451,

    InternalServerError = 500,
    NotImplemented = 501,
    BadGateway = 502,
    ServiceUnavailable = 503,
    GatewayTimeout = 504,
    HttpVersionNotSupported = 505,
    VariantAlsoNegotiates = 506,
    InsufficientStorage = 507,
    LoopDetected = 508,
    NotExtended = 510,
    NetworkAuthenticationRequired = 511,
}

impl StatusCode {
    #[inline]
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn reason(self) -> &'static str {
        use StatusCode::*;

        match self {
            Continue => "Continue",
            SwitchingProtocols => "Switching Protocols",
            EarlyHints => "Early Hints",

            Ok => "OK",
            Created => "Created",
            Accepted => "Accepted",
            NonAuthoritativeInformation => "Non-Authoritative Information",
            NoContent => "No Content",
            ResetContent => "Reset Content",
            PartialContent => "Partial Content",

            MultipleChoices => "Multiple Choices",
            MovedPermanently => "Moved Permanently",
            Found => "Found",
            SeeOther => "See Other",
            NotModified => "Not Modified",
            TemporaryRedirect => "Temporary Redirect",
            PermanentRedirect => "Permanent Redirect",

            BadRequest => "Bad Request",
            Unauthorized => "Unauthorized",
            PaymentRequired => "Payment Required",
            Forbidden => "Forbidden",
            NotFound => "Not Found",
            MethodNotAllowed => "Method Not Allowed",
            NotAcceptable => "Not Acceptable",
            ProxyAuthenticationRequired => "Proxy Authentication Required",
            RequestTimeout => "Request Timeout",
            Conflict => "Conflict",
            Gone => "Gone",
            LengthRequired => "Length Required",
            PreconditionFailed => "Precondition Failed",
            PayloadTooLarge => "Payload Too Large",
            UriTooLong => "URI Too Long",
            UnsupportedMediaType => "Unsupported Media Type",
            RangeNotSatisfiable => "Range Not Satisfiable",
            ExpectationFailed => "Expectation Failed",
            UnprocessableEntity => "Unprocessable Entity",
            TooEarly => "Too Early",
            UpgradeRequired => "Upgrade Required",
            PreconditionRequired => "Precondition Required",
            TooManyRequests => "Too Many Requests",
            RequestHeaderFieldsTooLarge => "Request Header Fields Too Large",
            UnavailableForLegalReasons => "Unavailable For Legal Reasons",

            InternalServerError => "Internal Server Error",
            NotImplemented => "Not Implemented",
            BadGateway => "Bad Gateway",
            ServiceUnavailable => "Service Unavailable",
            GatewayTimeout => "Gateway Timeout",
            HttpVersionNotSupported => "HTTP Version Not Supported",
            VariantAlsoNegotiates => "Variant Also Negotiates",
            InsufficientStorage => "Insufficient Storage",
            LoopDetected => "Loop Detected",
            NotExtended => "Not Extended",
            NetworkAuthenticationRequired => "Network Authentication Required",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Returns the `Upgrade` token when the transaction is a well-formed
/// upgrade request: a GET with `Connection: upgrade` and an `Upgrade`
/// header and no request body.
pub fn is_upgrade(transaction: &Transaction) -> Option<String> {
    if "GET" != transaction.request_method {
        return None;
    }

    if !transaction.contains_request_value("Connection", "upgrade", ",") {
        return None;
    }

    let upgrade = transaction.request_value("Upgrade", 0)?;

    if ContentLength::Length(0) != transaction.request_content_length {
        return None;
    }

    Some(upgrade)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code() {
        assert_eq!(StatusCode::Ok.code(), 200);
        assert_eq!(StatusCode::Ok.reason(), "OK");
        assert_eq!(StatusCode::SwitchingProtocols.to_string(), "101 Switching Protocols");
        assert_eq!(StatusCode::BadRequest.to_string(), "400 Bad Request");
    }

    #[test]
    fn test_header_field_display() {
        let field = HeaderField::new("Content-Type", "text/plain");
        assert_eq!(field.to_string(), "Content-Type: text/plain");
    }

    #[test]
    fn test_content_length() {
        assert!(ContentLength::Chunked.is_chunked());
        assert!(!ContentLength::Length(0).is_chunked());
        assert_ne!(ContentLength::Length(0), ContentLength::Chunked);
    }
}
