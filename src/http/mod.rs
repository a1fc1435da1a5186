//! HTTP/1.x protocol types and parsing.
//!
//! This module provides the core HTTP primitives:
//! [`Method`], [`StatusCode`], [`Version`], [`Headers`], [`Request`], and
//! [`Response`], plus the incremental [`parser::Parser`] that turns a socket
//! byte stream into request events.

use std::fmt;

pub mod date;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;

pub use headers::Headers;
pub use request::Request;
pub use response::{Body, Response};

macro_rules! status_codes {
    ($($(#[$doc:meta])* $name:ident = $code:literal, $reason:literal;)+) => {
        /// An HTTP response status code.
        ///
        /// Only the statuses this server produces are listed; `as_u16` and
        /// `canonical_reason` are generated from one table.
        ///
        /// # Examples
        ///
        /// ```
        /// use aerie::http::StatusCode;
        ///
        /// let status = StatusCode::PartialContent;
        /// assert_eq!(status.as_u16(), 206);
        /// assert_eq!(status.canonical_reason(), "Partial Content");
        /// assert!(status.allows_body());
        /// ```
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum StatusCode {
            $($(#[$doc])* $name = $code,)+
        }

        impl StatusCode {
            /// Looks up a listed status by number.
            pub fn from_u16(code: u16) -> Option<Self> {
                match code {
                    $($code => Some(Self::$name),)+
                    _ => None,
                }
            }

            /// The reason phrase sent when a response sets none of its own.
            pub fn canonical_reason(self) -> &'static str {
                match self {
                    $(Self::$name => $reason,)+
                }
            }
        }
    };
}

status_codes! {
    Continue = 100, "Continue";
    SwitchingProtocols = 101, "Switching Protocols";

    Ok = 200, "OK";
    Created = 201, "Created";
    Accepted = 202, "Accepted";
    NoContent = 204, "No Content";
    /// A single byte range or a `multipart/byteranges` body.
    PartialContent = 206, "Partial Content";

    MovedPermanently = 301, "Moved Permanently";
    Found = 302, "Found";
    SeeOther = 303, "See Other";
    /// A conditional GET matched; sent without a body.
    NotModified = 304, "Not Modified";
    TemporaryRedirect = 307, "Temporary Redirect";
    PermanentRedirect = 308, "Permanent Redirect";

    BadRequest = 400, "Bad Request";
    Unauthorized = 401, "Unauthorized";
    Forbidden = 403, "Forbidden";
    NotFound = 404, "Not Found";
    MethodNotAllowed = 405, "Method Not Allowed";
    RequestTimeout = 408, "Request Timeout";
    Conflict = 409, "Conflict";
    Gone = 410, "Gone";
    LengthRequired = 411, "Length Required";
    PreconditionFailed = 412, "Precondition Failed";
    PayloadTooLarge = 413, "Payload Too Large";
    UriTooLong = 414, "URI Too Long";
    UnsupportedMediaType = 415, "Unsupported Media Type";
    RangeNotSatisfiable = 416, "Range Not Satisfiable";
    ExpectationFailed = 417, "Expectation Failed";
    UnprocessableEntity = 422, "Unprocessable Entity";
    /// Sent with `Sec-WebSocket-Version: 13` for unsupported handshakes.
    UpgradeRequired = 426, "Upgrade Required";
    TooManyRequests = 429, "Too Many Requests";
    RequestHeaderFieldsTooLarge = 431, "Request Header Fields Too Large";

    InternalServerError = 500, "Internal Server Error";
    NotImplemented = 501, "Not Implemented";
    BadGateway = 502, "Bad Gateway";
    ServiceUnavailable = 503, "Service Unavailable";
    GatewayTimeout = 504, "Gateway Timeout";
    HttpVersionNotSupported = 505, "HTTP Version Not Supported";
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns `false` for statuses that must never carry a message body
    /// (1xx, `204`, `304`).
    pub fn allows_body(self) -> bool {
        self.as_u16() >= 200 && !matches!(self, Self::NoContent | Self::NotModified)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> u16 {
        code.as_u16()
    }
}

macro_rules! methods {
    ($($name:ident => $token:literal,)+) => {
        /// An HTTP request method.
        ///
        /// The RFC 9110 methods are unit variants; anything else the parser
        /// accepts as a token lands in `Custom`.
        ///
        /// ```
        /// use aerie::http::Method;
        ///
        /// let method: Method = "HEAD".parse().unwrap();
        /// assert_eq!(method, Method::Head);
        /// assert_eq!(method.to_string(), "HEAD");
        /// ```
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum Method {
            $($name,)+
            Custom(String),
        }

        impl Method {
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$name => $token,)+
                    Self::Custom(token) => token.as_str(),
                }
            }
        }

        impl std::str::FromStr for Method {
            type Err = std::convert::Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(match s {
                    $($token => Self::$name,)+
                    other => Self::Custom(other.to_owned()),
                })
            }
        }
    };
}

methods! {
    Get => "GET",
    Head => "HEAD",
    Post => "POST",
    Put => "PUT",
    Delete => "DELETE",
    Connect => "CONNECT",
    Options => "OPTIONS",
    Trace => "TRACE",
    Patch => "PATCH",
}

impl Method {
    /// `false` only for `Custom`.
    pub fn is_standard(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP protocol version of a request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    /// Maps the minor version reported by `httparse`.
    pub fn from_minor(minor: u8) -> Self {
        if minor == 0 { Self::Http10 } else { Self::Http11 }
    }

    /// Returns the wire form, e.g. `HTTP/1.1`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bodyless_statuses() {
        assert!(!StatusCode::Continue.allows_body());
        assert!(!StatusCode::NoContent.allows_body());
        assert!(!StatusCode::NotModified.allows_body());
        assert!(StatusCode::RangeNotSatisfiable.allows_body());
    }

    #[test]
    fn status_display() {
        assert_eq!(
            StatusCode::RequestHeaderFieldsTooLarge.to_string(),
            "431 Request Header Fields Too Large"
        );
    }

    #[test]
    fn status_lookup() {
        assert_eq!(StatusCode::from_u16(416), Some(StatusCode::RangeNotSatisfiable));
        assert_eq!(StatusCode::from_u16(299), None);
    }

    #[test]
    fn custom_method() {
        let method: Method = "BREW".parse().unwrap();
        assert_eq!(method, Method::Custom("BREW".to_owned()));
        assert!(!method.is_standard());
    }

    #[test]
    fn version_from_minor() {
        assert_eq!(Version::from_minor(0), Version::Http10);
        assert_eq!(Version::from_minor(1).as_str(), "HTTP/1.1");
    }
}
