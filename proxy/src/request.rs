// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! HTTP request parsing and reconstruction.
//!
//! We have two goals here:
//! 1. Valid HTTP requests get the right response.
//! 2. Requests, even if not valid HTTP, cannot bypass the filtering.
//!
//! In particular we need to worry about things like "request smuggling"
//! attacks where an invalid request is parsed differently by a filter vs
//! the end host; and we need to normalize requests so that filtering works
//! (e.g., to make sure that `/safe/path/../../dangerous/stuff` doesn't
//! match `/safe/path/`).
//!
//! We handle this by parsing the request, normalizing it, and constructing
//! a *new* request from what we parsed, so that an invalid request can't do
//! anything which a valid request couldn't do. The reconstructed request
//! carries a short allow-list of headers; everything else is discarded
//! rather than sanitized.

use crate::uripath::{encode_path, uri_to_path};
use std::fmt;
use std::io::BufRead;
use thiserror::Error;

/// The request methods the metadata service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Put,
    Post,
}

impl Method {
    fn parse(token: &str) -> Option<Method> {
        match token {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            "PUT" => Some(Method::Put),
            "POST" => Some(Method::Post),
            _ => None,
        }
    }

    /// PUT/POST have bodies; GET/HEAD don't.
    #[must_use]
    pub fn has_body(self) -> bool {
        matches!(self, Method::Put | Method::Post)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Post => "POST",
        })
    }
}

/// The header names which survive reconstruction, in emission order.
pub const PRESERVED_HEADERS: [&str; 4] = [
    "Forwarded",
    "X-Forwarded-for",
    "X-aws-ec2-metadata-token",
    "X-aws-ec2-metadata-token-ttl-seconds",
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RequestError {
    #[error("invalid Request-Line")]
    BadRequestLine,

    #[error("unsupported request method")]
    UnsupportedMethod,

    #[error("invalid HTTP header line")]
    BadHeader,

    #[error("invalid percent-encoding in Request-URI")]
    BadPercentEncoding,

    #[error("unexpected end of HTTP request")]
    Truncated,

    #[error("error reading HTTP request")]
    Read,
}

/// A parsed and normalized HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    method: Method,
    path: String,
    /// Values for [`PRESERVED_HEADERS`], index-aligned.
    headers: [Option<String>; 4],
}

impl HttpRequest {
    /// Read and parse one request from `reader`.
    ///
    /// # Errors
    ///
    /// Any [`RequestError`] means the client connection must be dropped.
    pub fn read<R: BufRead>(reader: &mut R) -> Result<HttpRequest, RequestError> {
        // Parse the Request-Line into "<METHOD> <URI> HTTP/.*". We don't
        // bother checking the HTTP version or verifying that there is no
        // trailing junk.
        let line = read_line(reader)?.ok_or(RequestError::BadRequestLine)?;
        let (method, rest) = line.split_once(' ').ok_or(RequestError::BadRequestLine)?;
        let (uri, version) = rest.split_once(' ').ok_or(RequestError::BadRequestLine)?;
        if !version.starts_with("HTTP/") {
            return Err(RequestError::BadRequestLine);
        }
        let method = Method::parse(method).ok_or(RequestError::UnsupportedMethod)?;
        let path = uri_to_path(uri).map_err(|_| RequestError::BadPercentEncoding)?;

        let mut headers: [Option<String>; 4] = [None, None, None, None];
        loop {
            let line = read_line(reader)?.ok_or(RequestError::Truncated)?;
            if line.is_empty() {
                break;
            }

            // Make sure nobody is trying to smuggle an EOL character.
            if line.contains('\r') {
                return Err(RequestError::BadHeader);
            }

            let (name, value) = line.split_once(':').ok_or(RequestError::BadHeader)?;
            let name = name.trim_end_matches([' ', '\t']);
            let value = value.trim_start_matches([' ', '\t']);

            // Is this a header we care about? Later occurrences overwrite.
            for (i, preserved) in PRESERVED_HEADERS.iter().enumerate() {
                if name.eq_ignore_ascii_case(preserved) {
                    headers[i] = Some(value.to_string());
                }
            }
        }

        Ok(HttpRequest {
            method,
            path,
            headers,
        })
    }

    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    /// The normalized request path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Construct the HTTP/1.0 request to send upstream.
    #[must_use]
    pub fn to_wire(&self) -> String {
        let mut out = format!("{} {} HTTP/1.0\r\n", self.method, encode_path(&self.path));
        for (name, value) in PRESERVED_HEADERS.iter().zip(&self.headers) {
            if let Some(value) = value {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
                out.push_str("\r\n");
            }
        }
        out.push_str("Connection: Close\r\n");
        if self.method.has_body() {
            out.push_str("Content-Length:0\r\n");
        }
        out.push_str("\r\n");
        out
    }
}

/// Read one line, stripping any trailing CR/LF characters. `None` is EOF.
fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>, RequestError> {
    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(0) => return Ok(None),
        Ok(_) => {}
        Err(_) => return Err(RequestError::Read),
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

#[cfg(test)]
mod test {
    use super::{HttpRequest, Method, RequestError};
    use pretty_assertions::assert_eq;

    fn parse(text: &str) -> Result<HttpRequest, RequestError> {
        HttpRequest::read(&mut text.as_bytes())
    }

    #[test]
    fn reconstructs_a_put_request() {
        let request = parse(
            "PUT /x HTTP/1.1\r\n\
             X-aws-ec2-metadata-token: T\r\n\
             Forwarded: for=1\r\n\
             Evil: smuggle\r\n\
             \r\n",
        )
        .unwrap();
        assert_eq!(request.method(), Method::Put);
        assert_eq!(request.path(), "/x");
        assert_eq!(
            request.to_wire(),
            "PUT /x HTTP/1.0\r\n\
             Forwarded:for=1\r\n\
             X-aws-ec2-metadata-token:T\r\n\
             Connection: Close\r\n\
             Content-Length:0\r\n\
             \r\n"
        );
    }

    #[test]
    fn get_requests_have_no_body() {
        let request = parse("GET /latest/meta-data/ HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(request.path(), "/latest/meta-data");
        assert_eq!(
            request.to_wire(),
            "GET /latest/meta-data HTTP/1.0\r\nConnection: Close\r\n\r\n"
        );
    }

    #[test]
    fn normalizes_the_uri() {
        let request = parse("GET http://host/a/./b/../c//d/?q#f HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(request.path(), "/a/c/d");
    }

    #[test]
    fn rejects_unknown_methods() {
        assert_eq!(
            parse("DELETE /x HTTP/1.1\r\n\r\n"),
            Err(RequestError::UnsupportedMethod)
        );
        assert_eq!(
            parse("get /x HTTP/1.1\r\n\r\n"),
            Err(RequestError::UnsupportedMethod)
        );
    }

    #[test]
    fn rejects_malformed_request_lines() {
        assert_eq!(parse("\r\n"), Err(RequestError::BadRequestLine));
        assert_eq!(parse("GET /x\r\n"), Err(RequestError::BadRequestLine));
        assert_eq!(
            parse("GET /x SMTP/1.0\r\n\r\n"),
            Err(RequestError::BadRequestLine)
        );
        assert_eq!(parse(""), Err(RequestError::BadRequestLine));
    }

    #[test]
    fn rejects_smuggled_carriage_returns() {
        assert_eq!(
            parse("GET /x HTTP/1.1\r\nForwarded: a\rEvil: b\r\n\r\n"),
            Err(RequestError::BadHeader)
        );
    }

    #[test]
    fn rejects_headers_without_a_colon() {
        assert_eq!(
            parse("GET /x HTTP/1.1\r\nNoColonHere\r\n\r\n"),
            Err(RequestError::BadHeader)
        );
    }

    #[test]
    fn rejects_truncated_requests() {
        assert_eq!(
            parse("GET /x HTTP/1.1\r\nForwarded: a\r\n"),
            Err(RequestError::Truncated)
        );
    }

    #[test]
    fn unlisted_headers_are_dropped() {
        let request = parse(
            "GET /x HTTP/1.1\r\n\
             Host: 169.254.169.254\r\n\
             Transfer-Encoding: chunked\r\n\
             Content-Length: 999\r\n\
             \r\n",
        )
        .unwrap();
        assert_eq!(
            request.to_wire(),
            "GET /x HTTP/1.0\r\nConnection: Close\r\n\r\n"
        );
    }

    #[test]
    fn header_matching_is_case_insensitive_and_last_wins() {
        let request = parse(
            "GET /x HTTP/1.1\r\n\
             x-AWS-ec2-METADATA-token: first\r\n\
             X-aws-ec2-metadata-token:\tsecond\r\n\
             \r\n",
        )
        .unwrap();
        assert_eq!(
            request.to_wire(),
            "GET /x HTTP/1.0\r\nX-aws-ec2-metadata-token:second\r\nConnection: Close\r\n\r\n"
        );
    }

    #[test]
    fn whitespace_around_the_colon_is_stripped() {
        let request = parse("GET /x HTTP/1.1\r\nForwarded \t: \t for=1\r\n\r\n").unwrap();
        assert_eq!(
            request.to_wire(),
            "GET /x HTTP/1.0\r\nForwarded:for=1\r\nConnection: Close\r\n\r\n"
        );
    }

    #[test]
    fn reconstruction_is_a_fixpoint() {
        for text in [
            "PUT /x HTTP/1.1\r\nX-aws-ec2-metadata-token: T\r\nForwarded: for=1\r\n\r\n",
            "GET /a%20b/../c HTTP/1.1\r\n\r\n",
            "HEAD http://169.254.169.254/latest/ HTTP/1.1\r\nX-Forwarded-for: 10.0.0.1\r\n\r\n",
        ] {
            let first = parse(text).unwrap();
            let second = parse(&first.to_wire()).unwrap();
            assert_eq!(first, second);
            assert_eq!(first.to_wire(), second.to_wire());
        }
    }
}
