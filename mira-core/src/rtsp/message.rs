//! Control-protocol request and response types.
//!
//! A message is an ASCII header block with CR LF line endings, closed by
//! a blank line, followed by an optional body sized by `Content-Length`:
//!
//! ```text
//! SETUP rtsp://10.0.0.2/1234 RTSP/1.0\r\n
//! CSeq: 3\r\n
//! Transport: RTP/AVP/UDP;unicast;client_port=6000-6001\r\n
//! \r\n
//! ```

use std::collections::HashMap;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::MiraError;

pub const CSEQ: &str = "cseq";
pub const CONTENT_LENGTH: &str = "content-length";

// ── Method ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Options,
    Announce,
    Setup,
    Record,
    Teardown,
    GetParameter,
    SetParameter,
    Get,
    Post,
    /// Any token we do not dispatch on.
    Other(String),
}

impl Method {
    pub fn from_token(token: &str) -> Self {
        match token {
            "OPTIONS" => Method::Options,
            "ANNOUNCE" => Method::Announce,
            "SETUP" => Method::Setup,
            "RECORD" => Method::Record,
            "TEARDOWN" => Method::Teardown,
            "GET_PARAMETER" => Method::GetParameter,
            "SET_PARAMETER" => Method::SetParameter,
            "GET" => Method::Get,
            "POST" => Method::Post,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Options => "OPTIONS",
            Method::Announce => "ANNOUNCE",
            Method::Setup => "SETUP",
            Method::Record => "RECORD",
            Method::Teardown => "TEARDOWN",
            Method::GetParameter => "GET_PARAMETER",
            Method::SetParameter => "SET_PARAMETER",
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Other(token) => token,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Request ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub version: String,
    pub cseq: String,
    /// Lower-cased keys; the last duplicate wins.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl Request {
    /// Parse a header block (without the terminating blank line).
    pub fn parse(head: &str, body: Bytes) -> Result<Self, MiraError> {
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();

        let mut tokens = request_line.split_whitespace();
        let (Some(method), Some(path), Some(version)) = (tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(MiraError::Malformed("incomplete request line"));
        };

        let headers = parse_headers(lines);
        let cseq = headers
            .get(CSEQ)
            .cloned()
            .ok_or(MiraError::Malformed("missing CSeq"))?;

        Ok(Self {
            method: Method::from_token(method),
            path: path.to_string(),
            version: version.to_string(),
            cseq,
            headers,
            body,
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Path component of the target, without scheme and authority.
    ///
    /// `rtsp://10.0.0.2/info` and `/info` both yield `/info`.
    pub fn target_path(&self) -> &str {
        match self.path.split_once("://") {
            Some((_, rest)) => rest.find('/').map_or("/", |i| &rest[i..]),
            None => &self.path,
        }
    }
}

/// Header lines into a lower-cased map. Lines without a colon are
/// skipped.
pub fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> HashMap<String, String> {
    lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect()
}

// ── Status ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    NotFound,
    MethodNotValid,
    NotImplemented,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::NotFound => 404,
            Status::MethodNotValid => 455,
            Status::NotImplemented => 501,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::NotFound => "Not Found",
            Status::MethodNotValid => "Method Not Valid in This State",
            Status::NotImplemented => "Not Implemented",
        }
    }
}

// ── Response ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: String,
    pub status: Status,
    pub cseq: String,
    /// Emitted in insertion order after `CSeq`.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    /// A response to `request`, echoing its protocol version and CSeq.
    pub fn to(request: &Request, status: Status) -> Self {
        Self {
            version: request.version.clone(),
            status,
            cseq: request.cseq.clone(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn ok(request: &Request) -> Self {
        Self::to(request, Status::Ok)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.headers
            .push(("Content-Type".to_string(), content_type.to_string()));
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn write_to(&self, dst: &mut BytesMut) {
        let mut head = format!(
            "{} {} {}\r\nCSeq: {}\r\n",
            self.version,
            self.status.code(),
            self.status.reason(),
            self.cseq
        );
        for (k, v) in &self.headers {
            head.push_str(k);
            head.push_str(": ");
            head.push_str(v);
            head.push_str("\r\n");
        }
        head.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));

        dst.reserve(head.len() + self.body.len());
        dst.put_slice(head.as_bytes());
        dst.put_slice(&self.body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.write_to(&mut out);
        out.freeze()
    }
}

// ── Tests ────────────────────────────────────────────────────────
