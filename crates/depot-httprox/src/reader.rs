//! Incremental request-head parsing.
//!
//! Bytes arrive in arbitrary chunks. [`RequestReader`] watches each byte
//! through a four-byte window for the `\r\n\r\n` head terminator, and only
//! then hands the buffered head to `httparse`.

use crate::ProxyError;
use httparse::Status;
use tokio::io::{AsyncRead, AsyncReadExt};

const HEAD_TERMINATOR: [u8; 4] = *b"\r\n\r\n";
const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 4096;

/// A parsed request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: String,
    /// Absolute URI for proxied requests, `host:port` for `CONNECT`, or an
    /// origin-form path inside a MITM session.
    pub uri: String,
    pub headers: Vec<(String, String)>,
}

impl ProxyRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Accumulates a request head across reads.
#[derive(Debug)]
pub struct RequestReader {
    buffer: Vec<u8>,
    window: [u8; 4],
    head_len: Option<usize>,
}

impl Default for RequestReader {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestReader {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(1024),
            window: [0; 4],
            head_len: None,
        }
    }

    /// Append `bytes`. Returns `true` on the call that completes the head and
    /// `false` before and after it.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<bool, ProxyError> {
        if self.head_len.is_some() {
            self.buffer.extend_from_slice(bytes);
            return Ok(false);
        }
        for (i, &byte) in bytes.iter().enumerate() {
            self.window.rotate_left(1);
            self.window[3] = byte;
            if self.window == HEAD_TERMINATOR {
                self.buffer.extend_from_slice(&bytes[..=i]);
                self.head_len = Some(self.buffer.len());
                self.buffer.extend_from_slice(&bytes[i + 1..]);
                return Ok(true);
            }
        }
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::Workflow {
                status: 431,
                message: format!("request head exceeds {MAX_HEAD_BYTES} bytes"),
            });
        }
        Ok(false)
    }

    pub fn is_complete(&self) -> bool {
        self.head_len.is_some()
    }

    /// Bytes received after the head terminator.
    pub fn remainder(&self) -> &[u8] {
        match self.head_len {
            Some(len) => &self.buffer[len..],
            None => &[],
        }
    }

    pub fn parse(&self) -> Result<ProxyRequest, ProxyError> {
        let Some(len) = self.head_len else {
            return Err(ProxyError::Parse("request head is incomplete".to_owned()));
        };
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&self.buffer[..len]) {
            Ok(Status::Complete(_)) => {}
            Ok(Status::Partial) => {
                return Err(ProxyError::Parse("partial request head".to_owned()));
            }
            Err(e) => return Err(ProxyError::Parse(e.to_string())),
        }
        let method = request
            .method
            .ok_or_else(|| ProxyError::Parse("missing method".to_owned()))?
            .to_ascii_uppercase();
        let uri = request
            .path
            .ok_or_else(|| ProxyError::Parse("missing request target".to_owned()))?
            .to_owned();
        let headers = request
            .headers
            .iter()
            .map(|h| {
                String::from_utf8(h.value.to_vec())
                    .map(|value| (h.name.to_owned(), value))
                    .map_err(|_| ProxyError::Parse(format!("non-UTF-8 value in header {}", h.name)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ProxyRequest {
            method,
            uri,
            headers,
        })
    }

    /// Read from `io` until a head is complete and parse it.
    ///
    /// `Ok(None)` means the peer closed before sending a full head.
    pub async fn read_from<R>(&mut self, io: &mut R) -> Result<Option<ProxyRequest>, ProxyError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut chunk = [0u8; READ_CHUNK];
        while !self.is_complete() {
            let n = io.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.feed(&chunk[..n])?;
        }
        self.parse().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GET: &[u8] = b"GET http://repo.example.org/a/b.jar HTTP/1.1\r\n\
Host: repo.example.org\r\n\
Proxy-Authorization: Basic YWxpY2U6czNjcmV0\r\n\r\n";

    fn whole() -> ProxyRequest {
        let mut reader = RequestReader::new();
        assert!(reader.feed(GET).unwrap());
        reader.parse().unwrap()
    }

    #[test]
    fn single_read_parses_request() {
        let req = whole();
        assert_eq!(req.method, "GET");
        assert_eq!(req.uri, "http://repo.example.org/a/b.jar");
        assert_eq!(req.header("host"), Some("repo.example.org"));
        assert_eq!(req.header("PROXY-AUTHORIZATION"), Some("Basic YWxpY2U6czNjcmV0"));
    }

    #[test]
    fn split_reads_complete_exactly_once() {
        let expected = whole();
        for split in [1, 2, 3, 7, GET.len() - 3, GET.len() - 2, GET.len() - 1] {
            for step in [1, 2, 5, 64] {
                let mut reader = RequestReader::new();
                let mut completions = 0;
                let (head, tail) = GET.split_at(split);
                for chunk in head.chunks(step).chain(tail.chunks(step)) {
                    if reader.feed(chunk).unwrap() {
                        completions += 1;
                    }
                }
                assert_eq!(completions, 1, "split {split} step {step}");
                assert_eq!(reader.parse().unwrap(), expected);
            }
        }
    }

    #[test]
    fn terminator_split_across_reads() {
        let mut reader = RequestReader::new();
        assert!(!reader.feed(b"OPTIONS * HTTP/1.1\r\n\r").unwrap());
        assert!(!reader.is_complete());
        assert!(reader.feed(b"\n").unwrap());
        assert_eq!(reader.parse().unwrap().method, "OPTIONS");
    }

    #[test]
    fn bytes_after_head_are_kept() {
        let mut reader = RequestReader::new();
        assert!(reader
            .feed(b"CONNECT example.test:443 HTTP/1.1\r\n\r\n\x16\x03\x01")
            .unwrap());
        assert!(!reader.feed(b"\x02").unwrap());
        assert_eq!(reader.remainder(), b"\x16\x03\x01\x02");
        assert_eq!(reader.parse().unwrap().uri, "example.test:443");
    }

    #[test]
    fn incomplete_head_does_not_parse() {
        let mut reader = RequestReader::new();
        reader.feed(b"GET / HTTP/1.1\r\n").unwrap();
        assert!(matches!(reader.parse(), Err(ProxyError::Parse(_))));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let mut reader = RequestReader::new();
        assert!(reader.feed(b"\x01\x02 nonsense\r\n\r\n").unwrap());
        assert!(matches!(reader.parse(), Err(ProxyError::Parse(_))));
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut reader = RequestReader::new();
        let line = vec![b'a'; MAX_HEAD_BYTES + 1];
        let err = reader.feed(&line).unwrap_err();
        assert_eq!(err.status(), 431);
    }

    #[tokio::test]
    async fn read_from_reports_early_close() {
        let mut reader = RequestReader::new();
        let mut io: &[u8] = b"GET / HTTP/1.1\r\n";
        assert!(reader.read_from(&mut io).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_from_parses_stream() {
        let mut reader = RequestReader::new();
        let mut io: &[u8] = GET;
        let req = reader.read_from(&mut io).await.unwrap().unwrap();
        assert_eq!(req, whole());
    }
}
