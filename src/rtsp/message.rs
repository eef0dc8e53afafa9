/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! RTSP/1.0 message codec. Plaintext until pairing completes, after which
//! every byte on the wire travels inside ChaCha20-Poly1305 frames; the
//! parser itself only ever sees the decrypted stream.

use crate::{
    crypto::{AEAD_TAG_LEN, ChannelCipher},
    error::{RtspError, RtspResult},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::trace;

pub const SERVER_NAME: &str = "AirTunes/366.0";

#[derive(Debug, Clone)]
pub struct RtspRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RtspRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cseq(&self) -> Option<&str> {
        self.header("CSeq")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }
}

#[derive(Debug, Clone)]
pub struct RtspResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RtspResponse {
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::with_status(200)
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_owned(), value.into()));
        self
    }

    pub fn plist_body(mut self, value: &super::plist::Value) -> Self {
        self.body = super::plist::serialize(value);
        self.headers.push((
            "Content-Type".to_owned(),
            "application/x-apple-binary-plist".to_owned(),
        ));
        self
    }

    pub fn data_body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.body = body;
        self.headers
            .push(("Content-Type".to_owned(), content_type.to_owned()));
        self
    }

    fn status_text(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            403 => "Unauthorized",
            451 => "Unavailable",
            470 => "Connection Authorization Required",
            501 => "Not Implemented",
            _ => "Unknown",
        }
    }

    fn serialize(&self, cseq: Option<&str>) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(
            format!("RTSP/1.0 {} {}\r\n", self.status, self.status_text()).as_bytes(),
        );
        if let Some(cseq) = cseq {
            out.extend_from_slice(format!("CSeq: {cseq}\r\n").as_bytes());
        }
        out.extend_from_slice(format!("Server: {SERVER_NAME}\r\n").as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if !self.body.is_empty() {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// Stateful reader/writer over one RTSP connection.
pub struct RtspCodec {
    cipher: Option<ChannelCipher>,
    plain: Vec<u8>,
}

impl RtspCodec {
    pub fn new() -> Self {
        Self {
            cipher: None,
            plain: Vec::new(),
        }
    }

    /// Switch the connection to encrypted framing. Takes effect for all
    /// subsequent reads and writes.
    pub fn enable_encryption(&mut self, cipher: ChannelCipher) {
        self.cipher = Some(cipher);
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub async fn read_request(&mut self, stream: &mut TcpStream) -> RtspResult<RtspRequest> {
        loop {
            if let Some(request) = self.try_parse()? {
                trace!("Received {} {}", request.method, request.uri);
                return Ok(request);
            }
            self.fill(stream).await?;
        }
    }

    pub async fn write_response(
        &mut self,
        stream: &mut TcpStream,
        response: &RtspResponse,
        cseq: Option<&str>,
    ) -> RtspResult<()> {
        let bytes = response.serialize(cseq);
        match &mut self.cipher {
            Some(cipher) => {
                // AirPlay frames cap out well below the u16 range
                for chunk in bytes.chunks(0x400) {
                    let framed = cipher.encrypt(chunk)?;
                    stream.write_all(&framed).await?;
                }
            }
            None => stream.write_all(&bytes).await?,
        }
        stream.flush().await?;
        Ok(())
    }

    async fn fill(&mut self, stream: &mut TcpStream) -> RtspResult<()> {
        match &mut self.cipher {
            Some(cipher) => {
                let mut len_bytes = [0u8; 2];
                read_exact_or_closed(stream, &mut len_bytes).await?;
                let len = u16::from_le_bytes(len_bytes);
                let mut block = vec![0u8; len as usize + AEAD_TAG_LEN];
                read_exact_or_closed(stream, &mut block).await?;
                let plain = cipher.decrypt(len, &block)?;
                self.plain.extend_from_slice(&plain);
            }
            None => {
                let mut chunk = [0u8; 4096];
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(RtspError::ConnectionClosed);
                }
                self.plain.extend_from_slice(&chunk[..n]);
            }
        }
        Ok(())
    }

    /// Parse one complete message off the front of the plaintext buffer,
    /// if present.
    fn try_parse(&mut self) -> RtspResult<Option<RtspRequest>> {
        let Some(header_end) = find_header_end(&self.plain) else {
            return Ok(None);
        };

        let header_text = std::str::from_utf8(&self.plain[..header_end])
            .map_err(|_| RtspError::Malformed("non-UTF-8 header".to_owned()))?;

        let mut lines = header_text.split("\r\n");
        let request_line = lines
            .next()
            .ok_or_else(|| RtspError::Malformed("empty request".to_owned()))?;
        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| RtspError::Malformed("missing method".to_owned()))?
            .to_owned();
        let uri = parts
            .next()
            .ok_or_else(|| RtspError::Malformed("missing URI".to_owned()))?
            .to_owned();

        let mut headers = Vec::new();
        let mut content_length = 0usize;
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| RtspError::Malformed(format!("bad header line: {line}")))?;
            let name = name.trim().to_owned();
            let value = value.trim().to_owned();
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = value
                    .parse()
                    .map_err(|_| RtspError::Malformed("bad Content-Length".to_owned()))?;
            }
            headers.push((name, value));
        }

        let body_start = header_end + 4;
        if self.plain.len() < body_start + content_length {
            return Ok(None);
        }

        let body = self.plain[body_start..body_start + content_length].to_vec();
        self.plain.drain(..body_start + content_length);

        Ok(Some(RtspRequest {
            method,
            uri,
            headers,
            body,
        }))
    }
}

impl Default for RtspCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn find_header_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn read_exact_or_closed(stream: &mut TcpStream, buf: &mut [u8]) -> RtspResult<()> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(RtspError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn codec_with(bytes: &[u8]) -> RtspCodec {
        let mut codec = RtspCodec::new();
        codec.plain.extend_from_slice(bytes);
        codec
    }

    #[test]
    fn parses_request_with_body() {
        let mut codec = codec_with(
            b"SETUP rtsp://10.0.0.2/1234 RTSP/1.0\r\nCSeq: 3\r\nContent-Length: 5\r\nContent-Type: application/x-apple-binary-plist\r\n\r\nhello",
        );
        let request = codec.try_parse().unwrap().unwrap();
        assert_eq!(request.method, "SETUP");
        assert_eq!(request.uri, "rtsp://10.0.0.2/1234");
        assert_eq!(request.cseq(), Some("3"));
        assert_eq!(request.body, b"hello");
        assert!(codec.plain.is_empty());
    }

    #[test]
    fn incomplete_message_waits_for_more() {
        let mut codec = codec_with(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\nContent-Length: 10\r\n\r\nabc");
        assert!(codec.try_parse().unwrap().is_none());
        codec.plain.extend_from_slice(b"defghij");
        assert!(codec.try_parse().unwrap().is_some());
    }

    #[test]
    fn pipelined_requests_parse_in_order() {
        let mut codec =
            codec_with(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\nGET /info RTSP/1.0\r\nCSeq: 2\r\n\r\n");
        assert_eq!(codec.try_parse().unwrap().unwrap().method, "OPTIONS");
        assert_eq!(codec.try_parse().unwrap().unwrap().method, "GET");
        assert!(codec.try_parse().unwrap().is_none());
    }

    #[test]
    fn response_carries_cseq_and_server() {
        let response = RtspResponse::ok().header("Audio-Jack-Status", "connected");
        let bytes = response.serialize(Some("7"));
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(text.contains("CSeq: 7\r\n"));
        assert!(text.contains(&format!("Server: {SERVER_NAME}\r\n")));
        assert!(text.contains("Audio-Jack-Status: connected\r\n"));
    }

    #[test]
    fn error_statuses_have_text() {
        for (code, text) in [(400, "Bad Request"), (451, "Unavailable"), (501, "Not Implemented")] {
            let response = RtspResponse::with_status(code);
            let serialized = String::from_utf8(response.serialize(None)).unwrap();
            assert!(serialized.starts_with(&format!("RTSP/1.0 {code} {text}\r\n")));
        }
    }
}
