use nom::{
    IResult, Parser,
    bytes::complete::{tag, take_till, take_while1},
    character::complete::{char, not_line_ending, space0, space1, u16},
    combinator::map,
    multi::many0,
    sequence::{preceded, separated_pair, terminated},
};

use crate::error::{Error, Result};

pub const BOUNDARY: &str = "------------------------76a17771c6949e06";
pub const USER_AGENT: &str = "cellspeed/0.1";
pub const UPLOAD_FILE_NAME: &str = "test5.dat";

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Whole-resource request, or an open ended range request when `range_from` is given.
pub fn get_request(path: &str, host: &str, range_from: Option<u64>) -> String {
    let mut request = format!("GET /{path} HTTP/1.1\r\nHost: {host}\r\nConnection: keep-alive\r\n");
    if let Some(from) = range_from {
        request.push_str(&format!("Range: bytes={from}-\r\n"));
    }
    request.push_str("\r\n");
    request
}

pub fn post_preamble(path: &str, host: &str, body_size: u64) -> String {
    format!(
        "POST /{path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Accept: */*\r\n\
         Content-Length: {}\r\n\
         Content-Type: multipart/form-data; boundary={BOUNDARY}\r\n\r\n",
        body_size + framing_overhead()
    )
}

pub fn midamble() -> String {
    format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"filename\"; filename=\"{UPLOAD_FILE_NAME}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n"
    )
}

pub fn postamble() -> String {
    format!("--{BOUNDARY}--\r\n")
}

/// Bytes the multipart framing adds on top of the raw upload body.
pub fn framing_overhead() -> u64 {
    (midamble().len() + postamble().len()) as u64
}

pub fn ensure_fits(framing: &str, capacity: usize) -> Result<()> {
    if framing.len() > capacity {
        return Err(Error::Protocol(format!(
            "request of {} bytes does not fit the {capacity} byte buffer",
            framing.len()
        )));
    }
    Ok(())
}

/// Offset just past the blank line ending the response header.
pub fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: Option<u64>,
    /// Complete resource size announced by `Content-Range`.
    pub total_size: Option<u64>,
}

fn status_line(input: &str) -> IResult<&str, u16> {
    map(
        (
            preceded(tag("HTTP/"), take_till(|c: char| c == ' ')),
            preceded(space1, u16),
            not_line_ending,
        ),
        |(_, status, _)| status,
    )
    .parse(input)
}

fn header_field(input: &str) -> IResult<&str, (&str, &str)> {
    preceded(
        tag("\r\n"),
        separated_pair(
            take_while1(|c: char| c != ':' && c != '\r' && c != '\n'),
            char(':'),
            preceded(space0, not_line_ending),
        ),
    )
    .parse(input)
}

fn response_head(input: &str) -> IResult<&str, (u16, Vec<(&str, &str)>)> {
    terminated((status_line, many0(header_field)), tag("\r\n\r\n")).parse(input)
}

pub fn parse_head(head: &[u8]) -> Result<ResponseHead> {
    let head = std::str::from_utf8(head)
        .map_err(|_| Error::Protocol("response header is not valid text".to_string()))?;
    let (_, (status, fields)) = response_head(head).map_err(|_| {
        let status_line = head.lines().next().unwrap_or_default();
        Error::Protocol(format!("malformed response header starting {status_line:?}"))
    })?;

    let mut content_length = None;
    let mut total_size = None;
    for (name, value) in fields {
        let value = value.trim_end();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = Some(value.parse().map_err(|_| {
                Error::Protocol(format!("malformed content length {value:?}"))
            })?);
        } else if name.eq_ignore_ascii_case("content-range") {
            total_size = value
                .rsplit_once('/')
                .and_then(|(_, total)| total.parse().ok());
        }
    }

    Ok(ResponseHead {
        status,
        content_length,
        total_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_resource_request() {
        assert_eq!(
            get_request("speedtest/random3500x3500.jpg", "speed.example.com", None),
            "GET /speedtest/random3500x3500.jpg HTTP/1.1\r\n\
             Host: speed.example.com\r\n\
             Connection: keep-alive\r\n\r\n"
        );
    }

    #[test]
    fn range_request() {
        let request = get_request("speedtest-config.php", "www.speedtest.net", Some(1024));
        assert!(request.contains("Range: bytes=1024-\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn upload_framing_is_consistent() {
        let preamble = post_preamble("speedtest/upload.php", "speed.example.com", 51200);
        let expected_length = 51200 + midamble().len() + postamble().len();

        assert!(preamble.starts_with("POST /speedtest/upload.php HTTP/1.1\r\n"));
        assert!(preamble.contains(&format!("Content-Length: {expected_length}\r\n")));
        assert!(preamble.contains(&format!("boundary={BOUNDARY}\r\n\r\n")));
        assert!(midamble().starts_with(&format!("--{BOUNDARY}\r\n")));
        assert!(midamble().contains("filename=\"test5.dat\""));
        assert_eq!(postamble(), format!("--{BOUNDARY}--\r\n"));
    }

    #[test]
    fn framing_must_fit_buffer() {
        assert!(ensure_fits("GET / HTTP/1.1\r\n\r\n", 2048).is_ok());
        assert!(matches!(
            ensure_fits("GET / HTTP/1.1\r\n\r\n", 8),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn locate_header_end() {
        assert_eq!(header_end(b"HTTP/1.1 200 OK\r\n\r\nbody"), Some(19));
        assert_eq!(header_end(b"HTTP/1.1 200 OK\r\nContent-Le"), None);
    }

    #[test]
    fn parse_whole_response() {
        let head = parse_head(b"HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\ncontent-length: 42\r\n\r\n")
            .expect("valid header");
        assert_eq!(
            head,
            ResponseHead {
                status: 200,
                content_length: Some(42),
                total_size: None
            }
        );
    }

    #[test]
    fn parse_partial_response() {
        let head = parse_head(
            b"HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 100-199/1000\r\nContent-Length: 100\r\n\r\n",
        )
        .expect("valid header");
        assert_eq!(head.status, 206);
        assert_eq!(head.total_size, Some(1000));
    }

    #[test]
    fn reject_malformed_status_line() {
        assert!(matches!(parse_head(b"garbage\r\n\r\n"), Err(Error::Protocol(_))));
        assert!(matches!(
            parse_head(b"HTTP/1.1 200 OK\r\nContent-Length: lots\r\n\r\n"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn header_values_keep_colons() {
        let head = parse_head(
            b"HTTP/1.1 200 OK\r\ndate: Mon, 19 Oct 2026 10:00:00 GMT\r\nContent-Length:7\r\n\r\n",
        )
        .expect("valid header");
        assert_eq!(head.content_length, Some(7));
    }
}
