//! Synthetic workload payloads sent from the dispatcher to workers.
//!
//! A request is `PRIME;REQ:<n>;` NUL-padded to [`REQUEST_LEN`] bytes; the
//! worker answers by appending `RES_DATA:<sum>;` where `sum` is the sum of
//! primes up to `n`. The dispatcher only generates requests and logs
//! responses; the computation itself lives in the workers.

use thiserror::Error;

/// Size of a worker request/response buffer, in bytes.
pub const REQUEST_LEN: usize = 50;

/// Worker payload parse errors.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("payload is not ASCII")]
    NonAscii,

    #[error("malformed payload {0:?}")]
    Malformed(String),
}

/// Encode a synthetic request for the value `n`.
pub fn encode_request(n: u64) -> [u8; REQUEST_LEN] {
    let content = format!("PRIME;REQ:{n};");
    debug_assert!(content.len() <= REQUEST_LEN);

    let mut buf = [0u8; REQUEST_LEN];
    buf[..content.len()].copy_from_slice(content.as_bytes());
    buf
}

/// Parse a worker response, returning `(n, sum)`.
pub fn parse_response(buf: &[u8]) -> Result<(u64, u64), RequestError> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let content = &buf[..end];
    if !content.is_ascii() {
        return Err(RequestError::NonAscii);
    }
    let content = std::str::from_utf8(content).map_err(|_| RequestError::NonAscii)?;

    let malformed = || RequestError::Malformed(content.to_string());

    let mut fields = content.split(';');
    if fields.next() != Some("PRIME") {
        return Err(malformed());
    }
    let req = fields.next().ok_or_else(malformed)?;
    let res = fields.next().ok_or_else(malformed)?;

    let n = req
        .strip_prefix("REQ:")
        .and_then(|v| v.parse().ok())
        .ok_or_else(malformed)?;
    let sum = res
        .strip_prefix("RES_DATA:")
        .and_then(|v| v.parse().ok())
        .ok_or_else(malformed)?;

    Ok((n, sum))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        let buf = encode_request(42);
        assert_eq!(&buf[..12], b"PRIME;REQ:42");
        assert_eq!(buf[13], 0);
    }

    #[test]
    fn response_parses() {
        let mut buf = [0u8; REQUEST_LEN];
        let content = b"PRIME;REQ:10;RES_DATA:17;";
        buf[..content.len()].copy_from_slice(content);

        // Primes up to 10 sum to 2 + 3 + 5 + 7.
        assert_eq!(parse_response(&buf).unwrap(), (10, 17));
    }

    #[test]
    fn response_without_result_is_malformed() {
        let mut buf = [0u8; REQUEST_LEN];
        let content = b"PRIME;REQ:10;";
        buf[..content.len()].copy_from_slice(content);
        assert!(matches!(
            parse_response(&buf),
            Err(RequestError::Malformed(_))
        ));
    }
}
