//! Minimal `multipart/mixed` framing for shard-filtered file listings.
//!
//! One part per file; the part's filename carries the file path and the part
//! body carries the raw bytes. The boundary travels in both the
//! `Content-Type` and a bare `Boundary` response header so that clients can
//! split the stream without content sniffing.

use bytes::{Bytes, BytesMut};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// One file entry in a multipart stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub filename: String,
    pub data: Bytes,
}

/// Generate a boundary token unlikely to occur in file payloads.
pub fn boundary() -> String {
    let mut rng = SmallRng::from_entropy();
    let token: u128 = rng.gen();
    format!("strata-{token:032x}")
}

/// Encode parts into a complete multipart body.
pub fn encode(boundary: &str, parts: &[Part]) -> Bytes {
    let mut out = BytesMut::new();
    for part in parts {
        out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        out.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n\r\n",
                part.filename
            )
            .as_bytes(),
        );
        out.extend_from_slice(&part.data);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    out.freeze()
}

/// Decode a complete multipart body produced by [`encode`].
pub fn decode(body: &[u8], boundary: &str) -> anyhow::Result<Vec<Part>> {
    let delim = format!("--{boundary}");
    let mut parts = Vec::new();
    let mut rest = body;

    // Skip everything before the first delimiter.
    let start = find(rest, delim.as_bytes())
        .ok_or_else(|| anyhow::anyhow!("multipart body has no boundary {boundary:?}"))?;
    rest = &rest[start + delim.len()..];

    loop {
        if rest.starts_with(b"--") {
            // Closing delimiter.
            return Ok(parts);
        }
        rest = strip_crlf(rest);

        let header_end = find(rest, b"\r\n\r\n")
            .ok_or_else(|| anyhow::anyhow!("multipart part is missing its header"))?;
        let header = std::str::from_utf8(&rest[..header_end])
            .map_err(|_| anyhow::anyhow!("multipart header is not utf-8"))?;
        let filename = header
            .split("filename=\"")
            .nth(1)
            .and_then(|tail| tail.split('"').next())
            .ok_or_else(|| anyhow::anyhow!("multipart part has no filename"))?
            .to_string();
        rest = &rest[header_end + 4..];

        let body_end = find(rest, delim.as_bytes())
            .ok_or_else(|| anyhow::anyhow!("multipart part is not terminated"))?;
        // The part body ends right before "\r\n--boundary".
        let data_len = body_end.saturating_sub(2);
        parts.push(Part {
            filename,
            data: Bytes::copy_from_slice(&rest[..data_len]),
        });
        rest = &rest[body_end + delim.len()..];
    }
}

fn strip_crlf(data: &[u8]) -> &[u8] {
    data.strip_prefix(b"\r\n").unwrap_or(data)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let parts = vec![
            Part {
                filename: "foo".into(),
                data: Bytes::from("hello"),
            },
            Part {
                filename: "dir/bar".into(),
                data: Bytes::from(""),
            },
            Part {
                filename: "bin".into(),
                data: Bytes::from(vec![0u8, 13, 10, 255]),
            },
        ];
        let b = boundary();
        let encoded = encode(&b, &parts);
        let decoded = decode(&encoded, &b).unwrap();
        assert_eq!(decoded, parts);
    }

    #[test]
    fn empty_listing_decodes_to_no_parts() {
        let b = boundary();
        let encoded = encode(&b, &[]);
        assert!(decode(&encoded, &b).unwrap().is_empty());
    }

    #[test]
    fn truncated_body_is_an_error() {
        let b = boundary();
        let encoded = encode(
            &b,
            &[Part {
                filename: "foo".into(),
                data: Bytes::from("hello"),
            }],
        );
        assert!(decode(&encoded[..encoded.len() / 2], &b).is_err());
    }
}
