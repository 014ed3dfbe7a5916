//! Sequencing adapter around the HPACK codec.
//!
//! The compression dictionary is connection-global and order-sensitive, so
//! header blocks must be encoded in the order they hit the wire and decoded
//! in the order they arrive. That invariant is enforced structurally rather
//! than by locking discipline at call sites: the [`Encoder`] is owned by
//! the connection's single write path and the [`Decoder`] by its single
//! read loop, and neither is reachable from anywhere else.
//!
//! The compression itself is delegated to `loona_hpack`.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};

use crate::frame::Reason;

/// A decoded header block: pseudo fields plus regular fields.
#[derive(Debug, Default, PartialEq)]
pub struct FieldList {
    pub pseudo: Pseudo,
    pub fields: HeaderMap,
}

#[derive(Debug, Default, PartialEq)]
pub struct Pseudo {
    pub method: Option<Method>,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: Option<String>,
    pub status: Option<StatusCode>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The compression context is broken; this is connection-fatal.
    #[error("header block could not be decompressed")]
    Compression(Reason),

    /// The block decompressed but violates HTTP semantics; the stream is
    /// malformed, the connection survives.
    #[error("malformed header block: {0}")]
    Malformed(&'static str),
}

pub struct Encoder {
    inner: loona_hpack::Encoder<'static>,
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder {
            inner: loona_hpack::Encoder::new(),
        }
    }

    /// Resize the dynamic table, on receipt of the peer's
    /// SETTINGS_HEADER_TABLE_SIZE.
    pub fn set_max_table_size(&mut self, size: usize) {
        self.inner.set_max_table_size(size);
    }

    /// Encode a field list into one opaque header block. Pseudo fields
    /// come first, in the canonical order.
    pub fn encode(&mut self, list: &FieldList) -> Bytes {
        let mut owned: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();

        if let Some(method) = &list.pseudo.method {
            owned.push((b":method".to_vec(), method.as_str().as_bytes().to_vec()));
        }
        if let Some(scheme) = &list.pseudo.scheme {
            owned.push((b":scheme".to_vec(), scheme.as_bytes().to_vec()));
        }
        if let Some(authority) = &list.pseudo.authority {
            owned.push((b":authority".to_vec(), authority.as_bytes().to_vec()));
        }
        if let Some(path) = &list.pseudo.path {
            owned.push((b":path".to_vec(), path.as_bytes().to_vec()));
        }
        if let Some(status) = &list.pseudo.status {
            owned.push((b":status".to_vec(), status.as_str().as_bytes().to_vec()));
        }

        for (name, value) in list.fields.iter() {
            owned.push((name.as_str().as_bytes().to_vec(), value.as_bytes().to_vec()));
        }

        let mut block = Vec::new();
        let headers = owned.iter().map(|(n, v)| (n.as_slice(), v.as_slice()));
        if let Err(err) = self.inner.encode_into(headers, &mut block) {
            // Writing into a Vec cannot fail; keep the write path alive.
            tracing::error!("hpack encode failed: {}", err);
        }

        Bytes::from(block)
    }
}

pub struct Decoder {
    inner: loona_hpack::Decoder<'static>,
}

impl Decoder {
    pub fn new(max_table_size: usize) -> Decoder {
        let mut inner = loona_hpack::Decoder::new();
        inner.set_max_allowed_table_size(max_table_size);
        Decoder { inner }
    }

    pub fn set_max_table_size(&mut self, size: usize) {
        self.inner.set_max_table_size(size);
    }

    /// Decode one complete header block into a field list, validating the
    /// pseudo-field rules: pseudo fields precede regular fields, no
    /// duplicates, no uppercase names.
    pub fn decode(&mut self, block: &[u8]) -> Result<FieldList, DecodeError> {
        let raw = self
            .inner
            .decode(block)
            .map_err(|err| {
                tracing::debug!("hpack decode failed: {:?}", err);
                DecodeError::Compression(Reason::COMPRESSION_ERROR)
            })?;

        let mut list = FieldList::default();
        let mut saw_regular = false;

        for (name, value) in &raw {
            if name.first() == Some(&b':') {
                if saw_regular {
                    return Err(DecodeError::Malformed("pseudo field after regular field"));
                }
                let value = std::str::from_utf8(value)
                    .map_err(|_| DecodeError::Malformed("pseudo field value is not UTF-8"))?;

                match name.as_slice() {
                    b":status" => {
                        if list.pseudo.status.is_some() {
                            return Err(DecodeError::Malformed("duplicate :status"));
                        }
                        let status = value
                            .parse::<u16>()
                            .ok()
                            .and_then(|code| StatusCode::from_u16(code).ok())
                            .ok_or(DecodeError::Malformed("invalid :status"))?;
                        list.pseudo.status = Some(status);
                    }
                    b":method" => list.pseudo.method = Some(
                        value
                            .parse()
                            .map_err(|_| DecodeError::Malformed("invalid :method"))?,
                    ),
                    b":scheme" => list.pseudo.scheme = Some(value.into()),
                    b":authority" => list.pseudo.authority = Some(value.into()),
                    b":path" => list.pseudo.path = Some(value.into()),
                    _ => return Err(DecodeError::Malformed("unknown pseudo field")),
                }
            } else {
                saw_regular = true;

                if name.iter().any(u8::is_ascii_uppercase) {
                    return Err(DecodeError::Malformed("uppercase field name"));
                }

                let name = HeaderName::from_bytes(name)
                    .map_err(|_| DecodeError::Malformed("invalid field name"))?;
                let value = HeaderValue::from_bytes(value)
                    .map_err(|_| DecodeError::Malformed("invalid field value"))?;
                list.fields.append(name, value);
            }
        }

        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_list() -> FieldList {
        let mut fields = HeaderMap::new();
        fields.insert("accept", HeaderValue::from_static("*/*"));
        fields.insert("user-agent", HeaderValue::from_static("plait/0.1"));

        FieldList {
            pseudo: Pseudo {
                method: Some(Method::GET),
                scheme: Some("https".into()),
                authority: Some("example.com".into()),
                path: Some("/".into()),
                status: None,
            },
            fields,
        }
    }

    #[test]
    fn round_trip_preserves_fields() {
        let mut enc = Encoder::new();
        let mut dec = Decoder::new(4096);

        let list = request_list();
        let block = enc.encode(&list);
        let got = dec.decode(&block).unwrap();

        assert_eq!(got, list);
    }

    #[test]
    fn round_trip_reuses_table_state_across_blocks() {
        let mut enc = Encoder::new();
        let mut dec = Decoder::new(4096);

        // Encode the same list twice; the second block leans on the dynamic
        // table and must still decode to the same fields.
        let list = request_list();
        let first = enc.encode(&list);
        let second = enc.encode(&list);

        assert_eq!(dec.decode(&first).unwrap(), list);
        assert_eq!(dec.decode(&second).unwrap(), list);
        assert!(second.len() <= first.len());
    }

    #[test]
    fn pseudo_after_regular_is_malformed() {
        let mut enc = loona_hpack::Encoder::new();
        let mut block = Vec::new();
        let raw: Vec<(&[u8], &[u8])> =
            vec![(b"accept", b"*/*"), (b":status", b"200")];
        enc.encode_into(raw, &mut block).unwrap();

        let mut dec = Decoder::new(4096);
        assert!(matches!(
            dec.decode(&block),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn status_parses() {
        let mut enc = loona_hpack::Encoder::new();
        let mut block = Vec::new();
        let raw: Vec<(&[u8], &[u8])> = vec![(b":status", b"204")];
        enc.encode_into(raw, &mut block).unwrap();

        let mut dec = Decoder::new(4096);
        let list = dec.decode(&block).unwrap();
        assert_eq!(list.pseudo.status, Some(StatusCode::NO_CONTENT));
    }
}
