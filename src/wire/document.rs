//! Document model and the binary document codec.
//!
//! The client treats documents as opaque values that a [`DocumentCodec`]
//! turns into bytes and back. [`BsonCodec`] is the default codec: it maps the
//! JSON data model onto the BSON element types the server understands.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::{Map, Number, Value};

use super::error::{WireError, WireResult};

/// A single document. Field order is preserved; the server reads a command's
/// name from its first field.
pub type Document = Map<String, Value>;

/// Converts documents to and from their wire representation.
pub trait DocumentCodec: Send + Sync + 'static {
    /// Encode one document.
    fn encode(&self, doc: &Document) -> WireResult<Bytes>;

    /// Decode a run of documents laid out back-to-back.
    fn decode_all(&self, bytes: &[u8]) -> WireResult<Vec<Document>>;
}

// ============================================================================
// Element Type Tags
// ============================================================================

const TYPE_DOUBLE: u8 = 0x01;
const TYPE_STRING: u8 = 0x02;
const TYPE_DOCUMENT: u8 = 0x03;
const TYPE_ARRAY: u8 = 0x04;
const TYPE_BINARY: u8 = 0x05;
const TYPE_OBJECT_ID: u8 = 0x07;
const TYPE_BOOL: u8 = 0x08;
const TYPE_DATETIME: u8 = 0x09;
const TYPE_NULL: u8 = 0x0A;
const TYPE_INT32: u8 = 0x10;
const TYPE_TIMESTAMP: u8 = 0x11;
const TYPE_INT64: u8 = 0x12;

/// Smallest valid encoded document: length prefix plus terminator.
const MIN_DOCUMENT_SIZE: usize = 5;

/// Deepest nesting of documents and arrays accepted in either direction.
pub const MAX_NESTING_DEPTH: usize = 100;

// ============================================================================
// BSON Codec
// ============================================================================

/// Default codec producing BSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct BsonCodec;

impl DocumentCodec for BsonCodec {
    fn encode(&self, doc: &Document) -> WireResult<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        write_document(&mut buf, doc.iter().map(|(k, v)| (k.as_str(), v)), 0)?;
        Ok(buf.freeze())
    }

    fn decode_all(&self, mut bytes: &[u8]) -> WireResult<Vec<Document>> {
        let mut docs = Vec::new();
        while !bytes.is_empty() {
            docs.push(read_document(&mut bytes, 0)?);
        }
        Ok(docs)
    }
}

fn write_document<'a, I>(buf: &mut BytesMut, elements: I, depth: usize) -> WireResult<()>
where
    I: IntoIterator<Item = (&'a str, &'a Value)>,
{
    check_depth(depth)?;
    let start = buf.len();

    // Placeholder for length (filled in once the elements are written)
    buf.put_i32_le(0);

    for (key, value) in elements {
        write_element(buf, key, value, depth)?;
    }
    buf.put_u8(0);

    let len = i32::try_from(buf.len() - start)
        .map_err(|_| WireError::Document("Document exceeds maximum size".to_string()))?;
    buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
    Ok(())
}

fn write_element(buf: &mut BytesMut, key: &str, value: &Value, depth: usize) -> WireResult<()> {
    if key.as_bytes().contains(&0) {
        return Err(WireError::Document(format!(
            "Field name contains NUL byte: {:?}",
            key
        )));
    }

    let tag = match value {
        Value::Null => TYPE_NULL,
        Value::Bool(_) => TYPE_BOOL,
        Value::Number(n) => number_tag(n, key)?,
        Value::String(_) => TYPE_STRING,
        Value::Array(_) => TYPE_ARRAY,
        Value::Object(_) => TYPE_DOCUMENT,
    };

    buf.put_u8(tag);
    buf.put_slice(key.as_bytes());
    buf.put_u8(0);

    match value {
        Value::Null => {}
        Value::Bool(b) => buf.put_u8(u8::from(*b)),
        Value::Number(n) => match tag {
            TYPE_INT32 => buf.put_i32_le(n.as_i64().unwrap_or_default() as i32),
            TYPE_INT64 => buf.put_i64_le(n.as_i64().unwrap_or_default()),
            _ => buf.put_f64_le(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => {
            buf.put_i32_le(s.len() as i32 + 1);
            buf.put_slice(s.as_bytes());
            buf.put_u8(0);
        }
        Value::Array(items) => {
            let keys: Vec<String> = (0..items.len()).map(|i| i.to_string()).collect();
            write_document(
                buf,
                keys.iter().map(String::as_str).zip(items.iter()),
                depth + 1,
            )?;
        }
        Value::Object(map) => {
            write_document(buf, map.iter().map(|(k, v)| (k.as_str(), v)), depth + 1)?;
        }
    }

    Ok(())
}

fn number_tag(n: &Number, key: &str) -> WireResult<u8> {
    if let Some(i) = n.as_i64() {
        if i32::try_from(i).is_ok() {
            Ok(TYPE_INT32)
        } else {
            Ok(TYPE_INT64)
        }
    } else if n.is_u64() {
        Err(WireError::Document(format!(
            "Integer field {:?} does not fit in a signed 64-bit value",
            key
        )))
    } else {
        Ok(TYPE_DOUBLE)
    }
}

fn check_depth(depth: usize) -> WireResult<()> {
    if depth > MAX_NESTING_DEPTH {
        return Err(WireError::Document(format!(
            "Nesting too deep: more than {} levels",
            MAX_NESTING_DEPTH
        )));
    }
    Ok(())
}

fn read_document(buf: &mut &[u8], depth: usize) -> WireResult<Document> {
    check_depth(depth)?;
    if buf.len() < MIN_DOCUMENT_SIZE {
        return Err(WireError::Document("Truncated document header".to_string()));
    }

    let len = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let len = usize::try_from(len)
        .ok()
        .filter(|len| (MIN_DOCUMENT_SIZE..=buf.len()).contains(len))
        .ok_or_else(|| WireError::Document(format!("Invalid document length: {}", len)))?;

    let (encoded, rest) = buf.split_at(len);
    *buf = rest;

    if encoded[len - 1] != 0 {
        return Err(WireError::Document(
            "Document is missing its terminator".to_string(),
        ));
    }

    let mut body = &encoded[4..len - 1];
    let mut doc = Document::new();

    while body.has_remaining() {
        let tag = body.get_u8();
        let key = read_cstring(&mut body)?;
        let value = read_value(tag, &mut body, depth)?;
        doc.insert(key, value);
    }

    Ok(doc)
}

fn read_value(tag: u8, body: &mut &[u8], depth: usize) -> WireResult<Value> {
    let value = match tag {
        TYPE_DOUBLE => {
            let v = f64::from_le_bytes(take_array(body)?);
            Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
        }
        TYPE_STRING => Value::String(read_string(body)?),
        TYPE_DOCUMENT => Value::Object(read_document(body, depth + 1)?),
        TYPE_ARRAY => Value::Array(
            read_document(body, depth + 1)?
                .into_iter()
                .map(|(_, v)| v)
                .collect(),
        ),
        TYPE_BINARY => {
            let len = read_length(body)?;
            let _subtype = take(body, 1)?;
            Value::String(BASE64.encode(take(body, len)?))
        }
        TYPE_OBJECT_ID => {
            let id = take(body, 12)?;
            Value::String(id.iter().map(|b| format!("{:02x}", b)).collect())
        }
        TYPE_BOOL => Value::Bool(take(body, 1)?[0] != 0),
        TYPE_DATETIME | TYPE_INT64 => Value::from(i64::from_le_bytes(take_array(body)?)),
        TYPE_NULL => Value::Null,
        TYPE_INT32 => Value::from(i32::from_le_bytes(take_array(body)?)),
        TYPE_TIMESTAMP => Value::from(u64::from_le_bytes(take_array(body)?)),
        other => {
            return Err(WireError::Document(format!(
                "Unsupported element type: 0x{:02x}",
                other
            )))
        }
    };
    Ok(value)
}

fn read_length(body: &mut &[u8]) -> WireResult<usize> {
    let len = i32::from_le_bytes(take_array(body)?);
    usize::try_from(len).map_err(|_| WireError::Document(format!("Negative length: {}", len)))
}

fn read_string(body: &mut &[u8]) -> WireResult<String> {
    let len = read_length(body)?;
    if len == 0 {
        return Err(WireError::Document("Empty string length".to_string()));
    }

    let bytes = take(body, len)?;
    if bytes[len - 1] != 0 {
        return Err(WireError::Document(
            "String is missing its terminator".to_string(),
        ));
    }

    String::from_utf8(bytes[..len - 1].to_vec())
        .map_err(|e| WireError::Document(format!("Invalid UTF-8 in string: {}", e)))
}

fn read_cstring(body: &mut &[u8]) -> WireResult<String> {
    let end = body
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| WireError::Document("Missing null terminator in field name".to_string()))?;

    let s = std::str::from_utf8(&body[..end])
        .map(|s| s.to_owned())
        .map_err(|e| WireError::Document(format!("Invalid UTF-8 in field name: {}", e)))?;

    body.advance(end + 1);
    Ok(s)
}

fn take<'a>(body: &mut &'a [u8], n: usize) -> WireResult<&'a [u8]> {
    if body.len() < n {
        return Err(WireError::Document(format!(
            "Truncated element: need {} bytes, have {}",
            n,
            body.len()
        )));
    }
    let (head, rest) = body.split_at(n);
    *body = rest;
    Ok(head)
}

fn take_array<const N: usize>(body: &mut &[u8]) -> WireResult<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(take(body, N)?);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_encode_simple_document_layout() {
        // {"a": 1} = int32 len | 0x10 "a\0" int32(1) | 0x00
        let encoded = BsonCodec.encode(&doc(json!({"a": 1}))).unwrap();

        assert_eq!(
            &encoded[..],
            &[12, 0, 0, 0, 0x10, b'a', 0, 1, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_roundtrip_nested_values() {
        let original = doc(json!({
            "name": "widget",
            "count": 3,
            "big": 5_000_000_000i64,
            "ratio": 0.25,
            "active": true,
            "missing": null,
            "tags": ["a", "b"],
            "inner": {"x": -1}
        }));

        let encoded = BsonCodec.encode(&original).unwrap();
        let decoded = BsonCodec.decode_all(&encoded).unwrap();

        assert_eq!(decoded, vec![original]);
    }

    #[test]
    fn test_decode_back_to_back_documents() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&BsonCodec.encode(&doc(json!({"i": 1}))).unwrap());
        buf.extend_from_slice(&BsonCodec.encode(&doc(json!({"i": 2}))).unwrap());

        let decoded = BsonCodec.decode_all(&buf).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].get("i"), Some(&json!(2)));
    }

    #[test]
    fn test_decode_object_id_and_binary() {
        let mut body = BytesMut::new();
        body.put_u8(TYPE_OBJECT_ID);
        body.put_slice(b"_id\0");
        body.put_slice(&[0xab; 12]);
        body.put_u8(TYPE_BINARY);
        body.put_slice(b"blob\0");
        body.put_i32_le(3);
        body.put_u8(0);
        body.put_slice(b"abc");
        body.put_u8(0);

        let mut encoded = BytesMut::new();
        encoded.put_i32_le(body.len() as i32 + 4);
        encoded.put_slice(&body);

        let decoded = BsonCodec.decode_all(&encoded).unwrap();
        assert_eq!(decoded[0].get("_id"), Some(&json!("abababababababababababab")));
        assert_eq!(decoded[0].get("blob"), Some(&json!("YWJj")));
    }

    #[test]
    fn test_reject_nul_in_field_name() {
        let result = BsonCodec.encode(&doc(json!({"bad\u{0}key": 1})));
        assert!(matches!(result, Err(WireError::Document(_))));
    }

    #[test]
    fn test_reject_unsigned_overflow() {
        let result = BsonCodec.encode(&doc(json!({"n": u64::MAX})));
        assert!(matches!(result, Err(WireError::Document(_))));
    }

    #[test]
    fn test_reject_truncated_document() {
        let encoded = BsonCodec.encode(&doc(json!({"name": "widget"}))).unwrap();
        let result = BsonCodec.decode_all(&encoded[..encoded.len() - 1]);
        assert!(matches!(result, Err(WireError::Document(_))));
    }

    #[test]
    fn test_reject_unknown_element_type() {
        let encoded: &[u8] = &[8, 0, 0, 0, 0x7f, b'x', 0, 0];
        let result = BsonCodec.decode_all(encoded);
        assert!(matches!(result, Err(WireError::Document(_))));
    }

    #[test]
    fn test_field_order_is_preserved() {
        let command = doc(json!({"create": "logs", "capped": true, "size": 4096}));
        let encoded = BsonCodec.encode(&command).unwrap();

        // First element: string tag, then the command name
        assert_eq!(encoded[4], TYPE_STRING);
        assert_eq!(&encoded[5..12], b"create\0");

        let decoded = BsonCodec.decode_all(&encoded).unwrap().remove(0);
        let keys: Vec<&str> = decoded.keys().map(String::as_str).collect();
        assert_eq!(keys, ["create", "capped", "size"]);
    }

    /// `{"a": {"a": ... {}}}` nested `depth` levels below the top document.
    fn nested_bytes(depth: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(depth * 8 + 5);
        for level in 0..depth {
            let len = MIN_DOCUMENT_SIZE + 8 * (depth - level);
            out.extend_from_slice(&(len as i32).to_le_bytes());
            out.extend_from_slice(&[TYPE_DOCUMENT, b'a', 0]);
        }
        out.extend_from_slice(&[5, 0, 0, 0, 0]);
        out.resize(out.len() + depth, 0);
        out
    }

    #[test]
    fn test_decode_accepts_nesting_up_to_limit() {
        let encoded = nested_bytes(MAX_NESTING_DEPTH);
        let decoded = BsonCodec.decode_all(&encoded).unwrap();
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn test_decode_rejects_deep_nesting() {
        let result = BsonCodec.decode_all(&nested_bytes(MAX_NESTING_DEPTH + 1));
        assert!(matches!(result, Err(WireError::Document(_))));

        // Far past the limit fails the same way instead of exhausting the stack
        let result = BsonCodec.decode_all(&nested_bytes(200_000));
        assert!(matches!(result, Err(WireError::Document(_))));
    }

    #[test]
    fn test_encode_rejects_deep_nesting() {
        // The outermost object becomes the top-level document at depth zero
        let mut value = json!(1);
        for _ in 0..MAX_NESTING_DEPTH + 2 {
            value = json!({ "a": value });
        }

        let result = BsonCodec.encode(&doc(value));
        assert!(matches!(result, Err(WireError::Document(_))));
    }
}
