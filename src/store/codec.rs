/// Payload codec for large history columns
///
/// `input_data` and `output_data` are stored as BLOBs. Payloads above a small
/// threshold are zstd-compressed behind a magic header; anything without the
/// header is read back as plain UTF-8 so rows written uncompressed stay readable.
use serde_json::Value;

const MAGIC: [u8; 4] = *b"FLZ1";
const COMPRESSION_LEVEL: i32 = 3;
/// Below this size compression overhead outweighs the savings
const MIN_COMPRESS_LEN: usize = 256;

/// Encode text for storage
pub fn encode(text: &str) -> Vec<u8> {
    let raw = text.as_bytes();
    if raw.len() < MIN_COMPRESS_LEN {
        return raw.to_vec();
    }

    let compressed = match zstd::bulk::compress(raw, COMPRESSION_LEVEL) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(?err, "failed to compress payload; storing uncompressed");
            return raw.to_vec();
        }
    };

    if compressed.len() + MAGIC.len() >= raw.len() {
        return raw.to_vec();
    }

    let mut out = Vec::with_capacity(MAGIC.len() + compressed.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&compressed);
    out
}

/// Decode bytes produced by [`encode`] (or plain UTF-8) back to text
pub fn decode(bytes: &[u8]) -> std::io::Result<String> {
    let raw = if bytes.starts_with(&MAGIC) {
        zstd::stream::decode_all(&bytes[MAGIC.len()..])?
    } else {
        bytes.to_vec()
    };
    String::from_utf8(raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Serialize and encode a JSON payload
pub fn encode_json(value: &Value) -> Vec<u8> {
    encode(&value.to_string())
}

/// Decode a stored JSON payload
///
/// Never fails: undecodable bytes become a descriptive error object and text
/// that is not JSON is returned as a JSON string.
pub fn decode_json(bytes: &[u8]) -> Value {
    let text = match decode(bytes) {
        Ok(text) => text,
        Err(err) => {
            tracing::warn!(?err, "failed to decode stored payload");
            return serde_json::json!({ "error": "stored payload could not be decoded" });
        }
    };

    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn small_payloads_stay_plain() {
        let encoded = encode("{\"a\":1}");
        assert_eq!(encoded, b"{\"a\":1}".to_vec());
        assert_eq!(decode(&encoded).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn large_payloads_are_compressed() {
        let text = "x".repeat(10_000);
        let encoded = encode(&text);
        assert!(encoded.starts_with(&MAGIC));
        assert!(encoded.len() < text.len());
        assert_eq!(decode(&encoded).unwrap(), text);
    }

    #[test]
    fn decode_json_keeps_strings_that_look_like_json() {
        for text in ["123", "[1,2]", "{\"result\":42}", "null"] {
            let value = Value::String(text.to_string());
            assert_eq!(decode_json(&encode_json(&value)), value);
        }
        assert_eq!(decode_json(&encode_json(&json!({"result": "[1,2]"}))), json!({"result": "[1,2]"}));
    }

    #[test]
    fn decode_json_keeps_plain_text() {
        assert_eq!(decode_json(b"not json"), Value::String("not json".into()));
    }

    #[test]
    fn corrupt_compressed_payload_yields_error_object() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(b"garbage");
        assert!(decode_json(&bytes).get("error").is_some());
    }
}
