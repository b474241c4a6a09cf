fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use nerd_protocol::{
        CreateDatasetRequest, CreateDatasetResponse, Dataset, ErrorPayload, HeartbeatResponse,
        TokenRequest, TokenResponse, UploadStatus,
    };
    use nerd_transfer::{ChunkKey, IndexReader, Metadata, decode_metadata, encode_metadata};

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn read_fixture(name: &str) -> Vec<u8> {
        let path = fixtures_dir().join(name);
        fs::read(&path).unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        serde_json::from_slice(&read_fixture(name))
            .unwrap_or_else(|e| panic!("failed to parse fixture {name}: {e}"))
    }

    /// Normalizes JSON numbers so that `65` and `65.0` compare equal.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => serde_json::json!(f),
                None => v.clone(),
            },
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect(),
            ),
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture, re-serializes it and compares the JSON values
    /// (order-independent, number-normalized). Returns the parsed value.
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  rust:    {reserialized}"
        );
        parsed
    }

    // --- Coordinator API ---

    #[test]
    fn fixture_dataset() {
        let ds: Dataset = roundtrip_test("dataset.json");
        assert_eq!(ds.upload_status, UploadStatus::Success);
        assert_eq!(ds.tag.as_deref(), Some("training-v2"));
        assert_eq!(ds.index_object(), "proj-7f3a/ds-01HF8K2M/index");
        assert_eq!(ds.chunk_object("ab12"), "proj-7f3a/ab12");
    }

    #[test]
    fn fixture_create_dataset_request() {
        let req: CreateDatasetRequest = roundtrip_test("create_dataset_request.json");
        assert_eq!(req.tag.as_deref(), Some("training-v2"));
    }

    #[test]
    fn untagged_create_request_is_empty_object() {
        let json = serde_json::to_string(&CreateDatasetRequest { tag: None }).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn fixture_create_dataset_response() {
        let resp: CreateDatasetResponse = roundtrip_test("create_dataset_response.json");
        assert_eq!(resp.dataset.dataset_id, "ds-01HF8K2M");
        assert_eq!(resp.dataset.upload_status, UploadStatus::Created);
        assert!(resp.dataset.tag.is_none());
        assert_eq!(resp.heartbeat_interval().as_secs(), 20);
    }

    #[test]
    fn fixture_heartbeat_response() {
        let resp: HeartbeatResponse = roundtrip_test("heartbeat_response.json");
        assert!(resp.has_expired);
    }

    #[test]
    fn fixture_error_payload() {
        let payload: ErrorPayload = roundtrip_test("error_payload.json");
        assert_eq!(payload.message, "validation failed");
        assert_eq!(payload.fields.len(), 2);
        assert_eq!(payload.fields["concurrency"]["max"], 256);
        assert!(!payload.retry);
    }

    // --- Authentication API ---

    #[test]
    fn fixture_token_request() {
        let req: TokenRequest = roundtrip_test("token_request.json");
        assert_eq!(req.username, "alice@example.com");
    }

    #[test]
    fn fixture_token_response() {
        let resp: TokenResponse = roundtrip_test("token_response.json");
        assert_eq!(resp.token.split('.').count(), 3);
    }

    // --- Stored objects ---

    #[test]
    fn fixture_metadata() {
        let meta: Metadata = roundtrip_test("metadata.json");
        assert_eq!(meta.size, 12_583_936);
        assert_eq!(meta.created_at, meta.updated_at);

        let raw = read_fixture("metadata.json");
        let decoded = decode_metadata(&raw).unwrap();
        assert_eq!(decoded, meta);
        let encoded: serde_json::Value =
            serde_json::from_slice(&encode_metadata(&decoded).unwrap()).unwrap();
        assert_eq!(normalize_value(&encoded), normalize_value(&load_fixture("metadata.json")));
    }

    #[tokio::test]
    async fn fixture_index() {
        let raw = read_fixture("index");
        let mut reader = IndexReader::new(&raw[..]);
        let mut keys = Vec::new();
        while let Some(key) = reader.next_key().await.unwrap() {
            keys.push(key);
        }
        assert_eq!(
            keys,
            vec![ChunkKey::from_bytes(b"hello"), ChunkKey::from_bytes(b"")]
        );
        let rendered: String = keys.iter().map(|k| format!("{k}\n")).collect();
        assert_eq!(rendered.as_bytes(), &raw[..]);
    }
}
