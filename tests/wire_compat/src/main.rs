fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use sorthub_protocol::{EventName, Frame};

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn read_fixture(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        serde_json::from_str(&read_fixture(name))
            .unwrap_or_else(|e| panic!("failed to parse fixture {name}: {e}"))
    }

    /// Normalizes numbers so that `65` and `65.0` compare as equal.
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

    /// Deserializes a fixture into a Rust type, re-serializes it, and
    /// compares the JSON values.
    fn roundtrip_test<T>(name: &str)
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
            "roundtrip mismatch for {name}:\n  server: {fixture}\n  client: {reserialized}"
        );
    }

    // --- Frames ---

    #[test]
    fn fixture_frame_print_qr() {
        let frame = Frame::decode(&read_fixture("frame_print_qr.json")).unwrap();
        assert_eq!(frame.name(), EventName::PrintQr);
        assert_eq!(
            frame.correlation_key("order_number").as_deref(),
            Some("ORD-1042")
        );
        roundtrip_test::<Frame>("frame_print_qr.json");
    }

    #[test]
    fn fixture_frame_bare_has_no_data_key() {
        let frame = Frame::decode(&read_fixture("frame_bare.json")).unwrap();
        assert!(frame.data.is_none());
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded, r#"{"event":"get_system_status"}"#);
    }

    // --- Commands ---

    #[test]
    fn fixture_print_qr_request() {
        roundtrip_test::<sorthub_protocol::PrintQrRequest>("print_qr_request.json");
    }

    #[test]
    fn fixture_start_camera_request() {
        roundtrip_test::<sorthub_protocol::StartCameraRequest>("start_camera_request.json");
    }

    #[test]
    fn fixture_test_message() {
        roundtrip_test::<sorthub_protocol::TestMessage>("test_message.json");
    }

    // --- Pushed events ---

    #[test]
    fn fixture_status() {
        roundtrip_test::<sorthub_protocol::StatusMessage>("status.json");
    }

    #[test]
    fn fixture_qr_detected() {
        roundtrip_test::<sorthub_protocol::QrDetected>("qr_detected.json");
    }

    #[test]
    fn fixture_qr_history_updated() {
        roundtrip_test::<sorthub_protocol::QrHistoryUpdated>("qr_history_updated.json");
    }

    #[test]
    fn fixture_camera_status() {
        roundtrip_test::<sorthub_protocol::CameraStatus>("camera_status.json");
    }

    #[test]
    fn fixture_camera_error() {
        roundtrip_test::<sorthub_protocol::CameraError>("camera_error.json");
    }

    #[test]
    fn fixture_system_status() {
        roundtrip_test::<sorthub_protocol::SystemStatus>("system_status.json");
        let status: sorthub_protocol::SystemStatus =
            serde_json::from_value(load_fixture("system_status.json")).unwrap();
        assert_eq!(
            status.component("printer").unwrap()["name"],
            "Zebra ZD421"
        );
    }

    #[test]
    fn fixture_print_status() {
        roundtrip_test::<sorthub_protocol::PrintStatus>("print_status.json");
    }

    #[test]
    fn fixture_print_success() {
        roundtrip_test::<sorthub_protocol::PrintSuccess>("print_success.json");
    }

    #[test]
    fn fixture_print_error() {
        roundtrip_test::<sorthub_protocol::PrintError>("print_error.json");
    }

    #[test]
    fn fixture_printer_status() {
        roundtrip_test::<sorthub_protocol::PrinterStatus>("printer_status.json");
    }

    #[test]
    fn every_inbound_event_has_a_fixture() {
        let names: Vec<&str> = EventName::INBOUND.iter().map(|e| e.as_str()).collect();
        for name in names {
            assert!(
                fixtures_dir().join(format!("{name}.json")).exists(),
                "missing fixture for {name}"
            );
        }
    }
}
