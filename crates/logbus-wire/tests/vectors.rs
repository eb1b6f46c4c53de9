use bytes::BytesMut;
use logbus_wire::LoggingMessageCodex;
use std::fs;

#[test]
fn vectors_match_message_encoding() {
    let codex = LoggingMessageCodex::new().expect("codex");
    let dir = "tests/vectors";
    for entry in fs::read_dir(dir).expect("read vectors dir") {
        let entry = entry.expect("entry");
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let contents = fs::read_to_string(&path).expect("read vector");
        let value: serde_json::Value = serde_json::from_str(&contents).expect("json");
        let kind = value["kind"].as_str().expect("kind");
        let message_hex = value["message_hex"].as_str().expect("message_hex");
        let expected = hex_to_bytes(message_hex);

        let mut buf = BytesMut::from(&expected[..]);
        let message = codex
            .decode(&mut buf)
            .expect("decode")
            .expect("registered message");
        assert!(buf.is_empty(), "trailing bytes for {:?}", path);
        assert_eq!(message.kind(), kind, "kind mismatch for {:?}", path);

        let encoded = codex.encode_to_bytes(&message).expect("encode");
        assert_eq!(
            encoded.as_ref(),
            expected.as_slice(),
            "round trip mismatch for {:?}",
            path
        );
    }
}

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    assert!(hex.len().is_multiple_of(2), "hex length must be even");
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = from_hex_char(pair[0]) << 4;
            let lo = from_hex_char(pair[1]);
            hi | lo
        })
        .collect()
}

fn from_hex_char(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => panic!("invalid hex char"),
    }
}
