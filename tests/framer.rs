// tests/framer.rs

use procpool::protocol::{FrameError, JsonFramer};
use proptest::prelude::*;
use serde_json::{Value, json};

fn parse_all(framer: &mut JsonFramer, chunk: &str) -> Vec<Value> {
    framer.parse(chunk.as_bytes()).expect("chunk should frame cleanly")
}

#[test]
fn empty_chunk_yields_nothing() {
    let mut framer = JsonFramer::new();
    assert!(parse_all(&mut framer, "").is_empty());
    assert_eq!(framer.buffered_len(), 0);
}

#[test]
fn two_concatenated_objects_in_one_chunk() {
    let mut framer = JsonFramer::new();
    assert_eq!(parse_all(&mut framer, "{}{}"), vec![json!({}), json!({})]);
    assert_eq!(framer.buffered_len(), 0);
}

#[test]
fn object_split_across_chunks() {
    let mut framer = JsonFramer::new();
    assert!(parse_all(&mut framer, "{").is_empty());
    assert!(framer.is_mid_value());
    assert_eq!(parse_all(&mut framer, "}"), vec![json!({})]);
    assert!(!framer.is_mid_value());
}

#[test]
fn partial_value_stays_buffered_after_complete_one() {
    let mut framer = JsonFramer::new();
    let out = parse_all(&mut framer, r#"{"a":1}{"b":"#);
    assert_eq!(out, vec![json!({"a": 1})]);
    assert_eq!(framer.buffered_len(), r#"{"b":"#.len());

    let out = parse_all(&mut framer, "2}");
    assert_eq!(out, vec![json!({"b": 2})]);
}

#[test]
fn braces_inside_strings_do_not_count() {
    let mut framer = JsonFramer::new();
    let out = parse_all(&mut framer, r#"{"}":"{"}"#);
    assert_eq!(out, vec![json!({"}": "{"})]);
}

#[test]
fn escaped_quotes_and_backslashes_are_handled() {
    let mut framer = JsonFramer::new();
    let out = parse_all(&mut framer, r#"{"a":"say \"}\" now","b":"C:\\"}"#);
    assert_eq!(out, vec![json!({"a": "say \"}\" now", "b": "C:\\"})]);
}

#[test]
fn escape_split_across_chunks() {
    let mut framer = JsonFramer::new();
    assert!(parse_all(&mut framer, r#"{"a":"\"#).is_empty());
    assert!(parse_all(&mut framer, r#""}"#).is_empty());
    assert_eq!(parse_all(&mut framer, r#""}"#), vec![json!({"a": "\"}"})]);
}

#[test]
fn nested_objects_are_one_value() {
    let mut framer = JsonFramer::new();
    let out = parse_all(&mut framer, r#"{"a":{"b":{"c":[1,{"d":null}]}}}"#);
    assert_eq!(out, vec![json!({"a": {"b": {"c": [1, {"d": null}]}}})]);
}

#[test]
fn whitespace_between_values_is_skipped() {
    let mut framer = JsonFramer::new();
    let out = parse_all(&mut framer, "{\"a\":1}\n  {\"b\":2}\n");
    assert_eq!(out, vec![json!({"a": 1}), json!({"b": 2})]);
    assert_eq!(framer.buffered_len(), 0);
}

#[test]
fn chunk_without_boundary_grows_buffer() {
    let mut framer = JsonFramer::new();
    assert!(parse_all(&mut framer, r#"{"key": "val"#).is_empty());
    let first = framer.buffered_len();
    assert!(parse_all(&mut framer, "ue with more").is_empty());
    assert!(framer.buffered_len() > first);
}

#[test]
fn multibyte_utf8_split_mid_character() {
    let bytes = r#"{"greeting":"héllo ✓"}"#.as_bytes();
    // Split inside the three-byte check mark.
    let cut = bytes.len() - 4;
    let mut framer = JsonFramer::new();
    assert!(framer.parse(&bytes[..cut]).unwrap().is_empty());
    let out = framer.parse(&bytes[cut..]).unwrap();
    assert_eq!(out, vec![json!({"greeting": "héllo ✓"})]);
}

#[test]
fn invalid_balanced_value_is_a_decode_error() {
    let mut framer = JsonFramer::new();
    let err = framer.parse(b"{not json}").unwrap_err();
    let FrameError::Decode { raw, .. } = &err;
    assert_eq!(raw, "{not json}");
    assert!(err.to_string().starts_with("Unable to parse child response data:"));
}

#[test]
fn framing_continues_after_decode_error() {
    let mut framer = JsonFramer::new();
    assert!(framer.parse(b"{oops}").is_err());
    assert_eq!(parse_all(&mut framer, r#"{"ok":true}"#), vec![json!({"ok": true})]);
}

#[test]
fn reset_discards_partial_input() {
    let mut framer = JsonFramer::new();
    assert!(parse_all(&mut framer, r#"{"half": "#).is_empty());
    framer.reset();
    assert_eq!(framer.buffered_len(), 0);
    assert_eq!(parse_all(&mut framer, "{}"), vec![json!({})]);
}

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        // Strings heavy on the characters the scanner cares about.
        "[a-z{}\"\\\\ é]{0,12}".prop_map(Value::String),
    ]
}

fn object() -> impl Strategy<Value = Value> {
    leaf()
        .prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z}{\"]{0,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
        .prop_map(|v| match v {
            Value::Object(_) => v,
            other => json!({ "v": other }),
        })
}

proptest! {
    #[test]
    fn arbitrary_chunking_matches_whole_parse(
        values in prop::collection::vec(object(), 1..6),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
    ) {
        let stream: Vec<u8> = values
            .iter()
            .flat_map(|v| v.to_string().into_bytes())
            .collect();

        let mut offsets: Vec<usize> = cuts.iter().map(|i| i.index(stream.len() + 1)).collect();
        offsets.push(0);
        offsets.push(stream.len());
        offsets.sort_unstable();
        offsets.dedup();

        let mut framer = JsonFramer::new();
        let mut decoded = Vec::new();
        for pair in offsets.windows(2) {
            decoded.extend(framer.parse(&stream[pair[0]..pair[1]]).unwrap());
        }

        prop_assert_eq!(decoded, values);
        prop_assert_eq!(framer.buffered_len(), 0);
    }
}
