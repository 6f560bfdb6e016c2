//! Property-based tests using proptest.
//!
//! Tests the key invariants of the engine's pure functions:
//! - LSN text/integer conversion round-trips and preserves order
//! - Replication slot names are lowercase, bounded and well-formed
//! - The wal2json add-tables encoding round-trips through its escaping

use proptest::prelude::*;
use serde_json::json;
use wal2tap::catalog::Stream;
use wal2tap::sync::logical::{
    generate_slot_name, int_to_lsn, lsn_to_int, streams_to_wal2json_tables,
};

/// Strategy: a valid LSN string `"HI/LO"` in canonical form (uppercase hex,
/// no leading zeros)
fn arb_lsn() -> impl Strategy<Value = String> {
    (0u32..=0x7FFF_FFFF, 0u32..=0xFFFF_FFFF).prop_map(|(hi, lo)| format!("{:X}/{:X}", hi, lo))
}

/// Strategy: identifiers over the characters wal2json escaping cares about.
/// Dots and backslashes are excluded; neither is escaped by the format, so
/// identifiers containing them are not representable.
fn arb_ident() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-zA-Z0-9_ ,']{1,20}")
        .expect("valid regex")
        .prop_filter("identifier must not be blank", |s| !s.trim().is_empty())
}

fn stream_for(schema: &str, table: &str) -> Stream {
    serde_json::from_value(json!({
        "tap_stream_id": format!("{}-{}", schema, table),
        "table_name": table,
        "stream": table,
        "schema": {"type": "object", "properties": {}},
        "metadata": [
            {"breadcrumb": [], "metadata": {"schema-name": schema}}
        ]
    }))
    .expect("valid stream")
}

/// Inverse of the add-tables encoding: split on unescaped separators, then
/// drop the escapes.
fn decode_wal2json_tables(encoded: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut chars = encoded.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ',' => {
                entries.push(std::mem::take(&mut current));
            }
            other => current.push(other),
        }
    }
    if !current.is_empty() {
        entries.push(current);
    }

    entries
        .into_iter()
        .map(|entry| {
            let (schema, table) = entry.split_once('.').expect("entry has a separator");
            (schema.to_string(), table.to_string())
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn prop_lsn_round_trip(lsn in arb_lsn()) {
        let as_int = lsn_to_int(&lsn).unwrap();
        prop_assert_eq!(int_to_lsn(as_int), lsn);
    }

    #[test]
    fn prop_lsn_order_matches_text_order(a in arb_lsn(), b in arb_lsn()) {
        // integer comparison must agree with (file, index) comparison
        let parse = |lsn: &str| {
            let (hi, lo) = lsn.split_once('/').unwrap();
            (u64::from_str_radix(hi, 16).unwrap(), u64::from_str_radix(lo, 16).unwrap())
        };
        let ints = (lsn_to_int(&a).unwrap(), lsn_to_int(&b).unwrap());
        let pairs = (parse(&a), parse(&b));
        prop_assert_eq!(ints.0.cmp(&ints.1), pairs.0.cmp(&pairs.1));
    }

    #[test]
    fn prop_slot_names_are_well_formed(
        db in "[a-zA-Z0-9_ .-]{1,80}",
        tap_id in proptest::option::of("[a-zA-Z0-9_-]{1,40}"),
    ) {
        let name = generate_slot_name(&db, tap_id.as_deref(), "pipelinewise");
        prop_assert!(name.len() <= 64);
        prop_assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
        prop_assert!(name.starts_with("pipelinewise_"));
        // deterministic
        prop_assert_eq!(name.clone(), generate_slot_name(&db, tap_id.as_deref(), "pipelinewise"));
    }

    #[test]
    fn prop_slot_naming_is_idempotent(db in "[a-z0-9_]{1,40}") {
        // a name built from already-valid parts survives unchanged
        let name = generate_slot_name(&db, None, "pipelinewise");
        prop_assert_eq!(&name, &format!("pipelinewise_{}", db));
        let again = generate_slot_name(&name, None, "");
        prop_assert_eq!(again, format!("_{}", name));
    }

    #[test]
    fn prop_wal2json_encoding_round_trips(
        tables in proptest::collection::vec((arb_ident(), arb_ident()), 1..6),
    ) {
        let streams: Vec<Stream> = tables
            .iter()
            .map(|(schema, table)| stream_for(schema, table))
            .collect();
        let encoded = streams_to_wal2json_tables(&streams).unwrap();
        let decoded = decode_wal2json_tables(&encoded);
        prop_assert_eq!(decoded, tables);
    }
}
