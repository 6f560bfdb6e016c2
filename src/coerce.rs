//! Value coercion to the wire JSON type system
//!
//! Every strategy funnels row values through this layer so a given source
//! value always produces the same wire JSON, whether it arrived from a
//! snapshot SELECT or a wal2json change event. Scalars are coerced by
//! sql-datatype; arrays are normalized through a server-side cast and then
//! coerced elementwise.
//!
//! Timestamps outside what the downstream type system can represent are
//! replaced with the max sentinel. For `timestamp with time zone` the minimum
//! of the range is also clamped to the max sentinel; that asymmetry is
//! load-bearing wire compatibility, do not fix it.

use crate::db::{PgConnection, quote_literal};
use crate::errors::{TapError, TapResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde_json::{Map, Number, Value};
use tracing::info;

/// Replacement for timestamps the downstream cannot represent
pub const MAX_TIMESTAMP: &str = "9999-12-31T23:59:59.999+00:00";

/// Replacement for dates beyond year 9999
pub const MAX_DATE: &str = "9999-12-31T00:00:00+00:00";

/// Server-side helpers the coercer needs for arrays and hstore.
///
/// Strategies hand in a live connection; tests hand in a stub.
pub trait ServerOps {
    /// Casts a PostgreSQL array literal through the server, normalizing its
    /// textual form. Returns None for SQL NULL.
    fn cast_array_literal(&self, literal: &str, cast_datatype: &str) -> TapResult<Option<String>>;

    /// Runs `hstore_to_array()` over an hstore literal. Returns None for SQL NULL.
    fn hstore_to_array(&self, literal: &str) -> TapResult<Option<String>>;
}

impl ServerOps for PgConnection {
    fn cast_array_literal(&self, literal: &str, cast_datatype: &str) -> TapResult<Option<String>> {
        let sql = format!("SELECT $wal2tap${}$wal2tap$::{}", literal, cast_datatype);
        self.query_scalar(&sql)
    }

    fn hstore_to_array(&self, literal: &str) -> TapResult<Option<String>> {
        let sql = format!("SELECT hstore_to_array({}::hstore)", quote_literal(literal));
        self.query_scalar(&sql)
    }
}

/// Maps a source value to its canonical wire JSON form.
///
/// Total over every (value, sql_datatype) pair a conforming source produces;
/// NULL maps to NULL for every type.
pub fn coerce_value(elem: &Value, sql_datatype: &str, server: &dyn ServerOps) -> TapResult<Value> {
    if sql_datatype.contains("[]") {
        return coerce_array(elem, sql_datatype, server);
    }
    coerce_scalar(elem, sql_datatype, server)
}

fn coerce_array(elem: &Value, sql_datatype: &str, server: &dyn ServerOps) -> TapResult<Value> {
    if elem.is_null() {
        return Ok(Value::Array(vec![]));
    }
    let literal = match elem {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let cast_datatype = array_cast_datatype(sql_datatype);
    let normalized = match server.cast_array_literal(&literal, cast_datatype)? {
        Some(text) => text,
        None => return Ok(Value::Array(vec![])),
    };
    let parsed = typed_array(parse_array_literal(&normalized)?, cast_datatype);
    coerce_array_elements(&parsed, sql_datatype, server)
}

fn coerce_array_elements(
    elem: &Value,
    sql_datatype: &str,
    server: &dyn ServerOps,
) -> TapResult<Value> {
    match elem {
        Value::Array(items) => {
            let coerced = items
                .iter()
                .map(|item| coerce_array_elements(item, sql_datatype, server))
                .collect::<TapResult<Vec<_>>>()?;
            Ok(Value::Array(coerced))
        }
        scalar => coerce_scalar(scalar, sql_datatype, server),
    }
}

/// The safe text-preserving cast for an array datatype
fn array_cast_datatype(sql_datatype: &str) -> &'static str {
    match sql_datatype {
        "bit[]" => "boolean[]",
        "boolean[]" => "boolean[]",
        "character varying[]" => "character varying[]",
        "cidr[]" => "cidr[]",
        "double precision[]" => "double precision[]",
        "integer[]" => "integer[]",
        "inet[]" => "inet[]",
        "macaddr[]" => "macaddr[]",
        "real[]" => "real[]",
        "smallint[]" => "smallint[]",
        // citext, date, hstore, json, jsonb, money, numeric, text, times,
        // timestamps, uuid and custom types (enums) all survive as text
        _ => "text[]",
    }
}

/// Converts parsed array element strings into the shape psycopg-style
/// adaptation would have produced for the cast datatype.
fn typed_array(elem: Value, cast_datatype: &str) -> Value {
    match elem {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| typed_array(item, cast_datatype))
                .collect(),
        ),
        Value::String(s) => match cast_datatype {
            "boolean[]" => Value::Bool(s == "t"),
            "integer[]" | "smallint[]" => s
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or(Value::String(s)),
            "real[]" | "double precision[]" => s
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::String(s)),
            _ => Value::String(s),
        },
        other => other,
    }
}

fn coerce_scalar(elem: &Value, og_sql_datatype: &str, server: &dyn ServerOps) -> TapResult<Value> {
    let sql_datatype = og_sql_datatype.replace("[]", "");

    if elem.is_null() {
        return Ok(Value::Null);
    }

    match sql_datatype.as_str() {
        "json" | "jsonb" => match elem {
            Value::String(s) => Ok(serde_json::from_str(s)?),
            other => Ok(other.clone()),
        },
        "timestamp without time zone" => {
            Ok(Value::String(coerce_timestamp_ntz(string_elem(elem, &sql_datatype)?)))
        }
        "timestamp with time zone" => {
            Ok(Value::String(coerce_timestamp_tz(string_elem(elem, &sql_datatype)?)))
        }
        "date" => Ok(Value::String(coerce_date(string_elem(elem, &sql_datatype)?)?)),
        "time with time zone" => {
            Ok(Value::String(coerce_time_tz(string_elem(elem, &sql_datatype)?)?))
        }
        "time without time zone" => {
            Ok(Value::String(coerce_time_ntz(string_elem(elem, &sql_datatype)?)?))
        }
        "bit" => {
            // ordinary bits arrive as '1'/'0'; bit[] elements arrive as booleans
            Ok(Value::Bool(match elem {
                Value::String(s) => s == "1",
                Value::Bool(b) => *b,
                _ => false,
            }))
        }
        "boolean" => match elem {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::String(s) => match s.as_str() {
                "t" | "true" | "1" => Ok(Value::Bool(true)),
                "f" | "false" | "0" => Ok(Value::Bool(false)),
                other => Err(TapError::coercion(
                    format!("not a boolean rendering: {}", other),
                    og_sql_datatype,
                )),
            },
            _ => Err(TapError::coercion("not a boolean", og_sql_datatype)),
        },
        "hstore" => coerce_hstore(string_elem(elem, &sql_datatype)?, server),
        d if d.contains("numeric") => match elem {
            Value::Number(n) => Ok(Value::Number(n.clone())),
            Value::String(s) => s
                .parse::<Number>()
                .map(Value::Number)
                .map_err(|_| {
                    TapError::coercion(format!("not a decimal: {}", s), og_sql_datatype)
                }),
            _ => Err(TapError::coercion("not a decimal", og_sql_datatype)),
        },
        "smallint" | "integer" | "bigint" => match elem {
            Value::Number(n) => Ok(Value::Number(n.clone())),
            Value::String(s) => s.parse::<i64>().map(Value::from).map_err(|_| {
                TapError::coercion(format!("not an integer: {}", s), og_sql_datatype)
            }),
            _ => Err(TapError::coercion("not an integer", og_sql_datatype)),
        },
        "real" | "double precision" => match elem {
            Value::Number(n) => Ok(Value::Number(n.clone())),
            Value::String(s) => s
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| {
                    TapError::coercion(format!("not a float: {}", s), og_sql_datatype)
                }),
            _ => Err(TapError::coercion("not a float", og_sql_datatype)),
        },
        _ => match elem {
            // anything else is passed through in its source rendering;
            // libpq already delivers exotic types as their text cast
            Value::String(_) | Value::Number(_) | Value::Bool(_) => Ok(elem.clone()),
            _ => Err(TapError::coercion(
                format!("do not know how to marshall {:?}", elem),
                og_sql_datatype,
            )),
        },
    }
}

fn string_elem<'a>(elem: &'a Value, sql_datatype: &str) -> TapResult<&'a str> {
    elem.as_str()
        .ok_or_else(|| TapError::coercion("expected a text rendering", sql_datatype))
}

fn max_timestamp() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|d| d.and_hms_milli_opt(23, 59, 59, 999))
        .expect("static timestamp")
}

fn parse_naive_datetime(raw: &str) -> Option<NaiveDateTime> {
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// `timestamp without time zone` to ISO 8601 with a +00:00 offset.
///
/// Values with a BC era, values that do not parse, and values past the year
/// 9999 all collapse to the max sentinel.
fn coerce_timestamp_ntz(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.ends_with(" BC") {
        info!("timestamp {} out of range, replacing with {}", trimmed, MAX_TIMESTAMP);
        return MAX_TIMESTAMP.to_string();
    }
    match parse_naive_datetime(trimmed) {
        Some(dt) if dt <= max_timestamp() => {
            format!("{}+00:00", dt.format("%Y-%m-%dT%H:%M:%S%.f"))
        }
        _ => {
            info!("timestamp {} out of range, replacing with {}", trimmed, MAX_TIMESTAMP);
            MAX_TIMESTAMP.to_string()
        }
    }
}

/// `timestamp with time zone` to ISO 8601 preserving the source offset.
///
/// Clamps like the naive case, and additionally clamps year 1 (the minimum of
/// the range) to the max sentinel.
fn coerce_timestamp_tz(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.ends_with(" BC") {
        info!("timestamp {} out of range, replacing with {}", trimmed, MAX_TIMESTAMP);
        return MAX_TIMESTAMP.to_string();
    }
    let parsed = ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"]
        .iter()
        .find_map(|format| DateTime::parse_from_str(trimmed, format).ok());
    match parsed {
        Some(dt)
            if dt.naive_utc() <= max_timestamp()
                && dt.naive_local().date().year_ok() =>
        {
            format!("{}", dt.format("%Y-%m-%dT%H:%M:%S%.f%:z"))
        }
        _ => {
            info!("timestamp {} out of range, replacing with {}", trimmed, MAX_TIMESTAMP);
            MAX_TIMESTAMP.to_string()
        }
    }
}

trait YearInRange {
    fn year_ok(&self) -> bool;
}

impl YearInRange for NaiveDate {
    fn year_ok(&self) -> bool {
        use chrono::Datelike;
        // year 1 is the minimum of the with-tz range and clamps to the max
        self.year() > 1 && self.year() <= 9999
    }
}

/// `date` to `YYYY-MM-DDT00:00:00+00:00`; years past 9999 clamp.
fn coerce_date(raw: &str) -> TapResult<String> {
    let trimmed = raw.trim();
    if let Some((year, _)) = trimmed.split_once('-') {
        if year.parse::<i64>().map(|y| y > 9999).unwrap_or(false) {
            info!("date {} out of range, replacing with {}", trimmed, MAX_DATE);
            return Ok(MAX_DATE.to_string());
        }
    }
    let date = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .map_err(|e| TapError::coercion(format!("unparseable date {}: {}", trimmed, e), "date"))?;
    Ok(format!("{}T00:00:00+00:00", date.format("%Y-%m-%d")))
}

/// Splits `HH:MM:SS[.f][±HH[:MM]]` into its time and offset-seconds parts
fn split_time_offset(raw: &str) -> (String, Option<i64>) {
    let offset_start = raw
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == '+' || *c == '-')
        .map(|(i, _)| i);
    match offset_start {
        Some(i) => {
            let (time, offset) = raw.split_at(i);
            let sign: i64 = if offset.starts_with('-') { -1 } else { 1 };
            let digits: String = offset[1..].chars().filter(|c| c.is_ascii_digit()).collect();
            let (hours, minutes) = match digits.len() {
                0 => (0, 0),
                1 | 2 => (digits.parse::<i64>().unwrap_or(0), 0),
                _ => {
                    let (h, m) = digits.split_at(2);
                    (h.parse::<i64>().unwrap_or(0), m.parse::<i64>().unwrap_or(0))
                }
            };
            (time.to_string(), Some(sign * (hours * 3600 + minutes * 60)))
        }
        None => (raw.to_string(), None),
    }
}

fn replace_leading_24(raw: &str) -> String {
    if let Some(rest) = raw.strip_prefix("24") {
        format!("00{}", rest)
    } else {
        raw.to_string()
    }
}

/// `time with time zone`: convert to UTC, drop the offset, emit HH:MM:SS
fn coerce_time_tz(raw: &str) -> TapResult<String> {
    let cleaned = replace_leading_24(raw.trim());
    let (time_part, offset_secs) = split_time_offset(&cleaned);
    let time = NaiveTime::parse_from_str(&time_part, "%H:%M:%S%.f")
        .map_err(|e| TapError::coercion(format!("unparseable time {}: {}", raw, e), "time with time zone"))?;
    let offset = offset_secs.unwrap_or(0);
    if offset != 0 {
        info!("time with time zone values are converted to UTC");
    }
    let utc_secs = (time.num_seconds_from_midnight() as i64 - offset).rem_euclid(86_400);
    Ok(format!(
        "{:02}:{:02}:{:02}",
        utc_secs / 3600,
        (utc_secs % 3600) / 60,
        utc_secs % 60
    ))
}

/// `time without time zone`: emit HH:MM:SS, preserving any fraction
fn coerce_time_ntz(raw: &str) -> TapResult<String> {
    let cleaned = replace_leading_24(raw.trim());
    let time = NaiveTime::parse_from_str(&cleaned, "%H:%M:%S%.f").map_err(|e| {
        TapError::coercion(format!("unparseable time {}: {}", raw, e), "time without time zone")
    })?;
    Ok(time.format("%H:%M:%S%.f").to_string())
}

/// hstore via the server's `hstore_to_array()`: a flat key/value array folded
/// into an object
fn coerce_hstore(literal: &str, server: &dyn ServerOps) -> TapResult<Value> {
    let array = match server.hstore_to_array(literal)? {
        Some(text) => text,
        None => return Ok(Value::Null),
    };
    let items = match parse_array_literal(&array)? {
        Value::Array(items) => items,
        _ => return Err(TapError::coercion("hstore_to_array returned a non-array", "hstore")),
    };
    if items.len() % 2 != 0 {
        return Err(TapError::coercion("odd hstore_to_array element count", "hstore"));
    }
    let mut object = Map::new();
    for pair in items.chunks(2) {
        let key = pair[0]
            .as_str()
            .ok_or_else(|| TapError::coercion("non-text hstore key", "hstore"))?;
        object.insert(key.to_string(), pair[1].clone());
    }
    Ok(Value::Object(object))
}

/// Parses a PostgreSQL array literal (`{a,b,{c,d}}`) into nested JSON arrays
/// of strings and nulls.
///
/// Handles double-quoted elements with backslash escapes, bare `NULL`, and
/// nested braces. Dimension prefixes (`[1:2]={...}`) are skipped.
pub fn parse_array_literal(raw: &str) -> TapResult<Value> {
    let body = match raw.find('{') {
        Some(i) => &raw[i..],
        None => return Err(TapError::coercion(format!("not an array literal: {}", raw), "array")),
    };
    let chars: Vec<char> = body.chars().collect();
    let mut position = 0usize;
    let value = parse_array_at(&chars, &mut position)?;
    Ok(value)
}

fn parse_array_at(chars: &[char], position: &mut usize) -> TapResult<Value> {
    if chars.get(*position) != Some(&'{') {
        return Err(TapError::coercion("expected '{' in array literal", "array"));
    }
    *position += 1;
    let mut items = Vec::new();

    loop {
        match chars.get(*position) {
            None => return Err(TapError::coercion("unterminated array literal", "array")),
            Some('}') => {
                *position += 1;
                return Ok(Value::Array(items));
            }
            Some(',') => {
                *position += 1;
            }
            Some('{') => {
                items.push(parse_array_at(chars, position)?);
            }
            Some('"') => {
                *position += 1;
                let mut element = String::new();
                loop {
                    match chars.get(*position) {
                        None => {
                            return Err(TapError::coercion("unterminated quoted element", "array"));
                        }
                        Some('\\') => {
                            *position += 1;
                            if let Some(c) = chars.get(*position) {
                                element.push(*c);
                                *position += 1;
                            }
                        }
                        Some('"') => {
                            *position += 1;
                            break;
                        }
                        Some(c) => {
                            element.push(*c);
                            *position += 1;
                        }
                    }
                }
                items.push(Value::String(element));
            }
            Some(_) => {
                let mut element = String::new();
                while let Some(c) = chars.get(*position) {
                    if *c == ',' || *c == '}' {
                        break;
                    }
                    element.push(*c);
                    *position += 1;
                }
                if element.eq_ignore_ascii_case("NULL") {
                    items.push(Value::Null);
                } else {
                    items.push(Value::String(element));
                }
            }
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use serde_json::json;

    /// ServerOps stub: the "server cast" is an identity, hstore_to_array
    /// replays a canned literal.
    pub struct StubServer {
        pub hstore: Option<String>,
    }

    impl StubServer {
        pub fn new() -> Self {
            Self { hstore: None }
        }
    }

    impl ServerOps for StubServer {
        fn cast_array_literal(&self, literal: &str, _cast: &str) -> TapResult<Option<String>> {
            Ok(Some(literal.to_string()))
        }

        fn hstore_to_array(&self, _literal: &str) -> TapResult<Option<String>> {
            Ok(self.hstore.clone())
        }
    }

    fn coerce(elem: Value, sql_datatype: &str) -> Value {
        coerce_value(&elem, sql_datatype, &StubServer::new()).unwrap()
    }

    #[test]
    fn nulls_stay_null() {
        for datatype in [
            "integer",
            "json",
            "timestamp without time zone",
            "bit",
            "numeric",
            "character varying",
        ] {
            assert_eq!(coerce(Value::Null, datatype), Value::Null);
        }
    }

    #[test]
    fn timestamp_ntz_normalizes_to_utc_offset() {
        assert_eq!(
            coerce(json!("2020-09-01 10:40:59"), "timestamp without time zone"),
            json!("2020-09-01T10:40:59+00:00")
        );
    }

    #[test]
    fn timestamp_ntz_preserves_min_of_range() {
        assert_eq!(
            coerce(json!("0001-01-01 00:00:00.000123"), "timestamp without time zone"),
            json!("0001-01-01T00:00:00.000123+00:00")
        );
    }

    #[test]
    fn timestamp_ntz_clamps_past_year_9999() {
        assert_eq!(
            coerce(json!("10000-09-01 20:10:56"), "timestamp without time zone"),
            json!(MAX_TIMESTAMP)
        );
        assert_eq!(
            coerce(json!("30000-09-01 10:40:59"), "timestamp without time zone"),
            json!(MAX_TIMESTAMP)
        );
    }

    #[test]
    fn timestamp_ntz_clamps_bc_era() {
        assert_eq!(
            coerce(json!("2020-09-01 10:40:59 BC"), "timestamp without time zone"),
            json!(MAX_TIMESTAMP)
        );
    }

    #[test]
    fn timestamp_tz_preserves_offset() {
        assert_eq!(
            coerce(json!("2020-09-01 00:50:59+02"), "timestamp with time zone"),
            json!("2020-09-01T00:50:59+02:00")
        );
    }

    #[test]
    fn timestamp_tz_clamps_min_to_max() {
        // the minimum of the with-tz range maps to the MAX sentinel
        assert_eq!(
            coerce(json!("0001-01-01 00:00:00+00"), "timestamp with time zone"),
            json!(MAX_TIMESTAMP)
        );
        assert_eq!(
            coerce(json!("10000-09-01 00:50:59+02"), "timestamp with time zone"),
            json!(MAX_TIMESTAMP)
        );
        assert_eq!(
            coerce(json!("2020-09-01 00:50:59+02 BC"), "timestamp with time zone"),
            json!(MAX_TIMESTAMP)
        );
    }

    #[test]
    fn date_gains_midnight_suffix() {
        assert_eq!(coerce(json!("2020-09-01"), "date"), json!("2020-09-01T00:00:00+00:00"));
        assert_eq!(coerce(json!("10000-01-01"), "date"), json!(MAX_DATE));
    }

    #[test]
    fn time_tz_converts_to_utc_and_drops_offset() {
        assert_eq!(coerce(json!("24:00:00-0800"), "time with time zone"), json!("08:00:00"));
        assert_eq!(coerce(json!("10:30:00+02"), "time with time zone"), json!("08:30:00"));
        assert_eq!(coerce(json!("10:30:00+02:00"), "time with time zone"), json!("08:30:00"));
    }

    #[test]
    fn time_ntz_rolls_over_hour_24() {
        assert_eq!(coerce(json!("24:00:00"), "time without time zone"), json!("00:00:00"));
        assert_eq!(
            coerce(json!("10:40:59.000123"), "time without time zone"),
            json!("10:40:59.000123")
        );
    }

    #[test]
    fn bit_is_true_only_for_one_or_true() {
        assert_eq!(coerce(json!("1"), "bit"), json!(true));
        assert_eq!(coerce(json!("0"), "bit"), json!(false));
        assert_eq!(coerce(json!(true), "bit"), json!(true));
        // an integer 1 is not the character '1'
        assert_eq!(coerce(json!(1), "bit"), json!(false));
    }

    #[test]
    fn booleans_pass_through() {
        assert_eq!(coerce(json!(true), "boolean"), json!(true));
        assert_eq!(coerce(json!("t"), "boolean"), json!(true));
        assert_eq!(coerce(json!("f"), "boolean"), json!(false));
    }

    #[test]
    fn json_strings_are_parsed() {
        assert_eq!(coerce(json!("{\"k\":\"v\"}"), "json"), json!({"k": "v"}));
        assert_eq!(coerce(json!({"k": "v"}), "jsonb"), json!({"k": "v"}));
    }

    #[test]
    fn numerics_stay_exact() {
        let coerced = coerce(json!("123456789012345678.000000000000001"), "numeric");
        assert_eq!(
            serde_json::to_string(&coerced).unwrap(),
            "123456789012345678.000000000000001"
        );
    }

    #[test]
    fn integers_and_floats_from_text() {
        assert_eq!(coerce(json!("42"), "integer"), json!(42));
        assert_eq!(coerce(json!(42), "bigint"), json!(42));
        assert_eq!(coerce(json!("1.5"), "double precision"), json!(1.5));
    }

    #[test]
    fn unknown_types_pass_text_through() {
        assert_eq!(coerce(json!("POINT(1 2)"), "geometry"), json!("POINT(1 2)"));
    }

    #[test]
    fn array_of_integers() {
        assert_eq!(coerce(json!("{1,2,3}"), "integer[]"), json!([1, 2, 3]));
    }

    #[test]
    fn array_null_becomes_empty() {
        assert_eq!(coerce(Value::Null, "integer[]"), json!([]));
    }

    #[test]
    fn array_of_timestamps_applies_scalar_rule() {
        assert_eq!(
            coerce(
                json!("{\"2020-09-01 10:40:59\",NULL}"),
                "timestamp without time zone[]"
            ),
            json!(["2020-09-01T10:40:59+00:00", null])
        );
    }

    #[test]
    fn nested_arrays_keep_structure() {
        assert_eq!(
            coerce(json!("{{1,2},{3,4}}"), "integer[]"),
            json!([[1, 2], [3, 4]])
        );
    }

    #[test]
    fn hstore_parses_into_object() {
        let mut server = StubServer::new();
        server.hstore = Some("{size,small,color,NULL}".to_string());
        let coerced = coerce_value(&json!("\"size\"=>\"small\", \"color\"=>NULL"), "hstore", &server)
            .unwrap();
        assert_eq!(coerced, json!({"size": "small", "color": null}));
    }

    #[test]
    fn array_literal_parser_handles_quoting() {
        assert_eq!(
            parse_array_literal("{\"with, comma\",\"with \\\"quote\\\"\",plain,NULL}").unwrap(),
            json!(["with, comma", "with \"quote\"", "plain", null])
        );
        assert_eq!(parse_array_literal("{}").unwrap(), json!([]));
        assert_eq!(
            parse_array_literal("[1:2]={a,b}").unwrap(),
            json!(["a", "b"])
        );
        assert!(parse_array_literal("not an array").is_err());
        assert!(parse_array_literal("{unterminated").is_err());
    }
}
