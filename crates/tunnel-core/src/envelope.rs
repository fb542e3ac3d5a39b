//! Streaming envelope reader.
//!
//! An envelope is a flat JSON object whose string-valued pairs are request
//! headers and whose optional `data` pair, always last, carries the body:
//!
//! ```text
//! { "id": "1", "method": "POST", "path": "/topics/a", "type": "application/json",
//!   "data": {"records": [{"value": "S2Fma2E="}]} }
//! ```
//!
//! [`Envelope::read`] consumes the header section byte by byte and stops at the
//! `data` key. The body is exposed as a [`BodyReader`] positioned at the value,
//! which reports end-of-stream at the value's matching close and leaves the
//! rest of the outer object unread.

use std::collections::HashMap;
use std::io::{self, BufRead, Read};

use crate::errors::EnvelopeError;

/// Name of the pair that ends the header section.
pub const DATA_KEY: &str = "data";

fn peek<R: BufRead>(reader: &mut R) -> io::Result<Option<u8>> {
    Ok(reader.fill_buf()?.first().copied())
}

fn next<R: BufRead>(reader: &mut R) -> io::Result<Option<u8>> {
    let byte = peek(reader)?;
    if byte.is_some() {
        reader.consume(1);
    }
    Ok(byte)
}

fn skip_whitespace<R: BufRead>(reader: &mut R) -> io::Result<()> {
    while let Some(b) = peek(reader)? {
        if !b.is_ascii_whitespace() {
            break;
        }
        reader.consume(1);
    }
    Ok(())
}

/// Read a string whose opening delimiter has been consumed.
///
/// A backslash takes the next byte literally.
fn read_quoted<R: BufRead>(reader: &mut R, delimiter: u8) -> Result<String, EnvelopeError> {
    let mut out = Vec::new();
    loop {
        match next(reader)? {
            None => return Err(EnvelopeError::UnterminatedString),
            Some(b'\\') => match next(reader)? {
                None => return Err(EnvelopeError::UnterminatedString),
                Some(escaped) => out.push(escaped),
            },
            Some(b) if b == delimiter => break,
            Some(b) => out.push(b),
        }
    }
    Ok(String::from_utf8(out)?)
}

/// Read an unquoted literal (`true`, `69124`, ...) up to `}`, `,` or whitespace.
/// The terminator is left in the stream.
fn read_literal<R: BufRead>(reader: &mut R) -> Result<String, EnvelopeError> {
    let mut out = Vec::new();
    loop {
        match peek(reader)? {
            None => return Err(EnvelopeError::UnterminatedLiteral),
            Some(b'}' | b',') => break,
            Some(b) if b.is_ascii_whitespace() => break,
            Some(b) => {
                out.push(b);
                reader.consume(1);
            }
        }
    }
    Ok(String::from_utf8(out)?)
}

/// A parsed envelope: flat headers plus an optional lazily-read body.
#[derive(Debug)]
pub struct Envelope<R> {
    headers: HashMap<String, String>,
    body: Option<BodyReader<R>>,
}

impl<'a> Envelope<&'a [u8]> {
    /// Parse an envelope held in memory.
    pub fn from_slice(bytes: &'a [u8]) -> Result<Self, EnvelopeError> {
        Self::read(bytes)
    }
}

impl<R: BufRead> Envelope<R> {
    /// Parse the header section of one envelope.
    ///
    /// An input that is empty or whitespace-only yields an envelope with no
    /// headers and no body, as does `{}`. An object left open before its first
    /// name is rejected.
    pub fn read(mut reader: R) -> Result<Self, EnvelopeError> {
        let mut headers = HashMap::new();

        skip_whitespace(&mut reader)?;
        match next(&mut reader)? {
            None => return Ok(Self { headers, body: None }),
            Some(b'{') => {}
            Some(_) => return Err(EnvelopeError::MissingObjectStart),
        }

        loop {
            skip_whitespace(&mut reader)?;
            let name = match next(&mut reader)? {
                Some(b'}') => break,
                Some(q @ (b'"' | b'\'')) => read_quoted(&mut reader, q)?,
                None | Some(_) => return Err(EnvelopeError::MissingNameQuote),
            };

            skip_whitespace(&mut reader)?;
            if next(&mut reader)? != Some(b':') {
                return Err(EnvelopeError::MissingSeparator { name });
            }
            skip_whitespace(&mut reader)?;

            if name == DATA_KEY {
                return Ok(Self {
                    headers,
                    body: Some(BodyReader::new(reader)),
                });
            }

            let value = match peek(&mut reader)? {
                None => return Err(EnvelopeError::UnterminatedLiteral),
                Some(q @ (b'"' | b'\'')) => {
                    reader.consume(1);
                    read_quoted(&mut reader, q)?
                }
                Some(b @ (b'{' | b'[' | b'}' | b',' | b':')) => {
                    return Err(EnvelopeError::UnexpectedToken(char::from(b)));
                }
                Some(_) => read_literal(&mut reader)?,
            };
            let _ = headers.insert(name, value);

            skip_whitespace(&mut reader)?;
            match next(&mut reader)? {
                Some(b',') => {}
                None | Some(b'}') => break,
                Some(b) => return Err(EnvelopeError::UnexpectedToken(char::from(b))),
            }
        }

        Ok(Self { headers, body: None })
    }

    /// Value of a header, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// All headers, `data` excluded.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Whether the envelope carried a `data` pair.
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Mutable access to the body stream.
    pub fn body_mut(&mut self) -> Option<&mut BodyReader<R>> {
        self.body.as_mut()
    }

    /// Split into headers and body stream.
    pub fn into_parts(self) -> (HashMap<String, String>, Option<BodyReader<R>>) {
        (self.headers, self.body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Part of the value.
    Emit,
    /// Last byte of the value.
    EmitEnd,
    /// First byte past the value; left in the stream.
    End,
}

/// Boundary tracking for a single JSON value.
#[derive(Debug, Default)]
struct BodyScan {
    depth: usize,
    quote: Option<u8>,
    escaped: bool,
    done: bool,
}

impl BodyScan {
    fn step(&mut self, b: u8) -> Step {
        if let Some(q) = self.quote {
            if self.escaped {
                self.escaped = false;
            } else if b == b'\\' {
                self.escaped = true;
            } else if b == q {
                self.quote = None;
                if self.depth == 0 {
                    return Step::EmitEnd;
                }
            }
            return Step::Emit;
        }

        match b {
            b'"' | b'\'' => {
                self.quote = Some(b);
                Step::Emit
            }
            b'{' | b'[' => {
                self.depth += 1;
                Step::Emit
            }
            b'}' | b']' => {
                if self.depth == 0 {
                    return Step::End;
                }
                self.depth -= 1;
                if self.depth == 0 { Step::EmitEnd } else { Step::Emit }
            }
            b',' if self.depth == 0 => Step::End,
            _ if self.depth == 0 && b.is_ascii_whitespace() => Step::End,
            _ => Step::Emit,
        }
    }
}

/// The body of an envelope, truncated at the end of the `data` value.
///
/// Objects and arrays end at their matching close, strings at their closing
/// delimiter, bare literals at the next `}`, `,` or whitespace. Brackets and
/// braces inside quoted strings do not count toward nesting.
#[derive(Debug)]
pub struct BodyReader<R> {
    inner: R,
    scan: BodyScan,
}

impl<R: BufRead> BodyReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            scan: BodyScan::default(),
        }
    }

    /// Whether the end of the value has been reached.
    pub fn is_finished(&self) -> bool {
        self.scan.done
    }

    /// Read the remaining body into memory.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let _ = self.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Give back the underlying reader, positioned after the body.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: BufRead> Read for BodyReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.scan.done || out.is_empty() {
            return Ok(0);
        }

        let available = self.inner.fill_buf()?;
        if available.is_empty() {
            self.scan.done = true;
            return Ok(0);
        }

        let mut consumed = 0;
        for &b in available {
            if consumed == out.len() {
                break;
            }
            match self.scan.step(b) {
                Step::Emit => {
                    out[consumed] = b;
                    consumed += 1;
                }
                Step::EmitEnd => {
                    out[consumed] = b;
                    consumed += 1;
                    self.scan.done = true;
                    break;
                }
                Step::End => {
                    self.scan.done = true;
                    break;
                }
            }
        }

        self.inner.consume(consumed);
        Ok(consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_of(input: &str) -> String {
        let mut envelope = Envelope::from_slice(input.as_bytes()).unwrap();
        let body = envelope.body_mut().unwrap().read_all().unwrap();
        String::from_utf8(body).unwrap()
    }

    fn assert_headers(envelope: &Envelope<&[u8]>, expected: &[(&str, &str)]) {
        assert_eq!(envelope.headers().len(), expected.len());
        for (name, value) in expected {
            assert_eq!(envelope.header(name), Some(*value), "value of {name} differs");
        }
    }

    #[test]
    fn headers_without_data() {
        let env = Envelope::from_slice(
            br#"{"id": "123", "type" : "text/xml", "accept" : "text/plain" }"#,
        )
        .unwrap();
        assert_headers(&env, &[("id", "123"), ("type", "text/xml"), ("accept", "text/plain")]);
        assert!(!env.has_body());
    }

    #[test]
    fn apostrophe_delimiters() {
        let env = Envelope::from_slice(
            br#"{'id': "123", "type" : 'text/xml', 'accept' : 'text/plain' }"#,
        )
        .unwrap();
        assert_headers(&env, &[("id", "123"), ("type", "text/xml"), ("accept", "text/plain")]);
    }

    #[test]
    fn mixed_whitespace() {
        let env = Envelope::from_slice(
            b"{\n 'id':\"123\",\"type\" :'text/xml','accept'\n: 'text/plain'\r }",
        )
        .unwrap();
        assert_headers(&env, &[("id", "123"), ("type", "text/xml"), ("accept", "text/plain")]);
    }

    #[test]
    fn numeric_and_boolean_literals() {
        let env =
            Envelope::from_slice(br#"{'id': "123", "size" : 69124, 'ack' : true }"#).unwrap();
        assert_headers(&env, &[("id", "123"), ("size", "69124"), ("ack", "true")]);

        let env =
            Envelope::from_slice(b"{'id': \"123\", \"size\":69124, \r\n'ack' :true }").unwrap();
        assert_headers(&env, &[("id", "123"), ("size", "69124"), ("ack", "true")]);
    }

    #[test]
    fn literal_directly_before_close() {
        let env = Envelope::from_slice(br#"{"size":1}"#).unwrap();
        assert_headers(&env, &[("size", "1")]);
    }

    #[test]
    fn object_body() {
        let input = concat!(
            r#"{"id": "123", "type" : "text/xml", "#,
            r#""data": {"records": [{"value": "S2Fma2E="}]}}"#
        );
        let env = Envelope::from_slice(input.as_bytes()).unwrap();
        assert_headers(&env, &[("id", "123"), ("type", "text/xml")]);
        assert!(env.has_body());
        assert_eq!(body_of(input), r#"{"records": [{"value": "S2Fma2E="}]}"#);
    }

    #[test]
    fn object_body_with_several_records() {
        let input = concat!(
            r#"{"id": "123", "type" : "text/xml", "#,
            r#""data": {"records": [{"value": "S2Fma2E="}, "#,
            r#"{"value": "S2Fma2E="},{"value": "S2Fma2E="}]}}"#
        );
        assert_eq!(
            body_of(input),
            r#"{"records": [{"value": "S2Fma2E="}, {"value": "S2Fma2E="},{"value": "S2Fma2E="}]}"#
        );
    }

    #[test]
    fn array_body() {
        assert_eq!(
            body_of(r#"{"id": "1", "data": [{"a": [1, 2]}, [3]]}"#),
            r#"[{"a": [1, 2]}, [3]]"#
        );
    }

    #[test]
    fn braces_inside_strings_do_not_nest() {
        assert_eq!(
            body_of(r#"{"data": {"text": "}]} {", 'other': '}'}}"#),
            r#"{"text": "}]} {", 'other': '}'}"#
        );
    }

    #[test]
    fn escaped_delimiter_inside_body_string() {
        assert_eq!(body_of(r#"{"data": {"q": "a \"}\" b"}}"#), r#"{"q": "a \"}\" b"}"#);
    }

    #[test]
    fn string_and_literal_bodies() {
        assert_eq!(body_of(r#"{"data": "hello, world"}"#), r#""hello, world""#);
        assert_eq!(body_of(r#"{"data": 42}"#), "42");
        assert_eq!(body_of(r#"{"data": true }"#), "true");
    }

    #[test]
    fn body_leaves_trailing_bytes_unread() {
        let input = br#"{"id": "7", "data": {"x": 1}, "ignored": "tail"}"#;
        let env = Envelope::from_slice(input).unwrap();
        let (_, body) = env.into_parts();
        let mut body = body.unwrap();
        assert_eq!(body.read_all().unwrap(), br#"{"x": 1}"#);
        assert!(body.is_finished());
        assert_eq!(body.into_inner(), br#", "ignored": "tail"}"#);
    }

    #[test]
    fn body_read_in_small_chunks() {
        let input = br#"{"data": {"k": ["v", {"n": 1}]}}"#;
        let mut env = Envelope::from_slice(input).unwrap();
        let body = env.body_mut().unwrap();
        let mut out = Vec::new();
        let mut chunk = [0u8; 3];
        loop {
            let n = body.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, br#"{"k": ["v", {"n": 1}]}"#);
    }

    #[test]
    fn escaped_delimiter_in_header() {
        let env = Envelope::from_slice(br#"{"path": "/a\"b", 'q': 'it\'s'}"#).unwrap();
        assert_eq!(env.header("path"), Some("/a\"b"));
        assert_eq!(env.header("q"), Some("it's"));
    }

    #[test]
    fn empty_inputs_are_control_frames() {
        for input in ["{}", "  { }  ", "", "  \n"] {
            let env = Envelope::from_slice(input.as_bytes()).unwrap();
            assert!(env.headers().is_empty());
            assert!(!env.has_body());
        }
    }

    #[test]
    fn trailing_comma_is_tolerated() {
        let env = Envelope::from_slice(br#"{"id": "1", }"#).unwrap();
        assert_headers(&env, &[("id", "1")]);
    }

    #[test]
    fn missing_object_start() {
        let err = Envelope::from_slice(br#""id": "1"}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingObjectStart));
    }

    #[test]
    fn unquoted_name() {
        let err = Envelope::from_slice(br#"{id: "1"}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingNameQuote));
    }

    #[test]
    fn open_object_without_name() {
        for input in ["{", "  {  ", r#"{"id": "1","#] {
            let err = Envelope::from_slice(input.as_bytes()).unwrap_err();
            assert!(matches!(err, EnvelopeError::MissingNameQuote), "{input:?}");
        }
    }

    #[test]
    fn missing_separator() {
        let err = Envelope::from_slice(br#"{"id" "1"}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingSeparator { name } if name == "id"));
    }

    #[test]
    fn unterminated_string() {
        let err = Envelope::from_slice(br#"{"id": "1"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::UnterminatedString));

        let err = Envelope::from_slice(br#"{"id"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::UnterminatedString));
    }

    #[test]
    fn unterminated_literal() {
        let err = Envelope::from_slice(br#"{"size": 12"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::UnterminatedLiteral));
    }

    #[test]
    fn structured_header_value_is_rejected() {
        let err = Envelope::from_slice(br#"{"meta": {"a": 1}}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::UnexpectedToken('{')));
    }

    #[test]
    fn garbage_after_pair() {
        let err = Envelope::from_slice(br#"{"id": "1" "path": "/"}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::UnexpectedToken('"')));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        /// `raw` between `delimiter`s, escaping the delimiter and backslashes.
        fn quoted(raw: &str, delimiter: char) -> String {
            let mut out = String::from(delimiter);
            for c in raw.chars() {
                if c == delimiter || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push(delimiter);
            out
        }

        fn header_name() -> impl Strategy<Value = String> {
            "[a-z][a-z0-9_-]{0,8}".prop_filter("data ends the header section", |n| n != DATA_KEY)
        }

        /// A double-quoted JSON string full of characters that look structural.
        fn tricky_string() -> impl Strategy<Value = String> {
            let piece = prop_oneof![
                Just("}"),
                Just("]"),
                Just("{"),
                Just("["),
                Just("'"),
                Just(r#"\""#),
                Just(r"\\"),
                Just(","),
                Just(" "),
                Just("x"),
            ];
            proptest::collection::vec(piece, 0..8)
                .prop_map(|parts| format!("\"{}\"", parts.concat()))
        }

        fn json_value() -> impl Strategy<Value = String> {
            let leaf = prop_oneof![
                tricky_string(),
                Just("1".to_owned()),
                Just("true".to_owned()),
                Just("null".to_owned()),
            ];
            leaf.prop_recursive(4, 32, 4, |inner| {
                prop_oneof![
                    proptest::collection::vec(inner.clone(), 0..4)
                        .prop_map(|items| format!("[{}]", items.join(", "))),
                    proptest::collection::vec((tricky_string(), inner), 0..4).prop_map(|pairs| {
                        let pairs: Vec<String> =
                            pairs.iter().map(|(k, v)| format!("{k}: {v}")).collect();
                        format!("{{{}}}", pairs.join(","))
                    }),
                ]
            })
        }

        /// Bytes after the `data` value: the rest of the outer object plus junk.
        fn tail() -> impl Strategy<Value = String> {
            ("[ -~]{0,12}", any::<bool>()).prop_map(|(junk, close)| {
                if close { format!("}}{junk}") } else { format!(", {junk}") }
            })
        }

        proptest! {
            #[test]
            fn every_header_pair_is_read(
                pairs in proptest::collection::btree_map(
                    header_name(),
                    ("[ -~]{0,16}", any::<bool>()),
                    0..8,
                ),
                ws in "[ \t\r\n]{0,3}",
                with_body in any::<bool>(),
            ) {
                let mut fields: Vec<String> = pairs
                    .iter()
                    .map(|(name, (value, apostrophe))| {
                        let delimiter = if *apostrophe { '\'' } else { '"' };
                        format!("{}{ws}:{ws}{}", quoted(name, '"'), quoted(value, delimiter))
                    })
                    .collect();
                if with_body {
                    fields.push(r#""data": {"k": "v"}"#.to_owned());
                }
                let input = format!("{{{ws}{}{ws}}}", fields.join(","));

                let env = Envelope::from_slice(input.as_bytes()).unwrap();
                prop_assert_eq!(env.headers().len(), pairs.len());
                for (name, (value, _)) in &pairs {
                    prop_assert_eq!(env.header(name), Some(value.as_str()));
                }
                prop_assert_eq!(env.has_body(), with_body);
            }

            #[test]
            fn body_is_exactly_the_data_value(body in json_value(), rest in tail()) {
                let input = format!(r#"{{"id": "1", "data": {body}{rest}"#);
                let env = Envelope::from_slice(input.as_bytes()).unwrap();
                let (_, reader) = env.into_parts();
                let mut reader = reader.unwrap();

                prop_assert_eq!(reader.read_all().unwrap(), body.as_bytes());
                prop_assert!(reader.is_finished());
                prop_assert_eq!(reader.into_inner(), rest.as_bytes());
            }
        }
    }
}
