//! Typed setting values and their text encodings.
//!
//! Values are persisted as a `(type signature, text)` pair where the text is
//! the un-annotated typed form (`'hello'`, `true`, `42`, `0x05`,
//! `['a', 'b']`). On the change bus values travel in the self-describing
//! annotated form (`uint32 5`, `int64 -3`, `byte 0x05`, `@as []`) so a
//! receiver can decode them without knowing the schema.

use std::fmt;

use crate::error::{AccountsError, Result};

// =============================================================================
// Value Types
// =============================================================================

/// The closed set of setting types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    String,
    Bool,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Byte,
    StringList,
}

impl ValueType {
    /// Type signature stored in the `Settings.type` column.
    #[must_use]
    pub const fn signature(self) -> &'static str {
        match self {
            Self::String => "s",
            Self::Bool => "b",
            Self::Int32 => "i",
            Self::UInt32 => "u",
            Self::Int64 => "x",
            Self::UInt64 => "t",
            Self::Byte => "y",
            Self::StringList => "as",
        }
    }

    /// Parse a stored type signature.
    #[must_use]
    pub fn from_signature(sig: &str) -> Option<Self> {
        match sig {
            "s" => Some(Self::String),
            "b" => Some(Self::Bool),
            "i" => Some(Self::Int32),
            "u" => Some(Self::UInt32),
            "x" => Some(Self::Int64),
            "t" => Some(Self::UInt64),
            "y" => Some(Self::Byte),
            "as" => Some(Self::StringList),
            _ => None,
        }
    }

    /// Keyword used to annotate values whose type cannot be inferred from text.
    const fn annotation(self) -> Option<&'static str> {
        match self {
            Self::UInt32 => Some("uint32"),
            Self::Int64 => Some("int64"),
            Self::UInt64 => Some("uint64"),
            Self::Byte => Some("byte"),
            _ => None,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Bool => "bool",
            Self::Int32 => "int32",
            Self::UInt32 => "uint32",
            Self::Int64 => "int64",
            Self::UInt64 => "uint64",
            Self::Byte => "byte",
            Self::StringList => "string list",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Values
// =============================================================================

/// A setting value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    Bool(bool),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Byte(u8),
    StringList(Vec<String>),
}

impl Value {
    #[must_use]
    pub const fn value_type(&self) -> ValueType {
        match self {
            Self::String(_) => ValueType::String,
            Self::Bool(_) => ValueType::Bool,
            Self::Int32(_) => ValueType::Int32,
            Self::UInt32(_) => ValueType::UInt32,
            Self::Int64(_) => ValueType::Int64,
            Self::UInt64(_) => ValueType::UInt64,
            Self::Byte(_) => ValueType::Byte,
            Self::StringList(_) => ValueType::StringList,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view of any numeric value.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        self.as_integer().and_then(|n| i64::try_from(n).ok())
    }

    #[must_use]
    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            Self::StringList(items) => Some(items),
            _ => None,
        }
    }

    // ===== Storage encoding =====

    /// Encode for the `Settings` table: `(type signature, text)`.
    #[must_use]
    pub fn to_db(&self) -> (&'static str, String) {
        (self.value_type().signature(), self.plain_text())
    }

    /// Decode a `Settings` row.
    ///
    /// String-typed rows whose text is not quoted are taken verbatim.
    ///
    /// # Errors
    /// Returns `InvalidValue` for unknown signatures or text that does not
    /// parse as the declared type.
    pub fn from_db(type_sig: &str, text: &str) -> Result<Self> {
        let value_type = ValueType::from_signature(type_sig)
            .ok_or_else(|| invalid(type_sig, text, "unknown type signature"))?;
        let trimmed = text.trim();

        if value_type == ValueType::String && !trimmed.starts_with(['\'', '"']) {
            return Ok(Self::String(text.to_string()));
        }

        let body = strip_annotation(value_type, trimmed);
        parse_typed(value_type, body).map_err(|reason| invalid(type_sig, text, &reason))
    }

    // ===== Wire encoding =====

    /// Encode in the self-describing annotated text form.
    #[must_use]
    pub fn to_wire(&self) -> String {
        match self {
            Self::StringList(items) if items.is_empty() => "@as []".to_string(),
            _ => match self.value_type().annotation() {
                Some(keyword) => format!("{keyword} {}", self.plain_text()),
                None => self.plain_text(),
            },
        }
    }

    /// Decode annotated text, inferring the type from its shape.
    ///
    /// # Errors
    /// Returns `InvalidValue` when the text is not a recognised typed form.
    pub fn from_wire(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let fail = |reason: &str| invalid("?", text, reason);

        if let Some(rest) = trimmed.strip_prefix("@as") {
            return parse_typed(ValueType::StringList, rest.trim()).map_err(|r| fail(&r));
        }

        for value_type in [
            ValueType::UInt32,
            ValueType::Int64,
            ValueType::UInt64,
            ValueType::Byte,
        ] {
            if let Some(keyword) = value_type.annotation() {
                if let Some(rest) = trimmed.strip_prefix(keyword) {
                    if rest.starts_with(char::is_whitespace) {
                        return parse_typed(value_type, rest.trim()).map_err(|r| fail(&r));
                    }
                }
            }
        }
        if let Some(rest) = trimmed.strip_prefix("int32 ") {
            return parse_typed(ValueType::Int32, rest.trim()).map_err(|r| fail(&r));
        }

        let inferred = match trimmed.chars().next() {
            Some('\'' | '"') => ValueType::String,
            Some('[') => ValueType::StringList,
            Some('t' | 'f') => ValueType::Bool,
            Some(_) => ValueType::Int32,
            None => return Err(fail("empty value")),
        };
        parse_typed(inferred, trimmed).map_err(|r| fail(&r))
    }

    // ===== Coercion =====

    /// Convert to another value type.
    ///
    /// Numbers and booleans convert among each other when the value fits the
    /// target range; any scalar renders to a string; strings parse into
    /// scalars. String lists only convert to themselves.
    ///
    /// # Errors
    /// Returns `ValueConversion` when the conversion is not possible.
    pub fn coerce(&self, target: ValueType) -> Result<Self> {
        let source = self.value_type();
        if source == target {
            return Ok(self.clone());
        }
        let fail = || AccountsError::ValueConversion {
            from: source.to_string(),
            to: target.to_string(),
        };

        match (self, target) {
            (Self::StringList(_), _) | (_, ValueType::StringList) => Err(fail()),
            (Self::String(s), _) => parse_scalar(target, s.trim()).ok_or_else(fail),
            (_, ValueType::String) => Ok(Self::String(self.display_text())),
            _ => self
                .as_integer()
                .and_then(|n| from_integer(target, n))
                .ok_or_else(fail),
        }
    }

    fn as_integer(&self) -> Option<i128> {
        match self {
            Self::Bool(b) => Some(i128::from(*b)),
            Self::Int32(n) => Some(i128::from(*n)),
            Self::UInt32(n) => Some(i128::from(*n)),
            Self::Int64(n) => Some(i128::from(*n)),
            Self::UInt64(n) => Some(i128::from(*n)),
            Self::Byte(n) => Some(i128::from(*n)),
            Self::String(_) | Self::StringList(_) => None,
        }
    }

    /// Un-annotated typed text.
    fn plain_text(&self) -> String {
        match self {
            Self::String(s) => quote(s),
            Self::Bool(b) => b.to_string(),
            Self::Int32(n) => n.to_string(),
            Self::UInt32(n) => n.to_string(),
            Self::Int64(n) => n.to_string(),
            Self::UInt64(n) => n.to_string(),
            Self::Byte(n) => format!("0x{n:02x}"),
            Self::StringList(items) => {
                let quoted: Vec<String> = items.iter().map(|s| quote(s)).collect();
                format!("[{}]", quoted.join(", "))
            }
        }
    }

    /// Human text used when a scalar is coerced to a string.
    fn display_text(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Byte(n) => n.to_string(),
            _ => self.plain_text(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Int32(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::UInt32(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int64(n)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::UInt64(n)
    }
}

impl From<u8> for Value {
    fn from(n: u8) -> Self {
        Self::Byte(n)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Self::StringList(items)
    }
}

// =============================================================================
// Text helpers
// =============================================================================

fn invalid(type_sig: &str, text: &str, reason: &str) -> AccountsError {
    AccountsError::InvalidValue {
        type_sig: type_sig.to_string(),
        text: text.to_string(),
        reason: reason.to_string(),
    }
}

/// Drop a redundant type keyword (`uint32 5` stored where `5` is expected).
fn strip_annotation(value_type: ValueType, text: &str) -> &str {
    if value_type == ValueType::StringList {
        return text.strip_prefix("@as").map_or(text, str::trim);
    }
    value_type
        .annotation()
        .and_then(|keyword| text.strip_prefix(keyword))
        .filter(|rest| rest.starts_with(char::is_whitespace))
        .map_or(text, str::trim)
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", u32::from(c))),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn parse_typed(value_type: ValueType, text: &str) -> std::result::Result<Value, String> {
    match value_type {
        ValueType::String => {
            let (s, rest) = parse_quoted(text)?;
            if rest.trim().is_empty() {
                Ok(Value::String(s))
            } else {
                Err("trailing characters after string".to_string())
            }
        }
        ValueType::StringList => parse_list(text).map(Value::StringList),
        ValueType::Bool => match text {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err("expected true or false".to_string()),
        },
        _ => {
            let n = parse_integer(text).ok_or_else(|| "expected an integer".to_string())?;
            from_integer(value_type, n).ok_or_else(|| format!("{n} out of range for {value_type}"))
        }
    }
}

fn parse_scalar(target: ValueType, text: &str) -> Option<Value> {
    match target {
        ValueType::Bool => match text.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(Value::Bool(true)),
            "false" | "0" | "no" => Some(Value::Bool(false)),
            _ => None,
        },
        ValueType::String | ValueType::StringList => None,
        _ => parse_integer(text).and_then(|n| from_integer(target, n)),
    }
}

fn parse_integer(text: &str) -> Option<i128> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (radix, body) = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => (16, hex),
        None => (10, digits),
    };
    // `from_str_radix` accepts a sign of its own.
    if body.starts_with(['+', '-']) {
        return None;
    }
    let magnitude = i128::from_str_radix(body, radix).ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

fn from_integer(target: ValueType, n: i128) -> Option<Value> {
    match target {
        ValueType::Bool => Some(Value::Bool(n != 0)),
        ValueType::Int32 => i32::try_from(n).ok().map(Value::Int32),
        ValueType::UInt32 => u32::try_from(n).ok().map(Value::UInt32),
        ValueType::Int64 => i64::try_from(n).ok().map(Value::Int64),
        ValueType::UInt64 => u64::try_from(n).ok().map(Value::UInt64),
        ValueType::Byte => u8::try_from(n).ok().map(Value::Byte),
        ValueType::String | ValueType::StringList => None,
    }
}

/// Parse a single- or double-quoted string, returning the remainder.
fn parse_quoted(text: &str) -> std::result::Result<(String, &str), String> {
    let mut chars = text.char_indices();
    let delimiter = match chars.next() {
        Some((_, c @ ('\'' | '"'))) => c,
        _ => return Err("expected a quoted string".to_string()),
    };

    let mut out = String::new();
    while let Some((idx, c)) = chars.next() {
        match c {
            c if c == delimiter => return Ok((out, &text[idx + c.len_utf8()..])),
            '\\' => {
                let (_, escaped) = chars
                    .next()
                    .ok_or_else(|| "unterminated escape".to_string())?;
                match escaped {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    'u' => {
                        let hex: String = chars.by_ref().take(4).map(|(_, h)| h).collect();
                        let code = u32::from_str_radix(&hex, 16)
                            .map_err(|_| format!("bad unicode escape '{hex}'"))?;
                        out.push(
                            char::from_u32(code)
                                .ok_or_else(|| format!("invalid code point {code:#x}"))?,
                        );
                    }
                    other => out.push(other),
                }
            }
            c => out.push(c),
        }
    }
    Err("unterminated string".to_string())
}

fn parse_list(text: &str) -> std::result::Result<Vec<String>, String> {
    let inner = text
        .strip_prefix('[')
        .ok_or_else(|| "expected '['".to_string())?;
    let mut rest = inner.trim_start();
    let mut items = Vec::new();

    if let Some(after) = rest.strip_prefix(']') {
        return if after.trim().is_empty() {
            Ok(items)
        } else {
            Err("trailing characters after list".to_string())
        };
    }

    loop {
        let (item, after) = parse_quoted(rest)?;
        items.push(item);
        let after = after.trim_start();
        if let Some(next) = after.strip_prefix(',') {
            rest = next.trim_start();
        } else if let Some(end) = after.strip_prefix(']') {
            return if end.trim().is_empty() {
                Ok(items)
            } else {
                Err("trailing characters after list".to_string())
            };
        } else {
            return Err("expected ',' or ']'".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_text_is_unannotated() {
        assert_eq!(Value::from(5u32).to_db(), ("u", "5".to_string()));
        assert_eq!(Value::from(5u8).to_db(), ("y", "0x05".to_string()));
        assert_eq!(Value::from("it's").to_db(), ("s", r"'it\'s'".to_string()));
        assert_eq!(
            Value::from(vec!["a".to_string(), "b".to_string()]).to_db(),
            ("as", "['a', 'b']".to_string())
        );
        assert_eq!(
            Value::StringList(vec![]).to_db(),
            ("as", "[]".to_string())
        );
    }

    #[test]
    fn unquoted_string_rows_are_taken_verbatim() {
        let value = Value::from_db("s", "plain text, no quotes").unwrap();
        assert_eq!(value, Value::from("plain text, no quotes"));

        let quoted = Value::from_db("s", "'quoted'").unwrap();
        assert_eq!(quoted, Value::from("quoted"));
    }

    #[test]
    fn from_db_rejects_unknown_signature_and_bad_text() {
        assert!(matches!(
            Value::from_db("q", "1"),
            Err(AccountsError::InvalidValue { .. })
        ));
        assert!(Value::from_db("i", "nope").is_err());
        assert!(Value::from_db("y", "300").is_err());
        assert!(Value::from_db("b", "maybe").is_err());
    }

    #[test]
    fn from_db_tolerates_redundant_annotation() {
        assert_eq!(Value::from_db("t", "uint64 9").unwrap(), Value::UInt64(9));
        assert_eq!(Value::from_db("as", "@as []").unwrap(), Value::StringList(vec![]));
    }

    #[test]
    fn wire_form_is_self_describing() {
        assert_eq!(Value::from(5u32).to_wire(), "uint32 5");
        assert_eq!(Value::from(-3i64).to_wire(), "int64 -3");
        assert_eq!(Value::from(7i32).to_wire(), "7");
        assert_eq!(Value::StringList(vec![]).to_wire(), "@as []");

        assert_eq!(Value::from_wire("uint32 5").unwrap(), Value::UInt32(5));
        assert_eq!(Value::from_wire("int64 -3").unwrap(), Value::Int64(-3));
        assert_eq!(Value::from_wire("byte 0x05").unwrap(), Value::Byte(5));
        assert_eq!(Value::from_wire("7").unwrap(), Value::Int32(7));
        assert_eq!(Value::from_wire("true").unwrap(), Value::Bool(true));
        assert_eq!(
            Value::from_wire("['x', \"y\"]").unwrap(),
            Value::StringList(vec!["x".into(), "y".into()])
        );
    }

    #[test]
    fn escapes_survive_the_wire() {
        let original = Value::from("line\nbreak \\ 'quote'\u{1}");
        let decoded = Value::from_wire(&original.to_wire()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn from_wire_rejects_garbage() {
        assert!(Value::from_wire("").is_err());
        assert!(Value::from_wire("'unterminated").is_err());
        assert!(Value::from_wire("['a' 'b']").is_err());
        assert!(Value::from_wire("99999999999").is_err());
    }

    #[test]
    fn numeric_coercion_is_range_checked() {
        assert_eq!(
            Value::Int32(42).coerce(ValueType::Int64).unwrap(),
            Value::Int64(42)
        );
        assert_eq!(Value::Int32(1).coerce(ValueType::Bool).unwrap(), Value::Bool(true));
        assert_eq!(Value::Bool(true).coerce(ValueType::Byte).unwrap(), Value::Byte(1));
        assert!(matches!(
            Value::Int32(-1).coerce(ValueType::UInt32),
            Err(AccountsError::ValueConversion { .. })
        ));
    }

    #[test]
    fn string_coercion_both_ways() {
        assert_eq!(
            Value::UInt32(8080).coerce(ValueType::String).unwrap(),
            Value::from("8080")
        );
        assert_eq!(
            Value::from(" 99 ").coerce(ValueType::Int32).unwrap(),
            Value::Int32(99)
        );
        assert_eq!(Value::from("yes").coerce(ValueType::Bool).unwrap(), Value::Bool(true));
        assert!(Value::from("ninety").coerce(ValueType::Int32).is_err());
    }

    #[test]
    fn integers_take_at_most_one_sign() {
        assert_eq!(
            Value::from("-0x1f").coerce(ValueType::Int32).unwrap(),
            Value::Int32(-31)
        );
        assert_eq!(Value::from("+7").coerce(ValueType::Int64).unwrap(), Value::Int64(7));
        for text in ["--5", "+-5", "-+5", "0x-5", "-0x+5"] {
            assert!(
                Value::from(text).coerce(ValueType::Int32).is_err(),
                "{text} should not parse"
            );
        }
        assert!(Value::from_wire("--5").is_err());
    }

    #[test]
    fn string_lists_do_not_coerce() {
        let list = Value::StringList(vec!["a".into()]);
        assert!(list.coerce(ValueType::String).is_err());
        assert!(Value::from("a").coerce(ValueType::StringList).is_err());
        assert_eq!(list.coerce(ValueType::StringList).unwrap(), list);
    }
}
