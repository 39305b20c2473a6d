//! PostgreSQL type identifiers and text-format value conversion.
//!
//! Parameters are sent and results received in text format. Result values are
//! turned into [`PgValue`]s by a [`TypeRegistry`] keyed by the type OID the
//! server reported in its RowDescription.
//! Reference: https://www.postgresql.org/docs/current/datatype.html

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use crate::error::{PgError, PgResult};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
///
/// These are the built-in type OIDs from PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Oid(pub i32);

impl Oid {
    /// Sent in Parse to let the server infer the type.
    pub const UNSPECIFIED: Oid = Oid(0);

    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID_TYPE: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const UNKNOWN: Oid = Oid(705);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const NUMERIC: Oid = Oid(1700);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::UNKNOWN
        )
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// A PostgreSQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    /// Arbitrary precision numbers are kept in their textual form.
    Numeric(String),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(uuid::Uuid),
    Json(serde_json::Value),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    /// Value of a type the registry has no decoder for.
    Raw { oid: Oid, data: Vec<u8> },
}

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Encode this value in text format; `None` is SQL NULL.
    pub fn to_text(&self) -> Option<String> {
        let text = match self {
            PgValue::Null => return None,
            PgValue::Bool(v) => if *v { "true" } else { "false" }.to_string(),
            PgValue::Int2(v) => v.to_string(),
            PgValue::Int4(v) => v.to_string(),
            PgValue::Int8(v) => v.to_string(),
            PgValue::Float4(v) => float_to_text(f64::from(*v), v),
            PgValue::Float8(v) => float_to_text(*v, v),
            PgValue::Numeric(v) | PgValue::Text(v) => v.clone(),
            PgValue::Bytea(v) => format!("\\x{}", hex::encode(v)),
            PgValue::Uuid(v) => v.hyphenated().to_string(),
            PgValue::Json(v) => v.to_string(),
            PgValue::Date(v) => v.format("%Y-%m-%d").to_string(),
            PgValue::Time(v) => v.format("%H:%M:%S%.f").to_string(),
            PgValue::Timestamp(v) => v.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            PgValue::TimestampTz(v) => v.format("%Y-%m-%d %H:%M:%S%.f%:z").to_string(),
            PgValue::Raw { data, .. } => String::from_utf8_lossy(data).into_owned(),
        };
        Some(text)
    }

    /// Borrow the textual content of text-like values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PgValue::Text(s) | PgValue::Numeric(s) => Some(s),
            _ => None,
        }
    }
}

fn float_to_text(v: f64, display: &dyn fmt::Display) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "Infinity".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        display.to_string()
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for PgValue {
                fn from(v: $ty) -> Self {
                    PgValue::$variant(v.into())
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i16 => Int2,
    i32 => Int4,
    i64 => Int8,
    f32 => Float4,
    f64 => Float8,
    String => Text,
    &str => Text,
    Vec<u8> => Bytea,
    &[u8] => Bytea,
    uuid::Uuid => Uuid,
    serde_json::Value => Json,
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => Timestamp,
    DateTime<FixedOffset> => TimestampTz,
}

impl From<DateTime<Utc>> for PgValue {
    fn from(v: DateTime<Utc>) -> Self {
        PgValue::TimestampTz(v.fixed_offset())
    }
}

impl<T: Into<PgValue>> From<Option<T>> for PgValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(PgValue::Null, Into::into)
    }
}

// ============================================================================
// Type Registry
// ============================================================================

/// Decoder for the text representation of one type.
pub type DecodeFn = Arc<dyn Fn(&[u8]) -> PgResult<PgValue> + Send + Sync>;

/// Maps result type OIDs to text-format decoders.
///
/// Types without a registered decoder come back as [`PgValue::Text`].
#[derive(Clone)]
pub struct TypeRegistry {
    decoders: HashMap<Oid, DecodeFn>,
}

impl TypeRegistry {
    /// A registry with no decoders: every value comes back as text.
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register (or replace) the decoder for `oid`.
    pub fn register<F>(&mut self, oid: Oid, decoder: F) -> &mut Self
    where
        F: Fn(&[u8]) -> PgResult<PgValue> + Send + Sync + 'static,
    {
        self.decoders.insert(oid, Arc::new(decoder));
        self
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.decoders.contains_key(&oid)
    }

    /// Decode one column value. `None` is SQL NULL.
    pub fn decode(&self, oid: Oid, data: Option<&[u8]>) -> PgResult<PgValue> {
        let Some(data) = data else {
            return Ok(PgValue::Null);
        };

        match self.decoders.get(&oid) {
            Some(decoder) => decoder(data),
            None => Ok(PgValue::Text(String::from_utf8_lossy(data).into_owned())),
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(Oid::BOOL, decode_bool)
            .register(Oid::INT2, |d| parse_num(d, "INT2").map(PgValue::Int2))
            .register(Oid::INT4, |d| parse_num(d, "INT4").map(PgValue::Int4))
            .register(Oid::INT8, |d| parse_num(d, "INT8").map(PgValue::Int8))
            .register(Oid::OID_TYPE, |d| parse_num(d, "OID").map(PgValue::Int8))
            .register(Oid::FLOAT4, |d| {
                decode_float(d, "FLOAT4").map(|v| PgValue::Float4(v as f32))
            })
            .register(Oid::FLOAT8, |d| decode_float(d, "FLOAT8").map(PgValue::Float8))
            .register(Oid::NUMERIC, |d| utf8(d, "NUMERIC").map(|s| PgValue::Numeric(s.to_string())))
            .register(Oid::BYTEA, decode_bytea)
            .register(Oid::UUID, |d| {
                let s = utf8(d, "UUID")?;
                uuid::Uuid::parse_str(s)
                    .map(PgValue::Uuid)
                    .map_err(|e| PgError::Type(format!("Invalid UUID: {}", e)))
            })
            .register(Oid::JSON, decode_json)
            .register(Oid::JSONB, decode_json)
            .register(Oid::DATE, |d| {
                NaiveDate::parse_from_str(utf8(d, "DATE")?, "%Y-%m-%d")
                    .map(PgValue::Date)
                    .map_err(|e| PgError::Type(format!("Invalid DATE: {}", e)))
            })
            .register(Oid::TIME, |d| {
                NaiveTime::parse_from_str(utf8(d, "TIME")?, "%H:%M:%S%.f")
                    .map(PgValue::Time)
                    .map_err(|e| PgError::Type(format!("Invalid TIME: {}", e)))
            })
            .register(Oid::TIMESTAMP, |d| {
                NaiveDateTime::parse_from_str(utf8(d, "TIMESTAMP")?, "%Y-%m-%d %H:%M:%S%.f")
                    .map(PgValue::Timestamp)
                    .map_err(|e| PgError::Type(format!("Invalid TIMESTAMP: {}", e)))
            })
            .register(Oid::TIMESTAMPTZ, |d| {
                DateTime::parse_from_str(utf8(d, "TIMESTAMPTZ")?, "%Y-%m-%d %H:%M:%S%.f%#z")
                    .map(PgValue::TimestampTz)
                    .map_err(|e| PgError::Type(format!("Invalid TIMESTAMPTZ: {}", e)))
            });

        for oid in [Oid::TEXT, Oid::VARCHAR, Oid::BPCHAR, Oid::CHAR, Oid::NAME, Oid::UNKNOWN] {
            registry.register(oid, |d| utf8(d, "TEXT").map(|s| PgValue::Text(s.to_string())));
        }

        registry
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut oids: Vec<_> = self.decoders.keys().map(|o| o.0).collect();
        oids.sort_unstable();
        f.debug_struct("TypeRegistry").field("oids", &oids).finish()
    }
}

fn utf8<'a>(data: &'a [u8], ty: &str) -> PgResult<&'a str> {
    std::str::from_utf8(data).map_err(|e| PgError::Type(format!("Invalid UTF-8 in {}: {}", ty, e)))
}

fn parse_num<T>(data: &[u8], ty: &str) -> PgResult<T>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    utf8(data, ty)?
        .parse::<T>()
        .map_err(|e| PgError::Type(format!("Invalid {}: {}", ty, e)))
}

fn decode_bool(data: &[u8]) -> PgResult<PgValue> {
    match data {
        b"t" | b"true" => Ok(PgValue::Bool(true)),
        b"f" | b"false" => Ok(PgValue::Bool(false)),
        other => Err(PgError::Type(format!(
            "Invalid BOOL: {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn decode_float(data: &[u8], ty: &str) -> PgResult<f64> {
    match data {
        b"NaN" => Ok(f64::NAN),
        b"Infinity" => Ok(f64::INFINITY),
        b"-Infinity" => Ok(f64::NEG_INFINITY),
        _ => parse_num(data, ty),
    }
}

fn decode_json(data: &[u8]) -> PgResult<PgValue> {
    serde_json::from_slice(data)
        .map(PgValue::Json)
        .map_err(|e| PgError::Type(format!("Invalid JSON: {}", e)))
}

/// bytea output is `\x<hex>` by default; the legacy escape format is also accepted.
fn decode_bytea(data: &[u8]) -> PgResult<PgValue> {
    if let Some(hex_digits) = data.strip_prefix(b"\\x") {
        return hex::decode(hex_digits)
            .map(PgValue::Bytea)
            .map_err(|e| PgError::Type(format!("Invalid BYTEA hex: {}", e)));
    }

    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] != b'\\' {
            out.push(data[i]);
            i += 1;
            continue;
        }
        match data.get(i + 1..i + 4) {
            _ if data.get(i + 1) == Some(&b'\\') => {
                out.push(b'\\');
                i += 2;
            }
            Some(oct) if oct.iter().all(|b| (b'0'..=b'7').contains(b)) => {
                let v = oct.iter().fold(0u16, |acc, b| acc * 8 + u16::from(b - b'0'));
                let byte = u8::try_from(v)
                    .map_err(|_| PgError::Type("Invalid BYTEA escape: out of range".to_string()))?;
                out.push(byte);
                i += 4;
            }
            _ => return Err(PgError::Type("Invalid BYTEA escape sequence".to_string())),
        }
    }
    Ok(PgValue::Bytea(out))
}
