//! # Column types
//!
//! Strongly typed values stored in the ledger tables, each with its own diesel
//! `ToSql`/`FromSql` mapping for the SQLite backend:
//!
//! - Text enums: [`InvokeFrom`], [`MessageStatus`], [`ThoughtEvent`].
//! - Fixed-point money: [`UnitPrice`] (scale 7), [`PriceUnit`] (scale 4) and
//!   [`Price`] (scale 11), all stored as scaled `BIGINT`s.
//! - JSON documents stored as `TEXT`: [`Payload`] and [`ImageUrls`].
//!
//! ## Money
//!
//! A cost contribution is `unit_price × price_unit`. Both factors are exact
//! integers at their own scale, so their product is an exact integer at scale
//! `7 + 4 = 11`, which is exactly [`Price::SCALE`]. Nothing on the money path
//! is ever converted to a float.
//!
//! ```rust
//! use convo_ledger::types::{Price, PriceUnit, UnitPrice};
//!
//! let unit: UnitPrice = "0.0000020".parse().unwrap();
//! let per: PriceUnit = "0.0010".parse().unwrap();
//! let cost = unit.checked_cost(per).unwrap();
//! assert_eq!(cost, "0.000000002".parse::<Price>().unwrap());
//! assert_eq!(cost.to_string(), "0.00000000200");
//! ```

use std::fmt;
use std::str::FromStr;

use diesel::backend::Backend;
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::{BigInt, Text};
use diesel::sqlite::Sqlite;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Failure to turn text into one of the typed column values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown {kind} `{value}`")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("`{0}` is not a non-negative decimal number")]
    InvalidDecimal(String),

    #[error("`{value}` has more than {scale} decimal places")]
    TooPrecise { value: String, scale: u32 },

    #[error("`{0}` is out of the fixed-point range")]
    Overflow(String),
}

// ---------------------------------------------------------------------------
// Text enums
// ---------------------------------------------------------------------------

macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident as $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsExpression, FromSqlRow, Serialize, Deserialize)]
        #[diesel(sql_type = Text)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// The text stored in the database and used on the wire.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    other => Err(ParseError::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl ToSql<Text, Sqlite> for $name {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
                out.set_value(self.as_str());
                Ok(IsNull::No)
            }
        }

        impl FromSql<Text, Sqlite> for $name {
            fn from_sql(bytes: <Sqlite as Backend>::RawValue<'_>) -> deserialize::Result<Self> {
                let text = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
                text.parse::<$name>().map_err(Into::into)
            }
        }
    };
}

text_enum! {
    /// Channel that originated a conversation, message or agent step.
    ///
    /// Decides how `created_by` is read, see [`InvokeFrom::creator_kind`].
    InvokeFrom as "invoke_from" {
        WebApp => "web_app",
        Debugger => "debugger",
        ServiceApi => "service_api",
    }
}

/// What kind of principal a `created_by` id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatorKind {
    /// A platform account (web app users and developers in the debugger).
    Account,
    /// An end user of a published app calling through the service API.
    EndUser,
}

impl InvokeFrom {
    pub fn creator_kind(&self) -> CreatorKind {
        match self {
            InvokeFrom::WebApp | InvokeFrom::Debugger => CreatorKind::Account,
            InvokeFrom::ServiceApi => CreatorKind::EndUser,
        }
    }
}

text_enum! {
    /// Execution status of a message.
    ///
    /// `pending → running → {succeeded, failed}`; the two terminal states are final.
    MessageStatus as "message status" {
        Pending => "pending",
        Running => "running",
        Succeeded => "succeeded",
        Failed => "failed",
    }
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Succeeded | MessageStatus::Failed)
    }
}

text_enum! {
    /// Classification of one agent step.
    ThoughtEvent as "thought event" {
        /// Model reasoning.
        AgentThought => "agent_thought",
        /// Tool invocation; carries `tool` and `tool_input`.
        AgentAction => "agent_action",
        /// Output returned by a tool.
        AgentObservation => "agent_observation",
        DatasetRetrieval => "dataset_retrieval",
        LongTermMemoryRecall => "long_term_memory_recall",
        /// Final answer text.
        AgentMessage => "agent_message",
        Error => "error",
        Timeout => "timeout",
        Stop => "stop",
    }
}

impl ThoughtEvent {
    /// Steps that must name the tool they invoked.
    pub fn requires_tool(&self) -> bool {
        matches!(self, ThoughtEvent::AgentAction)
    }
}

/// Whether reads should see soft-deleted rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Visibility {
    /// Only rows whose `is_deleted` flag is clear.
    #[default]
    Active,
    /// Archived (soft-deleted) rows as well.
    IncludeArchived,
}

impl Visibility {
    pub fn includes_archived(&self) -> bool {
        matches!(self, Visibility::IncludeArchived)
    }
}

// ---------------------------------------------------------------------------
// Fixed-point money
// ---------------------------------------------------------------------------

fn write_fixed(raw: i64, scale: u32, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let factor = 10u64.pow(scale);
    let magnitude = raw.unsigned_abs();
    let sign = if raw < 0 { "-" } else { "" };
    write!(
        f,
        "{sign}{}.{:0width$}",
        magnitude / factor,
        magnitude % factor,
        width = scale as usize
    )
}

fn parse_fixed(text: &str, scale: u32) -> Result<i64, ParseError> {
    let trimmed = text.trim();
    let invalid = || ParseError::InvalidDecimal(text.to_string());

    let (whole, fraction) = match trimmed.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (trimmed, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }

    // Trailing zeros past the scale carry no value.
    let significant = fraction.trim_end_matches('0');
    if significant.len() > scale as usize {
        return Err(ParseError::TooPrecise {
            value: text.to_string(),
            scale,
        });
    }

    let overflow = || ParseError::Overflow(text.to_string());
    let factor = 10i64.pow(scale);
    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| overflow())?
    };
    let fraction: i64 = if significant.is_empty() {
        0
    } else {
        let padding = 10i64.pow(scale - significant.len() as u32);
        significant.parse::<i64>().map_err(|_| overflow())? * padding
    };

    whole
        .checked_mul(factor)
        .and_then(|scaled| scaled.checked_add(fraction))
        .ok_or_else(overflow)
}

macro_rules! fixed_point {
    ($(#[$meta:meta])* $name:ident, $scale:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, AsExpression, FromSqlRow)]
        #[diesel(sql_type = BigInt)]
        pub struct $name(i64);

        impl $name {
            /// Number of decimal places represented by one raw unit.
            pub const SCALE: u32 = $scale;
            pub const ZERO: $name = $name(0);

            /// Build from the scaled integer, e.g. `20` is `2 × 10^-SCALE`.
            pub const fn from_raw(raw: i64) -> Self {
                Self(raw)
            }

            pub const fn raw(&self) -> i64 {
                self.0
            }

            pub fn is_negative(&self) -> bool {
                self.0 < 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write_fixed(self.0, Self::SCALE, f)
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_fixed(s, Self::SCALE).map(Self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                text.parse().map_err(serde::de::Error::custom)
            }
        }

        impl ToSql<BigInt, Sqlite> for $name {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
                out.set_value(self.0);
                Ok(IsNull::No)
            }
        }

        impl FromSql<BigInt, Sqlite> for $name {
            fn from_sql(bytes: <Sqlite as Backend>::RawValue<'_>) -> deserialize::Result<Self> {
                <i64 as FromSql<BigInt, Sqlite>>::from_sql(bytes).map(Self)
            }
        }
    };
}

fixed_point! {
    /// Price per token at 7 decimal places.
    UnitPrice, 7
}

fixed_point! {
    /// Multiplier applied to a [`UnitPrice`], at 4 decimal places.
    PriceUnit, 4
}

fixed_point! {
    /// Monetary amount at 11 decimal places, wide enough to hold any
    /// `UnitPrice × PriceUnit` product exactly.
    Price, 11
}

impl UnitPrice {
    /// Exact `self × unit`, or `None` on overflow.
    pub fn checked_cost(self, unit: PriceUnit) -> Option<Price> {
        self.0.checked_mul(unit.0).map(Price)
    }
}

impl Price {
    pub fn checked_add(self, other: Price) -> Option<Price> {
        self.0.checked_add(other.0).map(Price)
    }
}

/// Token count plus the two price factors for one side (prompt or answer)
/// of an LLM call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub token_count: i32,
    pub unit_price: UnitPrice,
    pub price_unit: PriceUnit,
}

impl TokenUsage {
    pub fn new(token_count: i32, unit_price: UnitPrice, price_unit: PriceUnit) -> Self {
        Self {
            token_count,
            unit_price,
            price_unit,
        }
    }

    /// Cost contribution of this side: `unit_price × price_unit`.
    pub fn price(&self) -> Option<Price> {
        self.unit_price.checked_cost(self.price_unit)
    }
}

// ---------------------------------------------------------------------------
// JSON text columns
// ---------------------------------------------------------------------------

macro_rules! json_text {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, AsExpression, FromSqlRow, Serialize, Deserialize)]
        #[diesel(sql_type = Text)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl From<$inner> for $name {
            fn from(inner: $inner) -> Self {
                Self(inner)
            }
        }

        impl ToSql<Text, Sqlite> for $name {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
                out.set_value(serde_json::to_string(&self.0)?);
                Ok(IsNull::No)
            }
        }

        impl FromSql<Text, Sqlite> for $name {
            fn from_sql(bytes: <Sqlite as Backend>::RawValue<'_>) -> deserialize::Result<Self> {
                let text = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
                Ok(Self(serde_json::from_str(&text)?))
            }
        }
    };
}

json_text! {
    /// Provider-specific structured document: prompt message lists and tool inputs.
    Payload(serde_json::Value)
}

json_text! {
    /// Image URLs attached to a user query.
    ImageUrls(Vec<String>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_price_parses_at_scale() {
        let price: UnitPrice = "0.0000020".parse().unwrap();
        assert_eq!(price.raw(), 20);
        assert_eq!(price.to_string(), "0.0000020");

        let whole: UnitPrice = "3".parse().unwrap();
        assert_eq!(whole.raw(), 30_000_000);

        let leading_dot: PriceUnit = ".5".parse().unwrap();
        assert_eq!(leading_dot.raw(), 5_000);
    }

    #[test]
    fn test_fixed_point_accepts_trailing_zeros_past_scale() {
        let unit: PriceUnit = "0.001000000".parse().unwrap();
        assert_eq!(unit.raw(), 10);
    }

    #[test]
    fn test_fixed_point_rejects_extra_precision() {
        let err = "0.00000001".parse::<UnitPrice>().unwrap_err();
        assert_eq!(
            err,
            ParseError::TooPrecise {
                value: "0.00000001".into(),
                scale: 7
            }
        );
    }

    #[test]
    fn test_fixed_point_rejects_garbage_and_negatives() {
        assert!("".parse::<UnitPrice>().is_err());
        assert!(".".parse::<UnitPrice>().is_err());
        assert!("-0.1".parse::<UnitPrice>().is_err());
        assert!("1e-7".parse::<UnitPrice>().is_err());
        assert!("99999999999999999999".parse::<PriceUnit>().is_err());
    }

    #[test]
    fn test_cost_is_exact_product() {
        let unit: UnitPrice = "0.0000030".parse().unwrap();
        let per: PriceUnit = "1000.0000".parse().unwrap();
        let cost = unit.checked_cost(per).unwrap();
        assert_eq!(cost, "0.003".parse::<Price>().unwrap());
        assert_eq!(cost.to_string(), "0.00300000000");
    }

    #[test]
    fn test_token_usage_price() {
        let usage = TokenUsage::new(
            5,
            "0.0000020".parse().unwrap(),
            "0.0010".parse().unwrap(),
        );
        assert_eq!(usage.price(), Some(Price::from_raw(200)));
        assert_eq!(TokenUsage::default().price(), Some(Price::ZERO));
    }

    #[test]
    fn test_text_enums_round_trip_through_str() {
        for status in MessageStatus::ALL {
            assert_eq!(status.as_str().parse::<MessageStatus>().unwrap(), *status);
        }
        for event in ThoughtEvent::ALL {
            assert_eq!(event.as_str().parse::<ThoughtEvent>().unwrap(), *event);
        }
        assert!("explore".parse::<InvokeFrom>().is_err());
    }

    #[test]
    fn test_creator_kind_follows_provenance() {
        assert_eq!(InvokeFrom::WebApp.creator_kind(), CreatorKind::Account);
        assert_eq!(InvokeFrom::Debugger.creator_kind(), CreatorKind::Account);
        assert_eq!(InvokeFrom::ServiceApi.creator_kind(), CreatorKind::EndUser);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!MessageStatus::Pending.is_terminal());
        assert!(!MessageStatus::Running.is_terminal());
        assert!(MessageStatus::Succeeded.is_terminal());
        assert!(MessageStatus::Failed.is_terminal());
    }

    #[test]
    fn test_prices_serialize_as_strings() {
        let usage = TokenUsage::new(1, UnitPrice::from_raw(20), PriceUnit::from_raw(10));
        let json = serde_json::to_value(usage).unwrap();
        assert_eq!(json["unit_price"], "0.0000020");
        assert_eq!(json["price_unit"], "0.0010");
    }
}
