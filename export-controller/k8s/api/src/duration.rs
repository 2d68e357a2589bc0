use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, time::Duration};

/// A duration in the Go `time.Duration` string format used by the Kubernetes
/// API, e.g. `5s`, `1m30s`, `100ms`.
///
/// Unlike Go durations, negative values are rejected at parse time. Nothing
/// in this API accepts a negative duration.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct K8sDuration(Duration);

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("negative durations are not supported")]
    Negative,

    #[error("invalid floating-point number: {}", .0)]
    NotANumber(#[from] std::num::ParseFloatError),
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

impl From<Duration> for K8sDuration {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl From<K8sDuration> for Duration {
    fn from(K8sDuration(duration): K8sDuration) -> Self {
        duration
    }
}

impl K8sDuration {
    #[inline]
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl fmt::Debug for K8sDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for K8sDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Matches Go's `time.Duration.String()` for non-negative values:
        // sub-second durations use a smaller unit, and everything else is
        // rendered as `[Nh][Nm]N[.frac]s`.
        fn frac(f: &mut fmt::Formatter<'_>, rem: u64, digits: usize) -> fmt::Result {
            if rem != 0 {
                let s = format!("{rem:0digits$}");
                write!(f, ".{}", s.trim_end_matches('0'))?;
            }
            Ok(())
        }

        let d = self.0;
        if d < Duration::from_secs(1) {
            let nanos = u64::from(d.subsec_nanos());
            return if nanos == 0 {
                f.write_str("0s")
            } else if nanos < 1_000 {
                write!(f, "{nanos}ns")
            } else if nanos < 1_000_000 {
                write!(f, "{}", nanos / 1_000)?;
                frac(f, nanos % 1_000, 3)?;
                f.write_str("\u{00b5}s")
            } else {
                write!(f, "{}", nanos / 1_000_000)?;
                frac(f, nanos % 1_000_000, 6)?;
                f.write_str("ms")
            };
        }

        let secs = d.as_secs();
        let hours = secs / 3600;
        let mins = secs / 60;
        if hours > 0 {
            write!(f, "{hours}h")?;
        }
        if mins > 0 {
            write!(f, "{}m", mins % 60)?;
        }
        write!(f, "{}", secs % 60)?;
        frac(f, u64::from(d.subsec_nanos()), 9)?;
        f.write_str("s")
    }
}

impl FromStr for K8sDuration {
    type Err = ParseError;

    fn from_str(mut s: &str) -> Result<Self, Self::Err> {
        // Accepts the same format as
        // https://cs.opensource.google/go/go/+/refs/tags/go1.20.4:src/time/format.go;l=1589
        // minus the sign.

        fn duration_from_units(val: f64, unit: &str) -> Result<Duration, ParseError> {
            const MINUTE: Duration = Duration::from_secs(60);
            let base = match unit {
                "ns" => Duration::from_nanos(1),
                // U+00B5 is the "micro sign" while U+03BC is "Greek letter mu"
                "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
                "ms" => Duration::from_millis(1),
                "s" => Duration::from_secs(1),
                "m" => MINUTE,
                "h" => MINUTE * 60,
                _ => return Err(ParseError::InvalidUnit),
            };
            Ok(base.mul_f64(val))
        }

        if s.starts_with('-') {
            return Err(ParseError::Negative);
        }
        s = s.trim_start_matches('+');

        let mut total = Duration::from_secs(0);
        while !s.is_empty() {
            if let Some(unit_start) = s.find(|c: char| c.is_alphabetic()) {
                let (val, rest) = s.split_at(unit_start);
                let val = val.parse::<f64>()?;
                let unit = if let Some(next_numeric_start) = rest.find(|c: char| !c.is_alphabetic())
                {
                    let (unit, rest) = rest.split_at(next_numeric_start);
                    s = rest;
                    unit
                } else {
                    s = "";
                    rest
                };
                total += duration_from_units(val, unit)?;
            } else if s == "0" {
                return Ok(Self(Duration::from_secs(0)));
            } else {
                return Err(ParseError::NoUnit);
            }
        }

        Ok(Self(total))
    }
}

impl Serialize for K8sDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for K8sDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;
        impl de::Visitor<'_> for Visitor {
            type Value = K8sDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string in Go `time.Duration.String()` format")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value.parse::<K8sDuration>().map_err(de::Error::custom)
            }
        }
        deserializer.deserialize_str(Visitor)
    }
}

impl schemars::JsonSchema for K8sDuration {
    fn schema_name() -> String {
        "K8sDuration".to_owned()
    }

    fn is_referenceable() -> bool {
        false
    }

    fn json_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        schemars::schema::SchemaObject {
            instance_type: Some(schemars::schema::InstanceType::String.into()),
            // Not "duration": that format means ISO 8601, which this is not.
            format: None,
            ..Default::default()
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);
    const HOUR: Duration = Duration::from_secs(60 * 60);

    #[test]
    fn parses_go_duration_strings() {
        let cases: &[(&str, Duration)] = &[
            ("0", Duration::from_secs(0)),
            ("5s", Duration::from_secs(5)),
            ("30s", Duration::from_secs(30)),
            ("1478s", Duration::from_secs(1478)),
            ("+5s", Duration::from_secs(5)),
            ("5.0s", Duration::from_secs(5)),
            ("5.6s", Duration::from_secs(5) + Duration::from_millis(600)),
            ("5.s", Duration::from_secs(5)),
            (".5s", Duration::from_millis(500)),
            ("1.004s", Duration::from_secs(1) + Duration::from_millis(4)),
            ("10ns", Duration::from_nanos(10)),
            ("11us", Duration::from_micros(11)),
            ("12µs", Duration::from_micros(12)),
            ("13ms", Duration::from_millis(13)),
            ("15m", 15 * MINUTE),
            ("16h", 16 * HOUR),
            ("3h30m", 3 * HOUR + 30 * MINUTE),
            (
                "10.5s4m",
                4 * MINUTE + Duration::from_secs(10) + Duration::from_millis(500),
            ),
            (
                "1h2m3s4ms5us6ns",
                HOUR + 2 * MINUTE
                    + Duration::from_secs(3)
                    + Duration::from_millis(4)
                    + Duration::from_micros(5)
                    + Duration::from_nanos(6),
            ),
            ("0.3333333333333333333h", 20 * MINUTE),
        ];

        for (input, expected) in cases {
            let parsed = dbg!(input).parse::<K8sDuration>().unwrap();
            assert_eq!(dbg!(parsed), K8sDuration::from(*expected));
        }
    }

    #[test]
    fn rejects_invalid_input() {
        assert_eq!("-5s".parse::<K8sDuration>(), Err(ParseError::Negative));
        assert_eq!("5".parse::<K8sDuration>(), Err(ParseError::NoUnit));
        assert_eq!("5y".parse::<K8sDuration>(), Err(ParseError::InvalidUnit));
        assert!("s".parse::<K8sDuration>().is_err());
    }

    #[test]
    fn displays_like_go() {
        let cases: &[(Duration, &str)] = &[
            (Duration::from_secs(0), "0s"),
            (Duration::from_nanos(10), "10ns"),
            (Duration::from_micros(11), "11\u{00b5}s"),
            (Duration::from_millis(500), "500ms"),
            (Duration::from_millis(1500), "1.5s"),
            (Duration::from_secs(5), "5s"),
            (Duration::from_secs(90), "1m30s"),
            (Duration::from_secs(3601), "1h0m1s"),
            (3 * HOUR + 30 * MINUTE, "3h30m0s"),
        ];
        for (input, expected) in cases {
            assert_eq!(K8sDuration::from(*input).to_string(), *expected);
        }
    }

    #[test]
    fn roundtrips_through_serde() {
        for s in ["5s", "1m30s", "500ms", "0s"] {
            let d: K8sDuration = serde_json::from_value(serde_json::json!(s)).unwrap();
            assert_eq!(serde_json::to_value(d).unwrap(), serde_json::json!(s));
        }
    }
}
