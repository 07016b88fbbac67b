//! Serde helpers for floats that may be infinite or NaN.
//!
//! JSON has no literal for these values, so they are written as the strings
//! `"inf"`, `"-inf"` and `"nan"`. Either form is accepted on the way back in.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Repr {
    Number(f64),
    Text(String),
}

fn to_repr(value: f64) -> Repr {
    if value.is_finite() {
        Repr::Number(value)
    } else if value.is_nan() {
        Repr::Text("nan".into())
    } else if value > 0.0 {
        Repr::Text("inf".into())
    } else {
        Repr::Text("-inf".into())
    }
}

fn from_repr<E: de::Error>(repr: Repr) -> Result<f64, E> {
    match repr {
        Repr::Number(value) => Ok(value),
        Repr::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "inf" | "+inf" | "infinity" => Ok(f64::INFINITY),
            "-inf" | "-infinity" => Ok(f64::NEG_INFINITY),
            "nan" => Ok(f64::NAN),
            other => other
                .parse::<f64>()
                .map_err(|_| E::custom(format!("expected a number or \"inf\", got \"{text}\""))),
        },
    }
}

/// For `f32` fields such as a clipping norm order.
pub mod single {
    use super::*;

    pub fn serialize<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
        to_repr(f64::from(*value)).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
        from_repr(Repr::deserialize(deserializer)?).map(|value| value as f32)
    }
}

/// For `Option<f64>` fields such as a best validation score.
pub mod optional {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&to_repr(*value)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        Option::<Repr>::deserialize(deserializer)?
            .map(from_repr)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "super::single")]
        norm: f32,
        #[serde(default, with = "super::optional")]
        score: Option<f64>,
    }

    #[test]
    fn test_infinity_survives_json() {
        let sample = Sample {
            norm: f32::INFINITY,
            score: Some(f64::NEG_INFINITY),
        };
        let json = serde_json::to_string(&sample).unwrap();
        assert_eq!(json, r#"{"norm":"inf","score":"-inf"}"#);
        assert_eq!(serde_json::from_str::<Sample>(&json).unwrap(), sample);
    }

    #[test]
    fn test_finite_values_stay_numbers() {
        let sample = Sample {
            norm: 0.1,
            score: Some(0.42),
        };
        let json = serde_json::to_string(&sample).unwrap();
        assert!(json.contains(r#""score":0.42"#));
        let back: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(back.norm.to_bits(), 0.1_f32.to_bits());
        assert_eq!(back.score.map(f64::to_bits), Some(0.42_f64.to_bits()));
    }

    #[test]
    fn test_nan_and_missing_score() {
        let back: Sample = serde_json::from_str(r#"{"norm":2,"score":"NaN"}"#).unwrap();
        assert_eq!(back.norm, 2.0);
        assert!(back.score.unwrap().is_nan());

        let back: Sample = serde_json::from_str(r#"{"norm":"Infinity"}"#).unwrap();
        assert_eq!(back.norm, f32::INFINITY);
        assert_eq!(back.score, None);
    }

    #[test]
    fn test_garbage_text_is_rejected() {
        assert!(serde_json::from_str::<Sample>(r#"{"norm":"wide"}"#).is_err());
    }
}
