use std::collections::BTreeMap;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ErrorKind, PredictError};
use crate::value::RawValue;

/// Class index to human-readable name, iterated in ascending index order.
pub type ClassNames = BTreeMap<u32, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Classify,
    Detect,
}

/// How detections are reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// One record per known class carrying its highest confidence.
    #[default]
    #[value(name = "best_per_class")]
    BestPerClass,
    /// One record per detected box.
    #[value(name = "per_box")]
    PerBox,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Probs {
    /// One probability per class index.
    Distribution(RawValue),
    /// Only the K most probable classes, as parallel index/confidence lists.
    TopK {
        indices: RawValue,
        confidences: RawValue,
    },
}

/// Detected boxes as parallel per-box lists.
#[derive(Debug, Clone, PartialEq)]
pub struct Boxes {
    pub cls: RawValue,
    pub conf: RawValue,
    /// Four normalized coordinates (xmin, ymin, xmax, ymax) per box.
    pub xyxyn: RawValue,
}

/// The provider's result for a single image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelOutput {
    pub names: ClassNames,
    pub probs: Option<Probs>,
    pub boxes: Option<Boxes>,
}

impl ModelOutput {
    pub fn classification(names: ClassNames, probs: Probs) -> Self {
        Self {
            names,
            probs: Some(probs),
            boxes: None,
        }
    }

    pub fn detection(names: ClassNames, boxes: Boxes) -> Self {
        Self {
            names,
            probs: None,
            boxes: Some(boxes),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.probs.is_none() && self.boxes.is_none()
    }

    /// Plain JSON view of the raw output, for logging.
    pub fn describe(&self) -> Value {
        let mut out = json!({ "names": self.names });
        match &self.probs {
            Some(Probs::Distribution(data)) => out["probs"] = json!({ "data": data.to_json() }),
            Some(Probs::TopK {
                indices,
                confidences,
            }) => {
                out["probs"] = json!({
                    "top": indices.to_json(),
                    "topconf": confidences.to_json(),
                })
            }
            None => {}
        }
        if let Some(boxes) = &self.boxes {
            out["boxes"] = json!({
                "cls": boxes.cls.to_json(),
                "conf": boxes.conf.to_json(),
                "xyxyn": boxes.xyxyn.to_json(),
            });
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PredictionRecord {
    Classification {
        class: String,
        probability: f64,
    },
    Detection {
        class: String,
        confidence: f64,
        #[serde(rename = "box", skip_serializing_if = "Option::is_none")]
        bbox: Option<[f64; 4]>,
    },
}

impl PredictionRecord {
    pub fn class(&self) -> &str {
        match self {
            PredictionRecord::Classification { class, .. }
            | PredictionRecord::Detection { class, .. } => class,
        }
    }

    pub fn score(&self) -> f64 {
        match self {
            PredictionRecord::Classification { probability, .. } => *probability,
            PredictionRecord::Detection { confidence, .. } => *confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResponse {
    pub predictions: Vec<PredictionRecord>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorKind>,
}

impl PredictionResponse {
    pub fn success(predictions: Vec<PredictionRecord>) -> Self {
        Self {
            predictions,
            error: None,
            error_type: None,
        }
    }

    pub fn failure(err: &PredictError) -> Self {
        Self {
            predictions: Vec::new(),
            error: Some(err.to_string()),
            error_type: Some(err.kind()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model_loaded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_serialize_to_the_wire_shape() {
        let cls = PredictionRecord::Classification {
            class: "cat".into(),
            probability: 0.2,
        };
        assert_eq!(
            serde_json::to_value(&cls).unwrap(),
            json!({"class": "cat", "probability": 0.2})
        );

        let det = PredictionRecord::Detection {
            class: "dog".into(),
            confidence: 0.9,
            bbox: Some([0.1, 0.1, 0.5, 0.5]),
        };
        assert_eq!(
            serde_json::to_value(&det).unwrap(),
            json!({"class": "dog", "confidence": 0.9, "box": [0.1, 0.1, 0.5, 0.5]})
        );

        let empty = PredictionRecord::Detection {
            class: "dog".into(),
            confidence: 0.0,
            bbox: None,
        };
        assert_eq!(
            serde_json::to_value(&empty).unwrap(),
            json!({"class": "dog", "confidence": 0.0})
        );
    }

    #[test]
    fn failures_always_carry_an_empty_prediction_list() {
        let resp = PredictionResponse::failure(&PredictError::NoResults);
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"predictions": [], "error": "no results", "error_type": "ShapeError"})
        );

        let ok = PredictionResponse::success(Vec::new());
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"predictions": [], "error": null})
        );
    }

    #[test]
    fn raw_output_is_described_as_plain_json() {
        let mut names = ClassNames::new();
        names.insert(0, "cat".into());
        let output = ModelOutput::classification(
            names,
            Probs::TopK {
                indices: vec![0i64].into(),
                confidences: vec![0.5f64].into(),
            },
        );
        assert_eq!(
            output.describe(),
            json!({"names": {"0": "cat"}, "probs": {"top": [0], "topconf": [0.5]}})
        );
    }

    #[test]
    fn empty_output_is_detected() {
        assert!(ModelOutput::default().is_empty());
        let mut names = ClassNames::new();
        names.insert(0, "cat".into());
        let output = ModelOutput {
            names,
            ..Default::default()
        };
        assert!(!output.is_empty());
    }
}
