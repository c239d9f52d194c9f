//! Turns a provider's [`ModelOutput`] into the stable prediction list sent to
//! clients.
//!
//! Everything here is a pure function of its input: no I/O, no shared state,
//! and no failure escapes. Shape surprises degrade to an empty prediction list
//! with the error message filled in.

use std::collections::BTreeMap;

use crate::error::PredictError;
use crate::models::{
    Boxes, ClassNames, DetectionMode, ModelOutput, PredictionRecord, PredictionResponse, Probs,
    TaskKind,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeOptions {
    /// Task declared by the model. When absent it is inferred from which
    /// fields the output carries.
    pub task: Option<TaskKind>,
    pub mode: DetectionMode,
}

enum ResultShape<'a> {
    Classification {
        names: &'a ClassNames,
        probs: &'a Probs,
    },
    Detection {
        names: &'a ClassNames,
        boxes: &'a Boxes,
    },
}

pub fn normalize(output: Option<&ModelOutput>, options: NormalizeOptions) -> PredictionResponse {
    match try_normalize(output, options) {
        Ok(predictions) => PredictionResponse::success(predictions),
        Err(e) => PredictionResponse::failure(&e),
    }
}

pub fn try_normalize(
    output: Option<&ModelOutput>,
    options: NormalizeOptions,
) -> Result<Vec<PredictionRecord>, PredictError> {
    let output = match output {
        Some(output) if !output.is_empty() => output,
        _ => return Err(PredictError::NoResults),
    };

    check_names(&output.names)?;

    match resolve(output, options.task)? {
        ResultShape::Classification { names, probs } => classify(names, probs),
        ResultShape::Detection { names, boxes } => detect(names, boxes, options.mode),
    }
}

fn resolve(output: &ModelOutput, task: Option<TaskKind>) -> Result<ResultShape<'_>, PredictError> {
    let names = &output.names;
    match (task, &output.probs, &output.boxes) {
        (Some(TaskKind::Classify), Some(probs), _) | (None, Some(probs), _) => {
            Ok(ResultShape::Classification { names, probs })
        }
        (Some(TaskKind::Detect), _, Some(boxes)) | (None, None, Some(boxes)) => {
            Ok(ResultShape::Detection { names, boxes })
        }
        (Some(TaskKind::Classify), None, _) => Err(PredictError::shape(
            "classification result carries no probabilities",
        )),
        (Some(TaskKind::Detect), _, None) => {
            Err(PredictError::shape("detection result carries no boxes"))
        }
        (None, None, None) => Err(PredictError::UnrecognizedShape),
    }
}

fn check_names(names: &ClassNames) -> Result<(), PredictError> {
    if names.is_empty() {
        return Err(PredictError::shape("result carries no class names"));
    }
    match names.iter().find(|(_, name)| name.trim().is_empty()) {
        Some((idx, _)) => Err(PredictError::shape(format!("class {} has an empty name", idx))),
        None => Ok(()),
    }
}

fn classify(names: &ClassNames, probs: &Probs) -> Result<Vec<PredictionRecord>, PredictError> {
    let lookup: Box<dyn Fn(u32) -> Result<f64, PredictError>> = match probs {
        Probs::Distribution(raw) => {
            let values = raw.to_f64_vec()?;
            Box::new(move |idx| {
                values.get(idx as usize).copied().ok_or_else(|| {
                    PredictError::shape(format!(
                        "class index {} out of range for {} probabilities",
                        idx,
                        values.len()
                    ))
                })
            })
        }
        Probs::TopK {
            indices,
            confidences,
        } => {
            let indices = indices.to_f64_vec()?;
            let confidences = confidences.to_f64_vec()?;
            if indices.len() != confidences.len() {
                return Err(PredictError::shape(format!(
                    "top-k has {} indices but {} confidences",
                    indices.len(),
                    confidences.len()
                )));
            }
            let mut top = BTreeMap::new();
            for (idx, conf) in indices.into_iter().zip(confidences) {
                let idx = class_index(idx, names)?;
                let conf = unit_interval(conf, "top-k confidence")?;
                let entry = top.entry(idx).or_insert(conf);
                *entry = entry.max(conf);
            }
            Box::new(move |idx| Ok(top.get(&idx).copied().unwrap_or(0.0)))
        }
    };

    names
        .iter()
        .map(|(&idx, name)| -> Result<PredictionRecord, PredictError> {
            let probability = unit_interval(lookup(idx)?, "probability")?;
            Ok(PredictionRecord::Classification {
                class: name.clone(),
                probability,
            })
        })
        .collect()
}

struct Detection {
    class: u32,
    confidence: f64,
    bbox: [f64; 4],
}

fn detect(
    names: &ClassNames,
    boxes: &Boxes,
    mode: DetectionMode,
) -> Result<Vec<PredictionRecord>, PredictError> {
    let detections = read_boxes(names, boxes)?;

    match mode {
        DetectionMode::PerBox => Ok(detections
            .into_iter()
            .map(|d| PredictionRecord::Detection {
                class: names[&d.class].clone(),
                confidence: d.confidence,
                bbox: Some(d.bbox),
            })
            .collect()),
        DetectionMode::BestPerClass => {
            let mut best: BTreeMap<u32, (f64, Option<[f64; 4]>)> =
                names.keys().map(|&idx| (idx, (0.0, None))).collect();
            for d in detections {
                if let Some(slot) = best.get_mut(&d.class) {
                    if d.confidence > slot.0 {
                        *slot = (d.confidence, Some(d.bbox));
                    }
                }
            }
            Ok(best
                .into_iter()
                .map(|(idx, (confidence, bbox))| PredictionRecord::Detection {
                    class: names[&idx].clone(),
                    confidence,
                    bbox,
                })
                .collect())
        }
    }
}

fn read_boxes(names: &ClassNames, boxes: &Boxes) -> Result<Vec<Detection>, PredictError> {
    let cls = boxes.cls.to_f64_vec()?;
    let conf = boxes.conf.to_f64_vec()?;
    let coords = boxes.xyxyn.to_f64_vec()?;

    if cls.len() != conf.len() || coords.len() != cls.len() * 4 {
        return Err(PredictError::shape(format!(
            "box fields disagree: {} classes, {} confidences, {} coordinates",
            cls.len(),
            conf.len(),
            coords.len()
        )));
    }

    cls.iter()
        .zip(&conf)
        .zip(coords.chunks_exact(4))
        .map(|((&class, &confidence), xyxy)| -> Result<Detection, PredictError> {
            let mut bbox = [0.0; 4];
            for (slot, &v) in bbox.iter_mut().zip(xyxy) {
                *slot = unit_interval(v, "box coordinate")?;
            }
            Ok(Detection {
                class: class_index(class, names)?,
                confidence: unit_interval(confidence, "confidence")?,
                bbox,
            })
        })
        .collect()
}

fn class_index(raw: f64, names: &ClassNames) -> Result<u32, PredictError> {
    if !raw.is_finite() || raw < 0.0 || raw.fract() != 0.0 || raw > u32::MAX as f64 {
        return Err(PredictError::shape(format!("invalid class index {}", raw)));
    }
    let idx = raw as u32;
    if names.contains_key(&idx) {
        Ok(idx)
    } else {
        Err(PredictError::shape(format!(
            "class index {} out of range for {} classes",
            idx,
            names.len()
        )))
    }
}

fn unit_interval(v: f64, what: &str) -> Result<f64, PredictError> {
    if v.is_finite() {
        Ok(v.clamp(0.0, 1.0))
    } else {
        Err(PredictError::shape(format!("{} is not a finite number: {}", what, v)))
    }
}
