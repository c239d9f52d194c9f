use std::fs;
use std::path::{Path, PathBuf};

use image::{imageops::FilterType, DynamicImage, GenericImageView, RgbImage};
use ndarray::Array4;
use tract_onnx::prelude::*;
use tracing::{debug, info, warn};

use crate::error::PredictError;
use crate::models::{Boxes, ClassNames, ModelOutput, Probs, TaskKind};
use crate::value::RawValue;

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Runs a model on one decoded image.
pub trait InferenceProvider: Send + Sync {
    /// The task the model was built for, if known.
    fn task(&self) -> Option<TaskKind>;

    /// Returns `None` when the model produced nothing for the image.
    fn predict(&self, image: &DynamicImage) -> Result<Option<ModelOutput>, PredictError>;
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub model: PathBuf,
    pub labels: Option<PathBuf>,
    pub task: Option<TaskKind>,
    pub imgsz: u32,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub top_k: Option<usize>,
}

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, TypedModel>;

pub struct OnnxProvider {
    plan: Plan,
    names: ClassNames,
    task: TaskKind,
    imgsz: u32,
    conf_threshold: f32,
    iou_threshold: f32,
    top_k: Option<usize>,
}

impl OnnxProvider {
    pub fn load(settings: &ProviderSettings) -> Result<Self, PredictError> {
        let size = settings.imgsz as usize;
        let plan = tract_onnx::onnx()
            .model_for_path(&settings.model)
            .and_then(|m| {
                m.with_input_fact(
                    0,
                    InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
                )
            })
            .and_then(|m| m.into_optimized())
            .and_then(|m| m.into_runnable())
            .map_err(|e| {
                PredictError::Provider(format!(
                    "failed to load model {}: {}",
                    settings.model.display(),
                    e
                ))
            })?;

        // Warm-up run on a blank image; its output shape tells the task and
        // class count.
        let blank = Tensor::zero::<f32>(&[1, 3, size, size])
            .map_err(|e| PredictError::Provider(e.to_string()))?;
        let outputs = plan
            .run(tvec!(blank.into()))
            .map_err(|e| PredictError::Provider(format!("warm-up inference failed: {}", e)))?;
        let shape = outputs
            .first()
            .map(|t| t.shape().to_vec())
            .ok_or_else(|| PredictError::Provider("model has no outputs".into()))?;

        let (task, num_classes) = task_from_shape(&shape, settings.task)?;
        info!(?task, num_classes, output_shape = ?shape, "Model loaded");

        let names = match &settings.labels {
            Some(path) => {
                let names = load_labels(path)?;
                if names.len() != num_classes {
                    warn!(
                        labels = names.len(),
                        num_classes, "Label count does not match model output"
                    );
                }
                names
            }
            None => {
                warn!("No labels supplied, using class indices");
                default_names(num_classes)
            }
        };

        Ok(Self {
            plan,
            names,
            task,
            imgsz: settings.imgsz,
            conf_threshold: settings.conf_threshold,
            iou_threshold: settings.iou_threshold,
            top_k: settings.top_k,
        })
    }

    pub fn names(&self) -> &ClassNames {
        &self.names
    }
}

impl InferenceProvider for OnnxProvider {
    fn task(&self) -> Option<TaskKind> {
        Some(self.task)
    }

    fn predict(&self, image: &DynamicImage) -> Result<Option<ModelOutput>, PredictError> {
        let input = match self.task {
            TaskKind::Classify => letterbox(image, self.imgsz),
            TaskKind::Detect => stretch(image, self.imgsz),
        };
        let size = self.imgsz as usize;
        let tensor = tract_ndarray::Array::from_shape_vec((1, 3, size, size), input.into_raw_vec())
            .map_err(|e| PredictError::Provider(e.to_string()))?
            .into_tensor();

        let outputs = self
            .plan
            .run(tvec!(tensor.into()))
            .map_err(|e| PredictError::Provider(e.to_string()))?;
        let raw: Tensor = match outputs.first() {
            Some(t) => (**t).clone(),
            None => return Ok(None),
        };
        debug!(shape = ?raw.shape(), "Inference finished");

        let output = match self.task {
            TaskKind::Classify => ModelOutput::classification(
                self.names.clone(),
                classification_probs(&raw, self.top_k)?,
            ),
            TaskKind::Detect => ModelOutput::detection(
                self.names.clone(),
                detection_boxes(&raw, self.imgsz, self.conf_threshold, self.iou_threshold)?,
            ),
        };
        Ok(Some(output))
    }
}

fn task_from_shape(
    shape: &[usize],
    declared: Option<TaskKind>,
) -> Result<(TaskKind, usize), PredictError> {
    let inferred = match shape {
        [1, n] => Some((TaskKind::Classify, *n)),
        [1, rows, _] if *rows > 4 => Some((TaskKind::Detect, rows - 4)),
        _ => None,
    };
    match (declared, inferred) {
        (Some(declared), Some((task, n))) if declared == task => Ok((task, n)),
        (None, Some(found)) => Ok(found),
        (declared, _) => Err(PredictError::Provider(format!(
            "output shape {:?} does not fit task {:?}",
            shape, declared
        ))),
    }
}

/// Reads class names from a JSON object (`{"0": "cat"}`), a JSON array, or
/// one name per line.
pub fn load_labels(path: &Path) -> Result<ClassNames, PredictError> {
    let text = fs::read_to_string(path).map_err(|e| {
        PredictError::Provider(format!("failed to read labels {}: {}", path.display(), e))
    })?;
    parse_labels(&text)
        .map_err(|e| PredictError::Provider(format!("invalid labels {}: {}", path.display(), e)))
}

fn parse_labels(text: &str) -> Result<ClassNames, String> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') {
        let map: std::collections::BTreeMap<String, String> =
            serde_json::from_str(text).map_err(|e| e.to_string())?;
        return map
            .into_iter()
            .map(|(k, v)| {
                k.trim()
                    .parse::<u32>()
                    .map(|idx| (idx, v))
                    .map_err(|_| format!("class key {:?} is not a non-negative integer", k))
            })
            .collect();
    }
    if trimmed.starts_with('[') {
        let list: Vec<String> = serde_json::from_str(text).map_err(|e| e.to_string())?;
        return Ok((0u32..).zip(list).collect());
    }
    Ok((0u32..)
        .zip(text.lines().map(str::trim).filter(|l| !l.is_empty()))
        .map(|(idx, name)| (idx, name.to_string()))
        .collect())
}

fn default_names(num_classes: usize) -> ClassNames {
    (0..num_classes as u32)
        .map(|i| (i, format!("Class {}", i)))
        .collect()
}

/// Fits the image into a square of `size` keeping the aspect ratio, pads the
/// rest with black and applies ImageNet normalization.
fn letterbox(image: &DynamicImage, size: u32) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let (new_width, new_height) = if width > height {
        (size, ((size * height) / width).max(1))
    } else {
        (((size * width) / height).max(1), size)
    };
    let resized = image
        .resize_exact(new_width, new_height, FilterType::Triangle)
        .to_rgb8();

    let mut canvas = RgbImage::new(size, size);
    let pad_x = (size - new_width) / 2;
    let pad_y = (size - new_height) / 2;
    for (x, y, pixel) in resized.enumerate_pixels() {
        canvas.put_pixel(x + pad_x, y + pad_y, *pixel);
    }

    to_chw(&canvas, |c, v| (v as f32 / 255.0 - MEAN[c]) / STD[c])
}

/// Resizes to a square of `size` ignoring the aspect ratio so normalized
/// coordinates map straight back onto the original image.
fn stretch(image: &DynamicImage, size: u32) -> Array4<f32> {
    let resized = image.resize_exact(size, size, FilterType::Triangle).to_rgb8();
    to_chw(&resized, |_, v| v as f32 / 255.0)
}

fn to_chw(image: &RgbImage, norm: impl Fn(usize, u8) -> f32) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let mut tensor = Array4::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = norm(c, pixel[c]);
        }
    }
    tensor
}

fn scores_of(raw: &Tensor) -> Result<Vec<f32>, PredictError> {
    let cast = raw
        .cast_to::<f32>()
        .map_err(|e| PredictError::Provider(e.to_string()))?;
    let slice = cast
        .as_slice::<f32>()
        .map_err(|e| PredictError::Provider(e.to_string()))?;
    Ok(slice.to_vec())
}

/// Converts a `[1, N]` classifier output into probabilities. Raw logits are
/// passed through softmax.
fn classification_probs(raw: &Tensor, top_k: Option<usize>) -> Result<Probs, PredictError> {
    let mut scores = scores_of(raw)?;
    let sum: f32 = scores.iter().sum();
    let is_distribution = scores.iter().all(|v| (0.0..=1.0).contains(v)) && (sum - 1.0).abs() < 1e-3;
    if !is_distribution {
        softmax(&mut scores);
    }

    match top_k {
        Some(k) => {
            let mut ranked: Vec<(usize, f32)> = scores.into_iter().enumerate().collect();
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
            ranked.truncate(k);
            let indices: Vec<i64> = ranked.iter().map(|(i, _)| *i as i64).collect();
            let confidences: Vec<f32> = ranked.iter().map(|(_, c)| *c).collect();
            Ok(Probs::TopK {
                indices: RawValue::Tensor(tensor1(&indices)),
                confidences: RawValue::Tensor(tensor1(&confidences)),
            })
        }
        None => Ok(Probs::Distribution(RawValue::Tensor(tensor1(&scores)))),
    }
}

fn softmax(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    class: usize,
    score: f32,
    bbox: [f32; 4],
}

/// Decodes a `[1, 4 + N, A]` detector output: per anchor the box centre and
/// size in input pixels followed by one score per class.
fn detection_boxes(
    raw: &Tensor,
    imgsz: u32,
    conf_threshold: f32,
    iou_threshold: f32,
) -> Result<Boxes, PredictError> {
    let (rows, anchors) = match raw.shape() {
        [1, rows, anchors] if *rows > 4 => (*rows, *anchors),
        other => {
            return Err(PredictError::Provider(format!(
                "unexpected detector output shape {:?}",
                other
            )))
        }
    };
    let data = scores_of(raw)?;
    let at = |row: usize, anchor: usize| data[row * anchors + anchor];
    let size = imgsz as f32;

    let mut candidates = Vec::new();
    for a in 0..anchors {
        let (class, score) = (4..rows)
            .map(|r| (r - 4, at(r, a)))
            .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
        if score < conf_threshold {
            continue;
        }
        let (cx, cy, w, h) = (at(0, a), at(1, a), at(2, a), at(3, a));
        let bbox = [
            ((cx - w / 2.0) / size).clamp(0.0, 1.0),
            ((cy - h / 2.0) / size).clamp(0.0, 1.0),
            ((cx + w / 2.0) / size).clamp(0.0, 1.0),
            ((cy + h / 2.0) / size).clamp(0.0, 1.0),
        ];
        candidates.push(Candidate { class, score, bbox });
    }

    let kept = nms(candidates, iou_threshold);
    let cls: Vec<f32> = kept.iter().map(|c| c.class as f32).collect();
    let conf: Vec<f32> = kept.iter().map(|c| c.score).collect();
    let coords: Vec<f32> = kept.iter().flat_map(|c| c.bbox).collect();
    let xyxyn = Tensor::from_shape(&[kept.len(), 4], &coords)
        .map_err(|e| PredictError::Provider(e.to_string()))?;

    Ok(Boxes {
        cls: RawValue::Tensor(tensor1(&cls)),
        conf: RawValue::Tensor(tensor1(&conf)),
        xyxyn: RawValue::Tensor(xyxyn),
    })
}

/// Per-class non-maximum suppression, highest score first.
fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Candidate> = Vec::new();
    for cand in candidates {
        let suppressed = kept
            .iter()
            .any(|k| k.class == cand.class && iou(&k.bbox, &cand.bbox) >= iou_threshold);
        if !suppressed {
            kept.push(cand);
        }
    }
    kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}
