use crate::{
    config::{ExecutionProvider, LabelsConfig, ModelConfig, Validatable},
    detection::{BoundingBox, Detection, DetectionResult},
    error::PredictError,
    inference_service::INFERENCE_SIZE,
    labels::ClassNames,
    model_service::ModelService,
};
use async_trait::async_trait;
use image::{imageops::FilterType, RgbImage};
use ndarray::{Array, ArrayD, ArrayViewD, Axis, Ix3, Ix4};
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use tracing::instrument;

const PAD_VALUE: f32 = 114. / 255.;
const OUTPUT_NAME: &str = "output0";
const NAMES_METADATA_KEY: &str = "names";

/// How a source image was fitted into the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
    width: u32,
    height: u32,
}

impl Letterbox {
    /// Maps a model-space `(xc, yc, w, h)` box back onto the source image.
    fn restore(&self, xc: f32, yc: f32, w: f32, h: f32) -> BoundingBox {
        let unpad_x = |x: f32| ((x - self.pad_x as f32) / self.scale).clamp(0., self.width as f32);
        let unpad_y = |y: f32| ((y - self.pad_y as f32) / self.scale).clamp(0., self.height as f32);
        BoundingBox {
            x1: unpad_x(xc - w / 2.),
            y1: unpad_y(yc - h / 2.),
            x2: unpad_x(xc + w / 2.),
            y2: unpad_y(yc + h / 2.),
        }
    }
}

fn letterbox(image: &RgbImage, size: u32) -> Result<(Array<f32, Ix4>, Letterbox), PredictError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(PredictError::Decode("image has no pixels".to_string()));
    }

    let scale = size as f32 / width.max(height) as f32;
    let new_width = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_height = ((height as f32 * scale).round() as u32).clamp(1, size);
    let resized = image::imageops::resize(image, new_width, new_height, FilterType::CatmullRom);

    let pad_x = (size - new_width) / 2;
    let pad_y = (size - new_height) / 2;

    let size = size as usize;
    let mut input = Array::from_elem((1, 3, size, size), PAD_VALUE);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let x = (x + pad_x) as usize;
        let y = (y + pad_y) as usize;
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    Ok((
        input,
        Letterbox {
            scale,
            pad_x,
            pad_y,
            width,
            height,
        },
    ))
}

#[derive(Debug, Clone, Copy)]
struct PostProcessing {
    min_probability: f32,
    iou_threshold: f32,
    max_detections: usize,
}

impl From<&ModelConfig> for PostProcessing {
    fn from(cfg: &ModelConfig) -> Self {
        Self {
            min_probability: cfg.min_probability,
            iou_threshold: cfg.iou_threshold,
            max_detections: cfg.max_detections,
        }
    }
}

/// Decodes a YOLO `[1, 4 + classes, anchors]` output into detections,
/// strongest first, with per-class non-maximum suppression applied.
fn extract_detections(
    output: ArrayViewD<f32>,
    letterbox: &Letterbox,
    params: &PostProcessing,
) -> Result<Vec<Detection>, PredictError> {
    let shape = output.shape();
    if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
        return Err(PredictError::Shape(format!(
            "expected output of shape [1, 4 + classes, anchors], got {:?}",
            shape
        )));
    }

    let output = output
        .into_dimensionality::<Ix3>()
        .map_err(|e| PredictError::Shape(e.to_string()))?;
    let output = output.index_axis(Axis(0), 0);
    let mut candidates = Vec::new();

    for anchor in output.axis_iter(Axis(1)) {
        let Some((class_id, confidence)) = anchor
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .reduce(|accum, row| if row.1 > accum.1 { row } else { accum })
        else {
            continue;
        };

        if confidence < params.min_probability {
            continue;
        }

        candidates.push(Detection {
            class_id,
            confidence,
            bbox: letterbox.restore(anchor[0], anchor[1], anchor[2], anchor[3]),
        });
    }

    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::new();
    for candidate in candidates {
        if kept.len() >= params.max_detections {
            break;
        }
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > params.iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }

    Ok(kept)
}

/// Number of classes a `[1, 4 + classes, anchors]` output predicts must match
/// the class name table, otherwise ids would resolve to the wrong names.
fn check_class_count(output_shape: &[usize], names: &ClassNames) -> Result<(), PredictError> {
    if output_shape.len() != 3 || output_shape[1] < 5 {
        return Err(PredictError::Shape(format!(
            "expected output of shape [1, 4 + classes, anchors], got {:?}",
            output_shape
        )));
    }
    let classes = output_shape[1] - 4;
    if classes != names.len() {
        return Err(PredictError::Shape(format!(
            "model predicts {} classes but the class name table has {}",
            classes,
            names.len()
        )));
    }
    Ok(())
}

fn embedded_class_names(session: &Session) -> Result<Option<ClassNames>, Box<dyn std::error::Error>> {
    let metadata = session.metadata()?;
    match metadata.custom(NAMES_METADATA_KEY)? {
        Some(raw) => Ok(Some(ClassNames::from_model_metadata(&raw)?)),
        None => Ok(None),
    }
}

/// YOLO detector backed by a pool of ONNX Runtime sessions.
#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    names: Arc<ClassNames>,
    post_processing: PostProcessing,
}

impl OrtModelService {
    /// Class names come from the model's own metadata; the labels file is only
    /// read for exports that carry none.
    pub fn new(
        model_config: &ModelConfig,
        labels_config: Option<&LabelsConfig>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let num_instances = model_config.num_instances;
        let provider = model_config.execution_provider;
        let sessions = (0..num_instances)
            .map(|_| {
                let mut builder =
                    Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
                builder = match provider {
                    ExecutionProvider::Cpu => builder,
                    ExecutionProvider::Cuda => builder
                        .with_execution_providers([CUDAExecutionProvider::default().build()])?,
                    ExecutionProvider::TensorRt => builder.with_execution_providers([
                        TensorRTExecutionProvider::default()
                            .with_engine_cache(true)
                            .build(),
                    ])?,
                };
                builder.commit_from_file(model_config.get_path())
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        let first_session = sessions.first().ok_or("no ONNX session was created")?;
        let names = match embedded_class_names(first_session)? {
            Some(names) => {
                tracing::info!("Using {} class names embedded in the model", names.len());
                names
            }
            None => match labels_config {
                Some(labels_config) => ClassNames::load(labels_config)?,
                None => {
                    return Err("model carries no class names and no labels file is configured".into())
                }
            },
        };

        tracing::info!(
            "Created {} ONNX sessions on {} for {:?}",
            num_instances,
            provider.as_str(),
            model_config.get_path()
        );

        let service = Self {
            sessions: Arc::new(sessions.into_iter().map(|s| Arc::new(Mutex::new(s))).collect()),
            counter: Arc::new(AtomicUsize::new(0)),
            names: Arc::new(names),
            post_processing: PostProcessing::from(model_config),
        };

        let size = INFERENCE_SIZE as usize;
        let warmup = service.run_inference(&Array::zeros((1, 3, size, size)))?;
        check_class_count(warmup.shape(), &service.names)?;

        Ok(service)
    }

    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ArrayD<f32>, PredictError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| PredictError::Inference(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Handling request with session {}", index);
        let tensor_ref = TensorRef::from_array_view(input.view())?;
        let outputs = session.run(ort::inputs![tensor_ref])?;

        let output = outputs.get(OUTPUT_NAME).ok_or_else(|| {
            PredictError::Shape(format!("model has no `{}` output", OUTPUT_NAME))
        })?;
        let (shape, data) = output.try_extract_tensor::<f32>()?;

        ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| PredictError::Shape(format!("invalid tensor shape: {}", e)))
    }

    #[instrument(skip(self, image))]
    fn detect(&self, image: &RgbImage, inference_size: u32) -> Result<Vec<Detection>, PredictError> {
        let (input, letterbox) = letterbox(image, inference_size)?;
        let output = self.run_inference(&input)?;
        let detections = extract_detections(output.view(), &letterbox, &self.post_processing)?;
        tracing::debug!("Model reported {} detections", detections.len());
        Ok(detections)
    }
}

#[async_trait]
impl ModelService for OrtModelService {
    async fn predict(
        &self,
        image: RgbImage,
        inference_size: u32,
    ) -> Result<DetectionResult, PredictError> {
        let service = self.clone();
        let detections =
            tokio::task::spawn_blocking(move || service.detect(&image, inference_size)).await??;

        Ok(DetectionResult {
            names: self.names.clone(),
            detections,
        })
    }
}
