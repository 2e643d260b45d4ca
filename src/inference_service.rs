use crate::{error::PredictError, model_service::ModelService};
use image::RgbImage;
use std::{collections::HashSet, sync::Arc};
use tracing::instrument;

/// Longest image side handed to the detector.
pub const INFERENCE_SIZE: u32 = 640;

#[derive(Debug)]
pub struct InferenceService<M: ModelService> {
    model_service: Arc<M>,
}

impl<M: ModelService> Clone for InferenceService<M> {
    fn clone(&self) -> Self {
        Self {
            model_service: self.model_service.clone(),
        }
    }
}

impl<M: ModelService> InferenceService<M> {
    pub fn new(model_service: M) -> Self {
        Self {
            model_service: Arc::new(model_service),
        }
    }

    /// Turns an encoded image into the distinct labels detected in it, in the
    /// order the detector first reported each class.
    #[instrument(skip(self, image_data), fields(bytes = image_data.len()))]
    pub async fn predict(&self, image_data: &[u8]) -> Result<Vec<String>, PredictError> {
        let image = decode_image(image_data)?;
        let result = self.model_service.predict(image, INFERENCE_SIZE).await?;

        tracing::debug!("Detector returned {} detections", result.detections.len());
        for (i, detection) in result.detections.iter().enumerate() {
            tracing::debug!(
                "Detection {}: class_id={}, confidence={:.3}, bbox=({:.1}, {:.1}, {:.1}, {:.1})",
                i,
                detection.class_id,
                detection.confidence,
                detection.bbox.x1,
                detection.bbox.y1,
                detection.bbox.x2,
                detection.bbox.y2
            );
        }

        if result.detections.is_empty() {
            return Ok(Vec::new());
        }

        let labels = result
            .class_ids()
            .map(|class_id| {
                result.names.get(class_id).ok_or_else(|| {
                    PredictError::Shape(format!(
                        "class id {} is not in the class name table ({} classes)",
                        class_id,
                        result.names.len()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(unique_labels(labels))
    }
}

fn decode_image(image_data: &[u8]) -> Result<RgbImage, PredictError> {
    let image = image::ImageReader::new(std::io::Cursor::new(image_data))
        .with_guessed_format()
        .map_err(|e| PredictError::Decode(e.to_string()))?
        .decode()?;

    Ok(image.to_rgb8())
}

/// Drops repeated labels, keeping the first occurrence of each.
pub fn unique_labels<'a>(labels: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    labels
        .into_iter()
        .filter(|&label| seen.insert(label))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        detection::{BoundingBox, Detection, DetectionResult},
        labels::ClassNames,
    };
    use async_trait::async_trait;
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Detector that reports a fixed list of class-ids for any image.
    pub(crate) struct MockModelService {
        pub(crate) names: Arc<ClassNames>,
        pub(crate) class_ids: Vec<usize>,
        pub(crate) calls: AtomicUsize,
    }

    impl MockModelService {
        pub(crate) fn new(names: &[&str], class_ids: &[usize]) -> Self {
            Self {
                names: Arc::new(names.iter().copied().collect()),
                class_ids: class_ids.to_vec(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelService for MockModelService {
        async fn predict(
            &self,
            image: RgbImage,
            inference_size: u32,
        ) -> Result<DetectionResult, PredictError> {
            assert_eq!(inference_size, INFERENCE_SIZE);
            assert!(image.width() > 0 && image.height() > 0);
            self.calls.fetch_add(1, Ordering::SeqCst);

            let detections = self
                .class_ids
                .iter()
                .enumerate()
                .map(|(i, &class_id)| Detection {
                    class_id,
                    // lowest confidence first, so any reordering would show
                    confidence: 0.3 + 0.1 * i as f32,
                    bbox: BoundingBox {
                        x1: 10.0,
                        y1: 20.0,
                        x2: 100.0,
                        y2: 150.0,
                    },
                })
                .collect();

            Ok(DetectionResult {
                names: self.names.clone(),
                detections,
            })
        }
    }

    struct FailingModelService;

    #[async_trait]
    impl ModelService for FailingModelService {
        async fn predict(&self, _: RgbImage, _: u32) -> Result<DetectionResult, PredictError> {
            Err(PredictError::Inference("out of memory".to_string()))
        }
    }

    pub(crate) fn png_bytes() -> Vec<u8> {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(100, 60, Rgb([255, 0, 0]));
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, image::ImageFormat::Png).unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_unique_labels_keeps_first_occurrence() {
        let labels = unique_labels(["dog", "cat", "dog", "bird"]);
        assert_eq!(labels, vec!["dog", "cat", "bird"]);
    }

    #[test]
    fn test_unique_labels_does_not_sort() {
        let labels = unique_labels(["zebra", "apple", "zebra", "mango", "apple"]);
        assert_eq!(labels, vec!["zebra", "apple", "mango"]);
    }

    #[test]
    fn test_decode_image_converts_to_rgb() {
        let img = ImageBuffer::<image::Rgba<u8>, Vec<u8>>::from_pixel(4, 3, image::Rgba([1, 2, 3, 4]));
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, image::ImageFormat::Png).unwrap();

        let decoded = decode_image(cursor.get_ref()).unwrap();
        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.get_pixel(0, 0).0, [1, 2, 3]);
    }

    #[tokio::test]
    async fn test_predict_deduplicates_in_detection_order() -> Result<(), Box<dyn std::error::Error>>
    {
        let mock = MockModelService::new(&["dog", "cat", "bird", "car"], &[0, 1, 0, 2]);
        let inference_service = InferenceService::new(mock);

        let labels = inference_service.predict(&png_bytes()).await?;
        assert_eq!(labels, vec!["dog", "cat", "bird"]);

        Ok(())
    }

    #[tokio::test]
    async fn test_predict_two_dogs_and_a_cat() -> Result<(), Box<dyn std::error::Error>> {
        let mock = MockModelService::new(&["dog", "cat"], &[0, 0, 1]);
        let inference_service = InferenceService::new(mock);

        let labels = inference_service.predict(&png_bytes()).await?;
        assert_eq!(labels, vec!["dog", "cat"]);

        Ok(())
    }

    #[tokio::test]
    async fn test_predict_without_detections() -> Result<(), Box<dyn std::error::Error>> {
        let mock = MockModelService::new(&["dog"], &[]);
        let inference_service = InferenceService::new(mock);

        let labels = inference_service.predict(&png_bytes()).await?;
        assert!(labels.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_predict_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
        let mock = MockModelService::new(&["dog", "cat", "bird"], &[2, 0, 2, 1]);
        let inference_service = InferenceService::new(mock);
        let image = png_bytes();

        let first = inference_service.predict(&image).await?;
        let second = inference_service.clone().predict(&image).await?;
        assert_eq!(first, second);
        assert_eq!(
            inference_service.model_service.calls.load(Ordering::SeqCst),
            2
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_predict_rejects_non_image_bytes() {
        let mock = MockModelService::new(&["dog"], &[0]);
        let inference_service = InferenceService::new(mock);

        for data in [Vec::new(), vec![0x13, 0x37, 0xde, 0xad, 0xbe, 0xef, 0x00, 0x42]] {
            let err = inference_service.predict(&data).await.unwrap_err();
            assert!(matches!(err, PredictError::Decode(_)));
            assert!(!err.to_string().is_empty());
        }
        assert_eq!(
            inference_service.model_service.calls.load(Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn test_predict_reports_unknown_class_id() {
        let mock = MockModelService::new(&["dog"], &[0, 5]);
        let inference_service = InferenceService::new(mock);

        let err = inference_service.predict(&png_bytes()).await.unwrap_err();
        assert!(matches!(err, PredictError::Shape(_)));
        assert!(err.to_string().contains("class id 5"));
    }

    #[tokio::test]
    async fn test_predict_surfaces_detector_failure() {
        let inference_service = InferenceService::new(FailingModelService);

        let err = inference_service.predict(&png_bytes()).await.unwrap_err();
        assert_eq!(err.to_string(), "Inference failed: out of memory");
    }
}
