//! Built-in processing functions.
//!
//! Both work on the raw image bytes shipped in each [`WorkItem`] and need
//! no model files, so a worker can run them anywhere.

use anyhow::Result;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::models::{ResultItem, WorkBatch};
use crate::preprocess::{decode_image, format_name};
use crate::tasks::{ProcessContext, ProcessingFunction, TaskDescriptor, TaskRegistry};

pub fn register_builtin(registry: &mut TaskRegistry) {
    registry.register_processor("image_stats", image_stats);
    registry.register_processor("byte_histogram", byte_histogram);
}

fn image_stats(_task: &TaskDescriptor) -> Result<Box<dyn ProcessingFunction>> {
    Ok(Box::new(ImageStats))
}

fn byte_histogram(_task: &TaskDescriptor) -> Result<Box<dyn ProcessingFunction>> {
    Ok(Box::new(ByteHistogram::new(16)))
}

/// Container format, pixel size, byte size and SHA-256 of each image.
pub struct ImageStats;

impl ProcessingFunction for ImageStats {
    fn name(&self) -> &str {
        "image_stats"
    }

    fn process(&mut self, batch: &WorkBatch, _ctx: &ProcessContext) -> Result<Vec<ResultItem>> {
        let mut out = Vec::with_capacity(batch.len());
        for item in &batch.items {
            let (format, img) = match decode_image(&item.data) {
                Ok(decoded) => decoded,
                Err(e) => {
                    debug!(id = %item.id, error = %e, "dropping item");
                    continue;
                }
            };
            let mut fields = Map::new();
            fields.insert("format".into(), json!(format_name(format)));
            fields.insert("width".into(), json!(img.width()));
            fields.insert("height".into(), json!(img.height()));
            fields.insert("bytes".into(), json!(item.data.len()));
            fields.insert("sha256".into(), json!(hex::encode(Sha256::digest(&item.data))));
            out.push(ResultItem::new(item.id.clone(), fields));
        }
        Ok(out)
    }
}

/// Normalized byte-value histogram as a vector, scored by its entropy.
///
/// `image_vectors` holds one vector per item (the shape the vector store
/// reads); `score` is the Shannon entropy scaled into `[0, 1]`.
pub struct ByteHistogram {
    bins: usize,
}

impl ByteHistogram {
    pub fn new(bins: usize) -> Self {
        Self {
            bins: bins.clamp(1, 256),
        }
    }

    fn histogram(&self, data: &[u8]) -> Vec<f32> {
        let mut counts = vec![0u64; self.bins];
        for &b in data {
            counts[b as usize * self.bins / 256] += 1;
        }
        let total = data.len().max(1) as f32;
        counts.into_iter().map(|c| c as f32 / total).collect()
    }
}

fn normalized_entropy(hist: &[f32]) -> f64 {
    if hist.len() < 2 {
        return 0.0;
    }
    let h: f64 = hist
        .iter()
        .filter(|&&p| p > 0.0)
        .map(|&p| {
            let p = p as f64;
            -p * p.log2()
        })
        .sum();
    h / (hist.len() as f64).log2()
}

impl ProcessingFunction for ByteHistogram {
    fn name(&self) -> &str {
        "byte_histogram"
    }

    fn process(&mut self, batch: &WorkBatch, _ctx: &ProcessContext) -> Result<Vec<ResultItem>> {
        Ok(batch
            .items
            .iter()
            .filter(|item| !item.data.is_empty())
            .map(|item| {
                let hist = self.histogram(&item.data);
                let mut fields = Map::new();
                fields.insert("score".into(), json!(normalized_entropy(&hist)));
                fields.insert("image_vectors".into(), Value::Array(vec![json!(hist)]));
                ResultItem::new(item.id.clone(), fields)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkItem;
    use crate::preprocess::tests::tiny_png;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ProcessContext {
        let reg = TaskRegistry::with_builtins();
        ProcessContext::new(reg.resolve("image_stats").unwrap(), CancellationToken::new())
    }

    fn batch(items: Vec<(&str, Vec<u8>)>) -> WorkBatch {
        WorkBatch::new(
            "image_stats",
            items
                .into_iter()
                .map(|(id, data)| WorkItem {
                    id: id.into(),
                    data,
                })
                .collect(),
        )
    }

    #[test]
    fn image_stats_drops_unrecognized_items() {
        let b = batch(vec![("src_1", tiny_png(b"abc")), ("src_2", b"junk".to_vec())]);
        let out = ImageStats.process(&b, &ctx()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "src_1");
        assert_eq!(out[0].fields["format"], "png");
        assert_eq!(out[0].fields["width"], 8);
        assert_eq!(out[0].fields["bytes"], tiny_png(b"abc").len());
        assert_eq!(out[0].fields["sha256"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn histogram_sums_to_one_and_scores_entropy() {
        let uniform: Vec<u8> = (0..=255).collect();
        let b = batch(vec![("src_1", uniform), ("src_2", vec![0; 64]), ("src_3", vec![])]);
        let out = ByteHistogram::new(16).process(&b, &ctx()).unwrap();
        assert_eq!(out.len(), 2);

        let vec = out[0].fields["image_vectors"][0].as_array().unwrap();
        assert_eq!(vec.len(), 16);
        let sum: f64 = vec.iter().map(|v| v.as_f64().unwrap()).sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!((out[0].score().unwrap() - 1.0).abs() < 1e-6);
        assert_eq!(out[1].score().unwrap(), 0.0);
    }
}
