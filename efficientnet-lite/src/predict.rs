use std::fmt;
use std::path::Path;

use anyhow::Context;
use tract_nnef::internal::*;

#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub class: usize,
    pub score: f32,
    pub label: Option<String>,
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{:>4} {:.5} {}", self.class, self.score, label),
            None => write!(f, "{:>4} {:.5}", self.class, self.score),
        }
    }
}

/// Best `k` classes of the first batch row of a `[batch, classes]` output,
/// highest score first, ties broken by class index.
pub fn top_k(output: &Tensor, k: usize) -> TractResult<Vec<Prediction>> {
    let view = output.to_array_view::<f32>()?;
    if view.ndim() != 2 || view.shape()[0] == 0 {
        bail!("Expected a [batch, classes] output, got {:?}", view.shape());
    }
    let row = view.index_axis(tract_ndarray::Axis(0), 0);
    let mut scores: Vec<(usize, f32)> = row.iter().copied().enumerate().collect();
    scores.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    Ok(scores
        .into_iter()
        .take(k)
        .map(|(class, score)| Prediction { class, score, label: None })
        .collect())
}

/// One label per line.
pub fn load_labels(path: impl AsRef<Path>) -> TractResult<Vec<String>> {
    let path = path.as_ref();
    let text = fs_err::read_to_string(path).with_context(|| format!("Reading labels {path:?}"))?;
    Ok(text.lines().map(|s| s.trim().to_string()).collect())
}

pub fn with_labels(predictions: Vec<Prediction>, labels: &[String]) -> Vec<Prediction> {
    predictions
        .into_iter()
        .map(|p| Prediction { label: labels.get(p.class).cloned(), ..p })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_k_orders_scores() -> TractResult<()> {
        let output = tensor2(&[[0.1f32, 0.5, 0.2, 0.5, 0.0]]);
        let best: Vec<usize> = top_k(&output, 3)?.iter().map(|p| p.class).collect();
        assert_eq!(best, vec![1, 3, 2]);
        assert_eq!(top_k(&output, 10)?.len(), 5);
        Ok(())
    }

    #[test]
    fn top_k_rejects_bad_rank() {
        assert!(top_k(&tensor1(&[1f32, 2.]), 1).is_err());
    }

    #[test]
    fn labels_attach_by_index() -> TractResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("labels.txt");
        std::fs::write(&path, "background\ngiant panda\n")?;
        let labels = load_labels(&path)?;
        let preds = with_labels(top_k(&tensor2(&[[0.2f32, 0.7, 0.1]]), 3)?, &labels);
        assert_eq!(preds[0].label.as_deref(), Some("giant panda"));
        assert_eq!(preds[1].label.as_deref(), Some("background"));
        assert_eq!(preds[2].label, None);
        assert!(preds[0].to_string().ends_with("giant panda"));
        Ok(())
    }
}
