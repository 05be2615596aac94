use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::Serialize;

/// The two outcomes the model distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Label {
    #[serde(rename = "Neither")]
    Neither,
    #[serde(rename = "Hate/Offensive")]
    HateOffensive,
}

impl Label {
    /// Class 0 is `Neither`; every other class index reads as `Hate/Offensive`.
    pub fn from_class_index(index: usize) -> Self {
        if index == 0 {
            Self::Neither
        } else {
            Self::HateOffensive
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Neither => "Neither",
            Self::HateOffensive => "Hate/Offensive",
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one forward pass over one text.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: Label,
    /// Probability of `label`, in [0, 1].
    pub confidence: f32,
    /// Full softmax distribution, indexed by class.
    pub probs: Vec<f32>,
}

impl Classification {
    /// Picks the argmax class. Ties resolve to the lowest index.
    pub fn from_probs(probs: Vec<f32>) -> Result<Self> {
        let Some((index, &confidence)) = probs
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, &f32)>, (i, p)| match best {
                Some((_, bp)) if bp >= p => best,
                _ => Some((i, p)),
            })
        else {
            bail!("Model returned an empty probability distribution");
        };

        Ok(Self {
            label: Label::from_class_index(index),
            confidence,
            probs,
        })
    }
}

#[async_trait]
pub trait Classifier {
    async fn classify(&self, text: String) -> Result<Classification>;
}

#[async_trait]
pub trait BatchedClassifier: Send + Sync {
    /// Returns one classification per input, in input order.
    async fn classify_batch(&self, texts: Vec<String>) -> Result<Vec<Classification>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_selects_label_and_confidence() {
        let c = Classification::from_probs(vec![0.27, 0.73]).unwrap();
        assert_eq!(c.label, Label::HateOffensive);
        assert_eq!(c.confidence, 0.73);

        let c = Classification::from_probs(vec![0.8, 0.2]).unwrap();
        assert_eq!(c.label, Label::Neither);
        assert_eq!(c.confidence, 0.8);
    }

    #[test]
    fn ties_prefer_first_class() {
        let c = Classification::from_probs(vec![0.5, 0.5]).unwrap();
        assert_eq!(c.label, Label::Neither);
    }

    #[test]
    fn empty_distribution_is_an_error() {
        assert!(Classification::from_probs(Vec::new()).is_err());
    }

    #[test]
    fn confidence_is_max_of_distribution() {
        let probs = vec![0.12_f32, 0.88];
        let c = Classification::from_probs(probs.clone()).unwrap();
        let max = probs.iter().cloned().fold(f32::MIN, f32::max);
        assert_eq!(c.confidence, max);
        assert!((c.probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }
}
