//! Merging of vector and keyword hit lists.
//!
//! Fusion is a pure function of two ranked lists, so hybrid results are
//! deterministic for identical backend outputs.
//!
//! # Methods
//!
//! | Method | Fused score |
//! |--------|-------------|
//! | [`Rrf`](FusionMethod::Rrf) | `1/(k + r_v) + 1/(k + r_k)`, absent ranks contribute 0 |
//! | [`Weighted`](FusionMethod::Weighted) | `w_v · s_v + w_k · s_k`, absent scores are 0 |
//! | [`Linear`](FusionMethod::Linear) | same as weighted |
//!
//! Ranks are one-based list positions. A chunk present in both lists is
//! tagged [`HitSource::Hybrid`]; otherwise it keeps its original tag.
//! Output is sorted by descending fused score, ties broken by chunk id.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::models::{HitSource, SearchHit};

/// Default RRF constant.
pub const DEFAULT_RRF_K: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionMethod {
    #[default]
    Rrf,
    Weighted,
    Linear,
}

impl FusionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            FusionMethod::Rrf => "rrf",
            FusionMethod::Weighted => "weighted",
            FusionMethod::Linear => "linear",
        }
    }
}

impl fmt::Display for FusionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FusionMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rrf" => Ok(FusionMethod::Rrf),
            "weighted" => Ok(FusionMethod::Weighted),
            "linear" => Ok(FusionMethod::Linear),
            other => bail!(
                "unknown fusion method '{}' (expected rrf, weighted, or linear)",
                other
            ),
        }
    }
}

/// Merges a vector hit list and a keyword hit list.
pub trait Fuser: Send + Sync {
    fn method(&self) -> FusionMethod;

    fn fuse(&self, vector: &[SearchHit], keyword: &[SearchHit]) -> Vec<SearchHit>;
}

/// Reciprocal Rank Fusion.
#[derive(Debug, Clone)]
pub struct RrfFuser {
    pub k: f64,
}

impl Default for RrfFuser {
    fn default() -> Self {
        Self { k: DEFAULT_RRF_K }
    }
}

impl Fuser for RrfFuser {
    fn method(&self) -> FusionMethod {
        FusionMethod::Rrf
    }

    fn fuse(&self, vector: &[SearchHit], keyword: &[SearchHit]) -> Vec<SearchHit> {
        let k = self.k;
        merge(vector, keyword, |m| {
            m.vector_rank.map(|r| 1.0 / (k + r as f64)).unwrap_or(0.0)
                + m.keyword_rank.map(|r| 1.0 / (k + r as f64)).unwrap_or(0.0)
        })
    }
}

/// Weighted sum of raw scores.
#[derive(Debug, Clone)]
pub struct WeightedFuser {
    pub vector_weight: f64,
    pub keyword_weight: f64,
}

impl Fuser for WeightedFuser {
    fn method(&self) -> FusionMethod {
        FusionMethod::Weighted
    }

    fn fuse(&self, vector: &[SearchHit], keyword: &[SearchHit]) -> Vec<SearchHit> {
        let (wv, wk) = (self.vector_weight, self.keyword_weight);
        merge(vector, keyword, |m| {
            wv * m.vector_score.unwrap_or(0.0) + wk * m.keyword_score.unwrap_or(0.0)
        })
    }
}

/// Linear combination; scores are not normalised yet, so this matches
/// [`WeightedFuser`].
#[derive(Debug, Clone)]
pub struct LinearFuser {
    inner: WeightedFuser,
}

impl LinearFuser {
    pub fn new(vector_weight: f64, keyword_weight: f64) -> Self {
        Self {
            inner: WeightedFuser {
                vector_weight,
                keyword_weight,
            },
        }
    }
}

impl Fuser for LinearFuser {
    fn method(&self) -> FusionMethod {
        FusionMethod::Linear
    }

    fn fuse(&self, vector: &[SearchHit], keyword: &[SearchHit]) -> Vec<SearchHit> {
        self.inner.fuse(vector, keyword)
    }
}

/// Build the fuser for `method`.
pub fn fuser_for(
    method: FusionMethod,
    rrf_k: f64,
    vector_weight: f64,
    keyword_weight: f64,
) -> Box<dyn Fuser> {
    match method {
        FusionMethod::Rrf => Box::new(RrfFuser { k: rrf_k }),
        FusionMethod::Weighted => Box::new(WeightedFuser {
            vector_weight,
            keyword_weight,
        }),
        FusionMethod::Linear => Box::new(LinearFuser::new(vector_weight, keyword_weight)),
    }
}

/// Per-chunk occurrence record.
struct Membership {
    hit: SearchHit,
    vector_rank: Option<usize>,
    keyword_rank: Option<usize>,
    vector_score: Option<f64>,
    keyword_score: Option<f64>,
}

fn merge<F>(vector: &[SearchHit], keyword: &[SearchHit], score: F) -> Vec<SearchHit>
where
    F: Fn(&Membership) -> f64,
{
    let mut order: Vec<Membership> = Vec::with_capacity(vector.len() + keyword.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for (i, hit) in vector.iter().enumerate() {
        if index.contains_key(&hit.chunk_id) {
            continue;
        }
        index.insert(hit.chunk_id.clone(), order.len());
        order.push(Membership {
            hit: hit.clone(),
            vector_rank: Some(i + 1),
            keyword_rank: None,
            vector_score: Some(hit.score),
            keyword_score: None,
        });
    }

    for (i, hit) in keyword.iter().enumerate() {
        match index.get(&hit.chunk_id) {
            Some(&pos) => {
                let m = &mut order[pos];
                if m.keyword_rank.is_some() {
                    continue;
                }
                m.keyword_rank = Some(i + 1);
                m.keyword_score = Some(hit.score);
                for h in &hit.highlights {
                    if !m.hit.highlights.contains(h) {
                        m.hit.highlights.push(h.clone());
                    }
                }
            }
            None => {
                index.insert(hit.chunk_id.clone(), order.len());
                order.push(Membership {
                    hit: hit.clone(),
                    vector_rank: None,
                    keyword_rank: Some(i + 1),
                    vector_score: None,
                    keyword_score: Some(hit.score),
                });
            }
        }
    }

    let mut fused: Vec<SearchHit> = order
        .into_iter()
        .map(|m| {
            let s = score(&m);
            let mut hit = m.hit;
            hit.score = s;
            if m.vector_rank.is_some() && m.keyword_rank.is_some() {
                hit.source = HitSource::Hybrid;
            }
            hit
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    for (i, hit) in fused.iter_mut().enumerate() {
        hit.rank = i + 1;
    }
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;

    fn hits(ids: &[&str], source: HitSource) -> Vec<SearchHit> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| SearchHit {
                chunk_id: id.to_string(),
                document_id: "doc".into(),
                content: format!("content {}", id),
                score: 1.0 - i as f64 * 0.1,
                highlights: vec![],
                source,
                rank: i + 1,
                metadata: Metadata::new(),
                vector: None,
            })
            .collect()
    }

    fn score_of(list: &[SearchHit], id: &str) -> f64 {
        list.iter().find(|h| h.chunk_id == id).unwrap().score
    }

    fn score_map(list: &[SearchHit]) -> Vec<(String, f64)> {
        let mut v: Vec<(String, f64)> =
            list.iter().map(|h| (h.chunk_id.clone(), h.score)).collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        v
    }

    #[test]
    fn test_rrf_reversed_lists_tie() {
        let v = hits(&["A", "B", "C"], HitSource::Vector);
        let k = hits(&["C", "B", "A"], HitSource::Keyword);
        let fused = RrfFuser::default().fuse(&v, &k);

        let a = score_of(&fused, "A");
        let b = score_of(&fused, "B");
        let c = score_of(&fused, "C");
        assert!((a - (1.0 / 61.0 + 1.0 / 63.0)).abs() < 1e-12);
        assert!((b - 2.0 / 62.0).abs() < 1e-12);
        assert!((a - c).abs() < 1e-12);
        assert!(b < a);
        assert_eq!(fused[2].chunk_id, "B");
    }

    #[test]
    fn test_rrf_single_and_double_occurrence() {
        let v = hits(&["A", "B"], HitSource::Vector);
        let k = hits(&["X", "B"], HitSource::Keyword);
        let fused = RrfFuser::default().fuse(&v, &k);
        assert!((score_of(&fused, "B") - 2.0 / 62.0).abs() < 1e-12);
        assert!((score_of(&fused, "A") - 1.0 / 61.0).abs() < 1e-12);
        assert!((score_of(&fused, "X") - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_source_tags() {
        let v = hits(&["A", "B"], HitSource::Vector);
        let k = hits(&["B", "C"], HitSource::Keyword);
        for fuser in [
            fuser_for(FusionMethod::Rrf, 60.0, 0.5, 0.5),
            fuser_for(FusionMethod::Weighted, 60.0, 0.5, 0.5),
            fuser_for(FusionMethod::Linear, 60.0, 0.5, 0.5),
        ] {
            let fused = fuser.fuse(&v, &k);
            let tag = |id: &str| fused.iter().find(|h| h.chunk_id == id).unwrap().source;
            assert_eq!(tag("A"), HitSource::Vector);
            assert_eq!(tag("B"), HitSource::Hybrid);
            assert_eq!(tag("C"), HitSource::Keyword);
        }
    }

    #[test]
    fn test_commutative_rrf_and_weighted() {
        let v = hits(&["A", "B", "C", "D"], HitSource::Vector);
        let k = hits(&["D", "E", "A"], HitSource::Keyword);
        for fuser in [
            fuser_for(FusionMethod::Rrf, 60.0, 0.5, 0.5),
            fuser_for(FusionMethod::Weighted, 60.0, 0.5, 0.5),
        ] {
            let left = score_map(&fuser.fuse(&v, &k));
            let right = score_map(&fuser.fuse(&k, &v));
            assert_eq!(left.len(), right.len());
            for ((ida, sa), (idb, sb)) in left.iter().zip(right.iter()) {
                assert_eq!(ida, idb);
                assert!((sa - sb).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_weighted_uses_raw_scores() {
        let mut v = hits(&["A"], HitSource::Vector);
        v[0].score = 0.8;
        let mut k = hits(&["A", "B"], HitSource::Keyword);
        k[0].score = 4.0;
        k[1].score = 2.0;
        let fused = WeightedFuser {
            vector_weight: 0.7,
            keyword_weight: 0.3,
        }
        .fuse(&v, &k);
        assert!((score_of(&fused, "A") - (0.7 * 0.8 + 0.3 * 4.0)).abs() < 1e-12);
        assert!((score_of(&fused, "B") - 0.3 * 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_sorted_and_ranked() {
        let v = hits(&["A", "B", "C"], HitSource::Vector);
        let k = hits(&["C"], HitSource::Keyword);
        let fused = RrfFuser::default().fuse(&v, &k);
        assert_eq!(fused[0].chunk_id, "C");
        for w in fused.windows(2) {
            assert!(w[0].score >= w[1].score);
        }
        let ranks: Vec<usize> = fused.iter().map(|h| h.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
    }

    #[test]
    fn test_highlights_are_merged() {
        let v = hits(&["A"], HitSource::Vector);
        let mut k = hits(&["A"], HitSource::Keyword);
        k[0].highlights = vec!["...match...".into()];
        let fused = RrfFuser::default().fuse(&v, &k);
        assert_eq!(fused[0].highlights, vec!["...match...".to_string()]);
    }

    #[test]
    fn test_empty_inputs() {
        assert!(RrfFuser::default().fuse(&[], &[]).is_empty());
        let v = hits(&["A"], HitSource::Vector);
        assert_eq!(RrfFuser::default().fuse(&v, &[]).len(), 1);
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("linear".parse::<FusionMethod>().unwrap(), FusionMethod::Linear);
        assert!("borda".parse::<FusionMethod>().is_err());
    }
}
