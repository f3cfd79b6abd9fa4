//! Resolves a step's target description against detected elements.
//!
//! Scores combine text similarity (exact, containment, edit distance) with
//! type compatibility and an optional proximity bonus. Resolution is
//! conservative: near-ties are reported as ambiguous instead of picked.

use crate::agent_engine::state::Step;
use crate::config::ExecutorConfig;
use crate::perception::types::{DetectedElement, ElementType, Point};

const TYPE_BONUS: f32 = 0.1;
const PROXIMITY_BONUS: f32 = 0.1;
const PROXIMITY_RADIUS_PX: f32 = 200.0;
/// Score for a type-only target (e.g. "the button") against an element of that type.
const TYPE_ONLY_SCORE: f32 = 0.7;

const ARTICLES: &[&str] = &["the", "a", "an"];

/// A normalized target description.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetQuery {
    pub text: String,
    pub element_type: Option<ElementType>,
    pub near: Option<Point>,
}

impl TargetQuery {
    /// Trailing type words ("Run button", "address bar") become the type hint.
    pub fn parse(description: &str) -> Self {
        let normalized = normalize(description);
        let mut words: Vec<&str> = normalized
            .split(' ')
            .filter(|w| !w.is_empty() && !ARTICLES.contains(w))
            .collect();

        let mut element_type = None;
        if words.len() > 1 {
            if let Some(t) = words.last().and_then(|w| ElementType::from_label(w)) {
                element_type = Some(t);
                words.pop();
            }
        } else if let Some(t) = words.first().and_then(|w| ElementType::from_label(w)) {
            element_type = Some(t);
            words.clear();
        }

        Self {
            text: words.join(" "),
            element_type,
            near: None,
        }
    }

    /// `None` when the step names no target.
    pub fn from_step(step: &Step) -> Option<Self> {
        let mut query = Self::parse(step.target_description.as_deref()?);
        if let Some(hint) = &step.hint {
            if hint.element_type.is_some() {
                query.element_type = hint.element_type;
            }
            query.near = hint.near;
        }
        if query.text.is_empty() && query.element_type.is_none() {
            return None;
        }
        Some(query)
    }
}

#[derive(Debug, Clone)]
pub struct Scored<'a> {
    pub element: &'a DetectedElement,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub enum MatchResult<'a> {
    NoMatch,
    Unique(&'a DetectedElement),
    /// Best first.
    Ambiguous(Vec<DetectedElement>),
}

#[derive(Debug, Clone, Copy)]
pub struct Matcher {
    min_similarity: f32,
    ambiguity_margin: f32,
}

impl Matcher {
    pub fn new(min_similarity: f32, ambiguity_margin: f32) -> Self {
        Self {
            min_similarity,
            ambiguity_margin,
        }
    }

    pub fn from_config(cfg: &ExecutorConfig) -> Self {
        Self::new(cfg.min_similarity, cfg.ambiguity_margin)
    }

    pub fn score(&self, query: &TargetQuery, element: &DetectedElement) -> f32 {
        let mut score = if query.text.is_empty() {
            match query.element_type {
                Some(t) if t == element.element_type => TYPE_ONLY_SCORE,
                _ => 0.0,
            }
        } else {
            let sim = text_similarity(&query.text, &normalize(&element.text));
            sim + type_adjustment(query.element_type, element.element_type)
        };

        if let Some(anchor) = query.near {
            let d = anchor.distance(&element.center());
            score += PROXIMITY_BONUS * (1.0 - d / PROXIMITY_RADIUS_PX).max(0.0);
        }
        score
    }

    /// Elements clearing the similarity threshold, best first.
    pub fn rank<'a>(&self, query: &TargetQuery, elements: &'a [DetectedElement]) -> Vec<Scored<'a>> {
        let mut ranked: Vec<Scored<'a>> = elements
            .iter()
            .map(|element| Scored {
                element,
                score: self.score(query, element),
            })
            .filter(|s| s.score >= self.min_similarity)
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.element.confidence.total_cmp(&a.element.confidence))
        });
        ranked
    }

    pub fn resolve<'a>(&self, query: &TargetQuery, elements: &'a [DetectedElement]) -> MatchResult<'a> {
        let ranked = self.rank(query, elements);
        let Some(best) = ranked.first() else {
            return MatchResult::NoMatch;
        };
        let tied: Vec<&Scored<'a>> = ranked
            .iter()
            .filter(|s| best.score - s.score <= self.ambiguity_margin)
            .collect();
        if tied.len() > 1 {
            tracing::debug!(
                query = %query.text,
                candidates = tied.len(),
                best = best.score,
                "ambiguous target"
            );
            return MatchResult::Ambiguous(tied.iter().map(|s| s.element.clone()).collect());
        }
        tracing::debug!(query = %query.text, text = %best.element.text, score = best.score, "target resolved");
        MatchResult::Unique(best.element)
    }
}

fn type_adjustment(wanted: Option<ElementType>, actual: ElementType) -> f32 {
    match wanted {
        Some(t) if t == actual => TYPE_BONUS,
        Some(_) if actual != ElementType::Unknown => -TYPE_BONUS,
        _ => 0.0,
    }
}

/// Lowercase, punctuation to spaces, single-spaced.
pub fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Similarity of two normalized strings in [0, 1].
pub fn text_similarity(a: &str, b: &str) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let (la, lb) = (a.chars().count(), b.chars().count());
    let longest = la.max(lb) as f32;

    let containment = if a.contains(b) || b.contains(a) {
        0.4 + 0.5 * la.min(lb) as f32 / longest
    } else {
        0.0
    };
    let edit = 1.0 - levenshtein(a, b) as f32 / longest;
    containment.max(edit)
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}
