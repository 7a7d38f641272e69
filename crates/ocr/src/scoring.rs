use std::collections::HashSet;

use crate::config::ScoringWeights;

/// A usable transcription competing in the vote.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub text: &'a str,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ballot {
    /// Position of the winner in the candidate slice.
    pub winner: usize,
    /// One score per candidate, in input order.
    pub scores: Vec<f32>,
}

/// Lowercased distinct words of a transcription.
pub fn vocabulary(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Shared distinct words over all distinct words of the pair.
pub fn overlap(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

/// Score every candidate with `weights` and pick the best.
///
/// `score = w.confidence * confidence + w.length * normalized_length + w.agreement * agreement`,
/// each term on a 0–100 scale. Agreement is the mean vocabulary overlap with
/// the other candidates, so a lone candidate agrees with nobody. Ties go to
/// the longer text, then to the earlier candidate.
pub fn select(candidates: &[Candidate<'_>], weights: &ScoringWeights) -> Option<Ballot> {
    if candidates.is_empty() {
        return None;
    }
    let vocabularies: Vec<_> = candidates.iter().map(|c| vocabulary(c.text)).collect();
    let lengths: Vec<usize> = candidates.iter().map(|c| c.text.trim().chars().count()).collect();
    let longest = lengths.iter().copied().max().unwrap_or(0).max(1) as f32;

    let scores: Vec<f32> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let agreement = if candidates.len() > 1 {
                let total: f32 = (0..candidates.len())
                    .filter(|&j| j != i)
                    .map(|j| overlap(&vocabularies[i], &vocabularies[j]))
                    .sum();
                total / (candidates.len() - 1) as f32
            } else {
                0.0
            };
            let length = lengths[i] as f32 / longest;
            weights.confidence * c.confidence.clamp(0.0, 100.0)
                + weights.length * length * 100.0
                + weights.agreement * agreement * 100.0
        })
        .collect();

    let mut winner = 0;
    for i in 1..candidates.len() {
        let better = scores[i] > scores[winner]
            || (scores[i] == scores[winner] && lengths[i] > lengths[winner]);
        if better {
            winner = i;
        }
    }
    Some(Ballot { winner, scores })
}
