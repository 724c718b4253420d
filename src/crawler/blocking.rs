use anyhow::{Result, Context};
use regex::{RegexSet, RegexSetBuilder};
use std::collections::HashSet;

/// Heuristic classification of anti-bot rejections
pub struct BlockDetector {
    statuses: HashSet<u16>,
    phrases: Vec<String>,
    indicators: RegexSet,
}

/// Why a response was considered blocked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSignal {
    Status(u16),
    Indicator(String),
}

impl BlockDetector {
    /// Build a detector from blocked statuses and case-insensitive phrases
    pub fn new(statuses: &[u16], phrases: &[String]) -> Result<Self> {
        let phrases: Vec<String> = phrases.iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        let indicators = RegexSetBuilder::new(phrases.iter().map(|p| regex::escape(p)))
            .case_insensitive(true)
            .build()
            .context("Failed to compile block indicator phrases")?;

        Ok(Self {
            statuses: statuses.iter().copied().collect(),
            phrases,
            indicators,
        })
    }

    /// Classify a response. Status wins over body content.
    pub fn detect(&self, status: u16, body: &str) -> Option<BlockSignal> {
        if self.statuses.contains(&status) {
            return Some(BlockSignal::Status(status));
        }

        self.indicators
            .matches(body)
            .iter()
            .next()
            .map(|idx| BlockSignal::Indicator(self.phrases[idx].clone()))
    }
}
