//! Token usage and cost accounting for model calls

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tracing::debug;
use crate::common::{FusionError, Result};
use crate::model::TokenUsage;

/// Dollar prices per million tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pricing {
    pub input: f64,
    pub cache_write: f64,
    pub cache_read: f64,
    pub output: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input: 3.0,
            cache_write: 3.75,
            cache_read: 0.30,
            output: 15.0,
        }
    }
}

impl Pricing {
    pub fn validate(&self) -> Result<()> {
        let prices = [self.input, self.cache_write, self.cache_read, self.output];
        if prices.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(FusionError::config_error("prices must be finite and non-negative"));
        }
        Ok(())
    }
}

/// Cache reads as a percentage of all input tokens
pub fn cache_hit_ratio(input_tokens: u64, cache_read: u64) -> f64 {
    let total = input_tokens + cache_read;
    if total == 0 {
        0.0
    } else {
        cache_read as f64 / total as f64 * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkMetric {
    pub chunk_id: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub cache_hit_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostBreakdown {
    pub input: f64,
    pub cache_write: f64,
    pub cache_read: f64,
    pub output: f64,
    pub total: f64,
    /// Cost if every cached token had been billed as plain input
    pub without_caching: f64,
    pub savings: f64,
    pub savings_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    pub chunks_analyzed: usize,
    pub totals: TokenUsage,
    pub grand_total_tokens: u64,
    pub overall_cache_hit_ratio: f64,
    pub cost: CostBreakdown,
    pub per_chunk: Vec<ChunkMetric>,
}

impl UsageReport {
    /// Multi-line summary with a per-chunk table
    pub fn render(&self) -> String {
        let t = &self.totals;
        let c = &self.cost;
        let mut out = String::new();

        let _ = writeln!(out, "Token usage:");
        let _ = writeln!(out, "  chunks analyzed:    {}", self.chunks_analyzed);
        let _ = writeln!(out, "  input tokens:       {}", t.input_tokens);
        let _ = writeln!(out, "  output tokens:      {}", t.output_tokens);
        let _ = writeln!(out, "  cache write tokens: {}", t.cache_creation_input_tokens);
        let _ = writeln!(out, "  cache read tokens:  {}", t.cache_read_input_tokens);
        let _ = writeln!(out, "  cache hit ratio:    {:.1}%", self.overall_cache_hit_ratio);
        let _ = writeln!(out, "  grand total:        {}", self.grand_total_tokens);
        let _ = writeln!(out, "Estimated cost:");
        let _ = writeln!(out, "  input ${:.4}  cache write ${:.4}  cache read ${:.4}  output ${:.4}", c.input, c.cache_write, c.cache_read, c.output);
        let _ = writeln!(out, "  total ${:.4}  without caching ${:.4}  saved ${:.4} ({:.1}%)", c.total, c.without_caching, c.savings, c.savings_percent);
        let _ = writeln!(out, "  {:<8}{:<10}{:<10}{:<10}{:<10}{:<8}", "Chunk", "Input", "Output", "Cache R", "Cache W", "Hit %");
        for m in &self.per_chunk {
            let _ = writeln!(
                out,
                "  {:<8}{:<10}{:<10}{:<10}{:<10}{:<8.1}",
                m.chunk_id, m.input_tokens, m.output_tokens, m.cache_read, m.cache_write, m.cache_hit_ratio
            );
        }
        out
    }
}

/// Running token totals plus per-chunk history
#[derive(Debug, Clone, Default)]
pub struct UsageTracker {
    totals: TokenUsage,
    chunks: Vec<ChunkMetric>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the usage of one chunk call
    pub fn record(&mut self, chunk_id: u32, usage: &TokenUsage) -> ChunkMetric {
        self.add(usage);
        let metric = ChunkMetric {
            chunk_id,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read: usage.cache_read_input_tokens,
            cache_write: usage.cache_creation_input_tokens,
            cache_hit_ratio: cache_hit_ratio(usage.input_tokens, usage.cache_read_input_tokens),
        };
        debug!(
            "Usage for chunk {}: {} in, {} out, {} cache read, {} cache write ({:.1}% hit)",
            chunk_id, metric.input_tokens, metric.output_tokens, metric.cache_read, metric.cache_write, metric.cache_hit_ratio
        );
        self.chunks.push(metric.clone());
        metric
    }

    /// Add usage that does not belong to a chunk (e.g. the final summary)
    pub fn add(&mut self, usage: &TokenUsage) {
        self.totals.input_tokens += usage.input_tokens;
        self.totals.output_tokens += usage.output_tokens;
        self.totals.cache_read_input_tokens += usage.cache_read_input_tokens;
        self.totals.cache_creation_input_tokens += usage.cache_creation_input_tokens;
    }

    pub fn totals(&self) -> TokenUsage {
        self.totals
    }

    pub fn chunk_metrics(&self) -> &[ChunkMetric] {
        &self.chunks
    }

    pub fn report(&self, pricing: &Pricing) -> UsageReport {
        let t = &self.totals;
        let per_million = |tokens: u64, price: f64| tokens as f64 / 1_000_000.0 * price;

        let input = per_million(t.input_tokens, pricing.input);
        let cache_write = per_million(t.cache_creation_input_tokens, pricing.cache_write);
        let cache_read = per_million(t.cache_read_input_tokens, pricing.cache_read);
        let output = per_million(t.output_tokens, pricing.output);
        let total = input + cache_write + cache_read + output;

        let all_input = t.input_tokens + t.cache_read_input_tokens + t.cache_creation_input_tokens;
        let without_caching = per_million(all_input, pricing.input) + output;
        let savings = without_caching - total;
        let savings_percent = if without_caching > 0.0 { savings / without_caching * 100.0 } else { 0.0 };

        UsageReport {
            chunks_analyzed: self.chunks.len(),
            totals: *t,
            grand_total_tokens: t.total(),
            overall_cache_hit_ratio: cache_hit_ratio(t.input_tokens, t.cache_read_input_tokens),
            cost: CostBreakdown {
                input,
                cache_write,
                cache_read,
                output,
                total,
                without_caching,
                savings,
                savings_percent,
            },
            per_chunk: self.chunks.clone(),
        }
    }
}
