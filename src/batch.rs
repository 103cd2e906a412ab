//! Token-budget batch assembly.
//!
//! Items are grouped greedily into contiguous batches whose estimated token
//! cost stays within the context budget. The estimate is a cheap length
//! heuristic, not a tokenizer.

use crate::models::Item;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.chars().count() / CHARS_PER_TOKEN).max(1)
}

/// Accumulates items and emits a batch whenever the next item would overflow.
#[derive(Debug)]
pub struct BatchAssembler {
    budget: usize,
    per_item_overhead: usize,
    current: Vec<Item>,
    used: usize,
}

impl BatchAssembler {
    pub fn new(budget: usize, per_item_overhead: usize) -> Self {
        Self {
            budget,
            per_item_overhead,
            current: Vec::new(),
            used: 0,
        }
    }

    pub fn cost(&self, item: &Item) -> usize {
        self.per_item_overhead + estimate_tokens(&item.text)
    }

    /// Add an item. Returns the completed batch if the item did not fit.
    ///
    /// An item larger than the whole budget still lands in a batch of its
    /// own, since the overflow check only applies to a non-empty batch.
    pub fn push(&mut self, item: Item) -> Option<Vec<Item>> {
        let cost = self.cost(&item);
        let flushed = if !self.current.is_empty() && self.used + cost > self.budget {
            self.take()
        } else {
            None
        };
        self.current.push(item);
        self.used += cost;
        flushed
    }

    /// Emit whatever is pending.
    pub fn finish(&mut self) -> Option<Vec<Item>> {
        self.take()
    }

    fn take(&mut self) -> Option<Vec<Item>> {
        self.used = 0;
        if self.current.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.current))
        }
    }
}

/// Split a whole item sequence into batches.
pub fn assemble_batches(
    items: impl IntoIterator<Item = Item>,
    budget: usize,
    per_item_overhead: usize,
) -> Vec<Vec<Item>> {
    let mut assembler = BatchAssembler::new(budget, per_item_overhead);
    let mut batches = Vec::new();
    for item in items {
        if let Some(batch) = assembler.push(item) {
            batches.push(batch);
        }
    }
    if let Some(batch) = assembler.finish() {
        batches.push(batch);
    }
    batches
}
