//! Greedy, order-preserving partitioning of chunks under a token budget.

/// Characters per token used for budget estimates. Conservative on purpose:
/// overestimating only makes bins smaller.
pub const APPROX_CHARS_PER_TOKEN: usize = 1;

pub const DEFAULT_MAX_TOKENS_PER_BATCH: usize = 8000;

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(APPROX_CHARS_PER_TOKEN)
}

/// Partition `items` into bins whose summed estimate stays within `max_tokens`.
///
/// An item whose own estimate exceeds the budget is emitted as a singleton bin.
/// Bin order and the order inside each bin match the input order.
pub fn build_batches<T>(
    items: impl IntoIterator<Item = T>,
    max_tokens: usize,
    estimate: impl Fn(&T) -> usize,
) -> Vec<Vec<T>> {
    let mut batches = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut current_tokens = 0usize;

    for item in items {
        let tokens = estimate(&item);
        if !current.is_empty() && current_tokens + tokens > max_tokens {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        if current.is_empty() && tokens > max_tokens {
            batches.push(vec![item]);
            continue;
        }
        current.push(item);
        current_tokens += tokens;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
