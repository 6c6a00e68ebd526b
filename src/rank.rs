//! Final total ordering over scored metrics

use crate::types::Metric;
use std::cmp::Ordering;

/// Sort metrics for display: strongest prefix match first, then most
/// recently accepted, most frequent in the buffer, smallest edit
/// distance, largest weight adjust. The sort is stable, so full ties keep
/// their arrival order.
pub fn rank(metrics: &mut [Metric]) {
    metrics.sort_by(compare);
}

// recency 0 means "never inserted"; those order after every inserted key
// rather than ahead of all of them.
fn recency_key(metric: &Metric) -> u32 {
    match metric.weight.recency {
        0 => u32::MAX,
        rank => rank,
    }
}

fn compare(a: &Metric, b: &Metric) -> Ordering {
    b.weight
        .prefix_matches
        .cmp(&a.weight.prefix_matches)
        .then_with(|| recency_key(a).cmp(&recency_key(b)))
        .then_with(|| b.weight.proximity.cmp(&a.weight.proximity))
        .then_with(|| a.weight.edit_distance.cmp(&b.weight.edit_distance))
        .then_with(|| b.weight_adjust.total_cmp(&a.weight_adjust))
}
