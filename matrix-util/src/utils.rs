/// Generate minibatch intervals
/// * `ntot` - number of total samples
/// * `batch_size` - the size of each batch
pub fn generate_minibatch_intervals(ntot: usize, batch_size: usize) -> Vec<(usize, usize)> {
    let num_batches = ntot.div_ceil(batch_size);
    (0..num_batches)
        .map(|b| {
            let lb: usize = b * batch_size;
            let ub: usize = ((b + 1) * batch_size).min(ntot);
            (lb, ub)
        })
        .collect::<Vec<_>>()
}

/// Size of each contiguous block when `ntot` elements are split
/// into at most `num_parts` blocks (never zero)
pub fn partition_block_size(ntot: usize, num_parts: usize) -> usize {
    ntot.div_ceil(num_parts.max(1)).max(1)
}

/// Split `0..ntot` into at most `num_parts` contiguous, disjoint
/// intervals of (nearly) equal length
/// * `ntot` - number of total elements
/// * `num_parts` - number of workers sharing the elements
pub fn partition_intervals(ntot: usize, num_parts: usize) -> Vec<(usize, usize)> {
    generate_minibatch_intervals(ntot, partition_block_size(ntot, num_parts))
}
