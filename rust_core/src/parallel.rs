use crate::error::{Error, Result};
use rayon::prelude::*;

/// Evaluate `f` for every row index, results in row order.
///
/// `num_processes <= 1` runs in the calling thread; otherwise the rows are
/// fanned out over a dedicated pool of that size.
pub(crate) fn map_rows<T, F>(n_rows: usize, num_processes: usize, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    if num_processes <= 1 {
        return Ok((0..n_rows).map(f).collect());
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_processes)
        .build()
        .map_err(|e| Error::ThreadPool(format!("failed to create thread pool: {e}")))?;
    Ok(pool.install(|| (0..n_rows).into_par_iter().map(&f).collect()))
}
