//! Macros wrapping [`crate::performance::PerformanceSpan`].

/// Create a performance span, optionally recording fields on an entered
/// `tracing` span.
///
/// ```rust
/// use decon_tracing::perf_span;
///
/// {
///     let _span = perf_span!("stage_tile", subvolume = 3, voxels = 65_536);
///     // ... staging ...
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let perf = $crate::performance::PerformanceSpan::new($name, None);
        $crate::tracing::debug!(name = $name, $($field = $value),+, "performance_span_start");
        perf
    }};
}

/// Time a block, returning `(result, duration_us)`.
///
/// ```rust
/// use decon_tracing::timed_block;
///
/// let (sum, duration_us) = timed_block!("sum", { (1..=10).sum::<i32>() });
/// assert_eq!(sum, 55);
/// # let _ = duration_us;
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = ::std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        $crate::tracing::trace!(operation = $name, duration_us = duration_us, "timed_block_complete");
        (result, duration_us)
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn perf_span_with_fields() {
        let span = perf_span!("iterate_tile", subvolume = 1, iteration = 4);
        assert_eq!(span.name(), "iterate_tile");
    }

    #[test]
    fn timed_block_returns_value() {
        let (value, _duration_us) = timed_block!("answer", { 6 * 7 });
        assert_eq!(value, 42);
    }
}
