//! Bounded per-item fan-out where one item's failure never stops the others.

use std::panic::{catch_unwind, AssertUnwindSafe};

use rayon::prelude::*;

use super::report::ItemFailure;
use crate::errors::PipelineError;

pub struct FanOut<T> {
    /// In input order
    pub succeeded: Vec<(String, T)>,
    pub failures: Vec<ItemFailure>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Runs `op` for every `(id, input)` on a pool of `workers` threads.
///
/// Errors and panics are recorded as [`ItemFailure`]s under the item id.
pub fn run_bounded<I, T, F>(
    label: &str,
    workers: usize,
    items: Vec<(String, I)>,
    op: F,
) -> Result<FanOut<T>, PipelineError>
where
    I: Send,
    T: Send,
    F: Fn(&str, I) -> Result<T, PipelineError> + Sync,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name({
            let label = label.to_string();
            move |idx| format!("{label}-{idx}")
        })
        .build()
        .map_err(|e| PipelineError::Other(e.into()))?;

    let results: Vec<(String, Result<T, PipelineError>)> = pool.install(|| {
        items
            .into_par_iter()
            .map(|(id, input)| {
                let result = catch_unwind(AssertUnwindSafe(|| op(&id, input))).unwrap_or_else(
                    |payload| {
                        Err(PipelineError::Other(anyhow::anyhow!(
                            "worker panicked: {}",
                            panic_message(&*payload)
                        )))
                    },
                );
                (id, result)
            })
            .collect()
    });

    let mut fan_out = FanOut {
        succeeded: vec![],
        failures: vec![],
    };
    for (id, result) in results {
        match result {
            Ok(value) => fan_out.succeeded.push((id, value)),
            Err(err) => {
                log::warn!("{label} item={id} outcome=failed kind={} error={err}", err.kind());
                fan_out.failures.push(ItemFailure::new(id, &err));
            }
        }
    }

    Ok(fan_out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_and_panics_do_not_abort_siblings() {
        let items: Vec<(String, u32)> = (0..8).map(|i| (i.to_string(), i)).collect();

        let result = run_bounded("test", 3, items, |_, n| {
            if n == 3 {
                return Err(PipelineError::schema("3", "bad record"));
            }
            if n == 5 {
                panic!("boom");
            }
            Ok(n * 10)
        })
        .unwrap();

        let ids: Vec<_> = result.succeeded.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2", "4", "6", "7"]);
        assert_eq!(result.succeeded[3].1, 40);

        assert_eq!(result.failures.len(), 2);
        assert_eq!(result.failures[0].item_id, "3");
        assert_eq!(result.failures[0].kind, "schema_violation");
        assert_eq!(result.failures[1].item_id, "5");
        assert!(result.failures[1].message.contains("boom"));
    }
}
