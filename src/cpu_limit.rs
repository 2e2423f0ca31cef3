//! Limits on concurrent CPU-heavy external processes.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// One permit per core, shared by every `pdftocairo` and `tesseract` we run.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Run `f` while holding a CPU permit.
///
/// Rasterizing and OCR each keep a core busy. With several projects running,
/// or a high page concurrency, this keeps us from starting more of them than
/// the machine has cores. Waiting for a permit counts against the page
/// timeout, which is what we want: the timeout bounds how long a page may
/// hold up a pause.
#[instrument(level = "trace", skip_all)]
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let _permit = CPU_SEMAPHORE
        .acquire()
        .await
        .context("Could not acquire CPU permit")?;
    f().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_the_function() -> Result<()> {
        let value = with_cpu_semaphore(|| async { Ok(21 * 2) }).await?;
        assert_eq!(value, 42);
        let err = with_cpu_semaphore(|| async { Err::<(), _>(anyhow!("boom")) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        Ok(())
    }
}
