//! Convert raw browser profiler captures into processed profiles.
//!
//! [`process_gecko_profile`] converts one capture synchronously. [`GeckoIngest`] converts a batch
//! of capture files concurrently, each with its own interning state.

use anyhow::Context;
pub use config::Config;
pub use error::ProcessError;
use futures_util::{stream::FuturesUnordered, StreamExt};
pub use process::process_gecko_profile;
pub use processed::{serialize, serialize_pretty, ProcessedProfile};
pub use status::Status;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[macro_use]
pub mod table;

pub mod address;
pub mod config;
pub mod error;
pub mod extract;
pub mod gecko;
pub mod interner;
pub mod markers;
pub mod process;
pub mod processed;
pub mod status;
pub mod upgrade;

type Conversion = JoinHandle<(PathBuf, anyhow::Result<ProcessedProfile>)>;

pub struct GeckoIngest {
    pub status: Arc<Status>,
    config: Config,
}

/// A successfully converted input.
pub struct Converted {
    pub input: PathBuf,
    pub profile: ProcessedProfile,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub converted: usize,
    pub failed: usize,
}

impl GeckoIngest {
    pub fn new(config: Config) -> Self {
        GeckoIngest {
            status: Arc::new(Status::new()),
            config,
        }
    }

    /// Convert every configured input, passing each processed profile to `output` as soon as it
    /// is ready.
    ///
    /// A failed conversion is logged and counted but does not stop the batch. An error returned
    /// by `output` does.
    pub fn run<F>(self, mut output: F) -> anyhow::Result<Summary>
    where
        F: FnMut(Converted) -> anyhow::Result<()>,
    {
        let GeckoIngest { status, config } = self;

        log::info!("configuration: {config:#?}");

        let mut builder = runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name("gecko-ingest");

        if let config::WorkerThreads::Exact(n) = config.worker_threads {
            builder.worker_threads(n);
        }

        builder.build()?.block_on(async move {
            status.profiles.set_total(config.inputs.len());
            let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));

            let mut conversions: FuturesUnordered<Conversion> =
                config
                    .inputs
                    .iter()
                    .cloned()
                    .map(|input| {
                        let permits = permits.clone();
                        let status = status.clone();
                        tokio::spawn(async move {
                            let result: anyhow::Result<ProcessedProfile> = async {
                                let _permit = permits.acquire_owned().await?;
                                let _converting = status.profiles.converting();
                                convert_file(&input).await
                            }
                            .await;
                            (input, result)
                        })
                    })
                    .collect();

            {
                let aborts = conversions
                    .iter()
                    .map(|j| j.abort_handle())
                    .collect::<Vec<_>>();
                status.cancel.on_cancel(move || {
                    aborts.into_iter().for_each(|a| a.abort());
                });
            }

            log::info!("converting {} profiles", config.inputs.len());

            let mut summary = Summary::default();
            while let Some(joined) = conversions.next().await {
                let (input, result) = match joined {
                    // Ignore cancelled tasks
                    Err(e) if e.is_cancelled() => continue,
                    Err(e) => return Err(anyhow::Error::from(e)),
                    Ok(v) => v,
                };
                status.profiles.inc_complete();
                match result {
                    Ok(profile) => {
                        output(Converted { input, profile })?;
                        summary.converted += 1;
                    }
                    Err(e) => {
                        log::error!("failed to convert {}: {e:#}", input.display());
                        status.profiles.inc_failed();
                        summary.failed += 1;
                    }
                }
            }
            Ok(summary)
        })
    }
}

/// Read and convert one raw profile file.
pub async fn convert_file(path: &Path) -> anyhow::Result<ProcessedProfile> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("while reading {}", path.display()))?;
    tokio::task::spawn_blocking(move || -> anyhow::Result<ProcessedProfile> {
        let raw: serde_json::Value = serde_json::from_slice(&bytes).context("invalid JSON")?;
        let profile = process_gecko_profile(raw).map_err(|e| {
            let path = e.path();
            let context = if path.is_empty() {
                "conversion failed".to_owned()
            } else {
                format!("conversion failed at {path}")
            };
            anyhow::Error::new(e).context(context)
        })?;
        Ok(profile)
    })
    .await?
}
