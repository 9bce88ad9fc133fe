// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Collecting service logs from every target.

use crate::context::OrchestrationContext;
use crate::target::{DirectoryError, Role};
use crate::transfer::{copy_out, ArchiveOptions, TransferError};
use camino::{Utf8Path, Utf8PathBuf};
use fan_out::{FanOut, FanOutError};
use slog::{error, info};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogCollectionError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("failed to collect logs")]
    Targets(#[source] FanOutError<String, TransferError>),
}

/// Copies the service log directory out of every provider and consumer into
/// `<output_dir>/logs/<target>`.
///
/// Every target is attempted; the error lists the ones that failed. Returns
/// the local directories that were written.
pub async fn collect_logs(
    ctx: &Arc<OrchestrationContext>,
    output_dir: &Utf8Path,
) -> Result<Vec<Utf8PathBuf>, LogCollectionError> {
    let targets: Vec<_> = ctx
        .directory
        .list(None)
        .await?
        .into_iter()
        .filter(|target| target.role != Role::Database)
        .collect();
    info!(
        ctx.log,
        "collecting logs";
        "targets" => targets.len(),
        "output_dir" => %output_dir,
    );

    let mut workers: FanOut<String, Utf8PathBuf, TransferError> =
        FanOut::new();
    for target in targets {
        let ctx = Arc::clone(ctx);
        let dest = output_dir.join("logs").join(&target.name);
        workers.spawn(target.name.clone(), async move {
            copy_out(
                ctx.transfer.as_ref(),
                &target,
                &ctx.config.service.log_directory,
                &dest,
                ArchiveOptions { extract: true, cleanup: true },
            )
            .await
        });
    }

    match workers.join_all_then_aggregate().await {
        Ok(collected) => {
            Ok(collected.into_iter().map(|(_, path)| path).collect())
        }
        Err(err) => {
            for (target, failure) in &err.failures {
                error!(
                    ctx.log,
                    "failed to collect logs";
                    "target" => target,
                    "error" => %failure,
                );
            }
            Err(LogCollectionError::Targets(err))
        }
    }
}
