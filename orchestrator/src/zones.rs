// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Setting up several zones at once.

use crate::context::OrchestrationContext;
use crate::setup::{setup_zone, SetupError};
use crate::topology::ZoneInfo;
use fan_out::{FanOut, FanOutError};
use slog::{error, info};
use std::sync::Arc;

/// Runs the setup pipeline for every zone concurrently, one worker per zone.
///
/// Zones share no targets, so their pipelines are independent. A zone that
/// fails does not stop the others; the error names every zone that failed.
pub async fn setup_zones(
    ctx: &Arc<OrchestrationContext>,
    zones: &[ZoneInfo],
) -> Result<(), FanOutError<String, SetupError>> {
    info!(ctx.log, "setting up zones"; "count" => zones.len());
    let mut workers: FanOut<String, (), SetupError> =
        FanOut::new_with_parallelism(zones.len());
    for zone in zones {
        workers.spawn(
            zone.zone_name.clone(),
            setup_zone(Arc::clone(ctx), zone.clone()),
        );
    }

    let result = workers.join_all_then_aggregate().await.map(|_| ());
    if let Err(err) = &result {
        for (zone, failure) in &err.failures {
            error!(
                ctx.log,
                "zone setup failed";
                "zone" => zone,
                "error" => %failure,
            );
        }
    }
    result
}
