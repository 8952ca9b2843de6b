use super::print_json;
use crate::store::Session;
use anyhow::{bail, Result};
use shardline::{AllocationCommand, RerouteRequest, RerouteResponse};
use tracing::info;

/// Apply or preview allocation commands and print the response
pub async fn run_reroute(
    session: &Session,
    commands: Vec<AllocationCommand>,
    dry_run: bool,
    explain: bool,
) -> Result<()> {
    let request = RerouteRequest::new(commands).dry_run(dry_run).explain(explain);
    info!(
        "Rerouting with {} commands (dry_run: {})",
        request.commands.len(),
        request.dry_run
    );

    let outcome = session
        .service
        .reroute(request.commands.clone(), request.options())
        .await;
    let response = RerouteResponse::from_outcome(&outcome, &request);
    print_json(&response)?;

    if let Err(failure) = outcome {
        bail!("Reroute rejected: {}", failure.error);
    }
    Ok(())
}
