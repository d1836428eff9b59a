//! ---
//! tb_section: "01-harness-core"
//! tb_subsection: "module"
//! tb_type: "source"
//! tb_scope: "code"
//! tb_description: "Built-in smoke stages wired by the CLI run command."
//! tb_version: "v0.1.0"
//! tb_owner: "tbd"
//! ---
//! The two-stage smoke suite the CLI runs against the configured fleet.

use async_trait::async_trait;
use serde_json::{json, Value};
use testbed_keys::SigningError;
use testbed_orchestrator::WorkerStatus;
use testbed_runner::{Stage, StageContext, StageError};
use tracing::info;

/// Stage suite executed by `testbed run`.
pub fn builtin() -> Vec<Box<dyn Stage>> {
    vec![Box::new(FleetHealth), Box::new(RunManifest)]
}

/// Records every worker's state once the fleet is supposed to be ready.
struct FleetHealth;

#[async_trait]
impl Stage for FleetHealth {
    fn name(&self) -> &str {
        "fleet-health"
    }

    fn description(&self) -> &str {
        "every declared worker is up and ready"
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<Value, StageError> {
        let status = ctx.orchestrator.status();
        if !ctx.orchestrator.all_ready() {
            let stragglers: Vec<String> = status
                .iter()
                .filter(|worker| worker.state != testbed_worker::WorkerState::Ready)
                .map(|worker| format!("{} ({})", worker.name, worker.state))
                .collect();
            return Err(StageError::failed(format!(
                "fleet is not fully ready: {}",
                stragglers.join(", ")
            )));
        }
        Ok(fleet_payload(&status))
    }
}

/// Writes a manifest fixture naming the fleet, signed by every keyring role.
struct RunManifest;

#[async_trait]
impl Stage for RunManifest {
    fn name(&self) -> &str {
        "run-manifest"
    }

    fn description(&self) -> &str {
        "signed manifest of the fleet this run executed against"
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<Value, StageError> {
        let manifest = manifest_payload(ctx.run_id, &ctx.orchestrator.status());

        let fixture_dir = ctx.data_dir.join("fixtures");
        tokio::fs::create_dir_all(&fixture_dir).await?;

        let mut signed_by = Vec::new();
        for role in ctx.signer.roles() {
            let fixture = ctx.signer.sign_fixture(role, &manifest)?;
            let bytes = serde_json::to_vec_pretty(&fixture).map_err(SigningError::Json)?;
            let path = fixture_dir.join(format!("manifest.{role}.json"));
            tokio::fs::write(&path, bytes).await?;
            info!(role = %role, path = %path.display(), "manifest fixture written");
            signed_by.push(role.to_owned());
        }
        if signed_by.is_empty() {
            let bytes = serde_json::to_vec_pretty(&manifest).map_err(SigningError::Json)?;
            let path = fixture_dir.join("manifest.json");
            tokio::fs::write(&path, bytes).await?;
            info!(path = %path.display(), "manifest written unsigned; no keypair roles configured");
        }

        Ok(json!({ "manifest": manifest, "signed_by": signed_by }))
    }
}

fn fleet_payload(status: &[WorkerStatus]) -> Value {
    let workers: Vec<Value> = status
        .iter()
        .map(|worker| {
            json!({
                "name": worker.name,
                "port": worker.port,
                "state": worker.state.to_string(),
            })
        })
        .collect();
    json!({ "workers": workers })
}

fn manifest_payload(run_id: &str, status: &[WorkerStatus]) -> Value {
    let workers: Vec<Value> = status
        .iter()
        .map(|worker| json!({ "name": worker.name, "port": worker.port }))
        .collect();
    json!({ "run_id": run_id, "workers": workers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use testbed_worker::WorkerState;

    fn status(name: &str, ordinal: usize, state: WorkerState) -> WorkerStatus {
        WorkerStatus {
            name: name.to_owned(),
            ordinal,
            port: 9000 + ordinal as u16,
            state,
        }
    }

    #[test]
    fn manifest_payload_lists_workers_in_order() {
        let fleet = vec![
            status("leader", 0, WorkerState::Ready),
            status("worker-a", 1, WorkerState::Ready),
        ];
        let payload = manifest_payload("nightly", &fleet);
        assert_eq!(payload["run_id"], "nightly");
        assert_eq!(payload["workers"][0]["name"], "leader");
        assert_eq!(payload["workers"][0]["port"], 9000);
        assert_eq!(payload["workers"][1]["port"], 9001);
    }

    #[test]
    fn fleet_payload_carries_lifecycle_states() {
        let fleet = vec![status("leader", 0, WorkerState::Failed)];
        let payload = fleet_payload(&fleet);
        assert_eq!(payload["workers"][0]["state"], "failed");
    }
}
