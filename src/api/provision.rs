use crate::{
    api::{deployments, epoch_milli, event_utils, ApiState},
    storage,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Ordered step names for bare-metal deployments.
const LOCAL_PLAN: &[&str] = &[
    "prepare_environment",
    "install_server_packages",
    "configure_security",
    "configure_networking",
    "configure_reverse_proxy",
    "start_services",
    "run_security_scan",
];

/// Ordered step names for cloud deployments.
const CLOUD_PLAN: &[&str] = &[
    "initialize_infrastructure",
    "plan_infrastructure",
    "provision_cloud_resources",
    "deploy_containers",
    "configure_networking",
    "provision_certificates",
    "run_post_deploy_checks",
];

/// Returns the ordered provisioning plan for a deployment kind.
pub fn plan_for(kind: &deployments::Kind) -> &'static [&'static str] {
    match kind {
        deployments::Kind::Local => LOCAL_PLAN,
        deployments::Kind::Cloud => CLOUD_PLAN,
    }
}

/// Percentage of a plan complete after `completed` of `total` steps, truncated toward zero.
pub fn progress_percent(completed: usize, total: usize) -> u64 {
    ((completed * 100) / total) as u64
}

#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("could not persist deployment state; {0}")]
    Persistence(#[from] storage::StorageError),

    #[error("could not serialize deployment state; {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Drives a single deployment through its provisioning plan. From the moment it is spawned
/// until the deployment reaches a terminal status the provisioner is the sole writer of the
/// deployment's status and progress.
///
/// The provisioner is meant to run as a detached task: step failures are converted into a
/// failed terminal status and persistence failures abort the remaining plan, so no error
/// escapes [`Provisioner::execute`].
#[derive(Debug, Clone)]
pub struct Provisioner {
    api_state: Arc<ApiState>,
    deployment: deployments::Deployment,
}

impl Provisioner {
    pub fn new(api_state: Arc<ApiState>, deployment: deployments::Deployment) -> Self {
        Self {
            api_state,
            deployment,
        }
    }

    /// Run the full provisioning plan, updating storage and emitting events as each step
    /// completes.
    pub async fn execute(self) {
        let deployment_id = self.deployment.id;

        // One provisioner per deployment. The entry is removed on the way out; the pending
        // guard in run() keeps a replayed provisioner from mutating a terminal record.
        if self
            .api_state
            .active_deployments
            .insert(deployment_id, ())
            .is_some()
        {
            error!(
                deployment_id,
                "Deployment already has an active provisioner; refusing to start another"
            );
            return;
        }

        debug!(deployment_id, kind = %self.deployment.kind, "Starting provisioner");

        if let Err(e) = self.run().await {
            error!(deployment_id, error = %e, "Provisioning aborted");

            // One best-effort attempt to leave a terminal status behind. If the record was
            // deleted mid-flight this write observes NotFound and the failure is only logged.
            if let Err(write_err) = self
                .persist_failure_reason(deployments::StatusReason {
                    reason: deployments::StatusReasonType::PersistenceFailed,
                    description: e.to_string(),
                })
                .await
            {
                error!(
                    deployment_id,
                    error = %write_err,
                    "Could not record deployment failure; record left at last persisted state"
                );
            }
        }

        self.api_state.active_deployments.remove(&deployment_id);
    }

    async fn run(&self) -> Result<(), ProvisionError> {
        let plan = plan_for(&self.deployment.kind);

        // Best-effort guard: only a pending deployment may enter the plan. The creating
        // handler is the one that hands ids to provisioners, so anything else here means a
        // replay and the record is left alone.
        {
            let mut conn = self.api_state.storage.read_conn().await?;
            let current =
                storage::deployments::get(&mut conn, self.deployment.id as i64).await?;

            if current.status != deployments::Status::Pending.to_string() {
                error!(
                    deployment_id = self.deployment.id,
                    status = %current.status,
                    "Deployment is not pending; refusing to provision"
                );
                return Ok(());
            }
        }

        self.persist_progress(deployments::Status::InProgress, 0)
            .await?;
        self.emit(event_utils::Kind::StartedDeployment {
            deployment_id: self.deployment.id,
            kind: self.deployment.kind.clone(),
        })
        .await;

        for (index, step) in plan.iter().enumerate() {
            if let Err(reason) = self.run_step(step).await {
                // Progress stays frozen at the last completed step's value.
                let description = format!("step '{}' failed; {}", step, reason);

                self.persist_failure_reason(deployments::StatusReason {
                    reason: deployments::StatusReasonType::StepFailed,
                    description: description.clone(),
                })
                .await?;

                self.emit(event_utils::Kind::FailedDeployment {
                    deployment_id: self.deployment.id,
                    description,
                })
                .await;

                return Ok(());
            }

            let completed = index + 1;
            let progress = progress_percent(completed, plan.len());

            if completed == plan.len() {
                self.persist_progress(deployments::Status::Completed, progress)
                    .await?;
                self.emit(event_utils::Kind::CompletedDeployment {
                    deployment_id: self.deployment.id,
                })
                .await;
            } else {
                self.persist_progress(deployments::Status::InProgress, progress)
                    .await?;
                self.emit(event_utils::Kind::CompletedDeploymentStep {
                    deployment_id: self.deployment.id,
                    step: step.to_string(),
                    progress,
                })
                .await;
            }
        }

        info!(deployment_id = self.deployment.id, "Deployment provisioned");
        Ok(())
    }

    /// A stand-in for real provisioning work. Paces the plan with the configured per-step
    /// delay and honors the fault-injection knob so the failure path stays exercisable end
    /// to end.
    async fn run_step(&self, step: &str) -> Result<(), String> {
        debug!(
            deployment_id = self.deployment.id,
            step, "Executing provisioning step"
        );

        tokio::time::sleep(Duration::from_millis(
            self.api_state.config.provisioner.step_delay_ms,
        ))
        .await;

        if let Some(fail_step) = &self.api_state.config.provisioner.simulate_failure_step {
            if fail_step == step {
                return Err("simulated failure injected by configuration".to_string());
            }
        }

        Ok(())
    }

    /// Status and progress are written together in one update so a poller never observes a
    /// half-applied transition.
    async fn persist_progress(
        &self,
        status: deployments::Status,
        progress: u64,
    ) -> Result<(), ProvisionError> {
        let mut conn = self.api_state.storage.write_conn().await?;

        let fields = storage::deployments::UpdatableFields {
            status: Some(status.to_string()),
            progress: Some(progress as i64),
            modified: Some(epoch_milli().to_string()),
            ..Default::default()
        };

        storage::deployments::update(&mut conn, self.deployment.id as i64, fields).await?;
        Ok(())
    }

    async fn persist_failure_reason(
        &self,
        reason: deployments::StatusReason,
    ) -> Result<(), ProvisionError> {
        let mut conn = self.api_state.storage.write_conn().await?;

        let fields = storage::deployments::UpdatableFields {
            status: Some(deployments::Status::Failed.to_string()),
            status_reason: Some(serde_json::to_string(&Some(reason))?),
            modified: Some(epoch_milli().to_string()),
            ..Default::default()
        };

        storage::deployments::update(&mut conn, self.deployment.id as i64, fields).await?;
        Ok(())
    }

    /// Events are awaited here rather than fire-and-forgotten so a single deployment's event
    /// stream is broadcast in step order. A publish failure never interrupts provisioning.
    async fn emit(&self, kind: event_utils::Kind) {
        if let Err(e) = self.api_state.event_bus.try_publish(kind).await {
            error!(
                deployment_id = self.deployment.id,
                error = %e,
                "Could not publish deployment event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{conf, storage::tests::TestHarness};
    use pretty_assertions::assert_eq;

    fn test_config() -> conf::api::Config {
        let mut config = conf::api::Config::default();
        config.provisioner.step_delay_ms = 0;
        config
    }

    async fn setup(config: conf::api::Config) -> (TestHarness, Arc<ApiState>) {
        let harness = TestHarness::new().await;
        let api_state = Arc::new(ApiState::new(config, harness.db.clone()));
        (harness, api_state)
    }

    async fn insert_pending(
        api_state: &ApiState,
        kind: deployments::Kind,
    ) -> deployments::Deployment {
        let mut deployment =
            deployments::Deployment::new("test deployment", kind, serde_json::json!({}));

        let mut conn = api_state.storage.write_conn().await.unwrap();
        let storage_deployment = deployment.clone().try_into().unwrap();
        let id = storage::deployments::insert(&mut conn, &storage_deployment)
            .await
            .unwrap();

        deployment.id = id as u64;
        deployment
    }

    async fn stored_deployment(api_state: &ApiState, id: u64) -> storage::deployments::Deployment {
        let mut conn = api_state.storage.read_conn().await.unwrap();
        storage::deployments::get(&mut conn, id as i64)
            .await
            .unwrap()
    }

    #[test]
    fn plans_have_seven_ordered_steps() {
        assert_eq!(plan_for(&deployments::Kind::Local).len(), 7);
        assert_eq!(plan_for(&deployments::Kind::Cloud).len(), 7);
    }

    #[test]
    fn progress_truncates_toward_zero() {
        assert_eq!(progress_percent(0, 7), 0);
        assert_eq!(progress_percent(1, 7), 14);
        assert_eq!(progress_percent(3, 7), 42);
        assert_eq!(progress_percent(6, 7), 85);
        assert_eq!(progress_percent(7, 7), 100);
    }

    #[tokio::test]
    async fn local_deployment_runs_to_completion() {
        let (_harness, api_state) = setup(test_config()).await;
        let deployment = insert_pending(&api_state, deployments::Kind::Local).await;

        Provisioner::new(api_state.clone(), deployment.clone())
            .execute()
            .await;

        let stored = stored_deployment(&api_state, deployment.id).await;
        assert_eq!(stored.status, "completed");
        assert_eq!(stored.progress, 100);
        assert!(
            !api_state.active_deployments.contains_key(&deployment.id),
            "provisioner did not release the active-deployment guard"
        );
    }

    #[tokio::test]
    async fn events_arrive_in_step_order_with_monotonic_progress() {
        let (_harness, api_state) = setup(test_config()).await;
        let deployment = insert_pending(&api_state, deployments::Kind::Cloud).await;

        let mut listener = api_state.event_bus.subscribe_live();

        Provisioner::new(api_state.clone(), deployment.clone())
            .execute()
            .await;

        // started + 6 intermediate steps + completed.
        let first = listener.next().await.unwrap();
        assert_eq!(
            first.kind,
            event_utils::Kind::StartedDeployment {
                deployment_id: deployment.id,
                kind: deployments::Kind::Cloud,
            }
        );

        let plan = plan_for(&deployments::Kind::Cloud);
        let mut last_progress = 0;

        for step in plan.iter().take(plan.len() - 1) {
            let event = listener.next().await.unwrap();
            match event.kind {
                event_utils::Kind::CompletedDeploymentStep {
                    deployment_id,
                    step: event_step,
                    progress,
                } => {
                    assert_eq!(deployment_id, deployment.id);
                    assert_eq!(&event_step, step);
                    assert!(progress >= last_progress, "progress went backwards");
                    last_progress = progress;
                }
                other => panic!("expected step event, got {:?}", other),
            }
        }

        let last = listener.next().await.unwrap();
        assert_eq!(
            last.kind,
            event_utils::Kind::CompletedDeployment {
                deployment_id: deployment.id
            }
        );
    }

    #[tokio::test]
    async fn failed_step_freezes_progress_and_stops_the_plan() {
        let mut config = test_config();
        // Step 4 of the local plan; three steps complete first.
        config.provisioner.simulate_failure_step = Some("configure_networking".to_string());

        let (_harness, api_state) = setup(config).await;
        let deployment = insert_pending(&api_state, deployments::Kind::Local).await;

        let mut listener = api_state.event_bus.subscribe_live();

        Provisioner::new(api_state.clone(), deployment.clone())
            .execute()
            .await;

        let stored = stored_deployment(&api_state, deployment.id).await;
        assert_eq!(stored.status, "failed");
        assert_eq!(stored.progress, 42);

        let status_reason: Option<deployments::StatusReason> =
            serde_json::from_str(&stored.status_reason).unwrap();
        let status_reason = status_reason.expect("failed deployment should carry a reason");
        assert_eq!(
            status_reason.reason,
            deployments::StatusReasonType::StepFailed
        );

        // started + 3 step events + failed, and nothing after.
        let mut kinds = vec![];
        for _ in 0..5 {
            kinds.push(listener.next().await.unwrap().kind);
        }

        assert!(matches!(
            kinds.last().unwrap(),
            event_utils::Kind::FailedDeployment { .. }
        ));
        let followup = tokio::time::timeout(Duration::from_millis(100), listener.next()).await;
        assert!(followup.is_err(), "no events should follow the failure");
    }

    #[tokio::test]
    async fn deleted_record_aborts_without_panic() {
        let (_harness, api_state) = setup(test_config()).await;
        let deployment = insert_pending(&api_state, deployments::Kind::Local).await;

        {
            let mut conn = api_state.storage.write_conn().await.unwrap();
            storage::deployments::delete(&mut conn, deployment.id as i64)
                .await
                .unwrap();
        }

        // The first progress write observes NotFound; the provisioner gives up quietly.
        Provisioner::new(api_state.clone(), deployment.clone())
            .execute()
            .await;

        let mut conn = api_state.storage.read_conn().await.unwrap();
        assert_eq!(
            storage::deployments::get(&mut conn, deployment.id as i64)
                .await
                .unwrap_err(),
            storage::StorageError::NotFound
        );
        assert!(!api_state.active_deployments.contains_key(&deployment.id));
    }

    #[tokio::test]
    async fn deleted_mid_plan_aborts_remaining_steps() {
        let mut config = test_config();
        config.provisioner.step_delay_ms = 25;

        let (_harness, api_state) = setup(config).await;
        let deployment = insert_pending(&api_state, deployments::Kind::Local).await;

        let handle = tokio::spawn(
            Provisioner::new(api_state.clone(), deployment.clone()).execute(),
        );

        // Let a couple of steps land, then pull the record out from underneath the task.
        tokio::time::sleep(Duration::from_millis(60)).await;
        {
            let mut conn = api_state.storage.write_conn().await.unwrap();
            storage::deployments::delete(&mut conn, deployment.id as i64)
                .await
                .unwrap();
        }

        handle.await.expect("provisioner task panicked");

        let mut conn = api_state.storage.read_conn().await.unwrap();
        assert_eq!(
            storage::deployments::get(&mut conn, deployment.id as i64)
                .await
                .unwrap_err(),
            storage::StorageError::NotFound
        );
    }

    #[tokio::test]
    async fn second_provisioner_for_same_deployment_is_refused() {
        let (_harness, api_state) = setup(test_config()).await;
        let deployment = insert_pending(&api_state, deployments::Kind::Local).await;

        api_state.active_deployments.insert(deployment.id, ());

        Provisioner::new(api_state.clone(), deployment.clone())
            .execute()
            .await;

        let stored = stored_deployment(&api_state, deployment.id).await;
        assert_eq!(
            stored.status, "pending",
            "refused provisioner must not touch the record"
        );
    }

    #[tokio::test]
    async fn non_pending_deployment_is_left_alone() {
        let (_harness, api_state) = setup(test_config()).await;
        let deployment = insert_pending(&api_state, deployments::Kind::Local).await;

        {
            let mut conn = api_state.storage.write_conn().await.unwrap();
            storage::deployments::update(
                &mut conn,
                deployment.id as i64,
                storage::deployments::UpdatableFields {
                    status: Some("completed".to_string()),
                    progress: Some(100),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }

        Provisioner::new(api_state.clone(), deployment.clone())
            .execute()
            .await;

        let stored = stored_deployment(&api_state, deployment.id).await;
        assert_eq!(stored.status, "completed", "terminal record must stay put");
        assert_eq!(stored.progress, 100);
    }

    #[tokio::test]
    async fn concurrent_deployments_keep_per_id_event_order() {
        let (_harness, api_state) = setup(test_config()).await;
        let local = insert_pending(&api_state, deployments::Kind::Local).await;
        let cloud = insert_pending(&api_state, deployments::Kind::Cloud).await;

        let mut listener = api_state.event_bus.subscribe_live();

        let first = tokio::spawn(Provisioner::new(api_state.clone(), local.clone()).execute());
        let second = tokio::spawn(Provisioner::new(api_state.clone(), cloud.clone()).execute());

        first.await.unwrap();
        second.await.unwrap();

        // 8 events per deployment: started + 6 steps + completed.
        let mut progress_by_id: std::collections::HashMap<u64, Vec<u64>> =
            std::collections::HashMap::new();

        for _ in 0..16 {
            let event = listener.next().await.unwrap();
            match event.kind {
                event_utils::Kind::StartedDeployment { deployment_id, .. } => {
                    progress_by_id.entry(deployment_id).or_default().push(0);
                }
                event_utils::Kind::CompletedDeploymentStep {
                    deployment_id,
                    progress,
                    ..
                } => {
                    progress_by_id
                        .entry(deployment_id)
                        .or_default()
                        .push(progress);
                }
                event_utils::Kind::CompletedDeployment { deployment_id } => {
                    progress_by_id
                        .entry(deployment_id)
                        .or_default()
                        .push(100);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        for (id, progress) in progress_by_id {
            assert_eq!(progress.len(), 8, "deployment {id} missed events");
            let mut sorted = progress.clone();
            sorted.sort_unstable();
            assert_eq!(progress, sorted, "deployment {id} events out of order");
        }

        assert_eq!(stored_deployment(&api_state, local.id).await.status, "completed");
        assert_eq!(stored_deployment(&api_state, cloud.id).await.status, "completed");
    }
}
