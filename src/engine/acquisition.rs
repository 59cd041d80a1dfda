// src/engine/acquisition.rs

//! Async driver for the acquisition state machine.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::engine::{
    classify, Acquired, AcquisitionOptions, AcquisitionPhase, Attempt, FailureKind,
};
use crate::errors::{Result, SpotrunError};
use crate::infra::{InfraProvisioner, RegionInfra};
use crate::pricing::catalog::{all_instance_types, cpu_topology};
use crate::pricing::{rank, Candidate, PriceOracle, WorkloadRequest};
use crate::provider::{CloudProvider, InstanceRequest};
use crate::state::{PersistedState, SessionState, StateStore};
use crate::types::Arch;

/// Runs one acquisition: rank, then try candidates cheapest first.
///
/// Region infrastructure and image lookups are memoized for the lifetime of
/// the engine, so a region is provisioned at most once per run no matter how
/// many of its candidates are tried.
pub struct AcquisitionEngine {
    provider: Arc<dyn CloudProvider>,
    provisioner: Arc<InfraProvisioner>,
    store: Option<StateStore>,
    options: AcquisitionOptions,
    phase: AcquisitionPhase,
    history: Vec<AcquisitionPhase>,
    region_infra: HashMap<String, RegionInfra>,
    images: HashMap<(String, Arch), String>,
}

impl fmt::Debug for AcquisitionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionEngine")
            .field("phase", &self.phase)
            .field("options", &self.options)
            .field("provisioned_regions", &self.region_infra.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl AcquisitionEngine {
    /// `store` is `None` when state persistence is disabled.
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        provisioner: Arc<InfraProvisioner>,
        store: Option<StateStore>,
        options: AcquisitionOptions,
    ) -> Self {
        Self {
            provider,
            provisioner,
            store,
            options,
            phase: AcquisitionPhase::Idle,
            history: Vec::new(),
            region_infra: HashMap::new(),
            images: HashMap::new(),
        }
    }

    pub fn phase(&self) -> &AcquisitionPhase {
        &self.phase
    }

    /// Every phase entered so far, in order.
    pub fn history(&self) -> &[AcquisitionPhase] {
        &self.history
    }

    fn transition(&mut self, next: AcquisitionPhase) {
        debug!(from = ?self.phase, to = ?next, "acquisition phase");
        self.history.push(next.clone());
        self.phase = next;
    }

    /// A fatal error ends the run in the terminal error state.
    fn fail_fatal(&mut self) {
        self.transition(AcquisitionPhase::Failed(FailureKind::Fatal));
        self.transition(AcquisitionPhase::CapacityExhausted);
    }

    /// Refuse to start while the store records an instance this session did
    /// not create. Overwriting that record would orphan a running instance.
    fn ensure_untracked(&self, session: &SessionState) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if let Some(PersistedState {
            instance_id: Some(instance_id),
            region,
            ..
        }) = store.load()?
        {
            if session.instance_id.as_deref() != Some(instance_id.as_str()) {
                warn!(instance_id = %instance_id, "an earlier instance is still tracked");
                return Err(SpotrunError::InstanceStillTracked {
                    instance_id,
                    region: region.unwrap_or_default(),
                });
            }
        }
        Ok(())
    }

    fn persist(&self, session: &SessionState) -> Result<()> {
        match &self.store {
            Some(store) => store.save(&session.snapshot()),
            None => Ok(()),
        }
    }

    /// Regions to price: the pinned one, or the session's current region
    /// followed by the configured candidates.
    fn search_regions(&self, session: &SessionState) -> Vec<String> {
        if let Some(region) = &self.options.pinned_region {
            return vec![region.clone()];
        }
        if !self.options.fallback {
            return vec![session.region.clone()];
        }
        let mut regions = vec![session.region.clone()];
        for region in &self.options.regions {
            if !regions.contains(region) {
                regions.push(region.clone());
            }
        }
        regions
    }

    /// Price every permitted region and rank the results.
    pub async fn rank_candidates(
        &mut self,
        request: &WorkloadRequest,
        session: &mut SessionState,
    ) -> Result<Vec<Candidate>> {
        self.transition(AcquisitionPhase::Ranking);
        request.validate()?;
        let regions = self.search_regions(session);
        let types = all_instance_types(request.allow_alternate_arch);
        let oracle = PriceOracle::new(Arc::clone(&self.provider));
        let region_prices = oracle
            .survey(&regions, &types, &mut session.fallback_log)
            .await?;
        Ok(rank(request, &region_prices))
    }

    /// Acquire one running, reachable instance.
    ///
    /// `session` is updated (and persisted) as the run progresses, so a
    /// crash at any point leaves enough on disk to terminate what was
    /// created.
    pub async fn acquire(
        &mut self,
        request: &WorkloadRequest,
        session: &mut SessionState,
    ) -> Result<Acquired> {
        if let Err(e) = self.ensure_untracked(session) {
            self.fail_fatal();
            return Err(e);
        }
        let candidates = match self.rank_candidates(request, session).await {
            Ok(c) => c,
            Err(e) => {
                self.fail_fatal();
                return Err(e);
            }
        };
        if candidates.is_empty() {
            self.transition(AcquisitionPhase::CapacityExhausted);
            return Err(SpotrunError::NoPricing);
        }

        let best = &candidates[0];
        info!(
            region = %best.region,
            instance_type = %best.instance_type,
            vcpus = best.vcpus,
            price = best.price_per_hour,
            candidates = candidates.len(),
            "selected cheapest spot candidate"
        );

        let limit = if self.options.fallback { candidates.len() } else { 1 };
        let mut attempts: Vec<Attempt> = Vec::new();

        for (i, candidate) in candidates.iter().take(limit).enumerate() {
            if candidate.region != session.region {
                info!(from = %session.region, to = %candidate.region, "switching region");
                session.switch_region(&candidate.region);
            }

            if i > 0 {
                let note = format!(
                    "Trying {} in {} (${:.4}/hr)...",
                    candidate.instance_type, candidate.region, candidate.price_per_hour
                );
                info!("{note}");
                session.fallback_log.push(note);
            }

            let span = info_span!(
                "candidate",
                region = %candidate.region,
                instance_type = %candidate.instance_type,
            );
            match self
                .try_candidate(request, candidate, session)
                .instrument(span)
                .await
            {
                Ok(acquired) => {
                    self.transition(AcquisitionPhase::Ready);
                    return Ok(acquired);
                }
                Err(CandidateError::Retryable(attempt)) => {
                    warn!(
                        region = %attempt.region,
                        instance_type = %attempt.instance_type,
                        error = %attempt.error_message,
                        "no capacity; falling back to next candidate"
                    );
                    session.fallback_log.push(attempt.to_string());
                    attempts.push(attempt);
                    self.transition(AcquisitionPhase::Failed(FailureKind::Retryable));
                }
                Err(CandidateError::Fatal(err)) => {
                    self.fail_fatal();
                    return Err(err);
                }
            }
        }

        self.transition(AcquisitionPhase::CapacityExhausted);
        let message = match (self.options.fallback, attempts.first()) {
            (false, Some(a)) => format!(
                "No spot capacity for {} in {}: {}",
                a.instance_type, a.region, a.error_message
            ),
            _ => format!(
                "No spot capacity available after trying {} options.",
                attempts.len()
            ),
        };
        error!(attempts = attempts.len(), "{message}");
        Err(SpotrunError::CapacityExhausted { message, attempts })
    }

    async fn infra_for(&mut self, region: &str) -> Result<RegionInfra> {
        if let Some(infra) = self.region_infra.get(region) {
            debug!(region = %region, "reusing region infra from this run");
            return Ok(infra.clone());
        }
        let infra = self
            .provisioner
            .ensure(&self.options.project_tag, region)
            .await?;
        self.region_infra.insert(region.to_string(), infra.clone());
        Ok(infra)
    }

    async fn image_for(&mut self, region: &str, arch: Arch) -> Result<String> {
        let key = (region.to_string(), arch);
        if let Some(id) = self.images.get(&key) {
            return Ok(id.clone());
        }
        let id = self
            .provider
            .find_image(region, &self.options.project_tag, arch)
            .await?;
        info!(region = %region, arch = %arch, image = %id, "resolved machine image");
        self.images.insert(key, id.clone());
        Ok(id)
    }

    async fn try_candidate(
        &mut self,
        request: &WorkloadRequest,
        candidate: &Candidate,
        session: &mut SessionState,
    ) -> std::result::Result<Acquired, CandidateError> {
        let region = candidate.region.as_str();

        self.transition(AcquisitionPhase::ProvisioningRegion {
            region: region.to_string(),
        });
        let infra = self.infra_for(region).await?;
        session.apply_infra(&infra);

        let arch = candidate.arch();
        let image_id = self.image_for(region, arch).await?;

        self.transition(AcquisitionPhase::RequestingInstance {
            region: region.to_string(),
            instance_type: candidate.instance_type.clone(),
        });
        let instance_request = InstanceRequest {
            instance_type: candidate.instance_type.clone(),
            image_id,
            credential_name: infra.credential_name.clone(),
            group_id: infra.ingress_rule_id.clone(),
            project_tag: self.options.project_tag.clone(),
            cpu_topology: cpu_topology(candidate.vcpus, arch, request.disable_hyperthreading),
        };

        let instance_id = match self.provider.request_instance(region, &instance_request).await {
            Ok(id) => id,
            Err(err) => {
                return Err(match classify(&err) {
                    FailureKind::Retryable => CandidateError::Retryable(Attempt {
                        region: region.to_string(),
                        instance_type: candidate.instance_type.clone(),
                        error_message: err
                            .provider_error()
                            .map(|e| e.message.clone())
                            .unwrap_or_else(|| err.to_string()),
                    }),
                    FailureKind::Fatal => CandidateError::Fatal(err),
                });
            }
        };
        info!(region = %region, instance_id = %instance_id, instance_type = %candidate.instance_type, "spot instance requested");

        session.instance_id = Some(instance_id.clone());
        session.public_ip = None;

        match self.bring_up(region, &instance_id, session).await {
            Ok(public_ip) => {
                session.instance_type = Some(candidate.instance_type.clone());
                session.vcpus = Some(candidate.vcpus);
                session.price = Some(candidate.price_per_hour);
                Ok(Acquired {
                    candidate: candidate.clone(),
                    instance_id,
                    public_ip,
                    infra,
                })
            }
            Err(err) => {
                self.cleanup_failed_instance(region, &instance_id, session).await;
                Err(CandidateError::Fatal(err))
            }
        }
    }

    /// Everything after the instance exists. Any error here means the
    /// instance must be cleaned up by the caller.
    async fn bring_up(
        &mut self,
        region: &str,
        instance_id: &str,
        session: &mut SessionState,
    ) -> Result<String> {
        self.persist(session)?;

        self.transition(AcquisitionPhase::WaitingRunning {
            instance_id: instance_id.to_string(),
        });
        let ip = self
            .provider
            .wait_until_running(region, instance_id, self.options.running_timeout)
            .await?;
        info!(instance_id = %instance_id, ip = %ip, "instance running");

        self.transition(AcquisitionPhase::WaitingReachable { ip: ip.clone() });
        self.provider
            .wait_for_management_port(&ip, self.options.reachable_timeout)
            .await?;

        session.public_ip = Some(ip.clone());
        self.persist(session)?;
        Ok(ip)
    }

    /// Best-effort termination of an instance that never became usable.
    ///
    /// State is only cleared once termination succeeded; otherwise the
    /// persisted record stays so a later teardown can retry.
    async fn cleanup_failed_instance(
        &self,
        region: &str,
        instance_id: &str,
        session: &mut SessionState,
    ) {
        warn!(region = %region, instance_id = %instance_id, "instance failed to come up; terminating");
        match self.provider.terminate(region, instance_id).await {
            Ok(()) => {
                session.clear_instance();
                if let Some(store) = &self.store {
                    if let Err(e) = store.clear_if_owned(instance_id) {
                        warn!(error = %e, "failed to clear state after cleanup");
                    }
                }
            }
            Err(e) => {
                error!(
                    region = %region,
                    instance_id = %instance_id,
                    error = %e,
                    "cleanup termination failed; run `spotrun teardown` to retry"
                );
            }
        }
    }
}

/// Outcome of a single failed candidate.
enum CandidateError {
    Retryable(Attempt),
    Fatal(SpotrunError),
}

impl From<SpotrunError> for CandidateError {
    fn from(err: SpotrunError) -> Self {
        CandidateError::Fatal(err)
    }
}
