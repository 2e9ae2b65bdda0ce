//! Network controller
//!
//! Create/update issues credentials for every participant, writes component
//! secrets and converges node and main-domain streams. Deletion tears all of
//! that down in reverse before the Network's finalizer is released.

use std::collections::{BTreeMap, BTreeSet};

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::broker::MAIN_DOMAIN;
use super::finalizers::{
    finalized_nodes, has_finalizer, is_being_deleted, update_network_finalizers, NETWORK_FINALIZER,
};
use super::participation::{
    run_deletion_pass, run_participation_pass, NodeDelta, ParticipationPlan,
};
use super::reconciler::Context;
use super::retry::retry_on_conflict;
use super::secrets::{ensure_server_info, read_credentials, strip_component, sync_component};
use super::streams::{stream_name, StreamManager};
use crate::crd::{
    AggregateStreamStatus, MainDomainStatus, Network, ParticipantType, ParticipationStatus,
    StreamState,
};
use crate::error::{Error, Result};

/// Component name of the operator's own participant in every network
pub const HOUSEKEEPING_COMPONENT: &str = "anck";

/// Identifier of the operator's participant, whose credentials manage streams
pub fn housekeeping_participant(network: &str) -> String {
    format!("{network}.{HOUSEKEEPING_COMPONENT}")
}

/// Every participant of a network including the housekeeping one
fn all_participants(network: &Network) -> BTreeMap<String, ParticipantType> {
    let mut participants = network.spec.participants.clone();
    participants.insert(
        housekeeping_participant(&network.name_any()),
        ParticipantType::Unknown,
    );
    participants
}

fn object_namespace(network: &Network) -> String {
    network.namespace().unwrap_or_else(|| "default".to_string())
}

/// Result of converging streams in one pass
#[derive(Debug, Default)]
struct StreamOutcome {
    plan: ParticipationPlan,
    main_domain: MainDomainStatus,
    errors: Vec<Error>,
}

/// Entry point for a Network event
pub async fn reconcile(network: &Network, ctx: &Context) -> Result<Action> {
    if is_being_deleted(network) {
        cleanup(network, ctx).await
    } else {
        apply(network, ctx).await
    }
}

#[instrument(skip(network, ctx), fields(network = %network.name_any(), namespace = %object_namespace(network)))]
async fn apply(network: &Network, ctx: &Context) -> Result<Action> {
    let namespace = object_namespace(network);
    let name = network.name_any();

    let network = if has_finalizer(network, NETWORK_FINALIZER) {
        network.clone()
    } else {
        let add = BTreeSet::from([NETWORK_FINALIZER.to_string()]);
        match update_network_finalizers(ctx.store.as_ref(), &namespace, &name, &add, &BTreeSet::new())
            .await?
        {
            Some(updated) => updated,
            None => return Ok(Action::await_change()),
        }
    };

    network
        .spec
        .validate()
        .map_err(|e| Error::ValidationError(format!("network {namespace}/{name}: {e}")))?;

    let participants = all_participants(&network);
    let identifiers: Vec<String> = participants.keys().cloned().collect();
    let desired = ctx.credentials.desired_state(&name, &identifiers).await?;

    let target = network.target_namespace();
    ctx.store.ensure_namespace(&target).await?;
    ensure_server_info(ctx.store.as_ref(), &target, &ctx.config.broker_urls).await?;

    for (component, participant_type) in &participants {
        sync_component(
            ctx.store.as_ref(),
            &target,
            &name,
            component,
            *participant_type,
            &desired,
            &ctx.config.broker_urls,
        )
        .await?;
    }

    let housekeeping = housekeeping_participant(&name);
    let creds = match desired.creds.get(&housekeeping) {
        Some(issued) => issued.creds.clone(),
        None => read_credentials(ctx.store.as_ref(), &target, &housekeeping, &name)
            .await?
            .ok_or_else(|| {
                Error::CredentialService(format!("no credentials issued for {housekeeping}"))
            })?,
    };

    let manager = StreamManager::connect(ctx.broker.as_ref(), &creds, ctx.stream_retry.clone()).await?;
    let outcome = converge_streams(&network, &manager).await;
    manager.close().await;

    let account = (!desired.account_name.is_empty()).then(|| desired.account_name.clone());
    persist_status(ctx, &namespace, &name, &outcome.plan, Some(outcome.main_domain), account).await?;
    update_network_finalizers(
        ctx.store.as_ref(),
        &namespace,
        &name,
        &outcome.plan.add_finalizers,
        &outcome.plan.remove_finalizers,
    )
    .await?;

    if let Some(error) = outcome.errors.into_iter().next() {
        return Err(error);
    }
    if !outcome.plan.failed_nodes.is_empty() {
        return Err(Error::NodeParticipation {
            network: name,
            nodes: outcome.plan.failed_nodes.into_keys().collect(),
        });
    }

    info!("Network reconciled");
    Ok(Action::requeue(ctx.config.requeue))
}

/// Participation pass followed by main-domain standard and aggregate streams
async fn converge_streams(network: &Network, manager: &StreamManager) -> StreamOutcome {
    let name = network.name_any();
    let spec = &network.spec;
    let participation = network.participation();
    let previous = network
        .status
        .as_ref()
        .map(|s| s.main_domain.clone())
        .unwrap_or_default();

    let finalized = finalized_nodes(network.finalizers());
    let plan = run_participation_pass(&name, spec, &participation, &finalized, Some(manager)).await;
    let mut outcome = StreamOutcome {
        plan,
        ..Default::default()
    };

    for stream in spec.standard_main_streams() {
        let subjects = spec.subjects_for(&stream.name);
        let state = match manager.ensure(MAIN_DOMAIN, &name, stream, &subjects).await {
            Ok(_) => StreamState::Created,
            Err(e) => {
                warn!(domain = MAIN_DOMAIN, stream = %stream.name, error = %e, "Main stream not created");
                outcome.errors.push(e);
                StreamState::Error
            }
        };
        outcome
            .main_domain
            .standard
            .insert(stream.name.clone(), state);
    }

    // aggregates source from the nodes that are active once this pass is applied
    let mut projected = participation;
    for (node, delta) in &outcome.plan.deltas {
        projected.apply(node, delta);
    }
    let source_domains = projected.active_nodes();

    for stream in spec.aggregate_streams() {
        let Some(link) = &stream.link else {
            continue;
        };
        let wanted = AggregateStreamStatus {
            source_domains: source_domains.clone(),
            source_name: stream_name(&name, &link.stream),
            state: StreamState::Created,
        };
        if previous.aggregate.get(&stream.name) == Some(&wanted) {
            debug!(stream = %stream.name, "Aggregate sources unchanged");
            outcome
                .main_domain
                .aggregate
                .insert(stream.name.clone(), wanted);
            continue;
        }
        let state = match manager
            .create_aggregate(MAIN_DOMAIN, &name, stream, &source_domains)
            .await
        {
            Ok(()) => StreamState::Created,
            Err(e) => {
                warn!(domain = MAIN_DOMAIN, stream = %stream.name, error = %e, "Aggregate stream not created");
                outcome.errors.push(e);
                StreamState::Error
            }
        };
        outcome.main_domain.aggregate.insert(
            stream.name.clone(),
            AggregateStreamStatus { state, ..wanted },
        );
    }

    outcome
}

/// Write participation deltas and main-domain status onto a fresh copy
///
/// Skips the write when nothing changed.
async fn persist_status(
    ctx: &Context,
    namespace: &str,
    name: &str,
    plan: &ParticipationPlan,
    main_domain: Option<MainDomainStatus>,
    account: Option<String>,
) -> Result<()> {
    let deltas: &BTreeMap<String, NodeDelta> = &plan.deltas;
    let main_domain = &main_domain;
    let account = &account;
    let store = ctx.store.as_ref();
    retry_on_conflict("persist network status", move || async move {
        let Some(mut network) = store.get_network(namespace, name).await? else {
            return Ok(());
        };
        let previous = network.status.clone();
        let mut status = previous.clone().unwrap_or_default();

        for (node, delta) in deltas {
            status.participating.apply(node, delta);
        }
        if let Some(main_domain) = main_domain {
            status.main_domain = main_domain.clone();
        }
        if status.account_name.is_none() && network.spec.account_name.as_deref().unwrap_or("").is_empty() {
            status.account_name = account.clone();
        }
        status.observed_generation = network.metadata.generation;

        #[cfg(feature = "metrics")]
        super::metrics::set_participation(namespace, name, &status.participating);

        if previous.as_ref() == Some(&status) {
            debug!("Status unchanged, skipping write");
            return Ok(());
        }
        network.status = Some(status);
        match store.replace_network_status(&network).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    })
    .await
}

#[instrument(skip(network, ctx), fields(network = %network.name_any(), namespace = %object_namespace(network)))]
async fn cleanup(network: &Network, ctx: &Context) -> Result<Action> {
    let namespace = object_namespace(network);
    let name = network.name_any();
    let target = network.target_namespace();
    let housekeeping = housekeeping_participant(&name);

    let participation = network.participation();
    let finalized = finalized_nodes(network.finalizers());

    if !has_finalizer(network, NETWORK_FINALIZER) {
        // credentials are gone; release nodes without broker work
        let plan = run_deletion_pass(&name, &network.spec, &participation, &finalized, None).await;
        persist_status(ctx, &namespace, &name, &plan, None, None).await?;
        update_network_finalizers(ctx.store.as_ref(), &namespace, &name, &BTreeSet::new(), &plan.remove_finalizers)
            .await?;
        return Ok(Action::await_change());
    }

    info!("Tearing down network");
    let plan = match read_credentials(ctx.store.as_ref(), &target, &housekeeping, &name).await? {
        Some(creds) => {
            let manager =
                StreamManager::connect(ctx.broker.as_ref(), &creds, ctx.stream_retry.clone()).await?;
            let result = teardown_streams(network, &participation, &finalized, &manager).await;
            manager.close().await;
            result?
        }
        None => {
            warn!("Housekeeping credentials missing, skipping stream teardown");
            run_deletion_pass(&name, &network.spec, &participation, &finalized, None).await
        }
    };

    persist_status(ctx, &namespace, &name, &plan, None, None).await?;
    if !plan.failed_nodes.is_empty() {
        update_network_finalizers(ctx.store.as_ref(), &namespace, &name, &BTreeSet::new(), &plan.remove_finalizers)
            .await?;
        return Err(Error::NodeParticipation {
            network: name,
            nodes: plan.failed_nodes.into_keys().collect(),
        });
    }

    ctx.credentials.delete_network(&name).await?;
    match network.account_name() {
        Some(account) => ctx.credentials.delete_account(&account).await?,
        None => warn!("No account recorded for network, skipping account deletion"),
    }

    for component in all_participants(network).keys() {
        match strip_component(ctx.store.as_ref(), &target, &name, component).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(component = %component, "Secret already removed");
            }
            Err(e) => return Err(e),
        }
    }

    let mut remove = plan.remove_finalizers;
    remove.insert(NETWORK_FINALIZER.to_string());
    update_network_finalizers(ctx.store.as_ref(), &namespace, &name, &BTreeSet::new(), &remove).await?;

    info!("Network torn down");
    Ok(Action::await_change())
}

/// Delete main-domain streams and the streams of every node, whatever pods it still runs
async fn teardown_streams(
    network: &Network,
    participation: &ParticipationStatus,
    finalized: &BTreeSet<String>,
    manager: &StreamManager,
) -> Result<ParticipationPlan> {
    let name = network.name_any();
    let main_streams: Vec<String> = network
        .spec
        .standard_main_streams()
        .chain(network.spec.aggregate_streams())
        .map(|s| s.name.clone())
        .collect();
    manager.delete(MAIN_DOMAIN, &name, &main_streams).await?;
    Ok(run_deletion_pass(&name, &network.spec, participation, finalized, Some(manager)).await)
}
