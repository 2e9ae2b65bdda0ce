//! Participants controller
//!
//! Registers a component with the Network it names and removes it again when
//! the Participants object is deleted.

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::reconciler::Context;
use super::retry::retry_on_conflict;
use super::secrets::strip_component;
use crate::crd::{NetworkSpec, ParticipantType, Participants};
use crate::error::Result;

/// Add or retype a participant, returning whether the spec changed
pub fn add_participant(
    spec: &mut NetworkSpec,
    identifier: &str,
    participant_type: ParticipantType,
) -> bool {
    spec.participants.insert(identifier.to_string(), participant_type) != Some(participant_type)
}

/// Remove a participant, returning whether it was present
pub fn remove_participant(spec: &mut NetworkSpec, identifier: &str) -> bool {
    spec.participants.remove(identifier).is_some()
}

fn object_namespace(participants: &Participants) -> String {
    participants
        .namespace()
        .unwrap_or_else(|| "default".to_string())
}

#[instrument(skip(participants, ctx), fields(name = %participants.name_any(), network = %participants.spec.network))]
pub async fn apply(participants: &Participants, ctx: &Context) -> Result<Action> {
    let namespace = object_namespace(participants);
    let network_name = participants.spec.network.as_str();
    let identifier = participants.spec.identifier();
    let participant_type = participants.spec.participant_type;
    let store = ctx.store.as_ref();
    let ns = namespace.as_str();
    let id = identifier.as_str();

    let found = retry_on_conflict("add participant", move || async move {
        let Some(mut network) = store.get_network(ns, network_name).await? else {
            return Ok(false);
        };
        if add_participant(&mut network.spec, id, participant_type) {
            store.replace_network(&network).await?;
            info!(participant = %id, "Added participant to network");
        } else {
            debug!(participant = %id, "Participant already registered");
        }
        Ok(true)
    })
    .await?;

    if !found {
        info!("Network does not exist yet, requeueing");
        return Ok(Action::requeue(ctx.config.requeue));
    }
    Ok(Action::requeue(ctx.config.requeue))
}

#[instrument(skip(participants, ctx), fields(name = %participants.name_any(), network = %participants.spec.network))]
pub async fn cleanup(participants: &Participants, ctx: &Context) -> Result<Action> {
    let namespace = object_namespace(participants);
    let network_name = participants.spec.network.as_str();
    let identifier = participants.spec.identifier();
    let store = ctx.store.as_ref();
    let ns = namespace.as_str();
    let id = identifier.as_str();

    let target = retry_on_conflict("remove participant", move || async move {
        let Some(mut network) = store.get_network(ns, network_name).await? else {
            return Ok(None);
        };
        if remove_participant(&mut network.spec, id) {
            store.replace_network(&network).await?;
            info!(participant = %id, "Removed participant from network");
        }
        Ok(Some(network.target_namespace()))
    })
    .await?;

    let target = target.unwrap_or_else(|| {
        warn!("Network already gone, cleaning secrets in own namespace");
        namespace.clone()
    });
    strip_component(store, &target, network_name, &identifier).await?;
    Ok(Action::await_change())
}
