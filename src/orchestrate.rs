//! Dependency-ordered bring-up.
//!
//! Translates the selected subgraph of a composition into cluster
//! resources. One task runs per service: it waits for each antecedent to
//! be created and to reach the declared readiness level, creates its own
//! pod (and a cluster service when ports are published), then — unless
//! detach mode is on — waits for its own readiness. Create calls are
//! therefore consistent with a topological order of the dependency DAG.
//!
//! The composition is read-only at this point, so tasks share it without
//! locks; creation signals travel over watch channels. Cancellation
//! propagates into every waiter, and the first failure cancels the rest
//! of the bring-up.

use crate::cluster::{ClusterClient, PodDefinition, ServiceDefinition, VolumeMountPlan};
use crate::compose::{Composition, Readiness, Service};
use crate::error::{Error, Result};
use crate::volume::VolumeInitImage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Options for a bring-up run.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpOptions {
    /// Return once every create call has been issued, without awaiting
    /// readiness beyond dependency satisfaction.
    pub detach: bool,
    /// Populate each pod's user from the service's `user` key.
    pub run_as_user: bool,
}

/// Builds the pod definition for one service.
///
/// Environment variables cross this boundary sorted by key; pass-through
/// variables absent from the caller's environment are omitted.
pub fn pod_definition(
    service: &Service,
    volume_init: Option<&VolumeInitImage>,
    run_as_user: bool,
) -> Result<PodDefinition> {
    let image = service
        .compose
        .image
        .clone()
        .ok_or_else(|| Error::NoImage(service.name.clone()))?;
    let mut environment = Vec::with_capacity(service.compose.environment.len());
    for (key, value) in &service.compose.environment {
        match value {
            Some(v) => environment.push((key.clone(), v.clone())),
            None => {
                if let Ok(v) = std::env::var(key) {
                    environment.push((key.clone(), v));
                }
            }
        }
    }
    let mounts = service
        .compose
        .volumes
        .iter()
        .enumerate()
        .map(|(idx, bind)| VolumeMountPlan {
            volume: format!("vol{}", idx + 1),
            mount_path: bind.container_path.clone(),
            read_only: bind.read_only,
            host_is_dir: volume_init
                .and_then(|v| v.is_dir.get(idx).copied())
                .unwrap_or(true),
        })
        .collect();
    Ok(PodDefinition {
        name: service.name.clone(),
        image,
        entrypoint: service.compose.entrypoint.clone(),
        working_dir: service.compose.working_dir.clone(),
        user: if run_as_user {
            service.compose.user.clone()
        } else {
            None
        },
        environment,
        ports: service.compose.ports.clone(),
        mounts,
        volume_init_image: volume_init.map(|v| v.image_id.clone()),
        probe: service
            .compose
            .healthcheck
            .as_ref()
            .and_then(|h| h.probe())
            .cloned(),
    })
}

/// Brings up the selected services of a composition in dependency order.
///
/// `volume_images` maps a service name to its built volume-init image;
/// services without bind mounts need no entry. When the composition has
/// filter marks, only the marked subgraph is deployed.
pub async fn bring_up(
    composition: &Composition,
    volume_images: &HashMap<String, VolumeInitImage>,
    client: Arc<dyn ClusterClient>,
    options: UpOptions,
    cancel: CancellationToken,
) -> Result<()> {
    let selected = composition.selected();
    info!(services = selected.len(), detach = options.detach, "bringing up services");

    let mut created_tx: HashMap<usize, watch::Sender<bool>> = HashMap::new();
    let mut created_rx: HashMap<usize, watch::Receiver<bool>> = HashMap::new();
    for &idx in &selected {
        let (tx, rx) = watch::channel(false);
        created_tx.insert(idx, tx);
        created_rx.insert(idx, rx);
    }

    // Build every definition up front so a bad service aborts before any
    // create call is issued.
    let mut pods: Vec<(usize, PodDefinition)> = Vec::with_capacity(selected.len());
    for &idx in &selected {
        let service = composition.service(idx);
        let pod = pod_definition(
            service,
            volume_images.get(&service.name),
            options.run_as_user,
        )?;
        pods.push((idx, pod));
    }

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    for (idx, pod) in pods {
        let service = composition.service(idx);
        let cluster_service = if pod.ports.is_empty() {
            None
        } else {
            Some(ServiceDefinition {
                name: service.name.clone(),
                ports: pod.ports.clone(),
            })
        };
        // Filter selection is closed under dependencies, so every
        // antecedent has a channel.
        let antecedents: Vec<(String, Readiness, watch::Receiver<bool>)> = service
            .depends_on
            .iter()
            .map(|dep| {
                (
                    composition.service(dep.target).name.clone(),
                    dep.readiness,
                    created_rx[&dep.target].clone(),
                )
            })
            .collect();
        let own_readiness = if options.detach {
            None
        } else if service.compose.probe_enabled() {
            Some(Readiness::Healthy)
        } else {
            Some(Readiness::Started)
        };
        let tx = created_tx
            .remove(&idx)
            .expect("one sender per selected service");
        let client = Arc::clone(&client);
        let cancel = cancel.clone();
        tasks.spawn(bring_up_service(
            pod,
            cluster_service,
            antecedents,
            own_readiness,
            tx,
            client,
            cancel,
        ));
    }
    drop(created_rx);

    let mut first_error: Option<Error> = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.unwrap_or_else(|e| panic!("bring-up task panicked: {e}"));
        if let Err(err) = outcome {
            if first_error.is_none() {
                // Stop the remaining waiters; the first failure is the
                // one reported.
                cancel.cancel();
                first_error = Some(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn bring_up_service(
    pod: PodDefinition,
    cluster_service: Option<ServiceDefinition>,
    antecedents: Vec<(String, Readiness, watch::Receiver<bool>)>,
    own_readiness: Option<Readiness>,
    created: watch::Sender<bool>,
    client: Arc<dyn ClusterClient>,
    cancel: CancellationToken,
) -> Result<()> {
    for (dep_name, readiness, mut rx) in antecedents {
        let created = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            created = rx.wait_for(|created| *created) => created.map(|_| ()),
        };
        // A closed channel means the antecedent's task died without
        // creating its pod.
        if created.is_err() {
            return Err(Error::Cancelled);
        }
        debug!(pod = %pod.name, dependency = %dep_name, %readiness, "waiting for dependency");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = client.wait_for_pod(&dep_name, readiness) => result?,
        }
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        result = client.create_pod(&pod) => result?,
    }
    let _ = created.send(true);
    if let Some(service) = &cluster_service {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = client.create_service(service) => result?,
        }
    }
    if let Some(readiness) = own_readiness {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = client.wait_for_pod(&pod.name, readiness) => result?,
        }
    }
    info!(pod = %pod.name, "service is up");
    Ok(())
}
