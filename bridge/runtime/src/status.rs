//! Writes the connector's status sub-resource on a fixed timer: sync
//! counts per direction plus the last observed catalog hash.

use crate::controller::{Contexts, Controller};
use registry_bridge_core::ProviderId;
use registry_bridge_k8s_api::{
    Api, ConnectorStatus, ConsulConnector, EurekaConnector, GatewayConnector, MachineConnector,
    NacosConnector, Patch, PatchParams, ZookeeperConnector,
};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub(crate) const STATUS_PERIOD: Duration = Duration::from_secs(10);

/// Patches status until shutdown. Non-leaders stay read-only.
pub(crate) async fn run(controller: Arc<Controller>, shutdown: drain::Watch) {
    let mut interval = tokio::time::interval(STATUS_PERIOD);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let release = shutdown.signaled();
    tokio::pin!(release);
    loop {
        tokio::select! {
            _ = &mut release => return,
            _ = interval.tick() => {}
        }
        if !controller.is_leader() {
            continue;
        }
        let (contexts, last_error) = controller.snapshot().await;
        let status = build(&contexts, last_error.as_deref());
        let (provider, name) = controller.target();
        let client = controller.client();
        let result = match provider {
            ProviderId::Consul => patch(Api::<ConsulConnector>::all(client), name, &status).await,
            ProviderId::Eureka => patch(Api::<EurekaConnector>::all(client), name, &status).await,
            ProviderId::Nacos => patch(Api::<NacosConnector>::all(client), name, &status).await,
            ProviderId::Zookeeper => {
                patch(Api::<ZookeeperConnector>::all(client), name, &status).await
            }
            ProviderId::Machine => patch(Api::<MachineConnector>::all(client), name, &status).await,
            ProviderId::Gateway => patch(Api::<GatewayConnector>::all(client), name, &status).await,
        };
        match result {
            Ok(()) => debug!(connector = %name, "status updated"),
            Err(error) => warn!(connector = %name, %error, "status update failed"),
        }
    }
}

fn build(contexts: &Contexts, last_error: Option<&str>) -> ConnectorStatus {
    let (current_status, reason) = match last_error {
        Some(reason) => ("Error".to_string(), reason.to_string()),
        None => ("Running".to_string(), String::new()),
    };
    ConnectorStatus {
        current_status,
        reason,
        to_k8s_service_cnt: contexts.c2k.as_ref().map(|c| c.synced_count()).unwrap_or(0),
        from_k8s_service_cnt: contexts
            .k2c
            .as_ref()
            .map(|c| c.registered_count())
            .or_else(|| contexts.k2g.as_ref().map(|c| c.synced_count()))
            .unwrap_or(0),
        catalog_services_hash: contexts
            .c2k
            .as_ref()
            .map(|c| format!("{:x}", c.catalog_hash()))
            .unwrap_or_default(),
    }
}

async fn patch<T>(api: Api<T>, name: &str, status: &ConnectorStatus) -> kube::Result<()>
where
    T: Clone + DeserializeOwned + Debug,
{
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({ "status": status })),
    )
    .await
    .map(|_| ())
}
