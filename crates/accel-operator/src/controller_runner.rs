//! Controller runner - builds controller futures for the operator
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller. This keeps controller construction pure and testable.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client};

use accel_common::crd::ClusterPolicy;
use accel_policy::upgrade;
use accel_policy::{error_policy, reconcile, Context, NodeTracker};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Pending node triggers; one queued trigger already covers any burst
const NODE_TRIGGER_BUFFER: usize = 1;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Queue a reconcile trigger; false once the controller dropped its receiver
fn send_trigger(tx: &mut mpsc::Sender<()>) -> bool {
    match tx.try_send(()) {
        Ok(()) => true,
        // a reconcile is already queued
        Err(e) if e.is_full() => true,
        Err(_) => false,
    }
}

/// Watch nodes and emit a trigger whenever a change needs the policies reconciled
///
/// Returns the receiving end for `reconcile_all_on` and the future driving
/// the node watch.
fn node_triggers(client: Client) -> (mpsc::Receiver<()>, ControllerFuture) {
    let (mut tx, rx) = mpsc::channel(NODE_TRIGGER_BUFFER);
    let nodes: Api<Node> = Api::all(client);
    let mut tracker = NodeTracker::new();

    let watch = async move {
        let events = watcher::watcher(nodes, watcher_config()).default_backoff();
        tokio::pin!(events);

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "node watch error");
                    continue;
                }
            };
            if !tracker.observe(&event) {
                continue;
            }
            if !send_trigger(&mut tx) {
                tracing::info!("ClusterPolicy controller stopped, ending node watch");
                break;
            }
        }
    };

    (rx, Box::pin(watch))
}

/// Build the ClusterPolicy controller futures
///
/// The controller reconciles on policy changes, on changes to the
/// DaemonSets it deployed, and on node changes that affect labeling.
pub fn build_policy_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    let policies: Api<ClusterPolicy> = Api::all(client.clone());
    let daemonsets: Api<DaemonSet> = Api::all(client.clone());
    let (triggers, node_watch) = node_triggers(client);

    tracing::info!("- ClusterPolicy controller");

    let policy_ctrl = Controller::new(policies, watcher_config())
        .owns(daemonsets, watcher_config())
        .reconcile_all_on(triggers)
        .with_config(ControllerConfig::default().concurrency(1))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("ClusterPolicy"));

    vec![Box::pin(policy_ctrl), node_watch]
}

/// Build the driver upgrade controller futures
pub fn build_upgrade_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    let policies: Api<ClusterPolicy> = Api::all(client.clone());
    let daemonsets: Api<DaemonSet> = Api::all(client);

    tracing::info!("- driver upgrade controller");

    let upgrade_ctrl = Controller::new(policies, watcher_config())
        .owns(daemonsets, watcher_config())
        .with_config(ControllerConfig::default().concurrency(1))
        .shutdown_on_signal()
        .run(upgrade::reconcile, upgrade::error_policy, ctx)
        .for_each(log_reconcile_result("Upgrade"));

    vec![Box::pin(upgrade_ctrl)]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
