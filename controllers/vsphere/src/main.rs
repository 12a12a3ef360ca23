//! vSphere Controller
//!
//! Unified controller for the VMops CRDs:
//! - VirtualMachine: converges backend VMs to their declared spec
//! - AddressClaim: created per pool reference, resolved externally
//! - DeploymentZone: validates placement against backend inventory
//!
//! Watches feed a keyed work queue; a pool of workers reconciles keys
//! with per-key serialization and Fibonacci error backoff.

mod backoff;
mod context;
mod controller;
mod error;
mod mapper;
mod nodes;
mod queue;
mod reconciler;
mod watcher;

#[cfg(test)]
mod test_utils;

use std::env;

use anyhow::{Context, Result};
use tracing::info;

use crate::controller::Controller;
use crate::reconciler::Credentials;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("Starting vSphere Controller");

    let username = env::var("VSPHERE_USERNAME")
        .context("VSPHERE_USERNAME environment variable is required")?;
    let password = env::var("VSPHERE_PASSWORD")
        .context("VSPHERE_PASSWORD environment variable is required")?;
    let namespace = env::var("WATCH_NAMESPACE").ok();
    let workers = env::var("RECONCILE_WORKERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2);

    info!("Configuration:");
    info!("  Username: {}", username);
    info!("  Namespace: {}", namespace.as_deref().unwrap_or("default"));
    info!("  Workers: {}", workers);

    let controller = Controller::new(Credentials { username, password }, namespace, workers).await?;
    controller.run().await?;

    Ok(())
}
