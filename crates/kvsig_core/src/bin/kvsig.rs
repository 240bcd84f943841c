/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Context;
use kvsig_core::config::SessionConfig;
use kvsig_core::role::Role;
use kvsig_core::runtime;
use rand::RngCore as _;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    runtime::init_tracing();

    let mut cfg = SessionConfig::load().context("load config")?;
    if cfg.role == Role::Viewer && cfg.client_id.as_deref().map(str::trim).unwrap_or("").is_empty() {
        let mut id = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut id);
        cfg.client_id = Some(format!("viewer-{}", hex::encode(id)));
    }
    info!(role=%cfg.role, channel=%cfg.channel_arn, client_id=?cfg.client_id, "starting kvsig");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    runtime::run_session(cfg, shutdown_rx).await
}
