// Copyright 2023 runtime-shady-backroom
// This file is part of bilateral-haptic-core.
// bilateral-haptic-core is licensed under the AGPL-3.0 license (see LICENSE file for details).

//! Boot sequence: establishes the paired wireless link before the
//! application loop starts running ticks.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::ports::{ConnectionHandle, ConnectionSlot, LinkPort};

const SECONDARY_SCAN_WINDOW: Duration = Duration::from_secs(5);
const SECONDARY_CONNECT_WAIT: Duration = Duration::from_secs(5);
const SECONDARY_SERVICE_DISCOVERY_PAUSE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootResult {
    Failed,
    Success,
    SuccessNoPhone,
    SuccessWithPhone,
}

/// PRIMARY boot: advertise under `ble_name`, accept the first incoming
/// SECONDARY connection within `startup_window`, then spend the remainder of
/// the window accepting an optional phone connection.
pub async fn boot_primary(link: &dyn LinkPort, ble_name: &str, startup_window: Duration) -> (BootResult, Option<ConnectionHandle>, Option<ConnectionHandle>) {
    if let Err(err) = link.set_identity(ble_name).await {
        warn!("failed to set PRIMARY identity: {err}");
        return (BootResult::Failed, None, None);
    }
    if let Err(err) = link.advertise(ble_name).await {
        warn!("failed to advertise as {ble_name}: {err}");
        return (BootResult::Failed, None, None);
    }

    let deadline = tokio::time::Instant::now() + startup_window;
    let remaining = |now: tokio::time::Instant| deadline.saturating_duration_since(now);

    let secondary_handle = match link.wait_for_connection(ConnectionSlot::Secondary, remaining(tokio::time::Instant::now())).await {
        Ok(handle) => handle,
        Err(err) => {
            warn!("no SECONDARY connected within startup window: {err}");
            return (BootResult::Failed, None, None);
        }
    };
    info!("SECONDARY connected during boot");

    let phone_window = remaining(tokio::time::Instant::now());
    if phone_window.is_zero() {
        return (BootResult::SuccessNoPhone, Some(secondary_handle), None);
    }

    match link.wait_for_connection(ConnectionSlot::Phone, phone_window).await {
        Ok(phone_handle) => {
            info!("phone connected during boot");
            (BootResult::SuccessWithPhone, Some(secondary_handle), Some(phone_handle))
        }
        Err(_) => (BootResult::SuccessNoPhone, Some(secondary_handle), None),
    }
}

/// SECONDARY boot: identity is `<ble_name>-Secondary`, never advertised.
/// Repeatedly scans for `ble_name` in 5 s windows until the outer
/// `startup_window` expires, then waits up to 5 s for the link to report
/// connected and pauses 200 ms for service discovery.
pub async fn boot_secondary(link: &dyn LinkPort, ble_name: &str, startup_window: Duration) -> (BootResult, Option<ConnectionHandle>) {
    let identity = format!("{ble_name}-Secondary");
    if let Err(err) = link.set_identity(&identity).await {
        warn!("failed to set SECONDARY identity: {err}");
        return (BootResult::Failed, None);
    }

    let deadline = tokio::time::Instant::now() + startup_window;

    let handle = loop {
        if tokio::time::Instant::now() >= deadline {
            warn!("SECONDARY boot scan exhausted startup window without finding {ble_name}");
            return (BootResult::Failed, None);
        }

        match link.scan_and_connect(ble_name, SECONDARY_SCAN_WINDOW).await {
            Ok(handle) => break handle,
            Err(_) => continue,
        }
    };

    match link.wait_for_connection(ConnectionSlot::Primary, SECONDARY_CONNECT_WAIT).await {
        Ok(_) => {
            tokio::time::sleep(SECONDARY_SERVICE_DISCOVERY_PAUSE).await;
            (BootResult::Success, Some(handle))
        }
        Err(err) => {
            warn!("PRIMARY link did not report connected: {err}");
            (BootResult::Failed, None)
        }
    }
}
