//! Removal of devices from a running PAN
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
mod common;

use common::{coordinator_settings, device_settings, eui, Pan};
use g3_bridge::adp::{AdpRequest, Status};
use g3_bridge::bootstrap::devices::{DeviceState, IN_USE};
use g3_bridge::bootstrap::lbp::MessageType;
use g3_bridge::hif::{HostMessage, HostRequest};
use g3_bridge::last_gasp::LAST_GASP;

const CONNECTED: u8 = DeviceState::Connected as u8;

#[test]
fn kick_removes_device() {
    let mut pan = Pan::new(&[1, 2]);
    pan.join_all();

    pan.host(HostRequest::ServerKick { ext_addr: eui(1) });

    let messages = pan.coordinator_messages();
    assert!(messages.contains(&HostMessage::ServerKickConfirm {
        status: Status::Success
    }));
    assert!(messages.contains(&HostMessage::ServerLeaveIndication {
        ext_addr: eui(1),
        short_addr: 0x0001,
    }));
    assert_eq!(pan.count_frames(MessageType::KickToLbd, None), 1);

    assert_eq!(
        pan.device_messages(0).last(),
        Some(&HostMessage::DeviceLeaveIndication)
    );
    assert!(!pan.client(0).is_connected());
    assert!(pan.client(1).is_connected());
    assert_eq!(pan.server().devices().count(IN_USE), 1);

    pan.host(HostRequest::ServerKick { ext_addr: eui(1) });
    assert_eq!(
        pan.coordinator_messages().last(),
        Some(&HostMessage::ServerKickConfirm {
            status: Status::InvalidParameter
        })
    );
}

#[test]
fn device_leave() {
    let mut pan = Pan::new(&[1]);
    pan.join_all();

    pan.device_host(0, HostRequest::DeviceLeave);

    assert_eq!(pan.count_frames(MessageType::KickFromLbd, None), 1);
    assert_eq!(
        pan.device_messages(0).last(),
        Some(&HostMessage::DeviceLeaveConfirm {
            status: Status::Success
        })
    );
    assert!(!pan.client(0).is_connected());

    assert_eq!(
        pan.coordinator_messages().last(),
        Some(&HostMessage::ServerLeaveIndication {
            ext_addr: eui(1),
            short_addr: 0x0001,
        })
    );
    assert_eq!(pan.server().devices().count(IN_USE), 0);

    // Nothing left to leave.
    pan.device_host(0, HostRequest::DeviceLeave);
    assert_eq!(
        pan.device_messages(0).last(),
        Some(&HostMessage::DeviceLeaveConfirm {
            status: Status::InvalidRequest
        })
    );
}

#[test]
fn silent_device_is_removed() {
    let mut coordinator = coordinator_settings();
    coordinator.keep_alive.enabled = true;
    coordinator.keep_alive.period_ms = 60_000;
    coordinator.keep_alive.timeout_ms = 10_000;
    coordinator.keep_alive.lives = 2;

    let mut pan = Pan::with_settings(&coordinator, vec![device_settings(1), device_settings(2)]);
    pan.join_all();

    pan.muted.push(eui(2));
    pan.advance(200_000);

    let leaves: Vec<_> = pan
        .coordinator_messages()
        .iter()
        .filter(|message| matches!(message, HostMessage::ServerLeaveIndication { .. }))
        .collect();
    assert_eq!(
        leaves,
        [&HostMessage::ServerLeaveIndication {
            ext_addr: eui(2),
            short_addr: 0x0002,
        }]
    );

    let devices = pan.server().devices();
    assert_eq!(devices.count(IN_USE), 1);
    let healthy = devices
        .find(&eui(1), CONNECTED)
        .and_then(|slot| devices.get(slot))
        .unwrap();
    assert_eq!(healthy.lives, 2);
}

#[test]
fn keep_alive_disabled_by_default() {
    let mut pan = Pan::new(&[1]);
    pan.join_all();
    pan.muted.push(eui(1));

    pan.advance(600_000);

    assert_eq!(pan.server().devices().count(CONNECTED), 1);
    assert!(pan
        .coordinator
        .iface()
        .requests
        .iter()
        .all(|request| !matches!(request, AdpRequest::Data { .. })));
}

#[test]
fn last_gasp_reported_once() {
    let mut pan = Pan::new(&[1]);
    pan.join_all();

    pan.power_loss(0);
    pan.advance(1_000);

    let gasps: Vec<_> = pan
        .coordinator_messages()
        .iter()
        .filter(|message| matches!(message, HostMessage::LastGaspIndication { .. }))
        .collect();
    assert_eq!(
        gasps,
        [&HostMessage::LastGaspIndication {
            ext_addr: eui(1),
            short_addr: 0x0001,
        }]
    );
    assert_eq!(pan.server().devices().count(IN_USE), 0);

    let sent = pan.devices[0]
        .iface()
        .requests
        .iter()
        .filter(|request| {
            matches!(request, AdpRequest::Data { payload, .. } if payload.first() == Some(&LAST_GASP))
        })
        .count();
    assert_eq!(sent, 3);
}

#[test]
fn disconnected_device_stays_silent_on_power_loss() {
    let mut pan = Pan::new(&[1]);
    pan.start_network();

    pan.power_loss(0);
    pan.advance(1_000);

    assert!(pan.devices[0]
        .iface()
        .requests
        .iter()
        .all(|request| !matches!(request, AdpRequest::Data { .. })));
}
