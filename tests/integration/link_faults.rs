use std::thread;
use std::time::Duration;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Lossy link: drops, duplicates and bit flips in both directions
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_push_survives_lossy_link() {
    let mut rig = Rig::authenticated();
    rig.host_wire.with_faults(|f| {
        f.drop_sends = 2;
        f.duplicate_sends = 3;
        f.corrupt_sends = 1;
    });
    rig.device_wire.with_faults(|f| {
        f.drop_sends = 1;
        f.corrupt_sends = 2;
    });

    let data = pattern(6_000);
    rig.host.push("lossy.bin", &data, 512).expect("push over lossy link");

    // Duplicated chunks were not applied twice: the content is exact.
    assert_eq!(rig.published("lossy.bin").as_deref(), Some(&data[..]));

    let host = rig.host.channel().telemetry().snapshot();
    assert!(host.crc_errors >= 1, "device-side bit flips reach the host");
    assert!(host.timeouts >= 1, "dropped frames were retransmitted");

    let device = rig.device.stop();
    let stats = device.telemetry().snapshot();
    assert!(stats.crc_errors >= 1, "host-side bit flip reaches the device");
}

#[test]
fn test_garbage_on_the_wire_is_skipped() {
    let mut rig = Rig::authenticated();
    rig.device_wire
        .inject(b"\x01\x00noise between frames\xff\xff\xfe");

    let data = pattern(1_500);
    rig.host.push("after-noise.bin", &data, 400).expect("push");
    assert_eq!(rig.published("after-noise.bin").as_deref(), Some(&data[..]));
}

#[test]
fn test_window_bounds_frames_in_flight() {
    let mut rig = Rig::authenticated();
    let window = link_config().window as usize;

    // Stall the device's replies so nothing gets acked.
    rig.device_wire.with_faults(|f| f.cut = true);
    let now = std::time::Instant::now();
    let channel = rig.host.channel_mut();
    for _ in 0..window {
        channel
            .send(datamode_core::MsgType::CtrlGetInfo, 0, &[], now)
            .unwrap();
    }
    assert!(!channel.can_send());
    assert!(matches!(
        channel.send(datamode_core::MsgType::CtrlGetInfo, 0, &[], now),
        Err(datamode_services::ChannelError::WindowFull)
    ));
    assert_eq!(channel.in_flight(), window);
}

// ══════════════════════════════════════════════════════════════════════════════
//  Link loss
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_link_loss_drops_device_session() {
    let mut rig = Rig::authenticated();

    // Replies vanish: the host gives up and so does the device.
    rig.device_wire.with_faults(|f| f.cut = true);
    let err = rig.host.info().unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<datamode_services::ChannelError>(),
            Some(datamode_services::ChannelError::LinkLost)
        ),
        "unexpected error: {err:#}"
    );

    // 20ms base, 6 retries capped at 8x: the device is done well within 2s.
    thread::sleep(Duration::from_secs(2));
    let device = rig.device.stop();
    assert!(!device.auth().is_authenticated());
    assert_eq!(device.channel().in_flight(), 0);
    assert!(device.telemetry().snapshot().timeouts >= 6);
}

#[test]
fn test_session_recovers_after_link_loss() {
    let mut rig = Rig::authenticated();
    rig.device_wire.with_faults(|f| f.cut = true);
    assert!(rig.host.info().is_err());
    thread::sleep(Duration::from_secs(2));
    rig.device_wire.with_faults(|f| f.cut = false);

    // No manual reset: the failed call already started a fresh session.
    let info = rig.host.info().expect("link comes back");
    assert!(!info.authenticated);

    rig.host.authenticate(&secret(), TOKEN).unwrap();
    let data = pattern(800);
    rig.host.push("again.bin", &data, 512).unwrap();
    assert_eq!(rig.published("again.bin").as_deref(), Some(&data[..]));
}
