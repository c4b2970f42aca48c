use datamode_core::message::{BeginRequest, ChunkRequest};
use datamode_core::wire::crc32;
use datamode_core::MsgType;
use datamode_services::journal::JournalRecord;
use datamode_services::storage::Storage;
use datamode_services::{FileJournalStore, FsStorage, RecoveryOutcome, TransferJournal};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Power loss: the device dies without any shutdown path
// ══════════════════════════════════════════════════════════════════════════════

fn journal_len(dir: &std::path::Path) -> u64 {
    std::fs::metadata(journal_path(dir)).map_or(0, |m| m.len())
}

struct Rebooted {
    dir: TempDir,
    device: Device,
    outcome: RecoveryOutcome,
    host_wire: LoopbackTransport,
}

/// Drop the running link and boot a new one on the same directory.
fn reboot(rig: Rig) -> Rebooted {
    let Rig { device, dir, .. } = rig;
    drop(device.stop());
    let (host_wire, device_wire) = LoopbackTransport::pair();
    let mut device = build_device(dir.path(), device_wire);
    let outcome = device.recover().expect("recovery");
    Rebooted {
        dir,
        device,
        outcome,
        host_wire,
    }
}

#[test]
fn test_power_loss_mid_transfer_rolls_back() {
    let mut rig = Rig::authenticated();
    let data = pattern(1_000);
    let begin = BeginRequest {
        size: data.len() as u32,
        crc: None,
        path: "partial.bin".into(),
    };
    rig.host.call(MsgType::FsBegin, &begin.encode()).unwrap();
    let chunk = ChunkRequest {
        offset: 0,
        data: &data[..400],
    };
    rig.host.call(MsgType::FsData, &chunk.encode()).unwrap();
    assert!(rig.staged_exists("partial.bin"));
    assert!(journal_len(rig.dir.path()) > 0);

    let boot = reboot(rig);

    assert_eq!(
        boot.outcome,
        RecoveryOutcome::RolledBack {
            path: "partial.bin".into()
        }
    );
    let files = files_dir(boot.dir.path());
    assert!(!files.join("partial.bin").exists());
    assert!(!files.join("partial.bin.part").exists());
    assert_eq!(journal_len(boot.dir.path()), 0);
    assert_eq!(boot.device.transfers().state().as_str(), "aborted");
    assert!(boot.device.transfers().context().is_none());
}

#[test]
fn test_power_loss_after_done_still_rolls_back() {
    let mut rig = Rig::authenticated();
    let data = pattern(300);
    let begin = BeginRequest {
        size: data.len() as u32,
        crc: Some(crc32(&data)),
        path: "uncommitted.bin".into(),
    };
    rig.host.call(MsgType::FsBegin, &begin.encode()).unwrap();
    let chunk = ChunkRequest {
        offset: 0,
        data: &data,
    };
    rig.host.call(MsgType::FsData, &chunk.encode()).unwrap();
    rig.host
        .call(MsgType::FsDone, &datamode_core::message::encode_done(begin.crc))
        .unwrap();

    let boot = reboot(rig);

    assert!(matches!(boot.outcome, RecoveryOutcome::RolledBack { .. }));
    assert!(!files_dir(boot.dir.path()).join("uncommitted.bin").exists());
}

#[test]
fn test_committed_file_survives_power_loss() {
    let mut rig = Rig::authenticated();
    let data = pattern(2_500);
    rig.host.push("kept.bin", &data, 1_000).unwrap();

    let boot = reboot(rig);

    assert_eq!(boot.outcome, RecoveryOutcome::Clean);
    let published = std::fs::read(files_dir(boot.dir.path()).join("kept.bin")).unwrap();
    assert_eq!(published, data);
}

#[test]
fn test_commit_journaled_but_not_published_is_finished_on_boot() {
    let dir = tempfile::tempdir().unwrap();
    let data = pattern(700);
    let crc = crc32(&data);

    // Everything up to the commit record made it to disk; the rename did not.
    {
        let mut storage = FsStorage::new(files_dir(dir.path())).unwrap();
        let store = FileJournalStore::open(journal_path(dir.path())).unwrap();
        let mut journal = TransferJournal::new(store);
        journal
            .append(&JournalRecord::Begin {
                transfer_id: 9,
                size: data.len() as u32,
                crc: Some(crc),
                path: "late.bin".into(),
            })
            .unwrap();
        storage.open_write("late.bin", data.len() as u32).unwrap();
        journal
            .append(&JournalRecord::Data {
                transfer_id: 9,
                offset: 0,
                len: data.len() as u32,
                content_crc: crc,
            })
            .unwrap();
        storage.write_at("late.bin", 0, &data).unwrap();
        storage.flush("late.bin").unwrap();
        journal
            .append(&JournalRecord::Done {
                transfer_id: 9,
                received: data.len() as u32,
                crc,
            })
            .unwrap();
        journal
            .append(&JournalRecord::Commit { transfer_id: 9 })
            .unwrap();
    }

    let (_host_wire, device_wire) = LoopbackTransport::pair();
    let mut device = build_device(dir.path(), device_wire);
    let outcome = device.recover().unwrap();

    assert_eq!(
        outcome,
        RecoveryOutcome::Committed {
            path: "late.bin".into()
        }
    );
    let published = std::fs::read(files_dir(dir.path()).join("late.bin")).unwrap();
    assert_eq!(published, data);
    assert!(!files_dir(dir.path()).join("late.bin.part").exists());
    assert_eq!(journal_len(dir.path()), 0);
    assert_eq!(device.transfers().state().as_str(), "committed");
}

#[test]
fn test_new_transfer_after_reboot() {
    let mut rig = Rig::authenticated();
    let begin = BeginRequest {
        size: 10,
        crc: None,
        path: "first.bin".into(),
    };
    rig.host.call(MsgType::FsBegin, &begin.encode()).unwrap();

    let boot = reboot(rig);
    assert!(matches!(boot.outcome, RecoveryOutcome::RolledBack { .. }));

    let running = RunningDevice::start(boot.device);
    let mut host = host_session(boot.host_wire);
    host.authenticate(&secret(), TOKEN).unwrap();
    assert_eq!(host.info().unwrap().transfer_state, "aborted");
    let data = pattern(64);
    host.push("second.bin", &data, 512).unwrap();
    drop(running);

    assert_eq!(
        std::fs::read(files_dir(boot.dir.path()).join("second.bin")).unwrap(),
        data
    );
}
