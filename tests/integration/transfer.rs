use datamode_core::message::{encode_done, BeginRequest, ChunkRequest};
use datamode_core::{MsgType, NakCode};

use crate::*;

#[test]
fn test_push_commits_small_file() {
    let mut rig = Rig::authenticated();
    let data = pattern(100);

    rig.host.push("hello.bin", &data, 512).expect("push");

    assert_eq!(rig.published("hello.bin").as_deref(), Some(&data[..]));
    assert!(!rig.staged_exists("hello.bin"));
    let info = rig.host.info().unwrap();
    assert_eq!(info.transfer_state, "committed");
    assert!(info.authenticated);
}

#[test]
fn test_push_many_chunks_into_subdirectory() {
    let mut rig = Rig::authenticated();
    let data = pattern(20_000);

    rig.host.push("audio/track01.pcm", &data, 700).expect("push");

    assert_eq!(rig.published("audio/track01.pcm").as_deref(), Some(&data[..]));
}

#[test]
fn test_empty_file() {
    let mut rig = Rig::authenticated();
    rig.host.push("empty.txt", &[], 512).expect("push");
    assert_eq!(rig.published("empty.txt").as_deref(), Some(&[][..]));
}

#[test]
fn test_crc_mismatch_blocks_commit() {
    let mut rig = Rig::authenticated();
    let data = pattern(300);
    let begin = BeginRequest {
        size: data.len() as u32,
        crc: None,
        path: "bad.bin".into(),
    };
    rig.host.call(MsgType::FsBegin, &begin.encode()).unwrap();
    let chunk = ChunkRequest {
        offset: 0,
        data: &data,
    };
    rig.host.call(MsgType::FsData, &chunk.encode()).unwrap();

    let err = rig
        .host
        .call(MsgType::FsDone, &encode_done(Some(0xDEAD_BEEF)))
        .unwrap_err();
    assert_eq!(nak_code(&err), Some(NakCode::IncompleteTransfer));

    let err = rig.host.call(MsgType::FsCommit, &[]).unwrap_err();
    assert_eq!(nak_code(&err), Some(NakCode::InvalidState));

    rig.host.abort().unwrap();
    assert!(rig.published("bad.bin").is_none());
    assert!(!rig.staged_exists("bad.bin"));
}

#[test]
fn test_out_of_order_chunk_is_refused() {
    let mut rig = Rig::authenticated();
    let begin = BeginRequest {
        size: 100,
        crc: None,
        path: "gap.bin".into(),
    };
    rig.host.call(MsgType::FsBegin, &begin.encode()).unwrap();
    let chunk = ChunkRequest {
        offset: 50,
        data: &[0; 50],
    };
    let err = rig.host.call(MsgType::FsData, &chunk.encode()).unwrap_err();
    assert_eq!(nak_code(&err), Some(NakCode::OutOfOrderChunk));
}

#[test]
fn test_second_begin_while_active() {
    let mut rig = Rig::authenticated();
    let begin = BeginRequest {
        size: 10,
        crc: None,
        path: "one.bin".into(),
    };
    rig.host.call(MsgType::FsBegin, &begin.encode()).unwrap();
    let err = rig.host.call(MsgType::FsBegin, &begin.encode()).unwrap_err();
    assert_eq!(nak_code(&err), Some(NakCode::TransferInProgress));
}

#[test]
fn test_path_escape_is_refused() {
    let mut rig = Rig::authenticated();
    let err = rig.host.push("../outside.bin", b"x", 512).unwrap_err();
    assert_eq!(nak_code(&err), Some(NakCode::InvalidPath));
    assert!(!rig.dir.path().join("outside.bin").exists());
}

#[test]
fn test_resume_after_host_restart() {
    let mut rig = Rig::authenticated();
    let data = pattern(2_000);
    let begin = BeginRequest {
        size: data.len() as u32,
        crc: Some(datamode_core::wire::crc32(&data)),
        path: "resumed.bin".into(),
    };
    let raw = rig.host.call(MsgType::FsBegin, &begin.encode()).unwrap();
    let id = datamode_core::message::decode_transfer_id(&raw).unwrap();
    for offset in [0usize, 500] {
        let chunk = ChunkRequest {
            offset: offset as u32,
            data: &data[offset..offset + 500],
        };
        rig.host.call(MsgType::FsData, &chunk.encode()).unwrap();
    }

    // The host tool crashes and a new one connects on the same link.
    let mut host = host_session(rig.host_wire.clone());
    let err = host.resume(id).unwrap_err();
    assert_eq!(nak_code(&err), Some(NakCode::NotAuthenticated));
    host.authenticate(&secret(), TOKEN).unwrap();
    let offset = host.resume(id).unwrap();
    assert_eq!(offset, 1_000);

    for start in (offset as usize..data.len()).step_by(500) {
        let chunk = ChunkRequest {
            offset: start as u32,
            data: &data[start..start + 500],
        };
        host.call(MsgType::FsData, &chunk.encode()).unwrap();
    }
    host.call(MsgType::FsDone, &encode_done(begin.crc)).unwrap();
    host.call(MsgType::FsCommit, &[]).unwrap();

    assert_eq!(rig.published("resumed.bin").as_deref(), Some(&data[..]));
}

#[test]
fn test_storage_diagnostics() {
    let mut rig = Rig::authenticated();
    assert!(rig.host.sd_free().unwrap() > 0);
}
