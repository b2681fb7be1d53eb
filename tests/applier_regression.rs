use std::sync::Arc;

use anyhow::Result;
use stranddb::archive::keys;
use stranddb::cdc::{self, Operation};
use stranddb::{ArchiveStore, BlockStore, Hash, KeyValueStore, MemoryKv, OpProcessor, StateUpdate, EMPTY_ROOT};

const TOPIC: &str = "chain";

fn h(byte: u8) -> Hash {
    Hash([byte; 32])
}

struct Fixture {
    db: Arc<MemoryKv>,
    archive: Arc<ArchiveStore>,
    blocks: Arc<BlockStore>,
    processor: OpProcessor,
}

fn fixture() -> Fixture {
    let db = Arc::new(MemoryKv::new());
    let archive = Arc::new(ArchiveStore::new(db.clone(), 256));
    let blocks = Arc::new(BlockStore::new(db.clone() as Arc<dyn KeyValueStore>));
    let processor = OpProcessor::new(archive.clone(), blocks.clone(), 64, 64);
    Fixture {
        db,
        archive,
        blocks,
        processor,
    }
}

fn ops_for(update: &StateUpdate) -> Vec<Operation> {
    cdc::state_update_ops(
        &update.root,
        &update.parent,
        &update.destructs,
        &update.accounts,
        &update.storage,
    )
}

/// Feed `ops` in order, assigning offsets `start, start+10, ...`; returns
/// the offset of the last event.
fn feed(processor: &mut OpProcessor, ops: Vec<Operation>, start: i64) -> Result<i64> {
    let mut offset = start - 10;
    for mut op in ops {
        offset += 10;
        op.offset = offset;
        op.topic = TOPIC.into();
        processor.apply(&op)?;
    }
    Ok(offset)
}

fn state_snapshot(db: &MemoryKv) -> Vec<(Vec<u8>, Vec<u8>)> {
    db.iter_prefix(b"")
        .unwrap()
        .into_iter()
        .filter(|(key, _)| !key.starts_with(b"cdc-log"))
        .collect()
}

#[test]
fn interleaved_fragments_commit_in_done_order() -> Result<()> {
    let mut fx = fixture();
    let (a1, a2, s1) = (h(0xA1), h(0xA2), h(0x51));

    let first = StateUpdate::new(h(1), EMPTY_ROOT)
        .account(a1, "acct1")
        .storage(a1, s1, "v1");
    let second = StateUpdate::new(h(2), h(1)).account(a2, "acct2");

    // Interleave the two roots' fragments; each SU_DONE trails its own
    // fragments, which is all the applier requires.
    let mut ops1 = ops_for(&first);
    let mut ops2 = ops_for(&second);
    let done2 = ops2.pop().unwrap();
    let done1 = ops1.pop().unwrap();
    let mut stream = Vec::new();
    stream.extend(ops1);
    stream.extend(ops2);
    stream.push(done1);
    stream.push(done2);

    let last = feed(&mut fx.processor, stream, 10)?;

    assert!(fx.archive.has_root(&h(1))?);
    assert!(fx.archive.has_root(&h(2))?);
    assert_eq!(
        fx.archive.lookup(&h(2), &keys::account_key(&a1))?,
        Some(b"acct1".to_vec())
    );

    let offset = cdc::read_offset(fx.db.as_ref(), TOPIC)?.expect("offset must be recorded");
    assert_eq!(offset.offset, last);
    Ok(())
}

#[test]
fn replaying_a_committed_update_is_a_noop_that_advances_the_offset() -> Result<()> {
    let mut fx = fixture();
    let a1 = h(0xA1);

    let first = StateUpdate::new(h(1), EMPTY_ROOT).account(a1, "acct1");
    let second = StateUpdate::new(h(2), h(1)).account(a1, "acct1b");
    feed(&mut fx.processor, ops_for(&first), 10)?;
    let last = feed(&mut fx.processor, ops_for(&second), 100)?;

    let before = state_snapshot(&fx.db);

    // At-least-once delivery: the writer resends the whole second update.
    let replayed = feed(&mut fx.processor, ops_for(&second), last + 10)?;

    assert_eq!(state_snapshot(&fx.db), before);
    let offset = cdc::read_offset(fx.db.as_ref(), TOPIC)?.unwrap();
    assert_eq!(offset.offset, replayed);
    Ok(())
}

#[test]
fn resumed_commit_marker_alone_is_deduplicated() -> Result<()> {
    let mut fx = fixture();
    let update = StateUpdate::new(h(1), EMPTY_ROOT).account(h(0xA1), "acct1");
    let last = feed(&mut fx.processor, ops_for(&update), 10)?;

    // A restarted consumer re-reads the final marker at the same offset.
    // The fragments are long gone, but the root is known: no-op.
    let mut done = ops_for(&update).pop().unwrap();
    done.offset = last;
    done.topic = TOPIC.into();
    fx.processor.apply(&done)?;

    let offset = cdc::read_offset(fx.db.as_ref(), TOPIC)?.unwrap();
    assert_eq!(offset.offset, last);
    assert!(fx.archive.has_root(&h(1))?);
    Ok(())
}

#[test]
fn dedup_survives_a_process_restart() -> Result<()> {
    let mut fx = fixture();
    let update = StateUpdate::new(h(1), EMPTY_ROOT).account(h(0xA1), "acct1");
    feed(&mut fx.processor, ops_for(&update), 10)?;
    let before = state_snapshot(&fx.db);

    // Fresh processor over the same substrate: in-memory dedup sets are
    // empty, but the root record short-circuits the rewrite.
    let blocks = Arc::new(BlockStore::new(fx.db.clone() as Arc<dyn KeyValueStore>));
    let mut restarted = OpProcessor::new(fx.archive.clone(), blocks, 64, 64);
    feed(&mut restarted, ops_for(&update), 10)?;

    assert_eq!(state_snapshot(&fx.db), before);
    Ok(())
}

#[test]
fn done_for_unknown_parent_drops_and_advances() -> Result<()> {
    let mut fx = fixture();
    // Parent h(9) was never applied.
    let orphan = StateUpdate::new(h(2), h(9)).account(h(0xA1), "acct");
    let last = feed(&mut fx.processor, ops_for(&orphan), 10)?;

    assert!(!fx.archive.has_root(&h(2))?);
    let offset = cdc::read_offset(fx.db.as_ref(), TOPIC)?.unwrap();
    assert_eq!(offset.offset, last);

    // Progress continues: a valid update applies afterwards.
    let valid = StateUpdate::new(h(1), EMPTY_ROOT).account(h(0xA1), "acct");
    feed(&mut fx.processor, ops_for(&valid), last + 10)?;
    assert!(fx.archive.has_root(&h(1))?);
    Ok(())
}

#[test]
fn dropped_first_event_at_offset_zero_is_recorded() -> Result<()> {
    let mut fx = fixture();
    // The topic's very first message is a commit marker for a root whose
    // parent was never declared. The event is dropped, but position 0 must
    // stick so a restart does not reprocess it.
    let done = Operation {
        op: cdc::OP_SU_DONE,
        data: h(1).as_ref().to_vec(),
        offset: 0,
        topic: TOPIC.into(),
    };
    fx.processor.apply(&done)?;

    assert!(!fx.archive.has_root(&h(1))?);
    let record = cdc::read_offset(fx.db.as_ref(), TOPIC)?.expect("offset must be recorded");
    assert_eq!(record.offset, 0);
    Ok(())
}

#[test]
fn truncated_fragment_is_a_decode_error() {
    let mut fx = fixture();
    let op = Operation {
        op: cdc::OP_SU_STORAGE,
        data: vec![0u8; 50],
        offset: 10,
        topic: TOPIC.into(),
    };
    let err = fx.processor.apply(&op).unwrap_err();
    assert!(!err.is_transient());
}

#[test]
fn block_metadata_events_reach_the_block_store() -> Result<()> {
    let mut fx = fixture();
    let hash = Hash::digest(b"block-9");

    let stream = vec![
        cdc::write_header(&hash, 9, b"header-rlp"),
        cdc::write_body(&hash, 9, b"body-rlp"),
        cdc::write_td(&hash, 9, b"td"),
        cdc::write_receipts(&hash, 9, b"receipts-rlp"),
    ];
    let last = feed(&mut fx.processor, stream, 10)?;

    assert_eq!(fx.blocks.header(&hash, 9)?, Some(b"header-rlp".to_vec()));
    assert_eq!(fx.blocks.body(&hash, 9)?, Some(b"body-rlp".to_vec()));
    assert_eq!(fx.blocks.head_block()?, Some((9, hash)));
    assert_eq!(fx.blocks.canonical_hash(9)?, Some(hash));

    let offset = cdc::read_offset(fx.db.as_ref(), TOPIC)?.unwrap();
    assert_eq!(offset.offset, last);

    let mut delete = cdc::delete_block(&hash, 9);
    delete.offset = last + 10;
    delete.topic = TOPIC.into();
    fx.processor.apply(&delete)?;
    assert_eq!(fx.blocks.header(&hash, 9)?, None);
    Ok(())
}
