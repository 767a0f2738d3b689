//! The two-step sync handshake, as stateless functions over a document.
//!
//! Either side opens by sending step 1 with its state vector. A received
//! step 1 is answered with step 2 carrying the diff; step 2 and update
//! frames are applied locally. Applying the same update twice is a no-op,
//! so no deduplication happens here.

use crate::protocol::{
    create_sync_step1_message, create_sync_step2_message, ProtocolError, SyncMessage,
};
use crate::ydoc::{DocError, YDocHandle};

/// Failure while driving the sync protocol for one peer.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Doc(#[from] DocError),
}

/// What processing one sync frame produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A step 2 reply that must be sent back to the peer.
    Reply(Vec<u8>),
    /// A step 2 diff was applied; the link is now synced.
    Synced,
    /// An incremental update was applied.
    Applied,
}

/// The step 1 frame that opens the handshake for `doc`.
pub fn handshake_message(doc: &YDocHandle) -> Vec<u8> {
    create_sync_step1_message(&doc.state_vector())
}

/// Drive one inbound sync frame against `doc`.
///
/// Frames from a single peer must be fed in arrival order; ordering across
/// peers is irrelevant to convergence.
pub fn process_sync_message(
    doc: &YDocHandle,
    message: &SyncMessage,
) -> Result<SyncOutcome, SyncError> {
    match message {
        SyncMessage::Step1(state_vector) => {
            let diff = doc.diff(state_vector)?;
            Ok(SyncOutcome::Reply(create_sync_step2_message(&diff)))
        }
        SyncMessage::Step2(update) => {
            doc.apply_update(update)?;
            Ok(SyncOutcome::Synced)
        }
        SyncMessage::Update(update) => {
            doc.apply_update(update)?;
            Ok(SyncOutcome::Applied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::YMessage;
    use yrs::{GetString, Text, Transact};

    fn insert_text(handle: &YDocHandle, content: &str) {
        let text = handle.doc().get_or_insert_text("content");
        let mut txn = handle.doc().transact_mut();
        let len = text.len(&txn);
        text.insert(&mut txn, len, content);
    }

    fn text_of(handle: &YDocHandle) -> String {
        let text = handle.doc().get_or_insert_text("content");
        text.get_string(&handle.doc().transact())
    }

    fn parse_sync(frame: &[u8]) -> SyncMessage {
        match YMessage::parse(frame).unwrap().unwrap() {
            YMessage::Sync(msg) => msg,
            other => panic!("expected sync frame, got {:?}", other),
        }
    }

    /// Run the full handshake in both directions between two documents.
    fn full_exchange(a: &YDocHandle, b: &YDocHandle) {
        for (local, remote) in [(a, b), (b, a)] {
            let step1 = parse_sync(&handshake_message(local));
            let reply = match process_sync_message(remote, &step1).unwrap() {
                SyncOutcome::Reply(frame) => frame,
                other => panic!("expected reply, got {:?}", other),
            };
            let step2 = parse_sync(&reply);
            assert_eq!(
                process_sync_message(local, &step2).unwrap(),
                SyncOutcome::Synced
            );
        }
    }

    #[test]
    fn test_handshake_converges_both_sides() {
        let a = YDocHandle::new();
        let b = YDocHandle::new();
        insert_text(&a, "from a ");
        insert_text(&b, "from b");

        full_exchange(&a, &b);

        assert_eq!(a.state_vector(), b.state_vector());
        assert_eq!(text_of(&a), text_of(&b));
    }

    #[test]
    fn test_update_frame_applies() {
        let a = YDocHandle::new();
        let b = YDocHandle::new();
        full_exchange(&a, &b);

        insert_text(&a, "late edit");
        let frame = crate::protocol::create_update_message(&a.encode_state_as_update());
        let msg = parse_sync(&frame);
        assert_eq!(
            process_sync_message(&b, &msg).unwrap(),
            SyncOutcome::Applied
        );
        assert_eq!(text_of(&b), "late edit");
    }

    #[test]
    fn test_malformed_step2_is_an_error() {
        let doc = YDocHandle::new();
        let msg = SyncMessage::Step2(vec![0xFF, 0xFF]);
        assert!(matches!(
            process_sync_message(&doc, &msg),
            Err(SyncError::Doc(_))
        ));
    }

    #[test]
    fn test_concurrent_mutations_converge() {
        let a = YDocHandle::new();
        let b = YDocHandle::new();
        full_exchange(&a, &b);

        // diverge on both sides, then exchange again
        insert_text(&a, "aaa ");
        insert_text(&b, "bbb");
        full_exchange(&a, &b);

        assert_eq!(text_of(&a), text_of(&b));
        assert_eq!(a.state_vector(), b.state_vector());
    }
}
