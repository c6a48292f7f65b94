//! Property-based tests for the CMI wire codec and loopback link.

use proptest::prelude::*;
use std::sync::{Arc, Mutex};
use twinlock_cmi::{
    decode_message, encode_message, ChangeKind, CmiClient, CmiError, CmiEvent, CmiLockFlags,
    CmiMessage, CmiTransport, ElementHandle, LockMode, LoopbackLink, MessageBody, MessageHeader,
    NonpagedChange, NonpagedWrite, OperationFlags, RequestToken, SendToken, StripeLockMessage,
    StripeRegion, NONPAGED_PAYLOAD_MAX,
};

fn any_handle() -> impl Strategy<Value = ElementHandle> {
    prop_oneof![
        Just(ElementHandle::NULL),
        (0u32..1024, 1u32..64).prop_map(|(i, g)| ElementHandle::new(i, g)),
    ]
}

fn any_region() -> impl Strategy<Value = StripeRegion> {
    prop_oneof![
        Just(StripeRegion::INVALID),
        (0u64..1 << 40, 0u64..4096).prop_map(|(first, len)| StripeRegion::new(first, first + len)),
    ]
}

fn any_token() -> impl Strategy<Value = RequestToken> {
    (any::<u64>(), any::<u64>()).prop_map(|(id, first)| RequestToken::new(id, first))
}

fn any_mode() -> impl Strategy<Value = LockMode> {
    prop_oneof![Just(LockMode::Read), Just(LockMode::Write)]
}

fn any_lock_flags() -> impl Strategy<Value = CmiLockFlags> {
    (any::<bool>(), any::<bool>(), any::<bool>()).prop_map(|(release, monitor, destroy)| {
        let mut flags = CmiLockFlags::empty();
        if release {
            flags.insert(CmiLockFlags::NEED_RELEASE);
        }
        if monitor {
            flags.insert(CmiLockFlags::MONITOR_OP);
        }
        if destroy {
            flags.insert(CmiLockFlags::ABORT_DESTROY);
        }
        flags
    })
}

fn any_lock_message() -> impl Strategy<Value = StripeLockMessage> {
    prop_oneof![
        Just(StripeLockMessage::Start),
        Just(StripeLockMessage::Stop),
        (any_mode(), any_region(), any_token(), proptest::option::of(any_lock_flags())).prop_map(
            |(mode, region, request, flags)| StripeLockMessage::Request {
                mode,
                region,
                request,
                flags,
            }
        ),
        (any_mode(), any_region(), any_region(), any_token(), any_token(), any_lock_flags())
            .prop_map(|(mode, read_region, write_region, request, grant, flags)| {
                StripeLockMessage::Grant {
                    mode,
                    read_region,
                    write_region,
                    request,
                    grant,
                    flags,
                }
            }),
        any_token().prop_map(|grant| StripeLockMessage::Release { grant }),
        (any_token(), any_lock_flags())
            .prop_map(|(request, flags)| StripeLockMessage::Aborted { request, flags }),
    ]
}

fn any_change_kind() -> impl Strategy<Value = ChangeKind> {
    prop_oneof![
        Just(ChangeKind::SetBits),
        Just(ChangeKind::ClearBits),
        Just(ChangeKind::SetCheckpoint),
        Just(ChangeKind::ForceSetCheckpoint),
        Just(ChangeKind::IncrCheckpoint),
    ]
}

fn any_body() -> impl Strategy<Value = MessageBody> {
    let payload = proptest::collection::vec(any::<u8>(), 0..=NONPAGED_PAYLOAD_MAX);
    prop_oneof![
        proptest::collection::vec(any::<u8>(), 0..=256)
            .prop_map(|data| MessageBody::MemoryUpdate { data }),
        (any::<u64>(), payload.clone(), any::<u64>()).prop_map(|(offset, data, seq_number)| {
            MessageBody::NonpagedWrite(NonpagedWrite {
                offset,
                data,
                seq_number,
            })
        }),
        Just(MessageBody::NonpagedPostPersist),
        (any_change_kind(), any::<u64>(), payload, any::<u64>(), any::<u64>()).prop_map(
            |(kind, offset, data, repeat_count, second_offset)| MessageBody::NonpagedChange {
                kind,
                change: NonpagedChange {
                    offset,
                    data,
                    repeat_count,
                    second_offset,
                    seq_number: 0,
                },
            }
        ),
        any_lock_message().prop_map(MessageBody::StripeLock),
    ]
}

fn any_message() -> impl Strategy<Value = CmiMessage> {
    (any_handle(), any_handle(), any::<u32>(), any::<bool>(), any_body()).prop_map(
        |(sender, receiver, object_id, persist, body)| {
            let flags = if persist {
                OperationFlags::PERSIST
            } else {
                OperationFlags::empty()
            };
            CmiMessage::new(
                MessageHeader::new(sender, receiver, object_id).with_flags(flags),
                body,
            )
        },
    )
}

#[derive(Default)]
struct Recorder {
    received: Mutex<Vec<CmiMessage>>,
    events: Mutex<Vec<(CmiEvent, SendToken)>>,
}

impl CmiClient for Recorder {
    fn on_message(&self, message: CmiMessage) {
        self.received.lock().unwrap().push(message);
    }

    fn on_event(&self, event: CmiEvent, _message: CmiMessage, token: SendToken) {
        self.events.lock().unwrap().push((event, token));
    }

    fn on_contact_lost(&self) {}
}

proptest! {
    /// Any message within the payload limits survives the wire unchanged.
    #[test]
    fn test_codec_preserves_messages(msg in any_message()) {
        let bytes = encode_message(&msg).unwrap();
        prop_assert!(bytes.len() <= twinlock_cmi::MAX_MESSAGE_SIZE);
        prop_assert_eq!(decode_message(&bytes).unwrap(), msg);
    }

    /// Oversized non-paged payloads are refused before encoding.
    #[test]
    fn test_oversized_payload_rejected(extra in 1usize..64) {
        let msg = CmiMessage::new(
            MessageHeader::new(ElementHandle::NULL, ElementHandle::NULL, 1),
            MessageBody::NonpagedWrite(NonpagedWrite {
                offset: 0,
                data: vec![0; NONPAGED_PAYLOAD_MAX + extra],
                seq_number: 0,
            }),
        );
        let refused = matches!(encode_message(&msg), Err(CmiError::PayloadTooLarge { .. }));
        prop_assert!(refused);
    }

    /// Arbitrary bytes never decode into a panic.
    #[test]
    fn test_decode_garbage_does_not_panic(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = decode_message(&bytes);
    }

    /// The loopback link delivers every frame in send order and reports one
    /// event per send.
    #[test]
    fn test_loopback_in_order(messages in proptest::collection::vec(any_message(), 1..20)) {
        let (link, a, b) = LoopbackLink::pair();
        let sender = Arc::new(Recorder::default());
        let receiver = Arc::new(Recorder::default());
        let sender_client: Arc<dyn CmiClient> = sender.clone();
        let receiver_client: Arc<dyn CmiClient> = receiver.clone();
        a.attach(Arc::downgrade(&sender_client));
        b.attach(Arc::downgrade(&receiver_client));
        prop_assert!(a.is_peer_alive());

        for (token, msg) in messages.iter().enumerate() {
            a.send(msg.clone(), token as SendToken);
        }
        prop_assert_eq!(link.pump(), messages.len());

        prop_assert_eq!(&*receiver.received.lock().unwrap(), &messages);
        let events = sender.events.lock().unwrap();
        prop_assert_eq!(events.len(), messages.len());
        for (i, (event, token)) in events.iter().enumerate() {
            prop_assert_eq!(*event, CmiEvent::Transmitted);
            prop_assert_eq!(*token, i as SendToken);
        }
    }
}

#[test]
fn test_send_to_failed_side_reports_contact_lost() {
    let (link, a, b) = LoopbackLink::pair();
    let sender = Arc::new(Recorder::default());
    let receiver = Arc::new(Recorder::default());
    let sender_client: Arc<dyn CmiClient> = sender.clone();
    let receiver_client: Arc<dyn CmiClient> = receiver.clone();
    a.attach(Arc::downgrade(&sender_client));
    b.attach(Arc::downgrade(&receiver_client));

    link.fail_side(1);
    assert!(!a.is_peer_alive());
    a.send(
        CmiMessage::new(
            MessageHeader::new(ElementHandle::NULL, ElementHandle::NULL, 3),
            MessageBody::StripeLock(StripeLockMessage::Start),
        ),
        7,
    );
    link.pump();
    assert!(receiver.received.lock().unwrap().is_empty());
    assert_eq!(
        sender.events.lock().unwrap().as_slice(),
        &[(CmiEvent::PeerContactLost, 7)]
    );
    assert_eq!(link.stats().failed, [1, 0]);
}
