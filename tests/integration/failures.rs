use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chatwire_core::codec::{Codec, CodecError};
use chatwire_core::config::ChatwireConfig;
use chatwire_core::crypto::FrameKey;
use chatwire_core::wire::{self, PREFIX};
use chatwire_net::{DropReason, Inbound, Packet, PartRejected, PeerId, RegistryError, Role};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::*;

/// Flip one character of the tag: the frame dies before the registry.
#[test]
fn test_corrupted_tag_dropped() {
    let link = Link::new();
    let (pings, on_ping) = collector::<Ping>();
    link.server.register_serverbound::<Ping, _>(on_ping).unwrap();

    link.client.send_to_server(&Ping { client_ticks: 7 }).unwrap();
    let mut line = link.from_client().remove(0).text;
    let last = line.pop().unwrap();
    line.push(if last == '0' { '1' } else { '0' });

    let lookups = link.server.registry().lookup_count();
    assert_eq!(
        link.server.on_receive(CLIENT_PEER, &line),
        Inbound::Dropped(DropReason::BadTag)
    );
    assert_eq!(link.server.registry().lookup_count(), lookups);
    assert_eq!(link.server.pending_len(), 0);
    assert!(pings.lock().unwrap().is_empty());
}

/// Any single-character change to the body is caught by the tag.
#[test]
fn test_tampered_body_dropped() {
    let link = Link::new();
    let (pings, on_ping) = collector::<Ping>();
    link.server.register_serverbound::<Ping, _>(on_ping).unwrap();

    link.client.send_to_server(&Ping { client_ticks: 7 }).unwrap();
    let line = link.from_client().remove(0).text;
    let body_start = PREFIX.len();
    let body_end = line.rfind('|').unwrap();

    for pos in body_start..body_end {
        let original = line.as_bytes()[pos];
        let swapped = if original == b'A' { 'B' } else { 'A' };
        let mut tampered = line.clone();
        tampered.replace_range(pos..pos + 1, &swapped.to_string());
        assert_eq!(
            link.server.on_receive(CLIENT_PEER, &tampered),
            Inbound::Dropped(DropReason::BadTag),
            "tampering at byte {pos} went unnoticed"
        );
    }
    assert!(pings.lock().unwrap().is_empty());

    // The untouched frame still goes through.
    assert!(matches!(
        link.server.on_receive(CLIENT_PEER, &line),
        Inbound::Dispatched { .. }
    ));
}

/// A frame from a peer with a different shared key is rejected.
#[test]
fn test_wrong_shared_key_dropped() {
    let link = Link::new();
    link.server
        .register_serverbound::<Ping, _>(|_, _| Ok(()))
        .unwrap();

    let mut config = ChatwireConfig::default();
    config.auth.shared_key = "someone-else".into();
    let (impostor, out) = endpoint(Role::Client, config);
    impostor.send_to_server(&Ping { client_ticks: 1 }).unwrap();

    for f in out.drain() {
        assert_eq!(
            link.server.on_receive(CLIENT_PEER, &f.text),
            Inbound::Dropped(DropReason::BadTag)
        );
    }
}

/// Prefixed lines with no tag at all count as tag failures.
#[test]
fn test_missing_tag_dropped() {
    let link = Link::new();
    let line = format!("{PREFIX}00000001|0/1|12345|QQ==");
    assert_eq!(
        link.server.on_receive(CLIENT_PEER, &line),
        Inbound::Dropped(DropReason::BadTag)
    );
    assert_eq!(
        link.server.on_receive(CLIENT_PEER, PREFIX),
        Inbound::Dropped(DropReason::BadTag)
    );
}

/// Ordinary chat passes through untouched and uncounted.
#[test]
fn test_plain_chat_ignored() {
    let link = Link::new();
    for text in ["gg", "", "#BCN:00000001|0/1|1|QQ==|0000000000000000", "\u{200B}hi"] {
        assert_eq!(link.server.on_receive(CLIENT_PEER, text), Inbound::Ignored);
    }
    assert_eq!(link.server.stats().frames_received, 0);
}

/// A server only acts on serverbound registrations, a client on clientbound.
#[test]
fn test_direction_mismatch_dropped() {
    let link = Link::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    link.server
        .register_clientbound::<Ping, _>(move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    link.client.send_to_server(&Ping { client_ticks: 1 }).unwrap();
    let id = wire::type_id(Ping::type_name());
    assert_eq!(
        link.pump(),
        vec![Inbound::Dropped(DropReason::DirectionMismatch(id))]
    );
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

/// Valid frames for a type nobody registered are discarded.
#[test]
fn test_unknown_type_dropped() {
    let link = Link::new();
    link.server.broadcast(&Pong {
        client_ticks: 1,
        server_ticks: 2,
    })
    .unwrap();
    let id = wire::type_id(Pong::type_name());
    assert_eq!(
        link.pump(),
        vec![Inbound::Dropped(DropReason::UnknownType(id))]
    );
}

/// Re-delivering a whole message does not run the handler twice.
#[test]
fn test_replayed_message_dispatches_once() {
    let link = Link::new();
    let (boards, on_board) = collector::<Scoreboard>();
    link.server
        .register_serverbound::<Scoreboard, _>(on_board)
        .unwrap();

    link.client.send_to_server(&Scoreboard::sample(40)).unwrap();
    let frames = link.from_client();
    for _ in 0..2 {
        for f in &frames {
            link.server.on_receive(CLIENT_PEER, &f.text);
        }
    }
    assert_eq!(boards.lock().unwrap().len(), 1);
    assert_eq!(link.server.pending_len(), 0);
}

/// A duplicated part mid-message is rejected without disturbing the buffer.
#[test]
fn test_duplicate_part_rejected() {
    let link = Link::new();
    let (boards, on_board) = collector::<Scoreboard>();
    link.server
        .register_serverbound::<Scoreboard, _>(on_board)
        .unwrap();

    link.client.send_to_server(&Scoreboard::sample(40)).unwrap();
    let frames = link.from_client();
    link.server.on_receive(CLIENT_PEER, &frames[0].text);
    assert_eq!(
        link.server.on_receive(CLIENT_PEER, &frames[0].text),
        Inbound::Dropped(DropReason::Rejected(PartRejected::Duplicate(0)))
    );
    for f in &frames[1..] {
        link.server.on_receive(CLIENT_PEER, &f.text);
    }
    assert_eq!(boards.lock().unwrap().len(), 1);
}

/// Identical message ids from two senders never mix.
#[test]
fn test_same_msg_id_different_senders() {
    let link = Link::new();
    let (boards, on_board) = collector::<Scoreboard>();
    link.server
        .register_serverbound::<Scoreboard, _>(on_board)
        .unwrap();

    let (other, other_out) = endpoint(Role::Client, ChatwireConfig::default());
    let a = Scoreboard::sample(40);
    let b = Scoreboard::sample(41);
    let id_a = link.client.send_to_server(&a).unwrap();
    let id_b = other.send_to_server(&b).unwrap();
    assert_eq!(id_a, id_b);

    let from_a = link.from_client();
    let from_b = other_out.drain();
    for (fa, fb) in from_a.iter().zip(from_b.iter()) {
        link.server.on_receive(CLIENT_PEER, &fa.text);
        link.server.on_receive(PeerId(2), &fb.text);
    }
    for f in from_a.iter().skip(from_b.len()) {
        link.server.on_receive(CLIENT_PEER, &f.text);
    }
    for f in from_b.iter().skip(from_a.len()) {
        link.server.on_receive(PeerId(2), &f.text);
    }

    let mut got = boards.lock().unwrap().clone();
    got.sort_by_key(|board| board.rows.len());
    assert_eq!(got, vec![a, b]);
}

/// A panicking handler is contained and the transport keeps working.
#[test]
fn test_handler_panic_contained() {
    let link = Link::new();
    link.server
        .register_serverbound::<Ping, _>(|_, ping| {
            if ping.client_ticks < 0 {
                panic!("negative ticks");
            }
            anyhow::ensure!(ping.client_ticks != 0, "zero ticks");
            Ok(())
        })
        .unwrap();

    link.client.send_to_server(&Ping { client_ticks: -1 }).unwrap();
    link.client.send_to_server(&Ping { client_ticks: 0 }).unwrap();
    link.client.send_to_server(&Ping { client_ticks: 1 }).unwrap();
    let id = wire::type_id(Ping::type_name());
    assert_eq!(
        link.pump(),
        vec![
            Inbound::Dropped(DropReason::HandlerFailed(id)),
            Inbound::Dropped(DropReason::HandlerFailed(id)),
            Inbound::Dispatched { msg_id: 3, type_id: id },
        ]
    );
}

/// A frame with conflicting part counts for an open message is rejected.
#[test]
fn test_total_mismatch_rejected() {
    let link = Link::new();
    link.client.send_to_server(&Scoreboard::sample(40)).unwrap();
    let frames = link.from_client();
    link.server.on_receive(CLIENT_PEER, &frames[0].text);

    // Re-seal part 1 with a different total under the real key.
    let config = ChatwireConfig::default();
    let key = FrameKey::derive(config.auth.shared_key.as_bytes());
    let body = format!("00000001|1/{}|1|QQ==", frames.len() + 1);
    let line = format!("{PREFIX}{body}|{}", key.tag(&body));
    assert_eq!(
        link.server.on_receive(CLIENT_PEER, &line),
        Inbound::Dropped(DropReason::Rejected(PartRejected::TotalMismatch {
            expected: frames.len() as u16,
            declared: frames.len() as u16 + 1,
        }))
    );
}

#[derive(Debug, Clone, Copy, PartialEq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct Health {
    hp: u64,
}

impl Packet for Health {
    fn type_name() -> &'static str {
        "game.Stat"
    }

    fn codec() -> Result<Codec<Self>, CodecError> {
        Codec::fixed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct Gold {
    coins: u64,
}

impl Packet for Gold {
    fn type_name() -> &'static str {
        "game.Stat"
    }

    fn codec() -> Result<Codec<Self>, CodecError> {
        Codec::fixed()
    }
}

/// A second type claiming a taken id is refused; the first keeps its messages.
#[test]
fn test_colliding_type_cannot_steal_messages() {
    let link = Link::new();
    let (health, on_health) = collector::<Health>();
    let (gold, on_gold) = collector::<Gold>();

    let id = link.server.register_serverbound::<Health, _>(on_health).unwrap();
    let err = link
        .server
        .register_serverbound::<Gold, _>(on_gold)
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Collision { type_id, .. } if type_id == id
    ));
    assert!(!link.server.unregister::<Gold>());

    link.client.send_to_server(&Health { hp: 90 }).unwrap();
    assert_eq!(
        link.pump(),
        vec![Inbound::Dispatched { msg_id: 1, type_id: id }]
    );
    assert_eq!(*health.lock().unwrap(), vec![Health { hp: 90 }]);
    assert!(gold.lock().unwrap().is_empty());
}
