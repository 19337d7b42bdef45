//! Matched puts between two nodes: payload delivery, event sequences,
//! acknowledgement failures and EQ overflow.

mod common;

use common::{TEST_PID, endpoint, expect_event, two_nodes};
use nicsim_portals::api::{MdParams, MeParams};
use nicsim_portals::types::{PTL_ME_OP_PUT, PTL_PT_ANY};
use nicsim_portals::{AckReq, EqRead, EventKind, ListKind, MemRegion, NiFail, ProcessId, PtlError};

#[tokio::test(start_paused = true)]
async fn put_matching_delivers_payload_and_events() {
    let sim = two_nodes();
    let client = endpoint(&sim, 0).await;
    let server = endpoint(&sim, 1).await;

    let server_buf = MemRegion::new(4_200_000);
    let pte = server
        .ptl
        .pt_alloc(server.nih, 0, Some(server.eqh), 0)
        .await
        .unwrap();
    server
        .ptl
        .me_append(
            server.nih,
            pte,
            &MeParams::over(server_buf.clone()).with_match(42, 0),
            ListKind::Priority,
            7,
        )
        .await
        .unwrap();
    let link = expect_event(&server, EventKind::Link).await;
    assert_eq!(link.pt_index, 0);

    let client_buf = MemRegion::from_bytes(b"Z");
    let mdh = client
        .ptl
        .md_bind(
            client.nih,
            &MdParams::over(client_buf).with_eq(client.eqh),
        )
        .await
        .unwrap();

    let client_side = async {
        client
            .ptl
            .put(
                mdh,
                0,
                1,
                AckReq::Ack,
                ProcessId::phys(1, TEST_PID),
                0,
                42,
                0,
                11,
                1337,
            )
            .await
            .unwrap();

        let send = expect_event(&client, EventKind::Send).await;
        assert_eq!(send.mlength, 1);
        assert_eq!(send.user_ptr, 11);

        let ack = expect_event(&client, EventKind::Ack).await;
        assert_eq!(ack.ni_fail, NiFail::Ok);
        assert_eq!(ack.mlength, 1);
        assert_eq!(ack.remote_offset, 0);
    };

    let server_side = async {
        let put = expect_event(&server, EventKind::Put).await;
        assert_eq!(put.rlength, 1);
        assert_eq!(put.mlength, 1);
        assert_eq!(put.hdr_data, 1337);
        assert_eq!(put.match_bits, 42);
        assert_eq!(put.start, Some(0));
        assert_eq!(put.user_ptr, 7);
        assert_eq!((put.initiator_nid, put.initiator_pid), (0, TEST_PID));
    };

    tokio::join!(client_side, server_side);
    assert_eq!(server_buf.read(0, 1), b"Z");
}

#[tokio::test(start_paused = true)]
async fn unmatched_put_acknowledges_the_failure() {
    let sim = two_nodes();
    let client = endpoint(&sim, 0).await;
    let server = endpoint(&sim, 1).await;

    let pte = server
        .ptl
        .pt_alloc(server.nih, 0, Some(server.eqh), PTL_PT_ANY)
        .await
        .unwrap();
    assert_eq!(pte, 0);
    server
        .ptl
        .me_append(
            server.nih,
            pte,
            &MeParams::over(MemRegion::new(16)).with_match(99, 0),
            ListKind::Priority,
            0,
        )
        .await
        .unwrap();
    expect_event(&server, EventKind::Link).await;

    let mdh = client
        .ptl
        .md_bind(
            client.nih,
            &MdParams::over(MemRegion::from_bytes(b"hello")).with_eq(client.eqh),
        )
        .await
        .unwrap();
    client
        .ptl
        .put(
            mdh,
            0,
            5,
            AckReq::Ack,
            ProcessId::phys(1, TEST_PID),
            0,
            42,
            0,
            0,
            0,
        )
        .await
        .unwrap();

    expect_event(&client, EventKind::Send).await;
    let ack = expect_event(&client, EventKind::Ack).await;
    assert_eq!(ack.ni_fail, NiFail::TargetInvalid);
    assert_eq!(ack.mlength, 0);

    // Nothing landed, no target-side event.
    assert_eq!(server.ptl.eq_get(server.eqh).unwrap_err(), PtlError::EqEmpty);
}

#[tokio::test(start_paused = true)]
async fn oversized_put_is_truncated() {
    let sim = two_nodes();
    let client = endpoint(&sim, 0).await;
    let server = endpoint(&sim, 1).await;

    let server_buf = MemRegion::new(4);
    server
        .ptl
        .pt_alloc(server.nih, 0, Some(server.eqh), 0)
        .await
        .unwrap();
    server
        .ptl
        .me_append(
            server.nih,
            0,
            &MeParams::over(server_buf.clone())
                .with_options(PTL_ME_OP_PUT)
                .with_match(42, 0),
            ListKind::Priority,
            0,
        )
        .await
        .unwrap();
    expect_event(&server, EventKind::Link).await;

    let mdh = client
        .ptl
        .md_bind(
            client.nih,
            &MdParams::over(MemRegion::from_bytes(b"ABCDEFGH")).with_eq(client.eqh),
        )
        .await
        .unwrap();
    client
        .ptl
        .put(
            mdh,
            0,
            8,
            AckReq::Ack,
            ProcessId::phys(1, TEST_PID),
            0,
            42,
            0,
            0,
            0,
        )
        .await
        .unwrap();

    expect_event(&client, EventKind::Send).await;
    let ack = expect_event(&client, EventKind::Ack).await;
    assert_eq!(ack.mlength, 4);

    let put = expect_event(&server, EventKind::Put).await;
    assert_eq!(put.rlength, 8);
    assert_eq!(put.mlength, 4);
    assert_eq!(server_buf.snapshot(), b"ABCD");
}

#[tokio::test(start_paused = true)]
async fn eq_overflow_surfaces_as_dropped() {
    let sim = two_nodes();
    let client = endpoint(&sim, 0).await;

    let server = {
        // Tiny EQ: one LINK plus one PUT fill it.
        let ptl = sim.process(1);
        let (nih, _) = ptl
            .ni_init(
                nicsim_portals::types::PTL_IFACE_DEFAULT,
                nicsim_portals::types::PTL_NI_MATCHING | nicsim_portals::types::PTL_NI_PHYSICAL,
                TEST_PID,
                None,
            )
            .await
            .unwrap();
        let eqh = ptl.eq_alloc(nih, 2).unwrap();
        common::Endpoint { ptl, nih, eqh }
    };

    server
        .ptl
        .pt_alloc(server.nih, 0, Some(server.eqh), 0)
        .await
        .unwrap();
    server
        .ptl
        .me_append(
            server.nih,
            0,
            &MeParams::over(MemRegion::new(64)).with_match(42, 0),
            ListKind::Priority,
            0,
        )
        .await
        .unwrap();

    let mdh = client
        .ptl
        .md_bind(
            client.nih,
            &MdParams::over(MemRegion::from_bytes(b"x")).with_eq(client.eqh),
        )
        .await
        .unwrap();
    for _ in 0..2 {
        client
            .ptl
            .put(
                mdh,
                0,
                1,
                AckReq::Ack,
                ProcessId::phys(1, TEST_PID),
                0,
                42,
                0,
                0,
                0,
            )
            .await
            .unwrap();
        expect_event(&client, EventKind::Send).await;
        expect_event(&client, EventKind::Ack).await;
    }

    // LINK + first PUT are queued; the second PUT was dropped and the next
    // fetch reports it.
    match server.ptl.eq_get(server.eqh).unwrap() {
        EqRead::Dropped(event) => assert_eq!(event.kind, EventKind::Link),
        EqRead::Ok(event) => panic!("expected the dropped flag, got {event:?}"),
    }
    assert_eq!(
        server.ptl.eq_wait(server.eqh).await.unwrap().into_event().kind,
        EventKind::Put
    );
    assert_eq!(server.ptl.eq_get(server.eqh).unwrap_err(), PtlError::EqEmpty);
}
