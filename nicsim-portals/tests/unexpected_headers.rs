//! Overflow-list matches and the unexpected-header walk at append time.

mod common;

use common::{TEST_PID, endpoint, expect_event, two_nodes};
use nicsim_portals::api::{MdParams, MeParams};
use nicsim_portals::types::{PTL_ME_OP_PUT, PTL_ME_USE_ONCE};
use nicsim_portals::{AckReq, EventKind, ListKind, MemRegion, ProcessId, PtlError};

#[tokio::test(start_paused = true)]
async fn overflow_match_defers_the_event_to_a_late_append() {
    let sim = two_nodes();
    let client = endpoint(&sim, 0).await;
    let server = endpoint(&sim, 1).await;

    let overflow_buf = MemRegion::new(8);
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
            &MeParams::over(overflow_buf.clone())
                .with_match(42, 0)
                .with_options(PTL_ME_OP_PUT | PTL_ME_USE_ONCE),
            ListKind::Overflow,
            21,
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
            AckReq::NoAck,
            ProcessId::phys(1, TEST_PID),
            0,
            42,
            0,
            0,
            555,
        )
        .await
        .unwrap();
    // Delivery is confirmed by the E2E acknowledgement.
    expect_event(&client, EventKind::Send).await;

    // The consumed USE_ONCE overflow entry unlinks, but no PUT event: the
    // header is retained for a later priority append.
    expect_event(&server, EventKind::AutoUnlink).await;
    assert_eq!(
        server.ptl.eq_get(server.eqh).unwrap_err(),
        PtlError::EqEmpty
    );
    assert_eq!(overflow_buf.snapshot(), b"ABCDEFGH");

    // A matching priority append observes the retained header. Being
    // USE_ONCE and immediately consumed, the entry is not inserted: no LINK.
    let meh = server
        .ptl
        .me_append(
            server.nih,
            0,
            &MeParams::over(MemRegion::new(8))
                .with_match(42, 0)
                .with_options(PTL_ME_OP_PUT | PTL_ME_USE_ONCE),
            ListKind::Priority,
            0,
        )
        .await
        .unwrap();

    let overflow = expect_event(&server, EventKind::PutOverflow).await;
    assert_eq!(overflow.hdr_data, 555);
    assert_eq!(overflow.rlength, 8);
    assert_eq!(overflow.mlength, 8);
    assert_eq!(overflow.start, Some(0));
    // The event names the overflow entry the payload landed in.
    assert_eq!(overflow.user_ptr, 21);

    assert_eq!(
        server.ptl.eq_get(server.eqh).unwrap_err(),
        PtlError::EqEmpty
    );

    // Unlinking the never-inserted entry is a harmless no-op.
    server.ptl.me_unlink(meh).await.unwrap();

    let pt = sim
        .node(1)
        .nis()
        .into_iter()
        .find(|ni| ni.pid == TEST_PID)
        .and_then(|ni| ni.pt(0))
        .expect("portal still allocated");
    assert_eq!(pt.list_lens(), (0, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn persistent_append_consumes_every_retained_header() {
    let sim = two_nodes();
    let client = endpoint(&sim, 0).await;
    let server = endpoint(&sim, 1).await;

    let overflow_buf = MemRegion::new(64);
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
            &MeParams::over(overflow_buf.clone()).with_match(42, 0),
            ListKind::Overflow,
            0,
        )
        .await
        .unwrap();
    expect_event(&server, EventKind::Link).await;

    let mdh = client
        .ptl
        .md_bind(
            client.nih,
            &MdParams::over(MemRegion::from_bytes(b"xy")).with_eq(client.eqh),
        )
        .await
        .unwrap();
    for _ in 0..2 {
        client
            .ptl
            .put(
                mdh,
                0,
                2,
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

    // Both headers replay against one durable priority entry, then the
    // entry links.
    server
        .ptl
        .me_append(
            server.nih,
            0,
            &MeParams::over(MemRegion::new(16)).with_match(42, 0),
            ListKind::Priority,
            0,
        )
        .await
        .unwrap();
    expect_event(&server, EventKind::PutOverflow).await;
    expect_event(&server, EventKind::PutOverflow).await;
    expect_event(&server, EventKind::Link).await;

    let pt = sim
        .node(1)
        .nis()
        .into_iter()
        .find(|ni| ni.pid == TEST_PID)
        .and_then(|ni| ni.pt(0))
        .expect("portal still allocated");
    // Priority entry inserted, overflow entry still there, headers drained.
    assert_eq!(pt.list_lens(), (1, 1, 0));
}
