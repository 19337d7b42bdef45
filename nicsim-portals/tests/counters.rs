//! Counting-event delivery: MD-side send/ack/reply counting and CT wait/poll.

mod common;

use common::{TEST_PID, endpoint, expect_event, two_nodes};
use nicsim_portals::api::{MdParams, MeParams};
use nicsim_portals::types::{
    PTL_MD_EVENT_CT_ACK, PTL_MD_EVENT_CT_REPLY, PTL_MD_EVENT_CT_SEND, PTL_ME_EVENT_CT_COMM,
    PTL_ME_OP_GET, PTL_ME_OP_PUT,
};
use nicsim_portals::{AckReq, CtValue, EventKind, ListKind, MemRegion, ProcessId, PtlError};

#[tokio::test(start_paused = true)]
async fn md_counter_counts_send_and_ack() {
    let sim = two_nodes();
    let client = endpoint(&sim, 0).await;
    let server = endpoint(&sim, 1).await;

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
            &MeParams::over(MemRegion::new(8)).with_match(1, 0),
            ListKind::Priority,
            0,
        )
        .await
        .unwrap();
    expect_event(&server, EventKind::Link).await;

    let cth = client.ptl.ct_alloc(client.nih).unwrap();
    let mdh = client
        .ptl
        .md_bind(
            client.nih,
            &MdParams::over(MemRegion::from_bytes(b"datum"))
                .with_options(PTL_MD_EVENT_CT_SEND | PTL_MD_EVENT_CT_ACK)
                .with_ct(cth),
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
            1,
            0,
            0,
            0,
        )
        .await
        .unwrap();

    // One bump for SEND, one for ACK; no MD event queue, so the counter is
    // the only completion signal.
    let value = client.ptl.ct_wait(cth, 2).await.unwrap();
    assert_eq!(value, CtValue {
        success: 2,
        failure: 0,
    });
}

#[tokio::test(start_paused = true)]
async fn me_counter_counts_operations() {
    let sim = two_nodes();
    let client = endpoint(&sim, 0).await;
    let server = endpoint(&sim, 1).await;

    let cth = server.ptl.ct_alloc(server.nih).unwrap();
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
            &MeParams::over(MemRegion::new(8))
                .with_match(1, 0)
                .with_options(PTL_ME_OP_PUT | PTL_ME_OP_GET | PTL_ME_EVENT_CT_COMM)
                .with_ct(cth),
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
            &MdParams::over(MemRegion::from_bytes(b"ab")).with_eq(client.eqh),
        )
        .await
        .unwrap();
    for _ in 0..3 {
        client
            .ptl
            .put(
                mdh,
                0,
                2,
                AckReq::Ack,
                ProcessId::phys(1, TEST_PID),
                0,
                1,
                0,
                0,
                0,
            )
            .await
            .unwrap();
        expect_event(&client, EventKind::Send).await;
        expect_event(&client, EventKind::Ack).await;
    }

    // Without CT_BYTES each communication counts once.
    let value = server.ptl.ct_wait(cth, 3).await.unwrap();
    assert_eq!(value.success, 3);
}

#[tokio::test(start_paused = true)]
async fn reply_counter_fires_on_get() {
    let sim = two_nodes();
    let client = endpoint(&sim, 0).await;
    let server = endpoint(&sim, 1).await;

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
            &MeParams::over(MemRegion::from_bytes(b"payload")).with_match(1, 0),
            ListKind::Priority,
            0,
        )
        .await
        .unwrap();
    expect_event(&server, EventKind::Link).await;

    let cth = client.ptl.ct_alloc(client.nih).unwrap();
    let get_buf = MemRegion::new(7);
    let mdh = client
        .ptl
        .md_bind(
            client.nih,
            &MdParams::over(get_buf.clone())
                .with_options(PTL_MD_EVENT_CT_REPLY)
                .with_ct(cth),
        )
        .await
        .unwrap();
    client
        .ptl
        .get(mdh, 0, 7, ProcessId::phys(1, TEST_PID), 0, 1, 0, 0)
        .await
        .unwrap();

    let value = client.ptl.ct_wait(cth, 1).await.unwrap();
    assert_eq!(value.success, 1);
    assert_eq!(get_buf.snapshot(), b"payload");
}

#[tokio::test(start_paused = true)]
async fn ct_poll_and_failure_semantics() {
    let sim = two_nodes();
    let client = endpoint(&sim, 0).await;

    let a = client.ptl.ct_alloc(client.nih).unwrap();
    let b = client.ptl.ct_alloc(client.nih).unwrap();

    // Nothing reached: poll times out.
    let err = client.ptl.ct_poll(&[a, b], &[1, 1], 5).await.unwrap_err();
    assert_eq!(err, PtlError::CtNoneReached);

    client
        .ptl
        .ct_inc(b, CtValue {
            success: 2,
            failure: 0,
        })
        .await
        .unwrap();
    let (which, value) = client.ptl.ct_poll(&[a, b], &[5, 2], 5).await.unwrap();
    assert_eq!(which, 1);
    assert_eq!(value.success, 2);

    // A recorded failure releases any waiter regardless of threshold.
    client
        .ptl
        .ct_inc(a, CtValue {
            success: 0,
            failure: 1,
        })
        .await
        .unwrap();
    let value = client.ptl.ct_wait(a, 1_000_000).await.unwrap();
    assert_eq!(value.failure, 1);

    // Set rewinds.
    client.ptl.ct_set(a, CtValue::default()).await.unwrap();
    assert_eq!(client.ptl.ct_get(a).unwrap(), CtValue::default());

    client.ptl.ct_free(a).unwrap();
    assert_eq!(client.ptl.ct_get(a).unwrap_err(), PtlError::ArgInvalid);
}
