//! Atomic, fetch-atomic and swap operations across the wire.

mod common;

use common::{TEST_PID, endpoint, expect_event, two_nodes};
use nicsim_portals::api::{MdParams, MeParams};
use nicsim_portals::atomics::{long_double_bytes, long_double_value};
use nicsim_portals::types::{PTL_ME_EVENT_CT_BYTES, PTL_ME_EVENT_CT_COMM};
use nicsim_portals::{
    AckReq, AtomicDatatype, AtomicOp, EventKind, ListKind, MemRegion, NiFail, ProcessId,
};

#[tokio::test(start_paused = true)]
async fn atomic_sum_int64() {
    let sim = two_nodes();
    let client = endpoint(&sim, 0).await;
    let server = endpoint(&sim, 1).await;

    let server_buf = MemRegion::from_bytes(&40i64.to_le_bytes());
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
            &MeParams::over(server_buf.clone())
                .with_match(42, 0)
                .with_options(
                    nicsim_portals::types::PTL_ME_OP_PUT
                        | PTL_ME_EVENT_CT_COMM
                        | PTL_ME_EVENT_CT_BYTES,
                )
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
            &MdParams::over(MemRegion::from_bytes(&2i64.to_le_bytes())).with_eq(client.eqh),
        )
        .await
        .unwrap();
    client
        .ptl
        .atomic(
            mdh,
            0,
            8,
            AckReq::Ack,
            ProcessId::phys(1, TEST_PID),
            0,
            42,
            0,
            0,
            1337,
            AtomicOp::Sum,
            AtomicDatatype::Int64,
        )
        .await
        .unwrap();

    expect_event(&client, EventKind::Send).await;
    expect_event(&client, EventKind::Ack).await;

    let atomic = expect_event(&server, EventKind::Atomic).await;
    assert_eq!(atomic.hdr_data, 1337);
    assert_eq!(atomic.mlength, 8);
    assert_eq!(atomic.atomic_op, Some(AtomicOp::Sum));
    assert_eq!(atomic.atomic_type, Some(AtomicDatatype::Int64));

    let value = i64::from_le_bytes(server_buf.snapshot().try_into().unwrap());
    assert_eq!(value, 42);
    // CT_BYTES counts delivered bytes.
    assert_eq!(server.ptl.ct_get(cth).unwrap().success, 8);
}

#[tokio::test(start_paused = true)]
async fn fetch_atomic_prod_long_double() {
    let sim = two_nodes();
    let client = endpoint(&sim, 0).await;
    let server = endpoint(&sim, 1).await;

    let server_buf = MemRegion::from_bytes(&long_double_bytes(23.0));
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
            &MeParams::over(server_buf.clone()).with_match(42, 0),
            ListKind::Priority,
            0,
        )
        .await
        .unwrap();
    expect_event(&server, EventKind::Link).await;

    let put_buf = MemRegion::from_bytes(&long_double_bytes(3.0));
    let get_buf = MemRegion::from_bytes(&long_double_bytes(666.0));
    let put_mdh = client
        .ptl
        .md_bind(client.nih, &MdParams::over(put_buf))
        .await
        .unwrap();
    let get_mdh = client
        .ptl
        .md_bind(
            client.nih,
            &MdParams::over(get_buf.clone()).with_eq(client.eqh),
        )
        .await
        .unwrap();

    client
        .ptl
        .fetch_atomic(
            get_mdh,
            0,
            put_mdh,
            0,
            16,
            ProcessId::phys(1, TEST_PID),
            0,
            42,
            0,
            0,
            0,
            AtomicOp::Prod,
            AtomicDatatype::LongDouble,
        )
        .await
        .unwrap();

    let reply = expect_event(&client, EventKind::Reply).await;
    assert_eq!(reply.ni_fail, NiFail::Ok);
    assert_eq!(reply.mlength, 16);

    // The fetch buffer holds the pre-operation value; the entry the product.
    assert_eq!(long_double_value(&get_buf.snapshot()), 23.0);
    assert_eq!(long_double_value(&server_buf.snapshot()), 69.0);

    let fetch = expect_event(&server, EventKind::FetchAtomic).await;
    assert_eq!(fetch.mlength, 16);
    assert_eq!(fetch.atomic_op, Some(AtomicOp::Prod));
}

#[tokio::test(start_paused = true)]
async fn swap_long_double() {
    let sim = two_nodes();
    let client = endpoint(&sim, 0).await;
    let server = endpoint(&sim, 1).await;

    let server_buf = MemRegion::from_bytes(&long_double_bytes(12.0));
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
            &MeParams::over(server_buf.clone()).with_match(42, 0),
            ListKind::Priority,
            0,
        )
        .await
        .unwrap();
    expect_event(&server, EventKind::Link).await;

    let put_buf = MemRegion::from_bytes(&long_double_bytes(42.0));
    let get_buf = MemRegion::new(16);
    let put_mdh = client
        .ptl
        .md_bind(client.nih, &MdParams::over(put_buf))
        .await
        .unwrap();
    let get_mdh = client
        .ptl
        .md_bind(
            client.nih,
            &MdParams::over(get_buf.clone()).with_eq(client.eqh),
        )
        .await
        .unwrap();

    client
        .ptl
        .swap(
            get_mdh,
            0,
            put_mdh,
            0,
            16,
            ProcessId::phys(1, TEST_PID),
            0,
            42,
            0,
            0,
            0,
            &[],
            AtomicOp::Swap,
            AtomicDatatype::LongDouble,
        )
        .await
        .unwrap();

    expect_event(&client, EventKind::Reply).await;
    assert_eq!(long_double_value(&get_buf.snapshot()), 12.0);
    assert_eq!(long_double_value(&server_buf.snapshot()), 42.0);
    expect_event(&server, EventKind::FetchAtomic).await;
}

#[tokio::test(start_paused = true)]
async fn compare_and_swap_only_fires_on_equality() {
    let sim = two_nodes();
    let client = endpoint(&sim, 0).await;
    let server = endpoint(&sim, 1).await;

    let server_buf = MemRegion::from_bytes(&5i32.to_le_bytes());
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
            &MeParams::over(server_buf.clone()).with_match(42, 0),
            ListKind::Priority,
            0,
        )
        .await
        .unwrap();
    expect_event(&server, EventKind::Link).await;

    let put_mdh = client
        .ptl
        .md_bind(
            client.nih,
            &MdParams::over(MemRegion::from_bytes(&99i32.to_le_bytes())),
        )
        .await
        .unwrap();
    let get_buf = MemRegion::new(4);
    let get_mdh = client
        .ptl
        .md_bind(
            client.nih,
            &MdParams::over(get_buf.clone()).with_eq(client.eqh),
        )
        .await
        .unwrap();

    // Constant mismatches the target: no swap, but the reply still carries
    // the pre-operation value.
    client
        .ptl
        .swap(
            get_mdh,
            0,
            put_mdh,
            0,
            4,
            ProcessId::phys(1, TEST_PID),
            0,
            42,
            0,
            0,
            0,
            &7i32.to_le_bytes(),
            AtomicOp::Cswap,
            AtomicDatatype::Int32,
        )
        .await
        .unwrap();
    expect_event(&client, EventKind::Reply).await;
    assert_eq!(i32::from_le_bytes(server_buf.snapshot().try_into().unwrap()), 5);
    assert_eq!(i32::from_le_bytes(get_buf.snapshot().try_into().unwrap()), 5);
    expect_event(&server, EventKind::FetchAtomic).await;

    // Matching constant swaps.
    client
        .ptl
        .swap(
            get_mdh,
            0,
            put_mdh,
            0,
            4,
            ProcessId::phys(1, TEST_PID),
            0,
            42,
            0,
            0,
            0,
            &5i32.to_le_bytes(),
            AtomicOp::Cswap,
            AtomicDatatype::Int32,
        )
        .await
        .unwrap();
    expect_event(&client, EventKind::Reply).await;
    assert_eq!(
        i32::from_le_bytes(server_buf.snapshot().try_into().unwrap()),
        99
    );
    expect_event(&server, EventKind::FetchAtomic).await;
}

#[tokio::test(start_paused = true)]
async fn swap_family_rejected_on_plain_atomic() {
    let sim = two_nodes();
    let client = endpoint(&sim, 0).await;
    let mdh = client
        .ptl
        .md_bind(client.nih, &MdParams::over(MemRegion::new(8)))
        .await
        .unwrap();
    let err = client
        .ptl
        .atomic(
            mdh,
            0,
            8,
            AckReq::NoAck,
            ProcessId::phys(1, TEST_PID),
            0,
            0,
            0,
            0,
            0,
            AtomicOp::Swap,
            AtomicDatatype::Int64,
        )
        .await
        .unwrap_err();
    assert_eq!(err, nicsim_portals::PtlError::ArgInvalid);
}
