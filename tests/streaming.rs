//! Paged streaming tests: ordering, windowing, byte and typed flavours.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use wirelink::{
    BincodeSerializer, ChannelConfig, ChannelState, CommResult, InboundStreamCall, RetCode,
    Serializer, ServiceHandler,
    test_helpers::{EchoService, connected_pair},
};

fn paging_config() -> ChannelConfig {
    ChannelConfig::default().with_page_size(200).with_window(2)
}

#[tokio::test]
async fn thousand_bytes_arrive_in_order_through_a_two_page_window() {
    let (client, _server) = connected_pair(paging_config(), paging_config(), Arc::new(EchoService))
        .await;

    // Input-only: the echo service counts the bytes and reports the total.
    let call = client
        .open_byte_stream(Bytes::new(), true, false)
        .await
        .expect("open");
    let writer = call.input().expect("input direction");
    for n in 0..1000u32 {
        writer.write(n as u8).await.expect("write");
    }
    writer.complete().await.expect("complete");

    let (_, _, completion) = call.into_parts();
    let total: u64 = completion
        .wait_typed(&BincodeSerializer)
        .await
        .expect("completion");
    assert_eq!(total, 1000);
    assert_eq!(client.outstanding_calls(), 0);
    client.close().await;
}

#[tokio::test]
async fn duplex_byte_stream_echoes_in_order() {
    let (client, _server) = connected_pair(paging_config(), paging_config(), Arc::new(EchoService))
        .await;

    let call = client
        .open_byte_stream(Bytes::new(), true, true)
        .await
        .expect("open");
    let (input, output, completion) = call.into_parts();
    let input = input.expect("input direction");
    let output = output.expect("output direction");

    // Write concurrently with reading: with a two-page window the writer
    // suspends until the reader's acks restore credit, so a sequential
    // write-then-read would deadlock by design.
    let producer = tokio::spawn(async move {
        let payload: Vec<u8> = (0..1000u32).map(|n| n as u8).collect();
        input.write_chunk(&payload).await?;
        input.complete().await?;
        Ok::<_, wirelink::CommError>(())
    });

    let mut sink = Vec::new();
    let echoed = output.read_all(&mut sink).await.expect("read_all");
    assert_eq!(echoed, 1000);
    let expected: Vec<u8> = (0..1000u32).map(|n| n as u8).collect();
    assert_eq!(sink, expected);

    producer.await.expect("join").expect("producer");
    let total: u64 = completion
        .wait_typed(&BincodeSerializer)
        .await
        .expect("completion");
    assert_eq!(total, 1000);
    client.close().await;
}

struct SummingService;

#[async_trait]
impl ServiceHandler for SummingService {
    async fn handle_request(
        &self,
        request: wirelink::InboundRequest,
    ) -> CommResult<Bytes> {
        Ok(request.body().clone())
    }

    async fn handle_stream(&self, mut call: InboundStreamCall) -> CommResult<Bytes> {
        let reader = call.take_input().expect("input direction");
        let mut enumerator = reader.bulk_enumerator();
        let mut sum: u64 = 0;
        while let Some(lease) = enumerator.next_page().await? {
            let items: Vec<u32> = BincodeSerializer.deserialize(lease.data())?;
            sum += items.iter().copied().map(u64::from).sum::<u64>();
            lease.release().await;
        }
        Ok(Bytes::from(BincodeSerializer.serialize(&sum)?))
    }
}

#[tokio::test]
async fn typed_pages_decode_on_the_service_side() {
    let (client, _server) = connected_pair(
        paging_config(),
        paging_config(),
        Arc::new(SummingService),
    )
    .await;

    let call = client
        .open_stream::<u32, u32>(Bytes::new(), true, false)
        .await
        .expect("open");
    let writer = call.input().expect("input direction");
    for n in 0..500u32 {
        writer.write(n).await.expect("write");
    }
    writer.complete().await.expect("complete");

    let (_, _, completion) = call.into_parts();
    let sum: u64 = completion
        .wait_typed(&BincodeSerializer)
        .await
        .expect("completion");
    assert_eq!(sum, (0..500u64).sum::<u64>());
    client.close().await;
}

#[tokio::test]
async fn small_window_still_moves_many_pages() {
    let config = ChannelConfig::default().with_page_size(10).with_window(1);
    let (client, _server) =
        connected_pair(config.clone(), config, Arc::new(EchoService)).await;

    let call = client
        .open_byte_stream(Bytes::new(), true, false)
        .await
        .expect("open");
    let writer = call.input().expect("input direction");
    writer.write_chunk(&[7u8; 505]).await.expect("write");
    writer.complete().await.expect("complete");

    let (_, _, completion) = call.into_parts();
    let total: u64 = completion
        .wait_typed(&BincodeSerializer)
        .await
        .expect("completion");
    assert_eq!(total, 505);
    client.close().await;
}

#[tokio::test]
async fn writes_after_completion_fail_with_stream_completed() {
    let (client, _server) = connected_pair(
        paging_config(),
        paging_config(),
        Arc::new(EchoService),
    )
    .await;

    let call = client
        .open_byte_stream(Bytes::new(), true, false)
        .await
        .expect("open");
    let writer = call.input().expect("input direction");
    writer.write(1).await.expect("write");
    writer.complete().await.expect("complete");

    let err = writer.write(2).await.expect_err("closed stream");
    assert_eq!(err.code, RetCode::StreamCompleted);
    client.close().await;
}

struct NeverFinishesService;

#[async_trait]
impl ServiceHandler for NeverFinishesService {
    async fn handle_request(
        &self,
        request: wirelink::InboundRequest,
    ) -> CommResult<Bytes> {
        Ok(request.body().clone())
    }

    async fn handle_stream(&self, _call: InboundStreamCall) -> CommResult<Bytes> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn channel_fault_fails_suspended_stream_operations() {
    let (client, _server) = connected_pair(
        ChannelConfig::default().with_page_size(1).with_window(1),
        ChannelConfig::default().with_page_size(1).with_window(1),
        Arc::new(NeverFinishesService),
    )
    .await;
    let client = Arc::new(client);

    let call = client
        .open_byte_stream(Bytes::new(), false, true)
        .await
        .expect("open");
    let (_, output, _completion) = call.into_parts();
    let output = output.expect("output direction");

    let reader = tokio::spawn(async move { output.read_one().await });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    client.close().await;

    let outcome = reader.await.expect("join");
    match outcome {
        Err(error) => assert_eq!(error.code, RetCode::ChannelClosed),
        Ok(item) => panic!("reader must fail on close, got {item:?}"),
    }
    assert_eq!(client.state(), ChannelState::Closed);
}
