mod common;

use std::time::Duration;

use common::{TestServer, default_chain};
use mtrpc::*;

#[tokio::test]
async fn test_server_stream() {
    let server = TestServer::start(ClientAuthPolicy::RequireAndVerify, default_chain()).await;
    let client = server.client().await;

    for n in [0u32, 1, 7] {
        let mut call = client
            .server_stream::<u32, u32>("Stream/count", &n)
            .await
            .unwrap();
        let mut items = vec![];
        while let Some(i) = call.recv().await.unwrap() {
            items.push(i);
        }
        assert_eq!(items, (0..n).collect::<Vec<_>>());
        assert_eq!(call.state(), CallState::Completed);
        assert!(matches!(call.status(), Some(Ok(()))));
    }
}

#[tokio::test]
async fn test_client_stream() {
    let server = TestServer::start(ClientAuthPolicy::RequireAndVerify, default_chain()).await;
    let client = server.client().await;

    let mut call = client.client_stream::<i64, i64>("Stream/sum").await.unwrap();
    for v in 1..=10 {
        call.send(&v).await.unwrap();
    }
    assert_eq!(call.close_and_recv().await.unwrap(), 55);

    // zero requests is a valid client stream
    let mut call = client.client_stream::<i64, i64>("Stream/sum").await.unwrap();
    assert_eq!(call.close_and_recv().await.unwrap(), 0);
}

#[tokio::test]
async fn test_bidi_stream() {
    let server = TestServer::start(ClientAuthPolicy::RequireAndVerify, default_chain()).await;
    let client = server.client().await;

    let mut call = client.bidi_stream::<i64, i64>("Stream/double").await.unwrap();
    for v in [1, -3, 21] {
        call.send(&v).await.unwrap();
        assert_eq!(call.recv().await.unwrap(), Some(v * 2));
    }
    call.close_send().await.unwrap();
    assert_eq!(call.recv().await.unwrap(), None);
    assert_eq!(call.state(), CallState::Completed);

    let err = call.send(&1).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::CallClosed);
}

#[tokio::test]
async fn test_server_stream_cancel() {
    let server = TestServer::start(ClientAuthPolicy::RequireAndVerify, default_chain()).await;
    let client = server.client().await;

    let mut call = client
        .server_stream::<u32, u32>("Stream/count", &7)
        .await
        .unwrap();
    for expected in 0..3 {
        assert_eq!(call.recv().await.unwrap(), Some(expected));
    }
    call.cancel().await;

    match call.status() {
        Some(Err(e)) => assert_eq!(e.kind, ErrorKind::Cancelled),
        status => panic!("unexpected status {status:?}"),
    }
    let err = call.recv().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::CallClosed);

    drop(call);
    server.wait_idle().await;
    assert_eq!(client.connection().active_calls(), 0);

    let rsp: String = client.unary("Echo/echo", &"after".to_string()).await.unwrap();
    assert_eq!(rsp, "after");
}

#[tokio::test]
async fn test_drop_call_cancels_server() {
    let server = TestServer::start(ClientAuthPolicy::RequireAndVerify, default_chain()).await;
    let client = server.client().await;

    let mut call = client
        .server_stream::<u32, u32>("Stream/count", &50)
        .await
        .unwrap();
    assert_eq!(call.recv().await.unwrap(), Some(0));
    drop(call);

    server.wait_idle().await;
}

#[tokio::test]
async fn test_server_stream_panic() {
    let server = TestServer::start(ClientAuthPolicy::RequireAndVerify, default_chain()).await;
    let client = server.client().await;

    let mut call = client
        .server_stream::<u32, u32>("Stream/panic", &9)
        .await
        .unwrap();
    assert_eq!(call.recv().await.unwrap(), Some(9));
    let err = call.recv().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Internal);
    assert_eq!(call.state(), CallState::Failed);

    let mut call = client
        .server_stream::<u32, u32>("Stream/count", &2)
        .await
        .unwrap();
    assert_eq!(call.recv().await.unwrap(), Some(0));
    assert_eq!(call.recv().await.unwrap(), Some(1));
    assert_eq!(call.recv().await.unwrap(), None);
}

#[tokio::test]
async fn test_stream_shape_mismatch() {
    let server = TestServer::start(ClientAuthPolicy::RequireAndVerify, default_chain()).await;
    let client = server.client().await;

    // a unary call cannot carry two requests
    let mut call = client
        .call::<i64, i64>("Stream/sum", CallShape::Unary)
        .await
        .unwrap();
    call.send(&1).await.unwrap();
    assert_eq!(call.send(&2).await.unwrap_err().kind, ErrorKind::Protocol);
    call.cancel().await;

    // closing a unary call before its request is a protocol error
    let mut call = client
        .call::<String, String>("Echo/echo", CallShape::Unary)
        .await
        .unwrap();
    assert_eq!(call.close_send().await.unwrap_err().kind, ErrorKind::Protocol);
}

#[tokio::test]
async fn test_unread_stream_does_not_stall_connection() {
    let server = TestServer::start(ClientAuthPolicy::RequireAndVerify, default_chain()).await;
    let client = server.client().await;

    let n = 4 * CALL_WINDOW as u32;
    let mut unread = client
        .server_stream::<u32, u32>("Stream/count", &n)
        .await
        .unwrap();
    // long enough for the server to fill the whole window
    tokio::time::sleep(Duration::from_millis(30 * CALL_WINDOW as u64)).await;

    let rsp: String = tokio::time::timeout(
        Duration::from_secs(3),
        client.unary("Echo/echo", &"unrelated".to_string()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(rsp, "unrelated");

    // the paused stream resumes without losing anything
    let mut items = vec![];
    while let Some(i) = unread.recv().await.unwrap() {
        items.push(i);
    }
    assert_eq!(items, (0..n).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_client_stream_beyond_window() {
    let server = TestServer::start(ClientAuthPolicy::RequireAndVerify, default_chain()).await;
    let client = server.client().await;

    let n = 16 * CALL_WINDOW as i64;
    let mut call = client.client_stream::<i64, i64>("Stream/sum").await.unwrap();
    for v in 1..=n {
        call.send(&v).await.unwrap();
    }
    assert_eq!(call.close_and_recv().await.unwrap(), n * (n + 1) / 2);
}
