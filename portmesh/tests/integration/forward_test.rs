//! Server-side forward behaviour driven through a raw connection

use super::*;
use bytes::Bytes;
use portmesh::core::users::{ForwardCallback, UserContext};
use portmesh::core::{Connection, ConnectionOptions, ForwardInfo};
use portmesh::protocol::constants::{CANCEL_TCPIP_FORWARD, TCPIP_FORWARD};
use portmesh::protocol::wire::{decode_port_reply, TcpipForward};
use std::sync::Mutex;

async fn dial(server: SocketAddr, principal: &str) -> Connection {
    let (conn, _events) = Connection::dial(server, principal, SECRET, &ConnectionOptions::default())
        .await
        .unwrap();
    conn
}

fn forward(port: u16) -> Bytes {
    TcpipForward::new("127.0.0.1", port).encode()
}

#[tokio::test]
async fn test_dynamic_port_reply_matches_listener() {
    let addr: SocketAddr = format!("127.0.0.1:{}", get_free_port()).parse().unwrap();
    let mut server = start_server(addr, RecordingSink::new()).await;

    let conn = dial(addr, "web.8080").await;
    let reply = conn.request(TCPIP_FORWARD, forward(0)).await.unwrap().unwrap();
    let port = decode_port_reply(&reply).unwrap();
    assert_ne!(port, 0);
    assert!(wait_for_server(([127, 0, 0, 1], port).into(), Duration::from_secs(2)).await);

    let key = format!("127.0.0.1:{port}");
    assert!(server.forwards().unwrap().contains(&key));

    conn.close();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_unknown_forward_is_refused() {
    let addr: SocketAddr = format!("127.0.0.1:{}", get_free_port()).parse().unwrap();
    let mut server = start_server(addr, RecordingSink::new()).await;

    let conn = dial(addr, "web.8080").await;
    let reply = conn
        .request(CANCEL_TCPIP_FORWARD, forward(get_free_port()))
        .await
        .unwrap();
    assert!(reply.is_none());
    assert!(!conn.is_closed());

    conn.close();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_closes_listener() {
    let events = RecordingSink::new();
    let addr: SocketAddr = format!("127.0.0.1:{}", get_free_port()).parse().unwrap();
    let mut server = start_server(addr, events.clone()).await;

    let conn = dial(addr, "web.8080").await;
    let port = get_free_port();
    let reply = conn.request(TCPIP_FORWARD, forward(port)).await.unwrap();
    assert!(reply.is_some());
    let bound: SocketAddr = ([127, 0, 0, 1], port).into();
    assert!(wait_for_server(bound, Duration::from_secs(2)).await);

    let reply = conn.request(CANCEL_TCPIP_FORWARD, forward(port)).await.unwrap();
    assert!(reply.is_some());
    assert!(
        eventually(Duration::from_secs(2), || std::net::TcpStream::connect(bound).is_err()).await
    );
    assert!(
        eventually(Duration::from_secs(2), || {
            events.count(|e| matches!(e, TunnelEvent::ForwardCancelled { .. })) == 1
        })
        .await
    );

    conn.close();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_forward_is_refused() {
    let addr: SocketAddr = format!("127.0.0.1:{}", get_free_port()).parse().unwrap();
    let mut server = start_server(addr, RecordingSink::new()).await;

    let first = dial(addr, "web.8080").await;
    let second = dial(addr, "api.9090").await;
    let port = get_free_port();
    assert!(first.request(TCPIP_FORWARD, forward(port)).await.unwrap().is_some());
    assert!(second.request(TCPIP_FORWARD, forward(port)).await.unwrap().is_none());

    first.close();
    second.close();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connection_end_fires_delete_once() {
    let created: Arc<Mutex<Vec<ForwardInfo>>> = Arc::default();
    let deleted: Arc<Mutex<Vec<ForwardInfo>>> = Arc::default();

    let users = UserRegistry::new();
    let on_create: ForwardCallback = {
        let created = created.clone();
        Arc::new(move |_: &UserContext, info: &ForwardInfo| {
            created.lock().unwrap().push(info.clone());
        })
    };
    let on_delete: ForwardCallback = {
        let deleted = deleted.clone();
        Arc::new(move |_: &UserContext, info: &ForwardInfo| {
            deleted.lock().unwrap().push(info.clone());
        })
    };
    users.register("web.8080", on_create, on_delete, Arc::new(()));

    let addr: SocketAddr = format!("127.0.0.1:{}", get_free_port()).parse().unwrap();
    let mut server = Server::builder()
        .bind(addr)
        .shared_secret(SECRET)
        .users(users)
        .build()
        .unwrap();
    server.start().await.unwrap();

    let conn = dial(addr, "web.8080").await;
    let reply = conn.request(TCPIP_FORWARD, forward(0)).await.unwrap().unwrap();
    let port = decode_port_reply(&reply).unwrap();
    let bound: SocketAddr = ([127, 0, 0, 1], port).into();
    assert!(wait_for_server(bound, Duration::from_secs(2)).await);

    assert!(eventually(Duration::from_secs(2), || created.lock().unwrap().len() == 1).await);
    {
        let created = created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].principal, "web.8080");
        assert_eq!(created[0].local_port, port);
        assert_eq!(created[0].remote_ip, "127.0.0.1");
    }

    conn.close();
    assert!(eventually(Duration::from_secs(2), || deleted.lock().unwrap().len() == 1).await);
    assert!(
        eventually(Duration::from_secs(2), || std::net::TcpStream::connect(bound).is_err()).await
    );

    sleep(Duration::from_millis(100)).await;
    assert_eq!(deleted.lock().unwrap().len(), 1);
    assert!(server.forwards().unwrap().is_empty());

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_immediate_cancel_fires_create_before_delete() {
    let calls: Arc<Mutex<Vec<&'static str>>> = Arc::default();

    let users = UserRegistry::new();
    let on_create: ForwardCallback = {
        let calls = calls.clone();
        Arc::new(move |_: &UserContext, _: &ForwardInfo| {
            // Slow callback: the cancel is handled while it still runs
            std::thread::sleep(Duration::from_millis(200));
            calls.lock().unwrap().push("create");
        })
    };
    let on_delete: ForwardCallback = {
        let calls = calls.clone();
        Arc::new(move |_: &UserContext, _: &ForwardInfo| {
            calls.lock().unwrap().push("delete");
        })
    };
    users.register("web.8080", on_create, on_delete, Arc::new(()));

    let addr: SocketAddr = format!("127.0.0.1:{}", get_free_port()).parse().unwrap();
    let mut server = Server::builder()
        .bind(addr)
        .shared_secret(SECRET)
        .users(users)
        .build()
        .unwrap();
    server.start().await.unwrap();

    let conn = dial(addr, "web.8080").await;
    let reply = conn.request(TCPIP_FORWARD, forward(0)).await.unwrap().unwrap();
    let port = decode_port_reply(&reply).unwrap();
    let cancel = conn.request(CANCEL_TCPIP_FORWARD, forward(port)).await.unwrap();
    assert!(cancel.is_some());

    assert!(eventually(Duration::from_secs(2), || calls.lock().unwrap().len() == 2).await);
    assert_eq!(*calls.lock().unwrap(), ["create", "delete"]);

    conn.close();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unregistered_principal_is_rejected() {
    let addr: SocketAddr = format!("127.0.0.1:{}", get_free_port()).parse().unwrap();
    let mut server = Server::builder()
        .bind(addr)
        .shared_secret(SECRET)
        .build()
        .unwrap();
    server.users().register_principal("web.8080");
    server.start().await.unwrap();

    let err = Connection::dial(addr, "api.9090", SECRET, &ConnectionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::Authentication(_)));

    let err = Connection::dial(addr, "web.8080", "wrong", &ConnectionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::Authentication(_)));

    server.shutdown().await.unwrap();
}
