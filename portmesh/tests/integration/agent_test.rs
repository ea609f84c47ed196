//! Agent tunnels end to end: spec in, relayed bytes out

use super::*;
use portmesh::core::agent::{FixedAddresses, TunnelSpec};
use portmesh::core::handoff::HostInfo;

#[tokio::test]
async fn test_fixed_spec_relays_to_local_service() {
    let events = RecordingSink::new();
    let server_port = get_free_port();
    let mut server = start_server(([127, 0, 0, 1], server_port).into(), events.clone()).await;

    let local_port = get_free_port();
    let _echo = start_echo_server(([127, 0, 0, 1], local_port).into()).await;
    let remote_port = get_free_port();

    let mut agent = agent_builder(server_port, vec![Ipv4Addr::LOCALHOST])
        .spec(format!("localhost:{local_port}@db:{remote_port}"))
        .build()
        .unwrap();
    agent.start().await.unwrap();

    let public: SocketAddr = ([127, 0, 0, 1], remote_port).into();
    assert!(wait_for_server(public, Duration::from_secs(5)).await);

    let mut client = TcpStream::connect(public).await.unwrap();
    assert_eq!(round_trip(&mut client, b"hello portmesh").await, b"hello portmesh");

    agent.shutdown().await.unwrap();
    assert!(
        eventually(Duration::from_secs(2), || std::net::TcpStream::connect(public).is_err()).await
    );
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_relays_are_independent() {
    let server_port = get_free_port();
    let mut server = start_server(([127, 0, 0, 1], server_port).into(), RecordingSink::new()).await;

    let local_port = get_free_port();
    let _echo = start_echo_server(([127, 0, 0, 1], local_port).into()).await;
    let remote_port = get_free_port();

    let mut agent = agent_builder(server_port, vec![Ipv4Addr::LOCALHOST])
        .spec(format!("localhost:{local_port}@db:{remote_port}"))
        .build()
        .unwrap();
    agent.start().await.unwrap();
    let public: SocketAddr = ([127, 0, 0, 1], remote_port).into();
    assert!(wait_for_server(public, Duration::from_secs(5)).await);

    let mut first = TcpStream::connect(public).await.unwrap();
    let mut second = TcpStream::connect(public).await.unwrap();
    let (a, b) = tokio::join!(
        round_trip(&mut first, b"first connection"),
        round_trip(&mut second, b"second connection"),
    );
    assert_eq!(a, b"first connection");
    assert_eq!(b, b"second connection");

    // Closing one relay leaves the other usable
    drop(first);
    assert_eq!(round_trip(&mut second, b"still here").await, b"still here");

    agent.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wildcard_spec_uses_dynamic_port_and_keeps_it_on_retry() {
    let server_port = get_free_port();
    let server_addr: SocketAddr = ([127, 0, 0, 1], server_port).into();
    let mut server = start_server(server_addr, RecordingSink::new()).await;

    let local_port = get_free_port();
    let _echo = start_echo_server(([127, 0, 0, 1], local_port).into()).await;

    let events = RecordingSink::new();
    let mut agent = agent_builder(server_port, vec![Ipv4Addr::LOCALHOST])
        .spec("localhost:*@db")
        .events(Arc::new(events.clone()))
        .build()
        .unwrap();
    agent.start().await.unwrap();

    // Wildcard specs wait for a port event
    assert_eq!(agent.manager().task_count(), 0);
    agent.connect_port(local_port, Some(0)).await.unwrap();

    let spec = TunnelSpec::parse("localhost:*@db").unwrap();
    let remote_port = agent.manager().remote_port(&spec, local_port).unwrap();
    assert_ne!(remote_port, 0);
    let public: SocketAddr = ([127, 0, 0, 1], remote_port).into();
    let mut client = TcpStream::connect(public).await.unwrap();
    assert_eq!(round_trip(&mut client, b"ping").await, b"ping");
    drop(client);

    // Restart the server; the retry task asks for the same port again
    server.shutdown().await.unwrap();
    assert!(
        eventually(Duration::from_secs(5), || {
            std::net::TcpStream::connect(public).is_err()
        })
        .await
    );
    let mut server = start_server(server_addr, RecordingSink::new()).await;
    assert!(wait_for_server(public, Duration::from_secs(5)).await);
    assert_eq!(
        agent.manager().remote_port(&spec, local_port),
        Some(remote_port)
    );
    assert!(
        eventually(Duration::from_secs(2), || {
            events.count(|e| matches!(e, TunnelEvent::Connected { .. })) >= 2
        })
        .await
    );

    let mut client = TcpStream::connect(public).await.unwrap();
    assert_eq!(round_trip(&mut client, b"pong").await, b"pong");

    agent.disconnect_port(local_port).await;
    assert!(!agent.manager().is_tracking(local_port));
    assert!(agent.manager().pool().is_empty());
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_port_event_without_rport_uses_spec_port() {
    let server_port = get_free_port();
    let mut server = start_server(([127, 0, 0, 1], server_port).into(), RecordingSink::new()).await;

    let local_port = get_free_port();
    let _echo = start_echo_server(([127, 0, 0, 1], local_port).into()).await;
    let remote_port = get_free_port();

    let mut agent = agent_builder(server_port, vec![Ipv4Addr::LOCALHOST])
        .spec(format!("localhost:*@db:{remote_port}"))
        .build()
        .unwrap();
    agent.start().await.unwrap();
    agent.connect_port(local_port, None).await.unwrap();

    let spec = agent.specs()[0].clone();
    assert_eq!(agent.manager().remote_port(&spec, local_port), Some(remote_port));
    let mut client = TcpStream::connect(("127.0.0.1", remote_port)).await.unwrap();
    assert_eq!(round_trip(&mut client, b"named").await, b"named");

    agent.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_host_record_app_port_connects_on_start() {
    let server_port = get_free_port();
    let mut server = start_server(([127, 0, 0, 1], server_port).into(), RecordingSink::new()).await;

    let local_port = get_free_port();
    let _echo = start_echo_server(([127, 0, 0, 1], local_port).into()).await;
    let remote_port = get_free_port();

    let host = HostInfo {
        pid: std::process::id(),
        app_port: local_port,
        uid: 1000,
        listen_port: server_port,
        remote_ip: "127.0.0.1".into(),
        remote_port: 0,
        config: Default::default(),
    };
    let mut agent = agent_builder(server_port, vec![Ipv4Addr::LOCALHOST])
        .spec(format!("localhost:*@db:{remote_port}"))
        .host(host)
        .build()
        .unwrap();
    agent.start().await.unwrap();

    assert_eq!(agent.host().map(|h| h.uid), Some(1000));
    assert!(agent.manager().is_tracking(local_port));
    let mut client = TcpStream::connect(("127.0.0.1", remote_port)).await.unwrap();
    assert_eq!(round_trip(&mut client, b"handed off").await, b"handed off");

    agent.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_own_address_is_skipped() {
    let server_port = get_free_port();
    let server_events = RecordingSink::new();
    let mut server =
        start_server(([127, 0, 0, 1], server_port).into(), server_events.clone()).await;

    let events = RecordingSink::new();
    let mut agent = agent_builder(server_port, vec![Ipv4Addr::LOCALHOST])
        .spec("localhost:8080@db")
        .local_addresses(Arc::new(FixedAddresses(vec![Ipv4Addr::LOCALHOST])))
        .events(Arc::new(events.clone()))
        .build()
        .unwrap();
    agent.start().await.unwrap();

    assert!(events.count(|e| matches!(e, TunnelEvent::SelfConnectionSkipped { .. })) >= 1);
    assert!(agent.manager().is_tracking(8080));
    assert!(agent.manager().pool().is_empty());
    assert_eq!(
        server_events.count(|e| matches!(e, TunnelEvent::ForwardOpened { .. })),
        0
    );

    agent.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_server_is_retried() {
    let server_port = get_free_port();
    let local_port = get_free_port();
    let _echo = start_echo_server(([127, 0, 0, 1], local_port).into()).await;
    let remote_port = get_free_port();

    let events = RecordingSink::new();
    let mut agent = agent_builder(server_port, vec![Ipv4Addr::LOCALHOST])
        .spec(format!("localhost:{local_port}@db:{remote_port}"))
        .events(Arc::new(events.clone()))
        .build()
        .unwrap();
    agent.start().await.unwrap();
    assert!(events.count(|e| matches!(e, TunnelEvent::DialFailed { .. })) >= 1);
    assert!(agent.manager().is_tracking(local_port));

    let mut server = start_server(([127, 0, 0, 1], server_port).into(), RecordingSink::new()).await;
    let public: SocketAddr = ([127, 0, 0, 1], remote_port).into();
    assert!(wait_for_server(public, Duration::from_secs(5)).await);

    let mut client = TcpStream::connect(public).await.unwrap();
    assert_eq!(round_trip(&mut client, b"late").await, b"late");

    agent.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}
