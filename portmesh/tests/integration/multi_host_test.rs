//! One spec fanned out to every address of its remote host

use super::*;
use portmesh::core::agent::ConnectionKey;

// 127.0.0.2 is only routable to loopback by default on Linux
#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_every_address_gets_the_same_remote_port() {
    let server_port = get_free_port();
    let first_ip = Ipv4Addr::new(127, 0, 0, 1);
    let second_ip = Ipv4Addr::new(127, 0, 0, 2);
    let first_events = RecordingSink::new();
    let second_events = RecordingSink::new();
    let mut first = start_server((first_ip, server_port).into(), first_events.clone()).await;
    let mut second = start_server((second_ip, server_port).into(), second_events.clone()).await;

    let local_port = get_free_port();
    let _echo = start_echo_server(([127, 0, 0, 1], local_port).into()).await;

    let mut agent = agent_builder(server_port, vec![first_ip, second_ip])
        .spec("localhost:*@db")
        .build()
        .unwrap();
    agent.start().await.unwrap();
    agent.connect_port(local_port, Some(0)).await.unwrap();

    let spec = agent.specs()[0].clone();
    let remote_port = agent.manager().remote_port(&spec, local_port).unwrap();
    let pool = agent.manager().pool();
    assert_eq!(pool.len(), 2);
    for ip in [first_ip, second_ip] {
        let key = ConnectionKey::new(&spec, local_port, ip);
        assert!(pool.is_connected(&key));
        assert_eq!(pool.remote_port(&key), Some(remote_port));

        let mut client = TcpStream::connect((ip, remote_port)).await.unwrap();
        assert_eq!(round_trip(&mut client, b"fan-out").await, b"fan-out");
    }
    for events in [&first_events, &second_events] {
        assert!(
            eventually(Duration::from_secs(2), || {
                events.count(|e| matches!(e, TunnelEvent::ForwardOpened { .. })) == 1
            })
            .await
        );
    }

    agent.disconnect_port(local_port).await;
    assert!(pool.is_empty());
    for events in [&first_events, &second_events] {
        assert!(
            eventually(Duration::from_secs(2), || {
                events.count(|e| matches!(e, TunnelEvent::ForwardCancelled { .. })) == 1
            })
            .await
        );
    }

    agent.shutdown().await.unwrap();
    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_one_failing_address_keeps_the_others() {
    let server_port = get_free_port();
    let mut server = start_server(([127, 0, 0, 1], server_port).into(), RecordingSink::new()).await;

    let local_port = get_free_port();
    let _echo = start_echo_server(([127, 0, 0, 1], local_port).into()).await;

    // No server on this address
    let missing = Ipv4Addr::new(127, 0, 0, 3);
    let events = RecordingSink::new();
    let mut agent = agent_builder(server_port, vec![Ipv4Addr::LOCALHOST, missing])
        .spec("localhost:*@db")
        .events(Arc::new(events.clone()))
        .build()
        .unwrap();
    agent.start().await.unwrap();

    let result = agent.connect_port(local_port, Some(0)).await;
    assert!(matches!(result, Err(TunnelError::Dial { .. })));
    assert!(events.count(|e| matches!(e, TunnelEvent::DialFailed { .. })) >= 1);

    // The reachable address stays up while the task retries the other one
    let spec = agent.specs()[0].clone();
    let key = ConnectionKey::new(&spec, local_port, Ipv4Addr::LOCALHOST);
    assert!(agent.manager().pool().is_connected(&key));
    assert!(agent.manager().is_tracking(local_port));

    agent.shutdown().await.unwrap();
    assert!(agent.manager().pool().is_empty());
    server.shutdown().await.unwrap();
}
