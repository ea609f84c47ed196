//! Port events delivered over the control endpoint

use super::*;
use portmesh::core::agent::ControlClient;

#[tokio::test]
async fn test_control_connect_and_disconnect() {
    let server_port = get_free_port();
    let server_events = RecordingSink::new();
    let mut server =
        start_server(([127, 0, 0, 1], server_port).into(), server_events.clone()).await;

    let local_port = get_free_port();
    let _echo = start_echo_server(([127, 0, 0, 1], local_port).into()).await;

    let mut agent = agent_builder(server_port, vec![Ipv4Addr::LOCALHOST])
        .spec("localhost:*@db")
        .control_bind(Some("127.0.0.1:0".parse().unwrap()))
        .build()
        .unwrap();
    agent.start().await.unwrap();
    let control = ControlClient::new(agent.control_addr().unwrap());

    control
        .connect(&local_port.to_string(), Some("0"))
        .await
        .unwrap();
    let spec = agent.specs()[0].clone();
    let remote_port = agent.manager().remote_port(&spec, local_port).unwrap();
    let mut client = TcpStream::connect(("127.0.0.1", remote_port)).await.unwrap();
    assert_eq!(round_trip(&mut client, b"control").await, b"control");

    control.disconnect(&local_port.to_string()).await.unwrap();
    assert!(!agent.manager().is_tracking(local_port));
    assert!(
        eventually(Duration::from_secs(2), || {
            server_events.count(|e| matches!(e, TunnelEvent::ForwardCancelled { .. })) == 1
        })
        .await
    );

    // Unknown ports and repeated disconnects are not errors
    control.disconnect(&local_port.to_string()).await.unwrap();
    control.disconnect("1").await.unwrap();

    agent.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_control_rejects_bad_ports() {
    let mut agent = agent_builder(get_free_port(), vec![Ipv4Addr::LOCALHOST])
        .spec("localhost:*@db")
        .control_bind(Some("127.0.0.1:0".parse().unwrap()))
        .build()
        .unwrap();
    agent.start().await.unwrap();
    let control = ControlClient::new(agent.control_addr().unwrap());

    assert!(control.connect("0", None).await.is_err());
    assert!(control.connect("http", Some("0")).await.is_err());
    assert!(control.disconnect("-1").await.is_err());
    assert_eq!(agent.manager().task_count(), 0);

    agent.shutdown().await.unwrap();
}
