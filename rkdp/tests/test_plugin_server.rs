use rkdp::PluginError;
use rkdp::api::{AllocateRequest, ContainerAllocateRequest, Empty};
use rkdp::plugins::block::Block;
use rkdp::plugins::fuse::{self, Fuse};
use rkdp::plugins::server::PluginServer;
use rkdp::plugins::{Health, Inventory, Plugin, RunState};

use crate::common::{connect, start_kubelet};

mod common;

fn allocate_request(containers: &[&[&str]]) -> AllocateRequest {
    AllocateRequest {
        container_requests: containers
            .iter()
            .map(|ids| ContainerAllocateRequest {
                devices_ids: ids.iter().map(|id| id.to_string()).collect(),
            })
            .collect(),
    }
}

#[tokio::test]
async fn test_fuse_plugin_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let kubelet = start_kubelet(dir.path(), false).await;
    let socket = dir.path().join("fuse.sock");

    let mut server = PluginServer::new(
        Fuse::new("hdls.me/fuse"),
        fuse::inventory("node1", 3),
        dir.path(),
    );
    server.serve().await.unwrap();
    assert_eq!(server.state(), RunState::Registered);
    assert!(socket.exists());

    let requests = kubelet.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].version, "v1beta1");
    assert_eq!(requests[0].endpoint, "fuse.sock");
    assert_eq!(requests[0].resource_name, "hdls.me/fuse");

    let mut client = connect(&socket).await;
    let mut stream = client.list_and_watch(Empty {}).await.unwrap().into_inner();
    let first = stream.message().await.unwrap().unwrap();
    let ids: Vec<_> = first.devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["fuse-node1-0", "fuse-node1-1", "fuse-node1-2"]);
    assert!(first.devices.iter().all(|d| d.health == "Healthy"));

    let response = client
        .allocate(allocate_request(&[&["fuse-node1-1"]]))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.container_responses.len(), 1);
    let devices = &response.container_responses[0].devices;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].host_path, "/dev/fuse");
    assert_eq!(devices[0].container_path, "/dev/fuse");
    assert_eq!(devices[0].permissions, "rwm");

    let status = client
        .allocate(allocate_request(&[&["fuse-node1-1"], &["fuse-node2-0"]]))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert!(status.message().contains("unknown device: fuse-node2-0"));

    server.stop().await.unwrap();
    assert_eq!(server.state(), RunState::Stopped);
    assert!(!socket.exists());
    assert!(!matches!(stream.message().await, Ok(Some(_))));

    // stopping again is a no-op
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_block_plugin_allocate_and_health() {
    let dir = tempfile::tempdir().unwrap();
    let kubelet = start_kubelet(dir.path(), false).await;
    let socket = dir.path().join("block.sock");

    let inventory = Inventory::new(vec![("sdb", Health::Healthy), ("sdc", Health::Healthy)]);
    let mut server = PluginServer::new(Block::new("hdls.me/sdx"), inventory, dir.path());
    server.serve().await.unwrap();
    assert_eq!(kubelet.requests()[0].endpoint, "block.sock");
    assert_eq!(kubelet.requests()[0].resource_name, "hdls.me/sdx");

    let mut client = connect(&socket).await;
    let response = client
        .allocate(allocate_request(&[&["sdb"], &["sdb", "sdc"]]))
        .await
        .unwrap()
        .into_inner();
    let single = &response.container_responses[0].devices;
    assert_eq!(single.len(), 1);
    assert_eq!(single[0].host_path, "/dev/sdb");
    assert_eq!(single[0].container_path, "/dev/sdb");
    let paths: Vec<_> = response.container_responses[1]
        .devices
        .iter()
        .map(|d| d.host_path.as_str())
        .collect();
    assert_eq!(paths, vec!["/dev/sdb", "/dev/sdc"]);

    let mut stream = client.list_and_watch(Empty {}).await.unwrap().into_inner();
    let first = stream.message().await.unwrap().unwrap();
    assert_eq!(first.devices.len(), 2);

    let health = server
        .health_reporter()
        .expect("block plugins report health");
    assert!(health.report("sdb", Health::Unhealthy));
    let second = stream.message().await.unwrap().unwrap();
    assert_eq!(second.devices[0].health, "Unhealthy");
    assert_eq!(second.devices[1].health, "Healthy");

    // a kubelet reconnecting after the change is not told the disk recovered
    drop(stream);
    let mut stream = client.list_and_watch(Empty {}).await.unwrap().into_inner();
    let first = stream.message().await.unwrap().unwrap();
    assert_eq!(first.devices[0].health, "Unhealthy");
    assert_eq!(first.devices[1].health, "Healthy");

    server.stop().await.unwrap();
    assert!(server.health_reporter().is_none());
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_serve_without_kubelet_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("fuse.sock");
    let inventory = fuse::inventory("n", 1);
    let mut server = PluginServer::new(Fuse::new("hdls.me/fuse"), inventory, dir.path());

    let err = server.serve().await.unwrap_err();
    assert!(matches!(err, PluginError::Dial { .. }));
    assert_eq!(server.state(), RunState::Stopped);
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_rejected_registration_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let kubelet = start_kubelet(dir.path(), true).await;
    let socket = dir.path().join("fuse.sock");
    let inventory = fuse::inventory("n", 1);
    let mut server = PluginServer::new(Fuse::new("hdls.me/fuse"), inventory, dir.path());

    let err = server.serve().await.unwrap_err();
    assert!(matches!(err, PluginError::Register(_)));
    assert_eq!(kubelet.requests().len(), 1);
    assert_eq!(server.state(), RunState::Stopped);
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_start_replaces_stale_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("fuse.sock");
    std::fs::write(&socket, b"stale").unwrap();

    let inventory = fuse::inventory("n", 2);
    let mut server = PluginServer::new(Fuse::new("hdls.me/fuse"), inventory, dir.path());
    server.start().await.unwrap();
    assert_eq!(server.state(), RunState::Started);

    let mut client = connect(&socket).await;
    let options = client
        .get_device_plugin_options(Empty {})
        .await
        .unwrap()
        .into_inner();
    assert!(!options.pre_start_required);

    // the socket vanishing underneath us is not an error
    std::fs::remove_file(&socket).unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
#[should_panic(expected = "can only be started once")]
async fn test_start_twice_panics() {
    let dir = tempfile::tempdir().unwrap();
    let inventory = fuse::inventory("n", 1);
    let mut server = PluginServer::new(Fuse::new("hdls.me/fuse"), inventory, dir.path());
    server.start().await.unwrap();
    let _ = server.start().await;
}

#[tokio::test]
async fn test_register_waits_for_kubelet_listener() {
    let dir = tempfile::tempdir().unwrap();
    let kubelet_socket = dir.path().join("kubelet.sock");
    // bound earlier and left behind, nobody accepts on it yet
    drop(std::os::unix::net::UnixListener::bind(&kubelet_socket).unwrap());

    let path = dir.path().to_path_buf();
    let late_kubelet = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        // swap the live socket in atomically
        let staging = path.join("staging");
        std::fs::create_dir(&staging).unwrap();
        let kubelet = start_kubelet(&staging, false).await;
        std::fs::rename(staging.join("kubelet.sock"), path.join("kubelet.sock")).unwrap();
        kubelet
    });

    let inventory = fuse::inventory("n", 1);
    let mut server = PluginServer::new(Fuse::new("hdls.me/fuse"), inventory, dir.path());
    server.serve().await.unwrap();
    assert_eq!(server.state(), RunState::Registered);

    let kubelet = late_kubelet.await.unwrap();
    assert_eq!(kubelet.requests().len(), 1);
    server.stop().await.unwrap();
}
