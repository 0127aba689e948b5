/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

use placemat::cluster::{ClusterRuntime, ClusterState};
use placemat::command::testing::RecordingRunner;
use placemat::config::{
    BmcConfig, Cluster, NetworkSpec, NodeSpec, RuntimeConfig,
};
use placemat::host::HostCapabilities;
use pretty_assertions::assert_eq;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

fn runtime(runner: &RecordingRunner, dir: &Path) -> ClusterRuntime {
    let config = RuntimeConfig {
        data_dir: dir.join("data"),
        cache_dir: dir.join("cache"),
        run_dir: dir.join("run"),
        shutdown_grace_secs: 5,
        ..Default::default()
    };
    let bmc = BmcConfig { listen: SocketAddr::from(([127, 0, 0, 1], 0)) };
    ClusterRuntime::new(config, &bmc, Arc::new(runner.clone()))
        .with_capabilities(HostCapabilities::default())
}

fn one_node_cluster() -> Cluster {
    Cluster {
        networks: vec![NetworkSpec {
            name: "net0".into(),
            address: Some("10.0.0.1/24".into()),
            ..Default::default()
        }],
        nodes: vec![NodeSpec {
            name: "boot-0".into(),
            interfaces: vec!["net0".into(), "net0".into()],
            cpu: 2,
            memory: Some("2G".into()),
            uefi: false,
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn count(runner: &RecordingRunner, prefix: &[&str]) -> usize {
    runner.commands_starting_with(prefix).len()
}

fn nat_commands(runner: &RecordingRunner, op: &str) -> usize {
    runner
        .commands()
        .iter()
        .filter(|c| c.program == "iptables" || c.program == "ip6tables")
        .filter(|c| c.args.iter().any(|a| a == op))
        .count()
}

async fn power_status(addr: SocketAddr, serial: &str) -> Option<String> {
    let stream = TcpStream::connect(addr).await.ok()?;
    let (read, mut write) = stream.into_split();
    write
        .write_all(format!("{serial} power-status\n").as_bytes())
        .await
        .ok()?;
    let mut line = String::new();
    let _ = BufReader::new(read).read_line(&mut line).await.ok()?;
    Some(line.trim_end().to_string())
}

#[tokio::test]
async fn single_node_start_cancel_destroy() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("run")).unwrap();
    let runner = RecordingRunner::new();
    runner.serve_monitor_sockets();
    runner.spawn_stdout("10.72.16.5\nlogin: ");
    let mut runtime = runtime(&runner, dir.path());
    runtime.setup().await.unwrap();
    let runtime = Arc::new(runtime);
    let cluster = one_node_cluster();
    let serial = cluster.nodes[0].serial();
    let token = CancellationToken::new();

    let started = {
        let runtime = runtime.clone();
        let cluster = cluster.clone();
        let token = token.clone();
        tokio::spawn(async move { runtime.start(&cluster, token).await })
    };

    let mut status = None;
    for _ in 0..100 {
        if let Some(addr) = runtime.bmc().local_addr().await {
            status = power_status(addr, &serial).await;
            if status.as_deref() == Some("ok on") {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(status.as_deref(), Some("ok on"));
    assert_eq!(runtime.state(), ClusterState::Running);
    assert_eq!(runner.monitor_sockets().len(), 1);

    // the announced BMC address routes to the same VM
    let addr = runtime.bmc().local_addr().await.unwrap();
    let mut by_address = None;
    for _ in 0..100 {
        by_address = power_status(addr, "10.72.16.5").await;
        if by_address.as_deref() == Some("ok on") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(by_address.as_deref(), Some("ok on"));

    token.cancel();
    let result = tokio::time::timeout(Duration::from_secs(10), started)
        .await
        .expect("start returns after cancellation")
        .expect("start does not panic");
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(runtime.state(), ClusterState::Stopped);
    assert_eq!(runner.running(), 0);
    let forgotten = runtime.bmc().vm(&serial).await.is_none();
    assert!(forgotten, "stopped VM is unregistered");

    assert_eq!(nat_commands(&runner, "-N"), 4);
    assert_eq!(nat_commands(&runner, "-A"), 4);
    let bridge = ["ip", "link", "add", "net0", "type", "bridge"];
    assert_eq!(count(&runner, &bridge), 1);
    assert_eq!(count(&runner, &["ip", "tuntap", "add"]), 2);

    let spawned = runner.spawned();
    assert_eq!(spawned.len(), 1);
    let qemu = &spawned[0].args;
    let value_of = |flag: &str| {
        let idx = qemu.iter().position(|a| a == flag)?;
        qemu.get(idx + 1).cloned()
    };
    assert_eq!(value_of("-smp").as_deref(), Some("2"));
    assert_eq!(value_of("-m").as_deref(), Some("2G"));
    assert_eq!(qemu.iter().filter(|a| *a == "-netdev").count(), 2);
    assert_eq!(qemu.iter().filter(|a| *a == "-device").count(), 2);
    // both NICs sit on net0 and still get distinct netdev ids
    assert!(qemu.iter().any(|a| a.starts_with("tap,id=pmtap0,")));
    assert!(qemu.iter().any(|a| a.starts_with("tap,id=pmtap1,")));
    assert!(value_of("-monitor").is_some_and(|m| m.starts_with("unix:")));

    let (taps, veths) = runtime.generated_devices();
    assert_eq!(taps, vec!["pmtap0", "pmtap1"]);
    assert!(veths.is_empty());

    runtime.destroy(&cluster).await;

    assert_eq!(count(&runner, &["ip", "tuntap", "delete"]), 2);
    assert_eq!(count(&runner, &["iptables", "-F"]), 2);
    assert_eq!(count(&runner, &["ip6tables", "-X"]), 2);
    assert_eq!(count(&runner, &["ip", "link", "delete", "net0"]), 1);
    assert_eq!(runtime.state(), ClusterState::Destroyed);
}

#[tokio::test]
async fn destroy_completes_when_deletes_fail() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("run")).unwrap();
    let runner = RecordingRunner::new();
    runner.exit_spawned_with(1);
    runner.fail_when(|c| {
        c.starts_with(&["ip", "tuntap", "delete"])
            || c.starts_with(&["iptables", "-F"])
            || c.starts_with(&["ip6tables", "-t", "filter", "-D"])
    });
    let mut runtime = runtime(&runner, dir.path());
    runtime.setup().await.unwrap();
    let cluster = one_node_cluster();

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        runtime.start(&cluster, CancellationToken::new()),
    )
    .await
    .expect("a failing VM stops the cluster");
    assert!(result.is_err());
    assert_eq!(runtime.state(), ClusterState::Stopped);

    runtime.destroy(&cluster).await;

    assert_eq!(count(&runner, &["ip", "tuntap", "delete"]), 2);
    assert_eq!(count(&runner, &["iptables", "-X"]), 2);
    assert_eq!(count(&runner, &["ip6tables", "-X"]), 2);
    assert_eq!(count(&runner, &["ip", "link", "delete", "net0"]), 1);
    assert_eq!(runtime.state(), ClusterState::Destroyed);
    assert!(runtime.dirs().is_some_and(|d| !d.temp_dir.exists()));
}
